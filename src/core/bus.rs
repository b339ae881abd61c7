//! Arbitration of one transport shared by several links.
//!
//! Links are identified by [`LinkId`], never by reference. At most one link
//! holds the bus at a time: only the holder may send, and inbound bytes are
//! routed only to the holder, so request/response exchanges of different
//! links are never interleaved. Once released, bytes keep going to the last
//! holder until another link acquires the bus, so late answers still arrive.
use bytes::Bytes;
use parking_lot::Mutex;
use std::{collections::HashMap, collections::VecDeque, sync::Arc};

use super::event::LinkEvent;
use crate::protocol::transport::{Transport, TransportError};
use crate::utils::hex_dump;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("link#{_0}")]
pub struct LinkId(pub u32);

#[derive(Default)]
struct BusState {
    holder: Option<LinkId>,
    last_holder: Option<LinkId>,
    waiters: VecDeque<LinkId>,
    routes: HashMap<LinkId, flume::Sender<LinkEvent>>,
}

pub struct Bus {
    transport: Arc<dyn Transport>,
    state: Mutex<BusState>,
}

impl Bus {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            state: Mutex::new(BusState::default()),
        })
    }

    pub fn name(&self) -> &str {
        self.transport.name()
    }

    /// Register where events for `link` are delivered.
    pub fn register(&self, link: LinkId, events: flume::Sender<LinkEvent>) {
        self.state.lock().routes.insert(link, events);
    }

    pub fn unregister(&self, link: LinkId) {
        self.cancel(link);
        let mut state = self.state.lock();
        state.routes.remove(&link);
        if state.last_holder == Some(link) {
            state.last_holder = None;
        }
    }

    /// Request the bus. Returns `true` when granted immediately; otherwise the
    /// link is queued and later receives [`LinkEvent::BusGranted`].
    pub fn acquire(&self, link: LinkId) -> bool {
        let mut state = self.state.lock();
        match state.holder {
            None => {
                state.holder = Some(link);
                state.last_holder = None;
                true
            }
            Some(holder) if holder == link => true,
            Some(_) => {
                if !state.waiters.contains(&link) {
                    state.waiters.push_back(link);
                }
                false
            }
        }
    }

    /// Give the bus up and hand it to the next waiter, if any.
    pub fn release(&self, link: LinkId) {
        let mut state = self.state.lock();
        if state.holder != Some(link) {
            return;
        }
        state.holder = None;
        state.last_holder = Some(link);
        while let Some(next) = state.waiters.pop_front() {
            let Some(route) = state.routes.get(&next) else {
                continue;
            };
            if route.try_send(LinkEvent::BusGranted).is_ok() {
                state.holder = Some(next);
                state.last_holder = None;
                break;
            }
            log::warn!("{}: could not grant bus to {next}, skipping", self.name());
        }
    }

    /// Drop `link` from the wait queue and release the bus if it holds it.
    pub fn cancel(&self, link: LinkId) {
        self.state.lock().waiters.retain(|waiter| *waiter != link);
        self.release(link);
    }

    pub fn holder(&self) -> Option<LinkId> {
        self.state.lock().holder
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Send on behalf of the holder.
    pub fn send(&self, link: LinkId, frame: &[u8]) -> Result<usize, TransportError> {
        if self.holder() != Some(link) {
            return Err(TransportError::Busy);
        }
        self.transport.send(frame)
    }

    pub fn flush_inbound(&self) {
        self.transport.flush_inbound();
    }

    /// Forward one inbound chunk to the holder, or to the last holder while
    /// the bus is idle. Returns `false` if it was dropped.
    pub fn route(&self, chunk: Bytes) -> bool {
        let state = self.state.lock();
        let target = state
            .holder
            .or(state.last_holder)
            .and_then(|holder| state.routes.get(&holder).map(|route| (holder, route)));
        match target {
            Some((holder, route)) => {
                if route.try_send(LinkEvent::Inbound(chunk)).is_err() {
                    log::warn!("{}: event queue of {holder} is full, dropping bytes", self.name());
                    return false;
                }
                true
            }
            None => {
                log::debug!("{}: discarding unsolicited {}", self.name(), hex_dump(&chunk));
                false
            }
        }
    }

    /// Spawn the task that routes the transport's inbound chunks.
    pub fn spawn_router(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        let inbound = self.transport.inbound();
        tokio::spawn(async move {
            while let Ok(chunk) = inbound.recv_async().await {
                bus.route(chunk);
            }
            log::info!("{}: inbound channel closed, router exiting", bus.name());
        })
    }
}
