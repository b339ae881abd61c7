//! One monitored device link: the poll cycle around a [`PollHealth`].
//!
//! A link is driven entirely by [`LinkEvent`]s delivered from one task, so
//! none of the methods below ever run concurrently for the same link. Every
//! failure path ends in a state transition and a published fault; nothing
//! here returns an error to the caller.
use bytes::Bytes;
use chrono::Utc;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use super::{
    bus::{Bus, LinkId},
    event::LinkEvent,
    health::{HealthState, PollHealth, StateChange, Thresholds, TransactionCounter},
    scheduler::{PollTimers, Scheduler, TimerHandle, TimerKind},
};
use crate::{
    api::sink::ChannelSink,
    protocol::{
        codec::{describe_exception, FaultKind, FrameCodec, FrameError, Value},
        reassembly::{Reassembly, ReassemblyBuffer},
    },
};

/// The request currently awaiting a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub transaction_id: u16,
    pub sent_at: Instant,
    pub expected_response_len: Option<usize>,
    pub deadline: TimerHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    WaitingForBus,
    Outstanding(PollRequest),
}

/// Collaborators and settings a link is built from.
pub struct LinkParts {
    pub id: LinkId,
    pub name: String,
    pub codec: Box<dyn FrameCodec>,
    pub bus: Arc<Bus>,
    pub events: flume::Sender<LinkEvent>,
    pub scheduler: Arc<dyn Scheduler>,
    pub sink: Arc<dyn ChannelSink>,
    pub thresholds: Thresholds,
    pub transaction_ids: TransactionCounter,
    pub fragment_max_age: Duration,
}

pub struct DeviceLink {
    id: LinkId,
    name: String,
    codec: Box<dyn FrameCodec>,
    bus: Arc<Bus>,
    scheduler: Arc<dyn Scheduler>,
    sink: Arc<dyn ChannelSink>,
    thresholds: Thresholds,
    transaction_ids: TransactionCounter,
    health: PollHealth,
    timers: PollTimers,
    reassembly: ReassemblyBuffer,
    phase: Phase,
    /// Last request whose deadline expired; a late answer to it still counts.
    expired: Option<PollRequest>,
    poll_deferred: bool,
    running: bool,
    values: Vec<(String, Value)>,
}

impl DeviceLink {
    pub fn new(parts: LinkParts) -> Self {
        if parts.thresholds.is_misordered() {
            log::warn!(
                "{}: stale_after_missed ({}) exceeds offline_after_missed ({}); Offline takes priority",
                parts.name,
                parts.thresholds.stale_after_missed(),
                parts.thresholds.offline_after_missed()
            );
        }
        parts.bus.register(parts.id, parts.events);
        Self {
            id: parts.id,
            name: parts.name,
            codec: parts.codec,
            bus: parts.bus,
            scheduler: parts.scheduler,
            sink: parts.sink,
            thresholds: parts.thresholds,
            transaction_ids: parts.transaction_ids,
            health: PollHealth::new(),
            timers: PollTimers::new(),
            reassembly: ReassemblyBuffer::new(parts.fragment_max_age),
            phase: Phase::Idle,
            expired: None,
            poll_deferred: false,
            running: false,
            values: Vec::new(),
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn health(&self) -> &PollHealth {
        &self.health
    }

    pub fn state(&self) -> HealthState {
        self.health.state
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Values as last published.
    pub fn values(&self) -> &[(String, Value)] {
        &self.values
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn outstanding(&self) -> Option<&PollRequest> {
        match &self.phase {
            Phase::Outstanding(request) => Some(request),
            _ => None,
        }
    }

    /// Dispatch one event. Returns `false` once the link has shut down.
    pub fn handle_event(&mut self, event: LinkEvent) -> bool {
        match event {
            LinkEvent::Timer { kind, handle } => {
                if !self.timers.accept(kind, handle) {
                    log::debug!("{}: ignoring stale {kind} timer", self.name);
                    return true;
                }
                match kind {
                    TimerKind::Poll => self.on_poll_fire(),
                    TimerKind::ResponseDeadline => self.on_response_deadline_expired(),
                }
            }
            LinkEvent::Inbound(chunk) => self.on_inbound(chunk),
            LinkEvent::BusGranted => self.on_bus_granted(),
            LinkEvent::Start => self.start(),
            LinkEvent::Stop => self.stop(),
            LinkEvent::Shutdown => {
                self.stop();
                self.bus.unregister(self.id);
                return false;
            }
        }
        true
    }

    /// Arm the first poll after the initial delay.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        log::info!(
            "{}: polling every {:?} via {} on {}",
            self.name,
            self.thresholds.poll_interval(),
            self.codec.name(),
            self.bus.name()
        );
        self.timers.arm(
            self.scheduler.as_ref(),
            TimerKind::Poll,
            self.thresholds.initial_poll_delay(),
        );
    }

    /// Cancel both timers and abandon any outstanding request. Health is kept.
    pub fn stop(&mut self) {
        if self.running {
            log::info!("{}: stopped in state {}", self.name, self.health.state);
        }
        self.running = false;
        self.timers.cancel_all(self.scheduler.as_ref());
        self.phase = Phase::Idle;
        self.expired = None;
        self.poll_deferred = false;
        self.reassembly.clear();
        self.bus.cancel(self.id);
    }

    pub fn on_poll_fire(&mut self) {
        if !self.running {
            return;
        }
        if let Phase::Outstanding(_) = self.phase {
            log::debug!("{}: previous request unresolved, deferring poll", self.name);
            self.poll_deferred = true;
            return;
        }
        if self.phase == Phase::WaitingForBus {
            // a grant may have been lost, ask again
            log::debug!("{}: still waiting for {}", self.name, self.bus.name());
        }

        let delay = self.health.next_poll_delay(&self.thresholds);
        self.timers
            .arm(self.scheduler.as_ref(), TimerKind::Poll, delay);

        if self.bus.acquire(self.id) {
            self.send_request();
        } else {
            log::debug!("{}: waiting for {}", self.name, self.bus.name());
            self.phase = Phase::WaitingForBus;
        }
    }

    pub fn on_bus_granted(&mut self) {
        match self.phase {
            Phase::WaitingForBus if self.running => self.send_request(),
            // already granted by a later acquire
            Phase::Outstanding(_) => {}
            _ => self.bus.release(self.id),
        }
    }

    fn send_request(&mut self) {
        self.bus.flush_inbound();
        self.reassembly.clear();
        self.expired = None;

        let transaction_id = self.transaction_ids.next_id();
        self.health.transaction_id = Some(transaction_id);

        let frame = match self.codec.build_request(transaction_id) {
            Ok(frame) => frame,
            Err(err) => {
                self.phase = Phase::Idle;
                self.bus.release(self.id);
                self.apply_frame_error(err);
                return;
            }
        };

        let now = Instant::now();
        self.health.last_request_at = Some(now);
        match self.bus.send(self.id, &frame) {
            Ok(_) => {
                let deadline = self.timers.arm(
                    self.scheduler.as_ref(),
                    TimerKind::ResponseDeadline,
                    self.thresholds.response_timeout(),
                );
                self.phase = Phase::Outstanding(PollRequest {
                    transaction_id,
                    sent_at: now,
                    expected_response_len: self.codec.expected_response_len(),
                    deadline,
                });
            }
            Err(err) => {
                log::warn!("{}: send failed: {err}", self.name);
                self.phase = Phase::Idle;
                self.bus.release(self.id);
                self.publish_fault(FaultKind::Transport);
                self.apply_missed();
            }
        }
    }

    /// Feed received bytes through reassembly.
    pub fn on_inbound(&mut self, chunk: Bytes) {
        if self.outstanding().is_none() && self.expired.is_none() {
            log::debug!("{}: dropping {} unsolicited bytes", self.name, chunk.len());
            return;
        }

        let codec = &self.codec;
        let outcome = self
            .reassembly
            .push(&chunk, Instant::now(), |buf| codec.frame_len_hint(buf));
        match outcome {
            Reassembly::Incomplete => {}
            Reassembly::Complete(frame) => self.on_response(&frame),
            Reassembly::Overflow { expected, actual } => {
                log::warn!(
                    "{}: assembled {actual} bytes, expected {expected}; discarded",
                    self.name
                );
                self.resolve();
                self.apply_frame_error(FrameError::LengthMismatch { expected, actual });
                self.run_deferred_poll();
            }
        }
    }

    /// Handle one complete response frame.
    pub fn on_response(&mut self, frame: &[u8]) {
        let Some(request) = self.outstanding().or(self.expired.as_ref()) else {
            log::debug!("{}: response with no request pending, ignored", self.name);
            return;
        };
        if let Some(marker) = self.codec.response_transaction_id(frame) {
            if marker != request.transaction_id {
                log::debug!(
                    "{}: spurious response for transaction {marker}, expecting {}",
                    self.name,
                    request.transaction_id
                );
                return;
            }
        }

        let late = self.outstanding().is_none();
        if late {
            log::debug!("{}: late response after deadline", self.name);
        }
        self.resolve();

        match self.codec.parse_response(frame) {
            Ok(payload) => self.apply_success(payload.values),
            Err(err) => self.apply_frame_error(err),
        }
        self.run_deferred_poll();
    }

    pub fn on_response_deadline_expired(&mut self) {
        let Phase::Outstanding(request) = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };
        self.bus.release(self.id);
        log::warn!(
            "{}: no response to transaction {} within {:?}",
            self.name,
            request.transaction_id,
            self.thresholds.response_timeout()
        );
        self.expired = Some(request);
        self.publish_fault(FaultKind::ResponseTimeout);
        self.apply_missed();
        self.run_deferred_poll();
    }

    /// Close the pending exchange, whether it is outstanding or already expired.
    fn resolve(&mut self) {
        if let Phase::Outstanding(_) = self.phase {
            self.timers
                .cancel(self.scheduler.as_ref(), TimerKind::ResponseDeadline);
            self.phase = Phase::Idle;
            self.bus.release(self.id);
        }
        self.expired = None;
        self.reassembly.clear();
    }

    fn run_deferred_poll(&mut self) {
        if self.poll_deferred && self.running && self.phase == Phase::Idle {
            self.poll_deferred = false;
            self.on_poll_fire();
        }
    }

    fn apply_success(&mut self, values: Vec<(String, Value)>) {
        let was_offline = self.health.state == HealthState::Offline;
        let change = self.health.record_success(Instant::now());
        self.publish_change(change);

        let at = Utc::now();
        for (name, value) in &values {
            if let Err(err) = self.sink.publish_value(&self.name, name, value, at) {
                log::warn!("{}: failed to publish {name}: {err}", self.name);
            }
        }
        self.values = values;

        if was_offline && self.running && !self.poll_deferred {
            // leave backoff immediately
            self.timers.arm(
                self.scheduler.as_ref(),
                TimerKind::Poll,
                self.thresholds.poll_interval(),
            );
        }
    }

    fn apply_frame_error(&mut self, err: FrameError) {
        match &err {
            FrameError::DeviceException { code } => {
                log::warn!("{}: {}", self.name, describe_exception(*code))
            }
            _ => log::warn!("{}: rejected response: {err}", self.name),
        }
        self.publish_fault(err.kind());
        let change = self.health.record_frame_error(Instant::now());
        self.publish_change(change);
    }

    fn apply_missed(&mut self) {
        let change = self.health.record_missed(&self.thresholds);
        self.publish_change(change);

        if change.is_some_and(|c| c.to == HealthState::Offline) {
            let at = Utc::now();
            for (name, value) in self.values.iter_mut() {
                *value = Value::Invalid;
                if let Err(err) = self.sink.publish_value(&self.name, name, value, at) {
                    log::warn!("{}: failed to invalidate {name}: {err}", self.name);
                }
            }
        }
    }

    fn publish_change(&self, change: Option<StateChange>) {
        let Some(StateChange { from, to }) = change else {
            return;
        };
        log::info!(
            "{}: {from} -> {to} (missed {})",
            self.name,
            self.health.consecutive_missed
        );
        if let Err(err) = self.sink.publish_state(&self.name, to, Utc::now()) {
            log::warn!("{}: failed to publish state: {err}", self.name);
        }
    }

    fn publish_fault(&self, fault: FaultKind) {
        if let Err(err) = self.sink.publish_error(&self.name, fault, Utc::now()) {
            log::warn!("{}: failed to publish fault {fault}: {err}", self.name);
        }
    }
}
