use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{drain_inbound, Transport, TransportError};

/// In-process transport: records every sent frame and delivers injected bytes.
///
/// Used by tests and dry runs in place of a real port.
pub struct MemoryTransport {
    name: String,
    sent: Mutex<Vec<Bytes>>,
    failing: AtomicBool,
    inbound_tx: flume::Sender<Bytes>,
    inbound_rx: flume::Receiver<Bytes>,
}

impl MemoryTransport {
    pub fn new(name: impl Into<String>) -> Self {
        let (inbound_tx, inbound_rx) = flume::unbounded();
        Self {
            name: name.into(),
            sent: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            inbound_tx,
            inbound_rx,
        }
    }

    /// Deliver `bytes` as if they had arrived from the medium.
    pub fn inject(&self, bytes: impl Into<Bytes>) {
        let _ = self.inbound_tx.send(bytes.into());
    }

    /// Make subsequent sends fail with an I/O error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn last_sent(&self) -> Option<Bytes> {
        self.sent.lock().last().cloned()
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, frame: &[u8]) -> Result<usize, TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Io {
                reason: "simulated write failure".to_string(),
            });
        }
        self.sent.lock().push(Bytes::copy_from_slice(frame));
        Ok(frame.len())
    }

    fn flush_inbound(&self) {
        drain_inbound(&self.inbound_rx);
    }

    fn inbound(&self) -> flume::Receiver<Bytes> {
        self.inbound_rx.clone()
    }
}
