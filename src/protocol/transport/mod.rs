//! Transports move raw frames between a bus and a physical medium.
//!
//! `send` never blocks on the medium: frames are handed to an I/O worker (a
//! dedicated thread for serial ports, tokio tasks for TCP). Received bytes are
//! delivered as chunks on a flume channel; one chunk is not guaranteed to be
//! one frame.

mod memory;
mod serial;
mod tcp;

use bytes::Bytes;

pub use memory::MemoryTransport;
pub use serial::{open_serial_port, SerialSettings, SerialTransport};
pub use tcp::TcpTransport;

/// Capacity of outbound command queues.
pub(crate) const OUTBOUND_CAPACITY: usize = 32;
/// Capacity of inbound chunk queues.
pub(crate) const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum TransportError {
    #[display("transport closed")]
    Closed,
    #[display("outbound queue full")]
    Busy,
    #[display("i/o error: {reason}")]
    Io { reason: String },
}

/// A byte pipe to one physical medium.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Queue one frame for transmission; returns the number of bytes accepted.
    fn send(&self, frame: &[u8]) -> Result<usize, TransportError>;

    /// Discard every received-but-unread byte.
    fn flush_inbound(&self);

    /// Receiving side of the inbound chunk channel.
    fn inbound(&self) -> flume::Receiver<Bytes>;
}

/// Commands consumed by transport I/O workers.
#[derive(Debug, Clone)]
pub(crate) enum TransportCommand {
    Write(Bytes),
    FlushInput,
    Shutdown,
}

/// Enqueue a write on a worker channel, mapping flume errors to `TransportError`.
pub(crate) fn enqueue_write(
    tx: &flume::Sender<TransportCommand>,
    frame: &[u8],
) -> Result<usize, TransportError> {
    match tx.try_send(TransportCommand::Write(Bytes::copy_from_slice(frame))) {
        Ok(()) => Ok(frame.len()),
        Err(flume::TrySendError::Full(_)) => Err(TransportError::Busy),
        Err(flume::TrySendError::Disconnected(_)) => Err(TransportError::Closed),
    }
}

/// Drop queued inbound chunks, returning how many bytes were discarded.
pub(crate) fn drain_inbound(rx: &flume::Receiver<Bytes>) -> usize {
    rx.drain().map(|chunk| chunk.len()).sum()
}
