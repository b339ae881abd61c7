//! Reassembly of response frames delivered in fragments
//!
//! Transports make no promise that one read equals one frame (radio links and
//! USB serial adapters routinely split them). Fragments are concatenated until
//! the expected frame length is reached. Partial frames older than `max_age`
//! are dropped before new bytes are appended, and a buffer that grows past the
//! expected length is discarded instead of being truncated.
use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};

/// Outcome of feeding one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// More bytes are needed.
    Incomplete,
    /// A complete frame; the buffer is empty again.
    Complete(Bytes),
    /// The assembled bytes exceed the expected frame length and were discarded.
    Overflow { expected: usize, actual: usize },
}

#[derive(Debug)]
pub struct ReassemblyBuffer {
    buf: BytesMut,
    started_at: Option<Instant>,
    max_age: Duration,
}

impl ReassemblyBuffer {
    pub fn new(max_age: Duration) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            started_at: None,
            max_age,
        }
    }

    /// Append `chunk` and check it against the length `expected` reports for
    /// the buffered bytes. When `expected` returns `None` every delivery is
    /// treated as one complete frame.
    pub fn push<F>(&mut self, chunk: &[u8], now: Instant, expected: F) -> Reassembly
    where
        F: Fn(&[u8]) -> Option<usize>,
    {
        if let Some(started) = self.started_at {
            if now.saturating_duration_since(started) > self.max_age {
                log::debug!(
                    "Discarding {} stale fragment bytes (older than {:?})",
                    self.buf.len(),
                    self.max_age
                );
                self.clear();
            }
        }

        if self.buf.is_empty() {
            self.started_at = Some(now);
        }
        self.buf.extend_from_slice(chunk);

        match expected(&self.buf) {
            None => self.take(),
            Some(len) if self.buf.len() == len => self.take(),
            Some(len) if self.buf.len() > len => {
                let actual = self.buf.len();
                self.clear();
                Reassembly::Overflow {
                    expected: len,
                    actual,
                }
            }
            Some(_) => Reassembly::Incomplete,
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.started_at = None;
    }

    fn take(&mut self) -> Reassembly {
        self.started_at = None;
        Reassembly::Complete(self.buf.split().freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGE: Duration = Duration::from_millis(100);

    fn fixed(len: usize) -> impl Fn(&[u8]) -> Option<usize> {
        move |_| Some(len)
    }

    #[test]
    fn test_two_fragments_complete_one_frame() {
        let mut buffer = ReassemblyBuffer::new(AGE);
        let t0 = Instant::now();
        assert_eq!(buffer.push(&[1, 2, 3, 4], t0, fixed(9)), Reassembly::Incomplete);
        assert_eq!(buffer.pending(), 4);
        let done = buffer.push(&[5, 6, 7, 8, 9], t0 + Duration::from_millis(20), fixed(9));
        assert_eq!(
            done,
            Reassembly::Complete(Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8, 9]))
        );
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_overflow_discards_buffer() {
        let mut buffer = ReassemblyBuffer::new(AGE);
        let t0 = Instant::now();
        buffer.push(&[1, 2, 3, 4], t0, fixed(9));
        let outcome = buffer.push(&[0; 7], t0, fixed(9));
        assert_eq!(
            outcome,
            Reassembly::Overflow {
                expected: 9,
                actual: 11
            }
        );
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_stale_fragments_are_evicted() {
        let mut buffer = ReassemblyBuffer::new(AGE);
        let t0 = Instant::now();
        buffer.push(&[0xAA, 0xBB], t0, fixed(4));
        let later = t0 + Duration::from_millis(150);
        assert_eq!(buffer.push(&[1, 2], later, fixed(4)), Reassembly::Incomplete);
        assert_eq!(
            buffer.push(&[3, 4], later, fixed(4)),
            Reassembly::Complete(Bytes::from_static(&[1, 2, 3, 4]))
        );
    }

    #[test]
    fn test_unknown_length_passes_through() {
        let mut buffer = ReassemblyBuffer::new(AGE);
        assert_eq!(
            buffer.push(&[7, 8], Instant::now(), |_| None),
            Reassembly::Complete(Bytes::from_static(&[7, 8]))
        );
    }

    #[test]
    fn test_length_from_header() {
        // first byte announces the total frame length
        let header = |buf: &[u8]| buf.first().map(|len| *len as usize);
        let mut buffer = ReassemblyBuffer::new(AGE);
        let t0 = Instant::now();
        assert_eq!(buffer.push(&[3], t0, header), Reassembly::Incomplete);
        assert_eq!(
            buffer.push(&[9, 9], t0, header),
            Reassembly::Complete(Bytes::from_static(&[3, 9, 9]))
        );
    }
}
