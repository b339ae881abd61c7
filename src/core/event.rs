use bytes::Bytes;

use super::scheduler::{TimerHandle, TimerKind};

/// Messages delivered to a link task. Everything that touches a link's
/// state arrives through this channel, so callbacks never overlap.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A scheduled timer fired.
    Timer { kind: TimerKind, handle: TimerHandle },
    /// Bytes received from the shared medium while this link held it.
    Inbound(Bytes),
    /// The shared medium was handed to this link.
    BusGranted,
    /// Re-arm polling after a stop.
    Start,
    /// Cancel timers; health is left untouched.
    Stop,
    /// Stop and end the link task.
    Shutdown,
}
