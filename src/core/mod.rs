/// Poll engine core
///
/// - `health`: the poll health state machine
/// - `scheduler`: timers and the one-timer-per-kind rule
/// - `link`: one device link's poll cycle
/// - `bus`: arbitration of a transport shared by several links
/// - `runtime`: one task per link, driven by `LinkEvent`s
pub mod bus;
pub mod error;
pub mod event;
pub mod health;
pub mod link;
pub mod runtime;
pub mod scheduler;

pub use bus::{Bus, LinkId};
pub use error::ConfigurationError;
pub use event::LinkEvent;
pub use health::{HealthState, PollHealth, StateChange, Thresholds, TransactionCounter};
pub use link::{DeviceLink, LinkParts, PollRequest};
pub use runtime::{Engine, LinkHandle};
pub use scheduler::{ManualScheduler, PollTimers, Scheduler, TimerHandle, TimerKind, TokioScheduler};
