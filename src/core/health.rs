//! Poll health tracking for one device link.
//!
//! All transitions are plain functions over [`PollHealth`]; timers, I/O and
//! publication live in [`crate::core::link`].
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::error::ConfigurationError;

/// Displayed status of a device link.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthState {
    /// No response has been decoded yet.
    #[default]
    Unknown,
    /// The last response decoded successfully.
    Active,
    /// Enough deadlines expired that the last values may be out of date.
    Stale,
    /// The device is considered unreachable; values are invalidated.
    Offline,
    /// A response arrived but was rejected (checksum, length, device exception).
    Exception,
}

/// A state change produced by one transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: HealthState,
    pub to: HealthState,
}

/// Timing and threshold settings of one link, immutable once built.
///
/// A threshold of 0 disables the corresponding transition; a backoff
/// multiplier of 0 disables backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thresholds {
    poll_interval: Duration,
    response_timeout: Duration,
    initial_poll_delay: Duration,
    stale_after_missed: u32,
    offline_after_missed: u32,
    offline_backoff_multiplier: u32,
}

impl Thresholds {
    pub fn new(
        poll_interval: Duration,
        response_timeout: Duration,
        initial_poll_delay: Duration,
    ) -> Result<Self, ConfigurationError> {
        if poll_interval.is_zero() {
            return Err(ConfigurationError::ZeroInterval {
                field: "poll_interval",
            });
        }
        if response_timeout.is_zero() {
            return Err(ConfigurationError::ZeroInterval {
                field: "response_timeout",
            });
        }
        if initial_poll_delay >= poll_interval {
            return Err(ConfigurationError::InitialDelayTooLong {
                initial_ms: initial_poll_delay.as_millis() as u64,
                interval_ms: poll_interval.as_millis() as u64,
            });
        }
        Ok(Self {
            poll_interval,
            response_timeout,
            initial_poll_delay,
            stale_after_missed: 3,
            offline_after_missed: 10,
            offline_backoff_multiplier: 0,
        })
    }

    pub fn with_stale_after_missed(mut self, missed: u32) -> Self {
        self.stale_after_missed = missed;
        self
    }

    pub fn with_offline_after_missed(mut self, missed: u32) -> Self {
        self.offline_after_missed = missed;
        self
    }

    pub fn with_offline_backoff_multiplier(mut self, multiplier: u32) -> Self {
        self.offline_backoff_multiplier = multiplier;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn initial_poll_delay(&self) -> Duration {
        self.initial_poll_delay
    }

    pub fn stale_after_missed(&self) -> u32 {
        self.stale_after_missed
    }

    pub fn offline_after_missed(&self) -> u32 {
        self.offline_after_missed
    }

    pub fn offline_backoff_multiplier(&self) -> u32 {
        self.offline_backoff_multiplier
    }

    /// Stale configured above Offline; Offline still wins since it is checked first.
    pub fn is_misordered(&self) -> bool {
        self.stale_after_missed > 0
            && self.offline_after_missed > 0
            && self.stale_after_missed > self.offline_after_missed
    }
}

/// Wrapping transaction id generator over `[first, last]`.
#[derive(Debug, Clone)]
pub struct TransactionCounter {
    first: u16,
    last: u16,
    reserved: Vec<u16>,
    current: Option<u16>,
}

/// Sentinels several device families reject as transaction ids.
pub const RESERVED_TRANSACTION_IDS: [u16; 2] = [0x00, 0xFF];

impl TransactionCounter {
    pub fn new(first: u16, last: u16) -> Result<Self, ConfigurationError> {
        Self::with_reserved(first, last, RESERVED_TRANSACTION_IDS.to_vec())
    }

    pub fn with_reserved(
        first: u16,
        last: u16,
        reserved: Vec<u16>,
    ) -> Result<Self, ConfigurationError> {
        let usable = first <= last && (first..=last).any(|id| !reserved.contains(&id));
        if !usable {
            return Err(ConfigurationError::TransactionRange { first, last });
        }
        Ok(Self {
            first,
            last,
            reserved,
            current: None,
        })
    }

    /// Advance to the next usable id.
    pub fn next_id(&mut self) -> u16 {
        let mut candidate = match self.current {
            Some(id) if id < self.last => id + 1,
            _ => self.first,
        };
        while self.reserved.contains(&candidate) {
            candidate = if candidate < self.last {
                candidate + 1
            } else {
                self.first
            };
        }
        self.current = Some(candidate);
        candidate
    }

    pub fn current(&self) -> Option<u16> {
        self.current
    }
}

impl Default for TransactionCounter {
    fn default() -> Self {
        Self {
            first: 1,
            last: 254,
            reserved: RESERVED_TRANSACTION_IDS.to_vec(),
            current: None,
        }
    }
}

/// Per-link health aggregate.
#[derive(Debug, Clone, Default)]
pub struct PollHealth {
    pub state: HealthState,
    pub consecutive_missed: u32,
    pub last_request_at: Option<Instant>,
    pub last_response_at: Option<Instant>,
    pub transaction_id: Option<u16>,
}

impl PollHealth {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(&mut self, to: HealthState) -> Option<StateChange> {
        let from = self.state;
        self.state = to;
        (from != to).then_some(StateChange { from, to })
    }

    /// A response decoded successfully.
    pub fn record_success(&mut self, now: Instant) -> Option<StateChange> {
        self.consecutive_missed = 0;
        self.last_response_at = Some(now);
        self.transition(HealthState::Active)
    }

    /// A response arrived but was rejected; the missed count is left alone.
    pub fn record_frame_error(&mut self, now: Instant) -> Option<StateChange> {
        self.last_response_at = Some(now);
        self.transition(HealthState::Exception)
    }

    /// A response deadline expired (or the request never left).
    pub fn record_missed(&mut self, thresholds: &Thresholds) -> Option<StateChange> {
        self.consecutive_missed = self.consecutive_missed.saturating_add(1);
        let missed = self.consecutive_missed;

        let offline = thresholds.offline_after_missed;
        if offline > 0 && missed >= offline {
            return self.transition(HealthState::Offline);
        }

        let stale = thresholds.stale_after_missed;
        if stale > 0
            && missed >= stale
            && matches!(self.state, HealthState::Active | HealthState::Stale)
        {
            return self.transition(HealthState::Stale);
        }

        // isolated misses keep the current state
        None
    }

    /// Delay until the poll after the one firing now.
    pub fn next_poll_delay(&self, thresholds: &Thresholds) -> Duration {
        let multiplier = thresholds.offline_backoff_multiplier;
        if self.state == HealthState::Offline && multiplier > 0 {
            thresholds.poll_interval.saturating_mul(multiplier)
        } else {
            thresholds.poll_interval
        }
    }
}
