use anyhow::{anyhow, Result};
use std::{sync::Arc, time::Duration};

use crate::{
    api::sink::ChannelSink,
    cli::config::LinkConfig,
    core::{
        bus::{Bus, LinkId},
        event::LinkEvent,
        health::{Thresholds, TransactionCounter},
        link::{DeviceLink, LinkParts},
        scheduler::Scheduler,
    },
    protocol::codec::FrameCodec,
};

/// Builder for device links.
///
/// Settings start at the same defaults as the configuration file; `build`
/// validates them once and wires the link to its bus, scheduler and sink.
///
/// ```no_run
/// use std::sync::Arc;
/// use diapoll::api::{builder::LinkBuilder, sink::LoggingSink};
/// use diapoll::core::{bus::{Bus, LinkId}, scheduler::TokioScheduler};
/// use diapoll::protocol::{codec::{ModbusRtuCodec, RegisterMode}, transport::MemoryTransport};
///
/// # fn demo() -> anyhow::Result<()> {
/// let bus = Bus::new(Arc::new(MemoryTransport::new("rs485")));
/// let (events, _rx) = flume::bounded(64);
/// let mut link = LinkBuilder::new("boiler")
///     .with_codec(ModbusRtuCodec::new(7, RegisterMode::Holding, 0x10, 4))
///     .with_poll_interval(5000)
///     .with_offline_backoff(6)
///     .build(
///         LinkId(0),
///         bus,
///         events.clone(),
///         Arc::new(TokioScheduler::new(events)),
///         Arc::new(LoggingSink),
///     )?;
/// link.start();
/// # Ok(())
/// # }
/// ```
pub struct LinkBuilder {
    name: String,
    codec: Option<Box<dyn FrameCodec>>,
    poll_interval_ms: u64,
    response_timeout_ms: u64,
    initial_poll_delay_ms: u64,
    stale_after_missed: u32,
    offline_after_missed: u32,
    offline_backoff_multiplier: u32,
    transaction_ids: (u16, u16),
    fragment_max_age_ms: u64,
}

impl LinkBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            codec: None,
            poll_interval_ms: 1000,
            response_timeout_ms: 1000,
            initial_poll_delay_ms: 100,
            stale_after_missed: 3,
            offline_after_missed: 10,
            offline_backoff_multiplier: 0,
            transaction_ids: (1, 254),
            fragment_max_age_ms: 100,
        }
    }

    /// Start from a link section of the configuration file.
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            name: config.name.clone(),
            codec: Some(config.codec.build()),
            poll_interval_ms: config.poll_interval_ms,
            response_timeout_ms: config.response_timeout_ms,
            initial_poll_delay_ms: config.initial_poll_delay_ms,
            stale_after_missed: config.stale_after_missed,
            offline_after_missed: config.offline_after_missed,
            offline_backoff_multiplier: config.offline_backoff_multiplier,
            transaction_ids: (config.transaction_id_first, config.transaction_id_last),
            fragment_max_age_ms: config.fragment_max_age_ms,
        }
    }

    pub fn with_codec(self, codec: impl FrameCodec + 'static) -> Self {
        self.with_boxed_codec(Box::new(codec))
    }

    pub fn with_boxed_codec(mut self, codec: Box<dyn FrameCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Set the steady-state poll interval in milliseconds.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the response deadline in milliseconds.
    pub fn with_response_timeout(mut self, ms: u64) -> Self {
        self.response_timeout_ms = ms;
        self
    }

    /// Set the delay of the first poll after start, in milliseconds.
    pub fn with_initial_poll_delay(mut self, ms: u64) -> Self {
        self.initial_poll_delay_ms = ms;
        self
    }

    pub fn with_stale_after_missed(mut self, missed: u32) -> Self {
        self.stale_after_missed = missed;
        self
    }

    pub fn with_offline_after_missed(mut self, missed: u32) -> Self {
        self.offline_after_missed = missed;
        self
    }

    /// Multiply the poll interval by `multiplier` while Offline (0 disables).
    pub fn with_offline_backoff(mut self, multiplier: u32) -> Self {
        self.offline_backoff_multiplier = multiplier;
        self
    }

    pub fn with_transaction_ids(mut self, first: u16, last: u16) -> Self {
        self.transaction_ids = (first, last);
        self
    }

    pub fn with_fragment_max_age(mut self, ms: u64) -> Self {
        self.fragment_max_age_ms = ms;
        self
    }

    pub fn thresholds(&self) -> Result<Thresholds> {
        Ok(Thresholds::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_millis(self.response_timeout_ms),
            Duration::from_millis(self.initial_poll_delay_ms),
        )?
        .with_stale_after_missed(self.stale_after_missed)
        .with_offline_after_missed(self.offline_after_missed)
        .with_offline_backoff_multiplier(self.offline_backoff_multiplier))
    }

    pub fn build(
        self,
        id: LinkId,
        bus: Arc<Bus>,
        events: flume::Sender<LinkEvent>,
        scheduler: Arc<dyn Scheduler>,
        sink: Arc<dyn ChannelSink>,
    ) -> Result<DeviceLink> {
        let thresholds = self.thresholds()?;
        let (first, last) = self.transaction_ids;
        let transaction_ids = TransactionCounter::new(first, last)?;
        let codec = self
            .codec
            .ok_or_else(|| anyhow!("Link '{}' has no codec", self.name))?;

        Ok(DeviceLink::new(LinkParts {
            id,
            name: self.name,
            codec,
            bus,
            events,
            scheduler,
            sink,
            thresholds,
            transaction_ids,
            fragment_max_age: Duration::from_millis(self.fragment_max_age_ms),
        }))
    }
}
