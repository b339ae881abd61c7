/// Channel sinks - where decoded values, state changes and faults are published
///
/// A link only ever writes to its sink; it never reads back from it. Sink
/// failures are logged by the caller and never change link health.
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::{core::health::HealthState, protocol::codec::FaultKind, protocol::codec::Value};

/// Receiver of everything a link publishes.
pub trait ChannelSink: Send + Sync {
    /// A decoded value, or `Value::Invalid` when the link went offline
    fn publish_value(&self, link: &str, name: &str, value: &Value, at: DateTime<Utc>) -> Result<()>;

    /// A health state change
    fn publish_state(&self, link: &str, state: HealthState, at: DateTime<Utc>) -> Result<()>;

    /// One fault; published every time it happens
    fn publish_error(&self, link: &str, fault: FaultKind, at: DateTime<Utc>) -> Result<()>;
}

/// Everything a sink can receive, as one serializable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChannelEvent {
    Value {
        link: String,
        name: String,
        value: Value,
        timestamp: DateTime<Utc>,
    },
    State {
        link: String,
        state: HealthState,
        timestamp: DateTime<Utc>,
    },
    Error {
        link: String,
        fault: FaultKind,
        timestamp: DateTime<Utc>,
    },
}

impl ChannelEvent {
    pub fn link(&self) -> &str {
        match self {
            ChannelEvent::Value { link, .. }
            | ChannelEvent::State { link, .. }
            | ChannelEvent::Error { link, .. } => link,
        }
    }
}

/// Sink that drops everything (useful for testing)
pub struct NoOpSink;

impl ChannelSink for NoOpSink {
    fn publish_value(&self, _link: &str, _name: &str, _value: &Value, _at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    fn publish_state(&self, _link: &str, _state: HealthState, _at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    fn publish_error(&self, _link: &str, _fault: FaultKind, _at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}

/// Sink that writes every publication to the log
pub struct LoggingSink;

impl ChannelSink for LoggingSink {
    fn publish_value(&self, link: &str, name: &str, value: &Value, _at: DateTime<Utc>) -> Result<()> {
        log::info!("{link}.{name} = {value}");
        Ok(())
    }

    fn publish_state(&self, link: &str, state: HealthState, _at: DateTime<Utc>) -> Result<()> {
        log::info!("{link} state -> {state}");
        Ok(())
    }

    fn publish_error(&self, link: &str, fault: FaultKind, _at: DateTime<Utc>) -> Result<()> {
        log::warn!("{link} fault: {fault}");
        Ok(())
    }
}

/// Sink that forwards every publication as a [`ChannelEvent`] over a flume channel
pub struct FlumeSink {
    sender: flume::Sender<ChannelEvent>,
}

impl FlumeSink {
    /// Create a sink with an unbounded channel
    pub fn new() -> (Self, flume::Receiver<ChannelEvent>) {
        let (sender, receiver) = flume::unbounded();
        (Self { sender }, receiver)
    }

    /// Create a sink with a bounded channel; publications fail while it is full
    pub fn with_capacity(cap: usize) -> (Self, flume::Receiver<ChannelEvent>) {
        let (sender, receiver) = flume::bounded(cap);
        (Self { sender }, receiver)
    }

    fn forward(&self, event: ChannelEvent) -> Result<()> {
        self.sender
            .try_send(event)
            .map_err(|err| anyhow!("Failed to forward channel event: {err}"))
    }
}

impl ChannelSink for FlumeSink {
    fn publish_value(&self, link: &str, name: &str, value: &Value, at: DateTime<Utc>) -> Result<()> {
        self.forward(ChannelEvent::Value {
            link: link.to_string(),
            name: name.to_string(),
            value: value.clone(),
            timestamp: at,
        })
    }

    fn publish_state(&self, link: &str, state: HealthState, at: DateTime<Utc>) -> Result<()> {
        self.forward(ChannelEvent::State {
            link: link.to_string(),
            state,
            timestamp: at,
        })
    }

    fn publish_error(&self, link: &str, fault: FaultKind, at: DateTime<Utc>) -> Result<()> {
        self.forward(ChannelEvent::Error {
            link: link.to_string(),
            fault,
            timestamp: at,
        })
    }
}

/// Sink that writes one JSON object per line to any writer
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn write(&self, event: &ChannelEvent) -> Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, event)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> ChannelSink for JsonLinesSink<W> {
    fn publish_value(&self, link: &str, name: &str, value: &Value, at: DateTime<Utc>) -> Result<()> {
        self.write(&ChannelEvent::Value {
            link: link.to_string(),
            name: name.to_string(),
            value: value.clone(),
            timestamp: at,
        })
    }

    fn publish_state(&self, link: &str, state: HealthState, at: DateTime<Utc>) -> Result<()> {
        self.write(&ChannelEvent::State {
            link: link.to_string(),
            state,
            timestamp: at,
        })
    }

    fn publish_error(&self, link: &str, fault: FaultKind, at: DateTime<Utc>) -> Result<()> {
        self.write(&ChannelEvent::Error {
            link: link.to_string(),
            fault,
            timestamp: at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_flume_sink_forwards_events() {
        let (sink, rx) = FlumeSink::new();
        sink.publish_state("pump", HealthState::Active, at()).unwrap();
        sink.publish_value("pump", "hr_0", &Value::Int(7), at()).unwrap();

        let events: Vec<ChannelEvent> = rx.drain().collect();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.link() == "pump"));
        assert!(matches!(
            &events[1],
            ChannelEvent::Value { name, value: Value::Int(7), .. } if name == "hr_0"
        ));
    }

    #[test]
    fn test_bounded_flume_sink_reports_full() {
        let (sink, _rx) = FlumeSink::with_capacity(1);
        assert!(sink.publish_state("a", HealthState::Stale, at()).is_ok());
        assert!(sink.publish_state("a", HealthState::Offline, at()).is_err());
    }

    #[test]
    fn test_json_lines_output() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.publish_value("meter", "power_w", &Value::Invalid, at()).unwrap();
        sink.publish_error("meter", FaultKind::DeviceException { code: 2 }, at())
            .unwrap();
        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines[0]["event"], "value");
        assert!(lines[0]["value"].is_null());
        assert_eq!(lines[1]["event"], "error");
        assert_eq!(lines[1]["fault"]["kind"], "device_exception");
        assert_eq!(lines[1]["fault"]["code"], 2);
    }
}
