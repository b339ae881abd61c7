pub mod builder;
pub mod sink;

pub use builder::LinkBuilder;
pub use sink::{ChannelEvent, ChannelSink, FlumeSink, JsonLinesSink, LoggingSink, NoOpSink};

// Re-export the pieces most embedders need next to the builder
pub use crate::core::{Engine, HealthState, LinkHandle};
pub use crate::protocol::codec::{FaultKind, FieldKind, FieldSpec, ModbusRtuCodec, ModbusTcpCodec, RegisterMode, Scale, Value};
