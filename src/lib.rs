//! diapoll - poll/response health engine for field devices
//!
//! Each configured device link polls one device through a shared transport
//! (serial port or TCP), validates responses with a frame codec, tracks
//! link health (Unknown, Active, Stale, Offline, Exception) and publishes
//! decoded values, state changes and faults to a channel sink.
//!
//! The `api` module holds what embedders use directly (builder, sinks);
//! `core` holds the state machine and runtime, `protocol` the codecs and
//! transports.

pub mod api;
#[doc(hidden)]
pub mod cli;
pub mod core;
pub mod protocol;
#[doc(hidden)]
pub mod utils;

pub use api::*;
