/// Frame codecs - pure translation between poll requests and wire bytes
///
/// A codec builds exactly one request buffer per poll and validates one
/// response buffer. Structural validation (length, integrity code, embedded
/// length, device exception) always happens before any field is decoded, and
/// every failure is reported as a classified `FrameError` so the health state
/// machine can decide policy without inspecting error strings.
mod field;
mod rtu;
mod tcp;

use bytes::Bytes;
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};

pub use field::{decode_fields, ByteOrder, FieldKind, FieldSpec, Scale, Value};
pub use rtu::{append_crc, crc16, ModbusRtuCodec};
pub use tcp::ModbusTcpCodec;

/// Structural or decode failure of a single response frame.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum FrameError {
    #[display("frame too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
    #[display("checksum mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },
    #[display("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[display("device exception 0x{code:02X}")]
    DeviceException { code: u8 },
    #[display("malformed field `{field}`")]
    MalformedField { field: String },
    #[display("cannot encode request: {reason}")]
    Encode { reason: String },
}

impl FrameError {
    /// Tag published to channel sinks; carries no payload beyond the exception code.
    pub fn kind(&self) -> FaultKind {
        match self {
            FrameError::TooShort { .. } => FaultKind::TooShort,
            FrameError::ChecksumMismatch { .. } => FaultKind::ChecksumMismatch,
            FrameError::LengthMismatch { .. } => FaultKind::LengthMismatch,
            FrameError::DeviceException { code } => FaultKind::DeviceException { code: *code },
            FrameError::MalformedField { .. } => FaultKind::MalformedField,
            FrameError::Encode { .. } => FaultKind::Encode,
        }
    }
}

/// Externally visible error indicator of a device link.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultKind {
    #[display("too_short")]
    TooShort,
    #[display("checksum_mismatch")]
    ChecksumMismatch,
    #[display("length_mismatch")]
    LengthMismatch,
    #[display("device_exception(0x{code:02X})")]
    DeviceException { code: u8 },
    #[display("malformed_field")]
    MalformedField,
    #[display("encode")]
    Encode,
    #[display("transport")]
    Transport,
    #[display("response_timeout")]
    ResponseTimeout,
}

/// Standard Modbus exception codes, used for log readability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, strum::Display)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailedToRespond = 0x0B,
}

/// Describe an exception code for logs (`0x02 (IllegalDataAddress)`).
pub fn describe_exception(code: u8) -> String {
    match ExceptionCode::try_from(code) {
        Ok(known) => format!("0x{code:02X} ({known})"),
        Err(_) => format!("0x{code:02X}"),
    }
}

/// Successfully decoded response.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    /// Correlation marker echoed by the device, if the protocol carries one.
    pub transaction_id: Option<u16>,
    /// Raw data section (after headers, before integrity code).
    pub data: Bytes,
    /// Named values in declaration order.
    pub values: Vec<(String, Value)>,
}

/// Register table read by a poll request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum RegisterMode {
    Coils,
    DiscreteInputs,
    Holding,
    Input,
}

impl RegisterMode {
    pub fn function_code(self) -> u8 {
        match self {
            RegisterMode::Coils => 0x01,
            RegisterMode::DiscreteInputs => 0x02,
            RegisterMode::Holding => 0x03,
            RegisterMode::Input => 0x04,
        }
    }

    /// Size of the data section a well-formed response carries for `count` items.
    pub fn data_len(self, count: u16) -> usize {
        match self {
            RegisterMode::Holding | RegisterMode::Input => count as usize * 2,
            RegisterMode::Coils | RegisterMode::DiscreteInputs => (count as usize).div_ceil(8),
        }
    }

    fn field_prefix(self) -> &'static str {
        match self {
            RegisterMode::Coils => "co",
            RegisterMode::DiscreteInputs => "di",
            RegisterMode::Holding => "hr",
            RegisterMode::Input => "ir",
        }
    }
}

/// One field per polled item (`hr_16`, `co_3`, ...) for links that declare no fields.
pub fn register_fields(mode: RegisterMode, address: u16, count: u16) -> Vec<FieldSpec> {
    (0..count)
        .map(|i| {
            let name = format!("{}_{}", mode.field_prefix(), address.wrapping_add(i));
            match mode {
                RegisterMode::Holding | RegisterMode::Input => {
                    FieldSpec::new(name, i as usize * 2, FieldKind::U16)
                }
                RegisterMode::Coils | RegisterMode::DiscreteInputs => {
                    FieldSpec::new(name, i as usize / 8, FieldKind::Bit((i % 8) as u8))
                }
            }
        })
        .collect()
}

/// One wire protocol's request/response translation.
pub trait FrameCodec: Send + Sync {
    /// Short protocol label for logs.
    fn name(&self) -> &str;

    /// Build the request for one poll attempt.
    fn build_request(&self, transaction_id: u16) -> Result<Bytes, FrameError>;

    /// Validate and decode one complete response frame.
    fn parse_response(&self, frame: &[u8]) -> Result<DecodedPayload, FrameError>;

    /// Total length of a well-formed success response, when fixed.
    fn expected_response_len(&self) -> Option<usize>;

    /// Total length of the frame `partial` starts, once enough header bytes arrived.
    fn frame_len_hint(&self, _partial: &[u8]) -> Option<usize> {
        self.expected_response_len()
    }

    /// Correlation marker carried by a response; `None` when the protocol has none.
    fn response_transaction_id(&self, _frame: &[u8]) -> Option<u16> {
        None
    }
}
