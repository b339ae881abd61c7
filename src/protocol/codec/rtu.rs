use bytes::Bytes;
use rmodbus::{client::ModbusRequest, ModbusProto};

use super::{
    decode_fields, register_fields, DecodedPayload, FieldSpec, FrameCodec, FrameError,
    RegisterMode,
};

/// Address + function + CRC16.
const RTU_OVERHEAD: usize = 4;
/// Address, function | 0x80, exception code, CRC16.
const RTU_EXCEPTION_LEN: usize = 5;

/// Modbus CRC16 as transmitted (little-endian trailer).
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::MODBUS>::calculate(data)
}

/// Append the Modbus CRC16 trailer to `frame`.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Read request for one register range of one RTU slave.
///
/// RTU carries no transaction id: correlation relies on request/response
/// ordering and on the inbound buffer being flushed before each send.
#[derive(Debug, Clone)]
pub struct ModbusRtuCodec {
    unit_id: u8,
    mode: RegisterMode,
    address: u16,
    count: u16,
    fields: Vec<FieldSpec>,
}

impl ModbusRtuCodec {
    pub fn new(unit_id: u8, mode: RegisterMode, address: u16, count: u16) -> Self {
        Self {
            unit_id,
            mode,
            address,
            count,
            fields: register_fields(mode, address, count),
        }
    }

    /// Replace the default per-register fields with explicit declarations.
    pub fn with_fields(mut self, fields: Vec<FieldSpec>) -> Self {
        if !fields.is_empty() {
            self.fields = fields;
        }
        self
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }
}

impl FrameCodec for ModbusRtuCodec {
    fn name(&self) -> &str {
        "modbus-rtu"
    }

    fn build_request(&self, _transaction_id: u16) -> Result<Bytes, FrameError> {
        let mut request = ModbusRequest::new(self.unit_id, ModbusProto::Rtu);
        let mut raw = Vec::new();
        let result = match self.mode {
            RegisterMode::Holding => request.generate_get_holdings(self.address, self.count, &mut raw),
            RegisterMode::Input => request.generate_get_inputs(self.address, self.count, &mut raw),
            RegisterMode::Coils => request.generate_get_coils(self.address, self.count, &mut raw),
            RegisterMode::DiscreteInputs => {
                request.generate_get_discretes(self.address, self.count, &mut raw)
            }
        };
        result.map_err(|e| FrameError::Encode {
            reason: format!("{e:?}"),
        })?;
        Ok(Bytes::from(raw))
    }

    fn parse_response(&self, frame: &[u8]) -> Result<DecodedPayload, FrameError> {
        let len = frame.len();
        if len < RTU_EXCEPTION_LEN {
            return Err(FrameError::TooShort {
                len,
                min: RTU_EXCEPTION_LEN,
            });
        }

        let (body, trailer) = frame.split_at(len - 2);
        let received = u16::from_le_bytes([trailer[0], trailer[1]]);
        let computed = crc16(body);
        if received != computed {
            return Err(FrameError::ChecksumMismatch {
                expected: computed,
                actual: received,
            });
        }

        if body[0] != self.unit_id {
            return Err(FrameError::MalformedField {
                field: "unit".to_string(),
            });
        }

        let function = body[1];
        if function & 0x80 != 0 {
            return Err(FrameError::DeviceException { code: body[2] });
        }
        if function != self.mode.function_code() {
            return Err(FrameError::MalformedField {
                field: "function".to_string(),
            });
        }

        let byte_count = body[2] as usize;
        let data = &body[3..];
        if byte_count != data.len() {
            return Err(FrameError::LengthMismatch {
                expected: byte_count + RTU_OVERHEAD + 1,
                actual: len,
            });
        }
        let expected_data = self.mode.data_len(self.count);
        if byte_count != expected_data {
            return Err(FrameError::LengthMismatch {
                expected: expected_data + RTU_OVERHEAD + 1,
                actual: len,
            });
        }

        Ok(DecodedPayload {
            transaction_id: None,
            data: Bytes::copy_from_slice(data),
            values: decode_fields(&self.fields, data)?,
        })
    }

    fn expected_response_len(&self) -> Option<usize> {
        // address, function, byte count, data, CRC
        Some(self.mode.data_len(self.count) + RTU_OVERHEAD + 1)
    }

    fn frame_len_hint(&self, partial: &[u8]) -> Option<usize> {
        match partial.get(1) {
            Some(function) if function & 0x80 != 0 => Some(RTU_EXCEPTION_LEN),
            _ => self.expected_response_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{FieldKind, Scale, Value};

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        append_crc(&mut frame);
        frame
    }

    #[test]
    fn test_build_holdings_request() {
        let codec = ModbusRtuCodec::new(1, RegisterMode::Holding, 0x0000, 2);
        let request = codec.build_request(7).unwrap();
        assert_eq!(
            request.as_ref(),
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]
        );
    }

    #[test]
    fn test_parse_holdings_response() {
        let codec = ModbusRtuCodec::new(1, RegisterMode::Holding, 0x0010, 2);
        let frame = with_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x01, 0x02]);
        let payload = codec.parse_response(&frame).unwrap();
        assert_eq!(payload.transaction_id, None);
        assert_eq!(
            payload.values,
            vec![
                ("hr_16".to_string(), Value::Int(10)),
                ("hr_17".to_string(), Value::Int(0x0102)),
            ]
        );
        // deterministic for a fixed fixture
        assert_eq!(codec.parse_response(&frame).unwrap(), payload);
    }

    #[test]
    fn test_parse_coils_response() {
        let codec = ModbusRtuCodec::new(0x11, RegisterMode::Coils, 0, 10);
        let frame = with_crc(&[0x11, 0x01, 0x02, 0b0000_0101, 0b0000_0010]);
        let payload = codec.parse_response(&frame).unwrap();
        assert_eq!(payload.values[0], ("co_0".to_string(), Value::Bool(true)));
        assert_eq!(payload.values[1], ("co_1".to_string(), Value::Bool(false)));
        assert_eq!(payload.values[9], ("co_9".to_string(), Value::Bool(true)));
    }

    #[test]
    fn test_custom_fields() {
        let codec = ModbusRtuCodec::new(1, RegisterMode::Input, 0, 2).with_fields(vec![
            FieldSpec::new("power_w", 0, FieldKind::U32).with_scale(Scale::kilo_to_unit()),
        ]);
        let frame = with_crc(&[0x01, 0x04, 0x04, 0x00, 0x00, 0x00, 0x03]);
        let payload = codec.parse_response(&frame).unwrap();
        assert_eq!(payload.values, vec![("power_w".to_string(), Value::Float(3000.0))]);
    }

    #[test]
    fn test_checksum_mismatch() {
        let codec = ModbusRtuCodec::new(1, RegisterMode::Holding, 0, 1);
        let mut frame = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x01]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            codec.parse_response(&frame),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_too_short() {
        let codec = ModbusRtuCodec::new(1, RegisterMode::Holding, 0, 1);
        assert_eq!(
            codec.parse_response(&[0x01, 0x03]),
            Err(FrameError::TooShort { len: 2, min: 5 })
        );
    }

    #[test]
    fn test_device_exception() {
        let codec = ModbusRtuCodec::new(1, RegisterMode::Holding, 0, 1);
        let frame = with_crc(&[0x01, 0x83, 0x02]);
        assert_eq!(
            codec.parse_response(&frame),
            Err(FrameError::DeviceException { code: 0x02 })
        );
        assert_eq!(codec.frame_len_hint(&frame[..2]), Some(5));
    }

    #[test]
    fn test_byte_count_mismatch() {
        let codec = ModbusRtuCodec::new(1, RegisterMode::Holding, 0, 2);
        // byte count says 4 but only 2 data bytes present
        let frame = with_crc(&[0x01, 0x03, 0x04, 0x00, 0x01]);
        assert!(matches!(
            codec.parse_response(&frame),
            Err(FrameError::LengthMismatch { .. })
        ));

        // consistent frame, but fewer registers than requested
        let frame = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x01]);
        assert_eq!(
            codec.parse_response(&frame),
            Err(FrameError::LengthMismatch {
                expected: 9,
                actual: 7
            })
        );
    }

    #[test]
    fn test_wrong_unit_and_function() {
        let codec = ModbusRtuCodec::new(1, RegisterMode::Holding, 0, 1);
        let other_unit = with_crc(&[0x02, 0x03, 0x02, 0x00, 0x01]);
        assert!(matches!(
            codec.parse_response(&other_unit),
            Err(FrameError::MalformedField { field }) if field == "unit"
        ));
        let other_function = with_crc(&[0x01, 0x04, 0x02, 0x00, 0x01]);
        assert!(matches!(
            codec.parse_response(&other_function),
            Err(FrameError::MalformedField { field }) if field == "function"
        ));
    }

    #[test]
    fn test_expected_len() {
        let codec = ModbusRtuCodec::new(1, RegisterMode::Holding, 0, 3);
        assert_eq!(codec.expected_response_len(), Some(11));
        let coils = ModbusRtuCodec::new(1, RegisterMode::Coils, 0, 9);
        assert_eq!(coils.expected_response_len(), Some(7));
    }
}
