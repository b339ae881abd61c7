use bytes::{BufMut, Bytes, BytesMut};

use super::{
    decode_fields, register_fields, DecodedPayload, FieldSpec, FrameCodec, FrameError,
    RegisterMode,
};

/// Transaction id, protocol id, length, unit id.
const MBAP_LEN: usize = 7;
/// MBAP header + function + exception code.
const TCP_MIN_LEN: usize = MBAP_LEN + 2;

/// Read request for one register range over Modbus TCP (MBAP framing).
///
/// The MBAP transaction id is the correlation marker: responses echoing any
/// other id are treated as spurious by the link.
#[derive(Debug, Clone)]
pub struct ModbusTcpCodec {
    unit_id: u8,
    mode: RegisterMode,
    address: u16,
    count: u16,
    fields: Vec<FieldSpec>,
}

impl ModbusTcpCodec {
    pub fn new(unit_id: u8, mode: RegisterMode, address: u16, count: u16) -> Self {
        Self {
            unit_id,
            mode,
            address,
            count,
            fields: register_fields(mode, address, count),
        }
    }

    pub fn with_fields(mut self, fields: Vec<FieldSpec>) -> Self {
        if !fields.is_empty() {
            self.fields = fields;
        }
        self
    }
}

impl FrameCodec for ModbusTcpCodec {
    fn name(&self) -> &str {
        "modbus-tcp"
    }

    fn build_request(&self, transaction_id: u16) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(MBAP_LEN + 5);
        buf.put_u16(transaction_id);
        buf.put_u16(0);
        // unit id + function + address + count
        buf.put_u16(6);
        buf.put_u8(self.unit_id);
        buf.put_u8(self.mode.function_code());
        buf.put_u16(self.address);
        buf.put_u16(self.count);
        Ok(buf.freeze())
    }

    fn parse_response(&self, frame: &[u8]) -> Result<DecodedPayload, FrameError> {
        let len = frame.len();
        if len < TCP_MIN_LEN {
            return Err(FrameError::TooShort {
                len,
                min: TCP_MIN_LEN,
            });
        }

        let transaction_id = u16::from_be_bytes([frame[0], frame[1]]);
        if u16::from_be_bytes([frame[2], frame[3]]) != 0 {
            return Err(FrameError::MalformedField {
                field: "protocol".to_string(),
            });
        }
        let declared = u16::from_be_bytes([frame[4], frame[5]]) as usize;
        if declared + 6 != len {
            return Err(FrameError::LengthMismatch {
                expected: declared + 6,
                actual: len,
            });
        }
        if frame[6] != self.unit_id {
            return Err(FrameError::MalformedField {
                field: "unit".to_string(),
            });
        }

        let function = frame[7];
        if function & 0x80 != 0 {
            return Err(FrameError::DeviceException { code: frame[8] });
        }
        if function != self.mode.function_code() {
            return Err(FrameError::MalformedField {
                field: "function".to_string(),
            });
        }

        let byte_count = frame[8] as usize;
        let data = &frame[TCP_MIN_LEN..];
        let expected_data = self.mode.data_len(self.count);
        if byte_count != data.len() || byte_count != expected_data {
            return Err(FrameError::LengthMismatch {
                expected: expected_data + TCP_MIN_LEN,
                actual: len,
            });
        }

        Ok(DecodedPayload {
            transaction_id: Some(transaction_id),
            data: Bytes::copy_from_slice(data),
            values: decode_fields(&self.fields, data)?,
        })
    }

    fn expected_response_len(&self) -> Option<usize> {
        Some(self.mode.data_len(self.count) + TCP_MIN_LEN)
    }

    fn frame_len_hint(&self, partial: &[u8]) -> Option<usize> {
        if partial.len() >= 6 {
            Some(u16::from_be_bytes([partial[4], partial[5]]) as usize + 6)
        } else {
            self.expected_response_len()
        }
    }

    fn response_transaction_id(&self, frame: &[u8]) -> Option<u16> {
        (frame.len() >= 2).then(|| u16::from_be_bytes([frame[0], frame[1]]))
    }
}
