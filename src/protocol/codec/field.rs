/// Typed field extraction from a validated response payload.
///
/// Fields are declared per device (offset, width, byte order, scale) instead of
/// being hardcoded per driver. Decoding only runs after the codec accepted the
/// frame structurally, so every error produced here is a `MalformedField`.
use serde::{Deserialize, Serialize};

use super::FrameError;

/// Wire representation of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    U16,
    I16,
    U32,
    I32,
    F32,
    /// Single bit, counted LSB-first starting at the field offset.
    Bit(u8),
}

impl FieldKind {
    pub fn width(self) -> usize {
        match self {
            FieldKind::U16 | FieldKind::I16 => 2,
            FieldKind::U32 | FieldKind::I32 | FieldKind::F32 => 4,
            FieldKind::Bit(bit) => bit as usize / 8 + 1,
        }
    }
}

/// Byte order of multi-byte fields.
///
/// `BigSwapped` is the common Modbus "word swapped" layout for 32-bit values
/// (CDAB); for 16-bit values it behaves like `Big`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
    BigSwapped,
}

/// Linear conversion applied to the raw value: `raw * multiplier + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub offset: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

impl Default for Scale {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Scale {
    pub const IDENTITY: Scale = Scale {
        multiplier: 1.0,
        offset: 0.0,
    };

    pub fn new(multiplier: f64, offset: f64) -> Self {
        Self { multiplier, offset }
    }

    /// Kilowatt readings published as watts.
    pub fn kilo_to_unit() -> Self {
        Self::new(1000.0, 0.0)
    }

    /// Readings reported in tenths (e.g. tenths of mL) published in whole units.
    pub fn tenths_to_unit() -> Self {
        Self::new(0.1, 0.0)
    }

    pub fn is_identity(&self) -> bool {
        self.multiplier == 1.0 && self.offset == 0.0
    }

    pub fn apply(&self, raw: f64) -> f64 {
        raw * self.multiplier + self.offset
    }
}

/// Declaration of one named value inside a response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Byte offset into the payload data section.
    pub offset: usize,
    pub kind: FieldKind,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub scale: Scale,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, offset: usize, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            offset,
            kind,
            byte_order: ByteOrder::Big,
            scale: Scale::IDENTITY,
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_scale(mut self, scale: Scale) -> Self {
        self.scale = scale;
        self
    }

    /// Decode this field out of `data`.
    pub fn decode(&self, data: &[u8]) -> Result<Value, FrameError> {
        let end = self
            .offset
            .checked_add(self.kind.width())
            .ok_or_else(|| self.malformed())?;
        let raw = data.get(self.offset..end).ok_or_else(|| self.malformed())?;

        let value = match self.kind {
            FieldKind::Bit(bit) => {
                let byte = raw[bit as usize / 8];
                return Ok(Value::Bool(byte & (1 << (bit % 8)) != 0));
            }
            FieldKind::U16 => self.scaled_int(i64::from(u16::from_be_bytes(self.order2(raw)))),
            FieldKind::I16 => self.scaled_int(i64::from(i16::from_be_bytes(self.order2(raw)))),
            FieldKind::U32 => self.scaled_int(i64::from(u32::from_be_bytes(self.order4(raw)))),
            FieldKind::I32 => self.scaled_int(i64::from(i32::from_be_bytes(self.order4(raw)))),
            FieldKind::F32 => {
                Value::Float(self.scale.apply(f64::from(f32::from_be_bytes(self.order4(raw)))))
            }
        };

        match value {
            Value::Float(v) if !v.is_finite() => Err(self.malformed()),
            other => Ok(other),
        }
    }

    fn scaled_int(&self, raw: i64) -> Value {
        if self.scale.is_identity() {
            Value::Int(raw)
        } else {
            Value::Float(self.scale.apply(raw as f64))
        }
    }

    fn order2(&self, raw: &[u8]) -> [u8; 2] {
        match self.byte_order {
            ByteOrder::Big | ByteOrder::BigSwapped => [raw[0], raw[1]],
            ByteOrder::Little => [raw[1], raw[0]],
        }
    }

    fn order4(&self, raw: &[u8]) -> [u8; 4] {
        match self.byte_order {
            ByteOrder::Big => [raw[0], raw[1], raw[2], raw[3]],
            ByteOrder::Little => [raw[3], raw[2], raw[1], raw[0]],
            ByteOrder::BigSwapped => [raw[2], raw[3], raw[0], raw[1]],
        }
    }

    fn malformed(&self) -> FrameError {
        FrameError::MalformedField {
            field: self.name.clone(),
        }
    }
}

/// A decoded channel value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Published in place of the last reading once a link is considered offline.
    Invalid,
}

impl Value {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Value::Invalid)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Invalid => write!(f, "invalid"),
        }
    }
}

/// Decode every declared field; the first failing field aborts the whole payload.
pub fn decode_fields(fields: &[FieldSpec], data: &[u8]) -> Result<Vec<(String, Value)>, FrameError> {
    fields
        .iter()
        .map(|field| Ok((field.name.clone(), field.decode(data)?)))
        .collect()
}
