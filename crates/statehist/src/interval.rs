//! State intervals and their on-disk encoding.
//!
//! ## Record Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Start: i64 (8 bytes)                        │
//! │  End: i64 (8 bytes)                          │
//! │  Attribute quark: u32 (4 bytes)              │
//! │  Value tag: u8 (1 byte)                      │
//! ├──────────────────────────────────────────────┤
//! │  Payload (variable)                          │
//! │  - Null: 0 bytes                             │
//! │  - Int: i32 (4 bytes)                        │
//! │  - Long / Double: 8 bytes                    │
//! │  - String: u16 length + UTF-8 bytes          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian.

use crate::attribute::Quark;
use crate::error::{Result, StateError};
use crate::value::{StateValue, TAG_DOUBLE, TAG_INT, TAG_LONG, TAG_NULL, TAG_STRING};
use std::fmt;
use std::io::{Read, Write};

/// Size of the fixed part of an encoded interval.
pub const INTERVAL_FIXED_SIZE: usize = 21;

/// Largest encodable interval: a string payload carries a `u16` length.
pub const MAX_INTERVAL_SIZE: usize = INTERVAL_FIXED_SIZE + 2 + u16::MAX as usize;

/// An immutable `(start, end, attribute, value)` fact.
///
/// Both bounds are inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct StateInterval {
    start: i64,
    end: i64,
    attribute: Quark,
    value: StateValue,
}

impl StateInterval {
    /// Creates an interval. Callers are responsible for `start <= end`.
    pub fn new(start: i64, end: i64, attribute: Quark, value: StateValue) -> Self {
        Self {
            start,
            end,
            attribute,
            value,
        }
    }

    /// Start time (inclusive).
    pub fn start(&self) -> i64 {
        self.start
    }

    /// End time (inclusive).
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Attribute this interval belongs to.
    pub fn attribute(&self) -> Quark {
        self.attribute
    }

    /// Value held during the interval.
    pub fn value(&self) -> &StateValue {
        &self.value
    }

    /// Consumes the interval, returning its value.
    pub fn into_value(self) -> StateValue {
        self.value
    }

    /// Returns true if `t` lies within `[start, end]`.
    pub fn intersects(&self, t: i64) -> bool {
        self.start <= t && t <= self.end
    }

    /// Number of bytes this interval occupies in a node block.
    pub fn size_on_disk(&self) -> usize {
        INTERVAL_FIXED_SIZE + payload_size(&self.value)
    }

    /// Serializes the interval.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.start.to_le_bytes())?;
        writer.write_all(&self.end.to_le_bytes())?;
        writer.write_all(&self.attribute.to_le_bytes())?;
        writer.write_all(&[self.value.tag()])?;

        match &self.value {
            StateValue::Null => {}
            StateValue::Int(v) => writer.write_all(&v.to_le_bytes())?,
            StateValue::Long(v) => writer.write_all(&v.to_le_bytes())?,
            StateValue::Double(v) => writer.write_all(&v.to_le_bytes())?,
            StateValue::String(s) => {
                let len = u16::try_from(s.len()).map_err(|_| StateError::IntervalTooLarge {
                    size: self.size_on_disk(),
                    capacity: MAX_INTERVAL_SIZE,
                })?;
                writer.write_all(&len.to_le_bytes())?;
                writer.write_all(s.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Deserializes an interval written by [`StateInterval::write_to`].
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; INTERVAL_FIXED_SIZE];
        reader.read_exact(&mut buf)?;

        let start = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let end = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        let attribute = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let tag = buf[20];

        let value = match tag {
            TAG_NULL => StateValue::Null,
            TAG_INT => {
                let mut b = [0u8; 4];
                reader.read_exact(&mut b)?;
                StateValue::Int(i32::from_le_bytes(b))
            }
            TAG_LONG => {
                let mut b = [0u8; 8];
                reader.read_exact(&mut b)?;
                StateValue::Long(i64::from_le_bytes(b))
            }
            TAG_DOUBLE => {
                let mut b = [0u8; 8];
                reader.read_exact(&mut b)?;
                StateValue::Double(f64::from_le_bytes(b))
            }
            TAG_STRING => {
                let mut b = [0u8; 2];
                reader.read_exact(&mut b)?;
                let mut bytes = vec![0u8; u16::from_le_bytes(b) as usize];
                reader.read_exact(&mut bytes)?;
                let s = String::from_utf8(bytes)
                    .map_err(|e| StateError::Corrupted(format!("invalid string value: {e}")))?;
                StateValue::String(s)
            }
            other => {
                return Err(StateError::Corrupted(format!(
                    "unknown value tag {other}"
                )))
            }
        };

        if start > end {
            return Err(StateError::Corrupted(format!(
                "interval start {start} after end {end}"
            )));
        }

        Ok(Self::new(start, end, attribute, value))
    }
}

impl fmt::Display for StateInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}], attribute = {}, value = {}",
            self.start, self.end, self.attribute, self.value
        )
    }
}

fn payload_size(value: &StateValue) -> usize {
    match value {
        StateValue::Null => 0,
        StateValue::Int(_) => 4,
        StateValue::Long(_) | StateValue::Double(_) => 8,
        StateValue::String(s) => 2 + s.len(),
    }
}
