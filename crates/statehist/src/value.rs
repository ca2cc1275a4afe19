//! State values stored in intervals.
//!
//! A [`StateValue`] is a small tagged union. `Null` is the explicit
//! "no information" sentinel: it is a legal value, not an error. An
//! attribute may hold values of different types at different times.

use crate::error::{Result, StateError};
use std::fmt;

/// On-disk tag for [`StateValue::Null`].
pub const TAG_NULL: u8 = 0;
/// On-disk tag for [`StateValue::Int`].
pub const TAG_INT: u8 = 1;
/// On-disk tag for [`StateValue::Long`].
pub const TAG_LONG: u8 = 2;
/// On-disk tag for [`StateValue::Double`].
pub const TAG_DOUBLE: u8 = 3;
/// On-disk tag for [`StateValue::String`].
pub const TAG_STRING: u8 = 4;

/// A value held by an attribute over an interval of time.
///
/// Equality compares doubles by their bit pattern: `NaN` equals itself and
/// `-0.0` differs from `0.0`.
#[derive(Debug, Clone, Default)]
pub enum StateValue {
    /// No information.
    #[default]
    Null,
    /// 32-bit signed integer.
    Int(i32),
    /// 64-bit signed integer.
    Long(i64),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    String(String),
}

impl StateValue {
    /// Returns true for [`StateValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    /// Human-readable name of the held type.
    pub fn type_name(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Int(_) => "int",
            StateValue::Long(_) => "long",
            StateValue::Double(_) => "double",
            StateValue::String(_) => "string",
        }
    }

    /// On-disk type tag.
    pub fn tag(&self) -> u8 {
        match self {
            StateValue::Null => TAG_NULL,
            StateValue::Int(_) => TAG_INT,
            StateValue::Long(_) => TAG_LONG,
            StateValue::Double(_) => TAG_DOUBLE,
            StateValue::String(_) => TAG_STRING,
        }
    }

    /// Unboxes an `Int`.
    pub fn unbox_int(&self) -> Result<i32> {
        match self {
            StateValue::Int(v) => Ok(*v),
            other => Err(other.mismatch("int")),
        }
    }

    /// Unboxes a `Long`. An `Int` is widened.
    pub fn unbox_long(&self) -> Result<i64> {
        match self {
            StateValue::Long(v) => Ok(*v),
            StateValue::Int(v) => Ok(i64::from(*v)),
            other => Err(other.mismatch("long")),
        }
    }

    /// Unboxes a `Double`.
    pub fn unbox_double(&self) -> Result<f64> {
        match self {
            StateValue::Double(v) => Ok(*v),
            other => Err(other.mismatch("double")),
        }
    }

    /// Borrows the string of a `String` value.
    pub fn unbox_str(&self) -> Result<&str> {
        match self {
            StateValue::String(v) => Ok(v),
            other => Err(other.mismatch("string")),
        }
    }

    fn mismatch(&self, expected: &'static str) -> StateError {
        StateError::StateValueType {
            expected,
            actual: self.type_name(),
        }
    }
}

impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StateValue::Null, StateValue::Null) => true,
            (StateValue::Int(a), StateValue::Int(b)) => a == b,
            (StateValue::Long(a), StateValue::Long(b)) => a == b,
            (StateValue::Double(a), StateValue::Double(b)) => a.to_bits() == b.to_bits(),
            (StateValue::String(a), StateValue::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for StateValue {}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Null => write!(f, "nullValue"),
            StateValue::Int(v) => write!(f, "{v}"),
            StateValue::Long(v) => write!(f, "{v}"),
            StateValue::Double(v) => write!(f, "{v}"),
            StateValue::String(v) => write!(f, "{v}"),
        }
    }
}

impl From<i32> for StateValue {
    fn from(v: i32) -> Self {
        StateValue::Int(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Long(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Double(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::String(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::String(v)
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(StateValue::Null, Into::into)
    }
}
