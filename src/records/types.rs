//! # Field Types and Values
//!
//! The engine stores fixed-layout records whose fields are drawn from a small
//! closed set of types. Every type has a fixed slot width so that record
//! slots never change size in place:
//!
//! | Type   | Width | Storage                                        |
//! |--------|-------|------------------------------------------------|
//! | Int    | 8     | i64 little-endian                              |
//! | Double | 8     | f64 bits little-endian                         |
//! | Date   | 8     | microseconds since the Unix epoch, i64         |
//! | Str    | 24    | tag + inline bytes, or overflow chain pointer  |
//! | Blob   | 12    | chain first page + declared length             |
//! | Ref    | 8     | packed record handle of a row in another table |
//!
//! `Str` values up to [`INLINE_STR_MAX`](crate::config::INLINE_STR_MAX) bytes
//! live inline in the slot; longer values move to a blob chain and the slot
//! keeps the chain pointer. `Blob` values are always out of line.

use crate::handle::RecordHandle;
use eyre::{bail, Result};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int = 0x01,
    Double = 0x02,
    Date = 0x03,
    Str = 0x04,
    Blob = 0x05,
    Ref = 0x06,
}

impl FieldType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(FieldType::Int),
            0x02 => Some(FieldType::Double),
            0x03 => Some(FieldType::Date),
            0x04 => Some(FieldType::Str),
            0x05 => Some(FieldType::Blob),
            0x06 => Some(FieldType::Ref),
            _ => None,
        }
    }

    /// Fixed width of this type within a record slot.
    pub fn width(&self) -> usize {
        match self {
            FieldType::Int | FieldType::Double | FieldType::Date | FieldType::Ref => 8,
            FieldType::Str => 24,
            FieldType::Blob => 12,
        }
    }

    /// Whether a field of this type may carry an index. Blob contents have
    /// no ordering the index could expose.
    pub fn indexable(&self) -> bool {
        !matches!(self, FieldType::Blob)
    }
}

/// One field value of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Double(f64),
    Date(i64),
    Str(String),
    Blob(Vec<u8>),
    Ref(RecordHandle),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value is acceptable for a field of the given type.
    /// Null is acceptable for any type; requiredness is checked separately.
    pub fn matches(&self, field_type: FieldType) -> bool {
        matches!(
            (self, field_type),
            (Value::Null, _)
                | (Value::Int(_), FieldType::Int)
                | (Value::Double(_), FieldType::Double)
                | (Value::Date(_), FieldType::Date)
                | (Value::Str(_), FieldType::Str)
                | (Value::Blob(_), FieldType::Blob)
                | (Value::Ref(_), FieldType::Ref)
        )
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            other => bail!("expected Int value, got {:?}", other),
        }
    }

    pub fn as_double(&self) -> Result<f64> {
        match self {
            Value::Double(d) => Ok(*d),
            other => bail!("expected Double value, got {:?}", other),
        }
    }

    pub fn as_date(&self) -> Result<i64> {
        match self {
            Value::Date(d) => Ok(*d),
            other => bail!("expected Date value, got {:?}", other),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(s) => Ok(s),
            other => bail!("expected Str value, got {:?}", other),
        }
    }

    pub fn as_blob(&self) -> Result<&[u8]> {
        match self {
            Value::Blob(b) => Ok(b),
            other => bail!("expected Blob value, got {:?}", other),
        }
    }

    pub fn as_ref_handle(&self) -> Result<RecordHandle> {
        match self {
            Value::Ref(h) => Ok(*h),
            other => bail!("expected Ref value, got {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_type_byte_roundtrip() {
        for ft in [
            FieldType::Int,
            FieldType::Double,
            FieldType::Date,
            FieldType::Str,
            FieldType::Blob,
            FieldType::Ref,
        ] {
            assert_eq!(FieldType::from_byte(ft as u8), Some(ft));
        }
        assert_eq!(FieldType::from_byte(0x00), None);
        assert_eq!(FieldType::from_byte(0xFF), None);
    }

    #[test]
    fn null_matches_every_type() {
        for ft in [FieldType::Int, FieldType::Str, FieldType::Blob] {
            assert!(Value::Null.matches(ft));
        }
    }

    #[test]
    fn value_type_checks() {
        assert!(Value::Int(1).matches(FieldType::Int));
        assert!(!Value::Int(1).matches(FieldType::Double));
        assert!(Value::Str("x".into()).matches(FieldType::Str));
        assert!(!Value::Blob(vec![1]).matches(FieldType::Str));
        assert!(Value::Ref(RecordHandle::new(1, 0, 0)).matches(FieldType::Ref));
    }

    #[test]
    fn accessors_reject_wrong_variant() {
        assert_eq!(Value::Int(7).as_int().unwrap(), 7);
        assert!(Value::Int(7).as_str().is_err());
        assert!(Value::Null.as_int().is_err());
    }

    #[test]
    fn blob_is_not_indexable() {
        assert!(!FieldType::Blob.indexable());
        assert!(FieldType::Str.indexable());
    }
}
