//! # Memcomparable Key Encoding
//!
//! Index entries are plain byte strings compared with `memcmp`, so every
//! field type encodes to bytes whose lexicographic order matches the type's
//! natural order:
//!
//! - **Int/Date**: sign bit flipped, big-endian (two's complement order)
//! - **Double**: IEEE-754 total order — positive values get the sign bit
//!   set, negative values are bitwise inverted, then big-endian
//! - **Str**: raw bytes with `0x00` escaped as `0x00 0xFF`, terminated by
//!   `0x00 0x00` so no valid encoding is a strict prefix of another
//! - **Ref**: the packed handle, big-endian
//!
//! A full entry is the encoded field key followed by the 8-byte big-endian
//! record handle. Duplicate field values therefore stay unique entries and
//! order by handle, which is the stable insertion-order tie-break the
//! contract asks for, and an exact-match lookup is a bounded range scan
//! over the shared field-key prefix.

use crate::handle::RecordHandle;
use crate::records::Value;
use eyre::{ensure, Result};

pub const ENTRY_HANDLE_SIZE: usize = 8;

pub fn encode_int(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1u64 << 63)).to_be_bytes()
}

pub fn encode_double(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let ordered = if bits & (1u64 << 63) == 0 {
        bits | (1u64 << 63)
    } else {
        !bits
    };
    ordered.to_be_bytes()
}

pub fn encode_str(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 2);
    for &b in s.as_bytes() {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xFF);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
    out.push(0x00);
    out
}

pub fn encode_ref(h: RecordHandle) -> [u8; 8] {
    h.as_u64().to_be_bytes()
}

/// Encode a field value as an index key. `None` for null values: a null
/// field has no index entry.
pub fn encode_value(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Null => None,
        Value::Int(i) | Value::Date(i) => Some(encode_int(*i).to_vec()),
        Value::Double(d) => Some(encode_double(*d).to_vec()),
        Value::Str(s) => Some(encode_str(s)),
        Value::Ref(h) => Some(encode_ref(*h).to_vec()),
        Value::Blob(_) => None,
    }
}

/// Full index entry: field key followed by the big-endian handle.
pub fn entry_bytes(field_key: &[u8], handle: RecordHandle) -> Vec<u8> {
    let mut entry = Vec::with_capacity(field_key.len() + ENTRY_HANDLE_SIZE);
    entry.extend_from_slice(field_key);
    entry.extend_from_slice(&handle.as_u64().to_be_bytes());
    entry
}

/// Lower bound of the entry range sharing `field_key`.
pub fn entry_lower_bound(field_key: &[u8]) -> Vec<u8> {
    entry_bytes(field_key, RecordHandle::NULL)
}

pub fn entry_handle(entry: &[u8]) -> Result<RecordHandle> {
    ensure!(
        entry.len() >= ENTRY_HANDLE_SIZE,
        "index entry of {} bytes has no handle suffix",
        entry.len()
    );
    let raw = u64::from_be_bytes(entry[entry.len() - ENTRY_HANDLE_SIZE..].try_into()?);
    Ok(RecordHandle::from_u64(raw))
}

pub fn entry_field_key(entry: &[u8]) -> Result<&[u8]> {
    ensure!(
        entry.len() >= ENTRY_HANDLE_SIZE,
        "index entry of {} bytes has no handle suffix",
        entry.len()
    );
    Ok(&entry[..entry.len() - ENTRY_HANDLE_SIZE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_order_preserved() {
        let values = [i64::MIN, -1_000_000, -1, 0, 1, 42, i64::MAX];
        for pair in values.windows(2) {
            assert!(
                encode_int(pair[0]) < encode_int(pair[1]),
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn double_order_preserved() {
        let values = [
            f64::NEG_INFINITY,
            -1e100,
            -1.5,
            -0.0,
            0.0,
            1e-10,
            2.5,
            f64::INFINITY,
        ];
        for pair in values.windows(2) {
            assert!(
                encode_double(pair[0]) <= encode_double(pair[1]),
                "{} should not sort after {}",
                pair[0],
                pair[1]
            );
        }
        // -0.0 and 0.0 share an order position only via <=; distinct values
        // must be strict
        assert!(encode_double(-1.5) < encode_double(2.5));
    }

    #[test]
    fn str_order_preserved() {
        let values = ["", "a", "a\0b", "aa", "ab", "b"];
        for pair in values.windows(2) {
            assert!(
                encode_str(pair[0]) < encode_str(pair[1]),
                "{:?} should sort before {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn no_encoding_is_a_prefix_of_another() {
        let a = encode_str("ab");
        let b = encode_str("abc");

        assert!(!b.starts_with(&a));
    }

    #[test]
    fn entry_roundtrip() {
        let handle = crate::handle::RecordHandle::new(3, 7, 1);
        let key = encode_int(99);

        let entry = entry_bytes(&key, handle);

        assert_eq!(entry_field_key(&entry).unwrap(), &key[..]);
        assert_eq!(entry_handle(&entry).unwrap(), handle);
    }

    #[test]
    fn duplicate_keys_order_by_handle() {
        let key = encode_int(5);
        let h1 = crate::handle::RecordHandle::new(1, 0, 0);
        let h2 = crate::handle::RecordHandle::new(1, 1, 0);

        assert!(entry_bytes(&key, h1) < entry_bytes(&key, h2));
        assert!(entry_lower_bound(&key) <= entry_bytes(&key, h1));
    }

    #[test]
    fn null_and_blob_values_have_no_key() {
        assert!(encode_value(&Value::Null).is_none());
        assert!(encode_value(&Value::Blob(vec![1])).is_none());
        assert!(encode_value(&Value::Int(1)).is_some());
    }
}
