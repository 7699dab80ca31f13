//! # Record Layer
//!
//! Fixed-layout record encoding over typed schemas. A record's slot body is
//! a null bitmap followed by fixed-width field data; anything variable
//! (long strings, blobs) moves out of line into a blob chain in the same
//! file and the slot keeps the chain pointer.
//!
//! ## Str Field Encoding (24 bytes)
//!
//! ```text
//! inline:    +-----+-----+----------------------+
//!            |  0  | len | bytes, zero padded   |
//!            +-----+-----+----------------------+
//! overflow:  +-----+---------+---------+--------+------+
//!            |  1  | pad (3) | page u32| len u64| pad  |
//!            +-----+---------+---------+--------+------+
//! ```
//!
//! The inline/overflow split keeps short property strings (the common case
//! in a resource store) out of the blob heap entirely.
//!
//! ## Encode/Decode Discipline
//!
//! Encoding produces an owned body buffer and performs any blob-chain writes
//! before the caller touches the destination page, so no page borrow is held
//! across blob I/O. Updates reuse unchanged out-of-line chains and free
//! replaced ones, which is what lets the table layer maintain indexes for
//! changed fields only.

mod schema;
mod types;

pub use schema::{FieldDef, TableSchema, SLOT_HEADER_SIZE, SLOT_LIVE};
pub use types::{FieldType, Value};

use crate::config::INLINE_STR_MAX;
use crate::handle::RecordHandle;
use crate::storage::{blob, BlobHandle, PageStore};
use eyre::{bail, ensure, Result, WrapErr};

/// One row of a table, in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    values: Vec<Value>,
}

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, field_no: usize) -> Option<&Value> {
        self.values.get(field_no)
    }

    pub fn field_count(&self) -> usize {
        self.values.len()
    }
}

const STR_INLINE_TAG: u8 = 0;
const STR_OVERFLOW_TAG: u8 = 1;

fn bitmap_set_null(body: &mut [u8], field_no: usize) {
    body[field_no / 8] |= 1 << (field_no % 8);
}

fn bitmap_is_null(body: &[u8], field_no: usize) -> bool {
    body[field_no / 8] & (1 << (field_no % 8)) != 0
}

/// Encode a record into a fresh slot body, writing any out-of-line chains.
/// The record must already have passed schema validation.
pub(crate) fn encode_body(
    schema: &TableSchema,
    record: &Record,
    store: &mut PageStore,
) -> Result<Vec<u8>> {
    let mut body = vec![0u8; schema.body_size()];

    for (field_no, value) in record.values().iter().enumerate() {
        if value.is_null() {
            bitmap_set_null(&mut body, field_no);
            continue;
        }
        encode_field(schema, field_no, value, store, &mut body)?;
    }
    Ok(body)
}

/// Encode a record over an existing body: unchanged fields keep their bytes
/// (and therefore their chains); changed fields free the old chain and
/// encode fresh. Returns the new body and the field numbers that changed.
pub(crate) fn encode_update(
    schema: &TableSchema,
    old_body: &[u8],
    old: &Record,
    new: &Record,
    store: &mut PageStore,
) -> Result<(Vec<u8>, Vec<u16>)> {
    let mut body = vec![0u8; schema.body_size()];
    let mut changed = Vec::new();

    for field_no in 0..schema.field_count() {
        let offset = schema.offset(field_no);
        let width = schema.fields()[field_no].field_type.width();
        let new_value = &new.values()[field_no];

        if new_value == &old.values()[field_no] {
            if bitmap_is_null(old_body, field_no) {
                bitmap_set_null(&mut body, field_no);
            } else {
                body[offset..offset + width].copy_from_slice(&old_body[offset..offset + width]);
            }
            continue;
        }

        changed.push(field_no as u16);
        free_field_chain(schema, field_no, old_body, store, false)?;
        if new_value.is_null() {
            bitmap_set_null(&mut body, field_no);
        } else {
            encode_field(schema, field_no, new_value, store, &mut body)?;
        }
    }
    Ok((body, changed))
}

fn encode_field(
    schema: &TableSchema,
    field_no: usize,
    value: &Value,
    store: &mut PageStore,
    body: &mut [u8],
) -> Result<()> {
    let offset = schema.offset(field_no);
    let field_type = schema.fields()[field_no].field_type;

    match (field_type, value) {
        (FieldType::Int, Value::Int(i)) | (FieldType::Date, Value::Date(i)) => {
            body[offset..offset + 8].copy_from_slice(&i.to_le_bytes());
        }
        (FieldType::Double, Value::Double(d)) => {
            body[offset..offset + 8].copy_from_slice(&d.to_le_bytes());
        }
        (FieldType::Ref, Value::Ref(h)) => {
            body[offset..offset + 8].copy_from_slice(&h.as_u64().to_le_bytes());
        }
        (FieldType::Str, Value::Str(s)) => {
            let bytes = s.as_bytes();
            if bytes.len() <= INLINE_STR_MAX {
                body[offset] = STR_INLINE_TAG;
                body[offset + 1] = bytes.len() as u8;
                body[offset + 2..offset + 2 + bytes.len()].copy_from_slice(bytes);
            } else {
                let handle = blob::store(store, bytes)
                    .wrap_err_with(|| format!("failed to store overflow string field {}", field_no))?;
                body[offset] = STR_OVERFLOW_TAG;
                body[offset + 4..offset + 16].copy_from_slice(&handle.encode());
            }
        }
        (FieldType::Blob, Value::Blob(b)) => {
            let handle = blob::store(store, b)
                .wrap_err_with(|| format!("failed to store blob field {}", field_no))?;
            body[offset..offset + 12].copy_from_slice(&handle.encode());
        }
        (ft, v) => bail!("field {} is {:?} but value is {:?}", field_no, ft, v),
    }
    Ok(())
}

/// Decode a slot body back into a record, loading out-of-line values.
pub(crate) fn decode_body(
    schema: &TableSchema,
    store: &mut PageStore,
    body: &[u8],
) -> Result<Record> {
    ensure!(
        body.len() >= schema.body_size(),
        "slot body of {} bytes is smaller than schema body size {}",
        body.len(),
        schema.body_size()
    );

    let mut values = Vec::with_capacity(schema.field_count());
    for field_no in 0..schema.field_count() {
        if bitmap_is_null(body, field_no) {
            values.push(Value::Null);
            continue;
        }
        values.push(decode_field(schema, field_no, store, body)?);
    }
    Ok(Record::new(values))
}

/// Decode a single field of a slot body.
pub(crate) fn decode_field(
    schema: &TableSchema,
    field_no: usize,
    store: &mut PageStore,
    body: &[u8],
) -> Result<Value> {
    if bitmap_is_null(body, field_no) {
        return Ok(Value::Null);
    }

    let offset = schema.offset(field_no);
    let value = match schema.fields()[field_no].field_type {
        FieldType::Int => Value::Int(i64::from_le_bytes(body[offset..offset + 8].try_into()?)),
        FieldType::Date => Value::Date(i64::from_le_bytes(body[offset..offset + 8].try_into()?)),
        FieldType::Double => {
            Value::Double(f64::from_le_bytes(body[offset..offset + 8].try_into()?))
        }
        FieldType::Ref => Value::Ref(RecordHandle::from_u64(u64::from_le_bytes(
            body[offset..offset + 8].try_into()?,
        ))),
        FieldType::Str => match body[offset] {
            STR_INLINE_TAG => {
                let len = body[offset + 1] as usize;
                ensure!(
                    len <= INLINE_STR_MAX,
                    "inline string of field {} claims {} bytes",
                    field_no,
                    len
                );
                let bytes = &body[offset + 2..offset + 2 + len];
                Value::Str(
                    std::str::from_utf8(bytes)
                        .wrap_err_with(|| format!("field {} holds invalid UTF-8", field_no))?
                        .to_string(),
                )
            }
            STR_OVERFLOW_TAG => {
                let handle = BlobHandle::decode(&body[offset + 4..offset + 16])?;
                let bytes = blob::load(store, handle).wrap_err_with(|| {
                    format!("failed to load overflow string field {}", field_no)
                })?;
                Value::Str(
                    String::from_utf8(bytes)
                        .wrap_err_with(|| format!("field {} holds invalid UTF-8", field_no))?,
                )
            }
            tag => bail!("field {} has unknown string tag {}", field_no, tag),
        },
        FieldType::Blob => {
            let handle = BlobHandle::decode(&body[offset..offset + 12])?;
            Value::Blob(blob::load(store, handle)?)
        }
    };
    Ok(value)
}

/// Out-of-line chains referenced by a slot body, for the consistency
/// checker and for reclamation.
pub(crate) fn out_of_line_handles(
    schema: &TableSchema,
    body: &[u8],
) -> Result<Vec<(u16, BlobHandle)>> {
    let mut handles = Vec::new();
    for (field_no, field) in schema.fields().iter().enumerate() {
        if bitmap_is_null(body, field_no) {
            continue;
        }
        let offset = schema.offset(field_no);
        match field.field_type {
            FieldType::Str if body[offset] == STR_OVERFLOW_TAG => {
                handles.push((
                    field_no as u16,
                    BlobHandle::decode(&body[offset + 4..offset + 16])?,
                ));
            }
            FieldType::Blob => {
                handles.push((field_no as u16, BlobHandle::decode(&body[offset..offset + 12])?));
            }
            _ => {}
        }
    }
    Ok(handles)
}

/// Free every out-of-line chain a slot body references. With `lenient` set,
/// a broken chain is skipped instead of failing the whole reclamation; the
/// consistency checker picks up anything left behind.
pub(crate) fn free_out_of_line(
    schema: &TableSchema,
    body: &[u8],
    store: &mut PageStore,
    lenient: bool,
) -> Result<()> {
    for (field_no, handle) in out_of_line_handles(schema, body)? {
        let result = blob::delete(store, handle);
        match result {
            Ok(()) => {}
            Err(_) if lenient => {}
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("failed to free chain of field {}", field_no))
            }
        }
    }
    Ok(())
}

fn free_field_chain(
    schema: &TableSchema,
    field_no: usize,
    body: &[u8],
    store: &mut PageStore,
    lenient: bool,
) -> Result<()> {
    if bitmap_is_null(body, field_no) {
        return Ok(());
    }
    let offset = schema.offset(field_no);
    let handle = match schema.fields()[field_no].field_type {
        FieldType::Str if body[offset] == STR_OVERFLOW_TAG => {
            BlobHandle::decode(&body[offset + 4..offset + 16])?
        }
        FieldType::Blob => BlobHandle::decode(&body[offset..offset + 12])?,
        _ => return Ok(()),
    };
    match blob::delete(store, handle) {
        Ok(()) => Ok(()),
        Err(_) if lenient => Ok(()),
        Err(e) => Err(e).wrap_err_with(|| format!("failed to free chain of field {}", field_no)),
    }
}
