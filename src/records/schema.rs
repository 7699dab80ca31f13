//! # Table Schemas
//!
//! A table schema is the ordered list of field definitions plus the
//! pre-computed slot layout derived from it. Offsets are computed once at
//! schema construction so field access during encode/decode is O(1).
//!
//! ## Slot Layout
//!
//! ```text
//! +-------------+-------------+----------------------------+
//! | slot header | null bitmap | fixed-width field data     |
//! | (4 bytes)   | ceil(n/8)   | sum of field widths        |
//! +-------------+-------------+----------------------------+
//! ```
//!
//! The slot header (flags byte, reserved byte, u16 generation) is owned by
//! the table layer; this module computes everything after it. A set bit in
//! the null bitmap means the field is null and its data bytes are undefined.

use crate::config::{MAX_INDEXES_PER_TABLE, PAGE_USABLE_SIZE};
use crate::records::types::FieldType;
use eyre::{ensure, Result};

/// Declaration of one field of a table.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub indexed: bool,
    /// Name of the table this field's handles point into. Declared on Ref
    /// fields so the repairer can verify referential integrity.
    pub references: Option<String>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            indexed: false,
            references: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn references(mut self, table: impl Into<String>) -> Self {
        self.references = Some(table.into());
        self
    }
}

/// Validated schema with the pre-computed slot layout.
#[derive(Debug, Clone)]
pub struct TableSchema {
    fields: Vec<FieldDef>,
    offsets: Vec<usize>,
    bitmap_size: usize,
    body_size: usize,
}

/// Bytes of the slot header preceding the record body.
pub const SLOT_HEADER_SIZE: usize = 4;

/// Slot flag: the slot holds a live record (clear = tombstone).
pub const SLOT_LIVE: u8 = 0x01;

impl TableSchema {
    pub fn new(fields: Vec<FieldDef>) -> Result<Self> {
        ensure!(!fields.is_empty(), "schema must declare at least one field");

        let mut indexed = 0usize;
        for (i, field) in fields.iter().enumerate() {
            ensure!(!field.name.is_empty(), "field {} has an empty name", i);
            ensure!(
                !fields[..i].iter().any(|f| f.name == field.name),
                "duplicate field name '{}'",
                field.name
            );
            if field.indexed {
                ensure!(
                    field.field_type.indexable(),
                    "field '{}' is {:?} and cannot be indexed",
                    field.name,
                    field.field_type
                );
                indexed += 1;
            }
            if field.references.is_some() {
                ensure!(
                    field.field_type == FieldType::Ref,
                    "field '{}' declares references but is {:?}",
                    field.name,
                    field.field_type
                );
            }
        }
        ensure!(
            indexed <= MAX_INDEXES_PER_TABLE,
            "too many indexed fields: {} > {}",
            indexed,
            MAX_INDEXES_PER_TABLE
        );

        let bitmap_size = fields.len().div_ceil(8);
        let mut offsets = Vec::with_capacity(fields.len());
        let mut offset = bitmap_size;
        for field in &fields {
            offsets.push(offset);
            offset += field.field_type.width();
        }

        let schema = Self {
            fields,
            offsets,
            bitmap_size,
            body_size: offset,
        };
        ensure!(
            schema.slot_size() <= PAGE_USABLE_SIZE,
            "record slot of {} bytes does not fit a page",
            schema.slot_size()
        );
        // The free-slot chain reuses the first 8 body bytes of a tombstone.
        ensure!(
            schema.body_size >= 8,
            "record body of {} bytes is below the minimum of 8",
            schema.body_size
        );

        Ok(schema)
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Byte offset of a field within the slot body (bitmap included).
    pub fn offset(&self, field_no: usize) -> usize {
        self.offsets[field_no]
    }

    pub fn bitmap_size(&self) -> usize {
        self.bitmap_size
    }

    /// Size of the slot body: null bitmap plus fixed field data.
    pub fn body_size(&self) -> usize {
        self.body_size
    }

    /// Full on-page slot size including the slot header.
    pub fn slot_size(&self) -> usize {
        SLOT_HEADER_SIZE + self.body_size
    }

    pub fn slots_per_page(&self) -> usize {
        PAGE_USABLE_SIZE / self.slot_size()
    }

    /// Field numbers of all indexed fields, in declaration order.
    pub fn indexed_fields(&self) -> Vec<u16> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.indexed)
            .map(|(i, _)| i as u16)
            .collect()
    }

    /// Field numbers and target table names of all Ref fields that declare
    /// a referenced table.
    pub fn reference_fields(&self) -> Vec<(u16, &str)> {
        self.fields
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.references.as_deref().map(|t| (i as u16, t)))
            .collect()
    }
}
