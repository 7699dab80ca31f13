//! # Catalog
//!
//! The schema definition of one database: its named tables and their field
//! declarations, persisted in the `<schema>.meta` file. The schema name
//! labels the database instance (a primary store and a test/reader variant
//! install side by side under different names); it is not a wire-facing
//! identifier.
//!
//! ## Meta File Format
//!
//! ```text
//! +-------------------+ Offset 0
//! | MetaFileHeader    |   magic, version, table count, clean-shutdown
//! | (128 bytes)       |   flag, next table id, catalog length, schema name
//! +-------------------+ Offset 128
//! | Catalog Data      |
//! +-------------------+
//!
//! For each table:
//!   - table_id: u64
//!   - name_len: u16, name: UTF-8 bytes
//!   - field_count: u16
//!   - For each field:
//!       - name_len: u16, name: UTF-8 bytes
//!       - field_type: u8 (FieldType repr)
//!       - flags: u8 (bit 0 required, bit 1 indexed)
//!       - ref_len: u16, referenced table name (0 = none)
//! ```
//!
//! The file is rewritten atomically (temp file + rename + sync), so a crash
//! mid-write leaves the previous catalog intact. The clean-shutdown flag in
//! the header is what gates WAL replay at the next structure load.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};

use crate::records::{FieldDef, FieldType, TableSchema};
use crate::storage::{MetaFileHeader, META_HEADER_SIZE};
use zerocopy::IntoBytes;

const FIELD_FLAG_REQUIRED: u8 = 0x01;
const FIELD_FLAG_INDEXED: u8 = 0x02;

/// One table of the catalog.
#[derive(Debug, Clone)]
pub struct TableDef {
    pub name: String,
    pub table_id: u64,
    pub schema: TableSchema,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    schema_name: String,
    tables: Vec<TableDef>,
    next_table_id: u64,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Catalog {
    pub fn new(schema_name: impl Into<String>) -> Result<Self> {
        let schema_name = schema_name.into();
        ensure!(
            valid_name(&schema_name) && schema_name.len() <= 32,
            "invalid schema name '{}'",
            schema_name
        );
        Ok(Self {
            schema_name,
            tables: Vec::new(),
            next_table_id: 1,
        })
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    /// Declare a table. Table names become file names, so they are
    /// restricted to `[A-Za-z0-9_]`.
    pub fn add_table(&mut self, name: impl Into<String>, fields: Vec<FieldDef>) -> Result<()> {
        let name = name.into();
        ensure!(valid_name(&name), "invalid table name '{}'", name);
        ensure!(
            self.table(&name).is_none(),
            "duplicate table name '{}'",
            name
        );

        let schema = TableSchema::new(fields)
            .wrap_err_with(|| format!("invalid schema for table '{}'", name))?;
        for (_, target) in schema.reference_fields() {
            ensure!(
                valid_name(target),
                "table '{}' references invalid table name '{}'",
                name,
                target
            );
        }

        let table_id = self.next_table_id;
        self.next_table_id += 1;
        self.tables.push(TableDef {
            name,
            table_id,
            schema,
        });
        Ok(())
    }

    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn table_by_id(&self, table_id: u64) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.table_id == table_id)
    }

    /// Verify that every declared reference targets a declared table.
    pub fn check_references(&self) -> Result<()> {
        for table in &self.tables {
            for (field_no, target) in table.schema.reference_fields() {
                ensure!(
                    self.table(target).is_some(),
                    "field '{}' of table '{}' references unknown table '{}'",
                    table.schema.fields()[field_no as usize].name,
                    table.name,
                    target
                );
            }
        }
        Ok(())
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for table in &self.tables {
            buf.extend_from_slice(&table.table_id.to_le_bytes());
            write_str(&mut buf, &table.name);
            buf.extend_from_slice(&(table.schema.field_count() as u16).to_le_bytes());
            for field in table.schema.fields() {
                write_str(&mut buf, &field.name);
                buf.push(field.field_type as u8);
                let mut flags = 0u8;
                if field.required {
                    flags |= FIELD_FLAG_REQUIRED;
                }
                if field.indexed {
                    flags |= FIELD_FLAG_INDEXED;
                }
                buf.push(flags);
                write_str(&mut buf, field.references.as_deref().unwrap_or(""));
            }
        }
        buf
    }

    fn deserialize(schema_name: String, table_count: u32, next_table_id: u64, data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { data, pos: 0 };
        let mut tables = Vec::with_capacity(table_count as usize);

        for _ in 0..table_count {
            let table_id = cursor.read_u64()?;
            let name = cursor.read_str()?;
            let field_count = cursor.read_u16()?;

            let mut fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                let field_name = cursor.read_str()?;
                let type_byte = cursor.read_u8()?;
                let field_type = FieldType::from_byte(type_byte).ok_or_else(|| {
                    eyre::eyre!(
                        "corrupt structure: field '{}' of table '{}' has unknown type {:#x}",
                        field_name,
                        name,
                        type_byte
                    )
                })?;
                let flags = cursor.read_u8()?;
                let references = cursor.read_str()?;

                let mut field = FieldDef::new(field_name, field_type);
                if flags & FIELD_FLAG_REQUIRED != 0 {
                    field = field.required();
                }
                if flags & FIELD_FLAG_INDEXED != 0 {
                    field = field.indexed();
                }
                if !references.is_empty() {
                    field = field.references(references);
                }
                fields.push(field);
            }

            let schema = TableSchema::new(fields)
                .wrap_err_with(|| format!("corrupt structure: bad schema for table '{}'", name))?;
            tables.push(TableDef {
                name,
                table_id,
                schema,
            });
        }
        ensure!(
            cursor.pos == data.len(),
            "corrupt structure: {} trailing bytes after catalog",
            data.len() - cursor.pos
        );

        Ok(Self {
            schema_name,
            tables,
            next_table_id,
        })
    }

    /// Atomically (re)write the meta file.
    pub fn write_meta(&self, path: &Path, clean_shutdown: bool) -> Result<()> {
        let payload = self.serialize();
        let header = MetaFileHeader::new(
            &self.schema_name,
            self.tables.len() as u32,
            self.next_table_id,
            payload.len() as u64,
            clean_shutdown,
        )?;

        let tmp_path = path.with_extension("meta.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .wrap_err_with(|| format!("failed to create '{}'", tmp_path.display()))?;
            file.write_all(header.as_bytes())
                .wrap_err("failed to write meta header")?;
            file.write_all(&payload)
                .wrap_err("failed to write catalog payload")?;
            file.sync_data()
                .wrap_err_with(|| format!("failed to sync '{}'", tmp_path.display()))?;
        }
        std::fs::rename(&tmp_path, path).wrap_err_with(|| {
            format!(
                "failed to move '{}' into place at '{}'",
                tmp_path.display(),
                path.display()
            )
        })?;
        Ok(())
    }

    /// Load the catalog and the clean-shutdown flag from a meta file.
    pub fn read_meta(path: &Path) -> Result<(Self, bool)> {
        let mut file = File::open(path)
            .wrap_err_with(|| format!("failed to open meta file '{}'", path.display()))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .wrap_err_with(|| format!("failed to read meta file '{}'", path.display()))?;

        ensure!(
            bytes.len() >= META_HEADER_SIZE,
            "corrupt structure: meta file '{}' is only {} bytes",
            path.display(),
            bytes.len()
        );
        let header = MetaFileHeader::from_bytes(&bytes)
            .wrap_err_with(|| format!("corrupt structure: bad header in '{}'", path.display()))?;
        let payload_len = header.catalog_len() as usize;
        ensure!(
            bytes.len() == META_HEADER_SIZE + payload_len,
            "corrupt structure: meta file '{}' is {} bytes, header claims {}",
            path.display(),
            bytes.len(),
            META_HEADER_SIZE + payload_len
        );

        let catalog = Self::deserialize(
            header.schema_name()?.to_string(),
            header.table_count(),
            header.next_table_id(),
            &bytes[META_HEADER_SIZE..],
        )?;
        Ok((catalog, header.clean_shutdown()))
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.data.len() {
            bail!(
                "corrupt structure: catalog truncated at byte {} (wanted {} more)",
                self.pos,
                n
            );
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into()?))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into()?))
    }

    fn read_str(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        Ok(std::str::from_utf8(bytes)
            .wrap_err("corrupt structure: catalog string is not UTF-8")?
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Catalog {
        let mut catalog = Catalog::new("primary").unwrap();
        catalog
            .add_table(
                "Resources",
                vec![
                    FieldDef::new("Type", FieldType::Int).required().indexed(),
                    FieldDef::new("DisplayName", FieldType::Str),
                ],
            )
            .unwrap();
        catalog
            .add_table(
                "IntProps",
                vec![
                    FieldDef::new("Owner", FieldType::Ref)
                        .required()
                        .indexed()
                        .references("Resources"),
                    FieldDef::new("PropType", FieldType::Int).indexed(),
                    FieldDef::new("Value", FieldType::Int),
                ],
            )
            .unwrap();
        catalog
    }

    #[test]
    fn table_ids_are_sequential() {
        let catalog = sample();

        assert_eq!(catalog.tables()[0].table_id, 1);
        assert_eq!(catalog.tables()[1].table_id, 2);
        assert!(catalog.table("Resources").is_some());
        assert!(catalog.table_by_id(2).unwrap().name == "IntProps");
    }

    #[test]
    fn rejects_bad_names() {
        assert!(Catalog::new("has space").is_err());
        assert!(Catalog::new("x".repeat(40)).is_err());

        let mut catalog = Catalog::new("ok").unwrap();
        assert!(catalog
            .add_table("../evil", vec![FieldDef::new("A", FieldType::Int)])
            .is_err());
        catalog
            .add_table("Fine", vec![FieldDef::new("A", FieldType::Int)])
            .unwrap();
        assert!(catalog
            .add_table("Fine", vec![FieldDef::new("A", FieldType::Int)])
            .is_err());
    }

    #[test]
    fn check_references_catches_unknown_target() {
        let mut catalog = Catalog::new("x").unwrap();
        catalog
            .add_table(
                "Links",
                vec![FieldDef::new("Owner", FieldType::Ref).references("Nowhere")],
            )
            .unwrap();

        assert!(catalog.check_references().is_err());
        assert!(sample().check_references().is_ok());
    }

    #[test]
    fn meta_roundtrip_preserves_everything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("primary.meta");
        let catalog = sample();

        catalog.write_meta(&path, true).unwrap();
        let (loaded, clean) = Catalog::read_meta(&path).unwrap();

        assert!(clean);
        assert_eq!(loaded.schema_name(), "primary");
        assert_eq!(loaded.tables().len(), 2);

        let props = loaded.table("IntProps").unwrap();
        assert_eq!(props.table_id, 2);
        let owner = &props.schema.fields()[0];
        assert!(owner.required && owner.indexed);
        assert_eq!(owner.references.as_deref(), Some("Resources"));
        assert_eq!(props.schema.indexed_fields(), vec![0, 1]);
    }

    #[test]
    fn clean_flag_roundtrips_false() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.meta");

        sample().write_meta(&path, false).unwrap();
        let (_, clean) = Catalog::read_meta(&path).unwrap();

        assert!(!clean);
    }

    #[test]
    fn truncated_meta_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.meta");
        sample().write_meta(&path, true).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let err = Catalog::read_meta(&path).unwrap_err();
        assert!(err.to_string().contains("corrupt structure"));
    }
}
