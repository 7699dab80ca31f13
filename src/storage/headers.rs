//! # File Header Definitions
//!
//! Type-safe, zerocopy-based headers for the engine's on-disk files. Every
//! paged file (table data `.tbd`, index `.idx`) starts with the same 64-byte
//! `StoreFileHeader`; the rest of page 0 holds a per-kind metadata block.
//! The catalog file `<schema>.meta` is not paged and carries its own
//! 128-byte `MetaFileHeader` followed by the serialized catalog.
//!
//! ## Page 0 Layout
//!
//! ```text
//! .tbd                           .idx
//! +--------------------+ 0      +--------------------+ 0
//! | StoreFileHeader    |        | StoreFileHeader    |
//! +--------------------+ 64     +--------------------+ 64
//! | TableMeta (64 B)   |        | IndexMeta (8 B)    |
//! +--------------------+ 128    +--------------------+ 72
//! | unused             |        | IndexDirEntry[...] |
//! +--------------------+ 4096   +--------------------+ 4096
//! ```
//!
//! All multi-byte fields are little-endian via the zerocopy `U16`/`U32`/`U64`
//! wrappers, and every struct is `Unaligned` so it can be read in place from
//! any page buffer. Sizes are pinned by compile-time assertions.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{FILE_HEADER_SIZE, PAGE_SIZE, TABLE_META_SIZE};

pub const FILE_MAGIC: &[u8; 16] = b"MyPal Store v1\0\0";
pub const META_MAGIC: &[u8; 16] = b"MyPal Meta v1\0\0\0";

pub const CURRENT_VERSION: u32 = 1;

pub const FILE_KIND_TABLE: u8 = 1;
pub const FILE_KIND_INDEX: u8 = 2;

/// Common header at the start of every paged file. Owns the free-list state
/// and the allocated page count.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct StoreFileHeader {
    magic: [u8; 16],
    version: U32,
    page_size: U32,
    file_id: U32,
    page_count: U32,
    free_head: U32,
    free_count: U32,
    kind: u8,
    reserved: [u8; 23],
}

const _: () = assert!(size_of::<StoreFileHeader>() == FILE_HEADER_SIZE);

impl StoreFileHeader {
    pub fn new(file_id: u32, kind: u8) -> Self {
        Self {
            magic: *FILE_MAGIC,
            version: U32::new(CURRENT_VERSION),
            page_size: U32::new(PAGE_SIZE as u32),
            file_id: U32::new(file_id),
            page_count: U32::new(1),
            free_head: U32::new(0),
            free_count: U32::new(0),
            kind,
            reserved: [0; 23],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for StoreFileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse StoreFileHeader: {:?}", e))?;

        ensure!(&header.magic == FILE_MAGIC, "invalid magic bytes in store file");
        ensure!(
            header.version.get() == CURRENT_VERSION,
            "unsupported store file version: {} (expected {})",
            header.version.get(),
            CURRENT_VERSION
        );
        ensure!(
            header.page_size.get() == PAGE_SIZE as u32,
            "store file page size {} does not match engine page size {}",
            header.page_size.get(),
            PAGE_SIZE
        );

        Ok(header)
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for StoreFileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::mut_from_bytes(&mut bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse StoreFileHeader: {:?}", e))?;

        ensure!(&header.magic == FILE_MAGIC, "invalid magic bytes in store file");

        Ok(header)
    }

    pub fn file_id(&self) -> u32 {
        self.file_id.get()
    }

    pub fn kind(&self) -> u8 {
        self.kind
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.get()
    }

    pub fn set_page_count(&mut self, count: u32) {
        self.page_count = U32::new(count);
    }

    pub fn free_head(&self) -> u32 {
        self.free_head.get()
    }

    pub fn set_free_head(&mut self, page: u32) {
        self.free_head = U32::new(page);
    }

    pub fn free_count(&self) -> u32 {
        self.free_count.get()
    }

    pub fn set_free_count(&mut self, count: u32) {
        self.free_count = U32::new(count);
    }
}

/// Table metadata block on page 0 of a `.tbd` file.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TableMeta {
    record_head: U32,
    record_tail: U32,
    free_slot: U64,
    live_records: U64,
    total_slots: U64,
    slot_size: U32,
    reserved: [u8; 28],
}

const _: () = assert!(size_of::<TableMeta>() == TABLE_META_SIZE);

impl TableMeta {
    pub fn new(slot_size: u32) -> Self {
        Self {
            record_head: U32::new(0),
            record_tail: U32::new(0),
            free_slot: U64::new(0),
            live_records: U64::new(0),
            total_slots: U64::new(0),
            slot_size: U32::new(slot_size),
            reserved: [0; 28],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= TABLE_META_SIZE,
            "buffer too small for TableMeta: {} < {}",
            bytes.len(),
            TABLE_META_SIZE
        );

        Self::ref_from_bytes(&bytes[..TABLE_META_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse TableMeta: {:?}", e))
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= TABLE_META_SIZE,
            "buffer too small for TableMeta: {} < {}",
            bytes.len(),
            TABLE_META_SIZE
        );

        Self::mut_from_bytes(&mut bytes[..TABLE_META_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse TableMeta: {:?}", e))
    }

    pub fn record_head(&self) -> u32 {
        self.record_head.get()
    }

    pub fn set_record_head(&mut self, page: u32) {
        self.record_head = U32::new(page);
    }

    pub fn record_tail(&self) -> u32 {
        self.record_tail.get()
    }

    pub fn set_record_tail(&mut self, page: u32) {
        self.record_tail = U32::new(page);
    }

    /// Head of the free-slot chain, packed as `(page << 16) | slot`.
    /// Zero means no reusable slot.
    pub fn free_slot(&self) -> u64 {
        self.free_slot.get()
    }

    pub fn set_free_slot(&mut self, packed: u64) {
        self.free_slot = U64::new(packed);
    }

    pub fn live_records(&self) -> u64 {
        self.live_records.get()
    }

    pub fn set_live_records(&mut self, count: u64) {
        self.live_records = U64::new(count);
    }

    pub fn total_slots(&self) -> u64 {
        self.total_slots.get()
    }

    pub fn set_total_slots(&mut self, count: u64) {
        self.total_slots = U64::new(count);
    }

    pub fn slot_size(&self) -> u32 {
        self.slot_size.get()
    }
}

/// Index metadata block on page 0 of an `.idx` file.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct IndexMeta {
    index_count: U16,
    reserved: [u8; 6],
}

const _: () = assert!(size_of::<IndexMeta>() == 8);

impl IndexMeta {
    pub fn new(index_count: u16) -> Self {
        Self {
            index_count: U16::new(index_count),
            reserved: [0; 6],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(bytes.len() >= 8, "buffer too small for IndexMeta");

        Self::ref_from_bytes(&bytes[..8])
            .map_err(|e| eyre::eyre!("failed to parse IndexMeta: {:?}", e))
    }

    pub fn index_count(&self) -> u16 {
        self.index_count.get()
    }
}

/// One entry of the index directory: which field the tree covers and where
/// its current root lives.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct IndexDirEntry {
    field_no: U16,
    reserved: U16,
    root_page: U32,
}

const _: () = assert!(size_of::<IndexDirEntry>() == 8);

impl IndexDirEntry {
    pub fn new(field_no: u16, root_page: u32) -> Self {
        Self {
            field_no: U16::new(field_no),
            reserved: U16::new(0),
            root_page: U32::new(root_page),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(bytes.len() >= 8, "buffer too small for IndexDirEntry");

        Self::ref_from_bytes(&bytes[..8])
            .map_err(|e| eyre::eyre!("failed to parse IndexDirEntry: {:?}", e))
    }

    pub fn field_no(&self) -> u16 {
        self.field_no.get()
    }

    pub fn root_page(&self) -> u32 {
        self.root_page.get()
    }
}

/// Header of the `<schema>.meta` catalog file.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MetaFileHeader {
    magic: [u8; 16],
    version: U32,
    page_size: U32,
    table_count: U32,
    clean_shutdown: U32,
    next_table_id: U64,
    catalog_len: U64,
    schema_name: [u8; 32],
    reserved: [u8; 48],
}

const _: () = assert!(size_of::<MetaFileHeader>() == 128);

pub const META_HEADER_SIZE: usize = 128;

impl MetaFileHeader {
    pub fn new(
        schema_name: &str,
        table_count: u32,
        next_table_id: u64,
        catalog_len: u64,
        clean_shutdown: bool,
    ) -> Result<Self> {
        let name_bytes = schema_name.as_bytes();
        ensure!(
            name_bytes.len() <= 32,
            "schema name '{}' exceeds 32 bytes",
            schema_name
        );
        let mut schema_name = [0u8; 32];
        schema_name[..name_bytes.len()].copy_from_slice(name_bytes);

        Ok(Self {
            magic: *META_MAGIC,
            version: U32::new(CURRENT_VERSION),
            page_size: U32::new(PAGE_SIZE as u32),
            table_count: U32::new(table_count),
            clean_shutdown: U32::new(clean_shutdown as u32),
            next_table_id: U64::new(next_table_id),
            catalog_len: U64::new(catalog_len),
            schema_name,
            reserved: [0; 48],
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= META_HEADER_SIZE,
            "buffer too small for MetaFileHeader: {} < {}",
            bytes.len(),
            META_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..META_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse MetaFileHeader: {:?}", e))?;

        ensure!(&header.magic == META_MAGIC, "invalid magic bytes in meta file");
        ensure!(
            header.version.get() == CURRENT_VERSION,
            "unsupported meta file version: {} (expected {})",
            header.version.get(),
            CURRENT_VERSION
        );

        Ok(header)
    }

    pub fn table_count(&self) -> u32 {
        self.table_count.get()
    }

    pub fn clean_shutdown(&self) -> bool {
        self.clean_shutdown.get() != 0
    }

    pub fn next_table_id(&self) -> u64 {
        self.next_table_id.get()
    }

    pub fn catalog_len(&self) -> u64 {
        self.catalog_len.get()
    }

    pub fn schema_name(&self) -> Result<&str> {
        let end = self
            .schema_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.schema_name.len());
        std::str::from_utf8(&self.schema_name[..end])
            .map_err(|e| eyre::eyre!("schema name is not valid UTF-8: {}", e))
    }
}
