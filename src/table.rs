//! # Table
//!
//! A named, fixed-schema collection of records plus its indexes. Records
//! live in fixed-size slots on a chain of Record pages in the table's
//! `.tbd` file; every indexed field has a B-tree in the sibling `.idx`
//! file, maintained in the same logical operation as the record write.
//!
//! ## Slots, Tombstones, and Handles
//!
//! ```text
//! Record page:  [header][slot 0][slot 1]...[slot k]
//! Slot:         [flags u8][rsvd u8][generation u16][body]
//! ```
//!
//! Deleting a record tombstones its slot (flags cleared) and pushes it onto
//! the table's free-slot chain, threaded through the first 8 body bytes of
//! each tombstone. Insertion pops the chain before appending; a reused slot
//! bumps its generation, which is what invalidates stale handles.
//!
//! Live and total slot counters are kept in the table meta block and back
//! the wasted-space report: `total - live` tombstoned slots are the
//! compaction potential the maintenance view shows.
//!
//! ## Compaction
//!
//! `compact` rewrites the record area without tombstones and returns an
//! old-handle → new-handle remap. Handles are reassigned, so the supported
//! entry point is `Database::defragment`, which compacts every table, then
//! patches Ref fields through the remaps, then rebuilds indexes. Calling
//! `compact` directly is for tables nothing references.
//!
//! ## Concurrency
//!
//! Not thread-safe; the caller serializes. `scan` cursors capture the
//! record-page list at creation and hold no borrow, so one can be held open
//! across interleaved reads and writes (and across `rebuild_indexes`,
//! which never touches the record area); records inserted after cursor
//! creation may or may not be observed.

use std::path::Path;
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::btree::key::{encode_value, entry_bytes};
use crate::catalog::TableDef;
use crate::config::{
    StoreConfig, MAX_INDEX_ENTRY, PAGE_HEADER_SIZE, TABLE_META_OFFSET, TABLE_META_SIZE,
};
use crate::handle::RecordHandle;
use crate::index::IndexSet;
use crate::records::{self, Record, TableSchema, SLOT_HEADER_SIZE, SLOT_LIVE};
use crate::storage::{PageHeader, PageStore, PageType, TableMeta, Wal, FILE_KIND_TABLE};

/// Live vs. total slot counts, the wasted-space report consumed by the
/// maintenance view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordsCounts {
    pub normal_record_count: u64,
    pub total_record_count: u64,
}

pub struct Table {
    name: String,
    table_id: u64,
    schema: TableSchema,
    data: PageStore,
    indexes: IndexSet,
}

fn slot_offset(slot: u16, slot_size: usize) -> usize {
    PAGE_HEADER_SIZE + slot as usize * slot_size
}

fn pack_slot(page: u32, slot: u16) -> u64 {
    ((page as u64) << 16) | slot as u64
}

pub fn data_file_id(table_id: u64) -> u32 {
    (table_id as u32) * 2
}

pub fn index_file_id(table_id: u64) -> u32 {
    (table_id as u32) * 2 + 1
}

pub fn data_path(dir: &Path, name: &str) -> std::path::PathBuf {
    dir.join("tables").join(format!("{}.tbd", name))
}

pub fn index_path(dir: &Path, name: &str) -> std::path::PathBuf {
    dir.join("tables").join(format!("{}.idx", name))
}

impl Table {
    pub fn create(
        dir: &Path,
        def: &TableDef,
        config: &StoreConfig,
        wal: Option<Arc<Mutex<Wal>>>,
    ) -> Result<Self> {
        ensure!(
            def.table_id <= (u32::MAX / 2) as u64,
            "table id {} out of range",
            def.table_id
        );

        let mut data = PageStore::create(
            &data_path(dir, &def.name),
            data_file_id(def.table_id),
            FILE_KIND_TABLE,
            config,
            wal.clone(),
        )?;

        let meta = TableMeta::new(def.schema.slot_size() as u32);
        let page0 = data.page_mut(0)?;
        page0[TABLE_META_OFFSET..TABLE_META_OFFSET + TABLE_META_SIZE]
            .copy_from_slice(zerocopy::IntoBytes::as_bytes(&meta));

        let indexes = IndexSet::create(
            &index_path(dir, &def.name),
            index_file_id(def.table_id),
            &def.schema,
            config,
            wal,
        )?;

        Ok(Self {
            name: def.name.clone(),
            table_id: def.table_id,
            schema: def.schema.clone(),
            data,
            indexes,
        })
    }

    pub fn open(
        dir: &Path,
        def: &TableDef,
        config: &StoreConfig,
        wal: Option<Arc<Mutex<Wal>>>,
    ) -> Result<Self> {
        let mut data = PageStore::open(
            &data_path(dir, &def.name),
            data_file_id(def.table_id),
            FILE_KIND_TABLE,
            config,
            wal.clone(),
        )?;

        {
            let page0 = data.page(0)?;
            let meta = TableMeta::from_bytes(&page0[TABLE_META_OFFSET..])?;
            ensure!(
                meta.slot_size() as usize == def.schema.slot_size(),
                "corrupt structure: table '{}' slot size {} does not match schema ({})",
                def.name,
                meta.slot_size(),
                def.schema.slot_size()
            );
        }

        let indexes = IndexSet::open(
            &index_path(dir, &def.name),
            index_file_id(def.table_id),
            config,
            wal,
        )?;

        Ok(Self {
            name: def.name.clone(),
            table_id: def.table_id,
            schema: def.schema.clone(),
            data,
            indexes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_id(&self) -> u64 {
        self.table_id
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Insert a record, updating every declared index. Schema violations
    /// are rejected before any page is touched.
    pub fn insert(&mut self, record: &Record) -> Result<RecordHandle> {
        self.validate(record)?;
        let index_keys = self.index_keys(record)?;

        let body = {
            let (schema, data) = (&self.schema, &mut self.data);
            records::encode_body(schema, record, data)?
        };
        let (page, slot, generation) = self.alloc_slot()?;
        self.write_slot(page, slot, generation, &body)?;
        self.with_meta(|m| m.set_live_records(m.live_records() + 1))?;

        let handle = RecordHandle::new(page, slot, generation);
        for (field_no, key) in index_keys {
            if let Some(key) = key {
                self.indexes.insert(field_no, &entry_bytes(&key, handle))?;
            }
        }
        Ok(handle)
    }

    /// Update a record in place. Indexes are touched only for fields whose
    /// value actually changed.
    pub fn update(&mut self, handle: RecordHandle, record: &Record) -> Result<()> {
        self.validate(record)?;
        let new_keys = self.index_keys(record)?;

        let Some(old_body) = self.read_live_body(handle)? else {
            bail!("no live record at handle {} in table '{}'", handle, self.name);
        };
        let old = {
            let (schema, data) = (&self.schema, &mut self.data);
            records::decode_body(schema, data, &old_body)?
        };

        let (new_body, changed) = {
            let (schema, data) = (&self.schema, &mut self.data);
            records::encode_update(schema, &old_body, &old, record, data)?
        };
        self.write_slot(handle.page(), handle.slot(), handle.generation(), &new_body)?;

        for field_no in changed {
            if !self.schema.fields()[field_no as usize].indexed {
                continue;
            }
            if let Some(old_key) = encode_value(&old.values()[field_no as usize]) {
                self.indexes
                    .remove(field_no, &entry_bytes(&old_key, handle))?;
            }
            if let Some((_, Some(new_key))) = new_keys.iter().find(|(f, _)| *f == field_no) {
                self.indexes
                    .insert(field_no, &entry_bytes(new_key, handle))?;
            }
        }
        Ok(())
    }

    /// Tombstone a record: free its out-of-line chains, remove its index
    /// entries, and push the slot onto the free-slot chain. Returns `false`
    /// if the handle does not name a live record.
    pub fn delete(&mut self, handle: RecordHandle) -> Result<bool> {
        let Some(body) = self.read_live_body(handle)? else {
            return Ok(false);
        };

        // index keys per field; a field whose chain is unreadable is
        // skipped, leaving a dangling entry for the consistency checker
        let mut keys = Vec::new();
        for field_no in self.schema.indexed_fields() {
            let value = {
                let (schema, data) = (&self.schema, &mut self.data);
                records::decode_field(schema, field_no as usize, data, &body)
            };
            if let Ok(value) = value {
                if let Some(key) = encode_value(&value) {
                    keys.push((field_no, key));
                }
            }
        }

        {
            let (schema, data) = (&self.schema, &mut self.data);
            records::free_out_of_line(schema, &body, data, true)?;
        }

        let old_head = self.meta()?.free_slot();
        let slot_size = self.schema.slot_size();
        {
            let data = self.data.page_mut(handle.page())?;
            let off = slot_offset(handle.slot(), slot_size);
            data[off] &= !SLOT_LIVE;
            data[off + SLOT_HEADER_SIZE..off + SLOT_HEADER_SIZE + 8]
                .copy_from_slice(&old_head.to_le_bytes());
        }
        self.with_meta(|m| {
            m.set_free_slot(pack_slot(handle.page(), handle.slot()));
            m.set_live_records(m.live_records() - 1);
        })?;

        for (field_no, key) in keys {
            self.indexes.remove(field_no, &entry_bytes(&key, handle))?;
        }
        Ok(true)
    }

    /// Fetch a record by handle. `None` for tombstoned, stale-generation,
    /// or out-of-range handles.
    pub fn get(&mut self, handle: RecordHandle) -> Result<Option<Record>> {
        match self.read_live_body(handle)? {
            None => Ok(None),
            Some(body) => {
                let (schema, data) = (&self.schema, &mut self.data);
                Ok(Some(records::decode_body(schema, data, &body)?))
            }
        }
    }

    /// Handles indexed under the given field value, in handle order.
    pub fn find(&mut self, field: &str, value: &crate::records::Value) -> Result<Vec<RecordHandle>> {
        let field_no = self
            .schema
            .field_index(field)
            .ok_or_else(|| eyre::eyre!("table '{}' has no field '{}'", self.name, field))?;
        let Some(key) = encode_value(value) else {
            return Ok(Vec::new());
        };
        self.indexes.find(field_no as u16, &key)
    }

    /// Restartable cursor over the record pages as of this call.
    pub fn scan(&mut self) -> Result<TableScan> {
        Ok(TableScan {
            pages: self.record_pages()?,
            page_idx: 0,
            slot: 0,
        })
    }

    /// Handles of every live record, without decoding bodies.
    pub fn live_handles(&mut self) -> Result<Vec<RecordHandle>> {
        let slot_size = self.schema.slot_size();
        let mut handles = Vec::new();
        for page in self.record_pages()? {
            let data = self.data.page(page)?;
            let count = PageHeader::from_bytes(data)?.entry_count();
            for slot in 0..count {
                let off = slot_offset(slot, slot_size);
                if data[off] & SLOT_LIVE != 0 {
                    let generation =
                        u16::from_le_bytes(data[off + 2..off + 4].try_into()?);
                    handles.push(RecordHandle::new(page, slot, generation));
                }
            }
        }
        Ok(handles)
    }

    /// Live vs. total slot counts from the table meta block.
    pub fn wasted_space(&mut self) -> Result<RecordsCounts> {
        let meta = self.meta()?;
        Ok(RecordsCounts {
            normal_record_count: meta.live_records(),
            total_record_count: meta.total_slots(),
        })
    }

    /// Drop and recreate every index from a full record scan. Repairs drift
    /// between records and indexes; requires exclusive access.
    pub fn rebuild_indexes(&mut self) -> Result<()> {
        for field_no in self.schema.indexed_fields() {
            self.indexes.clear(field_no)?;
        }

        let slot_size = self.schema.slot_size();
        let body_size = self.schema.body_size();
        for page in self.record_pages()? {
            let count = PageHeader::from_bytes(self.data.page(page)?)?.entry_count();
            for slot in 0..count {
                let (live, generation, body) = {
                    let data = self.data.page(page)?;
                    let off = slot_offset(slot, slot_size);
                    (
                        data[off] & SLOT_LIVE != 0,
                        u16::from_le_bytes(data[off + 2..off + 4].try_into()?),
                        data[off + SLOT_HEADER_SIZE..off + SLOT_HEADER_SIZE + body_size].to_vec(),
                    )
                };
                if !live {
                    continue;
                }
                let handle = RecordHandle::new(page, slot, generation);
                for field_no in self.schema.indexed_fields() {
                    let value = {
                        let (schema, data) = (&self.schema, &mut self.data);
                        records::decode_field(schema, field_no as usize, data, &body)
                            .wrap_err_with(|| {
                                format!("rebuild of table '{}' failed at {}", self.name, handle)
                            })?
                    };
                    if let Some(key) = encode_value(&value) {
                        self.indexes.insert(field_no, &entry_bytes(&key, handle))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Rewrite the record area without tombstones, reassigning handles.
    /// Returns the old → new handle remap; indexes are left stale and must
    /// be rebuilt after the caller patches references. Every handle issued
    /// before the compaction is invalidated — slots are renumbered while
    /// generations carry over, so a stale handle may alias a relocated
    /// record and holders must re-resolve through an index. Requires
    /// exclusive access; the supported driver is `Database::defragment`.
    pub fn compact(&mut self) -> Result<HashMap<u64, u64>> {
        let slot_size = self.schema.slot_size();
        let body_size = self.schema.body_size();
        let pages = self.record_pages()?;

        let mut survivors = Vec::new();
        for &page in &pages {
            let count = PageHeader::from_bytes(self.data.page(page)?)?.entry_count();
            for slot in 0..count {
                let data = self.data.page(page)?;
                let off = slot_offset(slot, slot_size);
                if data[off] & SLOT_LIVE == 0 {
                    continue;
                }
                let generation = u16::from_le_bytes(data[off + 2..off + 4].try_into()?);
                let body =
                    data[off + SLOT_HEADER_SIZE..off + SLOT_HEADER_SIZE + body_size].to_vec();
                survivors.push((RecordHandle::new(page, slot, generation), generation, body));
            }
        }

        for page in pages {
            self.data.free(page)?;
        }
        self.with_meta(|m| {
            m.set_record_head(0);
            m.set_record_tail(0);
            m.set_free_slot(0);
            m.set_live_records(0);
            m.set_total_slots(0);
        })?;

        let mut remap = HashMap::new();
        for (old_handle, generation, body) in survivors {
            let (page, slot, _) = self.alloc_slot()?;
            self.write_slot(page, slot, generation, &body)?;
            self.with_meta(|m| m.set_live_records(m.live_records() + 1))?;
            remap.insert(
                old_handle.as_u64(),
                RecordHandle::new(page, slot, generation).as_u64(),
            );
        }
        Ok(remap)
    }

    /// Rewrite one Ref field through a handle remap. Used by database
    /// defragmentation after the target table compacted.
    pub(crate) fn patch_refs(
        &mut self,
        field_no: u16,
        remap: &HashMap<u64, u64>,
    ) -> Result<usize> {
        let slot_size = self.schema.slot_size();
        let field_offset = self.schema.offset(field_no as usize);
        let bitmap_byte = field_no as usize / 8;
        let bitmap_bit = 1u8 << (field_no as usize % 8);

        let mut patched = 0usize;
        for page in self.record_pages()? {
            let count = PageHeader::from_bytes(self.data.page(page)?)?.entry_count();
            for slot in 0..count {
                let off = slot_offset(slot, slot_size);
                let (live, is_null, raw) = {
                    let data = self.data.page(page)?;
                    let body = &data[off + SLOT_HEADER_SIZE..];
                    (
                        data[off] & SLOT_LIVE != 0,
                        body[bitmap_byte] & bitmap_bit != 0,
                        u64::from_le_bytes(
                            body[field_offset..field_offset + 8].try_into()?,
                        ),
                    )
                };
                if !live || is_null {
                    continue;
                }
                if let Some(&new_raw) = remap.get(&raw) {
                    let data = self.data.page_mut(page)?;
                    let body_off = off + SLOT_HEADER_SIZE;
                    data[body_off + field_offset..body_off + field_offset + 8]
                        .copy_from_slice(&new_raw.to_le_bytes());
                    patched += 1;
                }
            }
        }
        Ok(patched)
    }

    /// Overwrite the persisted slot counters. Repair-only.
    pub(crate) fn reset_counts(&mut self, live: u64, total: u64) -> Result<()> {
        self.with_meta(|m| {
            m.set_live_records(live);
            m.set_total_slots(total);
        })
    }

    /// Raw slot body of a live record, for the consistency checker.
    pub(crate) fn read_live_body(&mut self, handle: RecordHandle) -> Result<Option<Vec<u8>>> {
        if handle.is_null() || handle.page() == 0 || handle.page() >= self.data.page_count() {
            return Ok(None);
        }
        let slot_size = self.schema.slot_size();
        let body_size = self.schema.body_size();

        let data = self.data.page(handle.page())?;
        let header = PageHeader::from_bytes(data)?;
        if header.page_type() != PageType::Record
            || handle.slot() >= header.entry_count()
        {
            return Ok(None);
        }
        let off = slot_offset(handle.slot(), slot_size);
        if data[off] & SLOT_LIVE == 0 {
            return Ok(None);
        }
        let generation = u16::from_le_bytes(data[off + 2..off + 4].try_into()?);
        if generation != handle.generation() {
            return Ok(None);
        }
        Ok(Some(
            data[off + SLOT_HEADER_SIZE..off + SLOT_HEADER_SIZE + body_size].to_vec(),
        ))
    }

    pub fn indexes_mut(&mut self) -> &mut IndexSet {
        &mut self.indexes
    }

    /// Page and free-list counts of the data file, for diagnostics.
    pub fn data_stats(&self) -> (u32, u32) {
        (self.data.page_count(), self.data.free_count())
    }

    pub(crate) fn data_mut(&mut self) -> &mut PageStore {
        &mut self.data
    }

    pub fn flush(&mut self) -> Result<()> {
        self.data.flush()?;
        self.indexes.flush()
    }

    pub(crate) fn record_pages(&mut self) -> Result<Vec<u32>> {
        let mut pages = Vec::new();
        let mut page = self.meta()?.record_head();
        while page != 0 {
            ensure!(
                pages.len() <= self.data.page_count() as usize,
                "corrupt structure: record page chain of table '{}' contains a cycle",
                self.name
            );
            let data = self.data.page(page)?;
            let header = PageHeader::from_bytes(data)?;
            ensure!(
                header.page_type() == PageType::Record,
                "corrupt structure: page {} in record chain of table '{}' is a {:?} page",
                page,
                self.name,
                header.page_type()
            );
            pages.push(page);
            page = header.next_page();
        }
        Ok(pages)
    }

    fn validate(&self, record: &Record) -> Result<()> {
        ensure!(
            record.field_count() == self.schema.field_count(),
            "record has {} fields, table '{}' declares {}",
            record.field_count(),
            self.name,
            self.schema.field_count()
        );
        for (field, value) in self.schema.fields().iter().zip(record.values()) {
            ensure!(
                value.matches(field.field_type),
                "field '{}' of table '{}' expects {:?}, got {:?}",
                field.name,
                self.name,
                field.field_type,
                value
            );
            ensure!(
                !(field.required && value.is_null()),
                "required field '{}' of table '{}' is null",
                field.name,
                self.name
            );
        }
        Ok(())
    }

    fn index_keys(&self, record: &Record) -> Result<Vec<(u16, Option<Vec<u8>>)>> {
        let mut keys = Vec::new();
        for field_no in self.schema.indexed_fields() {
            let key = encode_value(&record.values()[field_no as usize]);
            if let Some(key) = &key {
                ensure!(
                    key.len() + 8 <= MAX_INDEX_ENTRY,
                    "indexed field '{}' of table '{}' is too large to index ({} bytes)",
                    self.schema.fields()[field_no as usize].name,
                    self.name,
                    key.len()
                );
            }
            keys.push((field_no, key));
        }
        Ok(keys)
    }

    fn meta(&mut self) -> Result<TableMeta> {
        let page0 = self.data.page(0)?;
        Ok(*TableMeta::from_bytes(&page0[TABLE_META_OFFSET..])?)
    }

    fn with_meta(&mut self, f: impl FnOnce(&mut TableMeta)) -> Result<()> {
        let page0 = self.data.page_mut(0)?;
        let meta =
            TableMeta::from_bytes_mut(&mut page0[TABLE_META_OFFSET..TABLE_META_OFFSET + TABLE_META_SIZE])?;
        f(meta);
        Ok(())
    }

    /// Claim a slot: pop the free-slot chain (bumping the generation) or
    /// append to the tail page, growing the chain if needed.
    fn alloc_slot(&mut self) -> Result<(u32, u16, u16)> {
        let meta = self.meta()?;
        let slot_size = self.schema.slot_size();

        let packed = meta.free_slot();
        if packed != 0 {
            let page = (packed >> 16) as u32;
            let slot = packed as u16;
            let (flags, old_generation, next) = {
                let data = self.data.page(page)?;
                let off = slot_offset(slot, slot_size);
                (
                    data[off],
                    u16::from_le_bytes(data[off + 2..off + 4].try_into()?),
                    u64::from_le_bytes(
                        data[off + SLOT_HEADER_SIZE..off + SLOT_HEADER_SIZE + 8].try_into()?,
                    ),
                )
            };
            ensure!(
                flags & SLOT_LIVE == 0,
                "corrupt structure: free-slot chain of table '{}' points at a live slot",
                self.name
            );
            self.with_meta(|m| m.set_free_slot(next))?;
            return Ok((page, slot, old_generation.wrapping_add(1)));
        }

        let tail = meta.record_tail();
        if tail != 0 {
            let count = PageHeader::from_bytes(self.data.page(tail)?)?.entry_count();
            if (count as usize) < self.schema.slots_per_page() {
                let data = self.data.page_mut(tail)?;
                PageHeader::from_bytes_mut(data)?.set_entry_count(count + 1);
                self.with_meta(|m| m.set_total_slots(m.total_slots() + 1))?;
                return Ok((tail, count, 0));
            }
        }

        let page = self.data.allocate(PageType::Record)?;
        {
            let data = self.data.page_mut(page)?;
            PageHeader::from_bytes_mut(data)?.set_entry_count(1);
        }
        if tail != 0 {
            let data = self.data.page_mut(tail)?;
            PageHeader::from_bytes_mut(data)?.set_next_page(page);
        }
        self.with_meta(|m| {
            if m.record_head() == 0 {
                m.set_record_head(page);
            }
            m.set_record_tail(page);
            m.set_total_slots(m.total_slots() + 1);
        })?;
        Ok((page, 0, 0))
    }

    fn write_slot(&mut self, page: u32, slot: u16, generation: u16, body: &[u8]) -> Result<()> {
        let slot_size = self.schema.slot_size();
        ensure!(
            body.len() + SLOT_HEADER_SIZE == slot_size,
            "slot body of {} bytes does not match slot size {}",
            body.len(),
            slot_size
        );
        let data = self.data.page_mut(page)?;
        let off = slot_offset(slot, slot_size);
        data[off] = SLOT_LIVE;
        data[off + 1] = 0;
        data[off + 2..off + 4].copy_from_slice(&generation.to_le_bytes());
        data[off + SLOT_HEADER_SIZE..off + SLOT_HEADER_SIZE + body.len()].copy_from_slice(body);
        Ok(())
    }
}

/// Cursor over a table's records. Owns the page list captured at creation;
/// step it with [`next`](TableScan::next), passing the table back in.
pub struct TableScan {
    pages: Vec<u32>,
    page_idx: usize,
    slot: u16,
}

impl TableScan {
    pub fn next(&mut self, table: &mut Table) -> Result<Option<(RecordHandle, Record)>> {
        let slot_size = table.schema.slot_size();
        let body_size = table.schema.body_size();
        loop {
            let Some(&page) = self.pages.get(self.page_idx) else {
                return Ok(None);
            };

            let (live, generation, body) = {
                let data = table.data.page(page)?;
                let count = PageHeader::from_bytes(data)?.entry_count();
                if self.slot >= count {
                    self.page_idx += 1;
                    self.slot = 0;
                    continue;
                }
                let off = slot_offset(self.slot, slot_size);
                (
                    data[off] & SLOT_LIVE != 0,
                    u16::from_le_bytes(data[off + 2..off + 4].try_into()?),
                    data[off + SLOT_HEADER_SIZE..off + SLOT_HEADER_SIZE + body_size].to_vec(),
                )
            };
            let slot = self.slot;
            self.slot += 1;
            if !live {
                continue;
            }

            let record = {
                let (schema, data) = (&table.schema, &mut table.data);
                records::decode_body(schema, data, &body)?
            };
            return Ok(Some((RecordHandle::new(page, slot, generation), record)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::records::{FieldDef, FieldType, Value};
    use tempfile::tempdir;

    fn test_def() -> TableDef {
        let mut catalog = Catalog::new("test").unwrap();
        catalog
            .add_table(
                "Items",
                vec![
                    FieldDef::new("Id", FieldType::Int).required().indexed(),
                    FieldDef::new("Name", FieldType::Str).indexed(),
                    FieldDef::new("Payload", FieldType::Blob),
                ],
            )
            .unwrap();
        catalog.tables()[0].clone()
    }

    fn open_table(dir: &Path) -> Table {
        std::fs::create_dir_all(dir.join("tables")).unwrap();
        let config = StoreConfig {
            cache_pages: 16,
            ..StoreConfig::default()
        };
        Table::create(dir, &test_def(), &config, None).unwrap()
    }

    fn item(id: i64, name: &str) -> Record {
        Record::new(vec![
            Value::Int(id),
            Value::Str(name.to_string()),
            Value::Null,
        ])
    }

    #[test]
    fn insert_get_roundtrip() {
        let dir = tempdir().unwrap();
        let mut table = open_table(dir.path());
        let record = item(1, "first");

        let handle = table.insert(&record).unwrap();

        assert_eq!(table.get(handle).unwrap(), Some(record));
    }

    #[test]
    fn schema_violations_rejected_before_mutation() {
        let dir = tempdir().unwrap();
        let mut table = open_table(dir.path());

        // wrong arity
        assert!(table.insert(&Record::new(vec![Value::Int(1)])).is_err());
        // wrong type
        assert!(table
            .insert(&Record::new(vec![
                Value::Str("x".into()),
                Value::Null,
                Value::Null
            ]))
            .is_err());
        // required null
        assert!(table
            .insert(&Record::new(vec![Value::Null, Value::Null, Value::Null]))
            .is_err());

        assert_eq!(table.wasted_space().unwrap().total_record_count, 0);
    }

    #[test]
    fn find_uses_index() {
        let dir = tempdir().unwrap();
        let mut table = open_table(dir.path());
        let mut handles = Vec::new();
        for id in 0..50 {
            handles.push(table.insert(&item(id, &format!("n{}", id))).unwrap());
        }

        let found = table.find("Id", &Value::Int(25)).unwrap();

        assert_eq!(found, vec![handles[25]]);
        assert!(table.find("Id", &Value::Int(999)).unwrap().is_empty());
    }

    #[test]
    fn duplicate_indexed_values_find_both() {
        let dir = tempdir().unwrap();
        let mut table = open_table(dir.path());
        let h1 = table.insert(&item(7, "dup")).unwrap();
        let h2 = table.insert(&item(8, "dup")).unwrap();

        let found = table.find("Name", &Value::Str("dup".into())).unwrap();

        assert_eq!(found.len(), 2);
        assert!(found.contains(&h1) && found.contains(&h2));
    }

    #[test]
    fn delete_removes_record_and_index_entries() {
        let dir = tempdir().unwrap();
        let mut table = open_table(dir.path());
        let handle = table.insert(&item(5, "gone")).unwrap();

        assert!(table.delete(handle).unwrap());

        assert_eq!(table.get(handle).unwrap(), None);
        assert!(table.find("Id", &Value::Int(5)).unwrap().is_empty());
        assert!(table.find("Name", &Value::Str("gone".into())).unwrap().is_empty());
        assert!(!table.delete(handle).unwrap());
    }

    #[test]
    fn stale_handle_rejected_after_slot_reuse() {
        let dir = tempdir().unwrap();
        let mut table = open_table(dir.path());
        let old = table.insert(&item(1, "old")).unwrap();
        table.delete(old).unwrap();

        let new = table.insert(&item(2, "new")).unwrap();

        // same physical slot, new generation
        assert_eq!((new.page(), new.slot()), (old.page(), old.slot()));
        assert_ne!(new.generation(), old.generation());
        assert_eq!(table.get(old).unwrap(), None);
        assert_eq!(
            table.get(new).unwrap().unwrap().get(0),
            Some(&Value::Int(2))
        );
    }

    #[test]
    fn update_in_place_maintains_changed_indexes_only() {
        let dir = tempdir().unwrap();
        let mut table = open_table(dir.path());
        let handle = table.insert(&item(3, "before")).unwrap();

        table.update(handle, &item(3, "after")).unwrap();

        assert!(table.find("Name", &Value::Str("before".into())).unwrap().is_empty());
        assert_eq!(
            table.find("Name", &Value::Str("after".into())).unwrap(),
            vec![handle]
        );
        assert_eq!(table.find("Id", &Value::Int(3)).unwrap(), vec![handle]);
    }

    #[test]
    fn update_of_missing_record_fails() {
        let dir = tempdir().unwrap();
        let mut table = open_table(dir.path());
        let handle = table.insert(&item(1, "x")).unwrap();
        table.delete(handle).unwrap();

        assert!(table.update(handle, &item(1, "y")).is_err());
    }

    #[test]
    fn scan_visits_every_live_record_once() {
        let dir = tempdir().unwrap();
        let mut table = open_table(dir.path());
        for id in 0..300 {
            table.insert(&item(id, "r")).unwrap();
        }

        let mut scan = table.scan().unwrap();
        let mut ids = Vec::new();
        while let Some((_, record)) = scan.next(&mut table).unwrap() {
            ids.push(record.get(0).unwrap().as_int().unwrap());
        }
        ids.sort_unstable();

        assert_eq!(ids, (0..300).collect::<Vec<_>>());
    }

    #[test]
    fn wasted_space_counts_tombstones() {
        let dir = tempdir().unwrap();
        let mut table = open_table(dir.path());
        let mut handles = Vec::new();
        for id in 0..100 {
            handles.push(table.insert(&item(id, "w")).unwrap());
        }
        for handle in handles.iter().step_by(2) {
            table.delete(*handle).unwrap();
        }

        let counts = table.wasted_space().unwrap();

        assert_eq!(counts.normal_record_count, 50);
        assert_eq!(counts.total_record_count, 100);
    }

    #[test]
    fn compact_reclaims_tombstones_and_remaps() {
        let dir = tempdir().unwrap();
        let mut table = open_table(dir.path());
        let mut handles = Vec::new();
        for id in 0..100 {
            handles.push(table.insert(&item(id, "c")).unwrap());
        }
        for handle in handles.iter().step_by(2) {
            table.delete(*handle).unwrap();
        }

        let remap = table.compact().unwrap();
        table.rebuild_indexes().unwrap();

        let counts = table.wasted_space().unwrap();
        assert_eq!(counts.normal_record_count, 50);
        assert_eq!(counts.total_record_count, 50);
        assert_eq!(remap.len(), 50);

        // every odd id survives and is reachable through its new handle
        for (i, old) in handles.iter().enumerate() {
            if i % 2 == 1 {
                let new = RecordHandle::from_u64(remap[&old.as_u64()]);
                let record = table.get(new).unwrap().unwrap();
                assert_eq!(record.get(0).unwrap().as_int().unwrap(), i as i64);
                assert_eq!(table.find("Id", &Value::Int(i as i64)).unwrap(), vec![new]);
            }
        }
    }

    #[test]
    fn rebuild_indexes_restores_dropped_entry() {
        let dir = tempdir().unwrap();
        let mut table = open_table(dir.path());
        let handle = table.insert(&item(11, "fix")).unwrap();

        // sabotage: remove the index entry directly
        let key = encode_value(&Value::Int(11)).unwrap();
        table
            .indexes_mut()
            .remove(0, &entry_bytes(&key, handle))
            .unwrap();
        assert!(table.find("Id", &Value::Int(11)).unwrap().is_empty());

        table.rebuild_indexes().unwrap();

        assert_eq!(table.find("Id", &Value::Int(11)).unwrap(), vec![handle]);
    }

    #[test]
    fn blob_fields_roundtrip_through_table() {
        let dir = tempdir().unwrap();
        let mut table = open_table(dir.path());
        let payload = vec![0x42u8; 20_000];
        let record = Record::new(vec![
            Value::Int(1),
            Value::Str("big".into()),
            Value::Blob(payload.clone()),
        ]);

        let handle = table.insert(&record).unwrap();
        let loaded = table.get(handle).unwrap().unwrap();

        assert_eq!(loaded.get(2).unwrap().as_blob().unwrap(), &payload[..]);

        // deleting reclaims the chain pages
        let free_before = table.data.free_count();
        table.delete(handle).unwrap();
        assert!(table.data.free_count() > free_before);
    }

    #[test]
    fn oversized_index_key_rejected() {
        let dir = tempdir().unwrap();
        let mut table = open_table(dir.path());
        let record = item(1, &"k".repeat(MAX_INDEX_ENTRY));

        assert!(table.insert(&record).is_err());
        assert_eq!(table.wasted_space().unwrap().total_record_count, 0);
    }

    #[test]
    fn counts_persist_across_reopen() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            cache_pages: 16,
            ..StoreConfig::default()
        };
        let def = test_def();
        std::fs::create_dir_all(dir.path().join("tables")).unwrap();

        {
            let mut table = Table::create(dir.path(), &def, &config, None).unwrap();
            for id in 0..20 {
                table.insert(&item(id, "p")).unwrap();
            }
            table.flush().unwrap();
        }

        let mut table = Table::open(dir.path(), &def, &config, None).unwrap();
        let counts = table.wasted_space().unwrap();
        assert_eq!(counts.normal_record_count, 20);
        assert_eq!(
            table.find("Id", &Value::Int(13)).unwrap().len(),
            1
        );
    }
}
