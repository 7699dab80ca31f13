//! # Per-Table Index Set
//!
//! One `.idx` file per table holds a B-tree for every indexed field. Page 0
//! carries the index directory: (field number, root page) pairs. Roots move
//! when a tree splits or collapses, so every mutating operation re-persists
//! the directory if the root changed.
//!
//! Lookup by field value is a bounded range scan: entries are the encoded
//! field key suffixed with the record handle, so all handles for one value
//! sit contiguously under the shared prefix (see `btree::key`).

use std::path::Path;
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use crate::btree::key::{entry_field_key, entry_handle, entry_lower_bound};
use crate::btree::{BTree, TreeCursor};
use crate::config::{StoreConfig, INDEX_DIR_ENTRY_SIZE, INDEX_DIR_OFFSET, INDEX_META_OFFSET};
use crate::handle::RecordHandle;
use crate::records::TableSchema;
use crate::storage::{
    IndexDirEntry, IndexMeta, PageStore, Wal, FILE_KIND_INDEX,
};
use zerocopy::IntoBytes;

pub struct IndexSet {
    store: PageStore,
    dirs: Vec<(u16, u32)>,
}

impl IndexSet {
    /// Create the index file for a table, with one empty tree per indexed
    /// field of the schema.
    pub fn create(
        path: &Path,
        file_id: u32,
        schema: &TableSchema,
        config: &StoreConfig,
        wal: Option<Arc<Mutex<Wal>>>,
    ) -> Result<Self> {
        let mut store = PageStore::create(path, file_id, FILE_KIND_INDEX, config, wal)?;

        let mut dirs = Vec::new();
        for field_no in schema.indexed_fields() {
            let root = BTree::create(&mut store)?;
            dirs.push((field_no, root));
        }

        let mut set = Self { store, dirs };
        set.write_directory()?;
        Ok(set)
    }

    pub fn open(
        path: &Path,
        file_id: u32,
        config: &StoreConfig,
        wal: Option<Arc<Mutex<Wal>>>,
    ) -> Result<Self> {
        let mut store = PageStore::open(path, file_id, FILE_KIND_INDEX, config, wal)?;

        let page0 = store.page(0)?;
        let meta = IndexMeta::from_bytes(&page0[INDEX_META_OFFSET..])?;
        let count = meta.index_count() as usize;
        let mut dirs = Vec::with_capacity(count);
        for i in 0..count {
            let offset = INDEX_DIR_OFFSET + i * INDEX_DIR_ENTRY_SIZE;
            let entry = IndexDirEntry::from_bytes(&page0[offset..])?;
            dirs.push((entry.field_no(), entry.root_page()));
        }

        Ok(Self { store, dirs })
    }

    /// Indexed field numbers, in directory order.
    pub fn fields(&self) -> Vec<u16> {
        self.dirs.iter().map(|&(f, _)| f).collect()
    }

    pub fn root_of(&self, field_no: u16) -> Option<u32> {
        self.dirs.iter().find(|&&(f, _)| f == field_no).map(|&(_, r)| r)
    }

    pub fn insert(&mut self, field_no: u16, entry: &[u8]) -> Result<bool> {
        let pos = self.pos_of(field_no)?;
        let root = self.dirs[pos].1;
        let mut tree = BTree::open(&mut self.store, root);
        let inserted = tree.insert(entry)?;
        let new_root = tree.root();
        self.update_root(pos, root, new_root)?;
        Ok(inserted)
    }

    pub fn remove(&mut self, field_no: u16, entry: &[u8]) -> Result<bool> {
        let pos = self.pos_of(field_no)?;
        let root = self.dirs[pos].1;
        let mut tree = BTree::open(&mut self.store, root);
        let removed = tree.remove(entry)?;
        let new_root = tree.root();
        self.update_root(pos, root, new_root)?;
        Ok(removed)
    }

    pub fn contains(&mut self, field_no: u16, entry: &[u8]) -> Result<bool> {
        let pos = self.pos_of(field_no)?;
        let root = self.dirs[pos].1;
        BTree::open(&mut self.store, root).contains(entry)
    }

    /// All handles indexed under the exact field key, in handle order.
    pub fn find(&mut self, field_no: u16, field_key: &[u8]) -> Result<Vec<RecordHandle>> {
        let mut handles = Vec::new();
        let mut cursor = self.cursor_from(field_no, &entry_lower_bound(field_key))?;
        while let Some(entry) = cursor.next(&mut self.store)? {
            if entry_field_key(&entry)? != field_key {
                break;
            }
            handles.push(entry_handle(&entry)?);
        }
        Ok(handles)
    }

    /// Cursor over one field's tree from the given entry bound. Step it
    /// with [`cursor_next`](Self::cursor_next).
    pub fn cursor_from(&mut self, field_no: u16, bound: &[u8]) -> Result<TreeCursor> {
        let pos = self.pos_of(field_no)?;
        let root = self.dirs[pos].1;
        BTree::open(&mut self.store, root).cursor_from(bound)
    }

    pub fn cursor_next(&mut self, cursor: &mut TreeCursor) -> Result<Option<Vec<u8>>> {
        cursor.next(&mut self.store)
    }

    /// Drop and recreate one field's tree. Used by index rebuild.
    pub fn clear(&mut self, field_no: u16) -> Result<()> {
        let pos = self.pos_of(field_no)?;
        let root = self.dirs[pos].1;
        let mut tree = BTree::open(&mut self.store, root);
        tree.clear()?;
        let new_root = tree.root();
        self.update_root(pos, root, new_root)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()
    }

    pub fn store_mut(&mut self) -> &mut PageStore {
        &mut self.store
    }

    fn pos_of(&self, field_no: u16) -> Result<usize> {
        self.dirs
            .iter()
            .position(|&(f, _)| f == field_no)
            .ok_or_else(|| eyre::eyre!("field {} has no index", field_no))
    }

    fn update_root(&mut self, pos: usize, old_root: u32, new_root: u32) -> Result<()> {
        if old_root == new_root {
            return Ok(());
        }
        self.dirs[pos].1 = new_root;
        self.write_directory()
    }

    fn write_directory(&mut self) -> Result<()> {
        ensure!(
            INDEX_DIR_OFFSET + self.dirs.len() * INDEX_DIR_ENTRY_SIZE <= crate::config::PAGE_SIZE,
            "index directory of {} entries does not fit page 0",
            self.dirs.len()
        );

        let dirs = self.dirs.clone();
        let page0 = self.store.page_mut(0)?;
        let meta = IndexMeta::new(dirs.len() as u16);
        page0[INDEX_META_OFFSET..INDEX_META_OFFSET + 8].copy_from_slice(meta.as_bytes());
        for (i, &(field_no, root)) in dirs.iter().enumerate() {
            let offset = INDEX_DIR_OFFSET + i * INDEX_DIR_ENTRY_SIZE;
            let entry = IndexDirEntry::new(field_no, root);
            page0[offset..offset + INDEX_DIR_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
        }
        Ok(())
    }
}
