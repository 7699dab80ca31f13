//! # Structure Manager
//!
//! `DbStructure` owns the lifecycle of one database instance at one
//! filesystem path: creating the on-disk structure, loading and validating
//! it, recovering the WAL after an unclean shutdown, opening the database,
//! driving the long-running maintenance operations, and shutting down.
//!
//! ## Load Protocol
//!
//! ```text
//! load_structure(validate)
//!   1. read <schema>.meta          -> catalog + clean-shutdown flag
//!   2. if unclean: replay WAL      -> re-apply journaled page images
//!   3. if validate: per-table structural checks, progress per table
//! open_database()                  -> Database over the validated state
//! ```
//!
//! Validation failures carry a "corrupt structure" message and block the
//! open; the expected next step is the consistency checker. Validation is
//! structural only — file headers, meta blocks, record chains, free lists,
//! index directories — while logical drift (dangling references, index
//! completeness) is the repairer's job.
//!
//! Progress callbacks fire once per table on the calling thread; there is
//! no background activity here. Rebuild accepts a `bool` return for
//! cooperative cancellation between tables.

use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::config::{StoreConfig, PAGE_SIZE, TABLE_META_OFFSET};
use crate::database::{meta_path, Database};
use crate::storage::{
    PageHeader, PageStore, PageType, TableMeta, Wal, FILE_KIND_INDEX, FILE_KIND_TABLE,
};
use crate::table::{data_file_id, data_path, index_file_id, index_path};

/// One per-table progress tick of a long-running structure operation.
#[derive(Debug)]
pub struct ProgressEvent<'a> {
    pub operation: &'a str,
    pub table: &'a str,
    pub tables_done: u32,
    pub table_count: u32,
}

pub struct DbStructure {
    dir: PathBuf,
    schema_name: String,
    config: StoreConfig,
    catalog: Option<Catalog>,
    db: Option<Database>,
}

impl DbStructure {
    pub fn new(dir: impl Into<PathBuf>, schema_name: impl Into<String>, config: StoreConfig) -> Self {
        Self {
            dir: dir.into(),
            schema_name: schema_name.into(),
            config,
            catalog: None,
            db: None,
        }
    }

    pub fn meta_path(&self) -> PathBuf {
        meta_path(&self.dir, &self.schema_name)
    }

    pub fn exists(&self) -> bool {
        self.meta_path().exists()
    }

    /// Create the database files for `catalog` and leave them cleanly shut
    /// down, ready for `load_structure` + `open_database`.
    pub fn create_database(&mut self, catalog: Catalog) -> Result<()> {
        ensure!(
            catalog.schema_name() == self.schema_name,
            "catalog is for schema '{}', structure manager expects '{}'",
            catalog.schema_name(),
            self.schema_name
        );
        let mut db = Database::create(&self.dir, catalog, self.config.clone())?;
        db.shutdown()
    }

    /// Read the catalog, recover the WAL if the last shutdown was unclean,
    /// and optionally run the structural validation pass.
    pub fn load_structure(
        &mut self,
        validate: bool,
        mut progress: impl FnMut(&ProgressEvent<'_>),
    ) -> Result<()> {
        let meta = self.meta_path();
        ensure!(
            meta.exists(),
            "no database for schema '{}' at {:?} (meta file missing)",
            self.schema_name,
            self.dir
        );

        let (catalog, clean) = Catalog::read_meta(&meta)?;
        ensure!(
            catalog.schema_name() == self.schema_name,
            "corrupt structure: meta file names schema '{}', expected '{}'",
            catalog.schema_name(),
            self.schema_name
        );
        catalog.check_references()?;

        if !clean {
            warn!(schema = self.schema_name.as_str(), "unclean shutdown detected");
            let frames = replay_wal(&self.dir, &catalog)?;
            info!(frames, "WAL recovery finished");
        }

        if validate {
            let table_count = catalog.tables().len() as u32;
            for (i, def) in catalog.tables().iter().enumerate() {
                validate_table(&self.dir, &catalog, &def.name, &self.config).wrap_err_with(
                    || format!("corrupt structure: table '{}' failed validation", def.name),
                )?;
                progress(&ProgressEvent {
                    operation: "load",
                    table: &def.name,
                    tables_done: i as u32 + 1,
                    table_count,
                });
            }
        }

        self.catalog = Some(catalog);
        Ok(())
    }

    /// Open the database. Loads the structure (without validation) first if
    /// `load_structure` has not run yet.
    pub fn open_database(&mut self) -> Result<&mut Database> {
        if self.db.is_none() {
            if self.catalog.is_none() {
                self.load_structure(false, |_| {})?;
            }
            let catalog = self
                .catalog
                .clone()
                .ok_or_else(|| eyre::eyre!("structure not loaded"))?;
            self.db = Some(Database::open(&self.dir, catalog, self.config.clone())?);
        }
        self.db
            .as_mut()
            .ok_or_else(|| eyre::eyre!("database not open"))
    }

    pub fn database(&mut self) -> Option<&mut Database> {
        self.db.as_mut()
    }

    /// Rebuild every table's indexes in declaration order. The callback
    /// fires after each table; returning `false` stops before the next one.
    /// Returns the number of tables processed. Requires exclusive access.
    pub fn rebuild_indexes(
        &mut self,
        mut progress: impl FnMut(&ProgressEvent<'_>) -> bool,
    ) -> Result<u32> {
        let db = self.open_database()?;
        let names = db.table_names();
        let table_count = names.len() as u32;

        let mut done = 0u32;
        for name in &names {
            db.get_table(name)?.rebuild_indexes()?;
            done += 1;
            let keep_going = progress(&ProgressEvent {
                operation: "rebuild_indexes",
                table: name,
                tables_done: done,
                table_count,
            });
            if !keep_going {
                info!(done, table_count, "index rebuild stopped by caller");
                break;
            }
        }
        db.flush()?;
        Ok(done)
    }

    /// Whole-database defragmentation (see `Database::defragment`).
    pub fn defragment(&mut self, mut progress: impl FnMut(&ProgressEvent<'_>)) -> Result<()> {
        let db = self.open_database()?;
        db.defragment(|table, tables_done, table_count| {
            progress(&ProgressEvent {
                operation: "defragment",
                table,
                tables_done,
                table_count,
            })
        })
    }

    /// Shut the database down cleanly and release it.
    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(mut db) = self.db.take() {
            db.shutdown()?;
        }
        Ok(())
    }
}

/// Re-apply every valid WAL frame to its file, sync, and truncate the log.
fn replay_wal(dir: &Path, catalog: &Catalog) -> Result<u32> {
    use std::io::{Seek, SeekFrom, Write};

    let mut files: HashMap<u32, std::fs::File> = HashMap::new();
    let frames = Wal::replay(&dir.join("wal"), |file_id, page_no, data| {
        if !files.contains_key(&file_id) {
            let table_id = (file_id / 2) as u64;
            let def = catalog.table_by_id(table_id).ok_or_else(|| {
                eyre::eyre!(
                    "corrupt structure: WAL frame for unknown table id {}",
                    table_id
                )
            })?;
            let path = if file_id % 2 == 0 {
                data_path(dir, &def.name)
            } else {
                index_path(dir, &def.name)
            };
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .wrap_err_with(|| format!("failed to open '{}' for recovery", path.display()))?;
            files.insert(file_id, file);
        }
        let file = files
            .get_mut(&file_id)
            .ok_or_else(|| eyre::eyre!("recovery file {} not cached", file_id))?;

        let needed = (page_no as u64 + 1) * PAGE_SIZE as u64;
        if file.metadata().wrap_err("failed to stat recovery file")?.len() < needed {
            file.set_len(needed)
                .wrap_err("failed to extend file during recovery")?;
        }
        file.seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))
            .wrap_err("failed to seek during recovery")?;
        file.write_all(data)
            .wrap_err("failed to write page during recovery")?;
        Ok(())
    })?;

    for file in files.values() {
        file.sync_data().wrap_err("failed to sync recovered file")?;
    }
    let mut wal = Wal::open(&dir.join("wal"))?;
    wal.truncate()?;
    Ok(frames)
}

/// Structural checks for one table: file identities, meta block, record
/// chain, free list, and index directory.
fn validate_table(dir: &Path, catalog: &Catalog, name: &str, config: &StoreConfig) -> Result<()> {
    let def = catalog
        .table(name)
        .ok_or_else(|| eyre::eyre!("unknown table '{}'", name))?;

    let tbd = data_path(dir, name);
    ensure!(tbd.exists(), "data file '{}' is missing", tbd.display());
    let mut data = PageStore::open(&tbd, data_file_id(def.table_id), FILE_KIND_TABLE, config, None)?;

    // meta block and record chain
    let (record_head, slot_size, live, total) = {
        let page0 = data.page(0)?;
        let meta = TableMeta::from_bytes(&page0[TABLE_META_OFFSET..])?;
        (
            meta.record_head(),
            meta.slot_size(),
            meta.live_records(),
            meta.total_slots(),
        )
    };
    ensure!(
        slot_size as usize == def.schema.slot_size(),
        "slot size {} does not match schema ({})",
        slot_size,
        def.schema.slot_size()
    );
    ensure!(live <= total, "live count {} exceeds total {}", live, total);

    let slots_per_page = def.schema.slots_per_page() as u16;
    let mut seen = 0u32;
    let mut page = record_head;
    let mut counted_slots = 0u64;
    while page != 0 {
        ensure!(seen <= data.page_count(), "record page chain contains a cycle");
        seen += 1;
        let buf = data.page(page)?;
        let header = PageHeader::from_bytes(buf)?;
        ensure!(
            header.page_type() == PageType::Record,
            "page {} in record chain is a {:?} page",
            page,
            header.page_type()
        );
        ensure!(
            header.entry_count() <= slots_per_page,
            "page {} claims {} slots, schema allows {}",
            page,
            header.entry_count(),
            slots_per_page
        );
        counted_slots += header.entry_count() as u64;
        page = header.next_page();
    }
    ensure!(
        counted_slots == total,
        "record chain holds {} slots, meta claims {}",
        counted_slots,
        total
    );

    // free list
    let mut free_seen = 0u32;
    let mut free_page = {
        let page0 = data.page(0)?;
        crate::storage::StoreFileHeader::from_bytes(page0)?.free_head()
    };
    let free_count = data.free_count();
    while free_page != 0 {
        ensure!(free_seen <= data.page_count(), "free list contains a cycle");
        free_seen += 1;
        let buf = data.page(free_page)?;
        let header = PageHeader::from_bytes(buf)?;
        ensure!(
            header.page_type() == PageType::Free,
            "page {} on free list is a {:?} page",
            free_page,
            header.page_type()
        );
        free_page = header.next_page();
    }
    ensure!(
        free_seen == free_count,
        "free list holds {} pages, header claims {}",
        free_seen,
        free_count
    );

    // index file and directory
    let idx = index_path(dir, name);
    ensure!(idx.exists(), "index file '{}' is missing", idx.display());
    let mut index_store = PageStore::open(
        &idx,
        index_file_id(def.table_id),
        FILE_KIND_INDEX,
        config,
        None,
    )?;
    let set = crate::index::IndexSet::open(
        &idx,
        index_file_id(def.table_id),
        config,
        None,
    )?;
    let declared = def.schema.indexed_fields();
    let present = set.fields();
    ensure!(
        declared.len() == present.len()
            && declared.iter().all(|f| present.contains(f)),
        "index directory lists fields {:?}, schema declares {:?}",
        present,
        declared
    );
    for field_no in present {
        let root = set
            .root_of(field_no)
            .ok_or_else(|| eyre::eyre!("index for field {} lost its root", field_no))?;
        ensure!(
            root != 0 && root < index_store.page_count(),
            "index root {} for field {} out of bounds",
            root,
            field_no
        );
        let buf = index_store.page(root)?;
        let page_type = PageHeader::from_bytes(buf)?.page_type();
        ensure!(
            matches!(page_type, PageType::BTreeLeaf | PageType::BTreeInterior),
            "index root {} for field {} is a {:?} page",
            root,
            field_no,
            page_type
        );
    }

    Ok(())
}
