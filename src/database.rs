//! # Database
//!
//! The aggregate of one schema's tables: opens the directory, hands out
//! tables by name (opened lazily on first request, cached for the database
//! lifetime), and owns the cross-cutting maintenance operations — flush,
//! checkpoint, and whole-database defragmentation.
//!
//! A `Database` is an explicit instance created and passed by ownership;
//! there is no ambient global store. Tests instantiate isolated databases
//! per test directory.
//!
//! ## Lifecycle
//!
//! ```text
//! create/open ── get_table ──> CRUD ──> flush ──> ... ──> shutdown
//!      │                                                    │
//!      └── marks meta "in use"        clean flag + WAL truncate
//! ```
//!
//! The meta file's clean-shutdown flag is cleared while the database is
//! open; a later structure load replays the WAL when it finds the flag
//! clear. `Drop` flushes best-effort but deliberately does not mark the
//! shutdown clean, so a dropped-without-shutdown database takes the
//! recovery path on reopen.
//!
//! ## Defragmentation
//!
//! `defragment` is the supported compaction entry point: it compacts every
//! table (reassigning handles), patches every Ref field through the
//! resulting remaps, rebuilds all indexes, and flushes. It requires
//! exclusive access and runs to completion; it is not cancellable between
//! tables the way rebuild and repair are, because a partial run would leave
//! cross-table references dangling. Handles held by the caller from before
//! the pass are invalidated wholesale — re-resolve through an index. In-
//! store Ref fields are the only references the pass rewrites.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::config::StoreConfig;
use crate::storage::Wal;
use crate::table::Table;

pub struct Database {
    dir: PathBuf,
    config: StoreConfig,
    catalog: Catalog,
    meta_path: PathBuf,
    tables: HashMap<String, Table>,
    wal: Arc<Mutex<Wal>>,
    closed: bool,
}

pub fn meta_path(dir: &Path, schema_name: &str) -> PathBuf {
    dir.join(format!("{}.meta", schema_name))
}

impl Database {
    /// Create the on-disk structure for a new database and open it.
    pub(crate) fn create(dir: &Path, catalog: Catalog, config: StoreConfig) -> Result<Self> {
        catalog.check_references()?;

        let meta_path = meta_path(dir, catalog.schema_name());
        ensure!(
            !meta_path.exists(),
            "database '{}' already exists at {:?}",
            catalog.schema_name(),
            dir
        );
        std::fs::create_dir_all(dir.join("tables"))
            .wrap_err_with(|| format!("failed to create database directory at {:?}", dir))?;

        let wal = Arc::new(Mutex::new(Wal::create(&dir.join("wal"))?));
        let mut tables = HashMap::new();
        for def in catalog.tables() {
            let mut table = Table::create(dir, def, &config, Some(wal.clone()))?;
            table.flush()?;
            tables.insert(def.name.clone(), table);
        }

        catalog.write_meta(&meta_path, false)?;
        info!(
            schema = catalog.schema_name(),
            tables = catalog.tables().len(),
            "created database"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            catalog,
            meta_path,
            tables,
            wal,
            closed: false,
        })
    }

    /// Open an existing database whose catalog was already loaded (and
    /// whose WAL was already replayed) by the structure manager.
    pub(crate) fn open(dir: &Path, catalog: Catalog, config: StoreConfig) -> Result<Self> {
        let meta_path = meta_path(dir, catalog.schema_name());
        let wal = Arc::new(Mutex::new(Wal::open(&dir.join("wal"))?));

        // mark in-use: an unclean flag at next load triggers recovery
        catalog.write_meta(&meta_path, false)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            catalog,
            meta_path,
            tables: HashMap::new(),
            wal,
            closed: false,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn table_names(&self) -> Vec<String> {
        self.catalog.tables().iter().map(|t| t.name.clone()).collect()
    }

    /// Fetch a table by name, opening it on first use.
    pub fn get_table(&mut self, name: &str) -> Result<&mut Table> {
        ensure!(!self.closed, "database is closed");

        if !self.tables.contains_key(name) {
            let def = self
                .catalog
                .table(name)
                .ok_or_else(|| {
                    eyre::eyre!(
                        "no table '{}' in schema '{}'",
                        name,
                        self.catalog.schema_name()
                    )
                })?
                .clone();
            let table = Table::open(&self.dir, &def, &self.config, Some(self.wal.clone()))?;
            debug!(table = name, "opened table");
            self.tables.insert(name.to_string(), table);
        }
        self.tables
            .get_mut(name)
            .ok_or_else(|| eyre::eyre!("table '{}' not cached after open", name))
    }

    /// Flush every open table through the WAL to its data file. Triggers an
    /// automatic checkpoint once the WAL passes the configured threshold.
    pub fn flush(&mut self) -> Result<()> {
        ensure!(!self.closed, "database is closed");
        for table in self.tables.values_mut() {
            table.flush()?;
        }
        if self.wal.lock().frame_count() >= self.config.checkpoint_frames {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Flush and truncate the WAL. Data files are synced by the flush, so
    /// the journal's frames are no longer needed. Returns the frame count
    /// dropped.
    pub fn checkpoint(&mut self) -> Result<u32> {
        ensure!(!self.closed, "database is closed");
        for table in self.tables.values_mut() {
            table.flush()?;
        }
        let mut wal = self.wal.lock();
        let frames = wal.frame_count();
        wal.truncate()?;
        debug!(frames, "checkpoint");
        Ok(frames)
    }

    /// Compact every table, patch Ref fields through the handle remaps,
    /// rebuild all indexes, flush. Fires `progress(table, done, total)`
    /// once per table per phase. Requires exclusive access.
    pub fn defragment(&mut self, mut progress: impl FnMut(&str, u32, u32)) -> Result<()> {
        ensure!(!self.closed, "database is closed");

        let names = self.table_names();
        let total = names.len() as u32;

        // (table, field, target) triples before any mutable borrows
        let mut ref_fields = Vec::new();
        for def in self.catalog.tables() {
            for (field_no, target) in def.schema.reference_fields() {
                ref_fields.push((def.name.clone(), field_no, target.to_string()));
            }
        }

        info!(tables = total, "defragmentation started");
        let mut remaps: HashMap<String, HashMap<u64, u64>> = HashMap::new();
        for (i, name) in names.iter().enumerate() {
            let table = self.get_table(name)?;
            let remap = table.compact()?;
            debug!(table = name.as_str(), moved = remap.len(), "compacted");
            remaps.insert(name.clone(), remap);
            progress(name, i as u32 + 1, total);
        }

        for (table_name, field_no, target) in &ref_fields {
            let Some(remap) = remaps.get(target) else {
                continue;
            };
            if remap.is_empty() {
                continue;
            }
            let patched = self.get_table(table_name)?.patch_refs(*field_no, remap)?;
            debug!(
                table = table_name.as_str(),
                field = *field_no,
                patched,
                "patched references"
            );
        }

        for (i, name) in names.iter().enumerate() {
            self.get_table(name)?.rebuild_indexes()?;
            progress(name, i as u32 + 1, total);
        }

        self.flush()?;
        info!("defragmentation finished");
        Ok(())
    }

    /// Flush everything, truncate the WAL, and mark the shutdown clean.
    /// The database is unusable afterwards.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for table in self.tables.values_mut() {
            table.flush()?;
        }
        self.wal.lock().truncate()?;
        self.catalog.write_meta(&self.meta_path, true)?;
        self.closed = true;
        info!(schema = self.catalog.schema_name(), "database shut down");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed {
            // best effort; the unclean meta flag routes the next open
            // through WAL recovery
            for table in self.tables.values_mut() {
                let _ = table.flush();
            }
        }
    }
}
