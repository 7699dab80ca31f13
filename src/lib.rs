//! # MyPal — Embedded Record-Oriented Storage Engine
//!
//! MyPal is the storage kernel of a personal-information-manager resource
//! store: fixed-schema tables of typed records (resources, links, and typed
//! property rows keyed by resource handle), backed by paged per-table files
//! with B-tree indexes, a blob heap for out-of-line values, and offline
//! maintenance tooling — structural validation, index rebuild,
//! defragmentation, and a consistency checker with diagnose and fix modes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  DbStructure (create / load / validate /     │
//! │  recover / shutdown)     StoreRepair         │
//! ├──────────────────────────────────────────────┤
//! │  Database (catalog, lazy table cache,        │
//! │  checkpoint, defragment)                     │
//! ├─────────────────────┬────────────────────────┤
//! │  Table (slots,      │  IndexSet (B-tree per  │
//! │  tombstones, scan)  │  indexed field)        │
//! ├─────────────────────┴────────────────────────┤
//! │  Records (fixed layout, null bitmap,         │
//! │  inline/overflow strings)                    │
//! ├──────────────────────────────────────────────┤
//! │  Storage (pager + SIEVE cache, free list,    │
//! │  blob chains, page-image WAL)                │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use mypal::{Catalog, DbStructure, FieldDef, FieldType, Record, StoreConfig, Value};
//!
//! let mut catalog = Catalog::new("primary")?;
//! catalog.add_table("Resources", vec![
//!     FieldDef::new("Type", FieldType::Int).required().indexed(),
//!     FieldDef::new("DisplayName", FieldType::Str),
//! ])?;
//!
//! let mut structure = DbStructure::new("./store", "primary", StoreConfig::default());
//! structure.create_database(catalog)?;
//! structure.load_structure(true, |_| {})?;
//!
//! let db = structure.open_database()?;
//! let table = db.get_table("Resources")?;
//! let handle = table.insert(&Record::new(vec![
//!     Value::Int(1),
//!     Value::Str("Inbox".into()),
//! ]))?;
//! let record = table.get(handle)?;
//!
//! structure.shutdown()?;
//! ```
//!
//! ## Concurrency Contract
//!
//! The engine core is single-threaded and not internally locked: callers
//! serialize all access, the way the surrounding application routes every
//! store mutation through one dedicated worker thread. APIs take
//! `&mut self` so the contract is enforced by the borrow checker rather
//! than by runtime locks. Long-running maintenance passes are cancellable
//! between tables via their progress callbacks; `defragment` and repair in
//! fix mode additionally require that no other access is in flight.
//!
//! ## Durability
//!
//! Dirty pages are journaled to a CRC-64-checksummed page-image WAL before
//! write-back, and the WAL is replayed at structure-load time after an
//! unclean shutdown. `Database::flush` is the durability point;
//! `shutdown` checkpoints and marks the meta file clean. The WAL is a
//! page journal, not a transaction log — logical drift that survives a
//! crash is the repairer's department.

pub mod btree;
pub mod catalog;
pub mod config;
pub mod database;
pub mod handle;
pub mod index;
pub mod records;
pub mod repair;
pub mod storage;
pub mod structure;
pub mod table;

pub use catalog::{Catalog, TableDef};
pub use config::StoreConfig;
pub use database::Database;
pub use handle::RecordHandle;
pub use records::{FieldDef, FieldType, Record, TableSchema, Value};
pub use repair::{Finding, RepairOptions, RepairProgress, RepairReport, StoreRepair};
pub use structure::{DbStructure, ProgressEvent};
pub use table::{RecordsCounts, Table, TableScan};
