//! # Storage Module
//!
//! The foundational storage layer: fixed-size pages in per-table files, a
//! bounded dirty-page cache, free-list allocation, blob chains for
//! out-of-line values, and the write-ahead log shared by all files of one
//! database.
//!
//! ## File-Per-Table Layout
//!
//! ```text
//! database_dir/
//! ├── primary.meta         # catalog + clean-shutdown flag
//! ├── tables/
//! │   ├── Resources.tbd    # record pages + blob chains + free list
//! │   ├── Resources.idx    # B-trees for the table's indexed fields
//! │   └── ...
//! └── wal/
//!     └── wal.000001       # page-image journal
//! ```
//!
//! Every `.tbd`/`.idx` file is a self-contained [`PageStore`]: its free list
//! and page count live in its own header page, so a table can be opened,
//! checked, and repaired without touching its neighbors.
//!
//! ## Module Organization
//!
//! - `page`: page type tags and the 16-byte page header
//! - `headers`: zerocopy file headers and page-0 metadata blocks
//! - `cache`: bounded SIEVE cache with dirty write-back
//! - `pager`: `PageStore` — allocation, free list, cached page I/O
//! - `blob`: blob chains (store/load/delete/append/replace)
//! - `wal`: page-image write-ahead log with CRC-64 frames
//!
//! ## Thread Safety
//!
//! The storage layer is single-threaded by contract: callers serialize all
//! access (the surrounding system routes every mutation through one worker).
//! APIs take `&mut self` so violations are compile errors, not data races.

pub mod blob;
mod cache;
mod headers;
mod page;
mod pager;
mod wal;

pub use blob::{BlobHandle, BLOB_HANDLE_SIZE};
pub use cache::PageCache;
pub use headers::{
    IndexDirEntry, IndexMeta, MetaFileHeader, StoreFileHeader, TableMeta, CURRENT_VERSION,
    FILE_KIND_INDEX, FILE_KIND_TABLE, FILE_MAGIC, META_HEADER_SIZE, META_MAGIC,
};
pub use page::{validate_page, PageHeader, PageType};
pub use pager::PageStore;
pub use wal::{Wal, WalFrameHeader, WAL_FILE};
