//! # B-Tree Module
//!
//! Ordered index structure over paged storage. Entries are memcomparable
//! byte strings (see `key`): an encoded field value suffixed with the
//! 8-byte big-endian record handle, so duplicate field values remain
//! distinct entries with a stable handle-order tie-break.
//!
//! - `key`: order-preserving encodings per field type, entry assembly
//! - `node`: slotted-page layout for leaf and interior nodes
//! - `tree`: search, insert, delete with split/borrow/merge, cursors

pub mod key;
mod node;
mod tree;

pub use tree::{BTree, TreeCursor, MAX_TREE_DEPTH};
