//! # Blob Chains
//!
//! Out-of-line storage for variable-length values: long strings, string
//! lists, and binary properties. A blob lives in a chain of Blob pages
//! inside the owning table's data file and is referenced from the record
//! slot by a 12-byte handle (first page + declared length).
//!
//! ## Chain Layout
//!
//! ```text
//! +-----------+          +-----------+          +-----------+
//! | header    |  next    | header    |  next    | header    | next = 0
//! | frag 4080 |--------->| frag 4080 |--------->| frag tail |
//! +-----------+          +-----------+          +-----------+
//! ```
//!
//! Each page's fragment length is kept in the header's `entry_count`. The
//! declared length in the handle must equal the sum of the fragment lengths;
//! the consistency checker verifies exactly that.
//!
//! ## Growth
//!
//! `append` fills the tail page's spare capacity and extends the chain, so
//! growing in place is always possible; `replace` rewrites the existing
//! chain when the new value needs no more pages than are already allocated,
//! freeing any surplus, and otherwise relocates.

use eyre::{bail, ensure, Result};

use super::page::{PageHeader, PageType};
use super::pager::PageStore;
use crate::config::{BLOB_FRAG_CAPACITY, PAGE_HEADER_SIZE};

/// Reference to one blob chain, stored inline in a record slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHandle {
    pub first_page: u32,
    pub len: u64,
}

/// Encoded width of a handle within a record slot.
pub const BLOB_HANDLE_SIZE: usize = 12;

impl BlobHandle {
    pub const NULL: BlobHandle = BlobHandle {
        first_page: 0,
        len: 0,
    };

    pub fn is_null(&self) -> bool {
        self.first_page == 0
    }

    pub fn encode(&self) -> [u8; BLOB_HANDLE_SIZE] {
        let mut buf = [0u8; BLOB_HANDLE_SIZE];
        buf[..4].copy_from_slice(&self.first_page.to_le_bytes());
        buf[4..].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() >= BLOB_HANDLE_SIZE,
            "blob handle too short: {} < {}",
            data.len(),
            BLOB_HANDLE_SIZE
        );
        let first_page = u32::from_le_bytes(data[..4].try_into()?);
        let len = u64::from_le_bytes(data[4..12].try_into()?);
        Ok(Self { first_page, len })
    }
}

/// Number of chain pages a value of `len` bytes occupies. Zero-length blobs
/// still hold one page so the handle has something to point at.
pub fn chain_pages(len: usize) -> usize {
    len.div_ceil(BLOB_FRAG_CAPACITY).max(1)
}

/// Write `bytes` as a fresh chain and return its handle.
pub fn store(store: &mut PageStore, bytes: &[u8]) -> Result<BlobHandle> {
    let mut first_page = 0u32;
    let mut prev_page = 0u32;

    let mut chunks = bytes.chunks(BLOB_FRAG_CAPACITY);
    let mut wrote_any = false;
    loop {
        let chunk: &[u8] = match chunks.next() {
            Some(c) => c,
            None if !wrote_any => &[],
            None => break,
        };
        wrote_any = true;

        let page_no = store.allocate(PageType::Blob)?;
        write_fragment(store, page_no, chunk)?;

        if first_page == 0 {
            first_page = page_no;
        } else {
            link(store, prev_page, page_no)?;
        }
        prev_page = page_no;
    }

    Ok(BlobHandle {
        first_page,
        len: bytes.len() as u64,
    })
}

/// Read a whole chain back, verifying the declared length.
pub fn load(store: &mut PageStore, handle: BlobHandle) -> Result<Vec<u8>> {
    ensure!(!handle.is_null(), "cannot load the null blob");

    let mut result = Vec::with_capacity(handle.len as usize);
    let mut page_no = handle.first_page;
    let mut hops = 0u32;

    while page_no != 0 {
        ensure!(
            hops <= store.page_count(),
            "blob chain starting at page {} contains a cycle",
            handle.first_page
        );
        hops += 1;

        let data = store.page(page_no)?;
        let header = PageHeader::from_bytes(data)?;
        ensure!(
            header.page_type() == PageType::Blob,
            "page {} in blob chain is a {:?} page",
            page_no,
            header.page_type()
        );
        let frag_len = header.entry_count() as usize;
        ensure!(
            frag_len <= BLOB_FRAG_CAPACITY,
            "blob fragment on page {} claims {} bytes",
            page_no,
            frag_len
        );
        result.extend_from_slice(&data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + frag_len]);
        page_no = header.next_page();
    }

    ensure!(
        result.len() as u64 == handle.len,
        "blob declared {} bytes but chain holds {}",
        handle.len,
        result.len()
    );
    Ok(result)
}

/// Free every page of a chain.
pub fn delete(store: &mut PageStore, handle: BlobHandle) -> Result<()> {
    if handle.is_null() {
        return Ok(());
    }

    let mut page_no = handle.first_page;
    let mut hops = 0u32;
    while page_no != 0 {
        ensure!(
            hops <= store.page_count(),
            "blob chain starting at page {} contains a cycle",
            handle.first_page
        );
        hops += 1;

        let next = {
            let data = store.page(page_no)?;
            let header = PageHeader::from_bytes(data)?;
            ensure!(
                header.page_type() == PageType::Blob,
                "page {} in blob chain is a {:?} page",
                page_no,
                header.page_type()
            );
            header.next_page()
        };
        store.free(page_no)?;
        page_no = next;
    }
    Ok(())
}

/// Extend an existing chain with `extra`, filling the tail page's spare
/// capacity first. Returns the updated handle.
pub fn append(store: &mut PageStore, handle: BlobHandle, extra: &[u8]) -> Result<BlobHandle> {
    ensure!(!handle.is_null(), "cannot append to the null blob");
    if extra.is_empty() {
        return Ok(handle);
    }

    // walk to the tail
    let mut tail = handle.first_page;
    let mut hops = 0u32;
    loop {
        ensure!(
            hops <= store.page_count(),
            "blob chain starting at page {} contains a cycle",
            handle.first_page
        );
        hops += 1;
        let next = {
            let header = PageHeader::from_bytes(store.page(tail)?)?;
            header.next_page()
        };
        if next == 0 {
            break;
        }
        tail = next;
    }

    let tail_len = PageHeader::from_bytes(store.page(tail)?)?.entry_count() as usize;
    let spare = BLOB_FRAG_CAPACITY - tail_len;
    let (into_tail, remainder) = extra.split_at(spare.min(extra.len()));

    if !into_tail.is_empty() {
        let data = store.page_mut(tail)?;
        data[PAGE_HEADER_SIZE + tail_len..PAGE_HEADER_SIZE + tail_len + into_tail.len()]
            .copy_from_slice(into_tail);
        let header = PageHeader::from_bytes_mut(data)?;
        header.set_entry_count((tail_len + into_tail.len()) as u16);
    }

    let mut prev_page = tail;
    for chunk in remainder.chunks(BLOB_FRAG_CAPACITY) {
        let page_no = store.allocate(PageType::Blob)?;
        write_fragment(store, page_no, chunk)?;
        link(store, prev_page, page_no)?;
        prev_page = page_no;
    }

    Ok(BlobHandle {
        first_page: handle.first_page,
        len: handle.len + extra.len() as u64,
    })
}

/// Overwrite a chain with `bytes`. Rewrites in place while the new value
/// fits the allocated pages (freeing any surplus); otherwise relocates to a
/// fresh chain.
pub fn replace(store: &mut PageStore, handle: BlobHandle, bytes: &[u8]) -> Result<BlobHandle> {
    ensure!(!handle.is_null(), "cannot replace the null blob");

    let allocated = {
        let mut pages = 0usize;
        let mut page_no = handle.first_page;
        while page_no != 0 {
            ensure!(
                pages <= store.page_count() as usize,
                "blob chain starting at page {} contains a cycle",
                handle.first_page
            );
            pages += 1;
            page_no = PageHeader::from_bytes(store.page(page_no)?)?.next_page();
        }
        pages
    };

    if chain_pages(bytes.len()) > allocated {
        delete(store, handle)?;
        return store_relocated(store, bytes);
    }

    // rewrite in place over the existing pages, free the surplus tail
    let mut page_no = handle.first_page;
    let mut chunks = bytes.chunks(BLOB_FRAG_CAPACITY);
    let mut wrote_any = false;
    let mut last_used = handle.first_page;
    while page_no != 0 {
        let next = PageHeader::from_bytes(store.page(page_no)?)?.next_page();
        match chunks.next() {
            Some(chunk) => {
                write_fragment_keep_link(store, page_no, chunk, next)?;
                wrote_any = true;
                last_used = page_no;
            }
            None if !wrote_any => {
                write_fragment_keep_link(store, page_no, &[], next)?;
                wrote_any = true;
                last_used = page_no;
            }
            None => {
                store.free(page_no)?;
            }
        }
        page_no = next;
    }

    // terminate the chain at the last used page
    let data = store.page_mut(last_used)?;
    PageHeader::from_bytes_mut(data)?.set_next_page(0);

    Ok(BlobHandle {
        first_page: handle.first_page,
        len: bytes.len() as u64,
    })
}

/// Page count and byte total of a chain, for the consistency checker.
pub fn chain_stats(store: &mut PageStore, handle: BlobHandle) -> Result<(u32, u64)> {
    ensure!(!handle.is_null(), "cannot measure the null blob");

    let mut pages = 0u32;
    let mut bytes = 0u64;
    let mut page_no = handle.first_page;
    while page_no != 0 {
        ensure!(
            pages <= store.page_count(),
            "blob chain starting at page {} contains a cycle",
            handle.first_page
        );
        pages += 1;

        let data = store.page(page_no)?;
        let header = PageHeader::from_bytes(data)?;
        if header.page_type() != PageType::Blob {
            bail!(
                "page {} in blob chain is a {:?} page",
                page_no,
                header.page_type()
            );
        }
        bytes += header.entry_count() as u64;
        page_no = header.next_page();
    }
    Ok((pages, bytes))
}

fn store_relocated(store: &mut PageStore, bytes: &[u8]) -> Result<BlobHandle> {
    self::store(store, bytes)
}

fn write_fragment(store: &mut PageStore, page_no: u32, chunk: &[u8]) -> Result<()> {
    write_fragment_keep_link(store, page_no, chunk, 0)
}

fn write_fragment_keep_link(
    store: &mut PageStore,
    page_no: u32,
    chunk: &[u8],
    next: u32,
) -> Result<()> {
    ensure!(
        chunk.len() <= BLOB_FRAG_CAPACITY,
        "blob fragment of {} bytes exceeds page capacity",
        chunk.len()
    );
    let data = store.page_mut(page_no)?;
    data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
    let header = PageHeader::from_bytes_mut(data)?;
    header.set_page_type(PageType::Blob);
    header.set_entry_count(chunk.len() as u16);
    header.set_next_page(next);
    Ok(())
}

fn link(store: &mut PageStore, from: u32, to: u32) -> Result<()> {
    let data = store.page_mut(from)?;
    PageHeader::from_bytes_mut(data)?.set_next_page(to);
    Ok(())
}
