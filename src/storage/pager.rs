//! # Page Store
//!
//! File-backed store of fixed-size pages: allocation with free-list reuse,
//! cached reads and writes, and WAL-journaled write-back. One `PageStore`
//! owns one file; a table owns two (record data and indexes).
//!
//! ## Free List
//!
//! Free pages form a singly linked list threaded through their page headers
//! (`next_page`), with the head and count kept in the file header on page 0.
//! Allocation pops the head before growing the file, so a mixed
//! insert/delete workload does not bloat the file.
//!
//! ## Write Path
//!
//! All mutations land in the dirty-page cache. A dirty page reaches disk in
//! two cases, and in both its image is appended to the shared WAL first:
//!
//! - `flush()`: journal every dirty page, sync the WAL once, then write the
//!   pages to the data file and sync it
//! - cache pressure: the evicted victim is journaled and written back alone
//!
//! ## Error Handling
//!
//! I/O failures surface immediately with path context; the engine treats
//! disk errors as fatal to the calling operation and never retries.
//!
//! ## Thread Safety
//!
//! None. Every method takes `&mut self`; callers serialize access. The only
//! shared state is the WAL handle, whose mutex is lock plumbing for the
//! multi-file database, not a concurrency guarantee.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

use super::cache::PageCache;
use super::headers::StoreFileHeader;
use super::page::{PageHeader, PageType};
use super::wal::Wal;
use crate::config::{StoreConfig, FILE_HEADER_SIZE, PAGE_SIZE};

pub struct PageStore {
    path: PathBuf,
    file: File,
    file_id: u32,
    page_count: u32,
    free_head: u32,
    free_count: u32,
    cache: PageCache,
    wal: Option<Arc<Mutex<Wal>>>,
    wal_sync: bool,
}

impl PageStore {
    /// Create a new store file holding only its header page.
    pub fn create(
        path: &Path,
        file_id: u32,
        kind: u8,
        config: &StoreConfig,
        wal: Option<Arc<Mutex<Wal>>>,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create store file '{}'", path.display()))?;

        let mut page0 = [0u8; PAGE_SIZE];
        let header = StoreFileHeader::new(file_id, kind);
        page0[..FILE_HEADER_SIZE].copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));
        file.write_all(&page0)
            .wrap_err_with(|| format!("failed to write header page of '{}'", path.display()))?;
        file.sync_data()
            .wrap_err_with(|| format!("failed to sync '{}'", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            file_id,
            page_count: 1,
            free_head: 0,
            free_count: 0,
            cache: PageCache::new(config.effective_cache_pages())?,
            wal,
            wal_sync: config.wal_sync,
        })
    }

    /// Open an existing store file, validating its header against the
    /// expected identity.
    pub fn open(
        path: &Path,
        file_id: u32,
        kind: u8,
        config: &StoreConfig,
        wal: Option<Arc<Mutex<Wal>>>,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let mut page0 = [0u8; PAGE_SIZE];
        file.seek(SeekFrom::Start(0))
            .wrap_err_with(|| format!("failed to seek '{}'", path.display()))?;
        file.read_exact(&mut page0)
            .wrap_err_with(|| format!("failed to read header page of '{}'", path.display()))?;

        let header = StoreFileHeader::from_bytes(&page0)
            .wrap_err_with(|| format!("corrupt structure: bad file header in '{}'", path.display()))?;
        ensure!(
            header.kind() == kind,
            "corrupt structure: '{}' has file kind {} (expected {})",
            path.display(),
            header.kind(),
            kind
        );
        ensure!(
            header.file_id() == file_id,
            "corrupt structure: '{}' has file id {} (expected {})",
            path.display(),
            header.file_id(),
            file_id
        );

        let page_count = header.page_count();
        ensure!(page_count >= 1, "corrupt structure: zero page count");
        let file_len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        ensure!(
            file_len >= page_count as u64 * PAGE_SIZE as u64,
            "corrupt structure: '{}' is {} bytes but header claims {} pages",
            path.display(),
            file_len,
            page_count
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            file_id,
            page_count,
            free_head: header.free_head(),
            free_count: header.free_count(),
            cache: PageCache::new(config.effective_cache_pages())?,
            wal,
            wal_sync: config.wal_sync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    pub fn page(&mut self, page_no: u32) -> Result<&[u8]> {
        self.ensure_cached(page_no)?;
        self.cache
            .get(page_no)
            .ok_or_else(|| eyre::eyre!("page {} vanished from cache", page_no))
    }

    pub fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        self.ensure_cached(page_no)?;
        self.cache
            .get_mut(page_no)
            .ok_or_else(|| eyre::eyre!("page {} vanished from cache", page_no))
    }

    /// Allocate a page, reusing the free list before growing the file. The
    /// page comes back zeroed with a fresh header of the requested type.
    pub fn allocate(&mut self, page_type: PageType) -> Result<u32> {
        if self.free_head != 0 {
            let page_no = self.free_head;
            let (next, old_type) = {
                let data = self.page(page_no)?;
                let header = PageHeader::from_bytes(data)?;
                (header.next_page(), header.page_type())
            };
            ensure!(
                old_type == PageType::Free,
                "free list head {} is a {:?} page",
                page_no,
                old_type
            );

            self.free_head = next;
            self.free_count -= 1;

            let data = self.page_mut(page_no)?;
            data.fill(0);
            PageHeader::new(page_type).write_to(data)?;
            return Ok(page_no);
        }

        let page_no = self.page_count;
        let new_len = (page_no as u64 + 1) * PAGE_SIZE as u64;
        self.file
            .set_len(new_len)
            .wrap_err_with(|| format!("failed to grow '{}' to {} bytes", self.path.display(), new_len))?;
        self.page_count += 1;

        self.make_room()?;
        let mut buf: Box<[u8; PAGE_SIZE]> = Box::new([0u8; PAGE_SIZE]);
        PageHeader::new(page_type).write_to(&mut buf[..])?;
        self.cache.insert(page_no, buf, true)?;
        Ok(page_no)
    }

    /// Return a page to the free list.
    pub fn free(&mut self, page_no: u32) -> Result<()> {
        ensure!(page_no != 0, "cannot free the header page");
        ensure!(
            page_no < self.page_count,
            "cannot free page {} beyond page count {}",
            page_no,
            self.page_count
        );

        let head = self.free_head;
        let data = self.page_mut(page_no)?;
        data.fill(0);
        let mut header = PageHeader::new(PageType::Free);
        header.set_next_page(head);
        header.write_to(data)?;

        self.free_head = page_no;
        self.free_count += 1;
        Ok(())
    }

    /// Journal and write back every dirty page, then sync the file.
    pub fn flush(&mut self) -> Result<()> {
        self.sync_header()?;

        if let Some(wal) = self.wal.clone() {
            let mut wal = wal.lock();
            let file_id = self.file_id;
            self.cache
                .for_each_dirty(|page_no, data| wal.append(file_id, page_no, data))?;
            if self.wal_sync {
                wal.sync()?;
            }
        }

        let file = &mut self.file;
        let path = &self.path;
        self.cache
            .drain_dirty(|page_no, data| write_page_at(file, path, page_no, data))?;
        self.file
            .sync_data()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }

    fn sync_header(&mut self) -> Result<()> {
        let (page_count, free_head, free_count) =
            (self.page_count, self.free_head, self.free_count);
        let data = self.page_mut(0)?;
        let header = StoreFileHeader::from_bytes_mut(data)?;
        header.set_page_count(page_count);
        header.set_free_head(free_head);
        header.set_free_count(free_count);
        Ok(())
    }

    fn ensure_cached(&mut self, page_no: u32) -> Result<()> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );
        if self.cache.contains(page_no) {
            return Ok(());
        }

        self.make_room()?;
        let mut buf: Box<[u8; PAGE_SIZE]> = Box::new([0u8; PAGE_SIZE]);
        self.file
            .seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))
            .wrap_err_with(|| format!("failed to seek '{}'", self.path.display()))?;
        self.file
            .read_exact(&mut buf[..])
            .wrap_err_with(|| {
                format!("failed to read page {} of '{}'", page_no, self.path.display())
            })?;
        self.cache.insert(page_no, buf, false)
    }

    fn make_room(&mut self) -> Result<()> {
        if !self.cache.is_full() {
            return Ok(());
        }
        if let Some((page_no, dirty, data)) = self.cache.evict() {
            if dirty {
                if let Some(wal) = self.wal.clone() {
                    let mut wal = wal.lock();
                    wal.append(self.file_id, page_no, &data[..])?;
                    if self.wal_sync {
                        wal.sync()?;
                    }
                }
                write_page_at(&mut self.file, &self.path, page_no, &data[..])?;
            }
        }
        Ok(())
    }
}

fn write_page_at(file: &mut File, path: &Path, page_no: u32, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(page_no as u64 * PAGE_SIZE as u64))
        .wrap_err_with(|| format!("failed to seek '{}'", path.display()))?;
    file.write_all(data)
        .wrap_err_with(|| format!("failed to write page {} of '{}'", page_no, path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::headers::FILE_KIND_TABLE;
    use tempfile::tempdir;

    fn config() -> StoreConfig {
        StoreConfig {
            cache_pages: 8,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbd");

        {
            let store = PageStore::create(&path, 4, FILE_KIND_TABLE, &config(), None).unwrap();
            assert_eq!(store.page_count(), 1);
            assert_eq!(store.free_count(), 0);
        }

        let store = PageStore::open(&path, 4, FILE_KIND_TABLE, &config(), None).unwrap();
        assert_eq!(store.page_count(), 1);
    }

    #[test]
    fn open_rejects_wrong_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbd");
        drop(PageStore::create(&path, 4, FILE_KIND_TABLE, &config(), None).unwrap());

        assert!(PageStore::open(&path, 5, FILE_KIND_TABLE, &config(), None).is_err());
        assert!(PageStore::open(&path, 4, 2, &config(), None).is_err());
    }

    #[test]
    fn allocate_grows_then_reuses_free_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbd");
        let mut store = PageStore::create(&path, 1, FILE_KIND_TABLE, &config(), None).unwrap();

        let a = store.allocate(PageType::Record).unwrap();
        let b = store.allocate(PageType::Record).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(store.page_count(), 3);

        store.free(a).unwrap();
        store.free(b).unwrap();
        assert_eq!(store.free_count(), 2);

        // LIFO reuse: most recently freed first
        let c = store.allocate(PageType::Blob).unwrap();
        assert_eq!(c, b);
        assert_eq!(store.free_count(), 1);
        assert_eq!(store.page_count(), 3);

        let header = PageHeader::from_bytes(store.page(c).unwrap()).unwrap();
        assert_eq!(header.page_type(), PageType::Blob);
        assert_eq!(header.next_page(), 0);
    }

    #[test]
    fn page_data_survives_flush_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbd");

        let page_no = {
            let mut store = PageStore::create(&path, 1, FILE_KIND_TABLE, &config(), None).unwrap();
            let page_no = store.allocate(PageType::Record).unwrap();
            store.page_mut(page_no).unwrap()[100] = 0x5A;
            store.flush().unwrap();
            page_no
        };

        let mut store = PageStore::open(&path, 1, FILE_KIND_TABLE, &config(), None).unwrap();
        assert_eq!(store.page(page_no).unwrap()[100], 0x5A);
    }

    #[test]
    fn free_list_survives_flush_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbd");

        {
            let mut store = PageStore::create(&path, 1, FILE_KIND_TABLE, &config(), None).unwrap();
            for _ in 0..4 {
                store.allocate(PageType::Record).unwrap();
            }
            store.free(2).unwrap();
            store.free(3).unwrap();
            store.flush().unwrap();
        }

        let mut store = PageStore::open(&path, 1, FILE_KIND_TABLE, &config(), None).unwrap();
        assert_eq!(store.free_count(), 2);
        assert_eq!(store.allocate(PageType::Record).unwrap(), 3);
        assert_eq!(store.allocate(PageType::Record).unwrap(), 2);
        assert_eq!(store.allocate(PageType::Record).unwrap(), 5);
    }

    #[test]
    fn eviction_write_back_preserves_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbd");
        let mut store = PageStore::create(&path, 1, FILE_KIND_TABLE, &config(), None).unwrap();

        // tiny cache (8): touch far more pages than fit
        let mut pages = Vec::new();
        for i in 0..32u8 {
            let page_no = store.allocate(PageType::Record).unwrap();
            store.page_mut(page_no).unwrap()[200] = i;
            pages.push(page_no);
        }
        for (i, &page_no) in pages.iter().enumerate() {
            assert_eq!(store.page(page_no).unwrap()[200], i as u8);
        }
    }

    #[test]
    fn out_of_bounds_page_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tbd");
        let mut store = PageStore::create(&path, 1, FILE_KIND_TABLE, &config(), None).unwrap();

        assert!(store.page(99).is_err());
        assert!(store.free(0).is_err());
        assert!(store.free(99).is_err());
    }

    #[test]
    fn dirty_pages_reach_wal_on_flush() {
        let dir = tempdir().unwrap();
        let wal_dir = dir.path().join("wal");
        let path = dir.path().join("t.tbd");
        let wal = Arc::new(Mutex::new(Wal::create(&wal_dir).unwrap()));

        let mut store =
            PageStore::create(&path, 9, FILE_KIND_TABLE, &config(), Some(wal.clone())).unwrap();
        let page_no = store.allocate(PageType::Record).unwrap();
        store.page_mut(page_no).unwrap()[50] = 0x77;
        store.flush().unwrap();

        drop(store);
        let mut seen = Vec::new();
        Wal::replay(&wal_dir, |file_id, no, data| {
            seen.push((file_id, no, data[50]));
            Ok(())
        })
        .unwrap();

        assert!(seen.contains(&(9, page_no, 0x77)));
    }
}
