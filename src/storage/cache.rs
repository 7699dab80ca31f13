//! # Dirty-Page Cache
//!
//! Bounded in-memory cache of page buffers with SIEVE eviction. Every page
//! read and write in the engine goes through this cache; dirty pages are
//! written back on [`flush`](crate::storage::PageStore::flush) or when
//! eviction needs their buffer.
//!
//! ## Why SIEVE Instead of LRU?
//!
//! A sequential table scan touches every page once. Under strict LRU each
//! scanned page becomes most-recently-used and pushes out pages that are
//! actually hot (table roots, index upper levels). SIEVE keeps a `visited`
//! flag per entry and sweeps a hand over the entries on eviction:
//!
//! - visited: clear the flag, advance the hand (second chance)
//! - not visited: evict this entry
//!
//! Hot pages keep getting their flag re-set and survive; scan pages are
//! touched once and leave quickly.
//!
//! ## Thread Safety
//!
//! None, deliberately. The engine core is single-threaded and callers
//! serialize access (single-writer discipline); all methods take `&mut self`
//! so misuse fails to compile rather than at runtime.

use hashbrown::HashMap;

use crate::config::{MIN_CACHE_PAGES, PAGE_SIZE};
use eyre::{ensure, Result};

struct CacheEntry {
    page_no: u32,
    visited: bool,
    dirty: bool,
    data: Box<[u8; PAGE_SIZE]>,
}

pub struct PageCache {
    entries: Vec<CacheEntry>,
    index: HashMap<u32, usize>,
    hand: usize,
    capacity: usize,
}

impl PageCache {
    pub fn new(capacity: usize) -> Result<Self> {
        ensure!(
            capacity >= MIN_CACHE_PAGES,
            "page cache capacity {} below minimum {}",
            capacity,
            MIN_CACHE_PAGES
        );

        Ok(Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn contains(&self, page_no: u32) -> bool {
        self.index.contains_key(&page_no)
    }

    pub fn get(&mut self, page_no: u32) -> Option<&[u8]> {
        let idx = *self.index.get(&page_no)?;
        let entry = &mut self.entries[idx];
        entry.visited = true;
        Some(&entry.data[..])
    }

    pub fn get_mut(&mut self, page_no: u32) -> Option<&mut [u8]> {
        let idx = *self.index.get(&page_no)?;
        let entry = &mut self.entries[idx];
        entry.visited = true;
        entry.dirty = true;
        Some(&mut entry.data[..])
    }

    /// Insert a page that is not currently cached. The caller must have made
    /// room first (see [`evict`](Self::evict)); inserting into a full cache
    /// is a logic error.
    pub fn insert(&mut self, page_no: u32, data: Box<[u8; PAGE_SIZE]>, dirty: bool) -> Result<()> {
        ensure!(!self.is_full(), "page cache insert while full");
        ensure!(
            !self.index.contains_key(&page_no),
            "page {} already cached",
            page_no
        );

        self.index.insert(page_no, self.entries.len());
        self.entries.push(CacheEntry {
            page_no,
            visited: false,
            dirty,
            data,
        });
        Ok(())
    }

    /// Choose a victim with the SIEVE hand and remove it, returning its page
    /// number, dirty flag, and buffer so the caller can write it back and
    /// reuse the allocation. Returns `None` when the cache is empty.
    pub fn evict(&mut self) -> Option<(u32, bool, Box<[u8; PAGE_SIZE]>)> {
        if self.entries.is_empty() {
            return None;
        }

        loop {
            if self.hand >= self.entries.len() {
                self.hand = 0;
            }
            if self.entries[self.hand].visited {
                self.entries[self.hand].visited = false;
                self.hand += 1;
                continue;
            }

            let entry = self.entries.swap_remove(self.hand);
            self.index.remove(&entry.page_no);
            // swap_remove moved the former last entry into hand's position
            if self.hand < self.entries.len() {
                let moved = self.entries[self.hand].page_no;
                self.index.insert(moved, self.hand);
            }
            return Some((entry.page_no, entry.dirty, entry.data));
        }
    }

    /// Drop a cached page without write-back. Used when the on-disk image
    /// was produced outside the cache (WAL recovery) or the page was freed.
    pub fn discard(&mut self, page_no: u32) {
        if let Some(idx) = self.index.remove(&page_no) {
            self.entries.swap_remove(idx);
            if idx < self.entries.len() {
                let moved = self.entries[idx].page_no;
                self.index.insert(moved, idx);
            }
        }
    }

    /// Invoke `f` for every dirty entry without clearing flags. Used to
    /// journal dirty pages ahead of the write-back pass.
    pub fn for_each_dirty(
        &self,
        mut f: impl FnMut(u32, &[u8]) -> Result<()>,
    ) -> Result<()> {
        for entry in &self.entries {
            if entry.dirty {
                f(entry.page_no, &entry.data[..])?;
            }
        }
        Ok(())
    }

    /// Invoke `write_back` for every dirty entry and clear its dirty flag on
    /// success. Iteration order is unspecified.
    pub fn drain_dirty(
        &mut self,
        mut write_back: impl FnMut(u32, &[u8]) -> Result<()>,
    ) -> Result<()> {
        for entry in &mut self.entries {
            if entry.dirty {
                write_back(entry.page_no, &entry.data[..])?;
                entry.dirty = false;
            }
        }
        Ok(())
    }

    pub fn dirty_count(&self) -> usize {
        self.entries.iter().filter(|e| e.dirty).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(fill: u8) -> Box<[u8; PAGE_SIZE]> {
        Box::new([fill; PAGE_SIZE])
    }

    fn cache(capacity: usize) -> PageCache {
        PageCache::new(capacity).unwrap()
    }

    #[test]
    fn rejects_tiny_capacity() {
        assert!(PageCache::new(MIN_CACHE_PAGES - 1).is_err());
    }

    #[test]
    fn insert_then_get() {
        let mut cache = cache(8);
        cache.insert(3, boxed(0xAB), false).unwrap();

        let data = cache.get(3).unwrap();
        assert_eq!(data[0], 0xAB);
        assert!(cache.get(4).is_none());
    }

    #[test]
    fn get_mut_marks_dirty() {
        let mut cache = cache(8);
        cache.insert(1, boxed(0), false).unwrap();
        assert_eq!(cache.dirty_count(), 0);

        cache.get_mut(1).unwrap()[0] = 7;

        assert_eq!(cache.dirty_count(), 1);
    }

    #[test]
    fn insert_duplicate_fails() {
        let mut cache = cache(8);
        cache.insert(1, boxed(0), false).unwrap();

        assert!(cache.insert(1, boxed(0), false).is_err());
    }

    #[test]
    fn evict_prefers_unvisited() {
        let mut cache = cache(8);
        for page in 0..8 {
            cache.insert(page, boxed(page as u8), false).unwrap();
        }
        // touch everything except page 2
        for page in [0u32, 1, 3, 4, 5, 6, 7] {
            cache.get(page);
        }

        let (victim, dirty, _) = cache.evict().unwrap();

        assert_eq!(victim, 2);
        assert!(!dirty);
        assert!(!cache.contains(2));
        assert_eq!(cache.len(), 7);
    }

    #[test]
    fn evict_gives_second_chance_then_picks() {
        let mut cache = cache(8);
        for page in 0..8 {
            cache.insert(page, boxed(0), false).unwrap();
            cache.get(page);
        }

        // all visited: the hand clears flags on a full sweep, then evicts
        let (_, dirty, _) = cache.evict().unwrap();

        assert!(!dirty);
        assert_eq!(cache.len(), 7);
    }

    #[test]
    fn evict_reports_dirty_flag() {
        let mut cache = cache(8);
        cache.insert(5, boxed(0), false).unwrap();
        cache.get_mut(5).unwrap()[0] = 1;

        let (victim, dirty, data) = cache.evict().unwrap();

        assert_eq!(victim, 5);
        assert!(dirty);
        assert_eq!(data[0], 1);
    }

    #[test]
    fn drain_dirty_clears_flags() {
        let mut cache = cache(8);
        cache.insert(1, boxed(1), true).unwrap();
        cache.insert(2, boxed(2), false).unwrap();
        cache.insert(3, boxed(3), true).unwrap();

        let mut written = Vec::new();
        cache
            .drain_dirty(|page_no, data| {
                written.push((page_no, data[0]));
                Ok(())
            })
            .unwrap();
        written.sort_unstable();

        assert_eq!(written, vec![(1, 1), (3, 3)]);
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn discard_removes_without_write_back() {
        let mut cache = cache(8);
        cache.insert(1, boxed(0), true).unwrap();
        cache.insert(2, boxed(0), false).unwrap();

        cache.discard(1);

        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert_eq!(cache.get(2).unwrap()[0], 0);
    }

    #[test]
    fn index_stays_consistent_across_swap_remove() {
        let mut cache = cache(8);
        for page in 0..4 {
            cache.insert(page, boxed(page as u8), false).unwrap();
        }

        cache.discard(0);

        // former last entry (page 3) moved into slot 0; lookups still work
        for page in 1..4u32 {
            assert_eq!(cache.get(page).unwrap()[0], page as u8);
        }
    }
}
