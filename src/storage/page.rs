//! # Page Types and Header Layout
//!
//! Every 4 KiB page begins with a 16-byte header describing what the page
//! holds and how its payload is laid out.
//!
//! ## Page Header Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       1     page_type    Type of page (Record, BTreeLeaf, ...)
//! 1       1     flags        Reserved flag bits
//! 2       2     entry_count  Slots / cells / fragment bytes in the page
//! 4       2     free_start   Offset where free space begins
//! 6       2     free_end     Offset where free space ends
//! 8       4     next_page    Chain link (see below)
//! 12      4     reserved
//! ```
//!
//! `next_page` is overloaded per page type, the way the right-child slot
//! doubles as the next-leaf link in most B-tree layouts:
//!
//! - **Record** pages: next record page of the owning table
//! - **Blob** pages: next fragment of the chain
//! - **Free** pages: next page of the free list
//! - **BTreeLeaf** pages: next leaf for range scans
//! - **BTreeInterior** pages: rightmost child
//!
//! `entry_count` holds the slot count on record pages, the cell count on
//! B-tree pages, and the fragment length in bytes on blob pages.
//!
//! ## Zero-Copy Access
//!
//! `PageHeader` uses `zerocopy` little-endian wrappers and `Unaligned` so a
//! header can be read in place from any page buffer without copying or
//! alignment concerns.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    Record = 0x01,
    BTreeInterior = 0x02,
    BTreeLeaf = 0x03,
    Blob = 0x04,
    Free = 0x05,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::Record,
            0x02 => PageType::BTreeInterior,
            0x03 => PageType::BTreeLeaf,
            0x04 => PageType::Blob,
            0x05 => PageType::Free,
            _ => PageType::Unknown,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    page_type: u8,
    flags: u8,
    entry_count: U16,
    free_start: U16,
    free_end: U16,
    next_page: U32,
    reserved: [u8; 4],
}

const _: () = assert!(size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn new(page_type: PageType) -> Self {
        Self {
            page_type: page_type as u8,
            flags: 0,
            entry_count: U16::new(0),
            free_start: U16::new(PAGE_HEADER_SIZE as u16),
            free_end: U16::new(PAGE_SIZE as u16),
            next_page: U32::new(0),
            reserved: [0; 4],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        data[..PAGE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_byte(self.page_type)
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.page_type = page_type as u8;
    }

    pub fn entry_count(&self) -> u16 {
        self.entry_count.get()
    }

    pub fn set_entry_count(&mut self, count: u16) {
        self.entry_count = U16::new(count);
    }

    pub fn free_start(&self) -> u16 {
        self.free_start.get()
    }

    pub fn set_free_start(&mut self, offset: u16) {
        self.free_start = U16::new(offset);
    }

    pub fn free_end(&self) -> u16 {
        self.free_end.get()
    }

    pub fn set_free_end(&mut self, offset: u16) {
        self.free_end = U16::new(offset);
    }

    pub fn free_space(&self) -> u16 {
        self.free_end.get().saturating_sub(self.free_start.get())
    }

    pub fn next_page(&self) -> u32 {
        self.next_page.get()
    }

    pub fn set_next_page(&mut self, page_no: u32) {
        self.next_page = U32::new(page_no);
    }
}

/// Structural sanity check for a page image. A fully zeroed page is valid:
/// freshly grown pages are zero until first use.
pub fn validate_page(data: &[u8]) -> Result<()> {
    ensure!(
        data.len() == PAGE_SIZE,
        "invalid page size: {} != {}",
        data.len(),
        PAGE_SIZE
    );

    let header = PageHeader::from_bytes(data)?;

    let is_zeroed = header.page_type == 0
        && header.entry_count.get() == 0
        && header.free_start.get() == 0
        && header.free_end.get() == 0;
    if is_zeroed {
        return Ok(());
    }

    ensure!(
        header.page_type() != PageType::Unknown,
        "invalid page type: {:02x}",
        header.page_type
    );
    ensure!(
        header.free_start() >= PAGE_HEADER_SIZE as u16,
        "free_start {} < PAGE_HEADER_SIZE {}",
        header.free_start(),
        PAGE_HEADER_SIZE
    );
    ensure!(
        header.free_end() <= PAGE_SIZE as u16,
        "free_end {} > PAGE_SIZE {}",
        header.free_end(),
        PAGE_SIZE
    );
    ensure!(
        header.free_start() <= header.free_end(),
        "free_start {} > free_end {}",
        header.free_start(),
        header.free_end()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_type_from_byte() {
        assert_eq!(PageType::from_byte(0x01), PageType::Record);
        assert_eq!(PageType::from_byte(0x02), PageType::BTreeInterior);
        assert_eq!(PageType::from_byte(0x03), PageType::BTreeLeaf);
        assert_eq!(PageType::from_byte(0x04), PageType::Blob);
        assert_eq!(PageType::from_byte(0x05), PageType::Free);
        assert_eq!(PageType::from_byte(0xFF), PageType::Unknown);
    }

    #[test]
    fn header_size_is_16_bytes() {
        assert_eq!(size_of::<PageHeader>(), 16);
    }

    #[test]
    fn new_header_initializes_free_span() {
        let header = PageHeader::new(PageType::Record);

        assert_eq!(header.page_type(), PageType::Record);
        assert_eq!(header.entry_count(), 0);
        assert_eq!(header.free_start(), PAGE_HEADER_SIZE as u16);
        assert_eq!(header.free_end(), PAGE_SIZE as u16);
        assert_eq!(header.next_page(), 0);
    }

    #[test]
    fn header_mutation_in_place() {
        let mut data = [0u8; PAGE_SIZE];

        {
            let header = PageHeader::from_bytes_mut(&mut data).unwrap();
            header.set_page_type(PageType::Blob);
            header.set_entry_count(1234);
            header.set_next_page(42);
        }

        let header = PageHeader::from_bytes(&data).unwrap();
        assert_eq!(header.page_type(), PageType::Blob);
        assert_eq!(header.entry_count(), 1234);
        assert_eq!(header.next_page(), 42);
    }

    #[test]
    fn header_reads_from_unaligned_buffer() {
        let mut data = [0u8; PAGE_SIZE + 1];
        PageHeader::new(PageType::BTreeLeaf)
            .write_to(&mut data[1..])
            .unwrap();

        let header = PageHeader::from_bytes(&data[1..]).unwrap();
        assert_eq!(header.page_type(), PageType::BTreeLeaf);
    }

    #[test]
    fn free_space_saturates() {
        let mut header = PageHeader::new(PageType::BTreeLeaf);
        header.set_free_start(3000);
        header.set_free_end(1000);

        assert_eq!(header.free_space(), 0);
    }

    #[test]
    fn validate_rejects_wrong_size() {
        let result = validate_page(&[0u8; 100]);

        assert!(result.is_err());
    }

    #[test]
    fn validate_accepts_zeroed_page() {
        assert!(validate_page(&[0u8; PAGE_SIZE]).is_ok());
    }

    #[test]
    fn validate_rejects_bad_free_span() {
        let mut data = [0u8; PAGE_SIZE];
        let mut header = PageHeader::new(PageType::Record);
        header.set_free_start(8);
        header.write_to(&mut data).unwrap();

        let result = validate_page(&data);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("free_start"));
    }
}
