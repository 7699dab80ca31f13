//! # Write-Ahead Log
//!
//! Append-only journal of page images shared by all paged files of one
//! database. Before a dirty page is written back to its data file, its full
//! image is appended here; on an unclean shutdown the log is replayed at
//! structure-load time, re-applying every valid frame, and then truncated.
//!
//! ## Frame Format
//!
//! ```text
//! +------------------+------------------+
//! | Frame Header     | Page Image       |
//! | (32 bytes)       | (4096 bytes)     |
//! +------------------+------------------+
//! ```
//!
//! The header carries the owning file id (tables and their index files have
//! distinct ids), the page number, a monotonically increasing frame number,
//! and a CRC-64 checksum over header and image. A frame whose checksum does
//! not match terminates replay: it marks the torn tail of an interrupted
//! write, which is exactly the state the log exists to cut off.
//!
//! ## What This Log Is Not
//!
//! This is a page-image journal, not a transaction log. It protects against
//! torn page writes and lost flushed-but-unsynced data; it does not provide
//! multi-page atomicity across a crash. Logical drift that slips through is
//! the consistency checker's department, which matches the reactive repair
//! posture of the surrounding system.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result, WrapErr};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{PAGE_SIZE, WAL_FRAME_HEADER_SIZE, WAL_FRAME_SIZE};

pub const WAL_FILE: &str = "wal.000001";

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct WalFrameHeader {
    file_id: U32,
    page_no: U32,
    frame_no: U32,
    salt: U32,
    checksum: U64,
    reserved: [u8; 8],
}

const _: () = assert!(size_of::<WalFrameHeader>() == WAL_FRAME_HEADER_SIZE);

impl WalFrameHeader {
    fn new(file_id: u32, page_no: u32, frame_no: u32) -> Self {
        Self {
            file_id: U32::new(file_id),
            page_no: U32::new(page_no),
            frame_no: U32::new(frame_no),
            salt: U32::new(frame_no ^ 0x9E37_79B9),
            checksum: U64::new(0),
            reserved: [0; 8],
        }
    }

    pub fn file_id(&self) -> u32 {
        self.file_id.get()
    }

    pub fn page_no(&self) -> u32 {
        self.page_no.get()
    }

    pub fn frame_no(&self) -> u32 {
        self.frame_no.get()
    }
}

pub fn compute_checksum(header: &WalFrameHeader, page_data: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&header.file_id.get().to_le_bytes());
    digest.update(&header.page_no.get().to_le_bytes());
    digest.update(&header.frame_no.get().to_le_bytes());
    digest.update(&header.salt.get().to_le_bytes());
    digest.update(page_data);
    digest.finalize()
}

pub fn validate_checksum(header: &WalFrameHeader, page_data: &[u8]) -> bool {
    compute_checksum(header, page_data) == header.checksum.get()
}

pub struct Wal {
    path: PathBuf,
    file: File,
    offset: u64,
    frame_count: u32,
}

impl Wal {
    pub fn create(dir: &Path) -> Result<Self> {
        create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create WAL directory at {:?}", dir))?;

        let path = dir.join(WAL_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create WAL at {:?}", path))?;

        Ok(Self {
            path,
            file,
            offset: 0,
            frame_count: 0,
        })
    }

    /// Open an existing log, scanning for the valid frame prefix and cutting
    /// off any torn tail so new frames append after the last good one.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(WAL_FILE);
        if !path.exists() {
            return Self::create(dir);
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open WAL at {:?}", path))?;

        let valid_frames = scan_valid_frames(&mut file, |_, _, _| Ok(()))?;
        let offset = valid_frames as u64 * WAL_FRAME_SIZE as u64;

        file.set_len(offset)
            .wrap_err("failed to trim torn WAL tail")?;
        file.seek(SeekFrom::Start(offset))
            .wrap_err("failed to seek WAL to append position")?;

        Ok(Self {
            path,
            file,
            offset,
            frame_count: valid_frames,
        })
    }

    pub fn append(&mut self, file_id: u32, page_no: u32, page_data: &[u8]) -> Result<()> {
        ensure!(
            page_data.len() == PAGE_SIZE,
            "WAL frame needs a full page image: {} != {}",
            page_data.len(),
            PAGE_SIZE
        );

        let mut header = WalFrameHeader::new(file_id, page_no, self.frame_count + 1);
        header.checksum = U64::new(compute_checksum(&header, page_data));

        let mut frame = Vec::with_capacity(WAL_FRAME_SIZE);
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(page_data);

        self.file
            .seek(SeekFrom::Start(self.offset))
            .wrap_err("failed to seek WAL to append position")?;
        self.file
            .write_all(&frame)
            .wrap_err_with(|| format!("failed to append WAL frame at {:?}", self.path))?;

        self.offset += WAL_FRAME_SIZE as u64;
        self.frame_count += 1;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data().wrap_err("failed to sync WAL")
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.file
            .set_len(0)
            .wrap_err("failed to truncate WAL")?;
        self.file.sync_data().wrap_err("failed to sync WAL")?;
        self.offset = 0;
        self.frame_count = 0;
        Ok(())
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.offset
    }

    /// Replay every valid frame of the log in `dir`, calling `apply` with
    /// file id, page number, and page image. Returns the number of frames
    /// applied; zero if the log does not exist.
    pub fn replay(
        dir: &Path,
        apply: impl FnMut(u32, u32, &[u8]) -> Result<()>,
    ) -> Result<u32> {
        let path = dir.join(WAL_FILE);
        if !path.exists() {
            return Ok(0);
        }

        let mut file = File::open(&path)
            .wrap_err_with(|| format!("failed to open WAL at {:?}", path))?;
        scan_valid_frames(&mut file, apply)
    }
}

/// Read frames from the start of `file`, stopping at EOF, a short read, or a
/// checksum mismatch. Calls `apply` for each valid frame.
fn scan_valid_frames(
    file: &mut File,
    mut apply: impl FnMut(u32, u32, &[u8]) -> Result<()>,
) -> Result<u32> {
    file.seek(SeekFrom::Start(0))
        .wrap_err("failed to seek WAL to start")?;

    let mut frames = 0u32;
    let mut header_buf = [0u8; WAL_FRAME_HEADER_SIZE];
    let mut page_buf = vec![0u8; PAGE_SIZE];

    loop {
        match file.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).wrap_err("failed to read WAL frame header"),
        }
        match file.read_exact(&mut page_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).wrap_err("failed to read WAL frame image"),
        }

        let header = match WalFrameHeader::ref_from_bytes(&header_buf[..]) {
            Ok(h) => h,
            Err(_) => break,
        };
        if !validate_checksum(header, &page_buf) {
            break;
        }

        apply(header.file_id(), header.page_no(), &page_buf)?;
        frames += 1;
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn frame_header_size_is_32() {
        assert_eq!(size_of::<WalFrameHeader>(), 32);
    }

    #[test]
    fn append_and_replay() {
        let dir = tempdir().unwrap();
        let page_a = vec![0xAAu8; PAGE_SIZE];
        let page_b = vec![0xBBu8; PAGE_SIZE];

        {
            let mut wal = Wal::create(dir.path()).unwrap();
            wal.append(1, 4, &page_a).unwrap();
            wal.append(3, 9, &page_b).unwrap();
            wal.sync().unwrap();
            assert_eq!(wal.frame_count(), 2);
        }

        let mut seen = Vec::new();
        let frames = Wal::replay(dir.path(), |file_id, page_no, data| {
            seen.push((file_id, page_no, data[0]));
            Ok(())
        })
        .unwrap();

        assert_eq!(frames, 2);
        assert_eq!(seen, vec![(1, 4, 0xAA), (3, 9, 0xBB)]);
    }

    #[test]
    fn replay_without_log_is_empty() {
        let dir = tempdir().unwrap();

        let frames = Wal::replay(dir.path(), |_, _, _| Ok(())).unwrap();

        assert_eq!(frames, 0);
    }

    #[test]
    fn corrupted_frame_terminates_replay() {
        let dir = tempdir().unwrap();
        let page = vec![0x11u8; PAGE_SIZE];

        {
            let mut wal = Wal::create(dir.path()).unwrap();
            wal.append(1, 1, &page).unwrap();
            wal.append(1, 2, &page).unwrap();
            wal.append(1, 3, &page).unwrap();
            wal.sync().unwrap();
        }

        // flip a byte inside the second frame's image
        let path = dir.path().join(WAL_FILE);
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        let offset = WAL_FRAME_SIZE as u64 + WAL_FRAME_HEADER_SIZE as u64 + 100;
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        let frames = Wal::replay(dir.path(), |_, _, _| Ok(())).unwrap();

        assert_eq!(frames, 1);
    }

    #[test]
    fn open_trims_torn_tail() {
        let dir = tempdir().unwrap();
        let page = vec![0x22u8; PAGE_SIZE];

        {
            let mut wal = Wal::create(dir.path()).unwrap();
            wal.append(1, 1, &page).unwrap();
            wal.sync().unwrap();
        }

        // simulate a torn append: half a frame of garbage at the tail
        let path = dir.path().join(WAL_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&vec![0xEE; WAL_FRAME_SIZE / 2]).unwrap();
        drop(file);

        let wal = Wal::open(dir.path()).unwrap();

        assert_eq!(wal.frame_count(), 1);
        assert_eq!(wal.size_bytes(), WAL_FRAME_SIZE as u64);
    }

    #[test]
    fn truncate_resets_log() {
        let dir = tempdir().unwrap();
        let page = vec![0u8; PAGE_SIZE];

        let mut wal = Wal::create(dir.path()).unwrap();
        wal.append(1, 1, &page).unwrap();
        wal.truncate().unwrap();

        assert_eq!(wal.frame_count(), 0);
        assert_eq!(wal.size_bytes(), 0);
        let frames = Wal::replay(dir.path(), |_, _, _| Ok(())).unwrap();
        assert_eq!(frames, 0);
    }
}
