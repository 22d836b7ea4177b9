// src/core/log/page.rs

//! A single mmap-backed log page: a fixed header, a contiguous run of
//! entries, and a 4-byte zero end-marker.
//!
//! Header layout (32 bytes, little-endian):
//!
//! ```text
//! version(u32) | reserved(u32) | prev_index(u64) | reserved(12) | crc(u32)
//! ```
//!
//! `prev_index` is the index of the entry immediately before the first entry
//! on this page, so the logical index of entry `i` is `prev_index + i + 1`.
//! On open, entries are scanned sequentially until the end-marker or a CRC
//! failure; a partial tail is silently truncated by leaving the write cursor
//! where reading stopped.

use crate::core::errors::{ResqlError, Result};
use crate::core::log::entry;
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

const PAGE_VERSION: u32 = 1;
const PAGE_HEADER_LEN: usize = 32;
const PAGE_PREV_INDEX_OFFSET: usize = 8;
const PAGE_CRC_OFFSET: usize = 28;
const PAGE_END_MARK_LEN: usize = 4;

/// msync granularity: flushes start on a page-aligned boundary.
const FLUSH_ALIGN: usize = 4096;

pub const PAGE_INITIAL_SIZE: u64 = 32 * 1024 * 1024;
pub const PAGE_MAX_SIZE: u64 = 1024 * 1024 * 1024;

fn full_or_io(e: std::io::Error) -> ResqlError {
    if e.raw_os_error() == Some(libc::ENOSPC) {
        ResqlError::Full
    } else {
        ResqlError::Io(e.into())
    }
}

pub struct Page {
    path: PathBuf,
    file: File,
    map: MmapMut,
    pub prev_index: u64,
    /// Byte offset of each entry within the map, in index order.
    offsets: Vec<usize>,
    wpos: usize,
    flush_pos: usize,
    flush_index: u64,
}

impl Page {
    /// Opens (or creates) a page file, mapping at least
    /// `max(min_len, file size, 32 MiB)` bytes. A bad header CRC reinitializes
    /// the page with `prev_index`; a valid header is followed by an entry scan
    /// that drops any partial tail.
    pub fn open(path: &Path, min_len: Option<u64>, prev_index: u64) -> Result<Page> {
        let file_len = std::fs::metadata(path).map(|m| m.len()).ok();

        let cap = min_len
            .unwrap_or(0)
            .max(file_len.unwrap_or(0))
            .max(PAGE_INITIAL_SIZE);
        if cap > PAGE_MAX_SIZE {
            return Err(ResqlError::Config(format!("page too big: {cap}")));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file_len.unwrap_or(0) < cap {
            file.set_len(cap).map_err(full_or_io)?;
        }

        let map = unsafe { MmapMut::map_mut(&file).map_err(full_or_io)? };

        let mut page = Page {
            path: path.to_path_buf(),
            file,
            map,
            prev_index,
            offsets: Vec::with_capacity(1024),
            wpos: PAGE_HEADER_LEN,
            flush_pos: 0,
            flush_index: 0,
        };

        let stored = u32::from_le_bytes(
            page.map[PAGE_CRC_OFFSET..PAGE_CRC_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        let computed = entry::CRC32.checksum(&page.map[..PAGE_CRC_OFFSET]);

        if stored != computed {
            if file_len.is_some() {
                error!("corrupt page header: {}", path.display());
            }
            page.clear(prev_index);
            return Ok(page);
        }

        page.prev_index = u64::from_le_bytes(
            page.map[PAGE_PREV_INDEX_OFFSET..PAGE_PREV_INDEX_OFFSET + 8]
                .try_into()
                .unwrap(),
        );
        page.read_entries();

        Ok(page)
    }

    fn read_entries(&mut self) {
        self.offsets.clear();

        let mut pos = PAGE_HEADER_LEN;
        loop {
            let remaining = self.map.len() - pos;
            if remaining == 0
                || (remaining >= PAGE_END_MARK_LEN
                    && self.map[pos..pos + 4] == [0, 0, 0, 0])
            {
                break;
            }

            match entry::decode(&self.map[pos..]) {
                Some(total) => {
                    self.offsets.push(pos);
                    pos += total;
                }
                None => {
                    warn!("partial entry on page: {}", self.path.display());
                    break;
                }
            }
        }

        self.wpos = pos;
    }

    /// Resets the page to empty with a fresh header.
    pub fn clear(&mut self, prev_index: u64) {
        self.prev_index = prev_index;
        self.flush_pos = 0;
        self.flush_index = 0;
        self.offsets.clear();

        self.map[..PAGE_HEADER_LEN].fill(0);
        self.map[..4].copy_from_slice(&PAGE_VERSION.to_le_bytes());
        self.map[PAGE_PREV_INDEX_OFFSET..PAGE_PREV_INDEX_OFFSET + 8]
            .copy_from_slice(&prev_index.to_le_bytes());
        let crc = entry::CRC32.checksum(&self.map[..PAGE_CRC_OFFSET]);
        self.map[PAGE_CRC_OFFSET..PAGE_CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());

        self.wpos = PAGE_HEADER_LEN;
        self.map[PAGE_HEADER_LEN..PAGE_HEADER_LEN + PAGE_END_MARK_LEN].fill(0);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn entry_count(&self) -> u64 {
        self.offsets.len() as u64
    }

    pub fn last_index(&self) -> u64 {
        self.prev_index + self.offsets.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        let off = *self.offsets.last().expect("term of empty page");
        entry::term(&self.map[off..])
    }

    /// Bytes still available for one more entry, keeping headroom for the
    /// entry header and the end marker.
    pub fn quota(&self) -> usize {
        (self.map.len() - self.wpos).saturating_sub(entry::HEADER_SIZE + PAGE_END_MARK_LEN)
    }

    pub fn cap(&self) -> usize {
        self.map.len()
    }

    /// msyncs the page-aligned dirty range `[flush_pos & !4095, wpos)` once
    /// `index` is on this page and not yet flushed. This is the single fsync
    /// cost of the system; failure is unrecoverable.
    pub fn flush(&mut self, index: u64) -> Result<()> {
        if index <= self.prev_index || index > self.last_index() || self.flush_index >= index {
            return Ok(());
        }

        let pos = self.wpos;
        if self.flush_pos >= pos {
            return Ok(());
        }

        let start = self.flush_pos & !(FLUSH_ALIGN - 1);
        self.map
            .flush_range(start, pos - start)
            .map_err(|e| ResqlError::Fatal(format!("msync: {e}")))?;

        self.flush_pos = pos;
        self.flush_index = self.last_index();

        Ok(())
    }

    /// Encodes a new entry in place. The caller must have checked `quota()`.
    pub fn create_entry(&mut self, term: u64, seq: u64, cid: u64, flags: u32, data: &[u8]) {
        debug_assert!(entry::encoded_len(data.len()) <= self.quota());

        let pos = self.wpos;
        let total = entry::encode_into(&mut self.map[pos..], term, seq, cid, flags, data);
        self.offsets.push(pos);
        self.wpos = pos + total;
        self.map[self.wpos..self.wpos + PAGE_END_MARK_LEN].fill(0);
    }

    /// Copies an already-encoded entry in place. The caller must have checked
    /// `quota()`; the entry's CRC is assumed valid (it was checked on decode).
    pub fn put_entry(&mut self, e: &[u8]) {
        let total = entry::len(e) as usize;
        debug_assert!(total <= self.quota());
        debug_assert_eq!(entry::crc(e), entry::CRC32.checksum(&e[entry::CRC_LEN..total]));

        let pos = self.wpos;
        self.map[pos..pos + total].copy_from_slice(e);
        self.offsets.push(pos);
        self.wpos = pos + total;
        self.map[self.wpos..self.wpos + PAGE_END_MARK_LEN].fill(0);
    }

    pub fn entry_at(&self, index: u64) -> Option<&[u8]> {
        if index <= self.prev_index || index > self.last_index() {
            return None;
        }

        let off = self.offsets[(index - self.prev_index - 1) as usize];
        let total = entry::len(&self.map[off..]) as usize;
        Some(&self.map[off..off + total])
    }

    /// Returns the contiguous byte region starting at `index`, stopping after
    /// the first entry that pushes the total at or past `limit`. Also returns
    /// how many entries the region holds.
    pub fn entries_from(&self, index: u64, limit: u32) -> Option<(&[u8], u32)> {
        if index <= self.prev_index || index > self.last_index() {
            return None;
        }

        let first = (index - self.prev_index - 1) as usize;
        let start = self.offsets[first];
        let mut total = 0usize;
        let mut count = 0u32;

        for off in &self.offsets[first..] {
            total += entry::len(&self.map[*off..]) as usize;
            count += 1;
            if total >= limit as usize {
                break;
            }
        }

        Some((&self.map[start..start + total], count))
    }

    /// Rewinds the write cursor so `index` is the last entry, overwriting the
    /// end marker. Entries at or below `prev_index` mean a full clear.
    pub fn remove_after(&mut self, index: u64) -> Result<()> {
        if index <= self.prev_index {
            self.clear(self.prev_index);
            return Ok(());
        }

        if index >= self.last_index() {
            return Ok(());
        }

        let off = self.offsets[(index - self.prev_index) as usize];
        self.wpos = off;
        self.map[off..off + PAGE_END_MARK_LEN].fill(0);
        self.offsets.truncate((index - self.prev_index) as usize);

        self.flush_pos = self.flush_pos.min(off - PAGE_END_MARK_LEN);
        self.flush_index = self.flush_index.min(index.saturating_sub(1));
        self.flush(index)
    }

    /// One growth step: double the capacity, rounded to a power of two,
    /// capped at 1 GiB. Only legal on the active write page.
    pub fn expand(&mut self) -> Result<()> {
        let cap = (self.map.len() as u64 + 1).next_power_of_two();
        if cap > PAGE_MAX_SIZE {
            return Err(ResqlError::Full);
        }
        self.remap(cap)
    }

    /// Grows until `size` more bytes fit, or the page hits its maximum.
    pub fn reserve(&mut self, size: usize) -> Result<()> {
        while self.quota() < size {
            self.expand()?;
        }
        Ok(())
    }

    fn remap(&mut self, cap: u64) -> Result<()> {
        self.map
            .flush()
            .map_err(|e| ResqlError::Fatal(format!("msync: {e}")))?;

        self.file.set_len(cap).map_err(full_or_io)?;
        self.map = unsafe { MmapMut::map_mut(&self.file).map_err(full_or_io)? };

        Ok(())
    }
}
