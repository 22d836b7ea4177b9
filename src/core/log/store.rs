// src/core/log/store.rs

//! The log store: exactly two pages rotated around the snapshot boundary.
//!
//! `pages[0]` holds the older range and is the one a snapshot compacts;
//! `pages[1]` takes over as the write target when `pages[0]` fills. The
//! current page is `pages[1]` if it has entries, else `pages[0]`. Once a
//! snapshot of `pages[0]` completes, `snapshot_taken` clears it and swaps,
//! leaving a fresh empty page for the next rotation.

use crate::core::errors::{ResqlError, Result};
use crate::core::log::entry;
use crate::core::log::page::Page;
use std::path::Path;
use tracing::info;

pub const STORE_MAX_ENTRY_SIZE: usize = 512 * 1024 * 1024;

const PAGE_FILE_0: &str = "page.0.resql";
const PAGE_FILE_1: &str = "page.1.resql";

pub struct Store {
    pages: [Page; 2],
    curr: usize,
    pub last_index: u64,
    pub last_term: u64,
    pub ss_term: u64,
    pub ss_index: u64,
}

impl Store {
    pub fn open(dir: &Path, ss_term: u64, ss_index: u64) -> Result<Store> {
        let p0 = Page::open(&dir.join(PAGE_FILE_0), None, ss_index)?;
        let p1 = Page::open(&dir.join(PAGE_FILE_1), None, ss_index)?;
        let mut pages = [p0, p1];

        // Page files carry no identity; the lower prev_index is the older one.
        if pages[1].prev_index < pages[0].prev_index {
            pages.swap(0, 1);
        }

        // Anything inconsistent with the snapshot boundary is stale.
        if pages[0].prev_index != ss_index {
            pages[0].clear(ss_index);
        }
        if pages[1].prev_index != pages[0].last_index() {
            pages[1].clear(0);
        }

        // A rotation leaves the fresh empty page with the lower prev_index;
        // undo the sort so pages[0] is the one actually holding entries.
        if pages[0].is_empty() && !pages[1].is_empty() {
            pages.swap(0, 1);
        }

        for p in &pages {
            info!(
                "log page [{}] from ({}, {}]",
                p.path().display(),
                p.prev_index,
                p.last_index()
            );
        }

        let curr = if pages[1].is_empty() { 0 } else { 1 };
        let last_index = pages[curr].last_index();
        let last_term = if pages[curr].is_empty() {
            ss_term
        } else {
            pages[curr].last_term()
        };

        Ok(Store {
            pages,
            curr,
            last_index,
            last_term,
            ss_term,
            ss_index,
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        self.pages[self.curr].flush(self.last_index)
    }

    /// Index of the last entry covered by the pending rotation, or `u64::MAX`
    /// when no rotation is pending (the second page is still empty).
    pub fn rotation_index(&self) -> u64 {
        if self.pages[1].is_empty() {
            return u64::MAX;
        }
        self.pages[0].last_index()
    }

    /// The sealed page a snapshot should compact.
    pub fn rotation_page(&self) -> &Page {
        &self.pages[0]
    }

    /// Called once the compaction of `pages[0]` has been folded into the
    /// snapshot file: the boundary advances, the page is recycled.
    pub fn snapshot_taken(&mut self) {
        debug_assert!(!self.pages[0].is_empty());

        self.ss_index = self.pages[0].last_index();
        self.ss_term = self.pages[0].last_term();

        self.pages[0].clear(0);
        self.pages.swap(0, 1);
        self.curr = 0;
    }

    /// Appends a freshly created entry, assigning it `last_index + 1`.
    pub fn create_entry(
        &mut self,
        term: u64,
        seq: u64,
        cid: u64,
        flags: u32,
        data: &[u8],
    ) -> Result<()> {
        let size = entry::encoded_len(data.len());
        debug_assert!(size < STORE_MAX_ENTRY_SIZE);

        if size > self.pages[self.curr].quota() {
            if self.curr != 1 {
                self.curr = 1;
                let last = self.last_index;
                while size > self.pages[1].quota() {
                    self.pages[1].expand()?;
                }
                self.pages[1].clear(last);
            }
            if size > self.pages[1].quota() {
                return Err(ResqlError::Full);
            }
        }

        self.pages[self.curr].create_entry(term, seq, cid, flags, data);
        self.last_index += 1;
        self.last_term = term;

        Ok(())
    }

    /// Appends a replicated entry at `index`, which must be `last_index + 1`.
    pub fn put_entry(&mut self, index: u64, e: &[u8]) -> Result<()> {
        debug_assert_eq!(index, self.last_index + 1);
        debug_assert!(self.last_term <= entry::term(e));

        let size = entry::len(e) as usize;

        if size > self.pages[self.curr].quota() {
            if self.curr != 1 {
                self.curr = 1;
                let last = self.last_index;
                self.pages[1].clear(last);
            }
            if size > self.pages[1].quota() {
                if self.pages[1].is_empty() {
                    self.pages[1].expand()?;
                } else {
                    return Err(ResqlError::Full);
                }
            }
            if size > self.pages[1].quota() {
                return Err(ResqlError::Full);
            }
        }

        self.pages[self.curr].put_entry(e);
        self.last_index += 1;
        self.last_term = entry::term(e);

        Ok(())
    }

    /// Grows the active page until `size` more bytes fit. Used when the
    /// caller decides disk-full must be forced through (internal entries).
    pub fn reserve(&mut self, size: usize) -> Result<()> {
        debug_assert_eq!(self.curr, 1);
        self.pages[self.curr].reserve(size)
    }

    pub fn entry_at(&self, index: u64) -> Option<&[u8]> {
        self.pages[0]
            .entry_at(index)
            .or_else(|| self.pages[1].entry_at(index))
    }

    /// Term of the entry at `index`, falling back to the snapshot term for
    /// indexes at or below the boundary.
    pub fn term_of(&self, index: u64) -> u64 {
        self.entry_at(index).map(entry::term).unwrap_or(self.ss_term)
    }

    /// A contiguous region of entries starting at `index`, limited to
    /// roughly `limit` bytes.
    pub fn entries_from(&self, index: u64, limit: u32) -> Option<(&[u8], u32)> {
        self.pages[0]
            .entries_from(index, limit)
            .or_else(|| self.pages[1].entries_from(index, limit))
    }

    /// Truncates the suffix after `index` on both pages.
    pub fn remove_after(&mut self, index: u64) -> Result<()> {
        self.pages[0].remove_after(index)?;
        self.pages[1].remove_after(index)?;

        if self.pages[1].is_empty() {
            self.curr = 0;
        }

        if self.pages[self.curr].is_empty() {
            self.last_index = self.ss_index;
            self.last_term = self.ss_term;
            let p = &mut self.pages[self.curr];
            if p.prev_index != self.ss_index {
                p.clear(self.ss_index);
            }
        } else {
            self.last_index = self.pages[self.curr].last_index();
            self.last_term = self.pages[self.curr].last_term();
        }

        Ok(())
    }
}
