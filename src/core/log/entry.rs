// src/core/log/entry.rs

//! The log entry record: a fixed 36-byte header followed by the payload.
//!
//! Layout (all little-endian):
//!
//! ```text
//! crc(u32) | len(u32) | term(u64) | seq(u64) | cid(u64) | flags(u32) | data
//! ```
//!
//! `len` is the total encoded length including the header. `crc` covers every
//! byte after itself. Accessors work directly on byte slices so entries can be
//! read in place from a mmap region without copying.

use crate::core::buffer::Buf;
use crc::{CRC_32_ISCSI, Crc};

pub const CRC_LEN: usize = 4;
pub const HEADER_SIZE: usize = 36;

const LEN_OFFSET: usize = 4;
const TERM_OFFSET: usize = 8;
const SEQ_OFFSET: usize = 16;
const CID_OFFSET: usize = 24;
const FLAGS_OFFSET: usize = 32;
const DATA_OFFSET: usize = 36;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[inline]
fn get_u32(e: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(e[off..off + 4].try_into().unwrap())
}

#[inline]
fn get_u64(e: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(e[off..off + 8].try_into().unwrap())
}

pub fn encoded_len(data_len: usize) -> usize {
    HEADER_SIZE + data_len
}

pub fn crc(e: &[u8]) -> u32 {
    get_u32(e, 0)
}

pub fn len(e: &[u8]) -> u32 {
    get_u32(e, LEN_OFFSET)
}

pub fn term(e: &[u8]) -> u64 {
    get_u64(e, TERM_OFFSET)
}

pub fn seq(e: &[u8]) -> u64 {
    get_u64(e, SEQ_OFFSET)
}

pub fn cid(e: &[u8]) -> u64 {
    get_u64(e, CID_OFFSET)
}

pub fn flags(e: &[u8]) -> u32 {
    get_u32(e, FLAGS_OFFSET)
}

pub fn data(e: &[u8]) -> &[u8] {
    &e[DATA_OFFSET..len(e) as usize]
}

/// Appends a full encoded entry to `buf`, back-filling the CRC.
pub fn encode(buf: &mut Buf, term: u64, seq: u64, cid: u64, flags: u32, data: &[u8]) {
    let head = buf.wpos();
    let total = encoded_len(data.len()) as u32;

    buf.put_u32(0); // crc, patched below
    buf.put_u32(total);
    buf.put_u64(term);
    buf.put_u64(seq);
    buf.put_u64(cid);
    buf.put_u32(flags);
    buf.put_raw(data);

    let crc = CRC32.checksum(&buf.data()[head + CRC_LEN..head + total as usize]);
    buf.set_u32_at(head, crc);
}

/// Writes a full encoded entry into `dst` and returns its total length.
/// `dst` must be at least `encoded_len(data.len())` bytes.
pub fn encode_into(dst: &mut [u8], term: u64, seq: u64, cid: u64, flags: u32, data: &[u8]) -> usize {
    let total = encoded_len(data.len());

    dst[LEN_OFFSET..LEN_OFFSET + 4].copy_from_slice(&(total as u32).to_le_bytes());
    dst[TERM_OFFSET..TERM_OFFSET + 8].copy_from_slice(&term.to_le_bytes());
    dst[SEQ_OFFSET..SEQ_OFFSET + 8].copy_from_slice(&seq.to_le_bytes());
    dst[CID_OFFSET..CID_OFFSET + 8].copy_from_slice(&cid.to_le_bytes());
    dst[FLAGS_OFFSET..FLAGS_OFFSET + 4].copy_from_slice(&flags.to_le_bytes());
    dst[DATA_OFFSET..total].copy_from_slice(data);

    let crc = CRC32.checksum(&dst[CRC_LEN..total]);
    dst[..CRC_LEN].copy_from_slice(&crc.to_le_bytes());

    total
}

/// Validates the entry at the start of `buf`: header present, length within
/// the slice, checksum matching. Returns the entry's total length on success
/// and `None` on any mismatch, leaving the caller's cursor untouched.
pub fn decode(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_SIZE {
        return None;
    }

    let total = len(buf) as usize;
    if total < HEADER_SIZE || total > buf.len() {
        return None;
    }

    let stored = crc(buf);
    let computed = CRC32.checksum(&buf[CRC_LEN..total]);
    if stored != computed {
        return None;
    }

    Some(total)
}

/// Iterates entries over a contiguous, already-validated region by stepping
/// `len` at a time.
pub fn iter(region: &[u8]) -> EntryIter<'_> {
    EntryIter { region, pos: 0 }
}

pub struct EntryIter<'a> {
    region: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.pos + HEADER_SIZE > self.region.len() {
            return None;
        }
        let e = &self.region[self.pos..];
        let total = len(e) as usize;
        if total < HEADER_SIZE || self.pos + total > self.region.len() {
            return None;
        }
        self.pos += total;
        Some(&e[..total])
    }
}
