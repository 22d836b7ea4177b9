// src/core/cmd.rs

//! Payload encoding for replicated commands. The command kind travels in the
//! entry's `flags` field; the payload layout here is what every replica
//! decodes inside `apply`.

use crate::core::buffer::{Buf, RawBuf};
use crate::core::errors::{ResqlError, Result};
use crate::core::meta::Meta;

pub const CMD_INIT: u32 = 0;
pub const CMD_META: u32 = 1;
pub const CMD_TERM: u32 = 2;
pub const CMD_REQUEST: u32 = 3;
pub const CMD_CONNECT: u32 = 4;
pub const CMD_DISCONNECT: u32 = 5;
pub const CMD_TIMESTAMP: u32 = 6;
pub const CMD_INFO: u32 = 7;
pub const CMD_LOG: u32 = 8;

/// Seed size for the deterministic RNG carried by INIT.
pub const INIT_RAND_LEN: usize = 256;

#[derive(Debug)]
pub struct InitCmd {
    pub realtime: u64,
    pub monotonic: u64,
    pub rand: [u8; INIT_RAND_LEN],
}

pub fn encode_init(buf: &mut Buf, realtime: u64, monotonic: u64, rand: &[u8; INIT_RAND_LEN]) {
    buf.put_u64(realtime);
    buf.put_u64(monotonic);
    buf.put_raw(rand);
}

pub fn decode_init(r: &mut RawBuf) -> Result<InitCmd> {
    let realtime = r.get_u64();
    let monotonic = r.get_u64();
    let bytes = r.get_bytes(INIT_RAND_LEN);
    if !r.valid() {
        return Err(ResqlError::Invalid);
    }

    let mut rand = [0u8; INIT_RAND_LEN];
    rand.copy_from_slice(bytes);

    Ok(InitCmd {
        realtime,
        monotonic,
        rand,
    })
}

/// TERM and TIMESTAMP both carry a clock sample.
#[derive(Debug, Clone, Copy)]
pub struct ClockCmd {
    pub realtime: u64,
    pub monotonic: u64,
}

pub fn encode_clock(buf: &mut Buf, realtime: u64, monotonic: u64) {
    buf.put_u64(realtime);
    buf.put_u64(monotonic);
}

pub fn decode_clock(r: &mut RawBuf) -> Result<ClockCmd> {
    let realtime = r.get_u64();
    let monotonic = r.get_u64();
    if !r.valid() {
        return Err(ResqlError::Invalid);
    }
    Ok(ClockCmd {
        realtime,
        monotonic,
    })
}

pub fn encode_meta(buf: &mut Buf, meta: &Meta) {
    meta.encode(buf);
}

pub fn decode_meta(r: &mut RawBuf) -> Result<Meta> {
    Meta::decode(r)
}

#[derive(Debug)]
pub struct ConnectCmd<'a> {
    pub name: &'a str,
    pub local: &'a str,
    pub remote: &'a str,
}

pub fn encode_connect(buf: &mut Buf, name: &str, local: &str, remote: &str) {
    buf.put_str(name);
    buf.put_str(local);
    buf.put_str(remote);
}

pub fn decode_connect<'a>(r: &mut RawBuf<'a>) -> Result<ConnectCmd<'a>> {
    let name = r.get_str();
    let local = r.get_str();
    let remote = r.get_str();
    if !r.valid() {
        return Err(ResqlError::Invalid);
    }
    Ok(ConnectCmd {
        name,
        local,
        remote,
    })
}

#[derive(Debug)]
pub struct DisconnectCmd<'a> {
    pub name: &'a str,
    pub clean: bool,
}

pub fn encode_disconnect(buf: &mut Buf, name: &str, clean: bool) {
    buf.put_str(name);
    buf.put_bool(clean);
}

pub fn decode_disconnect<'a>(r: &mut RawBuf<'a>) -> Result<DisconnectCmd<'a>> {
    let name = r.get_str();
    let clean = r.get_bool();
    if !r.valid() {
        return Err(ResqlError::Invalid);
    }
    Ok(DisconnectCmd { name, clean })
}

#[derive(Debug)]
pub struct LogCmd<'a> {
    pub level: &'a str,
    pub log: &'a str,
}

pub fn encode_log(buf: &mut Buf, level: &str, log: &str) {
    buf.put_str(level);
    buf.put_str(log);
}

pub fn decode_log<'a>(r: &mut RawBuf<'a>) -> Result<LogCmd<'a>> {
    let level = r.get_str();
    let log = r.get_str();
    if !r.valid() {
        return Err(ResqlError::Invalid);
    }
    Ok(LogCmd { level, log })
}
