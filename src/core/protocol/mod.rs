// src/core/protocol/mod.rs

//! The wire message model. Every message is `u32 total_length | u8 type |
//! body`, with `total_length` counting itself. Bodies are the little-endian
//! buffer encoding; client request/response batches travel as raw bytes and
//! are interpreted by the state machine.

mod codec;

pub use codec::MsgCodec;

use bytes::Bytes;

/// Maximum encoded message size.
pub const MSG_MAX_SIZE: u32 = 2_000_000_000;

/// Protocol identifier carried in connect requests.
pub const PROTOCOL: &str = "resql";

/// Remote kind in connect request flags.
pub const REMOTE_CLIENT: u32 = 0;
pub const REMOTE_NODE: u32 = 1;

/// Result codes carried by connect/disconnect responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgRc {
    Ok = 0x00,
    Err = 0x01,
    ClusterNameMismatch = 0x02,
    Corrupt = 0x03,
    Unexpected = 0x04,
    Timeout = 0x05,
    NotLeader = 0x06,
    DiskFull = 0x07,
}

impl MsgRc {
    pub fn from_u8(v: u8) -> Option<MsgRc> {
        Some(match v {
            0x00 => MsgRc::Ok,
            0x01 => MsgRc::Err,
            0x02 => MsgRc::ClusterNameMismatch,
            0x03 => MsgRc::Corrupt,
            0x04 => MsgRc::Unexpected,
            0x05 => MsgRc::Timeout,
            0x06 => MsgRc::NotLeader,
            0x07 => MsgRc::DiskFull,
            _ => return None,
        })
    }
}

/// Flags inside client request/response batch bodies.
pub mod flag {
    pub const OK: u8 = 0x00;
    pub const ERROR: u8 = 0x01;
    pub const STMT: u8 = 0x02;
    pub const STMT_ID: u8 = 0x03;
    pub const STMT_PREPARE: u8 = 0x04;
    pub const STMT_DEL_PREPARED: u8 = 0x05;
    pub const OP: u8 = 0x06;
    pub const OP_END: u8 = 0x07;
    pub const ROW: u8 = 0x08;
    pub const MSG_END: u8 = 0x09;
}

/// Parameter value types inside bind sections and row blocks.
pub mod param {
    pub const INTEGER: u8 = 0x00;
    pub const FLOAT: u8 = 0x01;
    pub const TEXT: u8 = 0x02;
    pub const BLOB: u8 = 0x03;
    pub const NULL: u8 = 0x04;
}

/// Parameter binding kinds.
pub mod bind {
    pub const NAME: u8 = 0x00;
    pub const INDEX: u8 = 0x01;
    pub const END: u8 = 0x02;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    ConnectReq = 0x00,
    ConnectResp = 0x01,
    DisconnectReq = 0x02,
    DisconnectResp = 0x03,
    ClientReq = 0x04,
    ClientResp = 0x05,
    AppendReq = 0x06,
    AppendResp = 0x07,
    PrevoteReq = 0x08,
    PrevoteResp = 0x09,
    ReqvoteReq = 0x0A,
    ReqvoteResp = 0x0B,
    SnapshotReq = 0x0C,
    SnapshotResp = 0x0D,
    InfoReq = 0x0E,
    ShutdownReq = 0x0F,
}

/// A parsed wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    ConnectReq {
        flags: u32,
        protocol: String,
        cluster: String,
        name: String,
    },
    ConnectResp {
        rc: MsgRc,
        seq: u64,
        term: u64,
        nodes: String,
    },
    DisconnectReq {
        rc: MsgRc,
        flags: u32,
    },
    DisconnectResp {
        rc: MsgRc,
        flags: u32,
    },
    ClientReq {
        readonly: bool,
        seq: u64,
        batch: Bytes,
    },
    /// `batch` is the response body (result flags through MSG_END).
    ClientResp {
        batch: Bytes,
    },
    AppendReq {
        term: u64,
        prev_index: u64,
        prev_term: u64,
        leader_commit: u64,
        round: u64,
        entries: Bytes,
    },
    AppendResp {
        term: u64,
        index: u64,
        round: u64,
        success: bool,
    },
    PrevoteReq {
        term: u64,
        last_term: u64,
        last_index: u64,
    },
    PrevoteResp {
        term: u64,
        index: u64,
        granted: bool,
    },
    ReqvoteReq {
        term: u64,
        last_term: u64,
        last_index: u64,
    },
    ReqvoteResp {
        term: u64,
        index: u64,
        granted: bool,
    },
    SnapshotReq {
        term: u64,
        ss_term: u64,
        ss_index: u64,
        offset: u64,
        done: bool,
        data: Bytes,
    },
    SnapshotResp {
        term: u64,
        success: bool,
        done: bool,
    },
    InfoReq {
        data: Bytes,
    },
    ShutdownReq {
        now: bool,
    },
}
