// src/core/protocol/codec.rs

//! `tokio_util` codec for the length-prefixed wire protocol.
//!
//! The decoder returns `Ok(None)` until a complete frame is buffered, so the
//! `Framed` stream simply waits for more data; any malformed frame is an
//! error that tears the connection down.

use crate::core::buffer::{Buf, RawBuf};
use crate::core::errors::ResqlError;
use crate::core::protocol::{MSG_MAX_SIZE, Msg, MsgRc, MsgType};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const LEN_SIZE: usize = 4;
const FIXED_SIZE: usize = 5; // length + type

#[derive(Debug, Default)]
pub struct MsgCodec;

impl Decoder for MsgCodec {
    type Item = Msg;
    type Error = ResqlError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Msg>, ResqlError> {
        if src.len() < LEN_SIZE {
            return Ok(None);
        }

        let total = u32::from_le_bytes(src[..LEN_SIZE].try_into().unwrap());
        if total < FIXED_SIZE as u32 || total > MSG_MAX_SIZE {
            return Err(ResqlError::Invalid);
        }

        let total = total as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total).freeze();
        parse(frame).map(Some)
    }
}

fn parse(frame: Bytes) -> Result<Msg, ResqlError> {
    let kind = frame[LEN_SIZE];
    let body = frame.slice(FIXED_SIZE..);
    let mut r = RawBuf::new(&body);

    let msg = match kind {
        k if k == MsgType::ConnectReq as u8 => Msg::ConnectReq {
            flags: r.get_u32(),
            protocol: r.get_string(),
            cluster: r.get_string(),
            name: r.get_string(),
        },
        k if k == MsgType::ConnectResp as u8 => Msg::ConnectResp {
            rc: MsgRc::from_u8(r.get_u8()).ok_or(ResqlError::Invalid)?,
            seq: r.get_u64(),
            term: r.get_u64(),
            nodes: r.get_string(),
        },
        k if k == MsgType::DisconnectReq as u8 => Msg::DisconnectReq {
            rc: MsgRc::from_u8(r.get_u8()).ok_or(ResqlError::Invalid)?,
            flags: r.get_u32(),
        },
        k if k == MsgType::DisconnectResp as u8 => Msg::DisconnectResp {
            rc: MsgRc::from_u8(r.get_u8()).ok_or(ResqlError::Invalid)?,
            flags: r.get_u32(),
        },
        k if k == MsgType::ClientReq as u8 => {
            let readonly = r.get_bool();
            let seq = r.get_u64();
            let pos = r.rpos();
            Msg::ClientReq {
                readonly,
                seq,
                batch: body.slice(pos..),
            }
        }
        k if k == MsgType::ClientResp as u8 => Msg::ClientResp {
            batch: body.clone(),
        },
        k if k == MsgType::AppendReq as u8 => {
            let term = r.get_u64();
            let prev_index = r.get_u64();
            let prev_term = r.get_u64();
            let leader_commit = r.get_u64();
            let round = r.get_u64();
            let pos = r.rpos();
            Msg::AppendReq {
                term,
                prev_index,
                prev_term,
                leader_commit,
                round,
                entries: body.slice(pos.min(body.len())..),
            }
        }
        k if k == MsgType::AppendResp as u8 => Msg::AppendResp {
            term: r.get_u64(),
            index: r.get_u64(),
            round: r.get_u64(),
            success: r.get_bool(),
        },
        k if k == MsgType::PrevoteReq as u8 => Msg::PrevoteReq {
            term: r.get_u64(),
            last_term: r.get_u64(),
            last_index: r.get_u64(),
        },
        k if k == MsgType::PrevoteResp as u8 => Msg::PrevoteResp {
            term: r.get_u64(),
            index: r.get_u64(),
            granted: r.get_bool(),
        },
        k if k == MsgType::ReqvoteReq as u8 => Msg::ReqvoteReq {
            term: r.get_u64(),
            last_term: r.get_u64(),
            last_index: r.get_u64(),
        },
        k if k == MsgType::ReqvoteResp as u8 => Msg::ReqvoteResp {
            term: r.get_u64(),
            index: r.get_u64(),
            granted: r.get_bool(),
        },
        k if k == MsgType::SnapshotReq as u8 => {
            let term = r.get_u64();
            let ss_term = r.get_u64();
            let ss_index = r.get_u64();
            let offset = r.get_u64();
            let done = r.get_bool();
            let pos = r.rpos();
            Msg::SnapshotReq {
                term,
                ss_term,
                ss_index,
                offset,
                done,
                data: body.slice(pos.min(body.len())..),
            }
        }
        k if k == MsgType::SnapshotResp as u8 => Msg::SnapshotResp {
            term: r.get_u64(),
            success: r.get_bool(),
            done: r.get_bool(),
        },
        k if k == MsgType::InfoReq as u8 => Msg::InfoReq {
            data: body.clone(),
        },
        k if k == MsgType::ShutdownReq as u8 => Msg::ShutdownReq {
            now: r.get_bool(),
        },
        _ => return Err(ResqlError::Invalid),
    };

    if !r.valid() {
        return Err(ResqlError::Invalid);
    }

    Ok(msg)
}

impl Encoder<Msg> for MsgCodec {
    type Error = ResqlError;

    fn encode(&mut self, msg: Msg, dst: &mut BytesMut) -> Result<(), ResqlError> {
        let mut body = Buf::with_capacity(64);
        let kind;

        match &msg {
            Msg::ConnectReq {
                flags,
                protocol,
                cluster,
                name,
            } => {
                kind = MsgType::ConnectReq;
                body.put_u32(*flags);
                body.put_str(protocol);
                body.put_str(cluster);
                body.put_str(name);
            }
            Msg::ConnectResp {
                rc,
                seq,
                term,
                nodes,
            } => {
                kind = MsgType::ConnectResp;
                body.put_u8(*rc as u8);
                body.put_u64(*seq);
                body.put_u64(*term);
                body.put_str(nodes);
            }
            Msg::DisconnectReq { rc, flags } => {
                kind = MsgType::DisconnectReq;
                body.put_u8(*rc as u8);
                body.put_u32(*flags);
            }
            Msg::DisconnectResp { rc, flags } => {
                kind = MsgType::DisconnectResp;
                body.put_u8(*rc as u8);
                body.put_u32(*flags);
            }
            Msg::ClientReq {
                readonly,
                seq,
                batch,
            } => {
                kind = MsgType::ClientReq;
                body.put_bool(*readonly);
                body.put_u64(*seq);
                body.put_raw(batch);
            }
            Msg::ClientResp { batch } => {
                kind = MsgType::ClientResp;
                body.put_raw(batch);
            }
            Msg::AppendReq {
                term,
                prev_index,
                prev_term,
                leader_commit,
                round,
                entries,
            } => {
                kind = MsgType::AppendReq;
                body.put_u64(*term);
                body.put_u64(*prev_index);
                body.put_u64(*prev_term);
                body.put_u64(*leader_commit);
                body.put_u64(*round);
                body.put_raw(entries);
            }
            Msg::AppendResp {
                term,
                index,
                round,
                success,
            } => {
                kind = MsgType::AppendResp;
                body.put_u64(*term);
                body.put_u64(*index);
                body.put_u64(*round);
                body.put_bool(*success);
            }
            Msg::PrevoteReq {
                term,
                last_term,
                last_index,
            } => {
                kind = MsgType::PrevoteReq;
                body.put_u64(*term);
                body.put_u64(*last_term);
                body.put_u64(*last_index);
            }
            Msg::PrevoteResp {
                term,
                index,
                granted,
            } => {
                kind = MsgType::PrevoteResp;
                body.put_u64(*term);
                body.put_u64(*index);
                body.put_bool(*granted);
            }
            Msg::ReqvoteReq {
                term,
                last_term,
                last_index,
            } => {
                kind = MsgType::ReqvoteReq;
                body.put_u64(*term);
                body.put_u64(*last_term);
                body.put_u64(*last_index);
            }
            Msg::ReqvoteResp {
                term,
                index,
                granted,
            } => {
                kind = MsgType::ReqvoteResp;
                body.put_u64(*term);
                body.put_u64(*index);
                body.put_bool(*granted);
            }
            Msg::SnapshotReq {
                term,
                ss_term,
                ss_index,
                offset,
                done,
                data,
            } => {
                kind = MsgType::SnapshotReq;
                body.put_u64(*term);
                body.put_u64(*ss_term);
                body.put_u64(*ss_index);
                body.put_u64(*offset);
                body.put_bool(*done);
                body.put_raw(data);
            }
            Msg::SnapshotResp {
                term,
                success,
                done,
            } => {
                kind = MsgType::SnapshotResp;
                body.put_u64(*term);
                body.put_bool(*success);
                body.put_bool(*done);
            }
            Msg::InfoReq { data } => {
                kind = MsgType::InfoReq;
                body.put_raw(data);
            }
            Msg::ShutdownReq { now } => {
                kind = MsgType::ShutdownReq;
                body.put_bool(*now);
            }
        }

        if !body.valid() {
            return Err(ResqlError::Internal("message encode overflow".to_owned()));
        }

        let total = FIXED_SIZE + body.wpos();
        if total > MSG_MAX_SIZE as usize {
            return Err(ResqlError::Invalid);
        }

        dst.reserve(total);
        dst.extend_from_slice(&(total as u32).to_le_bytes());
        dst.extend_from_slice(&[kind as u8]);
        dst.extend_from_slice(body.data());

        Ok(())
    }
}

impl MsgCodec {
    /// Encodes a message to a standalone byte vector.
    pub fn encode_to_vec(msg: Msg) -> Result<Vec<u8>, ResqlError> {
        let mut dst = BytesMut::new();
        MsgCodec.encode(msg, &mut dst)?;
        Ok(dst.to_vec())
    }

    /// Drains one message from an accumulation buffer, `Ok(None)` when a
    /// complete frame is not available yet.
    pub fn decode_buf(src: &mut BytesMut) -> Result<Option<Msg>, ResqlError> {
        MsgCodec.decode(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_frame_waits() {
        let full = MsgCodec::encode_to_vec(Msg::ShutdownReq { now: true }).unwrap();
        let mut src = BytesMut::from(&full[..full.len() - 1]);
        assert!(MsgCodec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&full[full.len() - 1..]);
        let msg = MsgCodec.decode(&mut src).unwrap().unwrap();
        assert_eq!(msg, Msg::ShutdownReq { now: true });
        assert!(src.is_empty());
    }
}
