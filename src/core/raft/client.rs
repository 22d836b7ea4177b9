// src/core/raft/client.rs

//! Per-client connection state on the leader. The durable half of a client
//! lives in the session table; this records only what the connection itself
//! needs: one request in flight at a time, plus the read-index bookkeeping
//! for readonly requests.

use crate::connection::ConnHandle;
use crate::core::protocol::Msg;
use bytes::Bytes;

#[derive(Debug)]
pub struct ClientConn {
    pub name: String,
    /// Session id, 0 until the CONNECT entry applies.
    pub id: u64,
    pub seq: u64,
    pub conn: ConnHandle,

    /// A request is being processed; further requests queue in `pending`.
    pub msg_wait: bool,
    pub pending: Option<Msg>,

    /// Read-index bookkeeping for a queued readonly request.
    pub round_index: u64,
    pub commit_index: u64,
    pub read_batch: Bytes,
}

impl ClientConn {
    pub fn new(name: &str, conn: ConnHandle) -> ClientConn {
        ClientConn {
            name: name.to_owned(),
            id: 0,
            seq: 0,
            conn,
            msg_wait: false,
            pending: None,
            round_index: 0,
            commit_index: 0,
            read_batch: Bytes::new(),
        }
    }

    /// Marks the in-flight request answered and hands back any request that
    /// queued behind it.
    pub fn processed(&mut self) -> Option<Msg> {
        self.msg_wait = false;
        self.read_batch = Bytes::new();
        self.pending.take()
    }
}
