// src/core/raft/node.rs

//! Per-peer state kept by the consensus core: the replication cursor, the
//! read-index round echo, snapshot-transfer progress and reconnect backoff.

use crate::connection::ConnHandle;
use bytes::Bytes;
use url::Url;

/// Reconnect backoff, milliseconds.
const BACKOFF_BASE: u64 = 64;
const BACKOFF_CAP: u64 = 32 * 1024;

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub urls: Vec<Url>,
    /// Member of the current meta (unknown peers still get a record so an
    /// in-progress join can talk to us).
    pub known: bool,
    pub conn: Option<ConnHandle>,

    /// Next entry to send.
    pub next: u64,
    /// Highest entry known replicated.
    pub match_idx: u64,
    /// Last read-index round echoed back.
    pub round: u64,
    pub msg_inflight: u32,

    /// Snapshot transfer cursor.
    pub ss_index: u64,
    pub ss_pos: u64,

    /// Server timestamps of last traffic in each direction.
    pub in_timestamp: u64,
    pub out_timestamp: u64,

    /// Outgoing dial state.
    pub connecting: bool,
    pub next_connect_at: u64,
    pub backoff: u64,
    pub url_idx: usize,

    /// Last stats blob this peer pushed via INFO_REQ.
    pub info: Bytes,
}

impl Node {
    pub fn new(name: &str, urls: Vec<Url>, known: bool) -> Node {
        Node {
            name: name.to_owned(),
            urls,
            known,
            conn: None,
            next: 1,
            match_idx: 0,
            round: 0,
            msg_inflight: 0,
            ss_index: 0,
            ss_pos: 0,
            in_timestamp: 0,
            out_timestamp: 0,
            connecting: false,
            next_connect_at: 0,
            backoff: BACKOFF_BASE,
            url_idx: 0,
            info: Bytes::new(),
        }
    }

    pub fn connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn update_indexes(&mut self, round: u64, match_idx: u64) {
        self.round = round;
        self.match_idx = match_idx;
    }

    pub fn clear_indexes(&mut self, match_idx: u64) {
        self.next = match_idx + 1;
        self.match_idx = match_idx;
        self.round = 0;
        self.ss_index = 0;
        self.ss_pos = 0;
        self.msg_inflight = 0;
        self.in_timestamp = 0;
        self.out_timestamp = 0;
    }

    pub fn disconnect(&mut self) {
        self.conn = None;
        self.connecting = false;
        let match_idx = self.match_idx;
        self.clear_indexes(match_idx);
    }

    /// Picks the next URL to dial and advances the backoff.
    pub fn dial_url(&mut self) -> Option<Url> {
        if self.urls.is_empty() {
            return None;
        }
        let url = self.urls[self.url_idx % self.urls.len()].clone();
        self.url_idx = (self.url_idx + 1) % self.urls.len();
        Some(url)
    }

    pub fn connect_failed(&mut self, now: u64, jitter: u64) {
        self.connecting = false;
        self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
        self.next_connect_at = now + self.backoff + jitter;
    }

    pub fn connect_ok(&mut self) {
        self.connecting = false;
        self.backoff = BACKOFF_BASE;
    }
}
