// src/core/state/session.rs

//! Durable per-client record: dedup sequence, cached response, prepared
//! statements.
//!
//! Prepared statements are content-addressed by SQL text; the id is the log
//! index at which the prepare replicated. The text is the durable half — the
//! engine-side compiled statement lives in the connection's statement cache
//! and is rebuilt on demand after restart or snapshot install.

use chrono::{TimeZone, Utc};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Session {
    pub name: String,
    /// Log index at which this client first connected; unique for life.
    pub id: u64,
    /// Last acknowledged request sequence number.
    pub seq: u64,
    pub local: String,
    pub remote: String,
    pub connect_time: String,
    /// Replicated timestamp of the disconnect, 0 while live.
    pub disconnect_time: u64,
    /// Response body of the last committed request, returned on retry.
    pub resp: Vec<u8>,
    /// Prepared-statement id to SQL text.
    pub stmts: HashMap<u64, String>,
}

impl Session {
    pub fn new(name: &str, id: u64) -> Session {
        Session {
            name: name.to_owned(),
            id,
            ..Session::default()
        }
    }

    pub fn connected(&mut self, local: &str, remote: &str, realtime_ms: u64) {
        self.disconnect_time = 0;
        self.local = local.to_owned();
        self.remote = remote.to_owned();

        // Informative only, but derived from the replicated clock so every
        // replica stores the same text.
        if let chrono::LocalResult::Single(t) = Utc.timestamp_millis_opt(realtime_ms as i64) {
            self.connect_time = t.format("%Y-%m-%d %H:%M:%S").to_string();
        }
    }

    pub fn disconnected(&mut self, timestamp: u64) {
        self.disconnect_time = timestamp;
        self.local.clear();
        self.remote.clear();
    }

    /// Finds an existing prepared statement by SQL text.
    pub fn sql_to_id(&self, sql: &str) -> Option<u64> {
        self.stmts
            .iter()
            .find(|(_, text)| text.as_str() == sql)
            .map(|(id, _)| *id)
    }

    pub fn add_stmt(&mut self, id: u64, sql: &str) {
        self.stmts.insert(id, sql.to_owned());
    }

    pub fn del_stmt(&mut self, id: u64) -> bool {
        self.stmts.remove(&id).is_some()
    }

    pub fn get_stmt(&self, id: u64) -> Option<&str> {
        self.stmts.get(&id).map(|s| s.as_str())
    }
}
