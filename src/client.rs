// src/client.rs

//! Client library: a named session with exactly-once request semantics.
//!
//! Requests carry a monotonically increasing sequence number; after any
//! reconnect the same bytes are resent with the same sequence, and the
//! cluster either executes them once or replays the cached response. The
//! retry loop is an explicit state machine over (connect, send, await)
//! driven by the operation deadline.

use crate::core::buffer::{Buf, RawBuf};
use crate::core::errors::{ResqlError, Result};
use crate::core::protocol::{
    Msg, MsgCodec, MsgRc, PROTOCOL, REMOTE_CLIENT, bind, flag, param,
};
use crate::server::AnyStream;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use url::Url;

/// A typed SQL value, both for parameter binding and result columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    Null,
}

/// Handle to a server-side prepared statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prepared {
    pub id: u64,
}

/// Result of one operation in a batch.
#[derive(Debug, Default)]
pub struct OpResult {
    pub changes: u32,
    pub last_insert_id: i64,
    pub prepared_id: Option<u64>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Default)]
pub struct ResultSet {
    pub ops: Vec<OpResult>,
}

impl ResultSet {
    /// The first operation's result; most requests carry exactly one.
    pub fn first(&self) -> &OpResult {
        &self.ops[0]
    }
}

pub struct ClientConfig {
    pub cluster_name: String,
    pub client_name: String,
    pub urls: Vec<String>,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            cluster_name: "cluster".to_owned(),
            client_name: "client".to_owned(),
            urls: vec!["tcp://node0@127.0.0.1:7600".to_owned()],
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct Client {
    cluster: String,
    name: String,
    urls: Vec<Url>,
    url_idx: usize,
    timeout: Duration,
    seq: u64,
    framed: Option<Framed<AnyStream, MsgCodec>>,

    // Request under construction.
    req: Buf,
    ops: Vec<u8>,
    op_open: bool,
}

impl Client {
    /// Connects to the cluster, retrying across the URL list until the
    /// configured timeout.
    pub async fn connect(config: ClientConfig) -> Result<Client> {
        let mut urls = Vec::new();
        for u in &config.urls {
            urls.push(Url::parse(u).map_err(|_| ResqlError::Config(format!("bad url: {u}")))?);
        }
        if urls.is_empty() {
            return Err(ResqlError::Config("no urls".to_owned()));
        }

        let mut c = Client {
            cluster: config.cluster_name,
            name: config.client_name,
            urls,
            url_idx: 0,
            timeout: config.timeout,
            seq: 0,
            framed: None,
            req: Buf::new(),
            ops: Vec::new(),
            op_open: false,
        };

        let deadline = Instant::now() + c.timeout;
        c.ensure_connected(deadline).await?;
        Ok(c)
    }

    async fn ensure_connected(&mut self, deadline: Instant) -> Result<()> {
        while self.framed.is_none() {
            if Instant::now() >= deadline {
                return Err(ResqlError::Timeout);
            }

            let url = self.urls[self.url_idx % self.urls.len()].clone();
            self.url_idx += 1;

            match self.try_connect(&url, deadline).await {
                Ok(()) => return Ok(()),
                Err(ResqlError::ClusterNameMismatch) => {
                    return Err(ResqlError::ClusterNameMismatch);
                }
                Err(_) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        Ok(())
    }

    async fn try_connect(&mut self, url: &Url, deadline: Instant) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());

        let stream = tokio::time::timeout(remaining, AnyStream::connect(url))
            .await
            .map_err(|_| ResqlError::Timeout)??;

        let mut framed = Framed::new(stream, MsgCodec);
        framed
            .send(Msg::ConnectReq {
                flags: REMOTE_CLIENT,
                protocol: PROTOCOL.to_owned(),
                cluster: self.cluster.clone(),
                name: self.name.clone(),
            })
            .await?;

        let resp = tokio::time::timeout(remaining, framed.next())
            .await
            .map_err(|_| ResqlError::Timeout)?
            .ok_or(ResqlError::Partial)??;

        let Msg::ConnectResp {
            rc, seq, nodes, ..
        } = resp
        else {
            return Err(ResqlError::Invalid);
        };

        match rc {
            MsgRc::Ok => {}
            MsgRc::ClusterNameMismatch => return Err(ResqlError::ClusterNameMismatch),
            MsgRc::NotLeader => return Err(ResqlError::NotLeader),
            _ => return Err(ResqlError::Session(format!("connect refused: {rc:?}"))),
        }

        // The server remembers our last acknowledged sequence number.
        self.seq = self.seq.max(seq);

        // Refresh the endpoint list, leader first.
        let mut fresh = Vec::new();
        for token in nodes.split_whitespace() {
            if let Ok(u) = Url::parse(token) {
                fresh.push(u);
            }
        }
        if !fresh.is_empty() {
            self.urls = fresh;
            self.url_idx = 0;
        }

        self.framed = Some(framed);
        Ok(())
    }

    /// Name of the node believed to lead, from the last connect response
    /// (the URL list arrives leader first).
    pub fn leader_name(&self) -> Option<String> {
        self.urls.first().map(|u| u.username().to_owned())
    }

    // ------------------------------------------------------------------
    // Request building

    fn close_op(&mut self) {
        if self.op_open {
            self.req.put_u8(bind::END);
            self.req.put_u8(flag::OP_END);
            self.op_open = false;
        }
    }

    /// Queues a SQL statement for the next `exec`.
    pub fn put_sql(&mut self, sql: &str) {
        self.close_op();
        self.req.put_u8(flag::OP);
        self.req.put_u8(flag::STMT);
        self.req.put_str(sql);
        self.ops.push(flag::STMT);
        self.op_open = true;
    }

    /// Queues execution of a prepared statement.
    pub fn put_prepared(&mut self, stmt: Prepared) {
        self.close_op();
        self.req.put_u8(flag::OP);
        self.req.put_u8(flag::STMT_ID);
        self.req.put_u64(stmt.id);
        self.ops.push(flag::STMT_ID);
        self.op_open = true;
    }

    fn put_value(&mut self, value: &Value) {
        match value {
            Value::Integer(v) => {
                self.req.put_u8(param::INTEGER);
                self.req.put_u64(*v as u64);
            }
            Value::Float(v) => {
                self.req.put_u8(param::FLOAT);
                self.req.put_f64(*v);
            }
            Value::Text(v) => {
                self.req.put_u8(param::TEXT);
                self.req.put_str(v);
            }
            Value::Blob(v) => {
                self.req.put_u8(param::BLOB);
                self.req.put_blob(v);
            }
            Value::Null => self.req.put_u8(param::NULL),
        }
    }

    /// Binds by parameter name (`:key`, `@key`, `$key`).
    pub fn bind_param(&mut self, name: &str, value: Value) {
        debug_assert!(self.op_open);
        self.req.put_u8(bind::NAME);
        self.req.put_str(name);
        self.put_value(&value);
    }

    /// Binds by zero-based index.
    pub fn bind_index(&mut self, index: u32, value: Value) {
        debug_assert!(self.op_open);
        self.req.put_u8(bind::INDEX);
        self.req.put_u32(index);
        self.put_value(&value);
    }

    /// Compiles a statement on the cluster; the handle survives snapshots
    /// and leader changes.
    pub async fn prepare(&mut self, sql: &str) -> Result<Prepared> {
        self.abort_request();
        self.req.put_u8(flag::OP);
        self.req.put_u8(flag::STMT_PREPARE);
        self.req.put_str(sql);
        self.req.put_u8(flag::OP_END);
        self.ops.push(flag::STMT_PREPARE);

        let rs = self.exec(false).await?;
        rs.first()
            .prepared_id
            .map(|id| Prepared { id })
            .ok_or(ResqlError::Invalid)
    }

    pub async fn del_prepared(&mut self, stmt: Prepared) -> Result<()> {
        self.abort_request();
        self.req.put_u8(flag::OP);
        self.req.put_u8(flag::STMT_DEL_PREPARED);
        self.req.put_u64(stmt.id);
        self.req.put_u8(flag::OP_END);
        self.ops.push(flag::STMT_DEL_PREPARED);

        self.exec(false).await.map(|_| ())
    }

    /// Drops any queued operations.
    pub fn abort_request(&mut self) {
        self.req.clear();
        self.ops.clear();
        self.op_open = false;
    }

    // ------------------------------------------------------------------
    // Execution

    /// Executes the queued batch. Readonly batches skip the log and ride the
    /// read-index protocol on the server.
    pub async fn exec(&mut self, readonly: bool) -> Result<ResultSet> {
        self.close_op();
        self.req.put_u8(flag::MSG_END);

        let batch = Bytes::from(std::mem::take(&mut self.req).into_vec());
        let ops = std::mem::take(&mut self.ops);
        self.op_open = false;

        self.seq += 1;
        let seq = self.seq;
        let deadline = Instant::now() + self.timeout;

        loop {
            if Instant::now() >= deadline {
                return Err(ResqlError::Timeout);
            }

            self.ensure_connected(deadline).await?;

            match self.roundtrip(readonly, seq, batch.clone(), deadline).await {
                Ok(body) => return decode_result(&body, &ops),
                Err(ResqlError::ClusterNameMismatch) => {
                    return Err(ResqlError::ClusterNameMismatch);
                }
                Err(ResqlError::Session(e)) => return Err(ResqlError::Session(e)),
                Err(_) => {
                    // Lost the connection or the leader; reconnect and retry
                    // with the same sequence number.
                    self.framed = None;
                }
            }
        }
    }

    async fn roundtrip(
        &mut self,
        readonly: bool,
        seq: u64,
        batch: Bytes,
        deadline: Instant,
    ) -> Result<Bytes> {
        let framed = self.framed.as_mut().ok_or(ResqlError::Partial)?;

        framed
            .send(Msg::ClientReq {
                readonly,
                seq,
                batch,
            })
            .await?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let resp = tokio::time::timeout(remaining, framed.next())
            .await
            .map_err(|_| ResqlError::Timeout)?
            .ok_or(ResqlError::Partial)??;

        match resp {
            Msg::ClientResp { batch } => Ok(batch),
            _ => Err(ResqlError::Invalid),
        }
    }

    /// Clean disconnect: the server may drop the session immediately.
    pub async fn disconnect(mut self) -> Result<()> {
        if let Some(framed) = self.framed.as_mut() {
            framed
                .send(Msg::DisconnectReq {
                    rc: MsgRc::Ok,
                    flags: 0,
                })
                .await?;
        }
        Ok(())
    }
}

fn decode_result(body: &[u8], ops: &[u8]) -> Result<ResultSet> {
    let mut r = RawBuf::new(body);

    match r.get_u8() {
        flag::OK => {}
        flag::ERROR => {
            let msg = r.get_string();
            return Err(ResqlError::Session(msg));
        }
        _ => return Err(ResqlError::Invalid),
    }

    let mut rs = ResultSet::default();

    for kind in ops {
        if r.get_u8() != flag::OP {
            return Err(ResqlError::Invalid);
        }
        let _result_len = r.get_u32();

        let mut op = OpResult::default();

        match *kind {
            flag::STMT | flag::STMT_ID => {
                op.changes = r.get_u32();
                op.last_insert_id = r.get_u64() as i64;

                let next = r.get_u8();
                if next == flag::ROW {
                    let cols = r.get_u32();
                    for _ in 0..cols {
                        op.columns.push(r.get_string());
                    }
                    let rows = r.get_u32();
                    for _ in 0..rows {
                        let mut row = Vec::with_capacity(cols as usize);
                        for _ in 0..cols {
                            row.push(decode_value(&mut r)?);
                        }
                        op.rows.push(row);
                    }
                    if r.get_u8() != flag::OP_END {
                        return Err(ResqlError::Invalid);
                    }
                } else if next != flag::OP_END {
                    return Err(ResqlError::Invalid);
                }
            }
            flag::STMT_PREPARE => {
                op.prepared_id = Some(r.get_u64());
                if r.get_u8() != flag::OP_END {
                    return Err(ResqlError::Invalid);
                }
            }
            flag::STMT_DEL_PREPARED => {
                if r.get_u8() != flag::OP_END {
                    return Err(ResqlError::Invalid);
                }
            }
            _ => return Err(ResqlError::Invalid),
        }

        rs.ops.push(op);
    }

    if r.get_u8() != flag::MSG_END || !r.valid() {
        return Err(ResqlError::Invalid);
    }

    Ok(rs)
}

fn decode_value(r: &mut RawBuf) -> Result<Value> {
    Ok(match r.get_u8() {
        param::INTEGER => Value::Integer(r.get_u64() as i64),
        param::FLOAT => Value::Float(r.get_f64()),
        param::TEXT => Value::Text(r.get_string()),
        param::BLOB => Value::Blob(r.get_blob().to_vec()),
        param::NULL => Value::Null,
        _ => return Err(ResqlError::Invalid),
    })
}
