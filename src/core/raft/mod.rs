// src/core/raft/mod.rs

//! The consensus core: a single task owning the log store, the state
//! machine, the session-facing client connections and every peer link.
//!
//! All mutable state lives here and is only touched from this task; sockets
//! feed complete messages through one event channel, the snapshot worker
//! reports through its completion channel, and timers are deadlines checked
//! on a coarse tick. This keeps the ordering guarantees trivial: one event
//! is fully processed before the next, and entries apply strictly in index
//! order.

mod client;
mod election;
mod node;
mod replication;

use crate::config::Config;
use crate::connection::{self, ConnHandle, ConnId, Event};
use crate::core::buffer::{Buf, RawBuf};
use crate::core::cmd;
use crate::core::errors::{ResqlError, Result};
use crate::core::log::Store;
use crate::core::meta::Meta;
use crate::core::metric::{self, Metric};
use crate::core::protocol::{Msg, MsgRc, PROTOCOL, REMOTE_CLIENT, REMOTE_NODE};
use crate::core::snapshot::Snapshot;
use crate::core::state::{AppliedSession, ConfigJob, State};
use crate::server::AnyStream;
use client::ClientConn;
use node::Node;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

const TICK_MS: u64 = 32;

/// Unanswered handshakes are dropped after this long.
const PENDING_TIMEOUT: u64 = 50_000;

/// Metrics exchange period.
const INFO_PERIOD: u64 = 10_000;

/// Disk-full recheck period and required headroom.
const FULL_RETRY: u64 = 10_000;
const FULL_HEADROOM: u64 = 64 * 1024 * 1024;

/// At most this many entry bytes per append request, and per snapshot chunk.
pub(crate) const MAX_FRAME: u32 = 32 * 1024 - 128;

const META_FILE: &str = "meta.resql";
const META_TMP_FILE: &str = "meta.tmp.resql";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Follower,
    Candidate,
    Leader,
}

/// What a connection id currently stands for.
#[derive(Debug, Clone)]
enum Owner {
    /// Accepted, waiting for its CONNECT_REQ.
    Pending,
    /// Dialed a peer, waiting for its CONNECT_RESP.
    OutPending(String),
    Node(String),
    Client(String),
}

struct PendingConn {
    handle: ConnHandle,
    deadline: u64,
}

pub struct Server {
    conf: Config,
    dir: PathBuf,
    meta_path: PathBuf,
    meta_tmp_path: PathBuf,

    pub(crate) meta: Meta,
    pub(crate) voted_for: Option<String>,
    pub(crate) own_name: String,
    pub(crate) in_cluster: bool,
    pub(crate) cluster_up: bool,

    pub(crate) role: Role,
    pub(crate) leader: Option<String>,

    pub(crate) store: Option<Store>,
    pub(crate) state: State,
    pub(crate) ss: Snapshot,
    pub(crate) ss_inprogress: bool,

    pub(crate) commit: u64,

    /// Read-index round counter; assumed never to wrap.
    pub(crate) round: u64,
    pub(crate) round_prev: u64,
    pub(crate) round_match: u64,

    pub(crate) prevote_count: u32,
    pub(crate) prevote_term: u64,
    pub(crate) vote_count: u32,
    pub(crate) vote_timestamp: u64,

    /// Milliseconds since this process started; the local monotonic clock.
    pub(crate) timestamp: u64,
    start: Instant,
    last_ts: u64,

    election_at: u64,
    info_at: u64,
    full_at: u64,
    full: bool,
    stop: bool,

    pub(crate) nodes: Vec<Node>,
    clients: HashMap<String, ClientConn>,
    client_ids: HashMap<u64, String>,
    pending: HashMap<ConnId, PendingConn>,
    owners: HashMap<ConnId, Owner>,
    pub(crate) read_reqs: VecDeque<String>,
    jobs: VecDeque<ConfigJob>,

    metric: Metric,
    next_conn_id: ConnId,

    events_rx: mpsc::UnboundedReceiver<Event>,
    events_tx: mpsc::UnboundedSender<Event>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

impl Server {
    pub fn new(
        conf: Config,
        events_tx: mpsc::UnboundedSender<Event>,
        events_rx: mpsc::UnboundedReceiver<Event>,
    ) -> Server {
        let dir = PathBuf::from(&conf.node.directory);
        let session_timeout = conf.advanced.session_timeout;
        let state = State::new(&dir, &conf.cluster.name, session_timeout);
        let ss = Snapshot::new(&dir, &conf.cluster.name, session_timeout);
        let metric = Metric::new(&dir);
        let own_name = conf.node.name.clone();
        let cluster_name = conf.cluster.name.clone();

        Server {
            conf,
            meta_path: dir.join(META_FILE),
            meta_tmp_path: dir.join(META_TMP_FILE),
            dir,
            meta: Meta::new(&cluster_name),
            voted_for: None,
            own_name,
            in_cluster: false,
            cluster_up: false,
            role: Role::Follower,
            leader: None,
            store: None,
            state,
            ss,
            ss_inprogress: false,
            commit: 0,
            round: 0,
            round_prev: 0,
            round_match: 0,
            prevote_count: 0,
            prevote_term: 0,
            vote_count: 0,
            vote_timestamp: 0,
            timestamp: 0,
            start: Instant::now(),
            last_ts: 0,
            election_at: 0,
            info_at: 0,
            full_at: 0,
            full: false,
            stop: false,
            nodes: Vec::new(),
            clients: HashMap::new(),
            client_ids: HashMap::new(),
            pending: HashMap::new(),
            owners: HashMap::new(),
            read_reqs: VecDeque::new(),
            jobs: VecDeque::new(),
            metric,
            next_conn_id: 1,
            events_rx,
            events_tx,
        }
    }

    pub(crate) fn store(&self) -> &Store {
        self.store.as_ref().expect("store open")
    }

    pub(crate) fn store_mut(&mut self) -> &mut Store {
        self.store.as_mut().expect("store open")
    }

    pub(crate) fn heartbeat(&self) -> u64 {
        self.conf.advanced.heartbeat
    }

    pub(crate) fn conf_fsync(&self) -> bool {
        self.conf.advanced.fsync
    }

    pub(crate) fn conf_in_memory(&self) -> bool {
        self.conf.node.in_memory
    }

    pub(crate) fn dir_path(&self) -> &std::path::Path {
        &self.dir
    }

    fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    fn leader_is(&self, name: &str) -> bool {
        self.leader.as_deref() == Some(name)
    }

    // ------------------------------------------------------------------
    // Startup

    fn prepare_start(&mut self) -> Result<()> {
        self.open_engines()?;
        self.schedule_election();
        self.info_at = self.timestamp;
        Ok(())
    }

    fn open_engines(&mut self) -> Result<()> {
        self.cluster_up = false;
        self.role = Role::Follower;
        self.leader = None;

        let _ = std::fs::remove_file(&self.meta_tmp_path);
        if self.meta_path.exists() {
            self.parse_meta_file()?;
        } else {
            self.create_meta()?;
        }
        info!("{}", self.meta.describe());

        self.in_cluster = self.meta.exists(&self.own_name);

        self.state.open(self.conf.node.in_memory)?;
        let store = Store::open(&self.dir, self.state.term, self.state.index)?;
        self.commit = self.state.index;
        self.store = Some(store);
        self.ss.open(self.state.term, self.state.index)?;

        self.sync_nodes();
        Ok(())
    }

    fn parse_meta_file(&mut self) -> Result<()> {
        let data = std::fs::read(&self.meta_path)?;
        let mut r = RawBuf::new(&data);

        self.own_name = r.get_string();
        let voted = r.get_str();
        self.voted_for = if voted.is_empty() {
            None
        } else {
            Some(voted.to_owned())
        };
        self.meta = Meta::decode(&mut r)?;

        Ok(())
    }

    fn create_meta(&mut self) -> Result<()> {
        self.meta = Meta::new(&self.conf.cluster.name);
        self.meta.parse_uris(&self.conf.cluster.nodes)?;
        self.write_meta_file()
    }

    pub(crate) fn write_meta_file(&mut self) -> Result<()> {
        let mut buf = Buf::with_capacity(1024);
        buf.put_str(&self.own_name);
        match &self.voted_for {
            Some(v) => buf.put_str(v),
            None => buf.put_str(""),
        }
        self.meta.encode(&mut buf);

        std::fs::write(&self.meta_tmp_path, buf.data())?;
        std::fs::rename(&self.meta_tmp_path, &self.meta_path)
            .map_err(|e| ResqlError::Fatal(format!("rename: {e}")))?;

        if let Ok(d) = std::fs::File::open(&self.dir) {
            let _ = d.sync_all();
        }

        Ok(())
    }

    pub(crate) fn update_meta(&mut self, term: u64, voted_for: Option<&str>) -> Result<()> {
        self.meta.term = term;
        self.voted_for = voted_for.map(str::to_owned);
        self.write_meta_file()
    }

    /// Ensures every meta member has a peer record, and demotes records of
    /// nodes that left.
    pub(crate) fn sync_nodes(&mut self) {
        let last_index = self.store.as_ref().map(|s| s.last_index).unwrap_or(0);

        let names: Vec<(String, Vec<Url>)> = self
            .meta
            .nodes
            .iter()
            .map(|n| (n.name.clone(), n.urls.clone()))
            .collect();

        for (name, urls) in names {
            match self.nodes.iter_mut().find(|n| n.name == name) {
                Some(n) => {
                    n.known = true;
                    n.urls = urls;
                }
                None => {
                    let mut n = Node::new(&name, urls, true);
                    n.clear_indexes(last_index);
                    self.nodes.push(n);
                }
            }
        }

        for n in &mut self.nodes {
            if !self.meta.exists(&n.name) {
                n.known = false;
            }
        }

        self.in_cluster = self.meta.exists(&self.own_name);
    }

    pub(crate) fn node_idx(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    fn own_idx(&self) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == self.own_name)
    }

    // ------------------------------------------------------------------
    // Main loop

    pub async fn run(mut self) -> Result<()> {
        self.timestamp = self.start.elapsed().as_millis() as u64;

        match self.prepare_start() {
            Ok(()) => {}
            Err(ResqlError::Full) => self.on_full_disk(),
            Err(e) => return Err(e),
        }

        info!("resql[v{}] started", env!("CARGO_PKG_VERSION"));

        let mut tick = tokio::time::interval(Duration::from_millis(TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.stop {
            let rc = tokio::select! {
                ev = self.events_rx.recv() => match ev {
                    Some(ev) => self.dispatch(ev).await,
                    None => break,
                },
                _ = tick.tick() => self.on_tick().await,
            };

            if self.handle_rc(rc)? {
                continue;
            }

            let rc = self.flush().await;
            self.handle_rc(rc)?;
        }

        info!("resql[{}] is shutting down", self.own_name);
        self.shutdown();
        Ok(())
    }

    /// Returns true when the turn should restart (disk-full entered).
    fn handle_rc(&mut self, rc: Result<()>) -> Result<bool> {
        match rc {
            Ok(()) => Ok(false),
            Err(ResqlError::Full) => {
                self.on_full_disk();
                Ok(true)
            }
            Err(e) => {
                error!("unrecoverable: {e}");
                Err(e)
            }
        }
    }

    async fn dispatch(&mut self, ev: Event) -> Result<()> {
        if self.full {
            // Everything is closed until disk space returns.
            if matches!(ev, Event::Shutdown) {
                self.stop = true;
            }
            return Ok(());
        }

        match ev {
            Event::Accepted {
                stream,
                local,
                remote,
            } => {
                self.on_accepted(stream, local, remote);
                Ok(())
            }
            Event::Msg { cid, msg } => self.on_msg(cid, msg).await,
            Event::Closed { cid } => self.on_closed(cid).await,
            Event::NodeConnected {
                name,
                stream,
                local,
                remote,
            } => {
                self.on_outgoing_connected(&name, stream, local, remote);
                Ok(())
            }
            Event::NodeConnectFailed { name } => {
                if let Some(i) = self.node_idx(&name) {
                    let jitter = rand::thread_rng().gen_range(0..256);
                    let now = self.timestamp;
                    self.nodes[i].connect_failed(now, jitter);
                }
                Ok(())
            }
            Event::Shutdown => {
                self.stop = true;
                Ok(())
            }
        }
    }

    async fn on_tick(&mut self) -> Result<()> {
        self.timestamp = self.start.elapsed().as_millis() as u64;

        if self.full {
            if self.timestamp >= self.full_at {
                self.on_full_timer()?;
            }
            return Ok(());
        }

        // Handshake deadline for pending connections.
        let expired: Vec<ConnId> = self
            .pending
            .iter()
            .filter(|(_, p)| self.timestamp >= p.deadline)
            .map(|(cid, _)| *cid)
            .collect();
        for cid in expired {
            self.pending_disconnect(cid, MsgRc::Timeout);
        }

        if self.timestamp >= self.election_at {
            self.on_election_timeout().await?;
            self.schedule_election();
        }

        if self.timestamp >= self.info_at {
            self.on_info_timer().await?;
        }

        self.try_connect_nodes();

        Ok(())
    }

    pub(crate) fn schedule_election(&mut self) {
        let jitter = rand::thread_rng().gen_range(0..2048);
        self.election_at = self.timestamp + self.heartbeat() + jitter;
    }

    // ------------------------------------------------------------------
    // Connection management

    fn next_cid(&mut self) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        id
    }

    fn on_accepted(&mut self, stream: AnyStream, local: String, remote: String) {
        let cid = self.next_cid();
        let handle = connection::spawn(cid, stream, local, remote, self.events_tx.clone());

        debug!("pending connection from {}", handle.remote);
        self.owners.insert(cid, Owner::Pending);
        self.pending.insert(
            cid,
            PendingConn {
                handle,
                deadline: self.timestamp + PENDING_TIMEOUT,
            },
        );
    }

    fn try_connect_nodes(&mut self) {
        for i in 0..self.nodes.len() {
            let n = &self.nodes[i];
            if n.name == self.own_name
                || !n.known
                || n.connected()
                || n.connecting
                || self.timestamp < n.next_connect_at
            {
                continue;
            }

            let n = &mut self.nodes[i];
            let Some(url) = n.dial_url() else { continue };
            n.connecting = true;

            let name = n.name.clone();
            let tx = self.events_tx.clone();
            tokio::spawn(async move {
                let dial = tokio::time::timeout(Duration::from_secs(5), AnyStream::connect(&url));
                match dial.await {
                    Ok(Ok(stream)) => {
                        let (local, remote) = stream.addrs();
                        let _ = tx.send(Event::NodeConnected {
                            name,
                            stream,
                            local,
                            remote,
                        });
                    }
                    _ => {
                        let _ = tx.send(Event::NodeConnectFailed { name });
                    }
                }
            });
        }
    }

    fn on_outgoing_connected(
        &mut self,
        name: &str,
        stream: AnyStream,
        local: String,
        remote: String,
    ) {
        let Some(_) = self.node_idx(name) else { return };

        let cid = self.next_cid();
        let handle = connection::spawn(cid, stream, local, remote, self.events_tx.clone());

        handle.send(Msg::ConnectReq {
            flags: REMOTE_NODE,
            protocol: PROTOCOL.to_owned(),
            cluster: self.conf.cluster.name.clone(),
            name: self.own_name.clone(),
        });

        debug!("connected to {name}, awaiting handshake");
        self.owners.insert(cid, Owner::OutPending(name.to_owned()));
        self.pending.insert(
            cid,
            PendingConn {
                handle,
                deadline: self.timestamp + PENDING_TIMEOUT,
            },
        );
    }

    fn pending_disconnect(&mut self, cid: ConnId, rc: MsgRc) {
        self.owners.remove(&cid);
        if let Some(p) = self.pending.remove(&cid) {
            if rc != MsgRc::Err {
                p.handle.send(Msg::ConnectResp {
                    rc,
                    seq: 0,
                    term: self.meta.term,
                    nodes: self.meta.uris.clone(),
                });
            }
            debug!("pending connection {} dropped", p.handle.remote);
        }
    }

    async fn on_closed(&mut self, cid: ConnId) -> Result<()> {
        match self.owners.remove(&cid) {
            None => Ok(()),
            Some(Owner::Pending) => {
                self.pending.remove(&cid);
                Ok(())
            }
            Some(Owner::OutPending(name)) => {
                self.pending.remove(&cid);
                if let Some(i) = self.node_idx(&name) {
                    let jitter = rand::thread_rng().gen_range(0..256);
                    let now = self.timestamp;
                    self.nodes[i].connect_failed(now, jitter);
                }
                Ok(())
            }
            Some(Owner::Node(name)) => self.on_node_disconnect(&name).await,
            Some(Owner::Client(name)) => self.on_client_disconnect(&name, MsgRc::Err).await,
        }
    }

    async fn on_msg(&mut self, cid: ConnId, msg: Msg) -> Result<()> {
        let Some(owner) = self.owners.get(&cid).cloned() else {
            return Ok(());
        };

        match owner {
            Owner::Pending => self.on_first_req(cid, msg).await,
            Owner::OutPending(name) => self.on_first_resp(cid, &name, msg).await,
            Owner::Node(name) => match self.on_node_msg(&name, msg).await {
                // Malformed traffic is peer-fatal, not process-fatal.
                Err(ResqlError::Invalid) => self.on_node_disconnect(&name).await,
                other => other,
            },
            Owner::Client(name) => self.on_client_msg(&name, msg).await,
        }
    }

    async fn on_first_req(&mut self, cid: ConnId, msg: Msg) -> Result<()> {
        let Msg::ConnectReq {
            flags,
            protocol,
            cluster,
            name,
        } = msg
        else {
            self.pending_disconnect(cid, MsgRc::Err);
            return Ok(());
        };

        if protocol != PROTOCOL {
            self.pending_disconnect(cid, MsgRc::Err);
            return Ok(());
        }

        if cluster != self.conf.cluster.name {
            warn!("cluster name mismatch from {name}: {cluster}");
            self.pending_disconnect(cid, MsgRc::ClusterNameMismatch);
            return Ok(());
        }

        match flags {
            REMOTE_NODE => self.on_node_connect_req(cid, &name).await,
            REMOTE_CLIENT => self.on_client_connect_req(cid, &name).await,
            _ => {
                self.pending_disconnect(cid, MsgRc::Err);
                Ok(())
            }
        }
    }

    async fn on_node_connect_req(&mut self, cid: ConnId, name: &str) -> Result<()> {
        let Some(p) = self.pending.remove(&cid) else {
            return Ok(());
        };

        let idx = match self.node_idx(name) {
            Some(i) => i,
            None => {
                // Not yet in the meta; keep the link so an in-progress join
                // can replicate to it.
                let last = self.store.as_ref().map(|s| s.last_index).unwrap_or(0);
                let mut n = Node::new(name, Vec::new(), false);
                n.clear_indexes(last);
                self.nodes.push(n);
                self.nodes.len() - 1
            }
        };

        p.handle.send(Msg::ConnectResp {
            rc: MsgRc::Ok,
            seq: 0,
            term: self.meta.term,
            nodes: self.meta.uris.clone(),
        });

        self.nodes[idx].conn = Some(p.handle);
        self.nodes[idx].in_timestamp = self.timestamp;
        self.owners.insert(cid, Owner::Node(name.to_owned()));
        info!("node connected: {name}");

        if self.is_leader() {
            self.write_meta_cmd().await?;
        }

        Ok(())
    }

    async fn on_first_resp(&mut self, cid: ConnId, name: &str, msg: Msg) -> Result<()> {
        let Some(p) = self.pending.remove(&cid) else {
            return Ok(());
        };

        let ok = matches!(msg, Msg::ConnectResp { rc: MsgRc::Ok, .. });
        let Some(i) = self.node_idx(name) else {
            self.owners.remove(&cid);
            return Ok(());
        };

        if !ok {
            self.owners.remove(&cid);
            let jitter = rand::thread_rng().gen_range(0..256);
            let now = self.timestamp;
            self.nodes[i].connect_failed(now, jitter);
            return Ok(());
        }

        self.nodes[i].conn = Some(p.handle);
        self.nodes[i].connect_ok();
        self.nodes[i].in_timestamp = self.timestamp;
        self.owners.insert(cid, Owner::Node(name.to_owned()));
        info!("node connected: {name}");

        Ok(())
    }

    pub(crate) async fn on_node_disconnect(&mut self, name: &str) -> Result<()> {
        info!("node is not connected: {name}");

        if let Some(i) = self.node_idx(name) {
            self.nodes[i].disconnect();
        }

        if self.leader_is(name) {
            self.leader = None;
        }

        if self.is_leader() {
            self.write_meta_cmd().await?;
        }

        Ok(())
    }

    async fn on_node_msg(&mut self, name: &str, msg: Msg) -> Result<()> {
        match msg {
            Msg::AppendReq {
                term,
                prev_index,
                prev_term,
                leader_commit,
                round,
                entries,
            } => {
                self.on_append_req(name, term, prev_index, prev_term, leader_commit, round, entries)
                    .await
            }
            Msg::AppendResp {
                term,
                index,
                round,
                success,
            } => self.on_append_resp(name, term, index, round, success),
            Msg::PrevoteReq {
                term,
                last_term,
                last_index,
            } => self.on_prevote_req(name, term, last_term, last_index),
            Msg::PrevoteResp { term, granted, .. } => {
                self.on_prevote_resp(name, term, granted).await
            }
            Msg::ReqvoteReq {
                term,
                last_term,
                last_index,
            } => self.on_reqvote_req(name, term, last_term, last_index),
            Msg::ReqvoteResp { term, granted, .. } => {
                self.on_reqvote_resp(name, term, granted).await
            }
            Msg::SnapshotReq {
                term,
                ss_term,
                ss_index,
                offset,
                done,
                data,
            } => {
                self.on_snapshot_req(name, term, ss_term, ss_index, offset, done, &data)
                    .await
            }
            Msg::SnapshotResp { term, done, .. } => self.on_snapshot_resp(name, term, done).await,
            Msg::InfoReq { data } => {
                if let Some(i) = self.node_idx(name) {
                    self.nodes[i].info = data;
                }
                Ok(())
            }
            Msg::ShutdownReq { .. } => {
                info!("received shutdown request");
                self.stop = true;
                Ok(())
            }
            _ => {
                debug!("unexpected message from node {name}");
                self.on_node_disconnect(name).await
            }
        }
    }

    // ------------------------------------------------------------------
    // Clients

    async fn on_client_connect_req(&mut self, cid: ConnId, name: &str) -> Result<()> {
        if !self.cluster_up || !self.is_leader() {
            self.pending_disconnect(cid, MsgRc::NotLeader);
            return Ok(());
        }

        if name.is_empty() {
            self.pending_disconnect(cid, MsgRc::Err);
            return Ok(());
        }

        if let Some(prev) = self.clients.get(name) {
            if prev.id == 0 {
                // A connect for this name is still in flight.
                self.pending_disconnect(cid, MsgRc::Err);
                return Ok(());
            }
            self.on_client_disconnect(name, MsgRc::Err).await?;
        }

        let Some(p) = self.pending.remove(&cid) else {
            return Ok(());
        };

        let (local, remote) = (p.handle.local.clone(), p.handle.remote.clone());
        let c = ClientConn::new(name, p.handle);
        self.owners.insert(cid, Owner::Client(name.to_owned()));
        self.clients.insert(name.to_owned(), c);

        let mut buf = Buf::with_capacity(128);
        cmd::encode_connect(&mut buf, name, &local, &remote);
        self.create_entry(true, 0, 0, cmd::CMD_CONNECT, buf.data())
            .await
    }

    pub(crate) async fn on_client_disconnect(&mut self, name: &str, rc: MsgRc) -> Result<()> {
        let Some(c) = self.clients.remove(name) else {
            return Ok(());
        };

        self.owners.remove(&c.conn.id);
        self.client_ids.remove(&c.id);
        self.read_reqs.retain(|n| n != name);
        drop(c);

        debug!("client {name} disconnected");

        if !self.is_leader() {
            return Ok(());
        }

        let mut buf = Buf::with_capacity(64);
        cmd::encode_disconnect(&mut buf, name, rc == MsgRc::Ok);
        self.create_entry(true, 0, 0, cmd::CMD_DISCONNECT, buf.data())
            .await
    }

    async fn on_client_msg(&mut self, name: &str, msg: Msg) -> Result<()> {
        match msg {
            Msg::DisconnectReq { .. } => self.on_client_disconnect(name, MsgRc::Ok).await,
            Msg::ClientReq { .. } if !self.is_leader() => {
                self.on_client_disconnect(name, MsgRc::Err).await
            }
            Msg::ClientReq {
                readonly,
                seq,
                batch,
            } => {
                {
                    let Some(c) = self.clients.get_mut(name) else {
                        return Ok(());
                    };

                    if c.msg_wait {
                        // One request at a time; park the next one.
                        if c.pending.is_some() {
                            return self.on_client_disconnect(name, MsgRc::Err).await;
                        }
                        c.pending = Some(Msg::ClientReq {
                            readonly,
                            seq,
                            batch,
                        });
                        return Ok(());
                    }

                    c.msg_wait = true;
                }

                if readonly {
                    self.queue_readonly(name, batch);
                    Ok(())
                } else {
                    let id = self.clients.get(name).map(|c| c.id).unwrap_or(0);

                    let rc = self
                        .create_entry(false, seq, id, cmd::CMD_REQUEST, &batch)
                        .await;
                    match rc {
                        Ok(()) => {
                            if let Some(c) = self.clients.get_mut(name) {
                                c.seq = seq;
                            }
                            Ok(())
                        }
                        Err(ResqlError::Full) => Err(ResqlError::Full),
                        Err(_) => self.on_client_disconnect(name, MsgRc::Err).await,
                    }
                }
            }
            _ => self.on_client_disconnect(name, MsgRc::Err).await,
        }
    }

    fn queue_readonly(&mut self, name: &str, batch: bytes::Bytes) {
        // Each batch of readonly arrivals opens a fresh round so the append
        // acks that confirm leadership also cover these requests.
        if self.round_prev == self.round {
            self.round += 1;
        }

        let last_index = self.store.as_ref().map(|s| s.last_index).unwrap_or(0);
        if let Some(c) = self.clients.get_mut(name) {
            c.round_index = self.round;
            c.commit_index = last_index;
            c.read_batch = batch;
            self.read_reqs.push_back(name.to_owned());
        }
    }

    // ------------------------------------------------------------------
    // Entry creation

    /// Appends a freshly created entry, waiting on the in-flight snapshot
    /// when the log is full. `force` grows the active page rather than give
    /// up; internal entries must not be lost.
    pub(crate) async fn create_entry(
        &mut self,
        force: bool,
        seq: u64,
        cid: u64,
        flags: u32,
        data: &[u8],
    ) -> Result<()> {
        self.append_entry(force, seq, cid, flags, data).await?;

        // Piggyback a clock sample every ten seconds of quiet.
        if self.timestamp - self.last_ts > INFO_PERIOD {
            self.last_ts = self.timestamp;

            let mut buf = Buf::with_capacity(16);
            cmd::encode_clock(&mut buf, now_ms(), self.timestamp);
            let data = buf.into_vec();
            self.append_entry(true, 0, 0, cmd::CMD_TIMESTAMP, &data)
                .await?;
        }

        Ok(())
    }

    async fn append_entry(
        &mut self,
        force: bool,
        seq: u64,
        cid: u64,
        flags: u32,
        data: &[u8],
    ) -> Result<()> {
        loop {
            let term = self.meta.term;
            let rc = self.store_mut().create_entry(term, seq, cid, flags, data);

            match rc {
                Ok(()) => return Ok(()),
                Err(ResqlError::Full) => {
                    if self.wait_snapshot().await? {
                        continue;
                    }
                    if !force {
                        return Err(ResqlError::Full);
                    }
                    let size = crate::core::log::entry::encoded_len(data.len());
                    self.store_mut()
                        .reserve(size)
                        .map_err(|_| ResqlError::Fatal("out of disk space".to_owned()))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replicates an operator-visible audit line.
    pub(crate) async fn log_entry(&mut self, level: &str, line: String) -> Result<()> {
        info!("audit({level}) {line}");

        let mut buf = Buf::with_capacity(128);
        cmd::encode_log(&mut buf, level, &line);
        let data = buf.into_vec();
        self.create_entry(true, 0, 0, cmd::CMD_LOG, &data).await
    }

    pub(crate) async fn write_init_cmd(&mut self) -> Result<()> {
        let mut rand_bytes = [0u8; cmd::INIT_RAND_LEN];
        rand::thread_rng().fill(&mut rand_bytes[..]);

        let mut buf = Buf::with_capacity(512);
        cmd::encode_init(&mut buf, now_ms(), self.timestamp, &rand_bytes);
        let data = buf.into_vec();
        self.create_entry(true, 0, 0, cmd::CMD_INIT, &data).await
    }

    pub(crate) async fn write_meta_cmd(&mut self) -> Result<()> {
        debug_assert!(self.is_leader());

        self.meta.clear_connection();
        if self.meta.exists(&self.own_name) {
            let own = self.own_name.clone();
            self.meta.set_leader(&own);
        }
        let own = self.own_name.clone();
        self.meta.set_connected(&own);

        let connected: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.connected() && n.known)
            .map(|n| n.name.clone())
            .collect();
        for name in connected {
            self.meta.set_connected(&name);
        }

        self.meta.index = self.store().last_index + 1;

        let mut buf = Buf::with_capacity(1024);
        cmd::encode_meta(&mut buf, &self.meta);
        let data = buf.into_vec();
        self.create_entry(true, 0, 0, cmd::CMD_META, &data).await
    }

    pub(crate) async fn write_term_start_cmd(&mut self) -> Result<()> {
        let mut buf = Buf::with_capacity(16);
        cmd::encode_clock(&mut buf, now_ms(), self.timestamp);
        let data = buf.into_vec();
        self.create_entry(true, 0, 0, cmd::CMD_TERM, &data).await
    }

    // ------------------------------------------------------------------
    // Snapshot coordination

    /// Consumes the in-flight compaction if there is one. Returns true when
    /// a page rotation happened (the caller should retry its append).
    pub(crate) async fn wait_snapshot(&mut self) -> Result<bool> {
        if !self.ss_inprogress {
            return Ok(false);
        }
        self.ss_inprogress = false;

        let res = self.ss.wait().await?;
        if !res.ok {
            self.metric.snapshot(false, 0, 0);
            return Err(ResqlError::Fatal("snapshot failed".to_owned()));
        }

        self.store_mut().snapshot_taken();
        self.metric.snapshot(true, res.time_ms, res.size);
        self.ss.replace()?;

        Ok(true)
    }

    // ------------------------------------------------------------------
    // Applied entries

    pub(crate) fn on_applied_entry(
        &mut self,
        flags: u32,
        applied: Option<AppliedSession>,
    ) -> Result<()> {
        match flags {
            cmd::CMD_META => self.on_meta_applied(),
            cmd::CMD_TERM => {
                if self.state.meta.term == self.meta.term && self.leader.is_some() {
                    info!(
                        "term[{}], leader[{}]",
                        self.meta.term,
                        self.leader.as_deref().unwrap_or("?")
                    );
                    self.cluster_up = true;
                }
                Ok(())
            }
            cmd::CMD_REQUEST => {
                if let Some(a) = applied {
                    self.respond_to_client(&a);
                }
                Ok(())
            }
            cmd::CMD_CONNECT => {
                if let Some(a) = applied {
                    self.finalize_client_connect(&a);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_meta_applied(&mut self) -> Result<()> {
        let applied = self.state.meta.clone();

        if applied.index < self.meta.index {
            return Ok(());
        }

        if applied.index == self.meta.index && self.meta.prev.is_some() {
            self.meta.remove_prev();
            info!("{}", self.meta.describe());
        } else if applied.index > self.meta.index {
            self.meta = applied;
            self.sync_nodes();
        }

        self.write_meta_file()
    }

    fn respond_to_client(&mut self, a: &AppliedSession) {
        if !self.is_leader() {
            return;
        }

        let Some(name) = self.client_ids.get(&a.id).cloned() else {
            return;
        };

        let (cid, followup) = {
            let Some(c) = self.clients.get_mut(&name) else {
                return;
            };
            c.conn.send(Msg::ClientResp {
                batch: a.resp.clone(),
            });
            (c.conn.id, c.processed())
        };

        // A request parked behind this one re-enters through the queue so
        // ordering with other events is preserved.
        if let Some(msg) = followup {
            let _ = self.events_tx.send(Event::Msg { cid, msg });
        }
    }

    fn finalize_client_connect(&mut self, a: &AppliedSession) {
        if !self.is_leader() {
            return;
        }

        let Some(c) = self.clients.get_mut(&a.name) else {
            return;
        };

        c.id = a.id;
        c.seq = a.seq;
        self.client_ids.insert(a.id, a.name.clone());

        c.conn.send(Msg::ConnectResp {
            rc: MsgRc::Ok,
            seq: a.seq,
            term: self.meta.term,
            nodes: self.meta.uris.clone(),
        });

        debug!("client connected: {}", a.name);
    }

    // ------------------------------------------------------------------
    // Info timer

    async fn on_info_timer(&mut self) -> Result<()> {
        self.info_at = self.timestamp + INFO_PERIOD;

        let mut own_info = Buf::with_capacity(1024);
        self.metric.encode(&mut own_info);
        let own_info = bytes::Bytes::from(own_info.into_vec());

        if let Some(i) = self.own_idx() {
            self.nodes[i].info = own_info.clone();
        }

        if self.is_leader() {
            let mut blob = Buf::with_capacity(4096);
            blob.put_str(&self.own_name);
            blob.put_bool(true);
            blob.put_blob(&own_info);

            for n in self.nodes.iter().filter(|n| n.connected() && n.known) {
                blob.put_str(&n.name);
                blob.put_bool(true);
                blob.put_blob(&n.info);
            }

            let data = blob.into_vec();
            return self.create_entry(true, 0, 0, cmd::CMD_INFO, &data).await;
        }

        if let Some(leader) = self.leader.clone()
            && let Some(i) = self.node_idx(&leader)
            && let Some(conn) = &self.nodes[i].conn
        {
            conn.send(Msg::InfoReq { data: own_info });
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Config-change jobs

    pub(crate) fn collect_jobs(&mut self) {
        let jobs = self.state.take_jobs();
        if jobs.is_empty() {
            return;
        }
        if self.is_leader() && self.state.term == self.meta.term {
            self.jobs.extend(jobs);
        }
    }

    pub(crate) async fn handle_jobs(&mut self) -> Result<()> {
        while let Some(job) = self.jobs.pop_front() {
            match job {
                ConfigJob::AddNode(url) => self.job_add_node(&url).await?,
                ConfigJob::RemoveNode(name) => self.job_remove_node(&name).await?,
                ConfigJob::Shutdown(name) => self.job_shutdown(&name),
            }
        }
        Ok(())
    }

    async fn job_add_node(&mut self, url: &str) -> Result<()> {
        if self.meta.prev.is_some() {
            return self
                .log_entry(
                    "ERROR",
                    format!("Add node[{url}] : rejected, a change is already in progress."),
                )
                .await;
        }

        let parsed = match Url::parse(url) {
            Ok(u) if u.scheme() == "tcp" && !u.username().is_empty() && u.port().is_some() => u,
            _ => {
                return self
                    .log_entry("ERROR", format!("Add node[{url}] : invalid url format."))
                    .await;
            }
        };

        if self.meta.exists(parsed.username()) {
            return self
                .log_entry("ERROR", format!("Add node[{url}] : node already exists."))
                .await;
        }

        self.meta.add(parsed);
        self.write_meta_cmd().await
    }

    async fn job_remove_node(&mut self, name: &str) -> Result<()> {
        if self.meta.prev.is_some() {
            return self
                .log_entry(
                    "ERROR",
                    format!("Remove node[{name}] : rejected, a change is already in progress."),
                )
                .await;
        }

        if !self.meta.exists(name) {
            return self
                .log_entry("ERROR", format!("Remove node[{name}] : node does not exist."))
                .await;
        }

        self.meta.remove(name);
        self.write_meta_cmd().await
    }

    fn job_shutdown(&mut self, name: &str) {
        if name == "*" {
            for n in self.nodes.iter().filter(|n| n.connected()) {
                if let Some(conn) = &n.conn {
                    conn.send(Msg::ShutdownReq { now: true });
                }
            }
            self.stop = true;
            return;
        }

        if name == self.own_name {
            self.stop = true;
            return;
        }

        if let Some(i) = self.node_idx(name)
            && let Some(conn) = &self.nodes[i].conn
        {
            conn.send(Msg::ShutdownReq { now: true });
        }
    }

    // ------------------------------------------------------------------
    // Disk full

    fn on_full_disk(&mut self) {
        if self.full {
            return;
        }

        error!("disk is full");

        self.pending.clear();
        self.owners.clear();
        self.clients.clear();
        self.client_ids.clear();
        self.read_reqs.clear();
        for n in &mut self.nodes {
            n.disconnect();
        }

        if let Err(e) = self.state.close() {
            error!("state close: {e}");
        }
        if let Some(mut store) = self.store.take()
            && let Err(e) = store.flush()
        {
            error!("store flush: {e}");
        }
        self.ss.close();

        self.full = true;
        self.full_at = self.timestamp + FULL_RETRY;
    }

    fn on_full_timer(&mut self) -> Result<()> {
        debug_assert!(self.full);

        let free = metric::free_space(&self.dir);
        let mut limit = FULL_HEADROOM;
        if let Ok(md) = std::fs::metadata(self.state.ss_path()) {
            limit += md.len();
        }

        if free > limit {
            match self.prepare_start() {
                Ok(()) => {
                    self.full = false;
                    return Ok(());
                }
                Err(ResqlError::Full) => {}
                Err(e) => return Err(e),
            }
        }

        self.full_at = self.timestamp + FULL_RETRY;
        error!("free space: {free} bytes, need: {limit} bytes, retry in 10 seconds");

        Ok(())
    }

    // ------------------------------------------------------------------
    // Shutdown

    fn shutdown(&mut self) {
        if !self.full {
            if let Some(store) = self.store.as_mut()
                && let Err(e) = store.flush()
            {
                error!("store flush: {e}");
            }
            if let Err(e) = self.state.close() {
                error!("state close: {e}");
            }
        }

        self.clients.clear();
        self.pending.clear();
        for n in &mut self.nodes {
            n.conn = None;
        }

        self.ss.stop();
    }
}
