// src/core/state/applier.rs

//! The applier: receives committed entries strictly in index order and
//! executes them against the state database. Given the same ordered entries,
//! every replica ends up with a byte-identical database file; the clock and
//! randomness a statement can observe come from replicated values only.

use crate::core::buffer::{Buf, RawBuf};
use crate::core::cmd;
use crate::core::errors::{ResqlError, Result};
use crate::core::log::entry;
use crate::core::meta::Meta;
use crate::core::state::db::StateDb;
use crate::core::state::hooks::{self, ApplyShared, ConfigJob};
use crate::core::state::random::DetRand;
use crate::core::state::session::Session;
use crate::core::state::{exec, random};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const STATE_FILE: &str = "state.resql";
const STATE_TMP_FILE: &str = "state.tmp.resql";
const SS_FILE: &str = "snapshot.resql";
const SS_TMP_FILE: &str = "snapshot.tmp.resql";

/// Session facts the consensus core needs after an entry applies: who to
/// respond to and with what.
#[derive(Debug)]
pub struct AppliedSession {
    pub name: String,
    pub id: u64,
    pub seq: u64,
    pub resp: Bytes,
}

#[derive(Debug, Default)]
struct NodeInfo {
    connected: bool,
    role: String,
    urls: String,
    stats: Vec<u8>,
}

pub struct State {
    path: PathBuf,
    tmp_path: PathBuf,
    ss_path: PathBuf,
    ss_tmp_path: PathBuf,

    pub db: Option<StateDb>,
    pub meta: Meta,
    pub term: u64,
    pub index: u64,
    pub ss_term: u64,
    pub ss_index: u64,

    /// Replicated coarse clock, advanced by TIMESTAMP entries.
    pub timestamp: u64,
    pub monotonic: u64,

    shared: Arc<ApplyShared>,
    sessions: HashMap<String, Session>,
    ids: HashMap<u64, String>,
    infos: HashMap<String, NodeInfo>,

    cluster_name: String,
    session_timeout: u64,
    snapshot_mode: bool,
    in_memory: bool,
    closed: bool,
    /// Page-count limit last pushed into the engine.
    applied_max_page: u64,
}

impl State {
    pub fn new(dir: &Path, cluster_name: &str, session_timeout: u64) -> State {
        let zero = DetRand::from_parts(0, 0, [0u8; random::STATE_LEN]);

        State {
            path: dir.join(STATE_FILE),
            tmp_path: dir.join(STATE_TMP_FILE),
            ss_path: dir.join(SS_FILE),
            ss_tmp_path: dir.join(SS_TMP_FILE),
            db: None,
            meta: Meta::new(cluster_name),
            term: 0,
            index: 0,
            ss_term: 0,
            ss_index: 0,
            timestamp: 0,
            monotonic: 0,
            shared: ApplyShared::new(zero),
            sessions: HashMap::new(),
            ids: HashMap::new(),
            infos: HashMap::new(),
            cluster_name: cluster_name.to_owned(),
            session_timeout,
            snapshot_mode: false,
            in_memory: false,
            closed: false,
            applied_max_page: u64::MAX,
        }
    }

    /// Pushes a changed `resql('max-size', n)` limit into the engine before
    /// the next client statement runs.
    fn refresh_max_page(&mut self) -> Result<()> {
        let limit = self.shared.max_page.load(std::sync::atomic::Ordering::Relaxed);
        if limit != self.applied_max_page {
            self.db()?.set_max_pages(limit)?;
            self.applied_max_page = limit;
        }
        Ok(())
    }

    pub fn realtime(&self) -> u64 {
        self.shared.realtime_ms()
    }

    pub fn ss_path(&self) -> &Path {
        &self.ss_path
    }

    pub fn ss_tmp_path(&self) -> &Path {
        &self.ss_tmp_path
    }

    pub fn take_jobs(&self) -> Vec<ConfigJob> {
        hooks::take_jobs(&self.shared)
    }

    pub fn session_seq(&self, name: &str) -> Option<u64> {
        self.sessions.get(name).map(|s| s.seq)
    }

    /// Opens the live state from the snapshot file, creating an initial
    /// snapshot when none exists.
    pub fn open(&mut self, in_memory: bool) -> Result<()> {
        hooks::global_init()?;

        self.in_memory = in_memory;
        self.snapshot_mode = false;
        self.closed = false;

        let _ = std::fs::remove_file(&self.tmp_path);
        let _ = std::fs::remove_file(&self.ss_tmp_path);

        if !self.ss_path.exists() {
            warn!("no snapshot found, creating one");
            self.initial_snapshot()?;
        }

        self.read_snapshot()?;
        info!("opened snapshot at index [{}]", self.index);

        Ok(())
    }

    /// Opens a private copy of the snapshot for background compaction. The
    /// live files are untouched; `close` leaves the compacted copy at the
    /// snapshot tmp path for the worker to rename.
    pub fn open_for_snapshot(&mut self) -> Result<()> {
        hooks::global_init()?;

        self.snapshot_mode = true;
        self.in_memory = false;
        self.closed = false;

        if !self.ss_path.exists() {
            return Err(ResqlError::Fatal(format!(
                "missing snapshot: {}",
                self.ss_path.display()
            )));
        }

        std::fs::copy(&self.ss_path, &self.ss_tmp_path)?;

        let db = StateDb::open(&self.ss_tmp_path, false)?;
        self.db = Some(db);
        self.read_vars()?;

        Ok(())
    }

    fn read_snapshot(&mut self) -> Result<()> {
        if self.in_memory {
            let mut db = StateDb::open_memory()?;
            db.load_from(&self.ss_path)?;
            self.db = Some(db);
        } else {
            if !self.path.exists() {
                std::fs::copy(&self.ss_path, &self.path)?;
            }
            std::fs::rename(&self.path, &self.tmp_path)
                .map_err(|e| ResqlError::Fatal(format!("rename: {e}")))?;
            self.db = Some(StateDb::open(&self.tmp_path, false)?);
        }

        self.read_vars()
    }

    fn initial_snapshot(&mut self) -> Result<()> {
        {
            let db = StateDb::open(&self.ss_tmp_path, true)?;
            self.write_vars_to(&db)?;
        }

        std::fs::rename(&self.ss_tmp_path, &self.ss_path)
            .map_err(|e| ResqlError::Fatal(format!("rename: {e}")))?;

        Ok(())
    }

    fn db(&self) -> Result<&StateDb> {
        self.db
            .as_ref()
            .ok_or_else(|| ResqlError::Internal("state closed".to_owned()))
    }

    fn write_vars_to(&self, db: &StateDb) -> Result<()> {
        let mut buf = Buf::with_capacity(1024);

        buf.put_u64(self.term);
        buf.put_u64(self.index);
        buf.put_u64(self.ss_term);
        buf.put_u64(self.ss_index);
        self.meta.encode(&mut buf);

        buf.put_u64(self.timestamp);
        buf.put_u64(self.realtime());
        buf.put_u64(self.monotonic);

        let wrand = self.shared.wrand.lock().unwrap();
        let (i, j, s) = wrand.parts();
        buf.put_u8(i);
        buf.put_u8(j);
        buf.put_raw(s);
        drop(wrand);

        db.write_kv("var", buf.data())?;

        let mut name = self.cluster_name.clone().into_bytes();
        name.push(0);
        db.write_kv("cluster_name", &name)?;

        Ok(())
    }

    fn read_vars(&mut self) -> Result<()> {
        let blob = self
            .db()?
            .read_kv("var")?
            .ok_or_else(|| ResqlError::Corrupt("missing var record".to_owned()))?;

        let mut r = RawBuf::new(&blob);
        self.term = r.get_u64();
        self.index = r.get_u64();
        self.ss_term = r.get_u64();
        self.ss_index = r.get_u64();
        self.meta = Meta::decode(&mut r)?;

        self.timestamp = r.get_u64();
        self.shared.set_realtime_ms(r.get_u64());
        self.monotonic = r.get_u64();

        let i = r.get_u8();
        let j = r.get_u8();
        let bytes = r.get_bytes(random::STATE_LEN);
        if !r.valid() {
            return Err(ResqlError::Corrupt("var record".to_owned()));
        }

        let mut s = [0u8; random::STATE_LEN];
        s.copy_from_slice(bytes);
        *self.shared.wrand.lock().unwrap() = DetRand::from_parts(i, j, s);
        *self.shared.rrand.lock().unwrap() = DetRand::new(&s);

        self.sessions.clear();
        self.ids.clear();

        for row in self.db()?.read_clients()? {
            let mut sess = Session::new(&row.name, row.id);
            sess.seq = row.seq;
            sess.local = row.local;
            sess.remote = row.remote;
            sess.connect_time = row.connect_time;
            sess.resp = row.resp;
            for (id, sql) in row.stmts {
                sess.add_stmt(id, &sql);
            }

            self.ids.insert(sess.id, sess.name.clone());
            self.sessions.insert(sess.name.clone(), sess);
        }

        Ok(())
    }

    /// Discards the live state and reopens from the (just installed)
    /// snapshot file. Nothing of the old state survives.
    pub fn reopen_from_snapshot(&mut self, in_memory: bool) -> Result<()> {
        self.db = None;
        self.closed = true;

        let _ = std::fs::remove_file(&self.tmp_path);
        let _ = std::fs::remove_file(&self.path);

        self.sessions.clear();
        self.ids.clear();
        self.infos.clear();

        self.open(in_memory)
    }

    /// Persists everything and releases the database. A clean close of the
    /// live state promotes the working file back to its canonical name.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.shared.set_client(false);
        self.shared.set_readonly(false);

        if let Some(db) = self.db.take() {
            self.write_vars_to(&db)?;
            db.clear_clients()?;
            for sess in self.sessions.values() {
                db.write_client(sess)?;
            }
            drop(db);

            if !self.snapshot_mode && !self.in_memory {
                std::fs::rename(&self.tmp_path, &self.path)
                    .map_err(|e| ResqlError::Fatal(format!("rename: {e}")))?;
            }
        }

        Ok(())
    }

    /// Applies one committed entry. The caller guarantees strict index order.
    pub fn apply(&mut self, index: u64, e: &[u8]) -> Result<Option<AppliedSession>> {
        debug_assert_eq!(index, self.index + 1);
        if index != self.index + 1 {
            return Err(ResqlError::Fatal(format!(
                "apply out of order: {index} after {}",
                self.index
            )));
        }

        let _guard = hooks::install(&self.shared);
        self.shared.set_client(false);
        self.shared.set_readonly(false);

        self.term = entry::term(e);
        self.index = index;

        let data = entry::data(e);
        let mut r = RawBuf::new(data);

        match entry::flags(e) {
            cmd::CMD_INIT => {
                let init = cmd::decode_init(&mut r)?;
                self.on_init(&init)?;
                Ok(None)
            }
            cmd::CMD_META => {
                let meta = cmd::decode_meta(&mut r)?;
                self.on_meta(index, meta)?;
                Ok(None)
            }
            cmd::CMD_TERM => {
                let clock = cmd::decode_clock(&mut r)?;
                self.on_term_start(index, clock)?;
                Ok(None)
            }
            cmd::CMD_REQUEST => {
                self.shared.set_client(true);
                self.on_client_request(index, e)
            }
            cmd::CMD_CONNECT => {
                let c = cmd::decode_connect(&mut r)?;
                let (name, local, remote) =
                    (c.name.to_owned(), c.local.to_owned(), c.remote.to_owned());
                self.on_client_connect(&name, &local, &remote).map(Some)
            }
            cmd::CMD_DISCONNECT => {
                let d = cmd::decode_disconnect(&mut r)?;
                let name = d.name.to_owned();
                self.on_client_disconnect(&name, d.clean)?;
                Ok(None)
            }
            cmd::CMD_TIMESTAMP => {
                let clock = cmd::decode_clock(&mut r)?;
                self.on_timestamp(clock)?;
                Ok(None)
            }
            cmd::CMD_INFO => {
                self.on_info(data)?;
                Ok(None)
            }
            cmd::CMD_LOG => {
                let log = cmd::decode_log(&mut r)?;
                self.db()?.add_log(index, log.level, log.log)?;
                Ok(None)
            }
            other => Err(ResqlError::Fatal(format!("unknown command: {other}"))),
        }
    }

    fn on_init(&mut self, init: &cmd::InitCmd) -> Result<()> {
        self.shared.set_realtime_ms(init.realtime);
        self.monotonic = init.monotonic;

        *self.shared.wrand.lock().unwrap() = DetRand::new(&init.rand);
        *self.shared.rrand.lock().unwrap() = DetRand::new(&init.rand);

        self.db()?.add_log(0, "INFO", "Cluster init.")
    }

    fn on_meta(&mut self, index: u64, meta: Meta) -> Result<()> {
        self.meta = meta;

        // Forget nodes that left the cluster.
        let names: Vec<String> = self
            .infos
            .keys()
            .filter(|name| !self.meta.exists(name))
            .cloned()
            .collect();
        for name in names {
            self.infos.remove(&name);
            self.db()?.del_info(&name)?;
        }

        for n in &self.meta.nodes {
            let info = self.infos.entry(n.name.clone()).or_default();
            info.role = n.role.as_str().to_owned();
            info.urls = n
                .urls
                .iter()
                .map(|u| u.as_str())
                .collect::<Vec<_>>()
                .join(" ");
        }

        self.write_infos()?;
        let db = self.db()?;
        self.write_vars_to(db)?;

        let mut line = format!("Term[{}] :", self.meta.term);
        for n in &self.meta.nodes {
            line.push_str(&format!(" [{}:{}]", n.name, n.role.as_str()));
        }
        self.db()?.add_log(index, "INFO", &line)
    }

    fn on_term_start(&mut self, index: u64, clock: cmd::ClockCmd) -> Result<()> {
        self.shared
            .set_realtime_ms(self.realtime().max(clock.realtime));
        self.monotonic = clock.monotonic;

        // Every live session is softly disconnected; clients of the old
        // leader may resume within the expiry window.
        let names: Vec<String> = self.sessions.keys().cloned().collect();
        for name in names {
            self.on_client_disconnect(&name, false)?;
        }

        self.db()?.add_log(index, "INFO", "Term start")
    }

    fn on_timestamp(&mut self, clock: cmd::ClockCmd) -> Result<()> {
        debug_assert!(self.monotonic <= clock.monotonic);

        self.timestamp += clock.monotonic.saturating_sub(self.monotonic);
        self.monotonic = clock.monotonic;
        self.shared.set_realtime_ms(clock.realtime);

        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| {
                s.disconnect_time != 0
                    && self.timestamp.saturating_sub(s.disconnect_time) > self.session_timeout
            })
            .map(|s| s.name.clone())
            .collect();

        for name in expired {
            if let Some(sess) = self.sessions.remove(&name) {
                self.ids.remove(&sess.id);
                let db = self.db()?;
                db.del_client(&name)?;
                db.rm_client_stmts(sess.id)?;
            }
        }

        Ok(())
    }

    fn on_info(&mut self, data: &[u8]) -> Result<()> {
        let mut r = RawBuf::new(data);

        while r.remaining() != 0 {
            let name = r.get_string();
            let connected = r.get_bool();
            let stats = r.get_blob().to_vec();
            if !r.valid() {
                return Err(ResqlError::Invalid);
            }

            if let Some(info) = self.infos.get_mut(&name) {
                info.connected = connected;
                if !stats.is_empty() {
                    info.stats = stats;
                }
            }
        }

        self.write_infos()
    }

    fn write_infos(&self) -> Result<()> {
        let db = self.db()?;
        db.clear_info()?;
        for (name, info) in &self.infos {
            db.write_info(name, info.connected, &info.role, &info.urls, &info.stats)?;
        }
        Ok(())
    }

    fn on_client_connect(
        &mut self,
        name: &str,
        local: &str,
        remote: &str,
    ) -> Result<AppliedSession> {
        let index = self.index;
        let realtime = self.realtime();

        if !self.sessions.contains_key(name) {
            let sess = Session::new(name, index);
            self.ids.insert(sess.id, sess.name.clone());
            self.sessions.insert(name.to_owned(), sess);
        }

        let sess = self.sessions.get_mut(name).unwrap();
        sess.connected(local, remote, realtime);
        let applied = AppliedSession {
            name: sess.name.clone(),
            id: sess.id,
            seq: sess.seq,
            resp: Bytes::new(),
        };

        self.db
            .as_ref()
            .ok_or_else(|| ResqlError::Internal("state closed".to_owned()))?
            .write_client(self.sessions.get(name).unwrap())?;

        Ok(applied)
    }

    fn on_client_disconnect(&mut self, name: &str, clean: bool) -> Result<()> {
        let Some(sess) = self.sessions.get_mut(name) else {
            return Ok(());
        };

        sess.disconnected(self.timestamp);

        if clean {
            let sess = self.sessions.remove(name).unwrap();
            self.ids.remove(&sess.id);
            let db = self.db()?;
            db.del_client(name)?;
            db.rm_client_stmts(sess.id)?;
        } else {
            let sess = self.sessions.get(name).unwrap();
            self.db()?.write_client(sess)?;
        }

        Ok(())
    }

    fn on_client_request(&mut self, index: u64, e: &[u8]) -> Result<Option<AppliedSession>> {
        let cid = entry::cid(e);
        let seq = entry::seq(e);

        let name = self
            .ids
            .get(&cid)
            .cloned()
            .ok_or_else(|| ResqlError::Fatal(format!("session does not exist: {cid}")))?;

        let cached = {
            let sess = self.sessions.get(&name).unwrap();
            if seq == sess.seq {
                Some(sess.resp.clone())
            } else {
                None
            }
        };

        // A retry of the last acknowledged request returns the cached
        // response without re-executing.
        if let Some(resp) = cached {
            let sess = self.sessions.get(&name).unwrap();
            return Ok(Some(AppliedSession {
                name: sess.name.clone(),
                id: sess.id,
                seq: sess.seq,
                resp: Bytes::from(resp),
            }));
        }

        self.refresh_max_page()?;

        let db = self
            .db
            .as_ref()
            .ok_or_else(|| ResqlError::Internal("state closed".to_owned()))?;
        let sess = self.sessions.get_mut(&name).unwrap();

        let resp = exec::exec_request(db, sess, index, false, entry::data(e))?;

        sess.resp = resp.clone();
        sess.seq = seq;

        Ok(Some(AppliedSession {
            name: sess.name.clone(),
            id: sess.id,
            seq,
            resp: Bytes::from(resp),
        }))
    }

    /// Executes a readonly batch outside the log. The read RNG is reseeded
    /// from the current write-RNG state, so reads observe fresh randomness
    /// without perturbing replicated state.
    pub fn apply_readonly(&mut self, cid: u64, batch: &[u8]) -> Result<Vec<u8>> {
        let _guard = hooks::install(&self.shared);
        self.shared.set_client(true);
        self.shared.set_readonly(true);

        {
            let wrand = self.shared.wrand.lock().unwrap();
            let (_, _, s) = wrand.parts();
            let reseeded = DetRand::new(s);
            drop(wrand);
            *self.shared.rrand.lock().unwrap() = reseeded;
        }

        let out = (|| {
            let Some(name) = self.ids.get(&cid).cloned() else {
                return Ok(exec::encode_error("Session does not exist."));
            };

            let db = self
                .db
                .as_ref()
                .ok_or_else(|| ResqlError::Internal("state closed".to_owned()))?;
            let sess = self.sessions.get_mut(&name).unwrap();

            exec::exec_request(db, sess, 0, true, batch)
        })();

        self.shared.set_client(false);
        self.shared.set_readonly(false);

        out
    }
}
