// src/core/raft/replication.rs

//! Log replication and commit advancement.
//!
//! The leader keeps one append request in flight per peer, drawn in frames
//! of at most `MAX_FRAME` bytes. Peers whose cursor falls behind the
//! snapshot boundary switch to a chunked snapshot transfer. Commit advances
//! through the median of the voters' acknowledged indexes; the read-index
//! round counter rides the same acknowledgements to serve readonly requests
//! without log entries.

use super::{MAX_FRAME, Role, Server};
use crate::core::cmd;
use crate::core::errors::{ResqlError, Result};
use crate::core::log::{Store, entry};
use crate::core::protocol::Msg;
use bytes::Bytes;
use tracing::info;

impl Server {
    // ------------------------------------------------------------------
    // Follower side

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn on_append_req(
        &mut self,
        name: &str,
        term: u64,
        prev_index: u64,
        prev_term: u64,
        leader_commit: u64,
        round: u64,
        entries: Bytes,
    ) -> Result<()> {
        let mut success = false;

        if self.meta.term <= term {
            if term > self.meta.term || (term == self.meta.term && self.leader.is_none()) {
                self.become_follower(Some(name));
                self.update_meta(term, Some(name))?;
            }

            if let Some(i) = self.node_idx(name) {
                self.nodes[i].in_timestamp = self.timestamp;
            }

            let (last_index, local_prev) = {
                let store = self.store();
                (store.last_index, store.term_of(prev_index))
            };

            if prev_index <= last_index && prev_term == local_prev {
                self.store_entries(prev_index + 1, &entries).await?;
                self.become_follower(Some(name));
                self.update_commit(leader_commit).await?;
                success = true;
            }
        }

        let resp = Msg::AppendResp {
            term: self.meta.term,
            index: self.store().last_index,
            round: if success { round } else { 0 },
            success,
        };
        self.send_to_node(name, resp);

        Ok(())
    }

    /// Appends replicated entries starting at `index`, truncating a
    /// conflicting suffix (and rolling back an uncommitted membership
    /// change) when a term mismatch shows the old entries are dead.
    async fn store_entries(&mut self, mut index: u64, buf: &Bytes) -> Result<()> {
        for e in entry::iter(buf) {
            // A corrupt entry makes the whole link suspect.
            if entry::decode(e).is_none() {
                return Err(ResqlError::Invalid);
            }

            let cur_term = self.store().entry_at(index).map(entry::term);

            if let Some(cur) = cur_term {
                if cur == entry::term(e) {
                    index += 1;
                    continue;
                }
                self.store_mut().remove_after(index - 1)?;
                self.meta.rollback(index - 1);
            }

            if entry::flags(e) == cmd::CMD_META {
                self.meta.replace_from(entry::data(e))?;
                self.sync_nodes();
            }

            loop {
                match self.store_mut().put_entry(index, e) {
                    Ok(()) => break,
                    Err(ResqlError::Full) => {
                        if self.wait_snapshot().await? {
                            continue;
                        }
                        let size = entry::len(e) as usize;
                        self.store_mut()
                            .reserve(size)
                            .map_err(|_| ResqlError::Fatal("out of disk space".to_owned()))?;
                    }
                    Err(e) => return Err(e),
                }
            }

            index += 1;
        }

        if self.conf_fsync() {
            self.store_mut().flush()?;
        }

        Ok(())
    }

    pub(crate) fn become_follower(&mut self, leader: Option<&str>) {
        if self.role == Role::Follower && self.leader.as_deref() == leader {
            return;
        }

        self.role = Role::Follower;
        self.leader = leader.map(str::to_owned);
        self.ss.clear_recv();

        if let Some(name) = leader
            && self.meta.exists(name)
        {
            self.meta.set_leader(name);
        }
    }

    // ------------------------------------------------------------------
    // Leader side

    pub(crate) fn on_append_resp(
        &mut self,
        name: &str,
        term: u64,
        index: u64,
        round: u64,
        success: bool,
    ) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }

        let Some(i) = self.node_idx(name) else {
            return Ok(());
        };

        self.nodes[i].msg_inflight = self.nodes[i].msg_inflight.saturating_sub(1);
        self.nodes[i].in_timestamp = self.timestamp;

        if success {
            self.nodes[i].update_indexes(round, index);
            return Ok(());
        }

        if term > self.meta.term {
            self.update_meta(term, None)?;
            self.become_follower(None);
            return Ok(());
        }

        // Rejected on a prev mismatch: resume from what the peer reports.
        self.nodes[i].match_idx = index;
        self.nodes[i].next = index + 1;
        self.nodes[i].round = 0;

        Ok(())
    }

    /// Applies newly committed entries in order, then triggers compaction
    /// once the commit has crossed the rotation boundary.
    pub(crate) async fn update_commit(&mut self, commit: u64) -> Result<()> {
        if self.commit < commit {
            let min = commit.min(self.store().last_index);

            for i in self.commit + 1..=min {
                let (flags, applied) = {
                    let store = self.store.as_ref().expect("store open");
                    let e = store
                        .entry_at(i)
                        .ok_or_else(|| ResqlError::Fatal(format!("missing entry {i}")))?;
                    (entry::flags(e), self.state.apply(i, e)?)
                };

                self.commit = i;
                self.on_applied_entry(flags, applied)?;
                self.collect_jobs();
            }
        }

        if !self.ss_inprogress && self.commit >= self.store().rotation_index() {
            self.ss_inprogress = true;
            let path = self.store().rotation_page().path().to_path_buf();
            self.ss.take(&path)?;
        }

        Ok(())
    }

    /// Sorted-median commit rule: with matches ordered descending, the value
    /// at position `voter/2` is replicated on a majority. Only entries of
    /// the current term commit by counting.
    pub(crate) async fn check_commit(&mut self) -> Result<()> {
        let idx = (self.meta.voter / 2) as usize;

        let mut matches: Vec<u64> = self
            .nodes
            .iter()
            .filter(|n| n.known)
            .map(|n| n.match_idx)
            .collect();
        if matches.len() <= idx {
            return Ok(());
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));

        let match_index = matches[idx];
        let target = if self.store().term_of(match_index) == self.meta.term {
            match_index
        } else {
            self.commit
        };
        self.update_commit(target).await?;

        if self.read_reqs.is_empty() {
            return Ok(());
        }

        let mut rounds: Vec<u64> = self
            .nodes
            .iter()
            .filter(|n| n.known)
            .map(|n| n.round)
            .collect();
        if rounds.len() <= idx {
            return Ok(());
        }
        rounds.sort_unstable_by(|a, b| b.cmp(a));
        self.round_match = self.round_match.max(rounds[idx]);

        // Readonly requests become safe in arrival order once their round
        // has been echoed by a majority and their commit point applied.
        while let Some(name) = self.read_reqs.front().cloned() {
            let Some(c) = self.clients.get(&name) else {
                self.read_reqs.pop_front();
                continue;
            };

            if c.round_index > self.round_match || c.commit_index > self.commit {
                break;
            }

            self.read_reqs.pop_front();
            self.process_readonly(&name)?;
        }

        Ok(())
    }

    fn process_readonly(&mut self, name: &str) -> Result<()> {
        let (id, batch) = {
            let Some(c) = self.clients.get(name) else {
                return Ok(());
            };
            (c.id, c.read_batch.clone())
        };

        let body = self.state.apply_readonly(id, &batch)?;
        self.collect_jobs();

        let followup = {
            let Some(c) = self.clients.get_mut(name) else {
                return Ok(());
            };
            c.conn.send(Msg::ClientResp {
                batch: Bytes::from(body),
            });
            c.processed().map(|msg| (c.conn.id, msg))
        };

        if let Some((cid, msg)) = followup {
            let _ = self
                .events_tx
                .send(crate::connection::Event::Msg { cid, msg });
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Flush: drive replication after each event turn

    pub(crate) async fn flush(&mut self) -> Result<()> {
        if self.full || self.role != Role::Leader {
            return Ok(());
        }

        self.flush_nodes().await?;

        // The leader acknowledges its own log after the durability point.
        {
            let fsync = self.conf_fsync();
            let last = self.store().last_index;
            let round = self.round;

            if let Some(i) = self.nodes.iter().position(|n| n.name == self.own_name) {
                if self.nodes[i].next <= last {
                    if fsync {
                        self.store_mut().flush()?;
                    }
                    self.nodes[i].match_idx = last;
                    self.nodes[i].next = last + 1;
                }
                self.nodes[i].round = round;
            }
        }

        self.check_commit().await?;
        self.round_prev = self.round;

        self.handle_jobs().await
    }

    async fn flush_nodes(&mut self) -> Result<()> {
        for i in 0..self.nodes.len() {
            {
                let n = &self.nodes[i];
                if n.name == self.own_name || !n.connected() || !n.known {
                    continue;
                }
            }

            if self.nodes[i].next <= self.store().ss_index {
                self.send_snapshot_chunk(i).await?;
                continue;
            }

            let want_data = self.nodes[i].msg_inflight == 0
                && (self.nodes[i].next <= self.store().last_index || self.round != self.round_prev);

            if want_data {
                let prev = self.nodes[i].next - 1;
                let (payload, count) = {
                    let store = self.store();
                    match store.entries_from(self.nodes[i].next, MAX_FRAME) {
                        Some((region, count)) => (Bytes::copy_from_slice(region), count),
                        None => (Bytes::new(), 0),
                    }
                };

                let msg = Msg::AppendReq {
                    term: self.meta.term,
                    prev_index: prev,
                    prev_term: self.store().term_of(prev),
                    leader_commit: self.commit,
                    round: self.round,
                    entries: payload,
                };

                let n = &mut self.nodes[i];
                n.next += count as u64;
                n.msg_inflight += 1;
                n.out_timestamp = self.timestamp;
                if let Some(conn) = &n.conn {
                    conn.send(msg);
                }
                continue;
            }

            // Idle link: empty append as heartbeat.
            let stale = self.nodes[i].msg_inflight == 0
                && self.timestamp.saturating_sub(self.nodes[i].out_timestamp)
                    > self.heartbeat() / 2;
            if stale {
                let prev = self.nodes[i].next - 1;
                let msg = Msg::AppendReq {
                    term: self.meta.term,
                    prev_index: prev,
                    prev_term: self.store().term_of(prev),
                    leader_commit: self.commit,
                    round: self.round,
                    entries: Bytes::new(),
                };

                let n = &mut self.nodes[i];
                n.msg_inflight += 1;
                n.out_timestamp = self.timestamp;
                if let Some(conn) = &n.conn {
                    conn.send(msg);
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshot transfer

    async fn send_snapshot_chunk(&mut self, i: usize) -> Result<()> {
        if self.nodes[i].msg_inflight > 0 {
            return Ok(());
        }

        if self.nodes[i].ss_index != self.ss.index {
            self.nodes[i].ss_index = self.ss.index;
            self.nodes[i].ss_pos = 0;

            let line = format!("Sending snapshot[{}] to: {}", self.ss.index, self.nodes[i].name);
            self.log_entry("WARN", line).await?;
        }

        let offset = self.nodes[i].ss_pos;
        let chunk = self.ss.chunk(offset, MAX_FRAME);
        let done = offset + chunk.len() as u64 == self.ss.len();

        if chunk.is_empty() && !done {
            return Ok(());
        }

        let msg = Msg::SnapshotReq {
            term: self.meta.term,
            ss_term: self.ss.term,
            ss_index: self.ss.index,
            offset,
            done,
            data: Bytes::copy_from_slice(chunk),
        };

        let len = chunk.len() as u64;
        let n = &mut self.nodes[i];
        n.ss_pos += len;
        n.msg_inflight += 1;
        n.out_timestamp = self.timestamp;
        if let Some(conn) = &n.conn {
            conn.send(msg);
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn on_snapshot_req(
        &mut self,
        name: &str,
        term: u64,
        ss_term: u64,
        ss_index: u64,
        offset: u64,
        done: bool,
        data: &Bytes,
    ) -> Result<()> {
        let mut success = true;

        if self.meta.term > term {
            success = false;
        } else {
            if term > self.meta.term || (term == self.meta.term && self.leader.is_none()) {
                self.become_follower(Some(name));
                self.update_meta(term, Some(name))?;
            }

            if let Some(i) = self.node_idx(name) {
                self.nodes[i].in_timestamp = self.timestamp;
            }

            // Our own compaction must settle before its output is replaced.
            self.wait_snapshot().await?;

            match self.ss.recv(ss_term, ss_index, done, offset, data) {
                Ok(true) => self.install_snapshot()?,
                Ok(false) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => {
                    self.ss.clear_recv();
                    success = false;
                }
            }
        }

        self.send_to_node(
            name,
            Msg::SnapshotResp {
                term: self.meta.term,
                success,
                done,
            },
        );

        Ok(())
    }

    /// Adopts an installed snapshot: all replica state is rebuilt from it.
    fn install_snapshot(&mut self) -> Result<()> {
        info!("installing received snapshot");

        self.state.reopen_from_snapshot(self.conf_in_memory())?;

        self.store = Some(Store::open(
            self.dir_path(),
            self.state.term,
            self.state.index,
        )?);
        self.ss.open(self.state.term, self.state.index)?;
        self.commit = self.state.index;

        self.meta = self.state.meta.clone();
        self.sync_nodes();
        self.write_meta_file()?;

        Ok(())
    }

    pub(crate) async fn on_snapshot_resp(&mut self, name: &str, term: u64, done: bool) -> Result<()> {
        let Some(i) = self.node_idx(name) else {
            return Ok(());
        };
        self.nodes[i].msg_inflight = self.nodes[i].msg_inflight.saturating_sub(1);

        if term > self.meta.term {
            self.update_meta(term, None)?;
            self.become_follower(None);
            return Ok(());
        }

        if done {
            self.nodes[i].next = self.ss.index + 1;
            let line = format!("Snapshot[{}] sent to: {}", self.ss.index, name);
            self.log_entry("WARN", line).await?;
        }

        Ok(())
    }
}
