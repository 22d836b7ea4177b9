// src/core/raft/election.rs

//! Leader election with a prevote round. A follower that has not heard from
//! a leader within its randomized timeout first polls the cluster at
//! `term + 1` without touching persistent state; only a prevote majority
//! makes it persist the new term and ask for real votes. This keeps a
//! partitioned node from inflating the term and disrupting a healthy
//! leader.

use super::{Role, Server};
use crate::core::errors::Result;
use crate::core::protocol::Msg;
use tracing::{debug, info};

impl Server {
    pub(crate) fn majority(&self) -> u32 {
        self.meta.voter / 2 + 1
    }

    /// True while we have heard from a live leader within one heartbeat.
    fn leader_alive(&self) -> bool {
        let Some(leader) = &self.leader else {
            return false;
        };
        if leader == &self.own_name {
            return true;
        }
        let Some(i) = self.node_idx(leader) else {
            return false;
        };
        self.timestamp.saturating_sub(self.nodes[i].in_timestamp) < self.heartbeat()
    }

    fn send_to_peers(&self, msg: &Msg) {
        for n in self.nodes.iter().filter(|n| n.connected() && n.known) {
            if let Some(conn) = &n.conn {
                conn.send(msg.clone());
            }
        }
    }

    pub(crate) async fn on_election_timeout(&mut self) -> Result<()> {
        if self.leader.as_deref() == Some(self.own_name.as_str()) {
            return Ok(());
        }

        if self.heartbeat() > self.timestamp.saturating_sub(self.vote_timestamp) {
            return Ok(());
        }

        if self.leader_alive() {
            return Ok(());
        }

        // Only cluster members (or a node whose join is pending) may stand.
        if !self.in_cluster && self.meta.prev.is_none() {
            return Ok(());
        }

        let mut connected = self
            .nodes
            .iter()
            .filter(|n| n.connected() && n.known)
            .count() as u32;
        if self.in_cluster {
            connected += 1;
        }

        if connected < self.majority() {
            info!(
                "cluster nodes = {}, connected nodes = {connected}, no election will take place",
                self.meta.voter
            );
            return Ok(());
        }

        info!("starting election, term[{}]", self.meta.term + 1);

        self.role = Role::Candidate;
        self.prevote_count = if self.in_cluster { 1 } else { 0 };
        self.prevote_term = self.meta.term + 1;

        let (last_index, last_term) = {
            let store = self.store();
            (store.last_index, store.last_term)
        };

        self.send_to_peers(&Msg::PrevoteReq {
            term: self.meta.term + 1,
            last_term,
            last_index,
        });

        self.check_prevote_count().await
    }

    pub(crate) async fn check_prevote_count(&mut self) -> Result<()> {
        if self.prevote_count < self.majority() {
            return Ok(());
        }

        let term = self.prevote_term;
        let own = self.own_name.clone();
        self.update_meta(term, Some(&own))?;

        self.vote_count = if self.in_cluster { 1 } else { 0 };

        let (last_index, last_term) = {
            let store = self.store();
            (store.last_index, store.last_term)
        };

        self.send_to_peers(&Msg::ReqvoteReq {
            term: self.meta.term,
            last_term,
            last_index,
        });

        if self.vote_count >= self.majority() {
            self.become_leader().await?;
        }

        Ok(())
    }

    pub(crate) fn on_prevote_req(
        &mut self,
        name: &str,
        term: u64,
        _last_term: u64,
        last_index: u64,
    ) -> Result<()> {
        let own_last = self.store().last_index;
        let mut granted = false;

        if !self.leader_alive() && !(term == self.meta.term && self.voted_for.is_some()) {
            if term > self.meta.term && last_index >= own_last {
                granted = true;
            }
            self.vote_timestamp = self.timestamp;
        }

        self.send_to_node(
            name,
            Msg::PrevoteResp {
                term,
                index: own_last,
                granted,
            },
        );

        Ok(())
    }

    pub(crate) async fn on_prevote_resp(
        &mut self,
        name: &str,
        term: u64,
        granted: bool,
    ) -> Result<()> {
        if self.role != Role::Candidate || self.prevote_term != term {
            debug!("stale prevote response from {name}");
            return Ok(());
        }

        if term > self.prevote_term {
            self.update_meta(term, None)?;
            self.prevote_count = 0;
            self.role = Role::Follower;
            return Ok(());
        }

        if !granted {
            return Ok(());
        }

        self.prevote_count += 1;
        self.check_prevote_count().await
    }

    pub(crate) fn on_reqvote_req(
        &mut self,
        name: &str,
        term: u64,
        _last_term: u64,
        last_index: u64,
    ) -> Result<()> {
        let own_last = self.store().last_index;
        let mut granted = false;

        if !self.leader_alive() && !(term == self.meta.term && self.voted_for.is_some()) {
            if term > self.meta.term && last_index >= own_last {
                granted = true;
                self.update_meta(term, Some(name))?;
            }
        }

        self.send_to_node(
            name,
            Msg::ReqvoteResp {
                term,
                index: own_last,
                granted,
            },
        );

        Ok(())
    }

    pub(crate) async fn on_reqvote_resp(
        &mut self,
        name: &str,
        term: u64,
        granted: bool,
    ) -> Result<()> {
        if self.role != Role::Candidate || self.meta.term != term {
            debug!("stale vote response from {name}");
            return Ok(());
        }

        if term > self.meta.term {
            debug!("vote response with newer term from {name}, stepping down");
            self.update_meta(term, None)?;
            self.prevote_count = 0;
            self.role = Role::Follower;
            return Ok(());
        }

        if !granted {
            return Ok(());
        }

        self.vote_count += 1;
        if self.vote_count >= self.majority() {
            self.become_leader().await?;
        }

        Ok(())
    }

    pub(crate) fn send_to_node(&self, name: &str, msg: Msg) {
        if let Some(i) = self.node_idx(name)
            && let Some(conn) = &self.nodes[i].conn
        {
            conn.send(msg);
        }
    }

    /// Promotion: reset every peer's cursor to our log end, then seed the
    /// term with INIT (only on an empty log), the membership record and the
    /// term-start marker. The term counts as up only once that marker
    /// commits.
    pub(crate) async fn become_leader(&mut self) -> Result<()> {
        self.role = Role::Leader;
        self.leader = Some(self.own_name.clone());

        let last_index = self.store().last_index;
        for n in &mut self.nodes {
            n.clear_indexes(last_index);
        }

        if self.store().last_index == 0 {
            self.write_init_cmd().await?;
        }

        self.write_meta_cmd().await?;
        self.write_term_start_cmd().await?;

        info!("{}", self.meta.describe());

        Ok(())
    }
}
