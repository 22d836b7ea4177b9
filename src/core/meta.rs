// src/core/meta.rs

//! Cluster membership: the replicated view of who is in the cluster, who
//! leads, and how to reach everyone.
//!
//! A membership change keeps the pre-change meta in `prev` until the change
//! commits; truncation rolls back to it, and the next committed meta clears
//! it. `uris` is the canonical space-separated URL list, leader first, which
//! connect responses hand to clients so they can rebuild their endpoint set.

use crate::core::buffer::{Buf, RawBuf};
use crate::core::errors::{ResqlError, Result};
use url::Url;

/// Hard cap on the initial membership list.
pub const MAX_NODES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaNode {
    pub name: String,
    pub connected: bool,
    pub role: Role,
    pub urls: Vec<Url>,
}

impl MetaNode {
    fn new(url: Url) -> MetaNode {
        MetaNode {
            name: url.username().to_owned(),
            connected: false,
            role: Role::Follower,
            urls: vec![url],
        }
    }

    fn encode(&self, buf: &mut Buf) {
        buf.put_str(&self.name);
        buf.put_bool(self.connected);
        buf.put_u8(match self.role {
            Role::Leader => 0,
            Role::Follower => 1,
        });
        buf.put_u32(self.urls.len() as u32);
        for url in &self.urls {
            buf.put_str(url.as_str());
        }
    }

    fn decode(r: &mut RawBuf) -> Result<MetaNode> {
        let name = r.get_string();
        let connected = r.get_bool();
        let role = match r.get_u8() {
            0 => Role::Leader,
            1 => Role::Follower,
            _ => return Err(ResqlError::Invalid),
        };

        let count = r.get_u32();
        let mut urls = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let s = r.get_str();
            if !r.valid() {
                return Err(ResqlError::Invalid);
            }
            urls.push(Url::parse(s).map_err(|_| ResqlError::Invalid)?);
        }

        Ok(MetaNode {
            name,
            connected,
            role,
            urls,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Meta {
    /// Cluster name.
    pub name: String,
    /// Space-separated URL list, leader's endpoints first.
    pub uris: String,
    pub term: u64,
    /// Index of the log entry that installed this meta.
    pub index: u64,
    pub voter: u32,
    pub nodes: Vec<MetaNode>,
    /// The meta before the most recent membership change, kept until the
    /// change commits so truncation can roll it back.
    pub prev: Option<Box<Meta>>,
}

impl Meta {
    pub fn new(cluster_name: &str) -> Meta {
        Meta {
            name: cluster_name.to_owned(),
            ..Meta::default()
        }
    }

    pub fn encode(&self, buf: &mut Buf) {
        buf.put_str(&self.name);
        buf.put_str(&self.uris);
        buf.put_u64(self.term);
        buf.put_u64(self.index);
        buf.put_u32(self.voter);
        buf.put_u32(self.nodes.len() as u32);

        for n in &self.nodes {
            n.encode(buf);
        }

        match &self.prev {
            None => buf.put_bool(false),
            Some(prev) => {
                buf.put_bool(true);
                prev.encode(buf);
            }
        }
    }

    pub fn decode(r: &mut RawBuf) -> Result<Meta> {
        let name = r.get_string();
        let uris = r.get_string();
        let term = r.get_u64();
        let index = r.get_u64();
        let voter = r.get_u32();

        let count = r.get_u32();
        if !r.valid() || count as usize > MAX_NODES * 4 {
            return Err(ResqlError::Invalid);
        }

        let mut nodes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            nodes.push(MetaNode::decode(r)?);
        }

        let prev = if r.get_bool() {
            Some(Box::new(Meta::decode(r)?))
        } else {
            None
        };

        if !r.valid() {
            return Err(ResqlError::Invalid);
        }

        Ok(Meta {
            name,
            uris,
            term,
            index,
            voter,
            nodes,
            prev,
        })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Meta> {
        Meta::decode(&mut RawBuf::new(data))
    }

    /// Builds the initial membership from a space-separated URL list.
    pub fn parse_uris(&mut self, urls: &str) -> Result<()> {
        for token in urls.split_whitespace() {
            let url = Url::parse(token)?;
            if !self.validate(&url) {
                return Err(ResqlError::Config(format!("invalid node url: {token}")));
            }
            self.nodes.push(MetaNode::new(url));
            if self.nodes.len() > MAX_NODES {
                return Err(ResqlError::Config(format!(
                    "cluster cannot have more than {MAX_NODES} nodes"
                )));
            }
        }

        self.update();
        Ok(())
    }

    /// A node URL must carry a name, a host and a port, all unique within
    /// the cluster.
    fn validate(&self, url: &Url) -> bool {
        if url.username().is_empty()
            || url.scheme().is_empty()
            || url.host_str().is_none()
            || url.port().is_none()
        {
            return false;
        }

        for n in &self.nodes {
            if n.name == url.username() {
                return false;
            }
            for u in &n.urls {
                if u.host_str() == url.host_str() && u.port() == url.port() {
                    return false;
                }
            }
        }

        true
    }

    /// Adds a node, saving the current meta as the rollback predecessor.
    pub fn add(&mut self, url: Url) -> bool {
        debug_assert!(self.prev.is_none());

        if !self.validate(&url) {
            return false;
        }

        let mut saved = self.clone();
        saved.prev = None;
        self.prev = Some(Box::new(saved));

        self.nodes.push(MetaNode::new(url));
        self.update();

        true
    }

    /// Removes a node by name, saving the rollback predecessor.
    pub fn remove(&mut self, name: &str) -> bool {
        debug_assert!(self.prev.is_none());

        if !self.exists(name) {
            return false;
        }

        let mut saved = self.clone();
        saved.prev = None;
        self.prev = Some(Box::new(saved));

        self.nodes.retain(|n| n.name != name);
        self.update();

        true
    }

    pub fn exists(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name)
    }

    /// Marks a membership change completed.
    pub fn remove_prev(&mut self) {
        debug_assert!(self.prev.is_some());
        self.prev = None;
    }

    /// Reverts to the predecessor if the entry that installed this meta sits
    /// above `index` (it was truncated away).
    pub fn rollback(&mut self, index: u64) {
        if self.prev.is_some() && self.index > index {
            *self = *self.prev.take().unwrap();
        }
    }

    /// Adopts a replicated meta wholesale, as on snapshot install.
    pub fn replace_from(&mut self, data: &[u8]) -> Result<()> {
        *self = Meta::from_bytes(data)?;
        Ok(())
    }

    pub fn set_leader(&mut self, name: &str) {
        let mut found = false;

        for n in &mut self.nodes {
            if n.name == name {
                n.role = Role::Leader;
                found = true;
            } else if n.role == Role::Leader {
                n.role = Role::Follower;
            }
        }

        debug_assert!(found);
        self.update();
    }

    pub fn set_connected(&mut self, name: &str) {
        if let Some(n) = self.nodes.iter_mut().find(|n| n.name == name) {
            n.connected = true;
        }
    }

    pub fn set_disconnected(&mut self, name: &str) {
        if let Some(n) = self.nodes.iter_mut().find(|n| n.name == name) {
            n.connected = false;
        }
    }

    pub fn clear_connection(&mut self) {
        for n in &mut self.nodes {
            n.connected = false;
        }
    }

    /// Recomputes the voter count and the canonical URL string.
    fn update(&mut self) {
        self.voter = self.nodes.len() as u32;

        let mut uris = String::new();
        for n in self.nodes.iter().filter(|n| n.role == Role::Leader) {
            for u in &n.urls {
                uris.push_str(u.as_str());
                uris.push(' ');
            }
        }
        for n in self.nodes.iter().filter(|n| n.role != Role::Leader) {
            for u in &n.urls {
                uris.push_str(u.as_str());
                uris.push(' ');
            }
        }

        self.uris = uris;
    }

    pub fn describe(&self) -> String {
        let mut out = format!("term[{}] voters[{}]:", self.term, self.voter);
        for n in &self.nodes {
            out.push_str(&format!(" [{}:{}]", n.name, n.role.as_str()));
        }
        out
    }
}
