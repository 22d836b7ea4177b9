// src/core/snapshot/mod.rs

//! The snapshot subsystem: asynchronous compaction of a sealed log page into
//! a standalone database file, plus the follower-side streaming install.
//!
//! One dedicated worker thread handles compaction; at most one job is in
//! flight. Completion is a token the consensus task drains in `wait()` at
//! its next opportunity — never before it actually needs the freed page.

mod worker;

pub use worker::SnapResult;

use crate::core::errors::{ResqlError, Result};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::error;

const SS_FILE: &str = "snapshot.resql";
const SS_RECV_FILE: &str = "snapshot.tmp.recv.resql";

pub struct Snapshot {
    path: PathBuf,
    recv_path: PathBuf,

    /// Term and index of the currently open snapshot file.
    pub term: u64,
    pub index: u64,
    map: Option<Mmap>,

    /// Result of the last completed compaction, adopted by `replace`.
    latest_term: u64,
    latest_index: u64,

    recv_term: u64,
    recv_index: u64,
    recv_file: Option<File>,

    task_tx: mpsc::Sender<worker::Task>,
    done_rx: tokio::sync::mpsc::UnboundedReceiver<SnapResult>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Snapshot {
    pub fn new(dir: &Path, cluster_name: &str, session_timeout: u64) -> Snapshot {
        let (done_tx, done_rx) = tokio::sync::mpsc::unbounded_channel();
        let (task_tx, worker) = worker::spawn(dir, cluster_name, session_timeout, done_tx);

        Snapshot {
            path: dir.join(SS_FILE),
            recv_path: dir.join(SS_RECV_FILE),
            term: 0,
            index: 0,
            map: None,
            latest_term: 0,
            latest_index: 0,
            recv_term: 0,
            recv_index: 0,
            recv_file: None,
            task_tx,
            done_rx,
            worker: Some(worker),
        }
    }

    /// Maps the canonical snapshot file for serving to lagging followers.
    pub fn open(&mut self, term: u64, index: u64) -> Result<()> {
        let file = File::open(&self.path)?;
        self.map = Some(unsafe { Mmap::map(&file)? });
        self.term = term;
        self.index = index;
        Ok(())
    }

    pub fn close(&mut self) {
        self.map = None;
    }

    pub fn len(&self) -> u64 {
        self.map.as_ref().map(|m| m.len() as u64).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A chunk of the open snapshot for one transfer message.
    pub fn chunk(&self, offset: u64, max: u32) -> &[u8] {
        match &self.map {
            Some(map) => {
                let start = (offset as usize).min(map.len());
                let end = (start + max as usize).min(map.len());
                &map[start..end]
            }
            None => &[],
        }
    }

    /// Enqueues compaction of a sealed page. The caller tracks that only one
    /// job is in flight.
    pub fn take(&self, page_path: &Path) -> Result<()> {
        self.task_tx
            .send(worker::Task::Compact {
                page_path: page_path.to_path_buf(),
            })
            .map_err(|_| ResqlError::Fatal("snapshot worker is gone".to_owned()))
    }

    /// Blocks the consensus task until the in-flight compaction completes,
    /// recording the result for `replace`.
    pub async fn wait(&mut self) -> Result<SnapResult> {
        let res = self
            .done_rx
            .recv()
            .await
            .ok_or_else(|| ResqlError::Fatal("snapshot worker is gone".to_owned()))?;

        if res.ok {
            self.latest_term = res.term;
            self.latest_index = res.index;
        }

        Ok(res)
    }

    /// Re-opens the canonical file after a completed compaction.
    pub fn replace(&mut self) -> Result<()> {
        self.close();
        self.open(self.latest_term, self.latest_index)
    }

    /// One chunk of a streaming install. A changed (term, index) discards
    /// the scratch file first. Returns true when the install completed and
    /// the canonical file was swapped in.
    pub fn recv(
        &mut self,
        term: u64,
        index: u64,
        done: bool,
        offset: u64,
        data: &[u8],
    ) -> Result<bool> {
        if self.recv_term != term || self.recv_index != index {
            self.clear_recv();
            self.recv_term = term;
            self.recv_index = index;
        }

        if self.recv_file.is_none() {
            self.recv_file = Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&self.recv_path)?,
            );
        }

        self.recv_file
            .as_ref()
            .unwrap()
            .write_all_at(data, offset)
            .map_err(|e| ResqlError::Fatal(format!("snapshot write: {e}")))?;

        if done {
            self.recv_file = None;
            std::fs::rename(&self.recv_path, &self.path)
                .map_err(|e| ResqlError::Fatal(format!("rename: {e}")))?;

            self.term = 0;
            self.index = 0;
            self.close();

            return Ok(true);
        }

        Ok(false)
    }

    /// Discards a half-received install.
    pub fn clear_recv(&mut self) {
        if self.recv_file.take().is_some() {
            let _ = std::fs::remove_file(&self.recv_path);
            self.recv_term = 0;
            self.recv_index = 0;
        }
    }

    pub fn stop(&mut self) {
        let _ = self.task_tx.send(worker::Task::Stop);
        if let Some(handle) = self.worker.take()
            && handle.join().is_err()
        {
            error!("snapshot worker panicked");
        }
    }
}
