// src/core/snapshot/worker.rs

//! The compaction worker: a dedicated thread that replays every entry of a
//! sealed page through a snapshot-mode applier into a private copy of the
//! snapshot, then renames the result over the canonical file.
//!
//! The sealed page is immutable while the job runs; the worker maps the
//! same file read-only and never touches live state.

use crate::core::errors::{ResqlError, Result};
use crate::core::log::entry;
use crate::core::state::State;
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Instant;
use tracing::{error, info};

const PAGE_HEADER_LEN: usize = 32;
const PAGE_PREV_INDEX_OFFSET: usize = 8;

pub(crate) enum Task {
    Compact { page_path: PathBuf },
    Stop,
}

/// Outcome of one compaction, delivered to the consensus task.
#[derive(Debug, Clone, Copy)]
pub struct SnapResult {
    pub ok: bool,
    pub term: u64,
    pub index: u64,
    pub time_ms: u64,
    pub size: u64,
}

/// Read-only view of a sealed page.
struct PageView {
    map: Mmap,
    prev_index: u64,
}

impl PageView {
    fn open(path: &Path) -> Result<PageView> {
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };

        if map.len() < PAGE_HEADER_LEN {
            return Err(ResqlError::Corrupt(format!("short page: {}", path.display())));
        }

        let prev_index = u64::from_le_bytes(
            map[PAGE_PREV_INDEX_OFFSET..PAGE_PREV_INDEX_OFFSET + 8]
                .try_into()
                .unwrap(),
        );

        Ok(PageView { map, prev_index })
    }

    fn entries(&self) -> Vec<&[u8]> {
        let mut out = Vec::new();
        let mut pos = PAGE_HEADER_LEN;

        loop {
            let remaining = self.map.len() - pos;
            if remaining < 4 || self.map[pos..pos + 4] == [0, 0, 0, 0] {
                break;
            }

            match entry::decode(&self.map[pos..]) {
                Some(total) => {
                    out.push(&self.map[pos..pos + total]);
                    pos += total;
                }
                None => break,
            }
        }

        out
    }
}

pub(crate) fn spawn(
    dir: &Path,
    cluster_name: &str,
    session_timeout: u64,
    done_tx: tokio::sync::mpsc::UnboundedSender<SnapResult>,
) -> (mpsc::Sender<Task>, std::thread::JoinHandle<()>) {
    let (task_tx, task_rx) = mpsc::channel::<Task>();
    let dir = dir.to_path_buf();
    let cluster = cluster_name.to_owned();

    let handle = std::thread::Builder::new()
        .name("snapshot".to_owned())
        .spawn(move || {
            info!("snapshot worker started");

            while let Ok(task) = task_rx.recv() {
                let page_path = match task {
                    Task::Stop => return,
                    Task::Compact { page_path } => page_path,
                };

                let result = compact(&dir, &cluster, session_timeout, &page_path)
                    .unwrap_or_else(|e| {
                        error!("snapshot failed: {e}");
                        SnapResult {
                            ok: false,
                            term: 0,
                            index: 0,
                            time_ms: 0,
                            size: 0,
                        }
                    });

                if done_tx.send(result).is_err() {
                    return;
                }
            }
        })
        .expect("spawn snapshot worker");

    (task_tx, handle)
}

fn compact(
    dir: &Path,
    cluster_name: &str,
    session_timeout: u64,
    page_path: &Path,
) -> Result<SnapResult> {
    let start = Instant::now();

    let mut state = State::new(dir, cluster_name, session_timeout);
    state.open_for_snapshot()?;

    let page = PageView::open(page_path)?;
    let first = page.prev_index + 1;
    let mut index = page.prev_index;

    for e in page.entries() {
        index += 1;
        state.apply(index, e)?;
    }

    let (term, last) = (state.term, state.index);
    let ss_path = state.ss_path().to_path_buf();
    let ss_tmp_path = state.ss_tmp_path().to_path_buf();
    state.close()?;

    let _ = std::fs::remove_file(&ss_path);
    std::fs::rename(&ss_tmp_path, &ss_path)
        .map_err(|e| ResqlError::Fatal(format!("rename: {e}")))?;

    let size = std::fs::metadata(&ss_path).map(|m| m.len()).unwrap_or(0);
    let time_ms = start.elapsed().as_millis() as u64;

    info!("snapshot done in {time_ms} ms for [{first}, {index}]");

    Ok(SnapResult {
        ok: true,
        term,
        index: last,
        time_ms,
        size,
    })
}
