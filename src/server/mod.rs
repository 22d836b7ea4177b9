// src/server/mod.rs

//! Server bootstrap: working directory, pid lock, the listener socket and
//! the consensus task. Everything interesting happens inside
//! [`crate::core::raft::Server`]; this module only wires it to the world.

mod stream;

pub use stream::AnyStream;

use crate::config::Config;
use crate::connection::Event;
use crate::core::errors::{ResqlError, Result};
use crate::core::raft;
use anyhow::Context;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tracing::{error, info};
use url::Url;

const PID_FILE: &str = ".pid";

/// Handle to a running node, used by embedders and tests.
pub struct ServerHandle {
    events: mpsc::UnboundedSender<Event>,
    task: tokio::task::JoinHandle<Result<()>>,
    accept_task: tokio::task::JoinHandle<()>,
    _pid: PidLock,
}

impl ServerHandle {
    /// Requests a clean shutdown.
    pub fn stop(&self) {
        let _ = self.events.send(Event::Shutdown);
    }

    /// Waits for the node to finish.
    pub async fn join(self) -> Result<()> {
        let rc = self
            .task
            .await
            .unwrap_or_else(|e| Err(ResqlError::Internal(format!("server task: {e}"))));
        self.accept_task.abort();
        rc
    }

    /// Hard kill, as close to `SIGKILL` as the in-process harness gets.
    pub fn kill(self) {
        self.task.abort();
        self.accept_task.abort();
    }
}

/// Exclusive pid-file lock; released (and removed) on drop.
struct PidLock {
    path: PathBuf,
    file: std::fs::File,
}

impl PidLock {
    fn acquire(dir: &Path) -> Result<PidLock> {
        let path = dir.join(PID_FILE);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(ResqlError::Config(format!(
                "another instance is running in {}",
                dir.display()
            )));
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(PidLock { path, file })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Removes every persistent artifact of a node from its directory.
pub fn wipe_dir(dir: &Path) -> std::io::Result<()> {
    for name in [
        "meta.resql",
        "meta.tmp.resql",
        "page.0.resql",
        "page.1.resql",
        "snapshot.resql",
        "snapshot.tmp.resql",
        "snapshot.tmp.recv.resql",
        "state.resql",
        "state.tmp.resql",
        PID_FILE,
    ] {
        let path = dir.join(name);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}

enum AnyListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

async fn bind(url: &Url) -> Result<AnyListener> {
    match url.scheme() {
        "unix" => {
            let path = url.path();
            let _ = std::fs::remove_file(path);
            Ok(AnyListener::Unix(UnixListener::bind(path)?))
        }
        "tcp" => {
            let host = url.host_str().unwrap_or("127.0.0.1");
            let port = url
                .port()
                .ok_or_else(|| ResqlError::Config(format!("missing port: {url}")))?;
            Ok(AnyListener::Tcp(TcpListener::bind((host, port)).await?))
        }
        other => Err(ResqlError::Config(format!("unsupported scheme: {other}"))),
    }
}

/// Starts a node and returns its handle.
pub async fn spawn(conf: Config) -> Result<ServerHandle> {
    conf.validate()?;

    let dir = PathBuf::from(&conf.node.directory);
    std::fs::create_dir_all(&dir)?;
    let pid = PidLock::acquire(&dir)?;

    let bind_url = Url::parse(&conf.node.bind_url)
        .map_err(|e| ResqlError::Config(format!("bind-url: {e}")))?;
    let listener = bind(&bind_url).await?;
    info!("listening on {}", conf.node.bind_url);

    let (tx, rx) = mpsc::unbounded_channel();

    let accept_tx = tx.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            let stream = match &listener {
                AnyListener::Tcp(l) => l.accept().await.map(|(s, _)| AnyStream::Tcp(s)),
                AnyListener::Unix(l) => l.accept().await.map(|(s, _)| AnyStream::Unix(s)),
            };

            match stream {
                Ok(s) => {
                    if accept_tx.send(Event::accepted(s)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!("accept: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    });

    let server = raft::Server::new(conf, tx.clone(), rx);
    let task = tokio::spawn(server.run());

    Ok(ServerHandle {
        events: tx,
        task,
        accept_task,
        _pid: pid,
    })
}

/// Runs a node until it stops (or a termination signal arrives).
pub async fn run(conf: Config) -> anyhow::Result<()> {
    let handle = spawn(conf).await.context("failed to start server")?;

    let stopper = handle.events.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal");
            let _ = stopper.send(Event::Shutdown);
        }
    });

    handle.join().await?;
    Ok(())
}
