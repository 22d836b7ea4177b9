// src/connection/mod.rs

//! Socket plumbing for the consensus core.
//!
//! Each accepted or dialed socket gets one task that owns the framed stream:
//! inbound messages are forwarded to the consensus task's event channel in
//! arrival order, outbound messages drain from an unbounded per-connection
//! queue. Dropping the [`ConnHandle`] aborts the task and closes the socket.

use crate::core::protocol::{Msg, MsgCodec};
use crate::server::AnyStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

pub type ConnId = u64;

/// Everything that wakes the consensus task.
#[derive(Debug)]
pub enum Event {
    /// A fresh inbound socket from the listener.
    Accepted {
        stream: AnyStream,
        local: String,
        remote: String,
    },
    /// A complete message arrived on connection `cid`.
    Msg { cid: ConnId, msg: Msg },
    /// Connection `cid` hit EOF or an error and is gone.
    Closed { cid: ConnId },
    /// An outgoing dial to a peer finished.
    NodeConnected {
        name: String,
        stream: AnyStream,
        local: String,
        remote: String,
    },
    NodeConnectFailed { name: String },
    /// External stop request (signal handler or embedding test).
    Shutdown,
}

impl Event {
    pub fn accepted(stream: AnyStream) -> Event {
        let (local, remote) = stream.addrs();
        Event::Accepted {
            stream,
            local,
            remote,
        }
    }
}

/// Writer half of a connection owned by the consensus task. Sends are
/// fire-and-forget; delivery failure surfaces as an `Event::Closed`.
/// Dropping the handle closes the socket once queued messages have drained,
/// so a final refusal still reaches the peer.
#[derive(Debug)]
pub struct ConnHandle {
    pub id: ConnId,
    pub local: String,
    pub remote: String,
    tx: mpsc::UnboundedSender<Msg>,
}

impl ConnHandle {
    pub fn send(&self, msg: Msg) {
        let _ = self.tx.send(msg);
    }
}

/// Spawns the io task for a socket and returns its handle.
pub fn spawn(
    id: ConnId,
    stream: AnyStream,
    local: String,
    remote: String,
    events: mpsc::UnboundedSender<Event>,
) -> ConnHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();

    tokio::spawn(async move {
        let mut framed = Framed::new(stream, MsgCodec);

        loop {
            tokio::select! {
                out = rx.recv() => match out {
                    Some(msg) => {
                        if framed.send(msg).await.is_err() {
                            break;
                        }
                    }
                    // Handle dropped: queued messages have drained, close.
                    None => return,
                },
                inbound = framed.next() => match inbound {
                    Some(Ok(msg)) => {
                        if events.send(Event::Msg { cid: id, msg }).is_err() {
                            return;
                        }
                    }
                    _ => break,
                },
            }
        }

        let _ = events.send(Event::Closed { cid: id });
    });

    ConnHandle {
        id,
        local,
        remote,
        tx,
    }
}
