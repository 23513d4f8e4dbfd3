//! Tunnel sessions.
//!
//! A [`Session`] is the core's handle on one persistent connection to one
//! node. The transport owns the socket: it drains [`Outbound`] into the wire
//! and feeds inbound frames to the relay or node reader. Sending never
//! suspends; frames queue on a bounded per-session channel, which also keeps
//! concurrent senders from interleaving.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Stable identifier of an edge node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Node ids end up in headers and log lines, so they are restricted to
    /// printable ASCII without whitespace.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > 128 || !raw.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(Error::NoRoute(format!("invalid node id {:?}", raw)));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle on one live tunnel connection. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    node: NodeId,
    peer: Option<SocketAddr>,
    tx: mpsc::Sender<Vec<u8>>,
    closed: CancellationToken,
}

/// Frames waiting to be written to the wire.
pub struct Outbound {
    rx: mpsc::Receiver<Vec<u8>>,
    closed: CancellationToken,
}

impl Session {
    pub fn open(node: NodeId, peer: Option<SocketAddr>, queue_depth: usize) -> (Session, Outbound) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let closed = CancellationToken::new();
        let session = Session {
            inner: Arc::new(SessionInner {
                id: SessionId::next(),
                node,
                peer,
                tx,
                closed: closed.clone(),
            }),
        };
        (session, Outbound { rx, closed })
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn node(&self) -> &NodeId {
        &self.inner.node
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Queue a frame for the wire.
    pub fn send(&self, frame: Vec<u8>) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::TransportFailure(format!("session {} is closed", self.id())));
        }
        self.inner.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => {
                Error::TransportFailure(format!("session {} send queue is full", self.id()))
            }
            TrySendError::Closed(_) => {
                Error::TransportFailure(format!("session {} writer is gone", self.id()))
            }
        })
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.closed.is_cancelled() && !self.inner.tx.is_closed()
    }

    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Resolves once the session has been closed from either side.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("node", &self.inner.node)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Outbound {
    /// Next frame to write, or `None` once the session is closed.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            frame = self.rx.recv() => frame,
        }
    }
}

impl Drop for Outbound {
    fn drop(&mut self) {
        // The writer is gone; nothing queued from now on can reach the wire.
        self.closed.cancel();
    }
}
