// The cluster transport (`Messenger`) external collaborator contract.
//
// Delivers addressed messages reliably but asynchronously between MDS
// nodes, and to clients (`spec.md` §1). The Locker never awaits a reply
// inline — every `send_*` call is fire-and-forget, matching `spec.md` §5
// ("the Locker does not await the journal" applies equally to the
// messenger: there is no synchronous round trip anywhere in this crate).

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::common::{ClientId, NodeId};
use crate::locker::wire::{MClientFileCaps, MInodeFileCaps, MLock};

/// The subset of `Messenger` the Locker depends on.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_lock(&self, to: NodeId, msg: MLock);
    async fn send_inode_file_caps(&self, to: NodeId, msg: MInodeFileCaps);
    async fn send_client_file_caps(&self, to: ClientId, msg: MClientFileCaps);
}

/// One outbound message, as recorded by `InMemoryTransport` for inspection
/// by tests and the multi-node demo harness.
#[derive(Debug, Clone)]
pub enum Envelope {
    Lock { to: NodeId, msg: MLock },
    InodeFileCaps { to: NodeId, msg: MInodeFileCaps },
    ClientFileCaps { to: ClientId, msg: MClientFileCaps },
}

/// Reference `Transport`: queues every send in an outbox instead of putting
/// bytes on a socket. Tests and the demo binary drain the outbox and feed
/// messages into the destination node's `dispatch` entry point themselves,
/// which is how this crate simulates "asynchronous, in-order delivery"
/// without an actual network.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    outbox: Arc<Mutex<VecDeque<Envelope>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every message sent since the last drain, in send
    /// order (per-source-destination FIFO, per `spec.md` §5's ordering
    /// guarantee).
    pub fn drain(&self) -> Vec<Envelope> {
        self.outbox.lock().drain(..).collect()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send_lock(&self, to: NodeId, msg: MLock) {
        tracing::debug!(?to, action = ?msg.action, otype = ?msg.otype, "send MLock");
        self.outbox.lock().push_back(Envelope::Lock { to, msg });
    }

    async fn send_inode_file_caps(&self, to: NodeId, msg: MInodeFileCaps) {
        tracing::debug!(?to, ino = msg.ino, "send MInodeFileCaps");
        self.outbox.lock().push_back(Envelope::InodeFileCaps { to, msg });
    }

    async fn send_client_file_caps(&self, to: ClientId, msg: MClientFileCaps) {
        tracing::debug!(client = to, ino = msg.ino, op = ?msg.op, "send MClientFileCaps");
        self.outbox.lock().push_back(Envelope::ClientFileCaps { to, msg });
    }
}
