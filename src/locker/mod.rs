// # Locker
//
// The distributed metadata locking subsystem. Coordinates concurrent access
// by many clients and many peer MDS nodes to a shared, replicated namespace,
// and issues revocable client capabilities that let clients cache reads and
// buffer writes locally.
//
// ## Module Organization
//
// - `model`: lock cells, capabilities, inodes, dentries, per-request lock
//   bookkeeping (`spec.md` §3, `[MODEL]`).
// - `acquire`: deadlock-free multi-lock acquisition engine (`[ACQUIRE]`).
// - `hard`: HARD inode lock state machine (`[HARD]`).
// - `file`: FILE inode lock state machine and capability transitions
//   (`[FILE]`).
// - `cap`: client capability issue/confirm/revoke layer (`[CAP]`).
// - `dn`: dentry lock state machine (`[DN]`).
// - `wire`: inter-MDS message types and the object-kind/action legality
//   matrix (`[WIRE]`).
// - `dispatch`: inbound message classification (`[DISPATCH]`).

pub mod acquire;
pub mod cap;
pub mod dispatch;
pub mod dn;
pub mod file;
pub mod hard;
pub mod model;
pub mod wire;

pub use model::*;

use std::sync::Arc;

use crate::cache::Cache;
use crate::client::ClientRegistry;
use crate::config::LockerConfig;
use crate::journal::Journal;
use crate::transport::Transport;

/// One MDS node's Locker: the entry point every operation in this module
/// hangs off of. Holds handles to its external collaborators but no state
/// of its own — all mutable state lives in the `Cache`.
#[derive(Clone)]
pub struct Locker {
    pub config: LockerConfig,
    pub cache: Arc<dyn Cache>,
    pub transport: Arc<dyn Transport>,
    pub journal: Arc<dyn Journal>,
    pub clients: Arc<dyn ClientRegistry>,
}

impl Locker {
    pub fn new(
        config: LockerConfig,
        cache: Arc<dyn Cache>,
        transport: Arc<dyn Transport>,
        journal: Arc<dyn Journal>,
        clients: Arc<dyn ClientRegistry>,
    ) -> Self {
        Self {
            config,
            cache,
            transport,
            journal,
            clients,
        }
    }

    pub fn local_node(&self) -> crate::common::NodeId {
        self.config.node_id
    }
}

/// Shared test scaffolding: a `Locker` wired to the in-memory reference
/// collaborators, used by every module's unit tests below.
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::cache::InMemoryCache;
    use crate::client::InMemoryClientRegistry;
    use crate::common::NodeId;
    use crate::config::LockerConfig;
    use crate::journal::InMemoryJournal;
    use crate::transport::InMemoryTransport;
    use crate::locker::Locker;

    pub fn test_locker(node_id: NodeId) -> Locker {
        Locker::new(
            LockerConfig {
                node_id,
                ..LockerConfig::default()
            },
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryTransport::new()),
            Arc::new(InMemoryJournal::new()),
            Arc::new(InMemoryClientRegistry::new()),
        )
    }
}
