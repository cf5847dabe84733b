// # Common Types
//
// Shared identifiers used across the Locker and its reference collaborators
// (cache, transport, journal, client registry).

use serde::{Deserialize, Serialize};

/// Identifier of an MDS node in the cluster.
pub type NodeId = u32;

/// Identifier of a connected client.
pub type ClientId = u64;

/// Identifier of an inode (the namespace object an `IHARD`/`IFILE` lock axis
/// attaches to).
pub type Ino = u64;

/// Identifier of a directory fragment (the addressable unit a dentry lives
/// under, see `spec.md` GLOSSARY "Dirfrag").
pub type DirfragId = u64;

/// Identifier of one in-flight metadata request, scoped to the local MDS.
pub type ReqId = u64;

/// A sequence number as used for capability issue/confirm rounds.
pub type Seq = u64;

/// Identity of a dentry: the directory fragment it lives in plus its name.
/// Carries the canonical total order used by the acquisition engine
/// (`spec.md` §4.1): `(dir_fragment_id, name)` lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DnKey {
    pub dirfrag: DirfragId,
    pub name: String,
}

impl DnKey {
    pub fn new(dirfrag: DirfragId, name: impl Into<String>) -> Self {
        Self {
            dirfrag,
            name: name.into(),
        }
    }
}

/// The inode state snapshot stamped onto every `MClientFileCaps` grant, so
/// the client can update its local view without a round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapSnapshot {
    pub mtime: u64,
    pub atime: u64,
    pub size: u64,
    pub file_data_version: u64,
}
