// Inter-MDS wire messages and the object-kind/action legality matrix
// (`spec.md` §6 `[WIRE]`).

use serde::{Deserialize, Serialize};

use crate::common::{CapSnapshot, ClientId, DirfragId, Ino, NodeId, ReqId, Seq};
use crate::locker::{CapBits, FilePayload, HardPayload};

/// The kind of object an `MLock` message addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OType {
    IHard,
    IFile,
    Dir,
    Dn,
}

/// `MLock` actions (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Sync,
    Mixed,
    Lock,
    LockAck,
    LockNak,
    MixedAck,
    SyncAck,
    ReqXlock,
    ReqXlockC,
    ReqXlockAck,
    ReqXlockNak,
    UnXlock,
}

impl Action {
    /// Travels replica→auth: the ACKs, NAKs and the `REQ*` family
    /// (`spec.md` §6 "FOR_AUTH").
    pub fn for_auth(self) -> bool {
        matches!(
            self,
            Action::LockAck
                | Action::LockNak
                | Action::MixedAck
                | Action::SyncAck
                | Action::ReqXlock
                | Action::ReqXlockC
                | Action::ReqXlockAck
                | Action::ReqXlockNak
        )
    }

    /// Whether `(self, otype)` is a combination the protocol actually uses
    /// (`spec.md` §6 legality matrix).
    pub fn legal_for(self, otype: OType) -> bool {
        match self {
            Action::Sync | Action::Lock => true,
            Action::Mixed | Action::MixedAck | Action::SyncAck => otype == OType::IFile,
            Action::LockAck | Action::LockNak => {
                matches!(otype, OType::IHard | OType::IFile | OType::Dn)
            }
            Action::ReqXlock | Action::ReqXlockC | Action::ReqXlockAck | Action::ReqXlockNak => {
                otype == OType::Dn
            }
            Action::UnXlock => otype == OType::Dn,
        }
    }
}

/// Identifies the specific object an `MLock` addresses: an inode by number,
/// or a dentry by dirfrag+name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockTarget {
    Ino(Ino),
    Dentry { dirfrag: DirfragId, name: String },
}

/// `AC_SYNC`/`AC_MIXED` payload. `spec.md` §6: "`AC_SYNC` on `IHARD`/`IFILE`
/// carries the encoded hard/file state"; `AC_LOCK` on `DN` carries the full
/// path instead, so that field is separate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LockPayload {
    None,
    Hard(HardPayload),
    File(FilePayload),
}

/// Point-to-point inter-MDS lock message (`spec.md` §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MLock {
    pub asker: NodeId,
    pub otype: OType,
    pub action: Action,
    pub target: LockTarget,
    pub data: LockPayload,
    /// Full path to the dentry, carried on `AC_LOCK`/`DN` so a replica that
    /// does not yet cache the dentry can discover it.
    pub path: Option<String>,
}

/// Replica→authority aggregate desired capability bits for one inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MInodeFileCaps {
    pub ino: Ino,
    pub from: NodeId,
    pub caps: CapBits,
}

/// `spec.md` §6: `MClientFileCaps{inode_snapshot, seq, caps, wanted, op}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapOp {
    Grant,
    Release,
}

/// Auth→client capability grant/recall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MClientFileCaps {
    pub ino: Ino,
    pub client: ClientId,
    pub inode_snapshot: CapSnapshot,
    pub seq: Seq,
    pub caps: CapBits,
    pub wanted: CapBits,
    pub op: CapOp,
}

/// Context threaded through handlers that need to know which request
/// triggered them, for associating a completed dentry xlock with its
/// requester (`spec.md` §4.5 `AC_LOCKACK`/`AC_LOCKNAK` at authority).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub req: ReqId,
}
