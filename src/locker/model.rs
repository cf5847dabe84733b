// Lock cells, capabilities, inodes, dentries and per-request lock
// bookkeeping — `spec.md` §3 `[MODEL]`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::common::{ClientId, DirfragId, DnKey, Ino, NodeId, ReqId, Seq};

bitflags! {
    /// Capability bits a client may hold over one inode (`spec.md` §3).
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct CapBits: u8 {
        /// Client may read file contents.
        const FILE_RD = 0b0001;
        /// Client may write file contents.
        const FILE_WR = 0b0010;
        /// Client may cache reads locally.
        const FILE_RDCACHE = 0b0100;
        /// Client may buffer writes locally before flushing.
        const FILE_WRBUFFER = 0b1000;
    }
}

impl Serialize for CapBits {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        bitflags::serde::serialize(self, serializer)
    }
}

impl<'de> Deserialize<'de> for CapBits {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        bitflags::serde::deserialize(deserializer)
    }
}

/// Result of attempting a local operation against the lock state machines:
/// either the caller now holds what it asked for, or it has been parked on
/// a wait channel and must retry once woken (`spec.md` §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ready,
    Suspended,
    /// A replica must hand the request to the authority instead of
    /// suspending locally (`spec.md` §4.2 `hard_xlock_start`, replica
    /// case). Forwarding itself belongs to the request dispatcher.
    Forward(NodeId),
}

/// Named wait channels a request can be parked on (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitChannel {
    AuthPinnable,
    HardR,
    HardW,
    HardRwb,
    HardStable,
    HardNoRd,
    FileR,
    FileW,
    FileRwb,
    FileStable,
    FileNoRd,
    FileNoWr,
    Caps,
    DnPinnable,
    DnUnpinned,
    DnLock,
    DnRead,
    DnReqXlock,
}

/// The object a wait channel is registered against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaitObject {
    Inode(Ino),
    Dentry(DnKey),
}

/// An object a request has taken an auth pin on — a counted reservation
/// that blocks the authority from migrating the object mid-operation
/// (GLOSSARY "Auth-pin"). Migration itself is out of scope; we only model
/// the counter and the refusal predicate it gates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AuthPinTarget {
    Inode(Ino),
    Dentry(DnKey),
}

// ============================================================================
// Capabilities
// ============================================================================

/// Per-(inode, client) capability record (`spec.md` §3 "Capability").
#[derive(Debug, Clone, Default)]
pub struct Capability {
    pub wanted: CapBits,
    pub issued: CapBits,
    pub confirmed: CapBits,
    pub pending: CapBits,
    pub last_seq: Seq,
    pub suppress: bool,
}

impl Capability {
    pub fn new(wanted: CapBits) -> Self {
        Self {
            wanted,
            ..Default::default()
        }
    }

    /// Move `pending` to `new_pending`, bumping the sequence number iff
    /// something actually changed. Returns the new sequence, or `None` if
    /// no re-issue is needed (mirrors `Capability::issue` returning a
    /// non-positive sequence in the source when nothing changed).
    pub fn issue(&mut self, new_pending: CapBits) -> Option<Seq> {
        if new_pending == self.pending && self.issued.contains(new_pending) {
            return None;
        }
        self.last_seq += 1;
        self.pending = new_pending;
        self.issued |= new_pending;
        Some(self.last_seq)
    }

    /// Client confirmation of a prior issue: `seq` is the sequence the
    /// client is acking, `caps` is what it actually holds now. Returns the
    /// union of bits that were confirmed-or-pending before this call (the
    /// `had` set `handle_client_file_caps` needs for its mtime/size merge
    /// decision, `spec.md` §4.4).
    pub fn confirm_receipt(&mut self, seq: Seq, caps: CapBits) -> CapBits {
        let had = self.confirmed | self.pending;
        if seq >= self.last_seq {
            self.confirmed = caps;
            // Bits neither confirmed nor still pending are no longer
            // outstanding.
            self.issued &= caps | self.pending;
        }
        had
    }

    pub fn is_null(&self) -> bool {
        self.wanted.is_empty() && self.issued.is_empty() && self.pending.is_empty()
    }
}

// ============================================================================
// HARD lock cell
// ============================================================================

/// HARD inode lock state (`spec.md` §4.2). Only `{Sync, Lock}` are stable;
/// `GLockR` is the sole transient state, carrying the replica gather set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HardLockState {
    #[default]
    Sync,
    Lock,
    GLockR(HashSet<NodeId>),
}

impl HardLockState {
    pub fn is_stable(&self) -> bool {
        matches!(self, HardLockState::Sync | HardLockState::Lock)
    }

    pub fn gather_set(&self) -> Option<&HashSet<NodeId>> {
        match self {
            HardLockState::GLockR(g) => Some(g),
            _ => None,
        }
    }

    pub fn gather_set_mut(&mut self) -> Option<&mut HashSet<NodeId>> {
        match self {
            HardLockState::GLockR(g) => Some(g),
            _ => None,
        }
    }
}

/// Reader/writer bookkeeping shared by the HARD and FILE axes
/// (`spec.md` §3: `nread`, `writer`, `write_wanted`).
#[derive(Debug, Clone, Default)]
pub struct LockCounters {
    pub nread: u32,
    pub writer: Option<ReqId>,
    pub write_wanted: bool,
}

impl LockCounters {
    pub fn can_write(&self, req: ReqId) -> bool {
        self.nread == 0 && (self.writer.is_none() || self.writer == Some(req))
    }
}

#[derive(Debug, Clone, Default)]
pub struct HardLock {
    pub state_: Option<HardLockState>,
    pub counters: LockCounters,
}

impl HardLock {
    pub fn state(&self) -> &HardLockState {
        self.state_.as_ref().unwrap()
    }

    pub fn state_mut(&mut self) -> &mut HardLockState {
        self.state_.as_mut().unwrap()
    }

    /// `spec.md` §4.2 `cell.can_read(is_auth)`: the authority can always
    /// read locally ("an auth can lock→sync any time it wants"); a replica
    /// may only read while the cell is `SYNC` — `LOCK` blocks replica reads
    /// entirely.
    pub fn can_read(&self, is_auth: bool) -> bool {
        is_auth || matches!(self.state(), HardLockState::Sync)
    }
}

// ============================================================================
// FILE lock cell
// ============================================================================

/// FILE inode lock state (`spec.md` §4.3). `Loner` is authority-only — a
/// replica observing the same cell always sees `Lock` (§4.3 "The `LONER`
/// state is known only to the authority"). Each gathering variant names the
/// destination and the population being drained, per the commit table in
/// `spec.md` §4.3, and carries the live replica gather set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FileLockState {
    #[default]
    Sync,
    Mixed,
    Lock,
    Loner,
    GLockR(HashSet<NodeId>),
    GLockM(HashSet<NodeId>),
    GLockL(HashSet<NodeId>),
    GMixedR(HashSet<NodeId>),
    GMixedL(HashSet<NodeId>),
    GLonerR(HashSet<NodeId>),
    GLonerM(HashSet<NodeId>),
    GSyncL(HashSet<NodeId>),
    GSyncM(HashSet<NodeId>),
}

impl FileLockState {
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            FileLockState::Sync | FileLockState::Mixed | FileLockState::Lock | FileLockState::Loner
        )
    }

    pub fn gather_set(&self) -> Option<&HashSet<NodeId>> {
        match self {
            FileLockState::GLockR(g)
            | FileLockState::GLockM(g)
            | FileLockState::GLockL(g)
            | FileLockState::GMixedR(g)
            | FileLockState::GMixedL(g)
            | FileLockState::GLonerR(g)
            | FileLockState::GLonerM(g)
            | FileLockState::GSyncL(g)
            | FileLockState::GSyncM(g) => Some(g),
            _ => None,
        }
    }

    pub fn gather_set_mut(&mut self) -> Option<&mut HashSet<NodeId>> {
        match self {
            FileLockState::GLockR(g)
            | FileLockState::GLockM(g)
            | FileLockState::GLockL(g)
            | FileLockState::GMixedR(g)
            | FileLockState::GMixedL(g)
            | FileLockState::GLonerR(g)
            | FileLockState::GLonerM(g)
            | FileLockState::GSyncL(g)
            | FileLockState::GSyncM(g) => Some(g),
            _ => None,
        }
    }

    /// Destination stable state a gathering variant commits to, per the
    /// table in `spec.md` §4.3. `None` for a state that is already stable.
    pub fn destination(&self) -> Option<FileLockState> {
        match self {
            FileLockState::GLockR(_) | FileLockState::GLockM(_) | FileLockState::GLockL(_) => {
                Some(FileLockState::Lock)
            }
            FileLockState::GMixedR(_) | FileLockState::GMixedL(_) => Some(FileLockState::Mixed),
            FileLockState::GLonerR(_) | FileLockState::GLonerM(_) => Some(FileLockState::Loner),
            FileLockState::GSyncL(_) | FileLockState::GSyncM(_) => Some(FileLockState::Sync),
            _ => None,
        }
    }

    /// Commit condition from the table in `spec.md` §4.3: bits that must be
    /// absent from the issued footprint across all clients before the
    /// gather may complete.
    pub fn commit_blocking_bits(&self) -> CapBits {
        match self {
            FileLockState::GLockR(_) | FileLockState::GLockM(_) | FileLockState::GLockL(_) => {
                CapBits::all()
            }
            FileLockState::GMixedR(_) => !(CapBits::FILE_RD | CapBits::FILE_RDCACHE),
            FileLockState::GMixedL(_) => !(CapBits::FILE_WR | CapBits::FILE_WRBUFFER),
            FileLockState::GLonerR(_) => CapBits::all(),
            FileLockState::GLonerM(_) => !(CapBits::FILE_WR | CapBits::FILE_WRBUFFER),
            FileLockState::GSyncL(_) | FileLockState::GSyncM(_) => {
                !(CapBits::FILE_RD | CapBits::FILE_RDCACHE)
            }
            _ => CapBits::empty(),
        }
    }

    /// Caps a client may be granted while the cell is in this state
    /// (`spec.md` I2). While gathering, the bound is the tighter of the
    /// current state's and the destination's, since the cell is actively
    /// recalling toward the destination.
    pub fn caps_allowed(&self, is_auth: bool) -> CapBits {
        match self {
            FileLockState::Sync => CapBits::FILE_RD | CapBits::FILE_RDCACHE,
            FileLockState::Mixed => CapBits::FILE_RD | CapBits::FILE_WR,
            FileLockState::Lock => CapBits::empty(),
            FileLockState::Loner => {
                if is_auth {
                    CapBits::all()
                } else {
                    CapBits::empty()
                }
            }
            gathering => gathering
                .destination()
                .map(|d| d.caps_allowed(is_auth))
                .unwrap_or(CapBits::empty())
                & !gathering.commit_blocking_bits(),
        }
    }

    /// The permanent upper bound on what a client's `wanted` may ever grow
    /// to, independent of the current state (`spec.md` §4.3).
    pub fn caps_allowed_ever(is_auth: bool) -> CapBits {
        if is_auth {
            CapBits::all()
        } else {
            CapBits::FILE_RD | CapBits::FILE_RDCACHE
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileLock {
    pub state_: Option<FileLockState>,
    pub counters: LockCounters,
}

impl FileLock {
    pub fn state(&self) -> &FileLockState {
        self.state_.as_ref().unwrap()
    }

    pub fn state_mut(&mut self) -> &mut FileLockState {
        self.state_.as_mut().unwrap()
    }

    /// `spec.md` §4.2/§4.3 `cell.can_read(is_auth)` on the FILE axis: the
    /// authority always reads locally; a replica may only read while the
    /// state's `caps_allowed(false)` actually grants `FILE_RD` (e.g. `SYNC`,
    /// not `LOCK` or `LONER`, which a replica never even observes as such).
    pub fn can_read(&self, is_auth: bool) -> bool {
        is_auth || self.state().caps_allowed(false).contains(CapBits::FILE_RD)
    }
}

// ============================================================================
// Inode
// ============================================================================

/// Hard-metadata payload (uid/gid/mode) carried on `AC_SYNC` for `IHARD`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardPayload {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// File-metadata payload (mtime/atime/size) carried on `AC_SYNC`/`AC_MIXED`
/// for `IFILE`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilePayload {
    pub mtime: u64,
    pub atime: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct Inode {
    pub ino: Ino,
    pub authority: NodeId,
    pub replicas: HashSet<NodeId>,

    pub hard: HardLock,
    pub file: FileLock,

    pub client_caps: HashMap<ClientId, Capability>,
    pub mds_caps_wanted: HashMap<NodeId, CapBits>,
    pub replica_caps_wanted: CapBits,
    pub replica_caps_wanted_keep_until: Option<Instant>,

    pub file_data_version: u64,

    pub hard_payload: HardPayload,
    pub file_payload: FilePayload,

    pub auth_pins: u32,
    /// Simulates the authority refusing new auth pins (e.g. mid-migration
    /// freeze). Migration itself is out of scope; this flag lets callers
    /// exercise `WAIT_AUTHPINNABLE` suspension.
    pub frozen: bool,
}

impl Inode {
    pub fn new(ino: Ino, authority: NodeId) -> Self {
        Self {
            ino,
            authority,
            replicas: HashSet::new(),
            hard: HardLock {
                state_: Some(HardLockState::Sync),
                counters: LockCounters::default(),
            },
            file: FileLock {
                state_: Some(FileLockState::Sync),
                counters: LockCounters::default(),
            },
            client_caps: HashMap::new(),
            mds_caps_wanted: HashMap::new(),
            replica_caps_wanted: CapBits::empty(),
            replica_caps_wanted_keep_until: None,
            file_data_version: 0,
            hard_payload: HardPayload::default(),
            file_payload: FilePayload::default(),
            auth_pins: 0,
            frozen: false,
        }
    }

    pub fn is_auth(&self, local: NodeId) -> bool {
        self.authority == local
    }

    pub fn is_replicated(&self) -> bool {
        !self.replicas.is_empty()
    }

    pub fn can_auth_pin(&self) -> bool {
        !self.frozen
    }

    /// `Locker::issue_file_data_version` — exposed because callers outside
    /// the Locker stamp outgoing read replies with it.
    pub fn file_data_version(&self) -> u64 {
        self.file_data_version
    }

    /// Aggregate desired bits across every client cap on this inode
    /// (`in->get_caps_wanted()` in the source).
    pub fn caps_wanted(&self) -> CapBits {
        self.client_caps
            .values()
            .fold(CapBits::empty(), |acc, c| acc | c.wanted)
    }

    /// Whether exactly one client wants write-ish bits and no peer MDS
    /// wants anything: the precondition for entering `Loner`.
    pub fn is_loner_candidate(&self) -> bool {
        let writers: Vec<_> = self
            .client_caps
            .iter()
            .filter(|(_, c)| c.wanted.intersects(CapBits::FILE_WR | CapBits::FILE_WRBUFFER))
            .map(|(id, _)| *id)
            .collect();
        writers.len() == 1 && self.mds_caps_wanted.is_empty()
    }
}

// ============================================================================
// Dentry
// ============================================================================

/// Who currently holds a dentry's xlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XlockHolder {
    None,
    Local(ReqId),
    /// Remote-xlock (`REQXLOCK`) in flight against a foreign authority —
    /// schema carried forward per `spec.md` §4.5/§9, full handling out of
    /// scope.
    Foreign,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnLockState {
    Sync,
    Prexlock(BTreeSet<NodeId>),
    Xlock,
    Unpinning,
}

impl DnLockState {
    pub fn is_stable(&self) -> bool {
        matches!(self, DnLockState::Sync | DnLockState::Xlock | DnLockState::Unpinning)
    }
}

#[derive(Debug, Clone)]
pub struct Dentry {
    pub key: DnKey,
    pub authority: NodeId,
    pub replicas: HashSet<NodeId>,
    pub state: DnLockState,
    pub xlockedby: XlockHolder,
    pub pins: HashMap<ReqId, u32>,
    /// Whether the dentry currently resolves to something (false after an
    /// unlink, before any subsequent create).
    pub exists: bool,
    pub frozen: bool,
    /// Auth-pin count, tracked separately from `pins`: an auth pin marks
    /// the dentry busy for migration/freeze purposes but is not a reader
    /// pin, so it must not feed `is_pinned()`.
    pub auth_pins: u32,
}

impl Dentry {
    pub fn new(key: DnKey, authority: NodeId) -> Self {
        Self {
            key,
            authority,
            replicas: HashSet::new(),
            state: DnLockState::Sync,
            xlockedby: XlockHolder::None,
            pins: HashMap::new(),
            exists: true,
            frozen: false,
            auth_pins: 0,
        }
    }

    pub fn is_auth(&self, local: NodeId) -> bool {
        self.authority == local
    }

    pub fn is_replicated(&self) -> bool {
        !self.replicas.is_empty()
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.values().any(|&c| c > 0)
    }

    pub fn is_xlockedby(&self, req: ReqId) -> bool {
        self.xlockedby == XlockHolder::Local(req)
    }

    pub fn can_auth_pin(&self) -> bool {
        !self.frozen
    }
}

// ============================================================================
// MdRequest
// ============================================================================

/// The subset of a metadata request's state the Locker reads and mutates:
/// the locks and auth pins it currently holds (`spec.md` §3 "MDRequest").
/// Ownership of the full request record (path traversal, retry policy,
/// completion) belongs to the external request dispatcher — out of scope.
#[derive(Debug, Clone, Default)]
pub struct MdRequest {
    pub id: ReqId,
    pub dentry_rdlocks: BTreeSet<DnKey>,
    pub dentry_xlocks: BTreeSet<DnKey>,
    pub inode_hard_rdlocks: BTreeSet<Ino>,
    pub inode_hard_xlocks: BTreeSet<Ino>,
    pub inode_file_rdlocks: BTreeSet<Ino>,
    pub inode_file_xlocks: BTreeSet<Ino>,
    pub auth_pins: BTreeSet<AuthPinTarget>,
}

impl MdRequest {
    pub fn new(id: ReqId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn dentry_locks(&self) -> BTreeSet<DnKey> {
        self.dentry_rdlocks
            .union(&self.dentry_xlocks)
            .cloned()
            .collect()
    }

    pub fn inode_hard_locks(&self) -> BTreeSet<Ino> {
        self.inode_hard_rdlocks
            .union(&self.inode_hard_xlocks)
            .cloned()
            .collect()
    }

    pub fn is_auth_pinned(&self, target: &AuthPinTarget) -> bool {
        self.auth_pins.contains(target)
    }
}

/// A dentry or inode identity, used to describe a lock request to the
/// acquisition engine without borrowing the cache.
pub type DirfragRef = DirfragId;
