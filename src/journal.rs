// The journal (`MDLog`) external collaborator contract.
//
// Persists metadata changes; the Locker submits entries but never awaits
// them (`spec.md` §5: "Journaling (`submit_entry`) is asynchronous with
// respect to the lock state machines"). On-disk format is out of scope.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::Ino;

/// A dirty-metadata entry submitted by `handle_client_file_caps` when a
/// client's confirmed `mtime`/`size` advances the inode's recorded values
/// (`spec.md` §4.4).
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyMetadataEntry {
    pub ino: Ino,
    pub mtime: u64,
    pub size: u64,
}

/// The subset of `MDLog` the Locker depends on.
pub trait Journal: Send + Sync {
    fn submit_dirty_metadata(&self, entry: DirtyMetadataEntry);
}

/// Reference `Journal`: appends to an in-memory log instead of writing to
/// disk.
#[derive(Clone, Default)]
pub struct InMemoryJournal {
    entries: Arc<Mutex<Vec<DirtyMetadataEntry>>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DirtyMetadataEntry> {
        self.entries.lock().clone()
    }
}

impl Journal for InMemoryJournal {
    fn submit_dirty_metadata(&self, entry: DirtyMetadataEntry) {
        tracing::debug!(ino = entry.ino, mtime = entry.mtime, size = entry.size, "submit dirty metadata");
        self.entries.lock().push(entry);
    }
}
