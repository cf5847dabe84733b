// The client session registry (`ClientMap`) external collaborator
// contract.
//
// Tracks how many opens each client holds against each inode, so
// `handle_client_file_caps` can drop the capability record and notify the
// registry when the count reaches zero (`spec.md` §4.4). Session
// establishment/teardown itself is out of scope.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{ClientId, Ino};

/// The subset of `ClientMap` the Locker depends on.
pub trait ClientRegistry: Send + Sync {
    fn increment_open_count(&self, client: ClientId, ino: Ino);
    fn decrement_open_count(&self, client: ClientId, ino: Ino);
}

#[derive(Clone, Default)]
pub struct InMemoryClientRegistry {
    open_counts: Arc<Mutex<HashMap<(ClientId, Ino), u32>>>,
}

impl InMemoryClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_count(&self, client: ClientId, ino: Ino) -> u32 {
        self.open_counts
            .lock()
            .get(&(client, ino))
            .copied()
            .unwrap_or(0)
    }
}

impl ClientRegistry for InMemoryClientRegistry {
    fn increment_open_count(&self, client: ClientId, ino: Ino) {
        *self.open_counts.lock().entry((client, ino)).or_insert(0) += 1;
    }

    fn decrement_open_count(&self, client: ClientId, ino: Ino) {
        let mut counts = self.open_counts.lock();
        if let Some(count) = counts.get_mut(&(client, ino)) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&(client, ino));
            }
        }
    }
}
