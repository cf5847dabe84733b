// The metadata cache (`MDCache`) external collaborator contract.
//
// Owns the inode/dentry objects the Locker's state machines mutate, the
// waiter multi-map those machines suspend requests on, and auth-pin
// bookkeeping. Path traversal, replica discovery, and request lifecycle are
// out of scope here (`spec.md` §1) — this is the narrowest surface the
// Locker needs, plus an in-memory reference implementation for tests and the
// demo binary.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{DnKey, Ino};
use crate::locker::{AuthPinTarget, Dentry, Inode, WaitChannel, WaitObject};

/// A suspended request's continuation. Captures only what it needs to
/// re-drive acquisition from the top (`spec.md` §9: "store only closures
/// whose captured data is by value").
pub type Waiter = Box<dyn FnOnce() + Send>;

/// A retry callback the acquisition engine can invoke more than once across
/// a single call (one per suspension point it might hit), shared cheaply
/// via `Arc` rather than boxed per use.
pub type RetryFn = Arc<dyn Fn() + Send + Sync>;

/// The subset of `MDCache` the Locker depends on. Kept dyn-compatible (the
/// Locker holds this behind `Arc<dyn Cache>`) by taking `&mut dyn FnMut`
/// rather than a generic closure; `CacheExt` below restores the ergonomic
/// generic-closure call site every handler actually uses.
pub trait Cache: Send + Sync {
    fn inode(&self, ino: Ino) -> Option<Inode>;
    fn with_inode_mut_dyn(&self, ino: Ino, f: &mut dyn FnMut(&mut Inode));
    fn insert_inode(&self, inode: Inode);

    fn dentry(&self, key: &DnKey) -> Option<Dentry>;
    fn with_dentry_mut_dyn(&self, key: &DnKey, f: &mut dyn FnMut(&mut Dentry));
    fn insert_dentry(&self, dentry: Dentry);
    fn remove_dentry(&self, key: &DnKey);

    /// Register a waiter against `(object, channel)`. Fired in FIFO order
    /// by `fire_waiters`.
    fn add_waiter(&self, object: WaitObject, channel: WaitChannel, waiter: Waiter);

    /// Drain and invoke every waiter registered on `(object, channel)`.
    fn fire_waiters(&self, object: WaitObject, channel: WaitChannel);

    fn can_auth_pin(&self, target: &AuthPinTarget) -> bool;
    fn auth_pin(&self, target: &AuthPinTarget);
    fn auth_unpin(&self, target: &AuthPinTarget);
}

/// Generic-closure convenience wrappers over the dyn-safe `Cache` trait.
pub trait CacheExt: Cache {
    fn with_inode_mut<R>(&self, ino: Ino, f: impl FnOnce(&mut Inode) -> R) -> Option<R> {
        let mut f = Some(f);
        let mut result = None;
        self.with_inode_mut_dyn(ino, &mut |inode| {
            if let Some(f) = f.take() {
                result = Some(f(inode));
            }
        });
        result
    }

    fn with_dentry_mut<R>(&self, key: &DnKey, f: impl FnOnce(&mut Dentry) -> R) -> Option<R> {
        let mut f = Some(f);
        let mut result = None;
        self.with_dentry_mut_dyn(key, &mut |dentry| {
            if let Some(f) = f.take() {
                result = Some(f(dentry));
            }
        });
        result
    }
}

impl<T: Cache + ?Sized> CacheExt for T {}

#[derive(Default)]
struct Waiters {
    queues: HashMap<(WaitObject, WaitChannel), Vec<Waiter>>,
}

/// Reference in-process implementation backing tests and the demo binary.
/// Holds every inode/dentry in plain maps behind a single mutex — matches
/// the single-event-loop-thread model of `spec.md` §5; there is no need for
/// finer-grained locking since the Locker never mutates the cache from more
/// than one place concurrently.
#[derive(Clone)]
pub struct InMemoryCache {
    inner: Arc<Mutex<InMemoryCacheState>>,
}

struct InMemoryCacheState {
    inodes: HashMap<Ino, Inode>,
    dentries: HashMap<DnKey, Dentry>,
    waiters: Waiters,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(InMemoryCacheState {
                inodes: HashMap::new(),
                dentries: HashMap::new(),
                waiters: Waiters::default(),
            })),
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for InMemoryCache {
    fn inode(&self, ino: Ino) -> Option<Inode> {
        self.inner.lock().inodes.get(&ino).cloned()
    }

    fn with_inode_mut_dyn(&self, ino: Ino, f: &mut dyn FnMut(&mut Inode)) {
        if let Some(inode) = self.inner.lock().inodes.get_mut(&ino) {
            f(inode);
        }
    }

    fn insert_inode(&self, inode: Inode) {
        self.inner.lock().inodes.insert(inode.ino, inode);
    }

    fn dentry(&self, key: &DnKey) -> Option<Dentry> {
        self.inner.lock().dentries.get(key).cloned()
    }

    fn with_dentry_mut_dyn(&self, key: &DnKey, f: &mut dyn FnMut(&mut Dentry)) {
        if let Some(dentry) = self.inner.lock().dentries.get_mut(key) {
            f(dentry);
        }
    }

    fn insert_dentry(&self, dentry: Dentry) {
        self.inner.lock().dentries.insert(dentry.key.clone(), dentry);
    }

    fn remove_dentry(&self, key: &DnKey) {
        self.inner.lock().dentries.remove(key);
    }

    fn add_waiter(&self, object: WaitObject, channel: WaitChannel, waiter: Waiter) {
        self.inner
            .lock()
            .waiters
            .queues
            .entry((object, channel))
            .or_default()
            .push(waiter);
    }

    fn fire_waiters(&self, object: WaitObject, channel: WaitChannel) {
        let drained = self
            .inner
            .lock()
            .waiters
            .queues
            .remove(&(object, channel))
            .unwrap_or_default();
        tracing::debug!(count = drained.len(), "firing waiters");
        for waiter in drained {
            waiter();
        }
    }

    fn can_auth_pin(&self, target: &AuthPinTarget) -> bool {
        match target {
            AuthPinTarget::Inode(ino) => self
                .inner
                .lock()
                .inodes
                .get(ino)
                .map(|i| i.can_auth_pin())
                .unwrap_or(false),
            AuthPinTarget::Dentry(key) => self
                .inner
                .lock()
                .dentries
                .get(key)
                .map(|d| d.can_auth_pin())
                .unwrap_or(false),
        }
    }

    fn auth_pin(&self, target: &AuthPinTarget) {
        let mut state = self.inner.lock();
        match target {
            AuthPinTarget::Inode(ino) => {
                if let Some(i) = state.inodes.get_mut(ino) {
                    i.auth_pins += 1;
                }
            }
            AuthPinTarget::Dentry(key) => {
                if let Some(d) = state.dentries.get_mut(key) {
                    d.auth_pins += 1;
                }
            }
        }
    }

    fn auth_unpin(&self, target: &AuthPinTarget) {
        let mut state = self.inner.lock();
        match target {
            AuthPinTarget::Inode(ino) => {
                if let Some(i) = state.inodes.get_mut(ino) {
                    i.auth_pins = i.auth_pins.saturating_sub(1);
                }
            }
            AuthPinTarget::Dentry(key) => {
                if let Some(d) = state.dentries.get_mut(key) {
                    d.auth_pins = d.auth_pins.saturating_sub(1);
                }
            }
        }
    }
}
