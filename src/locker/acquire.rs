// Multi-lock acquisition engine (`spec.md` §4.1 `[ACQUIRE]`).
//
// Given a request and four target sets, acquires every requested dentry
// and inode-hard lock in canonical order or suspends the request having
// registered exactly one waiter. The canonical order (dentries before
// inodes, each axis internally sorted) is the deadlock-avoidance discipline
// (`spec.md` §4.1, scenario 6 in §8).

use std::collections::{BTreeMap, BTreeSet};

use crate::cache::RetryFn;
use crate::common::{DnKey, Ino};
use crate::locker::{AuthPinTarget, Disposition, MdRequest, WaitChannel, WaitObject};
use crate::locker::Locker;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Mode {
    Rd,
    Ex,
}

fn merge<T: Ord + Clone>(rd: &BTreeSet<T>, ex: &BTreeSet<T>) -> BTreeMap<T, Mode> {
    let mut map = BTreeMap::new();
    for item in rd {
        map.insert(item.clone(), Mode::Rd);
    }
    for item in ex {
        map.insert(item.clone(), Mode::Ex);
    }
    map
}

impl Locker {
    /// `spec.md` §4.1 `acquire_locks`. `path` supplies the dentry path
    /// needed if any dentry xlock must gather across replicas.
    #[allow(clippy::too_many_arguments)]
    pub async fn acquire_locks(
        &self,
        mdr: &mut MdRequest,
        dentry_rd: BTreeSet<DnKey>,
        dentry_x: BTreeSet<DnKey>,
        inode_hard_rd: BTreeSet<Ino>,
        inode_hard_x: BTreeSet<Ino>,
        path_of: impl Fn(&DnKey) -> Option<String>,
        retry: RetryFn,
    ) -> Disposition {
        // --- phase 1: auth-pin ---
        let mut pin_targets: Vec<AuthPinTarget> = Vec::new();
        pin_targets.extend(dentry_x.iter().cloned().map(AuthPinTarget::Dentry));
        pin_targets.extend(inode_hard_x.iter().cloned().map(AuthPinTarget::Inode));

        for target in &pin_targets {
            if mdr.is_auth_pinned(target) {
                continue;
            }
            if !self.target_is_local_authority(target) {
                continue;
            }
            if !self.cache.can_auth_pin(target) {
                self.drop_all_locks(mdr).await;
                let wait_object = match target {
                    AuthPinTarget::Inode(ino) => WaitObject::Inode(*ino),
                    AuthPinTarget::Dentry(key) => WaitObject::Dentry(key.clone()),
                };
                self.cache
                    .add_waiter(wait_object, WaitChannel::AuthPinnable, make_waiter(&retry));
                return Disposition::Suspended;
            }
            self.cache.auth_pin(target);
            mdr.auth_pins.insert(target.clone());
        }

        // --- phase 2: dentry locks ---
        let dentry_targets = merge(&dentry_rd, &dentry_x);
        let dentry_held = merge(&mdr.dentry_rdlocks, &mdr.dentry_xlocks);

        for (key, mode) in &dentry_held {
            if dentry_targets.get(key) != Some(mode) {
                match mode {
                    Mode::Rd => {
                        self.dentry_rdlock_finish(key, mdr.id);
                        mdr.dentry_rdlocks.remove(key);
                    }
                    Mode::Ex => {
                        self.dentry_xlock_finish(key, mdr.id).await;
                        mdr.dentry_xlocks.remove(key);
                    }
                }
            }
        }

        for (key, mode) in &dentry_targets {
            if dentry_held.get(key) == Some(mode) {
                continue;
            }
            match mode {
                Mode::Rd => match self.dentry_rdlock_start(key, mdr.id, make_waiter(&retry)) {
                    Disposition::Ready => {
                        mdr.dentry_rdlocks.insert(key.clone());
                    }
                    Disposition::Suspended | Disposition::Forward(_) => {
                        self.undo_acquisition(mdr, &pin_targets).await;
                        return Disposition::Suspended;
                    }
                },
                Mode::Ex => {
                    match self
                        .dentry_xlock_start(key, mdr.id, path_of(key), make_waiter(&retry))
                        .await
                    {
                        Disposition::Ready => {
                            mdr.dentry_xlocks.insert(key.clone());
                        }
                        Disposition::Suspended | Disposition::Forward(_) => {
                            self.undo_acquisition(mdr, &pin_targets).await;
                            return Disposition::Suspended;
                        }
                    }
                }
            }
        }

        // --- phase 3: inode hard locks ---
        let hard_targets = merge(&inode_hard_rd, &inode_hard_x);
        let hard_held = merge(&mdr.inode_hard_rdlocks, &mdr.inode_hard_xlocks);

        for (ino, mode) in &hard_held {
            if hard_targets.get(ino) != Some(mode) {
                match mode {
                    Mode::Rd => {
                        self.hard_rdlock_finish(*ino);
                        mdr.inode_hard_rdlocks.remove(ino);
                    }
                    Mode::Ex => {
                        self.hard_xlock_finish(*ino);
                        mdr.inode_hard_xlocks.remove(ino);
                    }
                }
            }
        }

        for (ino, mode) in &hard_targets {
            if hard_held.get(ino) == Some(mode) {
                continue;
            }
            match mode {
                Mode::Rd => match self.hard_rdlock_start(*ino, make_waiter(&retry)) {
                    Disposition::Ready => {
                        mdr.inode_hard_rdlocks.insert(*ino);
                    }
                    Disposition::Suspended | Disposition::Forward(_) => {
                        self.undo_acquisition(mdr, &pin_targets).await;
                        return Disposition::Suspended;
                    }
                },
                Mode::Ex => match self.hard_xlock_start(*ino, mdr.id, make_waiter(&retry)).await {
                    Disposition::Ready => {
                        mdr.inode_hard_xlocks.insert(*ino);
                    }
                    Disposition::Suspended | Disposition::Forward(_) => {
                        self.undo_acquisition(mdr, &pin_targets).await;
                        return Disposition::Suspended;
                    }
                },
            }
        }

        Disposition::Ready
    }

    fn target_is_local_authority(&self, target: &AuthPinTarget) -> bool {
        let local = self.local_node();
        match target {
            AuthPinTarget::Inode(ino) => self
                .cache
                .inode(*ino)
                .map(|i| i.is_auth(local))
                .unwrap_or(false),
            AuthPinTarget::Dentry(key) => self
                .cache
                .dentry(key)
                .map(|d| d.is_auth(local))
                .unwrap_or(false),
        }
    }

    /// Undo only what this call newly acquired (partial dentry/hard starts
    /// plus any auth pins taken this call) and drop the waiters back on the
    /// caller — distinct from the full-drop the auth-pin phase performs,
    /// since earlier-held locks from a prior successful `acquire_locks`
    /// call are left untouched.
    async fn undo_acquisition(&self, mdr: &mut MdRequest, pins_this_call: &[AuthPinTarget]) {
        for target in pins_this_call {
            if mdr.auth_pins.remove(target) {
                self.cache.auth_unpin(target);
            }
        }
    }

    /// Drop every lock and auth pin `mdr` currently holds (`spec.md` §4.1
    /// step 1: "drop all auth pins and locks already taken by r").
    pub async fn drop_all_locks(&self, mdr: &mut MdRequest) {
        for key in mdr.dentry_xlocks.clone() {
            self.dentry_xlock_finish(&key, mdr.id).await;
        }
        for key in mdr.dentry_rdlocks.clone() {
            self.dentry_rdlock_finish(&key, mdr.id);
        }
        for ino in mdr.inode_hard_xlocks.clone() {
            self.hard_xlock_finish(ino);
        }
        for ino in mdr.inode_hard_rdlocks.clone() {
            self.hard_rdlock_finish(ino);
        }
        for ino in mdr.inode_file_xlocks.clone() {
            self.file_xlock_finish(ino);
        }
        for ino in mdr.inode_file_rdlocks.clone() {
            self.file_rdlock_finish(ino);
        }
        for target in mdr.auth_pins.clone() {
            self.cache.auth_unpin(&target);
        }
        mdr.dentry_xlocks.clear();
        mdr.dentry_rdlocks.clear();
        mdr.inode_hard_xlocks.clear();
        mdr.inode_hard_rdlocks.clear();
        mdr.inode_file_xlocks.clear();
        mdr.inode_file_rdlocks.clear();
        mdr.auth_pins.clear();
    }
}

fn make_waiter(retry: &RetryFn) -> crate::cache::Waiter {
    let retry = retry.clone();
    Box::new(move || retry())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::locker::test_support::test_locker;
    use crate::locker::{Dentry, Inode};

    fn noop_retry() -> RetryFn {
        Arc::new(|| {})
    }

    #[tokio::test]
    async fn acquires_dentry_rdlock_and_inode_hard_xlock_in_canonical_order() {
        let locker = test_locker(0);
        let key = DnKey::new(1, "foo".to_string());
        locker.cache.insert_dentry(Dentry::new(key.clone(), 0));
        locker.cache.insert_inode(Inode::new(10, 0));

        let mut mdr = MdRequest::new(1);
        let disposition = locker
            .acquire_locks(
                &mut mdr,
                BTreeSet::from([key.clone()]),
                BTreeSet::new(),
                BTreeSet::new(),
                BTreeSet::from([10]),
                |_| None,
                noop_retry(),
            )
            .await;

        assert_eq!(disposition, Disposition::Ready);
        assert!(mdr.dentry_rdlocks.contains(&key));
        assert!(mdr.inode_hard_xlocks.contains(&10));

        locker.drop_all_locks(&mut mdr).await;
        assert!(mdr.dentry_rdlocks.is_empty());
        assert!(mdr.inode_hard_xlocks.is_empty());
    }

    #[tokio::test]
    async fn auth_pin_failure_rolls_back_everything_and_suspends() {
        let locker = test_locker(0);
        let key = DnKey::new(1, "foo".to_string());
        let mut d = Dentry::new(key.clone(), 0);
        d.frozen = true;
        locker.cache.insert_dentry(d);

        let mut mdr = MdRequest::new(1);
        let disposition = locker
            .acquire_locks(
                &mut mdr,
                BTreeSet::new(),
                BTreeSet::from([key]),
                BTreeSet::new(),
                BTreeSet::new(),
                |_| None,
                noop_retry(),
            )
            .await;

        assert_eq!(disposition, Disposition::Suspended);
        assert!(mdr.auth_pins.is_empty());
    }
}
