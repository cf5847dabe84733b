// FILE inode lock state machine (`spec.md` §4.3 `[FILE]`).
//
// States: `SYNC`, `MIXED`, `LOCK`, `LONER` (authority-only — replicas
// always see `LOCK` in its place) plus the nine gathering states. Demand
// selection and commit rules are driven by `file_eval`, re-entered after
// every relevant event.

use crate::cache::{CacheExt, Waiter};
use crate::common::Ino;
use crate::locker::wire::{Action, LockPayload, LockTarget, MLock, OType};
use crate::locker::{CapBits, Disposition, FileLockState, Locker, WaitChannel, WaitObject};

impl Locker {
    /// `spec.md` §4.3 `file_rdlock_start`. A replica finding the cell in
    /// `MIXED` cannot mint the `RD` bits `MIXED` allows on its own — it
    /// forwards to the authority instead of reading locally.
    pub fn file_rdlock_start(&self, ino: Ino, waiter: Waiter) -> Disposition {
        let local = self.local_node();
        let outcome = self
            .cache
            .with_inode_mut(ino, |inode| {
                let is_auth = inode.is_auth(local);
                if !is_auth && *inode.file.state() == FileLockState::Mixed {
                    return Disposition::Forward(inode.authority);
                }
                if inode.file.can_read(is_auth) {
                    inode.file.counters.nread += 1;
                    Disposition::Ready
                } else {
                    Disposition::Suspended
                }
            })
            .expect("file_rdlock_start on unknown inode");

        if outcome == Disposition::Suspended {
            self.cache
                .add_waiter(WaitObject::Inode(ino), WaitChannel::FileR, waiter);
        }
        outcome
    }

    pub fn file_rdlock_finish(&self, ino: Ino) {
        self.cache.with_inode_mut(ino, |inode| {
            debug_assert!(inode.file.counters.nread > 0);
            inode.file.counters.nread -= 1;
        });
    }

    /// `spec.md` §4.3 `file_xlock_start`.
    pub async fn file_xlock_start(&self, ino: Ino, req: crate::common::ReqId, waiter: Waiter) -> Disposition {
        enum Step {
            Ready,
            Initiate,
            AlreadyGathering,
            Forward(crate::common::NodeId),
        }

        let local = self.local_node();
        let step = self
            .cache
            .with_inode_mut(ino, |inode| {
                let is_auth = inode.is_auth(local);
                if is_auth
                    && *inode.file.state() == FileLockState::Lock
                    && inode.file.counters.can_write(req)
                {
                    inode.file.counters.writer = Some(req);
                    return Step::Ready;
                }
                if is_auth {
                    inode.file.counters.write_wanted = true;
                    if inode.file.state().is_stable() {
                        Step::Initiate
                    } else {
                        Step::AlreadyGathering
                    }
                } else {
                    Step::Forward(inode.authority)
                }
            })
            .expect("file_xlock_start on unknown inode");

        match step {
            Step::Ready => Disposition::Ready,
            Step::Forward(authority) => Disposition::Forward(authority),
            Step::Initiate => {
                self.file_lock(ino).await;
                self.cache
                    .add_waiter(WaitObject::Inode(ino), WaitChannel::FileW, waiter);
                Disposition::Suspended
            }
            Step::AlreadyGathering => {
                self.cache
                    .add_waiter(WaitObject::Inode(ino), WaitChannel::FileW, waiter);
                Disposition::Suspended
            }
        }
    }

    pub fn file_xlock_finish(&self, ino: Ino) {
        self.cache.with_inode_mut(ino, |inode| {
            inode.file.counters.writer = None;
            inode.file.counters.write_wanted = false;
        });
        self.cache
            .fire_waiters(WaitObject::Inode(ino), WaitChannel::FileW);
    }

    /// `file_sync` — legal only from `LOCK`... for the FILE axis, legal
    /// source states are `MIXED` or `LONER` (`spec.md` §4.3 commit table).
    pub async fn file_sync(&self, ino: Ino) {
        self.begin_gather(ino, FileLockState::Sync).await;
    }

    pub async fn file_lock(&self, ino: Ino) {
        self.begin_gather(ino, FileLockState::Lock).await;
    }

    pub async fn file_mixed(&self, ino: Ino) {
        self.begin_gather(ino, FileLockState::Mixed).await;
    }

    pub async fn file_loner(&self, ino: Ino) {
        self.begin_gather(ino, FileLockState::Loner).await;
    }

    async fn begin_gather(&self, ino: Ino, dest: FileLockState) {
        let local = self.local_node();
        let (gathering, replicas) = self
            .cache
            .with_inode_mut(ino, |inode| {
                let source = inode.file.state().clone();
                assert!(source.is_stable(), "file transition from non-stable state");
                let replicas = inode.replicas.clone();
                let gathering = match (&dest, &source) {
                    (FileLockState::Lock, FileLockState::Sync) => FileLockState::GLockR(replicas.clone()),
                    (FileLockState::Lock, FileLockState::Mixed) => FileLockState::GLockM(replicas.clone()),
                    (FileLockState::Lock, FileLockState::Loner) => FileLockState::GLockL(replicas.clone()),
                    (FileLockState::Mixed, FileLockState::Sync) => FileLockState::GMixedR(Default::default()),
                    (FileLockState::Mixed, FileLockState::Loner) => FileLockState::GMixedL(replicas.clone()),
                    (FileLockState::Loner, FileLockState::Sync) => FileLockState::GLonerR(replicas.clone()),
                    (FileLockState::Loner, FileLockState::Mixed) => FileLockState::GLonerM(replicas.clone()),
                    (FileLockState::Sync, FileLockState::Loner) => FileLockState::GSyncL(Default::default()),
                    (FileLockState::Sync, FileLockState::Mixed) => FileLockState::GSyncM(Default::default()),
                    _ => unreachable!("illegal file transition {:?} -> {:?}", source, dest),
                };
                *inode.file.state_mut() = gathering.clone();
                let gather_replicas = gathering.gather_set().cloned().unwrap_or_default();
                (gathering, gather_replicas)
            })
            .expect("begin_gather on unknown inode");

        // Recall caps toward the destination's allowed set before anything
        // else, so issue_caps has the right target immediately.
        self.issue_caps(ino).await;

        let broadcast = match gathering {
            FileLockState::GLockR(_) | FileLockState::GLockM(_) | FileLockState::GLockL(_) => {
                Some((Action::Lock, LockPayload::None))
            }
            FileLockState::GLonerR(_) | FileLockState::GLonerM(_) => Some((Action::Lock, LockPayload::None)),
            FileLockState::GMixedL(_) => {
                let payload = self
                    .cache
                    .with_inode_mut(ino, |inode| inode.file_payload.clone())
                    .unwrap_or_default();
                Some((Action::Mixed, LockPayload::File(payload)))
            }
            FileLockState::GSyncL(_) | FileLockState::GSyncM(_) => {
                let payload = self
                    .cache
                    .with_inode_mut(ino, |inode| inode.file_payload.clone())
                    .unwrap_or_default();
                Some((Action::Sync, LockPayload::File(payload)))
            }
            _ => None,
        };

        if let Some((action, payload)) = broadcast {
            for replica in replicas {
                self.transport
                    .send_lock(
                        replica,
                        MLock {
                            asker: local,
                            otype: OType::IFile,
                            action,
                            target: LockTarget::Ino(ino),
                            data: payload.clone(),
                            path: None,
                        },
                    )
                    .await;
            }
        }

        // Re-evaluate immediately: an unreplicated gather's replica set is
        // already empty, and `AC_SYNC` is fire-and-forget (`spec.md` §4.3:
        // "No reply"), so in both cases the only thing left to wait on is
        // the cap drain already triggered above — recheck now rather than
        // waiting on a gather ack that will never arrive.
        Box::pin(self.file_eval(ino)).await;
    }

    /// `file_eval`: re-evaluate after every relevant event. First checks
    /// whether an in-progress gather can commit; if stable, checks whether
    /// client demand calls for a new transition.
    pub async fn file_eval(&self, ino: Ino) {
        let commit = self
            .cache
            .with_inode_mut(ino, |inode| {
                let state = inode.file.state();
                if state.is_stable() {
                    return None;
                }
                let gather_empty = state.gather_set().map(|g| g.is_empty()).unwrap_or(true);
                if !gather_empty {
                    return None;
                }
                let blocking = state.commit_blocking_bits();
                let issued = inode
                    .client_caps
                    .values()
                    .fold(CapBits::empty(), |acc, c| acc | c.issued);
                if issued.intersects(blocking) {
                    None
                } else {
                    state.destination()
                }
            })
            .flatten();

        if let Some(dest) = commit {
            self.cache.with_inode_mut(ino, |inode| {
                *inode.file.state_mut() = dest;
            });
            self.cache
                .fire_waiters(WaitObject::Inode(ino), WaitChannel::FileRwb);
            self.cache
                .fire_waiters(WaitObject::Inode(ino), WaitChannel::FileW);
            self.cache
                .fire_waiters(WaitObject::Inode(ino), WaitChannel::FileStable);
            return;
        }

        let still_gathering = self
            .cache
            .with_inode_mut(ino, |inode| !inode.file.state().is_stable())
            .unwrap_or(false);
        if still_gathering {
            return;
        }

        let local = self.local_node();
        let decision = self
            .cache
            .with_inode_mut(ino, |inode| {
                let wanted = inode.caps_wanted() | inode.mds_caps_wanted.values().fold(CapBits::empty(), |a, &b| a | b);
                let read_wanted = wanted.intersects(CapBits::FILE_RD | CapBits::FILE_RDCACHE);
                let write_wanted = wanted.intersects(CapBits::FILE_WR | CapBits::FILE_WRBUFFER);
                let no_holders = inode.file.counters.nread == 0 && inode.file.counters.writer.is_none();
                let state = inode.file.state().clone();
                let target = if no_holders
                    && write_wanted
                    && inode.is_loner_candidate()
                    && state != FileLockState::Loner
                {
                    Some(FileLockState::Loner)
                } else if read_wanted && write_wanted {
                    Some(FileLockState::Mixed)
                } else if !write_wanted && (read_wanted || inode.is_replicated() || state == FileLockState::Loner)
                {
                    Some(FileLockState::Sync)
                } else if !inode.is_replicated() && !read_wanted && !write_wanted {
                    Some(FileLockState::Lock)
                } else {
                    None
                };
                let _ = local;
                target.filter(|t| *t != state)
            })
            .flatten();

        if let Some(target) = decision {
            match target {
                FileLockState::Sync => self.file_sync(ino).await,
                FileLockState::Mixed => self.file_mixed(ino).await,
                FileLockState::Lock => self.file_lock(ino).await,
                FileLockState::Loner => self.file_loner(ino).await,
                _ => unreachable!(),
            }
        }
    }

    /// Authority side of `AC_LOCKACK`/`AC_MIXEDACK`/`AC_SYNCACK` for `IFILE`.
    pub async fn handle_file_gather_ack(&self, ino: Ino, from: crate::common::NodeId) {
        let gather_emptied = self
            .cache
            .with_inode_mut(ino, |inode| {
                if let Some(gather) = inode.file.state_mut().gather_set_mut() {
                    gather.remove(&from);
                    gather.is_empty()
                } else {
                    false
                }
            })
            .unwrap_or(false);

        if gather_emptied {
            self.file_eval(ino).await;
        }
    }

    /// Replica side of an inbound `MLock{otype: IFILE}`
    /// (`handle_lock_inode_file`).
    pub async fn handle_lock_inode_file(&self, ino: Ino, msg: MLock) {
        let local = self.local_node();
        match msg.action {
            Action::Sync => {
                self.cache.with_inode_mut(ino, |inode| {
                    if let LockPayload::File(payload) = &msg.data {
                        inode.file_payload = payload.clone();
                    }
                    *inode.file.state_mut() = FileLockState::Sync;
                });
                self.cache
                    .fire_waiters(WaitObject::Inode(ino), WaitChannel::FileR);
                self.cache
                    .fire_waiters(WaitObject::Inode(ino), WaitChannel::FileStable);
            }
            Action::Lock => {
                let nread = self
                    .cache
                    .with_inode_mut(ino, |inode| inode.file.counters.nread)
                    .unwrap_or(0);
                if nread > 0 {
                    self.cache.with_inode_mut(ino, |inode| {
                        *inode.file.state_mut() = FileLockState::GLockR(Default::default());
                    });
                    self.cache
                        .add_waiter(WaitObject::Inode(ino), WaitChannel::FileNoRd, Box::new(|| {}));
                    return;
                }
                self.cache.with_inode_mut(ino, |inode| {
                    *inode.file.state_mut() = FileLockState::Lock;
                });
                self.transport
                    .send_lock(
                        msg.asker,
                        MLock {
                            asker: local,
                            otype: OType::IFile,
                            action: Action::LockAck,
                            target: LockTarget::Ino(ino),
                            data: LockPayload::None,
                            path: None,
                        },
                    )
                    .await;
            }
            Action::Mixed => {
                let from_sync = self
                    .cache
                    .with_inode_mut(ino, |inode| *inode.file.state() == FileLockState::Sync)
                    .unwrap_or(false);

                if from_sync {
                    let nread = self
                        .cache
                        .with_inode_mut(ino, |inode| inode.file.counters.nread)
                        .unwrap_or(0);
                    if nread > 0 {
                        self.cache.with_inode_mut(ino, |inode| {
                            *inode.file.state_mut() = FileLockState::GMixedR(Default::default());
                        });
                        self.cache
                            .add_waiter(WaitObject::Inode(ino), WaitChannel::FileNoRd, Box::new(|| {}));
                        return;
                    }
                    self.cache.with_inode_mut(ino, |inode| {
                        if let LockPayload::File(payload) = &msg.data {
                            inode.file_payload = payload.clone();
                        }
                        *inode.file.state_mut() = FileLockState::Mixed;
                    });
                    self.transport
                        .send_lock(
                            msg.asker,
                            MLock {
                                asker: local,
                                otype: OType::IFile,
                                action: Action::MixedAck,
                                target: LockTarget::Ino(ino),
                                data: LockPayload::None,
                                path: None,
                            },
                        )
                        .await;
                } else {
                    // from LOCK: direct, no ack.
                    self.cache.with_inode_mut(ino, |inode| {
                        if let LockPayload::File(payload) = &msg.data {
                            inode.file_payload = payload.clone();
                        }
                        *inode.file.state_mut() = FileLockState::Mixed;
                    });
                }
                self.cache
                    .fire_waiters(WaitObject::Inode(ino), WaitChannel::FileStable);
            }
            other => {
                tracing::warn!(?other, "unexpected action for IFILE");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locker::cap::OpenMode;
    use crate::locker::test_support::test_locker;
    use crate::locker::Inode;

    #[tokio::test]
    async fn single_writer_on_unreplicated_inode_becomes_loner() {
        let locker = test_locker(0);
        locker.cache.insert_inode(Inode::new(1, 0));

        locker.issue_new_caps(1, 42, OpenMode::Write).await;

        let state = locker.cache.inode(1).unwrap().file.state().clone();
        assert_eq!(state, FileLockState::Loner);
    }

    #[tokio::test]
    async fn two_readers_on_unreplicated_inode_stay_sync() {
        let locker = test_locker(0);
        locker.cache.insert_inode(Inode::new(1, 0));

        locker.issue_new_caps(1, 1, OpenMode::Read).await;
        locker.issue_new_caps(1, 2, OpenMode::Read).await;

        let state = locker.cache.inode(1).unwrap().file.state().clone();
        assert_eq!(state, FileLockState::Sync);
    }

    #[tokio::test]
    async fn replica_rdlock_on_mixed_forwards_to_authority() {
        let locker = test_locker(1);
        let mut inode = Inode::new(1, 0);
        *inode.file.state_mut() = FileLockState::Mixed;
        locker.cache.insert_inode(inode);

        let disposition = locker.file_rdlock_start(1, Box::new(|| {}));
        assert_eq!(disposition, Disposition::Forward(0));
    }

    #[tokio::test]
    async fn replicated_inode_writer_gathers_loner_and_broadcasts() {
        let locker = test_locker(0);
        let mut inode = Inode::new(1, 0);
        inode.replicas.insert(1);
        locker.cache.insert_inode(inode);

        locker.issue_new_caps(1, 42, OpenMode::Write).await;

        assert!(matches!(
            locker.cache.inode(1).unwrap().file.state(),
            FileLockState::GLonerR(_)
        ));

        locker.handle_file_gather_ack(1, 1).await;
        assert_eq!(*locker.cache.inode(1).unwrap().file.state(), FileLockState::Loner);
    }

    #[tokio::test]
    async fn xlock_waiter_wakes_once_the_gather_completes() {
        let locker = test_locker(0);
        let mut inode = Inode::new(1, 0);
        inode.replicas.insert(1);
        locker.cache.insert_inode(inode);

        let woken = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = woken.clone();
        let disposition = locker
            .file_xlock_start(
                1,
                7,
                Box::new(move || flag.store(true, std::sync::atomic::Ordering::SeqCst)),
            )
            .await;
        assert_eq!(disposition, Disposition::Suspended);

        locker.handle_file_gather_ack(1, 1).await;
        assert!(woken.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(*locker.cache.inode(1).unwrap().file.state(), FileLockState::Lock);
    }

    #[tokio::test]
    async fn loner_steps_down_to_mixed_once_a_peer_wants_read_and_write() {
        let locker = test_locker(0);
        locker.cache.insert_inode(Inode::new(1, 0));

        locker.issue_new_caps(1, 42, OpenMode::Write).await;
        assert_eq!(*locker.cache.inode(1).unwrap().file.state(), FileLockState::Loner);

        locker
            .handle_inode_file_caps(1, 1, CapBits::FILE_RD | CapBits::FILE_WR)
            .await;

        assert_eq!(*locker.cache.inode(1).unwrap().file.state(), FileLockState::Mixed);
    }

    #[tokio::test]
    async fn replica_rdlock_blocks_while_locked() {
        let locker = test_locker(1);
        let mut inode = Inode::new(1, 0);
        *inode.file.state_mut() = FileLockState::Lock;
        locker.cache.insert_inode(inode);

        let disposition = locker.file_rdlock_start(1, Box::new(|| {}));
        assert_eq!(disposition, Disposition::Suspended);
        assert_eq!(locker.cache.inode(1).unwrap().file.counters.nread, 0);
    }

    #[tokio::test]
    async fn auth_rdlock_never_blocks_even_while_locked() {
        let locker = test_locker(0);
        let mut inode = Inode::new(1, 0);
        *inode.file.state_mut() = FileLockState::Lock;
        locker.cache.insert_inode(inode);

        let disposition = locker.file_rdlock_start(1, Box::new(|| {}));
        assert_eq!(disposition, Disposition::Ready);
    }
}
