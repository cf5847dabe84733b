// Dentry lock state machine (`spec.md` §4.5 `[DN]`).
//
// States: `SYNC` (multiple readers may pin), `PREXLOCK` (auth claimed
// xlock, awaiting replica acks), `XLOCK` (auth grants xlock to exactly one
// request), `UNPINNING` (new xlocker announced, draining readers).

use std::collections::HashSet;

use crate::cache::{CacheExt, Waiter};
use crate::common::{DnKey, NodeId, ReqId};
use crate::locker::wire::{Action, LockPayload, LockTarget, MLock, OType};
use crate::locker::{Disposition, DnLockState, Locker, WaitChannel, WaitObject, XlockHolder};

impl Locker {
    /// `spec.md` §4.5 `dentry_rdlock_start`.
    pub fn dentry_rdlock_start(&self, key: &DnKey, req: ReqId, waiter: Waiter) -> Disposition {
        let disposition = self
            .cache
            .with_dentry_mut(key, |d| {
                if d.state == DnLockState::Sync {
                    *d.pins.entry(req).or_insert(0) += 1;
                    Disposition::Ready
                } else {
                    Disposition::Suspended
                }
            })
            .expect("dentry_rdlock_start on unknown dentry");

        if disposition == Disposition::Suspended {
            self.cache
                .add_waiter(WaitObject::Dentry(key.clone()), WaitChannel::DnPinnable, waiter);
        }
        disposition
    }

    /// `spec.md` §4.5 `dentry_rdlock_finish`.
    pub fn dentry_rdlock_finish(&self, key: &DnKey, req: ReqId) {
        let became_sync = self
            .cache
            .with_dentry_mut(key, |d| {
                if let Some(c) = d.pins.get_mut(&req) {
                    *c = c.saturating_sub(1);
                    if *c == 0 {
                        d.pins.remove(&req);
                    }
                }
                if d.state == DnLockState::Unpinning && !d.is_pinned() {
                    d.state = DnLockState::Sync;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);

        if became_sync {
            self.cache
                .fire_waiters(WaitObject::Dentry(key.clone()), WaitChannel::DnUnpinned);
        }
    }

    /// `spec.md` §4.5 `dentry_xlock_start`.
    pub async fn dentry_xlock_start(&self, key: &DnKey, req: ReqId, path: Option<String>, waiter: Waiter) -> Disposition {
        enum Step {
            Ready,
            Blocked,
            PinnedUnpin,
            Gather(HashSet<NodeId>),
            UnReplicated,
            Forward(NodeId),
        }

        let local = self.local_node();
        let step = self
            .cache
            .with_dentry_mut(key, |d| {
                if !d.is_auth(local) {
                    return Step::Forward(d.authority);
                }
                if d.is_xlockedby(req) {
                    return Step::Ready;
                }
                if matches!(d.xlockedby, XlockHolder::Local(_) | XlockHolder::Foreign) {
                    return Step::Blocked;
                }
                if !matches!(d.state, DnLockState::Sync | DnLockState::Unpinning) {
                    return Step::Blocked;
                }
                if d.is_pinned() {
                    d.state = DnLockState::Unpinning;
                    return Step::PinnedUnpin;
                }
                d.xlockedby = XlockHolder::Local(req);
                *d.pins.entry(req).or_insert(0) += 1;
                if d.is_replicated() {
                    d.state = DnLockState::Prexlock(d.replicas.iter().cloned().collect());
                    Step::Gather(d.replicas.clone())
                } else {
                    d.state = DnLockState::Xlock;
                    Step::UnReplicated
                }
            })
            .expect("dentry_xlock_start on unknown dentry");

        match step {
            Step::Ready | Step::UnReplicated => Disposition::Ready,
            Step::Forward(authority) => Disposition::Forward(authority),
            Step::Blocked => {
                self.cache
                    .add_waiter(WaitObject::Dentry(key.clone()), WaitChannel::DnRead, waiter);
                Disposition::Suspended
            }
            Step::PinnedUnpin => {
                self.cache
                    .add_waiter(WaitObject::Dentry(key.clone()), WaitChannel::DnUnpinned, waiter);
                Disposition::Suspended
            }
            Step::Gather(replicas) => {
                for replica in replicas {
                    self.transport
                        .send_lock(
                            replica,
                            MLock {
                                asker: local,
                                otype: OType::Dn,
                                action: Action::Lock,
                                target: LockTarget::Dentry {
                                    dirfrag: key.dirfrag,
                                    name: key.name.clone(),
                                },
                                data: LockPayload::None,
                                path: path.clone(),
                            },
                        )
                        .await;
                }
                self.cache
                    .add_waiter(WaitObject::Dentry(key.clone()), WaitChannel::DnLock, waiter);
                Disposition::Suspended
            }
        }
    }

    /// Authority side of `AC_LOCKACK`/`AC_LOCKNAK` for `DN`.
    pub fn handle_dn_lock_ack_or_nak(&self, key: &DnKey, from: NodeId) {
        let completed = self
            .cache
            .with_dentry_mut(key, |d| {
                if let DnLockState::Prexlock(gather) = &mut d.state {
                    gather.remove(&from);
                    gather.is_empty()
                } else {
                    false
                }
            })
            .unwrap_or(false);

        if completed {
            self.cache.with_dentry_mut(key, |d| {
                d.state = DnLockState::Xlock;
            });
            self.cache
                .fire_waiters(WaitObject::Dentry(key.clone()), WaitChannel::DnLock);
        }
    }

    /// `spec.md` §4.5 `dentry_xlock_finish`.
    pub async fn dentry_xlock_finish(&self, key: &DnKey, req: ReqId) {
        let replicas = self
            .cache
            .with_dentry_mut(key, |d| {
                debug_assert!(d.is_xlockedby(req));
                d.xlockedby = XlockHolder::None;
                d.state = DnLockState::Sync;
                if let Some(c) = d.pins.get_mut(&req) {
                    *c = c.saturating_sub(1);
                    if *c == 0 {
                        d.pins.remove(&req);
                    }
                }
                d.replicas.clone()
            })
            .expect("dentry_xlock_finish on unknown dentry");

        for replica in replicas {
            self.transport
                .send_lock(
                    replica,
                    MLock {
                        asker: self.local_node(),
                        otype: OType::Dn,
                        action: Action::Sync,
                        target: LockTarget::Dentry {
                            dirfrag: key.dirfrag,
                            name: key.name.clone(),
                        },
                        data: LockPayload::None,
                        path: None,
                    },
                )
                .await;
        }
        self.cache
            .fire_waiters(WaitObject::Dentry(key.clone()), WaitChannel::DnRead);
    }

    /// `spec.md` §4.5 `dentry_xlock_downgrade_to_rdlock`.
    pub async fn dentry_xlock_downgrade_to_rdlock(&self, key: &DnKey, req: ReqId) {
        let replicas = self
            .cache
            .with_dentry_mut(key, |d| {
                debug_assert!(d.is_xlockedby(req));
                d.xlockedby = XlockHolder::None;
                d.state = DnLockState::Sync;
                d.replicas.clone()
            })
            .expect("dentry_xlock_downgrade_to_rdlock on unknown dentry");

        for replica in replicas {
            self.transport
                .send_lock(
                    replica,
                    MLock {
                        asker: self.local_node(),
                        otype: OType::Dn,
                        action: Action::Sync,
                        target: LockTarget::Dentry {
                            dirfrag: key.dirfrag,
                            name: key.name.clone(),
                        },
                        data: LockPayload::None,
                        path: None,
                    },
                )
                .await;
        }
        self.cache
            .fire_waiters(WaitObject::Dentry(key.clone()), WaitChannel::DnRead);
    }

    /// Replica side of an inbound `MLock{otype: DN}`.
    pub async fn handle_lock_dentry(&self, key: &DnKey, msg: MLock) {
        match msg.action {
            Action::Lock => {
                if self.cache.dentry(key).is_none() {
                    self.cache.insert_dentry(crate::locker::Dentry::new(key.clone(), msg.asker));
                }
                let pinned = self
                    .cache
                    .with_dentry_mut(key, |d| d.is_pinned())
                    .unwrap_or(false);

                if pinned {
                    self.cache.with_dentry_mut(key, |d| d.state = DnLockState::Unpinning);
                    let locker = self.clone();
                    let key = key.clone();
                    let asker = msg.asker;
                    self.cache.add_waiter(
                        WaitObject::Dentry(key.clone()),
                        WaitChannel::DnUnpinned,
                        Box::new(move || {
                            tokio::spawn(async move {
                                locker.reply_dn_lock_ack(&key, asker).await;
                            });
                        }),
                    );
                    return;
                }

                self.cache.with_dentry_mut(key, |d| d.state = DnLockState::Xlock);
                self.reply_dn_lock_ack(key, msg.asker).await;
            }
            Action::Sync => {
                let (deleted, _) = self
                    .cache
                    .with_dentry_mut(key, |d| {
                        d.state = DnLockState::Sync;
                        (!d.exists, ())
                    })
                    .unwrap_or((false, ()));
                if deleted {
                    self.cache.remove_dentry(key);
                }
                self.cache
                    .fire_waiters(WaitObject::Dentry(key.clone()), WaitChannel::DnRead);
            }
            other => {
                tracing::warn!(?other, "unexpected action for DN");
            }
        }
    }

    async fn reply_dn_lock_ack(&self, key: &DnKey, to: NodeId) {
        self.transport
            .send_lock(
                to,
                MLock {
                    asker: self.local_node(),
                    otype: OType::Dn,
                    action: Action::LockAck,
                    target: LockTarget::Dentry {
                        dirfrag: key.dirfrag,
                        name: key.name.clone(),
                    },
                    data: LockPayload::None,
                    path: None,
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locker::test_support::test_locker;
    use crate::locker::Dentry;

    fn key() -> DnKey {
        DnKey::new(1, "foo".to_string())
    }

    #[tokio::test]
    async fn rdlock_ready_when_sync_and_unpinned() {
        let locker = test_locker(0);
        locker.cache.insert_dentry(Dentry::new(key(), 0));

        let disposition = locker.dentry_rdlock_start(&key(), 1, Box::new(|| {}));
        assert_eq!(disposition, Disposition::Ready);
        locker.dentry_rdlock_finish(&key(), 1);
    }

    #[tokio::test]
    async fn xlock_on_unreplicated_dentry_is_ready() {
        let locker = test_locker(0);
        locker.cache.insert_dentry(Dentry::new(key(), 0));

        let disposition = locker.dentry_xlock_start(&key(), 1, None, Box::new(|| {})).await;
        assert_eq!(disposition, Disposition::Ready);
        assert_eq!(locker.cache.dentry(&key()).unwrap().state, DnLockState::Xlock);

        locker.dentry_xlock_finish(&key(), 1).await;
        assert_eq!(locker.cache.dentry(&key()).unwrap().state, DnLockState::Sync);
    }

    #[tokio::test]
    async fn xlock_on_replicated_dentry_gathers_then_commits() {
        let locker = test_locker(0);
        let mut d = Dentry::new(key(), 0);
        d.replicas.insert(1);
        locker.cache.insert_dentry(d);

        let disposition = locker
            .dentry_xlock_start(&key(), 1, Some("/foo".into()), Box::new(|| {}))
            .await;
        assert_eq!(disposition, Disposition::Suspended);
        assert!(matches!(
            locker.cache.dentry(&key()).unwrap().state,
            DnLockState::Prexlock(_)
        ));

        locker.handle_dn_lock_ack_or_nak(&key(), 1);
        assert_eq!(locker.cache.dentry(&key()).unwrap().state, DnLockState::Xlock);
    }

    #[tokio::test]
    async fn replica_xlock_start_forwards_to_authority() {
        let locker = test_locker(1);
        locker.cache.insert_dentry(Dentry::new(key(), 0));

        let disposition = locker.dentry_xlock_start(&key(), 1, None, Box::new(|| {})).await;
        assert_eq!(disposition, Disposition::Forward(0));
    }
}
