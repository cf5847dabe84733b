// Client capability layer (`spec.md` §4.4 `[CAP]`).

use std::time::Instant;

use crate::cache::CacheExt;
use crate::common::{CapSnapshot, ClientId, Ino, NodeId, Seq};
use crate::journal::DirtyMetadataEntry;
use crate::locker::wire::{CapOp, MClientFileCaps, MInodeFileCaps};
use crate::locker::{CapBits, FileLockState, Locker, WaitChannel, WaitObject};

/// The access mode a client requested when opening a file
/// (`spec.md` §4.4 `issue_new_caps`: "compute `my_want` from requested file
/// mode").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

impl OpenMode {
    fn wanted_bits(self) -> CapBits {
        match self {
            OpenMode::Read => CapBits::FILE_RD | CapBits::FILE_RDCACHE,
            OpenMode::Write => CapBits::FILE_WR | CapBits::FILE_WRBUFFER,
        }
    }
}

impl Locker {
    /// `spec.md` §4.4 `issue_new_caps`.
    pub async fn issue_new_caps(&self, ino: Ino, client: ClientId, mode: OpenMode) {
        let local = self.local_node();
        let my_want = mode.wanted_bits();

        self.cache.with_inode_mut(ino, |inode| {
            let cap = inode.client_caps.entry(client).or_default();
            cap.wanted |= my_want;
            cap.suppress = true;
        });

        let is_auth = self
            .cache
            .with_inode_mut(ino, |inode| inode.is_auth(local))
            .expect("issue_new_caps on unknown inode");

        if is_auth {
            self.file_eval(ino).await;
        } else {
            self.request_inode_file_caps(ino).await;
        }

        self.issue_caps(ino).await;

        let bumped = self
            .cache
            .with_inode_mut(ino, |inode| {
                let allowed = inode.file.state().caps_allowed(inode.authority == local);
                let pending = inode.client_caps.get(&client).map(|c| c.pending).unwrap_or_default();
                let had_wrbuffer = pending.contains(CapBits::FILE_WRBUFFER);
                let cap = inode.client_caps.get_mut(&client).unwrap();
                let before = cap.pending;
                cap.suppress = false;
                if let Some(seq) = cap.issue(allowed & cap.wanted) {
                    let _ = seq;
                }
                !before.contains(CapBits::FILE_WRBUFFER) && cap.pending.contains(CapBits::FILE_WRBUFFER) && !had_wrbuffer
            })
            .unwrap_or(false);

        if bumped {
            self.cache.with_inode_mut(ino, |inode| {
                inode.file_data_version += 1;
            });
        }

        self.clients.increment_open_count(client, ino);
    }

    /// `spec.md` §4.4 `issue_caps`. Returns `true` iff no client needed
    /// re-issuance (`spec.md` P8: idempotent when `allowed` is unchanged).
    pub async fn issue_caps(&self, ino: Ino) -> bool {
        let local = self.local_node();
        let is_auth = self
            .cache
            .with_inode_mut(ino, |inode| inode.is_auth(local))
            .expect("issue_caps on unknown inode");

        let allowed = self
            .cache
            .with_inode_mut(ino, |inode| inode.file.state().caps_allowed(is_auth))
            .unwrap();

        let mut to_send: Vec<(ClientId, CapSnapshot, Seq, CapBits, CapBits)> = Vec::new();
        let mut any_reissued = false;
        let mut wrbuffer_bumped = false;

        self.cache.with_inode_mut(ino, |inode| {
            let snapshot = CapSnapshot {
                mtime: inode.file_payload.mtime,
                atime: inode.file_payload.atime,
                size: inode.file_payload.size,
                file_data_version: inode.file_data_version,
            };
            for (&client, cap) in inode.client_caps.iter_mut() {
                let new_pending = cap.wanted & allowed;
                if new_pending == cap.pending && cap.issued.contains(new_pending) {
                    continue;
                }
                let had_wrbuffer = cap.pending.contains(CapBits::FILE_WRBUFFER);
                if let Some(seq) = cap.issue(new_pending) {
                    any_reissued = true;
                    if !had_wrbuffer && cap.pending.contains(CapBits::FILE_WRBUFFER) {
                        wrbuffer_bumped = true;
                    }
                    if !cap.suppress {
                        to_send.push((client, snapshot.clone(), seq, cap.pending, cap.wanted));
                    }
                }
            }
        });

        if wrbuffer_bumped {
            self.cache.with_inode_mut(ino, |inode| {
                inode.file_data_version += 1;
            });
        }

        for (client, snapshot, seq, pending, wanted) in to_send {
            self.transport
                .send_client_file_caps(
                    client,
                    MClientFileCaps {
                        ino,
                        client,
                        inode_snapshot: snapshot,
                        seq,
                        caps: pending,
                        wanted,
                        op: CapOp::Grant,
                    },
                )
                .await;
        }

        !any_reissued
    }

    /// `spec.md` §4.4 `request_inode_file_caps` (replica→auth), with the
    /// 2-second hysteresis on zeroing the aggregate.
    pub async fn request_inode_file_caps(&self, ino: Ino) {
        let local = self.local_node();
        enum Step {
            Send(CapBits),
            Deferred,
            Suppressed,
        }

        let step = self
            .cache
            .with_inode_mut(ino, |inode| {
                let aggregate = inode.caps_wanted();
                if aggregate.is_empty() {
                    if inode.replica_caps_wanted.is_empty() {
                        return Step::Suppressed;
                    }
                    match inode.replica_caps_wanted_keep_until {
                        Some(until) if Instant::now() < until => Step::Deferred,
                        Some(_) => {
                            inode.replica_caps_wanted = CapBits::empty();
                            inode.replica_caps_wanted_keep_until = None;
                            Step::Send(CapBits::empty())
                        }
                        None => {
                            inode.replica_caps_wanted_keep_until =
                                Some(Instant::now() + self.config.replica_caps_keep_alive);
                            Step::Deferred
                        }
                    }
                } else {
                    inode.replica_caps_wanted_keep_until = None;
                    if inode.replica_caps_wanted == aggregate {
                        Step::Suppressed
                    } else {
                        inode.replica_caps_wanted = aggregate;
                        Step::Send(aggregate)
                    }
                }
            })
            .expect("request_inode_file_caps on unknown inode");

        if let Step::Send(caps) = step {
            self.transport
                .send_inode_file_caps(
                    self.authority_of(ino).unwrap_or(local),
                    MInodeFileCaps {
                        ino,
                        from: local,
                        caps,
                    },
                )
                .await;
        }
    }

    fn authority_of(&self, ino: Ino) -> Option<NodeId> {
        self.cache.inode(ino).map(|i| i.authority)
    }

    /// `handle_inode_file_caps` (auth receives a replica's aggregate).
    pub async fn handle_inode_file_caps(&self, ino: Ino, from: NodeId, caps: CapBits) {
        self.cache.with_inode_mut(ino, |inode| {
            if caps.is_empty() {
                inode.mds_caps_wanted.remove(&from);
            } else {
                inode.mds_caps_wanted.insert(from, caps);
            }
        });
        self.file_eval(ino).await;
    }

    /// `handle_client_file_caps` (client confirms/releases).
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_client_file_caps(
        &self,
        ino: Ino,
        client: ClientId,
        seq: Seq,
        caps: CapBits,
        wanted: CapBits,
        atime: u64,
        mtime: u64,
        size: u64,
    ) {
        let local = self.local_node();
        let is_auth = self
            .cache
            .with_inode_mut(ino, |inode| inode.is_auth(local))
            .unwrap_or(false);
        let ever_allowed = FileLockState::caps_allowed_ever(is_auth);

        let outcome = self
            .cache
            .with_inode_mut(ino, |inode| {
                let allowed = inode.file.state().caps_allowed(is_auth);
                let clamped_wanted = wanted & ever_allowed;
                let cap = match inode.client_caps.get_mut(&client) {
                    Some(cap) => cap,
                    None => return None,
                };
                cap.wanted = clamped_wanted;
                let had = cap.confirm_receipt(seq, caps);
                let has = cap.confirmed;
                // Deflate `pending`/`issued` toward the new `wanted`
                // immediately, so a client dropping every bit it held is
                // recognized as released right away rather than only after
                // the next `issue_caps` broadcast round-trips.
                cap.pending = cap.wanted & allowed;
                cap.issued &= cap.confirmed | cap.pending;

                if inode.file_payload.atime < atime {
                    inode.file_payload.atime = atime;
                }

                let mut metadata_changed = false;
                if (has | had).intersects(CapBits::FILE_WR) {
                    if inode.file_payload.mtime < mtime {
                        inode.file_payload.mtime = mtime;
                        metadata_changed = true;
                    }
                    if inode.file_payload.size < size {
                        inode.file_payload.size = size;
                        metadata_changed = true;
                    }
                }

                let is_null = inode.client_caps.get(&client).map(|c| c.is_null()).unwrap_or(false);
                if is_null {
                    inode.client_caps.remove(&client);
                }
                Some((is_null, metadata_changed))
            })
            .flatten();

        let Some((released, metadata_changed)) = outcome else {
            tracing::warn!(ino, client, "client cap release on unknown inode/cap");
            return;
        };

        if released {
            if !is_auth {
                self.request_inode_file_caps(ino).await;
            }
            self.clients.decrement_open_count(client, ino);
            self.transport
                .send_client_file_caps(
                    client,
                    MClientFileCaps {
                        ino,
                        client,
                        inode_snapshot: CapSnapshot::default(),
                        seq,
                        caps: CapBits::empty(),
                        wanted: CapBits::empty(),
                        op: CapOp::Release,
                    },
                )
                .await;
        }

        if metadata_changed {
            let (mtime, size) = self
                .cache
                .with_inode_mut(ino, |inode| (inode.file_payload.mtime, inode.file_payload.size))
                .unwrap_or((0, 0));
            self.journal.submit_dirty_metadata(DirtyMetadataEntry { ino, mtime, size });
        }

        self.file_eval(ino).await;
        self.cache
            .fire_waiters(WaitObject::Inode(ino), WaitChannel::Caps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locker::test_support::test_locker;
    use crate::locker::Inode;

    #[tokio::test]
    async fn issue_new_caps_grants_read_bits_to_an_unreplicated_auth_reader() {
        let locker = test_locker(0);
        locker.cache.insert_inode(Inode::new(1, 0));

        locker.issue_new_caps(1, 7, OpenMode::Read).await;

        let pending = locker
            .cache
            .inode(1)
            .unwrap()
            .client_caps
            .get(&7)
            .unwrap()
            .pending;
        assert!(pending.contains(CapBits::FILE_RD));
        assert!(!pending.contains(CapBits::FILE_WR));
    }

    #[tokio::test]
    async fn client_release_drops_the_capability_record() {
        let locker = test_locker(0);
        locker.cache.insert_inode(Inode::new(1, 0));
        locker.issue_new_caps(1, 7, OpenMode::Read).await;

        locker
            .handle_client_file_caps(1, 7, 1, CapBits::empty(), CapBits::empty(), 0, 0, 0)
            .await;

        assert!(!locker.cache.inode(1).unwrap().client_caps.contains_key(&7));
    }

    #[tokio::test]
    async fn replica_requests_caps_from_authority_when_a_client_wants_them() {
        let locker = test_locker(1);
        let mut inode = Inode::new(1, 0);
        inode.replicas.insert(0);
        locker.cache.insert_inode(inode);

        locker.issue_new_caps(1, 7, OpenMode::Read).await;

        assert_eq!(
            locker.cache.inode(1).unwrap().replica_caps_wanted,
            CapBits::FILE_RD | CapBits::FILE_RDCACHE
        );
    }
}
