// Inbound message classification and routing (`spec.md` §4 `[DISPATCH]`,
// the `Locker::dispatch` equivalent).
//
// Per `spec.md` §7: a message that names an inode/dentry this node no
// longer caches is silently discarded — the authority learns of cache
// expiry through a separate mechanism (out of scope) and removes the
// replica from future gathers on its own.

use crate::common::DnKey;
use crate::locker::wire::{Action, LockTarget, MInodeFileCaps, MLock, OType};
use crate::locker::Locker;

impl Locker {
    pub async fn dispatch_lock(&self, msg: MLock) {
        match msg.otype {
            OType::IHard => self.dispatch_hard(msg).await,
            OType::IFile => self.dispatch_file(msg).await,
            OType::Dn => self.dispatch_dn(msg).await,
            OType::Dir => {
                tracing::debug!("DIR lock messages are out of scope; dropping");
            }
        }
    }

    async fn dispatch_hard(&self, msg: MLock) {
        let LockTarget::Ino(ino) = msg.target else {
            tracing::warn!("IHARD message without an ino target");
            return;
        };
        if self.cache.inode(ino).is_none() {
            tracing::debug!(ino, "IHARD message for vanished inode; dropping");
            return;
        }
        match msg.action {
            Action::LockAck => self.handle_hard_lock_ack(ino, msg.asker),
            Action::Sync | Action::Lock => self.handle_lock_inode_hard(ino, msg).await,
            other => tracing::warn!(?other, "unhandled IHARD action"),
        }
    }

    async fn dispatch_file(&self, msg: MLock) {
        let LockTarget::Ino(ino) = msg.target else {
            tracing::warn!("IFILE message without an ino target");
            return;
        };
        if self.cache.inode(ino).is_none() {
            tracing::debug!(ino, "IFILE message for vanished inode; dropping");
            return;
        }
        match msg.action {
            Action::LockAck | Action::MixedAck | Action::SyncAck => {
                self.handle_file_gather_ack(ino, msg.asker).await
            }
            Action::Sync | Action::Lock | Action::Mixed => self.handle_lock_inode_file(ino, msg).await,
            other => tracing::warn!(?other, "unhandled IFILE action"),
        }
    }

    async fn dispatch_dn(&self, msg: MLock) {
        let LockTarget::Dentry { dirfrag, name } = &msg.target else {
            tracing::warn!("DN message without a dentry target");
            return;
        };
        let key = DnKey::new(*dirfrag, name.clone());
        match msg.action {
            Action::LockAck | Action::LockNak => self.handle_dn_lock_ack_or_nak(&key, msg.asker),
            Action::Sync | Action::Lock => self.handle_lock_dentry(&key, msg).await,
            Action::ReqXlock | Action::ReqXlockC | Action::ReqXlockAck | Action::ReqXlockNak => {
                tracing::debug!(
                    "REQXLOCK family carried as schema only (spec open question); dropping"
                );
            }
            other => tracing::warn!(?other, "unhandled DN action"),
        }
    }

    /// `handle_inode_file_caps` entry point.
    pub async fn dispatch_inode_file_caps(&self, msg: MInodeFileCaps) {
        if self.cache.inode(msg.ino).is_none() {
            tracing::debug!(ino = msg.ino, "MInodeFileCaps for vanished inode; dropping");
            return;
        }
        self.handle_inode_file_caps(msg.ino, msg.from, msg.caps).await;
    }
}
