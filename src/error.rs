use thiserror::Error;

/// Errors a Locker caller (the request dispatcher, or the reference harness
/// that stands in for it) must react to.
///
/// `spec.md` §7 splits failure into three classes: structural violations
/// (fatal, handled by `debug_assert!`/`unreachable!` at the call site, never
/// represented here), transient unavailability (not an error — surfaced as
/// `Disposition::Suspended`), and conditions an external caller genuinely
/// needs to handle. Only the last class gets a variant below.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockerError {
    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown inode: {0}")]
    UnknownInode(u64),

    #[error("unknown dentry: {0:?}")]
    UnknownDentry(crate::common::DnKey),

    #[error("unknown capability for client {0} on inode {1}")]
    UnknownCapability(crate::common::ClientId, u64),

    #[error("invalid wire message: {0}")]
    InvalidMessage(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, LockerError>;

impl From<serde_json::Error> for LockerError {
    fn from(e: serde_json::Error) -> Self {
        LockerError::Serialization(e.to_string())
    }
}
