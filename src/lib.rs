// mds-locker - distributed metadata locking subsystem for a clustered
// metadata server (MDS). See SPEC_FULL.md for the full module map.

pub mod cache;
pub mod client;
pub mod common;
pub mod config;
pub mod error;
pub mod journal;
pub mod locker;
pub mod transport;

pub use error::{LockerError, Result};
