// Locker configuration.
//
// The Locker itself has no internal timers beyond the capability hysteresis
// window (spec.md §5); everything else here tunes the reference Transport/
// Cache harness used by tests and the demo binary, not the state machines.

use std::time::Duration;

/// Tunables for one Locker instance.
#[derive(Debug, Clone)]
pub struct LockerConfig {
    /// `spec.md` §4.4 hysteresis: how long a replica holds off reporting a
    /// drop to zero desired caps, to absorb flapping release/reacquire
    /// cycles. The source hardcodes 2 seconds; kept configurable here.
    pub replica_caps_keep_alive: Duration,

    /// How long the reference `Transport` waits for a gather-set ack before
    /// logging a warning (advisory only - the Locker itself has no
    /// cancellation per spec.md §5, so this never aborts a gather).
    pub gather_stall_warning: Duration,

    /// Local node identifier, used to address outbound messages and decide
    /// authority.
    pub node_id: crate::common::NodeId,
}

impl LockerConfig {
    fn default_node_id() -> crate::common::NodeId {
        std::env::var("MDS_LOCKER_NODE_ID")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn with_node_id(mut self, node_id: crate::common::NodeId) -> Self {
        self.node_id = node_id;
        self
    }
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            replica_caps_keep_alive: Duration::from_secs(2),
            gather_stall_warning: Duration::from_secs(5),
            node_id: Self::default_node_id(),
        }
    }
}
