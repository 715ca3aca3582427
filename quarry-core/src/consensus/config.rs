//! Configuration for the cluster consensus component.

use std::time::Duration;

use crate::error::{QuarryError, QuarryResult};

/// Address-book TTL for peers seeded from the initial peerset.
pub const INIT_PEER_ADDRESS_TTL: Duration = Duration::from_secs(100 * 60 * 60);

/// A peer in the initial consensus peerset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: u64,
    pub addr: String,
}

/// Knobs for the consensus component and its embedded raft engine.
#[derive(Debug, Clone)]
pub struct ClusterRaftConfig {
    /// Bootstrap peer list. Also the trust set: a peer is trusted iff it is
    /// a member of this list.
    pub init_peerset: Vec<PeerInfo>,
    /// Per-step deadline used by `wait_for_sync` and leader discovery in
    /// `redirect_to_leader`.
    pub wait_for_leader_timeout: Duration,
    /// Attempt count for commit, redirect and membership operations.
    pub commit_retries: u32,
    /// Backoff between commit attempts.
    pub commit_retry_delay: Duration,
    /// Raft heartbeat interval; redirect retries back off at twice this.
    pub heartbeat_timeout: Duration,
    /// Raft tick granularity for the engine event loop.
    pub tick_interval: Duration,
    /// Whether `shutdown` also closes the network host.
    pub host_shutdown: bool,
}

impl Default for ClusterRaftConfig {
    fn default() -> Self {
        Self {
            init_peerset: Vec::new(),
            wait_for_leader_timeout: Duration::from_secs(15),
            commit_retries: 1,
            commit_retry_delay: Duration::from_millis(200),
            heartbeat_timeout: Duration::from_secs(1),
            tick_interval: Duration::from_millis(100),
            host_shutdown: false,
        }
    }
}

impl ClusterRaftConfig {
    pub fn validate(&self) -> QuarryResult<()> {
        if self.wait_for_leader_timeout.is_zero() {
            return Err(QuarryError::Validation {
                field: "wait_for_leader_timeout".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(QuarryError::Validation {
                field: "heartbeat_timeout".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        if self.tick_interval.is_zero() {
            return Err(QuarryError::Validation {
                field: "tick_interval".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        let mut ids: Vec<u64> = self.init_peerset.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.init_peerset.len() {
            return Err(QuarryError::Validation {
                field: "init_peerset".to_string(),
                message: "duplicate peer ids".to_string(),
            });
        }
        if ids.iter().any(|id| *id == 0) {
            return Err(QuarryError::Validation {
                field: "init_peerset".to_string(),
                message: "peer id 0 is reserved".to_string(),
            });
        }
        Ok(())
    }
}
