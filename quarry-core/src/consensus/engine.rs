//! The capability surface the consensus component drives.
//!
//! The replicated-log engine is kept behind this trait so the commit /
//! forwarding / bootstrap envelope in [`super::core`] does not depend on a
//! concrete raft implementation, and so tests can substitute a scripted
//! engine.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QuarryResult;

use super::state::{ConsensusOp, RaftState};

/// Replicated operation-log engine.
#[async_trait]
pub trait OpLogEngine: Send + Sync {
    /// Commit one operation through the log. Resolves once the entry is
    /// committed and applied locally. The caller must be the leader.
    async fn commit_op(&self, op: ConsensusOp) -> QuarryResult<()>;

    /// The last agreed operational state. Empty when the log has never been
    /// populated.
    async fn get_log_head(&self) -> QuarryResult<RaftState>;

    /// Current leader, if one is known.
    async fn leader(&self) -> Option<u64>;

    /// Current voting membership.
    async fn peers(&self) -> QuarryResult<Vec<u64>>;

    async fn add_peer(&self, peer: u64) -> QuarryResult<()>;

    async fn remove_peer(&self, peer: u64) -> QuarryResult<()>;

    /// Block until a leader is known, up to `timeout`. Returns the leader id.
    async fn wait_for_leader(&self, timeout: Duration) -> QuarryResult<u64>;

    /// Block until this replica is a voter (not merely staging/learning).
    async fn wait_for_voter(&self, timeout: Duration) -> QuarryResult<()>;

    /// Block until the last applied log index has caught up with the last
    /// committed index.
    async fn wait_for_updates(&self, timeout: Duration) -> QuarryResult<()>;

    /// Seed an initial cluster when no persisted state exists. A no-op when
    /// state exists or the replica is staging. Returns whether a bootstrap
    /// was actually performed.
    async fn bootstrap(&self) -> QuarryResult<bool>;

    /// Stop the engine event loop. Idempotent.
    async fn shutdown(&self) -> QuarryResult<()>;
}
