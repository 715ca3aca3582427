//! Replicated operational state for the mining cluster.
//!
//! A leader-based replicated log serializes updates to the cluster's
//! operational state: the per-address nonce map and the signed-message map.
//! Committed operations are applied on every replica and side-effected into
//! the replica's local message pool, so any replica can answer message
//! queries after a leader failover.
//!
//! The module is organized like the rest of the consensus stack:
//!
//! - `core` - the `Consensus` component: commit retries, leader forwarding,
//!   bootstrap sequencing and membership changes
//! - `state` - the operational state machine applied by the log
//! - `engine` - the `OpLogEngine` capability the component drives
//! - `raft_engine` - the raft-rs backed engine implementation
//! - `raft_log` - redb persistence for the raft log and metadata
//! - `config` - cluster consensus configuration

pub mod config;
pub mod core;
pub mod engine;
pub mod raft_engine;
pub mod raft_log;
pub mod state;

pub use self::config::ClusterRaftConfig;
pub use self::core::{Consensus, Host, RpcClient};
pub use self::engine::OpLogEngine;
pub use self::raft_engine::RaftEngine;
pub use self::state::{ConsensusOp, MessageSink, OperationalStateMachine, RaftState};

// Internal utilities shared across the consensus modules
pub(crate) mod utils {
    use slog::{o, Drain, Logger};

    /// Create the slog logger handed to the raft-rs engine.
    pub fn create_raft_logger(node_id: u64) -> Logger {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, o!("node_id" => node_id, "module" => "raft"))
    }
}
