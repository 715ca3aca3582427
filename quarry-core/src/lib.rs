//! Core of the quarry distributed sector-storage subsystem.
//!
//! Two tightly coupled halves live here:
//!
//! - `consensus` - a leader-based replicated log that serializes updates to
//!   the cluster's operational state (account nonces and signed-message
//!   bodies) and replays them into every replica's local message pool.
//! - `storage` + `worker` - the sector storage fabric (two-tier acquire with
//!   remote HTTP fetch) and the asynchronous sealing-task executor with a
//!   durable call tracker.
//!
//! External collaborators (the proof library, the cluster RPC transport, the
//! peer host, the node message pool and the sector index) are represented as
//! traits and injected by the embedding node.

pub mod error;
pub mod types;

pub mod consensus;
pub mod storage;
pub mod worker;

pub use error::{QuarryError, QuarryResult};
