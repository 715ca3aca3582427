//! The operational state machine driven by the replicated log.
//!
//! Replicas apply committed [`ConsensusOp`] entries in log order. The
//! replicated value is the pair of maps in [`RaftState`]; the message pool is
//! a local side-effect sink that is injected at replica start, re-bound after
//! a restart and never serialized into snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::error::{QuarryError, QuarryResult};
use crate::types::{Address, SignedMessage};

/// One replicated mutation of the operational state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusOp {
    pub addr: Address,
    pub nonce: u64,
    pub uuid: Uuid,
    pub signed_msg: SignedMessage,
}

/// The replicated operational state: the last nonce used per address and the
/// signed message body per message UUID.
///
/// Miners check whether a message has landed on chain by UUID after a leader
/// failover; the signed body must therefore be present in every replica's
/// message pool, which is why applying an op also inserts into the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftState {
    pub nonce_map: HashMap<Address, u64>,
    pub msg_uuids: HashMap<Uuid, SignedMessage>,
}

/// Local message pool as seen by the state machine. Insertion must be
/// idempotent: replicas may re-apply entries after snapshot installs.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn add(&self, msg: &SignedMessage) -> QuarryResult<()>;
}

/// Applies committed operations to the replicated maps and side-effects each
/// signed message into the local pool.
pub struct OperationalStateMachine {
    state: RwLock<RaftState>,
    mpool: Arc<dyn MessageSink>,
}

impl OperationalStateMachine {
    pub fn new(mpool: Arc<dyn MessageSink>) -> Self {
        Self {
            state: RwLock::new(RaftState::default()),
            mpool,
        }
    }

    /// Apply one committed operation. The map updates are deterministic and
    /// total; a pool failure is logged but does not fail the apply, since the
    /// replicated value must advance identically on every replica.
    pub async fn apply(&self, op: &ConsensusOp) -> QuarryResult<()> {
        {
            let mut state = self.state.write().await;
            state.nonce_map.insert(op.addr.clone(), op.nonce);
            state.msg_uuids.insert(op.uuid, op.signed_msg.clone());
        }

        if let Err(e) = self.mpool.add(&op.signed_msg).await {
            warn!(uuid = %op.uuid, error = %e, "adding replicated message to local pool failed");
        }

        Ok(())
    }

    /// Snapshot of the last agreed state. Empty maps when nothing has been
    /// applied yet.
    pub async fn head(&self) -> RaftState {
        self.state.read().await.clone()
    }

    /// Serialize the replicated value for a raft snapshot. The pool sink is
    /// not part of the value and is excluded.
    pub async fn snapshot(&self) -> QuarryResult<Vec<u8>> {
        let state = self.state.read().await;
        bincode::serialize(&*state)
            .map_err(|e| QuarryError::serialization("serialize operational state", e))
    }

    /// Replace the replicated value from a snapshot.
    pub async fn restore(&self, data: &[u8]) -> QuarryResult<()> {
        let restored: RaftState = bincode::deserialize(data)
            .map_err(|e| QuarryError::serialization("deserialize operational state", e))?;
        *self.state.write().await = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        added: Mutex<Vec<SignedMessage>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                added: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn add(&self, msg: &SignedMessage) -> QuarryResult<()> {
            self.added.lock().unwrap().push(msg.clone());
            Ok(())
        }
    }

    fn op(addr: &str, nonce: u64) -> ConsensusOp {
        ConsensusOp {
            addr: Address::new(addr),
            nonce,
            uuid: Uuid::new_v4(),
            signed_msg: SignedMessage {
                data: format!("{}:{}", addr, nonce).into_bytes(),
            },
        }
    }

    #[tokio::test]
    async fn apply_updates_both_maps_and_pool() {
        let sink = RecordingSink::new();
        let sm = OperationalStateMachine::new(sink.clone());

        let op1 = op("t3abc", 7);
        sm.apply(&op1).await.unwrap();

        let head = sm.head().await;
        assert_eq!(head.nonce_map.get(&op1.addr), Some(&7));
        assert_eq!(head.msg_uuids.get(&op1.uuid), Some(&op1.signed_msg));
        assert_eq!(sink.added.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn later_nonce_overwrites_earlier() {
        let sm = OperationalStateMachine::new(RecordingSink::new());
        sm.apply(&op("t3abc", 3)).await.unwrap();
        sm.apply(&op("t3abc", 4)).await.unwrap();
        assert_eq!(
            sm.head().await.nonce_map.get(&Address::new("t3abc")),
            Some(&4)
        );
    }

    #[tokio::test]
    async fn snapshot_round_trips_without_the_sink() {
        let sink_a = RecordingSink::new();
        let sm_a = OperationalStateMachine::new(sink_a);
        sm_a.apply(&op("t3abc", 1)).await.unwrap();
        sm_a.apply(&op("t3def", 9)).await.unwrap();

        let snap = sm_a.snapshot().await.unwrap();

        // Restore into a machine bound to a different pool; the replicated
        // value must match exactly, and the new pool sees no replayed adds.
        let sink_b = RecordingSink::new();
        let sm_b = OperationalStateMachine::new(sink_b.clone());
        sm_b.restore(&snap).await.unwrap();

        assert_eq!(sm_a.head().await, sm_b.head().await);
        assert!(sink_b.added.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_state_before_any_apply() {
        let sm = OperationalStateMachine::new(RecordingSink::new());
        let head = sm.head().await;
        assert!(head.nonce_map.is_empty());
        assert!(head.msg_uuids.is_empty());
    }
}
