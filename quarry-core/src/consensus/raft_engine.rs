//! raft-rs backed implementation of the operation-log engine.
//!
//! A single event-loop task owns the `RawNode` and multiplexes ticks,
//! commands (proposals, membership changes, campaign requests) and inbound
//! peer messages. Outbound raft messages are surfaced on a channel consumed
//! by the external transport. Leader, applied and membership changes are
//! published on a watch channel that backs the wait operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use raft::prelude::{ConfChange, ConfChangeType, Entry, EntryType, Message, RawNode};
use raft::{Config, GetEntriesContext, StateRole, Storage};
use redb::Database;
use slog::Logger;
use slog::{error, info, warn};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::interval;
use uuid::Uuid;

use crate::error::{QuarryError, QuarryResult};

use super::config::ClusterRaftConfig;
use super::engine::OpLogEngine;
use super::raft_log::{RaftLogStore, SnapshotRecord};
use super::state::{ConsensusOp, OperationalStateMachine, RaftState};

/// Compact the persisted log once it holds more than this many entries
/// behind the latest snapshot.
const LOG_COMPACT_THRESHOLD: u64 = 1024;

/// Point-in-time view of the engine published after every loop iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStatus {
    pub leader: Option<u64>,
    pub applied: u64,
    pub committed: u64,
    pub voters: Vec<u64>,
}

enum EngineCommand {
    Propose {
        op: ConsensusOp,
        reply: oneshot::Sender<QuarryResult<()>>,
    },
    ConfChange {
        peer: u64,
        change_type: ConfChangeType,
        reply: oneshot::Sender<QuarryResult<()>>,
    },
    Campaign {
        reply: oneshot::Sender<QuarryResult<()>>,
    },
}

pub struct RaftEngine {
    node_id: u64,
    staging: bool,
    /// No persisted raft state existed at construction; bootstrap may run.
    fresh_start: bool,

    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    inbound_tx: mpsc::UnboundedSender<(u64, Message)>,
    status_rx: watch::Receiver<EngineStatus>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,

    state_machine: Arc<OperationalStateMachine>,
}

impl RaftEngine {
    /// Build the engine and start its event loop. Returns the engine and the
    /// outbound message stream the transport must drain.
    pub async fn new(
        node_id: u64,
        database: Arc<Database>,
        config: &ClusterRaftConfig,
        state_machine: Arc<OperationalStateMachine>,
        staging: bool,
    ) -> QuarryResult<(Arc<Self>, mpsc::UnboundedReceiver<(u64, Message)>)> {
        let logger = super::utils::create_raft_logger(node_id);
        let store = RaftLogStore::new(database)?;

        let fresh_start = !store.has_persisted_state()?;
        if fresh_start && !staging {
            // Seed the initial voter set before the raft node reads its
            // initial state. With no configured peerset this is a single
            // node cluster.
            let mut cs = raft::prelude::ConfState::default();
            cs.voters = if config.init_peerset.is_empty() {
                vec![node_id]
            } else {
                config.init_peerset.iter().map(|p| p.id).collect()
            };
            store.save_conf_state(&cs)?;
        }

        let applied = Self::replay(&store, &state_machine, &logger).await?;

        let raft_config = Config {
            id: node_id,
            election_tick: 10,
            heartbeat_tick: 3,
            applied,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            ..Default::default()
        };
        raft_config
            .validate()
            .map_err(|e| QuarryError::raft("validate raft config", e))?;

        let node = RawNode::new(&raft_config, store.clone(), &logger)
            .map_err(|e| QuarryError::raft("create raft node", e))?;

        let voters = store.load_conf_state()?.voters;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(EngineStatus {
            leader: None,
            applied,
            committed: applied,
            voters: voters.clone(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let event_loop = EngineLoop {
            node,
            store,
            state_machine: state_machine.clone(),
            outbound: outbound_tx,
            pending: HashMap::new(),
            status_tx,
            voters,
            logger,
        };

        let tick_interval = config.tick_interval;
        let handle =
            tokio::spawn(event_loop.run(cmd_rx, inbound_rx, shutdown_rx, tick_interval));

        let engine = Arc::new(Self {
            node_id,
            staging,
            fresh_start,
            cmd_tx,
            inbound_tx,
            status_rx,
            shutdown_tx,
            loop_handle: Mutex::new(Some(handle)),
            state_machine,
        });

        Ok((engine, outbound_rx))
    }

    /// Rebuild the operational state from the persisted snapshot and the
    /// committed log suffix. Returns the applied index the raft node should
    /// resume from.
    async fn replay(
        store: &RaftLogStore,
        state_machine: &OperationalStateMachine,
        logger: &Logger,
    ) -> QuarryResult<u64> {
        let mut applied = 0u64;

        if let Some(record) = store.load_snapshot_record()? {
            if !record.data.is_empty() {
                state_machine.restore(&record.data).await?;
            }
            applied = record.index;
        }

        let commit = store
            .initial_state()
            .map_err(|e| QuarryError::raft("load initial state", e))?
            .hard_state
            .commit;

        if commit > applied {
            let entries = store
                .entries(applied + 1, commit + 1, None, GetEntriesContext::empty(false))
                .map_err(|e| QuarryError::raft("read committed log suffix", e))?;

            for entry in &entries {
                if entry.entry_type() == EntryType::EntryNormal && !entry.data.is_empty() {
                    let op: ConsensusOp = bincode::deserialize(&entry.data)
                        .map_err(|e| QuarryError::serialization("deserialize logged op", e))?;
                    state_machine.apply(&op).await?;
                }
                applied = entry.index;
            }

            info!(logger, "replayed committed log suffix";
                "entries" => entries.len(), "applied" => applied);
        }

        Ok(applied)
    }

    /// Sender for raft messages arriving from peers.
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<(u64, Message)> {
        self.inbound_tx.clone()
    }

    fn status(&self) -> EngineStatus {
        self.status_rx.borrow().clone()
    }

    async fn wait_status<F>(&self, step: &str, timeout: Duration, mut done: F) -> QuarryResult<()>
    where
        F: FnMut(&EngineStatus) -> bool,
    {
        let mut rx = self.status_rx.clone();
        let wait = async {
            loop {
                if done(&rx.borrow()) {
                    return Ok(());
                }
                rx.changed().await.map_err(|_| QuarryError::Internal {
                    message: "raft engine stopped".to_string(),
                })?;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(QuarryError::Timeout {
                operation: step.to_string(),
            }),
        }
    }

    async fn send_command(
        &self,
        cmd: EngineCommand,
        reply_rx: oneshot::Receiver<QuarryResult<()>>,
        operation: &str,
    ) -> QuarryResult<()> {
        self.cmd_tx.send(cmd).map_err(|_| QuarryError::Internal {
            message: "raft engine stopped".to_string(),
        })?;
        reply_rx.await.map_err(|_| QuarryError::Raft {
            operation: operation.to_string(),
            source: "engine dropped the reply channel".into(),
        })?
    }
}

#[async_trait]
impl OpLogEngine for RaftEngine {
    async fn commit_op(&self, op: ConsensusOp) -> QuarryResult<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_command(EngineCommand::Propose { op, reply }, reply_rx, "commit op")
            .await
    }

    async fn get_log_head(&self) -> QuarryResult<RaftState> {
        Ok(self.state_machine.head().await)
    }

    async fn leader(&self) -> Option<u64> {
        self.status().leader
    }

    async fn peers(&self) -> QuarryResult<Vec<u64>> {
        let mut voters = self.status().voters;
        voters.sort_unstable();
        Ok(voters)
    }

    async fn add_peer(&self, peer: u64) -> QuarryResult<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_command(
            EngineCommand::ConfChange {
                peer,
                change_type: ConfChangeType::AddNode,
                reply,
            },
            reply_rx,
            "add peer",
        )
        .await
    }

    async fn remove_peer(&self, peer: u64) -> QuarryResult<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send_command(
            EngineCommand::ConfChange {
                peer,
                change_type: ConfChangeType::RemoveNode,
                reply,
            },
            reply_rx,
            "remove peer",
        )
        .await
    }

    async fn wait_for_leader(&self, timeout: Duration) -> QuarryResult<u64> {
        self.wait_status("wait for leader", timeout, |s| s.leader.is_some())
            .await?;
        self.status().leader.ok_or_else(|| QuarryError::Timeout {
            operation: "wait for leader".to_string(),
        })
    }

    async fn wait_for_voter(&self, timeout: Duration) -> QuarryResult<()> {
        let node_id = self.node_id;
        self.wait_status("wait to become voter", timeout, move |s| {
            s.voters.contains(&node_id)
        })
        .await
    }

    async fn wait_for_updates(&self, timeout: Duration) -> QuarryResult<()> {
        self.wait_status("wait for consensus updates", timeout, |s| {
            s.applied >= s.committed
        })
        .await
    }

    async fn bootstrap(&self) -> QuarryResult<bool> {
        if !self.fresh_start || self.staging {
            return Ok(false);
        }

        let (reply, reply_rx) = oneshot::channel();
        self.send_command(EngineCommand::Campaign { reply }, reply_rx, "bootstrap")
            .await?;
        Ok(true)
    }

    async fn shutdown(&self) -> QuarryResult<()> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// State owned by the event-loop task.
struct EngineLoop {
    node: RawNode<RaftLogStore>,
    store: RaftLogStore,
    state_machine: Arc<OperationalStateMachine>,
    outbound: mpsc::UnboundedSender<(u64, Message)>,
    pending: HashMap<Vec<u8>, oneshot::Sender<QuarryResult<()>>>,
    status_tx: watch::Sender<EngineStatus>,
    voters: Vec<u64>,
    logger: Logger,
}

impl EngineLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
        mut inbound_rx: mpsc::UnboundedReceiver<(u64, Message)>,
        mut shutdown_rx: watch::Receiver<bool>,
        tick_interval: Duration,
    ) {
        let mut ticker = interval(tick_interval);
        info!(self.logger, "raft engine event loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.node.tick();
                }
                Some(cmd) = cmd_rx.recv() => {
                    self.handle_command(cmd);
                }
                Some((from, msg)) = inbound_rx.recv() => {
                    if let Err(e) = self.node.step(msg) {
                        warn!(self.logger, "failed to step raft message"; "from" => from, "error" => %e);
                    }
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }

            // Ready states can cascade (an apply may commit more entries),
            // so drain them before going back to sleep.
            while self.node.has_ready() {
                if let Err(e) = self.on_ready().await {
                    error!(self.logger, "processing raft ready state failed"; "error" => %e);
                    break;
                }
            }

            self.fail_pending_if_lost_leadership();
            self.publish_status();
        }

        // Leave nothing waiting on a reply that will never come.
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(QuarryError::Internal {
                message: "raft engine shut down".to_string(),
            }));
        }
        info!(self.logger, "raft engine event loop stopped");
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Propose { op, reply } => {
                if self.node.raft.state != StateRole::Leader {
                    let leader = self.current_leader();
                    let _ = reply.send(Err(QuarryError::NotLeader {
                        operation: "commit op".to_string(),
                        leader_id: leader,
                    }));
                    return;
                }

                let data = match bincode::serialize(&op) {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = reply.send(Err(QuarryError::serialization("serialize op", e)));
                        return;
                    }
                };

                let context = Uuid::new_v4().as_bytes().to_vec();
                self.pending.insert(context.clone(), reply);
                if let Err(e) = self.node.propose(context.clone(), data) {
                    if let Some(reply) = self.pending.remove(&context) {
                        let _ = reply.send(Err(QuarryError::raft("propose op", e)));
                    }
                }
            }
            EngineCommand::ConfChange {
                peer,
                change_type,
                reply,
            } => {
                if self.node.raft.state != StateRole::Leader {
                    let leader = self.current_leader();
                    let _ = reply.send(Err(QuarryError::NotLeader {
                        operation: "change membership".to_string(),
                        leader_id: leader,
                    }));
                    return;
                }

                let cc = ConfChange {
                    id: 0,
                    change_type: change_type.into(),
                    node_id: peer,
                    context: Vec::new(),
                };

                let context = Uuid::new_v4().as_bytes().to_vec();
                self.pending.insert(context.clone(), reply);
                if let Err(e) = self.node.propose_conf_change(context.clone(), cc) {
                    if let Some(reply) = self.pending.remove(&context) {
                        let _ = reply.send(Err(QuarryError::raft("propose conf change", e)));
                    }
                }
            }
            EngineCommand::Campaign { reply } => {
                let result = self
                    .node
                    .campaign()
                    .map_err(|e| QuarryError::raft("campaign", e));
                let _ = reply.send(result);
            }
        }
    }

    async fn on_ready(&mut self) -> QuarryResult<()> {
        if !self.node.has_ready() {
            return Ok(());
        }

        let mut ready = self.node.ready();

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            info!(self.logger, "installing snapshot";
                "index" => snapshot.get_metadata().index,
                "term" => snapshot.get_metadata().term);
            self.store.apply_snapshot(&snapshot)?;
            if !snapshot.data.is_empty() {
                self.state_machine.restore(&snapshot.data).await?;
            }
            self.voters = snapshot.get_metadata().get_conf_state().voters.clone();
        }

        if !ready.entries().is_empty() {
            self.store.append(ready.entries())?;
        }

        if let Some(hs) = ready.hs() {
            self.store.save_hard_state(hs)?;
        }

        for msg in ready.take_messages() {
            self.send_message(msg);
        }
        for msg in ready.take_persisted_messages() {
            self.send_message(msg);
        }

        let committed = ready.take_committed_entries();
        let mut last_applied = self.apply_committed(committed).await?;

        let mut light_rd = self.node.advance(ready);

        if let Some(commit) = light_rd.commit_index() {
            let mut hs = self.node.raft.hard_state();
            hs.set_commit(commit);
            self.store.save_hard_state(&hs)?;
        }
        for msg in light_rd.take_messages() {
            self.send_message(msg);
        }
        let light_applied = self
            .apply_committed(light_rd.take_committed_entries())
            .await?;
        if light_applied > last_applied {
            last_applied = light_applied;
        }

        if last_applied > 0 {
            self.node.advance_apply_to(last_applied);
            self.maybe_snapshot(last_applied).await?;
        }

        Ok(())
    }

    async fn apply_committed(&mut self, entries: Vec<Entry>) -> QuarryResult<u64> {
        let mut last_applied = 0u64;

        for entry in entries {
            last_applied = entry.index;

            match entry.entry_type() {
                EntryType::EntryNormal => {
                    if entry.data.is_empty() {
                        // Leader no-op entry established after elections.
                        continue;
                    }

                    let result = match bincode::deserialize::<ConsensusOp>(&entry.data) {
                        Ok(op) => self.state_machine.apply(&op).await,
                        Err(e) => Err(QuarryError::serialization("deserialize committed op", e)),
                    };

                    if let Err(ref e) = result {
                        error!(self.logger, "applying committed entry failed";
                            "index" => entry.index, "error" => %e);
                    }
                    self.respond(&entry.context, result);
                }
                EntryType::EntryConfChange => {
                    let mut cc = ConfChange::default();
                    if let Err(e) = protobuf::Message::merge_from_bytes(&mut cc, &entry.data) {
                        let err = QuarryError::Internal {
                            message: format!("decode conf change: {:?}", e),
                        };
                        error!(self.logger, "decoding conf change failed"; "error" => %err);
                        self.respond(&entry.context, Err(err));
                        continue;
                    }

                    let cs = self
                        .node
                        .apply_conf_change(&cc)
                        .map_err(|e| QuarryError::raft("apply conf change", e))?;
                    self.store.save_conf_state(&cs)?;
                    self.voters = cs.voters.clone();
                    info!(self.logger, "applied conf change";
                        "peer" => cc.node_id, "voters" => ?self.voters);
                    self.respond(&entry.context, Ok(()));
                }
                EntryType::EntryConfChangeV2 => {
                    warn!(self.logger, "ignoring unsupported conf change v2 entry";
                        "index" => entry.index);
                }
            }
        }

        Ok(last_applied)
    }

    /// Persist the operational state as the latest snapshot and drop the log
    /// prefix once it has grown past the compaction threshold.
    async fn maybe_snapshot(&mut self, applied: u64) -> QuarryResult<()> {
        let term = self
            .store
            .term(applied)
            .map_err(|e| QuarryError::raft("lookup applied term", e))?;
        let data = self.state_machine.snapshot().await?;

        self.store.save_snapshot(&SnapshotRecord {
            index: applied,
            term,
            voters: self.voters.clone(),
            learners: Vec::new(),
            data,
        })?;

        let first = self
            .store
            .first_index()
            .map_err(|e| QuarryError::raft("lookup first index", e))?;
        if applied > first && applied - first > LOG_COMPACT_THRESHOLD {
            self.store.compact(applied)?;
        }

        Ok(())
    }

    fn respond(&mut self, context: &[u8], result: QuarryResult<()>) {
        if context.is_empty() {
            return;
        }
        if let Some(reply) = self.pending.remove(context) {
            let _ = reply.send(result);
        }
    }

    fn send_message(&self, msg: Message) {
        let to = msg.to;
        if self.outbound.send((to, msg)).is_err() {
            warn!(self.logger, "outbound message channel closed"; "to" => to);
        }
    }

    fn current_leader(&self) -> Option<u64> {
        match self.node.raft.leader_id {
            0 => None,
            id => Some(id),
        }
    }

    /// A proposal only resolves once its entry commits; if leadership moved
    /// in the meantime the entry may never commit here, so fail the waiters
    /// and let the caller's retry envelope redirect.
    fn fail_pending_if_lost_leadership(&mut self) {
        if self.node.raft.state == StateRole::Leader || self.pending.is_empty() {
            return;
        }

        let leader = self.current_leader();
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(QuarryError::NotLeader {
                operation: "commit op".to_string(),
                leader_id: leader,
            }));
        }
    }

    fn publish_status(&self) {
        let status = EngineStatus {
            leader: self.current_leader(),
            applied: self.node.raft.raft_log.applied,
            committed: self.node.raft.raft_log.committed,
            voters: self.voters.clone(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::state::MessageSink;
    use crate::types::{Address, SignedMessage};
    use tempfile::TempDir;

    struct NullSink;

    #[async_trait]
    impl MessageSink for NullSink {
        async fn add(&self, _msg: &SignedMessage) -> QuarryResult<()> {
            Ok(())
        }
    }

    fn test_op(nonce: u64) -> ConsensusOp {
        ConsensusOp {
            addr: Address::new("t3abc"),
            nonce,
            uuid: Uuid::new_v4(),
            signed_msg: SignedMessage {
                data: vec![1, 2, 3],
            },
        }
    }

    async fn single_node_engine(
        dir: &TempDir,
    ) -> (Arc<RaftEngine>, mpsc::UnboundedReceiver<(u64, Message)>) {
        let db = Arc::new(Database::create(dir.path().join("raft.redb")).unwrap());
        let sm = Arc::new(OperationalStateMachine::new(Arc::new(NullSink)));
        let mut config = ClusterRaftConfig::default();
        config.tick_interval = Duration::from_millis(10);
        RaftEngine::new(1, db, &config, sm, false).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_node_commits_and_applies() {
        let dir = TempDir::new().unwrap();
        let (engine, _outbound) = single_node_engine(&dir).await;

        assert!(engine.bootstrap().await.unwrap());
        let leader = engine.wait_for_leader(Duration::from_secs(5)).await.unwrap();
        assert_eq!(leader, 1);

        let op = test_op(7);
        engine.commit_op(op.clone()).await.unwrap();

        let head = engine.get_log_head().await.unwrap();
        assert_eq!(head.nonce_map.get(&op.addr), Some(&7));
        assert_eq!(head.msg_uuids.get(&op.uuid), Some(&op.signed_msg));

        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let op = test_op(3);

        {
            let (engine, _outbound) = single_node_engine(&dir).await;
            engine.bootstrap().await.unwrap();
            engine.wait_for_leader(Duration::from_secs(5)).await.unwrap();
            engine.commit_op(op.clone()).await.unwrap();
            engine.shutdown().await.unwrap();
        }

        let (engine, _outbound) = single_node_engine(&dir).await;
        // Persisted state exists now, so bootstrap must be a no-op.
        assert!(!engine.bootstrap().await.unwrap());

        let head = engine.get_log_head().await.unwrap();
        assert_eq!(head.nonce_map.get(&op.addr), Some(&3));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_for_leader_times_out_without_quorum() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::create(dir.path().join("raft.redb")).unwrap());
        let sm = Arc::new(OperationalStateMachine::new(Arc::new(NullSink)));
        let mut config = ClusterRaftConfig::default();
        config.tick_interval = Duration::from_millis(10);
        config.init_peerset = vec![
            super::super::config::PeerInfo {
                id: 1,
                addr: "10.0.0.1:7000".into(),
            },
            super::super::config::PeerInfo {
                id: 2,
                addr: "10.0.0.2:7000".into(),
            },
            super::super::config::PeerInfo {
                id: 3,
                addr: "10.0.0.3:7000".into(),
            },
        ];

        let (engine, _outbound) = RaftEngine::new(1, db, &config, sm, false).await.unwrap();

        // Alone in a three-voter cluster there is no quorum, so no leader.
        let err = engine
            .wait_for_leader(Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, QuarryError::Timeout { .. }));

        engine.shutdown().await.unwrap();
    }
}
