//! The cluster consensus component.
//!
//! `Consensus` wraps the operation-log engine with the cluster-facing
//! envelope: commit retries, forwarding of mutations to the leader over the
//! typed RPC client, membership changes, the bootstrap sequence and the
//! ready signal. Replicas trust exactly the peers named in the initial
//! peerset; raft's membership protocol governs actual participation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use raft::prelude::Message;
use redb::Database;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{QuarryError, QuarryResult};

use super::config::{ClusterRaftConfig, INIT_PEER_ADDRESS_TTL};
use super::engine::OpLogEngine;
use super::raft_engine::RaftEngine;
use super::state::{ConsensusOp, MessageSink, OperationalStateMachine, RaftState};

/// RPC service name used when forwarding operations to the leader.
pub const CONSENSUS_SERVICE: &str = "Consensus";

/// Cluster network host: peer identity plus the address book.
#[async_trait]
pub trait Host: Send + Sync {
    fn id(&self) -> u64;

    /// Record a peer address with the given time-to-live.
    fn add_address(&self, peer: u64, addr: &str, ttl: Duration);

    async fn close(&self) -> QuarryResult<()>;
}

/// Typed RPC transport to cluster peers. Arguments and returns are
/// bincode-encoded by the caller.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(
        &self,
        peer: u64,
        service: &str,
        method: &str,
        params: Vec<u8>,
    ) -> QuarryResult<Vec<u8>>;
}

pub struct Consensus {
    config: ClusterRaftConfig,
    host: Arc<dyn Host>,
    engine: Arc<dyn OpLogEngine>,

    rpc: parking_lot::Mutex<Option<Arc<dyn RpcClient>>>,
    rpc_ready_tx: parking_lot::Mutex<Option<mpsc::Sender<()>>>,

    ready_rx: watch::Receiver<bool>,
    cancel_tx: watch::Sender<bool>,

    peer_set: Vec<u64>,
    shutdown: AtomicBool,

    outbound: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<(u64, Message)>>>,
    inbound_tx: mpsc::UnboundedSender<(u64, Message)>,
}

impl Consensus {
    /// Build a replica bound to the peerset in `config`. Peer addresses are
    /// seeded into the host's address book with a long TTL. The replica is
    /// not usable for commits until the bootstrap sequence signals ready;
    /// the RPC client must be installed (see [`Consensus::with_rpc_client`]
    /// or [`Consensus::set_rpc_client`]) for bootstrap to proceed.
    ///
    /// `database` is the store under the node's locked repository; the raft
    /// log and snapshots persist there.
    pub async fn new(
        host: Arc<dyn Host>,
        config: ClusterRaftConfig,
        mpool: Arc<dyn MessageSink>,
        database: Arc<Database>,
        staging: bool,
    ) -> QuarryResult<Arc<Self>> {
        config.validate()?;

        debug!("starting consensus and waiting for a leader");
        let state_machine = Arc::new(OperationalStateMachine::new(mpool));
        let (engine, outbound_rx) =
            RaftEngine::new(host.id(), database, &config, state_machine, staging).await?;
        let inbound_tx = engine.inbound_sender();

        Ok(Self::assemble(
            host,
            config,
            engine,
            Some(outbound_rx),
            inbound_tx,
        ))
    }

    /// Variant used by the node wiring: installs the RPC client right away
    /// so bootstrap can proceed without a separate call.
    pub async fn with_rpc_client(
        host: Arc<dyn Host>,
        config: ClusterRaftConfig,
        rpc: Arc<dyn RpcClient>,
        mpool: Arc<dyn MessageSink>,
        database: Arc<Database>,
        staging: bool,
    ) -> QuarryResult<Arc<Self>> {
        let cc = Self::new(host, config, mpool, database, staging).await?;
        cc.set_rpc_client(rpc);
        Ok(cc)
    }

    fn assemble(
        host: Arc<dyn Host>,
        config: ClusterRaftConfig,
        engine: Arc<dyn OpLogEngine>,
        outbound_rx: Option<mpsc::UnboundedReceiver<(u64, Message)>>,
        inbound_tx: mpsc::UnboundedSender<(u64, Message)>,
    ) -> Arc<Self> {
        let mut peer_set = Vec::new();
        for peer in &config.init_peerset {
            peer_set.push(peer.id);
            host.add_address(peer.id, &peer.addr, INIT_PEER_ADDRESS_TTL);
        }

        let (rpc_ready_tx, rpc_ready_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let cc = Arc::new(Self {
            config,
            host,
            engine,
            rpc: parking_lot::Mutex::new(None),
            rpc_ready_tx: parking_lot::Mutex::new(Some(rpc_ready_tx)),
            ready_rx,
            cancel_tx,
            peer_set,
            shutdown: AtomicBool::new(false),
            outbound: parking_lot::Mutex::new(outbound_rx),
            inbound_tx,
        });

        tokio::spawn(Self::finish_bootstrap(
            cc.engine.clone(),
            cc.config.clone(),
            ready_tx,
            rpc_ready_rx,
            cancel_rx,
        ));

        cc
    }

    /// Install the RPC client and unblock the bootstrap sequence.
    pub fn set_rpc_client(&self, rpc: Arc<dyn RpcClient>) {
        *self.rpc.lock() = Some(rpc);
        if let Some(tx) = self.rpc_ready_tx.lock().as_ref() {
            let _ = tx.try_send(());
        }
    }

    /// Drives the replica to ready: wait for RPC wiring, run the engine
    /// bootstrap (a no-op with persisted state or when staging), then sync.
    /// Any failure leaves the ready channel unsignaled; the component is
    /// then considered not ready rather than failed.
    async fn finish_bootstrap(
        engine: Arc<dyn OpLogEngine>,
        config: ClusterRaftConfig,
        ready_tx: watch::Sender<bool>,
        mut rpc_ready_rx: mpsc::Receiver<()>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        tokio::select! {
            _ = cancel_rx.changed() => return,
            maybe = rpc_ready_rx.recv() => {
                if maybe.is_none() {
                    return;
                }
            }
        }

        match engine.bootstrap().await {
            Ok(ran) => {
                if ran {
                    debug!("bootstrap finished");
                }
            }
            Err(e) => {
                error!(error = %e, "bootstrap failed");
                return;
            }
        }

        if let Err(e) = Self::sync_with_engine(engine.as_ref(), &config).await {
            warn!(error = %e, "consensus did not reach sync");
            return;
        }

        debug!("raft state is now up to date, consensus ready");
        let _ = ready_tx.send(true);
    }

    async fn sync_with_engine(
        engine: &dyn OpLogEngine,
        config: &ClusterRaftConfig,
    ) -> QuarryResult<()> {
        // Waiting until this replica is a voter guarantees the state is
        // reasonably caught up: the leader only promotes a staging server
        // once its log is close to the leader's.
        let step_timeout = config.wait_for_leader_timeout;
        engine.wait_for_leader(step_timeout).await?;
        engine.wait_for_voter(step_timeout).await?;
        engine.wait_for_updates(step_timeout).await?;
        Ok(())
    }

    /// Wait for a leader and for the local state to be caught up. Each step
    /// runs under its own timeout; the failing step is named in the error.
    pub async fn wait_for_sync(&self) -> QuarryResult<()> {
        Self::sync_with_engine(self.engine.as_ref(), &self.config).await
    }

    /// Channel that flips to `true` exactly once, when bootstrap completes.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    /// Commit an operation through the replicated log. The caller must be
    /// the leader; use [`Consensus::redirect_to_leader`] first when it may
    /// not be. Failed attempts are retried up to the configured count.
    pub async fn commit(&self, op: &ConsensusOp) -> QuarryResult<()> {
        let mut final_err = None;

        for attempt in 0..=self.config.commit_retries {
            if let Some(ref e) = final_err {
                error!(attempt, error = %e, "retrying upon failed commit");
            }

            match self.engine.commit_op(op.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => final_err = Some(e),
            }

            tokio::time::sleep(self.config.commit_retry_delay).await;
        }

        Err(final_err.unwrap_or_else(|| QuarryError::Internal {
            message: "commit failed with no recorded error".to_string(),
        }))
    }

    /// Forward `method(arg)` to the leader if this replica is not it.
    ///
    /// Returns `Ok(None)` when this replica is the leader (the caller
    /// commits locally), `Ok(Some(ret))` when the call was served by the
    /// leader. A leader-discovery timeout is terminal; RPC failures back off
    /// at twice the heartbeat interval and retry up to the commit retry
    /// count.
    pub async fn redirect_to_leader<A, R>(&self, method: &str, arg: &A) -> QuarryResult<Option<R>>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut final_err: Option<QuarryError> = None;

        for attempt in 0..=self.config.commit_retries {
            debug!(attempt, method, "redirect attempt");

            let leader = match self.engine.leader().await {
                Some(leader) => leader,
                None => {
                    warn!("there seems to be no leader, waiting for one");
                    // A timeout here is terminal, not retried.
                    self.engine
                        .wait_for_leader(self.config.wait_for_leader_timeout)
                        .await?
                }
            };

            if leader == self.host.id() {
                return Ok(None);
            }

            debug!(method, leader, "redirecting to leader");
            let rpc = self
                .rpc
                .lock()
                .clone()
                .ok_or_else(|| QuarryError::Internal {
                    message: "rpc client not configured".to_string(),
                })?;

            let params = bincode::serialize(arg)
                .map_err(|e| QuarryError::serialization("serialize rpc argument", e))?;

            match rpc.call(leader, CONSENSUS_SERVICE, method, params).await {
                Ok(ret) => {
                    let decoded = bincode::deserialize(&ret)
                        .map_err(|e| QuarryError::serialization("deserialize rpc return", e))?;
                    return Ok(Some(decoded));
                }
                Err(e) => {
                    error!(error = %e, "retrying to redirect request to leader");
                    final_err = Some(e);
                    tokio::time::sleep(2 * self.config.heartbeat_timeout).await;
                }
            }
        }

        Err(final_err.unwrap_or_else(|| QuarryError::Internal {
            message: "redirect failed with no recorded error".to_string(),
        }))
    }

    /// Add a peer to the consensus, forwarding to the leader when needed.
    pub async fn add_peer(&self, pid: u64) -> QuarryResult<()> {
        let mut final_err = None;

        for attempt in 0..=self.config.commit_retries {
            if let Some(ref e) = final_err {
                error!(attempt, error = %e, "retrying to add peer");
            }

            if let Some(()) = self.redirect_to_leader("AddPeer", &pid).await? {
                return Ok(());
            }

            match self.engine.add_peer(pid).await {
                Ok(()) => {
                    info!(peer = pid, "peer added to raft");
                    return Ok(());
                }
                Err(e) => final_err = Some(e),
            }

            tokio::time::sleep(self.config.commit_retry_delay).await;
        }

        Err(final_err.unwrap_or_else(|| QuarryError::Internal {
            message: "add peer failed with no recorded error".to_string(),
        }))
    }

    /// Remove a peer from the consensus, forwarding to the leader when
    /// needed.
    pub async fn rm_peer(&self, pid: u64) -> QuarryResult<()> {
        let mut final_err = None;

        for attempt in 0..=self.config.commit_retries {
            if let Some(ref e) = final_err {
                error!(attempt, error = %e, "retrying to remove peer");
            }

            if let Some(()) = self.redirect_to_leader("RmPeer", &pid).await? {
                return Ok(());
            }

            match self.engine.remove_peer(pid).await {
                Ok(()) => {
                    info!(peer = pid, "peer removed from raft");
                    return Ok(());
                }
                Err(e) => final_err = Some(e),
            }

            tokio::time::sleep(self.config.commit_retry_delay).await;
        }

        Err(final_err.unwrap_or_else(|| QuarryError::Internal {
            message: "remove peer failed with no recorded error".to_string(),
        }))
    }

    /// The last agreed operational state. Empty maps when the log has never
    /// been populated; never an error for an empty log.
    pub async fn state(&self) -> QuarryResult<RaftState> {
        self.engine.get_log_head().await
    }

    /// Current cluster leader. Errors when no leader is known.
    pub async fn leader(&self) -> QuarryResult<u64> {
        self.engine
            .leader()
            .await
            .ok_or_else(|| QuarryError::NotFound {
                resource: "cluster leader".to_string(),
            })
    }

    pub async fn is_leader(&self) -> bool {
        self.engine.leader().await == Some(self.host.id())
    }

    /// Sorted list of current consensus members.
    pub async fn peers(&self) -> QuarryResult<Vec<u64>> {
        self.engine.peers().await
    }

    /// In raft, trust is membership of the initial peerset.
    pub fn is_trusted_peer(&self, peer: u64) -> bool {
        self.peer_set.contains(&peer)
    }

    /// No-op: raft's membership protocol governs participation.
    pub fn trust(&self, _peer: u64) {}

    /// No-op: raft's membership protocol governs participation.
    pub fn distrust(&self, _peer: u64) {}

    /// Raft messages this replica needs delivered to peers, as
    /// `(destination, message)` pairs. The node's transport must drain this;
    /// it can be taken exactly once.
    pub fn outbound_messages(&self) -> Option<mpsc::UnboundedReceiver<(u64, Message)>> {
        self.outbound.lock().take()
    }

    /// Sender for raft messages arriving from peers.
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<(u64, Message)> {
        self.inbound_tx.clone()
    }

    /// Stop the component: the engine is shut down permanently, the host is
    /// closed when configured to, and the bootstrap task is cancelled.
    /// Idempotent.
    pub async fn shutdown(&self) -> QuarryResult<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            debug!("consensus already shut down");
            return Ok(());
        }

        info!("stopping consensus component");

        if let Err(e) = self.engine.shutdown().await {
            error!(error = %e, "raft engine shutdown failed");
        }

        if self.config.host_shutdown {
            if let Err(e) = self.host.close().await {
                error!(error = %e, "host close failed");
            }
        }

        let _ = self.cancel_tx.send(true);
        // Closing the rpc-ready channel wakes a bootstrap task still waiting
        // on RPC wiring.
        self.rpc_ready_tx.lock().take();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        host: Arc<dyn Host>,
        config: ClusterRaftConfig,
        engine: Arc<dyn OpLogEngine>,
    ) -> Arc<Self> {
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        Self::assemble(host, config, engine, None, inbound_tx)
    }
}
