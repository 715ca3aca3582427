//! The local sealing worker.
//!
//! Every sealing call returns a [`CallId`] immediately and runs its work in
//! a background task. Results are persisted in the durable call tracker and
//! delivered to the manager through the typed return path; calls in flight
//! when the process dies are reported as restart failures on the next start.
//!
//! The memory-heavy stages (PreCommit1, PreCommit2, Commit2) are strictly
//! serialized per worker; Commit1 may overlap up to its fixed cap.

pub mod call_tracker;
pub mod returns;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::future::Future;

use async_trait::async_trait;
use redb::Database;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{CallError, CallErrorCode, QuarryError, QuarryResult};
use crate::storage::{LocalStorage, SectorIndex, Store, StoragePath};
use crate::types::{
    AcquireMode, CallId, InteractiveSealRandomness, PathType, PieceInfo, PieceRange,
    RegisteredSealProof, SealRandomness, SectorFileType, SectorId, SectorPaths, SectorRef,
    TaskType, UnpaddedPieceSize, WorkerInfo, WorkerResources, CLOSED_WORKER_ID,
};

pub use call_tracker::{CallRecord, CallTracker};
pub use returns::{do_return, ReturnType, TaskOutput, WorkerReturn};

const PIECE_TEMPLATE_FILE: &str = "staged-file";
const PIECE_TEMPLATE_INFO: &str = "piece-info.json";
const CACHE_CLEAR_BUFFER: usize = 16;

/// Piece payload streamed into AddPiece.
pub type PieceData = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Byte offset into the unpadded payload of a sector.
pub type UnpaddedByteIndex = u64;

/// The proof library seam. Implementations wrap the sealing FFI; everything
/// here may block for a long time and must honor the worker-scoped context.
#[async_trait]
pub trait SealProvider: Send + Sync {
    async fn new_sector(&self, ctx: &WorkerCtx, sector: SectorRef) -> QuarryResult<()>;

    async fn add_piece(
        &self,
        ctx: &WorkerCtx,
        sector: SectorRef,
        existing_piece_sizes: Vec<UnpaddedPieceSize>,
        piece_size: UnpaddedPieceSize,
        data: PieceData,
    ) -> QuarryResult<PieceInfo>;

    async fn seal_pre_commit1(
        &self,
        ctx: &WorkerCtx,
        sector: SectorRef,
        ticket: SealRandomness,
        pieces: Vec<PieceInfo>,
    ) -> QuarryResult<crate::types::PreCommit1Out>;

    async fn seal_pre_commit2(
        &self,
        ctx: &WorkerCtx,
        sector: SectorRef,
        phase1_out: crate::types::PreCommit1Out,
    ) -> QuarryResult<crate::types::SectorCids>;

    async fn seal_commit1(
        &self,
        ctx: &WorkerCtx,
        sector: SectorRef,
        ticket: SealRandomness,
        seed: InteractiveSealRandomness,
        pieces: Vec<PieceInfo>,
        cids: crate::types::SectorCids,
    ) -> QuarryResult<crate::types::Commit1Out>;

    async fn seal_commit2(
        &self,
        ctx: &WorkerCtx,
        sector: SectorRef,
        phase1_out: crate::types::Commit1Out,
    ) -> QuarryResult<crate::types::Proof>;

    /// Finalize also honors the `keep_unsealed` retention ranges; the worker
    /// performs no additional unsealed cleanup.
    async fn finalize_sector(
        &self,
        ctx: &WorkerCtx,
        sector: SectorRef,
        keep_unsealed: Vec<PieceRange>,
    ) -> QuarryResult<()>;

    async fn unseal_piece(
        &self,
        ctx: &WorkerCtx,
        sector: SectorRef,
        offset: UnpaddedByteIndex,
        size: UnpaddedPieceSize,
        randomness: SealRandomness,
        piece_cid: String,
    ) -> QuarryResult<()>;

    /// Drop the proof cache for a sealed sector. Invoked from the worker's
    /// deferred cache-clear queue after Commit1.
    fn clear_cache(&self, sector_size: u64, cache_path: &str) -> QuarryResult<()>;

    /// Synthetic PreCommit1 against the magic `hpalloc` paths, forcing the
    /// proof library to reserve hugepages. The library reports success for
    /// this call as an error whose message is literally `ok`
    /// (`QuarryError::Internal { message: "ok" }`).
    async fn hugepage_warmup(&self, proof: RegisteredSealProof) -> QuarryResult<()>;
}

/// Builds a proof provider per call, so tests and exotic deployments can
/// substitute implementations.
pub type ExecutorFactory = Arc<dyn Fn() -> QuarryResult<Arc<dyn SealProvider>> + Send + Sync>;

/// Task-scoped context: carries the worker's shutdown signal. A task
/// survives its caller disconnecting; only worker shutdown cancels it.
#[derive(Clone)]
pub struct WorkerCtx {
    closing: watch::Receiver<bool>,
}

impl WorkerCtx {
    /// Resolves when the worker shuts down.
    pub async fn closed(&self) {
        let mut rx = self.closing.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closing.borrow()
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub task_types: Vec<TaskType>,
    pub no_swap: bool,
    /// Advertise the worker to the scheduler regardless of its current
    /// resource usage. Used in testing setups.
    pub ignore_resource_filtering: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerExtParams {
    pub piece_template_dir: Option<PathBuf>,
    /// Largest sector size the AddPiece template fast path applies to.
    pub piece_template_size: u64,
    pub group_id: String,
    pub role: String,
}

struct TaskState {
    accept: HashSet<TaskType>,
    running: HashMap<TaskType, usize>,
}

/// Counts live background tasks for `wait_quiet`.
struct RunningTasks {
    tx: watch::Sender<usize>,
}

impl RunningTasks {
    fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    fn enter(&self) -> RunningGuard {
        self.tx.send_modify(|count| *count += 1);
        RunningGuard {
            tx: self.tx.clone(),
        }
    }

    async fn wait_quiet(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct RunningGuard {
    tx: watch::Sender<usize>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.tx.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Decrements the per-stage running counter on every exit path.
struct StageGuard {
    worker: Arc<LocalWorker>,
    task: TaskType,
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        self.worker.counter_task(self.task, -1);
    }
}

pub struct LocalWorker {
    storage: Arc<dyn Store>,
    local_store: Arc<dyn LocalStorage>,
    sector_index: Arc<dyn SectorIndex>,
    ret: Arc<dyn WorkerReturn>,
    executor: ExecutorFactory,
    ct: CallTracker,

    group_id: String,
    no_swap: bool,
    ignore_resources: bool,
    piece_template_dir: Option<PathBuf>,
    piece_template_size: u64,

    task_state: parking_lot::Mutex<TaskState>,
    running: RunningTasks,

    session: Uuid,
    test_disable: AtomicBool,
    closing_tx: watch::Sender<bool>,
    closing_rx: watch::Receiver<bool>,

    cache_clear_tx: parking_lot::Mutex<Option<mpsc::Sender<(String, u64)>>>,

    p1_lock: tokio::sync::Mutex<()>,
    p2_lock: tokio::sync::Mutex<()>,
    c2_lock: tokio::sync::Mutex<()>,
}

impl LocalWorker {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        config: WorkerConfig,
        ext: WorkerExtParams,
        storage: Arc<dyn Store>,
        local_store: Arc<dyn LocalStorage>,
        sector_index: Arc<dyn SectorIndex>,
        ret: Arc<dyn WorkerReturn>,
        database: Arc<Database>,
        executor: ExecutorFactory,
    ) -> QuarryResult<Arc<Self>> {
        info!(group = %ext.group_id, role = %ext.role, tasks = ?config.task_types,
            "starting local worker");

        let ct = CallTracker::new(database)?;
        let (closing_tx, closing_rx) = watch::channel(false);
        let (cache_clear_tx, cache_clear_rx) = mpsc::channel(CACHE_CLEAR_BUFFER);

        let worker = Arc::new(Self {
            storage,
            local_store,
            sector_index,
            ret,
            executor,
            ct,
            group_id: ext.group_id.clone(),
            no_swap: config.no_swap,
            ignore_resources: config.ignore_resource_filtering,
            piece_template_dir: ext.piece_template_dir.clone(),
            piece_template_size: ext.piece_template_size,
            task_state: parking_lot::Mutex::new(TaskState {
                accept: config.task_types.into_iter().collect(),
                running: HashMap::new(),
            }),
            running: RunningTasks::new(),
            session: Uuid::new_v4(),
            test_disable: AtomicBool::new(false),
            closing_tx,
            closing_rx,
            cache_clear_tx: parking_lot::Mutex::new(Some(cache_clear_tx)),
            p1_lock: tokio::sync::Mutex::new(()),
            p2_lock: tokio::sync::Mutex::new(()),
            c2_lock: tokio::sync::Mutex::new(()),
        });

        worker.spawn_restart_replay();
        worker.spawn_cache_clear_drain(cache_clear_rx);

        if ext.role == "P1" {
            worker.hugepage_warmup().await?;
        }

        Ok(worker)
    }

    /// Re-deliver every call that never completed its return. Calls that
    /// finished before the crash go out with their stored result; the rest
    /// become restart failures the manager can reschedule.
    fn spawn_restart_replay(self: &Arc<Self>) {
        let worker = self.clone();
        let unfinished = match worker.ct.unfinished() {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "reading unfinished calls failed");
                return;
            }
        };

        if unfinished.is_empty() {
            return;
        }

        let ctx = worker.ctx();
        tokio::spawn(async move {
            for record in unfinished {
                let (output, err) = match (record.done, record.result) {
                    (true, Some(output)) => (output, None),
                    _ => (
                        TaskOutput::None,
                        Some(CallError::new(
                            CallErrorCode::TempWorkerRestart,
                            "worker restarted",
                        )),
                    ),
                };

                if do_return(
                    &ctx,
                    record.return_type,
                    record.id,
                    worker.ret.as_ref(),
                    &output,
                    err,
                )
                .await
                {
                    if let Err(e) = worker.ct.on_returned(record.id) {
                        error!(call = %record.id, error = %e,
                            "marking replayed call as returned failed");
                    }
                }
            }
        });
    }

    /// Single drain task for deferred FFI cache clears queued after Commit1.
    fn spawn_cache_clear_drain(self: &Arc<Self>, mut rx: mpsc::Receiver<(String, u64)>) {
        let worker = self.clone();
        let ctx = worker.ctx();
        tokio::spawn(async move {
            loop {
                let (cache, size) = tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(item) => item,
                        None => break,
                    },
                    _ = ctx.closed() => break,
                };

                info!(cache = %cache, "clearing sealing cache");
                match (worker.executor)() {
                    Ok(provider) => {
                        if let Err(e) = provider.clear_cache(size, &cache) {
                            warn!(cache = %cache, error = %e,
                                "cache clear failed, cache may already be removed");
                        }
                    }
                    Err(e) => warn!(error = %e, "building provider for cache clear failed"),
                }
            }
            debug!("cache clear queue drained");
        });
    }

    /// Queue a cache path for deferred clearing. Safe to call during
    /// shutdown; a closed queue drops the request.
    pub fn clear_local_cache(&self, cache: String, size: u64) {
        let guard = self.cache_clear_tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                if let Err(e) = tx.try_send((cache, size)) {
                    let (cache, _) = e.into_inner();
                    warn!(cache = %cache, "cache clear queue full or closed, dropping request");
                }
            }
            None => {
                info!(cache = %cache, "cache clear requested after close");
            }
        }
    }

    async fn hugepage_warmup(&self) -> QuarryResult<()> {
        let proof = if std::env::var("SECTOR_TYPE").as_deref() == Ok("32GB") {
            RegisteredSealProof::StackedDrg32GiBV1
        } else {
            RegisteredSealProof::StackedDrg64GiBV1
        };

        info!(?proof, "P1 role: allocating hugepages");
        let provider = (self.executor)()?;
        match provider.hugepage_warmup(proof).await {
            Ok(()) => Ok(()),
            // The proof library signals warm-up success as an error reading
            // literally "ok".
            Err(QuarryError::Internal { ref message }) if message == "ok" => Ok(()),
            Err(e) => {
                error!(error = %e, "hugepage allocation failed");
                Err(e)
            }
        }
    }

    fn ctx(&self) -> WorkerCtx {
        WorkerCtx {
            closing: self.closing_rx.clone(),
        }
    }

    fn counter_task(&self, task: TaskType, delta: i64) {
        let mut state = self.task_state.lock();
        let count = state.running.entry(task).or_insert(0);
        if delta >= 0 {
            *count += delta as usize;
        } else {
            *count = count.saturating_sub((-delta) as usize);
        }
    }

    fn counter_enter(self: &Arc<Self>, task: TaskType) -> StageGuard {
        self.counter_task(task, 1);
        StageGuard {
            worker: self.clone(),
            task,
        }
    }

    /// Register the call, then run `work` in a background task and deliver
    /// its outcome. Returns the call id immediately.
    fn async_call<F, Fut>(
        self: &Arc<Self>,
        sector: SectorRef,
        return_type: ReturnType,
        work: F,
    ) -> QuarryResult<CallId>
    where
        F: FnOnce(WorkerCtx, CallId) -> Fut + Send + 'static,
        Fut: Future<Output = QuarryResult<TaskOutput>> + Send + 'static,
    {
        let call = CallId::new(sector.id);

        if let Err(e) = self.ct.on_start(call, return_type) {
            error!(call = %call, error = %e, "tracking call start failed");
        }

        let running = self.running.enter();
        let worker = self.clone();

        tokio::spawn(async move {
            let _running = running;
            let ctx = worker.ctx();

            let (output, err) = match work(ctx.clone(), call).await {
                Ok(output) => (output, None),
                Err(e) => (TaskOutput::None, Some(CallError::from_error(&e))),
            };

            let stored = if err.is_none() {
                Some(output.clone())
            } else {
                None
            };
            if let Err(e) = worker.ct.on_done(call, stored) {
                error!(call = %call, error = %e, "tracking call completion failed");
            }

            if do_return(&ctx, return_type, call, worker.ret.as_ref(), &output, err).await {
                if let Err(e) = worker.ct.on_returned(call) {
                    error!(call = %call, error = %e, "tracking call return failed");
                }
            }
        });

        Ok(call)
    }

    pub async fn new_sector(&self, sector: SectorRef) -> QuarryResult<()> {
        let provider = (self.executor)()?;
        provider.new_sector(&self.ctx(), sector).await
    }

    pub fn add_piece(
        self: &Arc<Self>,
        sector: SectorRef,
        existing_piece_sizes: Vec<UnpaddedPieceSize>,
        piece_size: UnpaddedPieceSize,
        data: PieceData,
    ) -> QuarryResult<CallId> {
        let provider = (self.executor)()?;

        let sector_size = sector.proof_type.sector_size();
        let has_template = self.has_piece_template();
        debug!(sector_size, has_template, template_limit = self.piece_template_size,
            "add piece");

        if has_template && sector_size <= self.piece_template_size {
            let worker = self.clone();
            return self.async_call(sector, ReturnType::AddPiece, move |_ctx, _call| async move {
                let piece = worker.load_piece_template(sector).await?;
                Ok(TaskOutput::Piece(piece))
            });
        }

        self.async_call(sector, ReturnType::AddPiece, move |ctx, _call| async move {
            let piece = provider
                .add_piece(&ctx, sector, existing_piece_sizes, piece_size, data)
                .await?;
            Ok(TaskOutput::Piece(piece))
        })
    }

    fn has_piece_template(&self) -> bool {
        let Some(dir) = self.piece_template_dir.as_ref() else {
            return false;
        };
        dir.join(PIECE_TEMPLATE_FILE).exists() && dir.join(PIECE_TEMPLATE_INFO).exists()
    }

    /// Template fast path: symlink the pre-staged piece into the unsealed
    /// slot and return the decoded piece info without touching the proof
    /// library.
    async fn load_piece_template(self: &Arc<Self>, sector: SectorRef) -> QuarryResult<PieceInfo> {
        debug!(sector = %sector.id, "loading piece template");

        let dir = self
            .piece_template_dir
            .clone()
            .ok_or_else(|| QuarryError::Internal {
                message: "piece template directory not configured".to_string(),
            })?;

        let provider = WorkerPathProvider {
            worker: self.clone(),
            op: AcquireMode::Copy,
        };
        let (paths, acquired) = provider
            .acquire_sector(
                sector,
                SectorFileType::empty(),
                SectorFileType::UNSEALED,
                PathType::Sealing,
            )
            .await?;

        let unsealed = paths
            .get(SectorFileType::UNSEALED)
            .ok_or_else(|| QuarryError::Internal {
                message: "no unsealed path allocated for template".to_string(),
            })?;

        if let Some(parent) = unsealed.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::symlink(dir.join(PIECE_TEMPLATE_FILE), unsealed).await?;

        let info_bytes = tokio::fs::read(dir.join(PIECE_TEMPLATE_INFO)).await?;
        let piece: PieceInfo = serde_json::from_slice(&info_bytes)
            .map_err(|e| QuarryError::serialization("decode piece template info", e))?;

        acquired.declare(sector.id).await;
        debug!(sector = %sector.id, "piece template loaded");
        Ok(piece)
    }

    pub fn fetch(
        self: &Arc<Self>,
        sector: SectorRef,
        file_type: SectorFileType,
        path_type: PathType,
        mode: AcquireMode,
    ) -> QuarryResult<CallId> {
        let worker = self.clone();
        self.async_call(sector, ReturnType::Fetch, move |_ctx, _call| async move {
            let provider = WorkerPathProvider {
                worker: worker.clone(),
                op: mode,
            };
            let (_paths, acquired) = provider
                .acquire_sector(sector, file_type, SectorFileType::empty(), path_type)
                .await?;
            acquired.declare(sector.id).await;
            Ok(TaskOutput::None)
        })
    }

    pub fn seal_pre_commit1(
        self: &Arc<Self>,
        sector: SectorRef,
        ticket: SealRandomness,
        pieces: Vec<PieceInfo>,
    ) -> QuarryResult<CallId> {
        let worker = self.clone();
        self.async_call(
            sector,
            ReturnType::SealPreCommit1,
            move |ctx, _call| async move {
                // Retries after a failed P1 must start from clean sealed and
                // cache slots.
                worker
                    .storage
                    .remove(sector.id, SectorFileType::SEALED, true)
                    .await
                    .map_err(|e| QuarryError::Storage {
                        operation: "cleaning up sealed data".to_string(),
                        source: Box::new(e),
                    })?;
                worker
                    .storage
                    .remove(sector.id, SectorFileType::CACHE, true)
                    .await
                    .map_err(|e| QuarryError::Storage {
                        operation: "cleaning up cache data".to_string(),
                        source: Box::new(e),
                    })?;

                let provider = (worker.executor)()?;

                let _stage = worker.p1_lock.lock().await;
                let _count = worker.counter_enter(TaskType::PreCommit1);

                let out = provider
                    .seal_pre_commit1(&ctx, sector, ticket, pieces)
                    .await?;
                Ok(TaskOutput::PreCommit1(out))
            },
        )
    }

    pub fn seal_pre_commit2(
        self: &Arc<Self>,
        sector: SectorRef,
        phase1_out: crate::types::PreCommit1Out,
    ) -> QuarryResult<CallId> {
        let provider = (self.executor)()?;
        let worker = self.clone();
        self.async_call(
            sector,
            ReturnType::SealPreCommit2,
            move |ctx, _call| async move {
                let _stage = worker.p2_lock.lock().await;
                let _count = worker.counter_enter(TaskType::PreCommit2);

                let cids = provider.seal_pre_commit2(&ctx, sector, phase1_out).await?;
                Ok(TaskOutput::PreCommit2(cids))
            },
        )
    }

    pub fn seal_commit1(
        self: &Arc<Self>,
        sector: SectorRef,
        ticket: SealRandomness,
        seed: InteractiveSealRandomness,
        pieces: Vec<PieceInfo>,
        cids: crate::types::SectorCids,
    ) -> QuarryResult<CallId> {
        let provider = (self.executor)()?;
        let worker = self.clone();
        self.async_call(
            sector,
            ReturnType::SealCommit1,
            move |ctx, _call| async move {
                // No stage lock: Commit1 may overlap up to its cap, which the
                // running counter alone enforces.
                let _count = worker.counter_enter(TaskType::Commit1);

                let out = provider
                    .seal_commit1(&ctx, sector, ticket, seed, pieces, cids)
                    .await?;
                Ok(TaskOutput::Commit1(out))
            },
        )
    }

    pub fn seal_commit2(
        self: &Arc<Self>,
        sector: SectorRef,
        phase1_out: crate::types::Commit1Out,
    ) -> QuarryResult<CallId> {
        let provider = (self.executor)()?;
        let worker = self.clone();
        self.async_call(
            sector,
            ReturnType::SealCommit2,
            move |ctx, _call| async move {
                let _stage = worker.c2_lock.lock().await;
                let _count = worker.counter_enter(TaskType::Commit2);

                let proof = provider.seal_commit2(&ctx, sector, phase1_out).await?;
                Ok(TaskOutput::Commit2(proof))
            },
        )
    }

    pub fn finalize_sector(
        self: &Arc<Self>,
        sector: SectorRef,
        keep_unsealed: Vec<PieceRange>,
    ) -> QuarryResult<CallId> {
        let provider = (self.executor)()?;
        let worker = self.clone();
        self.async_call(
            sector,
            ReturnType::FinalizeSector,
            move |ctx, _call| async move {
                provider
                    .finalize_sector(&ctx, sector, keep_unsealed)
                    .await
                    .map_err(|e| QuarryError::Storage {
                        operation: "finalizing sector".to_string(),
                        source: Box::new(e),
                    })?;

                // Finalized sectors move to long-term storage right away.
                worker
                    .storage
                    .move_storage(sector, SectorFileType::CACHE | SectorFileType::SEALED)
                    .await?;
                Ok(TaskOutput::None)
            },
        )
    }

    pub fn release_unsealed(
        self: &Arc<Self>,
        _sector: SectorRef,
        _safe_to_free: Vec<PieceRange>,
    ) -> QuarryResult<CallId> {
        Err(QuarryError::NotImplemented {
            feature: "release unsealed".to_string(),
        })
    }

    pub fn move_storage(
        self: &Arc<Self>,
        sector: SectorRef,
        types: SectorFileType,
    ) -> QuarryResult<CallId> {
        let worker = self.clone();
        self.async_call(
            sector,
            ReturnType::MoveStorage,
            move |_ctx, _call| async move {
                worker.storage.move_storage(sector, types).await?;
                Ok(TaskOutput::None)
            },
        )
    }

    pub fn unseal_piece(
        self: &Arc<Self>,
        sector: SectorRef,
        offset: UnpaddedByteIndex,
        size: UnpaddedPieceSize,
        randomness: SealRandomness,
        piece_cid: String,
    ) -> QuarryResult<CallId> {
        let provider = (self.executor)()?;
        let worker = self.clone();
        self.async_call(
            sector,
            ReturnType::UnsealPiece,
            move |ctx, _call| async move {
                debug!(sector = %sector.id, "unsealing piece");
                provider
                    .unseal_piece(&ctx, sector, offset, size, randomness, piece_cid)
                    .await?;

                // Reclaim fast-tier space: the sealed data and cache stay
                // available at their index-declared remote locations.
                worker
                    .storage
                    .remove_copies(sector.id, SectorFileType::SEALED)
                    .await?;
                worker
                    .storage
                    .remove_copies(sector.id, SectorFileType::CACHE)
                    .await?;

                debug!(sector = %sector.id, "piece unsealed");
                Ok(TaskOutput::None)
            },
        )
    }

    /// Delete every file type for a sector, collecting all failures.
    pub async fn remove(&self, sector: SectorId) -> QuarryResult<()> {
        let mut errors = Vec::new();
        for file_type in [
            SectorFileType::SEALED,
            SectorFileType::CACHE,
            SectorFileType::UNSEALED,
        ] {
            if let Err(e) = self.storage.remove(sector, file_type, true).await {
                errors.push(format!("removing sector ({}): {}", file_type, e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(QuarryError::Storage {
                operation: format!("remove sector {}", sector),
                source: errors.join("; ").into(),
            })
        }
    }

    pub fn task_types(&self) -> HashSet<TaskType> {
        self.task_state.lock().accept.clone()
    }

    pub fn task_enable(&self, task: TaskType) {
        self.task_state.lock().accept.insert(task);
    }

    pub fn task_disable(&self, task: TaskType) {
        self.task_state.lock().accept.remove(&task);
    }

    /// Whether another task of this type fits under the fixed per-stage cap.
    pub fn has_resource_for_new_task(&self, task: TaskType) -> bool {
        let state = self.task_state.lock();
        let running = state.running.get(&task).copied().unwrap_or(0);
        running < task.parallel_limit() as usize
    }

    pub fn ignores_resource_filtering(&self) -> bool {
        self.ignore_resources
    }

    pub fn no_swap(&self) -> bool {
        self.no_swap
    }

    pub fn info(&self) -> QuarryResult<WorkerInfo> {
        let hostname = hostname::get()
            .map_err(QuarryError::Io)?
            .to_string_lossy()
            .into_owned();

        Ok(WorkerInfo {
            group_id: self.group_id.clone(),
            hostname,
            resources: self.resource_config(),
        })
    }

    /// Per-stage parallelism advertised to the scheduler: the fixed cap for
    /// every accepted stage, zero otherwise.
    fn resource_config(&self) -> WorkerResources {
        let state = self.task_state.lock();
        let mut resources = WorkerResources::default();
        for task in &state.accept {
            let cap = task.parallel_limit();
            match task {
                TaskType::AddPiece => resources.add_piece = cap,
                TaskType::PreCommit1 => resources.pre_commit1 = cap,
                TaskType::PreCommit2 => resources.pre_commit2 = cap,
                TaskType::Commit1 => resources.commit1 = cap,
                TaskType::Commit2 => resources.commit2 = cap,
                TaskType::Finalize => resources.finalize = cap,
            }
        }
        resources
    }

    pub async fn paths(&self) -> QuarryResult<Vec<StoragePath>> {
        self.local_store.local_paths().await
    }

    /// This worker's session id; a fresh UUID per process. Reports the
    /// closed-worker id after shutdown.
    pub fn session(&self) -> QuarryResult<Uuid> {
        if self.test_disable.load(Ordering::SeqCst) {
            return Err(QuarryError::Internal {
                message: "disabled".to_string(),
            });
        }

        if *self.closing_rx.borrow() {
            Ok(CLOSED_WORKER_ID)
        } else {
            Ok(self.session)
        }
    }

    /// Test hook: make `session` report the worker as disabled.
    pub fn set_test_disable(&self, disabled: bool) {
        self.test_disable.store(disabled, Ordering::SeqCst);
    }

    /// Signal shutdown: running tasks are cancelled through their context,
    /// the cache-clear queue closes, and `session` reports the closed id.
    pub fn close(&self) {
        let _ = self.closing_tx.send(true);
        self.cache_clear_tx.lock().take();
    }

    /// Block until every background task has finished.
    pub async fn wait_quiet(&self) {
        self.running.wait_quiet().await;
    }
}

/// Resolves sector paths through the worker's store and declares newly
/// allocated files in the sector index once the caller is done with them.
pub struct WorkerPathProvider {
    pub(crate) worker: Arc<LocalWorker>,
    pub op: AcquireMode,
}

impl WorkerPathProvider {
    pub fn new(worker: Arc<LocalWorker>, op: AcquireMode) -> Self {
        Self { worker, op }
    }

    pub async fn acquire_sector(
        &self,
        sector: SectorRef,
        existing: SectorFileType,
        allocate: SectorFileType,
        path_type: PathType,
    ) -> QuarryResult<(SectorPaths, AcquiredSector)> {
        let (paths, ids) = self
            .worker
            .storage
            .acquire_sector(sector, existing, allocate, path_type, self.op)
            .await?;

        debug!(sector = %sector.id, ?existing, ?allocate, "acquired sector paths");

        Ok((
            paths,
            AcquiredSector {
                worker: self.worker.clone(),
                ids,
                allocate,
                op: self.op,
            },
        ))
    }
}

/// Result of a path-provider acquire; call [`AcquiredSector::declare`] after
/// writing the allocated files.
pub struct AcquiredSector {
    worker: Arc<LocalWorker>,
    ids: crate::types::SectorStoreIds,
    allocate: SectorFileType,
    op: AcquireMode,
}

impl AcquiredSector {
    /// Declare every allocated file type in the sector index. Failures are
    /// logged; the files stay usable locally either way.
    pub async fn declare(&self, sector: SectorId) {
        for file_type in self.allocate.types() {
            let Some(id) = self.ids.get(file_type) else {
                continue;
            };
            if let Err(e) = self
                .worker
                .sector_index
                .storage_declare_sector(id, sector, file_type, self.op == AcquireMode::Move)
                .await
            {
                error!(sector = %sector, storage = %id, error = %e,
                    "declaring sector failed");
            }
        }
    }
}
