//! Typed delivery of task results to the manager.
//!
//! The manager exposes one return method per task kind; the worker selects
//! it through a hand-written dispatch on [`ReturnType`] and retries delivery
//! until it lands or the worker shuts down. Undelivered results stay in the
//! call tracker and are retried on the next process start.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{CallError, QuarryResult};
use crate::types::{CallId, Commit1Out, PieceInfo, PreCommit1Out, Proof, SectorCids};

use super::WorkerCtx;

/// Delay between delivery attempts.
const RETURN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Task kinds on the return wire. The serialized names are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReturnType {
    AddPiece,
    SealPreCommit1,
    SealPreCommit2,
    SealCommit1,
    SealCommit2,
    FinalizeSector,
    ReleaseUnsealed,
    MoveStorage,
    UnsealPiece,
    Fetch,
}

impl ReturnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnType::AddPiece => "AddPiece",
            ReturnType::SealPreCommit1 => "SealPreCommit1",
            ReturnType::SealPreCommit2 => "SealPreCommit2",
            ReturnType::SealCommit1 => "SealCommit1",
            ReturnType::SealCommit2 => "SealCommit2",
            ReturnType::FinalizeSector => "FinalizeSector",
            ReturnType::ReleaseUnsealed => "ReleaseUnsealed",
            ReturnType::MoveStorage => "MoveStorage",
            ReturnType::UnsealPiece => "UnsealPiece",
            ReturnType::Fetch => "Fetch",
        }
    }
}

impl std::fmt::Display for ReturnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task result, tagged by the producing task kind. Serialized into the call
/// tracker between completion and successful delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum TaskOutput {
    Piece(PieceInfo),
    PreCommit1(PreCommit1Out),
    PreCommit2(SectorCids),
    Commit1(Commit1Out),
    Commit2(Proof),
    None,
}

/// Manager-side sink for task results, one method per task kind.
#[async_trait]
pub trait WorkerReturn: Send + Sync {
    async fn return_add_piece(
        &self,
        call: CallId,
        piece: Option<PieceInfo>,
        err: Option<CallError>,
    ) -> QuarryResult<()>;

    async fn return_seal_pre_commit1(
        &self,
        call: CallId,
        out: Option<PreCommit1Out>,
        err: Option<CallError>,
    ) -> QuarryResult<()>;

    async fn return_seal_pre_commit2(
        &self,
        call: CallId,
        out: Option<SectorCids>,
        err: Option<CallError>,
    ) -> QuarryResult<()>;

    async fn return_seal_commit1(
        &self,
        call: CallId,
        out: Option<Commit1Out>,
        err: Option<CallError>,
    ) -> QuarryResult<()>;

    async fn return_seal_commit2(
        &self,
        call: CallId,
        out: Option<Proof>,
        err: Option<CallError>,
    ) -> QuarryResult<()>;

    async fn return_finalize_sector(&self, call: CallId, err: Option<CallError>)
        -> QuarryResult<()>;

    async fn return_release_unsealed(
        &self,
        call: CallId,
        err: Option<CallError>,
    ) -> QuarryResult<()>;

    async fn return_move_storage(&self, call: CallId, err: Option<CallError>) -> QuarryResult<()>;

    async fn return_unseal_piece(&self, call: CallId, err: Option<CallError>) -> QuarryResult<()>;

    async fn return_fetch(&self, call: CallId, err: Option<CallError>) -> QuarryResult<()>;
}

/// Invoke the return method matching `rt`. Output variants that do not match
/// the task kind degrade to `None` payloads, mirroring a failed call.
pub async fn dispatch(
    rt: ReturnType,
    ret: &dyn WorkerReturn,
    call: CallId,
    output: &TaskOutput,
    err: Option<CallError>,
) -> QuarryResult<()> {
    match rt {
        ReturnType::AddPiece => {
            let piece = match output {
                TaskOutput::Piece(p) => Some(p.clone()),
                _ => None,
            };
            ret.return_add_piece(call, piece, err).await
        }
        ReturnType::SealPreCommit1 => {
            let out = match output {
                TaskOutput::PreCommit1(o) => Some(o.clone()),
                _ => None,
            };
            ret.return_seal_pre_commit1(call, out, err).await
        }
        ReturnType::SealPreCommit2 => {
            let out = match output {
                TaskOutput::PreCommit2(o) => Some(o.clone()),
                _ => None,
            };
            ret.return_seal_pre_commit2(call, out, err).await
        }
        ReturnType::SealCommit1 => {
            let out = match output {
                TaskOutput::Commit1(o) => Some(o.clone()),
                _ => None,
            };
            ret.return_seal_commit1(call, out, err).await
        }
        ReturnType::SealCommit2 => {
            let out = match output {
                TaskOutput::Commit2(o) => Some(o.clone()),
                _ => None,
            };
            ret.return_seal_commit2(call, out, err).await
        }
        ReturnType::FinalizeSector => ret.return_finalize_sector(call, err).await,
        ReturnType::ReleaseUnsealed => ret.return_release_unsealed(call, err).await,
        ReturnType::MoveStorage => ret.return_move_storage(call, err).await,
        ReturnType::UnsealPiece => ret.return_unseal_piece(call, err).await,
        ReturnType::Fetch => ret.return_fetch(call, err).await,
    }
}

/// Deliver one result to the manager, retrying indefinitely. Returns whether
/// delivery succeeded; `false` means the worker is shutting down and the
/// result stays tracked for redelivery on the next start.
pub async fn do_return(
    ctx: &WorkerCtx,
    rt: ReturnType,
    call: CallId,
    ret: &dyn WorkerReturn,
    output: &TaskOutput,
    err: Option<CallError>,
) -> bool {
    loop {
        match dispatch(rt, ret, call, output, err.clone()).await {
            Ok(()) => return true,
            Err(e) => {
                error!(call = %call, return_type = %rt, error = %e,
                    "returning result failed, will retry in 5s");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(RETURN_RETRY_DELAY) => {}
            _ = ctx.closed() => {
                error!(call = %call, "failed to return result: worker shutting down");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_stable() {
        let expected = [
            (ReturnType::AddPiece, "AddPiece"),
            (ReturnType::SealPreCommit1, "SealPreCommit1"),
            (ReturnType::SealPreCommit2, "SealPreCommit2"),
            (ReturnType::SealCommit1, "SealCommit1"),
            (ReturnType::SealCommit2, "SealCommit2"),
            (ReturnType::FinalizeSector, "FinalizeSector"),
            (ReturnType::ReleaseUnsealed, "ReleaseUnsealed"),
            (ReturnType::MoveStorage, "MoveStorage"),
            (ReturnType::UnsealPiece, "UnsealPiece"),
            (ReturnType::Fetch, "Fetch"),
        ];
        for (rt, name) in expected {
            assert_eq!(rt.as_str(), name);
            assert_eq!(serde_json::to_string(&rt).unwrap(), format!("\"{}\"", name));
        }
    }

    #[test]
    fn task_output_round_trips_as_json() {
        let out = TaskOutput::PreCommit2(SectorCids {
            unsealed: "baga-unsealed".into(),
            sealed: "bagb-sealed".into(),
        });
        let json = serde_json::to_vec(&out).unwrap();
        let back: TaskOutput = serde_json::from_slice(&json).unwrap();
        assert_eq!(out, back);
    }
}
