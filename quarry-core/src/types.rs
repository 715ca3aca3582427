//! Shared types for the sector storage fabric and the sealing worker.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account address involved in a consensus operation. Addresses are opaque
/// strings to this subsystem; the chain layer owns their structure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signed message body replicated through consensus. The bytes carry the
/// full signed envelope; the message pool knows how to decode them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectorId {
    pub miner: u64,
    pub number: u64,
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-t0{}-{}", self.miner, self.number)
    }
}

/// Seal proof class. The numeric id is stable and appears in allocated-probe
/// URLs on the storage wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisteredSealProof {
    StackedDrg2KiBV1,
    StackedDrg8MiBV1,
    StackedDrg512MiBV1,
    StackedDrg32GiBV1,
    StackedDrg64GiBV1,
}

impl RegisteredSealProof {
    pub fn sector_size(&self) -> u64 {
        match self {
            RegisteredSealProof::StackedDrg2KiBV1 => 2 << 10,
            RegisteredSealProof::StackedDrg8MiBV1 => 8 << 20,
            RegisteredSealProof::StackedDrg512MiBV1 => 512 << 20,
            RegisteredSealProof::StackedDrg32GiBV1 => 32 << 30,
            RegisteredSealProof::StackedDrg64GiBV1 => 64 << 30,
        }
    }

    /// Stable wire id used in storage-server URL paths.
    pub fn wire_id(&self) -> u64 {
        match self {
            RegisteredSealProof::StackedDrg2KiBV1 => 0,
            RegisteredSealProof::StackedDrg8MiBV1 => 1,
            RegisteredSealProof::StackedDrg512MiBV1 => 2,
            RegisteredSealProof::StackedDrg32GiBV1 => 3,
            RegisteredSealProof::StackedDrg64GiBV1 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorRef {
    pub id: SectorId,
    pub proof_type: RegisteredSealProof,
}

bitflags::bitflags! {
    /// Set of sector file types. A sector has independent presence per type
    /// at any storage location.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SectorFileType: u8 {
        const UNSEALED = 1 << 0;
        const SEALED = 1 << 1;
        const CACHE = 1 << 2;
    }
}

impl SectorFileType {
    /// All single file types, in the fixed on-disk order.
    pub const PATH_TYPES: [SectorFileType; 3] = [
        SectorFileType::UNSEALED,
        SectorFileType::SEALED,
        SectorFileType::CACHE,
    ];

    pub fn as_str(&self) -> &'static str {
        if *self == SectorFileType::UNSEALED {
            "unsealed"
        } else if *self == SectorFileType::SEALED {
            "sealed"
        } else if *self == SectorFileType::CACHE {
            "cache"
        } else {
            "invalid"
        }
    }

    /// Iterate the single types present in this mask.
    pub fn types(&self) -> impl Iterator<Item = SectorFileType> + '_ {
        Self::PATH_TYPES.into_iter().filter(|t| self.contains(*t))
    }
}

impl fmt::Display for SectorFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifier of a storage location (a filesystem tier reachable locally or
/// over HTTP).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageId(pub String);

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-type absolute paths for one sector. `None` means the type is absent
/// at the resolved location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectorPaths {
    pub unsealed: Option<PathBuf>,
    pub sealed: Option<PathBuf>,
    pub cache: Option<PathBuf>,
}

impl SectorPaths {
    pub fn get(&self, file_type: SectorFileType) -> Option<&PathBuf> {
        if file_type == SectorFileType::UNSEALED {
            self.unsealed.as_ref()
        } else if file_type == SectorFileType::SEALED {
            self.sealed.as_ref()
        } else if file_type == SectorFileType::CACHE {
            self.cache.as_ref()
        } else {
            None
        }
    }

    pub fn set(&mut self, file_type: SectorFileType, path: PathBuf) {
        if file_type == SectorFileType::UNSEALED {
            self.unsealed = Some(path);
        } else if file_type == SectorFileType::SEALED {
            self.sealed = Some(path);
        } else if file_type == SectorFileType::CACHE {
            self.cache = Some(path);
        }
    }
}

/// Mirror of [`SectorPaths`] carrying the storage-location id each resolved
/// path belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectorStoreIds {
    pub unsealed: Option<StorageId>,
    pub sealed: Option<StorageId>,
    pub cache: Option<StorageId>,
}

impl SectorStoreIds {
    pub fn get(&self, file_type: SectorFileType) -> Option<&StorageId> {
        if file_type == SectorFileType::UNSEALED {
            self.unsealed.as_ref()
        } else if file_type == SectorFileType::SEALED {
            self.sealed.as_ref()
        } else if file_type == SectorFileType::CACHE {
            self.cache.as_ref()
        } else {
            None
        }
    }

    pub fn set(&mut self, file_type: SectorFileType, id: StorageId) {
        if file_type == SectorFileType::UNSEALED {
            self.unsealed = Some(id);
        } else if file_type == SectorFileType::SEALED {
            self.sealed = Some(id);
        } else if file_type == SectorFileType::CACHE {
            self.cache = Some(id);
        }
    }
}

/// Which tier a path is resolved for. Sealing paths live on the fast tier,
/// storage paths on the long-term tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathType {
    Sealing,
    Storage,
}

/// Whether an acquired remote file should remain at the source (copy) or be
/// deleted from it once fetched (move).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquireMode {
    Copy,
    Move,
}

/// Byte size including the proof tree padding (128/127 of the payload).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PaddedPieceSize(pub u64);

impl PaddedPieceSize {
    pub fn unpadded(&self) -> UnpaddedPieceSize {
        UnpaddedPieceSize(self.0 - self.0 / 128)
    }
}

/// Payload byte size before padding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UnpaddedPieceSize(pub u64);

impl UnpaddedPieceSize {
    pub fn padded(&self) -> PaddedPieceSize {
        PaddedPieceSize(self.0 + self.0 / 127)
    }
}

/// A deal-payload range within an unsealed sector file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceRange {
    pub offset: UnpaddedPieceSize,
    pub size: UnpaddedPieceSize,
}

/// A staged piece: its padded size and commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceInfo {
    pub size: PaddedPieceSize,
    pub piece_cid: String,
}

/// Sealed/unsealed sector commitments produced by PreCommit2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorCids {
    pub unsealed: String,
    pub sealed: String,
}

pub type SealRandomness = Vec<u8>;
pub type InteractiveSealRandomness = Vec<u8>;
pub type PreCommit1Out = Vec<u8>;
pub type Commit1Out = Vec<u8>;
pub type Proof = Vec<u8>;

/// Unique identity of one asynchronous sealing-stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId {
    pub sector: SectorId,
    pub id: Uuid,
}

impl CallId {
    pub fn new(sector: SectorId) -> Self {
        Self {
            sector,
            id: Uuid::new_v4(),
        }
    }

    /// Stable string form used as the durable call-tracker key.
    pub fn key(&self) -> String {
        format!("{}-{}-{}", self.sector.miner, self.sector.number, self.id)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sector, self.id)
    }
}

/// Sealing pipeline stages a worker can accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    AddPiece,
    PreCommit1,
    PreCommit2,
    Commit1,
    Commit2,
    Finalize,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        TaskType::AddPiece,
        TaskType::PreCommit1,
        TaskType::PreCommit2,
        TaskType::Commit1,
        TaskType::Commit2,
        TaskType::Finalize,
    ];

    /// Fixed per-stage parallelism cap on a single worker. Commit1 is cheap
    /// and can overlap; the memory-heavy stages are strictly serialized.
    pub fn parallel_limit(&self) -> u32 {
        match self {
            TaskType::AddPiece => 1,
            TaskType::PreCommit1 => 1,
            TaskType::PreCommit2 => 1,
            TaskType::Commit1 => 8,
            TaskType::Commit2 => 1,
            TaskType::Finalize => 1,
        }
    }
}

/// Per-stage parallelism advertised by a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResources {
    pub add_piece: u32,
    pub pre_commit1: u32,
    pub pre_commit2: u32,
    pub commit1: u32,
    pub commit2: u32,
    pub finalize: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub group_id: String,
    pub hostname: String,
    pub resources: WorkerResources,
}

/// Session id reported by a worker whose `close` has completed.
pub const CLOSED_WORKER_ID: Uuid = Uuid::nil();

/// Filesystem stats for one storage location, as served by the remote
/// `stat` endpoint. Field names are fixed by the HTTP wire format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FsStat {
    pub capacity: u64,
    pub available: u64,
    pub reserved: u64,
}

/// One storage location known to the sector index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub id: StorageId,
    pub urls: Vec<String>,
    pub weight: u64,
    pub can_seal: bool,
    pub can_store: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_mask_iteration() {
        let mask = SectorFileType::SEALED | SectorFileType::CACHE;
        let types: Vec<_> = mask.types().collect();
        assert_eq!(types, vec![SectorFileType::SEALED, SectorFileType::CACHE]);
        assert!(!mask.contains(SectorFileType::UNSEALED));
    }

    #[test]
    fn padded_unpadded_round_trip() {
        for padded in [128u64, 2048, 32 << 30] {
            let p = PaddedPieceSize(padded);
            assert_eq!(p.unpadded().padded(), p);
        }
    }

    #[test]
    fn sector_paths_by_type() {
        let mut paths = SectorPaths::default();
        paths.set(SectorFileType::SEALED, PathBuf::from("/x/sealed/s-t01-1"));
        assert!(paths.get(SectorFileType::UNSEALED).is_none());
        assert_eq!(
            paths.get(SectorFileType::SEALED).map(|p| p.as_path()),
            Some(std::path::Path::new("/x/sealed/s-t01-1"))
        );
    }

    #[test]
    fn call_id_key_is_stable() {
        let ci = CallId {
            sector: SectorId {
                miner: 1000,
                number: 7,
            },
            id: Uuid::nil(),
        };
        assert_eq!(ci.key(), format!("1000-7-{}", Uuid::nil()));
    }
}
