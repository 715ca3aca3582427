//! The sector storage fabric.
//!
//! Sector file sets move between a fast sealing tier and long-term storage,
//! on this machine or on peers reachable over HTTP. Workers acquire sectors
//! through the [`Store`] seam; [`remote::RemoteStore`] implements it with a
//! local-first, fetch-from-peer strategy, backed by a [`local::LocalStorage`]
//! tier and the cluster [`SectorIndex`].

pub mod local;
pub mod partial_file;
pub mod remote;

use async_trait::async_trait;

use crate::error::QuarryResult;
use crate::types::{
    AcquireMode, FsStat, PathType, SectorFileType, SectorId, SectorPaths, SectorRef,
    SectorStoreIds, StorageId, StorageInfo,
};

pub use local::{LocalStorage, LocalStore, Reservation, StoragePath};
pub use remote::RemoteStore;

/// The cluster sector index service.
#[async_trait]
pub trait SectorIndex: Send + Sync {
    /// All storage locations holding `file_type` for this sector.
    async fn storage_find_sector(
        &self,
        sector: SectorId,
        file_type: SectorFileType,
    ) -> QuarryResult<Vec<StorageInfo>>;

    /// Record that a location now holds a file for this sector.
    async fn storage_declare_sector(
        &self,
        storage_id: &StorageId,
        sector: SectorId,
        file_type: SectorFileType,
        primary: bool,
    ) -> QuarryResult<()>;

    /// Metadata for one storage location.
    async fn storage_info(&self, id: &StorageId) -> QuarryResult<StorageInfo>;
}

/// Sector file access as consumed by workers.
#[async_trait]
pub trait Store: Send + Sync {
    /// Resolve paths for the `existing` types (fetching from peers when
    /// needed) and allocate paths for the `allocate` types. The two masks
    /// must not overlap.
    async fn acquire_sector(
        &self,
        sector: SectorRef,
        existing: SectorFileType,
        allocate: SectorFileType,
        path_type: PathType,
        op: AcquireMode,
    ) -> QuarryResult<(SectorPaths, SectorStoreIds)>;

    /// Delete one file type for a sector everywhere it is known.
    async fn remove(
        &self,
        sector: SectorId,
        types: SectorFileType,
        force: bool,
    ) -> QuarryResult<()>;

    /// Drop redundant local copies, keeping the primary.
    async fn remove_copies(&self, sector: SectorId, types: SectorFileType) -> QuarryResult<()>;

    /// Move the given file types into long-term storage.
    async fn move_storage(&self, sector: SectorRef, types: SectorFileType) -> QuarryResult<()>;

    /// Filesystem stats for a storage location, local or remote.
    async fn fs_stat(&self, id: &StorageId) -> QuarryResult<FsStat>;
}

// Space overheads applied when reserving room for fetched files, in tenths
// of the sector size. Sealing cache blows up to roughly 14x during P1.
const OVERHEAD_DEN: u64 = 10;

fn overhead_numerator(path_type: PathType, file_type: SectorFileType) -> u64 {
    if file_type == SectorFileType::CACHE {
        match path_type {
            PathType::Sealing => 141,
            PathType::Storage => 2,
        }
    } else {
        10
    }
}

/// Disk space to reserve when landing `types` of a sector of `sector_size`
/// bytes on a `path_type` tier.
pub fn required_space(path_type: PathType, types: SectorFileType, sector_size: u64) -> u64 {
    types
        .types()
        .map(|t| sector_size * overhead_numerator(path_type, t) / OVERHEAD_DEN)
        .sum()
}
