//! Local storage tier.
//!
//! [`LocalStorage`] is the seam the remote store builds on: path resolution
//! and allocation on this machine, space reservations, deletion and moves
//! between the sealing and long-term tiers. [`LocalStore`] is the concrete
//! implementation over a set of configured storage roots.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{QuarryError, QuarryResult};
use crate::types::{
    FsStat, PathType, SectorFileType, SectorId, SectorPaths, SectorRef, SectorStoreIds, StorageId,
};

use super::required_space;

/// Error for a storage id this tier does not know. The remote store falls
/// back to the HTTP stat endpoint on this kind.
pub fn path_not_found(id: &StorageId) -> QuarryError {
    QuarryError::NotFound {
        resource: format!("storage path {}", id),
    }
}

pub fn is_path_not_found(err: &QuarryError) -> bool {
    matches!(err, QuarryError::NotFound { resource } if resource.starts_with("storage path "))
}

/// One configured storage root.
#[derive(Debug, Clone)]
pub struct StoragePath {
    pub id: StorageId,
    pub root: PathBuf,
    pub can_seal: bool,
    pub can_store: bool,
    pub weight: u64,
    /// Declared capacity in bytes; reservations are tracked against it.
    pub capacity: u64,
}

/// Releases a space reservation when dropped, covering every exit path of
/// an acquire.
pub struct Reservation {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Reservation {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A reservation that releases nothing.
    pub fn empty() -> Self {
        Self { release: None }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Local sector file access.
#[async_trait]
pub trait LocalStorage: Send + Sync {
    /// Resolve paths for locally present `existing` types and pick
    /// destination paths for `allocate` types. Absent types stay unset.
    async fn acquire_sector(
        &self,
        sector: SectorRef,
        existing: SectorFileType,
        allocate: SectorFileType,
        path_type: PathType,
    ) -> QuarryResult<(SectorPaths, SectorStoreIds)>;

    /// Reserve disk space for `types` landing at the given locations.
    async fn reserve(
        &self,
        sector: SectorRef,
        types: SectorFileType,
        store_ids: &SectorStoreIds,
        path_type: PathType,
    ) -> QuarryResult<Reservation>;

    async fn remove(&self, sector: SectorId, types: SectorFileType, force: bool)
        -> QuarryResult<()>;

    /// Drop redundant copies, keeping the primary (a long-term copy when one
    /// exists).
    async fn remove_copies(&self, sector: SectorId, types: SectorFileType) -> QuarryResult<()>;

    /// Move files from the sealing tier to long-term storage.
    async fn move_storage(&self, sector: SectorRef, types: SectorFileType) -> QuarryResult<()>;

    async fn fs_stat(&self, id: &StorageId) -> QuarryResult<FsStat>;

    async fn local_paths(&self) -> QuarryResult<Vec<StoragePath>>;
}

struct Reserved {
    by_path: HashMap<StorageId, u64>,
}

/// Concrete local tier over configured storage roots.
pub struct LocalStore {
    paths: Vec<StoragePath>,
    reserved: Arc<parking_lot::Mutex<Reserved>>,
}

impl LocalStore {
    pub fn new(paths: Vec<StoragePath>) -> QuarryResult<Self> {
        if paths.is_empty() {
            return Err(QuarryError::Validation {
                field: "paths".to_string(),
                message: "at least one storage path is required".to_string(),
            });
        }

        for path in &paths {
            for file_type in SectorFileType::PATH_TYPES {
                std::fs::create_dir_all(path.root.join(file_type.as_str()))?;
            }
        }

        Ok(Self {
            paths,
            reserved: Arc::new(parking_lot::Mutex::new(Reserved {
                by_path: HashMap::new(),
            })),
        })
    }

    fn sector_file(root: &Path, file_type: SectorFileType, sector: SectorId) -> PathBuf {
        root.join(file_type.as_str()).join(sector.to_string())
    }

    fn path_config(&self, id: &StorageId) -> Option<&StoragePath> {
        self.paths.iter().find(|p| &p.id == id)
    }

    /// Pick the allocation target for a tier: the best-weighted path able to
    /// serve it, with the other tier as a fallback.
    fn allocation_target(&self, path_type: PathType) -> &StoragePath {
        let matching = |p: &&StoragePath| match path_type {
            PathType::Sealing => p.can_seal,
            PathType::Storage => p.can_store,
        };
        self.paths
            .iter()
            .filter(matching)
            .max_by_key(|p| p.weight)
            .unwrap_or(&self.paths[0])
    }

    /// All paths currently holding this sector file, sorted so long-term
    /// copies come first.
    fn holders(&self, sector: SectorId, file_type: SectorFileType) -> Vec<(&StoragePath, PathBuf)> {
        let mut found: Vec<(&StoragePath, PathBuf)> = self
            .paths
            .iter()
            .filter_map(|p| {
                let candidate = Self::sector_file(&p.root, file_type, sector);
                candidate.exists().then_some((p, candidate))
            })
            .collect();
        found.sort_by_key(|(p, _)| (!p.can_store, std::cmp::Reverse(p.weight)));
        found
    }
}

/// Delete a sector file or cache directory. Missing targets are fine.
pub(crate) async fn remove_path(path: &Path) -> QuarryResult<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(tokio::fs::remove_dir_all(path).await?),
        Ok(_) => Ok(tokio::fs::remove_file(path).await?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Move a file or directory, falling back to copy-and-delete across
/// filesystems.
pub(crate) async fn move_path(from: &Path, to: &Path) -> QuarryResult<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            let from = from.to_path_buf();
            let to = to.to_path_buf();
            tokio::task::spawn_blocking(move || copy_recursive(&from, &to).and_then(|_| remove_sync(&from)))
                .await
                .map_err(|e| QuarryError::Internal {
                    message: format!("move task panicked: {}", e),
                })??;
            Ok(())
        }
    }
}

fn copy_recursive(from: &Path, to: &Path) -> QuarryResult<()> {
    let meta = std::fs::metadata(from)?;
    if meta.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(from, to)?;
    }
    Ok(())
}

fn remove_sync(path: &Path) -> QuarryResult<()> {
    let meta = std::fs::metadata(path)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

#[async_trait]
impl LocalStorage for LocalStore {
    async fn acquire_sector(
        &self,
        sector: SectorRef,
        existing: SectorFileType,
        allocate: SectorFileType,
        path_type: PathType,
    ) -> QuarryResult<(SectorPaths, SectorStoreIds)> {
        let mut paths = SectorPaths::default();
        let mut ids = SectorStoreIds::default();

        for file_type in existing.types() {
            if let Some((config, path)) = self.holders(sector.id, file_type).into_iter().next() {
                paths.set(file_type, path);
                ids.set(file_type, config.id.clone());
            }
        }

        for file_type in allocate.types() {
            let target = self.allocation_target(path_type);
            let path = Self::sector_file(&target.root, file_type, sector.id);
            debug!(sector = %sector.id, file_type = %file_type, path = %path.display(),
                "allocated sector path");
            paths.set(file_type, path);
            ids.set(file_type, target.id.clone());
        }

        Ok((paths, ids))
    }

    async fn reserve(
        &self,
        sector: SectorRef,
        types: SectorFileType,
        store_ids: &SectorStoreIds,
        path_type: PathType,
    ) -> QuarryResult<Reservation> {
        let sector_size = sector.proof_type.sector_size();
        let mut per_path: HashMap<StorageId, u64> = HashMap::new();
        for file_type in types.types() {
            let id = store_ids
                .get(file_type)
                .ok_or_else(|| QuarryError::Internal {
                    message: format!("no storage id for {} reservation", file_type),
                })?;
            *per_path.entry(id.clone()).or_default() +=
                required_space(path_type, file_type, sector_size);
        }

        {
            let mut reserved = self.reserved.lock();
            for (id, bytes) in &per_path {
                let config = self.path_config(id).ok_or_else(|| path_not_found(id))?;
                let already = reserved.by_path.get(id).copied().unwrap_or(0);
                if already + bytes > config.capacity {
                    return Err(QuarryError::Storage {
                        operation: format!("reserve {} bytes on {}", bytes, id),
                        source: "not enough space".into(),
                    });
                }
            }
            for (id, bytes) in &per_path {
                *reserved.by_path.entry(id.clone()).or_default() += bytes;
            }
        }

        let reserved = self.reserved.clone();
        Ok(Reservation::new(move || {
            let mut guard = reserved.lock();
            for (id, bytes) in per_path {
                if let Some(current) = guard.by_path.get_mut(&id) {
                    *current = current.saturating_sub(bytes);
                }
            }
        }))
    }

    async fn remove(
        &self,
        sector: SectorId,
        types: SectorFileType,
        _force: bool,
    ) -> QuarryResult<()> {
        for file_type in types.types() {
            for (_, path) in self.holders(sector, file_type) {
                debug!(sector = %sector, path = %path.display(), "removing sector file");
                remove_path(&path).await?;
            }
        }
        Ok(())
    }

    async fn remove_copies(&self, sector: SectorId, types: SectorFileType) -> QuarryResult<()> {
        for file_type in types.types() {
            let holders = self.holders(sector, file_type);
            // First holder is the primary; everything else is a copy.
            for (_, path) in holders.into_iter().skip(1) {
                debug!(sector = %sector, path = %path.display(), "removing redundant copy");
                remove_path(&path).await?;
            }
        }
        Ok(())
    }

    async fn move_storage(&self, sector: SectorRef, types: SectorFileType) -> QuarryResult<()> {
        for file_type in types.types() {
            let holders = self.holders(sector.id, file_type);
            let Some((source_config, source)) = holders.into_iter().next() else {
                warn!(sector = %sector.id, file_type = %file_type,
                    "move requested for a file type not present locally");
                continue;
            };

            let target = self.allocation_target(PathType::Storage);
            if target.id == source_config.id {
                continue;
            }

            let dest = Self::sector_file(&target.root, file_type, sector.id);
            move_path(&source, &dest).await?;
        }
        Ok(())
    }

    async fn fs_stat(&self, id: &StorageId) -> QuarryResult<FsStat> {
        let config = self.path_config(id).ok_or_else(|| path_not_found(id))?;
        let reserved = self
            .reserved
            .lock()
            .by_path
            .get(id)
            .copied()
            .unwrap_or(0);
        Ok(FsStat {
            capacity: config.capacity,
            available: config.capacity.saturating_sub(reserved),
            reserved,
        })
    }

    async fn local_paths(&self) -> QuarryResult<Vec<StoragePath>> {
        Ok(self.paths.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RegisteredSealProof;
    use tempfile::TempDir;

    fn sector() -> SectorRef {
        SectorRef {
            id: SectorId {
                miner: 1000,
                number: 1,
            },
            proof_type: RegisteredSealProof::StackedDrg2KiBV1,
        }
    }

    fn store_with_one_path(dir: &TempDir) -> LocalStore {
        LocalStore::new(vec![StoragePath {
            id: StorageId("path-a".into()),
            root: dir.path().to_path_buf(),
            can_seal: true,
            can_store: true,
            weight: 10,
            capacity: 1 << 30,
        }])
        .unwrap()
    }

    #[tokio::test]
    async fn acquire_finds_existing_files() {
        let dir = TempDir::new().unwrap();
        let store = store_with_one_path(&dir);
        let s = sector();

        let name = s.id.to_string();
        std::fs::write(dir.path().join("sealed").join(&name), b"sealed-data").unwrap();

        let (paths, ids) = store
            .acquire_sector(
                s,
                SectorFileType::SEALED | SectorFileType::CACHE,
                SectorFileType::empty(),
                PathType::Storage,
            )
            .await
            .unwrap();

        assert!(paths.get(SectorFileType::SEALED).is_some());
        assert!(paths.get(SectorFileType::CACHE).is_none());
        assert_eq!(
            ids.get(SectorFileType::SEALED),
            Some(&StorageId("path-a".into()))
        );
    }

    #[tokio::test]
    async fn reserve_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let store = store_with_one_path(&dir);
        let s = sector();

        let (_, ids) = store
            .acquire_sector(
                s,
                SectorFileType::empty(),
                SectorFileType::SEALED,
                PathType::Sealing,
            )
            .await
            .unwrap();

        let reservation = store
            .reserve(s, SectorFileType::SEALED, &ids, PathType::Sealing)
            .await
            .unwrap();

        let stat = store.fs_stat(&StorageId("path-a".into())).await.unwrap();
        assert!(stat.reserved > 0);

        drop(reservation);
        let stat = store.fs_stat(&StorageId("path-a".into())).await.unwrap();
        assert_eq!(stat.reserved, 0);
    }

    #[tokio::test]
    async fn reserve_fails_when_capacity_exhausted() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(vec![StoragePath {
            id: StorageId("tiny".into()),
            root: dir.path().to_path_buf(),
            can_seal: true,
            can_store: true,
            weight: 1,
            capacity: 64, // far below one 2 KiB sector
        }])
        .unwrap();
        let s = sector();

        let (_, ids) = store
            .acquire_sector(
                s,
                SectorFileType::empty(),
                SectorFileType::SEALED,
                PathType::Sealing,
            )
            .await
            .unwrap();

        assert!(store
            .reserve(s, SectorFileType::SEALED, &ids, PathType::Sealing)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn move_storage_relocates_to_store_path() {
        let seal_dir = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let store = LocalStore::new(vec![
            StoragePath {
                id: StorageId("seal".into()),
                root: seal_dir.path().to_path_buf(),
                can_seal: true,
                can_store: false,
                weight: 10,
                capacity: 1 << 30,
            },
            StoragePath {
                id: StorageId("store".into()),
                root: store_dir.path().to_path_buf(),
                can_seal: false,
                can_store: true,
                weight: 10,
                capacity: 1 << 30,
            },
        ])
        .unwrap();
        let s = sector();
        let name = s.id.to_string();

        std::fs::write(seal_dir.path().join("sealed").join(&name), b"data").unwrap();
        std::fs::create_dir_all(seal_dir.path().join("cache").join(&name)).unwrap();
        std::fs::write(
            seal_dir.path().join("cache").join(&name).join("tree.dat"),
            b"tree",
        )
        .unwrap();

        store
            .move_storage(s, SectorFileType::SEALED | SectorFileType::CACHE)
            .await
            .unwrap();

        assert!(!seal_dir.path().join("sealed").join(&name).exists());
        assert!(store_dir.path().join("sealed").join(&name).exists());
        assert!(store_dir
            .path()
            .join("cache")
            .join(&name)
            .join("tree.dat")
            .exists());
    }

    #[tokio::test]
    async fn remove_copies_keeps_primary() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let store = LocalStore::new(vec![
            StoragePath {
                id: StorageId("seal".into()),
                root: a.path().to_path_buf(),
                can_seal: true,
                can_store: false,
                weight: 10,
                capacity: 1 << 30,
            },
            StoragePath {
                id: StorageId("store".into()),
                root: b.path().to_path_buf(),
                can_seal: false,
                can_store: true,
                weight: 10,
                capacity: 1 << 30,
            },
        ])
        .unwrap();
        let s = sector();
        let name = s.id.to_string();

        std::fs::write(a.path().join("sealed").join(&name), b"copy").unwrap();
        std::fs::write(b.path().join("sealed").join(&name), b"primary").unwrap();

        store
            .remove_copies(s.id, SectorFileType::SEALED)
            .await
            .unwrap();

        // The long-term copy is the primary and survives.
        assert!(b.path().join("sealed").join(&name).exists());
        assert!(!a.path().join("sealed").join(&name).exists());
    }
}
