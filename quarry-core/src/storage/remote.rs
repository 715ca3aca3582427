//! Remote-capable sector store.
//!
//! Acquires look locally first; types that are missing are fetched over HTTP
//! from the peers the sector index says hold them. At most one acquire per
//! sector runs in a process, and a shared semaphore bounds concurrent
//! fetches across the whole store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RANGE};
use reqwest::StatusCode;
use tokio::io::AsyncRead;
use tokio::sync::{watch, Semaphore};
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, info, warn};

use crate::error::{QuarryError, QuarryResult};
use crate::types::{
    AcquireMode, FsStat, PaddedPieceSize, PathType, SectorFileType, SectorId, SectorPaths,
    SectorRef, SectorStoreIds, StorageId,
};

use super::local::{is_path_not_found, move_path, remove_path, LocalStorage};
use super::partial_file::PartialFile;
use super::{SectorIndex, Store};

/// Subdirectory holding in-flight downloads next to their destination.
const FETCH_TEMP_SUBDIR: &str = "fetching";

/// Buffer size for direct byte-stream downloads.
const COPY_BUF: usize = 1 << 20;

pub struct RemoteStore {
    local: Arc<dyn LocalStorage>,
    index: Arc<dyn SectorIndex>,
    auth: HeaderMap,
    client: reqwest::Client,

    limit: Arc<Semaphore>,
    fetch_limit: usize,

    fetching: parking_lot::Mutex<HashMap<SectorId, watch::Receiver<bool>>>,
}

/// Holds the per-sector single-flight slot; waiters wake when it drops.
struct FetchSlot<'a> {
    store: &'a RemoteStore,
    sector: SectorId,
    _release: watch::Sender<bool>,
}

impl Drop for FetchSlot<'_> {
    fn drop(&mut self) {
        self.store.fetching.lock().remove(&self.sector);
        // Dropping the sender wakes every waiter parked on the receiver.
    }
}

impl RemoteStore {
    pub fn new(
        local: Arc<dyn LocalStorage>,
        index: Arc<dyn SectorIndex>,
        auth: HeaderMap,
        fetch_limit: usize,
    ) -> Self {
        Self {
            local,
            index,
            auth,
            client: reqwest::Client::new(),
            limit: Arc::new(Semaphore::new(fetch_limit)),
            fetch_limit,
            fetching: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Claim the single-flight slot for a sector, waiting for any in-flight
    /// acquire to release it first. Waiters re-contend on wakeup; a released
    /// slot may reveal the files already present locally.
    async fn claim_fetch_slot(&self, sector: SectorId) -> FetchSlot<'_> {
        loop {
            let waiter = {
                let mut fetching = self.fetching.lock();
                match fetching.get(&sector) {
                    None => {
                        let (tx, rx) = watch::channel(false);
                        fetching.insert(sector, rx);
                        return FetchSlot {
                            store: self,
                            sector,
                            _release: tx,
                        };
                    }
                    Some(rx) => rx.clone(),
                }
            };

            let mut waiter = waiter;
            // Resolves with an error once the holder drops its sender; either
            // way the slot was released and we re-contend.
            let _ = waiter.changed().await;
        }
    }

    async fn acquire_from_remote(
        &self,
        sector: SectorId,
        file_type: SectorFileType,
        dest: &Path,
    ) -> QuarryResult<String> {
        let mut infos = self.index.storage_find_sector(sector, file_type).await?;
        if infos.is_empty() {
            return Err(QuarryError::SectorNotFound {
                sector,
                file_type,
                details: None,
            });
        }

        infos.sort_by_key(|info| info.weight);

        let mut errors: Vec<String> = Vec::new();
        for info in &infos {
            for url in &info.urls {
                let temp_dest = temp_fetch_dest(dest).await?;
                remove_path(dest).await?;

                if let Err(e) = self.fetch(url, &temp_dest).await {
                    errors.push(format!("fetch {} (storage {}): {}", url, info.id, e));
                    continue;
                }

                move_path(&temp_dest, dest).await?;

                if !errors.is_empty() {
                    warn!(sector = %sector, errors = ?errors,
                        "acquired sector from remote after earlier fetch errors");
                }
                return Ok(url.clone());
            }
        }

        Err(QuarryError::SectorNotFound {
            sector,
            file_type,
            details: Some(errors.join("; ")),
        })
    }

    async fn fetch(&self, url: &str, outname: &Path) -> QuarryResult<()> {
        info!(url, out = %outname.display(), "fetching sector file");

        if self.limit.available_permits() == 0 {
            info!(running = self.fetch_limit, "throttling fetch");
        }

        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| QuarryError::Internal {
                message: "fetch limiter closed".to_string(),
            })?;

        let resp = self
            .client
            .get(url)
            .headers(self.auth.clone())
            .send()
            .await
            .map_err(|e| QuarryError::http("fetch sector file", e))?;

        if resp.status() != StatusCode::OK {
            return Err(QuarryError::HttpStatus {
                operation: "fetch sector file".to_string(),
                status: resp.status().as_u16(),
                body: None,
            });
        }

        let media_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_string())
            .unwrap_or_default();

        remove_path(outname).await?;

        match media_type.as_str() {
            "application/x-tar" => extract_tar(resp, outname).await,
            "application/octet-stream" => write_stream(resp, outname).await,
            other => Err(QuarryError::UnknownMediaType {
                media_type: other.to_string(),
            }),
        }
    }

    async fn check_allocated(
        &self,
        url: &str,
        proof: crate::types::RegisteredSealProof,
        offset: PaddedPieceSize,
        size: PaddedPieceSize,
    ) -> QuarryResult<bool> {
        let url = format!(
            "{}/{}/allocated/{}/{}",
            url,
            proof.wire_id(),
            offset.unpadded().0,
            size.unpadded().0
        );

        let resp = self
            .client
            .get(&url)
            .headers(self.auth.clone())
            .send()
            .await
            .map_err(|e| QuarryError::http("check allocated", e))?;

        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(false),
            status => Err(QuarryError::HttpStatus {
                operation: "check allocated".to_string(),
                status: status.as_u16(),
                body: None,
            }),
        }
    }

    async fn read_remote(
        &self,
        url: &str,
        offset: PaddedPieceSize,
        size: PaddedPieceSize,
    ) -> QuarryResult<Box<dyn AsyncRead + Send + Unpin>> {
        if self.limit.available_permits() == 0 {
            info!(running = self.fetch_limit, "throttling remote read");
        }

        let permit = self
            .limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QuarryError::Internal {
                message: "fetch limiter closed".to_string(),
            })?;

        let resp = self
            .client
            .get(url)
            .headers(self.auth.clone())
            .header(RANGE, format!("bytes={}-{}", offset.0, offset.0 + size.0 - 1))
            .send()
            .await
            .map_err(|e| QuarryError::http("read remote range", e))?;

        if resp.status() != StatusCode::OK && resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(QuarryError::HttpStatus {
                operation: "read remote range".to_string(),
                status: resp.status().as_u16(),
                body: None,
            });
        }

        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let reader: std::pin::Pin<Box<dyn AsyncRead + Send>> =
            Box::pin(StreamReader::new(stream));

        // The permit rides along with the reader and frees on close.
        struct PermitReader<R> {
            inner: R,
            _permit: tokio::sync::OwnedSemaphorePermit,
        }

        impl<R: AsyncRead + Unpin> AsyncRead for PermitReader<R> {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
            }
        }

        Ok(Box::new(PermitReader {
            inner: reader,
            _permit: permit,
        }))
    }

    /// Reader over an unsealed file range, served locally when possible and
    /// from the first peer whose copy has the range allocated otherwise.
    /// Returns `None` when no location has the range allocated.
    pub async fn reader(
        &self,
        sector: SectorRef,
        offset: PaddedPieceSize,
        size: PaddedPieceSize,
        file_type: SectorFileType,
    ) -> QuarryResult<Option<Box<dyn AsyncRead + Send + Unpin>>> {
        if file_type != SectorFileType::UNSEALED {
            return Err(QuarryError::Validation {
                field: "file_type".to_string(),
                message: "reader only supports unsealed files".to_string(),
            });
        }

        let (paths, _) = self
            .local
            .acquire_sector(
                sector,
                file_type,
                SectorFileType::empty(),
                PathType::Storage,
            )
            .await?;

        if let Some(path) = paths.get(file_type) {
            debug!(path = %path.display(), offset = offset.0, size = size.0, "reading local unsealed file");
            let ssize = sector.proof_type.sector_size();
            let pf = PartialFile::open(PaddedPieceSize(ssize), path).await?;
            if !pf.has_allocated(offset, size) {
                return Ok(None);
            }
            return Ok(Some(pf.reader(offset, size).await?));
        }

        let mut infos = self.index.storage_find_sector(sector.id, file_type).await?;
        if infos.is_empty() {
            return Err(QuarryError::SectorNotFound {
                sector: sector.id,
                file_type,
                details: None,
            });
        }
        infos.sort_by_key(|info| info.weight);

        for info in &infos {
            for url in &info.urls {
                match self
                    .check_allocated(url, sector.proof_type, offset, size)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(url, error = %e, "checking remote allocation failed");
                        continue;
                    }
                }

                match self.read_remote(url, offset, size).await {
                    Ok(reader) => {
                        info!(url, offset = offset.0, size = size.0, "reading remote unsealed range");
                        return Ok(Some(reader));
                    }
                    Err(e) => {
                        warn!(url, error = %e, "reading from remote failed");
                        continue;
                    }
                }
            }
        }

        Ok(None)
    }

    /// Whether any location has the given unsealed range allocated.
    pub async fn is_allocated(
        &self,
        sector: SectorRef,
        offset: PaddedPieceSize,
        size: PaddedPieceSize,
        file_type: SectorFileType,
    ) -> QuarryResult<bool> {
        if file_type != SectorFileType::UNSEALED {
            return Err(QuarryError::Validation {
                field: "file_type".to_string(),
                message: "allocation checks only support unsealed files".to_string(),
            });
        }

        let (paths, _) = self
            .local
            .acquire_sector(
                sector,
                file_type,
                SectorFileType::empty(),
                PathType::Storage,
            )
            .await?;

        if let Some(path) = paths.get(file_type) {
            let ssize = sector.proof_type.sector_size();
            let pf = PartialFile::open(PaddedPieceSize(ssize), path).await?;
            return Ok(pf.has_allocated(offset, size));
        }

        let mut infos = self.index.storage_find_sector(sector.id, file_type).await?;
        if infos.is_empty() {
            return Err(QuarryError::SectorNotFound {
                sector: sector.id,
                file_type,
                details: None,
            });
        }
        infos.sort_by_key(|info| info.weight);

        for info in &infos {
            for url in &info.urls {
                match self
                    .check_allocated(url, sector.proof_type, offset, size)
                    .await
                {
                    Ok(true) => return Ok(true),
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(url, error = %e, "checking remote allocation failed");
                        continue;
                    }
                }
            }
        }

        Ok(false)
    }

    async fn delete_from_remote(&self, url: &str) -> QuarryResult<()> {
        info!(url, "deleting remote sector file");

        let resp = self
            .client
            .delete(url)
            .headers(self.auth.clone())
            .send()
            .await
            .map_err(|e| QuarryError::http("delete sector file", e))?;

        if resp.status() != StatusCode::OK {
            return Err(QuarryError::HttpStatus {
                operation: "delete sector file".to_string(),
                status: resp.status().as_u16(),
                body: None,
            });
        }
        Ok(())
    }
}

async fn temp_fetch_dest(dest: &Path) -> QuarryResult<PathBuf> {
    let parent = dest.parent().ok_or_else(|| QuarryError::Internal {
        message: format!("fetch destination {} has no parent", dest.display()),
    })?;
    let base = dest.file_name().ok_or_else(|| QuarryError::Internal {
        message: format!("fetch destination {} has no file name", dest.display()),
    })?;

    let tempdir = parent.join(FETCH_TEMP_SUBDIR);
    tokio::fs::create_dir_all(&tempdir).await?;
    Ok(tempdir.join(base))
}

/// Stream a tar response into a directory tree.
async fn extract_tar(resp: reqwest::Response, dest: &Path) -> QuarryResult<()> {
    let stream = resp
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let pinned: std::pin::Pin<Box<dyn AsyncRead + Send>> = Box::pin(StreamReader::new(stream));
    let reader = SyncIoBridge::new(pinned);

    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || tar::Archive::new(reader).unpack(&dest))
        .await
        .map_err(|e| QuarryError::Internal {
            message: format!("tar extraction task panicked: {}", e),
        })??;
    Ok(())
}

/// Stream an octet-stream response straight into a file.
async fn write_stream(resp: reqwest::Response, dest: &Path) -> QuarryResult<()> {
    use tokio::io::AsyncWriteExt;

    let file = tokio::fs::File::create(dest).await?;
    let mut writer = tokio::io::BufWriter::with_capacity(COPY_BUF, file);

    let mut stream = Box::pin(resp.bytes_stream());
    while let Some(chunk) = stream
        .try_next()
        .await
        .map_err(|e| QuarryError::http("read fetch body", e))?
    {
        writer.write_all(&chunk).await?;
    }

    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    Ok(())
}

#[async_trait]
impl Store for RemoteStore {
    async fn acquire_sector(
        &self,
        sector: SectorRef,
        existing: SectorFileType,
        allocate: SectorFileType,
        path_type: PathType,
        op: AcquireMode,
    ) -> QuarryResult<(SectorPaths, SectorStoreIds)> {
        if existing.intersects(allocate) {
            return Err(QuarryError::InvalidAcquire {
                message: "can't both find and allocate a sector".to_string(),
            });
        }

        let _slot = self.claim_fetch_slot(sector.id).await;

        let (mut paths, mut stores) = self
            .local
            .acquire_sector(sector, existing, allocate, path_type)
            .await?;

        let mut to_fetch = SectorFileType::empty();
        for file_type in existing.types() {
            if paths.get(file_type).is_none() {
                to_fetch |= file_type;
            }
        }

        if to_fetch.is_empty() {
            return Ok((paths, stores));
        }

        let (fetch_paths, fetch_ids) = self
            .local
            .acquire_sector(sector, SectorFileType::empty(), to_fetch, path_type)
            .await?;

        // Reservation drops (and releases the space) on every exit path.
        let _reservation = self
            .local
            .reserve(sector, to_fetch, &fetch_ids, path_type)
            .await?;

        for file_type in to_fetch.types() {
            let dest = fetch_paths
                .get(file_type)
                .ok_or_else(|| QuarryError::Internal {
                    message: format!("no allocated destination for {}", file_type),
                })?;
            let storage_id = fetch_ids
                .get(file_type)
                .ok_or_else(|| QuarryError::Internal {
                    message: format!("no storage id for {}", file_type),
                })?;

            let url = self.acquire_from_remote(sector.id, file_type, dest).await?;

            paths.set(file_type, dest.clone());
            stores.set(file_type, storage_id.clone());

            if let Err(e) = self
                .index
                .storage_declare_sector(storage_id, sector.id, file_type, op == AcquireMode::Move)
                .await
            {
                warn!(sector = %sector.id, storage = %storage_id, error = %e,
                    "declaring fetched sector failed");
                continue;
            }

            if op == AcquireMode::Move {
                if let Err(e) = self.delete_from_remote(&url).await {
                    warn!(sector = %sector.id, url, error = %e,
                        "deleting moved sector from source failed");
                }
            }
        }

        Ok((paths, stores))
    }

    async fn remove(
        &self,
        sector: SectorId,
        types: SectorFileType,
        force: bool,
    ) -> QuarryResult<()> {
        if types.bits().count_ones() != 1 {
            return Err(QuarryError::InvalidAcquire {
                message: "delete expects one file type".to_string(),
            });
        }

        self.local.remove(sector, types, force).await?;

        let infos = self.index.storage_find_sector(sector, types).await?;
        for info in &infos {
            // URLs within one location are mirrors; the first successful
            // delete covers them all.
            for url in &info.urls {
                match self.delete_from_remote(url).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(url, error = %e, "removing remote sector file failed");
                        continue;
                    }
                }
            }
        }

        Ok(())
    }

    async fn remove_copies(&self, sector: SectorId, types: SectorFileType) -> QuarryResult<()> {
        // Only local copies; the remote primaries stay declared in the index.
        self.local.remove_copies(sector, types).await
    }

    async fn move_storage(&self, sector: SectorRef, types: SectorFileType) -> QuarryResult<()> {
        // Make sure the data is local first, then hand the move to the local
        // tier.
        self.acquire_sector(
            sector,
            types,
            SectorFileType::empty(),
            PathType::Storage,
            AcquireMode::Move,
        )
        .await?;

        self.local.move_storage(sector, types).await
    }

    async fn fs_stat(&self, id: &StorageId) -> QuarryResult<FsStat> {
        match self.local.fs_stat(id).await {
            Ok(stat) => return Ok(stat),
            Err(e) if is_path_not_found(&e) => {}
            Err(e) => return Err(e),
        }

        let info = self.index.storage_info(id).await?;
        if info.urls.is_empty() {
            return Err(QuarryError::Internal {
                message: format!("no known URLs for remote storage {}", id),
            });
        }

        let mut url = reqwest::Url::parse(&info.urls[0])
            .map_err(|e| QuarryError::http("parse storage url", e))?;
        url.path_segments_mut()
            .map_err(|_| QuarryError::Internal {
                message: format!("storage url {} cannot carry a path", info.urls[0]),
            })?
            .push("stat")
            .push(&id.0);

        let resp = self
            .client
            .get(url)
            .headers(self.auth.clone())
            .send()
            .await
            .map_err(|e| QuarryError::http("fetch storage stats", e))?;

        match resp.status() {
            StatusCode::OK => resp
                .json::<FsStat>()
                .await
                .map_err(|e| QuarryError::http("decode storage stats", e)),
            StatusCode::NOT_FOUND => Err(super::local::path_not_found(id)),
            StatusCode::INTERNAL_SERVER_ERROR => {
                let body = resp.text().await.unwrap_or_default();
                Err(QuarryError::HttpStatus {
                    operation: "fetch storage stats".to_string(),
                    status: 500,
                    body: Some(body),
                })
            }
            status => Err(QuarryError::HttpStatus {
                operation: "fetch storage stats".to_string(),
                status: status.as_u16(),
                body: None,
            }),
        }
    }
}
