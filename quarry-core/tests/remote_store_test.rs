// Remote store tests against a scripted in-process storage peer.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;

use quarry_core::error::{QuarryError, QuarryResult};
use quarry_core::storage::{
    LocalStore, RemoteStore, SectorIndex, StoragePath, Store,
};
use quarry_core::types::{
    AcquireMode, FsStat, PaddedPieceSize, PathType, RegisteredSealProof, SectorFileType, SectorId,
    SectorRef, StorageId, StorageInfo,
};

/// Scripted response for one request path.
#[derive(Clone)]
enum Scripted {
    Octet(Vec<u8>),
    Tar(Vec<u8>),
    Status(u16, String),
    ContentType(String, Vec<u8>),
}

struct ServerState {
    responses: Mutex<HashMap<String, Scripted>>,
    /// Per-path GET counts.
    gets: Mutex<HashMap<String, usize>>,
    deletes: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Mutex<Duration>,
}

struct TestServer {
    base_url: String,
    state: Arc<ServerState>,
}

impl TestServer {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState {
            responses: Mutex::new(HashMap::new()),
            gets: Mutex::new(HashMap::new()),
            deletes: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
        });

        let accept_state = state.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let state = accept_state.clone();
                std::thread::spawn(move || handle_connection(stream, state));
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn serve(&self, path: &str, response: Scripted) {
        self.state
            .responses
            .lock()
            .unwrap()
            .insert(path.to_string(), response);
    }

    fn get_count(&self, path: &str) -> usize {
        self.state
            .gets
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }
}

fn handle_connection(mut stream: std::net::TcpStream, state: Arc<ServerState>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            Err(_) => return,
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let mut parts = request.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_active.fetch_max(active, Ordering::SeqCst);
    let delay = *state.delay.lock().unwrap();
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }

    let response = match method.as_str() {
        "GET" => {
            *state.gets.lock().unwrap().entry(path.clone()).or_insert(0) += 1;
            state.responses.lock().unwrap().get(&path).cloned()
        }
        "DELETE" => {
            state.deletes.lock().unwrap().push(path.clone());
            Some(Scripted::Status(200, String::new()))
        }
        _ => Some(Scripted::Status(405, String::new())),
    };

    let (status, content_type, body) = match response {
        Some(Scripted::Octet(body)) => (200, "application/octet-stream".to_string(), body),
        Some(Scripted::Tar(body)) => (200, "application/x-tar".to_string(), body),
        Some(Scripted::ContentType(ct, body)) => (200, ct, body),
        Some(Scripted::Status(status, body)) => {
            (status, "text/plain".to_string(), body.into_bytes())
        }
        None => (404, "text/plain".to_string(), Vec::new()),
    };

    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        _ => "Error",
    };
    let _ = write!(
        stream,
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        content_type,
        body.len()
    );
    let _ = stream.write_all(&body);
    let _ = stream.flush();

    state.active.fetch_sub(1, Ordering::SeqCst);
}

#[derive(Default)]
struct MockIndex {
    find: Mutex<HashMap<(SectorId, u8), Vec<StorageInfo>>>,
    infos: Mutex<HashMap<StorageId, StorageInfo>>,
    declared: Mutex<Vec<(StorageId, SectorId, SectorFileType, bool)>>,
}

impl MockIndex {
    fn add_location(&self, sector: SectorId, file_type: SectorFileType, info: StorageInfo) {
        self.find
            .lock()
            .unwrap()
            .entry((sector, file_type.bits()))
            .or_default()
            .push(info);
    }
}

#[async_trait]
impl SectorIndex for MockIndex {
    async fn storage_find_sector(
        &self,
        sector: SectorId,
        file_type: SectorFileType,
    ) -> QuarryResult<Vec<StorageInfo>> {
        Ok(self
            .find
            .lock()
            .unwrap()
            .get(&(sector, file_type.bits()))
            .cloned()
            .unwrap_or_default())
    }

    async fn storage_declare_sector(
        &self,
        storage_id: &StorageId,
        sector: SectorId,
        file_type: SectorFileType,
        primary: bool,
    ) -> QuarryResult<()> {
        self.declared
            .lock()
            .unwrap()
            .push((storage_id.clone(), sector, file_type, primary));
        Ok(())
    }

    async fn storage_info(&self, id: &StorageId) -> QuarryResult<StorageInfo> {
        self.infos
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| QuarryError::NotFound {
                resource: format!("storage {}", id),
            })
    }
}

fn sector(number: u64) -> SectorRef {
    SectorRef {
        id: SectorId {
            miner: 1000,
            number,
        },
        proof_type: RegisteredSealProof::StackedDrg2KiBV1,
    }
}

fn local_store(dir: &TempDir) -> Arc<LocalStore> {
    Arc::new(
        LocalStore::new(vec![StoragePath {
            id: StorageId("local".into()),
            root: dir.path().to_path_buf(),
            can_seal: true,
            can_store: true,
            weight: 10,
            capacity: 10 << 30,
        }])
        .unwrap(),
    )
}

fn storage_info(id: &str, urls: Vec<String>, weight: u64) -> StorageInfo {
    StorageInfo {
        id: StorageId(id.into()),
        urls,
        weight,
        can_seal: false,
        can_store: true,
    }
}

fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_path(name).unwrap();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_fetch_each_type_once() {
    let server = TestServer::start();
    let dir = TempDir::new().unwrap();
    let index = Arc::new(MockIndex::default());
    let s = sector(1);

    let sealed_path = "/remote/sealed/s-t01000-1";
    let cache_path = "/remote/cache/s-t01000-1";
    server.serve(sealed_path, Scripted::Octet(vec![1u8; 2048]));
    server.serve(
        cache_path,
        Scripted::Tar(tar_bytes(&[("t_aux", b"taux"), ("p_aux", b"paux")])),
    );

    index.add_location(
        s.id,
        SectorFileType::SEALED,
        storage_info("peer", vec![server.url(sealed_path)], 10),
    );
    index.add_location(
        s.id,
        SectorFileType::CACHE,
        storage_info("peer", vec![server.url(cache_path)], 10),
    );

    let store = Arc::new(RemoteStore::new(
        local_store(&dir),
        index.clone(),
        Default::default(),
        4,
    ));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .acquire_sector(
                    s,
                    SectorFileType::SEALED | SectorFileType::CACHE,
                    SectorFileType::empty(),
                    PathType::Sealing,
                    AcquireMode::Copy,
                )
                .await
                .unwrap()
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    // Exactly one fetch per file type; every caller sees the same paths.
    assert_eq!(server.get_count(sealed_path), 1);
    assert_eq!(server.get_count(cache_path), 1);
    for (paths, _) in &results {
        assert_eq!(paths.sealed, results[0].0.sealed);
        assert_eq!(paths.cache, results[0].0.cache);
    }

    // The fetched tar landed as a directory tree.
    let cache = results[0].0.cache.as_ref().unwrap();
    assert_eq!(std::fs::read(cache.join("t_aux")).unwrap(), b"taux");
    assert_eq!(std::fs::read(cache.join("p_aux")).unwrap(), b"paux");

    let sealed = results[0].0.sealed.as_ref().unwrap();
    assert_eq!(std::fs::metadata(sealed).unwrap().len(), 2048);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn fetches_are_throttled_by_the_limit() {
    let server = TestServer::start();
    server.set_delay(Duration::from_millis(200));
    let dir = TempDir::new().unwrap();
    let index = Arc::new(MockIndex::default());

    for number in 1..=5u64 {
        let s = sector(number);
        let path = format!("/remote/sealed/s-t01000-{}", number);
        server.serve(&path, Scripted::Octet(vec![0u8; 64]));
        index.add_location(
            s.id,
            SectorFileType::SEALED,
            storage_info("peer", vec![server.url(&path)], 10),
        );
    }

    let store = Arc::new(RemoteStore::new(
        local_store(&dir),
        index,
        Default::default(),
        2,
    ));

    let started = Instant::now();
    let mut handles = Vec::new();
    for number in 1..=5u64 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .acquire_sector(
                    sector(number),
                    SectorFileType::SEALED,
                    SectorFileType::empty(),
                    PathType::Sealing,
                    AcquireMode::Copy,
                )
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    let elapsed = started.elapsed();

    // Never more than the limit in flight, and 5 fetches through a 2-wide
    // gate with 200ms latency cannot beat three rounds.
    assert!(server.state.max_active.load(Ordering::SeqCst) <= 2);
    assert!(elapsed >= Duration::from_millis(500), "elapsed {:?}", elapsed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn acquire_move_deletes_the_source() {
    let server = TestServer::start();
    let dir = TempDir::new().unwrap();
    let index = Arc::new(MockIndex::default());
    let s = sector(2);

    let path = "/remote/sealed/s-t01000-2";
    server.serve(path, Scripted::Octet(vec![9u8; 128]));
    index.add_location(
        s.id,
        SectorFileType::SEALED,
        storage_info("peer", vec![server.url(path)], 10),
    );

    let store = RemoteStore::new(local_store(&dir), index.clone(), Default::default(), 2);
    store
        .acquire_sector(
            s,
            SectorFileType::SEALED,
            SectorFileType::empty(),
            PathType::Storage,
            AcquireMode::Move,
        )
        .await
        .unwrap();

    assert_eq!(
        server.state.deletes.lock().unwrap().as_slice(),
        &[path.to_string()]
    );

    // The fetched copy was declared primary in the index.
    let declared = index.declared.lock().unwrap();
    assert_eq!(declared.len(), 1);
    assert!(declared[0].3, "move acquisition must declare primary");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn acquire_rejects_overlapping_masks() {
    let dir = TempDir::new().unwrap();
    let store = RemoteStore::new(
        local_store(&dir),
        Arc::new(MockIndex::default()),
        Default::default(),
        2,
    );

    let err = store
        .acquire_sector(
            sector(3),
            SectorFileType::SEALED,
            SectorFileType::SEALED,
            PathType::Sealing,
            AcquireMode::Copy,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QuarryError::InvalidAcquire { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remove_requires_exactly_one_type() {
    let dir = TempDir::new().unwrap();
    let store = RemoteStore::new(
        local_store(&dir),
        Arc::new(MockIndex::default()),
        Default::default(),
        2,
    );

    let err = store
        .remove(
            sector(4).id,
            SectorFileType::SEALED | SectorFileType::UNSEALED,
            true,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QuarryError::InvalidAcquire { .. }));

    let err = store
        .remove(sector(4).id, SectorFileType::empty(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, QuarryError::InvalidAcquire { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remove_deletes_first_reachable_url_per_location() {
    let server = TestServer::start();
    let dir = TempDir::new().unwrap();
    let index = Arc::new(MockIndex::default());
    let s = sector(5);

    index.add_location(
        s.id,
        SectorFileType::SEALED,
        storage_info(
            "peer-a",
            vec![
                server.url("/remote/a/s-t01000-5"),
                server.url("/remote/a-mirror/s-t01000-5"),
            ],
            10,
        ),
    );
    index.add_location(
        s.id,
        SectorFileType::SEALED,
        storage_info("peer-b", vec![server.url("/remote/b/s-t01000-5")], 20),
    );

    let store = RemoteStore::new(local_store(&dir), index, Default::default(), 2);
    store.remove(s.id, SectorFileType::SEALED, true).await.unwrap();

    // One DELETE per storage location; the mirror URL is skipped.
    let deletes = server.state.deletes.lock().unwrap();
    assert_eq!(
        deletes.as_slice(),
        &["/remote/a/s-t01000-5".to_string(), "/remote/b/s-t01000-5".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_media_type_fails_the_fetch() {
    let server = TestServer::start();
    let dir = TempDir::new().unwrap();
    let index = Arc::new(MockIndex::default());
    let s = sector(6);

    let path = "/remote/sealed/s-t01000-6";
    server.serve(
        path,
        Scripted::ContentType("text/plain".into(), b"not a sector".to_vec()),
    );
    index.add_location(
        s.id,
        SectorFileType::SEALED,
        storage_info("peer", vec![server.url(path)], 10),
    );

    let store = RemoteStore::new(local_store(&dir), index, Default::default(), 2);
    let err = store
        .acquire_sector(
            s,
            SectorFileType::SEALED,
            SectorFileType::empty(),
            PathType::Sealing,
            AcquireMode::Copy,
        )
        .await
        .unwrap_err();

    // The per-URL failure is accumulated under the not-found error.
    match err {
        QuarryError::SectorNotFound { details, .. } => {
            let details = details.unwrap();
            assert!(details.contains("unknown content type"), "{}", details);
        }
        other => panic!("expected SectorNotFound, got {}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fs_stat_falls_back_to_the_remote_endpoint() {
    let server = TestServer::start();
    let dir = TempDir::new().unwrap();
    let index = Arc::new(MockIndex::default());

    let remote_id = StorageId("remote-tier".into());
    index.infos.lock().unwrap().insert(
        remote_id.clone(),
        storage_info("remote-tier", vec![server.url("/remote")], 10),
    );

    let stat = FsStat {
        capacity: 1000,
        available: 400,
        reserved: 100,
    };
    server.serve(
        "/remote/stat/remote-tier",
        Scripted::ContentType(
            "application/json".into(),
            serde_json::to_vec(&stat).unwrap(),
        ),
    );

    let store = RemoteStore::new(local_store(&dir), index.clone(), Default::default(), 2);

    // Local id resolves locally.
    let local = store.fs_stat(&StorageId("local".into())).await.unwrap();
    assert_eq!(local.reserved, 0);

    // Unknown-local id goes to the peer's stat endpoint.
    let remote = store.fs_stat(&remote_id).await.unwrap();
    assert_eq!(remote, stat);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fs_stat_surfaces_500_bodies() {
    let server = TestServer::start();
    let dir = TempDir::new().unwrap();
    let index = Arc::new(MockIndex::default());

    let remote_id = StorageId("broken-tier".into());
    index.infos.lock().unwrap().insert(
        remote_id.clone(),
        storage_info("broken-tier", vec![server.url("/remote")], 10),
    );
    server.serve(
        "/remote/stat/broken-tier",
        Scripted::Status(500, "disk on fire".into()),
    );

    let store = RemoteStore::new(local_store(&dir), index, Default::default(), 2);
    let err = store.fs_stat(&remote_id).await.unwrap_err();
    match err {
        QuarryError::HttpStatus { status, body, .. } => {
            assert_eq!(status, 500);
            assert_eq!(body.as_deref(), Some("disk on fire"));
        }
        other => panic!("expected HttpStatus, got {}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reader_serves_local_unsealed_ranges() {
    let dir = TempDir::new().unwrap();
    let local = local_store(&dir);
    let s = sector(7);

    // Stage an unsealed file directly in the local tier.
    let name = s.id.to_string();
    let mut data = vec![3u8; 1024];
    data.extend_from_slice(&[4u8; 1024]);
    std::fs::write(dir.path().join("unsealed").join(&name), &data).unwrap();

    let store = RemoteStore::new(local, Arc::new(MockIndex::default()), Default::default(), 2);

    let mut reader = store
        .reader(
            s,
            PaddedPieceSize(1024),
            PaddedPieceSize(1024),
            SectorFileType::UNSEALED,
        )
        .await
        .unwrap()
        .expect("range is allocated locally");

    let mut out = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out)
        .await
        .unwrap();
    assert_eq!(out, vec![4u8; 1024]);

    // An unallocated range is a clean None, not an error.
    let missing = store
        .reader(
            s,
            PaddedPieceSize(2048),
            PaddedPieceSize(1024),
            SectorFileType::UNSEALED,
        )
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reader_rejects_non_unsealed_types() {
    let dir = TempDir::new().unwrap();
    let store = RemoteStore::new(
        local_store(&dir),
        Arc::new(MockIndex::default()),
        Default::default(),
        2,
    );

    let result = store
        .reader(
            sector(8),
            PaddedPieceSize(0),
            PaddedPieceSize(128),
            SectorFileType::SEALED,
        )
        .await;
    let err = match result {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    };
    assert!(err.to_string().contains("reader only supports unsealed files"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_allocation_check_treats_416_as_absent() {
    let server = TestServer::start();
    let dir = TempDir::new().unwrap();
    let index = Arc::new(MockIndex::default());
    let s = sector(9);

    let base = "/remote/unsealed/s-t01000-9";
    index.add_location(
        s.id,
        SectorFileType::UNSEALED,
        storage_info("peer", vec![server.url(base)], 10),
    );

    // wire id 0, unpadded offset 0, unpadded size 1016 (1024 padded)
    server.serve(
        &format!("{}/0/allocated/0/1016", base),
        Scripted::Status(416, String::new()),
    );

    let store = RemoteStore::new(local_store(&dir), index, Default::default(), 2);
    let allocated = store
        .is_allocated(
            s,
            PaddedPieceSize(0),
            PaddedPieceSize(1024),
            SectorFileType::UNSEALED,
        )
        .await
        .unwrap();
    assert!(!allocated);

    let reader = store
        .reader(
            s,
            PaddedPieceSize(0),
            PaddedPieceSize(1024),
            SectorFileType::UNSEALED,
        )
        .await
        .unwrap();
    assert!(reader.is_none());
}
