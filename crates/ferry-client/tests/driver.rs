use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use ferry_client::{
    DriverConfig, DriverError, DriverState, HttpTransport, TransportError, UploadDriver,
    UploadTransport,
};
use ferry_engine::{EngineConfig, UploadError, UploadService};
use ferry_types::{
    ChunkAck, CompleteResponse, ErrorCode, SessionStatus, StartSessionRequest, StorageMode,
};

/// In-process transport over a real `UploadService`, with fault injection.
struct LocalTransport {
    service: Arc<UploadService>,
    /// Chunk index -> number of upcoming attempts that fail with `ChunkIoFailure`.
    flaky: Mutex<HashMap<u32, u32>>,
    /// Chunk indices that always fail.
    broken: Mutex<HashSet<u32>>,
    /// Added to every chunk upload.
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    chunk_calls: AtomicUsize,
    /// How long a merge holds the session before the real one runs.
    merge_delay: Duration,
    merge_slot: Arc<tokio::sync::Mutex<()>>,
    complete_calls: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn to_transport(e: UploadError) -> TransportError {
    TransportError::new(e.code(), e.to_string())
}

impl LocalTransport {
    fn new(service: Arc<UploadService>) -> Self {
        Self {
            service,
            flaky: Mutex::new(HashMap::new()),
            broken: Mutex::new(HashSet::new()),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            chunk_calls: AtomicUsize::new(0),
            merge_delay: Duration::ZERO,
            merge_slot: Arc::new(tokio::sync::Mutex::new(())),
            complete_calls: AtomicUsize::new(0),
        }
    }

    fn with_merge_delay(mut self, delay: Duration) -> Self {
        self.merge_delay = delay;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn injected_fault(&self, index: u32) -> Option<TransportError> {
        if self.broken.lock().unwrap().contains(&index) {
            return Some(TransportError::new(ErrorCode::ChunkIoFailure, "disk unplugged"));
        }
        let mut flaky = self.flaky.lock().unwrap();
        match flaky.get_mut(&index) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Some(TransportError::new(ErrorCode::ChunkIoFailure, "transient write error"))
            }
            _ => None,
        }
    }
}

impl UploadTransport for LocalTransport {
    async fn start_session(&self, req: &StartSessionRequest) -> Result<String, TransportError> {
        self.service.start_session(req).await.map_err(to_transport)
    }

    async fn resume_session(
        &self,
        session_id: &str,
        req: &StartSessionRequest,
    ) -> Result<Vec<u32>, TransportError> {
        self.service
            .resume_session(session_id, req)
            .await
            .map_err(to_transport)
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        index: u32,
        total_chunks: u32,
        data: Bytes,
        sha256: Option<&str>,
    ) -> Result<ChunkAck, TransportError> {
        self.chunk_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(fault) = self.injected_fault(index) {
            return Err(fault);
        }
        self.service
            .upload_chunk(session_id, index, total_chunks, &data, sha256)
            .await
            .map_err(to_transport)
    }

    async fn status(&self, session_id: &str) -> Result<SessionStatus, TransportError> {
        self.service.get_status(session_id).await.map_err(to_transport)
    }

    async fn complete(&self, session_id: &str) -> Result<CompleteResponse, TransportError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        if self.merge_delay.is_zero() {
            return self.service.complete(session_id).await.map_err(to_transport);
        }
        // A slow server-side merge: it holds the session until done and keeps
        // going when the caller stops waiting.
        let service = self.service.clone();
        let slot = self.merge_slot.clone();
        let delay = self.merge_delay;
        let id = session_id.to_string();
        let merge = tokio::spawn(async move {
            let Ok(_running) = slot.try_lock() else {
                return Err(TransportError::new(ErrorCode::SessionLocked, "merge in progress"));
            };
            if service.get_status(&id).await.is_ok() {
                tokio::time::sleep(delay).await;
            }
            service.complete(&id).await.map_err(to_transport)
        });
        merge
            .await
            .unwrap_or_else(|e| Err(TransportError::new(ErrorCode::Internal, e.to_string())))
    }

    async fn cancel(&self, session_id: &str) -> Result<(), TransportError> {
        self.service.cancel(session_id).await.map_err(to_transport)
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    service: Arc<UploadService>,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::with_root(dir.path().join("server"));
        let service = Arc::new(UploadService::open(config).await.unwrap());
        Self { dir, service }
    }

    fn source(&self, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let path = self.dir.path().join(name);
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }
}

fn config(chunk_size: usize, concurrency: usize) -> DriverConfig {
    DriverConfig {
        chunk_size,
        concurrency,
        max_retries: 3,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        request_timeout: Duration::from_secs(5),
        finalize_timeout: None,
        storage_mode: StorageMode::OnDisk,
    }
}

async fn wait_for_complete_calls(transport: &LocalTransport, at_least: usize) {
    for _ in 0..1000 {
        if transport.complete_calls.load(Ordering::SeqCst) >= at_least {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("driver never asked to complete");
}

fn published_files(fx: &Fixture, session_id: &str) -> usize {
    std::fs::read_dir(fx.dir.path().join("server").join("files").join(session_id))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

async fn wait_for_chunks(handle: &ferry_client::UploadHandle, at_least: u32) {
    for _ in 0..1000 {
        if handle.resume_point().0 >= at_least {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("upload never reached {} chunks", at_least);
}

#[tokio::test]
async fn uploads_and_finalizes() {
    let fx = Fixture::new().await;
    let (path, data) = fx.source("photo.raw", 10_000);
    let transport = Arc::new(LocalTransport::new(fx.service.clone()));
    let driver = UploadDriver::with_shared(transport.clone(), config(1024, 3));

    let handle = driver.start(&path, "photo.raw");
    let progress = handle.progress();
    let done = handle.finish().await.unwrap();

    assert_eq!(done.total_size, 10_000);
    assert_eq!(std::fs::read(&done.final_path).unwrap(), data);
    assert_eq!(progress.state(), DriverState::Completed);
    assert_eq!(progress.resume_point(), (10, 10));
    assert_eq!(transport.chunk_calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn transient_chunk_failures_are_retried() {
    let fx = Fixture::new().await;
    let (path, data) = fx.source("a.bin", 4000);
    let transport = Arc::new(LocalTransport::new(fx.service.clone()));
    transport.flaky.lock().unwrap().insert(2, 2);
    let driver = UploadDriver::with_shared(transport.clone(), config(1000, 2));

    let done = driver.start(&path, "a.bin").finish().await.unwrap();
    assert_eq!(std::fs::read(&done.final_path).unwrap(), data);
    assert_eq!(transport.chunk_calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn exhausted_retries_surface_the_chunk_then_retry_recovers() {
    let fx = Fixture::new().await;
    let (path, data) = fx.source("a.bin", 4000);
    let transport = Arc::new(LocalTransport::new(fx.service.clone()));
    transport.broken.lock().unwrap().insert(1);
    let driver = UploadDriver::with_shared(transport.clone(), config(1000, 1));

    let mut handle = driver.start(&path, "a.bin");
    assert_eq!(handle.wait_settled().await, DriverState::Error);

    let failure = handle.last_error().unwrap();
    assert_eq!(failure.chunk_index, Some(1));
    assert_eq!(failure.code, ErrorCode::ChunkIoFailure);
    let session_id = handle.session_id().unwrap();
    assert!(!fx.service.get_status(&session_id).await.unwrap().is_complete);

    transport.broken.lock().unwrap().clear();
    assert!(handle.retry());
    let done = handle.finish().await.unwrap();
    assert_eq!(std::fs::read(&done.final_path).unwrap(), data);
}

#[tokio::test]
async fn failed_upload_reports_when_abandoned() {
    let fx = Fixture::new().await;
    let (path, _) = fx.source("a.bin", 2000);
    let transport = Arc::new(LocalTransport::new(fx.service.clone()));
    transport.broken.lock().unwrap().insert(0);
    let driver = UploadDriver::with_shared(transport, config(1000, 1));

    match driver.start(&path, "a.bin").finish().await {
        Err(DriverError::Failed(failure)) => assert_eq!(failure.chunk_index, Some(0)),
        other => panic!("expected a chunk failure, got {:?}", other),
    }
}

#[tokio::test]
async fn pause_stops_in_flight_work_and_resume_finishes() {
    let fx = Fixture::new().await;
    let (path, data) = fx.source("movie.mkv", 20 * 512);
    let transport = Arc::new(LocalTransport::new(fx.service.clone()).with_delay(Duration::from_millis(30)));
    let driver = UploadDriver::with_shared(transport.clone(), config(512, 2));

    let mut handle = driver.start(&path, "movie.mkv");
    wait_for_chunks(&handle, 2).await;
    assert!(handle.pause());
    assert_eq!(handle.wait_settled().await, DriverState::Paused);
    assert_eq!(transport.in_flight.load(Ordering::SeqCst), 0);

    let (received, total) = handle.resume_point();
    assert_eq!(total, 20);
    assert!(received < total);
    let session_id = handle.session_id().unwrap();
    let server_side = fx.service.get_status(&session_id).await.unwrap();
    assert!(server_side.received_chunks.len() as u32 >= received);

    // No background progress while paused.
    let calls = transport.chunk_calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.chunk_calls.load(Ordering::SeqCst), calls);

    assert!(handle.resume());
    let done = handle.finish().await.unwrap();
    assert_eq!(std::fs::read(&done.final_path).unwrap(), data);
}

#[tokio::test]
async fn merge_slower_than_the_request_timeout_still_completes() {
    let fx = Fixture::new().await;
    let (path, data) = fx.source("big.bin", 8 * 1024);
    let transport = Arc::new(LocalTransport::new(fx.service.clone()).with_merge_delay(Duration::from_millis(600)));
    let mut cfg = config(1024, 3);
    cfg.request_timeout = Duration::from_millis(100);
    let driver = UploadDriver::with_shared(transport.clone(), cfg);

    let handle = driver.start(&path, "big.bin");
    let progress = handle.progress();
    let done = handle.finish().await.unwrap();

    assert_eq!(progress.state(), DriverState::Completed);
    assert_eq!(std::fs::read(&done.final_path).unwrap(), data);
    assert_eq!(transport.complete_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_finalize_deadline_collects_the_running_merge() {
    let fx = Fixture::new().await;
    let (path, data) = fx.source("big.bin", 8 * 1024);
    let transport = Arc::new(LocalTransport::new(fx.service.clone()).with_merge_delay(Duration::from_millis(500)));
    let mut cfg = config(1024, 3);
    cfg.request_timeout = Duration::from_millis(100);
    cfg.finalize_timeout = Some(Duration::from_millis(100));
    let driver = UploadDriver::with_shared(transport.clone(), cfg);

    let handle = driver.start(&path, "big.bin");
    let progress = handle.progress();
    let done = handle.finish().await.unwrap();

    // The first call gave up, later ones found the merge running and then
    // picked up its result.
    assert_eq!(progress.state(), DriverState::Completed);
    assert!(transport.complete_calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(std::fs::read(&done.final_path).unwrap(), data);
    let session_id = std::path::Path::new(&done.final_path)
        .parent()
        .and_then(|dir| dir.file_name())
        .and_then(|name| name.to_str())
        .unwrap()
        .to_string();
    assert_eq!(published_files(&fx, &session_id), 1);
}

#[tokio::test]
async fn pause_during_finalize_then_resume_completes() {
    let fx = Fixture::new().await;
    let (path, data) = fx.source("a.bin", 4 * 512);
    let transport = Arc::new(LocalTransport::new(fx.service.clone()).with_merge_delay(Duration::from_millis(300)));
    let driver = UploadDriver::with_shared(transport.clone(), config(512, 2));

    let mut handle = driver.start(&path, "a.bin");
    wait_for_complete_calls(&transport, 1).await;
    assert!(handle.pause());
    assert_eq!(handle.wait_settled().await, DriverState::Paused);
    assert_eq!(handle.resume_point(), (4, 4));

    // The merge finishes server-side while the driver sits paused.
    let session_id = handle.session_id().unwrap();
    for _ in 0..500 {
        if fx.service.get_status(&session_id).await.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(matches!(
        fx.service.get_status(&session_id).await,
        Err(UploadError::SessionNotFound(_))
    ));

    assert!(handle.resume());
    let done = handle.finish().await.unwrap();
    assert_eq!(std::fs::read(&done.final_path).unwrap(), data);
    assert_eq!(published_files(&fx, &session_id), 1);
}

#[tokio::test]
async fn concurrency_stays_under_the_cap() {
    let fx = Fixture::new().await;
    let (path, _) = fx.source("a.bin", 16 * 256);
    let transport = Arc::new(LocalTransport::new(fx.service.clone()).with_delay(Duration::from_millis(10)));
    let driver = UploadDriver::with_shared(transport.clone(), config(256, 3));

    driver.start(&path, "a.bin").finish().await.unwrap();
    let peak = transport.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {}", peak);
    assert!(peak >= 2, "uploads never overlapped");
}

#[tokio::test]
async fn cancel_removes_the_session() {
    let fx = Fixture::new().await;
    let (path, _) = fx.source("a.bin", 20 * 512);
    let transport = Arc::new(LocalTransport::new(fx.service.clone()).with_delay(Duration::from_millis(20)));
    let driver = UploadDriver::with_shared(transport, config(512, 2));

    let mut handle = driver.start(&path, "a.bin");
    wait_for_chunks(&handle, 1).await;
    let session_id = handle.session_id().unwrap();
    assert!(handle.cancel());
    assert_eq!(handle.wait_settled().await, DriverState::Cancelled);
    assert!(matches!(handle.finish().await, Err(DriverError::Cancelled)));

    assert!(matches!(
        fx.service.get_status(&session_id).await,
        Err(UploadError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn resume_skips_chunks_already_on_the_server() {
    let fx = Fixture::new().await;
    let (path, data) = fx.source("a.bin", 5000);
    let req = StartSessionRequest {
        file_name: "a.bin".into(),
        file_size: 5000,
        total_chunks: 5,
        storage_mode: StorageMode::OnDisk,
    };
    let session_id = fx.service.start_session(&req).await.unwrap();
    for index in [0u32, 3] {
        let start = index as usize * 1000;
        fx.service
            .upload_chunk(&session_id, index, 5, &data[start..start + 1000], None)
            .await
            .unwrap();
    }

    let transport = Arc::new(LocalTransport::new(fx.service.clone()));
    let driver = UploadDriver::with_shared(transport.clone(), config(1000, 2));
    let done = driver
        .resume(&path, "a.bin", session_id)
        .finish()
        .await
        .unwrap();

    assert_eq!(std::fs::read(&done.final_path).unwrap(), data);
    assert_eq!(transport.chunk_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn resume_with_a_different_file_fails() {
    let fx = Fixture::new().await;
    let (path, _) = fx.source("a.bin", 3000);
    let req = StartSessionRequest {
        file_name: "a.bin".into(),
        file_size: 9999,
        total_chunks: 10,
        storage_mode: StorageMode::OnDisk,
    };
    let session_id = fx.service.start_session(&req).await.unwrap();

    let driver = UploadDriver::new(LocalTransport::new(fx.service.clone()), config(1000, 2));
    let mut handle = driver.resume(&path, "a.bin", session_id);
    assert_eq!(handle.wait_settled().await, DriverState::Error);
    assert_eq!(handle.last_error().unwrap().code, ErrorCode::SessionMismatch);
    assert_eq!(handle.last_error().unwrap().chunk_index, None);
}

#[tokio::test]
async fn empty_file_goes_straight_to_finalize() {
    let fx = Fixture::new().await;
    let (path, _) = fx.source("empty", 0);
    let transport = Arc::new(LocalTransport::new(fx.service.clone()));
    let driver = UploadDriver::with_shared(transport.clone(), config(1000, 2));

    let done = driver.start(&path, "empty").finish().await.unwrap();
    assert_eq!(done.total_size, 0);
    assert_eq!(transport.chunk_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn uploads_over_http() {
    let fx = Fixture::new().await;
    let (path, data) = fx.source("over-the-wire.bin", 3 * 4096 + 17);

    let app = ferry_server::app(ferry_server::AppState {
        service: fx.service.clone(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let transport = HttpTransport::new(format!("http://{}", addr)).unwrap();
    let driver = UploadDriver::new(transport, config(4096, 2));
    let done = driver.start(&path, "over-the-wire.bin").finish().await.unwrap();

    assert_eq!(done.total_size, data.len() as u64);
    assert_eq!(std::fs::read(&done.final_path).unwrap(), data);
}
