//! The upload driver: one task per upload, driven by commands from its
//! [`UploadHandle`].
//!
//! The task owns the pending/in-flight/accepted sets outright, so pause,
//! resume and cancel are messages handled between chunk completions rather
//! than flags raced by background timers.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use ferry_types::{ChunkAck, CompleteResponse, ErrorCode, StartSessionRequest};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::plan::ChunkPlan;
use crate::progress::{DriverState, UploadProgress};
use crate::transport::{TransportError, UploadTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCommand {
    /// Stop dispatching and abort in-flight chunk requests.
    Pause,
    /// Leave `Paused`: re-query the server and continue.
    Resume,
    /// Leave `Error`: re-query the server and continue.
    Retry,
    /// Abandon the upload and delete the server-side session.
    Cancel,
}

/// Why the driver stopped making progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    /// The chunk whose upload failed, if the failure was chunk-specific.
    pub chunk_index: Option<u32>,
    pub code: ErrorCode,
    pub message: String,
}

impl UploadFailure {
    fn new(chunk_index: Option<u32>, err: TransportError) -> Self {
        Self {
            chunk_index,
            code: err.code,
            message: err.message,
        }
    }
}

impl fmt::Display for UploadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.chunk_index {
            Some(index) => write!(f, "chunk {}: {}: {}", index, self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for UploadFailure {}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("upload cancelled")]
    Cancelled,

    /// The driver was in `Error` when its last handle went away.
    #[error("upload failed: {0}")]
    Failed(UploadFailure),

    /// The driver was paused when its last handle went away.
    #[error("upload paused at {received}/{total} chunks and abandoned")]
    Abandoned { received: u32, total: u32 },

    #[error("upload task died: {0}")]
    TaskFailed(String),
}

struct Shared {
    progress: Arc<UploadProgress>,
    state: watch::Sender<DriverState>,
    last_error: Mutex<Option<UploadFailure>>,
    session_id: Mutex<Option<String>>,
}

impl Shared {
    fn set_failure(&self, failure: Option<UploadFailure>) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = failure;
        }
    }

    fn set_session_id(&self, id: &str) {
        if let Ok(mut slot) = self.session_id.lock() {
            *slot = Some(id.to_string());
        }
    }
}

/// Control and observe one running upload.
pub struct UploadHandle {
    commands: mpsc::UnboundedSender<DriverCommand>,
    state: watch::Receiver<DriverState>,
    shared: Arc<Shared>,
    task: JoinHandle<Result<CompleteResponse, DriverError>>,
}

impl UploadHandle {
    /// Returns false if the driver has already finished.
    pub fn send(&self, command: DriverCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn pause(&self) -> bool {
        self.send(DriverCommand::Pause)
    }

    pub fn resume(&self) -> bool {
        self.send(DriverCommand::Resume)
    }

    pub fn retry(&self) -> bool {
        self.send(DriverCommand::Retry)
    }

    pub fn cancel(&self) -> bool {
        self.send(DriverCommand::Cancel)
    }

    pub fn state(&self) -> DriverState {
        *self.state.borrow()
    }

    pub fn progress(&self) -> Arc<UploadProgress> {
        self.shared.progress.clone()
    }

    /// `(chunks acknowledged, total chunks)`: where a paused or failed upload
    /// will pick up.
    pub fn resume_point(&self) -> (u32, u32) {
        self.shared.progress.resume_point()
    }

    /// The failure that put the driver into `Error`. Cleared on retry.
    pub fn last_error(&self) -> Option<UploadFailure> {
        self.shared
            .last_error
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or(None)
    }

    /// Known once the session has been started or resumed. Pass it to
    /// [`UploadDriver::resume`] to continue after a restart.
    pub fn session_id(&self) -> Option<String> {
        self.shared
            .session_id
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or(None)
    }

    /// Wait until the driver is paused, failed, completed or cancelled.
    pub async fn wait_settled(&mut self) -> DriverState {
        let settled = self.state.wait_for(DriverState::is_settled).await.map(|state| *state);
        settled.unwrap_or_else(|_| *self.state.borrow())
    }

    /// Wait for the upload to end. Dropping the command channel means a
    /// driver that is (or becomes) paused or failed stops instead of waiting.
    pub async fn finish(self) -> Result<CompleteResponse, DriverError> {
        drop(self.commands);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(DriverError::TaskFailed(e.to_string())),
        }
    }
}

/// Spawns upload tasks over a shared transport.
pub struct UploadDriver<T> {
    transport: Arc<T>,
    config: DriverConfig,
}

impl<T: UploadTransport> UploadDriver<T> {
    pub fn new(transport: T, config: DriverConfig) -> Self {
        Self::with_shared(Arc::new(transport), config)
    }

    pub fn with_shared(transport: Arc<T>, config: DriverConfig) -> Self {
        Self { transport, config }
    }

    /// Upload `source` as `file_name` in a new session.
    pub fn start(&self, source: impl Into<PathBuf>, file_name: impl Into<String>) -> UploadHandle {
        self.spawn(source.into(), file_name.into(), None)
    }

    /// Continue an earlier upload of the same file in `session_id`. Chunks the
    /// server already holds are not sent again.
    pub fn resume(
        &self,
        source: impl Into<PathBuf>,
        file_name: impl Into<String>,
        session_id: impl Into<String>,
    ) -> UploadHandle {
        self.spawn(source.into(), file_name.into(), Some(session_id.into()))
    }

    fn spawn(&self, source: PathBuf, file_name: String, session_id: Option<String>) -> UploadHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(DriverState::Idle);
        let shared = Arc::new(Shared {
            progress: Arc::new(UploadProgress::new()),
            state: state_tx,
            last_error: Mutex::new(None),
            session_id: Mutex::new(session_id.clone()),
        });

        let runner = Runner {
            transport: self.transport.clone(),
            config: self.config.clone(),
            source,
            file_name,
            plan: None,
            session_id,
            pending: BTreeSet::new(),
            accepted: BTreeSet::new(),
            commands: commands_rx,
            listening: true,
            shared: shared.clone(),
        };

        UploadHandle {
            commands: commands_tx,
            state: state_rx,
            shared,
            task: tokio::spawn(runner.run()),
        }
    }
}

enum Step {
    Next(DriverState),
    Finished(Result<CompleteResponse, DriverError>),
}

type ChunkResult = (u32, Result<ChunkAck, TransportError>);

struct Runner<T> {
    transport: Arc<T>,
    config: DriverConfig,
    source: PathBuf,
    file_name: String,
    plan: Option<ChunkPlan>,
    session_id: Option<String>,
    pending: BTreeSet<u32>,
    accepted: BTreeSet<u32>,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    /// False once every handle has been dropped.
    listening: bool,
    shared: Arc<Shared>,
}

impl<T: UploadTransport> Runner<T> {
    async fn run(mut self) -> Result<CompleteResponse, DriverError> {
        let mut state = DriverState::Initiating;
        loop {
            self.enter(state);
            let step = match state {
                DriverState::Idle | DriverState::Initiating => self.initiate().await,
                DriverState::Uploading => self.upload().await,
                DriverState::Paused => self.paused().await,
                DriverState::Error => self.errored().await,
                DriverState::Completed | DriverState::Cancelled => {
                    return Err(DriverError::TaskFailed(format!("re-entered terminal state {:?}", state)));
                }
            };
            match step {
                Step::Next(next) => state = next,
                Step::Finished(Ok(done)) => {
                    self.enter(DriverState::Completed);
                    return Ok(done);
                }
                Step::Finished(Err(DriverError::Cancelled)) => {
                    self.enter(DriverState::Cancelled);
                    return Err(DriverError::Cancelled);
                }
                Step::Finished(Err(e)) => return Err(e),
            }
        }
    }

    fn enter(&self, state: DriverState) {
        debug!("Upload of {}: {:?}", self.file_name, state);
        self.shared.progress.set_state(state);
        self.shared.state.send_replace(state);
    }

    fn fail(&self, failure: UploadFailure) -> Step {
        warn!("Upload of {} failed: {}", self.file_name, failure);
        self.shared.set_failure(Some(failure));
        Step::Next(DriverState::Error)
    }

    async fn next_command(&mut self) -> Option<DriverCommand> {
        if !self.listening {
            return None;
        }
        let command = self.commands.recv().await;
        if command.is_none() {
            self.listening = false;
        }
        command
    }

    // ── Initiating ─────────────────────────────────────────────────────

    async fn initiate(&mut self) -> Step {
        let plan = match self.plan {
            Some(plan) => plan,
            None => match self.make_plan().await {
                Ok(plan) => plan,
                Err(failure) => return self.fail(failure),
            },
        };
        let req = StartSessionRequest {
            file_name: self.file_name.clone(),
            file_size: plan.file_size,
            total_chunks: plan.total_chunks,
            storage_mode: self.config.storage_mode,
        };

        let received = match self.session_id.clone() {
            Some(id) => {
                let transport = &self.transport;
                match with_retry(&self.config, "resume", || transport.resume_session(&id, &req)).await {
                    Ok(received) => received,
                    Err(e) => return self.fail(UploadFailure::new(None, e)),
                }
            }
            None => {
                let transport = &self.transport;
                match with_retry(&self.config, "start", || transport.start_session(&req)).await {
                    Ok(id) => {
                        self.shared.set_session_id(&id);
                        self.session_id = Some(id);
                        Vec::new()
                    }
                    Err(e) => return self.fail(UploadFailure::new(None, e)),
                }
            }
        };

        self.apply_coverage(&received);
        info!(
            "Upload of {} in session {}: {} bytes, {} chunks, {} already on the server",
            self.file_name,
            self.session_id.as_deref().unwrap_or("?"),
            plan.file_size,
            plan.total_chunks,
            self.accepted.len()
        );
        Step::Next(DriverState::Uploading)
    }

    async fn make_plan(&mut self) -> Result<ChunkPlan, UploadFailure> {
        let local = |message: String| UploadFailure {
            chunk_index: None,
            code: ErrorCode::InvalidRequest,
            message,
        };
        let meta = tokio::fs::metadata(&self.source)
            .await
            .map_err(|e| local(format!("cannot read {}: {}", self.source.display(), e)))?;
        let plan = ChunkPlan::new(meta.len(), self.config.chunk_size).ok_or_else(|| {
            local(format!(
                "cannot split {} bytes into chunks of {}",
                meta.len(),
                self.config.chunk_size
            ))
        })?;

        self.shared.progress.set_totals(plan.file_size, plan.total_chunks);
        self.plan = Some(plan);
        Ok(plan)
    }

    /// Take the server's view of which chunks it holds.
    fn apply_coverage(&mut self, received: &[u32]) {
        let Some(plan) = self.plan else { return };
        self.accepted = received
            .iter()
            .copied()
            .filter(|i| *i < plan.total_chunks)
            .collect();
        self.pending = (0..plan.total_chunks)
            .filter(|i| !self.accepted.contains(i))
            .collect();

        let bytes: u64 = self.accepted.iter().map(|i| plan.range(*i).1 as u64).sum();
        self.shared
            .progress
            .set_done(bytes, self.accepted.len() as u32);
    }

    /// Re-query the server and recompute what is left to send.
    async fn refresh(&mut self, session_id: &str) -> Result<(), Step> {
        let transport = &self.transport;
        let status = match with_retry(&self.config, "status", || transport.status(session_id)).await {
            Ok(status) => status,
            Err(e) => return Err(self.fail(UploadFailure::new(None, e))),
        };
        if let Some(plan) = self.plan {
            if status.total_chunks != plan.total_chunks || status.file_size != plan.file_size {
                return Err(self.fail(UploadFailure {
                    chunk_index: None,
                    code: ErrorCode::SessionMismatch,
                    message: format!(
                        "session {} holds a {} byte / {} chunk upload, expected {} / {}",
                        session_id, status.file_size, status.total_chunks, plan.file_size, plan.total_chunks
                    ),
                }));
            }
        }
        self.apply_coverage(&status.received_chunks);
        Ok(())
    }

    /// Back to work after `Paused` or `Error`.
    async fn reenter(&mut self) -> Step {
        self.shared.set_failure(None);
        let (Some(plan), Some(session_id)) = (self.plan, self.session_id.clone()) else {
            return Step::Next(DriverState::Initiating);
        };
        // With every chunk accepted the session may already be merged and
        // gone; `complete` answers for it either way, `status` would not.
        if self.pending.is_empty() && self.accepted.len() == plan.total_chunks as usize {
            return Step::Next(DriverState::Uploading);
        }
        match self.refresh(&session_id).await {
            Ok(()) => Step::Next(DriverState::Uploading),
            Err(step) => step,
        }
    }

    // ── Uploading ──────────────────────────────────────────────────────

    async fn upload(&mut self) -> Step {
        let (Some(plan), Some(session_id)) = (self.plan, self.session_id.clone()) else {
            return Step::Next(DriverState::Initiating);
        };
        let concurrency = self.config.concurrency.max(1);
        let mut tasks: JoinSet<ChunkResult> = JoinSet::new();
        let mut in_flight: BTreeSet<u32> = BTreeSet::new();

        loop {
            while in_flight.len() < concurrency {
                let Some(index) = self.pending.pop_first() else {
                    break;
                };
                in_flight.insert(index);
                tasks.spawn(send_chunk(
                    self.transport.clone(),
                    self.config.clone(),
                    self.source.clone(),
                    plan,
                    session_id.clone(),
                    index,
                ));
            }

            if in_flight.is_empty() {
                match self.finalize(&session_id).await {
                    Some(step) => return step,
                    // The server was missing chunks; `pending` was refilled.
                    None => continue,
                }
            }

            tokio::select! {
                Some(joined) = tasks.join_next() => {
                    let (index, result) = match joined {
                        Ok(out) => out,
                        Err(e) => {
                            self.stop_all(&mut tasks, &mut in_flight, plan).await;
                            return self.fail(UploadFailure {
                                chunk_index: None,
                                code: ErrorCode::Internal,
                                message: format!("chunk task failed: {}", e),
                            });
                        }
                    };
                    in_flight.remove(&index);
                    match result {
                        Ok(ack) => self.accept(plan, index, &ack),
                        Err(e) => {
                            self.pending.insert(index);
                            self.stop_all(&mut tasks, &mut in_flight, plan).await;
                            return self.fail(UploadFailure::new(Some(index), e));
                        }
                    }
                }
                command = self.commands.recv(), if self.listening => match command {
                    Some(DriverCommand::Pause) => {
                        self.stop_all(&mut tasks, &mut in_flight, plan).await;
                        let (done, total) = self.shared.progress.resume_point();
                        info!("Upload of {} paused at {}/{} chunks", self.file_name, done, total);
                        return Step::Next(DriverState::Paused);
                    }
                    Some(DriverCommand::Cancel) => {
                        self.stop_all(&mut tasks, &mut in_flight, plan).await;
                        return self.cancel_session().await;
                    }
                    Some(other) => debug!("Ignoring {:?} while uploading", other),
                    None => self.listening = false,
                },
            }
        }
    }

    fn accept(&mut self, plan: ChunkPlan, index: u32, ack: &ChunkAck) {
        if self.accepted.insert(index) {
            self.shared.progress.chunk_accepted(plan.range(index).1 as u64);
        }
        debug!(
            "Chunk {}/{} of {} accepted{}",
            index,
            plan.total_chunks,
            self.file_name,
            if ack.already_had { " (already stored)" } else { "" }
        );
    }

    /// Abort every in-flight chunk and wait for the aborts to land. Chunks
    /// that finished in the meantime still count; the rest go back to pending.
    async fn stop_all(&mut self, tasks: &mut JoinSet<ChunkResult>, in_flight: &mut BTreeSet<u32>, plan: ChunkPlan) {
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            if let Ok((index, Ok(ack))) = joined {
                in_flight.remove(&index);
                self.accept(plan, index, &ack);
            }
        }
        self.pending.append(in_flight);
    }

    /// Ask the server to merge. `None` means it reported missing chunks and
    /// they are queued again.
    ///
    /// Pause and cancel are handled while the merge runs. The server keeps
    /// merging either way, and a later `complete` returns its result.
    async fn finalize(&mut self, session_id: &str) -> Option<Step> {
        info!("All chunks of {} accepted, finalizing session {}", self.file_name, session_id);
        let merged = complete_when_merged(
            self.transport.clone(),
            self.config.clone(),
            session_id.to_string(),
        );
        tokio::pin!(merged);

        let result = loop {
            tokio::select! {
                result = &mut merged => break result,
                command = self.commands.recv(), if self.listening => match command {
                    Some(DriverCommand::Pause) => {
                        info!("Upload of {} paused while session {} finalizes", self.file_name, session_id);
                        return Some(Step::Next(DriverState::Paused));
                    }
                    Some(DriverCommand::Cancel) => return Some(self.cancel_session().await),
                    Some(other) => debug!("Ignoring {:?} while finalizing", other),
                    None => self.listening = false,
                },
            }
        };

        match result {
            Ok(done) => {
                info!(
                    "Upload of {} complete: {} bytes at {}",
                    self.file_name, done.total_size, done.final_path
                );
                Some(Step::Finished(Ok(done)))
            }
            Err(e) if e.code == ErrorCode::IncompleteUpload => {
                warn!("Session {} is missing chunks, re-checking: {}", session_id, e);
                if let Err(step) = self.refresh(session_id).await {
                    return Some(step);
                }
                if self.pending.is_empty() {
                    Some(self.fail(UploadFailure::new(None, e)))
                } else {
                    None
                }
            }
            Err(e) => Some(self.fail(UploadFailure::new(None, e))),
        }
    }

    // ── Paused / Error ─────────────────────────────────────────────────

    async fn paused(&mut self) -> Step {
        loop {
            match self.next_command().await {
                Some(DriverCommand::Resume) | Some(DriverCommand::Retry) => return self.reenter().await,
                Some(DriverCommand::Cancel) => return self.cancel_session().await,
                Some(DriverCommand::Pause) => {}
                None => {
                    let (received, total) = self.shared.progress.resume_point();
                    return Step::Finished(Err(DriverError::Abandoned { received, total }));
                }
            }
        }
    }

    async fn errored(&mut self) -> Step {
        loop {
            match self.next_command().await {
                Some(DriverCommand::Retry) => {
                    info!("Retrying upload of {}", self.file_name);
                    return self.reenter().await;
                }
                Some(DriverCommand::Cancel) => return self.cancel_session().await,
                Some(other) => debug!("Ignoring {:?} after failure", other),
                None => {
                    let failure = self
                        .shared
                        .last_error
                        .lock()
                        .ok()
                        .and_then(|slot| slot.clone())
                        .unwrap_or(UploadFailure {
                            chunk_index: None,
                            code: ErrorCode::Internal,
                            message: "unknown failure".into(),
                        });
                    return Step::Finished(Err(DriverError::Failed(failure)));
                }
            }
        }
    }

    async fn cancel_session(&mut self) -> Step {
        if let Some(id) = self.session_id.clone() {
            let transport = &self.transport;
            match with_retry(&self.config, "cancel", || transport.cancel(&id)).await {
                Ok(()) => info!("Upload of {} cancelled, session {} removed", self.file_name, id),
                Err(e) if e.code == ErrorCode::SessionNotFound => {
                    info!("Upload of {} cancelled, session {} already gone", self.file_name, id)
                }
                Err(e) => warn!("Upload of {} cancelled, but session {} remains: {}", self.file_name, id, e),
            }
        }
        Step::Finished(Err(DriverError::Cancelled))
    }
}

/// Read, hash and upload one chunk, retrying retryable failures.
async fn send_chunk<T: UploadTransport>(
    transport: Arc<T>,
    config: DriverConfig,
    source: PathBuf,
    plan: ChunkPlan,
    session_id: String,
    index: u32,
) -> ChunkResult {
    let data = match plan.read_chunk(&source, index).await {
        Ok(data) => data,
        Err(e) => {
            return (
                index,
                Err(TransportError::new(
                    ErrorCode::Internal,
                    format!("cannot read chunk {} of {}: {}", index, source.display(), e),
                )),
            );
        }
    };
    let sha256 = hex::encode(Sha256::digest(&data));
    let data = Bytes::from(data);

    let result = with_retry(&config, "chunk upload", || {
        transport.upload_chunk(&session_id, index, plan.total_chunks, data.clone(), Some(&sha256))
    })
    .await;
    (index, result)
}

/// `complete` under `finalize_timeout`. `SessionLocked` means a merge of the
/// session is still running, possibly one started by an earlier call that
/// timed out, so keep asking with backoff until it answers.
async fn complete_when_merged<T: UploadTransport>(
    transport: Arc<T>,
    config: DriverConfig,
    session_id: String,
) -> Result<CompleteResponse, TransportError> {
    let mut waits: u32 = 0;
    loop {
        let result = retry_within(&config, config.finalize_timeout, "complete", || {
            transport.complete(&session_id)
        })
        .await;
        match result {
            Err(e) if e.code == ErrorCode::SessionLocked => {
                waits = waits.saturating_add(1);
                let delay = config.backoff(waits);
                debug!("Session {} is still merging, asking again in {:?}", session_id, delay);
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Run `call` under `request_timeout`, retrying retryable failures with
/// exponential backoff up to `max_retries` times.
async fn with_retry<T, F, Fut>(config: &DriverConfig, what: &str, call: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    retry_within(config, Some(config.request_timeout), what, call).await
}

async fn retry_within<T, F, Fut>(
    config: &DriverConfig,
    deadline: Option<Duration>,
    what: &str,
    mut call: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0;
    loop {
        let result = match deadline {
            Some(limit) => match tokio::time::timeout(limit, call()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::timeout(what, limit)),
            },
            None => call().await,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.backoff(attempt);
                warn!(
                    "{} failed ({}), retry {}/{} in {:?}",
                    what, e, attempt, config.max_retries, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast() -> DriverConfig {
        DriverConfig {
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            request_timeout: Duration::from_millis(200),
            max_retries: 3,
            ..DriverConfig::default()
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let out = with_retry(&fast(), "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TransportError::new(ErrorCode::ChunkIoFailure, "disk hiccup"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_ceiling() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = with_retry(&fast(), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::new(ErrorCode::Network, "reset"))
        })
        .await;
        assert_eq!(out.unwrap_err().code, ErrorCode::Network);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = with_retry(&fast(), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::new(ErrorCode::SessionNotFound, "gone"))
        })
        .await;
        assert_eq!(out.unwrap_err().code, ErrorCode::SessionNotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stalled_calls_time_out_and_retry() {
        let calls = AtomicU32::new(0);
        let out = with_retry(&fast(), "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok::<_, TransportError>("done")
        })
        .await;
        assert_eq!(out, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn locked_sessions_are_retried_after_a_delay() {
        let calls = AtomicU32::new(0);
        let out = with_retry(&fast(), "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TransportError::new(ErrorCode::SessionLocked, "merging"))
            } else {
                Ok(())
            }
        })
        .await;
        assert_eq!(out, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_deadline_waits_for_slow_calls() {
        let out = retry_within(&fast(), None, "op", || async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok::<_, TransportError>("merged")
        })
        .await;
        assert_eq!(out, Ok("merged"));
    }

    #[test]
    fn failures_name_their_chunk() {
        let failure = UploadFailure::new(Some(3), TransportError::new(ErrorCode::ChunkIoFailure, "disk full"));
        assert_eq!(failure.to_string(), "chunk 3: chunk_io_failure: disk full");
    }
}
