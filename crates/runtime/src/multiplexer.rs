//! Multiplexed workers.
//!
//! A [`WorkerMultiplexer`] owns one subprocess shared by many
//! [`WorkerProxy`] handles. Requests are written under an async mutex; a
//! single reader task decodes responses and hands each one to the proxy that
//! registered its `request_id`. If the stream fails, every waiting proxy
//! receives the failure and the multiplexer is dead for good.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use persistent_worker_core::codec;
use persistent_worker_core::{Error, Result, WorkRequest, WorkResponse, WorkerKey};
use persistent_worker_sandbox::{SandboxInputs, SandboxOutputs};

use crate::metrics;
use crate::subprocess::{BoxedReader, BoxedWriter, ProcessFactory, ProcessSpec, Subprocess};
use crate::worker::{
    drain_to_log, PersistentWorker, WorkerState, DEFAULT_MAX_MESSAGE_BYTES,
    DEFAULT_SHUTDOWN_TIMEOUT,
};

type Waiter = oneshot::Sender<Result<WorkResponse>>;

/// Why a multiplexer stopped. Replayed as a fresh [`Error`] to every caller
/// that was waiting, or arrives later.
#[derive(Debug, Clone)]
enum DeathCause {
    EndOfStream,
    Protocol(String),
    Io(std::io::ErrorKind, String),
    Destroyed,
}

impl DeathCause {
    fn from_error(error: &Error) -> Self {
        match error {
            Error::EndOfStream => Self::EndOfStream,
            Error::Io(e) => Self::Io(e.kind(), e.to_string()),
            Error::Protocol(msg) => Self::Protocol(msg.clone()),
            other => Self::Protocol(other.to_string()),
        }
    }

    fn to_error(&self) -> Error {
        match self {
            Self::EndOfStream => Error::EndOfStream,
            Self::Protocol(msg) => Error::protocol(msg.clone()),
            Self::Io(kind, msg) => Error::Io(std::io::Error::new(*kind, msg.clone())),
            Self::Destroyed => Error::destroyed("multiplexer has been shut down"),
        }
    }
}

#[derive(Default)]
struct Pending {
    waiters: HashMap<i32, Waiter>,
    dead: Option<DeathCause>,
}

fn lock(pending: &Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mark the multiplexer dead and fail everyone still waiting.
fn fail_all(pending: &Mutex<Pending>, cause: DeathCause) {
    let waiters = {
        let mut guard = lock(pending);
        if guard.dead.is_none() {
            guard.dead = Some(cause.clone());
        }
        std::mem::take(&mut guard.waiters)
    };
    for (_, waiter) in waiters {
        let _ = waiter.send(Err(cause.to_error()));
    }
}

// =============================================================================
// Worker Multiplexer
// =============================================================================

pub struct WorkerMultiplexer {
    key: Arc<WorkerKey>,
    log_file: PathBuf,
    shutdown_timeout: Duration,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    process: tokio::sync::Mutex<Option<Box<dyn Subprocess>>>,
    pending: Arc<Mutex<Pending>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl WorkerMultiplexer {
    /// Spawn the shared process and its reader task. Must be called from
    /// within a Tokio runtime.
    pub fn start(
        key: Arc<WorkerKey>,
        work_dir: &Path,
        log_file: &Path,
        process_factory: &dyn ProcessFactory,
        max_message_bytes: usize,
        shutdown_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let spec = ProcessSpec {
            key: &key,
            work_dir,
            log_file,
        };
        let mut process = process_factory.create_process(&spec)?;

        let (Some(stdin), Some(stdout)) = (process.take_stdin(), process.take_stdout()) else {
            process.destroy();
            return Err(Error::spawn("worker process has no stdin/stdout pipes"));
        };

        let pending = Arc::new(Mutex::new(Pending::default()));
        let mut tasks = vec![tokio::spawn(read_loop(
            BufReader::new(stdout),
            pending.clone(),
            max_message_bytes,
            key.mnemonic().to_string(),
        ))];
        if let Some(stderr) = process.take_stderr() {
            tasks.push(tokio::spawn(drain_to_log(stderr, log_file.to_path_buf())));
        }

        tracing::info!(
            mnemonic = %key.mnemonic(),
            key_hash = %key.fingerprint(),
            pid = ?process.pid(),
            log_file = %log_file.display(),
            "Multiplexer process started"
        );

        Ok(Arc::new(Self {
            key,
            log_file: log_file.to_path_buf(),
            shutdown_timeout,
            writer: tokio::sync::Mutex::new(Some(stdin)),
            process: tokio::sync::Mutex::new(Some(process)),
            pending,
            tasks: Mutex::new(tasks),
            destroyed: AtomicBool::new(false),
        }))
    }

    pub fn key(&self) -> &Arc<WorkerKey> {
        &self.key
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// False once the stream has failed or the multiplexer was destroyed.
    pub fn is_alive(&self) -> bool {
        lock(&self.pending).dead.is_none()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).waiters.len()
    }

    /// Reserve `request_id` and get the receiver its response will arrive on.
    pub fn register(&self, request_id: i32) -> Result<oneshot::Receiver<Result<WorkResponse>>> {
        let mut pending = lock(&self.pending);
        if let Some(cause) = &pending.dead {
            return Err(cause.to_error());
        }
        if pending.waiters.contains_key(&request_id) {
            return Err(Error::contract(format!(
                "request_id {} is already outstanding on this multiplexer",
                request_id
            )));
        }
        let (tx, rx) = oneshot::channel();
        pending.waiters.insert(request_id, tx);
        Ok(rx)
    }

    /// Drop the registration for `request_id`, if any.
    pub fn cancel(&self, request_id: i32) {
        lock(&self.pending).waiters.remove(&request_id);
    }

    /// Write one request frame. The id must already be registered.
    pub async fn send(&self, request: &WorkRequest) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let result = match writer.as_mut() {
            Some(stdin) => codec::write_delimited(stdin, request).await,
            None => Err(Error::destroyed("multiplexer has been shut down")),
        };
        if let Err(e) = &result {
            self.cancel(request.request_id);
            metrics::track_failure(self.key.mnemonic(), e.kind());
        } else {
            metrics::track_request(self.key.mnemonic());
        }
        result
    }

    /// Kill the shared process and fail all outstanding requests. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        fail_all(&self.pending, DeathCause::Destroyed);

        let mut process = self.process.lock().await.take();
        if let Some(process) = process.as_mut() {
            process.destroy();
        }

        if let Some(mut stdin) = self.writer.lock().await.take() {
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(error = %e, "Error closing multiplexer stdin");
            }
        }

        if let Some(mut process) = process {
            if tokio::time::timeout(self.shutdown_timeout, process.wait_for())
                .await
                .is_err()
            {
                tracing::warn!(
                    mnemonic = %self.key.mnemonic(),
                    "Multiplexer process did not exit in time"
                );
            }
            process.close();
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        metrics::track_destroyed(self.key.mnemonic());
        tracing::info!(mnemonic = %self.key.mnemonic(), "Multiplexer destroyed");
    }
}

impl Drop for WorkerMultiplexer {
    fn drop(&mut self) {
        if let Some(process) = self.process.get_mut().as_mut() {
            process.destroy();
        }
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

async fn read_loop(
    mut stdout: BufReader<BoxedReader>,
    pending: Arc<Mutex<Pending>>,
    max_message_bytes: usize,
    mnemonic: String,
) {
    let cause = loop {
        match codec::read_delimited::<WorkResponse, _>(&mut stdout, max_message_bytes).await {
            Ok(Some(response)) => {
                let waiter = lock(&pending).waiters.remove(&response.request_id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(response));
                    }
                    None => tracing::warn!(
                        mnemonic = %mnemonic,
                        request_id = response.request_id,
                        "Dropping response for unknown request"
                    ),
                }
            }
            Ok(None) => break DeathCause::EndOfStream,
            Err(e) => {
                metrics::track_failure(&mnemonic, e.kind());
                break DeathCause::from_error(&e);
            }
        }
    };
    tracing::warn!(mnemonic = %mnemonic, cause = ?cause, "Multiplexer stream closed");
    fail_all(&pending, cause);
}

// =============================================================================
// Registry
// =============================================================================

struct RegistryEntry {
    multiplexer: Arc<WorkerMultiplexer>,
    refs: usize,
}

/// One live multiplexer per key, shared by reference count.
#[derive(Default)]
pub struct MultiplexerRegistry {
    entries: DashMap<WorkerKey, RegistryEntry>,
}

impl MultiplexerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the multiplexer for `key`, starting one if none is alive.
    pub fn acquire(
        &self,
        key: &Arc<WorkerKey>,
        work_dir: &Path,
        log_file: &Path,
        process_factory: &dyn ProcessFactory,
        max_message_bytes: usize,
        shutdown_timeout: Duration,
    ) -> Result<Arc<WorkerMultiplexer>> {
        let start = || {
            WorkerMultiplexer::start(
                key.clone(),
                work_dir,
                log_file,
                process_factory,
                max_message_bytes,
                shutdown_timeout,
            )
        };

        match self.entries.entry(key.as_ref().clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if !entry.multiplexer.is_alive() {
                    // Holders of the dead one release it outside the count.
                    entry.multiplexer = start()?;
                    entry.refs = 0;
                }
                entry.refs += 1;
                Ok(entry.multiplexer.clone())
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let multiplexer = start()?;
                vacant.insert(RegistryEntry {
                    multiplexer: multiplexer.clone(),
                    refs: 1,
                });
                Ok(multiplexer)
            }
        }
    }

    /// Drop one reference to `multiplexer`. Returns it when this was the last
    /// reference, so the caller can destroy it outside the map lock.
    pub fn release(
        &self,
        key: &WorkerKey,
        multiplexer: &Arc<WorkerMultiplexer>,
    ) -> Option<Arc<WorkerMultiplexer>> {
        let removed = self.entries.remove_if_mut(key, |_, entry| {
            if Arc::ptr_eq(&entry.multiplexer, multiplexer) {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            } else {
                false
            }
        });
        match removed {
            Some((_, entry)) => Some(entry.multiplexer),
            // Replaced after dying; nobody else can reach the old one.
            None if !self.is_current(key, multiplexer) && !multiplexer.is_alive() => {
                Some(multiplexer.clone())
            }
            None => None,
        }
    }

    fn is_current(&self, key: &WorkerKey, multiplexer: &Arc<WorkerMultiplexer>) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.multiplexer, multiplexer))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// References currently held on the live multiplexer for `key`.
    pub fn ref_count(&self, key: &WorkerKey) -> usize {
        self.entries.get(key).map_or(0, |entry| entry.refs)
    }
}

// =============================================================================
// Worker Proxy
// =============================================================================

/// A caller's handle onto a shared multiplexer. Honours the same contract as
/// a singleplex worker: one outstanding request at a time.
///
/// Responses are routed by `request_id`, so every request sent through a
/// proxy must carry a non-zero id that is unique among the requests pending
/// on the shared process. Id `0` marks a singleplex request and is rejected.
pub struct WorkerProxy {
    key: Arc<WorkerKey>,
    id: u32,
    work_dir: PathBuf,
    log_file: PathBuf,
    registry: Arc<MultiplexerRegistry>,
    process_factory: Arc<dyn ProcessFactory>,
    max_message_bytes: usize,
    shutdown_timeout: Duration,

    state: WorkerState,
    multiplexer: Option<Arc<WorkerMultiplexer>>,
    outstanding: Option<(i32, Instant, oneshot::Receiver<Result<WorkResponse>>)>,
}

impl WorkerProxy {
    pub fn new(
        key: Arc<WorkerKey>,
        id: u32,
        work_dir: impl Into<PathBuf>,
        log_file: impl Into<PathBuf>,
        registry: Arc<MultiplexerRegistry>,
        process_factory: Arc<dyn ProcessFactory>,
    ) -> Self {
        Self {
            key,
            id,
            work_dir: work_dir.into(),
            log_file: log_file.into(),
            registry,
            process_factory,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            state: WorkerState::Uninitialized,
            multiplexer: None,
            outstanding: None,
        }
    }

    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn multiplexer(&self) -> Option<&Arc<WorkerMultiplexer>> {
        self.multiplexer.as_ref()
    }

    fn not_ready(&self, operation: &str) -> Error {
        match self.state {
            WorkerState::Destroyed => {
                Error::destroyed(format!("{} called on proxy {}", operation, self.id))
            }
            WorkerState::Uninitialized => {
                Error::contract(format!("{} called before prepare_execution", operation))
            }
            WorkerState::Busy => Error::contract(format!(
                "{} called while a request is outstanding",
                operation
            )),
            WorkerState::Ready => Error::internal(format!("{} rejected in ready state", operation)),
        }
    }
}

#[async_trait]
impl PersistentWorker for WorkerProxy {
    fn key(&self) -> &Arc<WorkerKey> {
        &self.key
    }

    fn id(&self) -> u32 {
        self.id
    }

    fn log_file(&self) -> &Path {
        &self.log_file
    }

    fn state(&self) -> WorkerState {
        self.state
    }

    /// Multiplexed workers share one directory, so inputs are not staged.
    async fn prepare_execution(
        &mut self,
        _inputs: &SandboxInputs,
        _outputs: &SandboxOutputs,
        _worker_files: &BTreeSet<PathBuf>,
    ) -> Result<()> {
        match self.state {
            WorkerState::Uninitialized | WorkerState::Ready => {}
            _ => return Err(self.not_ready("prepare_execution")),
        }
        if self.multiplexer.is_none() {
            let multiplexer = self.registry.acquire(
                &self.key,
                &self.work_dir,
                &self.log_file,
                self.process_factory.as_ref(),
                self.max_message_bytes,
                self.shutdown_timeout,
            )?;
            tracing::debug!(
                proxy_id = self.id,
                mnemonic = %self.key.mnemonic(),
                refs = self.registry.ref_count(&self.key),
                "Proxy attached to multiplexer"
            );
            self.multiplexer = Some(multiplexer);
        }
        self.state = WorkerState::Ready;
        Ok(())
    }

    async fn put_request(&mut self, request: &WorkRequest) -> Result<()> {
        if self.state != WorkerState::Ready {
            return Err(self.not_ready("put_request"));
        }
        if request.request_id == 0 {
            return Err(Error::contract(
                "multiplexed requests need a non-zero request_id",
            ));
        }
        let multiplexer = self
            .multiplexer
            .clone()
            .ok_or_else(|| Error::internal("ready proxy has no multiplexer"))?;

        let receiver = multiplexer.register(request.request_id)?;
        multiplexer.send(request).await?;

        self.outstanding = Some((request.request_id, Instant::now(), receiver));
        self.state = WorkerState::Busy;
        Ok(())
    }

    async fn get_response(&mut self) -> Result<WorkResponse> {
        match self.state {
            WorkerState::Busy => {}
            WorkerState::Ready => {
                return Err(Error::contract(
                    "get_response called without an outstanding request",
                ))
            }
            _ => return Err(self.not_ready("get_response")),
        }
        let (request_id, sent_at, receiver) = self
            .outstanding
            .take()
            .ok_or_else(|| Error::internal("busy proxy has no outstanding request"))?;

        let response = receiver
            .await
            .map_err(|_| Error::destroyed("multiplexer dropped the request"))??;
        self.state = WorkerState::Ready;

        metrics::track_response(
            self.key.mnemonic(),
            response.exit_code,
            sent_at.elapsed().as_secs_f64(),
        );
        tracing::debug!(
            proxy_id = self.id,
            request_id,
            exit_code = response.exit_code,
            "Received multiplexed response"
        );
        Ok(response)
    }

    async fn finish_execution(&mut self, _exec_root: &Path) -> Result<Vec<PathBuf>> {
        if self.state != WorkerState::Ready {
            return Err(self.not_ready("finish_execution"));
        }
        Ok(Vec::new())
    }

    async fn destroy(&mut self) {
        if self.state == WorkerState::Destroyed {
            return;
        }
        self.state = WorkerState::Destroyed;

        let Some(multiplexer) = self.multiplexer.take() else {
            return;
        };
        if let Some((request_id, _, _)) = self.outstanding.take() {
            multiplexer.cancel(request_id);
        }
        if let Some(last) = self.registry.release(&self.key, &multiplexer) {
            last.destroy().await;
        }
        tracing::debug!(proxy_id = self.id, "Proxy destroyed");
    }
}

impl Drop for WorkerProxy {
    fn drop(&mut self) {
        if let Some(multiplexer) = self.multiplexer.take() {
            if let Some((request_id, _, _)) = self.outstanding.take() {
                multiplexer.cancel(request_id);
            }
            // Dropping the last Arc kills the process through the
            // multiplexer's own Drop.
            drop(self.registry.release(&self.key, &multiplexer));
        }
    }
}
