//! Singleplex persistent worker.
//!
//! One [`Worker`] owns one subprocess and speaks to it in strict turns: a
//! request is written, then exactly one response is read. The state machine
//! is
//!
//! ```text
//! Uninitialized --prepare_execution--> Ready --put_request--> Busy
//!                                        ^                     |
//!                                        +----get_response-----+
//!
//! (any) --destroy--> Destroyed
//! ```

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

use persistent_worker_core::codec;
use persistent_worker_core::{Error, Result, WorkRequest, WorkResponse, WorkerKey};
use persistent_worker_sandbox::{SandboxInputs, SandboxOutputs, SandboxStager};

use crate::metrics;
use crate::subprocess::{BoxedReader, BoxedWriter, ProcessFactory, ProcessSpec, Subprocess};

/// Default largest accepted response frame.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Default time `destroy` waits for a killed process to be reaped.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Ready,
    Busy,
    Destroyed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Worker Contract
// =============================================================================

/// The contract every worker handle honours, singleplex or proxied.
#[async_trait]
pub trait PersistentWorker: Send {
    fn key(&self) -> &Arc<WorkerKey>;

    fn id(&self) -> u32;

    fn log_file(&self) -> &Path;

    fn state(&self) -> WorkerState;

    /// Get the worker ready for the next request. Must precede the first
    /// `put_request`; may be repeated between requests.
    async fn prepare_execution(
        &mut self,
        inputs: &SandboxInputs,
        outputs: &SandboxOutputs,
        worker_files: &BTreeSet<PathBuf>,
    ) -> Result<()>;

    async fn put_request(&mut self, request: &WorkRequest) -> Result<()>;

    async fn get_response(&mut self) -> Result<WorkResponse>;

    /// Move declared outputs into `exec_root`. Returns the moved paths.
    async fn finish_execution(&mut self, exec_root: &Path) -> Result<Vec<PathBuf>>;

    /// Terminate the worker. Never fails and may be called any number of times.
    async fn destroy(&mut self);
}

// =============================================================================
// Singleplex Worker
// =============================================================================

pub struct Worker {
    key: Arc<WorkerKey>,
    id: u32,
    work_dir: PathBuf,
    log_file: PathBuf,
    process_factory: Arc<dyn ProcessFactory>,
    sandbox: Arc<dyn SandboxStager>,
    max_message_bytes: usize,
    shutdown_timeout: Duration,

    state: WorkerState,
    process: Option<Box<dyn Subprocess>>,
    stdin: Option<BoxedWriter>,
    stdout: Option<BufReader<BoxedReader>>,
    stderr_drain: Option<JoinHandle<()>>,
    outputs: SandboxOutputs,
    outstanding: Option<(i32, Instant)>,
    /// Set once this worker has written into `work_dir`; only then does
    /// `destroy` remove it.
    sandbox_staged: bool,
}

impl Worker {
    pub fn new(
        key: Arc<WorkerKey>,
        id: u32,
        work_dir: impl Into<PathBuf>,
        log_file: impl Into<PathBuf>,
        process_factory: Arc<dyn ProcessFactory>,
        sandbox: Arc<dyn SandboxStager>,
    ) -> Self {
        Self {
            key,
            id,
            work_dir: work_dir.into(),
            log_file: log_file.into(),
            process_factory,
            sandbox,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            state: WorkerState::Uninitialized,
            process: None,
            stdin: None,
            stdout: None,
            stderr_drain: None,
            outputs: SandboxOutputs::new(),
            outstanding: None,
            sandbox_staged: false,
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

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Whether the subprocess is still running. False before the first
    /// `prepare_execution` and after `destroy`.
    pub fn is_alive(&mut self) -> bool {
        self.process.as_mut().is_some_and(|p| p.is_alive())
    }

    fn start_process(&mut self) -> Result<()> {
        let spec = ProcessSpec {
            key: &self.key,
            work_dir: &self.work_dir,
            log_file: &self.log_file,
        };
        let mut process = self.process_factory.create_process(&spec)?;

        let (Some(stdin), Some(stdout)) = (process.take_stdin(), process.take_stdout()) else {
            process.destroy();
            return Err(Error::spawn("worker process has no stdin/stdout pipes"));
        };

        if let Some(stderr) = process.take_stderr() {
            self.stderr_drain = Some(tokio::spawn(drain_to_log(stderr, self.log_file.clone())));
        }

        tracing::info!(
            worker_id = self.id,
            mnemonic = %self.key.mnemonic(),
            key_hash = %self.key.fingerprint(),
            pid = ?process.pid(),
            log_file = %self.log_file.display(),
            "Worker process started"
        );

        self.stdin = Some(stdin);
        self.stdout = Some(BufReader::new(stdout));
        self.process = Some(process);
        Ok(())
    }

    /// A sandbox is wiped on every stage and removed on destroy, so it must
    /// never be the exec root or one of its ancestors.
    fn check_sandbox_dir(&self) -> Result<()> {
        let exec_root = self.key.exec_root();
        if exec_root.starts_with(&self.work_dir) {
            return Err(Error::sandbox(format!(
                "sandbox directory '{}' would contain the exec root '{}'",
                self.work_dir.display(),
                exec_root.display()
            )));
        }
        Ok(())
    }

    /// Error for an operation that needs `Ready` but found something else.
    fn not_ready(&self, operation: &str) -> Error {
        match self.state {
            WorkerState::Destroyed => {
                Error::destroyed(format!("{} called on worker {}", operation, self.id))
            }
            WorkerState::Uninitialized => {
                Error::contract(format!("{} called before prepare_execution", operation))
            }
            WorkerState::Busy => Error::contract(format!(
                "{} called while request {} is outstanding",
                operation,
                self.outstanding.map(|(id, _)| id).unwrap_or_default()
            )),
            WorkerState::Ready => Error::internal(format!("{} rejected in ready state", operation)),
        }
    }

    fn record_failure(&self, error: &Error) {
        metrics::track_failure(self.key.mnemonic(), error.kind());
        tracing::warn!(
            worker_id = self.id,
            mnemonic = %self.key.mnemonic(),
            error = %error,
            "Worker failed"
        );
    }
}

#[async_trait]
impl PersistentWorker for Worker {
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

    async fn prepare_execution(
        &mut self,
        inputs: &SandboxInputs,
        outputs: &SandboxOutputs,
        worker_files: &BTreeSet<PathBuf>,
    ) -> Result<()> {
        match self.state {
            WorkerState::Uninitialized | WorkerState::Ready => {}
            _ => return Err(self.not_ready("prepare_execution")),
        }

        if self.key.must_be_sandboxed() {
            self.check_sandbox_dir()?;
            let mut staged = inputs.clone();
            for name in worker_files {
                if !self.key.worker_files_with_hashes().contains_key(name) {
                    return Err(Error::sandbox(format!(
                        "worker file '{}' is not part of the worker key",
                        name.display()
                    )));
                }
                staged.add_file(name.clone(), self.key.exec_root().join(name));
            }
            self.sandbox_staged = true;
            self.sandbox.stage(&self.work_dir, &staged).await?;
            tracing::debug!(
                worker_id = self.id,
                work_dir = %self.work_dir.display(),
                files = staged.len(),
                "Staged sandbox"
            );
        }
        self.outputs = outputs.clone();

        if self.process.is_none() {
            self.start_process().inspect_err(|e| self.record_failure(e))?;
        }
        self.state = WorkerState::Ready;
        Ok(())
    }

    async fn put_request(&mut self, request: &WorkRequest) -> Result<()> {
        if self.state != WorkerState::Ready {
            return Err(self.not_ready("put_request"));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::internal("ready worker has no stdin"))?;

        if let Err(e) = codec::write_delimited(stdin, request).await {
            self.record_failure(&e);
            return Err(e);
        }

        self.outstanding = Some((request.request_id, Instant::now()));
        self.state = WorkerState::Busy;
        metrics::track_request(self.key.mnemonic());
        tracing::debug!(
            worker_id = self.id,
            request_id = request.request_id,
            arguments = request.arguments.len(),
            "Sent work request"
        );
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
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| Error::internal("busy worker has no stdout"))?;

        let result = match codec::read_delimited::<WorkResponse, _>(stdout, self.max_message_bytes)
            .await
        {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(Error::EndOfStream),
            Err(e) => Err(e),
        };
        let response = result.inspect_err(|e| self.record_failure(e))?;

        let (expected, sent_at) = self
            .outstanding
            .take()
            .ok_or_else(|| Error::internal("busy worker has no outstanding request"))?;
        self.state = WorkerState::Ready;

        if response.request_id != expected {
            let error = Error::protocol(format!(
                "response request_id {} does not match request {}",
                response.request_id, expected
            ));
            self.record_failure(&error);
            return Err(error);
        }

        metrics::track_response(
            self.key.mnemonic(),
            response.exit_code,
            sent_at.elapsed().as_secs_f64(),
        );
        tracing::debug!(
            worker_id = self.id,
            request_id = response.request_id,
            exit_code = response.exit_code,
            "Received work response"
        );
        Ok(response)
    }

    async fn finish_execution(&mut self, exec_root: &Path) -> Result<Vec<PathBuf>> {
        if self.state != WorkerState::Ready {
            return Err(self.not_ready("finish_execution"));
        }
        if !self.key.must_be_sandboxed() {
            return Ok(Vec::new());
        }
        self.sandbox
            .harvest(&self.work_dir, &self.outputs, exec_root)
            .await
    }

    async fn destroy(&mut self) {
        if self.state == WorkerState::Destroyed {
            return;
        }
        let previous = self.state;
        self.state = WorkerState::Destroyed;
        self.outstanding = None;

        let mut process = self.process.take();
        if let Some(process) = process.as_mut() {
            process.destroy();
        }

        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(worker_id = self.id, error = %e, "Error closing worker stdin");
            }
        }
        self.stdout = None;

        if let Some(mut process) = process {
            match tokio::time::timeout(self.shutdown_timeout, process.wait_for()).await {
                Ok(Ok(code)) => {
                    tracing::debug!(worker_id = self.id, exit_code = ?code, "Worker process exited")
                }
                Ok(Err(e)) => {
                    tracing::warn!(worker_id = self.id, error = %e, "Failed to reap worker process")
                }
                Err(_) => tracing::warn!(
                    worker_id = self.id,
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "Worker process did not exit in time"
                ),
            }
            process.close();
        }

        // Stderr hits EOF once the process is gone.
        if let Some(mut drain) = self.stderr_drain.take() {
            if tokio::time::timeout(self.shutdown_timeout, &mut drain)
                .await
                .is_err()
            {
                drain.abort();
                let _ = drain.await;
            }
        }

        if std::mem::take(&mut self.sandbox_staged) {
            if let Err(e) = self.sandbox.cleanup(&self.work_dir).await {
                tracing::warn!(
                    worker_id = self.id,
                    work_dir = %self.work_dir.display(),
                    error = %e,
                    "Failed to remove sandbox"
                );
            }
        }

        metrics::track_destroyed(self.key.mnemonic());
        tracing::info!(
            worker_id = self.id,
            mnemonic = %self.key.mnemonic(),
            previous_state = %previous,
            "Worker destroyed"
        );
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(process) = self.process.as_mut() {
            process.destroy();
        }
        if let Some(drain) = self.stderr_drain.take() {
            drain.abort();
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state)
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

/// Append everything the process writes to stderr to its log file. If the log
/// cannot be opened the bytes are still consumed so the process never blocks.
pub(crate) async fn drain_to_log(mut stderr: BoxedReader, log_file: PathBuf) {
    if let Some(parent) = log_file.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            tracing::debug!(dir = %parent.display(), error = %e, "Cannot create worker log directory");
        }
    }
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .await;

    let copied = match file {
        Ok(mut file) => tokio::io::copy(&mut stderr, &mut file).await,
        Err(e) => {
            tracing::warn!(log_file = %log_file.display(), error = %e, "Cannot open worker log");
            tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await
        }
    };
    if let Err(e) = copied {
        tracing::debug!(log_file = %log_file.display(), error = %e, "Worker stderr closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeProcessFactory, FakeSubprocess};
    use persistent_worker_sandbox::RecordingSandbox;

    fn worker(factory: Arc<FakeProcessFactory>) -> Worker {
        let key = Arc::new(
            WorkerKey::builder("Test", "/exec")
                .arguments(["worker"])
                .build(),
        );
        Worker::new(
            key,
            1,
            "/exec",
            "/tmp/persistent-workers-test/worker-1-Test.log",
            factory,
            Arc::new(RecordingSandbox::new()),
        )
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let factory = Arc::new(FakeProcessFactory::new());
        factory.push(FakeSubprocess::with_responses(&[WorkResponse::new(0, "ok", 0)]));
        let mut w = worker(factory);
        assert_eq!(w.state(), WorkerState::Uninitialized);

        w.prepare_execution(&SandboxInputs::new(), &SandboxOutputs::new(), &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(w.state(), WorkerState::Ready);

        w.put_request(&WorkRequest::new(["a"])).await.unwrap();
        assert_eq!(w.state(), WorkerState::Busy);

        w.get_response().await.unwrap();
        assert_eq!(w.state(), WorkerState::Ready);

        w.destroy().await;
        assert_eq!(w.state(), WorkerState::Destroyed);
    }

    #[tokio::test]
    async fn test_process_created_once() {
        let factory = Arc::new(FakeProcessFactory::new());
        factory.push(FakeSubprocess::with_output(Vec::new()));
        let mut w = worker(factory.clone());

        for _ in 0..3 {
            w.prepare_execution(&SandboxInputs::new(), &SandboxOutputs::new(), &BTreeSet::new())
                .await
                .unwrap();
        }
        assert_eq!(factory.spawned().len(), 1);
        assert_eq!(factory.spawned()[0].work_dir, PathBuf::from("/exec"));
        w.destroy().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_worker_uninitialized() {
        let mut w = worker(Arc::new(FakeProcessFactory::new()));
        let result = w
            .prepare_execution(&SandboxInputs::new(), &SandboxOutputs::new(), &BTreeSet::new())
            .await;
        assert!(matches!(result, Err(Error::Spawn(_))));
        assert_eq!(w.state(), WorkerState::Uninitialized);
        assert!(!w.is_alive());
    }

    #[tokio::test]
    async fn test_drain_survives_unusable_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let log_file = blocker.join("logs/worker-1-Test.log");

        let stderr: BoxedReader = Box::new(&b"lost output\n"[..]);
        drain_to_log(stderr, log_file.clone()).await;
        assert!(!log_file.exists());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(WorkerState::Busy.to_string(), "busy");
        assert_eq!(WorkerState::Destroyed.to_string(), "destroyed");
    }
}
