//! Subprocess abstraction.
//!
//! The worker never touches `tokio::process` directly. It asks a
//! [`ProcessFactory`] for a [`Subprocess`], takes its three streams, and from
//! then on only speaks the framed protocol over them. Tests substitute a
//! factory that hands out fake processes replaying canned bytes.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use persistent_worker_core::{Error, Result, WorkerKey};

/// Read half of a subprocess pipe.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of a subprocess pipe.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// =============================================================================
// Subprocess Trait
// =============================================================================

/// A running worker process.
///
/// Streams are handed out once; whoever takes them owns them, and dropping a
/// stream closes it.
#[async_trait]
pub trait Subprocess: Send {
    /// The process's standard input.
    fn take_stdin(&mut self) -> Option<BoxedWriter>;

    /// The process's standard output.
    fn take_stdout(&mut self) -> Option<BoxedReader>;

    /// The process's standard error.
    fn take_stderr(&mut self) -> Option<BoxedReader>;

    /// Forcefully terminate the process. Safe to call repeatedly; returns
    /// `false` only if the kill could not be delivered.
    fn destroy(&mut self) -> bool;

    /// Exit code, once the process has finished.
    fn exit_value(&self) -> Option<i32>;

    /// Whether the process has exited. Does not block.
    fn finished(&mut self) -> bool;

    /// Whether `wait_for` gave up on the process and killed it.
    fn timed_out(&self) -> bool;

    /// Wait for the process to exit and return its exit code.
    async fn wait_for(&mut self) -> Result<Option<i32>>;

    fn is_alive(&mut self) -> bool {
        !self.finished()
    }

    /// Release any streams still held without killing the process.
    fn close(&mut self);

    fn pid(&self) -> Option<u32> {
        None
    }
}

// =============================================================================
// Process Factory
// =============================================================================

/// Everything a factory needs to start a worker process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSpec<'a> {
    pub key: &'a WorkerKey,
    pub work_dir: &'a Path,
    pub log_file: &'a Path,
}

/// Strategy for creating worker processes.
pub trait ProcessFactory: Send + Sync {
    /// Start a process for `spec`. Must be called from within a Tokio runtime.
    fn create_process(&self, spec: &ProcessSpec<'_>) -> Result<Box<dyn Subprocess>>;
}

// =============================================================================
// OS Process Implementation
// =============================================================================

/// Spawns real worker processes with `tokio::process`.
///
/// The command line comes from the key's arguments, the environment is
/// exactly the key's environment, and the working directory is the worker's
/// work dir. All three standard streams are piped.
#[derive(Debug, Clone, Default)]
pub struct OsProcessFactory {
    wait_timeout: Option<Duration>,
}

impl OsProcessFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound how long `wait_for` blocks before killing the process.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }
}

impl ProcessFactory for OsProcessFactory {
    fn create_process(&self, spec: &ProcessSpec<'_>) -> Result<Box<dyn Subprocess>> {
        let (program, args) = spec
            .key
            .arguments()
            .split_first()
            .ok_or_else(|| Error::spawn("worker key has an empty command line"))?;

        let child = tokio::process::Command::new(program)
            .args(args)
            .env_clear()
            .envs(spec.key.env())
            .current_dir(spec.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::spawn(format!(
                    "{} (in {}): {}",
                    program,
                    spec.work_dir.display(),
                    e
                ))
            })?;

        tracing::debug!(
            program = %program,
            pid = ?child.id(),
            work_dir = %spec.work_dir.display(),
            "Spawned worker process"
        );

        Ok(Box::new(OsSubprocess {
            child,
            exit_code: None,
            timed_out: false,
            wait_timeout: self.wait_timeout,
        }))
    }
}

/// A worker process backed by an OS child process.
pub struct OsSubprocess {
    child: tokio::process::Child,
    exit_code: Option<i32>,
    timed_out: bool,
    wait_timeout: Option<Duration>,
}

#[async_trait]
impl Subprocess for OsSubprocess {
    fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.child.stdin.take().map(|s| Box::new(s) as BoxedWriter)
    }

    fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.child.stdout.take().map(|s| Box::new(s) as BoxedReader)
    }

    fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.child.stderr.take().map(|s| Box::new(s) as BoxedReader)
    }

    fn destroy(&mut self) -> bool {
        if self.finished() {
            return true;
        }
        match self.child.start_kill() {
            Ok(()) => true,
            // Already reaped between the check and the kill.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => true,
            Err(e) => {
                tracing::warn!(pid = ?self.child.id(), error = %e, "Failed to kill worker process");
                false
            }
        }
    }

    fn exit_value(&self) -> Option<i32> {
        self.exit_code
    }

    fn finished(&mut self) -> bool {
        if self.exit_code.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(exit_code(status));
                true
            }
            Ok(None) => false,
            Err(_) => false,
        }
    }

    fn timed_out(&self) -> bool {
        self.timed_out
    }

    async fn wait_for(&mut self) -> Result<Option<i32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        let status = match self.wait_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    self.timed_out = true;
                    let _ = self.child.start_kill();
                    self.child.wait().await?
                }
            },
            None => self.child.wait().await?,
        };
        self.exit_code = Some(exit_code(status));
        Ok(self.exit_code)
    }

    fn close(&mut self) {
        self.child.stdin = None;
        self.child.stdout = None;
        self.child.stderr = None;
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Exit code, with signals reported shell-style as 128 + signal.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}
