//! In-memory worker processes.
//!
//! [`FakeSubprocess`] stands in for a real worker: either it replays a fixed
//! stdout buffer, or a responder task decodes requests and answers them. A
//! cloned [`FakeHandle`] stays with the test so it can inspect what the worker
//! did to the process after ownership moved into the worker.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::task::JoinHandle;

use persistent_worker_core::codec::{read_delimited, write_delimited};
use persistent_worker_core::{Error, Result, WorkRequest, WorkResponse};

use crate::subprocess::{BoxedReader, BoxedWriter, ProcessFactory, ProcessSpec, Subprocess};

/// What a scripted fake does with one decoded request.
#[derive(Debug, Clone)]
pub enum FakeReply {
    /// Write these responses, possibly none, and keep going.
    Responses(Vec<WorkResponse>),
    /// Write raw bytes to stdout and exit.
    Raw(Vec<u8>),
    /// Exit without answering.
    Exit,
}

impl FakeReply {
    pub fn one(response: WorkResponse) -> Self {
        Self::Responses(vec![response])
    }

    pub fn none() -> Self {
        Self::Responses(Vec::new())
    }
}

#[derive(Debug, Default)]
struct FakeState {
    destroyed: AtomicBool,
    destroy_calls: AtomicUsize,
    closed: AtomicBool,
    stdin_closed: AtomicBool,
    stdout_closed: AtomicBool,
    stderr_closed: AtomicBool,
    written: Mutex<Vec<u8>>,
    requests: Mutex<Vec<WorkRequest>>,
}

impl FakeState {
    fn lock_written(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, Vec<WorkRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Test-side view of a [`FakeSubprocess`].
#[derive(Debug, Clone)]
pub struct FakeHandle {
    state: Arc<FakeState>,
}

impl FakeHandle {
    pub fn destroyed(&self) -> bool {
        self.state.destroyed.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.state.destroy_calls.load(Ordering::SeqCst)
    }

    /// Bytes the worker wrote to stdin. Only recorded for canned fakes.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock_written().clone()
    }

    /// Requests the responder decoded. Only recorded for scripted fakes.
    pub fn requests(&self) -> Vec<WorkRequest> {
        self.state.lock_requests().clone()
    }

    /// All three streams have been dropped or shut down.
    pub fn streams_closed(&self) -> bool {
        self.state.stdin_closed.load(Ordering::SeqCst)
            && self.state.stdout_closed.load(Ordering::SeqCst)
            && self.state.stderr_closed.load(Ordering::SeqCst)
    }

    /// `close()` was called on the process.
    pub fn closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn stdin_closed(&self) -> bool {
        self.state.stdin_closed.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Fake Subprocess
// =============================================================================

/// A worker process that lives entirely in memory.
pub struct FakeSubprocess {
    state: Arc<FakeState>,
    stdin: Option<BoxedWriter>,
    stdout: Option<BoxedReader>,
    stderr: Option<BoxedReader>,
    responder: Option<JoinHandle<()>>,
    exit_code: i32,
}

impl FakeSubprocess {
    /// A process whose stdout is exactly `stdout` and whose stdin records
    /// everything written to it.
    pub fn with_output(stdout: impl Into<Vec<u8>>) -> Self {
        let state = Arc::new(FakeState::default());
        Self {
            stdin: Some(Box::new(CaptureWriter {
                state: state.clone(),
            })),
            stdout: Some(Box::new(Tracked::new(
                io::Cursor::new(stdout.into()),
                state.clone(),
                Stream::Stdout,
            ))),
            stderr: Some(Box::new(Tracked::new(
                io::Cursor::new(Vec::new()),
                state.clone(),
                Stream::Stderr,
            ))),
            responder: None,
            exit_code: 0,
            state,
        }
    }

    /// A process that replies with the given responses in order.
    pub fn with_responses(responses: &[WorkResponse]) -> Self {
        let mut stdout = Vec::new();
        for response in responses {
            stdout.extend(prost::Message::encode_length_delimited_to_vec(response));
        }
        Self::with_output(stdout)
    }

    /// A process that decodes each request from stdin and lets `handler`
    /// decide the reply. Must be called from within a Tokio runtime.
    pub fn scripted<F>(handler: F) -> Self
    where
        F: FnMut(WorkRequest) -> FakeReply + Send + 'static,
    {
        let state = Arc::new(FakeState::default());
        let (stdin_writer, stdin_reader) = tokio::io::duplex(64 * 1024);
        let (stdout_writer, stdout_reader) = tokio::io::duplex(64 * 1024);

        let responder = tokio::spawn(respond(
            stdin_reader,
            stdout_writer,
            handler,
            state.clone(),
        ));

        Self {
            stdin: Some(Box::new(Tracked::new(
                stdin_writer,
                state.clone(),
                Stream::Stdin,
            ))),
            stdout: Some(Box::new(Tracked::new(
                stdout_reader,
                state.clone(),
                Stream::Stdout,
            ))),
            stderr: Some(Box::new(Tracked::new(
                io::Cursor::new(Vec::new()),
                state.clone(),
                Stream::Stderr,
            ))),
            responder: Some(responder),
            exit_code: 0,
            state,
        }
    }

    /// A scripted process that answers every request with `exit_code`,
    /// `output` and the request's own id.
    pub fn echo(exit_code: i32, output: impl Into<String>) -> Self {
        let output = output.into();
        Self::scripted(move |request| {
            FakeReply::one(WorkResponse::new(exit_code, output.clone(), request.request_id))
        })
    }

    /// Replace the (empty) stderr stream.
    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = Some(Box::new(Tracked::new(
            io::Cursor::new(stderr.into()),
            self.state.clone(),
            Stream::Stderr,
        )));
        // Dropping the replaced stream flagged stderr as closed.
        self.state.stderr_closed.store(false, Ordering::SeqCst);
        self
    }

    /// Stdin rejects writes as if the process had already exited.
    pub fn with_closed_stdin(self) -> Self {
        self.state.stdin_closed.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn handle(&self) -> FakeHandle {
        FakeHandle {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl Subprocess for FakeSubprocess {
    fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.stdin.take()
    }

    fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.stderr.take()
    }

    fn destroy(&mut self) -> bool {
        self.state.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.state.destroyed.store(true, Ordering::SeqCst);
        if let Some(responder) = self.responder.take() {
            responder.abort();
        }
        true
    }

    fn exit_value(&self) -> Option<i32> {
        self.state
            .destroyed
            .load(Ordering::SeqCst)
            .then_some(self.exit_code)
    }

    fn finished(&mut self) -> bool {
        self.state.destroyed.load(Ordering::SeqCst)
    }

    fn timed_out(&self) -> bool {
        false
    }

    async fn wait_for(&mut self) -> Result<Option<i32>> {
        Ok(self.exit_value())
    }

    fn close(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
    }
}

impl Drop for FakeSubprocess {
    fn drop(&mut self) {
        if let Some(responder) = self.responder.take() {
            responder.abort();
        }
    }
}

async fn respond<F>(
    mut stdin: tokio::io::DuplexStream,
    mut stdout: tokio::io::DuplexStream,
    mut handler: F,
    state: Arc<FakeState>,
) where
    F: FnMut(WorkRequest) -> FakeReply + Send + 'static,
{
    loop {
        let request = match read_delimited::<WorkRequest, _>(&mut stdin, usize::MAX).await {
            Ok(Some(request)) => request,
            Ok(None) | Err(_) => break,
        };
        state.lock_requests().push(request.clone());

        match handler(request) {
            FakeReply::Responses(responses) => {
                for response in &responses {
                    if write_delimited(&mut stdout, response).await.is_err() {
                        return;
                    }
                }
            }
            FakeReply::Raw(bytes) => {
                let _ = stdout.write_all(&bytes).await;
                break;
            }
            FakeReply::Exit => break,
        }
    }
    let _ = stdout.shutdown().await;
}

// =============================================================================
// Stream Wrappers
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

/// Marks its stream closed in the shared state when dropped or shut down.
struct Tracked<T> {
    inner: T,
    state: Arc<FakeState>,
    stream: Stream,
}

impl<T> Tracked<T> {
    fn new(inner: T, state: Arc<FakeState>, stream: Stream) -> Self {
        Self {
            inner,
            state,
            stream,
        }
    }

    fn mark_closed(&self) {
        let flag = match self.stream {
            Stream::Stdin => &self.state.stdin_closed,
            Stream::Stdout => &self.state.stdout_closed,
            Stream::Stderr => &self.state.stderr_closed,
        };
        flag.store(true, Ordering::SeqCst);
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Tracked<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Tracked<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.state.stdin_closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(broken_pipe()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.mark_closed();
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Stdin of a canned fake: records every byte written.
struct CaptureWriter {
    state: Arc<FakeState>,
}

impl Drop for CaptureWriter {
    fn drop(&mut self) {
        self.state.stdin_closed.store(true, Ordering::SeqCst);
    }
}

impl AsyncWrite for CaptureWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.state.stdin_closed.load(Ordering::SeqCst)
            || self.state.destroyed.load(Ordering::SeqCst)
        {
            return Poll::Ready(Err(broken_pipe()));
        }
        self.state.lock_written().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.state.stdin_closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin is closed")
}

// =============================================================================
// Fake Process Factory
// =============================================================================

/// Hands out queued fake processes in order and remembers every spec it
/// was asked to start.
#[derive(Default)]
pub struct FakeProcessFactory {
    queue: Mutex<VecDeque<FakeSubprocess>>,
    specs: Mutex<Vec<SpawnRecord>>,
}

/// Owned copy of a [`ProcessSpec`] seen by the fake factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRecord {
    pub arguments: Vec<String>,
    pub work_dir: std::path::PathBuf,
    pub log_file: std::path::PathBuf,
}

impl FakeProcessFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a process and return a handle to it.
    pub fn push(&self, process: FakeSubprocess) -> FakeHandle {
        let handle = process.handle();
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(process);
        handle
    }

    pub fn spawned(&self) -> Vec<SpawnRecord> {
        self.specs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProcessFactory for FakeProcessFactory {
    fn create_process(&self, spec: &ProcessSpec<'_>) -> Result<Box<dyn Subprocess>> {
        let process = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| Error::spawn("no fake process queued"))?;

        self.specs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SpawnRecord {
                arguments: spec.key.arguments().to_vec(),
                work_dir: spec.work_dir.to_path_buf(),
                log_file: spec.log_file.to_path_buf(),
            });

        Ok(Box::new(process))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_canned_fake_records_stdin() {
        let mut process = FakeSubprocess::with_output(b"canned".to_vec());
        let handle = process.handle();

        let mut stdin = process.take_stdin().unwrap();
        let mut stdout = process.take_stdout().unwrap();
        stdin.write_all(b"hello").await.unwrap();

        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"canned");
        assert_eq!(handle.written(), b"hello");
        assert!(!handle.destroyed());
        assert_eq!(process.exit_value(), None);

        assert!(process.destroy());
        assert!(handle.destroyed());
        assert_eq!(process.exit_value(), Some(0));
        assert!(stdin.write_all(b"more").await.is_err());
    }

    #[tokio::test]
    async fn test_streams_closed_after_drop() {
        let mut process = FakeSubprocess::with_output(Vec::new());
        let handle = process.handle();
        assert!(!handle.streams_closed());

        drop(process.take_stdin());
        drop(process.take_stdout());
        assert!(!handle.streams_closed());
        drop(process.take_stderr());
        assert!(handle.streams_closed());
    }

    #[tokio::test]
    async fn test_scripted_fake_answers_requests() {
        let mut process = FakeSubprocess::echo(0, "done");
        let handle = process.handle();
        let mut stdin = process.take_stdin().unwrap();
        let mut stdout = process.take_stdout().unwrap();

        write_delimited(&mut stdin, &WorkRequest::new(["a"]).with_request_id(7))
            .await
            .unwrap();
        let response: WorkResponse = read_delimited(&mut stdout, 1024).await.unwrap().unwrap();

        assert_eq!(response, WorkResponse::new(0, "done", 7));
        assert_eq!(handle.requests().len(), 1);
        assert_eq!(handle.requests()[0].arguments, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_factory_hands_out_in_order() {
        let factory = FakeProcessFactory::new();
        let first = factory.push(FakeSubprocess::with_output(Vec::new()));
        factory.push(FakeSubprocess::with_output(Vec::new()));

        let key = persistent_worker_core::WorkerKey::builder("Test", "/exec")
            .arguments(["worker"])
            .build();
        let spec = ProcessSpec {
            key: &key,
            work_dir: std::path::Path::new("/exec"),
            log_file: std::path::Path::new("/tmp/w.log"),
        };

        let mut process = factory.create_process(&spec).unwrap();
        process.destroy();
        assert!(first.destroyed());
        factory.create_process(&spec).unwrap();
        assert!(matches!(
            factory.create_process(&spec),
            Err(Error::Spawn(_))
        ));
        assert_eq!(factory.spawned().len(), 2);
        assert_eq!(factory.spawned()[0].arguments, vec!["worker".to_string()]);
    }
}
