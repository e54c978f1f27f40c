//! Error types for persistent workers.

use thiserror::Error;

/// Result type alias using the worker Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for persistent workers.
///
/// Every variant is local to a single worker instance. The pool decides what
/// to do with a failed worker; the classification helpers below tell it which
/// kind of failure it is looking at.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Contract Violations
    // =========================================================================
    #[error("Worker contract violated: {0}")]
    Contract(String),

    #[error("Worker is destroyed: {0}")]
    Destroyed(String),

    // =========================================================================
    // Stream Errors
    // =========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker stream closed before a response was read")]
    EndOfStream,

    #[error("Protocol error: {0}")]
    Protocol(String),

    // =========================================================================
    // Process & Sandbox Errors
    // =========================================================================
    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Security violation: {0}")]
    SecurityViolation(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a contract violation error.
    pub fn contract(msg: impl Into<String>) -> Self {
        Self::Contract(msg.into())
    }

    /// Create a destroyed-worker error.
    pub fn destroyed(msg: impl Into<String>) -> Self {
        Self::Destroyed(msg.into())
    }

    /// Create a protocol (framing) error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a spawn error.
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    /// Create a sandbox error.
    pub fn sandbox(msg: impl Into<String>) -> Self {
        Self::Sandbox(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// A bug in the caller. The pool must not retry these.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::Contract(_) | Self::Destroyed(_))
    }

    /// The subprocess wrote bytes that are not a valid frame.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// The stream closed cleanly at a frame boundary.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// Whether the worker that produced this error must be destroyed.
    pub fn is_worker_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::EndOfStream | Self::Protocol(_) | Self::Spawn(_)
        )
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Contract(_) => "contract",
            Self::Destroyed(_) => "destroyed",
            Self::Io(_) => "io",
            Self::EndOfStream => "end_of_stream",
            Self::Protocol(_) => "protocol",
            Self::Spawn(_) => "spawn",
            Self::Sandbox(_) => "sandbox",
            Self::SecurityViolation(_) => "security",
            Self::Config(_) => "config",
            Self::Internal(_) | Self::Other(_) => "internal",
        }
    }
}
