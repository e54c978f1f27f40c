#![deny(unused)]
//! Core types for persistent workers.
//!
//! This crate holds the pieces shared by the sandbox and runtime crates: the
//! worker identity ([`WorkerKey`]), the wire messages and their
//! length-delimited codec, configuration, and the error type.

pub mod codec;
pub mod config;
pub mod error;
pub mod fs_policy;
pub mod key;
pub mod protocol;

pub use config::{StagingStrategy, WorkerConfig};
pub use error::{Error, Result};
pub use key::{combine_hashes, hash_worker_files, HashCode, WorkerKey, WorkerKeyBuilder};
pub use protocol::{Input, WorkRequest, WorkResponse};
