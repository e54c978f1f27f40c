#![deny(unused)]
//! Persistent worker runtime.
//!
//! Spawns worker subprocesses, talks to them over length-delimited protobuf
//! frames, and hands them to a pool through [`WorkerFactory`].
//!
//! # Architecture
//!
//! ```text
//! WorkerFactory ──create──▶ Worker ──────────▶ Subprocess (one per worker)
//!       │                    └─ SandboxStager
//!       └──────create──▶ WorkerProxy ──▶ WorkerMultiplexer ──▶ Subprocess
//!                                        (shared per key via MultiplexerRegistry)
//! ```

pub mod factory;
pub mod fake;
pub mod metrics;
pub mod multiplexer;
pub mod subprocess;
pub mod tracing_layer;
pub mod worker;

pub use factory::WorkerFactory;
pub use fake::{FakeHandle, FakeProcessFactory, FakeReply, FakeSubprocess};
pub use multiplexer::{MultiplexerRegistry, WorkerMultiplexer, WorkerProxy};
pub use subprocess::{OsProcessFactory, OsSubprocess, ProcessFactory, ProcessSpec, Subprocess};
pub use tracing_layer::configure_tracing;
pub use worker::{PersistentWorker, Worker, WorkerState};
