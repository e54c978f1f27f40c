#![deny(unused)]
//! Sandbox staging for persistent workers.
//!
//! A sandboxed worker runs inside its own directory. Before a request is
//! sent, the declared inputs (and the worker's own files) are materialized
//! there; after the response arrives, the declared outputs are moved back to
//! the exec root.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │  Pool / caller                         │
//! │    ↓ prepare_execution / finish        │
//! ├────────────────────────────────────────┤
//! │  Worker (persistent_worker_runtime)    │
//! │    ↓ delegates to SandboxStager        │
//! ├────────────────────────────────────────┤
//! │  LocalSandbox (copy/symlink/hardlink)  │
//! ├────────────────────────────────────────┤
//! │  <base>/worker-<id>-<mnemonic>/        │
//! └────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use persistent_worker_sandbox::{LocalSandbox, SandboxInputs, SandboxStager};
//!
//! let stager = LocalSandbox::new(StagingStrategy::Symlink);
//! let inputs = SandboxInputs::new().with_file("src/Main.java", exec_root.join("src/Main.java"));
//! stager.stage(&work_dir, &inputs).await?;
//! ```

pub mod engine;

pub use engine::{LocalSandbox, RecordingSandbox, SandboxInputs, SandboxOutputs, SandboxStager};
