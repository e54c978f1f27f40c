#![deny(unused)]
//! persistent-worker - send one request to a persistent worker
//!
//! ```text
//! persistent-worker <mnemonic> <program> [args...] < request-args.txt
//! ```
//!
//! Starts `<program>` as a persistent worker rooted at the current directory,
//! sends one work request whose arguments are the lines of stdin, prints the
//! response output and exits with the response's exit code.

use anyhow::{bail, Context};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use persistent_worker_core::{WorkRequest, WorkerConfig, WorkerKey};
use persistent_worker_runtime::WorkerFactory;
use persistent_worker_sandbox::{SandboxInputs, SandboxOutputs};

const USAGE: &str = "usage: persistent-worker <mnemonic> <program> [args...]";

#[derive(Serialize)]
struct ProbeReport<'a> {
    mnemonic: &'a str,
    worker_id: u32,
    exit_code: i32,
    output: &'a str,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::load()?;
    persistent_worker_runtime::configure_tracing(config.json_logs)?;

    let mut args = std::env::args().skip(1);
    let Some(mnemonic) = args.next() else {
        bail!(USAGE);
    };
    let command: Vec<String> = args.collect();
    if command.is_empty() {
        bail!(USAGE);
    }

    let exec_root = std::env::current_dir().context("cannot determine working directory")?;
    let mut builder = WorkerKey::builder(mnemonic.as_str(), exec_root).arguments(command);
    if let Ok(path) = std::env::var("PATH") {
        builder = builder.env_var("PATH", path);
    }
    let key = Arc::new(builder.build());

    let mut request_args = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        request_args.push(line);
    }
    let request = WorkRequest::new(request_args);

    tracing::info!(
        mnemonic = %key.mnemonic(),
        key_hash = %key.fingerprint(),
        arguments = request.arguments.len(),
        "Sending probe request"
    );

    let factory = WorkerFactory::from_config(config.clone());
    let mut worker = factory.create(key).await?;

    let outcome = async {
        worker
            .prepare_execution(&SandboxInputs::new(), &SandboxOutputs::new(), &BTreeSet::new())
            .await?;
        worker.put_request(&request).await?;
        worker.get_response().await
    }
    .await;
    worker.destroy().await;

    let response = outcome.with_context(|| {
        format!("worker failed; see {}", worker.log_file().display())
    })?;

    if config.json_logs {
        let report = ProbeReport {
            mnemonic: &mnemonic,
            worker_id: worker.id(),
            exit_code: response.exit_code,
            output: &response.output,
        };
        println!("{}", serde_json::to_string(&report)?);
    } else {
        print!("{}", response.output);
    }
    std::io::stdout().flush()?;

    std::process::exit(response.exit_code);
}
