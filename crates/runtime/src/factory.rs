//! Creates and validates workers for a pool.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use persistent_worker_core::{Result, WorkerConfig, WorkerKey};
use persistent_worker_sandbox::{LocalSandbox, SandboxStager};

use crate::multiplexer::{MultiplexerRegistry, WorkerProxy};
use crate::subprocess::{OsProcessFactory, ProcessFactory};
use crate::worker::{PersistentWorker, Worker, WorkerState};

/// Builds workers for keys and decides whether a pooled worker may be
/// reused for a key.
pub struct WorkerFactory {
    config: WorkerConfig,
    process_factory: Arc<dyn ProcessFactory>,
    sandbox: Arc<dyn SandboxStager>,
    multiplexers: Arc<MultiplexerRegistry>,
    next_id: AtomicU32,
}

impl WorkerFactory {
    pub fn new(
        config: WorkerConfig,
        process_factory: Arc<dyn ProcessFactory>,
        sandbox: Arc<dyn SandboxStager>,
    ) -> Self {
        Self {
            config,
            process_factory,
            sandbox,
            multiplexers: Arc::new(MultiplexerRegistry::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Real processes and a local sandbox using the configured strategy.
    pub fn from_config(config: WorkerConfig) -> Self {
        let sandbox = Arc::new(LocalSandbox::from_config(&config));
        Self::new(config, Arc::new(OsProcessFactory::new()), sandbox)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn multiplexers(&self) -> &Arc<MultiplexerRegistry> {
        &self.multiplexers
    }

    /// `<base>/<workType>-<id>-<mnemonic>.log`
    pub fn log_file(&self, key: &WorkerKey, id: u32) -> PathBuf {
        self.config
            .base_dir
            .join(format!("{}.log", instance_name(key, id)))
    }

    /// Sandbox directory for sandboxed keys, the exec root otherwise.
    pub fn work_dir(&self, key: &WorkerKey, id: u32) -> PathBuf {
        if key.must_be_sandboxed() {
            self.config.base_dir.join(instance_name(key, id))
        } else {
            key.exec_root().to_path_buf()
        }
    }

    fn uses_multiplexer(&self, key: &WorkerKey) -> bool {
        self.config.multiplex && key.proxied() && !key.must_be_sandboxed()
    }

    /// Create an unprepared worker for `key`. Nothing is spawned until its
    /// first `prepare_execution`.
    pub async fn create(&self, key: Arc<WorkerKey>) -> Result<Box<dyn PersistentWorker>> {
        tokio::fs::create_dir_all(&self.config.base_dir).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let log_file = self.log_file(&key, id);
        let work_dir = self.work_dir(&key, id);

        tracing::debug!(
            worker_id = id,
            mnemonic = %key.mnemonic(),
            key_hash = %key.fingerprint(),
            multiplexed = self.uses_multiplexer(&key),
            "Creating worker"
        );

        if self.uses_multiplexer(&key) {
            let proxy = WorkerProxy::new(
                key,
                id,
                work_dir,
                log_file,
                self.multiplexers.clone(),
                self.process_factory.clone(),
            )
            .with_max_message_bytes(self.config.max_message_bytes)
            .with_shutdown_timeout(self.config.shutdown_timeout());
            return Ok(Box::new(proxy));
        }

        let worker = Worker::new(
            key,
            id,
            work_dir,
            log_file,
            self.process_factory.clone(),
            self.sandbox.clone(),
        )
        .with_max_message_bytes(self.config.max_message_bytes)
        .with_shutdown_timeout(self.config.shutdown_timeout());
        Ok(Box::new(worker))
    }

    /// Whether a pooled `worker` may serve a request for `key`.
    pub fn validate(&self, key: &WorkerKey, worker: &dyn PersistentWorker) -> bool {
        if worker.state() == WorkerState::Destroyed {
            return false;
        }
        let current = worker.key();
        if current.worker_files_combined_hash() != key.worker_files_combined_hash() {
            tracing::info!(
                worker_id = worker.id(),
                mnemonic = %key.mnemonic(),
                old_hash = %current.worker_files_combined_hash(),
                new_hash = %key.worker_files_combined_hash(),
                "Worker files changed; worker cannot be reused"
            );
            return false;
        }
        current.as_ref() == key
    }
}

fn instance_name(key: &WorkerKey, id: u32) -> String {
    format!("{}-{}-{}", key.worker_type_name(), id, key.mnemonic())
}
