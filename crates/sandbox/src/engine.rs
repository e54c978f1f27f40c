//! Sandbox staging engine.
//!
//! This module provides the `SandboxStager` trait the worker consumes, a
//! local-filesystem implementation that materializes inputs by copy, symlink
//! or hardlink, and an in-memory recording stager for tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use persistent_worker_core::fs_policy::resolve_in_sandbox;
use persistent_worker_core::{Error, Result, StagingStrategy, WorkerConfig};

// =============================================================================
// Sandbox Types
// =============================================================================

/// Files and symlinks to materialize inside a sandbox, keyed by their
/// fragment relative to the sandbox root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxInputs {
    /// Fragment -> source file. `None` stages an empty file.
    files: BTreeMap<PathBuf, Option<PathBuf>>,
    /// Fragment -> symlink target.
    symlinks: BTreeMap<PathBuf, PathBuf>,
}

impl SandboxInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, fragment: impl Into<PathBuf>, source: impl Into<PathBuf>) -> Self {
        self.add_file(fragment, source);
        self
    }

    pub fn with_empty_file(mut self, fragment: impl Into<PathBuf>) -> Self {
        self.files.insert(fragment.into(), None);
        self
    }

    pub fn with_symlink(mut self, fragment: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.symlinks.insert(fragment.into(), target.into());
        self
    }

    pub fn add_file(&mut self, fragment: impl Into<PathBuf>, source: impl Into<PathBuf>) {
        self.files.insert(fragment.into(), Some(source.into()));
    }

    pub fn files(&self) -> &BTreeMap<PathBuf, Option<PathBuf>> {
        &self.files
    }

    pub fn symlinks(&self) -> &BTreeMap<PathBuf, PathBuf> {
        &self.symlinks
    }

    pub fn len(&self) -> usize {
        self.files.len() + self.symlinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outputs the action declares, relative to the sandbox root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxOutputs {
    files: BTreeSet<PathBuf>,
    dirs: BTreeSet<PathBuf>,
}

impl SandboxOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, fragment: impl Into<PathBuf>) -> Self {
        self.files.insert(fragment.into());
        self
    }

    pub fn with_dir(mut self, fragment: impl Into<PathBuf>) -> Self {
        self.dirs.insert(fragment.into());
        self
    }

    pub fn files(&self) -> &BTreeSet<PathBuf> {
        &self.files
    }

    pub fn dirs(&self) -> &BTreeSet<PathBuf> {
        &self.dirs
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}

// =============================================================================
// Sandbox Stager Trait
// =============================================================================

/// Trait for sandbox staging backends.
///
/// The worker calls `stage` before a request is sent, `harvest` after the
/// response arrives, and `cleanup` when it is destroyed.
#[async_trait]
pub trait SandboxStager: Send + Sync {
    /// Replace the contents of `work_dir` with exactly `inputs`.
    async fn stage(&self, work_dir: &Path, inputs: &SandboxInputs) -> Result<()>;

    /// Move the declared outputs that exist from `work_dir` into
    /// `target_root`, returning the destination paths.
    async fn harvest(
        &self,
        work_dir: &Path,
        outputs: &SandboxOutputs,
        target_root: &Path,
    ) -> Result<Vec<PathBuf>>;

    /// Remove the sandbox directory. Missing directories are not an error.
    async fn cleanup(&self, work_dir: &Path) -> Result<()>;
}

// =============================================================================
// Local Sandbox Implementation
// =============================================================================

/// Stager that materializes inputs on the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct LocalSandbox {
    strategy: StagingStrategy,
}

impl LocalSandbox {
    pub fn new(strategy: StagingStrategy) -> Self {
        Self { strategy }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.staging)
    }

    pub fn strategy(&self) -> StagingStrategy {
        self.strategy
    }

    async fn place_file(&self, source: &Path, dest: &Path) -> std::io::Result<()> {
        match self.strategy {
            StagingStrategy::Copy => tokio::fs::copy(source, dest).await.map(|_| ()),
            StagingStrategy::Hardlink => tokio::fs::hard_link(source, dest).await,
            StagingStrategy::Symlink => symlink(source, dest).await,
        }
    }
}

#[async_trait]
impl SandboxStager for LocalSandbox {
    async fn stage(&self, work_dir: &Path, inputs: &SandboxInputs) -> Result<()> {
        clear_dir(work_dir).await.map_err(|e| {
            Error::sandbox(format!(
                "Failed to prepare sandbox '{}': {}",
                work_dir.display(),
                e
            ))
        })?;

        for (fragment, source) in inputs.files() {
            let dest = resolve_in_sandbox(work_dir, fragment)?;
            let result = async {
                ensure_parent(&dest).await?;
                match source {
                    Some(source) => self.place_file(source, &dest).await,
                    None => tokio::fs::File::create(&dest).await.map(|_| ()),
                }
            }
            .await;
            result.map_err(|e| {
                Error::sandbox(format!(
                    "Failed to stage input '{}': {}",
                    fragment.display(),
                    e
                ))
            })?;
        }

        for (fragment, target) in inputs.symlinks() {
            let dest = resolve_in_sandbox(work_dir, fragment)?;
            let result = async {
                ensure_parent(&dest).await?;
                symlink(target, &dest).await
            }
            .await;
            result.map_err(|e| {
                Error::sandbox(format!(
                    "Failed to stage symlink '{}': {}",
                    fragment.display(),
                    e
                ))
            })?;
        }

        tracing::debug!(
            sandbox = %work_dir.display(),
            inputs = inputs.len(),
            strategy = ?self.strategy,
            "Sandbox staged"
        );
        Ok(())
    }

    async fn harvest(
        &self,
        work_dir: &Path,
        outputs: &SandboxOutputs,
        target_root: &Path,
    ) -> Result<Vec<PathBuf>> {
        let mut moved = Vec::new();
        let entries = outputs
            .files()
            .iter()
            .map(|f| (f, false))
            .chain(outputs.dirs().iter().map(|d| (d, true)));

        for (fragment, is_dir) in entries {
            let source = resolve_in_sandbox(work_dir, fragment)?;
            if tokio::fs::symlink_metadata(&source).await.is_err() {
                tracing::debug!(output = %fragment.display(), "Declared output not produced");
                continue;
            }
            let dest = resolve_in_sandbox(target_root, fragment)?;
            move_output(&source, &dest, is_dir).await.map_err(|e| {
                Error::sandbox(format!(
                    "Failed to move output '{}': {}",
                    fragment.display(),
                    e
                ))
            })?;
            moved.push(dest);
        }

        tracing::debug!(sandbox = %work_dir.display(), moved = moved.len(), "Sandbox outputs harvested");
        Ok(moved)
    }

    async fn cleanup(&self, work_dir: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(work_dir).await {
            Ok(()) => {
                tracing::debug!(sandbox = %work_dir.display(), "Sandbox removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::sandbox(format!(
                "Failed to remove sandbox '{}': {}",
                work_dir.display(),
                e
            ))),
        }
    }
}

async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => tokio::fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}

/// Empty `dir`, creating it if needed. The directory itself survives so a
/// process already running inside it keeps a valid working directory.
async fn clear_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

async fn move_output(source: &Path, dest: &Path, is_dir: bool) -> std::io::Result<()> {
    ensure_parent(dest).await?;
    if is_dir && tokio::fs::metadata(dest).await.is_ok() {
        tokio::fs::remove_dir_all(dest).await?;
    }

    if tokio::fs::rename(source, dest).await.is_ok() {
        return Ok(());
    }

    // Cross-device: fall back to copy + delete.
    if is_dir {
        let (from, to) = (source.to_path_buf(), dest.to_path_buf());
        tokio::task::spawn_blocking(move || copy_dir_all(&from, &to))
            .await
            .map_err(std::io::Error::other)??;
        tokio::fs::remove_dir_all(source).await
    } else {
        tokio::fs::copy(source, dest).await?;
        tokio::fs::remove_file(source).await
    }
}

fn copy_dir_all(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), dest)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn symlink(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are only supported on unix",
    ))
}

// =============================================================================
// Recording Sandbox (for testing without touching the filesystem)
// =============================================================================

/// In-memory stager that records every call.
#[derive(Default, Clone)]
pub struct RecordingSandbox {
    pub staged: Arc<tokio::sync::Mutex<Vec<(PathBuf, SandboxInputs)>>>,
    pub harvested: Arc<tokio::sync::Mutex<Vec<(PathBuf, SandboxOutputs, PathBuf)>>>,
    pub cleaned: Arc<tokio::sync::Mutex<Vec<PathBuf>>>,
}

impl RecordingSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stage_count(&self) -> usize {
        self.staged.lock().await.len()
    }
}

#[async_trait]
impl SandboxStager for RecordingSandbox {
    async fn stage(&self, work_dir: &Path, inputs: &SandboxInputs) -> Result<()> {
        for fragment in inputs.files().keys().chain(inputs.symlinks().keys()) {
            resolve_in_sandbox(work_dir, fragment)?;
        }
        self.staged
            .lock()
            .await
            .push((work_dir.to_path_buf(), inputs.clone()));
        Ok(())
    }

    async fn harvest(
        &self,
        work_dir: &Path,
        outputs: &SandboxOutputs,
        target_root: &Path,
    ) -> Result<Vec<PathBuf>> {
        self.harvested.lock().await.push((
            work_dir.to_path_buf(),
            outputs.clone(),
            target_root.to_path_buf(),
        ));
        Ok(outputs.files().iter().map(|f| target_root.join(f)).collect())
    }

    async fn cleanup(&self, work_dir: &Path) -> Result<()> {
        self.cleaned.lock().await.push(work_dir.to_path_buf());
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
