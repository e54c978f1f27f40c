//! Worker identity.
//!
//! A [`WorkerKey`] decides which worker processes are interchangeable. Two
//! workers with equal keys can serve each other's requests; the pool buckets
//! by key and refuses to reuse a worker whose key no longer matches.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::Result;

/// Work type label for proxied (multiplexed) workers.
pub const MULTIPLEX_WORKER_TYPE: &str = "multiplex-worker";
/// Work type label for plain workers.
pub const WORKER_TYPE: &str = "worker";

// =============================================================================
// HashCode
// =============================================================================

/// Opaque content digest.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HashCode(Vec<u8>);

impl HashCode {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Four little-endian bytes; handy for tests and sentinel keys.
    pub fn from_int(value: i32) -> Self {
        Self(value.to_le_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashCode({})", self.to_hex())
    }
}

// =============================================================================
// WorkerKey
// =============================================================================

/// Immutable identity of an interchangeable worker class.
///
/// Equality and hashing cover the arguments, environment, exec root,
/// mnemonic, combined worker-files hash and sandboxing requirement.
/// `proxied` only changes the derived work type label, and the per-file
/// hashes are summarized by the combined hash.
#[derive(Debug, Clone)]
pub struct WorkerKey {
    arguments: Vec<String>,
    env: BTreeMap<String, String>,
    exec_root: PathBuf,
    mnemonic: String,
    worker_files_combined_hash: HashCode,
    worker_files_with_hashes: BTreeMap<PathBuf, HashCode>,
    must_be_sandboxed: bool,
    proxied: bool,
}

impl WorkerKey {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        arguments: Vec<String>,
        env: BTreeMap<String, String>,
        exec_root: impl Into<PathBuf>,
        mnemonic: impl Into<String>,
        worker_files_combined_hash: HashCode,
        worker_files_with_hashes: BTreeMap<PathBuf, HashCode>,
        must_be_sandboxed: bool,
        proxied: bool,
    ) -> Self {
        Self {
            arguments,
            env,
            exec_root: exec_root.into(),
            mnemonic: mnemonic.into(),
            worker_files_combined_hash,
            worker_files_with_hashes,
            must_be_sandboxed,
            proxied,
        }
    }

    /// Start building a key for the given mnemonic and exec root.
    pub fn builder(mnemonic: impl Into<String>, exec_root: impl Into<PathBuf>) -> WorkerKeyBuilder {
        WorkerKeyBuilder::new(mnemonic, exec_root)
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn exec_root(&self) -> &Path {
        &self.exec_root
    }

    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    pub fn worker_files_combined_hash(&self) -> &HashCode {
        &self.worker_files_combined_hash
    }

    pub fn worker_files_with_hashes(&self) -> &BTreeMap<PathBuf, HashCode> {
        &self.worker_files_with_hashes
    }

    pub fn must_be_sandboxed(&self) -> bool {
        self.must_be_sandboxed
    }

    pub fn proxied(&self) -> bool {
        self.proxied
    }

    /// Label used in log file names and pool buckets, never for matching.
    pub fn make_worker_type_name(proxied: bool) -> &'static str {
        if proxied {
            MULTIPLEX_WORKER_TYPE
        } else {
            WORKER_TYPE
        }
    }

    pub fn worker_type_name(&self) -> &'static str {
        Self::make_worker_type_name(self.proxied)
    }

    /// Stable digest over the identity fields.
    ///
    /// Unlike `std::hash::Hash`, the value is the same across processes and
    /// toolchains, so it can be logged and compared between runs.
    pub fn fingerprint(&self) -> HashCode {
        let mut hasher = Sha256::new();
        for arg in &self.arguments {
            hasher.update(arg.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([1u8]);
        for (name, value) in &self.env {
            hasher.update(name.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([1u8]);
        hasher.update(self.exec_root.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.mnemonic.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.worker_files_combined_hash.as_bytes());
        hasher.update([self.must_be_sandboxed as u8]);
        HashCode::from_bytes(hasher.finalize().to_vec())
    }
}

impl PartialEq for WorkerKey {
    fn eq(&self, other: &Self) -> bool {
        self.arguments == other.arguments
            && self.env == other.env
            && self.exec_root == other.exec_root
            && self.mnemonic == other.mnemonic
            && self.worker_files_combined_hash == other.worker_files_combined_hash
            && self.must_be_sandboxed == other.must_be_sandboxed
    }
}

impl Eq for WorkerKey {}

impl Hash for WorkerKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.arguments.hash(state);
        self.env.hash(state);
        self.exec_root.hash(state);
        self.mnemonic.hash(state);
        self.worker_files_combined_hash.hash(state);
        self.must_be_sandboxed.hash(state);
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}]",
            self.worker_type_name(),
            self.mnemonic,
            self.arguments.join(" ")
        )
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`WorkerKey`].
///
/// When worker files are supplied and no combined hash is set explicitly, the
/// combined hash is derived from the per-file hashes.
#[derive(Debug, Clone)]
pub struct WorkerKeyBuilder {
    arguments: Vec<String>,
    env: BTreeMap<String, String>,
    exec_root: PathBuf,
    mnemonic: String,
    combined_hash: Option<HashCode>,
    worker_files: BTreeMap<PathBuf, HashCode>,
    must_be_sandboxed: bool,
    proxied: bool,
}

impl WorkerKeyBuilder {
    fn new(mnemonic: impl Into<String>, exec_root: impl Into<PathBuf>) -> Self {
        Self {
            arguments: Vec::new(),
            env: BTreeMap::new(),
            exec_root: exec_root.into(),
            mnemonic: mnemonic.into(),
            combined_hash: None,
            worker_files: BTreeMap::new(),
            must_be_sandboxed: false,
            proxied: false,
        }
    }

    pub fn arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn env_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn worker_files(mut self, files: BTreeMap<PathBuf, HashCode>) -> Self {
        self.worker_files = files;
        self
    }

    pub fn worker_files_combined_hash(mut self, hash: HashCode) -> Self {
        self.combined_hash = Some(hash);
        self
    }

    pub fn must_be_sandboxed(mut self, sandboxed: bool) -> Self {
        self.must_be_sandboxed = sandboxed;
        self
    }

    pub fn proxied(mut self, proxied: bool) -> Self {
        self.proxied = proxied;
        self
    }

    pub fn build(self) -> WorkerKey {
        let combined = self
            .combined_hash
            .unwrap_or_else(|| combine_hashes(&self.worker_files));
        WorkerKey {
            arguments: self.arguments,
            env: self.env,
            exec_root: self.exec_root,
            mnemonic: self.mnemonic,
            worker_files_combined_hash: combined,
            worker_files_with_hashes: self.worker_files,
            must_be_sandboxed: self.must_be_sandboxed,
            proxied: self.proxied,
        }
    }
}

// =============================================================================
// Worker Files Hashing
// =============================================================================

/// SHA-256 digest of every worker file, keyed by its path relative to
/// `exec_root`.
pub async fn hash_worker_files<I, P>(exec_root: &Path, paths: I) -> Result<BTreeMap<PathBuf, HashCode>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut hashes = BTreeMap::new();
    for path in paths {
        let relative = path.as_ref();
        let content = tokio::fs::read(exec_root.join(relative)).await?;
        let digest = Sha256::digest(&content);
        hashes.insert(relative.to_path_buf(), HashCode::from_bytes(digest.to_vec()));
    }
    Ok(hashes)
}

/// Combine per-file digests into one, in path order.
pub fn combine_hashes(files: &BTreeMap<PathBuf, HashCode>) -> HashCode {
    let mut hasher = Sha256::new();
    for (path, hash) in files {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(hash.as_bytes());
    }
    HashCode::from_bytes(hasher.finalize().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn base_builder() -> WorkerKeyBuilder {
        WorkerKey::builder("dummy", "/outputbase/execroot/workspace")
            .arguments(["arg1", "arg2", "arg3"])
            .env_var("env1", "foo")
            .env_var("env2", "bar")
            .worker_files_combined_hash(HashCode::from_int(0))
            .must_be_sandboxed(true)
    }

    fn hash_of(key: &WorkerKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_proxied_only_changes_type_name() {
        let proxied = base_builder().proxied(true).build();
        let plain = base_builder().proxied(false).build();

        assert_eq!(proxied, plain);
        assert_eq!(hash_of(&proxied), hash_of(&plain));
        assert_eq!(proxied.fingerprint(), plain.fingerprint());
        assert_eq!(proxied.worker_type_name(), "multiplex-worker");
        assert_eq!(plain.worker_type_name(), "worker");
    }

    #[test]
    fn test_combined_hash_is_identity() {
        let a = base_builder().build();
        let b = base_builder()
            .worker_files_combined_hash(HashCode::from_int(1))
            .build();
        assert_ne!(a, b);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_identity_fields() {
        let a = base_builder().build();
        assert_ne!(a, base_builder().arguments(["arg1"]).build());
        assert_ne!(a, base_builder().env_var("env3", "baz").build());
        assert_ne!(a, base_builder().must_be_sandboxed(false).build());
        assert_ne!(
            a,
            WorkerKey::builder("other", "/outputbase/execroot/workspace")
                .arguments(["arg1", "arg2", "arg3"])
                .env_var("env1", "foo")
                .env_var("env2", "bar")
                .worker_files_combined_hash(HashCode::from_int(0))
                .must_be_sandboxed(true)
                .build()
        );
    }

    #[test]
    fn test_env_order_is_irrelevant() {
        let a = base_builder().build();
        let b = WorkerKey::builder("dummy", "/outputbase/execroot/workspace")
            .arguments(["arg1", "arg2", "arg3"])
            .env_var("env2", "bar")
            .env_var("env1", "foo")
            .worker_files_combined_hash(HashCode::from_int(0))
            .must_be_sandboxed(true)
            .build();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_builder_derives_combined_hash() {
        let mut files = BTreeMap::new();
        files.insert(PathBuf::from("bin/worker"), HashCode::from_int(7));
        let key = WorkerKey::builder("Javac", "/root")
            .worker_files(files.clone())
            .build();
        assert_eq!(key.worker_files_combined_hash(), &combine_hashes(&files));

        files.insert(PathBuf::from("bin/worker"), HashCode::from_int(8));
        assert_ne!(key.worker_files_combined_hash(), &combine_hashes(&files));
    }

    #[tokio::test]
    async fn test_hash_worker_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jar"), b"first").unwrap();
        std::fs::write(dir.path().join("b.jar"), b"second").unwrap();

        let hashes = hash_worker_files(dir.path(), ["b.jar", "a.jar"]).await.unwrap();
        let paths: Vec<_> = hashes.keys().cloned().collect();
        assert_eq!(paths, vec![PathBuf::from("a.jar"), PathBuf::from("b.jar")]);
        assert_eq!(hashes[&PathBuf::from("a.jar")].as_bytes().len(), 32);
        assert_ne!(hashes[&PathBuf::from("a.jar")], hashes[&PathBuf::from("b.jar")]);

        assert!(hash_worker_files(dir.path(), ["missing.jar"]).await.is_err());
    }

    #[test]
    fn test_hash_code_display() {
        assert_eq!(HashCode::from_int(1).to_string(), "01000000");
        assert_eq!(format!("{:?}", HashCode::from_bytes(vec![0xab])), "HashCode(ab)");
    }
}
