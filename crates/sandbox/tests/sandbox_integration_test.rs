//! Sandbox integration tests.
//!
//! Exercises `LocalSandbox` against a real temporary directory.

use std::path::Path;

use persistent_worker_core::{Error, StagingStrategy};
use persistent_worker_sandbox::{LocalSandbox, SandboxInputs, SandboxOutputs, SandboxStager};

// =============================================================================
// Helpers
// =============================================================================

fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

// =============================================================================
// 1. Staging by copy
// =============================================================================

#[tokio::test]
async fn test_stage_copies_inputs() {
    let exec_root = tempfile::tempdir().unwrap();
    let sandbox_root = tempfile::tempdir().unwrap();
    let work_dir = sandbox_root.path().join("worker-1-Javac");

    write(&exec_root.path().join("src/Main.java"), "class Main {}");

    let inputs = SandboxInputs::new()
        .with_file("src/Main.java", exec_root.path().join("src/Main.java"))
        .with_empty_file("empty/marker");

    let stager = LocalSandbox::new(StagingStrategy::Copy);
    stager.stage(&work_dir, &inputs).await.unwrap();

    let staged = work_dir.join("src/Main.java");
    assert_eq!(std::fs::read_to_string(&staged).unwrap(), "class Main {}");
    assert!(!std::fs::symlink_metadata(&staged).unwrap().file_type().is_symlink());
    assert_eq!(std::fs::read(work_dir.join("empty/marker")).unwrap().len(), 0);
}

// =============================================================================
// 2. Staging by link
// =============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_stage_symlinks_inputs() {
    let exec_root = tempfile::tempdir().unwrap();
    let sandbox_root = tempfile::tempdir().unwrap();
    let work_dir = sandbox_root.path().join("worker-2-Javac");
    let source = exec_root.path().join("lib/dep.jar");
    write(&source, "jar");

    let inputs = SandboxInputs::new()
        .with_file("lib/dep.jar", &source)
        .with_symlink("alias.jar", &source);

    LocalSandbox::new(StagingStrategy::Symlink)
        .stage(&work_dir, &inputs)
        .await
        .unwrap();

    for name in ["lib/dep.jar", "alias.jar"] {
        let meta = std::fs::symlink_metadata(work_dir.join(name)).unwrap();
        assert!(meta.file_type().is_symlink(), "{} should be a symlink", name);
        assert_eq!(std::fs::read_to_string(work_dir.join(name)).unwrap(), "jar");
    }
}

#[tokio::test]
async fn test_stage_hardlinks_inputs() {
    let root = tempfile::tempdir().unwrap();
    let source = root.path().join("exec/a.txt");
    write(&source, "shared");
    let work_dir = root.path().join("sandbox");

    LocalSandbox::new(StagingStrategy::Hardlink)
        .stage(&work_dir, &SandboxInputs::new().with_file("a.txt", &source))
        .await
        .unwrap();

    // Writing through the source is visible through the link.
    std::fs::write(&source, "updated").unwrap();
    assert_eq!(std::fs::read_to_string(work_dir.join("a.txt")).unwrap(), "updated");
}

// =============================================================================
// 3. Fresh staging removes stale files
// =============================================================================

#[tokio::test]
async fn test_restage_removes_stale_files() {
    let root = tempfile::tempdir().unwrap();
    let work_dir = root.path().join("sandbox");
    write(&work_dir.join("stale/leftover.o"), "old");
    write(&work_dir.join("stale.txt"), "old");

    let stager = LocalSandbox::default();
    stager
        .stage(&work_dir, &SandboxInputs::new().with_empty_file("fresh.txt"))
        .await
        .unwrap();

    assert!(work_dir.exists());
    assert!(work_dir.join("fresh.txt").exists());
    assert!(!work_dir.join("stale").exists());
    assert!(!work_dir.join("stale.txt").exists());
}

// =============================================================================
// 4. Path policy
// =============================================================================

#[tokio::test]
async fn test_stage_rejects_escaping_fragments() {
    let root = tempfile::tempdir().unwrap();
    let work_dir = root.path().join("sandbox");
    let inputs = SandboxInputs::new().with_empty_file("../outside.txt");

    let result = LocalSandbox::default().stage(&work_dir, &inputs).await;
    assert!(matches!(result, Err(Error::SecurityViolation(_))));
    assert!(!root.path().join("outside.txt").exists());
}

#[tokio::test]
async fn test_stage_missing_source_is_sandbox_error() {
    let root = tempfile::tempdir().unwrap();
    let inputs = SandboxInputs::new().with_file("a.txt", root.path().join("nope.txt"));

    let result = LocalSandbox::default()
        .stage(&root.path().join("sandbox"), &inputs)
        .await;
    assert!(matches!(result, Err(Error::Sandbox(_))));
}

// =============================================================================
// 5. Harvesting outputs
// =============================================================================

#[tokio::test]
async fn test_harvest_moves_declared_outputs() {
    let root = tempfile::tempdir().unwrap();
    let work_dir = root.path().join("sandbox");
    let exec_root = root.path().join("exec");
    std::fs::create_dir_all(&exec_root).unwrap();

    write(&work_dir.join("out/lib.jar"), "compiled");
    write(&work_dir.join("gen/a.h"), "header");
    write(&work_dir.join("scratch.tmp"), "not declared");

    let outputs = SandboxOutputs::new()
        .with_file("out/lib.jar")
        .with_file("out/missing.jar")
        .with_dir("gen");

    let moved = LocalSandbox::default()
        .harvest(&work_dir, &outputs, &exec_root)
        .await
        .unwrap();

    assert_eq!(moved.len(), 2);
    assert_eq!(
        std::fs::read_to_string(exec_root.join("out/lib.jar")).unwrap(),
        "compiled"
    );
    assert_eq!(std::fs::read_to_string(exec_root.join("gen/a.h")).unwrap(), "header");
    assert!(!work_dir.join("out/lib.jar").exists());
    assert!(!exec_root.join("scratch.tmp").exists());
    assert!(!exec_root.join("out/missing.jar").exists());
}

#[tokio::test]
async fn test_harvest_replaces_existing_output_dir() {
    let root = tempfile::tempdir().unwrap();
    let work_dir = root.path().join("sandbox");
    let exec_root = root.path().join("exec");

    write(&exec_root.join("gen/old.h"), "old");
    write(&work_dir.join("gen/new.h"), "new");

    LocalSandbox::default()
        .harvest(&work_dir, &SandboxOutputs::new().with_dir("gen"), &exec_root)
        .await
        .unwrap();

    assert!(exec_root.join("gen/new.h").exists());
    assert!(!exec_root.join("gen/old.h").exists());
}

// =============================================================================
// 6. Cleanup
// =============================================================================

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let root = tempfile::tempdir().unwrap();
    let work_dir = root.path().join("sandbox");
    write(&work_dir.join("a.txt"), "a");

    let stager = LocalSandbox::default();
    stager.cleanup(&work_dir).await.unwrap();
    assert!(!work_dir.exists());
    stager.cleanup(&work_dir).await.unwrap();
}
