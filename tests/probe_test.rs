//! End-to-end tests for the `persistent-worker` binary.

#![cfg(unix)]

use std::io::Write;
use std::process::{Command, Output, Stdio};

fn probe(args: &[&str], stdin: &str) -> (Output, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut child = Command::new(env!("CARGO_BIN_EXE_persistent-worker"))
        .args(args)
        .current_dir(dir.path())
        .env("PW__BASE_DIR", dir.path().join("workers"))
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(stdin.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();
    (output, dir)
}

#[test]
fn test_usage_error() {
    let (output, _dir) = probe(&["OnlyMnemonic"], "");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("usage"));
}

// An empty request encodes as a zero-length frame, which `cat` echoes back as
// an empty, successful response.
#[test]
fn test_empty_request_through_cat() {
    let (output, dir) = probe(&["Cat", "/bin/cat"], "");
    assert!(output.status.success(), "{:?}", output);
    assert!(output.stdout.is_empty());
    assert!(dir.path().join("workers/worker-1-Cat.log").exists());
}

// With arguments the echoed frame is a request, not a response.
#[test]
fn test_echoed_request_is_protocol_failure() {
    let (output, _dir) = probe(&["Cat", "/bin/cat"], "Main.java\n");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Protocol error"));
}

#[test]
fn test_missing_program_fails_to_spawn() {
    let (output, _dir) = probe(&["Nope", "/no/such/worker"], "");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to spawn"));
}
