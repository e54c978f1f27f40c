//! Filesystem policy for sandbox staging.
//!
//! Every path staged into or harvested out of a worker's sandbox is a
//! fragment relative to the sandbox root. These helpers reject fragments that
//! would escape the root.

use crate::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Normalize a sandbox-relative path fragment.
///
/// Rejects absolute paths (including Windows drive paths on any OS) and
/// `..` components that climb above the root. `.` components are dropped.
pub fn normalize_fragment(fragment: &Path) -> Result<PathBuf> {
    let raw = fragment.to_string_lossy();
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(Error::SecurityViolation(format!(
            "Absolute paths are not allowed in sandbox: {}",
            raw
        )));
    }

    let mut normalized = PathBuf::new();
    for component in fragment.components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(Error::SecurityViolation(format!(
                        "Path traversal detected in path: {}",
                        raw
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::SecurityViolation(format!(
                    "Absolute paths are not allowed in sandbox: {}",
                    raw
                )));
            }
            Component::CurDir => {}
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::SecurityViolation(format!(
            "Empty path fragment: {:?}",
            raw
        )));
    }

    Ok(normalized)
}

/// Resolve a fragment to a location inside `root`.
pub fn resolve_in_sandbox(root: &Path, fragment: &Path) -> Result<PathBuf> {
    let full_path = root.join(normalize_fragment(fragment)?);
    if !full_path.starts_with(root) {
        return Err(Error::SecurityViolation(format!(
            "Access denied: path {} is outside of root {}",
            fragment.display(),
            root.display()
        )));
    }
    Ok(full_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_fragments() {
        assert_eq!(
            normalize_fragment(Path::new("main.py")).unwrap(),
            PathBuf::from("main.py")
        );
        assert_eq!(
            normalize_fragment(Path::new("src/app.js")).unwrap(),
            PathBuf::from("src/app.js")
        );
        assert_eq!(
            normalize_fragment(Path::new("./local.txt")).unwrap(),
            PathBuf::from("local.txt")
        );
        assert_eq!(
            normalize_fragment(Path::new("a/b/../c")).unwrap(),
            PathBuf::from("a/c")
        );
    }

    #[test]
    fn test_traversal_rejection() {
        assert!(normalize_fragment(Path::new("../etc/passwd")).is_err());
        assert!(normalize_fragment(Path::new("src/../../etc/passwd")).is_err());
    }

    #[test]
    fn test_absolute_and_empty_rejection() {
        assert!(normalize_fragment(Path::new("/etc/passwd")).is_err());
        assert!(normalize_fragment(Path::new("C:\\Windows\\System32")).is_err());
        assert!(normalize_fragment(Path::new(".")).is_err());
    }

    #[test]
    fn test_resolve_in_sandbox() {
        let root = Path::new("/tmp/workers/worker-1-Javac");
        assert_eq!(
            resolve_in_sandbox(root, Path::new("out/lib.jar")).unwrap(),
            root.join("out/lib.jar")
        );
        assert!(matches!(
            resolve_in_sandbox(root, Path::new("../worker-2-Javac/secret")),
            Err(Error::SecurityViolation(_))
        ));
    }
}
