use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use log::warn;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

pub const PARTIAL_SUFFIX: &str = ".partial";

pub fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Streaming SHA-256 of a local file, lowercase hex.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Interrupted downloads live in `.<name>.partial` siblings.
pub fn is_partial(rel: &str) -> bool {
    rel.ends_with(PARTIAL_SUFFIX)
}

/// Every regular file under `root` as `(relative posix path, absolute
/// path)`, sorted by relative path. Unreadable entries are logged and
/// skipped, never fatal.
pub fn walk_relative_files(root: &Path) -> Vec<(String, PathBuf)> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("walk {}: {e}", root.display());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push((rel, entry.path().to_path_buf()));
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_relative_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/c.rpm"), b"x").unwrap();
        std::fs::write(dir.path().join("top.txt"), b"y").unwrap();

        let files = walk_relative_files(dir.path());
        let rels: Vec<&str> = files.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(rels, ["a/b/c.rpm", "top.txt"]);
    }

    #[test]
    fn test_walk_missing_root_is_empty() {
        assert!(walk_relative_files(Path::new("/nonexistent/nowhere")).is_empty());
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(sha256_file(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_is_partial() {
        assert!(is_partial(".pkg.rpm.partial"));
        assert!(is_partial("a/b/.c.partial"));
        assert!(!is_partial("a/b/c.rpm"));
    }
}
