use std::path::{Component, Path, PathBuf};

// Every path that came from upstream metadata (package locations, checksum
// file names, manifest digests) goes through here before it is allowed to
// name anything on disk. Same posture as a content-addressed key: reject
// first, join second.

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("unsafe path: empty")]
    Empty,
    #[error("unsafe path {0:?}: absolute")]
    Absolute(String),
    #[error("unsafe path {0:?}: traverses parent directory")]
    Traversal(String),
    #[error("unsafe path {0:?}: no usable components")]
    NoComponents(String),
    #[error("unsafe path {0:?}: escapes root {1:?}")]
    EscapesRoot(String, PathBuf),
}

/// Normalize an upstream-supplied relative path to forward slashes.
///
/// Rejects empty input, absolute paths (unix, UNC, or drive-letter), `.`,
/// and any `..` segment. `//` and `./` segments collapse away.
pub fn clean_relative_path(p: &str) -> Result<String, PathError> {
    if p.is_empty() {
        return Err(PathError::Empty);
    }
    let unified = p.replace('\\', "/");
    if unified.starts_with('/') || is_drive_prefixed(&unified) {
        return Err(PathError::Absolute(p.to_string()));
    }
    let mut out: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::Traversal(p.to_string())),
            s => out.push(s),
        }
    }
    if out.is_empty() {
        return Err(PathError::NoComponents(p.to_string()));
    }
    Ok(out.join("/"))
}

fn is_drive_prefixed(p: &str) -> bool {
    let bytes = p.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Join a cleaned relative path under `root`, then re-check lexically that
/// the result did not escape. The double check is the contract: callers
/// hand the returned path straight to the filesystem.
pub fn safe_join_under(root: &Path, rel: &str) -> Result<PathBuf, PathError> {
    let clean = clean_relative_path(rel)?;
    let root_norm = normalize_lexical(root);
    let joined = normalize_lexical(&root_norm.join(&clean));
    match joined.strip_prefix(&root_norm) {
        Ok(relation) if !relation.as_os_str().is_empty() => Ok(joined),
        _ => Err(PathError::EscapesRoot(rel.to_string(), root.to_path_buf())),
    }
}

// lexical only, no symlink resolution: `a/b/../c` -> `a/c`
fn normalize_lexical(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in p.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            c => out.push(c),
        }
    }
    out
}
