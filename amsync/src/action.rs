use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::localfs::sha256_file;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Unsafe(#[from] amlib::paths::PathError),
    #[error("bad checksum {checksum:?} for {path:?}: expected lowercase sha256 hex")]
    BadChecksum { path: String, checksum: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Download,
    Update,
    Skip,
    Delete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Download => "download",
            ActionKind::Update => "update",
            ActionKind::Skip => "skip",
            ActionKind::Delete => "delete",
        }
    }

    /// Whether the executor will move bytes for this action.
    pub fn transfers(&self) -> bool {
        matches!(self, ActionKind::Download | ActionKind::Update)
    }
}

/// One file-level step of a sync plan.
#[derive(Debug, Clone, Serialize)]
pub struct SyncAction {
    /// Clean relative posix path, unique within the plan.
    pub path: String,
    /// Absolute destination; filled in by the plan builder.
    pub local_path: Option<PathBuf>,
    #[serde(rename = "action")]
    pub kind: ActionKind,
    pub size: u64,
    /// Lowercase sha256 hex, or empty when upstream publishes none.
    pub checksum: String,
    pub url: String,
    pub reason: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// What a provider decided needs doing; immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct SyncPlan {
    pub provider: String,
    pub actions: Vec<SyncAction>,
    pub total_files: usize,
    /// Bytes the download and update actions will move.
    pub total_size: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub path: String,
    pub url: String,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub provider: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub downloaded: u64,
    pub updated: u64,
    pub skipped: u64,
    pub deleted: u64,
    pub bytes_transferred: u64,
    pub failed: Vec<FailedFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub path: String,
    pub valid: bool,
    pub expected: String,
    pub actual: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub provider: String,
    pub results: Vec<ValidationResult>,
}

impl ValidationReport {
    pub fn invalid_count(&self) -> usize {
        self.results.iter().filter(|r| !r.valid).count()
    }
}

/// Assembles a `SyncPlan` while enforcing its invariants: every path is
/// clean and joins safely under the provider root, no two actions share a
/// path (first wins), checksums are lowercase sha256 hex.
pub struct PlanBuilder {
    provider: String,
    root: PathBuf,
    actions: Vec<SyncAction>,
    seen: BTreeSet<String>,
}

impl PlanBuilder {
    pub fn new(provider: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            provider: provider.into(),
            root: root.into(),
            actions: Vec::new(),
            seen: BTreeSet::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Resolve the absolute destination an upstream-relative path would
    /// land at, rejecting anything that escapes the provider root.
    pub fn destination(&self, rel: &str) -> Result<PathBuf, PlanError> {
        Ok(amlib::paths::safe_join_under(&self.root, rel)?)
    }

    /// Add one action. Returns false when the path was already planned
    /// (the first occurrence wins).
    pub fn push(&mut self, mut action: SyncAction) -> Result<bool, PlanError> {
        let clean = amlib::paths::clean_relative_path(&action.path)?;
        let local = amlib::paths::safe_join_under(&self.root, &clean)?;
        if !action.checksum.is_empty() && !is_sha256_hex(&action.checksum) {
            return Err(PlanError::BadChecksum {
                path: clean,
                checksum: action.checksum,
            });
        }
        if !self.seen.insert(clean.clone()) {
            return Ok(false);
        }
        action.path = clean;
        if action.local_path.is_none() {
            action.local_path = Some(local);
        }
        self.actions.push(action);
        Ok(true)
    }

    pub fn finish(self) -> SyncPlan {
        let total_size = self
            .actions
            .iter()
            .filter(|a| a.kind.transfers())
            .map(|a| a.size)
            .sum();
        SyncPlan {
            provider: self.provider,
            total_files: self.actions.len(),
            total_size,
            actions: self.actions,
            timestamp: Utc::now(),
        }
    }
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub kind: ActionKind,
    pub reason: &'static str,
}

/// The shared planner decision table, comparing one upstream artifact
/// against the local filesystem.
pub fn decide_local(local: &Path, upstream_size: u64, upstream_checksum: &str) -> Decision {
    let metadata = match std::fs::symlink_metadata(local) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Decision {
                kind: ActionKind::Download,
                reason: "new artifact",
            };
        }
        Err(_) => {
            return Decision {
                kind: ActionKind::Update,
                reason: "cannot stat",
            };
        }
        Ok(metadata) => metadata,
    };
    if !upstream_checksum.is_empty() {
        return match sha256_file(local) {
            Ok(actual) if actual == upstream_checksum => Decision {
                kind: ActionKind::Skip,
                reason: "checksum matches",
            },
            Ok(_) => Decision {
                kind: ActionKind::Update,
                reason: "checksum mismatch",
            },
            Err(_) => Decision {
                kind: ActionKind::Update,
                reason: "checksum failed",
            },
        };
    }
    if metadata.len() == upstream_size {
        Decision {
            kind: ActionKind::Skip,
            reason: "size matches",
        }
    } else if upstream_size > 0 {
        Decision {
            kind: ActionKind::Update,
            reason: "size mismatch",
        }
    } else {
        Decision {
            kind: ActionKind::Skip,
            reason: "file exists",
        }
    }
}

/// Content-addressed paths embed their own digest, so presence on disk is
/// enough to satisfy any plan that wants the same digest.
pub fn decide_content_addressed(local: &Path) -> Decision {
    if local.exists() {
        Decision {
            kind: ActionKind::Skip,
            reason: "file exists",
        }
    } else {
        Decision {
            kind: ActionKind::Download,
            reason: "new artifact",
        }
    }
}
