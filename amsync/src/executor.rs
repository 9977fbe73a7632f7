use std::sync::Arc;
use std::time::Duration;

use amlib::CancellationToken;
use chrono::Utc;
use log::{info, warn};
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::action::{ActionKind, FailedFile, SyncAction, SyncPlan, SyncReport};
use crate::config::SyncOptions;
use crate::localfs::PARTIAL_SUFFIX;

const MAX_ATTEMPTS: u32 = 10;
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("action has no destination path")]
    NoDestination,
    #[error("canceled")]
    Canceled,
}

enum Outcome {
    Transferred { kind: ActionKind, bytes: u64 },
    Failed(FailedFile),
    Canceled,
}

/// Run a plan through a bounded worker pool.
///
/// Skips and deletes are local bookkeeping; downloads and updates stream
/// into a `.<name>.partial` sibling while hashing, verify size and
/// checksum, then rename into place. Transient failures retry with
/// jittered exponential backoff; whatever still fails lands in
/// `report.failed` without aborting the rest of the plan.
pub async fn execute(
    plan: &SyncPlan,
    options: &SyncOptions,
    client: &reqwest::Client,
    cancel: &CancellationToken,
) -> SyncReport {
    let start_time = Utc::now();
    let mut report = SyncReport {
        provider: plan.provider.clone(),
        start_time,
        end_time: start_time,
        downloaded: 0,
        updated: 0,
        skipped: 0,
        deleted: 0,
        bytes_transferred: 0,
        failed: Vec::new(),
    };

    if options.dry_run {
        for action in &plan.actions {
            match action.kind {
                ActionKind::Download => report.downloaded += 1,
                ActionKind::Update => report.updated += 1,
                ActionKind::Skip => report.skipped += 1,
                ActionKind::Delete => {
                    if options.delete_extraneous {
                        report.deleted += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
            }
        }
        report.end_time = Utc::now();
        return report;
    }

    let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));
    let attempts = options.retry_count.clamp(1, MAX_ATTEMPTS);
    let mut workers: JoinSet<Outcome> = JoinSet::new();

    for action in &plan.actions {
        if cancel.is_cancelled() {
            break;
        }
        match action.kind {
            ActionKind::Skip => report.skipped += 1,
            ActionKind::Delete => {
                if !options.delete_extraneous {
                    report.skipped += 1;
                    continue;
                }
                match delete_local(action).await {
                    Ok(()) => report.deleted += 1,
                    Err(e) => report.failed.push(FailedFile {
                        path: action.path.clone(),
                        url: action.url.clone(),
                        error: e.to_string(),
                        attempts: 1,
                    }),
                }
            }
            ActionKind::Download | ActionKind::Update => {
                let action = action.clone();
                let semaphore = semaphore.clone();
                let client = client.clone();
                let cancel = cancel.clone();
                workers.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return Outcome::Canceled;
                    };
                    if cancel.is_cancelled() {
                        return Outcome::Canceled;
                    }
                    download_with_retry(&client, &action, attempts, &cancel).await
                });
            }
        }
    }

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Outcome::Transferred { kind, bytes }) => {
                match kind {
                    ActionKind::Update => report.updated += 1,
                    _ => report.downloaded += 1,
                }
                report.bytes_transferred += bytes;
            }
            Ok(Outcome::Failed(failure)) => report.failed.push(failure),
            Ok(Outcome::Canceled) => {}
            Err(e) => {
                warn!("{}: worker crashed: {e}", plan.provider);
                report.failed.push(FailedFile {
                    path: String::new(),
                    url: String::new(),
                    error: format!("worker crashed: {e}"),
                    attempts: 0,
                });
            }
        }
    }

    report.end_time = Utc::now();
    info!(
        "{}: downloaded={} updated={} skipped={} deleted={} failed={} bytes={}",
        report.provider,
        report.downloaded,
        report.updated,
        report.skipped,
        report.deleted,
        report.failed.len(),
        report.bytes_transferred
    );
    report
}

async fn delete_local(action: &SyncAction) -> std::io::Result<()> {
    let Some(local) = action.local_path.as_deref() else {
        return Ok(());
    };
    match tokio::fs::remove_file(local).await {
        Ok(()) => Ok(()),
        // already gone is as deleted as it gets
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn download_with_retry(
    client: &reqwest::Client,
    action: &SyncAction,
    attempts: u32,
    cancel: &CancellationToken,
) -> Outcome {
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Outcome::Canceled;
        }
        match download_once(client, action, cancel).await {
            Ok(bytes) => {
                if attempt > 1 {
                    info!("{}: succeeded on attempt {attempt}", action.path);
                }
                return Outcome::Transferred {
                    kind: action.kind,
                    bytes,
                };
            }
            Err(FetchError::Canceled) => return Outcome::Canceled,
            Err(e) => {
                warn!(
                    "{}: attempt {attempt}/{attempts} failed: {e}",
                    action.path
                );
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::select! {
                        _ = cancel.cancelled() => return Outcome::Canceled,
                        _ = tokio::time::sleep(backoff(attempt)) => {}
                    }
                }
            }
        }
    }
    Outcome::Failed(FailedFile {
        path: action.path.clone(),
        url: action.url.clone(),
        error: last_error,
        attempts,
    })
}

// exponential with full jitter in the upper half of the window
fn backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS
        .saturating_mul(1 << (attempt - 1).min(6))
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(rand::rng().random_range(exp / 2..=exp))
}

async fn download_once(
    client: &reqwest::Client,
    action: &SyncAction,
    cancel: &CancellationToken,
) -> Result<u64, FetchError> {
    let local = action.local_path.as_deref().ok_or(FetchError::NoDestination)?;
    let parent = local.parent().ok_or(FetchError::NoDestination)?;
    let name = local
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(FetchError::NoDestination)?;
    tokio::fs::create_dir_all(parent).await?;
    let tmp = parent.join(format!(".{name}{PARTIAL_SUFFIX}"));

    let mut request = client.get(&action.url);
    for (key, value) in &action.headers {
        request = request.header(key.as_str(), value.as_str());
    }
    let mut response = request.send().await?.error_for_status()?;

    let mut file = tokio::fs::File::create(&tmp).await?;
    let streamed = stream_verify(&mut response, &mut file, action, cancel).await;
    drop(file);
    match streamed {
        Ok(bytes) => {
            tokio::fs::rename(&tmp, local).await?;
            Ok(bytes)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

async fn stream_verify(
    response: &mut reqwest::Response,
    file: &mut tokio::fs::File,
    action: &SyncAction,
    cancel: &CancellationToken,
) -> Result<u64, FetchError> {
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Canceled),
            chunk = response.chunk() => chunk?,
        };
        let Some(chunk) = chunk else {
            break;
        };
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    if action.size > 0 && written != action.size {
        return Err(FetchError::SizeMismatch {
            expected: action.size,
            actual: written,
        });
    }
    if !action.checksum.is_empty() {
        let actual = hex::encode(hasher.finalize());
        if actual != action.checksum {
            return Err(FetchError::ChecksumMismatch {
                expected: action.checksum.clone(),
                actual,
            });
        }
    }
    Ok(written)
}
