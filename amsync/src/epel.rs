use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use amlib::CancellationToken;
use amlib::http::{DEFAULT_TIMEOUT, http_client, validate_http_url};
use amlib::io::MANIFEST_BODY_LIMIT;
use amlib::paths::clean_relative_path;
use amdiscover::repomd::{PackageInfo, parse_primary, parse_repomd};
use async_trait::async_trait;
use log::{info, warn};
use tokio::sync::Mutex;

use crate::action::{ActionKind, PlanBuilder, SyncAction, SyncPlan, decide_local};
use crate::config::{EpelConfig, EpelRepo};
use crate::localfs::{gunzip, is_partial, walk_relative_files};
use crate::provider::{INDEX_BODY_LIMIT, Provider, ProviderError, get_bytes};

/// Mirrors YUM repositories: `repomd.xml` names the primary index, the
/// primary index names every rpm.
pub struct EpelProvider {
    name: String,
    data_dir: PathBuf,
    root: PathBuf,
    cfg: EpelConfig,
    client: reqwest::Client,
    // repo name -> location.href -> sha256, filled lazily for validation
    primary_memo: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl EpelProvider {
    pub fn new(data_dir: impl Into<PathBuf>, cfg: EpelConfig) -> Result<Self, ProviderError> {
        for repo in &cfg.repos {
            validate_http_url(&repo.base_url)?;
            clean_relative_path(&repo.output_dir)?;
        }
        let data_dir = data_dir.into();
        let name = "epel".to_string();
        let root = data_dir.join(&name);
        Ok(Self {
            name,
            data_dir,
            root,
            cfg,
            client: http_client(DEFAULT_TIMEOUT)?,
            primary_memo: Mutex::new(BTreeMap::new()),
        })
    }

    async fn fetch_packages(&self, repo: &EpelRepo) -> Result<Vec<PackageInfo>, ProviderError> {
        let base = repo.base_url.trim_end_matches('/');
        let repomd = get_bytes(
            &self.client,
            &format!("{base}/repodata/repomd.xml"),
            MANIFEST_BODY_LIMIT,
        )
        .await?;
        let primary = parse_repomd(&repomd)?;
        let gz = get_bytes(
            &self.client,
            &format!("{base}/{}", primary.href.trim_start_matches('/')),
            INDEX_BODY_LIMIT,
        )
        .await?;
        let xml = gunzip(&gz)?;
        Ok(parse_primary(&xml)?)
    }

    async fn plan_repo(
        &self,
        repo: &EpelRepo,
        builder: &mut PlanBuilder,
    ) -> Result<(), ProviderError> {
        let packages = self.fetch_packages(repo).await?;
        let base = repo.base_url.trim_end_matches('/');

        let mut upstream: BTreeSet<String> = BTreeSet::new();
        for pkg in &packages {
            let rel = clean_relative_path(&format!("{}/{}", repo.output_dir, pkg.location))?;
            let destination = builder.destination(&rel)?;
            let decision = decide_local(&destination, pkg.size, &pkg.checksum);
            let checksum = if pkg.checksum.len() == 64 {
                pkg.checksum.clone()
            } else {
                // only sha256 survives into the verified download path
                String::new()
            };
            upstream.insert(rel.clone());
            builder.push(SyncAction {
                path: rel,
                local_path: None,
                kind: decision.kind,
                size: pkg.size,
                checksum,
                url: format!("{base}/{}", pkg.location),
                reason: decision.reason.to_string(),
                headers: BTreeMap::new(),
            })?;
        }

        let out_abs = builder.destination(&repo.output_dir)?;
        if out_abs.exists() {
            for (rel_in_out, _) in walk_relative_files(&out_abs) {
                let rel = format!("{}/{}", repo.output_dir, rel_in_out);
                let reason = if is_partial(&rel) {
                    "stale partial download"
                } else if self.cfg.cleanup_removed_packages && !upstream.contains(&rel) {
                    "removed upstream"
                } else {
                    continue;
                };
                builder.push(SyncAction {
                    path: rel,
                    local_path: None,
                    kind: ActionKind::Delete,
                    size: 0,
                    checksum: String::new(),
                    url: String::new(),
                    reason: reason.to_string(),
                    headers: BTreeMap::new(),
                })?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for EpelProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "epel"
    }

    fn set_name(&mut self, name: String) {
        self.root = self.data_dir.join(&name);
        self.name = name;
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn output_dirs(&self) -> Vec<String> {
        self.cfg.repos.iter().map(|r| r.output_dir.clone()).collect()
    }

    fn http(&self) -> &reqwest::Client {
        &self.client
    }

    fn sync_options(&self, base: &crate::config::SyncOptions) -> crate::config::SyncOptions {
        let mut options = base.clone();
        options.workers = self.cfg.max_concurrent_downloads.max(1);
        options.retry_count = self.cfg.retry_attempts.max(1);
        options
    }

    async fn plan(&self, cancel: &CancellationToken) -> Result<SyncPlan, ProviderError> {
        let mut builder = PlanBuilder::new(&self.name, &self.root);
        if self.cfg.enabled {
            for repo in &self.cfg.repos {
                if cancel.is_cancelled() {
                    return Err(ProviderError::Canceled);
                }
                match self.plan_repo(repo, &mut builder).await {
                    Ok(()) => {}
                    // an upstream that tries to escape the tree fails the
                    // whole plan; a flaky upstream only loses its repo
                    Err(e @ (ProviderError::Plan(_) | ProviderError::Unsafe(_))) => {
                        return Err(e);
                    }
                    Err(e) => warn!("{}: repo {}: {e}", self.name, repo.name),
                }
            }
        }
        let plan = builder.finish();
        info!(
            "{}: planned {} actions, {} bytes to transfer",
            self.name, plan.total_files, plan.total_size
        );
        Ok(plan)
    }

    async fn expected_checksum(&self, rel_path: &str) -> Option<String> {
        let repo = self
            .cfg
            .repos
            .iter()
            .find(|r| rel_path.starts_with(&format!("{}/", r.output_dir)))?;
        let location = rel_path.strip_prefix(&format!("{}/", repo.output_dir))?;

        let mut memo = self.primary_memo.lock().await;
        if !memo.contains_key(&repo.name) {
            let packages = match self.fetch_packages(repo).await {
                Ok(packages) => packages,
                Err(e) => {
                    warn!("{}: cannot refetch primary for {}: {e}", self.name, repo.name);
                    return None;
                }
            };
            let by_location = packages
                .into_iter()
                .filter(|p| p.checksum.len() == 64)
                .map(|p| (p.location, p.checksum))
                .collect();
            memo.insert(repo.name.clone(), by_location);
        }
        memo.get(&repo.name)?.get(location).cloned()
    }
}
