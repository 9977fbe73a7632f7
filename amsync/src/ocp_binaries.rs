use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use amlib::CancellationToken;
use amlib::http::{DEFAULT_TIMEOUT, http_client, validate_http_url};
use amlib::io::MANIFEST_BODY_LIMIT;
use amlib::paths::clean_relative_path;
use amdiscover::checksums::parse_checksum_file;
use async_trait::async_trait;
use log::{info, warn};
use tokio::sync::Mutex;

use crate::action::{PlanBuilder, SyncAction, SyncPlan, decide_local};
use crate::config::VersionedTreeConfig;
use crate::provider::{Provider, ProviderError, get_bytes, plan_partial_deletes};

const DEFAULT_OCP_BASE: &str =
    "https://mirror.openshift.com/pub/openshift-v4/x86_64/clients/ocp";
const DEFAULT_RHCOS_BASE: &str =
    "https://mirror.openshift.com/pub/openshift-v4/x86_64/dependencies/rhcos";

/// Mirrors a `<base>/<version>/sha256sum.txt` style tree. Serves both the
/// OCP client binaries and the RHCOS images, which share that layout.
pub struct VersionedTreeProvider {
    name: String,
    kind: &'static str,
    data_dir: PathBuf,
    root: PathBuf,
    cfg: VersionedTreeConfig,
    client: reqwest::Client,
    // version -> filename -> sha256, for validation
    manifest_memo: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl VersionedTreeProvider {
    pub fn new_ocp_binaries(
        data_dir: impl Into<PathBuf>,
        cfg: VersionedTreeConfig,
    ) -> Result<Self, ProviderError> {
        Self::new("ocp_binaries", DEFAULT_OCP_BASE, data_dir, cfg)
    }

    pub fn new_rhcos(
        data_dir: impl Into<PathBuf>,
        cfg: VersionedTreeConfig,
    ) -> Result<Self, ProviderError> {
        Self::new("rhcos", DEFAULT_RHCOS_BASE, data_dir, cfg)
    }

    fn new(
        kind: &'static str,
        default_base: &str,
        data_dir: impl Into<PathBuf>,
        mut cfg: VersionedTreeConfig,
    ) -> Result<Self, ProviderError> {
        if cfg.base_url.is_empty() {
            cfg.base_url = default_base.to_string();
        }
        validate_http_url(&cfg.base_url)?;
        clean_relative_path(&cfg.output_dir)?;
        let data_dir = data_dir.into();
        let name = kind.to_string();
        let root = data_dir.join(&name);
        Ok(Self {
            name,
            kind,
            data_dir,
            root,
            cfg,
            client: http_client(DEFAULT_TIMEOUT)?,
            manifest_memo: Mutex::new(BTreeMap::new()),
        })
    }

    fn ignored(&self, filename: &str) -> bool {
        let lower = filename.to_ascii_lowercase();
        self.cfg
            .ignored_patterns
            .iter()
            .any(|p| !p.is_empty() && lower.contains(&p.to_ascii_lowercase()))
    }

    async fn fetch_version_manifest(
        &self,
        version: &str,
    ) -> Result<BTreeMap<String, String>, ProviderError> {
        let base = self.cfg.base_url.trim_end_matches('/');
        let url = format!("{base}/{version}/sha256sum.txt");
        let body = get_bytes(&self.client, &url, MANIFEST_BODY_LIMIT).await?;
        Ok(parse_checksum_file(&String::from_utf8_lossy(&body)))
    }

    async fn plan_version(
        &self,
        version: &str,
        builder: &mut PlanBuilder,
    ) -> Result<(), ProviderError> {
        let sums = self.fetch_version_manifest(version).await?;
        let base = self.cfg.base_url.trim_end_matches('/');
        for (filename, checksum) in sums {
            if self.ignored(&filename) {
                continue;
            }
            let rel = clean_relative_path(&format!(
                "{}/{}/{}",
                self.cfg.output_dir, version, filename
            ))?;
            let destination = builder.destination(&rel)?;
            let decision = decide_local(&destination, 0, &checksum);
            let verified = if checksum.len() == 64 {
                checksum
            } else {
                String::new()
            };
            builder.push(SyncAction {
                path: rel,
                local_path: None,
                kind: decision.kind,
                size: 0,
                checksum: verified,
                url: format!("{base}/{version}/{filename}"),
                reason: decision.reason.to_string(),
                headers: BTreeMap::new(),
            })?;
        }
        Ok(())
    }

}

#[async_trait]
impl Provider for VersionedTreeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        self.kind
    }

    fn set_name(&mut self, name: String) {
        self.root = self.data_dir.join(&name);
        self.name = name;
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn output_dirs(&self) -> Vec<String> {
        vec![self.cfg.output_dir.clone()]
    }

    fn http(&self) -> &reqwest::Client {
        &self.client
    }

    fn sync_options(&self, base: &crate::config::SyncOptions) -> crate::config::SyncOptions {
        let mut options = base.clone();
        options.retry_count = self.cfg.retry_attempts.max(1);
        options
    }

    async fn plan(&self, cancel: &CancellationToken) -> Result<SyncPlan, ProviderError> {
        let mut builder = PlanBuilder::new(&self.name, &self.root);
        if self.cfg.enabled {
            for version in &self.cfg.versions {
                if cancel.is_cancelled() {
                    return Err(ProviderError::Canceled);
                }
                match self.plan_version(version, &mut builder).await {
                    Ok(()) => {}
                    Err(e @ (ProviderError::Plan(_) | ProviderError::Unsafe(_))) => {
                        return Err(e);
                    }
                    Err(e) => warn!("{}: version {version}: {e}", self.name),
                }
            }
            plan_partial_deletes(&mut builder, &self.cfg.output_dir)?;
        }
        let plan = builder.finish();
        info!("{}: planned {} actions", self.name, plan.total_files);
        Ok(plan)
    }

    async fn expected_checksum(&self, rel_path: &str) -> Option<String> {
        let rest = rel_path.strip_prefix(&format!("{}/", self.cfg.output_dir))?;
        let (version, filename) = rest.split_once('/')?;

        let mut memo = self.manifest_memo.lock().await;
        if !memo.contains_key(version) {
            match self.fetch_version_manifest(version).await {
                Ok(sums) => {
                    memo.insert(version.to_string(), sums);
                }
                Err(e) => {
                    warn!("{}: cannot refetch manifest for {version}: {e}", self.name);
                    return None;
                }
            }
        }
        memo.get(version)?.get(filename).cloned()
    }
}
