use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use amlib::CancellationToken;
use amlib::http::{DEFAULT_TIMEOUT, http_client};
use amlib::paths::clean_relative_path;
use amdiscover::ocp::{OcpClient, filter_artifacts_by_platform};
use async_trait::async_trait;
use log::{info, warn};
use semver::Version;
use tokio::sync::Mutex;

use crate::action::{PlanBuilder, SyncAction, SyncPlan, decide_local};
use crate::config::OcpClientsConfig;
use crate::provider::{Provider, ProviderError, plan_partial_deletes};

/// Mirrors the `oc`/installer/tooling artifacts for every version its
/// configured channels currently resolve to, plus any pinned versions.
pub struct OcpClientsProvider {
    name: String,
    data_dir: PathBuf,
    root: PathBuf,
    cfg: OcpClientsConfig,
    ocp: OcpClient,
    client: reqwest::Client,
    manifest_memo: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl OcpClientsProvider {
    pub fn new(data_dir: impl Into<PathBuf>, cfg: OcpClientsConfig) -> Result<Self, ProviderError> {
        let ocp = OcpClient::builder().build()?;
        Self::with_client(data_dir, cfg, ocp)
    }

    /// Like `new` but against a caller-supplied OCP client, so the graph
    /// and mirror endpoints can be pointed elsewhere.
    pub fn with_client(
        data_dir: impl Into<PathBuf>,
        cfg: OcpClientsConfig,
        ocp: OcpClient,
    ) -> Result<Self, ProviderError> {
        clean_relative_path(&cfg.output_dir)?;
        let data_dir = data_dir.into();
        let name = "ocp_clients".to_string();
        let root = data_dir.join(&name);
        Ok(Self {
            name,
            data_dir,
            root,
            cfg,
            ocp,
            client: http_client(DEFAULT_TIMEOUT)?,
            manifest_memo: Mutex::new(BTreeMap::new()),
        })
    }

    /// Channel resolutions unioned with pinned versions, deduplicated,
    /// oldest first.
    async fn resolve_versions(&self) -> Vec<String> {
        let mut unique: BTreeSet<String> = BTreeSet::new();
        for channel in &self.cfg.channels {
            match self.ocp.fetch_releases(channel).await {
                Ok(releases) => unique.extend(releases.versions.iter().cloned()),
                Err(e) => warn!("{}: channel {channel}: {e}", self.name),
            }
        }
        unique.extend(self.cfg.versions.iter().cloned());

        let mut versions: Vec<String> = unique.into_iter().collect();
        versions.sort_by(|a, b| match (Version::parse(a), Version::parse(b)) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => a.cmp(b),
        });
        versions
    }

    async fn plan_version(
        &self,
        version: &str,
        builder: &mut PlanBuilder,
    ) -> Result<(), ProviderError> {
        let artifacts = self.ocp.fetch_manifest(version).await?;
        let artifacts = filter_artifacts_by_platform(artifacts, &self.cfg.platforms);
        for artifact in artifacts {
            let rel = clean_relative_path(&format!(
                "{}/{}/{}",
                self.cfg.output_dir, version, artifact.filename
            ))?;
            let destination = builder.destination(&rel)?;
            let decision = decide_local(&destination, 0, &artifact.sha256);
            builder.push(SyncAction {
                path: rel,
                local_path: None,
                kind: decision.kind,
                size: 0,
                checksum: artifact.sha256,
                url: self.ocp.artifact_url(version, &artifact.filename).to_string(),
                reason: decision.reason.to_string(),
                headers: BTreeMap::new(),
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for OcpClientsProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "ocp_clients"
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

    async fn plan(&self, cancel: &CancellationToken) -> Result<SyncPlan, ProviderError> {
        let mut builder = PlanBuilder::new(&self.name, &self.root);
        if self.cfg.enabled {
            for version in self.resolve_versions().await {
                if cancel.is_cancelled() {
                    return Err(ProviderError::Canceled);
                }
                match self.plan_version(&version, &mut builder).await {
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
            match self.ocp.fetch_manifest(version).await {
                Ok(artifacts) => {
                    memo.insert(
                        version.to_string(),
                        artifacts
                            .into_iter()
                            .map(|a| (a.filename, a.sha256))
                            .collect(),
                    );
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
