use std::collections::BTreeMap;
use std::path::Path;

use amlib::CancellationToken;
use async_trait::async_trait;
use log::{info, warn};

use crate::action::{PlanError, SyncPlan, SyncReport, ValidationReport};
use crate::config::SyncOptions;
use crate::executor;
use crate::localfs::walk_relative_files;
use crate::validate::{Expectation, check_against, classify, invalid};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Unsafe(#[from] amlib::paths::PathError),
    #[error(transparent)]
    Url(#[from] amlib::http::UrlError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Read(#[from] amlib::io::ReadError),
    #[error(transparent)]
    Decode(#[from] amdiscover::DecodeError),
    #[error(transparent)]
    Discovery(#[from] amdiscover::discovery::DiscoveryError),
    #[error(transparent)]
    Ocp(#[from] amdiscover::ocp::OcpError),
    #[error(transparent)]
    Registry(#[from] amoci::RegistryError),
    #[error(transparent)]
    Reference(#[from] amoci::ReferenceError),
    #[error("status {0} from {1}")]
    Status(reqwest::StatusCode, String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("canceled")]
    Canceled,
}

// large package indexes (EPEL primary.xml.gz) dwarf the manifest limit
pub(crate) const INDEX_BODY_LIMIT: usize = 256 * 1024 * 1024;

pub(crate) async fn get_bytes(
    client: &reqwest::Client,
    url: &str,
    limit: usize,
) -> Result<Vec<u8>, ProviderError> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(ProviderError::Status(response.status(), url.to_string()));
    }
    Ok(amlib::io::read_all_with_limit(response, limit)
        .await?
        .to_vec())
}

/// Emit delete actions for leftover `.partial` files under one output
/// directory. Planners call this so interrupted downloads get collected
/// on the next run.
pub(crate) fn plan_partial_deletes(
    builder: &mut crate::action::PlanBuilder,
    output_dir: &str,
) -> Result<(), ProviderError> {
    use crate::action::{ActionKind, SyncAction};
    use crate::localfs::{is_partial, walk_relative_files};

    let out_abs = builder.destination(output_dir)?;
    if !out_abs.exists() {
        return Ok(());
    }
    for (rel_in_out, _) in walk_relative_files(&out_abs) {
        if !is_partial(&rel_in_out) {
            continue;
        }
        builder.push(SyncAction {
            path: format!("{output_dir}/{rel_in_out}"),
            local_path: None,
            kind: ActionKind::Delete,
            size: 0,
            checksum: String::new(),
            url: String::new(),
            reason: "stale partial download".to_string(),
            headers: BTreeMap::new(),
        })?;
    }
    Ok(())
}

/// A provider adapter: plans against one upstream, syncs through the
/// shared executor, validates its local tree.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The name the provider was registered under; also its directory
    /// under the data dir.
    fn name(&self) -> &str;

    fn kind(&self) -> &'static str;

    /// Wire-up rename hook: the registry calls this with the user-chosen
    /// name before the provider is first used.
    fn set_name(&mut self, name: String);

    /// `<data_dir>/<name>`; every planned path stays under this.
    fn root(&self) -> &Path;

    /// Output directories relative to the root, for validation walks.
    fn output_dirs(&self) -> Vec<String>;

    /// The client the executor downloads with.
    fn http(&self) -> &reqwest::Client;

    async fn plan(&self, cancel: &CancellationToken) -> Result<SyncPlan, ProviderError>;

    /// Fold provider-level configuration (worker count, retry attempts)
    /// into the caller's options before executing.
    fn sync_options(&self, base: &SyncOptions) -> SyncOptions {
        base.clone()
    }

    async fn sync(
        &self,
        plan: &SyncPlan,
        options: &SyncOptions,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, ProviderError> {
        let options = self.sync_options(options);
        Ok(executor::execute(plan, &options, self.http(), cancel).await)
    }

    /// Upstream-known digest for a file that is not content-addressed,
    /// keyed by its plan-relative path. Providers whose upstream
    /// publishes manifests implement this for the validator.
    async fn expected_checksum(&self, rel_path: &str) -> Option<String> {
        let _ = rel_path;
        None
    }

    async fn validate(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ValidationReport, ProviderError> {
        let mut report = ValidationReport {
            provider: self.name().to_string(),
            results: Vec::new(),
        };
        for dir in self.output_dirs() {
            let abs_dir = amlib::paths::safe_join_under(self.root(), &dir)?;
            if !abs_dir.exists() {
                continue;
            }
            for (rel, abs) in walk_relative_files(&abs_dir) {
                if cancel.is_cancelled() {
                    return Err(ProviderError::Canceled);
                }
                let display = format!("{dir}/{rel}");
                let result = match classify(&rel) {
                    Expectation::Partial => invalid(&display, "partial download"),
                    Expectation::Embedded { algo, hex } => {
                        if algo == "sha256" {
                            check_against(&display, &abs, &hex)
                        } else {
                            invalid(&display, format!("unsupported digest algorithm {algo}"))
                        }
                    }
                    Expectation::Upstream => match self.expected_checksum(&display).await {
                        Some(hex) => check_against(&display, &abs, &hex),
                        None => invalid(&display, "no upstream digest known"),
                    },
                };
                report.results.push(result);
            }
        }
        info!(
            "validate {}: {} files, {} invalid",
            self.name(),
            report.results.len(),
            report.invalid_count()
        );
        Ok(report)
    }
}

/// Name to adapter. Registering an existing name replaces the previous
/// adapter; the adapter itself is renamed to match at wire-up.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Box<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, mut provider: Box<dyn Provider>) {
        let name = name.into();
        provider.set_name(name.clone());
        if self.providers.insert(name.clone(), provider).is_some() {
            warn!("provider {name:?} registered twice, replacing");
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Provider> {
        self.providers.get(name).map(|p| p.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeProvider {
        name: String,
        root: PathBuf,
        client: reqwest::Client,
        plans: AtomicU32,
    }

    impl FakeProvider {
        fn boxed(tag: &str) -> Box<Self> {
            Box::new(FakeProvider {
                name: tag.to_string(),
                root: PathBuf::from("/tmp/am-test").join(tag),
                client: reqwest::Client::new(),
                plans: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> &'static str {
            "fake"
        }
        fn set_name(&mut self, name: String) {
            self.name = name;
        }
        fn root(&self) -> &Path {
            &self.root
        }
        fn output_dirs(&self) -> Vec<String> {
            vec!["out".to_string()]
        }
        fn http(&self) -> &reqwest::Client {
            &self.client
        }
        async fn plan(&self, _cancel: &CancellationToken) -> Result<SyncPlan, ProviderError> {
            self.plans.fetch_add(1, Ordering::SeqCst);
            Ok(crate::action::PlanBuilder::new(&self.name, &self.root).finish())
        }
    }

    #[tokio::test]
    async fn test_registry_rename_and_replace() {
        let mut registry = ProviderRegistry::new();
        registry.register("mirror-a", FakeProvider::boxed("default"));
        assert_eq!(registry.get("mirror-a").unwrap().name(), "mirror-a");
        assert!(registry.get("default").is_none());

        registry.register("mirror-a", FakeProvider::boxed("other"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("mirror-a").unwrap().name(), "mirror-a");

        let plan = registry
            .get("mirror-a")
            .unwrap()
            .plan(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plan.provider, "mirror-a");
    }
}
