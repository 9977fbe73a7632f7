use std::path::{Path, PathBuf};

use amlib::CancellationToken;
use amlib::http::{REGISTRY_TIMEOUT, http_client, validate_http_url};
use amlib::paths::clean_relative_path;
use amoci::client::filter_tags;
use amoci::{ImageReference, RegistryAuth, RegistryClient, RegistryError, walk};
use async_trait::async_trait;
use log::{info, warn};

use crate::action::{PlanBuilder, SyncPlan};
use crate::config::RegistryMirrorConfig;
use crate::images::push_walk_items;
use crate::provider::{Provider, ProviderError, plan_partial_deletes};

/// Mirrors whole repositories from one registry endpoint: every tag that
/// survives the configured patterns is walked like a single image.
pub struct RegistryMirrorProvider {
    name: String,
    data_dir: PathBuf,
    root: PathBuf,
    cfg: RegistryMirrorConfig,
    endpoint_host: String,
    registry: RegistryClient,
    client: reqwest::Client,
}

impl RegistryMirrorProvider {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        cfg: RegistryMirrorConfig,
    ) -> Result<Self, ProviderError> {
        clean_relative_path(&cfg.output_dir)?;
        let endpoint_host = endpoint_host_of(&cfg.endpoint)?;

        let mut builder = RegistryClient::builder();
        if let (Some(username), Some(password)) = (&cfg.username, &cfg.password) {
            if !username.is_empty() {
                builder = builder.auth(
                    endpoint_host.clone(),
                    RegistryAuth {
                        username: username.clone(),
                        password: password.clone(),
                    },
                );
            }
        }

        let data_dir = data_dir.into();
        let name = "registry".to_string();
        let root = data_dir.join(&name);
        Ok(Self {
            name,
            data_dir,
            root,
            cfg,
            endpoint_host,
            registry: builder.build()?,
            client: http_client(REGISTRY_TIMEOUT)?,
        })
    }

    async fn plan_repository(
        &self,
        repository: &str,
        builder: &mut PlanBuilder,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let tags = self.registry.list_tags(&self.endpoint_host, repository).await?;
        let tags = filter_tags(tags, &self.cfg.tags);
        info!(
            "{}: repository {repository}: {} tags to mirror",
            self.name,
            tags.len()
        );
        for tag in tags {
            if cancel.is_cancelled() {
                return Err(ProviderError::Canceled);
            }
            let reference = match ImageReference::with_tag(&self.endpoint_host, repository, &tag)
            {
                Ok(reference) => reference,
                Err(e) => {
                    warn!("{}: {repository}:{tag}: {e}", self.name);
                    continue;
                }
            };
            match walk(&self.registry, &reference, cancel).await {
                Ok(items) => {
                    push_walk_items(builder, &self.cfg.output_dir, &reference.slug(), items)?;
                }
                Err(RegistryError::Canceled) => return Err(ProviderError::Canceled),
                Err(e) => warn!("{}: {repository}:{tag}: {e}", self.name),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for RegistryMirrorProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "registry"
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
            for repository in &self.cfg.repositories {
                if cancel.is_cancelled() {
                    return Err(ProviderError::Canceled);
                }
                match self.plan_repository(repository, &mut builder, cancel).await {
                    Ok(()) => {}
                    Err(
                        e @ (ProviderError::Plan(_)
                        | ProviderError::Unsafe(_)
                        | ProviderError::Canceled),
                    ) => return Err(e),
                    Err(e) => warn!("{}: repository {repository}: {e}", self.name),
                }
            }
            plan_partial_deletes(&mut builder, &self.cfg.output_dir)?;
        }
        let plan = builder.finish();
        info!("{}: planned {} actions", self.name, plan.total_files);
        Ok(plan)
    }
}

fn endpoint_host_of(endpoint: &str) -> Result<String, ProviderError> {
    if endpoint.is_empty() {
        return Err(ProviderError::Config("registry endpoint is empty".to_string()));
    }
    if endpoint.contains("://") {
        let url = validate_http_url(endpoint)?;
        let host = url
            .host_str()
            .ok_or_else(|| ProviderError::Config(format!("no host in {endpoint:?}")))?;
        Ok(match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    } else {
        Ok(endpoint.to_string())
    }
}
