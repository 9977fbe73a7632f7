use std::path::{Path, PathBuf};

use amlib::CancellationToken;
use amlib::http::{REGISTRY_TIMEOUT, http_client};
use amlib::paths::clean_relative_path;
use amoci::reference::validate_digest;
use amoci::{ImageReference, RegistryClient, RegistryError, WalkItem, walk};
use async_trait::async_trait;
use log::{info, warn};

use crate::action::{PlanBuilder, SyncAction, SyncPlan, decide_content_addressed};
use crate::config::ContainerImagesConfig;
use crate::provider::{Provider, ProviderError, plan_partial_deletes};

/// Mirrors a fixed list of image references into per-image
/// content-addressed trees.
pub struct ContainerImagesProvider {
    name: String,
    data_dir: PathBuf,
    root: PathBuf,
    cfg: ContainerImagesConfig,
    references: Vec<ImageReference>,
    registry: RegistryClient,
    client: reqwest::Client,
}

impl ContainerImagesProvider {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        cfg: ContainerImagesConfig,
    ) -> Result<Self, ProviderError> {
        Self::with_registry(data_dir, cfg, RegistryClient::builder().build()?)
    }

    pub fn with_registry(
        data_dir: impl Into<PathBuf>,
        cfg: ContainerImagesConfig,
        registry: RegistryClient,
    ) -> Result<Self, ProviderError> {
        clean_relative_path(&cfg.output_dir)?;
        // a bad reference is a configuration error, caught before any plan
        let references = cfg
            .images
            .iter()
            .map(|image| ImageReference::parse(image))
            .collect::<Result<Vec<_>, _>>()?;
        let data_dir = data_dir.into();
        let name = "container_images".to_string();
        let root = data_dir.join(&name);
        Ok(Self {
            name,
            data_dir,
            root,
            cfg,
            references,
            registry,
            client: http_client(REGISTRY_TIMEOUT)?,
        })
    }

}

/// Turn walk output into content-addressed plan actions under
/// `<output_dir>/<slug>/`. Shared with the registry-mirror provider.
pub(crate) fn push_walk_items(
    builder: &mut PlanBuilder,
    output_dir: &str,
    slug: &str,
    items: Vec<WalkItem>,
) -> Result<(), ProviderError> {
    for item in items {
        let rel = clean_relative_path(&format!("{output_dir}/{slug}/{}", item.path))?;
        let destination = builder.destination(&rel)?;
        let decision = decide_content_addressed(&destination);
        let checksum = match validate_digest(&item.digest) {
            Ok(("sha256", hex)) => hex.to_string(),
            // other algorithms keep their content-addressed path but
            // skip executor-side verification
            _ => String::new(),
        };
        builder.push(SyncAction {
            path: rel,
            local_path: None,
            kind: decision.kind,
            size: item.size,
            checksum,
            url: item.url,
            reason: decision.reason.to_string(),
            headers: item.headers,
        })?;
    }
    Ok(())
}

#[async_trait]
impl Provider for ContainerImagesProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "container_images"
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
            for reference in &self.references {
                if cancel.is_cancelled() {
                    return Err(ProviderError::Canceled);
                }
                match walk(&self.registry, reference, cancel).await {
                    Ok(items) => {
                        push_walk_items(
                            &mut builder,
                            &self.cfg.output_dir,
                            &reference.slug(),
                            items,
                        )?;
                    }
                    Err(RegistryError::Canceled) => return Err(ProviderError::Canceled),
                    Err(e) => warn!("{}: image {reference}: {e}", self.name),
                }
            }
            plan_partial_deletes(&mut builder, &self.cfg.output_dir)?;
        }
        let plan = builder.finish();
        info!("{}: planned {} actions", self.name, plan.total_files);
        Ok(plan)
    }
}
