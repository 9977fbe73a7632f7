use serde::Deserialize;

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    8
}

fn default_retries() -> u32 {
    5
}

fn default_platforms() -> Vec<String> {
    vec!["linux".to_string(), "linux-arm64".to_string()]
}

fn default_ocp_clients_dir() -> String {
    "ocp-clients".to_string()
}

fn default_images_dir() -> String {
    "images".to_string()
}

fn default_registry_dir() -> String {
    "registry-images".to_string()
}

/// Executor knobs, shared across providers.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncOptions {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Download attempts per file, capped by the executor.
    #[serde(default = "default_retries")]
    pub retry_count: u32,
    /// Plan counters only; no network or filesystem writes.
    #[serde(default)]
    pub dry_run: bool,
    /// Apply the plan's delete actions.
    #[serde(default = "default_true")]
    pub delete_extraneous: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retry_count: default_retries(),
            dry_run: false,
            delete_extraneous: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpelRepo {
    pub name: String,
    pub base_url: String,
    pub output_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub repos: Vec<EpelRepo>,
    #[serde(default = "default_workers")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_retries")]
    pub retry_attempts: u32,
    /// Emit delete actions for local files no longer present upstream.
    #[serde(default)]
    pub cleanup_removed_packages: bool,
}

/// Shared by the `ocp_binaries` and `rhcos` providers: a base URL with
/// one `sha256sum.txt`-described directory per version.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionedTreeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub versions: Vec<String>,
    /// Case-insensitive substring tests against the upstream filename;
    /// any hit excludes the file. Not globs.
    #[serde(default)]
    pub ignored_patterns: Vec<String>,
    pub output_dir: String,
    #[serde(default = "default_retries")]
    pub retry_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OcpClientsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub channels: Vec<String>,
    /// Pinned versions mirrored in addition to whatever the channels
    /// currently resolve to.
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default = "default_platforms")]
    pub platforms: Vec<String>,
    #[serde(default = "default_ocp_clients_dir")]
    pub output_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerImagesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default = "default_images_dir")]
    pub output_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryMirrorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub endpoint: String,
    #[serde(default)]
    pub repositories: Vec<String>,
    /// Glob patterns; exact tag names also match. Empty keeps all tags.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_registry_dir")]
    pub output_dir: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_in() {
        let cfg: OcpClientsConfig =
            serde_json::from_str(r#"{"channels": ["stable-4.17"]}"#).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.platforms, ["linux", "linux-arm64"]);
        assert_eq!(cfg.output_dir, "ocp-clients");

        let cfg: ContainerImagesConfig = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(cfg.output_dir, "images");

        let cfg: RegistryMirrorConfig =
            serde_json::from_str(r#"{"endpoint": "registry.example.com"}"#).unwrap();
        assert_eq!(cfg.output_dir, "registry-images");
        assert!(cfg.tags.is_empty());

        let opts = SyncOptions::default();
        assert_eq!(opts.workers, 8);
        assert_eq!(opts.retry_count, 5);
        assert!(!opts.dry_run);
    }

    #[test]
    fn test_epel_config_parses() {
        let cfg: EpelConfig = serde_json::from_str(
            r#"{
                "repos": [{"name": "epel9",
                           "base_url": "https://dl.fedoraproject.org/pub/epel/9/Everything/x86_64",
                           "output_dir": "epel9"}],
                "cleanup_removed_packages": true
            }"#,
        )
        .unwrap();
        assert!(cfg.enabled);
        assert!(cfg.cleanup_removed_packages);
        assert_eq!(cfg.repos.len(), 1);
        assert_eq!(cfg.max_concurrent_downloads, 8);
    }
}
