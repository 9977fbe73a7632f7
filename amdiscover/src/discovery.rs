use std::sync::Arc;
use std::time::{Duration, Instant};

use amlib::CancellationToken;
use amlib::http::{DEFAULT_TIMEOUT, PROBE_TIMEOUT, validate_http_url};
use amlib::io::{MANIFEST_BODY_LIMIT, read_all_with_limit};
use futures::future::join_all;
use log::warn;
use tokio::sync::Semaphore;
use url::Url;

use crate::DecodeError;
use crate::cache::{DEFAULT_TTL, TtlCache};
use crate::htmldir::{self, OcpListing};
use crate::metalink::{self, MirrorInfo};

const DEFAULT_EPEL_METALINK: &str = "https://mirrors.fedoraproject.org/metalink";
const DEFAULT_OCP_BASE: &str =
    "https://mirror.openshift.com/pub/openshift-v4/x86_64/clients/ocp";
const DEFAULT_RHCOS_BASE: &str =
    "https://mirror.openshift.com/pub/openshift-v4/x86_64/dependencies/rhcos";
const DEFAULT_PROBE_LIMIT: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Url(#[from] amlib::http::UrlError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Read(#[from] amlib::io::ReadError),
    #[error("status {0} from {1}")]
    Status(reqwest::StatusCode, String),
    #[error("cached fetch failed: {0}")]
    Shared(Arc<DiscoveryError>),
}

/// One RHCOS minor stream. `builds` is `None` when the per-minor listing
/// could not be fetched; the overall discovery still succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RhcosStream {
    pub minor: String,
    pub builds: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SpeedResult {
    pub url: String,
    pub latency_ms: Option<u64>,
    pub kbps: Option<f64>,
    pub error: Option<String>,
}

pub struct DiscoveryBuilder {
    epel_metalink: String,
    ocp_base: String,
    rhcos_base: String,
    ttl: Duration,
    probe_limit: usize,
}

impl Default for DiscoveryBuilder {
    fn default() -> Self {
        Self {
            epel_metalink: DEFAULT_EPEL_METALINK.to_string(),
            ocp_base: DEFAULT_OCP_BASE.to_string(),
            rhcos_base: DEFAULT_RHCOS_BASE.to_string(),
            ttl: DEFAULT_TTL,
            probe_limit: DEFAULT_PROBE_LIMIT,
        }
    }
}

impl DiscoveryBuilder {
    pub fn epel_metalink(mut self, url: impl Into<String>) -> Self {
        self.epel_metalink = url.into();
        self
    }

    pub fn ocp_base(mut self, url: impl Into<String>) -> Self {
        self.ocp_base = url.into();
        self
    }

    pub fn rhcos_base(mut self, url: impl Into<String>) -> Self {
        self.rhcos_base = url.into();
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn probe_limit(mut self, n: usize) -> Self {
        self.probe_limit = n;
        self
    }

    pub fn build(self) -> Result<Discovery, DiscoveryError> {
        Ok(Discovery {
            client: amlib::http::http_client(DEFAULT_TIMEOUT)?,
            probe_client: amlib::http::http_client(PROBE_TIMEOUT)?,
            epel_metalink: validate_http_url(&self.epel_metalink)?,
            ocp_base: validate_http_url(&self.ocp_base)?,
            rhcos_base: validate_http_url(&self.rhcos_base)?,
            mirrors: TtlCache::new(self.ttl),
            ocp_listing: TtlCache::new(self.ttl),
            rhcos: TtlCache::new(self.ttl),
            probe_limit: self.probe_limit.max(1),
        })
    }
}

/// Index discovery against the EPEL and OpenShift mirror trees, with a TTL
/// cache in front of every slow upstream listing.
pub struct Discovery {
    client: reqwest::Client,
    probe_client: reqwest::Client,
    epel_metalink: Url,
    ocp_base: Url,
    rhcos_base: Url,
    mirrors: TtlCache<Arc<Vec<MirrorInfo>>>,
    ocp_listing: TtlCache<Arc<OcpListing>>,
    rhcos: TtlCache<Arc<Vec<RhcosStream>>>,
    probe_limit: usize,
}

impl Discovery {
    pub fn builder() -> DiscoveryBuilder {
        DiscoveryBuilder::default()
    }

    /// EPEL mirror list for one release/arch, best mirror first.
    pub async fn epel_mirrors(
        &self,
        version: &str,
        arch: &str,
    ) -> Result<Arc<Vec<MirrorInfo>>, DiscoveryError> {
        let key = format!("epel:{version}:{arch}");
        self.mirrors
            .get_or_fetch(&key, async {
                let mut url = self.epel_metalink.clone();
                url.query_pairs_mut()
                    .append_pair("repo", &format!("epel-{version}"))
                    .append_pair("arch", arch);
                let body = self.fetch(url).await?;
                Ok(Arc::new(metalink::parse_metalink(&body)?))
            })
            .await
            .map_err(DiscoveryError::Shared)
    }

    /// Channel and release directories at the OCP clients mirror root.
    pub async fn ocp_versions(&self) -> Result<Arc<OcpListing>, DiscoveryError> {
        self.ocp_listing
            .get_or_fetch("ocp:versions", async {
                let body = self.fetch(self.ocp_base.clone()).await?;
                let entries = htmldir::parse_dir_listing(&String::from_utf8_lossy(&body));
                Ok(Arc::new(htmldir::categorize_ocp_entries(&entries)))
            })
            .await
            .map_err(DiscoveryError::Shared)
    }

    /// RHCOS minor streams and their build directories. A failed per-minor
    /// listing logs a warning and leaves that stream with `builds: None`
    /// rather than failing the whole call.
    pub async fn rhcos_versions(&self) -> Result<Arc<Vec<RhcosStream>>, DiscoveryError> {
        self.rhcos
            .get_or_fetch("rhcos:versions", async {
                let body = self.fetch(self.rhcos_base.clone()).await?;
                let entries = htmldir::parse_dir_listing(&String::from_utf8_lossy(&body));
                let minors = htmldir::rhcos_minors(&entries);

                let mut streams = Vec::with_capacity(minors.len());
                for minor in minors {
                    let url = join_dir(&self.rhcos_base, &minor);
                    let builds = match self.fetch(url).await {
                        Ok(body) => {
                            let entries =
                                htmldir::parse_dir_listing(&String::from_utf8_lossy(&body));
                            Some(htmldir::rhcos_builds(&entries))
                        }
                        Err(e) => {
                            warn!("rhcos {minor}: build listing failed: {e}");
                            None
                        }
                    };
                    streams.push(RhcosStream { minor, builds });
                }
                Ok(Arc::new(streams))
            })
            .await
            .map_err(DiscoveryError::Shared)
    }

    /// Two-phase mirror probing: HEAD everything for latency, then GET the
    /// `top_n` fastest responders for throughput. Probes run under a fixed
    /// concurrency cap with a 5 second per-request budget. Errored URLs
    /// always sort last.
    pub async fn speed_test(
        &self,
        urls: &[String],
        top_n: usize,
        cancel: &CancellationToken,
    ) -> Vec<SpeedResult> {
        let semaphore = Arc::new(Semaphore::new(self.probe_limit));

        let head_probes = urls.iter().map(|url| {
            let client = self.probe_client.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let url = url.clone();
            async move {
                let _permit = semaphore.acquire().await;
                if cancel.is_cancelled() {
                    return SpeedResult {
                        url,
                        latency_ms: None,
                        kbps: None,
                        error: Some("canceled".to_string()),
                    };
                }
                let start = Instant::now();
                let outcome = client
                    .head(&url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status());
                match outcome {
                    Ok(_) => SpeedResult {
                        url,
                        latency_ms: Some(start.elapsed().as_millis() as u64),
                        kbps: None,
                        error: None,
                    },
                    Err(e) => SpeedResult {
                        url,
                        latency_ms: None,
                        kbps: None,
                        error: Some(e.to_string()),
                    },
                }
            }
        });
        let mut results = join_all(head_probes).await;
        results.sort_by(|a, b| match (&a.error, &b.error) {
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            _ => a.latency_ms.cmp(&b.latency_ms),
        });

        let candidates: Vec<SpeedResult> = results
            .iter()
            .filter(|r| r.error.is_none())
            .take(top_n)
            .cloned()
            .collect();
        let tested_urls: Vec<&str> = candidates.iter().map(|r| r.url.as_str()).collect();
        let residual: Vec<SpeedResult> = results
            .iter()
            .filter(|r| !tested_urls.contains(&r.url.as_str()))
            .cloned()
            .collect();

        let get_probes = candidates.into_iter().map(|mut result| {
            let client = self.probe_client.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            async move {
                let _permit = semaphore.acquire().await;
                if cancel.is_cancelled() {
                    result.error = Some("canceled".to_string());
                    return result;
                }
                let start = Instant::now();
                match throughput_get(&client, &result.url).await {
                    Ok(bytes) => {
                        let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
                        result.kbps = Some(bytes as f64 / elapsed / 1024.0);
                    }
                    Err(e) => {
                        result.error = Some(e.to_string());
                    }
                }
                result
            }
        });
        let mut combined = join_all(get_probes).await;
        combined.extend(residual);
        combined.sort_by(|a, b| match (&a.error, &b.error) {
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(_), Some(_)) => std::cmp::Ordering::Equal,
            (None, None) => b
                .kbps
                .unwrap_or(0.0)
                .partial_cmp(&a.kbps.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal),
        });
        combined
    }

    async fn fetch(&self, url: Url) -> Result<Vec<u8>, DiscoveryError> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::Status(response.status(), url.to_string()));
        }
        Ok(read_all_with_limit(response, MANIFEST_BODY_LIMIT).await?.to_vec())
    }
}

async fn throughput_get(client: &reqwest::Client, url: &str) -> Result<u64, reqwest::Error> {
    let mut response = client.get(url).send().await?.error_for_status()?;
    let mut bytes: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        bytes += chunk.len() as u64;
    }
    Ok(bytes)
}

fn join_dir(base: &Url, segment: &str) -> Url {
    let mut url = base.clone();
    {
        let mut path = url.path().trim_end_matches('/').to_string();
        path.push('/');
        path.push_str(segment);
        path.push('/');
        url.set_path(&path);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const METALINK: &str = r#"<metalink><files><file name="repomd.xml"><resources>
<url protocol="https" location="US" preference="100">https://mirror1.example.com/pub/epel/9/Everything/x86_64/repodata/repomd.xml</url>
</resources></file></files></metalink>"#;

    async fn discovery_for(server: &MockServer, ttl: Duration) -> Discovery {
        Discovery::builder()
            .epel_metalink(format!("{}/metalink", server.uri()))
            .ocp_base(format!("{}/ocp", server.uri()))
            .rhcos_base(format!("{}/rhcos", server.uri()))
            .ttl(ttl)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_epel_mirrors_cached_within_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metalink"))
            .and(query_param("repo", "epel-9"))
            .and(query_param("arch", "x86_64"))
            .respond_with(ResponseTemplate::new(200).set_body_string(METALINK))
            .expect(1)
            .mount(&server)
            .await;

        let discovery = discovery_for(&server, Duration::from_secs(60)).await;
        let first = discovery.epel_mirrors("9", "x86_64").await.unwrap();
        let second = discovery.epel_mirrors("9", "x86_64").await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].url, second[0].url);
        // wiremock asserts hit-count 1 on drop
    }

    #[tokio::test]
    async fn test_epel_mirrors_refetched_after_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metalink"))
            .respond_with(ResponseTemplate::new(200).set_body_string(METALINK))
            .expect(2)
            .mount(&server)
            .await;

        let discovery = discovery_for(&server, Duration::from_millis(1)).await;
        discovery.epel_mirrors("9", "x86_64").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        discovery.epel_mirrors("9", "x86_64").await.unwrap();
    }

    #[tokio::test]
    async fn test_rhcos_partial_failure_keeps_minor() {
        let server = MockServer::start().await;
        let root = r#"<a href="4.17/">4.17/</a> <a href="4.16/">4.16/</a>"#;
        Mock::given(method("GET"))
            .and(path("/rhcos/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(root))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rhcos/4.17/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"<a href="4.17.0/">4.17.0/</a>"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rhcos/4.16/"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let discovery = Discovery::builder()
            .rhcos_base(format!("{}/rhcos/", server.uri()))
            .build()
            .unwrap();
        let streams = discovery.rhcos_versions().await.unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].minor, "4.17");
        assert_eq!(streams[0].builds.as_deref(), Some(&["4.17.0".to_string()][..]));
        assert_eq!(streams[1].minor, "4.16");
        assert_eq!(streams[1].builds, None);
    }

    #[tokio::test]
    async fn test_speed_test_orders_errors_last() {
        let server = MockServer::start().await;
        Mock::given(path("/fast"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&server)
            .await;
        Mock::given(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let discovery = discovery_for(&server, Duration::from_secs(60)).await;
        let urls = vec![
            format!("{}/broken", server.uri()),
            format!("{}/fast", server.uri()),
        ];
        let results = discovery
            .speed_test(&urls, 2, &CancellationToken::new())
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].url.ends_with("/fast"));
        assert!(results[0].kbps.is_some());
        assert!(results[1].error.is_some());
    }
}
