use std::sync::Arc;
use std::time::Duration;

use amlib::http::{DEFAULT_TIMEOUT, validate_http_url};
use amlib::io::{MANIFEST_BODY_LIMIT, read_all_with_limit};
use url::Url;

use crate::DecodeError;
use crate::cache::TtlCache;
use crate::checksums::parse_checksum_file;
use crate::graph::{parse_channels_tarball, parse_upgrade_graph};

const DEFAULT_GRAPH_URL: &str = "https://api.openshift.com/api/upgrades_info/v1/graph";
const DEFAULT_GRAPH_DATA_URL: &str = "https://api.openshift.com/api/upgrades_info/graph-data";
const DEFAULT_MIRROR_BASE: &str =
    "https://mirror.openshift.com/pub/openshift-v4/x86_64/clients/ocp";

const TRACKS_TTL: Duration = Duration::from_secs(12 * 60 * 60);
const RELEASES_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum OcpError {
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
    Shared(Arc<OcpError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactOs {
    Linux,
    Mac,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactArch {
    Amd64,
    Arm64,
    Ppc64le,
    S390x,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Client,
    Installer,
    Ccoctl,
    Opm,
    OcMirror,
    Other,
}

/// One downloadable file from a release's `sha256sum.txt`, classified by
/// what it is and what it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcpArtifact {
    pub filename: String,
    pub sha256: String,
    pub os: ArtifactOs,
    pub arch: ArtifactArch,
    pub kind: ArtifactKind,
}

/// Channels grouped by track prefix: stable, fast, eus, candidate, then
/// anything else. Within a group, newest minor first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tracks {
    pub groups: Vec<TrackGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackGroup {
    pub name: String,
    pub channels: Vec<String>,
}

/// Versions reachable in one channel, ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseSet {
    pub versions: Vec<String>,
}

impl ReleaseSet {
    pub fn latest(&self) -> Option<&str> {
        self.versions.last().map(String::as_str)
    }

    pub fn previous(&self) -> Option<&str> {
        self.versions
            .len()
            .checked_sub(2)
            .map(|i| self.versions[i].as_str())
    }
}

pub struct OcpClientBuilder {
    graph_url: String,
    graph_data_url: String,
    mirror_base: String,
}

impl Default for OcpClientBuilder {
    fn default() -> Self {
        Self {
            graph_url: DEFAULT_GRAPH_URL.to_string(),
            graph_data_url: DEFAULT_GRAPH_DATA_URL.to_string(),
            mirror_base: DEFAULT_MIRROR_BASE.to_string(),
        }
    }
}

impl OcpClientBuilder {
    pub fn graph_url(mut self, url: impl Into<String>) -> Self {
        self.graph_url = url.into();
        self
    }

    pub fn graph_data_url(mut self, url: impl Into<String>) -> Self {
        self.graph_data_url = url.into();
        self
    }

    pub fn mirror_base(mut self, url: impl Into<String>) -> Self {
        self.mirror_base = url.into();
        self
    }

    pub fn build(self) -> Result<OcpClient, OcpError> {
        Ok(OcpClient {
            client: amlib::http::http_client(DEFAULT_TIMEOUT)?,
            graph_url: validate_http_url(&self.graph_url)?,
            graph_data_url: validate_http_url(&self.graph_data_url)?,
            mirror_base: validate_http_url(&self.mirror_base)?,
            tracks: TtlCache::new(TRACKS_TTL),
            releases: TtlCache::new(RELEASES_TTL),
        })
    }
}

/// Client for the OpenShift upgrade graph and the clients mirror.
pub struct OcpClient {
    client: reqwest::Client,
    graph_url: Url,
    graph_data_url: Url,
    mirror_base: Url,
    tracks: TtlCache<Arc<Tracks>>,
    releases: TtlCache<Arc<ReleaseSet>>,
}

impl OcpClient {
    pub fn builder() -> OcpClientBuilder {
        OcpClientBuilder::default()
    }

    pub fn mirror_base(&self) -> &Url {
        &self.mirror_base
    }

    /// Channel tracks from the graph-data tarball. Cached 12 hours.
    pub async fn fetch_tracks(&self) -> Result<Arc<Tracks>, OcpError> {
        self.tracks
            .get_or_fetch("ocp:tracks", async {
                let body = self.fetch(self.graph_data_url.clone()).await?;
                let channels = parse_channels_tarball(&body)?;
                Ok(Arc::new(group_tracks(channels)))
            })
            .await
            .map_err(OcpError::Shared)
    }

    /// Versions in one channel per the upgrade graph, ascending. Cached
    /// one hour per channel.
    pub async fn fetch_releases(&self, channel: &str) -> Result<Arc<ReleaseSet>, OcpError> {
        let key = format!("ocp:releases:{channel}");
        self.releases
            .get_or_fetch(&key, async {
                let mut url = self.graph_url.clone();
                url.query_pairs_mut().append_pair("channel", channel);
                let body = self.fetch(url).await?;
                let versions = parse_upgrade_graph(&body, channel)?;
                Ok(Arc::new(ReleaseSet { versions }))
            })
            .await
            .map_err(OcpError::Shared)
    }

    /// The classified artifact list for one release version, sorted by
    /// filename.
    pub async fn fetch_manifest(&self, version: &str) -> Result<Vec<OcpArtifact>, OcpError> {
        let url = self.manifest_url(version);
        let body = self.fetch(url).await?;
        let sums = parse_checksum_file(&String::from_utf8_lossy(&body));
        // BTreeMap iteration keeps the result filename-sorted
        Ok(sums
            .into_iter()
            .map(|(filename, sha256)| {
                let (os, arch, kind) = classify_artifact(&filename);
                OcpArtifact {
                    filename,
                    sha256,
                    os,
                    arch,
                    kind,
                }
            })
            .collect())
    }

    pub fn manifest_url(&self, version: &str) -> Url {
        let mut url = self.mirror_base.clone();
        let path = format!(
            "{}/{}/sha256sum.txt",
            url.path().trim_end_matches('/'),
            version
        );
        url.set_path(&path);
        url
    }

    pub fn artifact_url(&self, version: &str, filename: &str) -> Url {
        let mut url = self.mirror_base.clone();
        let path = format!(
            "{}/{}/{}",
            url.path().trim_end_matches('/'),
            version,
            filename
        );
        url.set_path(&path);
        url
    }

    async fn fetch(&self, url: Url) -> Result<Vec<u8>, OcpError> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(OcpError::Status(response.status(), url.to_string()));
        }
        Ok(read_all_with_limit(response, MANIFEST_BODY_LIMIT).await?.to_vec())
    }
}

fn group_tracks(channels: Vec<String>) -> Tracks {
    const ORDER: [&str; 4] = ["stable", "fast", "eus", "candidate"];

    let mut named: Vec<(String, Vec<String>)> = Vec::new();
    for channel in channels {
        let prefix = channel.rsplit_once('-').map(|(p, _)| p).unwrap_or(&channel);
        match named.iter_mut().find(|(name, _)| name == prefix) {
            Some((_, group)) => group.push(channel),
            None => named.push((prefix.to_string(), vec![channel])),
        }
    }
    for (_, group) in named.iter_mut() {
        group.sort_by(|a, b| channel_minor(b).cmp(&channel_minor(a)));
    }
    named.sort_by(|a, b| {
        let rank = |name: &str| {
            ORDER
                .iter()
                .position(|o| *o == name)
                .unwrap_or(ORDER.len())
        };
        rank(&a.0).cmp(&rank(&b.0)).then_with(|| a.0.cmp(&b.0))
    });
    Tracks {
        groups: named
            .into_iter()
            .map(|(name, channels)| TrackGroup { name, channels })
            .collect(),
    }
}

fn channel_minor(channel: &str) -> (u64, u64) {
    channel
        .rsplit_once('-')
        .and_then(|(_, v)| v.split_once('.'))
        .and_then(|(major, minor)| Some((major.parse().ok()?, minor.parse().ok()?)))
        .unwrap_or((0, 0))
}

/// Classify an artifact filename by OS, architecture, and tool type.
pub fn classify_artifact(filename: &str) -> (ArtifactOs, ArtifactArch, ArtifactKind) {
    let os = if filename.contains("-mac") || filename.contains("-darwin") {
        ArtifactOs::Mac
    } else if filename.contains("-windows") {
        ArtifactOs::Windows
    } else {
        ArtifactOs::Linux
    };
    let arch = if filename.contains("-arm64") {
        ArtifactArch::Arm64
    } else if filename.contains("-ppc64le") {
        ArtifactArch::Ppc64le
    } else if filename.contains("-s390x") {
        ArtifactArch::S390x
    } else {
        ArtifactArch::Amd64
    };
    let kind = if filename.starts_with("openshift-client") {
        ArtifactKind::Client
    } else if filename.starts_with("openshift-install") {
        ArtifactKind::Installer
    } else if filename.starts_with("ccoctl") {
        ArtifactKind::Ccoctl
    } else if filename.starts_with("oc-mirror") {
        ArtifactKind::OcMirror
    } else if filename.starts_with("opm") {
        ArtifactKind::Opm
    } else {
        ArtifactKind::Other
    };
    (os, arch, kind)
}

/// A platform token like `linux` or `linux-arm64`. Bare OS implies amd64.
pub fn parse_platform_token(token: &str) -> Option<(ArtifactOs, ArtifactArch)> {
    let (os, arch) = match token.split_once('-') {
        Some((os, arch)) => (os, Some(arch)),
        None => (token, None),
    };
    let os = match os {
        "linux" => ArtifactOs::Linux,
        "mac" | "darwin" => ArtifactOs::Mac,
        "windows" => ArtifactOs::Windows,
        _ => return None,
    };
    let arch = match arch {
        None | Some("amd64") => ArtifactArch::Amd64,
        Some("arm64") => ArtifactArch::Arm64,
        Some("ppc64le") => ArtifactArch::Ppc64le,
        Some("s390x") => ArtifactArch::S390x,
        Some(_) => return None,
    };
    Some((os, arch))
}

/// Keep artifacts matching any of the platform tokens. An empty token
/// list matches everything, as does an unparseable token list.
pub fn filter_artifacts_by_platform(
    artifacts: Vec<OcpArtifact>,
    platforms: &[String],
) -> Vec<OcpArtifact> {
    if platforms.is_empty() {
        return artifacts;
    }
    let wanted: Vec<(ArtifactOs, ArtifactArch)> = platforms
        .iter()
        .filter_map(|p| parse_platform_token(p))
        .collect();
    if wanted.is_empty() {
        return artifacts;
    }
    artifacts
        .into_iter()
        .filter(|a| wanted.iter().any(|(os, arch)| a.os == *os && a.arch == *arch))
        .collect()
}
