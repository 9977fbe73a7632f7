use std::collections::BTreeSet;

use flate2::read::GzDecoder;
use semver::Version;
use serde::Deserialize;

use crate::DecodeError;

#[derive(Deserialize)]
struct GraphNode {
    version: String,
}

#[derive(Deserialize)]
struct UpgradeGraph {
    #[serde(default)]
    nodes: Vec<GraphNode>,
}

/// Extract the versions reachable in one channel's upgrade graph.
///
/// Node versions are deduplicated, restricted to the channel's `X.Y.`
/// prefix, and returned ascending in numeric (major, minor, patch) order.
pub fn parse_upgrade_graph(data: &[u8], channel: &str) -> Result<Vec<String>, DecodeError> {
    let graph: UpgradeGraph = serde_json::from_slice(data)?;
    let prefix = channel_minor_prefix(channel)
        .ok_or_else(|| DecodeError::BadValue("channel", channel.to_string()))?;

    let unique: BTreeSet<String> = graph
        .nodes
        .into_iter()
        .map(|n| n.version)
        .filter(|v| v.starts_with(&prefix))
        .collect();

    let mut versions: Vec<(Version, String)> = unique
        .into_iter()
        .filter_map(|v| Version::parse(&v).ok().map(|parsed| (parsed, v)))
        .collect();
    versions.sort_by(|a, b| {
        (a.0.major, a.0.minor, a.0.patch).cmp(&(b.0.major, b.0.minor, b.0.patch))
    });
    Ok(versions.into_iter().map(|(_, v)| v).collect())
}

/// `stable-4.17` -> `4.17.`
pub fn channel_minor_prefix(channel: &str) -> Option<String> {
    let (_, minor) = channel.rsplit_once('-')?;
    let mut parts = minor.split('.');
    let major: u64 = parts.next()?.parse().ok()?;
    let minor: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(format!("{major}.{minor}."))
}

/// Channel names from the `channels/` directory of a graph-data tarball.
///
/// Only regular files whose parent directory is exactly `channels` count;
/// the file extension is stripped to obtain the channel name.
pub fn parse_channels_tarball(data: &[u8]) -> Result<Vec<String>, DecodeError> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut channels = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?;
        let in_channels = path
            .parent()
            .and_then(|p| p.file_name())
            .is_some_and(|d| d == "channels");
        if !in_channels {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            channels.push(stem.to_string());
        }
        // drain so the archive reader can continue past large entries
        std::io::copy(&mut entry, &mut std::io::sink())?;
    }
    Ok(channels)
}
