use once_cell::sync::Lazy;
use regex::Regex;

static HREF: Lazy<Regex> = Lazy::new(|| Regex::new(r#"href="([^"]+)""#).unwrap());
static CHANNEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(stable|fast|candidate|latest)-\d+\.\d+$").unwrap());
static RELEASE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+(-[0-9A-Za-z.]+)?$").unwrap());
static MINOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+\.\d+$").unwrap());

/// Pull subdirectory names out of an HTML index page. Anything that is not
/// a directory link (no trailing `/`) or points upward (`../`) is dropped;
/// the trailing slash is stripped from what remains.
pub fn parse_dir_listing(html: &str) -> Vec<String> {
    HREF.captures_iter(html)
        .map(|c| c[1].to_string())
        .filter(|href| href != "../" && !href.starts_with("../"))
        .filter(|href| href.ends_with('/'))
        .map(|href| href.trim_end_matches('/').to_string())
        .collect()
}

/// The channel directories and release directories of the OCP mirror root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OcpListing {
    /// `stable-X.Y` / `fast-X.Y` / `candidate-X.Y`, sorted by name.
    pub channels: Vec<String>,
    /// `X.Y.Z`, sorted descending by version string.
    pub releases: Vec<String>,
}

impl OcpListing {
    /// Channels first, then releases, in their respective orders.
    pub fn entries(&self) -> Vec<String> {
        let mut out = self.channels.clone();
        out.extend(self.releases.iter().cloned());
        out
    }
}

/// Categorize OCP mirror directory names. `latest-*` aliases and rc/ec
/// pre-releases are skipped; names that are neither channel nor release
/// shaped are ignored.
pub fn categorize_ocp_entries<S: AsRef<str>>(entries: &[S]) -> OcpListing {
    let mut listing = OcpListing::default();
    for entry in entries {
        let entry = entry.as_ref();
        if CHANNEL.is_match(entry) {
            if !entry.starts_with("latest-") {
                listing.channels.push(entry.to_string());
            }
        } else if RELEASE.is_match(entry) && !entry.contains("-rc.") && !entry.contains("-ec.") {
            listing.releases.push(entry.to_string());
        }
    }
    listing.channels.sort();
    // descending by string, deliberately not numeric
    listing.releases.sort_by(|a, b| b.cmp(a));
    listing
}

/// RHCOS mirror root entries that name a minor stream (`4.17`).
pub fn rhcos_minors<S: AsRef<str>>(entries: &[S]) -> Vec<String> {
    let mut minors: Vec<String> = entries
        .iter()
        .map(|e| e.as_ref().to_string())
        .filter(|e| MINOR.is_match(e))
        .collect();
    minors.sort_by(|a, b| b.cmp(a));
    minors
}

/// Build directories under one RHCOS minor. The `latest` alias is skipped.
pub fn rhcos_builds<S: AsRef<str>>(entries: &[S]) -> Vec<String> {
    let mut builds: Vec<String> = entries
        .iter()
        .map(|e| e.as_ref().to_string())
        .filter(|e| e.starts_with(|c: char| c.is_ascii_digit()))
        .collect();
    builds.sort_by(|a, b| b.cmp(a));
    builds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dir_listing() {
        let html = r#"<html><body><pre>
<a href="../">../</a>
<a href="stable-4.17/">stable-4.17/</a>
<a href="4.17.48/">4.17.48/</a>
<a href="sha256sum.txt">sha256sum.txt</a>
</pre></body></html>"#;
        assert_eq!(parse_dir_listing(html), ["stable-4.17", "4.17.48"]);
    }

    #[test]
    fn test_categorize_ocp_entries() {
        let entries = [
            "stable-4.17",
            "fast-4.17",
            "candidate-4.18",
            "latest-4.17",
            "4.14.41",
            "4.17.48",
            "4.18.3",
            "4.18.0-rc.2",
            "4.12.0-ec.1",
        ];
        let listing = categorize_ocp_entries(&entries);
        assert_eq!(listing.channels, ["candidate-4.18", "fast-4.17", "stable-4.17"]);
        assert_eq!(listing.releases, ["4.18.3", "4.17.48", "4.14.41"]);
        assert!(listing.channels.len() == 3);
        assert!(listing.releases.len() >= 3);
        // channels come before releases in the combined view
        assert_eq!(listing.entries()[0], "candidate-4.18");
    }

    #[test]
    fn test_releases_sort_by_string_not_numerics() {
        let listing = categorize_ocp_entries(&["4.9.0", "4.10.0"]);
        // "4.9" > "4.10" as strings
        assert_eq!(listing.releases, ["4.9.0", "4.10.0"]);
    }

    #[test]
    fn test_rhcos_helpers() {
        assert_eq!(rhcos_minors(&["4.17", "4.16", "latest", "pre-release"]), ["4.17", "4.16"]);
        assert_eq!(
            rhcos_builds(&["4.17.0", "4.17.17", "latest"]),
            ["4.17.17", "4.17.0"]
        );
    }
}
