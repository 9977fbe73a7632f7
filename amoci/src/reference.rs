const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_INDEX: &str = "index.docker.io";
const DOCKER_HUB_ENDPOINT: &str = "registry-1.docker.io";

#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("empty image reference")]
    Empty,
    #[error("bad image reference {0:?}: {1}")]
    Bad(String, &'static str),
    #[error("bad digest {0:?}: {1}")]
    BadDigest(String, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Docker,
    Oci,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Docker => "docker",
            Scheme::Oci => "oci",
        }
    }
}

/// A fully resolved image reference.
///
/// `registry` is the name as the user wrote (or implied) it;
/// `endpoint_host` is where the V2 API actually lives, which differs for
/// Docker Hub. `reference` holds either a tag or an `algo:hex` digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub scheme: Scheme,
    pub registry: String,
    pub endpoint_host: String,
    pub repository: String,
    pub reference: String,
    pub is_digest: bool,
}

impl ImageReference {
    /// Parse user input, with or without a `docker://` / `oci://` prefix.
    ///
    /// Without an explicit registry the reference is assumed to live on
    /// Docker Hub, and single-segment repositories get the `library/`
    /// prefix. A trailing `@algo:hex` wins over any tag; otherwise the
    /// tag defaults to `latest`.
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let (scheme, rest) = if let Some(rest) = input.strip_prefix("docker://") {
            (Scheme::Docker, rest)
        } else if let Some(rest) = input.strip_prefix("oci://") {
            (Scheme::Oci, rest)
        } else {
            (Scheme::Docker, input)
        };
        if rest.is_empty() {
            return Err(ReferenceError::Empty);
        }
        let bad = |why: &'static str| ReferenceError::Bad(input.to_string(), why);

        let (name_part, digest) = match rest.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (rest, None),
        };
        if let Some(digest) = digest {
            validate_digest(digest)?;
        }

        // the tag separator is a ':' after the last '/'
        let (name, tag) = {
            let last_slash = name_part.rfind('/').map(|i| i + 1).unwrap_or(0);
            match name_part[last_slash..].rfind(':') {
                Some(colon) => {
                    let cut = last_slash + colon;
                    (&name_part[..cut], Some(&name_part[cut + 1..]))
                }
                None => (name_part, None),
            }
        };
        if name.is_empty() {
            return Err(bad("missing repository"));
        }
        if let Some(tag) = tag {
            if tag.is_empty() {
                return Err(bad("empty tag"));
            }
            if !tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            {
                return Err(bad("invalid tag"));
            }
        }

        if name.contains("//") {
            return Err(bad("empty path segment"));
        }
        let segments: Vec<&str> = name.split('/').collect();
        for segment in &segments {
            match *segment {
                "" => return Err(bad("empty path segment")),
                "." | ".." => return Err(bad("dot path segment")),
                _ => {}
            }
        }

        let (registry, repo_segments) = if segments.len() > 1 && looks_like_registry(segments[0]) {
            (segments[0].to_string(), &segments[1..])
        } else {
            (DOCKER_HUB.to_string(), &segments[..])
        };
        if repo_segments.is_empty() {
            return Err(bad("missing repository"));
        }

        let is_hub = registry == DOCKER_HUB || registry == DOCKER_HUB_INDEX;
        let repository = if is_hub && repo_segments.len() == 1 {
            format!("library/{}", repo_segments[0])
        } else {
            repo_segments.join("/")
        };
        let endpoint_host = if is_hub {
            DOCKER_HUB_ENDPOINT.to_string()
        } else {
            registry.clone()
        };

        let (reference, is_digest) = match digest {
            Some(digest) => (digest.to_string(), true),
            None => (tag.unwrap_or("latest").to_string(), false),
        };

        Ok(ImageReference {
            scheme,
            registry,
            endpoint_host,
            repository,
            reference,
            is_digest,
        })
    }

    /// A reference addressed straight at a known endpoint, as the
    /// registry-mirror provider builds them from `(repo, tag)` pairs.
    pub fn with_tag(
        endpoint_host: &str,
        repository: &str,
        tag: &str,
    ) -> Result<Self, ReferenceError> {
        Self::parse(&format!("{endpoint_host}/{repository}:{tag}"))
    }

    /// Render back to `scheme://registry/repository{:tag|@digest}`.
    /// Parsing the canonical form yields the same reference.
    pub fn canonicalize(&self) -> String {
        let separator = if self.is_digest { '@' } else { ':' };
        format!(
            "{}://{}/{}{}{}",
            self.scheme.as_str(),
            self.registry,
            self.repository,
            separator,
            self.reference
        )
    }

    /// Directory-safe identity for the on-disk tree: every character
    /// outside `[A-Za-z0-9._-]` becomes `_`.
    pub fn slug(&self) -> String {
        let separator = if self.is_digest { '@' } else { ':' };
        let raw = format!(
            "{}/{}{}{}",
            self.registry, self.repository, separator, self.reference
        );
        sanitize_slug(&raw)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.canonicalize())
    }
}

pub fn sanitize_slug(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// a first path segment is a registry when it can't be a repository name
fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// `algo:hex` with a sane algorithm name and lowercase hex of the right
/// length for the algorithms we know.
pub fn validate_digest(digest: &str) -> Result<(&str, &str), ReferenceError> {
    let bad = |why: &'static str| ReferenceError::BadDigest(digest.to_string(), why);
    let (algo, hex) = digest.split_once(':').ok_or_else(|| bad("missing algorithm"))?;
    if algo.is_empty()
        || !algo
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(bad("invalid algorithm"));
    }
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err(bad("digest is not lowercase hex"));
    }
    let expected_len = match algo {
        "sha256" => Some(64),
        "sha512" => Some(128),
        _ => None,
    };
    if let Some(expected) = expected_len {
        if hex.len() != expected {
            return Err(bad("wrong digest length"));
        }
    }
    Ok((algo, hex))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn test_parse_bare_name() {
        let parsed = ImageReference::parse("nginx").unwrap();
        assert_eq!(parsed.scheme, Scheme::Docker);
        assert_eq!(parsed.registry, "docker.io");
        assert_eq!(parsed.endpoint_host, "registry-1.docker.io");
        assert_eq!(parsed.repository, "library/nginx");
        assert_eq!(parsed.reference, "latest");
        assert!(!parsed.is_digest);
    }

    #[test]
    fn test_parse_with_scheme_and_tag() {
        let parsed = ImageReference::parse("docker://quay.io/fedora/fedora:42").unwrap();
        assert_eq!(parsed.registry, "quay.io");
        assert_eq!(parsed.endpoint_host, "quay.io");
        assert_eq!(parsed.repository, "fedora/fedora");
        assert_eq!(parsed.reference, "42");

        let parsed = ImageReference::parse("oci://registry.local:5000/app:v1").unwrap();
        assert_eq!(parsed.scheme, Scheme::Oci);
        assert_eq!(parsed.registry, "registry.local:5000");
        assert_eq!(parsed.endpoint_host, "registry.local:5000");
    }

    #[test]
    fn test_parse_digest_reference() {
        let parsed = ImageReference::parse(&format!("quay.io/app/api@{DIGEST}")).unwrap();
        assert!(parsed.is_digest);
        assert_eq!(parsed.reference, DIGEST);

        // digest wins over tag
        let parsed = ImageReference::parse(&format!("quay.io/app/api:v1@{DIGEST}")).unwrap();
        assert!(parsed.is_digest);
        assert_eq!(parsed.reference, DIGEST);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("docker://").is_err());
        assert!(ImageReference::parse("quay.io//app").is_err());
        assert!(ImageReference::parse("quay.io/./app").is_err());
        assert!(ImageReference::parse("quay.io/../app").is_err());
        assert!(ImageReference::parse("nginx:").is_err());
        assert!(ImageReference::parse("nginx:bad tag").is_err());
        assert!(ImageReference::parse("quay.io/app@sha256:tooshort").is_err());
        assert!(ImageReference::parse("quay.io/app@notadigest").is_err());
    }

    #[test]
    fn test_single_segment_not_registry() {
        // "myrepo/app" has no dot/colon so it's a hub repository
        let parsed = ImageReference::parse("myrepo/app").unwrap();
        assert_eq!(parsed.registry, "docker.io");
        assert_eq!(parsed.repository, "myrepo/app");

        let parsed = ImageReference::parse("localhost:5000/app").unwrap();
        assert_eq!(parsed.registry, "localhost:5000");
        assert_eq!(parsed.repository, "app");
    }

    #[test]
    fn test_canonicalize_roundtrip() {
        for input in [
            "nginx",
            "nginx:1.25",
            "quay.io/fedora/fedora:42",
            "docker://ghcr.io/acme/tool:v2",
            &format!("quay.io/app/api@{DIGEST}"),
            "index.docker.io/library/alpine:3",
        ] {
            let first = ImageReference::parse(input).unwrap();
            let again = ImageReference::parse(&first.canonicalize()).unwrap();
            assert_eq!(first, again, "{input}");
        }
    }

    #[test]
    fn test_slug() {
        let parsed = ImageReference::parse("quay.io/fedora/fedora:42").unwrap();
        assert_eq!(parsed.slug(), "quay.io_fedora_fedora_42");
        let parsed = ImageReference::parse(&format!("quay.io/app@{DIGEST}")).unwrap();
        assert!(parsed.slug().chars().all(|c| c.is_ascii_alphanumeric()
            || matches!(c, '.' | '_' | '-')));
    }
}
