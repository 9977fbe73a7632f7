use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::action::ValidationResult;
use crate::localfs::{is_partial, sha256_file};

static CONTENT_ADDRESSED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|/)(?:manifests|blobs)/([a-z0-9]+)/([0-9a-f]+)(?:\.json)?$").unwrap()
});

/// Where the expected digest for a local file comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// Content-addressed path; the digest is embedded in it.
    Embedded { algo: String, hex: String },
    /// The provider must consult its upstream manifest.
    Upstream,
    /// Leftover from an interrupted download; nothing to hash.
    Partial,
}

pub fn classify(rel: &str) -> Expectation {
    if is_partial(rel) {
        return Expectation::Partial;
    }
    match CONTENT_ADDRESSED.captures(rel) {
        Some(captures) => Expectation::Embedded {
            algo: captures[1].to_string(),
            hex: captures[2].to_string(),
        },
        None => Expectation::Upstream,
    }
}

/// Hash a local file and compare against the expected lowercase hex.
pub fn check_against(display: &str, abs: &Path, expected_hex: &str) -> ValidationResult {
    match sha256_file(abs) {
        Ok(actual) => ValidationResult {
            path: display.to_string(),
            valid: actual == expected_hex,
            expected: expected_hex.to_string(),
            actual,
            error: None,
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ValidationResult {
            path: display.to_string(),
            valid: false,
            expected: expected_hex.to_string(),
            actual: "missing".to_string(),
            error: None,
        },
        Err(e) => ValidationResult {
            path: display.to_string(),
            valid: false,
            expected: expected_hex.to_string(),
            actual: String::new(),
            error: Some(e.to_string()),
        },
    }
}

pub fn invalid(display: &str, error: impl Into<String>) -> ValidationResult {
    ValidationResult {
        path: display.to_string(),
        valid: false,
        expected: String::new(),
        actual: String::new(),
        error: Some(error.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("quay.io_app_latest/blobs/sha256/0a1b2c"),
            Expectation::Embedded {
                algo: "sha256".to_string(),
                hex: "0a1b2c".to_string()
            }
        );
        assert_eq!(
            classify("x/manifests/sha256/ff00.json"),
            Expectation::Embedded {
                algo: "sha256".to_string(),
                hex: "ff00".to_string()
            }
        );
        assert_eq!(classify("4.17.3/openshift-client-linux.tar.gz"), Expectation::Upstream);
        assert_eq!(classify("a/.b.partial"), Expectation::Partial);
        // an uppercase digest is not content-addressed for us
        assert_eq!(classify("x/blobs/sha256/FF00"), Expectation::Upstream);
    }

    #[test]
    fn test_check_against() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abc").unwrap();
        let abc_sha = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

        let ok = check_against("out/f", &path, abc_sha);
        assert!(ok.valid);
        assert_eq!(ok.actual, abc_sha);

        let bad = check_against("out/f", &path, &"0".repeat(64));
        assert!(!bad.valid);

        let gone = check_against("out/g", &dir.path().join("g"), abc_sha);
        assert!(!gone.valid);
        assert_eq!(gone.actual, "missing");
    }
}
