use std::collections::BTreeMap;

/// Parse a `sha256sum.txt` style manifest: `hex  [*]filename` per line.
///
/// A leading `*` (binary mode marker) on the filename is stripped. Lines
/// with fewer than two fields are silently dropped.
pub fn parse_checksum_file(text: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(hex), Some(name)) = (fields.next(), fields.next()) else {
            continue;
        };
        let name = name.strip_prefix('*').unwrap_or(name);
        if name.is_empty() {
            continue;
        }
        out.insert(name.to_string(), hex.to_ascii_lowercase());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_checksum_file() {
        let parsed = parse_checksum_file("abc  a.tgz\n*def  b.tgz\nxxx\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["a.tgz"], "abc");
        assert_eq!(parsed["b.tgz"], "def");
    }

    #[test]
    fn test_parse_checksum_file_hex_lowercased() {
        let parsed = parse_checksum_file("ABCDEF0123  openshift-client-linux.tar.gz");
        assert_eq!(parsed["openshift-client-linux.tar.gz"], "abcdef0123");
    }

    #[test]
    fn test_parse_checksum_file_empty_and_blank_lines() {
        assert!(parse_checksum_file("").is_empty());
        assert!(parse_checksum_file("\n\n   \n").is_empty());
    }
}
