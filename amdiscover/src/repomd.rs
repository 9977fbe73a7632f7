use quick_xml::Reader;
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesStart, Event};

use crate::DecodeError;

/// Pointer to the `primary` metadata file inside `repomd.xml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepomdPrimary {
    pub href: String,
    pub checksum: String,
    pub checksum_type: String,
}

/// One rpm entry from `primary.xml`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageInfo {
    pub name: String,
    pub arch: String,
    pub version: String,
    pub release: String,
    pub checksum: String,
    pub size: u64,
    pub location: String,
}

/// Locate the `<data type="primary">` entry of a `repomd.xml`.
pub fn parse_repomd(data: &[u8]) -> Result<RepomdPrimary, DecodeError> {
    let mut reader = Reader::from_reader(data);
    reader.config_mut().trim_text(true);

    let mut in_primary = false;
    let mut in_checksum = false;
    let mut primary = RepomdPrimary {
        href: String::new(),
        checksum: String::new(),
        checksum_type: String::new(),
    };
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"data" => {
                in_primary = attr_value(&e, b"type")?.as_deref() == Some("primary");
            }
            Event::End(e) if e.name().as_ref() == b"data" => {
                if in_primary && !primary.href.is_empty() {
                    return Ok(primary);
                }
                in_primary = false;
            }
            Event::Start(e) if in_primary && e.name().as_ref() == b"checksum" => {
                primary.checksum_type = attr_value(&e, b"type")?.unwrap_or_default();
                in_checksum = true;
            }
            Event::End(e) if e.name().as_ref() == b"checksum" => {
                in_checksum = false;
            }
            Event::Text(t) if in_primary && in_checksum => {
                primary.checksum.push_str(&t.unescape()?);
            }
            Event::Empty(e) | Event::Start(e)
                if in_primary && e.name().as_ref() == b"location" =>
            {
                primary.href = attr_value(&e, b"href")?.unwrap_or_default();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Err(DecodeError::MissingElement("data type=\"primary\""))
}

// which text-bearing child of <package> we are inside
#[derive(PartialEq)]
enum Field {
    None,
    Name,
    Arch,
    Checksum,
}

/// Parse `primary.xml` (already gunzipped) into its package list.
///
/// Lenient: unknown entities decode to the empty string and packages
/// without a location are dropped rather than failing the document.
pub fn parse_primary(data: &[u8]) -> Result<Vec<PackageInfo>, DecodeError> {
    let mut reader = Reader::from_reader(data);
    reader.config_mut().trim_text(true);

    let mut packages = Vec::new();
    let mut current: Option<PackageInfo> = None;
    let mut field = Field::None;
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"package" => {
                current = Some(PackageInfo::default());
                field = Field::None;
            }
            Event::End(e) if e.name().as_ref() == b"package" => {
                if let Some(pkg) = current.take() {
                    if !pkg.location.is_empty() {
                        packages.push(pkg);
                    }
                }
            }
            Event::Start(e) => {
                if let Some(pkg) = current.as_mut() {
                    field = match e.name().as_ref() {
                        b"name" => Field::Name,
                        b"arch" => Field::Arch,
                        b"checksum" => Field::Checksum,
                        b"version" => {
                            apply_version(pkg, &e)?;
                            Field::None
                        }
                        b"size" => {
                            apply_size(pkg, &e)?;
                            Field::None
                        }
                        b"location" => {
                            apply_location(pkg, &e)?;
                            Field::None
                        }
                        _ => Field::None,
                    };
                }
            }
            Event::Empty(e) => {
                if let Some(pkg) = current.as_mut() {
                    match e.name().as_ref() {
                        b"version" => apply_version(pkg, &e)?,
                        b"size" => apply_size(pkg, &e)?,
                        b"location" => apply_location(pkg, &e)?,
                        _ => {}
                    }
                }
            }
            Event::Text(t) => {
                if let Some(pkg) = current.as_mut() {
                    let text = t
                        .unescape_with(|entity| {
                            Some(resolve_predefined_entity(entity).unwrap_or(""))
                        })
                        .map_err(quick_xml::Error::from)?;
                    match field {
                        Field::Name => pkg.name.push_str(&text),
                        Field::Arch => pkg.arch.push_str(&text),
                        Field::Checksum => pkg.checksum.push_str(&text),
                        Field::None => {}
                    }
                }
            }
            Event::End(_) => {
                field = Field::None;
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(packages)
}

fn apply_version(pkg: &mut PackageInfo, e: &BytesStart<'_>) -> Result<(), DecodeError> {
    pkg.version = attr_value(e, b"ver")?.unwrap_or_default();
    pkg.release = attr_value(e, b"rel")?.unwrap_or_default();
    Ok(())
}

fn apply_size(pkg: &mut PackageInfo, e: &BytesStart<'_>) -> Result<(), DecodeError> {
    if let Some(size) = attr_value(e, b"package")? {
        pkg.size = size
            .trim()
            .parse()
            .map_err(|_| DecodeError::BadValue("size", size))?;
    }
    Ok(())
}

fn apply_location(pkg: &mut PackageInfo, e: &BytesStart<'_>) -> Result<(), DecodeError> {
    pkg.location = attr_value(e, b"href")?.unwrap_or_default();
    Ok(())
}

fn attr_value(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, DecodeError> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == name {
            let value = attr
                .unescape_value_with(|entity| {
                    Some(resolve_predefined_entity(entity).unwrap_or(""))
                })
                .map_err(quick_xml::Error::from)?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPOMD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo">
  <data type="filelists">
    <checksum type="sha256">ffff</checksum>
    <location href="repodata/ffff-filelists.xml.gz"/>
  </data>
  <data type="primary">
    <checksum type="sha256">ab12cd34</checksum>
    <location href="repodata/ab12cd34-primary.xml.gz"/>
  </data>
</repomd>"#;

    #[test]
    fn test_parse_repomd() {
        let primary = parse_repomd(REPOMD.as_bytes()).unwrap();
        assert_eq!(primary.href, "repodata/ab12cd34-primary.xml.gz");
        assert_eq!(primary.checksum, "ab12cd34");
        assert_eq!(primary.checksum_type, "sha256");
    }

    #[test]
    fn test_parse_repomd_missing_primary() {
        let doc = r#"<repomd><data type="filelists"><location href="x"/></data></repomd>"#;
        assert!(parse_repomd(doc.as_bytes()).is_err());
    }

    const PRIMARY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" packages="2">
  <package type="rpm">
    <name>tmux</name>
    <arch>x86_64</arch>
    <version epoch="0" ver="3.2a" rel="5.el9"/>
    <checksum type="sha256" pkgid="YES">aa11bb22</checksum>
    <summary>terminal &unknownentity; multiplexer</summary>
    <size package="567890" installed="1" archive="2"/>
    <location href="Packages/t/tmux-3.2a-5.el9.x86_64.rpm"/>
  </package>
  <package type="rpm">
    <name>htop</name>
    <arch>aarch64</arch>
    <version epoch="0" ver="3.3.0" rel="1.el9"/>
    <checksum type="sha256" pkgid="YES">cc33dd44</checksum>
    <size package="123" installed="1" archive="2"/>
    <location href="Packages/h/htop-3.3.0-1.el9.aarch64.rpm"/>
  </package>
</metadata>"#;

    #[test]
    fn test_parse_primary() {
        let packages = parse_primary(PRIMARY.as_bytes()).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(
            packages[0],
            PackageInfo {
                name: "tmux".into(),
                arch: "x86_64".into(),
                version: "3.2a".into(),
                release: "5.el9".into(),
                checksum: "aa11bb22".into(),
                size: 567890,
                location: "Packages/t/tmux-3.2a-5.el9.x86_64.rpm".into(),
            }
        );
        assert_eq!(packages[1].name, "htop");
        assert_eq!(packages[1].arch, "aarch64");
    }

    #[test]
    fn test_parse_primary_drops_packages_without_location() {
        let doc = r#"<metadata><package type="rpm"><name>ghost</name></package></metadata>"#;
        let packages = parse_primary(doc.as_bytes()).unwrap();
        assert!(packages.is_empty());
    }
}
