use quick_xml::Reader;
use quick_xml::events::Event;

use crate::DecodeError;

/// One mirror location from a Metalink v3 document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorInfo {
    pub url: String,
    pub country: String,
    pub protocol: String,
    pub preference: i32,
}

/// Extract every `<url>` entry, strip the trailing `/repodata/repomd.xml`
/// the metalink points at, and order mirrors best-first. Ties keep
/// document order.
pub fn parse_metalink(data: &[u8]) -> Result<Vec<MirrorInfo>, DecodeError> {
    let mut reader = Reader::from_reader(data);
    reader.config_mut().trim_text(true);

    let mut mirrors = Vec::new();
    let mut current: Option<MirrorInfo> = None;
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"url" => {
                let mut info = MirrorInfo::default();
                for attr in e.attributes() {
                    let attr = attr?;
                    let value = attr.unescape_value()?;
                    match attr.key.as_ref() {
                        b"protocol" => info.protocol = value.into_owned(),
                        b"location" => info.country = value.into_owned(),
                        b"preference" => {
                            info.preference = value.trim().parse().map_err(|_| {
                                DecodeError::BadValue("preference", value.into_owned())
                            })?;
                        }
                        _ => {}
                    }
                }
                current = Some(info);
            }
            Event::Text(t) => {
                if let Some(info) = current.as_mut() {
                    info.url.push_str(&t.unescape()?);
                }
            }
            Event::End(e) if e.name().as_ref() == b"url" => {
                if let Some(mut info) = current.take() {
                    if let Some(stripped) = info.url.strip_suffix("/repodata/repomd.xml") {
                        info.url = stripped.to_string();
                    }
                    if !info.url.is_empty() {
                        mirrors.push(info);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if mirrors.is_empty() {
        return Err(DecodeError::MissingElement("url"));
    }
    // sort_by is stable so equal preferences keep document order
    mirrors.sort_by(|a, b| b.preference.cmp(&a.preference));
    Ok(mirrors)
}
