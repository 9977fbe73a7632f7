pub mod cache;
pub mod checksums;
pub mod discovery;
pub mod graph;
pub mod htmldir;
pub mod metalink;
pub mod ocp;
pub mod repomd;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("xml attribute: {0}")]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),
    #[error("xml escape: {0}")]
    XmlEscape(#[from] quick_xml::escape::EscapeError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("archive: {0}")]
    Archive(#[from] std::io::Error),
    #[error("missing element {0:?}")]
    MissingElement(&'static str),
    #[error("bad value for {0}: {1:?}")]
    BadValue(&'static str, String),
}
