use std::time::Duration;

use url::Url;

pub const USER_AGENT: &str = "airgap/1.0";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const REGISTRY_TIMEOUT: Duration = Duration::from_secs(90);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum UrlError {
    #[error("invalid url {0:?}: {1}")]
    Parse(String, url::ParseError),
    #[error("invalid url {0:?}: scheme must be http or https")]
    Scheme(String),
    #[error("invalid url {0:?}: missing host")]
    NoHost(String),
    #[error("invalid url {0:?}: userinfo not allowed")]
    Userinfo(String),
}

/// Parse and vet a caller- or config-supplied URL before any request is
/// built from it.
pub fn validate_http_url(s: &str) -> Result<Url, UrlError> {
    let url = Url::parse(s).map_err(|e| UrlError::Parse(s.to_string(), e))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::Scheme(s.to_string()));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(UrlError::NoHost(s.to_string()));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(UrlError::Userinfo(s.to_string()));
    }
    Ok(url)
}

/// The one place an outbound client gets built. Every timeout is bounded so
/// a dead mirror cannot wedge a worker.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .use_rustls_tls()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT)
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
}
