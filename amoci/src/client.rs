use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use amlib::http::{REGISTRY_TIMEOUT, validate_http_url};
use amlib::io::{MANIFEST_BODY_LIMIT, TOKEN_BODY_LIMIT, error_body, read_all_with_limit};
use bytes::Bytes;
use log::{trace, warn};
use moka::{Expiry, future::Cache};
use reqwest::{Response, StatusCode, header, header::HeaderValue};
use serde::Deserialize;
use sha2::{Digest as _, Sha256};

use crate::reference::{ImageReference, ReferenceError, validate_digest};

pub const OCI_IMAGE_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_IMAGE_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_V2: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

pub const ACCEPT_MANIFEST: &str = "application/vnd.oci.image.index.v1+json, application/vnd.docker.distribution.manifest.list.v2+json, application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
// https://distribution.github.io/distribution/spec/auth/token/#token-response-fields
// gives the default as 60 seconds
const DEFAULT_TOKEN_TTL: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Read(#[from] amlib::io::ReadError),
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error("token response: {0}")]
    TokenJson(#[from] serde_json::Error),
    #[error("status {status} from {url}: {body}")]
    Status {
        status: StatusCode,
        url: String,
        body: String,
    },
    #[error("still unauthorized after token refresh at {0}")]
    AuthFailed(String),
    #[error("unsupported auth challenge {0:?}")]
    UnsupportedChallenge(String),
    #[error("token response carried no token")]
    NoToken,
    #[error("manifest digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("manifest has unrecognized shape: {0}")]
    BadManifest(String),
    #[error("rate limited by {0}")]
    Ratelimited(String),
    #[error("walk canceled")]
    Canceled,
    #[error("request not cloneable")]
    RequestNotCloneable,
}

impl RegistryError {
    /// Transient upstream conditions the executor may retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Http(_) | RegistryError::Ratelimited(_) => true,
            RegistryError::Status { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

// token cache key; the scope string is what the issued token covers
#[derive(PartialEq, Eq, Hash, Debug, Clone)]
struct TokenKey {
    endpoint: String,
    scope: String,
}

#[derive(Clone)]
struct Token {
    secret: String,
    expires_in: Duration,
}

#[derive(Default)]
struct ExpireToken;

impl Expiry<TokenKey, Token> for ExpireToken {
    fn expire_after_create(
        &self,
        _key: &TokenKey,
        value: &Token,
        _current_time: Instant,
    ) -> Option<Duration> {
        trace!("{_key:?} expires in {:?}", value.expires_in);
        Some(value.expires_in)
    }
}

#[derive(Default)]
pub struct RegistryClientBuilder {
    auth: BTreeMap<String, RegistryAuth>,
}

impl RegistryClientBuilder {
    /// Basic-auth credentials for one endpoint host, used when requesting
    /// bearer tokens from its token service.
    pub fn auth(mut self, endpoint_host: impl Into<String>, auth: RegistryAuth) -> Self {
        self.auth.insert(endpoint_host.into(), auth);
        self
    }

    pub fn build(self) -> Result<RegistryClient, RegistryError> {
        Ok(RegistryClient {
            client: amlib::http::http_client(REGISTRY_TIMEOUT)?,
            tokens: Cache::builder()
                .max_capacity(10_000)
                .expire_after(ExpireToken)
                .build(),
            auth: Arc::new(self.auth),
        })
    }
}

/// Docker/OCI Registry V2 read client with the bearer-token dance baked
/// into every request.
#[derive(Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    tokens: Cache<TokenKey, Token>,
    auth: Arc<BTreeMap<String, RegistryAuth>>,
}

/// A fetched manifest plus the identity the registry gave it.
#[derive(Debug)]
pub struct ManifestResponse {
    pub content_type: String,
    pub digest: String,
    pub bytes: Bytes,
}

impl RegistryClient {
    pub fn builder() -> RegistryClientBuilder {
        RegistryClientBuilder::default()
    }

    pub async fn get_manifest(
        &self,
        reference: &ImageReference,
    ) -> Result<ManifestResponse, RegistryError> {
        self.get_manifest_ref(
            &reference.endpoint_host,
            &reference.repository,
            &reference.reference,
            reference.is_digest,
        )
        .await
    }

    /// GET `/v2/<repo>/manifests/<ref>`. The returned digest comes from
    /// the `Docker-Content-Digest` header when present and well-formed,
    /// else it is the SHA-256 of the body. Requests by digest are
    /// verified against the body before returning.
    pub async fn get_manifest_ref(
        &self,
        endpoint_host: &str,
        repository: &str,
        reference: &str,
        is_digest: bool,
    ) -> Result<ManifestResponse, RegistryError> {
        let url = manifest_url(endpoint_host, repository, reference);
        trace!("GET {url}");
        let request = self.client.get(&url).header(header::ACCEPT, ACCEPT_MANIFEST);
        let response = self
            .auth_and_retry(endpoint_host, &pull_scope(repository), request)
            .await?;

        if response.status() != StatusCode::OK {
            return Err(status_error(&url, response).await);
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let header_digest = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .filter(|s| validate_digest(s).is_ok())
            .map(str::to_string);
        let bytes = read_all_with_limit(response, MANIFEST_BODY_LIMIT).await?;

        let digest = if is_digest {
            verify_digest(reference, &bytes)?;
            reference.to_string()
        } else {
            match header_digest {
                Some(digest) => digest,
                None => sha256_digest(&bytes),
            }
        };

        Ok(ManifestResponse {
            content_type,
            digest,
            bytes,
        })
    }

    /// GET `/v2/<repo>/tags/list`.
    pub async fn list_tags(
        &self,
        endpoint_host: &str,
        repository: &str,
    ) -> Result<Vec<String>, RegistryError> {
        #[derive(Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Option<Vec<String>>,
        }

        let url = format!(
            "{}/v2/{}/tags/list",
            registry_base(endpoint_host),
            repository
        );
        trace!("GET {url}");
        let request = self.client.get(&url);
        let response = self
            .auth_and_retry(endpoint_host, &pull_scope(repository), request)
            .await?;
        if response.status() != StatusCode::OK {
            return Err(status_error(&url, response).await);
        }
        let bytes = read_all_with_limit(response, MANIFEST_BODY_LIMIT).await?;
        let list: TagList = serde_json::from_slice(&bytes)?;
        Ok(list.tags.unwrap_or_default())
    }

    /// The bearer token currently cached for this endpoint+repository, if
    /// any. Walk output embeds it into action headers.
    pub async fn cached_token(&self, endpoint_host: &str, repository: &str) -> Option<String> {
        let key = TokenKey {
            endpoint: endpoint_host.to_string(),
            scope: pull_scope(repository),
        };
        self.tokens.get(&key).await.map(|t| t.secret)
    }

    // send the request, and on a 401 work the WWW-Authenticate challenge:
    // fetch a token from the advertised realm (challenge scope wins over
    // ours), cache it under (endpoint, scope), retry once. A second 401
    // is fatal for this request chain.
    async fn auth_and_retry(
        &self,
        endpoint_host: &str,
        scope: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Response, RegistryError> {
        let retry = request
            .try_clone()
            .ok_or(RegistryError::RequestNotCloneable)?;

        let key = TokenKey {
            endpoint: endpoint_host.to_string(),
            scope: scope.to_string(),
        };
        let mut request = request;
        if let Some(token) = self.tokens.get(&key).await {
            request = request.bearer_auth(&token.secret);
        }
        let response = request.send().await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            warn!("rate limited by {endpoint_host}");
            return Err(RegistryError::Ratelimited(endpoint_host.to_string()));
        }
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(parse_bearer_challenge_header)
            .ok_or_else(|| {
                RegistryError::UnsupportedChallenge(
                    response
                        .headers()
                        .get(header::WWW_AUTHENTICATE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("<missing www-authenticate>")
                        .to_string(),
                )
            })?;

        let secret = self.fetch_token(&key, &challenge).await?;
        let response = retry.bearer_auth(&secret).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(RegistryError::AuthFailed(endpoint_host.to_string()));
        }
        Ok(response)
    }

    async fn fetch_token(
        &self,
        key: &TokenKey,
        challenge: &BearerChallenge,
    ) -> Result<String, RegistryError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
            expires_in: Option<u64>,
        }

        validate_http_url(&challenge.realm)
            .map_err(|_| RegistryError::UnsupportedChallenge(challenge.realm.clone()))?;

        let scope = challenge.scope.as_deref().unwrap_or(&key.scope);
        let mut request = self.client.get(&challenge.realm);
        if let Some(service) = &challenge.service {
            request = request.query(&[("service", service.as_str())]);
        }
        request = request.query(&[("scope", scope)]);
        if let Some(auth) = self.auth.get(&key.endpoint) {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(status_error(&challenge.realm, response).await);
        }
        let bytes = read_all_with_limit(response, TOKEN_BODY_LIMIT).await?;
        let parsed: TokenResponse = serde_json::from_slice(&bytes)?;
        let secret = parsed
            .token
            .or(parsed.access_token)
            .filter(|t| !t.is_empty())
            .ok_or(RegistryError::NoToken)?;

        let expires_in = Duration::from_secs(parsed.expires_in.unwrap_or(DEFAULT_TOKEN_TTL).max(1));
        self.tokens
            .insert(
                key.clone(),
                Token {
                    secret: secret.clone(),
                    expires_in,
                },
            )
            .await;
        Ok(secret)
    }
}

pub fn pull_scope(repository: &str) -> String {
    format!("repository:{repository}:pull")
}

/// Plain http for loopback endpoints so a local registry works; https
/// everywhere else.
pub fn registry_base(endpoint_host: &str) -> String {
    let host_only = endpoint_host
        .rsplit_once(':')
        .map(|(h, _)| h)
        .unwrap_or(endpoint_host);
    if host_only == "localhost" || host_only == "127.0.0.1" || host_only == "[::1]" {
        format!("http://{endpoint_host}")
    } else {
        format!("https://{endpoint_host}")
    }
}

pub fn manifest_url(endpoint_host: &str, repository: &str, reference: &str) -> String {
    format!(
        "{}/v2/{}/manifests/{}",
        registry_base(endpoint_host),
        repository,
        reference
    )
}

pub fn blob_url(endpoint_host: &str, repository: &str, digest: &str) -> String {
    format!(
        "{}/v2/{}/blobs/{}",
        registry_base(endpoint_host),
        repository,
        digest
    )
}

/// Keep the tags matching any pattern; exact string match also wins. An
/// empty pattern set keeps everything.
pub fn filter_tags(tags: Vec<String>, patterns: &[String]) -> Vec<String> {
    if patterns.is_empty() {
        return tags;
    }
    let compiled: Vec<Option<glob::Pattern>> = patterns
        .iter()
        .map(|p| glob::Pattern::new(p).ok())
        .collect();
    tags.into_iter()
        .filter(|tag| {
            patterns.iter().zip(&compiled).any(|(raw, pattern)| {
                raw == tag || pattern.as_ref().is_some_and(|p| p.matches(tag))
            })
        })
        .collect()
}

pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn verify_digest(expected: &str, data: &[u8]) -> Result<(), RegistryError> {
    let Ok((algo, _)) = validate_digest(expected) else {
        return Err(RegistryError::DigestMismatch {
            expected: expected.to_string(),
            actual: "<unparseable expectation>".to_string(),
        });
    };
    if algo != "sha256" {
        // other algorithms pass through unverified
        warn!("cannot verify digest algorithm {algo}, skipping check");
        return Ok(());
    }
    let actual = sha256_digest(data);
    if actual == expected {
        Ok(())
    } else {
        Err(RegistryError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

async fn status_error(url: &str, response: Response) -> RegistryError {
    let status = response.status();
    RegistryError::Status {
        status,
        url: url.to_string(),
        body: error_body(response).await,
    }
}

struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

fn parse_bearer_challenge_header(value: &HeaderValue) -> Option<BearerChallenge> {
    parse_bearer_challenge(value.to_str().ok()?)
}

// Bearer realm="https://auth.example.com/token",service="registry",scope="repository:app:pull"
fn parse_bearer_challenge(input: &str) -> Option<BearerChallenge> {
    use nom::{
        IResult, Parser,
        bytes::{complete::tag, take_until1},
        character::complete::{alpha1, char},
        multi::{many0, many1, separated_list0},
        sequence::{delimited, preceded, separated_pair, terminated},
    };
    fn parser(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
        preceded(
            terminated(tag("Bearer"), many1(tag(" "))),
            separated_list0(
                terminated(tag(","), many0(tag(" "))),
                separated_pair(
                    alpha1,
                    tag("="),
                    delimited(char('"'), take_until1("\""), char('"')),
                ),
            ),
        )
        .parse(input)
    }
    let (_, pairs) = parser(input).ok()?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for (k, v) in pairs {
        match k {
            "realm" => realm = Some(v.to_string()),
            "service" => service = Some(v.to_string()),
            "scope" => scope = Some(v.to_string()),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_bearer_challenge() {
        let cases = [
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:samalba/my-app:pull""#,
            r#"Bearer realm="https://auth.docker.io/token", service="registry.docker.io", scope="repository:samalba/my-app:pull""#,
            r#"Bearer   scope="repository:samalba/my-app:pull",service="registry.docker.io", realm="https://auth.docker.io/token""#,
        ];
        for case in cases {
            let challenge = parse_bearer_challenge(case).unwrap();
            assert_eq!(challenge.realm, "https://auth.docker.io/token", "{case}");
            assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
            assert_eq!(
                challenge.scope.as_deref(),
                Some("repository:samalba/my-app:pull")
            );
        }
        assert!(parse_bearer_challenge("Basic realm=\"x\"").is_none());
        assert!(parse_bearer_challenge("Bearer service=\"x\"").is_none());
    }

    #[test]
    fn test_filter_tags() {
        let tags = vec![
            "latest".to_string(),
            "v1.0".to_string(),
            "v1.1".to_string(),
            "dev".to_string(),
        ];
        assert_eq!(filter_tags(tags.clone(), &[]).len(), 4);
        assert_eq!(
            filter_tags(tags.clone(), &["v*".to_string()]),
            ["v1.0", "v1.1"]
        );
        assert_eq!(filter_tags(tags.clone(), &["latest".to_string()]), ["latest"]);
        assert!(filter_tags(tags, &["nope".to_string()]).is_empty());
    }

    #[test]
    fn test_registry_base_scheme() {
        assert_eq!(registry_base("quay.io"), "https://quay.io");
        assert_eq!(
            registry_base("localhost:5000"),
            "http://localhost:5000"
        );
        assert_eq!(
            registry_base("127.0.0.1:33445"),
            "http://127.0.0.1:33445"
        );
    }

    async fn hub_like_server(token: &str) -> MockServer {
        let server = MockServer::start().await;
        let realm = format!("{}/token", server.uri());

        let challenge = format!(
            r#"Bearer realm="{realm}",service="test-registry",scope="repository:acme/app:pull""#
        );
        // unauthenticated manifest request gets the challenge
        Mock::given(method("GET"))
            .and(path("/v2/acme/app/manifests/latest"))
            .respond_with(
                ResponseTemplate::new(401).insert_header("www-authenticate", challenge.as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("scope", "repository:acme/app:pull"))
            .and(basic_auth("bob", "hunter2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"token": token, "expires_in": 300})),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_token_challenge_and_retry() {
        let server = hub_like_server("sesame").await;
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": OCI_IMAGE_MANIFEST_V1,
            "config": {"mediaType": "application/vnd.oci.image.config.v1+json",
                       "digest": sha256_digest(b"cfg"), "size": 3},
            "layers": [],
        });
        let body = serde_json::to_vec(&manifest).unwrap();
        Mock::given(method("GET"))
            .and(path("/v2/acme/app/manifests/latest"))
            .and(header("authorization", "Bearer sesame"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", OCI_IMAGE_MANIFEST_V1)
                    .set_body_bytes(body.clone()),
            )
            .with_priority(1)
            .mount(&server)
            .await;

        let endpoint = server.address().to_string();
        let client = RegistryClient::builder()
            .auth(
                endpoint.clone(),
                RegistryAuth {
                    username: "bob".to_string(),
                    password: "hunter2".to_string(),
                },
            )
            .build()
            .unwrap();

        let response = client
            .get_manifest_ref(&endpoint, "acme/app", "latest", false)
            .await
            .unwrap();
        assert_eq!(response.content_type, OCI_IMAGE_MANIFEST_V1);
        assert_eq!(response.digest, sha256_digest(&body));

        // token is cached for the scope afterwards
        let cached = client.cached_token(&endpoint, "acme/app").await;
        assert_eq!(cached.as_deref(), Some("sesame"));
    }

    #[tokio::test]
    async fn test_second_unauthorized_is_fatal() {
        let server = MockServer::start().await;
        let challenge = format!(
            r#"Bearer realm="{}/token",service="svc""#,
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/v2/acme/app/manifests/latest"))
            .respond_with(
                ResponseTemplate::new(401).insert_header("www-authenticate", challenge.as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "t"})))
            .mount(&server)
            .await;

        let endpoint = server.address().to_string();
        let client = RegistryClient::builder().build().unwrap();
        let err = client
            .get_manifest_ref(&endpoint, "acme/app", "latest", false)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AuthFailed(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_access_token_fallback_and_list_tags() {
        let server = MockServer::start().await;
        let challenge = format!(r#"Bearer realm="{}/token""#, server.uri());
        Mock::given(method("GET"))
            .and(path("/v2/acme/app/tags/list"))
            .respond_with(
                ResponseTemplate::new(401).insert_header("www-authenticate", challenge.as_str()),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"access_token": "fallback"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/acme/app/tags/list"))
            .and(header("authorization", "Bearer fallback"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"name": "acme/app", "tags": ["latest", "v1"]})),
            )
            .with_priority(1)
            .mount(&server)
            .await;

        let endpoint = server.address().to_string();
        let client = RegistryClient::builder().build().unwrap();
        let tags = client.list_tags(&endpoint, "acme/app").await.unwrap();
        assert_eq!(tags, ["latest", "v1"]);
    }

    #[tokio::test]
    async fn test_manifest_digest_verification() {
        let server = MockServer::start().await;
        let body = b"not the advertised content".to_vec();
        let wanted = sha256_digest(b"something else entirely");
        Mock::given(method("GET"))
            .and(path(format!("/v2/acme/app/manifests/{wanted}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let endpoint = server.address().to_string();
        let client = RegistryClient::builder().build().unwrap();
        let err = client
            .get_manifest_ref(&endpoint, "acme/app", &wanted, true)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }), "{err:?}");
    }
}
