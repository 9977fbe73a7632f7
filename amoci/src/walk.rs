use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Cursor;

use amlib::CancellationToken;
use log::trace;
use oci_spec::image::{ImageIndex, ImageManifest};

use crate::client::{
    ACCEPT_MANIFEST, DOCKER_MANIFEST_LIST_V2, DOCKER_MANIFEST_V2, OCI_IMAGE_INDEX_V1,
    OCI_IMAGE_MANIFEST_V1, RegistryClient, RegistryError, blob_url, manifest_url,
};
use crate::reference::{ImageReference, validate_digest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkItemKind {
    Manifest,
    Blob,
}

/// One file the walk wants mirrored, content-addressed relative to the
/// image directory, with the URL and headers needed to fetch it later.
#[derive(Debug, Clone)]
pub struct WalkItem {
    pub kind: WalkItemKind,
    pub path: String,
    pub digest: String,
    pub size: u64,
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

enum Shape {
    Index(Vec<String>),
    Image(Vec<(String, u64)>),
}

/// Breadth-first traversal of the descriptor graph rooted at `reference`.
///
/// The root manifest is emitted first; every index fans out into its
/// child manifests; every image manifest contributes its config and layer
/// blobs. A digest is fetched and emitted at most once.
pub async fn walk(
    client: &RegistryClient,
    reference: &ImageReference,
    cancel: &CancellationToken,
) -> Result<Vec<WalkItem>, RegistryError> {
    let endpoint = &reference.endpoint_host;
    let repository = &reference.repository;

    let mut queue: VecDeque<(String, bool)> = VecDeque::new();
    queue.push_back((reference.reference.clone(), reference.is_digest));

    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut items = Vec::new();

    while let Some((refstr, is_digest)) = queue.pop_front() {
        if cancel.is_cancelled() {
            return Err(RegistryError::Canceled);
        }
        if is_digest && seen.contains(&refstr) {
            continue;
        }
        let response = client
            .get_manifest_ref(endpoint, repository, &refstr, is_digest)
            .await?;
        if !seen.insert(response.digest.clone()) {
            continue;
        }
        trace!(
            "walk {}: manifest {} ({})",
            reference, response.digest, response.content_type
        );

        let auth_header = client
            .cached_token(endpoint, repository)
            .await
            .map(|token| format!("Bearer {token}"));

        let (algo, hex) = validate_digest(&response.digest)?;
        let mut headers = BTreeMap::new();
        headers.insert("Accept".to_string(), ACCEPT_MANIFEST.to_string());
        if let Some(auth) = &auth_header {
            headers.insert("Authorization".to_string(), auth.clone());
        }
        items.push(WalkItem {
            kind: WalkItemKind::Manifest,
            path: format!("manifests/{algo}/{hex}.json"),
            digest: response.digest.clone(),
            size: response.bytes.len() as u64,
            url: manifest_url(endpoint, repository, &response.digest),
            headers,
        });

        match parse_shape(&response.content_type, &response.bytes)? {
            Shape::Index(children) => {
                for digest in children {
                    queue.push_back((digest, true));
                }
            }
            Shape::Image(blobs) => {
                for (digest, size) in blobs {
                    if !seen.insert(digest.clone()) {
                        continue;
                    }
                    let (algo, hex) = validate_digest(&digest)?;
                    let mut headers = BTreeMap::new();
                    if let Some(auth) = &auth_header {
                        headers.insert("Authorization".to_string(), auth.clone());
                    }
                    items.push(WalkItem {
                        kind: WalkItemKind::Blob,
                        path: format!("blobs/{algo}/{hex}"),
                        digest: digest.clone(),
                        size,
                        url: blob_url(endpoint, repository, &digest),
                        headers,
                    });
                }
            }
        }
    }
    Ok(items)
}

fn parse_shape(content_type: &str, data: &[u8]) -> Result<Shape, RegistryError> {
    match content_type {
        OCI_IMAGE_INDEX_V1 | DOCKER_MANIFEST_LIST_V2 => parse_index(data),
        OCI_IMAGE_MANIFEST_V1 | DOCKER_MANIFEST_V2 => parse_image(data),
        other => {
            // registries get content types wrong often enough that we
            // try both shapes before giving up
            if let Ok(Shape::Index(children)) = parse_index(data) {
                if !children.is_empty() {
                    return Ok(Shape::Index(children));
                }
            }
            if let Ok(Shape::Image(blobs)) = parse_image(data) {
                if !blobs.is_empty() {
                    return Ok(Shape::Image(blobs));
                }
            }
            Err(RegistryError::BadManifest(format!(
                "media type {other:?} parses as neither index nor manifest"
            )))
        }
    }
}

fn parse_index(data: &[u8]) -> Result<Shape, RegistryError> {
    let index = ImageIndex::from_reader(Cursor::new(data))
        .map_err(|e| RegistryError::BadManifest(e.to_string()))?;
    Ok(Shape::Index(
        index
            .manifests()
            .iter()
            .map(|descriptor| descriptor.digest().to_string())
            .collect(),
    ))
}

fn parse_image(data: &[u8]) -> Result<Shape, RegistryError> {
    let manifest = ImageManifest::from_reader(Cursor::new(data))
        .map_err(|e| RegistryError::BadManifest(e.to_string()))?;
    let mut blobs = vec![(
        manifest.config().digest().to_string(),
        manifest.config().size(),
    )];
    blobs.extend(
        manifest
            .layers()
            .iter()
            .map(|descriptor| (descriptor.digest().to_string(), descriptor.size())),
    );
    Ok(Shape::Image(blobs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::sha256_digest;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn image_manifest(config: &str, layers: &[(&str, u64)]) -> serde_json::Value {
        json!({
            "schemaVersion": 2,
            "mediaType": OCI_IMAGE_MANIFEST_V1,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config,
                "size": 3,
            },
            "layers": layers.iter().map(|(digest, size)| json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": digest,
                "size": size,
            })).collect::<Vec<_>>(),
        })
    }

    #[tokio::test]
    async fn test_walk_index_with_auth() {
        let server = MockServer::start().await;
        let endpoint = server.address().to_string();

        let config_digest = sha256_digest(b"cfg");
        let layer_digest = sha256_digest(b"layer");
        let child = serde_json::to_vec(&image_manifest(&config_digest, &[(&layer_digest, 812)]))
            .unwrap();
        let child_digest = sha256_digest(&child);
        let index = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": OCI_IMAGE_INDEX_V1,
            "manifests": [{
                "mediaType": OCI_IMAGE_MANIFEST_V1,
                "digest": child_digest,
                "size": child.len(),
                "platform": {"architecture": "amd64", "os": "linux"},
            }],
        }))
        .unwrap();
        let index_digest = sha256_digest(&index);

        let challenge = format!(r#"Bearer realm="{}/token",service="svc""#, server.uri());
        Mock::given(method("GET"))
            .and(path("/v2/acme/app/manifests/latest"))
            .respond_with(
                ResponseTemplate::new(401).insert_header("www-authenticate", challenge.as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/acme/app/manifests/latest"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", OCI_IMAGE_INDEX_V1)
                    .insert_header("docker-content-digest", index_digest.as_str())
                    .set_body_bytes(index.clone()),
            )
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/acme/app/manifests/{child_digest}")))
            .and(header("authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", OCI_IMAGE_MANIFEST_V1)
                    .set_body_bytes(child.clone()),
            )
            .mount(&server)
            .await;

        let client = RegistryClient::builder().build().unwrap();
        let reference = ImageReference::with_tag(&endpoint, "acme/app", "latest").unwrap();
        let items = walk(&client, &reference, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(items.len(), 4);
        // root first, then child manifest, then its blobs
        assert_eq!(items[0].kind, WalkItemKind::Manifest);
        assert_eq!(items[0].digest, index_digest);
        assert_eq!(items[1].digest, child_digest);
        assert_eq!(items[2].digest, config_digest);
        assert_eq!(items[3].digest, layer_digest);
        assert_eq!(items[3].size, 812);

        let (algo, hex) = validate_digest(&child_digest).unwrap();
        assert_eq!(items[1].path, format!("manifests/{algo}/{hex}.json"));
        let (algo, hex) = validate_digest(&layer_digest).unwrap();
        assert_eq!(items[3].path, format!("blobs/{algo}/{hex}"));

        // blob fetches reuse the bearer token obtained after the single
        // 401 challenge
        for item in &items[2..] {
            assert_eq!(
                item.headers.get("Authorization").map(String::as_str),
                Some("Bearer tok")
            );
        }
        assert!(items[3].url.ends_with(&format!("/v2/acme/app/blobs/{layer_digest}")));
    }

    #[tokio::test]
    async fn test_walk_dedupes_shared_blobs() {
        let server = MockServer::start().await;
        let endpoint = server.address().to_string();

        let config_digest = sha256_digest(b"cfg");
        let shared_layer = sha256_digest(b"layer");
        let manifest = serde_json::to_vec(&image_manifest(
            &config_digest,
            &[(&shared_layer, 10), (&shared_layer, 10)],
        ))
        .unwrap();

        Mock::given(method("GET"))
            .and(path("/v2/acme/app/manifests/latest"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", OCI_IMAGE_MANIFEST_V1)
                    .set_body_bytes(manifest),
            )
            .mount(&server)
            .await;

        let client = RegistryClient::builder().build().unwrap();
        let reference = ImageReference::with_tag(&endpoint, "acme/app", "latest").unwrap();
        let items = walk(&client, &reference, &CancellationToken::new())
            .await
            .unwrap();
        // manifest + config + one copy of the repeated layer
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_parse_shape_best_effort() {
        let config = sha256_digest(b"cfg");
        let manifest = serde_json::to_vec(&image_manifest(&config, &[])).unwrap();
        match parse_shape("application/octet-stream", &manifest).unwrap() {
            Shape::Image(blobs) => assert_eq!(blobs.len(), 1),
            Shape::Index(_) => panic!("expected image shape"),
        }
        assert!(parse_shape("application/octet-stream", b"{}").is_err());
    }
}
