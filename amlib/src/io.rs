use bytes::{Bytes, BytesMut};

pub const MANIFEST_BODY_LIMIT: usize = 16 * 1024 * 1024;
pub const TOKEN_BODY_LIMIT: usize = 1024 * 1024;
pub const ERROR_BODY_LIMIT: usize = 4 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("body too large: exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Drain a response body, failing as soon as it exceeds `limit` bytes.
/// Responses are never trusted to advertise their own size.
pub async fn read_all_with_limit(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<Bytes, ReadError> {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    while let Some(chunk) = response.chunk().await? {
        if buf.len() + chunk.len() > limit {
            return Err(ReadError::BodyTooLarge(limit));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Best-effort capture of an error response body, truncated to 4 KiB, for
/// inclusion in error messages.
pub async fn error_body(response: reqwest::Response) -> String {
    match read_all_with_limit(response, ERROR_BODY_LIMIT).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(ReadError::BodyTooLarge(_)) => "<body over 4KiB>".to_string(),
        Err(e) => format!("<unreadable body: {e}>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_read_all_with_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/body"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 1000]))
            .mount(&server)
            .await;

        let get = || reqwest::get(format!("{}/body", server.uri()));

        let bytes = read_all_with_limit(get().await.unwrap(), 1000).await.unwrap();
        assert_eq!(bytes.len(), 1000);

        match read_all_with_limit(get().await.unwrap(), 999).await {
            Err(ReadError::BodyTooLarge(999)) => {}
            other => panic!("expected BodyTooLarge, got {other:?}"),
        }
    }
}
