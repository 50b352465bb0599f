//! Clients for the external services TerraScan talks to: a STAC catalog
//! for scene discovery, asset hosts for downloads and a model-serving
//! endpoint for cloud masking and feature extraction.
//!
//! Each service sits behind a trait so pipelines and tests can substitute
//! their own implementation.

use std::time::Duration;

use reqwest::Client;

pub mod error;
pub mod fetch;
pub mod inference;
pub mod stac;

pub use error::RemoteError;
pub use fetch::{AssetFetcher, HttpFetcher};
pub use inference::{HttpInferenceClient, InferenceClient, InferredFeature};
pub use stac::{HttpStacClient, SceneCandidate, SearchQuery, StacClient};

/// Default connect timeout for remote requests.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum length for error bodies kept in error messages.
const MAX_ERROR_BODY_LENGTH: usize = 200;

/// Creates an HTTP client with the given overall request timeout.
pub(crate) fn create_http_client(timeout: Duration) -> Result<Client, RemoteError> {
    Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .timeout(timeout)
        .user_agent(concat!("terrascan/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| RemoteError::Client(e.to_string()))
}

/// Truncates a response body so that large error pages do not flood logs.
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

/// Reads a non-success response into a `RemoteError::Status`.
pub(crate) async fn status_error(url: &str, response: reqwest::Response) -> RemoteError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    RemoteError::Status {
        url: crate::sanitize::redact_url(url),
        status,
        body: truncate_body(&body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("short"), "short");
        let long = "é".repeat(300);
        let truncated = truncate_body(&long);
        assert!(truncated.ends_with("... (truncated)"));
        assert!(truncated.len() < long.len());
    }
}
