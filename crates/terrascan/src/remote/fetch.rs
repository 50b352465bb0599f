//! Asset downloads.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};

use super::{create_http_client, status_error, RemoteError};

/// Retrieves raw asset bytes from wherever a catalog says they live.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, href: &str) -> Result<Vec<u8>, RemoteError>;
}

/// Fetches `http(s)://` assets with an optional bearer token, and
/// `file://` or plain-path assets from the local filesystem.
pub struct HttpFetcher {
    client: Client,
    token: Option<SecretString>,
}

impl HttpFetcher {
    pub fn new(token: Option<SecretString>, timeout: Duration) -> Result<Self, RemoteError> {
        Ok(Self {
            client: create_http_client(timeout)?,
            token,
        })
    }

    async fn fetch_http(&self, href: &str) -> Result<Vec<u8>, RemoteError> {
        let mut request = self.client.get(href);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::http(href, e))?;
        if !response.status().is_success() {
            return Err(status_error(href, response).await);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RemoteError::http(href, e))?;
        Ok(bytes.to_vec())
    }
}

enum Location<'a> {
    Http(&'a str),
    File(&'a str),
}

fn classify(href: &str) -> Result<Location<'_>, RemoteError> {
    if href.starts_with("http://") || href.starts_with("https://") {
        Ok(Location::Http(href))
    } else if let Some(path) = href.strip_prefix("file://") {
        Ok(Location::File(path))
    } else if !href.contains("://") {
        Ok(Location::File(href))
    } else {
        Err(RemoteError::UnsupportedLocation(
            crate::sanitize::redact_url(href),
        ))
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, href: &str) -> Result<Vec<u8>, RemoteError> {
        match classify(href)? {
            Location::Http(url) => self.fetch_http(url).await,
            Location::File(path) => tokio::fs::read(path).await.map_err(|e| RemoteError::File {
                path: path.to_string(),
                source: e,
            }),
        }
    }
}
