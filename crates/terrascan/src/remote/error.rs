use thiserror::Error;

use crate::secrets::SecretError;

/// Errors from remote services.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("Failed to read '{path}': {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported asset location '{0}'")]
    UnsupportedLocation(String),

    #[error("Invalid search query: {0}")]
    InvalidQuery(String),

    #[error("Credential error: {0}")]
    Secret(#[from] SecretError),
}

impl RemoteError {
    pub(crate) fn http(url: &str, source: reqwest::Error) -> Self {
        RemoteError::Http {
            url: crate::sanitize::redact_url(url),
            source,
        }
    }

    pub(crate) fn invalid(url: &str, reason: impl Into<String>) -> Self {
        RemoteError::InvalidResponse {
            url: crate::sanitize::redact_url(url),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same request may succeed: network failures,
    /// timeouts, throttling and server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Http { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            RemoteError::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            RemoteError::File { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
