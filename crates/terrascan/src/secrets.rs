//! Credentials for the STAC catalog, asset hosts and the inference service.
//!
//! A [`SecretRef`] in the config names at most one effective source. When
//! several are given the first non-empty one wins: inline `token`, then
//! `tokenFile` (Docker secrets), then `tokenEnvVar`.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Failed to read secret file '{path}': {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' is not set")]
    MissingEnv { name: String },

    #[error("Environment variable '{name}' is not valid UTF-8")]
    NotUnicode { name: String },

    #[error("Secret from {origin} is empty")]
    Empty { origin: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// One place a credential can be read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource<'a> {
    Inline(&'a str),
    File(&'a str),
    Env(&'a str),
}

impl SecretSource<'_> {
    fn describe(&self) -> String {
        match self {
            SecretSource::Inline(_) => "inline token".to_string(),
            SecretSource::File(path) => format!("file '{}'", path),
            SecretSource::Env(name) => format!("environment variable '{}'", name),
        }
    }
}

/// Where a credential comes from, as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env_var: Option<String>,
}

impl SecretRef {
    /// The source that will be used, if any is configured.
    pub fn source(&self) -> Option<SecretSource<'_>> {
        fn non_empty(v: &Option<String>) -> Option<&str> {
            v.as_deref().filter(|s| !s.is_empty())
        }
        non_empty(&self.token)
            .map(SecretSource::Inline)
            .or_else(|| non_empty(&self.token_file).map(SecretSource::File))
            .or_else(|| non_empty(&self.token_env_var).map(SecretSource::Env))
    }

    pub fn is_configured(&self) -> bool {
        self.source().is_some()
    }

    /// Resolves the credential, or `None` when no source is configured.
    pub fn resolve(&self) -> Result<Option<SecretString>> {
        self.source().map(resolve_secret).transpose()
    }
}

/// Reads a secret from `source`. Surrounding whitespace is trimmed and an
/// empty result is an error.
pub fn resolve_secret(source: SecretSource<'_>) -> Result<SecretString> {
    let value = match source {
        SecretSource::Inline(value) => value.to_string(),
        SecretSource::File(path) => {
            let expanded = expand_home(path);
            std::fs::read_to_string(&expanded).map_err(|e| SecretError::Unreadable {
                path: expanded,
                source: e,
            })?
        }
        SecretSource::Env(name) => std::env::var(name).map_err(|e| match e {
            std::env::VarError::NotPresent => SecretError::MissingEnv {
                name: name.to_string(),
            },
            std::env::VarError::NotUnicode(_) => SecretError::NotUnicode {
                name: name.to_string(),
            },
        })?,
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SecretError::Empty {
            origin: source.describe(),
        });
    }
    Ok(SecretString::from(trimmed.to_string()))
}

/// Expands a leading `~` or `~/` to the home directory. `~user` is left
/// untouched.
pub fn expand_home(path: &str) -> String {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return path.to_string(),
    };
    match dirs::home_dir() {
        Some(home) => format!("{}{}", home.to_string_lossy(), rest),
        None => path.to_string(),
    }
}
