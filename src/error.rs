//! Error types for the token, repository-set and polling core.
//!
//! Failures are split the way the monitor reacts to them: key material and
//! configuration problems need an operator, transport failures are worth
//! waiting out until the next scheduled cycle.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// The app private key could not be read or parsed.
    #[error("failed to load app private key from {}: {message}", path.display())]
    KeyLoad { path: PathBuf, message: String },

    /// Building or signing the app assertion failed.
    #[error("failed to sign app assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    /// The token-issuance endpoint answered with something other than 201.
    #[error("failed to create installation access token (HTTP {status})")]
    TokenExchange { status: u16 },

    /// Network-level failure talking to the API.
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The API answered with a non-success status.
    #[error("{endpoint} returned HTTP {status}")]
    UnexpectedStatus { endpoint: String, status: u16 },

    /// The response body was not the payload we expected.
    #[error("failed to decode response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    /// A pagination link pointed outside the configured API root.
    #[error("{endpoint} linked to a page outside the API root: {url}")]
    ForeignLink { endpoint: String, url: String },

    /// A repository reference could not be normalized to `owner/repo`.
    #[error("invalid repository identifier '{raw}' ({origin})")]
    InvalidIdentifier { raw: String, origin: &'static str },

    /// Team slugs were configured but no organization is known.
    #[error("team slugs configured but the installation organization is unknown")]
    MissingOrganization,
}

impl MonitorError {
    pub fn transport(endpoint: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            source,
        }
    }

    pub fn decode(endpoint: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Transport failures may clear up on their own; everything else needs a
    /// config, key or upstream fix.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

pub type Result<T, E = MonitorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_exchange_message_carries_status() {
        let err = MonitorError::TokenExchange { status: 401 };
        assert_eq!(
            err.to_string(),
            "failed to create installation access token (HTTP 401)"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn invalid_identifier_names_its_origin() {
        let err = MonitorError::InvalidIdentifier {
            raw: "nope".to_string(),
            origin: "exclude list",
        };
        assert!(err.to_string().contains("'nope'"));
        assert!(err.to_string().contains("exclude list"));
    }
}
