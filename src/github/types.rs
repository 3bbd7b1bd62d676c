//! Payloads returned by the GitHub REST API.
//!
//! Only the fields the monitor reads are modelled; everything else in the
//! responses is ignored by serde.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Response of `POST /app/installations/{id}/access_tokens`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationTokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub repository_selection: Option<String>,
    #[serde(default)]
    pub permissions: HashMap<String, String>,
}

/// Response of `GET /app/installations/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationDetails {
    pub account: Account,
    #[serde(default)]
    pub target_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub login: String,
}

/// A repository item as returned by team and installation listings.
#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub full_name: String,
}

/// Response of `GET /installation/repositories`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationRepositories {
    pub repositories: Vec<Repository>,
}

/// A single item of `GET /repos/{owner}/{repo}/hooks`.
#[derive(Debug, Clone, Deserialize)]
pub struct Webhook {
    pub id: u64,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub config: WebhookConfig,
    /// API URL of the webhook itself; used as its metric identity.
    pub url: String,
    #[serde(default)]
    pub last_response: LastResponse,
}

impl Webhook {
    /// Where deliveries are sent.  Empty for hook types without a URL.
    pub fn target_url(&self) -> &str {
        self.config.url.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,
}

/// Outcome of the most recent delivery attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct LastResponse {
    /// `null` until the first delivery.
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default = "default_last_status")]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl Default for LastResponse {
    fn default() -> Self {
        Self {
            code: None,
            status: default_last_status(),
            message: None,
        }
    }
}

impl LastResponse {
    /// Status code with "never delivered" mapped to 0.
    pub fn code_or_zero(&self) -> u16 {
        self.code.unwrap_or(0)
    }
}

fn default_last_status() -> String {
    "unused".to_string()
}

/// Response of `GET /rate_limit`.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitResponse {
    pub rate: RateLimitResource,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitResource {
    pub limit: u64,
    pub remaining: u64,
    pub reset: u64,
    #[serde(default)]
    pub used: u64,
}
