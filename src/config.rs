use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::repos::RepositorySelection;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub repositories: RepositoriesConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
}

// ---------------------------------------------------------------------------
// GitHub App
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubConfig {
    /// API root, e.g. `https://ghe.corp.example.com/api/v3` for Enterprise Server.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub installation_id: String,
    /// PEM-encoded RSA private key of the App.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    /// Organization owning the teams in `repositories.team_slugs`.  When
    /// unset it is discovered from the installation's account.
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Renew the installation token this long before it expires.
    #[serde(default = "default_token_refresh_margin")]
    pub token_refresh_margin_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            app_id: String::new(),
            installation_id: String::new(),
            private_key_path: None,
            organization: None,
            request_timeout_secs: default_request_timeout(),
            token_refresh_margin_secs: default_token_refresh_margin(),
            user_agent: default_user_agent(),
        }
    }
}

impl GitHubConfig {
    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.token_refresh_margin_secs).unwrap_or(i64::MAX))
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_token_refresh_margin() -> u64 {
    60
}

fn default_user_agent() -> String {
    concat!("gh-webhook-monitor/", env!("CARGO_PKG_VERSION")).to_string()
}

// ---------------------------------------------------------------------------
// Exposition server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Wait between webhook poll cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Wait between repository set re-resolutions.
    #[serde(default = "default_repo_refresh_interval")]
    pub repo_refresh_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            repo_refresh_interval_secs: default_repo_refresh_interval(),
        }
    }
}

impl ScheduleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn repo_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.repo_refresh_interval_secs)
    }
}

fn default_poll_interval() -> u64 {
    300
}

fn default_repo_refresh_interval() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// Repository selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositoriesConfig {
    /// Always monitored, regardless of team membership or filters.
    #[serde(default)]
    pub include: Vec<String>,
    /// Never monitored unless also listed in `include`.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Team- or installation-derived repositories must match this to be kept.
    #[serde(default)]
    pub include_regexp: Option<String>,
    /// Team- or installation-derived repositories matching this are dropped.
    #[serde(default)]
    pub exclude_regexp: Option<String>,
    #[serde(default)]
    pub team_slugs: Vec<String>,
    /// Seed the set with every repository the installation can access.
    #[serde(default)]
    pub all_installation_repositories: bool,
}

// ---------------------------------------------------------------------------
// Webhooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhooksConfig {
    /// Only webhooks whose target URL matches are recorded.
    #[serde(default)]
    pub target_url_regexp: Option<String>,
}

// ---------------------------------------------------------------------------
// Command-line overrides
// ---------------------------------------------------------------------------

/// Values given on the command line or through `GWM_*` variables.  Anything
/// set here wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub app_id: Option<String>,
    pub installation_id: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
    pub repo_refresh_interval_secs: Option<u64>,
    pub target_url_regexp: Option<String>,
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub team_slugs: Option<Vec<String>>,
    pub listen: Option<String>,
}

impl Overrides {
    pub fn apply(self, config: &mut Config) {
        if let Some(v) = self.app_id {
            config.github.app_id = v;
        }
        if let Some(v) = self.installation_id {
            config.github.installation_id = v;
        }
        if let Some(v) = self.private_key_path {
            config.github.private_key_path = Some(v);
        }
        if let Some(v) = self.poll_interval_secs {
            config.schedule.poll_interval_secs = v;
        }
        if let Some(v) = self.repo_refresh_interval_secs {
            config.schedule.repo_refresh_interval_secs = v;
        }
        if let Some(v) = self.target_url_regexp {
            config.webhooks.target_url_regexp = Some(v);
        }
        if let Some(v) = self.include {
            config.repositories.include = non_empty(v);
        }
        if let Some(v) = self.exclude {
            config.repositories.exclude = non_empty(v);
        }
        if let Some(v) = self.team_slugs {
            config.repositories.team_slugs = non_empty(v);
        }
        if let Some(v) = self.listen {
            config.server.listen = v;
        }
    }
}

/// An empty `GWM_REPOS_INCLUDE=` splits into one empty entry.
fn non_empty(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse an interval given as plain seconds (`300`) or as a duration with
/// unit suffixes (`90s`, `5m`, `1h30m`).  Returns whole seconds; anything
/// below one second is rejected.
pub fn parse_interval_secs(raw: &str) -> std::result::Result<u64, String> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(secs);
    }
    let duration =
        humantime::parse_duration(raw).map_err(|e| format!("invalid interval '{raw}': {e}"))?;
    match duration.as_secs() {
        0 => Err(format!("invalid interval '{raw}': must be at least one second")),
        secs => Ok(secs),
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl Config {
    /// Compiled webhook target filter; `None` records every webhook.
    pub fn target_filter(&self) -> Result<Option<Regex>> {
        compile_optional("webhooks.target_url_regexp", &self.webhooks.target_url_regexp)
    }

    /// Normalized include/exclude lists and compiled advisory filters.
    pub fn repository_selection(&self) -> Result<RepositorySelection> {
        let repos = &self.repositories;
        let selection = RepositorySelection::new(
            &non_empty(repos.include.clone()),
            &non_empty(repos.exclude.clone()),
            compile_optional("repositories.include_regexp", &repos.include_regexp)?,
            compile_optional("repositories.exclude_regexp", &repos.exclude_regexp)?,
            non_empty(repos.team_slugs.clone()),
            repos.all_installation_repositories,
        )?;
        Ok(selection)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .with_context(|| format!("invalid server.listen address: {}", self.server.listen))
    }
}

fn compile_optional(field: &str, pattern: &Option<String>) -> Result<Option<Regex>> {
    match pattern.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(p) => Regex::new(p)
            .map(Some)
            .with_context(|| format!("invalid {field}: {p}")),
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load the YAML file at `path` (if any), apply `overrides` and validate.
pub fn load_config(path: Option<&Path>, overrides: Overrides) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            parse_config(&contents)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => Config::default(),
    };
    overrides.apply(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<Config> {
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(contents)?)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.github.app_id.trim().is_empty(),
        "github.app_id is required"
    );
    anyhow::ensure!(
        !config.github.installation_id.trim().is_empty(),
        "github.installation_id is required"
    );
    anyhow::ensure!(
        config.github.private_key_path.is_some(),
        "github.private_key_path is required"
    );
    anyhow::ensure!(
        config.github.request_timeout_secs > 0,
        "github.request_timeout_secs must be greater than 0"
    );
    anyhow::ensure!(
        config.schedule.poll_interval_secs > 0,
        "schedule.poll_interval_secs must be greater than 0"
    );
    anyhow::ensure!(
        config.schedule.repo_refresh_interval_secs > 0,
        "schedule.repo_refresh_interval_secs must be greater than 0"
    );
    config.listen_addr()?;
    config.target_filter()?;
    config.repository_selection()?;
    Ok(())
}
