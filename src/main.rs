mod auth;
mod config;
mod error;
mod github;
mod health;
mod http;
mod jobs;
mod metrics;
mod repos;
mod scheduler;
mod webhooks;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::{AppIdentity, TokenManager};
use crate::config::{Config, Overrides};
use crate::github::GitHubClient;
use crate::jobs::{PollJob, RefreshJob};
use crate::metrics::MetricsRegistry;
use crate::repos::{GitHubRepositorySource, RepositorySelection, RepositorySet, RepositorySetResolver};
use crate::scheduler::{run_periodic, Start};
use crate::webhooks::WebhookPoller;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "gh-webhook-monitor",
    about = "Exports GitHub webhook delivery health as Prometheus metrics",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "GWM_CONFIG")]
    config: Option<PathBuf>,

    /// GitHub App id.
    #[arg(long, env = "GWM_GH_APP_ID")]
    app_id: Option<String>,

    /// GitHub App installation id.
    #[arg(long, env = "GWM_GH_APP_INST_ID")]
    installation_id: Option<String>,

    /// Path to the App's PEM private key.
    #[arg(long, env = "GWM_GH_APP_PEM")]
    private_key: Option<PathBuf>,

    /// Wait between poll cycles (`300`, `5m`, `1h30m`).
    #[arg(long, env = "GWM_WAIT_TIME", value_parser = config::parse_interval_secs)]
    poll_interval: Option<u64>,

    /// Wait between repository set refreshes.
    #[arg(long, env = "GWM_REPO_REFRESH_TIME", value_parser = config::parse_interval_secs)]
    repo_refresh_interval: Option<u64>,

    /// Only record webhooks whose target URL matches.
    #[arg(long, env = "GWM_WEBHOOK_TARGET_REGEXP")]
    webhook_target_regexp: Option<String>,

    /// Repositories always monitored (comma-separated).
    #[arg(long, env = "GWM_REPOS_INCLUDE", value_delimiter = ',')]
    include: Option<Vec<String>>,

    /// Repositories never monitored unless included (comma-separated).
    #[arg(long, env = "GWM_REPOS_EXCLUDE", value_delimiter = ',')]
    exclude: Option<Vec<String>>,

    /// Teams whose repositories are monitored (comma-separated).
    #[arg(long, env = "GWM_TEAM_SLUGS", value_delimiter = ',')]
    team_slugs: Option<Vec<String>>,

    /// Address of the metrics/health listener.
    #[arg(long, env = "GWM_LISTEN")]
    listen: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, env = "GWM_DEBUG")]
    debug: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            app_id: self.app_id.clone(),
            installation_id: self.installation_id.clone(),
            private_key_path: self.private_key.clone(),
            poll_interval_secs: self.poll_interval,
            repo_refresh_interval_secs: self.repo_refresh_interval,
            target_url_regexp: self.webhook_target_regexp.clone(),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            team_slugs: self.team_slugs.clone(),
            listen: self.listen.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by the HTTP handlers and the background jobs.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub client: GitHubClient,
    pub tokens: Arc<TokenManager>,
    pub repos: Arc<RepositorySet>,
    pub resolver: Arc<RepositorySetResolver>,
    pub poller: Arc<WebhookPoller>,
}

impl AppState {
    fn refresh_job(&self) -> RefreshJob {
        RefreshJob {
            tokens: Arc::clone(&self.tokens),
            resolver: Arc::clone(&self.resolver),
            repos: Arc::clone(&self.repos),
            metrics: Arc::clone(&self.metrics.metrics),
        }
    }

    fn poll_job(&self) -> PollJob {
        PollJob {
            tokens: Arc::clone(&self.tokens),
            repos: Arc::clone(&self.repos),
            poller: Arc::clone(&self.poller),
            client: self.client.clone(),
            metrics: Arc::clone(&self.metrics.metrics),
        }
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// The organization whose teams are listed: configured, or else the account
/// the installation belongs to.
async fn resolve_organization(
    config: &Config,
    tokens: &TokenManager,
    selection: &RepositorySelection,
) -> Result<Option<String>> {
    if let Some(org) = &config.github.organization {
        return Ok(Some(org.clone()));
    }
    if !selection.needs_organization() {
        return Ok(None);
    }

    let details = tokens
        .installation_details()
        .await
        .context("failed to look up installation details")?;
    tracing::info!(
        organization = %details.account.login,
        target_type = ?details.target_type,
        "organization discovered from installation"
    );
    Ok(Some(details.account.login))
}

async fn build_state(config: Arc<Config>) -> Result<AppState> {
    let key_path = config
        .github
        .private_key_path
        .as_deref()
        .context("github.private_key_path is required")?;
    let identity = AppIdentity::load(config.github.app_id.clone(), key_path)
        .context("failed to load GitHub App identity")?;
    tracing::info!(app_id = %identity.id(), "app identity loaded");

    let metrics = MetricsRegistry::new();
    let client = GitHubClient::from_config(&config.github)?;

    let tokens = Arc::new(TokenManager::new(
        client.clone(),
        Arc::new(identity),
        config.github.installation_id.clone(),
        config.github.refresh_margin(),
        metrics.metrics.token_renewals.clone(),
    ));
    tokens
        .ensure_fresh()
        .await
        .context("failed to obtain initial installation token")?;

    let selection = config.repository_selection()?;
    let organization = resolve_organization(&config, &tokens, &selection).await?;
    let source = GitHubRepositorySource::new(client.clone(), organization);
    let resolver = Arc::new(RepositorySetResolver::new(Arc::new(source), selection));

    let poller = Arc::new(WebhookPoller::new(
        client.clone(),
        Arc::clone(&metrics.metrics),
        config.target_filter()?,
    ));

    Ok(AppState {
        config,
        metrics,
        client,
        tokens,
        repos: Arc::new(RepositorySet::new()),
        resolver,
        poller,
    })
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, cancel: CancellationToken) -> Result<()> {
    let listen_addr = state.config.listen_addr()?;
    let app = http::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = config::load_config(cli.config.as_deref(), cli.overrides())?;
    let config = Arc::new(config);

    tracing::info!(
        config_path = ?cli.config,
        api_url = %config.github.api_url,
        installation_id = %config.github.installation_id,
        "starting gh-webhook-monitor"
    );

    // ---- Token, organization, initial repository set ----
    let state = build_state(Arc::clone(&config)).await?;
    let initial = state
        .refresh_job()
        .refresh()
        .await
        .context("initial repository set resolution failed")?;
    tracing::info!(repositories = initial, "initial repository set resolved");

    // ---- Spawn services ----
    let cancel = CancellationToken::new();

    let refresh_handle = tokio::spawn(run_periodic(
        Arc::new(state.refresh_job()),
        config.schedule.repo_refresh_interval(),
        Start::AfterInterval,
        cancel.clone(),
    ));

    let poll_handle = tokio::spawn(run_periodic(
        Arc::new(state.poll_job()),
        config.schedule.poll_interval(),
        Start::Now,
        cancel.clone(),
    ));

    let http_handle = tokio::spawn({
        let s = state.clone();
        let c = cancel.clone();
        async move {
            if let Err(e) = run_http_server(s, c.clone()).await {
                tracing::error!(error = %format!("{e:#}"), "HTTP server failed");
                c.cancel();
            }
        }
    });

    // ---- Await shutdown ----
    tokio::select! {
        () = shutdown_signal() => {}
        () = cancel.cancelled() => {}
    }
    cancel.cancel();

    let _ = tokio::join!(refresh_handle, poll_handle, http_handle);

    tracing::info!("gh-webhook-monitor shut down cleanly");
    Ok(())
}
