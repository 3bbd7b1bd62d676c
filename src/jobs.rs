//! The two periodic jobs: repository set refresh and webhook polling.
//!
//! Both ask the [`TokenManager`] for a fresh token at the start of every run,
//! so renewal happens lazily on whichever job needs it first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::auth::{InstallationToken, TokenManager};
use crate::github::GitHubClient;
use crate::metrics::Metrics;
use crate::repos::{RepositorySet, RepositorySetResolver};
use crate::scheduler::Job;
use crate::webhooks::WebhookPoller;

/// Pause before the single retry of a renewal that failed in transport.
const RENEWAL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// A token for this run.  Transport failures get one retry; anything else
/// (bad key, rejected exchange, failed validation) will not fix itself and waits
/// for the next scheduled run.
pub async fn fresh_token(tokens: &TokenManager) -> anyhow::Result<Arc<InstallationToken>> {
    match tokens.ensure_fresh().await {
        Ok(token) => Ok(token),
        Err(e) if e.is_transient() => {
            warn!(error = %e, "token renewal failed in transport, retrying once");
            tokio::time::sleep(RENEWAL_RETRY_DELAY).await;
            tokens
                .ensure_fresh()
                .await
                .context("installation token renewal failed")
        }
        Err(e) => Err(anyhow::Error::new(e).context("installation token renewal failed")),
    }
}

// ---------------------------------------------------------------------------
// Repository set refresh
// ---------------------------------------------------------------------------

pub struct RefreshJob {
    pub tokens: Arc<TokenManager>,
    pub resolver: Arc<RepositorySetResolver>,
    pub repos: Arc<RepositorySet>,
    pub metrics: Arc<Metrics>,
}

impl RefreshJob {
    /// Resolve and publish.  On failure the previous set stays in place.
    pub async fn refresh(&self) -> anyhow::Result<usize> {
        let token = fresh_token(&self.tokens).await?;
        let resolved = self
            .resolver
            .resolve(&token.value)
            .await
            .context("repository set resolution failed")?;

        let count = resolved.len();
        let previous = self.repos.snapshot();
        if *previous != resolved {
            info!(before = previous.len(), after = count, "repository set changed");
        }
        self.repos.replace(resolved);
        self.metrics
            .repositories
            .set(i64::try_from(count).unwrap_or(i64::MAX));
        Ok(count)
    }
}

#[async_trait]
impl Job for RefreshJob {
    fn name(&self) -> &'static str {
        "repository-refresh"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let count = self.refresh().await?;
        info!(repositories = count, "repository set refreshed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Webhook polling
// ---------------------------------------------------------------------------

pub struct PollJob {
    pub tokens: Arc<TokenManager>,
    pub repos: Arc<RepositorySet>,
    pub poller: Arc<WebhookPoller>,
    pub client: GitHubClient,
    pub metrics: Arc<Metrics>,
}

#[async_trait]
impl Job for PollJob {
    fn name(&self) -> &'static str {
        "webhook-poll"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let token = fresh_token(&self.tokens).await?;
        let repos = self.repos.snapshot();

        let started = Instant::now();
        self.poller.poll_once(&repos, &token.value).await;
        self.metrics
            .poll_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        if let Err(e) = self.client.fetch_rate_limit(&token.value).await {
            warn!(error = %e, "failed to read rate limit");
        }
        let rate_limit = self.client.rate_limit();
        if let Some(remaining) = rate_limit.remaining() {
            self.metrics
                .rate_limit_remaining
                .set(i64::try_from(remaining).unwrap_or(i64::MAX));
            debug!(remaining, reset_in_secs = rate_limit.reset_in_secs(), "rate limit");
        }
        Ok(())
    }
}
