use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::{InstallationToken, TokenManager};
use crate::repos::RepositorySet;
use crate::webhooks::WebhookPoller;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub token: CheckResult,
    pub repositories: CheckResult,
    pub poll: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Subset of `AppState` read by the health check.
#[derive(Clone)]
pub struct HealthState {
    pub tokens: Arc<TokenManager>,
    pub repos: Arc<RepositorySet>,
    pub poller: Arc<WebhookPoller>,
    pub poll_interval: Duration,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// Renewal is lazy, so a published token routinely expires between runs.
/// Only a failed renewal attempt makes the token unhealthy.
fn check_token(
    token: Option<&InstallationToken>,
    last_failure: Option<&str>,
    now: DateTime<Utc>,
) -> CheckResult {
    match (token, last_failure) {
        (_, Some(failure)) => CheckResult::unhealthy(format!("last renewal failed: {failure}")),
        (None, None) => CheckResult::unhealthy("no installation token issued yet"),
        (Some(t), None) if now < t.expires_at => {
            CheckResult::healthy(format!("expires at {}", t.expires_at.to_rfc3339()))
        }
        (Some(t), None) => CheckResult::healthy(format!(
            "expired at {}, renewed on next use",
            t.expires_at.to_rfc3339()
        )),
    }
}

fn check_repositories(resolved_at: Option<DateTime<Utc>>, count: usize) -> CheckResult {
    match resolved_at {
        Some(at) => CheckResult::healthy(format!(
            "{count} repositories, resolved at {}",
            at.to_rfc3339()
        )),
        None => CheckResult::unhealthy("repository set not resolved yet"),
    }
}

/// A poll is stale once two full intervals pass without a completed cycle.
fn check_poll(
    last_completed: Option<DateTime<Utc>>,
    interval: Duration,
    now: DateTime<Utc>,
) -> CheckResult {
    let Some(at) = last_completed else {
        return CheckResult::unhealthy("no poll cycle completed yet");
    };
    let limit = chrono::Duration::from_std(interval * 2).unwrap_or(chrono::Duration::MAX);
    let age = now - at;
    if age > limit {
        CheckResult::unhealthy(format!(
            "last poll completed {}s ago",
            age.num_seconds()
        ))
    } else {
        CheckResult::healthy(format!("last poll completed at {}", at.to_rfc3339()))
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

/// Token and repository set are required; a missing first poll only degrades.
fn aggregate_status(checks: &HealthChecks, polled_once: bool) -> HealthStatus {
    if !checks.token.ok || !checks.repositories.ok {
        HealthStatus::Unhealthy
    } else if checks.poll.ok {
        HealthStatus::Ok
    } else if polled_once {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

pub fn evaluate(state: &HealthState, now: DateTime<Utc>) -> HealthResponse {
    let token = state.tokens.current();
    let last_poll = state.poller.last_completed();

    let checks = HealthChecks {
        token: check_token(token.as_deref(), state.tokens.last_failure().as_deref(), now),
        repositories: check_repositories(state.repos.resolved_at(), state.repos.snapshot().len()),
        poll: check_poll(last_poll, state.poll_interval, now),
    };
    let status = aggregate_status(&checks, last_poll.is_some());
    HealthResponse { status, checks }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let body = evaluate(&state, Utc::now());

    let http_status = match body.status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
