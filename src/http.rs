//! Exposition server.
//!
//! Routes:
//! - `GET /healthz` - token, repository set and poll freshness
//! - `GET /metrics` - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::error;

use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        tokens: Arc::clone(&state.tokens),
        repos: Arc::clone(&state.repos),
        poller: Arc::clone(&state.poller),
        poll_interval: state.config.schedule.poll_interval(),
    };
    crate::health::health_handler(State(health_state)).await
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum AppError {
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AppIdentity, TokenManager};
    use crate::config::Config;
    use crate::github::GitHubClient;
    use crate::metrics::MetricsRegistry;
    use crate::repos::{
        GitHubRepositorySource, RepositoryId, RepositorySelection, RepositorySet,
        RepositorySetResolver,
    };
    use crate::webhooks::WebhookPoller;

    const KEY: &str = include_str!("../testdata/app-key.pem");

    fn state() -> Arc<AppState> {
        let metrics = MetricsRegistry::new();
        let client = GitHubClient::new(reqwest::Client::new(), "http://127.0.0.1:9");
        let identity = AppIdentity::from_pem("42", KEY.as_bytes()).unwrap();
        let tokens = Arc::new(TokenManager::new(
            client.clone(),
            Arc::new(identity),
            "1",
            chrono::Duration::seconds(60),
            metrics.metrics.token_renewals.clone(),
        ));
        let selection = RepositorySelection::new(&[], &[], None, None, Vec::new(), false).unwrap();
        let resolver = Arc::new(RepositorySetResolver::new(
            Arc::new(GitHubRepositorySource::new(client.clone(), None)),
            selection,
        ));
        let poller = Arc::new(WebhookPoller::new(
            client.clone(),
            Arc::clone(&metrics.metrics),
            None,
        ));
        Arc::new(AppState {
            config: Arc::new(Config::default()),
            metrics,
            client,
            tokens,
            repos: Arc::new(RepositorySet::new()),
            resolver,
            poller,
        })
    }

    async fn serve(state: Arc<AppState>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_openmetrics() {
        let state = state();
        state.metrics.metrics.repositories.set(2);
        let base = serve(state).await;

        let resp = reqwest::get(format!("{base}/metrics")).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("application/openmetrics-text"));
        let body = resp.text().await.unwrap();
        assert!(body.contains("gh_webhook_monitor_repositories 2"));
        assert!(body.ends_with("# EOF\n"));
    }

    #[tokio::test]
    async fn health_is_unavailable_before_startup_completes() {
        let state = state();
        state
            .repos
            .replace([RepositoryId::parse("o/r", "test").unwrap()].into());
        let base = serve(state).await;

        let resp = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert_eq!(resp.status(), 503);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["checks"]["token"]["ok"], false);
        assert_eq!(body["checks"]["repositories"]["ok"], true);
    }
}
