//! Installation access token lifecycle.
//!
//! The token is renewed lazily: callers ask for a fresh token right before
//! they need one and [`TokenManager::ensure_fresh`] only goes upstream when the
//! stored token is about to expire.  A renewal signs an assertion, exchanges
//! it for an installation token and validates the new token with a cheap
//! authenticated call.  Only a token that passed validation is published, and
//! it replaces the previous one wholesale.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use prometheus_client::metrics::counter::Counter;
use reqwest::{Method, StatusCode};
use tracing::{debug, info, instrument};

use crate::error::{MonitorError, Result};
use crate::github::types::{InstallationDetails, InstallationTokenResponse};
use crate::github::{self, GitHubClient};

use super::assertion::AssertionSigner;

/// An installation-scoped access token.  Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl InstallationToken {
    /// Usable at `now` with at least `margin` to spare.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

pub struct TokenManager {
    client: GitHubClient,
    signer: Arc<dyn AssertionSigner>,
    installation_id: String,
    refresh_margin: Duration,
    current: RwLock<Option<Arc<InstallationToken>>>,
    /// Message of the most recent renewal failure, cleared by a success.
    last_failure: RwLock<Option<String>>,
    /// Serializes renewals so only one sign/exchange/validate runs at a time.
    renew: tokio::sync::Mutex<()>,
    renewals: Counter,
}

impl TokenManager {
    pub fn new(
        client: GitHubClient,
        signer: Arc<dyn AssertionSigner>,
        installation_id: impl Into<String>,
        refresh_margin: Duration,
        renewals: Counter,
    ) -> Self {
        Self {
            client,
            signer,
            installation_id: installation_id.into(),
            refresh_margin,
            current: RwLock::new(None),
            last_failure: RwLock::new(None),
            renew: tokio::sync::Mutex::new(()),
            renewals,
        }
    }

    /// The published token, fresh or not.
    pub fn current(&self) -> Option<Arc<InstallationToken>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Why the last renewal attempt failed, `None` if it succeeded (or none
    /// was needed yet).  An expired token is harmless while this is `None`:
    /// the next caller renews it.
    pub fn last_failure(&self) -> Option<String> {
        self.last_failure
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record_outcome(&self, failure: Option<String>) {
        *self.last_failure.write().unwrap_or_else(|e| e.into_inner()) = failure;
    }

    fn current_fresh(&self, now: DateTime<Utc>) -> Option<Arc<InstallationToken>> {
        self.current()
            .filter(|t| t.is_fresh_at(now, self.refresh_margin))
    }

    fn publish(&self, token: Arc<InstallationToken>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(token);
    }

    /// Return a token that is valid right now, renewing it first if needed.
    pub async fn ensure_fresh(&self) -> Result<Arc<InstallationToken>> {
        self.ensure_fresh_at(Utc::now()).await
    }

    pub async fn ensure_fresh_at(&self, now: DateTime<Utc>) -> Result<Arc<InstallationToken>> {
        if let Some(token) = self.current_fresh(now) {
            return Ok(token);
        }

        let _guard = self.renew.lock().await;
        // Another task may have renewed while we waited for the lock.
        if let Some(token) = self.current_fresh(now) {
            return Ok(token);
        }

        let token = match self.renew_token(now).await {
            Ok(token) => token,
            Err(e) => {
                self.record_outcome(Some(e.to_string()));
                return Err(e);
            }
        };
        self.publish(Arc::clone(&token));
        self.record_outcome(None);
        self.renewals.inc();
        info!(
            installation_id = %self.installation_id,
            expires_at = %token.expires_at,
            "installation token renewed"
        );
        Ok(token)
    }

    #[instrument(skip(self), fields(installation_id = %self.installation_id))]
    async fn renew_token(&self, now: DateTime<Utc>) -> Result<Arc<InstallationToken>> {
        debug!("renewing installation token");
        let assertion = self.signer.sign_assertion(now)?;
        let token = self.exchange_for_installation_token(&assertion).await?;
        self.validate(&token.value).await?;
        Ok(Arc::new(token))
    }

    /// Trade a signed assertion for an installation access token.
    pub async fn exchange_for_installation_token(
        &self,
        assertion: &str,
    ) -> Result<InstallationToken> {
        let path = format!("/app/installations/{}/access_tokens", self.installation_id);
        let resp = self.client.send(Method::POST, &path, assertion).await?;

        if resp.status() != StatusCode::CREATED {
            return Err(MonitorError::TokenExchange {
                status: resp.status().as_u16(),
            });
        }

        let body: InstallationTokenResponse = github::read_json(&path, resp).await?;
        debug!(
            repository_selection = ?body.repository_selection,
            permissions = body.permissions.len(),
            "installation token issued"
        );
        Ok(InstallationToken {
            value: body.token,
            expires_at: body.expires_at,
        })
    }

    /// Smoke test: a token that parses but lacks access fails here.
    async fn validate(&self, token: &str) -> Result<()> {
        self.client
            .get_ok("/installation/repositories", token)
            .await
            .map(|_| ())
    }

    /// Look up the installation itself, authenticated as the app.
    pub async fn installation_details(&self) -> Result<InstallationDetails> {
        let assertion = self.signer.sign_assertion(Utc::now())?;
        let path = format!("/app/installations/{}", self.installation_id);
        self.client.get_json(&path, &assertion).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticSigner;

    impl AssertionSigner for StaticSigner {
        fn sign_assertion(&self, _now: DateTime<Utc>) -> Result<String> {
            Ok("signed-assertion".to_string())
        }
    }

    struct BrokenSigner;

    impl AssertionSigner for BrokenSigner {
        fn sign_assertion(&self, _now: DateTime<Utc>) -> Result<String> {
            Err(MonitorError::KeyLoad {
                path: "/dev/null".into(),
                message: "empty".to_string(),
            })
        }
    }

    fn manager(server: &MockServer, signer: Arc<dyn AssertionSigner>) -> TokenManager {
        TokenManager::new(
            GitHubClient::new(reqwest::Client::new(), server.uri()),
            signer,
            "42",
            Duration::seconds(60),
            Counter::default(),
        )
    }

    fn token(value: &str, expires_at: DateTime<Utc>) -> Arc<InstallationToken> {
        Arc::new(InstallationToken {
            value: value.to_string(),
            expires_at,
        })
    }

    async fn mount_exchange(server: &MockServer, status: u16, expect: u64) {
        Mock::given(method("POST"))
            .and(path("/app/installations/42/access_tokens"))
            .and(header("authorization", "Bearer signed-assertion"))
            .respond_with(ResponseTemplate::new(status).set_body_json(serde_json::json!({
                "token": "ghs_new",
                "expires_at": "2099-01-01T00:00:00Z",
                "repository_selection": "selected",
                "permissions": {"repository_hooks": "read"}
            })))
            .expect(expect)
            .mount(server)
            .await;
    }

    async fn mount_validation(server: &MockServer, status: u16, expect: u64) {
        Mock::given(method("GET"))
            .and(path("/installation/repositories"))
            .and(header("authorization", "Bearer ghs_new"))
            .respond_with(ResponseTemplate::new(status).set_body_json(serde_json::json!({
                "total_count": 0,
                "repositories": []
            })))
            .expect(expect)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn fresh_token_is_reused_without_upstream_calls() {
        let server = MockServer::start().await;
        mount_exchange(&server, 201, 0).await;

        let tm = manager(&server, Arc::new(StaticSigner));
        let now = Utc::now();
        tm.publish(token("ghs_old", now + Duration::hours(1)));

        let got = tm.ensure_fresh_at(now).await.unwrap();
        assert_eq!(got.value, "ghs_old");
        assert_eq!(tm.renewals.get(), 0);
    }

    #[tokio::test]
    async fn expired_token_is_renewed_exactly_once() {
        let server = MockServer::start().await;
        mount_exchange(&server, 201, 1).await;
        mount_validation(&server, 200, 1).await;

        let tm = manager(&server, Arc::new(StaticSigner));
        let now = Utc::now();
        tm.publish(token("ghs_old", now - Duration::seconds(1)));

        let got = tm.ensure_fresh_at(now).await.unwrap();
        assert_eq!(got.value, "ghs_new");
        assert_eq!(tm.current().unwrap().value, "ghs_new");
        assert_eq!(tm.renewals.get(), 1);

        // second call sees the new token and stays local
        let again = tm.ensure_fresh_at(now).await.unwrap();
        assert_eq!(again.value, "ghs_new");
        assert_eq!(tm.renewals.get(), 1);
    }

    #[tokio::test]
    async fn token_inside_refresh_margin_is_renewed() {
        let server = MockServer::start().await;
        mount_exchange(&server, 201, 1).await;
        mount_validation(&server, 200, 1).await;

        let tm = manager(&server, Arc::new(StaticSigner));
        let now = Utc::now();
        tm.publish(token("ghs_old", now + Duration::seconds(30)));

        assert_eq!(tm.ensure_fresh_at(now).await.unwrap().value, "ghs_new");
    }

    #[tokio::test]
    async fn failed_validation_keeps_the_old_token() {
        let server = MockServer::start().await;
        mount_exchange(&server, 201, 1).await;
        mount_validation(&server, 403, 1).await;

        let tm = manager(&server, Arc::new(StaticSigner));
        let now = Utc::now();
        let old = token("ghs_old", now - Duration::seconds(1));
        tm.publish(Arc::clone(&old));

        let err = tm.ensure_fresh_at(now).await.unwrap_err();
        assert!(matches!(
            err,
            MonitorError::UnexpectedStatus { status: 403, .. }
        ));
        assert_eq!(tm.current(), Some(old));
        assert_eq!(tm.renewals.get(), 0);
        assert!(tm.last_failure().unwrap().contains("403"));
    }

    #[tokio::test]
    async fn successful_renewal_clears_recorded_failure() {
        let server = MockServer::start().await;
        mount_exchange(&server, 201, 1).await;
        mount_validation(&server, 200, 1).await;

        let tm = manager(&server, Arc::new(StaticSigner));
        tm.record_outcome(Some("earlier failure".to_string()));
        tm.ensure_fresh().await.unwrap();
        assert_eq!(tm.last_failure(), None);
    }

    #[tokio::test]
    async fn rejected_exchange_reports_status_code() {
        let server = MockServer::start().await;
        mount_exchange(&server, 401, 1).await;
        mount_validation(&server, 200, 0).await;

        let tm = manager(&server, Arc::new(StaticSigner));
        let err = tm.ensure_fresh().await.unwrap_err();
        assert!(matches!(err, MonitorError::TokenExchange { status: 401 }));
        assert!(tm.current().is_none());
    }

    #[tokio::test]
    async fn signing_failure_never_reaches_upstream() {
        let server = MockServer::start().await;
        mount_exchange(&server, 201, 0).await;

        let tm = manager(&server, Arc::new(BrokenSigner));
        let err = tm.ensure_fresh().await.unwrap_err();
        assert!(matches!(err, MonitorError::KeyLoad { .. }));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_renewal() {
        let server = MockServer::start().await;
        mount_exchange(&server, 201, 1).await;
        mount_validation(&server, 200, 1).await;

        let tm = manager(&server, Arc::new(StaticSigner));
        let now = Utc::now();
        let (a, b) = tokio::join!(tm.ensure_fresh_at(now), tm.ensure_fresh_at(now));
        assert_eq!(a.unwrap().value, "ghs_new");
        assert_eq!(b.unwrap().value, "ghs_new");
        assert_eq!(tm.renewals.get(), 1);
    }

    #[tokio::test]
    async fn installation_details_use_the_app_assertion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/app/installations/42"))
            .and(header("authorization", "Bearer signed-assertion"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 42,
                "account": {"login": "acme", "id": 1},
                "app_id": 7,
                "target_type": "Organization",
                "repository_selection": "all"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tm = manager(&server, Arc::new(StaticSigner));
        let details = tm.installation_details().await.unwrap();
        assert_eq!(details.account.login, "acme");
    }
}
