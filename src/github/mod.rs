//! Shared GitHub REST plumbing.
//!
//! Every authenticated call goes through [`GitHubClient`] so that URL
//! construction, the versioned `Accept` header, bearer authorization and
//! rate-limit bookkeeping live in one place.  The bearer value is passed per
//! call: the token manager validates freshly issued tokens before publishing
//! them, so the client must not own a token of its own.

pub mod pagination;
pub mod rate_limit;
pub mod types;

use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::config::GitHubConfig;
use crate::error::{MonitorError, Result};

use self::rate_limit::RateLimitState;
use self::types::RateLimitResponse;

/// Versioned media type requested on every call.
pub const ACCEPT: &str = "application/vnd.github.v3+json";

#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    rate_limit: RateLimitState,
}

impl GitHubClient {
    pub fn new(http: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            rate_limit: RateLimitState::new(),
        }
    }

    /// Build a client with the transport timeout and user agent from config.
    pub fn from_config(config: &GitHubConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self::new(http, config.api_url.clone()))
    }

    pub fn rate_limit(&self) -> &RateLimitState {
        &self.rate_limit
    }

    /// Resolve an API path (or an absolute pagination URL) to a full URL.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if path.starts_with('/') {
            format!("{}{path}", self.api_url)
        } else {
            format!("{}/{path}", self.api_url)
        }
    }

    /// Whether an absolute URL points at this client's API root.  The bearer
    /// token is only ever sent there.
    pub fn is_under_api_root(&self, url: &str) -> bool {
        let (Ok(base), Ok(target)) = (reqwest::Url::parse(&self.api_url), reqwest::Url::parse(url))
        else {
            return false;
        };
        base.origin() == target.origin()
            && target.path().starts_with(base.path().trim_end_matches('/'))
    }

    /// Send a request and hand back the raw response, whatever its status.
    pub async fn send(&self, method: Method, path: &str, bearer: &str) -> Result<Response> {
        let url = self.url(path);
        trace!(%method, %url, "GitHub API request");

        let resp = self
            .http
            .request(method, &url)
            .bearer_auth(bearer)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .send()
            .await
            .map_err(|e| MonitorError::transport(path, e))?;

        self.rate_limit.update_from_headers(resp.headers());
        Ok(resp)
    }

    /// `GET` that treats anything but 200 as a failure.
    pub async fn get_ok(&self, path: &str, bearer: &str) -> Result<Response> {
        let resp = self.send(Method::GET, path, bearer).await?;
        if resp.status() != StatusCode::OK {
            return Err(MonitorError::UnexpectedStatus {
                endpoint: path.to_string(),
                status: resp.status().as_u16(),
            });
        }
        Ok(resp)
    }

    /// `GET` a JSON document.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, bearer: &str) -> Result<T> {
        let resp = self.get_ok(path, bearer).await?;
        read_json(path, resp).await
    }

    /// `GET` a JSON array, following `Link: rel="next"` until exhausted.
    pub async fn get_paginated<T: DeserializeOwned>(
        &self,
        path: &str,
        bearer: &str,
    ) -> Result<Vec<T>> {
        self.collect_pages(path, bearer, |page: Vec<T>| page).await
    }

    /// Paginated `GET` whose pages wrap their items in an envelope.
    pub async fn collect_pages<P, T, F>(&self, path: &str, bearer: &str, unwrap: F) -> Result<Vec<T>>
    where
        P: DeserializeOwned,
        F: Fn(P) -> Vec<T>,
    {
        let mut items = Vec::new();
        let mut next = Some(path.to_string());

        while let Some(page_path) = next.take() {
            let resp = self.get_ok(&page_path, bearer).await?;
            next = match pagination::next_page(resp.headers()) {
                Some(url) if !self.is_under_api_root(&url) => {
                    return Err(MonitorError::ForeignLink {
                        endpoint: page_path,
                        url,
                    });
                }
                next => next,
            };
            let page: P = read_json(&page_path, resp).await?;
            items.extend(unwrap(page));
        }

        Ok(items)
    }

    /// Read the upstream rate-limit counters and record them.
    pub async fn fetch_rate_limit(&self, bearer: &str) -> Result<RateLimitResponse> {
        let limits: RateLimitResponse = self.get_json("/rate_limit", bearer).await?;
        self.rate_limit
            .record(limits.rate.remaining, limits.rate.reset);
        debug!(
            limit = limits.rate.limit,
            used = limits.rate.used,
            remaining = limits.rate.remaining,
            "rate limit counters"
        );
        Ok(limits)
    }
}

/// Read a response body and decode it as JSON.
pub async fn read_json<T: DeserializeOwned>(endpoint: &str, resp: Response) -> Result<T> {
    let body = resp
        .bytes()
        .await
        .map_err(|e| MonitorError::transport(endpoint, e))?;
    serde_json::from_slice(&body).map_err(|e| MonitorError::decode(endpoint, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use self::types::Repository;

    fn client(server: &MockServer) -> GitHubClient {
        GitHubClient::new(reqwest::Client::new(), server.uri())
    }

    #[test]
    fn url_joins_relative_and_keeps_absolute() {
        let client = GitHubClient::new(reqwest::Client::new(), "https://api.github.com/");
        assert_eq!(client.url("/rate_limit"), "https://api.github.com/rate_limit");
        assert_eq!(client.url("rate_limit"), "https://api.github.com/rate_limit");
        assert_eq!(
            client.url("https://api.github.com/x?page=2"),
            "https://api.github.com/x?page=2"
        );
    }

    #[test]
    fn api_root_check_compares_origin_and_base_path() {
        let client = GitHubClient::new(reqwest::Client::new(), "https://ghe.example.com/api/v3");
        assert!(client.is_under_api_root("https://ghe.example.com/api/v3/orgs/a/repos?page=2"));
        assert!(!client.is_under_api_root("https://evil.example.com/api/v3/orgs/a/repos"));
        assert!(!client.is_under_api_root("http://ghe.example.com/api/v3/orgs/a/repos"));
        assert!(!client.is_under_api_root("https://ghe.example.com:8443/api/v3/x"));
        assert!(!client.is_under_api_root("https://ghe.example.com/other/x"));
        assert!(!client.is_under_api_root("not a url"));
    }

    #[tokio::test]
    async fn requests_carry_bearer_and_accept_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rate_limit"))
            .and(header("authorization", "Bearer ghs_token"))
            .and(header("accept", ACCEPT))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-RateLimit-Remaining", "4999")
                    .set_body_json(serde_json::json!({
                        "resources": {},
                        "rate": {"limit": 5000, "remaining": 4990, "reset": 1900000000, "used": 10}
                    })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let limits = client.fetch_rate_limit("ghs_token").await.unwrap();
        assert_eq!(limits.rate.limit, 5000);
        // the body wins over the header seen on the same response
        assert_eq!(client.rate_limit().remaining(), Some(4990));
    }

    #[tokio::test]
    async fn non_200_is_unexpected_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/installation/repositories"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server)
            .get_ok("/installation/repositories", "bad")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MonitorError::UnexpectedStatus { status: 401, .. }
        ));
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rate_limit"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client(&server).fetch_rate_limit("t").await.unwrap_err();
        assert!(matches!(err, MonitorError::Decode { .. }));
    }

    #[tokio::test]
    async fn pagination_follows_next_links() {
        let server = MockServer::start().await;
        let second = format!("{}/orgs/acme/teams/core/repos?per_page=100&page=2", server.uri());

        Mock::given(method("GET"))
            .and(path("/orgs/acme/teams/core/repos"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{"full_name": "acme/c"}])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orgs/acme/teams/core/repos"))
            .and(query_param("per_page", "100"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", format!(r#"<{second}>; rel="next""#).as_str())
                    .set_body_json(serde_json::json!([
                        {"full_name": "acme/a"},
                        {"full_name": "acme/b"}
                    ])),
            )
            .mount(&server)
            .await;

        let repos: Vec<Repository> = client(&server)
            .get_paginated("/orgs/acme/teams/core/repos?per_page=100", "t")
            .await
            .unwrap();
        let names: Vec<_> = repos.into_iter().map(|r| r.full_name).collect();
        assert_eq!(names, vec!["acme/a", "acme/b", "acme/c"]);
    }

    #[tokio::test]
    async fn next_link_to_another_host_is_refused() {
        let server = MockServer::start().await;
        let foreign = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(0)
            .mount(&foreign)
            .await;

        let elsewhere = format!("{}/orgs/acme/teams/core/repos?page=2", foreign.uri());
        Mock::given(method("GET"))
            .and(path("/orgs/acme/teams/core/repos"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", format!(r#"<{elsewhere}>; rel="next""#).as_str())
                    .set_body_json(serde_json::json!([{"full_name": "acme/a"}])),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .get_paginated::<Repository>("/orgs/acme/teams/core/repos?per_page=100", "t")
            .await
            .unwrap_err();
        match err {
            MonitorError::ForeignLink { url, .. } => assert_eq!(url, elsewhere),
            other => panic!("unexpected error: {other}"),
        }
    }
}
