//! Webhook delivery polling.
//!
//! One cycle walks the target set sequentially, lists each repository's
//! webhooks and records the outcome of every webhook's last delivery.  A
//! repository whose listing fails is counted and skipped; it never aborts the
//! rest of the cycle.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::error::MonitorError;
use crate::github::types::Webhook;
use crate::github::GitHubClient;
use crate::metrics::{DeliveryGroupLabels, DeliveryLabels, ListFailure, ListFailureLabels, Metrics};
use crate::repos::RepositoryId;

use super::classify::CodeGroup;

/// `(repository, webhook API URL)`; identifies one gauge series owner.
type WebhookKey = (String, String);

/// Summary of one poll cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    /// Repositories whose webhooks were listed successfully.
    pub succeeded: Vec<RepositoryId>,
    /// Repositories whose listing failed, with the failing stage.
    pub failed: Vec<(RepositoryId, ListFailure)>,
    /// Webhooks recorded.
    pub webhooks: usize,
    /// Webhooks ignored because their target did not match the filter.
    pub filtered: usize,
}

pub struct WebhookPoller {
    client: GitHubClient,
    metrics: Arc<Metrics>,
    target_filter: Option<Regex>,
    /// Gauge label set currently published per webhook.
    active: Mutex<HashMap<WebhookKey, DeliveryGroupLabels>>,
    last_completed: RwLock<Option<DateTime<Utc>>>,
}

impl WebhookPoller {
    pub fn new(client: GitHubClient, metrics: Arc<Metrics>, target_filter: Option<Regex>) -> Self {
        Self {
            client,
            metrics,
            target_filter,
            active: Mutex::new(HashMap::new()),
            last_completed: RwLock::new(None),
        }
    }

    /// When the most recent cycle finished, `None` before the first one.
    pub fn last_completed(&self) -> Option<DateTime<Utc>> {
        *self.last_completed.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Poll every repository in `repos` once, in order.
    #[instrument(skip_all, fields(repos = repos.len()))]
    pub async fn poll_once(&self, repos: &BTreeSet<RepositoryId>, token: &str) -> PollReport {
        let mut report = PollReport::default();
        let mut seen: HashSet<WebhookKey> = HashSet::new();

        for repo in repos {
            debug!(%repo, "listing webhooks");
            let hooks = match self.list_webhooks(repo, token).await {
                Ok(hooks) => hooks,
                Err((kind, err)) => {
                    warn!(%repo, error = %err, kind = kind.as_str(), "failed to list webhooks");
                    self.metrics
                        .repository_list_failed
                        .get_or_create(&ListFailureLabels {
                            repository: repo.to_string(),
                            error: kind,
                        })
                        .inc();
                    report.failed.push((repo.clone(), kind));
                    continue;
                }
            };

            for hook in &hooks {
                if !self.matches_target(hook) {
                    debug!(
                        %repo,
                        target = hook.target_url(),
                        "webhook target does not match filter, ignoring"
                    );
                    report.filtered += 1;
                    continue;
                }
                seen.insert(self.record(repo, hook));
                report.webhooks += 1;
            }
            report.succeeded.push(repo.clone());
        }

        self.prune(repos, &report.succeeded, &seen);
        *self.last_completed.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            webhooks = report.webhooks,
            filtered = report.filtered,
            "poll cycle finished"
        );
        report
    }

    async fn list_webhooks(
        &self,
        repo: &RepositoryId,
        token: &str,
    ) -> Result<Vec<Webhook>, (ListFailure, MonitorError)> {
        let path = format!("/repos/{repo}/hooks");
        let resp = self
            .client
            .get_ok(&path, token)
            .await
            .map_err(|e| (ListFailure::Request, e))?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| (ListFailure::ReadResponse, MonitorError::transport(&path, e)))?;
        serde_json::from_slice(&body)
            .map_err(|e| (ListFailure::Decode, MonitorError::decode(&path, e)))
    }

    fn matches_target(&self, hook: &Webhook) -> bool {
        self.target_filter
            .as_ref()
            .map_or(true, |re| re.is_match(hook.target_url()))
    }

    /// Record one webhook's last delivery.  Returns its series key.
    fn record(&self, repo: &RepositoryId, hook: &Webhook) -> WebhookKey {
        let code = hook.last_response.code_or_zero();
        let labels = DeliveryLabels {
            repository: repo.to_string(),
            webhook: hook.url.clone(),
            target: hook.target_url().to_string(),
            status: hook.last_response.status.clone(),
            code: code.to_string(),
            code_group: CodeGroup::classify(code),
        };
        debug!(
            %repo,
            hook_id = hook.id,
            webhook = %labels.webhook,
            target = %labels.target,
            active = hook.active,
            events = ?hook.events,
            code,
            code_group = %labels.code_group,
            message = hook.last_response.message.as_deref().unwrap_or_default(),
            "webhook last delivery"
        );

        self.metrics
            .webhook_last_status_code
            .get_or_create(&labels)
            .inc();

        let group = DeliveryGroupLabels::from(&labels);
        let key = (labels.repository, labels.webhook);
        let gauge = &self.metrics.webhook_last_status_code_group;

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = active.insert(key.clone(), group.clone()) {
            if previous != group {
                gauge.remove(&previous);
            }
        }
        gauge.get_or_create(&group).set(1);

        key
    }

    /// Drop gauge series for webhooks that are gone.  A webhook is gone when
    /// its repository left the target set, or when its repository was listed
    /// successfully this cycle without it.  Repositories whose listing failed
    /// keep their last known state.
    fn prune(
        &self,
        repos: &BTreeSet<RepositoryId>,
        succeeded: &[RepositoryId],
        seen: &HashSet<WebhookKey>,
    ) {
        let targeted: HashSet<String> = repos.iter().map(ToString::to_string).collect();
        let listed: HashSet<String> = succeeded.iter().map(ToString::to_string).collect();
        let gauge = &self.metrics.webhook_last_status_code_group;

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.retain(|key, labels| {
            let (repo, _) = key;
            let keep = seen.contains(key) || (targeted.contains(repo) && !listed.contains(repo));
            if !keep {
                debug!(repository = %repo, webhook = %labels.webhook, "dropping stale webhook series");
                gauge.remove(labels);
            }
            keep
        });
    }
}
