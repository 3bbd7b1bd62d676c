use std::fmt;
use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::webhooks::CodeGroup;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

/// Full delivery detail, including the raw status code.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeliveryLabels {
    pub repository: String,
    pub webhook: String,
    pub target: String,
    pub status: String,
    pub code: String,
    pub code_group: CodeGroup,
}

/// Delivery state without the raw code, used by the "currently active" gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DeliveryGroupLabels {
    pub repository: String,
    pub webhook: String,
    pub target: String,
    pub status: String,
    pub code_group: CodeGroup,
}

impl From<&DeliveryLabels> for DeliveryGroupLabels {
    fn from(l: &DeliveryLabels) -> Self {
        Self {
            repository: l.repository.clone(),
            webhook: l.webhook.clone(),
            target: l.target.clone(),
            status: l.status.clone(),
            code_group: l.code_group,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ListFailureLabels {
    pub repository: String,
    pub error: ListFailure,
}

/// Which stage of a webhook listing failed.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ListFailure {
    Request,
    ReadResponse,
    Decode,
}

impl ListFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "requestError",
            Self::ReadResponse => "readResponseError",
            Self::Decode => "decodeError",
        }
    }
}

impl EncodeLabelValue for ListFailure {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
        EncodeLabelValue::encode(&self.as_str(), encoder)
    }
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the monitor.
pub struct Metrics {
    // -- webhook deliveries --
    pub webhook_last_status_code: Family<DeliveryLabels, Counter>,
    pub webhook_last_status_code_group: Family<DeliveryGroupLabels, Gauge>,
    pub repository_list_failed: Family<ListFailureLabels, Counter>,
    pub poll_duration_seconds: Histogram,

    // -- working set --
    pub repositories: Gauge,

    // -- upstream API --
    pub rate_limit_remaining: Gauge,
    pub token_renewals: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let webhook_last_status_code = Family::<DeliveryLabels, Counter>::default();
        registry.register(
            "gh_webhook_last_status_code",
            "Total Number of Status Codes collected from the 'Last Webhook Response'",
            webhook_last_status_code.clone(),
        );

        let webhook_last_status_code_group = Family::<DeliveryGroupLabels, Gauge>::default();
        registry.register(
            "gh_webhook_last_status_code_group",
            "The last HTTP status code group per webhook (1 = active)",
            webhook_last_status_code_group.clone(),
        );

        let repository_list_failed = Family::<ListFailureLabels, Counter>::default();
        registry.register(
            "gh_webhooks_repository_list_failed",
            "Total number of failed webhook lists per repository",
            repository_list_failed.clone(),
        );

        let poll_duration_seconds = Histogram::new(exponential_buckets(0.5, 2.0, 12));
        registry.register(
            "gh_webhook_monitor_poll_duration_seconds",
            "Duration of a full webhook poll cycle in seconds",
            poll_duration_seconds.clone(),
        );

        let repositories: Gauge = Gauge::default();
        registry.register(
            "gh_webhook_monitor_repositories",
            "Number of repositories in the resolved target set",
            repositories.clone(),
        );

        let rate_limit_remaining: Gauge = Gauge::default();
        registry.register(
            "gh_webhook_monitor_rate_limit_remaining",
            "Remaining GitHub API calls before the rate limit resets",
            rate_limit_remaining.clone(),
        );

        let token_renewals = Counter::default();
        registry.register(
            "gh_webhook_monitor_token_renewals",
            "Installation access token renewals",
            token_renewals.clone(),
        );

        Self {
            webhook_last_status_code,
            webhook_last_status_code_group,
            repository_list_failed,
            poll_duration_seconds,
            repositories,
            rate_limit_remaining,
            token_renewals,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all monitor metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
