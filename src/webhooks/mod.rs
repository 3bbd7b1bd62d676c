//! Webhook delivery auditing.

pub mod classify;
pub mod poller;

pub use classify::CodeGroup;
pub use poller::WebhookPoller;
