//! Coarse HTTP status buckets.
//!
//! Per-code series explode label cardinality, so the gauge family only
//! carries the bucket.  `0` means the webhook never delivered and lands in
//! `unknown` along with anything outside 200-599.

use std::fmt;

use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum CodeGroup {
    Success,
    Redirect,
    ClientError,
    ServerError,
    Unknown,
}

/// Inclusive bounds, checked in order; the first match wins.
const BOUNDS: [(u16, u16, CodeGroup); 4] = [
    (200, 299, CodeGroup::Success),
    (300, 399, CodeGroup::Redirect),
    (400, 499, CodeGroup::ClientError),
    (500, 599, CodeGroup::ServerError),
];

impl CodeGroup {
    pub fn classify(code: u16) -> Self {
        BOUNDS
            .iter()
            .find(|(lo, hi, _)| (*lo..=*hi).contains(&code))
            .map_or(Self::Unknown, |(_, _, group)| *group)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "2xx",
            Self::Redirect => "3xx",
            Self::ClientError => "4xx",
            Self::ServerError => "5xx",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CodeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EncodeLabelValue for CodeGroup {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
        EncodeLabelValue::encode(&self.as_str(), encoder)
    }
}
