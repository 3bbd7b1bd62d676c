//! Target repository handling.
//!
//! - [`identifier`]: free-form reference to canonical `owner/repo`.
//! - [`resolver`]: include/exclude/team merging into the working set.
//!
//! [`RepositorySet`] holds the most recently resolved working set.  The
//! refresh job replaces it wholesale; the poller takes a snapshot at the start
//! of each cycle and keeps using it even if a refresh lands mid-cycle.

pub mod identifier;
pub mod resolver;

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

pub use identifier::RepositoryId;
pub use resolver::{GitHubRepositorySource, RepositorySelection, RepositorySetResolver};

#[derive(Debug, Clone, Default)]
struct Resolved {
    repos: Arc<BTreeSet<RepositoryId>>,
    resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct RepositorySet {
    inner: RwLock<Resolved>,
}

impl RepositorySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current working set.  Cheap: shares the underlying set.
    pub fn snapshot(&self) -> Arc<BTreeSet<RepositoryId>> {
        Arc::clone(&self.inner.read().unwrap_or_else(|e| e.into_inner()).repos)
    }

    /// When the current set was resolved, `None` before the first resolution.
    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolved_at
    }

    /// Swap in a freshly resolved set.
    pub fn replace(&self, repos: BTreeSet<RepositoryId>) {
        let resolved = Resolved {
            repos: Arc::new(repos),
            resolved_at: Some(Utc::now()),
        };
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = resolved;
    }
}
