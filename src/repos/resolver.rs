//! Working-set resolution.
//!
//! Membership is computed in a fixed order:
//!
//! 1. advisory members: team repositories (and, optionally, everything the
//!    installation can see), narrowed by the include/exclude regexes;
//! 2. minus the exclude list;
//! 3. plus the include list.
//!
//! Explicit includes are authoritative and cannot be vetoed by exclusion;
//! only advisory membership is filtered.

use std::collections::BTreeSet;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info, instrument};

use crate::error::{MonitorError, Result};
use crate::github::types::{InstallationRepositories, Repository};
use crate::github::GitHubClient;

use super::identifier::RepositoryId;

/// Upstream listings that contribute advisory membership.
#[async_trait::async_trait]
pub trait RepositorySource: Send + Sync {
    /// `full_name` of every repository the team has access to.
    async fn team_repositories(&self, team_slug: &str, token: &str) -> Result<Vec<String>>;

    /// `full_name` of every repository the installation can access.
    async fn installation_repositories(&self, token: &str) -> Result<Vec<String>>;
}

/// [`RepositorySource`] backed by the REST API.
pub struct GitHubRepositorySource {
    client: GitHubClient,
    organization: Option<String>,
}

impl GitHubRepositorySource {
    pub fn new(client: GitHubClient, organization: Option<String>) -> Self {
        Self {
            client,
            organization,
        }
    }
}

#[async_trait::async_trait]
impl RepositorySource for GitHubRepositorySource {
    async fn team_repositories(&self, team_slug: &str, token: &str) -> Result<Vec<String>> {
        let org = self
            .organization
            .as_deref()
            .ok_or(MonitorError::MissingOrganization)?;
        let path = format!("/orgs/{org}/teams/{team_slug}/repos?per_page=100");
        let repos: Vec<Repository> = self.client.get_paginated(&path, token).await?;
        Ok(repos.into_iter().map(|r| r.full_name).collect())
    }

    async fn installation_repositories(&self, token: &str) -> Result<Vec<String>> {
        let repos = self
            .client
            .collect_pages(
                "/installation/repositories?per_page=100",
                token,
                |page: InstallationRepositories| page.repositories,
            )
            .await?;
        Ok(repos.into_iter().map(|r| r.full_name).collect())
    }
}

/// Pre-validated selection rules.
#[derive(Debug, Clone, Default)]
pub struct RepositorySelection {
    pub include: Vec<RepositoryId>,
    pub exclude: Vec<RepositoryId>,
    pub include_regexp: Option<Regex>,
    pub exclude_regexp: Option<Regex>,
    pub team_slugs: Vec<String>,
    pub all_installation_repositories: bool,
}

impl RepositorySelection {
    /// Normalize the raw include/exclude references.  Any malformed entry is
    /// an operator error and fails the whole selection.
    pub fn new(
        include: &[String],
        exclude: &[String],
        include_regexp: Option<Regex>,
        exclude_regexp: Option<Regex>,
        team_slugs: Vec<String>,
        all_installation_repositories: bool,
    ) -> Result<Self> {
        let include = include
            .iter()
            .map(|raw| RepositoryId::parse(raw, "include list"))
            .collect::<Result<Vec<_>>>()?;
        let exclude = exclude
            .iter()
            .map(|raw| RepositoryId::parse(raw, "exclude list"))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            include,
            exclude,
            include_regexp,
            exclude_regexp,
            team_slugs,
            all_installation_repositories,
        })
    }

    /// Whether the selection needs an organization to query teams.
    pub fn needs_organization(&self) -> bool {
        !self.team_slugs.is_empty()
    }

    fn admits_advisory(&self, repo: &RepositoryId) -> bool {
        let name = repo.to_string();
        if let Some(re) = &self.include_regexp {
            if !re.is_match(&name) {
                return false;
            }
        }
        if let Some(re) = &self.exclude_regexp {
            if re.is_match(&name) {
                return false;
            }
        }
        true
    }
}

pub struct RepositorySetResolver {
    source: Arc<dyn RepositorySource>,
    selection: RepositorySelection,
}

impl RepositorySetResolver {
    pub fn new(source: Arc<dyn RepositorySource>, selection: RepositorySelection) -> Self {
        Self { source, selection }
    }

    /// Compute the full target set from scratch.
    #[instrument(skip(self, token))]
    pub async fn resolve(&self, token: &str) -> Result<BTreeSet<RepositoryId>> {
        let mut advisory = BTreeSet::new();

        if self.selection.all_installation_repositories {
            let names = self.source.installation_repositories(token).await?;
            debug!(count = names.len(), "fetched installation repositories");
            for name in names {
                advisory.insert(RepositoryId::parse(&name, "installation repositories")?);
            }
        }

        for slug in &self.selection.team_slugs {
            let names = self.source.team_repositories(slug, token).await?;
            debug!(team = %slug, count = names.len(), "fetched team repositories");
            for name in names {
                // Upstream data is trusted; a bad name is a contract violation.
                advisory.insert(RepositoryId::parse(&name, "team repositories")?);
            }
        }

        let mut repos: BTreeSet<RepositoryId> = advisory
            .into_iter()
            .filter(|r| self.selection.admits_advisory(r))
            .collect();

        for excluded in &self.selection.exclude {
            repos.remove(excluded);
        }

        repos.extend(self.selection.include.iter().cloned());

        info!(count = repos.len(), "resolved repository set");
        Ok(repos)
    }
}
