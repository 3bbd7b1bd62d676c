//! Canonical `owner/repo` identifiers.
//!
//! Operators hand us repositories in whatever shape they copied them from:
//! clone URLs, SSH remotes, browser URLs pointing deep into a repo, or plain
//! `owner/repo`.  [`normalize`] boils all of them down to the one form used
//! for set membership and metric labels.
//!
//! Accepted shapes:
//!
//! ```text
//! owner/repo
//! /owner/repo
//! github.com/owner/repo
//! https://host/owner/repo[.git][/anything]
//! http://host/owner/repo[.git][/anything]
//! git@host:owner/repo[.git]
//! ```

use std::fmt;

use crate::error::{MonitorError, Result};

/// A validated `owner/repo` pair.  Only [`normalize`] builds these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryId {
    owner: String,
    name: String,
}

impl RepositoryId {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalize `raw`, turning a rejection into an [`MonitorError::InvalidIdentifier`]
    /// attributed to `origin`.
    pub fn parse(raw: &str, origin: &'static str) -> Result<Self> {
        normalize(raw).map_err(|raw| MonitorError::InvalidIdentifier { raw, origin })
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Parse a free-form repository reference.
///
/// Never panics.  On rejection the trimmed input comes back as the error so
/// callers can report exactly what they were given.
pub fn normalize(raw: &str) -> std::result::Result<RepositoryId, String> {
    let trimmed = raw.trim();
    parse_reference(trimmed).ok_or_else(|| trimmed.to_string())
}

fn parse_reference(s: &str) -> Option<RepositoryId> {
    let path = if let Some(rest) = s
        .strip_prefix("https://")
        .or_else(|| s.strip_prefix("http://"))
    {
        let (host, path) = rest.split_once('/')?;
        if host.is_empty() {
            return None;
        }
        path
    } else if let Some(rest) = s.strip_prefix("git@") {
        let (host, path) = rest.split_once(':')?;
        if host.is_empty() {
            return None;
        }
        path
    } else {
        let s = s.strip_prefix('/').unwrap_or(s);
        // Owners never contain a dot, so a dotted first segment is a host.
        match s.split_once('/') {
            Some((first, rest)) if first.contains('.') => rest,
            _ => s,
        }
    };

    parse_owner_repo(path)
}

fn parse_owner_repo(path: &str) -> Option<RepositoryId> {
    let (owner, rest) = take_segment(path)?;
    let rest = rest.strip_prefix('/')?;
    let (name, rest) = take_segment(rest)?;

    let trailer_ok = rest.is_empty()
        || rest.starts_with('/')
        || rest == ".git"
        || rest.starts_with(".git/");
    if !trailer_ok {
        return None;
    }

    Some(RepositoryId {
        owner: owner.to_string(),
        name: name.to_string(),
    })
}

/// Split off the leading run of identifier characters, which must be non-empty.
fn take_segment(s: &str) -> Option<(&str, &str)> {
    let end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    Some(s.split_at(end))
}
