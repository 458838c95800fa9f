//! Identifier types shared across the cache engine.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for parsing failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("value cannot be empty")]
    Empty,
    #[error("invalid character in value: {0:?}")]
    InvalidCharacter(char),
    #[error("value cannot start with '{0}'")]
    InvalidStart(char),
    #[error("value cannot end with '{0}'")]
    InvalidEnd(char),
    #[error("repository must be in owner/name form")]
    MissingSeparator,
    #[error("invalid owner: {0}")]
    InvalidOwner(#[source] Box<ParseError>),
    #[error("invalid repo: {0}")]
    InvalidRepo(#[source] Box<ParseError>),
    #[error("invalid branch: {0}")]
    InvalidBranch(String),
    #[error("invalid user: {0}")]
    InvalidUser(String),
}

/// A GitHub owner (user or organization)
///
/// Validation rules:
/// - Non-empty
/// - Alphanumeric characters and hyphens only
/// - Cannot start or end with a hyphen
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner(String);

impl Owner {
    /// Returns the owner name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Owner {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        if s.starts_with('-') {
            return Err(ParseError::InvalidStart('-'));
        }

        if s.ends_with('-') {
            return Err(ParseError::InvalidEnd('-'));
        }

        for c in s.chars() {
            if !c.is_ascii_alphanumeric() && c != '-' {
                return Err(ParseError::InvalidCharacter(c));
            }
        }

        Ok(Owner(s.to_string()))
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A GitHub repository name
///
/// Validation rules:
/// - Non-empty
/// - Alphanumeric characters, hyphens, underscores, and dots only
/// - Cannot start with a dot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repo(String);

impl Repo {
    /// Returns the repository name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Repo {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        if s.starts_with('.') {
            return Err(ParseError::InvalidStart('.'));
        }

        for c in s.chars() {
            if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' {
                return Err(ParseError::InvalidCharacter(c));
            }
        }

        Ok(Repo(s.to_string()))
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a specific GitHub repository (owner + repo)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoKey {
    pub owner: Owner,
    pub repo: Repo,
}

impl RepoKey {
    /// Creates a new RepoKey from owner and repo
    pub fn new(owner: Owner, repo: Repo) -> Self {
        Self { owner, repo }
    }

    /// Lock registry key for the shared bare mirror of this repository.
    pub fn mirror_lock_key(&self) -> String {
        format!("mirror:{}/{}", self.owner, self.repo)
    }
}

impl FromStr for RepoKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (owner_str, repo_str) = s.split_once('/').ok_or(ParseError::MissingSeparator)?;

        let owner = owner_str
            .parse::<Owner>()
            .map_err(|e| ParseError::InvalidOwner(Box::new(e)))?;
        let repo = repo_str
            .parse::<Repo>()
            .map_err(|e| ParseError::InvalidRepo(Box::new(e)))?;

        Ok(RepoKey { owner, repo })
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// A branch name, validated against the subset of `git check-ref-format`
/// rules that matter for building refs, URLs and file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Branch(String);

impl Branch {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fully qualified ref name: `refs/heads/<branch>`.
    pub fn ref_name(&self) -> String {
        format!("refs/heads/{}", self.0)
    }

    /// Single URL path segment (`release/1.0` -> `release%2F1.0`).
    pub fn url_segment(&self) -> String {
        escape_segment(&self.0)
    }

    /// URL path keeping `/` as a separator between escaped components.
    pub fn url_path(&self) -> String {
        self.0
            .split('/')
            .map(escape_segment)
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Filesystem-safe stem used for snapshot artifacts and their sidecars.
    pub fn file_stem(&self) -> String {
        escape_segment(&self.0)
    }
}

impl FromStr for Branch {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s.starts_with('-') {
            return Err(ParseError::InvalidStart('-'));
        }
        if s.starts_with('/') || s.ends_with('/') || s.contains("//") {
            return Err(ParseError::InvalidBranch(format!(
                "'{}' has an empty path component",
                s
            )));
        }
        if s.contains("..") || s.contains("@{") || s.ends_with(".lock") || s.ends_with('.') {
            return Err(ParseError::InvalidBranch(format!(
                "'{}' is not a valid ref name",
                s
            )));
        }
        if s.split('/').any(|part| part.starts_with('.')) {
            return Err(ParseError::InvalidStart('.'));
        }
        for c in s.chars() {
            if c.is_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\') {
                return Err(ParseError::InvalidCharacter(c));
            }
        }
        Ok(Branch(s.to_string()))
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A requesting user's identity, used only to namespace snapshot caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    /// Sanitize a user string supplied by a client.
    ///
    /// Path separators are stripped; a missing or empty identity falls back to
    /// `fallback` (which is sanitized the same way).
    pub fn sanitize(raw: Option<&str>, fallback: &str) -> Result<Self, ParseError> {
        let cleaned = raw.map(strip_separators).unwrap_or_default();
        let cleaned = if cleaned.is_empty() {
            strip_separators(fallback)
        } else {
            cleaned
        };

        if cleaned.is_empty() {
            return Err(ParseError::Empty);
        }
        if cleaned == "." || cleaned == ".." {
            return Err(ParseError::InvalidUser(cleaned));
        }
        if let Some(c) = cleaned.chars().find(|c| c.is_control()) {
            return Err(ParseError::InvalidCharacter(c));
        }
        Ok(UserId(cleaned))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn strip_separators(value: &str) -> String {
    value
        .trim()
        .chars()
        .filter(|c| *c != '/' && *c != '\\')
        .collect()
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cache key of a per-user snapshot: (user, owner/repo, branch).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub user: UserId,
    pub repo: RepoKey,
    pub branch: Branch,
}

impl SnapshotKey {
    pub fn new(user: UserId, repo: RepoKey, branch: Branch) -> Self {
        Self { user, repo, branch }
    }

    /// Lock registry key. Built from the same components as the on-disk path so
    /// the janitor can derive it back from a directory walk.
    pub fn lock_key(&self) -> String {
        snapshot_lock_key(
            self.user.as_str(),
            self.repo.owner.as_str(),
            self.repo.repo.as_str(),
            &self.branch.file_stem(),
        )
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.user, self.repo, self.branch)
    }
}

pub fn snapshot_lock_key(user: &str, owner: &str, repo: &str, stem: &str) -> String {
    format!("snapshot:{}/{}/{}/{}", user, owner, repo, stem)
}

/// Percent-encode a value for use as a single URL path segment.
pub fn escape_segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
