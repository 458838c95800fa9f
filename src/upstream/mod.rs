//! Everything the engine needs from GitHub.
//!
//! The [`Upstream`] trait is the seam the cache is tested through; [`GitHub`]
//! is the real implementation over `ureq`.

use std::io::{self, Read, Write};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cancel::{Cancel, Cancelled};
use crate::types::{Branch, RepoKey};

const USER_AGENT: &str = concat!("ghmirror/", env!("CARGO_PKG_VERSION"));
const CHUNK_SIZE: usize = 64 * 1024;
/// Longest error body kept from a failed response.
const MAX_MESSAGE: usize = 512;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{0} not found upstream")]
    NotFound(String),
    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected upstream response: {0}")]
    Invalid(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("request cancelled")]
    Cancelled,
}

impl From<Cancelled> for UpstreamError {
    fn from(_: Cancelled) -> Self {
        UpstreamError::Cancelled
    }
}

/// Where a bare mirror fetches from, and with which credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRemote {
    pub url: String,
    pub token: Option<String>,
}

pub trait Upstream: Send + Sync {
    /// The repository's default branch.
    fn default_branch(
        &self,
        key: &RepoKey,
        token: Option<&str>,
        cancel: &Cancel,
    ) -> Result<Branch, UpstreamError>;

    /// Commit SHA at the head of `branch`.
    fn branch_sha(
        &self,
        key: &RepoKey,
        branch: &Branch,
        token: Option<&str>,
        cancel: &Cancel,
    ) -> Result<String, UpstreamError>;

    /// Stream the zip archive of `branch` into `out`. Returns bytes written.
    fn download_archive(
        &self,
        key: &RepoKey,
        branch: &Branch,
        token: Option<&str>,
        out: &mut dyn Write,
        cancel: &Cancel,
    ) -> Result<u64, UpstreamError>;

    /// Git remote for the repository's shared mirror.
    fn mirror_remote(&self, key: &RepoKey, token: Option<&str>) -> MirrorRemote;
}

/// GitHub endpoints; overridable for GitHub Enterprise and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub api_base: String,
    pub codeload_base: String,
    pub git_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            codeload_base: "https://codeload.github.com".to_string(),
            git_base: "https://github.com".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct RepoMetadata {
    default_branch: String,
}

pub struct GitHub {
    endpoints: Endpoints,
    agent: ureq::Agent,
}

impl GitHub {
    pub fn new(endpoints: Endpoints) -> Self {
        let agent = ureq::AgentBuilder::new()
            .user_agent(USER_AGENT)
            .timeout_connect(Duration::from_secs(15))
            .build();
        Self { endpoints, agent }
    }

    fn get(
        &self,
        url: &str,
        accept: &str,
        token: Option<&str>,
        cancel: &Cancel,
    ) -> Result<ureq::Response, UpstreamError> {
        cancel.check()?;
        let mut request = self.agent.get(url).set("Accept", accept);
        if let Some(token) = token {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }
        if let Some(remaining) = cancel.remaining() {
            request = request.timeout(remaining);
        }
        log::debug!("GET {}", url);
        request.call().map_err(|e| map_error(e, url))
    }

    fn repo_url(&self, key: &RepoKey) -> String {
        format!(
            "{}/repos/{}/{}",
            self.endpoints.api_base.trim_end_matches('/'),
            key.owner,
            key.repo
        )
    }
}

fn map_error(err: ureq::Error, url: &str) -> UpstreamError {
    match err {
        ureq::Error::Status(404, _) => UpstreamError::NotFound(url.to_string()),
        ureq::Error::Status(status, response) => {
            let message = clip(response.into_string().unwrap_or_default(), MAX_MESSAGE);
            UpstreamError::Status { status, message }
        }
        ureq::Error::Transport(transport) => UpstreamError::Transport(transport.to_string()),
    }
}

/// Cut `message` to at most `max` bytes without splitting a character.
pub(crate) fn clip(mut message: String, max: usize) -> String {
    if message.len() > max {
        let mut end = max;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

impl Upstream for GitHub {
    fn default_branch(
        &self,
        key: &RepoKey,
        token: Option<&str>,
        cancel: &Cancel,
    ) -> Result<Branch, UpstreamError> {
        let response = self
            .get(&self.repo_url(key), "application/vnd.github+json", token, cancel)
            .map_err(|e| match e {
                UpstreamError::NotFound(_) => UpstreamError::NotFound(key.to_string()),
                other => other,
            })?;
        let metadata: RepoMetadata = serde_json::from_reader(response.into_reader())
            .map_err(|e| UpstreamError::Invalid(e.to_string()))?;
        metadata
            .default_branch
            .parse()
            .map_err(|e| UpstreamError::Invalid(format!("default branch: {}", e)))
    }

    fn branch_sha(
        &self,
        key: &RepoKey,
        branch: &Branch,
        token: Option<&str>,
        cancel: &Cancel,
    ) -> Result<String, UpstreamError> {
        let url = format!("{}/commits/{}", self.repo_url(key), branch.url_segment());
        let response = self
            .get(&url, "application/vnd.github.sha", token, cancel)
            .map_err(|e| match e {
                // GitHub answers 422 for a ref that resolves to nothing.
                UpstreamError::NotFound(_) | UpstreamError::Status { status: 422, .. } => {
                    UpstreamError::NotFound(format!("{}@{}", key, branch))
                }
                other => other,
            })?;
        let body = response
            .into_string()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let sha = body.trim().to_ascii_lowercase();
        if sha.len() != 40 || !sha.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(UpstreamError::Invalid(format!("not a commit sha: {:?}", body)));
        }
        Ok(sha)
    }

    fn download_archive(
        &self,
        key: &RepoKey,
        branch: &Branch,
        token: Option<&str>,
        out: &mut dyn Write,
        cancel: &Cancel,
    ) -> Result<u64, UpstreamError> {
        // Anonymous archives come straight from codeload; authenticated ones
        // go through the API, which redirects to a signed codeload URL.
        let url = match token {
            Some(_) => format!("{}/zipball/{}", self.repo_url(key), branch.url_segment()),
            None => format!(
                "{}/{}/{}/zip/refs/heads/{}",
                self.endpoints.codeload_base.trim_end_matches('/'),
                key.owner,
                key.repo,
                branch.url_path()
            ),
        };
        let response = self
            .get(&url, "application/zip", token, cancel)
            .map_err(|e| match e {
                UpstreamError::NotFound(_) => UpstreamError::NotFound(format!("{}@{}", key, branch)),
                other => other,
            })?;

        let mut reader = response.into_reader();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            cancel.check()?;
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(UpstreamError::Transport(e.to_string())),
            };
            out.write_all(&buf[..n])?;
            total += n as u64;
        }
        Ok(total)
    }

    fn mirror_remote(&self, key: &RepoKey, token: Option<&str>) -> MirrorRemote {
        let repo = key.repo.as_str();
        let suffix = if repo.ends_with(".git") { "" } else { ".git" };
        MirrorRemote {
            url: format!(
                "{}/{}/{}{}",
                self.endpoints.git_base.trim_end_matches('/'),
                key.owner,
                repo,
                suffix
            ),
            token: token.map(str::to_string),
        }
    }
}
