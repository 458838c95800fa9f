//! Git operations using a hybrid CLI + libgit2 approach.
//!
//! **CLI (with hardening) for network operations:**
//! - `init_bare` - create an empty bare mirror wired to a remote
//! - `fetch` - incremental, additive fetch of every branch
//! - `sync_head` - point the mirror's HEAD at the remote default branch
//!
//! **libgit2 for read operations:**
//! - `open_repository` - clean API for opening existing repos
//! - `resolve_default_branch` / `resolve_branch_commit` - ref/commit reading
//! - `repository_exists` - simple path validation

use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use git2::{Oid, Repository};
use thiserror::Error;

use crate::cancel::Cancel;
use crate::types::Branch;

/// How often a running git child is checked for exit or cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// Repository path does not contain a git repo.
    #[error("repository not found at {0}")]
    NotFound(String),
    /// The branch does not exist in the mirror.
    #[error("branch {0} not found")]
    BranchNotFound(String),
    /// The remote does not exist or is not accessible.
    #[error("remote repository not found: {0}")]
    RemoteNotFound(String),
    /// Output parsing or unexpected git data.
    #[error("failed to parse git data: {0}")]
    ParseError(String),
    /// Mirror initialization failed.
    #[error("init failed: {0}")]
    InitError(String),
    /// Fetch failed.
    #[error("fetch failed: {0}")]
    FetchError(String),
    /// The caller gave up before git finished.
    #[error("git operation cancelled")]
    Cancelled,
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Validate that a git ref (branch name or commit SHA) does not contain dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..` (path traversal)
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
fn validate_git_ref(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.contains("..") {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain '..'",
            name
        )));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if value.bytes().any(|b| b == 0 || b < 0x20) {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}

/// Remote URLs are passed as arguments, so they must not look like flags.
fn validate_remote_url(url: &str) -> Result<(), GitError> {
    if url.is_empty() || url.starts_with('-') || url.bytes().any(|b| b < 0x20) {
        return Err(GitError::InvalidInput(format!("bad remote url {:?}", url)));
    }
    Ok(())
}

fn path_str<'a>(path: &'a Path, what: &str) -> Result<&'a str, GitError> {
    path.to_str()
        .ok_or_else(|| GitError::ParseError(format!("{} path is not valid UTF-8", what)))
}

/// `http.extraHeader` value that authenticates git-over-https with a token.
fn auth_header(token: &str) -> String {
    let credentials = STANDARD.encode(format!("x-access-token:{}", token));
    format!("Authorization: Basic {}", credentials)
}

fn looks_like_missing_remote(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("not found") || lower.contains("does not appear to be a git repository")
}

struct GitOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

/// Git CLI wrapper with security hardening.
///
/// Used for network operations so authentication, proxies and protocol
/// negotiation behave exactly like the user's own git.
pub struct GitCli {
    git_path: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    /// Create a new GitCli instance using the system git.
    pub fn new() -> Self {
        Self {
            git_path: "git".into(),
        }
    }

    /// Create a hardened Command with security settings.
    ///
    /// Applies:
    /// - `GIT_LFS_SKIP_SMUDGE=1` - skip LFS file downloads
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `core.hooksPath=` - disable hooks execution
    ///
    /// A token is injected through `GIT_CONFIG_*` so it never appears in argv
    /// or in the mirror's config.
    fn command(&self, token: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.env("GIT_LFS_SKIP_SMUDGE", "1");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(token) = token {
            cmd.env("GIT_CONFIG_COUNT", "1");
            cmd.env("GIT_CONFIG_KEY_0", "http.extraHeader");
            cmd.env("GIT_CONFIG_VALUE_0", auth_header(token));
        }
        cmd.args(["-c", "core.hooksPath="]);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run `cmd` to completion, killing it if `cancel` fires first.
    fn run(&self, mut cmd: Command, cancel: &Cancel) -> Result<GitOutput, GitError> {
        if cancel.is_cancelled() {
            return Err(GitError::Cancelled);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        // Drain both pipes so a chatty child never blocks on a full buffer.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(GitError::Cancelled);
            }
            thread::sleep(POLL_INTERVAL);
        };

        Ok(GitOutput {
            status,
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }

    /// `git --version`, used by `doctor`.
    pub fn version(&self) -> Result<String, GitError> {
        let output = self.command(None).arg("--version").output()?;
        if !output.status.success() {
            return Err(GitError::ParseError(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Create an empty bare repository at `dest` whose `origin` mirrors every
    /// branch of `remote_url` into `refs/heads/*`.
    pub fn init_bare(&self, dest: &Path, remote_url: &str) -> Result<(), GitError> {
        validate_remote_url(remote_url)?;
        let dest_str = path_str(dest, "destination")?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let steps: [Vec<&str>; 3] = [
            vec!["init", "--bare", "--quiet", dest_str],
            vec!["-C", dest_str, "remote", "add", "origin", remote_url],
            vec![
                "-C",
                dest_str,
                "config",
                "remote.origin.fetch",
                "+refs/heads/*:refs/heads/*",
            ],
        ];
        for args in steps {
            let output = self.command(None).args(&args).output()?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(GitError::InitError(stderr.into_owned()));
            }
        }
        Ok(())
    }

    /// Fetch new objects and branch heads from origin.
    ///
    /// Never prunes: branches deleted upstream stay exportable.
    pub fn fetch(
        &self,
        mirror_path: &Path,
        token: Option<&str>,
        cancel: &Cancel,
    ) -> Result<(), GitError> {
        let mirror_str = path_str(mirror_path, "mirror")?;

        let mut cmd = self.command(token);
        cmd.arg("-C")
            .arg(mirror_str)
            .args(["fetch", "--quiet", "--no-tags", "origin"]);
        let output = self.run(cmd, cancel)?;

        if !output.status.success() {
            if looks_like_missing_remote(&output.stderr) {
                return Err(GitError::RemoteNotFound(output.stderr));
            }
            return Err(GitError::FetchError(output.stderr));
        }
        Ok(())
    }

    /// Point the mirror's HEAD at the remote's default branch.
    ///
    /// Returns the branch name, or `None` if the remote did not advertise one.
    pub fn sync_head(
        &self,
        mirror_path: &Path,
        token: Option<&str>,
        cancel: &Cancel,
    ) -> Result<Option<String>, GitError> {
        let mirror_str = path_str(mirror_path, "mirror")?;

        let mut cmd = self.command(token);
        cmd.arg("-C")
            .arg(mirror_str)
            .args(["ls-remote", "--symref", "origin", "HEAD"]);
        let output = self.run(cmd, cancel)?;
        if !output.status.success() {
            return Err(GitError::FetchError(output.stderr));
        }

        let Some(head_ref) = parse_symref(&output.stdout) else {
            return Ok(None);
        };
        validate_git_ref(&head_ref, "HEAD ref")?;

        let output = self
            .command(None)
            .arg("-C")
            .arg(mirror_str)
            .args(["symbolic-ref", "HEAD"])
            .arg(&head_ref)
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitError::ParseError(stderr.into_owned()));
        }

        Ok(head_ref.strip_prefix("refs/heads/").map(str::to_string))
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Parse `ref: refs/heads/main\tHEAD` from `git ls-remote --symref`.
fn parse_symref(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let rest = line.strip_prefix("ref: ")?;
        let (target, name) = rest.split_once('\t')?;
        (name.trim() == "HEAD" && target.starts_with("refs/heads/")).then(|| target.to_string())
    })
}

/// Open an existing repository at the given path.
pub fn open_repository(path: &Path) -> Result<Repository, GitError> {
    let repo = Repository::open(path).map_err(|e| {
        if e.code() == git2::ErrorCode::NotFound {
            GitError::NotFound(path.display().to_string())
        } else {
            GitError::Git(e)
        }
    })?;
    Ok(repo)
}

/// Resolve the default branch name and HEAD commit from a repository.
///
/// Returns (branch_name, commit_sha) e.g. ("main", "abc123...")
pub fn resolve_default_branch(repo: &Repository) -> Result<(String, String), GitError> {
    let head = repo.head()?;
    let ref_name = head
        .name()
        .ok_or_else(|| GitError::ParseError("HEAD reference has no name".to_string()))?;

    let branch_name = ref_name
        .strip_prefix("refs/heads/")
        .ok_or_else(|| {
            GitError::ParseError(format!(
                "unexpected HEAD format: expected 'refs/heads/<branch>', got '{}'",
                ref_name
            ))
        })?
        .to_string();

    let commit = head.peel_to_commit()?;
    let commit_sha = commit.id().to_string();

    Ok((branch_name, commit_sha))
}

/// Commit at the tip of `branch` in `repo`.
pub fn resolve_branch_commit(repo: &Repository, branch: &Branch) -> Result<Oid, GitError> {
    validate_git_ref(branch.as_str(), "branch")?;
    let reference = repo.find_reference(&branch.ref_name()).map_err(|e| {
        if e.code() == git2::ErrorCode::NotFound {
            GitError::BranchNotFound(branch.to_string())
        } else {
            GitError::Git(e)
        }
    })?;
    Ok(reference.peel_to_commit()?.id())
}

/// Check if a path contains a valid git repository.
pub fn repository_exists(path: &Path) -> bool {
    Repository::open(path).is_ok()
}
