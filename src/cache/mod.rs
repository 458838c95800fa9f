//! Repository cache & export engine

mod export;
#[cfg(test)]
pub(crate) mod fixtures;
mod git;
mod guard;
mod janitor;
mod lock;
mod mirror;
mod negative;
mod paths;
mod sidecar;
mod staleness;
mod store;
mod swap;

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::cancel::Cancelled;
use crate::config::{Config, Layout};
use crate::types::ParseError;
use crate::upstream::{GitHub, Upstream, UpstreamError};

pub use export::{ExportSummary, normalize_prefixes, zip_directory};
pub use git::{GitCli, GitError};
pub use guard::{GuardError, entry_destination, extract_zip, resolve};
pub use janitor::{Janitor, JanitorHandle};
pub use lock::{DEFAULT_LOCK_TIMEOUT, KeyGuard, KeyLockRegistry, MirrorLock};
pub use mirror::MirrorCache;
pub use negative::NegativeCache;
pub use paths::CachePaths;
pub use staleness::{is_expired, touch};
pub use store::{
    DirLayout, DirStore, EnsureRequest, ExportRequest, Namespace, RepoStore, Snapshot,
    SnapshotLayout, SnapshotStore, StoreOptions, SweepStats, ZipLayout, ZipStore,
};
pub use swap::{StagedFile, is_temp_name, temp_path_for};

/// Coarse classification of a [`CacheError`], used to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed identifiers, traversal attempts, unusable destinations.
    BadInput,
    /// The repository, branch or cache entry does not exist.
    NotFound,
    /// Upstream could not be reached and nothing usable is cached.
    Unavailable,
    /// An archive was malformed or tried to escape its destination.
    Integrity,
    /// The request was cancelled or hit its deadline.
    Cancelled,
    Internal,
}

/// Errors returned by cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("corrupt archive: {0}")]
    Integrity(String),
    /// Failed to acquire a key or mirror lock within the timeout.
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<Cancelled> for CacheError {
    fn from(_: Cancelled) -> Self {
        CacheError::Cancelled
    }
}

impl From<git2::Error> for CacheError {
    fn from(e: git2::Error) -> Self {
        CacheError::Git(e.into())
    }
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::InvalidInput(_) | CacheError::Parse(_) | CacheError::NotEmpty(_) => {
                ErrorKind::BadInput
            }
            CacheError::Guard(GuardError::BadPath(_)) => ErrorKind::BadInput,
            CacheError::Guard(GuardError::IllegalPath(_) | GuardError::Archive(_)) => {
                ErrorKind::Integrity
            }
            CacheError::Guard(GuardError::Io(e)) => io_kind(e),
            CacheError::NotFound(_) => ErrorKind::NotFound,
            CacheError::Upstream(e) => match e {
                UpstreamError::NotFound(_) => ErrorKind::NotFound,
                UpstreamError::Cancelled => ErrorKind::Cancelled,
                UpstreamError::Io(_) => ErrorKind::Internal,
                _ => ErrorKind::Unavailable,
            },
            CacheError::Git(e) => match e {
                GitError::NotFound(_) | GitError::BranchNotFound(_) | GitError::RemoteNotFound(_) => {
                    ErrorKind::NotFound
                }
                GitError::Cancelled => ErrorKind::Cancelled,
                GitError::InvalidInput(_) => ErrorKind::BadInput,
                GitError::FetchError(_) | GitError::InitError(_) => ErrorKind::Unavailable,
                _ => ErrorKind::Internal,
            },
            CacheError::Integrity(_) => ErrorKind::Integrity,
            CacheError::LockFailed(_) => ErrorKind::Unavailable,
            CacheError::Cancelled => ErrorKind::Cancelled,
            CacheError::Archive(_) => ErrorKind::Internal,
            CacheError::Io(e) => io_kind(e),
        }
    }
}

fn io_kind(e: &io::Error) -> ErrorKind {
    match e.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::InvalidInput => ErrorKind::BadInput,
        _ => ErrorKind::Internal,
    }
}

/// Build the store selected by `config.layout`, talking to GitHub.
pub fn open_store(config: &Config) -> Arc<dyn RepoStore> {
    let upstream: Arc<dyn Upstream> = Arc::new(GitHub::new(config.endpoints.clone()));
    open_store_with(config, upstream)
}

/// Like [`open_store`] with an explicit upstream.
pub fn open_store_with(config: &Config, upstream: Arc<dyn Upstream>) -> Arc<dyn RepoStore> {
    let paths = CachePaths::new(config.cache_dir.clone());
    let options = StoreOptions {
        lock_timeout: config.lock_timeout,
    };
    match config.layout {
        Layout::Zip => Arc::new(ZipStore::new(paths, upstream, options)),
        Layout::Dir => Arc::new(DirStore::new(paths, upstream, options)),
    }
}
