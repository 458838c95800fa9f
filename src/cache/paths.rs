//! Cache directory path management
//!
//! This module provides the `CachePaths` struct which manages all filesystem paths
//! for the cache directory layout:
//!
//! ```text
//! ~/.cache/ghmirror/
//! ├── users/
//! │   └── <user>/
//! │       └── repos/
//! │           └── <owner>/
//! │               └── <repo>/
//! │                   ├── <branch>.zip     # Snapshot (zip layout)
//! │                   ├── <branch>/        # Snapshot (dir layout)
//! │                   └── <branch>.sha     # Last verified commit
//! ├── git-cache/
//! │   └── <owner>/
//! │       └── <repo>.git/                  # Shared bare mirror
//! ├── locks/
//! │   └── <owner>__<repo>.lock             # flock-based mirror locking
//! └── tmp/                                 # Scratch space for exports
//! ```

use std::path::{Path, PathBuf};

use crate::types::{Branch, RepoKey, UserId};

/// Manages all filesystem paths for the cache directory layout
#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    /// Creates a new CachePaths with the specified root directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root cache directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the snapshot namespace root: `{root}/users`
    pub fn users_dir(&self) -> PathBuf {
        self.root.join("users")
    }

    /// Returns a user's namespace: `{root}/users/{user}`
    pub fn user_dir(&self, user: &UserId) -> PathBuf {
        self.users_dir().join(user.as_str())
    }

    /// Returns the snapshot directory of a repository for one user:
    /// `{root}/users/{user}/repos/{owner}/{repo}`
    pub fn snapshot_base(&self, user: &UserId, key: &RepoKey) -> PathBuf {
        self.user_dir(user)
            .join("repos")
            .join(key.owner.as_str())
            .join(key.repo.as_str())
    }

    /// Zip snapshot: `{snapshot_base}/{branch}.zip`
    pub fn snapshot_zip(&self, user: &UserId, key: &RepoKey, branch: &Branch) -> PathBuf {
        self.snapshot_base(user, key)
            .join(format!("{}.zip", branch.file_stem()))
    }

    /// Extracted snapshot: `{snapshot_base}/{branch}`
    pub fn snapshot_dir(&self, user: &UserId, key: &RepoKey, branch: &Branch) -> PathBuf {
        self.snapshot_base(user, key).join(branch.file_stem())
    }

    /// SHA sidecar: `{snapshot_base}/{branch}.sha`
    pub fn sidecar(&self, user: &UserId, key: &RepoKey, branch: &Branch) -> PathBuf {
        self.snapshot_base(user, key)
            .join(format!("{}.sha", branch.file_stem()))
    }

    /// Returns the bare mirror namespace root: `{root}/git-cache`
    pub fn git_cache_dir(&self) -> PathBuf {
        self.root.join("git-cache")
    }

    /// Returns the mirror directory for a specific repository: `{root}/git-cache/{owner}/{repo}.git`
    pub fn mirror_dir(&self, key: &RepoKey) -> PathBuf {
        let repo = key.repo.as_str();
        let mut path = self.git_cache_dir().join(key.owner.as_str());

        // Avoid double ".git" suffix if the repo name already ends with ".git".
        if repo.ends_with(".git") {
            path.push(repo);
        } else {
            path.push(format!("{}.git", repo));
        }

        path
    }

    /// Returns the locks directory path: `{root}/locks`
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Returns the mirror lock file path: `{root}/locks/{owner}__{repo}.lock`
    pub fn mirror_lock_path(&self, key: &RepoKey) -> PathBuf {
        self.locks_dir().join(format!(
            "{}__{}.lock",
            key.owner.as_str(),
            key.repo.as_str()
        ))
    }

    /// Returns the scratch directory for ephemeral exports: `{root}/tmp`
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }
}

impl Default for CachePaths {
    /// Creates a CachePaths using the system cache directory + "ghmirror"
    ///
    /// Uses `dirs::cache_dir()` which resolves to:
    /// - Linux: `~/.cache`
    /// - macOS: `~/Library/Caches`
    /// - Windows: `C:\Users\<user>\AppData\Local`
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
        Self::new(cache_dir.join("ghmirror"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_root_path() -> PathBuf {
        PathBuf::from("cache-root")
    }

    fn test_paths() -> CachePaths {
        CachePaths::new(test_root_path())
    }

    fn test_repo_key() -> RepoKey {
        "octocat/hello-world".parse().unwrap()
    }

    fn test_user() -> UserId {
        UserId::sanitize(Some("alice"), "default").unwrap()
    }

    #[test]
    fn test_default() {
        let paths = CachePaths::default();
        assert!(paths.root().ends_with("ghmirror"));
    }

    #[test]
    fn test_snapshot_zip() {
        let paths = test_paths();
        let branch: Branch = "main".parse().unwrap();
        assert_eq!(
            paths.snapshot_zip(&test_user(), &test_repo_key(), &branch),
            test_root_path()
                .join("users")
                .join("alice")
                .join("repos")
                .join("octocat")
                .join("hello-world")
                .join("main.zip")
        );
    }

    #[test]
    fn test_snapshot_paths_escape_branch_separators() {
        let paths = test_paths();
        let branch: Branch = "release/1.0".parse().unwrap();
        let base = paths.snapshot_base(&test_user(), &test_repo_key());
        assert_eq!(
            paths.snapshot_zip(&test_user(), &test_repo_key(), &branch),
            base.join("release%2F1.0.zip")
        );
        assert_eq!(
            paths.snapshot_dir(&test_user(), &test_repo_key(), &branch),
            base.join("release%2F1.0")
        );
        assert_eq!(
            paths.sidecar(&test_user(), &test_repo_key(), &branch),
            base.join("release%2F1.0.sha")
        );
    }

    #[test]
    fn test_mirror_dir() {
        let paths = test_paths();
        let key = test_repo_key();
        assert_eq!(
            paths.mirror_dir(&key),
            test_root_path()
                .join("git-cache")
                .join("octocat")
                .join("hello-world.git")
        );
    }

    #[test]
    fn test_mirror_dir_with_git_suffix() {
        let paths = test_paths();
        let key: RepoKey = "my-org/my-repo.git".parse().unwrap();
        assert_eq!(
            paths.mirror_dir(&key),
            test_root_path()
                .join("git-cache")
                .join("my-org")
                .join("my-repo.git")
        );
    }

    #[test]
    fn test_mirror_lock_path() {
        let paths = test_paths();
        let key: RepoKey = "my-org/my_repo.v2".parse().unwrap();
        assert_eq!(
            paths.mirror_lock_path(&key),
            test_root_path()
                .join("locks")
                .join("my-org__my_repo.v2.lock")
        );
    }
}
