//! Shared bare mirrors under `git-cache/<owner>/<repo>.git`.
//!
//! One mirror per repository, shared by every user. Updates are serialized by
//! the `mirror:{owner}/{repo}` registry key and by an flock under `locks/`;
//! exports read the object store without holding either.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::git::{GitCli, GitError, repository_exists};
use super::lock::{KeyLockRegistry, MirrorLock};
use super::paths::CachePaths;
use super::swap::temp_path_for;
use super::CacheError;
use crate::cancel::Cancel;
use crate::types::RepoKey;
use crate::upstream::MirrorRemote;

pub struct MirrorCache {
    paths: CachePaths,
    git: GitCli,
    locks: Arc<KeyLockRegistry>,
    lock_timeout: Duration,
}

impl MirrorCache {
    pub fn new(paths: CachePaths, locks: Arc<KeyLockRegistry>, lock_timeout: Duration) -> Self {
        Self {
            paths,
            git: GitCli::new(),
            locks,
            lock_timeout,
        }
    }

    /// Make sure the mirror for `key` exists and is as fresh as upstream allows.
    ///
    /// A missing mirror is created in a temp directory and renamed into place
    /// only after the first fetch succeeds. An existing mirror whose fetch fails
    /// is kept and served as-is.
    pub fn ensure(
        &self,
        key: &RepoKey,
        remote: &MirrorRemote,
        cancel: &Cancel,
    ) -> Result<PathBuf, CacheError> {
        let lock_key = key.mirror_lock_key();
        let _guard = self
            .locks
            .acquire_timeout(&lock_key, self.lock_timeout)
            .map_err(|_| CacheError::LockFailed(lock_key.clone()))?;
        let _file_lock =
            MirrorLock::acquire_with_timeout(&self.paths.mirror_lock_path(key), self.lock_timeout)
                .map_err(|e| CacheError::LockFailed(format!("{}: {}", lock_key, e)))?;

        let mirror = self.paths.mirror_dir(key);
        let token = remote.token.as_deref();

        if repository_exists(&mirror) {
            match self.git.fetch(&mirror, token, cancel) {
                Ok(()) => log::debug!("fetched mirror {}", key),
                Err(GitError::Cancelled) => return Err(CacheError::Cancelled),
                Err(e) => {
                    log::warn!("fetch of {} failed, serving last known state: {}", key, e);
                    return Ok(mirror);
                }
            }
        } else {
            log::info!("creating mirror for {} at {}", key, mirror.display());
            self.create(&mirror, remote, cancel)?;
        }

        if let Err(e) = self.git.sync_head(&mirror, token, cancel) {
            log::debug!("could not sync HEAD of {}: {}", key, e);
        }
        Ok(mirror)
    }

    fn create(&self, mirror: &Path, remote: &MirrorRemote, cancel: &Cancel) -> Result<(), CacheError> {
        // Leftovers from a crash hold no state worth keeping.
        if mirror.exists() {
            fs::remove_dir_all(mirror)?;
        }
        let staging = temp_path_for(mirror);
        let result = self
            .git
            .init_bare(&staging, &remote.url)
            .and_then(|()| self.git.fetch(&staging, remote.token.as_deref(), cancel));
        if let Err(e) = result {
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }
        fs::rename(&staging, mirror)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fixtures::{SourceRepo, require_git};
    use crate::cache::ErrorKind;
    use crate::cache::git::open_repository;
    use tempfile::tempdir;

    fn remote_for(source: &SourceRepo) -> MirrorRemote {
        MirrorRemote {
            url: source.url(),
            token: None,
        }
    }

    fn mirror_cache(root: &Path) -> MirrorCache {
        MirrorCache::new(
            CachePaths::new(root),
            Arc::new(KeyLockRegistry::new()),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn creates_then_fetches_incrementally() {
        if !require_git() {
            return;
        }
        let dir = tempdir().unwrap();
        let source = SourceRepo::create(&dir.path().join("source"));
        source.commit(&[("a.txt", b"1")], "one");

        let cache = mirror_cache(&dir.path().join("cache"));
        let key: RepoKey = "octo/demo".parse().unwrap();
        let mirror = cache.ensure(&key, &remote_for(&source), &Cancel::new()).unwrap();
        assert_eq!(mirror, dir.path().join("cache/git-cache/octo/demo.git"));
        assert!(open_repository(&mirror).unwrap().is_bare());

        let second = source.commit(&[("b.txt", b"2")], "two");
        cache.ensure(&key, &remote_for(&source), &Cancel::new()).unwrap();
        let repo = open_repository(&mirror).unwrap();
        let main = repo.find_reference("refs/heads/main").unwrap();
        assert_eq!(main.target(), Some(second));
        // No staging leftovers beside the mirror.
        assert_eq!(fs::read_dir(mirror.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn failed_fetch_keeps_existing_mirror() {
        if !require_git() {
            return;
        }
        let dir = tempdir().unwrap();
        let source = SourceRepo::create(&dir.path().join("source"));
        let first = source.commit(&[("a.txt", b"1")], "one");

        let cache = mirror_cache(&dir.path().join("cache"));
        let key: RepoKey = "octo/demo".parse().unwrap();
        let mirror = cache.ensure(&key, &remote_for(&source), &Cancel::new()).unwrap();

        fs::remove_dir_all(source.path()).unwrap();
        let again = cache.ensure(&key, &remote_for(&source), &Cancel::new()).unwrap();
        assert_eq!(again, mirror);
        let repo = open_repository(&mirror).unwrap();
        assert_eq!(repo.find_reference("refs/heads/main").unwrap().target(), Some(first));
    }

    #[test]
    fn failed_first_fetch_leaves_nothing() {
        if !require_git() {
            return;
        }
        let dir = tempdir().unwrap();
        let cache = mirror_cache(&dir.path().join("cache"));
        let key: RepoKey = "octo/missing".parse().unwrap();
        let remote = MirrorRemote {
            url: format!("file://{}", dir.path().join("nope").display()),
            token: None,
        };

        assert!(cache.ensure(&key, &remote, &Cancel::new()).is_err());
        let owner_dir = dir.path().join("cache/git-cache/octo");
        assert_eq!(fs::read_dir(&owner_dir).unwrap().count(), 0);
    }

    #[test]
    fn cancelled_ensure_leaves_nothing() {
        if !require_git() {
            return;
        }
        let dir = tempdir().unwrap();
        let source = SourceRepo::create(&dir.path().join("source"));
        source.commit(&[("a.txt", b"1")], "one");
        let cache = mirror_cache(&dir.path().join("cache"));
        let key: RepoKey = "octo/demo".parse().unwrap();

        let cancel = Cancel::new();
        cancel.cancel();
        let err = cache.ensure(&key, &remote_for(&source), &cancel).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let owner_dir = dir.path().join("cache/git-cache/octo");
        assert_eq!(fs::read_dir(&owner_dir).unwrap().count(), 0);

        // The registry key was released with the error.
        cache.ensure(&key, &remote_for(&source), &Cancel::new()).unwrap();
    }
}
