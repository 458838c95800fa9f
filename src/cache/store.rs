//! The `RepoStore` interface and its snapshot-backed implementations.
//!
//! Two stores share one engine: [`ZipStore`] keeps each branch as the archive
//! GitHub served, [`DirStore`] keeps it extracted. Everything else (locking,
//! SHA checks, the stale-but-available fallback, mirrors, listing and
//! eviction) is common and lives in [`SnapshotStore`].

use std::fs::{self, File};
use std::io;
use std::marker::PhantomData;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::export::{self, ExportSummary, normalize_prefixes, zip_directory};
use super::git::{open_repository, resolve_default_branch};
use super::guard::{self, extract_zip};
use super::lock::{DEFAULT_LOCK_TIMEOUT, KeyGuard, KeyLockRegistry};
use super::mirror::MirrorCache;
use super::negative::NegativeCache;
use super::paths::CachePaths;
use super::sidecar;
use super::staleness;
use super::swap::{StagedFile, is_temp_name, temp_path_for};
use super::CacheError;
use crate::cancel::Cancel;
use crate::config::Layout;
use crate::protocol::DirEntry;
use crate::types::{Branch, RepoKey, SnapshotKey, UserId, snapshot_lock_key};
use crate::upstream::{Upstream, UpstreamError};

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long a request waits for another request holding the same key.
    pub lock_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

/// Parameters of [`RepoStore::ensure_repo`].
#[derive(Debug, Clone)]
pub struct EnsureRequest {
    pub user: UserId,
    pub repo: RepoKey,
    /// `None` resolves the repository's default branch upstream.
    pub branch: Option<Branch>,
    pub token: Option<String>,
    /// Download even when the cached SHA matches or upstream is unreachable.
    pub force: bool,
}

/// Parameters of the sparse export operations.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub repo: RepoKey,
    /// `None` exports the mirror's default branch.
    pub branch: Option<Branch>,
    /// Path prefixes to include; empty means the whole tree.
    pub paths: Vec<String>,
    pub token: Option<String>,
}

/// A cached snapshot, ready to be served.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub path: PathBuf,
    pub branch: Branch,
    /// Commit the snapshot was taken at, when known.
    pub commit: Option<String>,
    /// `true` if this call downloaded the archive.
    pub downloaded: bool,
}

/// Which subtree of the cache a list or delete addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Namespace {
    /// `users/<user>`
    User(UserId),
    /// `git-cache`
    Mirrors,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub scanned: usize,
    pub removed: usize,
    /// Expired entries skipped because a request held their key.
    pub busy: usize,
    pub temp_removed: usize,
    pub errors: usize,
}

/// The cache engine as seen by the server, the CLI and the janitor.
pub trait RepoStore: Send + Sync {
    fn layout(&self) -> Layout;

    fn paths(&self) -> &CachePaths;

    /// Number of keys currently known to the lock registry.
    fn lock_count(&self) -> usize;

    /// Make sure a snapshot of the requested branch is cached and return it.
    fn ensure_repo(&self, req: &EnsureRequest, cancel: &Cancel) -> Result<Snapshot, CacheError>;

    /// [`ensure_repo`](Self::ensure_repo), then open the snapshot as a zip
    /// before its key is released. A refresh racing the read cannot swap the
    /// snapshot out from under it.
    fn open_snapshot(
        &self,
        req: &EnsureRequest,
        cancel: &Cancel,
    ) -> Result<(Snapshot, File), CacheError>;

    /// Make sure the shared bare mirror of `repo` exists and is fresh.
    fn ensure_bare_repo(
        &self,
        repo: &RepoKey,
        token: Option<&str>,
        cancel: &Cancel,
    ) -> Result<PathBuf, CacheError>;

    fn export_sparse_zip(
        &self,
        req: &ExportRequest,
        dest: &Path,
        cancel: &Cancel,
    ) -> Result<ExportSummary, CacheError>;

    fn export_sparse_dir(
        &self,
        req: &ExportRequest,
        dest: &Path,
        cancel: &Cancel,
    ) -> Result<ExportSummary, CacheError>;

    /// Entries at `rel` within `ns`, sorted by name.
    fn list(&self, ns: &Namespace, rel: &str) -> Result<Vec<DirEntry>, CacheError>;

    /// Remove the file or directory at `rel` within `ns`.
    fn delete(&self, ns: &Namespace, rel: &str, recursive: bool) -> Result<(), CacheError>;

    /// Reset the eviction clock of a cache entry.
    fn touch(&self, path: &Path) -> Result<(), CacheError>;

    /// Remove snapshots not accessed within `ttl`.
    fn cleanup_expired(&self, ttl: Duration) -> Result<SweepStats, CacheError>;
}

/// On-disk shape of a snapshot.
pub trait SnapshotLayout: Send + Sync + 'static {
    const LAYOUT: Layout;

    fn artifact_path(paths: &CachePaths, key: &SnapshotKey) -> PathBuf;

    /// Branch stem of an entry name in a repo directory, or `None` if the
    /// name cannot be an artifact of this layout.
    fn artifact_stem(name: &str) -> Option<&str>;

    /// Move a complete, validated archive into place at `artifact`.
    fn install(staged: StagedFile, artifact: &Path) -> Result<(), CacheError>;

    /// Open `artifact` as a readable zip. Callers hold the snapshot's key.
    fn open(artifact: &Path, scratch_dir: &Path) -> Result<File, CacheError>;
}

/// Snapshots stored as `<branch>.zip`.
pub struct ZipLayout;

impl SnapshotLayout for ZipLayout {
    const LAYOUT: Layout = Layout::Zip;

    fn artifact_path(paths: &CachePaths, key: &SnapshotKey) -> PathBuf {
        paths.snapshot_zip(&key.user, &key.repo, &key.branch)
    }

    fn artifact_stem(name: &str) -> Option<&str> {
        name.strip_suffix(".zip")
    }

    fn install(staged: StagedFile, _artifact: &Path) -> Result<(), CacheError> {
        staged.persist()?;
        Ok(())
    }

    fn open(artifact: &Path, _scratch_dir: &Path) -> Result<File, CacheError> {
        Ok(File::open(artifact)?)
    }
}

/// Snapshots stored extracted under `<branch>/`.
pub struct DirLayout;

impl SnapshotLayout for DirLayout {
    const LAYOUT: Layout = Layout::Dir;

    fn artifact_path(paths: &CachePaths, key: &SnapshotKey) -> PathBuf {
        paths.snapshot_dir(&key.user, &key.repo, &key.branch)
    }

    fn artifact_stem(name: &str) -> Option<&str> {
        Some(name)
    }

    fn install(staged: StagedFile, artifact: &Path) -> Result<(), CacheError> {
        let archive = File::open(staged.path())?;
        let files = extract_zip(archive, artifact, true)?;
        log::debug!("extracted {} files into {}", files, artifact.display());
        // The staged archive is dropped (and deleted) here.
        Ok(())
    }

    /// Zip the tree into an unlinked scratch file; the handle keeps it alive.
    fn open(artifact: &Path, scratch_dir: &Path) -> Result<File, CacheError> {
        fs::create_dir_all(scratch_dir)?;
        let scratch = temp_path_for(&scratch_dir.join("snapshot.zip"));
        if let Err(e) = zip_directory(artifact, &scratch) {
            let _ = fs::remove_file(&scratch);
            return Err(e);
        }
        let file = File::open(&scratch)?;
        if let Err(e) = fs::remove_file(&scratch) {
            log::debug!("could not unlink {}: {}", scratch.display(), e);
        }
        Ok(file)
    }
}

pub type ZipStore = SnapshotStore<ZipLayout>;
pub type DirStore = SnapshotStore<DirLayout>;

pub struct SnapshotStore<L> {
    paths: CachePaths,
    upstream: Arc<dyn Upstream>,
    locks: Arc<KeyLockRegistry>,
    mirrors: MirrorCache,
    negative: NegativeCache,
    options: StoreOptions,
    _layout: PhantomData<fn() -> L>,
}

impl<L: SnapshotLayout> SnapshotStore<L> {
    pub fn new(paths: CachePaths, upstream: Arc<dyn Upstream>, options: StoreOptions) -> Self {
        let locks = Arc::new(KeyLockRegistry::new());
        let mirrors = MirrorCache::new(paths.clone(), Arc::clone(&locks), options.lock_timeout);
        Self {
            paths,
            upstream,
            locks,
            mirrors,
            negative: NegativeCache::new(),
            options,
            _layout: PhantomData,
        }
    }

    fn lock(&self, key: &str) -> Result<KeyGuard, CacheError> {
        self.locks
            .acquire_timeout(key, self.options.lock_timeout)
            .map_err(|_| CacheError::LockFailed(key.to_string()))
    }

    fn resolve_branch(
        &self,
        req: &EnsureRequest,
        cancel: &Cancel,
    ) -> Result<Branch, CacheError> {
        if let Some(branch) = &req.branch {
            return Ok(branch.clone());
        }
        match self
            .upstream
            .default_branch(&req.repo, req.token.as_deref(), cancel)
        {
            Ok(branch) => Ok(branch),
            Err(UpstreamError::NotFound(_)) => {
                self.negative.record_missing(&req.repo, req.token.as_deref());
                Err(CacheError::NotFound(req.repo.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort head SHA. `Ok(None)` means upstream could not be asked.
    fn remote_sha(
        &self,
        key: &SnapshotKey,
        token: Option<&str>,
        cancel: &Cancel,
    ) -> Result<Option<String>, CacheError> {
        match self.upstream.branch_sha(&key.repo, &key.branch, token, cancel) {
            Ok(sha) => Ok(Some(sha)),
            Err(UpstreamError::NotFound(what)) => Err(CacheError::NotFound(what)),
            Err(UpstreamError::Cancelled) => Err(CacheError::Cancelled),
            Err(e) => {
                log::warn!("could not fetch head of {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Download, validate and install a fresh snapshot. Returns its commit.
    fn populate(
        &self,
        key: &SnapshotKey,
        artifact: &Path,
        remote_sha: Option<String>,
        token: Option<&str>,
        cancel: &Cancel,
    ) -> Result<Option<String>, CacheError> {
        if let Some(parent) = artifact.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut staged = StagedFile::create(artifact)?;
        let bytes = self
            .upstream
            .download_archive(&key.repo, &key.branch, token, &mut staged, cancel)?;
        staged.finish()?;
        cancel.check()?;

        let archive_sha = inspect_archive(staged.path())?;
        if let (Some(remote), Some(archived)) = (&remote_sha, &archive_sha) {
            if remote != archived {
                log::info!("{} moved to {} during download", key, archived);
            }
        }
        // The archive comment names the commit actually downloaded.
        let commit = archive_sha.or(remote_sha);

        L::install(staged, artifact)?;
        let sidecar_path = self.paths.sidecar(&key.user, &key.repo, &key.branch);
        match &commit {
            Some(sha) => sidecar::write_sha(&sidecar_path, sha)?,
            None => sidecar::remove_sha(&sidecar_path)?,
        }
        staleness::touch(artifact)?;
        log::info!(
            "cached {} ({} bytes) at {}",
            key,
            bytes,
            commit.as_deref().unwrap_or("unknown commit")
        );
        Ok(commit)
    }

    /// The ensure flow. The snapshot's key stays held until the guard drops.
    fn ensure_held(
        &self,
        req: &EnsureRequest,
        cancel: &Cancel,
    ) -> Result<(Snapshot, KeyGuard), CacheError> {
        let token = req.token.as_deref();
        if self.negative.contains(&req.repo, token) {
            return self.cached_only(req);
        }
        let branch = self.resolve_branch(req, cancel)?;
        let key = SnapshotKey::new(req.user.clone(), req.repo.clone(), branch.clone());

        let guard = self.lock(&key.lock_key())?;
        let artifact = L::artifact_path(&self.paths, &key);
        let remote_sha = self.remote_sha(&key, token, cancel)?;

        if artifact.exists() && !req.force {
            let recorded = sidecar::read_sha(&self.paths.sidecar(&key.user, &key.repo, &key.branch))?;
            let reuse = match (&remote_sha, &recorded) {
                (Some(remote), Some(local)) if remote == local => {
                    log::debug!("cache hit for {} at {}", key, local);
                    true
                }
                (None, _) => {
                    log::warn!("upstream unreachable, serving cached {}", key);
                    true
                }
                _ => false,
            };
            if reuse {
                staleness::touch(&artifact)?;
                let snapshot = Snapshot {
                    path: artifact,
                    branch,
                    commit: recorded,
                    downloaded: false,
                };
                return Ok((snapshot, guard));
            }
            log::info!("{} changed upstream, refreshing", key);
        }

        let commit = self.populate(&key, &artifact, remote_sha, token, cancel)?;
        self.negative.clear(&req.repo, token);
        let snapshot = Snapshot {
            path: artifact,
            branch,
            commit,
            downloaded: true,
        };
        Ok((snapshot, guard))
    }

    /// Serve an existing snapshot of a repo upstream recently reported missing
    /// to this caller, without asking upstream again.
    fn cached_only(&self, req: &EnsureRequest) -> Result<(Snapshot, KeyGuard), CacheError> {
        let missing = || CacheError::NotFound(req.repo.to_string());
        let Some(branch) = req.branch.clone().filter(|_| !req.force) else {
            return Err(missing());
        };
        let key = SnapshotKey::new(req.user.clone(), req.repo.clone(), branch.clone());
        let guard = self.lock(&key.lock_key())?;
        let artifact = L::artifact_path(&self.paths, &key);
        if !artifact.exists() {
            return Err(missing());
        }
        let commit = sidecar::read_sha(&self.paths.sidecar(&key.user, &key.repo, &key.branch))?;
        staleness::touch(&artifact)?;
        log::debug!("{} is unknown upstream, serving cached {}", req.repo, key);
        let snapshot = Snapshot {
            path: artifact,
            branch,
            commit,
            downloaded: false,
        };
        Ok((snapshot, guard))
    }

    fn namespace_root(&self, ns: &Namespace) -> PathBuf {
        match ns {
            Namespace::User(user) => self.paths.user_dir(user),
            Namespace::Mirrors => self.paths.git_cache_dir(),
        }
    }

    /// Lock key guarding the entry at `parts` (relative to the namespace root),
    /// if that entry is a snapshot artifact, a sidecar or a mirror.
    fn entry_lock_key(ns: &Namespace, parts: &[String], is_file: bool) -> Option<String> {
        match (ns, parts) {
            (Namespace::User(user), [repos, owner, repo, entry]) if repos == "repos" => {
                let stem = entry_stem::<L>(entry, is_file);
                Some(snapshot_lock_key(user.as_str(), owner, repo, stem))
            }
            (Namespace::Mirrors, [owner, repo]) => Some(format!(
                "mirror:{}/{}",
                owner,
                repo.strip_suffix(".git").unwrap_or(repo)
            )),
            _ => None,
        }
    }

    fn export_tree<F>(
        &self,
        req: &ExportRequest,
        cancel: &Cancel,
        write: F,
    ) -> Result<ExportSummary, CacheError>
    where
        F: FnOnce(&git2::Repository, &Branch, &[String]) -> Result<ExportSummary, CacheError>,
    {
        let prefixes = normalize_prefixes(&req.paths)?;
        let mirror = self.ensure_bare_repo(&req.repo, req.token.as_deref(), cancel)?;
        let repo = open_repository(&mirror)?;
        let branch = match &req.branch {
            Some(branch) => branch.clone(),
            None => {
                let (name, _) = resolve_default_branch(&repo)?;
                name.parse()?
            }
        };
        let summary = write(&repo, &branch, &prefixes)?;
        log::info!(
            "exported {} files of {}@{} ({})",
            summary.files,
            req.repo,
            branch,
            summary.commit
        );
        Ok(summary)
    }

    fn sweep_repo_dir(
        &self,
        user: &str,
        owner: &str,
        repo: &str,
        dir: &Path,
        ttl: Duration,
        stats: &mut SweepStats,
    ) -> io::Result<()> {
        for (name, path) in children(dir)? {
            if is_temp_name(&name) {
                if staleness::is_expired(&path, ttl) {
                    remove_entry(&path)?;
                    stats.temp_removed += 1;
                }
                continue;
            }
            let is_file = fs::symlink_metadata(&path)?.is_file();
            if let Some(stem) = sidecar_stem(&name, is_file) {
                // Orphaned sidecars go once nothing refers to them.
                let orphaned = !dir.join(stem).exists() && !dir.join(format!("{}.zip", stem)).exists();
                if orphaned && staleness::is_expired(&path, ttl) {
                    remove_entry(&path)?;
                }
                continue;
            }
            let Some(stem) = L::artifact_stem(&name) else {
                continue;
            };

            stats.scanned += 1;
            if !staleness::is_expired(&path, ttl) {
                continue;
            }
            let lock_key = snapshot_lock_key(user, owner, repo, stem);
            let Some(_guard) = self.locks.try_acquire(&lock_key) else {
                log::debug!("{} is busy, skipping", lock_key);
                stats.busy += 1;
                continue;
            };
            // A request may have touched it between the check and the lock.
            if !staleness::is_expired(&path, ttl) {
                continue;
            }
            remove_entry(&path)?;
            sidecar::remove_sha(&dir.join(format!("{}.sha", stem)))?;
            log::info!("evicted {}", path.display());
            stats.removed += 1;
        }
        Ok(())
    }
}

impl<L: SnapshotLayout> RepoStore for SnapshotStore<L> {
    fn layout(&self) -> Layout {
        L::LAYOUT
    }

    fn paths(&self) -> &CachePaths {
        &self.paths
    }

    fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn ensure_repo(&self, req: &EnsureRequest, cancel: &Cancel) -> Result<Snapshot, CacheError> {
        let (snapshot, _guard) = self.ensure_held(req, cancel)?;
        Ok(snapshot)
    }

    fn open_snapshot(
        &self,
        req: &EnsureRequest,
        cancel: &Cancel,
    ) -> Result<(Snapshot, File), CacheError> {
        let (snapshot, _guard) = self.ensure_held(req, cancel)?;
        let file = L::open(&snapshot.path, &self.paths.tmp_dir())?;
        Ok((snapshot, file))
    }

    fn ensure_bare_repo(
        &self,
        repo: &RepoKey,
        token: Option<&str>,
        cancel: &Cancel,
    ) -> Result<PathBuf, CacheError> {
        if self.negative.contains(repo, token) {
            return Err(CacheError::NotFound(repo.to_string()));
        }
        let remote = self.upstream.mirror_remote(repo, token);
        self.mirrors.ensure(repo, &remote, cancel)
    }

    fn export_sparse_zip(
        &self,
        req: &ExportRequest,
        dest: &Path,
        cancel: &Cancel,
    ) -> Result<ExportSummary, CacheError> {
        self.export_tree(req, cancel, |repo, branch, prefixes| {
            export::export_zip(repo, branch, prefixes, dest, cancel)
        })
    }

    fn export_sparse_dir(
        &self,
        req: &ExportRequest,
        dest: &Path,
        cancel: &Cancel,
    ) -> Result<ExportSummary, CacheError> {
        self.export_tree(req, cancel, |repo, branch, prefixes| {
            export::export_dir(repo, branch, prefixes, dest, cancel)
        })
    }

    fn list(&self, ns: &Namespace, rel: &str) -> Result<Vec<DirEntry>, CacheError> {
        let root = self.namespace_root(ns);
        let target = guard::resolve(&root, rel)?;
        let base = relative_parts(&root, &target).join("/");

        let meta = match fs::metadata(&target) {
            Ok(meta) => meta,
            // An untouched namespace is simply empty.
            Err(e) if e.kind() == io::ErrorKind::NotFound && target == root => {
                return Ok(Vec::new());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound(rel.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if !meta.is_dir() {
            let name = target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Ok(vec![DirEntry {
                name,
                path: base,
                is_dir: false,
                size: meta.len(),
            }]);
        }

        let mut entries = Vec::new();
        for (name, path) in children(&target)? {
            if is_temp_name(&name) {
                continue;
            }
            let meta = fs::metadata(&path)?;
            entries.push(DirEntry {
                path: if base.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", base, name)
                },
                name,
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
            });
        }
        Ok(entries)
    }

    fn delete(&self, ns: &Namespace, rel: &str, recursive: bool) -> Result<(), CacheError> {
        let root = self.namespace_root(ns);
        let target = guard::resolve(&root, rel)?;
        if target == root {
            return Err(CacheError::InvalidInput(
                "refusing to delete the namespace root".to_string(),
            ));
        }
        let meta = match fs::symlink_metadata(&target) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound(rel.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let parts = relative_parts(&root, &target);
        let is_file = meta.is_file();
        let _guard = match Self::entry_lock_key(ns, &parts, is_file) {
            Some(key) => Some(self.lock(&key)?),
            None => None,
        };

        if meta.is_dir() {
            if !recursive && fs::read_dir(&target)?.next().is_some() {
                return Err(CacheError::NotEmpty(rel.to_string()));
            }
            if recursive {
                fs::remove_dir_all(&target)?;
            } else {
                fs::remove_dir(&target)?;
            }
        } else {
            fs::remove_file(&target)?;
        }

        if let (Namespace::User(_), [_, _, _, entry]) = (ns, parts.as_slice()) {
            if sidecar_stem(entry, is_file).is_none() {
                let stem = entry_stem::<L>(entry, is_file);
                sidecar::remove_sha(&target.with_file_name(format!("{}.sha", stem)))?;
            }
        }
        if let Some(parent) = target.parent() {
            prune_empty_dirs(parent, &root);
        }
        log::info!("deleted {}", target.display());
        Ok(())
    }

    fn touch(&self, path: &Path) -> Result<(), CacheError> {
        if !path.starts_with(self.paths.root()) {
            return Err(CacheError::InvalidInput(format!(
                "{} is outside the cache",
                path.display()
            )));
        }
        staleness::touch(path)?;
        Ok(())
    }

    fn cleanup_expired(&self, ttl: Duration) -> Result<SweepStats, CacheError> {
        let users_dir = self.paths.users_dir();
        let mut stats = SweepStats::default();

        for (user, user_dir) in children(&users_dir)? {
            for (owner, owner_dir) in sweep_children(&user_dir.join("repos"), &mut stats) {
                for (repo, repo_dir) in sweep_children(&owner_dir, &mut stats) {
                    if let Err(e) =
                        self.sweep_repo_dir(&user, &owner, &repo, &repo_dir, ttl, &mut stats)
                    {
                        log::warn!("sweeping {} failed: {}", repo_dir.display(), e);
                        stats.errors += 1;
                    }
                    prune_empty_dirs(&repo_dir, &users_dir);
                }
            }
        }
        Ok(stats)
    }
}

/// Branch stem of a `<stem>.sha` sidecar. Sidecars are always regular files;
/// a directory with that suffix is a dir-layout snapshot of such a branch.
fn sidecar_stem(name: &str, is_file: bool) -> Option<&str> {
    if is_file { name.strip_suffix(".sha") } else { None }
}

/// Branch stem of a snapshot artifact or sidecar entry.
fn entry_stem<L: SnapshotLayout>(name: &str, is_file: bool) -> &str {
    sidecar_stem(name, is_file)
        .or_else(|| L::artifact_stem(name))
        .unwrap_or(name)
}

/// Validate that a downloaded archive is a readable zip and return the commit
/// recorded in its comment, if any.
fn inspect_archive(path: &Path) -> Result<Option<String>, CacheError> {
    let archive = zip::ZipArchive::new(File::open(path)?)
        .map_err(|e| CacheError::Integrity(e.to_string()))?;
    let comment = String::from_utf8_lossy(archive.comment());
    let comment = comment.trim();
    Ok(sidecar::is_commit_sha(comment).then(|| comment.to_ascii_lowercase()))
}

/// Sorted `(name, path)` pairs of a directory; a missing directory is empty.
fn children(dir: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        out.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }
    out.sort();
    Ok(out)
}

/// [`children`] for the sweep: a failure is logged and counted, not fatal.
fn sweep_children(dir: &Path, stats: &mut SweepStats) -> Vec<(String, PathBuf)> {
    children(dir).unwrap_or_else(|e| {
        log::warn!("skipping {}: {}", dir.display(), e);
        stats.errors += 1;
        Vec::new()
    })
}

fn relative_parts(root: &Path, target: &Path) -> Vec<String> {
    target
        .strip_prefix(root)
        .map(|rel| {
            rel.components()
                .filter_map(|c| match c {
                    Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn remove_entry(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Remove `start` and its ancestors while they are empty, stopping below `stop`.
fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut dir = start;
    while dir != stop && dir.starts_with(stop) {
        if fs::remove_dir(dir).is_err() {
            break;
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }
}
