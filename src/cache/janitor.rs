//! Background eviction of snapshots nobody has read within the TTL.
//!
//! Mirrors under `git-cache/` are never swept.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, select, tick};

use super::store::RepoStore;

pub struct Janitor {
    store: Arc<dyn RepoStore>,
    ttl: Duration,
    interval: Duration,
    shutdown: Receiver<()>,
}

impl Janitor {
    /// Spawn the janitor thread. It sweeps every `interval` until the returned
    /// handle is shut down or dropped.
    pub fn spawn(store: Arc<dyn RepoStore>, ttl: Duration, interval: Duration) -> JanitorHandle {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let janitor = Janitor {
            store,
            ttl,
            interval,
            shutdown: shutdown_rx,
        };

        let thread = thread::Builder::new()
            .name("ghmirror-janitor".to_string())
            .spawn(move || janitor.run())
            .expect("failed to spawn janitor thread");

        JanitorHandle {
            thread: Some(thread),
            shutdown: Some(shutdown_tx),
        }
    }

    fn run(self) {
        log::info!(
            "Janitor started (ttl {}s, every {}s)",
            self.ttl.as_secs(),
            self.interval.as_secs()
        );
        let ticker = tick(self.interval);

        loop {
            select! {
                recv(self.shutdown) -> _ => {
                    // A message or a dropped sender both mean stop.
                    log::info!("Janitor shutting down");
                    return;
                }
                recv(ticker) -> _ => self.sweep(),
            }
        }
    }

    fn sweep(&self) {
        match self.store.cleanup_expired(self.ttl) {
            Ok(stats) if stats.removed > 0 || stats.errors > 0 => log::info!(
                "Janitor removed {} of {} snapshots ({} busy, {} errors)",
                stats.removed,
                stats.scanned,
                stats.busy,
                stats.errors
            ),
            Ok(stats) => log::debug!("Janitor scanned {} snapshots", stats.scanned),
            Err(e) => log::warn!("Janitor sweep failed: {}", e),
        }
    }
}

/// Handle for stopping the janitor thread.
pub struct JanitorHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Option<Sender<()>>,
}

impl JanitorHandle {
    /// Signal shutdown and wait for the thread to exit. Safe to call again.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.try_send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for JanitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachePaths, EnsureRequest, StoreOptions, ZipStore};
    use crate::cancel::Cancel;
    use crate::testing::FakeUpstream;
    use crate::types::UserId;
    use crate::upstream::Upstream;
    use filetime::{FileTime, set_file_mtime};
    use std::path::{Path, PathBuf};
    use std::time::{Instant, SystemTime};
    use tempfile::tempdir;

    const SHA: &str = "cccccccccccccccccccccccccccccccccccccccc";

    fn store(root: &Path) -> Arc<dyn RepoStore> {
        let upstream: Arc<dyn Upstream> = Arc::new(FakeUpstream::new("main", SHA));
        Arc::new(ZipStore::new(CachePaths::new(root), upstream, StoreOptions::default()))
    }

    fn snapshot(store: &Arc<dyn RepoStore>, repo: &str) -> PathBuf {
        let req = EnsureRequest {
            user: UserId::sanitize(None, "default").unwrap(),
            repo: repo.parse().unwrap(),
            branch: None,
            token: None,
            force: false,
        };
        store.ensure_repo(&req, &Cancel::new()).unwrap().path
    }

    fn age(path: &Path, secs: u64) {
        let then = SystemTime::now() - Duration::from_secs(secs);
        set_file_mtime(path, FileTime::from_system_time(then)).unwrap();
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn evicts_expired_and_keeps_fresh() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let old = snapshot(&store, "octo/old");
        let fresh = snapshot(&store, "octo/fresh");
        let touched = snapshot(&store, "octo/touched");
        age(&old, 7200);
        age(&touched, 7200);
        store.touch(&touched).unwrap();

        let mut handle = Janitor::spawn(
            Arc::clone(&store),
            Duration::from_secs(3600),
            Duration::from_millis(20),
        );
        assert!(wait_for(|| !old.exists()));
        handle.shutdown();

        assert!(!old.with_file_name("main.sha").exists());
        assert!(!dir.path().join("users/default/repos/octo/old").exists());
        assert!(fresh.exists());
        assert!(touched.exists());
    }

    #[test]
    fn shutdown_is_prompt_and_idempotent() {
        let dir = tempdir().unwrap();
        let mut handle = Janitor::spawn(
            store(dir.path()),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        assert!(handle.is_running());

        let started = Instant::now();
        handle.shutdown();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!handle.is_running());

        handle.shutdown();
        drop(handle);
    }
}
