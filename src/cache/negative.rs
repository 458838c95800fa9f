//! Negative cache for tracking repositories that don't exist.
//!
//! Remembers repositories upstream answered 404 for, so repeated requests for
//! a typo'd or private repo fail fast instead of hitting GitHub every time.
//!
//! GitHub answers 404 for private repos the caller cannot see, so an entry
//! only applies to the credentials that got the 404.

use crate::types::RepoKey;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// Default TTL for negative cache entries (1 hour).
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Cache of repositories that are known not to exist.
///
/// Entries expire after `ttl` to allow retrying in case:
/// - A repo was created after we first tried
/// - A private repo was made public, or a token with access shows up
pub struct NegativeCache {
    entries: DashMap<(RepoKey, u64), Instant>,
    ttl: Duration,
}

impl Default for NegativeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NegativeCache {
    /// Create a new negative cache with the default TTL.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Check if a repo is in the negative cache for `token` (and not expired).
    pub fn contains(&self, key: &RepoKey, token: Option<&str>) -> bool {
        let entry_key = (key.clone(), identity(token));
        if let Some(entry) = self.entries.get(&entry_key) {
            if entry.elapsed() < self.ttl {
                return true;
            }
            // Entry expired, remove it
            drop(entry);
            self.entries.remove(&entry_key);
        }
        false
    }

    /// Remember that upstream reported `key` as missing to `token`.
    pub fn record_missing(&self, key: &RepoKey, token: Option<&str>) {
        log::info!("{} does not exist upstream, adding to negative cache", key);
        self.entries
            .insert((key.clone(), identity(token)), Instant::now());
    }

    /// Forget `key` for `token`, e.g. after it was fetched successfully.
    pub fn clear(&self, key: &RepoKey, token: Option<&str>) {
        self.entries.remove(&(key.clone(), identity(token)));
    }
}

/// Anonymous callers are 0; tokens are hashed so they are never kept in memory.
fn identity(token: Option<&str>) -> u64 {
    match token {
        None => 0,
        Some(token) => {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            hasher.finish() | 1
        }
    }
}
