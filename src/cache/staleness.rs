//! Access-time bookkeeping for cached artifacts.
//!
//! The janitor treats an artifact's mtime as its last access. Serving a
//! snapshot (hit or fresh download) calls [`touch`] so the TTL clock restarts.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use filetime::FileTime;

/// Reset the access clock of `path` (file or directory) to now.
pub fn touch(path: &Path) -> io::Result<()> {
    let now = FileTime::now();
    filetime::set_file_times(path, now, now)
}

/// Last recorded access of `path`.
pub fn last_access(path: &Path) -> io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}

/// True if `path` was last touched more than `ttl` ago.
///
/// Unreadable metadata is never treated as expired; the janitor only removes
/// what it can positively date.
pub fn is_expired(path: &Path, ttl: Duration) -> bool {
    let modified = match last_access(path) {
        Ok(t) => t,
        Err(_) => return false,
    };

    let threshold = SystemTime::now()
        .checked_sub(ttl)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    modified < threshold
}
