//! `<branch>.sha` files recording the commit a snapshot was built from.

use std::fs;
use std::io;
use std::path::Path;

use super::swap::write_atomic;

/// Read the recorded commit. Missing or malformed sidecars read as `None`.
pub fn read_sha(path: &Path) -> io::Result<Option<String>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let sha = contents.trim();
    if is_commit_sha(sha) {
        Ok(Some(sha.to_ascii_lowercase()))
    } else {
        log::warn!("ignoring malformed sidecar {}", path.display());
        Ok(None)
    }
}

pub fn write_sha(path: &Path, sha: &str) -> io::Result<()> {
    write_atomic(path, format!("{}\n", sha).as_bytes())
}

pub fn remove_sha(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// A full 40-character hex object id.
pub fn is_commit_sha(value: &str) -> bool {
    value.len() == 40 && value.bytes().all(|b| b.is_ascii_hexdigit())
}
