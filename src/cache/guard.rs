//! Path Guard: every user-supplied path and every archive entry goes through
//! here before it touches the filesystem.

use std::fs::{self, File};
use std::io::{self, Read, Seek};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use super::swap::StagingDir;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("path escapes the cache root: {0:?}")]
    BadPath(String),
    #[error("illegal archive entry: {0:?}")]
    IllegalPath(String),
    #[error("malformed archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Resolve `rel` against `root`.
///
/// `.` and `..` are collapsed lexically; the result is `root` itself or a path
/// strictly below it. Absolute paths, NUL bytes and backslashes are rejected.
pub fn resolve(root: &Path, rel: &str) -> Result<PathBuf, GuardError> {
    let bad = || GuardError::BadPath(rel.to_string());
    if rel.contains('\0') || rel.contains('\\') {
        return Err(bad());
    }

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(rel).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(bad());
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return Err(bad()),
        }
    }
    Ok(resolved)
}

/// Destination of archive entry `name` when extracting into `dest`.
///
/// `dest` must exist. Besides the lexical check, the deepest existing ancestor
/// of the destination is canonicalized and compared against the canonical
/// `dest`, so a symlink already inside `dest` cannot redirect the write.
pub fn entry_destination(dest: &Path, name: &str) -> Result<PathBuf, GuardError> {
    let dest_canon = dest.canonicalize()?;
    contained_destination(&dest_canon, name)
}

pub(crate) fn contained_destination(dest_canon: &Path, name: &str) -> Result<PathBuf, GuardError> {
    let illegal = || GuardError::IllegalPath(name.to_string());
    if name.is_empty() || name.contains('\0') {
        return Err(illegal());
    }

    // Archives written on Windows may use backslashes.
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(illegal());
    }

    let mut out = dest_canon.to_path_buf();
    let mut depth = 0usize;
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if depth == 0 {
                    return Err(illegal());
                }
                out.pop();
                depth -= 1;
            }
            part => {
                // Drive prefixes like `C:` would make the join absolute.
                if Path::new(part).components().count() != 1
                    || !matches!(Path::new(part).components().next(), Some(Component::Normal(_)))
                {
                    return Err(illegal());
                }
                out.push(part);
                depth += 1;
            }
        }
    }

    let mut anchor = out.as_path();
    while !anchor.exists() {
        match anchor.parent() {
            Some(parent) => anchor = parent,
            None => return Err(illegal()),
        }
    }
    if !anchor.canonicalize()?.starts_with(dest_canon) {
        return Err(illegal());
    }
    Ok(out)
}

struct PlannedEntry {
    index: usize,
    path: PathBuf,
    is_dir: bool,
    mode: Option<u32>,
}

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Extract `archive` into `dest`, all or nothing.
///
/// Every entry is validated before anything is written. Extraction happens in
/// a staging directory next to `dest` that replaces `dest` only once every
/// entry has been written. With `strip_top_level` the first path component of
/// each entry is dropped (GitHub archives wrap everything in `<repo>-<ref>/`).
/// Symlink entries are skipped. Returns the number of files written.
pub fn extract_zip<R: Read + Seek>(
    archive: R,
    dest: &Path,
    strip_top_level: bool,
) -> Result<usize, GuardError> {
    let mut zip = zip::ZipArchive::new(archive)?;
    let staging = StagingDir::create(dest)?;
    let staging_canon = staging.path().canonicalize()?;

    let mut plan = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let entry = zip.by_index_raw(index)?;
        let raw_name = entry.name().to_string();
        contained_destination(&staging_canon, &raw_name)?;

        let name = if strip_top_level {
            match raw_name.split_once('/') {
                Some((_, rest)) => rest.to_string(),
                None => raw_name.clone(),
            }
        } else {
            raw_name.clone()
        };
        if name.is_empty() {
            continue;
        }

        let mode = entry.unix_mode();
        if matches!(mode, Some(m) if m & S_IFMT == S_IFLNK) {
            log::debug!("skipping symlink entry {}", raw_name);
            continue;
        }

        plan.push(PlannedEntry {
            index,
            path: contained_destination(&staging_canon, &name)?,
            is_dir: entry.is_dir(),
            mode,
        });
    }

    let mut files = 0;
    for planned in plan {
        if planned.is_dir {
            fs::create_dir_all(&planned.path)?;
            continue;
        }
        if let Some(parent) = planned.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut entry = zip.by_index(planned.index)?;
        let mut out = File::create(&planned.path)?;
        io::copy(&mut entry, &mut out)?;
        set_mode(&planned.path, planned.mode)?;
        files += 1;
    }

    staging.commit(dest)?;
    Ok(files)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode {
        if mode & 0o111 != 0 {
            fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}
