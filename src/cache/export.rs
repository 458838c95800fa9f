//! Tree exports straight from a bare mirror's object store.
//!
//! Nothing is checked out: the branch's tree is walked with libgit2, pruned to
//! the requested path prefixes, and each blob is streamed into a zip or written
//! under a staging directory.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use git2::{ObjectType, Repository, Tree};
use serde::Serialize;
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use super::git::resolve_branch_commit;
use super::guard::{self, contained_destination};
use super::swap::{StagedFile, StagingDir};
use super::CacheError;
use crate::cancel::Cancel;
use crate::types::Branch;

const MODE_EXECUTABLE: i32 = 0o100755;
const MODE_SYMLINK: i32 = 0o120000;
const MODE_SUBMODULE: i32 = 0o160000;

/// What an export produced.
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub branch: String,
    pub commit: String,
    pub files: usize,
    pub bytes: u64,
}

/// Clean user-supplied path prefixes.
///
/// Prefixes are resolved lexically like any other user path, so `..` escapes
/// are rejected before any I/O. An empty list, or any prefix naming the root
/// (`""`, `.`), selects everything and yields an empty list.
pub fn normalize_prefixes(paths: &[String]) -> Result<Vec<String>, CacheError> {
    let mut prefixes = Vec::with_capacity(paths.len());
    for raw in paths {
        let raw = raw.trim();
        let cleaned = guard::resolve(Path::new(""), raw)?;
        let cleaned = cleaned
            .to_str()
            .ok_or_else(|| CacheError::InvalidInput(format!("path {:?} is not UTF-8", raw)))?
            .to_string();
        if cleaned.is_empty() {
            return Ok(Vec::new());
        }
        prefixes.push(cleaned);
    }
    prefixes.sort();
    prefixes.dedup();
    Ok(prefixes)
}

fn selected(path: &str, prefixes: &[String]) -> bool {
    prefixes.is_empty()
        || prefixes.iter().any(|p| {
            path == p || (path.starts_with(p.as_str()) && path.as_bytes().get(p.len()) == Some(&b'/'))
        })
}

fn leads_to_selection(dir: &str, prefixes: &[String]) -> bool {
    prefixes
        .iter()
        .any(|p| p.starts_with(dir) && p.as_bytes().get(dir.len()) == Some(&b'/'))
}

/// Walk `tree`, calling `visit(path, filemode, contents)` for every selected blob.
fn walk(
    repo: &Repository,
    tree: &Tree<'_>,
    base: &str,
    prefixes: &[String],
    cancel: &Cancel,
    visit: &mut dyn FnMut(&str, i32, &[u8]) -> Result<(), CacheError>,
) -> Result<(), CacheError> {
    for entry in tree.iter() {
        cancel.check()?;
        let Some(name) = entry.name() else {
            log::warn!("skipping non UTF-8 tree entry under {:?}", base);
            continue;
        };
        let path = if base.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", base, name)
        };

        match (entry.kind(), entry.filemode()) {
            (_, MODE_SUBMODULE) | (Some(ObjectType::Commit), _) => {
                log::debug!("omitting submodule {}", path);
            }
            (Some(ObjectType::Tree), _) => {
                if selected(&path, prefixes) {
                    let subtree = repo.find_tree(entry.id())?;
                    walk(repo, &subtree, &path, &[], cancel, visit)?;
                } else if leads_to_selection(&path, prefixes) {
                    let subtree = repo.find_tree(entry.id())?;
                    walk(repo, &subtree, &path, prefixes, cancel, visit)?;
                }
            }
            (Some(ObjectType::Blob), MODE_SYMLINK) => {
                log::debug!("omitting symlink {}", path);
            }
            (Some(ObjectType::Blob), mode) => {
                if selected(&path, prefixes) {
                    let blob = repo.find_blob(entry.id())?;
                    visit(&path, mode, blob.content())?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn branch_tree<'r>(
    repo: &'r Repository,
    branch: &Branch,
) -> Result<(String, Tree<'r>), CacheError> {
    let oid = resolve_branch_commit(repo, branch)?;
    let tree = repo.find_commit(oid)?.tree()?;
    Ok((oid.to_string(), tree))
}

fn nothing_matched(prefixes: &[String], files: usize) -> Result<(), CacheError> {
    if files == 0 && !prefixes.is_empty() {
        return Err(CacheError::NotFound(format!(
            "no files under {}",
            prefixes.join(", ")
        )));
    }
    Ok(())
}

/// Write the selected part of `branch` to a zip at `dest`.
///
/// The archive comment carries the commit SHA, like GitHub's own archives.
pub fn export_zip(
    repo: &Repository,
    branch: &Branch,
    prefixes: &[String],
    dest: &Path,
    cancel: &Cancel,
) -> Result<ExportSummary, CacheError> {
    let (commit, tree) = branch_tree(repo, branch)?;
    let mut writer = zip::ZipWriter::new(StagedFile::create(dest)?);
    let mut files = 0;
    let mut bytes = 0u64;

    walk(repo, &tree, "", prefixes, cancel, &mut |path, mode, contents| {
        let permissions = if mode == MODE_EXECUTABLE { 0o755 } else { 0o644 };
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(permissions)
            .large_file(contents.len() as u64 >= u32::MAX as u64);
        writer.start_file(path, options)?;
        writer.write_all(contents)?;
        files += 1;
        bytes += contents.len() as u64;
        Ok(())
    })?;
    nothing_matched(prefixes, files)?;

    writer.set_comment(commit.clone());
    writer.finish()?.persist()?;

    Ok(ExportSummary {
        branch: branch.to_string(),
        commit,
        files,
        bytes,
    })
}

/// Write the selected part of `branch` as a directory tree at `dest`.
///
/// `dest` must be absent or an empty directory. The tree is assembled in a
/// staging directory and moved into place only when complete.
pub fn export_dir(
    repo: &Repository,
    branch: &Branch,
    prefixes: &[String],
    dest: &Path,
    cancel: &Cancel,
) -> Result<ExportSummary, CacheError> {
    if dest.exists() {
        let empty_dir = dest.is_dir() && fs::read_dir(dest)?.next().is_none();
        if !empty_dir {
            return Err(CacheError::NotEmpty(dest.display().to_string()));
        }
    }

    let (commit, tree) = branch_tree(repo, branch)?;
    let staging = StagingDir::create(dest)?;
    let staging_canon = staging.path().canonicalize()?;
    let mut files = 0;
    let mut bytes = 0u64;

    walk(repo, &tree, "", prefixes, cancel, &mut |path, mode, contents| {
        let target = contained_destination(&staging_canon, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(&target)?.write_all(contents)?;
        if mode == MODE_EXECUTABLE {
            make_executable(&target)?;
        }
        files += 1;
        bytes += contents.len() as u64;
        Ok(())
    })?;
    nothing_matched(prefixes, files)?;

    staging.commit(dest)?;

    Ok(ExportSummary {
        branch: branch.to_string(),
        commit,
        files,
        bytes,
    })
}

/// Zip the contents of `src` into `dest`. Symlinks are skipped.
pub fn zip_directory(src: &Path, dest: &Path) -> Result<usize, CacheError> {
    let mut writer = zip::ZipWriter::new(StagedFile::create(dest)?);
    let mut files = 0;
    let mut stack = vec![(src.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = stack.pop() {
        let mut entries = fs::read_dir(&dir)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push((entry.path(), path));
            } else if file_type.is_file() {
                let options = SimpleFileOptions::default()
                    .compression_method(CompressionMethod::Deflated)
                    .unix_permissions(file_permissions(&entry.metadata()?))
                    .large_file(entry.metadata()?.len() >= u32::MAX as u64);
                writer.start_file(path, options)?;
                io::copy(&mut File::open(entry.path())?, &mut writer)?;
                files += 1;
            }
        }
    }

    writer.finish()?.persist()?;
    Ok(files)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn file_permissions(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_permissions(_metadata: &fs::Metadata) -> u32 {
    0o644
}
