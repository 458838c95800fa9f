//! Atomic replace-on-commit for cache artifacts.
//!
//! Everything that lands in the cache is first written under a unique temp name
//! in the destination's own directory, then renamed over the final path. The
//! rename is the commit point: readers see either the old artifact or the new
//! one, never a partial write.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for unique temp file names within a process
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Marker that identifies our temp files (`.{name}.tmp.{pid}.{counter}`).
pub const TEMP_MARKER: &str = ".tmp.";

/// Returns a fresh sibling temp path for `final_path`.
///
/// Uses PID + atomic counter so concurrent writers never collide.
pub fn temp_path_for(final_path: &Path) -> PathBuf {
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let temp_name = format!(".{}{}{}.{}", name, TEMP_MARKER, std::process::id(), counter);
    match final_path.parent() {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    }
}

/// True if `name` looks like one of our temp files or staging directories.
pub fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

/// A file being written in place of `target`. Removed on drop unless persisted.
#[derive(Debug)]
pub struct StagedFile {
    file: Option<File>,
    path: PathBuf,
    target: PathBuf,
}

impl StagedFile {
    /// Create a new temp file next to `target`, creating parent dirs as needed.
    pub fn create(target: &Path) -> io::Result<Self> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        loop {
            let path = temp_path_for(target);
            // Retry if the temp path already exists (e.g., from a prior crash).
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    return Ok(Self {
                        file: Some(file),
                        path,
                        target: target.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("staged file already closed"))
    }

    /// Flush and close the handle, keeping the temp file on disk.
    pub fn finish(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Rename the temp file over the target.
    pub fn persist(mut self) -> io::Result<PathBuf> {
        self.finish()?;
        fs::rename(&self.path, &self.target)?;
        // Nothing left to clean up.
        self.path = PathBuf::new();
        Ok(self.target.clone())
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file_mut()?.flush()
    }
}

impl Seek for StagedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file_mut()?.seek(pos)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        self.file.take();
        if !self.path.as_os_str().is_empty() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Write `contents` to `target` through a temp file and rename.
pub fn write_atomic(target: &Path, contents: &[u8]) -> io::Result<()> {
    let mut staged = StagedFile::create(target)?;
    staged.write_all(contents)?;
    staged.persist()?;
    Ok(())
}

/// Replace the directory at `target` with the fully populated `staging` dir.
///
/// Directories cannot be renamed over non-empty directories, so the old tree is
/// first moved aside, then removed once the new tree is in place. If the final
/// rename fails the old tree is moved back.
pub fn replace_dir(staging: &Path, target: &Path) -> io::Result<()> {
    let aside = if target.exists() {
        let aside = temp_path_for(target);
        fs::rename(target, &aside)?;
        Some(aside)
    } else {
        None
    };

    if let Err(err) = fs::rename(staging, target) {
        if let Some(aside) = &aside {
            let _ = fs::rename(aside, target);
        }
        let _ = fs::remove_dir_all(staging);
        return Err(err);
    }

    if let Some(aside) = aside {
        if let Err(err) = fs::remove_dir_all(&aside) {
            log::warn!("failed to remove replaced tree {}: {}", aside.display(), err);
        }
    }
    Ok(())
}

/// Remove a staging directory when dropped, unless disarmed.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    armed: bool,
}

impl StagingDir {
    /// Create a fresh staging directory next to `target`.
    pub fn create(target: &Path) -> io::Result<Self> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        loop {
            let path = temp_path_for(target);
            match fs::create_dir(&path) {
                Ok(()) => return Ok(Self { path, armed: true }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the staged tree into place at `target`.
    pub fn commit(mut self, target: &Path) -> io::Result<()> {
        self.armed = false;
        replace_dir(&self.path, target)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}
