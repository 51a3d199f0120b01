//! Blob store seam: listing, reads, writes and deletes for one-block files
//! and merged bundles, with a plain-directory implementation.

use anyhow::{Context, Result, bail};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Flat blob store holding one-block files or merged bundles.
///
/// Implementations must be safe to call from several threads; the deletion
/// worker pool drives `delete` in parallel.
pub trait BlockStore: Send + Sync {
    /// Up to `max` object names, oldest name first. Objects whose last write
    /// is younger than `leeway` are skipped since their writer may still be
    /// uploading.
    fn list(&self, max: usize, leeway: Duration) -> Result<Vec<String>>;

    fn read(&self, name: &str) -> Result<Vec<u8>>;

    fn put(&self, name: &str, data: &[u8]) -> Result<()>;

    fn delete(&self, name: &str) -> Result<()>;

    fn exists(&self, name: &str) -> Result<bool>;
}

/// [`BlockStore`] over a single local directory.
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating store directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        // Object names are flat; anything path-like is refused rather than
        // silently escaping the store directory.
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            bail!("invalid object name {name:?}");
        }
        Ok(self.dir.join(name))
    }
}

impl BlockStore for FsStore {
    fn list(&self, max: usize, leeway: Duration) -> Result<Vec<String>> {
        let now = SystemTime::now();
        let mut names = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("listing store directory {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.ends_with(".tmp") {
                continue;
            }
            if let Ok(modified) = entry.metadata()?.modified()
                && now.duration_since(modified).unwrap_or_default() < leeway
            {
                continue;
            }
            names.push(name);
        }
        names.sort();
        names.truncate(max);
        Ok(names)
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.object_path(name)?;
        fs::read(&path).with_context(|| format!("reading {}", path.display()))
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.object_path(name)?;
        // Appended, not with_extension: object names may contain dots.
        let tmp = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.object_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            // A replica may have been deleted by an earlier batch already.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting {}", path.display())),
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.object_path(name)?.exists())
    }
}
