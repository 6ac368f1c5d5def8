//! Local, content-addressed cache of registry artifacts.
//!
//! Layout:
//!
//! ```text
//! <cache_dir>/
//!   v1/
//!     .lock                          advisory lock shared by all processes
//!     .fetch-XXXXXX/                 in-progress download (never looked up)
//!     fabricator_k3s-airgap@v1.31.1/ complete entry
//! ```
//!
//! An entry is either absent or complete: downloads go into a temporary
//! directory inside the cache root and are renamed into place only after the
//! registry reported success. Once present, an entry is never modified.

pub mod cancel;
pub mod credentials;
pub mod reference;
pub mod registry;

pub use cancel::Cancel;
pub use reference::ArtifactRef;
pub use registry::{OciRegistry, Registry};

use crate::error::{ConfigError, IntegrityError};
use crate::fsutil;
use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Bumped whenever the entry layout changes; old entries are simply ignored.
pub const CACHE_SCHEMA: &str = "v1";

const LOCK_FILE: &str = ".lock";
const FETCH_PREFIX: &str = ".fetch-";

/// A file or directory to copy out of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSelector {
    /// Path relative to the entry root.
    pub path: String,
    /// Destination name; defaults to the last component of `path`.
    pub dest: Option<String>,
    /// Mode override applied to the copied item.
    pub mode: Option<u32>,
}

impl FileSelector {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            dest: None,
            mode: None,
        }
    }

    /// A file that must be executable after copying.
    pub fn exec(path: impl Into<String>) -> Self {
        Self::file(path).mode(0o755)
    }

    pub fn to(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    fn dest_name(&self) -> &str {
        match &self.dest {
            Some(dest) => dest,
            None => self.path.rsplit('/').next().unwrap_or(&self.path),
        }
    }
}

/// Artifact cache bound to one registry.
///
/// All lookups and downloads are serialized by an in-process mutex and an
/// advisory file lock on the cache root, so the same entry is never fetched
/// twice concurrently, whether by threads or by processes.
pub struct ArtifactCache {
    root: PathBuf,
    registry: Arc<dyn Registry>,
    lock: Mutex<()>,
}

impl ArtifactCache {
    /// Open (and create if needed) the cache under `cache_dir`.
    pub fn new(cache_dir: &Path, registry: Arc<dyn Registry>) -> Result<Self> {
        let root = cache_dir.join(CACHE_SCHEMA);
        match fs::metadata(&root) {
            Ok(md) if !md.is_dir() => {
                return Err(ConfigError::CacheNotDirectory(root.display().to_string()).into())
            }
            Ok(_) => {}
            Err(_) => fs::create_dir_all(&root)
                .with_context(|| format!("Failed to create cache dir {}", root.display()))?,
        }
        Ok(Self {
            root,
            registry,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, artifact: &ArtifactRef) -> PathBuf {
        self.root.join(artifact.path_segment())
    }

    /// Return the local directory of `artifact`, downloading it first if
    /// it is not cached yet.
    pub fn fetch(&self, artifact: &ArtifactRef, cancel: &Cancel) -> Result<PathBuf> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("artifact cache lock poisoned"))?;
        let _file_lock = self.lock_root()?;

        let path = self.entry_path(artifact);
        match fs::symlink_metadata(&path) {
            Ok(md) if md.is_dir() => {
                debug!("Cache hit for {artifact}");
                return Ok(path);
            }
            Ok(_) => {
                return Err(ConfigError::CacheNotDirectory(path.display().to_string()).into())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", path.display())),
        }

        cancel.check()?;
        self.sweep_stale_fetches()?;
        info!("Fetching {artifact}");
        // Dropping the TempDir on any early return discards partial data.
        let tmp = tempfile::Builder::new()
            .prefix(FETCH_PREFIX)
            .tempdir_in(&self.root)
            .with_context(|| format!("Failed to create temp dir in {}", self.root.display()))?;

        self.registry
            .pull(artifact, tmp.path(), cancel)
            .with_context(|| format!("Failed to fetch {artifact}"))?;
        cancel.check()?;

        fsutil::set_mode(tmp.path(), 0o755)?;
        fsutil::commit(tmp.path(), &path)
            .with_context(|| format!("Failed to publish cache entry for {artifact}"))?;
        Ok(path)
    }

    /// Copy selected files of `artifact` into `dest`.
    pub fn copy_into(
        &self,
        dest: &Path,
        artifact: &ArtifactRef,
        selectors: &[FileSelector],
        cancel: &Cancel,
    ) -> Result<()> {
        let entry = self.fetch(artifact, cancel)?;
        fs::create_dir_all(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        for selector in selectors {
            let src = entry.join(&selector.path);
            let md = fs::metadata(&src).map_err(|_| IntegrityError::MissingArtifactFile {
                artifact: artifact.to_string(),
                file: selector.path.clone(),
            })?;
            let dst = dest.join(selector.dest_name());
            if md.is_dir() {
                fsutil::copy_dir_recursive(&src, &dst)?;
            } else {
                fs::copy(&src, &dst).with_context(|| {
                    format!("Failed to copy {} from {artifact}", selector.path)
                })?;
            }
            if let Some(mode) = selector.mode {
                fsutil::set_mode(&dst, mode)?;
            }
            debug!("Copied {}:{} to {}", artifact, selector.path, dst.display());
        }
        Ok(())
    }

    /// Remove temp dirs of fetches that never finished. Only callable with
    /// both locks held: no live fetch can own one then.
    fn sweep_stale_fetches(&self) -> Result<()> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read {}", self.root.display()))?;
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(FETCH_PREFIX) {
                warn!("Removing abandoned fetch {}", entry.path().display());
                fsutil::remove_path(&entry.path())?;
            }
        }
        Ok(())
    }

    fn lock_root(&self) -> Result<File> {
        let lock_path = self.root.join(LOCK_FILE);
        // Never unlink the lock file: another process may hold a lock on it.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", lock_path.display()))?;
        Ok(file)
    }
}
