//! On-disk artifact layout
//!
//! | File | Path | Lifetime |
//! |------|------|----------|
//! | Source | `<root>/<key>.duck` | kept across evictions |
//! | Audio / image | `<render_dir>/<key>.<ext>` | until disk eviction |
//! | Executable | `<scratch_dir>/duck-exe-<key>-<uuid>` | one compile+render cycle |
//!
//! Everything that becomes visible at a stable path is first written under a
//! unique name in the same directory and then renamed into place.

use crate::config::Config;
use crate::error::{DuckError, DuckResult};
use crate::identity::CacheKey;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Kinds of rendered artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Audio,
    Image,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Image => write!(f, "image"),
        }
    }
}

/// A transient file removed when the guard is dropped
///
/// Removal is best-effort and also covers the case where the file was never
/// created or has already been renamed away.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the file executable by its owner only
    pub async fn make_executable(&self) -> DuckResult<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            fs::set_permissions(&self.path, perms).await.map_err(|e| {
                DuckError::disk(format!("setting permissions on {}", self.path.display()), e)
            })?;
        }
        Ok(())
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        remove(&self.path);
    }
}

/// Best-effort delete; a missing file is not an error
pub fn remove(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("Could not remove {}: {}", path.display(), e),
    }
}

/// Maps cache keys to source, render and scratch paths
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    source_dir: PathBuf,
    render_dir: PathBuf,
    scratch_dir: PathBuf,
    audio_format: String,
}

impl ArtifactStore {
    pub fn new(
        source_dir: PathBuf,
        render_dir: PathBuf,
        scratch_dir: PathBuf,
        audio_format: impl Into<String>,
    ) -> Self {
        Self {
            source_dir,
            render_dir,
            scratch_dir,
            audio_format: audio_format.into(),
        }
    }

    /// Build the store from the `[storage]` and `[tools]` sections
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.storage_root(),
            config.render_dir(),
            config.scratch_dir(),
            config.tools.audio_format.clone(),
        )
    }

    /// Create every directory the store writes into
    pub async fn ensure_dirs(&self) -> DuckResult<()> {
        for dir in [&self.source_dir, &self.render_dir, &self.scratch_dir] {
            fs::create_dir_all(dir).await.map_err(|e| {
                DuckError::disk(format!("creating directory {}", dir.display()), e)
            })?;
        }
        Ok(())
    }

    pub fn source_path(&self, key: &CacheKey) -> PathBuf {
        self.source_dir.join(format!("{}.duck", key))
    }

    /// Persist source text atomically at its stable path
    pub async fn write_source(&self, key: &CacheKey, source: &[u8]) -> DuckResult<PathBuf> {
        let path = self.source_path(key);
        let staging = ScratchFile {
            path: self
                .source_dir
                .join(format!(".{}.{}.tmp", key, Uuid::new_v4().simple())),
        };

        fs::write(staging.path(), source).await.map_err(|e| {
            DuckError::disk(format!("writing source {}", staging.path().display()), e)
        })?;
        fs::rename(staging.path(), &path).await.map_err(|e| {
            DuckError::disk(format!("renaming source into {}", path.display()), e)
        })?;

        debug!("Wrote source {}", path.display());
        Ok(path)
    }

    /// Whether the persisted source exists
    pub async fn source_exists(&self, key: &CacheKey) -> DuckResult<bool> {
        let path = self.source_path(key);
        fs::try_exists(&path)
            .await
            .map_err(|e| DuckError::disk(format!("probing source {}", path.display()), e))
    }

    /// Reserve a process-unique path for a compiled executable
    pub fn scratch_executable(&self, key: &CacheKey) -> ScratchFile {
        ScratchFile {
            path: self
                .scratch_dir
                .join(format!("duck-exe-{}-{}", key, Uuid::new_v4().simple())),
        }
    }

    fn extension(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::Audio => &self.audio_format,
            ArtifactKind::Image => "png",
        }
    }

    /// Stable path of a rendered artifact
    pub fn render_path(&self, key: &CacheKey, kind: ArtifactKind) -> PathBuf {
        self.render_dir
            .join(format!("{}.{}", key, self.extension(kind)))
    }

    /// Reserve a unique staging path for a render; keeps the format extension
    pub fn staging_render(&self, key: &CacheKey, kind: ArtifactKind) -> ScratchFile {
        ScratchFile {
            path: self.render_dir.join(format!(
                ".{}-{}.{}",
                key,
                Uuid::new_v4().simple(),
                self.extension(kind)
            )),
        }
    }

    /// Move a finished render to its stable path and make it world-readable
    pub async fn commit_render(
        &self,
        staging: ScratchFile,
        key: &CacheKey,
        kind: ArtifactKind,
    ) -> DuckResult<PathBuf> {
        let path = self.render_path(key, kind);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o644);
            fs::set_permissions(staging.path(), perms).await.map_err(|e| {
                DuckError::disk(format!("setting permissions on {}", staging.path().display()), e)
            })?;
        }

        fs::rename(staging.path(), &path).await.map_err(|e| {
            DuckError::disk(format!("renaming {} into {}", kind, path.display()), e)
        })?;

        Ok(path)
    }

    /// Whether a previously recorded artifact is still on disk
    pub async fn artifact_exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Best-effort delete of an artifact
    pub fn remove(&self, path: &Path) {
        remove(path);
    }
}
