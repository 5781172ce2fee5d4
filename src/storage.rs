use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use tokio::fs;
use tracing::info;

use crate::error::StorageError;

/// `2024-01-02-03-04-05`: wall-clock time at second granularity.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    RawRequest,
    File { extension: String },
}

/// Source of the wall-clock time used to name artifacts.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// `<timestamp>.bin` for raw requests, `<timestamp>-image.<ext>` for files.
/// Names only differ across seconds; a second artifact of the same kind in
/// the same second replaces the first.
pub fn artifact_name(now: &NaiveDateTime, kind: &ArtifactKind) -> String {
    let stamp = now.format(TIMESTAMP_FORMAT);
    match kind {
        ArtifactKind::RawRequest => format!("{stamp}.bin"),
        ArtifactKind::File { extension } => format!("{stamp}-image.{extension}"),
    }
}

#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Writes `bytes` as a new artifact and returns the path written.
    async fn store(&self, bytes: &[u8], kind: &ArtifactKind) -> Result<PathBuf, StorageError>;
}

/// Flat directory of timestamp-named files. The directory is created on
/// first use.
#[derive(Clone)]
pub struct DirectorySink {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl DirectorySink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self::with_clock(dir, Arc::new(SystemClock))
    }

    pub fn with_clock<P: AsRef<Path>>(dir: P, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            clock,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: self.dir.clone(),
                source,
            })
    }
}

#[async_trait]
impl ArtifactSink for DirectorySink {
    async fn store(&self, bytes: &[u8], kind: &ArtifactKind) -> Result<PathBuf, StorageError> {
        self.ensure_dir().await?;

        let path = self.dir.join(artifact_name(&self.clock.now(), kind));
        fs::write(&path, bytes)
            .await
            .map_err(|source| StorageError::Write {
                path: path.clone(),
                source,
            })?;

        info!(path = %path.display(), len = bytes.len(), "saved artifact");
        Ok(path)
    }
}

impl std::fmt::Debug for DirectorySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectorySink")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}
