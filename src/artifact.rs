//! On-disk artifact cache.
//!
//! Finished artifacts live directly under the download directory as
//! `{id}.{ext}`. Fetch attempts never write there: they write into
//! `.staging/{id}/` and the first valid output is renamed into place once the
//! fetcher has exited. A reader therefore only ever sees complete files.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::security::{ContentId, is_valid_content_id};

/// Audio containers yt-dlp may produce, in lookup order.
pub const AUDIO_EXTENSIONS: &[&str] = &["m4a", "mp3", "webm", "opus", "ogg", "aac"];

const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub content_id: ContentId,
    pub path: PathBuf,
    pub size: u64,
}

impl CachedArtifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.content_id.to_string())
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|ext| ext.to_str())
    }
}

/// Counters returned by a single eviction pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub undersized: usize,
    pub stale_staging: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.expired + self.undersized + self.stale_staging
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    min_size: u64,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, min_size: u64) -> Self {
        Self {
            root: root.into(),
            min_size,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn min_size(&self) -> u64 {
        self.min_size
    }

    /// Creates the download and staging directories.
    pub fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(self.root.join(STAGING_DIR))
    }

    pub fn artifact_path(&self, id: &ContentId, ext: &str) -> PathBuf {
        self.root.join(format!("{id}.{ext}"))
    }

    pub fn staging_dir(&self, id: &ContentId) -> PathBuf {
        self.root.join(STAGING_DIR).join(id.as_str())
    }

    /// Returns the first artifact for `id` that passes the size check.
    /// Undersized matches are deleted on the way.
    pub fn find_valid(&self, id: &ContentId) -> io::Result<Option<CachedArtifact>> {
        for ext in AUDIO_EXTENSIONS {
            let path = self.artifact_path(id, ext);
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            if !meta.is_file() {
                continue;
            }
            if meta.len() >= self.min_size {
                return Ok(Some(CachedArtifact {
                    content_id: id.clone(),
                    path,
                    size: meta.len(),
                }));
            }
            warn!(
                id = %id,
                size = meta.len(),
                min = self.min_size,
                "removing undersized artifact {}",
                path.display()
            );
            remove_file_quietly(&path);
        }
        Ok(None)
    }

    /// True when the artifact is still on disk and still passes the size
    /// check.
    pub fn is_valid(&self, artifact: &CachedArtifact) -> bool {
        fs::metadata(&artifact.path)
            .map(|meta| meta.is_file() && meta.len() >= self.min_size)
            .unwrap_or(false)
    }

    /// Wipes and recreates the staging directory for one attempt.
    pub fn reset_staging(&self, id: &ContentId) -> io::Result<PathBuf> {
        let dir = self.staging_dir(id);
        self.discard_staging(id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn discard_staging(&self, id: &ContentId) {
        let dir = self.staging_dir(id);
        if let Err(err) = fs::remove_dir_all(&dir)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(id = %id, "could not clear staging dir {}: {err}", dir.display());
        }
    }

    /// Moves the first valid output of a finished attempt into the cache.
    /// The staging directory is removed whether or not anything qualified.
    pub fn promote(&self, id: &ContentId) -> io::Result<Option<CachedArtifact>> {
        let staging = self.staging_dir(id);
        let result = self.promote_from(id, &staging);
        self.discard_staging(id);
        result
    }

    fn promote_from(&self, id: &ContentId, staging: &Path) -> io::Result<Option<CachedArtifact>> {
        for ext in AUDIO_EXTENSIONS {
            let candidate = staging.join(format!("{id}.{ext}"));
            let Ok(meta) = fs::metadata(&candidate) else {
                continue;
            };
            if !meta.is_file() || meta.len() < self.min_size {
                debug!(id = %id, size = meta.len(), "discarding undersized output .{ext}");
                continue;
            }
            let target = self.artifact_path(id, ext);
            fs::rename(&candidate, &target)?;
            // Retention counts from the moment the file entered the cache.
            if let Err(err) = fs::File::options()
                .write(true)
                .open(&target)
                .and_then(|file| file.set_modified(SystemTime::now()))
            {
                warn!(id = %id, "could not refresh mtime of {}: {err}", target.display());
            }
            return Ok(Some(CachedArtifact {
                content_id: id.clone(),
                path: target,
                size: meta.len(),
            }));
        }
        Ok(None)
    }

    /// Removes expired or undersized artifacts and abandoned staging
    /// directories. `is_busy` marks ids whose fetch is still running; their
    /// staging directory is left alone.
    pub fn sweep(
        &self,
        now: SystemTime,
        retention: Duration,
        is_busy: impl Fn(&str) -> bool,
    ) -> SweepReport {
        let mut report = SweepReport::default();

        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("sweep could not read entry: {err}");
                    report.errors += 1;
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() || !is_artifact_name(path) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    debug!("artifact vanished before sweep: {err}");
                    report.errors += 1;
                    continue;
                }
            };
            let age = age_of(&meta, now);
            let reason = if age > retention {
                Some("expired")
            } else if meta.len() < self.min_size {
                Some("undersized")
            } else {
                None
            };
            let Some(reason) = reason else {
                continue;
            };
            match fs::remove_file(path) {
                Ok(()) => {
                    debug!(reason, "evicted {}", path.display());
                    if reason == "expired" {
                        report.expired += 1;
                    } else {
                        report.undersized += 1;
                    }
                }
                Err(err) => {
                    warn!("could not evict {}: {err}", path.display());
                    report.errors += 1;
                }
            }
        }

        self.sweep_staging(now, retention, &is_busy, &mut report);
        report
    }

    fn sweep_staging(
        &self,
        now: SystemTime,
        retention: Duration,
        is_busy: &impl Fn(&str) -> bool,
        report: &mut SweepReport,
    ) {
        let staging_root = self.root.join(STAGING_DIR);
        for entry in WalkDir::new(&staging_root).min_depth(1).max_depth(1) {
            let Ok(entry) = entry else {
                continue;
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if is_busy(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if age_of(&meta, now) <= retention {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => report.stale_staging += 1,
                Err(err) => {
                    warn!("could not remove stale staging {}: {err}", entry.path().display());
                    report.errors += 1;
                }
            }
        }
    }
}

fn is_artifact_name(path: &Path) -> bool {
    let ext_ok = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext));
    let stem_ok = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(is_valid_content_id);
    ext_ok && stem_ok
}

fn age_of(meta: &fs::Metadata, now: SystemTime) -> Duration {
    meta.modified()
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .unwrap_or_default()
}

fn remove_file_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!("could not remove {}: {err}", path.display());
    }
}
