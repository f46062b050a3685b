//! On-disk artifact store for daily snapshots.
//!
//! Layout: `{data_dir}/{prefix}_{YYYY-MM-DD}.parquet`
//!
//! - The acquisition process writes to a staging file (`.parquet.tmp`); the
//!   store validates it and renames it into place, so a partially written
//!   artifact is never visible under the final name
//! - Metadata sidecar per artifact (`.parquet.meta.json`: row count, blake3 hash, attempts)
//! - Artifacts that fail validation are quarantined (`.quarantined` suffix), not deleted

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::snapshot::read_snapshot;
use super::ArtifactError;
use crate::domain::TradingDate;

/// Metadata sidecar written next to each promoted artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub trading_date: NaiveDate,
    pub row_count: usize,
    pub data_hash: String,
    pub attempts: u32,
    pub acquired_at: NaiveDateTime,
}

/// An artifact that exists, is non-empty, and parses under the snapshot schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedArtifact {
    pub path: PathBuf,
    pub row_count: usize,
    pub data_hash: String,
}

/// State of the final artifact for a date before acquisition runs.
#[derive(Debug)]
pub enum CachedArtifact {
    Absent,
    Valid(ValidatedArtifact),
    /// Existed but failed validation; moved aside.
    Quarantined { path: PathBuf, error: ArtifactError },
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    data_dir: PathBuf,
    prefix: String,
}

impl ArtifactStore {
    pub fn new(data_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Final location: `{data_dir}/{prefix}_{date}.parquet`.
    pub fn artifact_path(&self, date: &TradingDate) -> PathBuf {
        self.data_dir
            .join(format!("{}_{}.parquet", self.prefix, date.iso()))
    }

    /// Where the acquisition process is told to write.
    pub fn staging_path(&self, date: &TradingDate) -> PathBuf {
        with_suffix(&self.artifact_path(date), ".tmp")
    }

    pub fn meta_path(&self, date: &TradingDate) -> PathBuf {
        with_suffix(&self.artifact_path(date), ".meta.json")
    }

    /// Check that `path` exists, is non-empty, and parses as a snapshot.
    ///
    /// Zero data rows is valid: a quiet trading day still gets a report.
    pub fn validate(&self, path: &Path) -> Result<ValidatedArtifact, ArtifactError> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::Missing {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(ArtifactError::io(path, e)),
        };
        if metadata.len() == 0 {
            return Err(ArtifactError::Empty {
                path: path.to_path_buf(),
            });
        }

        let rows = read_snapshot(path)?;
        if rows.is_empty() {
            warn!(path = %path.display(), "artifact has zero rows");
        }
        let bytes = fs::read(path).map_err(|e| ArtifactError::io(path, e))?;

        Ok(ValidatedArtifact {
            path: path.to_path_buf(),
            row_count: rows.len(),
            data_hash: blake3::hash(&bytes).to_hex().to_string(),
        })
    }

    /// Inspect the final artifact for `date`, quarantining it if it is corrupt.
    pub fn check_cached(&self, date: &TradingDate) -> Result<CachedArtifact, ArtifactError> {
        let path = self.artifact_path(date);
        if !path.exists() {
            return Ok(CachedArtifact::Absent);
        }
        match self.validate(&path) {
            Ok(valid) => Ok(CachedArtifact::Valid(valid)),
            Err(error) => {
                let moved = self.quarantine(&path)?;
                let _ = fs::remove_file(self.meta_path(date));
                Ok(CachedArtifact::Quarantined { path: moved, error })
            }
        }
    }

    /// Remove the artifact and sidecar for `date`. Returns whether an artifact existed.
    pub fn discard(&self, date: &TradingDate) -> Result<bool, ArtifactError> {
        let path = self.artifact_path(date);
        let existed = remove_if_exists(&path)?;
        remove_if_exists(&self.meta_path(date))?;
        if existed {
            info!(path = %path.display(), "discarded existing artifact");
        }
        Ok(existed)
    }

    /// Create the data directory and clear any leftover staging file.
    pub fn prepare_staging(&self, date: &TradingDate) -> Result<PathBuf, ArtifactError> {
        fs::create_dir_all(&self.data_dir).map_err(|e| ArtifactError::io(&self.data_dir, e))?;
        let staging = self.staging_path(date);
        if remove_if_exists(&staging)? {
            debug!(path = %staging.display(), "removed leftover staging file");
        }
        Ok(staging)
    }

    /// Validate the staging file and atomically rename it to the final path.
    ///
    /// An invalid staging file is quarantined and the final path is left untouched.
    pub fn promote(
        &self,
        date: &TradingDate,
        attempts: u32,
    ) -> Result<ValidatedArtifact, ArtifactError> {
        let staging = self.staging_path(date);
        let staged = match self.validate(&staging) {
            Ok(v) => v,
            Err(e) => {
                if staging.exists() {
                    let _ = self.quarantine(&staging);
                }
                return Err(e);
            }
        };

        let path = self.artifact_path(date);
        fs::rename(&staging, &path).map_err(|e| {
            let _ = fs::remove_file(&staging);
            ArtifactError::io(&path, e)
        })?;

        let meta = ArtifactMeta {
            trading_date: date.date(),
            row_count: staged.row_count,
            data_hash: staged.data_hash.clone(),
            attempts,
            acquired_at: chrono::Local::now().naive_local(),
        };
        self.write_meta(date, &meta)?;
        info!(
            trading_date = %date,
            rows = staged.row_count,
            path = %path.display(),
            "artifact promoted"
        );

        Ok(ValidatedArtifact { path, ..staged })
    }

    /// Read the sidecar for a date, if present and parseable.
    pub fn get_meta(&self, date: &TradingDate) -> Option<ArtifactMeta> {
        let content = fs::read_to_string(self.meta_path(date)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn write_meta(&self, date: &TradingDate, meta: &ArtifactMeta) -> Result<(), ArtifactError> {
        let path = self.meta_path(date);
        let tmp = with_suffix(&path, ".tmp");
        let json = serde_json::to_string_pretty(meta).map_err(|e| {
            ArtifactError::io(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        fs::write(&tmp, json).map_err(|e| ArtifactError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            ArtifactError::io(&path, e)
        })
    }

    fn quarantine(&self, path: &Path) -> Result<PathBuf, ArtifactError> {
        let target = with_suffix(path, ".quarantined");
        warn!(
            from = %path.display(),
            to = %target.display(),
            "quarantining invalid artifact"
        );
        fs::rename(path, &target).map_err(|e| ArtifactError::io(path, e))?;
        Ok(target)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> Result<bool, ArtifactError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ArtifactError::io(path, e)),
    }
}
