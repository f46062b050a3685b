//! Snapshot artifact: column contract, Parquet I/O, and the on-disk store.

pub mod schema;
pub mod snapshot;
pub mod store;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use schema::{ColumnKind, SchemaError, SnapshotColumn, SNAPSHOT_COLUMNS};
pub use snapshot::{read_snapshot, write_snapshot};
pub use store::{ArtifactMeta, ArtifactStore, CachedArtifact, ValidatedArtifact};

/// Why an artifact was rejected.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found at {}", path.display())]
    Missing { path: PathBuf },

    #[error("artifact at {} is empty (0 bytes)", path.display())]
    Empty { path: PathBuf },

    #[error("artifact at {} has an unexpected schema: {source}", path.display())]
    Schema {
        path: PathBuf,
        #[source]
        source: SchemaError,
    },

    #[error("artifact at {} is not readable parquet: {reason}", path.display())]
    Parquet { path: PathBuf, reason: String },

    #[error("artifact at {} has an invalid row {row}: {reason}", path.display())]
    InvalidRow {
        path: PathBuf,
        row: usize,
        reason: String,
    },

    #[error("artifact store I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArtifactError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Path of the artifact this error refers to.
    pub fn path(&self) -> &Path {
        match self {
            ArtifactError::Missing { path }
            | ArtifactError::Empty { path }
            | ArtifactError::Schema { path, .. }
            | ArtifactError::Parquet { path, .. }
            | ArtifactError::InvalidRow { path, .. }
            | ArtifactError::Io { path, .. } => path,
        }
    }
}
