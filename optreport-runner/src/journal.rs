//! Run journal: one JSON [`RunSummary`] per line, append-only.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::orchestrator::RunSummary;

pub struct RunJournal {
    path: PathBuf,
}

impl RunJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, summary: &RunSummary) -> io::Result<()> {
        let json = serde_json::to_string(summary)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "{json}")?;
        file.flush()
    }

    /// All readable entries, oldest first. Malformed lines are skipped.
    pub fn read_all(&self) -> io::Result<Vec<RunSummary>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = io::BufReader::new(fs::File::open(&self.path)?);
        let mut entries = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunSummary>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = i + 1,
                    error = %e,
                    "skipping malformed journal line"
                ),
            }
        }
        Ok(entries)
    }

    /// Most recent entry for `trading_date`, if any.
    pub fn last_for(&self, trading_date: chrono::NaiveDate) -> io::Result<Option<RunSummary>> {
        Ok(self
            .read_all()?
            .into_iter()
            .rev()
            .find(|s| s.trading_date == Some(trading_date)))
    }
}
