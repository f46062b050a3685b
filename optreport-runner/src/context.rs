//! Per-run execution context and stage results.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::warn;

use optreport_core::TradingDate;

/// Resolved boolean switches for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFlags {
    /// Discard any cached artifact and re-acquire.
    pub force: bool,
    pub send_email: bool,
    pub debug: bool,
    /// Zero wait between acquisition attempts.
    pub fast_retry: bool,
}

impl Default for RunFlags {
    fn default() -> Self {
        Self {
            force: false,
            send_email: true,
            debug: false,
            fast_retry: false,
        }
    }
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Building collaborators from the loaded config.
    Setup,
    DateResolution,
    Lock,
    Acquisition,
    Analysis,
    Report,
    Notification,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Setup => "setup",
            Stage::DateResolution => "date_resolution",
            Stage::Lock => "lock",
            Stage::Acquisition => "acquisition",
            Stage::Analysis => "analysis",
            Stage::Report => "report",
            Stage::Notification => "notification",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Skipped,
    Failed,
}

/// Outcome of one stage. Recorded once and never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageStatus,
    pub artifact: Option<PathBuf>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    /// Acquisition only: attempts made (0 when a cached artifact was reused).
    pub attempts: Option<u32>,
    /// Why a stage was skipped, or other context.
    pub note: Option<String>,
}

impl StageResult {
    fn new(status: StageStatus, elapsed: Duration) -> Self {
        Self {
            status,
            artifact: None,
            error: None,
            elapsed_ms: elapsed.as_millis() as u64,
            attempts: None,
            note: None,
        }
    }

    pub fn success(elapsed: Duration) -> Self {
        Self::new(StageStatus::Success, elapsed)
    }

    pub fn skipped(elapsed: Duration, note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Self::new(StageStatus::Skipped, elapsed)
        }
    }

    pub fn failed(elapsed: Duration, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(StageStatus::Failed, elapsed)
        }
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact = Some(path.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// State of a single run, owned by the orchestrator and passed to each stage.
#[derive(Debug)]
pub struct ExecutionContext {
    run_id: String,
    requested_date: Option<NaiveDate>,
    reference_date: NaiveDate,
    trading_date: Option<TradingDate>,
    flags: RunFlags,
    started_at: NaiveDateTime,
    started: Instant,
    results: BTreeMap<Stage, StageResult>,
}

impl ExecutionContext {
    pub fn new(
        run_id: impl Into<String>,
        requested_date: Option<NaiveDate>,
        reference_date: NaiveDate,
        flags: RunFlags,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            requested_date,
            reference_date,
            trading_date: None,
            flags,
            started_at: chrono::Local::now().naive_local(),
            started: Instant::now(),
            results: BTreeMap::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn requested_date(&self) -> Option<NaiveDate> {
        self.requested_date
    }

    pub fn reference_date(&self) -> NaiveDate {
        self.reference_date
    }

    pub fn flags(&self) -> RunFlags {
        self.flags
    }

    pub fn started_at(&self) -> NaiveDateTime {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn trading_date(&self) -> Option<TradingDate> {
        self.trading_date
    }

    /// Set the resolved date. Later calls are ignored and return `false`.
    pub fn set_trading_date(&mut self, date: TradingDate) -> bool {
        if self.trading_date.is_some() {
            warn!(run_id = %self.run_id, "trading date already resolved; ignoring");
            return false;
        }
        self.trading_date = Some(date);
        true
    }

    /// Record a stage result. A stage can be recorded only once.
    pub fn record(&mut self, stage: Stage, result: StageResult) -> bool {
        if self.results.contains_key(&stage) {
            warn!(run_id = %self.run_id, stage = %stage, "stage result already recorded; ignoring");
            return false;
        }
        self.results.insert(stage, result);
        true
    }

    pub fn result(&self, stage: Stage) -> Option<&StageResult> {
        self.results.get(&stage)
    }

    pub fn results(&self) -> &BTreeMap<Stage, StageResult> {
        &self.results
    }
}

/// Short unique id for a run: blake3 of pid, wall clock and reference date.
pub fn new_run_id(reference_date: NaiveDate) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&std::process::id().to_le_bytes());
    let nanos = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default();
    hasher.update(&nanos.to_le_bytes());
    hasher.update(reference_date.to_string().as_bytes());
    hasher.finalize().to_hex().as_str()[..12].to_string()
}
