//! Failure taxonomy as seen by the orchestrator.
//!
//! Each stage adapter turns its own error type into a [`StageFailure`]; the
//! orchestrator decides the terminal state and the exit code from the kind alone.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::Stage;

/// Process exit code for a successful (or degraded-success) run.
pub const EXIT_OK: i32 = 0;
/// Exit code for any failure without a more specific code.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code when the requested date is not a trading day.
pub const EXIT_INVALID_TRADING_DAY: i32 = 2;
/// Exit code when another run holds the lock for the date.
pub const EXIT_CONCURRENT_RUN: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Collaborators or the orchestrator could not be built from the config.
    Setup,
    InvalidTradingDay,
    /// Another run holds the lock. Expected, not alarming.
    ConcurrentRun,
    /// Data was still unavailable after the last allowed attempt.
    RetriesExhausted,
    FatalAcquisition,
    ArtifactValidation,
    Analysis,
    Report,
    /// Lock I/O, artifact store I/O, or a panic inside a collaborator.
    Internal,
}

impl FailureKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            FailureKind::InvalidTradingDay => EXIT_INVALID_TRADING_DAY,
            FailureKind::ConcurrentRun => EXIT_CONCURRENT_RUN,
            _ => EXIT_FAILURE,
        }
    }

    /// Whether this failure should page a human.
    pub fn is_alarming(&self) -> bool {
        !matches!(self, FailureKind::ConcurrentRun)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Setup => "setup",
            FailureKind::InvalidTradingDay => "invalid_trading_day",
            FailureKind::ConcurrentRun => "concurrent_run",
            FailureKind::RetriesExhausted => "retries_exhausted",
            FailureKind::FatalAcquisition => "fatal_acquisition",
            FailureKind::ArtifactValidation => "artifact_validation",
            FailureKind::Analysis => "analysis",
            FailureKind::Report => "report",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage failure that moves the run to FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: Option<u32>,
}

impl StageFailure {
    pub fn new(stage: Stage, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
            attempts: None,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// A collaborator panicked at `stage`.
    pub fn panicked(stage: Stage, payload: &(dyn Any + Send)) -> Self {
        Self::new(
            stage,
            FailureKind::Internal,
            format!("panic: {}", panic_message(payload)),
        )
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({}): {}", self.stage, self.kind, self.message)
    }
}

impl std::error::Error for StageFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_expected_failures() {
        assert_eq!(FailureKind::InvalidTradingDay.exit_code(), 2);
        assert_eq!(FailureKind::ConcurrentRun.exit_code(), 3);
        assert_eq!(FailureKind::RetriesExhausted.exit_code(), 1);
        assert_eq!(FailureKind::Internal.exit_code(), 1);
    }

    #[test]
    fn only_concurrent_run_is_not_alarming() {
        assert!(!FailureKind::ConcurrentRun.is_alarming());
        assert!(FailureKind::Report.is_alarming());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let f = StageFailure::panicked(Stage::Analysis, payload.as_ref());
        assert_eq!(f.kind, FailureKind::Internal);
        assert_eq!(f.message, "panic: boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(
            StageFailure::panicked(Stage::Report, payload.as_ref()).message,
            "panic: bang"
        );
    }
}
