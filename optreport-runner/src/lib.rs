//! optreport runner: one daily "large options trades" report run.
//!
//! - Configuration (TOML with environment expansion)
//! - Execution context, stage results and the failure taxonomy
//! - Stage adapters over the acquisition, analysis, report and notification collaborators
//! - The run state machine and its JSONL run journal

pub mod config;
pub mod context;
pub mod error;
pub mod journal;
pub mod orchestrator;
pub mod report;
pub mod stages;

pub use config::{AppConfig, ConfigError};
pub use context::{ExecutionContext, RunFlags, Stage, StageResult, StageStatus};
pub use error::{
    FailureKind, StageFailure, EXIT_CONCURRENT_RUN, EXIT_FAILURE, EXIT_INVALID_TRADING_DAY, EXIT_OK,
};
pub use journal::RunJournal;
pub use orchestrator::{
    report_setup_failure, Collaborators, Orchestrator, Outcome, RunOutcome, RunRequest, RunState,
    RunSummary, StageEntry,
};
