//! The daily run state machine.
//!
//! ```text
//! INIT → DATE_RESOLVED → LOCKED → ACQUIRED → ANALYZED → REPORTED → NOTIFIED
//!   └──────────┴────────────┴──────────┴──────────┴──────────┴──→ FAILED
//! ```
//!
//! One control thread drives a run. Every stage returns a typed result and this
//! module alone decides between success, degraded success and failure. The lock
//! guard lives on the stack of [`Orchestrator::drive`], so it is released on every
//! exit path before the summary or the fail-safe alert goes out.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn};

use optreport_core::artifact::ArtifactStore;
use optreport_core::{
    BusinessDayCalendar, CalendarError, ExecutionLock, LockError, Sleeper, ThreadSleeper,
    TradingDate,
};

use crate::config::{AppConfig, ConfigError};
use crate::context::{new_run_id, ExecutionContext, RunFlags, Stage, StageResult};
use crate::error::{FailureKind, StageFailure, EXIT_OK};
use crate::journal::RunJournal;
use crate::report::PdfReportRenderer;
use crate::stages::acquisition::{Acquirer, AcquisitionStage, CommandAcquirer};
use crate::stages::analysis::{AnalysisOutcome, AnalysisStats, Analyzer, ParquetAnalyzer};
use crate::stages::notification::{
    compose_report_email, notifier_from_config, send_alert, send_report, AlertSeverity,
    FailureAlert, LogNotifier, Notifier,
};
use crate::stages::report::{render_report, ReportRenderer};

/// Ranked trades echoed to the log after analysis.
const LOGGED_TOP_TRADES: usize = 3;

// ── States ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    DateResolved,
    Locked,
    Acquired,
    Analyzed,
    Reported,
    Notified,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Init => "INIT",
            RunState::DateResolved => "DATE_RESOLVED",
            RunState::Locked => "LOCKED",
            RunState::Acquired => "ACQUIRED",
            RunState::Analyzed => "ANALYZED",
            RunState::Reported => "REPORTED",
            RunState::Notified => "NOTIFIED",
            RunState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Notified | RunState::Failed)
    }

    /// The success-path successor.
    pub fn next(&self) -> Option<RunState> {
        match self {
            RunState::Init => Some(RunState::DateResolved),
            RunState::DateResolved => Some(RunState::Locked),
            RunState::Locked => Some(RunState::Acquired),
            RunState::Acquired => Some(RunState::Analyzed),
            RunState::Analyzed => Some(RunState::Reported),
            RunState::Reported => Some(RunState::Notified),
            RunState::Notified | RunState::Failed => None,
        }
    }

    pub fn can_transition_to(&self, to: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == RunState::Failed || self.next() == Some(to)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Report produced but the email could not be delivered.
    Degraded,
    Failed,
}

// ── Summary ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: Stage,
    #[serde(flatten)]
    pub result: StageResult,
}

/// Structured record of a finished run, logged and appended to the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub requested_date: Option<NaiveDate>,
    pub reference_date: NaiveDate,
    pub trading_date: Option<NaiveDate>,
    pub started_at: NaiveDateTime,
    pub final_state: RunState,
    pub outcome: Outcome,
    pub exit_code: i32,
    pub failure: Option<StageFailure>,
    pub delivery_warning: Option<String>,
    pub stages: Vec<StageEntry>,
    pub stats: Option<AnalysisStats>,
    pub artifact: Option<PathBuf>,
    pub report: Option<PathBuf>,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages
            .iter()
            .find(|e| e.stage == stage)
            .map(|e| &e.result)
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: RunState,
    pub summary: RunSummary,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        self.summary.exit_code
    }

    pub fn outcome(&self) -> Outcome {
        self.summary.outcome
    }
}

// ── Inputs ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RunRequest {
    /// Explicit `--date`; `None` means the most recent completed trading day.
    pub requested_date: Option<NaiveDate>,
    /// "Today" for date defaulting.
    pub reference_date: NaiveDate,
    pub flags: RunFlags,
}

impl RunRequest {
    pub fn new(requested_date: Option<NaiveDate>, flags: RunFlags) -> Self {
        Self {
            requested_date,
            reference_date: chrono::Local::now().date_naive(),
            flags,
        }
    }
}

/// The four external collaborators plus the retry sleeper.
pub struct Collaborators {
    pub acquirer: Box<dyn Acquirer>,
    pub analyzer: Box<dyn Analyzer>,
    pub renderer: Box<dyn ReportRenderer>,
    pub notifier: Arc<dyn Notifier>,
    pub sleeper: Box<dyn Sleeper>,
}

impl Collaborators {
    /// Production collaborators: external command, Parquet analyzer, PDF renderer,
    /// relay (or log) notifier, real sleeps.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            acquirer: Box::new(CommandAcquirer::new(
                config.acquisition.command.clone(),
                config.acquisition.args.clone(),
                config.acquisition_timeout(),
            )),
            analyzer: Box::new(ParquetAnalyzer),
            renderer: Box::new(PdfReportRenderer::new(&config.paths.reports_dir, &config.report)),
            notifier: notifier_from_config(&config.email)?,
            sleeper: Box::new(ThreadSleeper),
        })
    }
}

// ── Run bookkeeping ─────────────────────────────────────────────────

struct RunTracker {
    ctx: ExecutionContext,
    state: RunState,
    artifact: Option<PathBuf>,
    report: Option<PathBuf>,
    stats: Option<AnalysisStats>,
    delivery_warning: Option<String>,
}

impl RunTracker {
    fn new(ctx: ExecutionContext) -> Self {
        Self {
            ctx,
            state: RunState::Init,
            artifact: None,
            report: None,
            stats: None,
            delivery_warning: None,
        }
    }

    fn transition(&mut self, to: RunState) {
        if !self.state.can_transition_to(to) {
            warn!(from = %self.state, to = %to, "unexpected state transition");
        }
        info!(
            run_id = %self.ctx.run_id(),
            trading_date = %self.trading_date_str(),
            from = %self.state,
            to = %to,
            "state transition"
        );
        self.state = to;
    }

    fn record(&mut self, stage: Stage, result: StageResult) {
        info!(
            stage = %stage,
            status = ?result.status,
            elapsed_ms = result.elapsed_ms,
            attempts = ?result.attempts,
            "stage finished"
        );
        self.ctx.record(stage, result);
    }

    /// Record `failure` against its stage and hand it back for `?`.
    fn failed(&mut self, started: Instant, failure: StageFailure) -> StageFailure {
        error!(
            stage = %failure.stage,
            kind = %failure.kind,
            attempts = ?failure.attempts,
            error = %failure.message,
            "stage failed"
        );
        let mut result = StageResult::failed(started.elapsed(), failure.message.clone());
        if let Some(attempts) = failure.attempts {
            result = result.with_attempts(attempts);
        }
        self.ctx.record(failure.stage, result);
        failure
    }

    fn trading_date_str(&self) -> String {
        self.ctx
            .trading_date()
            .map(|d| d.iso())
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Run a stage body, turning a panic into a stage failure.
fn guarded<T>(
    stage: Stage,
    body: impl FnOnce() -> Result<T, StageFailure>,
) -> Result<T, StageFailure> {
    panic::catch_unwind(AssertUnwindSafe(body))
        .unwrap_or_else(|payload| Err(StageFailure::panicked(stage, payload.as_ref())))
}

// ── Orchestrator ────────────────────────────────────────────────────

pub struct Orchestrator {
    config: AppConfig,
    calendar: BusinessDayCalendar,
    lock: ExecutionLock,
    store: ArtifactStore,
    journal: RunJournal,
    collaborators: Collaborators,
}

impl Orchestrator {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            calendar: config.calendar(),
            lock: config.execution_lock(),
            store: config.artifact_store(),
            journal: RunJournal::new(config.journal_path()),
            config,
            collaborators,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn journal(&self) -> &RunJournal {
        &self.journal
    }

    /// Execute one run to a terminal state. Never panics on collaborator faults.
    pub fn run(&self, request: RunRequest) -> RunOutcome {
        let ctx = ExecutionContext::new(
            new_run_id(request.reference_date),
            request.requested_date,
            request.reference_date,
            request.flags,
        );
        let span = info_span!("run", run_id = %ctx.run_id());
        let _entered = span.enter();

        info!(
            requested_date = ?request.requested_date,
            reference_date = %request.reference_date,
            force = request.flags.force,
            send_email = request.flags.send_email,
            fast_retry = request.flags.fast_retry,
            "run started"
        );

        let mut run = RunTracker::new(ctx);
        let failure = self.drive(&mut run).err();
        finish(&self.config, &self.journal, &self.collaborators.notifier, run, failure)
    }

    fn drive(&self, run: &mut RunTracker) -> Result<(), StageFailure> {
        let flags = run.ctx.flags();

        // INIT → DATE_RESOLVED
        let started = Instant::now();
        let (requested, reference) = (run.ctx.requested_date(), run.ctx.reference_date());
        let date = guarded(Stage::DateResolution, || self.resolve_date(requested, reference))
            .map_err(|f| run.failed(started, f))?;
        run.ctx.set_trading_date(date);
        run.record(Stage::DateResolution, StageResult::success(started.elapsed()));
        run.transition(RunState::DateResolved);

        // DATE_RESOLVED → LOCKED
        let started = Instant::now();
        let run_id = run.ctx.run_id().to_string();
        let mut lock = guarded(Stage::Lock, || {
            self.lock.acquire(&date, &run_id).map_err(|e| {
                let kind = match e {
                    LockError::Held { .. } => FailureKind::ConcurrentRun,
                    LockError::Io { .. } => FailureKind::Internal,
                };
                StageFailure::new(Stage::Lock, kind, e.to_string())
            })
        })
        .map_err(|f| run.failed(started, f))?;
        run.record(
            Stage::Lock,
            StageResult::success(started.elapsed()).with_artifact(lock.path()),
        );
        run.transition(RunState::Locked);

        // LOCKED → ACQUIRED
        let started = Instant::now();
        let policy = self.config.retry_policy(flags.fast_retry);
        let stage = AcquisitionStage {
            store: &self.store,
            policy: &policy,
            sleeper: self.collaborators.sleeper.as_ref(),
            acquirer: self.collaborators.acquirer.as_ref(),
        };
        let acquired = guarded(Stage::Acquisition, || stage.run(&date, flags.force))
            .map_err(|f| run.failed(started, f))?;
        let artifact = acquired.artifact.path.clone();
        let result = if acquired.reused {
            StageResult::skipped(started.elapsed(), "reused cached artifact")
        } else {
            StageResult::success(started.elapsed())
        };
        info!(
            path = %artifact.display(),
            rows = acquired.artifact.row_count,
            attempts = acquired.attempts,
            waited_secs = acquired.waited.as_secs(),
            "artifact ready"
        );
        if acquired.artifact.row_count == 0 {
            warn!("snapshot has no rows; the report will list no trades");
        }
        run.record(
            Stage::Acquisition,
            result
                .with_artifact(&artifact)
                .with_attempts(acquired.attempts),
        );
        run.artifact = Some(artifact.clone());
        run.transition(RunState::Acquired);

        // ACQUIRED → ANALYZED
        let started = Instant::now();
        let analysis = guarded(Stage::Analysis, || {
            self.collaborators
                .analyzer
                .analyze(&artifact, &self.config.filters)
                .map_err(|e| {
                    StageFailure::new(Stage::Analysis, FailureKind::Analysis, e.to_string())
                })
        })
        .map_err(|f| run.failed(started, f))?;
        log_analysis(&analysis);
        run.stats = Some(analysis.stats.clone());
        run.record(Stage::Analysis, StageResult::success(started.elapsed()));
        run.transition(RunState::Analyzed);

        // ANALYZED → REPORTED
        let started = Instant::now();
        let (report, bytes) = guarded(Stage::Report, || {
            render_report(
                self.collaborators.renderer.as_ref(),
                &date,
                &analysis,
                self.config.report.min_bytes,
            )
            .map_err(|e| StageFailure::new(Stage::Report, FailureKind::Report, e.to_string()))
        })
        .map_err(|f| run.failed(started, f))?;
        info!(
            pdf = %report.pdf.display(),
            bytes,
            pages = report.pages,
            csv = ?report.csv,
            "report ready"
        );
        run.record(
            Stage::Report,
            StageResult::success(started.elapsed()).with_artifact(&report.pdf),
        );
        run.report = Some(report.pdf.clone());
        run.transition(RunState::Reported);

        // REPORTED → NOTIFIED
        let started = Instant::now();
        let skip_reason = if !flags.send_email {
            Some("--no-email")
        } else if !self.config.email.enabled {
            Some("email.enabled = false")
        } else {
            None
        };
        match skip_reason {
            Some(reason) => {
                info!(reason, "notification skipped");
                run.record(Stage::Notification, StageResult::skipped(started.elapsed(), reason));
            }
            None => {
                let email = compose_report_email(&self.config.email, &date, &analysis, &report.pdf);
                let deadline = self.config.notification_timeout();
                match send_report(&self.collaborators.notifier, email, deadline) {
                    Ok(()) => {
                        run.record(Stage::Notification, StageResult::success(started.elapsed()));
                    }
                    Err(e) => {
                        warn!(error = %e, "report delivery failed; the report was produced");
                        run.record(
                            Stage::Notification,
                            StageResult::failed(started.elapsed(), e.to_string()),
                        );
                        run.delivery_warning = Some(e.to_string());
                    }
                }
            }
        }
        run.transition(RunState::Notified);
        lock.release();
        Ok(())
    }

    fn resolve_date(
        &self,
        requested: Option<NaiveDate>,
        reference: NaiveDate,
    ) -> Result<TradingDate, StageFailure> {
        let resolved = match requested {
            Some(date) => self.calendar.resolve(date),
            None => self.calendar.previous_business_day(reference),
        };
        resolved.map_err(|e| {
            let kind = match e {
                CalendarError::InvalidTradingDay { .. } => FailureKind::InvalidTradingDay,
                _ => FailureKind::Internal,
            };
            StageFailure::new(Stage::DateResolution, kind, e.to_string())
        })
    }
}

/// Record a run that failed before the orchestrator could be built.
///
/// The failure is journaled like any other run and the fail-safe alert goes
/// out through the configured notifier, or the log when that cannot be built.
pub fn report_setup_failure(config: &AppConfig, request: RunRequest, error: &str) -> RunOutcome {
    let ctx = ExecutionContext::new(
        new_run_id(request.reference_date),
        request.requested_date,
        request.reference_date,
        request.flags,
    );
    let span = info_span!("run", run_id = %ctx.run_id());
    let _entered = span.enter();

    let notifier = notifier_from_config(&config.email).unwrap_or_else(|e| {
        warn!(error = %e, "notifier unavailable; alert goes to the log only");
        Arc::new(LogNotifier) as Arc<dyn Notifier>
    });
    let journal = RunJournal::new(config.journal_path());

    let mut run = RunTracker::new(ctx);
    let failure = run.failed(
        Instant::now(),
        StageFailure::new(Stage::Setup, FailureKind::Setup, error),
    );
    finish(config, &journal, &notifier, run, Some(failure))
}

fn finish(
    config: &AppConfig,
    journal: &RunJournal,
    notifier: &Arc<dyn Notifier>,
    mut run: RunTracker,
    failure: Option<StageFailure>,
) -> RunOutcome {
    let outcome = match (&failure, &run.delivery_warning) {
        (Some(_), _) => Outcome::Failed,
        (None, Some(_)) => Outcome::Degraded,
        (None, None) => Outcome::Success,
    };
    let exit_code = failure.as_ref().map_or(EXIT_OK, |f| f.kind.exit_code());

    if let Some(f) = &failure {
        run.transition(RunState::Failed);
        raise_alert(config, notifier, &run, f);
    }

    let summary = RunSummary {
        run_id: run.ctx.run_id().to_string(),
        requested_date: run.ctx.requested_date(),
        reference_date: run.ctx.reference_date(),
        trading_date: run.ctx.trading_date().map(|d| d.date()),
        started_at: run.ctx.started_at(),
        final_state: run.state,
        outcome,
        exit_code,
        failure,
        delivery_warning: run.delivery_warning.clone(),
        stages: run
            .ctx
            .results()
            .iter()
            .map(|(stage, result)| StageEntry {
                stage: *stage,
                result: result.clone(),
            })
            .collect(),
        stats: run.stats.clone(),
        artifact: run.artifact.clone(),
        report: run.report.clone(),
        elapsed_ms: run.ctx.elapsed().as_millis() as u64,
    };

    match serde_json::to_string(&summary) {
        Ok(json) => info!(outcome = ?outcome, exit_code, summary = %json, "run finished"),
        Err(e) => warn!(error = %e, "failed to serialize run summary"),
    }
    if let Err(e) = journal.append(&summary) {
        warn!(path = %journal.path().display(), error = %e, "failed to append run journal");
    }

    RunOutcome {
        state: run.state,
        summary,
    }
}

/// Fail-safe alert. Independent of `--no-email`; gated by `email.send_failure_alerts`.
fn raise_alert(
    config: &AppConfig,
    notifier: &Arc<dyn Notifier>,
    run: &RunTracker,
    failure: &StageFailure,
) {
    let alarming = failure.kind.is_alarming();
    let alert = FailureAlert {
        run_id: run.ctx.run_id().to_string(),
        requested_date: run.ctx.requested_date(),
        reference_date: run.ctx.reference_date(),
        trading_date: run.ctx.trading_date().map(|d| d.date()),
        stage: failure.stage,
        kind: failure.kind,
        error: failure.message.clone(),
        severity: if alarming {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Notice
        },
    };

    if alarming {
        error!(
            stage = %alert.stage,
            kind = %alert.kind,
            trading_date = %run.trading_date_str(),
            error = %alert.error,
            "fail-safe alert"
        );
    } else {
        info!(
            stage = %alert.stage,
            kind = %alert.kind,
            trading_date = %run.trading_date_str(),
            error = %alert.error,
            "run stopped: another run holds this date"
        );
    }

    let email = &config.email;
    if !email.send_failure_alerts || !(alarming || email.alert_on_concurrent_run) {
        return;
    }
    if let Err(e) = send_alert(notifier, alert, config.notification_timeout()) {
        error!(error = %e, "fail-safe alert could not be delivered");
    }
}

fn log_analysis(analysis: &AnalysisOutcome) {
    let stats = &analysis.stats;
    info!(
        total_options = stats.total_options,
        total_volume = stats.total_volume,
        after_filters = stats.after_filters,
        ranked = analysis.ranked.len(),
        top_n_pct = stats.top_n_pct,
        calls = stats.calls,
        puts = stats.puts,
        "analysis complete"
    );
    for r in analysis.ranked.iter().take(LOGGED_TOP_TRADES) {
        info!(
            rank = r.rank,
            symbol = %r.trade.symbol,
            underlying = %r.trade.underlying,
            option_type = %r.trade.option_type,
            average_ticket = r.average_ticket,
            financial_volume = r.trade.financial_volume,
            "top trade"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_path_is_linear() {
        let mut state = RunState::Init;
        let mut seen = vec![state];
        while let Some(next) = state.next() {
            assert!(state.can_transition_to(next));
            state = next;
            seen.push(state);
        }
        assert_eq!(state, RunState::Notified);
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn failed_is_reachable_from_every_non_terminal_state() {
        for state in [
            RunState::Init,
            RunState::DateResolved,
            RunState::Locked,
            RunState::Acquired,
            RunState::Analyzed,
            RunState::Reported,
        ] {
            assert!(state.can_transition_to(RunState::Failed), "{state}");
        }
        assert!(!RunState::Notified.can_transition_to(RunState::Failed));
        assert!(!RunState::Failed.can_transition_to(RunState::Failed));
    }

    #[test]
    fn states_cannot_be_skipped() {
        assert!(!RunState::Init.can_transition_to(RunState::Locked));
        assert!(!RunState::Acquired.can_transition_to(RunState::Reported));
    }

    #[test]
    fn guarded_turns_panics_into_internal_failures() {
        let result: Result<(), StageFailure> =
            guarded(Stage::Report, || panic!("renderer blew up"));
        let failure = result.unwrap_err();
        assert_eq!(failure.stage, Stage::Report);
        assert_eq!(failure.kind, FailureKind::Internal);
        assert!(failure.message.contains("renderer blew up"));
    }

    #[test]
    fn state_names_serialize_screaming() {
        assert_eq!(
            serde_json::to_string(&RunState::DateResolved).unwrap(),
            "\"DATE_RESOLVED\""
        );
        assert_eq!(RunState::DateResolved.to_string(), "DATE_RESOLVED");
    }
}
