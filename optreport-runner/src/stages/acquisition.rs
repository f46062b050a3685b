//! Acquisition: run the external download routine and promote its artifact.
//!
//! The routine reports its outcome through the process exit status, using the
//! BSD `sysexits` codes for the conditions retrying cannot fix:
//!
//! | exit | meaning |
//! |---|---|
//! | 0 | artifact written to the staging path |
//! | 65, 69, 77, 78 | fatal (bad data, upstream gone, no permission, bad config) |
//! | 75 or anything else | data not yet published, retry later |
//!
//! A run that exceeds its timeout is killed and counts as retryable.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use optreport_core::artifact::{ArtifactError, ArtifactStore, CachedArtifact, ValidatedArtifact};
use optreport_core::{RetryError, RetryPolicy, Retryable, Sleeper, TradingDate};

use crate::context::Stage;
use crate::error::{FailureKind, StageFailure};

pub const EX_DATAERR: i32 = 65;
pub const EX_UNAVAILABLE: i32 = 69;
pub const EX_TEMPFAIL: i32 = 75;
pub const EX_NOPERM: i32 = 77;
pub const EX_CONFIG: i32 = 78;

/// Diagnostic lines kept from the child's stderr for error messages.
const DIAGNOSTIC_TAIL: usize = 20;

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("data not yet available (exit {}): {detail}", fmt_code(*exit_code))]
    DataNotYetAvailable {
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("acquisition timed out after {}s", after.as_secs())]
    TimedOut { after: Duration },

    #[error("fatal acquisition failure (exit {}): {detail}", fmt_code(*exit_code))]
    Fatal {
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("acquisition process I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

impl Retryable for AcquisitionError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            AcquisitionError::DataNotYetAvailable { .. } | AcquisitionError::TimedOut { .. }
        )
    }
}

fn fmt_code(code: Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

/// How an exit status is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    NotYetAvailable,
    Fatal,
}

/// Map an exit code to an outcome. `None` (killed by a signal) is retryable.
pub fn classify_exit(code: Option<i32>) -> ExitClass {
    match code {
        Some(0) => ExitClass::Success,
        Some(EX_DATAERR | EX_UNAVAILABLE | EX_NOPERM | EX_CONFIG) => ExitClass::Fatal,
        _ => ExitClass::NotYetAvailable,
    }
}

/// The external download routine.
pub trait Acquirer: Send + Sync {
    /// Produce the snapshot for `date` at `output`.
    fn acquire(&self, date: &TradingDate, output: &Path, attempt: u32)
        -> Result<(), AcquisitionError>;
}

// ── Command acquirer ────────────────────────────────────────────────

/// Runs `<program> <args…> --date=YYYY-MM-DD --output=<path>`.
#[derive(Debug, Clone)]
pub struct CommandAcquirer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    poll_interval: Duration,
}

impl CommandAcquirer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn wait_with_deadline(&self, child: &mut Child) -> io::Result<Option<ExitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
            thread::sleep(self.poll_interval);
        }
    }
}

impl Acquirer for CommandAcquirer {
    fn acquire(
        &self,
        date: &TradingDate,
        output: &Path,
        attempt: u32,
    ) -> Result<(), AcquisitionError> {
        info!(
            command = %self.program,
            trading_date = %date,
            attempt,
            output = %output.display(),
            "starting acquisition process"
        );
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(format!("--date={}", date.iso()))
            .arg(format!("--output={}", output.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| AcquisitionError::Spawn {
                command: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().map(|s| spawn_pump(s, false));
        let stderr = child.stderr.take().map(|s| spawn_pump(s, true));

        let Some(status) = self.wait_with_deadline(&mut child)? else {
            // Pump threads are left to finish on their own: a grandchild may still hold the pipes.
            return Err(AcquisitionError::TimedOut {
                after: self.timeout,
            });
        };

        if let Some(handle) = stdout {
            let _ = handle.join();
        }
        let diagnostics = stderr
            .and_then(|h| h.join().ok())
            .map(|lines| lines.into_iter().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default();

        let code = status.code();
        match classify_exit(code) {
            ExitClass::Success => Ok(()),
            ExitClass::NotYetAvailable => Err(AcquisitionError::DataNotYetAvailable {
                exit_code: code,
                detail: diagnostics,
            }),
            ExitClass::Fatal => Err(AcquisitionError::Fatal {
                exit_code: code,
                detail: diagnostics,
            }),
        }
    }
}

/// Log a child stream line by line; return the last lines for diagnostics.
fn spawn_pump<R: Read + Send + 'static>(
    stream: R,
    is_stderr: bool,
) -> thread::JoinHandle<VecDeque<String>> {
    thread::spawn(move || {
        let mut tail = VecDeque::with_capacity(DIAGNOSTIC_TAIL);
        for line in BufReader::new(stream).lines().map_while(Result::ok) {
            if is_stderr {
                warn!(target: "optreport::acquisition::child", "{line}");
            } else {
                info!(target: "optreport::acquisition::child", "{line}");
            }
            if tail.len() == DIAGNOSTIC_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail
    })
}

// ── Stage ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AcquisitionOutcome {
    pub artifact: ValidatedArtifact,
    /// 0 when a cached artifact was reused.
    pub attempts: u32,
    pub waited: Duration,
    pub reused: bool,
}

/// Cache check, then the retried acquire-and-promote loop.
pub struct AcquisitionStage<'a> {
    pub store: &'a ArtifactStore,
    pub policy: &'a RetryPolicy,
    pub sleeper: &'a dyn Sleeper,
    pub acquirer: &'a dyn Acquirer,
}

impl AcquisitionStage<'_> {
    pub fn run(&self, date: &TradingDate, force: bool) -> Result<AcquisitionOutcome, StageFailure> {
        let internal = |e: ArtifactError| {
            StageFailure::new(Stage::Acquisition, FailureKind::Internal, e.to_string())
        };

        if force {
            self.store.discard(date).map_err(internal)?;
        } else {
            match self.store.check_cached(date).map_err(internal)? {
                CachedArtifact::Valid(artifact) => {
                    info!(
                        trading_date = %date,
                        path = %artifact.path.display(),
                        rows = artifact.row_count,
                        "reusing cached artifact"
                    );
                    return Ok(AcquisitionOutcome {
                        artifact,
                        attempts: 0,
                        waited: Duration::ZERO,
                        reused: true,
                    });
                }
                CachedArtifact::Quarantined { path, error } => {
                    warn!(
                        trading_date = %date,
                        quarantined = %path.display(),
                        error = %error,
                        "cached artifact was invalid; re-acquiring"
                    );
                }
                CachedArtifact::Absent => {}
            }
        }

        let result = self.policy.run_with_retry(
            self.sleeper,
            |attempt| -> Result<ValidatedArtifact, AcquisitionError> {
                let staging = self.store.prepare_staging(date)?;
                self.acquirer.acquire(date, &staging, attempt)?;
                Ok(self.store.promote(date, attempt)?)
            },
        );

        match result {
            Ok(done) => Ok(AcquisitionOutcome {
                artifact: done.value,
                attempts: done.attempts,
                waited: done.waited,
                reused: false,
            }),
            Err(err) => Err(classify_failure(err)),
        }
    }
}

fn classify_failure(err: RetryError<AcquisitionError>) -> StageFailure {
    let attempts = err.attempts();
    let kind = match &err {
        RetryError::Exhausted { .. } => FailureKind::RetriesExhausted,
        RetryError::Aborted { error, .. } => match error {
            AcquisitionError::Artifact(ArtifactError::Io { .. }) => FailureKind::Internal,
            AcquisitionError::Artifact(_) => FailureKind::ArtifactValidation,
            AcquisitionError::Io(_) => FailureKind::Internal,
            _ => FailureKind::FatalAcquisition,
        },
    };
    StageFailure::new(Stage::Acquisition, kind, err.to_string()).with_attempts(attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_classified_without_reading_text() {
        assert_eq!(classify_exit(Some(0)), ExitClass::Success);
        assert_eq!(classify_exit(Some(EX_TEMPFAIL)), ExitClass::NotYetAvailable);
        assert_eq!(classify_exit(Some(1)), ExitClass::NotYetAvailable);
        assert_eq!(classify_exit(None), ExitClass::NotYetAvailable);
        for code in [EX_DATAERR, EX_UNAVAILABLE, EX_NOPERM, EX_CONFIG] {
            assert_eq!(classify_exit(Some(code)), ExitClass::Fatal);
        }
    }

    #[test]
    fn only_timing_errors_are_retryable() {
        let not_yet = AcquisitionError::DataNotYetAvailable {
            exit_code: Some(75),
            detail: String::new(),
        };
        assert!(not_yet.is_retryable());
        assert!(AcquisitionError::TimedOut {
            after: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!AcquisitionError::Fatal {
            exit_code: Some(65),
            detail: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn exhausted_and_aborted_map_to_distinct_kinds() {
        let exhausted = classify_failure(RetryError::Exhausted {
            attempts: 6,
            waited: Duration::ZERO,
            last_error: AcquisitionError::TimedOut {
                after: Duration::from_secs(1),
            },
        });
        assert_eq!(exhausted.kind, FailureKind::RetriesExhausted);
        assert_eq!(exhausted.attempts, Some(6));

        let fatal = classify_failure(RetryError::Aborted {
            attempt: 1,
            error: AcquisitionError::Fatal {
                exit_code: Some(78),
                detail: "bad config".into(),
            },
        });
        assert_eq!(fatal.kind, FailureKind::FatalAcquisition);
        assert_eq!(fatal.attempts, Some(1));
    }

    #[cfg(unix)]
    mod command {
        use super::*;
        use chrono::NaiveDate;
        use optreport_core::BusinessDayCalendar;

        fn date() -> TradingDate {
            BusinessDayCalendar::default()
                .resolve(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap())
                .unwrap()
        }

        fn sh(script: &str, timeout: Duration) -> CommandAcquirer {
            CommandAcquirer::new(
                "sh",
                vec!["-c".into(), script.into(), "fetch".into()],
                timeout,
            )
            .with_poll_interval(Duration::from_millis(10))
        }

        #[test]
        fn passes_date_and_output_arguments() {
            let dir = tempfile::tempdir().unwrap();
            let out = dir.path().join("staged");
            let acquirer = sh(
                r#"printf '%s %s' "$1" "$2" > "${2#--output=}""#,
                Duration::from_secs(10),
            );

            acquirer.acquire(&date(), &out, 1).unwrap();
            let written = std::fs::read_to_string(&out).unwrap();
            assert_eq!(
                written,
                format!("--date=2024-01-10 --output={}", out.display())
            );
        }

        #[test]
        fn tempfail_exit_is_data_not_yet_available() {
            let dir = tempfile::tempdir().unwrap();
            let err = sh("echo 'not published' >&2; exit 75", Duration::from_secs(10))
                .acquire(&date(), &dir.path().join("x"), 1)
                .unwrap_err();
            match err {
                AcquisitionError::DataNotYetAvailable { exit_code, detail } => {
                    assert_eq!(exit_code, Some(75));
                    assert!(detail.contains("not published"));
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[test]
        fn dataerr_exit_is_fatal() {
            let dir = tempfile::tempdir().unwrap();
            let err = sh("exit 65", Duration::from_secs(10))
                .acquire(&date(), &dir.path().join("x"), 1)
                .unwrap_err();
            assert!(matches!(err, AcquisitionError::Fatal { exit_code: Some(65), .. }));
        }

        #[test]
        fn slow_process_is_killed_and_retryable() {
            let dir = tempfile::tempdir().unwrap();
            let err = sh("exec sleep 5", Duration::from_millis(200))
                .acquire(&date(), &dir.path().join("x"), 1)
                .unwrap_err();
            assert!(matches!(err, AcquisitionError::TimedOut { .. }));
            assert!(err.is_retryable());
        }

        #[test]
        fn missing_program_is_a_spawn_error() {
            let dir = tempfile::tempdir().unwrap();
            let err = CommandAcquirer::new("/nonexistent/fetcher", vec![], Duration::from_secs(1))
                .acquire(&date(), &dir.path().join("x"), 1)
                .unwrap_err();
            assert!(matches!(err, AcquisitionError::Spawn { .. }));
            assert!(!err.is_retryable());
        }
    }
}
