//! optreport CLI: run the daily large-options-trades report for one trading date.
//!
//! Exit codes: 0 success (including a failed email), 2 not a trading day,
//! 3 another run holds the date, 1 any other failure.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use optreport_runner::{
    report_setup_failure, AppConfig, Collaborators, ConfigError, Orchestrator, Outcome, RunFlags,
    RunOutcome, RunRequest, EXIT_FAILURE,
};

const DEFAULT_CONFIG: &str = "config/settings.toml";
const LOG_FILE_PREFIX: &str = "execution.log";
/// Daily files kept: thirty days of history.
const LOG_RETENTION_FILES: usize = 30;

#[derive(Parser, Debug)]
#[command(
    name = "optreport",
    version,
    about = "Daily report of large B3 options trades: acquire, analyze, render, email"
)]
struct Cli {
    /// Trading date (YYYY-MM-DD). Defaults to the most recent business day.
    #[arg(long, value_parser = parse_date)]
    date: Option<NaiveDate>,

    /// Discard any cached snapshot and acquire it again.
    #[arg(long, default_value_t = false)]
    force: bool,

    /// Do not email the report (failure alerts are still sent).
    #[arg(long, default_value_t = false)]
    no_email: bool,

    /// Verbose logging.
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// No wait between acquisition attempts.
    #[arg(long, default_value_t = false)]
    fast_retry: bool,

    /// Config file. Defaults to config/settings.toml (optional when not given).
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn flags(&self) -> RunFlags {
        RunFlags {
            force: self.force,
            send_email: !self.no_email,
            debug: self.debug,
            fast_retry: self.fast_retry,
        }
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_FAILURE as u8)
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let dotenv = dotenvy::dotenv();

    // Config warnings go to the console before the file appender exists.
    let config = tracing::subscriber::with_default(console_subscriber(cli.debug), || {
        load_config(cli.config.as_deref())
    })?;

    let _guard = init_logging(&config.paths.logs_dir, cli.debug)?;
    match dotenv {
        Ok(path) => info!(path = %path.display(), "loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "failed to load .env"),
    }

    let request = RunRequest::new(cli.date, cli.flags());
    let outcome = match build_orchestrator(&config) {
        Ok(orchestrator) => orchestrator.run(request),
        Err(e) => {
            error!(error = %e, "run setup failed");
            report_setup_failure(&config, request, &e.to_string())
        }
    };
    print_summary(&outcome);
    Ok(outcome.exit_code())
}

fn build_orchestrator(config: &AppConfig) -> Result<Orchestrator, ConfigError> {
    let collaborators = Collaborators::from_config(config)?;
    Orchestrator::new(config.clone(), collaborators)
}

fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let (path, required) = match explicit {
        Some(p) => (p, true),
        None => (Path::new(DEFAULT_CONFIG), false),
    };
    AppConfig::load(path, required).with_context(|| format!("failed to load {}", path.display()))
}

fn env_filter(debug: bool) -> EnvFilter {
    let level = if debug { LevelFilter::DEBUG } else { LevelFilter::INFO };
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

fn console_subscriber(debug: bool) -> impl tracing::Subscriber + Send + Sync {
    fmt()
        .with_env_filter(env_filter(debug))
        .with_writer(std::io::stderr)
        .finish()
}

/// Console plus `<logs_dir>/execution.log.<date>`, rotated daily.
fn init_logging(logs_dir: &Path, debug: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create log directory {}", logs_dir.display()))?;
    let appender = RollingBuilder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(LOG_RETENTION_FILES)
        .build(logs_dir)
        .context("failed to open log file")?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter(debug))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(guard)
}

fn print_summary(outcome: &RunOutcome) {
    let s = &outcome.summary;
    let date = s
        .trading_date
        .or(s.requested_date)
        .map(|d| d.to_string())
        .unwrap_or_else(|| "-".to_string());
    let label = match s.outcome {
        Outcome::Success => "SUCCESS",
        Outcome::Degraded => "SUCCESS (email not delivered)",
        Outcome::Failed => "FAILED",
    };

    println!();
    println!("=== Run {} ===", s.run_id);
    println!("Trading date: {date}");
    println!("Result:       {label} (exit {})", s.exit_code);
    println!("Elapsed:      {:.1}s", s.elapsed_ms as f64 / 1000.0);
    if let Some(stats) = &s.stats {
        println!(
            "Trades:       {} options, {} after filters",
            stats.total_options, stats.after_filters
        );
    }
    if let Some(report) = &s.report {
        println!("Report:       {}", report.display());
    }
    if let Some(warning) = &s.delivery_warning {
        println!("Warning:      {warning}");
    }
    if let Some(failure) = &s.failure {
        println!("Failure:      {failure}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_map_to_run_flags() {
        let cli = Cli::try_parse_from([
            "optreport",
            "--date",
            "2024-01-10",
            "--no-email",
            "--force",
        ])
        .unwrap();
        assert_eq!(cli.date, NaiveDate::from_ymd_opt(2024, 1, 10));
        let flags = cli.flags();
        assert!(!flags.send_email);
        assert!(flags.force);
        assert!(!flags.debug);
        assert!(!flags.fast_retry);
    }

    #[test]
    fn defaults_send_email_for_latest_day() {
        let cli = Cli::try_parse_from(["optreport"]).unwrap();
        assert!(cli.date.is_none());
        assert!(cli.config.is_none());
        assert!(cli.flags().send_email);
    }

    #[test]
    fn bad_dates_are_rejected() {
        assert!(Cli::try_parse_from(["optreport", "--date=10/01/2024"]).is_err());
        assert!(Cli::try_parse_from(["optreport", "--date=2024-02-30"]).is_err());
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(load_config(Some(&missing)).is_err());
    }

    #[test]
    fn explicit_config_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[filters]\ntop_n = 7\n").unwrap();
        assert_eq!(load_config(Some(&path)).unwrap().filters.top_n, 7);
    }
}
