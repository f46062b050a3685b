//! Run configuration, loaded from TOML.
//!
//! Every section has defaults, so an empty file (or no file) is a valid
//! configuration. `${VAR}` and `$VAR` references in the raw text are expanded
//! from the process environment before parsing; unknown variables stay as
//! written so a missing secret shows up verbatim rather than as an empty string.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use optreport_core::artifact::ArtifactStore;
use optreport_core::calendar::{load_holidays_file, parse_market_holidays};
use optreport_core::{Backoff, BusinessDayCalendar, ExecutionLock, RetryPolicy};

/// Extra time allowed on top of the acquisition budget for analysis, report and email.
const POST_ACQUISITION_ALLOWANCE: Duration = Duration::from_secs(30 * 60);
/// Bounds for a per-attempt acquisition timeout derived from the retry interval.
const MIN_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("notifier setup failed: {0}")]
    Notifier(String),
}

// ── Sections ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub acquisition: AcquisitionConfig,
    pub retry: RetryConfig,
    pub lock: LockConfig,
    pub calendar: CalendarConfig,
    pub filters: FilterConfig,
    pub email: EmailConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    /// Defaults to `data_dir`.
    pub lock_dir: Option<PathBuf>,
    pub logs_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/processed"),
            reports_dir: PathBuf::from("output/reports"),
            lock_dir: None,
            logs_dir: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Executable that downloads and normalizes the snapshot.
    pub command: String,
    /// Arguments placed before `--date=` and `--output=`.
    pub args: Vec<String>,
    /// Per-attempt limit; the child is killed when it is exceeded.
    /// Unset: the retry interval, clamped to between one and ten minutes.
    pub timeout_secs: Option<u64>,
    pub artifact_prefix: String,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            command: "Rscript".to_string(),
            args: vec!["scripts/fetch_cotahist.R".to_string()],
            timeout_secs: None,
            artifact_prefix: "cotahist".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub interval_minutes: f64,
    pub backoff: Backoff,
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            interval_minutes: 30.0,
            backoff: Backoff::Linear,
            jitter_fraction: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Unset: derived from the retry and acquisition budget.
    pub stale_after_minutes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub include_state_holidays: bool,
    /// Exchange-only closures, ISO dates.
    pub market_holidays: Vec<String>,
    pub holidays_file: Option<PathBuf>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            include_state_holidays: true,
            market_holidays: Vec::new(),
            holidays_file: None,
        }
    }
}

/// What counts as a large trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub min_financial_volume: f64,
    pub max_operations: i64,
    pub top_n: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_financial_volume: 100_000.0,
            max_operations: 5,
            top_n: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    /// HTTP mail relay endpoint. Unset: reports and alerts are only logged.
    pub relay_url: Option<String>,
    pub api_token: Option<String>,
    pub sender: String,
    pub recipients: Vec<String>,
    /// `{date}` is replaced with the trading date (DD/MM/YYYY).
    pub subject_template: String,
    /// Deadline for one delivery, relay retries included.
    pub timeout_secs: u64,
    /// Relay posts per message. Transport errors and 5xx are retried.
    pub max_attempts: u32,
    /// First wait between relay posts; doubles after each failure.
    pub retry_base_secs: u64,
    pub send_failure_alerts: bool,
    pub alert_on_concurrent_run: bool,
}

impl EmailConfig {
    /// Exponential backoff for relay posts: base, 2×base, 4×base, ...
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(self.retry_base_secs))
            .with_backoff(Backoff::Exponential { factor: 2.0 })
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            relay_url: None,
            api_token: None,
            sender: String::new(),
            recipients: Vec::new(),
            subject_template: "Relatorio B3 Opcoes - {date}".to_string(),
            timeout_secs: 30,
            max_attempts: 3,
            retry_base_secs: 5,
            send_failure_alerts: true,
            alert_on_concurrent_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub prefix: String,
    pub title: String,
    /// A rendered PDF smaller than this is treated as a failed render.
    pub min_bytes: u64,
    pub export_csv: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            prefix: "relatorio".to_string(),
            title: "Grandes Operacoes em Opcoes - B3".to_string(),
            min_bytes: 512,
            export_csv: true,
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────

impl AppConfig {
    /// Load from a TOML file, expanding environment references first.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let (expanded, unresolved) = expand_env(&raw);
        for name in &unresolved {
            warn!(
                variable = %name,
                config = %path.display(),
                "unresolved environment variable in config"
            );
        }
        Self::from_toml(&expanded)
    }

    /// Load `path` if it exists; a missing file is only an error when `required`.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        if !required && !path.exists() {
            warn!(config = %path.display(), "config file not found; using defaults");
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    /// Parse a TOML string (no environment expansion).
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.acquisition.command.trim().is_empty() {
            return invalid("acquisition.command must not be empty");
        }
        if self.acquisition.timeout_secs == Some(0) {
            return invalid("acquisition.timeout_secs must be positive");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !(self.retry.interval_minutes.is_finite() && self.retry.interval_minutes >= 0.0) {
            return invalid("retry.interval_minutes must be a non-negative number");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return invalid("retry.jitter_fraction must be within [0, 1]");
        }
        if let Backoff::Exponential { factor } = self.retry.backoff {
            if !(factor.is_finite() && factor >= 1.0) {
                return invalid("retry.backoff.factor must be >= 1");
            }
        }
        if self.filters.top_n == 0 {
            return invalid("filters.top_n must be at least 1");
        }
        if self.filters.max_operations < 1 {
            return invalid("filters.max_operations must be at least 1");
        }
        if self.email.timeout_secs == 0 {
            return invalid("email.timeout_secs must be positive");
        }
        if self.email.max_attempts == 0 {
            return invalid("email.max_attempts must be at least 1");
        }
        if self.report.prefix.trim().is_empty()
            || self.acquisition.artifact_prefix.trim().is_empty()
        {
            return invalid("file prefixes must not be empty");
        }
        Ok(())
    }

    // ── Derived components ──────────────────────────────────────────

    /// Built-in holidays plus configured overrides.
    ///
    /// An unreadable holidays file is logged and skipped; the run goes on with
    /// the national table and the inline `market_holidays`.
    pub fn calendar(&self) -> BusinessDayCalendar {
        let inline = parse_market_holidays(&self.calendar.market_holidays);
        let mut calendar = BusinessDayCalendar::new(inline)
            .with_state_holidays(self.calendar.include_state_holidays);
        if let Some(path) = &self.calendar.holidays_file {
            match load_holidays_file(path) {
                Ok(extra) => calendar.extend_market_holidays(extra),
                Err(e) => warn!(error = %e, "ignoring market holidays file"),
            }
        }
        calendar
    }

    /// Retry policy for acquisition. `fast_retry` drops the wait to zero.
    pub fn retry_policy(&self, fast_retry: bool) -> RetryPolicy {
        let interval = if fast_retry {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(self.retry.interval_minutes * 60.0)
                .unwrap_or(Duration::ZERO)
        };
        RetryPolicy::new(self.retry.max_attempts, interval)
            .with_backoff(self.retry.backoff)
            .with_jitter(self.retry.jitter_fraction)
    }

    /// Per-attempt acquisition limit. An attempt may run until the next one
    /// would have been scheduled.
    pub fn acquisition_timeout(&self) -> Duration {
        match self.acquisition.timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self
                .retry_policy(false)
                .base_interval()
                .clamp(MIN_ACQUISITION_TIMEOUT, MAX_ACQUISITION_TIMEOUT),
        }
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_secs(self.email.timeout_secs)
    }

    /// Lock age after which a claim is considered abandoned.
    ///
    /// Default: twice the worst-case run (every backoff wait plus every
    /// acquisition attempt timing out) plus the post-acquisition allowance.
    pub fn lock_stale_after(&self) -> Duration {
        if let Some(minutes) = self.lock.stale_after_minutes {
            return Duration::from_secs(minutes.saturating_mul(60));
        }
        let policy = self.retry_policy(false);
        let attempts = self
            .acquisition_timeout()
            .saturating_mul(policy.max_attempts());
        policy
            .worst_case_wait()
            .saturating_add(attempts)
            .saturating_add(POST_ACQUISITION_ALLOWANCE)
            .saturating_mul(2)
    }

    pub fn lock_dir(&self) -> &Path {
        self.paths
            .lock_dir
            .as_deref()
            .unwrap_or(&self.paths.data_dir)
    }

    pub fn execution_lock(&self) -> ExecutionLock {
        ExecutionLock::new(self.lock_dir(), self.lock_stale_after())
    }

    pub fn artifact_store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.paths.data_dir, &self.acquisition.artifact_prefix)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.paths.logs_dir.join("runs.jsonl")
    }
}

// ── Environment expansion ───────────────────────────────────────────

/// Expand `${VAR}` / `$VAR` from the process environment.
///
/// Returns the expanded text and the names that could not be resolved.
pub fn expand_env(raw: &str) -> (String, Vec<String>) {
    expand_with(raw, |name| std::env::var(name).ok())
}

/// Expansion with an explicit lookup.
pub fn expand_with(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> (String, Vec<String>) {
    let mut out = String::with_capacity(raw.len());
    let mut unresolved = Vec::new();
    let mut rest = raw;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) if is_var_name(&braced[..end]) => (&braced[..end], end + 2),
                _ => ("", 0),
            }
        } else {
            let len = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            let name = &after[..len];
            if is_var_name(name) {
                (name, len)
            } else {
                ("", 0)
            }
        };

        if consumed == 0 {
            out.push('$');
            rest = after;
            continue;
        }

        let original = &rest[pos..pos + 1 + consumed];
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => {
                out.push_str(original);
                if !unresolved.iter().any(|n| n == name) {
                    unresolved.push(name.to_string());
                }
            }
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    (out, unresolved)
}

fn is_var_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
