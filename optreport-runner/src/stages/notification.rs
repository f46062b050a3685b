//! Notification: report email and fail-safe alerts.
//!
//! Every delivery runs on a worker thread bounded by an explicit deadline, so a
//! hung transport cannot hold the run (and its lock) open. Relay posts are
//! retried with exponential backoff inside that deadline; authentication and
//! other client errors are not.

use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::blocking::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use optreport_core::{RetryError, RetryPolicy, Retryable, Sleeper, ThreadSleeper, TradingDate};

use crate::config::{ConfigError, EmailConfig};
use crate::context::Stage;
use crate::error::{panic_message, FailureKind};
use crate::report::{fmt_brl, fmt_date_br, fmt_decimal, fmt_int};
use crate::stages::analysis::AnalysisOutcome;

/// Trades listed in the email body.
const EMAIL_TOP_TRADES: usize = 5;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("delivery timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("relay rejected the message: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("cannot read attachment {}: {source}", path.display())]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notifier panicked: {0}")]
    Panicked(String),
}

// ── Messages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEmail {
    pub trading_date: NaiveDate,
    pub subject: String,
    pub body: String,
    pub attachment: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Critical,
    /// Expected conditions such as a concurrent run.
    Notice,
}

/// Sent when a run ends in FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureAlert {
    pub run_id: String,
    pub requested_date: Option<NaiveDate>,
    pub reference_date: NaiveDate,
    pub trading_date: Option<NaiveDate>,
    pub stage: Stage,
    pub kind: FailureKind,
    pub error: String,
    pub severity: AlertSeverity,
}

impl FailureAlert {
    /// The date the alert is about: resolved, else requested, else the reference day.
    pub fn subject_date(&self) -> NaiveDate {
        self.trading_date
            .or(self.requested_date)
            .unwrap_or(self.reference_date)
    }

    pub fn subject(&self) -> String {
        let prefix = match self.severity {
            AlertSeverity::Critical => "ERRO",
            AlertSeverity::Notice => "AVISO",
        };
        format!(
            "{prefix} - Relatorio B3 Opcoes - {}",
            fmt_date_br(self.subject_date())
        )
    }

    pub fn body(&self) -> String {
        let date_or_dash =
            |d: Option<NaiveDate>| d.map(fmt_date_br).unwrap_or_else(|| "-".to_string());
        let mut s = String::new();
        let _ = writeln!(s, "A execucao do relatorio diario falhou.");
        let _ = writeln!(s);
        let _ = writeln!(s, "Run: {}", self.run_id);
        let _ = writeln!(s, "Data solicitada: {}", date_or_dash(self.requested_date));
        let _ = writeln!(s, "Pregao resolvido: {}", date_or_dash(self.trading_date));
        let _ = writeln!(s, "Etapa: {}", self.stage);
        let _ = writeln!(s, "Classificacao: {}", self.kind);
        let _ = writeln!(s, "Erro: {}", self.error);
        let _ = writeln!(s);
        let _ = writeln!(s, "Consulte logs/execution.log para detalhes.");
        s
    }
}

/// Build the report email from the analysis.
pub fn compose_report_email(
    config: &EmailConfig,
    date: &TradingDate,
    analysis: &AnalysisOutcome,
    pdf: &Path,
) -> ReportEmail {
    let date_br = fmt_date_br(date.date());
    let stats = &analysis.stats;

    let mut body = String::new();
    let _ = writeln!(body, "Relatorio de grandes operacoes em opcoes - pregao {date_br}");
    let _ = writeln!(body);
    let _ = writeln!(body, "Opcoes negociadas: {}", fmt_int(stats.total_options as i64));
    let _ = writeln!(body, "Volume financeiro do dia: {}", fmt_brl(stats.total_volume));
    let _ = writeln!(body, "Operacoes apos filtros: {}", fmt_int(stats.after_filters as i64));
    let _ = writeln!(
        body,
        "Volume das selecionadas: {} ({}% do dia)",
        fmt_brl(stats.top_n_volume),
        fmt_decimal(stats.top_n_pct, 2)
    );
    let _ = writeln!(body);

    if analysis.is_empty() {
        let _ = writeln!(body, "Nenhuma grande operacao encontrada para o pregao.");
    } else {
        let _ = writeln!(body, "Top {}:", analysis.ranked.len().min(EMAIL_TOP_TRADES));
        for r in analysis.ranked.iter().take(EMAIL_TOP_TRADES) {
            let _ = writeln!(
                body,
                "  {}. {} ({} {}) ticket medio {} | volume {} | {} negocios",
                r.rank,
                r.trade.symbol,
                r.trade.underlying,
                r.trade.option_type,
                fmt_brl(r.average_ticket),
                fmt_brl(r.trade.financial_volume),
                r.trade.trade_count
            );
        }
    }
    let _ = writeln!(body);
    let _ = writeln!(body, "Relatorio completo em anexo.");

    ReportEmail {
        trading_date: date.date(),
        subject: config.subject_template.replace("{date}", &date_br),
        body,
        attachment: pdf.to_path_buf(),
    }
}

// ── Collaborator ────────────────────────────────────────────────────

/// The email-delivery collaborator.
pub trait Notifier: Send + Sync {
    fn send_report(&self, email: &ReportEmail) -> Result<(), NotificationError>;
    fn send_alert(&self, alert: &FailureAlert) -> Result<(), NotificationError>;
}

/// Writes messages to the log instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_report(&self, email: &ReportEmail) -> Result<(), NotificationError> {
        info!(
            subject = %email.subject,
            attachment = %email.attachment.display(),
            "no mail relay configured; report email logged only"
        );
        Ok(())
    }

    fn send_alert(&self, alert: &FailureAlert) -> Result<(), NotificationError> {
        error!(
            subject = %alert.subject(),
            stage = %alert.stage,
            kind = %alert.kind,
            error = %alert.error,
            "no mail relay configured; failure alert logged only"
        );
        Ok(())
    }
}

// ── Mail relay ──────────────────────────────────────────────────────

impl Retryable for NotificationError {
    /// Transport errors, 5xx and 429 may clear up. Auth and other 4xx will not.
    fn is_retryable(&self) -> bool {
        match self {
            NotificationError::Transport(_) => true,
            NotificationError::Rejected { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// A message as posted to the relay.
#[derive(Debug, Clone, Copy)]
pub struct RelayMessage<'a> {
    pub subject: &'a str,
    pub body: &'a str,
    pub attachment: Option<&'a Path>,
}

/// One exchange with the mail relay.
pub trait RelayTransport: Send + Sync {
    fn post(&self, message: &RelayMessage<'_>) -> Result<(), NotificationError>;
}

/// Multipart form POST with an optional bearer token.
pub struct HttpRelay {
    client: reqwest::blocking::Client,
    url: String,
    token: Option<String>,
    sender: String,
    recipients: Vec<String>,
    timeout: Duration,
}

impl HttpRelay {
    pub fn new(url: impl Into<String>, config: &EmailConfig) -> Result<Self, ConfigError> {
        if config.recipients.is_empty() {
            return Err(ConfigError::Notifier("email.recipients is empty".to_string()));
        }
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Notifier(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            token: config.api_token.clone().filter(|t| is_configured(t)),
            sender: config.sender.clone(),
            recipients: config.recipients.clone(),
            timeout,
        })
    }
}

impl RelayTransport for HttpRelay {
    fn post(&self, message: &RelayMessage<'_>) -> Result<(), NotificationError> {
        let mut form = Form::new()
            .text("from", self.sender.clone())
            .text("to", self.recipients.join(","))
            .text("subject", message.subject.to_string())
            .text("text", message.body.to_string());

        if let Some(path) = message.attachment {
            let bytes = std::fs::read(path).map_err(|source| NotificationError::Attachment {
                path: path.to_path_buf(),
                source,
            })?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "relatorio.pdf".to_string());
            let part = Part::bytes(bytes)
                .file_name(name)
                .mime_str("application/pdf")
                .map_err(|e| NotificationError::Transport(e.to_string()))?;
            form = form.part("attachment", part);
        }

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().map_err(|e| {
            if e.is_timeout() {
                NotificationError::Timeout { after: self.timeout }
            } else {
                NotificationError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }
        Ok(())
    }
}

/// Sends through a relay transport, retrying transient failures.
pub struct MailRelayNotifier {
    transport: Box<dyn RelayTransport>,
    policy: RetryPolicy,
    sleeper: Box<dyn Sleeper>,
}

impl MailRelayNotifier {
    pub fn new(url: impl Into<String>, config: &EmailConfig) -> Result<Self, ConfigError> {
        let relay = HttpRelay::new(url, config)?;
        Ok(Self::with_transport(Box::new(relay), config.retry_policy()))
    }

    pub fn with_transport(transport: Box<dyn RelayTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            sleeper: Box::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    fn deliver(&self, message: RelayMessage<'_>) -> Result<u32, NotificationError> {
        self.policy
            .run_with_retry(self.sleeper.as_ref(), |_| self.transport.post(&message))
            .map(|done| done.attempts)
            .map_err(RetryError::into_last_error)
    }
}

impl Notifier for MailRelayNotifier {
    fn send_report(&self, email: &ReportEmail) -> Result<(), NotificationError> {
        let attempts = self.deliver(RelayMessage {
            subject: &email.subject,
            body: &email.body,
            attachment: Some(&email.attachment),
        })?;
        info!(subject = %email.subject, attempts, "report email sent");
        Ok(())
    }

    fn send_alert(&self, alert: &FailureAlert) -> Result<(), NotificationError> {
        let subject = alert.subject();
        let attempts = self.deliver(RelayMessage {
            subject: &subject,
            body: &alert.body(),
            attachment: None,
        })?;
        info!(subject = %subject, attempts, "failure alert sent");
        Ok(())
    }
}

/// Pick the notifier for `config`: the relay when enabled and configured, else the log.
pub fn notifier_from_config(config: &EmailConfig) -> Result<Arc<dyn Notifier>, ConfigError> {
    match config.relay_url.as_deref().map(str::trim) {
        Some(url) if config.enabled && is_configured(url) => {
            Ok(Arc::new(MailRelayNotifier::new(url, config)?))
        }
        _ => {
            if config.enabled {
                warn!("email.relay_url not set; emails will only be logged");
            }
            Ok(Arc::new(LogNotifier))
        }
    }
}

/// Empty values and unexpanded `$VAR` references count as unset.
fn is_configured(value: &str) -> bool {
    !value.is_empty() && !value.starts_with('$')
}

// ── Deadline ────────────────────────────────────────────────────────

/// Run `deliver` on a worker thread and wait at most `deadline` for it.
///
/// On timeout the worker is detached; its eventual result is dropped.
pub fn deliver_with_deadline<F>(
    notifier: Arc<dyn Notifier>,
    deadline: Duration,
    deliver: F,
) -> Result<(), NotificationError>
where
    F: FnOnce(&dyn Notifier) -> Result<(), NotificationError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("notify".to_string())
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| deliver(notifier.as_ref())))
                .unwrap_or_else(|payload| {
                    Err(NotificationError::Panicked(panic_message(payload.as_ref())))
                });
            let _ = tx.send(result);
        })
        .map_err(|e| {
            NotificationError::Transport(format!("failed to spawn delivery thread: {e}"))
        })?;

    match rx.recv_timeout(deadline) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(NotificationError::Timeout { after: deadline }),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(NotificationError::Panicked(
            "delivery thread exited without a result".to_string(),
        )),
    }
}

pub fn send_report(
    notifier: &Arc<dyn Notifier>,
    email: ReportEmail,
    deadline: Duration,
) -> Result<(), NotificationError> {
    deliver_with_deadline(Arc::clone(notifier), deadline, move |n| n.send_report(&email))
}

pub fn send_alert(
    notifier: &Arc<dyn Notifier>,
    alert: FailureAlert,
    deadline: Duration,
) -> Result<(), NotificationError> {
    deliver_with_deadline(Arc::clone(notifier), deadline, move |n| n.send_alert(&alert))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::analysis::{AnalysisStats, RankedTrade};
    use optreport_core::{BusinessDayCalendar, OptionTrade, OptionType, RecordingSleeper};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn date() -> TradingDate {
        BusinessDayCalendar::default()
            .resolve(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap())
            .unwrap()
    }

    fn ranked(rank: usize) -> RankedTrade {
        RankedTrade {
            rank,
            trade: OptionTrade {
                trade_date: date().date(),
                symbol: format!("VALEB{rank}"),
                underlying: "VALE3".to_string(),
                option_type: OptionType::Call,
                maturity_date: NaiveDate::from_ymd_opt(2024, 2, 16).unwrap(),
                strike_price: Some(70.0),
                trade_count: 1,
                contracts: 1000,
                financial_volume: 250_000.0,
                last_price: Some(2.5),
                average_price: Some(2.5),
            },
            price: Some(2.5),
            average_ticket: 250_000.0,
            day_share_pct: 1.0,
        }
    }

    fn alert(severity: AlertSeverity) -> FailureAlert {
        FailureAlert {
            run_id: "abc".to_string(),
            requested_date: None,
            reference_date: NaiveDate::from_ymd_opt(2024, 1, 11).unwrap(),
            trading_date: Some(date().date()),
            stage: Stage::Acquisition,
            kind: FailureKind::RetriesExhausted,
            error: "no data".to_string(),
            severity,
        }
    }

    struct SlowNotifier(Duration);

    impl Notifier for SlowNotifier {
        fn send_report(&self, _: &ReportEmail) -> Result<(), NotificationError> {
            thread::sleep(self.0);
            Ok(())
        }
        fn send_alert(&self, _: &FailureAlert) -> Result<(), NotificationError> {
            panic!("alert transport exploded")
        }
    }

    #[derive(Default)]
    struct CountingNotifier(AtomicUsize);

    impl Notifier for CountingNotifier {
        fn send_report(&self, _: &ReportEmail) -> Result<(), NotificationError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn send_alert(&self, _: &FailureAlert) -> Result<(), NotificationError> {
            Ok(())
        }
    }

    #[test]
    fn email_lists_at_most_five_trades() {
        let analysis = AnalysisOutcome {
            ranked: (1..=8).map(ranked).collect(),
            stats: AnalysisStats::default(),
        };
        let email =
            compose_report_email(&EmailConfig::default(), &date(), &analysis, Path::new("r.pdf"));
        assert_eq!(email.subject, "Relatorio B3 Opcoes - 10/01/2024");
        assert!(email.body.contains("Top 5:"));
        assert!(email.body.contains("5. VALEB5"));
        assert!(!email.body.contains("6. VALEB6"));
    }

    #[test]
    fn empty_analysis_email_says_so() {
        let email = compose_report_email(
            &EmailConfig::default(),
            &date(),
            &AnalysisOutcome::default(),
            Path::new("r.pdf"),
        );
        assert!(email.body.contains("Nenhuma grande operacao"));
    }

    #[test]
    fn alert_subject_reflects_severity_and_date() {
        assert_eq!(
            alert(AlertSeverity::Critical).subject(),
            "ERRO - Relatorio B3 Opcoes - 10/01/2024"
        );
        let mut notice = alert(AlertSeverity::Notice);
        notice.trading_date = None;
        assert_eq!(notice.subject(), "AVISO - Relatorio B3 Opcoes - 11/01/2024");
        assert!(alert(AlertSeverity::Critical).body().contains("Etapa: acquisition"));
    }

    #[test]
    fn hung_delivery_times_out() {
        let notifier: Arc<dyn Notifier> = Arc::new(SlowNotifier(Duration::from_secs(5)));
        let email = compose_report_email(
            &EmailConfig::default(),
            &date(),
            &AnalysisOutcome::default(),
            Path::new("r.pdf"),
        );
        let result = send_report(&notifier, email, Duration::from_millis(50));
        assert!(matches!(result, Err(NotificationError::Timeout { .. })));
    }

    #[test]
    fn panicking_delivery_is_an_error() {
        let notifier: Arc<dyn Notifier> = Arc::new(SlowNotifier(Duration::ZERO));
        let result = send_alert(&notifier, alert(AlertSeverity::Critical), Duration::from_secs(5));
        match result {
            Err(NotificationError::Panicked(msg)) => assert!(msg.contains("exploded")),
            other => panic!("expected Panicked, got {other:?}"),
        }
    }

    #[test]
    fn successful_delivery_returns_ok() {
        let counter = Arc::new(CountingNotifier::default());
        let notifier: Arc<dyn Notifier> = counter.clone();
        let email = compose_report_email(
            &EmailConfig::default(),
            &date(),
            &AnalysisOutcome::default(),
            Path::new("r.pdf"),
        );
        send_report(&notifier, email, Duration::from_secs(5)).unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn relay_requires_recipients() {
        let config = EmailConfig::default();
        assert!(MailRelayNotifier::new("http://localhost:1/send", &config).is_err());
    }

    #[test]
    fn missing_relay_url_falls_back_to_log() {
        let config = EmailConfig::default();
        assert!(notifier_from_config(&config).is_ok());
    }

    #[test]
    fn unexpanded_references_count_as_unset() {
        assert!(!is_configured("${MAIL_RELAY_URL}"));
        assert!(!is_configured(""));
        assert!(is_configured("https://relay.example.com/send"));

        let config = EmailConfig {
            relay_url: Some("${MAIL_RELAY_URL}".to_string()),
            ..EmailConfig::default()
        };
        assert!(notifier_from_config(&config).is_ok());
    }

    // ── Relay retries ───────────────────────────────────────────────

    enum Reply {
        Accepted,
        Down,
        Status(u16),
    }

    struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        posts: Arc<AtomicUsize>,
    }

    impl RelayTransport for ScriptedTransport {
        fn post(&self, _: &RelayMessage<'_>) -> Result<(), NotificationError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            match self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Accepted) {
                Reply::Accepted => Ok(()),
                Reply::Down => Err(NotificationError::Transport("connection refused".to_string())),
                Reply::Status(status) => Err(NotificationError::Rejected {
                    status,
                    body: String::new(),
                }),
            }
        }
    }

    struct SharedSleeper(Arc<RecordingSleeper>);

    impl Sleeper for SharedSleeper {
        fn sleep(&self, duration: Duration) {
            self.0.sleep(duration);
        }
    }

    fn relay(replies: Vec<Reply>) -> (MailRelayNotifier, Arc<AtomicUsize>, Arc<RecordingSleeper>) {
        let posts = Arc::new(AtomicUsize::new(0));
        let sleeps = Arc::new(RecordingSleeper::new());
        let transport = ScriptedTransport {
            replies: Mutex::new(replies.into()),
            posts: posts.clone(),
        };
        let policy = EmailConfig::default().retry_policy();
        let notifier = MailRelayNotifier::with_transport(Box::new(transport), policy)
            .with_sleeper(Box::new(SharedSleeper(sleeps.clone())));
        (notifier, posts, sleeps)
    }

    fn email() -> ReportEmail {
        compose_report_email(
            &EmailConfig::default(),
            &date(),
            &AnalysisOutcome::default(),
            Path::new("r.pdf"),
        )
    }

    #[test]
    fn transient_relay_failures_are_retried_with_doubling_waits() {
        let (notifier, posts, sleeps) =
            relay(vec![Reply::Down, Reply::Status(503), Reply::Accepted]);
        notifier.send_report(&email()).unwrap();
        assert_eq!(posts.load(Ordering::SeqCst), 3);
        assert_eq!(
            sleeps.recorded(),
            vec![Duration::from_secs(5), Duration::from_secs(10)]
        );
    }

    #[test]
    fn auth_rejection_is_not_retried() {
        for status in [401, 403] {
            let (notifier, posts, sleeps) = relay(vec![Reply::Status(status)]);
            match notifier.send_alert(&alert(AlertSeverity::Critical)) {
                Err(NotificationError::Rejected { status: s, .. }) => assert_eq!(s, status),
                other => panic!("expected rejection, got {other:?}"),
            }
            assert_eq!(posts.load(Ordering::SeqCst), 1);
            assert!(sleeps.recorded().is_empty());
        }
    }

    #[test]
    fn relay_gives_up_after_configured_attempts() {
        let (notifier, posts, _) =
            relay(vec![Reply::Down, Reply::Down, Reply::Down, Reply::Accepted]);
        assert!(matches!(
            notifier.send_report(&email()),
            Err(NotificationError::Transport(_))
        ));
        assert_eq!(posts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        let rejected = |status| NotificationError::Rejected {
            status,
            body: String::new(),
        };
        assert!(NotificationError::Transport("reset".to_string()).is_retryable());
        assert!(rejected(502).is_retryable());
        assert!(rejected(429).is_retryable());
        assert!(!rejected(400).is_retryable());
        assert!(!rejected(401).is_retryable());
        assert!(!NotificationError::Timeout {
            after: Duration::from_secs(1)
        }
        .is_retryable());
    }
}
