//! Stage adapters and the collaborator traits they drive.

pub mod acquisition;
pub mod analysis;
pub mod notification;
pub mod report;

pub use acquisition::{
    classify_exit, Acquirer, AcquisitionError, AcquisitionOutcome, AcquisitionStage,
    CommandAcquirer, ExitClass,
};
pub use analysis::{
    rank_trades, AnalysisError, AnalysisOutcome, AnalysisStats, Analyzer, ParquetAnalyzer,
    RankedTrade,
};
pub use notification::{
    compose_report_email, notifier_from_config, AlertSeverity, FailureAlert, HttpRelay, LogNotifier,
    MailRelayNotifier, NotificationError, Notifier, RelayMessage, RelayTransport, ReportEmail,
};
pub use report::{render_report, RenderedReport, ReportError, ReportRenderer};
