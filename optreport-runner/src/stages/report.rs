//! Report stage: render, then check the PDF actually landed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use optreport_core::TradingDate;

use crate::stages::analysis::AnalysisOutcome;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report I/O at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("report not found at {}", path.display())]
    Missing { path: PathBuf },

    #[error("report at {} is {bytes} bytes, expected at least {min_bytes}", path.display())]
    TooSmall {
        path: PathBuf,
        bytes: u64,
        min_bytes: u64,
    },
}

impl ReportError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        ReportError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Paths produced by a render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedReport {
    pub pdf: PathBuf,
    pub csv: Option<PathBuf>,
    pub pages: usize,
}

/// The report collaborator. Must write the PDF at a path derived from the date.
pub trait ReportRenderer: Send + Sync {
    fn render(
        &self,
        date: &TradingDate,
        analysis: &AnalysisOutcome,
    ) -> Result<RenderedReport, ReportError>;
}

/// Render and verify the PDF exists with at least `min_bytes`. Returns the PDF size.
pub fn render_report(
    renderer: &dyn ReportRenderer,
    date: &TradingDate,
    analysis: &AnalysisOutcome,
    min_bytes: u64,
) -> Result<(RenderedReport, u64), ReportError> {
    let report = renderer.render(date, analysis)?;
    let bytes = verify_pdf(&report.pdf, min_bytes)?;
    Ok((report, bytes))
}

fn verify_pdf(path: &Path, min_bytes: u64) -> Result<u64, ReportError> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ReportError::Missing {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(ReportError::io(path, e)),
    };
    let bytes = meta.len();
    if bytes < min_bytes {
        return Err(ReportError::TooSmall {
            path: path.to_path_buf(),
            bytes,
            min_bytes,
        });
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use optreport_core::BusinessDayCalendar;

    /// Writes `size` bytes (or nothing) at a fixed path.
    struct FixedRenderer {
        path: PathBuf,
        size: Option<usize>,
    }

    impl ReportRenderer for FixedRenderer {
        fn render(
            &self,
            _: &TradingDate,
            _: &AnalysisOutcome,
        ) -> Result<RenderedReport, ReportError> {
            if let Some(size) = self.size {
                std::fs::write(&self.path, vec![b'%'; size])
                    .map_err(|e| ReportError::io(&self.path, e))?;
            }
            Ok(RenderedReport {
                pdf: self.path.clone(),
                csv: None,
                pages: 1,
            })
        }
    }

    fn date() -> TradingDate {
        BusinessDayCalendar::default()
            .resolve(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap())
            .unwrap()
    }

    #[test]
    fn accepts_a_large_enough_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let r = FixedRenderer {
            path: dir.path().join("r.pdf"),
            size: Some(600),
        };
        let (report, bytes) = render_report(&r, &date(), &AnalysisOutcome::default(), 512).unwrap();
        assert_eq!(bytes, 600);
        assert_eq!(report.pdf, dir.path().join("r.pdf"));
    }

    #[test]
    fn rejects_missing_and_truncated_pdfs() {
        let dir = tempfile::tempdir().unwrap();
        let missing = FixedRenderer {
            path: dir.path().join("none.pdf"),
            size: None,
        };
        assert!(matches!(
            render_report(&missing, &date(), &AnalysisOutcome::default(), 1),
            Err(ReportError::Missing { .. })
        ));

        let tiny = FixedRenderer {
            path: dir.path().join("tiny.pdf"),
            size: Some(10),
        };
        assert!(matches!(
            render_report(&tiny, &date(), &AnalysisOutcome::default(), 512),
            Err(ReportError::TooSmall { bytes: 10, .. })
        ));
    }
}
