//! Default report collaborator: a text-only PDF plus a CSV of the ranked set.

pub mod export;
pub mod pdf;

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{info, warn};

use optreport_core::TradingDate;

use crate::config::ReportConfig;
use crate::stages::analysis::AnalysisOutcome;
use crate::stages::report::{RenderedReport, ReportError, ReportRenderer};

use self::pdf::{PdfDocument, TextStyle};

// ── Formatting ──────────────────────────────────────────────────────

/// `dd/mm/YYYY`.
pub fn fmt_date_br(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

/// Integer with `.` thousands separators.
pub fn fmt_int(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let grouped = group_thousands(&digits);
    if value < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

/// Brazilian currency: `R$ 1.234.567,89`.
pub fn fmt_brl(value: f64) -> String {
    format!("R$ {}", fmt_decimal(value, 2))
}

/// Decimal with `.` thousands and `,` fraction separators.
pub fn fmt_decimal(value: f64, places: usize) -> String {
    let raw = format!("{:.*}", places, value.abs());
    let (int_part, frac_part) = raw.split_once('.').unwrap_or((raw.as_str(), ""));
    let mut out = String::new();
    if value < 0.0 && raw.chars().any(|c| c.is_ascii_digit() && c != '0') {
        out.push('-');
    }
    out.push_str(&group_thousands(int_part));
    if !frac_part.is_empty() {
        out.push(',');
        out.push_str(frac_part);
    }
    out
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(c);
    }
    out
}

fn truncate(text: &str, width: usize) -> String {
    text.chars().take(width).collect()
}

// ── Renderer ────────────────────────────────────────────────────────

/// Writes `<reports_dir>/<prefix>_<date>.pdf` and, optionally, the matching `.csv`.
#[derive(Debug, Clone)]
pub struct PdfReportRenderer {
    reports_dir: PathBuf,
    prefix: String,
    title: String,
    export_csv: bool,
}

impl PdfReportRenderer {
    pub fn new(reports_dir: impl Into<PathBuf>, config: &ReportConfig) -> Self {
        Self {
            reports_dir: reports_dir.into(),
            prefix: config.prefix.clone(),
            title: config.title.clone(),
            export_csv: config.export_csv,
        }
    }

    pub fn pdf_path(&self, date: &TradingDate) -> PathBuf {
        self.reports_dir
            .join(format!("{}_{}.pdf", self.prefix, date.iso()))
    }

    pub fn csv_path(&self, date: &TradingDate) -> PathBuf {
        self.reports_dir
            .join(format!("{}_{}.csv", self.prefix, date.iso()))
    }

    /// Lay out the report.
    pub fn build_document(&self, date: &TradingDate, analysis: &AnalysisOutcome) -> PdfDocument {
        let stats = &analysis.stats;
        let mut doc = PdfDocument::new(format!("{} - {}", self.title, fmt_date_br(date.date())));

        doc.line(TextStyle::Title, &self.title);
        doc.line(TextStyle::Body, format!("Pregao: {}", fmt_date_br(date.date())));
        doc.line(
            TextStyle::Body,
            format!(
                "Gerado em: {}",
                chrono::Local::now().format("%d/%m/%Y %H:%M")
            ),
        );
        doc.blank();

        doc.line(TextStyle::Heading, "Resumo");
        doc.line(
            TextStyle::Body,
            format!("Opcoes negociadas: {}", fmt_int(stats.total_options as i64)),
        );
        doc.line(
            TextStyle::Body,
            format!("Volume financeiro do dia: {}", fmt_brl(stats.total_volume)),
        );
        doc.line(
            TextStyle::Body,
            format!("Operacoes apos filtros: {}", fmt_int(stats.after_filters as i64)),
        );
        doc.line(
            TextStyle::Body,
            format!(
                "Volume das {} maiores: {} ({}% do dia)",
                analysis.ranked.len(),
                fmt_brl(stats.top_n_volume),
                fmt_decimal(stats.top_n_pct, 2)
            ),
        );
        doc.line(
            TextStyle::Body,
            format!("Calls: {}   Puts: {}", stats.calls, stats.puts),
        );
        doc.blank();

        doc.line(TextStyle::Heading, "Maiores tickets medios");
        if analysis.is_empty() {
            doc.line(
                TextStyle::Body,
                "Nenhuma grande operacao encontrada para o pregao.",
            );
            return doc;
        }

        let header = format!(
            "{:>3}  {:<12} {:<8} {:<4} {:<10} {:>9} {:>5} {:>11} {:>18} {:>18} {:>9} {:>6}",
            "#", "Codigo", "Ativo", "Tipo", "Vencimento", "Strike", "Neg", "Contratos",
            "Volume", "Ticket medio", "Preco", "% Dia"
        );
        doc.line(TextStyle::Mono, header);
        for r in &analysis.ranked {
            let t = &r.trade;
            doc.line(
                TextStyle::Mono,
                format!(
                    "{:>3}  {:<12} {:<8} {:<4} {:<10} {:>9} {:>5} {:>11} {:>18} {:>18} {:>9} {:>6}",
                    r.rank,
                    truncate(&t.symbol, 12),
                    truncate(&t.underlying, 8),
                    truncate(t.option_type.as_str(), 4),
                    fmt_date_br(t.maturity_date),
                    t.strike_price.map(|v| fmt_decimal(v, 2)).unwrap_or_else(|| "-".into()),
                    fmt_int(t.trade_count),
                    fmt_int(t.contracts),
                    fmt_brl(t.financial_volume),
                    fmt_brl(r.average_ticket),
                    r.price.map(|v| fmt_decimal(v, 2)).unwrap_or_else(|| "-".into()),
                    fmt_decimal(r.day_share_pct, 2),
                ),
            );
        }
        doc
    }
}

impl ReportRenderer for PdfReportRenderer {
    fn render(
        &self,
        date: &TradingDate,
        analysis: &AnalysisOutcome,
    ) -> Result<RenderedReport, ReportError> {
        std::fs::create_dir_all(&self.reports_dir)
            .map_err(|e| ReportError::io(&self.reports_dir, e))?;

        let doc = self.build_document(date, analysis);
        let bytes = doc.render(&chrono::Local::now().format("%Y%m%d%H%M%S").to_string());
        let pdf = self.pdf_path(date);
        write_atomic(&pdf, &bytes)?;
        info!(
            path = %pdf.display(),
            bytes = bytes.len(),
            pages = doc.page_count(),
            "report written"
        );

        let csv = if self.export_csv {
            let path = self.csv_path(date);
            match export::write_ranked_csv(&path, &analysis.ranked) {
                Ok(()) => Some(path),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CSV export failed; continuing with PDF only"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(RenderedReport {
            pdf,
            csv,
            pages: doc.page_count(),
        })
    }
}

/// Writes through a sibling `.pdf.tmp` file; the temporary is removed when either step fails.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ReportError> {
    let tmp = path.with_extension("pdf.tmp");
    let result = std::fs::write(&tmp, bytes)
        .map_err(|e| ReportError::io(&tmp, e))
        .and_then(|()| std::fs::rename(&tmp, path).map_err(|e| ReportError::io(path, e)));
    if result.is_err() {
        if let Err(e) = std::fs::remove_file(&tmp) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %e, "could not remove temporary report");
            }
        }
    }
    result
}
