//! CSV export of the ranked trade set.

use std::path::Path;

use anyhow::{Context, Result};

use crate::stages::analysis::RankedTrade;

/// Ranked trades as CSV, one row per trade, in rank order.
///
/// Columns: rank, symbol, underlying, option_type, maturity_date, strike_price,
/// trade_count, contracts, financial_volume, average_ticket, price, day_share_pct
pub fn ranked_trades_csv(ranked: &[RankedTrade]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);

    wtr.write_record([
        "rank",
        "symbol",
        "underlying",
        "option_type",
        "maturity_date",
        "strike_price",
        "trade_count",
        "contracts",
        "financial_volume",
        "average_ticket",
        "price",
        "day_share_pct",
    ])?;

    for r in ranked {
        let t = &r.trade;
        wtr.write_record(&[
            r.rank.to_string(),
            t.symbol.clone(),
            t.underlying.clone(),
            t.option_type.as_str().to_string(),
            t.maturity_date.to_string(),
            t.strike_price.map(|v| format!("{v:.2}")).unwrap_or_default(),
            t.trade_count.to_string(),
            t.contracts.to_string(),
            format!("{:.2}", t.financial_volume),
            format!("{:.2}", r.average_ticket),
            r.price.map(|v| format!("{v:.4}")).unwrap_or_default(),
            format!("{:.4}", r.day_share_pct),
        ])?;
    }

    let bytes = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(bytes).context("CSV output is not valid UTF-8")
}

/// Write the ranked CSV to `path` via a temp file and rename.
pub fn write_ranked_csv(path: &Path, ranked: &[RankedTrade]) -> Result<()> {
    let csv = ranked_trades_csv(ranked)?;
    let tmp = path.with_extension("csv.tmp");
    std::fs::write(&tmp, csv).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", tmp.display()))?;
    Ok(())
}
