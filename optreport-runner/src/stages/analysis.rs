//! Analysis: rank the day's large option trades.

use std::cmp::Ordering;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use optreport_core::artifact::{read_snapshot, ArtifactError};
use optreport_core::{OptionTrade, OptionType};

use crate::config::FilterConfig;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// A trade that passed the filters, with derived metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedTrade {
    pub rank: usize,
    pub trade: OptionTrade,
    /// Average price, falling back to the last price.
    pub price: Option<f64>,
    /// Financial volume per trade.
    pub average_ticket: f64,
    /// Share of the day's total financial volume, in percent.
    pub day_share_pct: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisStats {
    /// Rows in the snapshot.
    pub total_options: usize,
    /// Financial volume across every row of the snapshot.
    pub total_volume: f64,
    /// Rows dropped for a non-positive trade count.
    pub dropped_rows: usize,
    pub after_filters: usize,
    pub top_n_volume: f64,
    pub top_n_pct: f64,
    pub calls: usize,
    pub puts: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub ranked: Vec<RankedTrade>,
    pub stats: AnalysisStats,
}

impl AnalysisOutcome {
    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }
}

/// The trade-filtering collaborator.
pub trait Analyzer: Send + Sync {
    fn analyze(
        &self,
        artifact: &Path,
        filters: &FilterConfig,
    ) -> Result<AnalysisOutcome, AnalysisError>;
}

/// Reads the Parquet snapshot and applies [`rank_trades`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetAnalyzer;

impl Analyzer for ParquetAnalyzer {
    fn analyze(
        &self,
        artifact: &Path,
        filters: &FilterConfig,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        let trades = read_snapshot(artifact)?;
        info!(path = %artifact.display(), rows = trades.len(), "snapshot loaded");
        Ok(rank_trades(trades, filters))
    }
}

/// Filter, score and rank trades.
///
/// 1. Drop rows with `trade_count <= 0`
/// 2. Keep `trade_count <= max_operations` and `financial_volume >= min_financial_volume`
/// 3. Sort by average ticket, descending; ties keep snapshot order
/// 4. Keep the first `top_n`
pub fn rank_trades(trades: Vec<OptionTrade>, filters: &FilterConfig) -> AnalysisOutcome {
    let total_options = trades.len();
    let total_volume: f64 = trades.iter().map(|t| t.financial_volume).sum();

    let (valid, dropped): (Vec<OptionTrade>, Vec<OptionTrade>) =
        trades.into_iter().partition(|t| t.trade_count > 0);
    if !dropped.is_empty() {
        warn!(dropped = dropped.len(), "dropped rows with non-positive trade count");
    }

    let missing_avg = valid.iter().filter(|t| t.average_price.is_none()).count();
    if missing_avg > 0 {
        warn!(rows = missing_avg, "average price missing; falling back to last price");
    }

    let mut candidates: Vec<(f64, OptionTrade)> = valid
        .into_iter()
        .filter(|t| {
            t.trade_count <= filters.max_operations
                && t.financial_volume >= filters.min_financial_volume
        })
        .map(|t| (t.financial_volume / t.trade_count as f64, t))
        .filter(|(ticket, _)| ticket.is_finite())
        .collect();
    let after_filters = candidates.len();

    if after_filters == 0 {
        warn!(
            min_financial_volume = filters.min_financial_volume,
            max_operations = filters.max_operations,
            "no trades passed the filters"
        );
    }

    // Vec::sort_by is stable.
    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    candidates.truncate(filters.top_n);

    let ranked: Vec<RankedTrade> = candidates
        .into_iter()
        .enumerate()
        .map(|(i, (average_ticket, trade))| RankedTrade {
            rank: i + 1,
            price: trade.average_price.or(trade.last_price),
            day_share_pct: share_pct(trade.financial_volume, total_volume),
            average_ticket,
            trade,
        })
        .collect();

    let top_n_volume: f64 = ranked.iter().map(|r| r.trade.financial_volume).sum();
    let calls = ranked
        .iter()
        .filter(|r| r.trade.option_type == OptionType::Call)
        .count();

    AnalysisOutcome {
        stats: AnalysisStats {
            total_options,
            total_volume,
            dropped_rows: dropped.len(),
            after_filters,
            top_n_volume,
            top_n_pct: share_pct(top_n_volume, total_volume),
            calls,
            puts: ranked.len() - calls,
        },
        ranked,
    }
}

fn share_pct(part: f64, total: f64) -> f64 {
    if total > 0.0 {
        part / total * 100.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn trade(symbol: &str, option_type: OptionType, count: i64, volume: f64) -> OptionTrade {
        OptionTrade {
            trade_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            symbol: symbol.to_string(),
            underlying: "VALE3".to_string(),
            option_type,
            maturity_date: NaiveDate::from_ymd_opt(2024, 2, 16).unwrap(),
            strike_price: Some(70.0),
            trade_count: count,
            contracts: count * 100,
            financial_volume: volume,
            last_price: Some(2.0),
            average_price: Some(1.9),
        }
    }

    fn filters(top_n: usize) -> FilterConfig {
        FilterConfig {
            min_financial_volume: 100_000.0,
            max_operations: 5,
            top_n,
        }
    }

    #[test]
    fn ranks_by_average_ticket_descending() {
        let out = rank_trades(
            vec![
                trade("A", OptionType::Call, 5, 1_000_000.0), // 200k
                trade("B", OptionType::Put, 1, 500_000.0),    // 500k
                trade("C", OptionType::Call, 2, 600_000.0),   // 300k
            ],
            &filters(10),
        );
        let symbols: Vec<&str> = out.ranked.iter().map(|r| r.trade.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["B", "C", "A"]);
        assert_eq!(out.ranked[0].rank, 1);
        assert_eq!(out.ranked[0].average_ticket, 500_000.0);
        assert_eq!(out.stats.calls, 2);
        assert_eq!(out.stats.puts, 1);
    }

    #[test]
    fn filters_out_many_operations_and_small_volume() {
        let out = rank_trades(
            vec![
                trade("MANY", OptionType::Call, 50, 10_000_000.0),
                trade("SMALL", OptionType::Call, 1, 50_000.0),
                trade("OK", OptionType::Put, 3, 300_000.0),
            ],
            &filters(10),
        );
        assert_eq!(out.stats.after_filters, 1);
        assert_eq!(out.ranked[0].trade.symbol, "OK");
        assert_eq!(out.stats.total_volume, 10_350_000.0);
    }

    #[test]
    fn drops_non_positive_trade_counts() {
        let out = rank_trades(
            vec![
                trade("ZERO", OptionType::Call, 0, 900_000.0),
                trade("OK", OptionType::Call, 1, 200_000.0),
            ],
            &filters(10),
        );
        assert_eq!(out.stats.dropped_rows, 1);
        assert_eq!(out.stats.total_options, 2);
        assert_eq!(out.ranked.len(), 1);
    }

    #[test]
    fn ties_keep_snapshot_order_and_top_n_truncates() {
        let out = rank_trades(
            vec![
                trade("FIRST", OptionType::Call, 1, 200_000.0),
                trade("SECOND", OptionType::Call, 1, 200_000.0),
                trade("THIRD", OptionType::Call, 1, 200_000.0),
            ],
            &filters(2),
        );
        let symbols: Vec<&str> = out.ranked.iter().map(|r| r.trade.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["FIRST", "SECOND"]);
        assert_eq!(out.stats.after_filters, 3);
        assert_eq!(out.stats.top_n_volume, 400_000.0);
    }

    #[test]
    fn average_price_falls_back_to_last_price() {
        let mut t = trade("A", OptionType::Call, 1, 200_000.0);
        t.average_price = None;
        let out = rank_trades(vec![t], &filters(10));
        assert_eq!(out.ranked[0].price, Some(2.0));
    }

    #[test]
    fn day_share_is_relative_to_full_snapshot() {
        let out = rank_trades(
            vec![
                trade("BIG", OptionType::Call, 1, 250_000.0),
                trade("NOISE", OptionType::Put, 100, 750_000.0),
            ],
            &filters(10),
        );
        assert_eq!(out.ranked.len(), 1);
        assert!((out.ranked[0].day_share_pct - 25.0).abs() < 1e-9);
        assert!((out.stats.top_n_pct - 25.0).abs() < 1e-9);
    }

    #[test]
    fn empty_snapshot_yields_empty_outcome() {
        let out = rank_trades(Vec::new(), &filters(10));
        assert!(out.is_empty());
        assert_eq!(out.stats.total_volume, 0.0);
        assert_eq!(out.stats.top_n_pct, 0.0);
    }
}
