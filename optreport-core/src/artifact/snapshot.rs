//! Parquet encoding of the daily snapshot.

use std::fs;
use std::path::Path;

use chrono::{Datelike, NaiveDate};
use polars::prelude::*;

use super::schema::{self, validate_frame};
use super::ArtifactError;
use crate::domain::{OptionTrade, OptionType};

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_FROM_CE: i32 = 719_163;

fn to_epoch_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_FROM_CE
}

fn from_epoch_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_FROM_CE)?)
}

/// Read and validate a snapshot file into typed rows.
pub fn read_snapshot(path: &Path) -> Result<Vec<OptionTrade>, ArtifactError> {
    let df = read_frame(path)?;
    validate_frame(&df).map_err(|source| ArtifactError::Schema {
        path: path.to_path_buf(),
        source,
    })?;
    frame_to_trades(&df).map_err(|e| match e {
        FrameError::Polars(reason) => ArtifactError::Parquet {
            path: path.to_path_buf(),
            reason,
        },
        FrameError::Row { row, reason } => ArtifactError::InvalidRow {
            path: path.to_path_buf(),
            row,
            reason,
        },
    })
}

/// Write rows as a snapshot file. Overwrites `path`; callers stage and rename.
pub fn write_snapshot(path: &Path, trades: &[OptionTrade]) -> Result<(), ArtifactError> {
    let parquet_err = |e: PolarsError| ArtifactError::Parquet {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let mut df = trades_to_frame(trades).map_err(parquet_err)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ArtifactError::io(parent, e))?;
    }
    let file = fs::File::create(path).map_err(|e| ArtifactError::io(path, e))?;
    ParquetWriter::new(file)
        .finish(&mut df)
        .map_err(parquet_err)?;
    Ok(())
}

fn read_frame(path: &Path) -> Result<DataFrame, ArtifactError> {
    let file = fs::File::open(path).map_err(|e| ArtifactError::io(path, e))?;
    ParquetReader::new(file)
        .finish()
        .map_err(|e| ArtifactError::Parquet {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

// ── Frame conversion ────────────────────────────────────────────────

enum FrameError {
    Polars(String),
    Row { row: usize, reason: String },
}

impl From<PolarsError> for FrameError {
    fn from(e: PolarsError) -> Self {
        FrameError::Polars(e.to_string())
    }
}

fn trades_to_frame(trades: &[OptionTrade]) -> PolarsResult<DataFrame> {
    let trade_dates: Vec<i32> = trades.iter().map(|t| to_epoch_days(t.trade_date)).collect();
    let maturities: Vec<i32> = trades.iter().map(|t| to_epoch_days(t.maturity_date)).collect();
    let symbols: Vec<String> = trades.iter().map(|t| t.symbol.clone()).collect();
    let underlyings: Vec<String> = trades.iter().map(|t| t.underlying.clone()).collect();
    let types: Vec<String> = trades.iter().map(|t| t.option_type.to_string()).collect();
    let strikes: Vec<Option<f64>> = trades.iter().map(|t| t.strike_price).collect();
    let counts: Vec<i64> = trades.iter().map(|t| t.trade_count).collect();
    let contracts: Vec<i64> = trades.iter().map(|t| t.contracts).collect();
    let volumes: Vec<f64> = trades.iter().map(|t| t.financial_volume).collect();
    let last: Vec<Option<f64>> = trades.iter().map(|t| t.last_price).collect();
    let avg: Vec<Option<f64>> = trades.iter().map(|t| t.average_price).collect();

    DataFrame::new(vec![
        Column::new(schema::TRADE_DATE.into(), trade_dates).cast(&DataType::Date)?,
        Column::new(schema::SYMBOL.into(), symbols),
        Column::new(schema::UNDERLYING.into(), underlyings),
        Column::new(schema::OPTION_TYPE.into(), types),
        Column::new(schema::MATURITY_DATE.into(), maturities).cast(&DataType::Date)?,
        Column::new(schema::STRIKE_PRICE.into(), strikes),
        Column::new(schema::TRADE_COUNT.into(), counts),
        Column::new(schema::CONTRACTS.into(), contracts),
        Column::new(schema::FINANCIAL_VOLUME.into(), volumes),
        Column::new(schema::LAST_PRICE.into(), last),
        Column::new(schema::AVERAGE_PRICE.into(), avg),
    ])
}

fn frame_to_trades(df: &DataFrame) -> Result<Vec<OptionTrade>, FrameError> {
    let trade_dates = df.column(schema::TRADE_DATE)?.cast(&DataType::Int32)?;
    let maturities = df.column(schema::MATURITY_DATE)?.cast(&DataType::Int32)?;
    let strikes = df.column(schema::STRIKE_PRICE)?.cast(&DataType::Float64)?;
    let counts = df.column(schema::TRADE_COUNT)?.cast(&DataType::Int64)?;
    let contracts = df.column(schema::CONTRACTS)?.cast(&DataType::Int64)?;
    let volumes = df.column(schema::FINANCIAL_VOLUME)?.cast(&DataType::Float64)?;
    let last = df.column(schema::LAST_PRICE)?.cast(&DataType::Float64)?;
    let avg = df.column(schema::AVERAGE_PRICE)?.cast(&DataType::Float64)?;

    let trade_dates = trade_dates.i32()?;
    let maturities = maturities.i32()?;
    let symbols = df.column(schema::SYMBOL)?.str()?;
    let underlyings = df.column(schema::UNDERLYING)?.str()?;
    let types = df.column(schema::OPTION_TYPE)?.str()?;
    let strikes = strikes.f64()?;
    let counts = counts.i64()?;
    let contracts = contracts.i64()?;
    let volumes = volumes.f64()?;
    let last = last.f64()?;
    let avg = avg.f64()?;

    let row_err = |row: usize, reason: String| FrameError::Row { row, reason };
    let date_at = |ca: &Int32Chunked, row: usize, name: &str| -> Result<NaiveDate, FrameError> {
        ca.get(row)
            .and_then(from_epoch_days)
            .ok_or_else(|| row_err(row, format!("null or out-of-range {name}")))
    };

    let mut trades = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let option_type = types
            .get(i)
            .ok_or_else(|| row_err(i, "null option_type".into()))?
            .parse::<OptionType>()
            .map_err(|reason| row_err(i, reason))?;

        trades.push(OptionTrade {
            trade_date: date_at(trade_dates, i, schema::TRADE_DATE)?,
            symbol: symbols
                .get(i)
                .ok_or_else(|| row_err(i, "null symbol".into()))?
                .to_string(),
            underlying: underlyings.get(i).unwrap_or_default().to_string(),
            option_type,
            maturity_date: date_at(maturities, i, schema::MATURITY_DATE)?,
            strike_price: strikes.get(i),
            trade_count: counts.get(i).unwrap_or(0),
            contracts: contracts.get(i).unwrap_or(0),
            financial_volume: volumes.get(i).unwrap_or(0.0),
            last_price: last.get(i),
            average_price: avg.get(i),
        });
    }
    Ok(trades)
}
