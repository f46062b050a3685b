//! Column contract of the daily options snapshot.
//!
//! The acquisition process writes one row per option series with the column
//! names below. Types are checked by family rather than exact width: the
//! producer may emit `Int32` or `Int64` counts, and integer-valued prices.

use polars::prelude::{DataFrame, DataType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Accepted type family of a snapshot column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Date,
    Text,
    Integer,
    /// Any integer or floating point type.
    Numeric,
}

impl ColumnKind {
    pub fn accepts(&self, dtype: &DataType) -> bool {
        match self {
            ColumnKind::Date => matches!(dtype, DataType::Date),
            ColumnKind::Text => matches!(dtype, DataType::String),
            ColumnKind::Integer => is_integer(dtype),
            ColumnKind::Numeric => {
                is_integer(dtype) || matches!(dtype, DataType::Float32 | DataType::Float64)
            }
        }
    }
}

fn is_integer(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotColumn {
    pub name: &'static str,
    pub kind: ColumnKind,
}

pub const TRADE_DATE: &str = "trade_date";
pub const SYMBOL: &str = "symbol";
pub const UNDERLYING: &str = "underlying";
pub const OPTION_TYPE: &str = "option_type";
pub const MATURITY_DATE: &str = "maturity_date";
pub const STRIKE_PRICE: &str = "strike_price";
pub const TRADE_COUNT: &str = "qtdneg";
pub const CONTRACTS: &str = "quatot";
pub const FINANCIAL_VOLUME: &str = "voltot";
pub const LAST_PRICE: &str = "preult";
pub const AVERAGE_PRICE: &str = "premed";

const fn column(name: &'static str, kind: ColumnKind) -> SnapshotColumn {
    SnapshotColumn { name, kind }
}

/// Required columns, in the order the producer writes them.
pub const SNAPSHOT_COLUMNS: &[SnapshotColumn] = &[
    column(TRADE_DATE, ColumnKind::Date),
    column(SYMBOL, ColumnKind::Text),
    column(UNDERLYING, ColumnKind::Text),
    column(OPTION_TYPE, ColumnKind::Text),
    column(MATURITY_DATE, ColumnKind::Date),
    column(STRIKE_PRICE, ColumnKind::Numeric),
    column(TRADE_COUNT, ColumnKind::Integer),
    column(CONTRACTS, ColumnKind::Integer),
    column(FINANCIAL_VOLUME, ColumnKind::Numeric),
    column(LAST_PRICE, ColumnKind::Numeric),
    column(AVERAGE_PRICE, ColumnKind::Numeric),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("missing required column '{0}'")]
    MissingColumn(String),

    #[error("column '{column}': expected {expected:?}, got {actual}")]
    TypeMismatch {
        column: String,
        expected: ColumnKind,
        actual: String,
    },
}

/// Check that every required column is present with an accepted type.
///
/// Extra columns are allowed. Reports the first violation in column order.
pub fn validate_frame(df: &DataFrame) -> Result<(), SchemaError> {
    for required in SNAPSHOT_COLUMNS {
        let series = df
            .column(required.name)
            .map_err(|_| SchemaError::MissingColumn(required.name.to_string()))?;
        let dtype = series.dtype();
        if !required.kind.accepts(dtype) {
            return Err(SchemaError::TypeMismatch {
                column: required.name.to_string(),
                expected: required.kind,
                actual: dtype.to_string(),
            });
        }
    }
    Ok(())
}
