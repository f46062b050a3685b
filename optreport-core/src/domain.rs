//! Domain types shared by every stage of a daily run.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A calendar date confirmed to be an exchange business day.
///
/// Only [`crate::calendar::BusinessDayCalendar`] can construct one, so holding a
/// `TradingDate` is proof that the date passed the weekend and holiday checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TradingDate(NaiveDate);

impl TradingDate {
    pub(crate) fn confirmed(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// ISO-8601 form (`YYYY-MM-DD`), the key used for locks and artifact names.
    pub fn iso(&self) -> String {
        self.0.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for TradingDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "CALL",
            OptionType::Put => "PUT",
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CALL" => Ok(OptionType::Call),
            "PUT" => Ok(OptionType::Put),
            other => Err(format!("unknown option type '{other}'")),
        }
    }
}

/// One row of the daily market snapshot: the day's aggregate for a single option series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionTrade {
    pub trade_date: NaiveDate,
    pub symbol: String,
    pub underlying: String,
    pub option_type: OptionType,
    pub maturity_date: NaiveDate,
    pub strike_price: Option<f64>,
    /// Number of trades executed for the series during the session.
    pub trade_count: i64,
    /// Number of contracts traded.
    pub contracts: i64,
    /// Traded financial volume.
    pub financial_volume: f64,
    pub last_price: Option<f64>,
    pub average_price: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_type_parses_case_insensitively() {
        assert_eq!("call".parse::<OptionType>().unwrap(), OptionType::Call);
        assert_eq!(" PUT ".parse::<OptionType>().unwrap(), OptionType::Put);
        assert!("straddle".parse::<OptionType>().is_err());
    }

    #[test]
    fn trading_date_formats_as_iso() {
        let d = TradingDate::confirmed(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
        assert_eq!(d.iso(), "2024-01-10");
        assert_eq!(d.to_string(), "2024-01-10");
    }
}
