//! Exchange business-day calendar.
//!
//! A date is a business day when it is a weekday and appears in neither the
//! national holiday table nor the market-specific override list. The national
//! table is rule-based (fixed dates plus the Easter-derived movable days), so it
//! needs no yearly maintenance; the override list comes from configuration and
//! covers exchange-only closures (e.g. Dec 24, Dec 31).
//!
//! The calendar holds no state beyond the loaded override set and never touches
//! the wall clock: callers pass the reference date in.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::TradingDate;

/// Upper bound on how far `previous_business_day` / `next_business_day` will walk.
pub const MAX_LOOKBACK_DAYS: u32 = 10;

/// Walking back further than this many days is legal but suspicious.
const LONG_GAP_WARN_DAYS: i64 = 5;

/// Why a date is not a trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonTradingReason {
    Weekend,
    NationalHoliday,
    MarketHoliday,
}

impl fmt::Display for NonTradingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NonTradingReason::Weekend => "weekend",
            NonTradingReason::NationalHoliday => "national holiday",
            NonTradingReason::MarketHoliday => "market holiday",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarError {
    #[error("{date} is not a trading day ({reason})")]
    InvalidTradingDay {
        date: NaiveDate,
        reason: NonTradingReason,
    },

    #[error("no business day found within {max_days} days of {from}")]
    NoBusinessDayWithin { from: NaiveDate, max_days: u32 },

    #[error("failed to load holidays file {path}: {reason}")]
    HolidaysFile { path: String, reason: String },
}

/// Business-day calendar: weekends + national holidays + market overrides.
#[derive(Debug, Clone)]
pub struct BusinessDayCalendar {
    include_state_holidays: bool,
    market_holidays: BTreeSet<NaiveDate>,
}

impl BusinessDayCalendar {
    pub fn new(market_holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            include_state_holidays: true,
            market_holidays: market_holidays.into_iter().collect(),
        }
    }

    /// Toggle the São Paulo state holiday (Jul 9). On by default.
    pub fn with_state_holidays(mut self, include: bool) -> Self {
        self.include_state_holidays = include;
        self
    }

    /// Add more market-specific closures without rebuilding the calendar.
    pub fn extend_market_holidays(&mut self, dates: impl IntoIterator<Item = NaiveDate>) {
        self.market_holidays.extend(dates);
    }

    pub fn market_holidays(&self) -> &BTreeSet<NaiveDate> {
        &self.market_holidays
    }

    /// Classify a date. `None` means it is a business day.
    pub fn classify(&self, date: NaiveDate) -> Option<NonTradingReason> {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return Some(NonTradingReason::Weekend);
        }
        if is_national_holiday(date, self.include_state_holidays) {
            return Some(NonTradingReason::NationalHoliday);
        }
        if self.market_holidays.contains(&date) {
            return Some(NonTradingReason::MarketHoliday);
        }
        None
    }

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        self.classify(date).is_none()
    }

    /// Confirm that `requested` is a business day and return it unchanged.
    pub fn resolve(&self, requested: NaiveDate) -> Result<TradingDate, CalendarError> {
        match self.classify(requested) {
            None => Ok(TradingDate::confirmed(requested)),
            Some(reason) => Err(CalendarError::InvalidTradingDay {
                date: requested,
                reason,
            }),
        }
    }

    /// Most recent business day strictly before `reference`.
    pub fn previous_business_day(
        &self,
        reference: NaiveDate,
    ) -> Result<TradingDate, CalendarError> {
        let found = self.walk(reference, -1)?;
        let days_back = (reference - found.date()).num_days();
        if days_back > LONG_GAP_WARN_DAYS {
            warn!(
                reference = %reference,
                found = %found,
                days_back,
                "last business day is unusually far back; check the holiday calendar"
            );
        }
        debug!(reference = %reference, found = %found, "resolved previous business day");
        Ok(found)
    }

    /// First business day strictly after `reference`.
    pub fn next_business_day(&self, reference: NaiveDate) -> Result<TradingDate, CalendarError> {
        self.walk(reference, 1)
    }

    /// Number of business days in the inclusive range, in either order.
    pub fn count_business_days(&self, start: NaiveDate, end: NaiveDate) -> usize {
        let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
        lo.iter_days()
            .take_while(|d| *d <= hi)
            .filter(|d| self.is_business_day(*d))
            .count()
    }

    fn walk(&self, reference: NaiveDate, step: i64) -> Result<TradingDate, CalendarError> {
        let mut current = reference;
        for _ in 0..MAX_LOOKBACK_DAYS {
            current = match current.checked_add_signed(Duration::days(step)) {
                Some(d) => d,
                None => break,
            };
            if self.is_business_day(current) {
                return Ok(TradingDate::confirmed(current));
            }
        }
        Err(CalendarError::NoBusinessDayWithin {
            from: reference,
            max_days: MAX_LOOKBACK_DAYS,
        })
    }
}

impl Default for BusinessDayCalendar {
    fn default() -> Self {
        Self::new(std::iter::empty())
    }
}

// ── Market override loading ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct HolidaysFile {
    #[serde(default)]
    market_holidays: Vec<String>,
}

/// Parse ISO dates, skipping (and logging) anything unparseable.
pub fn parse_market_holidays<S: AsRef<str>>(raw: &[S]) -> BTreeSet<NaiveDate> {
    raw.iter()
        .filter_map(|s| {
            let s = s.as_ref();
            match NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!(value = s, error = %e, "ignoring invalid market holiday");
                    None
                }
            }
        })
        .collect()
}

/// Load extra market holidays from a TOML file with a `market_holidays` array.
pub fn load_holidays_file(path: &Path) -> Result<BTreeSet<NaiveDate>, CalendarError> {
    let file_err = |reason: String| CalendarError::HolidaysFile {
        path: path.display().to_string(),
        reason,
    };
    let content = std::fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
    let parsed: HolidaysFile = toml::from_str(&content).map_err(|e| file_err(e.to_string()))?;
    Ok(parse_market_holidays(&parsed.market_holidays))
}

// ── National holiday rules ──────────────────────────────────────────

/// Brazilian national holidays, plus the São Paulo state holiday when asked.
fn is_national_holiday(date: NaiveDate, include_state: bool) -> bool {
    let fixed = match (date.month(), date.day()) {
        (1, 1) | (4, 21) | (5, 1) | (9, 7) | (10, 12) | (11, 2) | (11, 15) | (12, 25) => true,
        // Black Consciousness Day became national in 2024.
        (11, 20) => date.year() >= 2024,
        (7, 9) => include_state,
        _ => false,
    };
    if fixed {
        return true;
    }

    let Some(easter) = easter_sunday(date.year()) else {
        return false;
    };
    let offset = (date - easter).num_days();
    // Carnival Monday/Tuesday, Good Friday, Corpus Christi.
    matches!(offset, -48 | -47 | -2 | 60)
}

/// Gregorian Easter Sunday (anonymous Gregorian algorithm).
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}
