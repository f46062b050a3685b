//! optreport core: the leaf components of a daily report run.
//!
//! - Business-day calendar (national, state and market holidays)
//! - Per-date cross-process execution lock with stale-lock recovery
//! - Bounded retry policy with non-decreasing backoff
//! - Snapshot artifact contract, Parquet I/O, and atomic artifact store

pub mod artifact;
pub mod calendar;
pub mod domain;
pub mod lock;
pub mod retry;

pub use calendar::{BusinessDayCalendar, CalendarError, NonTradingReason};
pub use domain::{OptionTrade, OptionType, TradingDate};
pub use lock::{ExecutionLock, LockError, LockHandle, LockRecord};
pub use retry::{
    Backoff, RecordingSleeper, Retried, RetryError, RetryPolicy, Retryable, Sleeper,
    ThreadSleeper,
};
