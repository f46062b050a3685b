//! Per-date execution lock.
//!
//! Layout: `{lock_dir}/.lock-{YYYY-MM-DD}`
//!
//! The lock is a marker file created with create-new semantics, so the claim is
//! visible across independent processes (a manual run racing the scheduled
//! one). The file body records who holds it. A lock older than `stale_after`
//! is treated as abandoned by a crashed run and force-released.
//!
//! [`LockHandle`] is a guard: dropping it releases the lock, and an explicit
//! [`LockHandle::release`] is idempotent. A handle only ever removes a lock
//! file that still carries its own run id.
//!
//! Files are never unlinked by path after a check. Eviction and release first
//! rename the marker to a unique side file, re-check what was moved, and put it
//! back if it turns out to be another run's live claim.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::TradingDate;

/// Create-new attempts before giving up when stale locks keep reappearing.
const MAX_CLAIM_ATTEMPTS: u32 = 3;

static SIDE_FILE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds the lock for {date} ({holder}, held for {age_secs}s)")]
    Held {
        date: String,
        holder: String,
        age_secs: u64,
    },

    #[error("lock I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        LockError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub run_id: String,
    pub pid: u32,
    pub acquired_at: NaiveDateTime,
}

/// Issues date-scoped exclusive claims backed by marker files.
#[derive(Debug, Clone)]
pub struct ExecutionLock {
    lock_dir: PathBuf,
    stale_after: Duration,
}

impl ExecutionLock {
    pub fn new(lock_dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            stale_after,
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Path of the marker file for a date.
    pub fn lock_path(&self, date: &TradingDate) -> PathBuf {
        self.lock_dir.join(format!(".lock-{}", date.iso()))
    }

    /// Whether a marker file currently exists for the date (stale or not).
    pub fn is_held(&self, date: &TradingDate) -> bool {
        self.lock_path(date).exists()
    }

    /// Read the holder record of an existing lock, if any.
    pub fn holder(&self, date: &TradingDate) -> Option<LockRecord> {
        read_record(&self.lock_path(date))
    }

    /// Claim the lock for `date` on behalf of `run_id`.
    ///
    /// Fails with [`LockError::Held`] while another live claim exists.
    pub fn acquire(&self, date: &TradingDate, run_id: &str) -> Result<LockHandle, LockError> {
        fs::create_dir_all(&self.lock_dir).map_err(|e| LockError::io(&self.lock_dir, e))?;
        let path = self.lock_path(date);

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let record = LockRecord {
                        run_id: run_id.to_string(),
                        pid: std::process::id(),
                        acquired_at: chrono::Local::now().naive_local(),
                    };
                    if let Err(e) = write_record(&mut file, &record) {
                        let _ = fs::remove_file(&path);
                        return Err(LockError::io(&path, e));
                    }
                    info!(trading_date = %date, run_id, path = %path.display(), "lock acquired");
                    return Ok(LockHandle {
                        path,
                        run_id: run_id.to_string(),
                        date: *date,
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let Some(age) = lock_age(&path) else {
                        // Vanished between create and stat: the holder just released.
                        continue;
                    };
                    if age < self.stale_after {
                        return Err(self.held_error(date, &path, age));
                    }
                    warn!(
                        trading_date = %date,
                        age_secs = age.as_secs(),
                        stale_after_secs = self.stale_after.as_secs(),
                        "stale lock detected; force-releasing"
                    );
                    if let Eviction::Live(age) = self.evict_stale(&path, run_id)? {
                        return Err(self.held_error(date, &path, age));
                    }
                }
                Err(e) => return Err(LockError::io(&path, e)),
            }
        }

        let age = lock_age(&path).unwrap_or(Duration::ZERO);
        Err(self.held_error(date, &path, age))
    }

    /// Release a handle. Already-released and foreign handles are a no-op.
    pub fn release(&self, handle: &mut LockHandle) {
        handle.release();
    }

    /// Move a stale marker aside and delete it.
    ///
    /// The rename is atomic, so of several contenders only one moves a given
    /// file. A moved file that is not stale was created by a contender that
    /// evicted first; it is put back.
    fn evict_stale(&self, path: &Path, run_id: &str) -> Result<Eviction, LockError> {
        let side = side_path(path, "stale", run_id);
        match fs::rename(path, &side) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Eviction::Vanished),
            Err(e) => return Err(LockError::io(path, e)),
        }

        let age = lock_age(&side).unwrap_or(Duration::ZERO);
        if age >= self.stale_after {
            discard(&side);
            return Ok(Eviction::Evicted);
        }
        debug!(path = %path.display(), "lock was replaced before eviction; restoring it");
        restore(&side, path);
        Ok(Eviction::Live(age))
    }

    fn held_error(&self, date: &TradingDate, path: &Path, age: Duration) -> LockError {
        let holder = match read_record(path) {
            Some(r) => format!("run {} pid {}", r.run_id, r.pid),
            None => "unknown holder".to_string(),
        };
        LockError::Held {
            date: date.iso(),
            holder,
            age_secs: age.as_secs(),
        }
    }
}

/// Live claim on a date. Releases on drop.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    run_id: String,
    date: TradingDate,
    released: bool,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn trading_date(&self) -> TradingDate {
        self.date
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Remove the marker file if it is still ours.
    ///
    /// Returns `true` only when this call removed the file. Never errors.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        match read_record(&self.path) {
            Some(record) if record.run_id == self.run_id => self.remove_own(),
            Some(record) => {
                debug!(
                    trading_date = %self.date,
                    holder = %record.run_id,
                    "lock now belongs to another run; leaving it in place"
                );
                false
            }
            None => false,
        }
    }
}

impl LockHandle {
    fn remove_own(&self) -> bool {
        let side = side_path(&self.path, "release", &self.run_id);
        if let Err(e) = fs::rename(&self.path, &side) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
            }
            return false;
        }

        match read_record(&side) {
            Some(record) if record.run_id == self.run_id => {
                discard(&side);
                info!(trading_date = %self.date, run_id = %self.run_id, "lock released");
                true
            }
            _ => {
                debug!(
                    trading_date = %self.date,
                    "lock changed hands before release; restoring it"
                );
                restore(&side, &self.path);
                false
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

enum Eviction {
    Evicted,
    Vanished,
    Live(Duration),
}

/// `{path}.{kind}-{run_id}-{pid}-{seq}`, unique per process and call.
fn side_path(path: &Path, kind: &str, run_id: &str) -> PathBuf {
    let seq = SIDE_FILE_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{kind}-{run_id}-{}-{seq}", std::process::id()));
    PathBuf::from(name)
}

/// Put a moved marker back without overwriting a claim made meanwhile.
fn restore(side: &Path, path: &Path) {
    if let Err(e) = fs::hard_link(side, path) {
        warn!(path = %path.display(), error = %e, "could not restore lock file");
    }
    discard(side);
}

fn discard(side: &Path) {
    if let Err(e) = fs::remove_file(side) {
        warn!(path = %side.display(), error = %e, "failed to remove moved lock file");
    }
}

fn write_record(file: &mut fs::File, record: &LockRecord) -> io::Result<()> {
    let json = serde_json::to_string(record)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writeln!(file, "{json}")?;
    file.sync_all()
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(content.trim()).ok()
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}
