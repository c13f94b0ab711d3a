//! Injectable time and id sources
//!
//! Stores never read the wall clock or generate random ids directly. They
//! take a [`Clock`] and an [`IdGenerator`] at construction so tests can run
//! against deterministic sequences.
//!
//! ## Example
//!
//! ```rust
//! use treesnap::clock::{Clock, ManualClock, IdGenerator, SequentialIdGenerator};
//! use chrono::{Duration, TimeZone, Utc};
//!
//! let clock = ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
//! let before = clock.now();
//! clock.advance(Duration::seconds(5));
//! assert_eq!(clock.now() - before, Duration::seconds(5));
//!
//! let ids = SequentialIdGenerator::new();
//! assert_eq!(ids.next_id("s:"), "s:000001");
//! ```

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of the current instant
pub trait Clock: Send + Sync {
    /// Current instant in UTC
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
///
/// Every call to [`now`](Clock::now) returns the current setting; with a
/// non-zero auto step the clock advances by that step after each read.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
    step: Duration,
}

impl ManualClock {
    /// A clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
            step: Duration::zero(),
        }
    }

    /// A clock that advances by `step` after every read
    pub fn stepping(start: DateTime<Utc>, step: Duration) -> Self {
        Self {
            current: Mutex::new(start),
            step,
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock();
        *current += by;
    }

    /// Jump to an instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.current.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let mut current = self.current.lock();
        let value = *current;
        *current += self.step;
        value
    }
}

/// Source of fresh ids
pub trait IdGenerator: Send + Sync {
    /// A new id starting with `prefix`
    fn next_id(&self, prefix: &str) -> String;
}

/// `prefix` + random UUID v4
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self, prefix: &str) -> String {
        crate::utils::prefixed_uuid(prefix)
    }
}

/// `prefix` + a process-local counter padded to six digits
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    counter: AtomicU64,
}

impl SequentialIdGenerator {
    /// Counter starting at 1
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self, prefix: &str) -> String {
        let value = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        crate::utils::incremental_id(prefix, value, 6)
    }
}
