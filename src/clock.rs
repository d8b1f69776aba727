//! Timestamp precision handling and a monotonic clock source.
//!
//! All timestamps are carried internally as nanoseconds since the Unix
//! epoch. Precision describes the unit of numeric timestamps arriving on
//! the wire and the unit server responses are truncated to.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Unit of a numeric timestamp on the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
}

impl Precision {
    /// Parse the wire form. An empty string means nanoseconds.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "n" => Ok(Self::Nanoseconds),
            "u" => Ok(Self::Microseconds),
            "ms" => Ok(Self::Milliseconds),
            "s" => Ok(Self::Seconds),
            "m" => Ok(Self::Minutes),
            "h" => Ok(Self::Hours),
            other => Err(Error::InvalidQuery(format!("unknown precision {other:?}"))),
        }
    }

    /// Nanoseconds per unit at this precision.
    pub fn factor(&self) -> i64 {
        match self {
            Self::Nanoseconds => 1,
            Self::Microseconds => 1_000,
            Self::Milliseconds => 1_000_000,
            Self::Seconds => 1_000_000_000,
            Self::Minutes => 60 * 1_000_000_000,
            Self::Hours => 3_600 * 1_000_000_000,
        }
    }

    /// Interpret an epoch value at this precision as nanoseconds.
    pub fn epoch_to_nanos(&self, epoch: i64) -> i64 {
        epoch.saturating_mul(self.factor())
    }

    /// Truncate a nanosecond timestamp to this precision.
    pub fn truncate_nanos(&self, nanos: i64) -> i64 {
        let f = self.factor();
        (nanos / f) * f
    }
}

/// A clock source that guarantees monotonically increasing timestamps.
///
/// Write normalization stamps points that arrive without a timestamp; the
/// monotonic guarantee keeps those assignments ordered even across NTP
/// adjustments.
pub struct MonotonicClock {
    /// The largest timestamp ever returned (nanos)
    high_water_ns: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            high_water_ns: AtomicI64::new(0),
        }
    }

    /// Returns a monotonically increasing nanosecond timestamp.
    ///
    /// If the wall clock has gone backward, returns the previous
    /// high-water mark + 1ns instead.
    pub fn now_nanos(&self) -> i64 {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        loop {
            let prev = self.high_water_ns.load(Ordering::Acquire);
            let ts = wall.max(prev + 1);
            match self.high_water_ns.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue,
            }
        }
    }

    /// Returns `chrono::DateTime<Utc>` from the monotonic clock.
    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.now_nanos())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
