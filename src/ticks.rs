//! Tick-based timestamps
//!
//! A [`Ticks`] value counts 100-nanosecond intervals since the Unix epoch.
//! This is the finest timestamp unit the concentrator works with; frame
//! buckets are whole multiples of `PER_SECOND / frames_per_second`.

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Timestamp or time span in 100ns units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Ticks(i64);

impl Ticks {
    /// Ticks in one second
    pub const PER_SECOND: i64 = 10_000_000;
    /// Ticks in one millisecond
    pub const PER_MILLISECOND: i64 = 10_000;
    /// Ticks in one microsecond
    pub const PER_MICROSECOND: i64 = 10;
    /// Zero ticks (the Unix epoch, or an empty span)
    pub const ZERO: Ticks = Ticks(0);
    /// Largest representable timestamp
    pub const MAX: Ticks = Ticks(i64::MAX);

    /// Create from a raw tick count
    pub const fn new(ticks: i64) -> Self {
        Self(ticks)
    }

    /// Raw tick count
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Convert a (possibly fractional) number of seconds to ticks
    pub fn from_seconds(seconds: f64) -> Self {
        Self((seconds * Self::PER_SECOND as f64) as i64)
    }

    /// Convert a number of milliseconds to ticks
    pub fn from_milliseconds(milliseconds: f64) -> Self {
        Self((milliseconds * Self::PER_MILLISECOND as f64) as i64)
    }

    /// Span in seconds
    pub fn to_seconds(self) -> f64 {
        self.0 as f64 / Self::PER_SECOND as f64
    }

    /// Span in milliseconds
    pub fn to_milliseconds(self) -> f64 {
        self.0 as f64 / Self::PER_MILLISECOND as f64
    }

    /// Convert a [`Duration`] to ticks, saturating at [`Ticks::MAX`]
    pub fn from_duration(duration: Duration) -> Self {
        let ticks = duration.as_nanos() / 100;
        Self(i64::try_from(ticks).unwrap_or(i64::MAX))
    }

    /// Convert a span to a [`Duration`]; negative spans become zero
    pub fn to_duration(self) -> Duration {
        if self.0 <= 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.0 as u64 * 100)
    }

    /// Timestamp of a [`SystemTime`]
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(since) => Self::from_duration(since),
            Err(before) => -Self::from_duration(before.duration()),
        }
    }

    /// Timestamp rounded down to the start of its second
    pub fn baseline_to_second(self) -> Self {
        Self(self.0 - self.0.rem_euclid(Self::PER_SECOND))
    }

    /// Ticks elapsed since the start of the second this timestamp falls in
    pub fn distance_beyond_second(self) -> Self {
        Self(self.0.rem_euclid(Self::PER_SECOND))
    }

    /// Whether this timestamp lies within `[reference - lag, reference + lead]`
    ///
    /// `lag_time` and `lead_time` are in seconds.
    pub fn time_is_valid(self, reference: Ticks, lag_time: f64, lead_time: f64) -> bool {
        let distance = (reference - self).to_seconds();
        distance >= -lead_time && distance <= lag_time
    }

    /// Calendar time of this timestamp, when representable
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let seconds = self.0.div_euclid(Self::PER_SECOND);
        let nanos = (self.0.rem_euclid(Self::PER_SECOND) * 100) as u32;
        DateTime::from_timestamp(seconds, nanos)
    }
}

impl From<i64> for Ticks {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Ticks> for i64 {
    fn from(value: Ticks) -> Self {
        value.0
    }
}

impl Add for Ticks {
    type Output = Ticks;

    fn add(self, rhs: Ticks) -> Ticks {
        Ticks(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Ticks {
    type Output = Ticks;

    fn sub(self, rhs: Ticks) -> Ticks {
        Ticks(self.0.saturating_sub(rhs.0))
    }
}

impl AddAssign for Ticks {
    fn add_assign(&mut self, rhs: Ticks) {
        *self = *self + rhs;
    }
}

impl SubAssign for Ticks {
    fn sub_assign(&mut self, rhs: Ticks) {
        *self = *self - rhs;
    }
}

impl Neg for Ticks {
    type Output = Ticks;

    fn neg(self) -> Ticks {
        Ticks(self.0.saturating_neg())
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(time) => write!(f, "{}", time.format("%d-%b-%Y %H:%M:%S%.3f")),
            None => write!(f, "{} ticks", self.0),
        }
    }
}
