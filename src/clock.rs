//! Clock sources
//!
//! The concentrator never reads the operating system clock directly; it asks
//! an injected [`Clock`]. [`SystemClock`] anchors wall-clock time once and
//! advances it with a monotonic [`Instant`], so it never steps backward when
//! the host adjusts its clock. [`ManualClock`] is driven explicitly, which
//! makes replays and tests deterministic.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime};

use crate::ticks::Ticks;

/// Source of the local "now"
pub trait Clock: Send + Sync {
    /// Current local time
    fn now(&self) -> Ticks;
}

/// Wall clock anchored to a monotonic timer
#[derive(Debug, Clone)]
pub struct SystemClock {
    anchor_ticks: Ticks,
    anchor: Instant,
}

impl SystemClock {
    /// Anchor a new clock at the current system time
    pub fn new() -> Self {
        Self {
            anchor_ticks: Ticks::from_system_time(SystemTime::now()),
            anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Ticks {
        self.anchor_ticks + Ticks::from_duration(self.anchor.elapsed())
    }
}

/// Clock that only moves when told to
pub struct ManualClock {
    ticks: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: Ticks) -> Self {
        Self {
            ticks: AtomicI64::new(start.value()),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, ticks: Ticks) {
        self.ticks.store(ticks.value(), Ordering::SeqCst);
    }

    /// Move forward (or backward, with a negative span)
    pub fn advance(&self, span: Ticks) {
        self.ticks.fetch_add(span.value(), Ordering::SeqCst);
    }

    /// Move forward by a number of seconds
    pub fn advance_seconds(&self, seconds: f64) {
        self.advance(Ticks::from_seconds(seconds));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Ticks {
        Ticks::new(self.ticks.load(Ordering::SeqCst))
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock").field("now", &self.now()).finish()
    }
}
