//! Real-time estimate
//!
//! "Real time" is the concentrator's best guess at now. In local-clock mode
//! it is simply the injected [`Clock`]. Otherwise it tracks the newest
//! admitted measurement timestamp, as long as that timestamp stays within
//! the lead tolerance of the local clock. When both the current estimate and
//! a candidate fall outside that window the estimate falls back to the
//! local clock. Turning the reasonability check off drops both the lead
//! window and the fallback: the newest timestamp wins, however far ahead.
//!
//! The scalar is updated with compare-and-swap only. Under contention a
//! slightly older value may survive a race; the estimate gates admission,
//! it never orders frames, so that is acceptable.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::Clock;
use crate::ticks::Ticks;

/// Shared, lock-free estimate of the current time
pub struct RealTimeEstimate {
    clock: Arc<dyn Clock>,
    ticks: AtomicI64,
    lead_time: AtomicU64,
    use_local_clock: AtomicBool,
    reasonability_check: AtomicBool,
}

impl RealTimeEstimate {
    /// Create an estimate seeded from the clock
    pub fn new(clock: Arc<dyn Clock>, lead_time: f64, use_local_clock: bool) -> Self {
        let seed = clock.now();
        Self {
            clock,
            ticks: AtomicI64::new(seed.value()),
            lead_time: AtomicU64::new(lead_time.to_bits()),
            use_local_clock: AtomicBool::new(use_local_clock),
            reasonability_check: AtomicBool::new(true),
        }
    }

    /// The underlying local clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Local clock time, ignoring the estimate
    pub fn local_now(&self) -> Ticks {
        self.clock.now()
    }

    /// Current real-time estimate
    pub fn now(&self) -> Ticks {
        let current_time = self.clock.now();
        if self.uses_local_clock() {
            return current_time;
        }

        let current = self.ticks.load(Ordering::Acquire);
        if self.checks_reasonability() && !self.within_lead(current_time, Ticks::new(current)) {
            // Estimate drifted out of the clock's tolerance; the clock is all we have
            let _ = self.ticks.compare_exchange(
                current,
                current_time.value(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        Ticks::new(self.ticks.load(Ordering::Acquire))
    }

    /// Offer an admitted measurement timestamp as a newer estimate
    ///
    /// Returns `true` if the estimate moved to `timestamp`.
    pub fn observe(&self, timestamp: Ticks) -> bool {
        if self.uses_local_clock() {
            return false;
        }

        if !self.checks_reasonability() {
            let previous = self.ticks.fetch_max(timestamp.value(), Ordering::AcqRel);
            return previous < timestamp.value();
        }

        let current = self.ticks.load(Ordering::Acquire);
        if timestamp.value() <= current {
            return false;
        }

        let current_time = self.clock.now();
        if self.within_lead(current_time, timestamp) {
            return self
                .ticks
                .compare_exchange(
                    current,
                    timestamp.value(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
        }

        if !self.within_lead(current_time, Ticks::new(current)) {
            if self
                .ticks
                .compare_exchange(
                    current,
                    current_time.value(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                log::warn!(
                    "Real-time estimate and candidate {} both outside {}s of local clock, using local clock",
                    timestamp,
                    self.lead_time()
                );
            }
        }
        false
    }

    /// Seconds between the estimate and `timestamp` (positive means in the past)
    pub fn seconds_from(&self, timestamp: Ticks) -> f64 {
        (self.now() - timestamp).to_seconds()
    }

    /// Lead tolerance used to validate candidates, in seconds
    pub fn lead_time(&self) -> f64 {
        f64::from_bits(self.lead_time.load(Ordering::Acquire))
    }

    /// Update the lead tolerance (already validated by the caller)
    pub fn set_lead_time(&self, lead_time: f64) {
        self.lead_time.store(lead_time.to_bits(), Ordering::Release);
    }

    /// Whether real time is the local clock
    pub fn uses_local_clock(&self) -> bool {
        self.use_local_clock.load(Ordering::Acquire)
    }

    /// Switch between local-clock and latest-measurement modes
    pub fn set_use_local_clock(&self, use_local_clock: bool) {
        self.use_local_clock.store(use_local_clock, Ordering::Release);
    }

    /// Whether candidates must lie within the lead tolerance of the local clock
    pub fn checks_reasonability(&self) -> bool {
        self.reasonability_check.load(Ordering::Acquire)
    }

    pub fn set_reasonability_check(&self, enabled: bool) {
        self.reasonability_check.store(enabled, Ordering::Release);
    }

    /// Reseed the estimate from the local clock
    pub fn reset(&self) {
        self.ticks.store(self.clock.now().value(), Ordering::Release);
    }

    fn within_lead(&self, current_time: Ticks, candidate: Ticks) -> bool {
        let lead_time = self.lead_time();
        candidate.time_is_valid(current_time, lead_time, lead_time)
    }
}

impl fmt::Debug for RealTimeEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealTimeEstimate")
            .field("ticks", &Ticks::new(self.ticks.load(Ordering::Relaxed)))
            .field("lead_time", &self.lead_time())
            .field("use_local_clock", &self.uses_local_clock())
            .field("reasonability_check", &self.checks_reasonability())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn start() -> Ticks {
        Ticks::new(1_000 * Ticks::PER_SECOND)
    }

    fn estimate(use_local_clock: bool) -> (Arc<ManualClock>, RealTimeEstimate) {
        let clock = Arc::new(ManualClock::new(start()));
        let estimate = RealTimeEstimate::new(clock.clone(), 1.0, use_local_clock);
        (clock, estimate)
    }

    #[test]
    fn test_local_clock_mode() {
        let (clock, estimate) = estimate(true);
        assert!(!estimate.observe(start() + Ticks::from_seconds(0.5)));
        clock.advance_seconds(0.25);
        assert_eq!(estimate.now(), start() + Ticks::from_seconds(0.25));
    }

    #[test]
    fn test_observe_newer_valid_timestamp() {
        let (_clock, estimate) = estimate(false);
        let candidate = start() + Ticks::from_seconds(0.5);
        assert!(estimate.observe(candidate));
        assert_eq!(estimate.now(), candidate);
    }

    #[test]
    fn test_observe_ignores_older_timestamp() {
        let (_clock, estimate) = estimate(false);
        assert!(!estimate.observe(start() - Ticks::from_seconds(0.5)));
        assert_eq!(estimate.now(), start());
    }

    #[test]
    fn test_observe_rejects_far_future() {
        let (_clock, estimate) = estimate(false);
        assert!(!estimate.observe(start() + Ticks::from_seconds(5.0)));
        assert_eq!(estimate.now(), start());
    }

    #[test]
    fn test_falls_back_to_clock_when_stale() {
        let (clock, estimate) = estimate(false);
        clock.advance_seconds(10.0);
        assert_eq!(estimate.now(), start() + Ticks::from_seconds(10.0));
    }

    #[test]
    fn test_fallback_when_both_candidates_invalid() {
        let (clock, estimate) = estimate(false);
        clock.advance_seconds(10.0);
        // Candidate is newer than the stale estimate but far from the clock
        assert!(!estimate.observe(start() + Ticks::from_seconds(2.0)));
        assert_eq!(
            Ticks::new(estimate.ticks.load(Ordering::Acquire)),
            start() + Ticks::from_seconds(10.0)
        );
    }

    #[test]
    fn test_unchecked_estimate_follows_newest_timestamp() {
        let (clock, estimate) = estimate(false);
        estimate.set_reasonability_check(false);

        let far_ahead = start() + Ticks::from_seconds(5.0);
        assert!(estimate.observe(far_ahead));
        assert!(!estimate.observe(start() + Ticks::from_seconds(4.0)));

        // No fallback to the clock either
        clock.advance_seconds(60.0);
        assert_eq!(estimate.now(), far_ahead);

        estimate.set_reasonability_check(true);
        assert_eq!(estimate.now(), start() + Ticks::from_seconds(60.0));
    }

    #[test]
    fn test_seconds_from() {
        let (_clock, estimate) = estimate(true);
        let past = start() - Ticks::from_seconds(2.0);
        assert!((estimate.seconds_from(past) - 2.0).abs() < 1e-9);
    }
}
