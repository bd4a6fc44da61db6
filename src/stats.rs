//! Concentrator statistics
//!
//! Producers and the publication thread bump lock-free counters in
//! [`Statistics`]; readers take a [`StatsSnapshot`], which derives the
//! ratios and averages shown in status reports.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::measurement::Measurement;
use crate::ticks::Ticks;

const UNSET: i64 = i64::MIN;

/// Live counters shared by every concentrator thread
#[derive(Debug)]
pub struct Statistics {
    received: AtomicU64,
    processed: AtomicU64,
    discarded: AtomicU64,
    sorted_by_arrival: AtomicU64,
    missed_sorts_by_timeout: AtomicU64,
    published_frames: AtomicU64,
    published_measurements: AtomicU64,
    frames_ahead_of_schedule: AtomicU64,
    downsampled: AtomicU64,
    total_sort_time: AtomicI64,
    total_wait_time: AtomicI64,
    total_publication_time: AtomicI64,
    start_time: AtomicI64,
    stop_time: AtomicI64,
    last_discarded: Mutex<Option<Measurement>>,
    last_discarded_latency: AtomicI64,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            sorted_by_arrival: AtomicU64::new(0),
            missed_sorts_by_timeout: AtomicU64::new(0),
            published_frames: AtomicU64::new(0),
            published_measurements: AtomicU64::new(0),
            frames_ahead_of_schedule: AtomicU64::new(0),
            downsampled: AtomicU64::new(0),
            total_sort_time: AtomicI64::new(0),
            total_wait_time: AtomicI64::new(0),
            total_publication_time: AtomicI64::new(0),
            start_time: AtomicI64::new(UNSET),
            stop_time: AtomicI64::new(UNSET),
            last_discarded: Mutex::new(None),
            last_discarded_latency: AtomicI64::new(0),
        }
    }
}

impl Statistics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one sort call
    pub fn record_sort_batch(&self, received: u64, processed: u64, discarded: u64, by_arrival: u64) {
        self.received.fetch_add(received, Ordering::Relaxed);
        self.processed.fetch_add(processed, Ordering::Relaxed);
        self.discarded.fetch_add(discarded, Ordering::Relaxed);
        self.sorted_by_arrival.fetch_add(by_arrival, Ordering::Relaxed);
    }

    /// Count a sort lost to the frame guard timeout
    pub fn record_missed_sort(&self) {
        self.missed_sorts_by_timeout.fetch_add(1, Ordering::Relaxed);
    }

    /// Remember the most recent discarded measurement and how far it lagged real time
    pub fn record_last_discarded(&self, measurement: &Measurement, latency: Ticks) {
        *self.last_discarded.lock() = Some(measurement.clone());
        self.last_discarded_latency
            .store(latency.value(), Ordering::Relaxed);
    }

    /// Count arrivals that met a value already held for their stream in a frame
    pub fn record_downsampled(&self, count: usize) {
        self.downsampled.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Account for one published frame
    pub fn record_publication(
        &self,
        measurements: usize,
        sort_time: Ticks,
        wait_time: Ticks,
        publication_time: Ticks,
        ahead_of_schedule: bool,
    ) {
        self.published_frames.fetch_add(1, Ordering::Relaxed);
        self.published_measurements
            .fetch_add(measurements as u64, Ordering::Relaxed);
        self.total_sort_time
            .fetch_add(sort_time.value(), Ordering::Relaxed);
        self.total_wait_time
            .fetch_add(wait_time.value(), Ordering::Relaxed);
        self.total_publication_time
            .fetch_add(publication_time.value(), Ordering::Relaxed);
        if ahead_of_schedule {
            self.frames_ahead_of_schedule.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stamp the start of a run and clear the stop time
    pub fn mark_started(&self, now: Ticks) {
        self.start_time.store(now.value(), Ordering::Release);
        self.stop_time.store(UNSET, Ordering::Release);
    }

    /// Stamp the end of a run
    pub fn mark_stopped(&self, now: Ticks) {
        self.stop_time.store(now.value(), Ordering::Release);
    }

    /// Zero every counter, keeping the run timestamps
    pub fn reset(&self) {
        for counter in [
            &self.received,
            &self.processed,
            &self.discarded,
            &self.sorted_by_arrival,
            &self.missed_sorts_by_timeout,
            &self.published_frames,
            &self.published_measurements,
            &self.frames_ahead_of_schedule,
            &self.downsampled,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for total in [
            &self.total_sort_time,
            &self.total_wait_time,
            &self.total_publication_time,
            &self.last_discarded_latency,
        ] {
            total.store(0, Ordering::Relaxed);
        }
        *self.last_discarded.lock() = None;
    }

    /// Most recent discarded measurement
    pub fn last_discarded(&self) -> Option<Measurement> {
        self.last_discarded.lock().clone()
    }

    /// Consistent-enough copy of every counter
    ///
    /// `now` closes the run time of a concentrator that is still running.
    pub fn snapshot(&self, now: Ticks) -> StatsSnapshot {
        let start = self.start_time.load(Ordering::Acquire);
        let stop = self.stop_time.load(Ordering::Acquire);
        let run_time = match (start, stop) {
            (UNSET, _) => 0.0,
            (start, UNSET) => (now - Ticks::new(start)).to_seconds(),
            (start, stop) => (Ticks::new(stop) - Ticks::new(start)).to_seconds(),
        };

        StatsSnapshot {
            received_measurements: self.received.load(Ordering::Relaxed),
            processed_measurements: self.processed.load(Ordering::Relaxed),
            discarded_measurements: self.discarded.load(Ordering::Relaxed),
            measurements_sorted_by_arrival: self.sorted_by_arrival.load(Ordering::Relaxed),
            missed_sorts_by_timeout: self.missed_sorts_by_timeout.load(Ordering::Relaxed),
            published_frames: self.published_frames.load(Ordering::Relaxed),
            published_measurements: self.published_measurements.load(Ordering::Relaxed),
            frames_ahead_of_schedule: self.frames_ahead_of_schedule.load(Ordering::Relaxed),
            downsampled_measurements: self.downsampled.load(Ordering::Relaxed),
            last_discarded_latency: Ticks::new(self.last_discarded_latency.load(Ordering::Relaxed))
                .to_seconds(),
            total_sort_time: Ticks::new(self.total_sort_time.load(Ordering::Relaxed)).to_seconds(),
            total_wait_time: Ticks::new(self.total_wait_time.load(Ordering::Relaxed)).to_seconds(),
            total_publication_time: Ticks::new(self.total_publication_time.load(Ordering::Relaxed))
                .to_seconds(),
            start_time: (start != UNSET).then(|| Ticks::new(start)),
            stop_time: (stop != UNSET).then(|| Ticks::new(stop)),
            run_time,
        }
    }
}

/// Point-in-time copy of the concentrator counters
///
/// Durations are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StatsSnapshot {
    /// Measurements handed to `sort`
    pub received_measurements: u64,
    /// Measurements that landed in a frame
    pub processed_measurements: u64,
    /// Measurements dropped for any reason
    pub discarded_measurements: u64,
    /// Badly stamped measurements re-stamped with real time
    pub measurements_sorted_by_arrival: u64,
    /// Sorts abandoned because a frame guard stayed busy
    pub missed_sorts_by_timeout: u64,
    /// Frames handed to the publisher
    pub published_frames: u64,
    /// Measurements contained in published frames
    pub published_measurements: u64,
    /// Frames published before their lag time elapsed
    pub frames_ahead_of_schedule: u64,
    /// Arrivals for a stream that already had a value in their frame
    pub downsampled_measurements: u64,
    /// Real time minus the timestamp of the last discarded measurement
    pub last_discarded_latency: f64,
    /// Sum over published frames of first-to-last sort span
    pub total_sort_time: f64,
    /// Sum of time the publication thread waited on lag
    pub total_wait_time: f64,
    /// Sum of time spent inside the publish callback
    pub total_publication_time: f64,
    /// When the current or last run started
    pub start_time: Option<Ticks>,
    /// When the last run stopped (`None` while running)
    pub stop_time: Option<Ticks>,
    /// Length of the current or last run
    pub run_time: f64,
}

impl StatsSnapshot {
    /// Fraction of received measurements that were discarded
    pub fn discard_ratio(&self) -> f64 {
        ratio(self.discarded_measurements, self.received_measurements)
    }

    /// Fraction of received measurements lost to guard timeouts
    pub fn missed_sort_ratio(&self) -> f64 {
        ratio(self.missed_sorts_by_timeout, self.received_measurements)
    }

    /// Fraction of received measurements sorted by arrival
    pub fn arrival_sort_ratio(&self) -> f64 {
        ratio(self.measurements_sorted_by_arrival, self.received_measurements)
    }

    /// Average publish callback time per frame, in milliseconds
    pub fn average_publication_time_per_frame(&self) -> f64 {
        if self.published_frames == 0 {
            return 0.0;
        }
        self.total_publication_time * 1000.0 / self.published_frames as f64
    }

    /// Average first-to-last sort span per frame, in milliseconds
    pub fn average_sort_time_per_frame(&self) -> f64 {
        if self.published_frames == 0 {
            return 0.0;
        }
        self.total_sort_time * 1000.0 / self.published_frames as f64
    }

    /// Frames published per second of run time
    pub fn actual_frame_rate(&self) -> f64 {
        if self.run_time <= 0.0 {
            return 0.0;
        }
        self.published_frames as f64 / self.run_time
    }

    /// Human-readable counters
    pub fn report(&self) -> String {
        let mut report = String::new();

        report.push_str(&format!(
            "    Received measurements: {}\n",
            self.received_measurements
        ));
        report.push_str(&format!(
            "   Processed measurements: {}\n",
            self.processed_measurements
        ));
        report.push_str(&format!(
            "   Discarded measurements: {} ({:.4}%)\n",
            self.discarded_measurements,
            self.discard_ratio() * 100.0
        ));
        report.push_str(&format!(
            "   Sorted by arrival time: {} ({:.4}%)\n",
            self.measurements_sorted_by_arrival,
            self.arrival_sort_ratio() * 100.0
        ));
        report.push_str(&format!(
            "  Last discarded latency: {:.4} s\n",
            self.last_discarded_latency
        ));
        report.push_str(&format!(
            "Down-sampled measurements: {}\n",
            self.downsampled_measurements
        ));
        report.push_str(&format!(
            "  Missed sorts by timeout: {} ({:.4}%)\n",
            self.missed_sorts_by_timeout,
            self.missed_sort_ratio() * 100.0
        ));
        report.push_str(&format!(
            "   Published measurements: {}\n",
            self.published_measurements
        ));
        report.push_str(&format!(
            "         Published frames: {}\n",
            self.published_frames
        ));
        report.push_str(&format!(
            " Frames ahead of schedule: {}\n",
            self.frames_ahead_of_schedule
        ));
        report.push_str(&format!(
            "Avg publish time per frame: {:.4} ms\n",
            self.average_publication_time_per_frame()
        ));
        report.push_str(&format!(
            "   Avg sort time per frame: {:.4} ms\n",
            self.average_sort_time_per_frame()
        ));
        report.push_str(&format!(
            "       Total lag wait time: {:.4} s\n",
            self.total_wait_time
        ));

        report
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64
}
