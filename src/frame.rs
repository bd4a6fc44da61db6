//! Time-bucketed frames
//!
//! A [`Frame`] collects the newest measurement per identity for one bucket.
//! Its map sits behind its own guard so producers writing to different
//! frames never contend. The published flag is flipped under that same
//! guard, which makes "insert" and "close for publication" mutually
//! exclusive: once [`Frame::mark_published`] returns, no insert can land.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::downsampling::{DownsamplingMethod, ValueFilter};
use crate::identity::Identity;
use crate::measurement::Measurement;
use crate::ticks::Ticks;

/// Builds a frame for a bucket timestamp
pub type FrameFactory = Arc<dyn Fn(Ticks) -> Frame + Send + Sync>;

/// Inserts a measurement into a frame, returning `false` if it was refused
pub type AssignFn = Arc<dyn Fn(&Frame, &Measurement) -> bool + Send + Sync>;

/// Outcome of a guarded insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// Measurement stored (replacing any previous value for its identity)
    Assigned,
    /// Frame already closed for publication
    Published,
    /// Guard could not be acquired in time
    TimedOut,
    /// Down-sampling kept the measurement already in the frame
    Declined,
}

impl Assignment {
    /// Whether the measurement landed in the frame
    pub fn is_assigned(self) -> bool {
        self == Assignment::Assigned
    }
}

#[derive(Default)]
struct FrameState {
    measurements: HashMap<Identity, Measurement>,
    samples: HashMap<Identity, Vec<f64>>,
    downsampled: usize,
    start_sort_time: Option<Ticks>,
    last_sort_time: Option<Ticks>,
    last_sorted_measurement: Option<Measurement>,
}

/// All measurements sorted into one time bucket
pub struct Frame {
    timestamp: Ticks,
    state: Mutex<FrameState>,
    published: AtomicBool,
    published_measurements: AtomicUsize,
}

impl Frame {
    /// Create an empty frame for a bucket
    pub fn new(timestamp: Ticks) -> Self {
        Self {
            timestamp,
            state: Mutex::new(FrameState::default()),
            published: AtomicBool::new(false),
            published_measurements: AtomicUsize::new(0),
        }
    }

    /// The default frame factory
    pub fn factory() -> FrameFactory {
        Arc::new(Frame::new)
    }

    /// Bucket timestamp
    pub fn timestamp(&self) -> Ticks {
        self.timestamp
    }

    /// Insert a measurement, waiting at most `timeout` for the guard
    pub fn assign(&self, measurement: &Measurement, timeout: Duration) -> Assignment {
        let Some(mut state) = self.state.try_lock_for(timeout) else {
            return Assignment::TimedOut;
        };
        if self.published.load(Ordering::Acquire) {
            return Assignment::Published;
        }
        let replaced = state
            .measurements
            .insert(measurement.identity().clone(), measurement.clone());
        if replaced.is_some() {
            state.downsampled += 1;
        }
        Assignment::Assigned
    }

    /// Insert a measurement, letting `method` choose between it and the value
    /// already held for its identity
    pub fn assign_downsampled(
        &self,
        measurement: &Measurement,
        method: DownsamplingMethod,
        filter: &ValueFilter,
        timeout: Duration,
    ) -> Assignment {
        if method == DownsamplingMethod::LastReceived {
            return self.assign(measurement, timeout);
        }

        let Some(mut guard) = self.state.try_lock_for(timeout) else {
            return Assignment::TimedOut;
        };
        if self.published.load(Ordering::Acquire) {
            return Assignment::Published;
        }

        let state = &mut *guard;
        let identity = measurement.identity();
        let existing = state.measurements.get(identity);
        if existing.is_some() {
            state.downsampled += 1;
        }
        let samples = match method {
            DownsamplingMethod::Filtered => Some(state.samples.entry(identity.clone()).or_default()),
            _ => None,
        };

        match method.derive(self.timestamp, existing, samples, measurement, filter) {
            Some(derived) => {
                state.measurements.insert(identity.clone(), derived);
                Assignment::Assigned
            }
            None => Assignment::Declined,
        }
    }

    /// Record sort-timing bookkeeping after a successful insert
    pub fn record_sort(&self, measurement: &Measurement, now: Ticks) {
        let mut state = self.state.lock();
        if state.start_sort_time.is_none() {
            state.start_sort_time = Some(now);
        }
        state.last_sort_time = Some(now);
        state.last_sorted_measurement = Some(measurement.clone());
    }

    /// Close the frame to further inserts
    ///
    /// Returns the number of measurements it holds at that instant, which is
    /// also kept as [`Frame::published_measurements`].
    pub fn mark_published(&self) -> usize {
        let state = self.state.lock();
        self.published.store(true, Ordering::Release);
        let count = state.measurements.len();
        self.published_measurements.store(count, Ordering::Release);
        count
    }

    /// Whether the frame has been closed for publication
    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    /// Measurement count captured at publication (0 before)
    pub fn published_measurements(&self) -> usize {
        self.published_measurements.load(Ordering::Acquire)
    }

    /// Arrivals for an identity the frame already held
    pub fn downsampled_measurements(&self) -> usize {
        self.state.lock().downsampled
    }

    /// Number of distinct identities in the frame
    pub fn len(&self) -> usize {
        self.state.lock().measurements.len()
    }

    /// Whether nothing has been sorted into the frame
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Measurement stored for `identity`
    pub fn measurement(&self, identity: &Identity) -> Option<Measurement> {
        self.state.lock().measurements.get(identity).cloned()
    }

    /// Copy of every measurement, ordered by identity
    pub fn measurements(&self) -> Vec<Measurement> {
        let mut measurements: Vec<Measurement> =
            self.state.lock().measurements.values().cloned().collect();
        measurements.sort_by(|a, b| a.identity().cmp(b.identity()));
        measurements
    }

    /// Run `f` against the measurement map without copying it
    pub fn with_measurements<R>(&self, f: impl FnOnce(&HashMap<Identity, Measurement>) -> R) -> R {
        f(&self.state.lock().measurements)
    }

    /// Local time of the first successful sort into this frame
    pub fn start_sort_time(&self) -> Option<Ticks> {
        self.state.lock().start_sort_time
    }

    /// Local time of the most recent successful sort into this frame
    pub fn last_sort_time(&self) -> Option<Ticks> {
        self.state.lock().last_sort_time
    }

    /// Most recent measurement sorted into this frame
    pub fn last_sorted_measurement(&self) -> Option<Measurement> {
        self.state.lock().last_sorted_measurement.clone()
    }

    /// Time between the first and the last sort into this frame
    pub fn sort_span(&self) -> Ticks {
        let state = self.state.lock();
        match (state.start_sort_time, state.last_sort_time) {
            (Some(start), Some(last)) => last - start,
            _ => Ticks::ZERO,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("timestamp", &self.timestamp)
            .field("measurements", &self.len())
            .field("published", &self.is_published())
            .finish()
    }
}
