//! The concentrator
//!
//! Producers call [`Concentrator::sort`] / [`Concentrator::sort_batch`] from
//! any thread. Each measurement is admitted against the real-time estimate,
//! resolved to its frame and inserted under that frame's guard. A single
//! publication thread waits for the head frame's lag time to elapse, closes
//! it, hands it to the publish callback and pops it, always in bucket
//! order. A monitor thread reports the unpublished backlog once per
//! interval.
//!
//! ```no_run
//! use concentrator::{Concentrator, ConcentratorConfig, Identity, Measurement, Ticks};
//!
//! let concentrator = Concentrator::new(ConcentratorConfig::new(30, 2.0, 1.0), |frame, index| {
//!     println!("frame {} (#{}) holds {} values", frame.timestamp(), index, frame.len());
//!     Ok(())
//! })?;
//! concentrator.start()?;
//!
//! let id = Identity::new(1, "PMU_A")?;
//! concentrator.sort(Measurement::new(id, 59.98, concentrator.real_time()));
//! # Ok::<(), concentrator::ConcentratorError>(())
//! ```

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::clock::{Clock, SystemClock};
use crate::config::ConcentratorConfig;
use crate::downsampling::{average_filter, DownsamplingMethod, ValueFilter};
use crate::error::{BoxError, ConcentratorError, ConfigError, Result};
use crate::events::ConcentratorObserver;
use crate::frame::{AssignFn, Assignment, Frame, FrameFactory};
use crate::frame_queue::FrameQueue;
use crate::latest::LatestMeasurements;
use crate::measurement::Measurement;
use crate::realtime::RealTimeEstimate;
use crate::stats::{Statistics, StatsSnapshot};
use crate::ticks::Ticks;

/// Receives each frame once, with its index within the second
pub type PublishFn =
    Arc<dyn Fn(Arc<Frame>, u32) -> std::result::Result<(), BoxError> + Send + Sync>;

/// How long the publication thread waits for a head before re-checking for stop
const HEAD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Longest single sleep while waiting out lag time
const COARSE_SLEEP: Duration = Duration::from_millis(10);

/// Remaining lag below which the publication thread yields instead of sleeping
const SPIN_THRESHOLD: Ticks = Ticks::new(2 * Ticks::PER_MILLISECOND);

/// Settings that can change while running
struct Settings {
    lag_time: AtomicU64,
    allow_sorts_by_arrival: AtomicBool,
    track_latest_measurements: AtomicBool,
    allow_preemptive_publishing: AtomicBool,
    expected_measurements: AtomicUsize,
    downsampling: AtomicU8,
    ignore_bad_timestamps: AtomicBool,
    process_by_received_timestamp: AtomicBool,
    sort_lock_timeout: Duration,
    monitor_interval: Duration,
    stop_timeout: Duration,
}

impl Settings {
    fn new(config: &ConcentratorConfig) -> Self {
        Self {
            lag_time: AtomicU64::new(config.lag_time.to_bits()),
            allow_sorts_by_arrival: AtomicBool::new(config.allow_sorts_by_arrival),
            track_latest_measurements: AtomicBool::new(config.track_latest_measurements),
            allow_preemptive_publishing: AtomicBool::new(config.allow_preemptive_publishing),
            expected_measurements: AtomicUsize::new(config.expected_measurements),
            downsampling: AtomicU8::new(config.downsampling_method.to_u8()),
            ignore_bad_timestamps: AtomicBool::new(config.ignore_bad_timestamps),
            process_by_received_timestamp: AtomicBool::new(config.process_by_received_timestamp),
            sort_lock_timeout: config.sort_lock_timeout,
            monitor_interval: config.monitor_interval,
            stop_timeout: config.stop_timeout,
        }
    }

    fn lag_time(&self) -> f64 {
        f64::from_bits(self.lag_time.load(Ordering::Acquire))
    }

    fn downsampling(&self) -> DownsamplingMethod {
        DownsamplingMethod::from_u8(self.downsampling.load(Ordering::Acquire))
    }

    fn process_by_received_timestamp(&self) -> bool {
        self.process_by_received_timestamp.load(Ordering::Acquire)
    }

    /// Expected count when early publication is enabled
    fn preemptive_threshold(&self) -> Option<usize> {
        if !self.allow_preemptive_publishing.load(Ordering::Acquire) {
            return None;
        }
        match self.expected_measurements.load(Ordering::Acquire) {
            0 => None,
            expected => Some(expected),
        }
    }
}

struct Shared {
    name: String,
    settings: Settings,
    realtime: Arc<RealTimeEstimate>,
    queue: FrameQueue,
    latest: LatestMeasurements,
    stats: Statistics,
    publish: PublishFn,
    assign: Option<AssignFn>,
    value_filter: ValueFilter,
    observers: RwLock<Vec<Arc<dyn ConcentratorObserver>>>,
    /// Serializes lag and lead changes so the latest-value index sees both
    tolerances: Mutex<()>,
}

impl Shared {
    fn notify(&self, f: impl Fn(&dyn ConcentratorObserver)) {
        // Observers may register other observers
        let observers = self.observers.read().clone();
        for observer in &observers {
            f(observer.as_ref());
        }
    }

    fn report_exception(&self, error: ConcentratorError) {
        log::warn!("[{}] {}", self.name, error);
        self.notify(|observer| observer.process_exception(&error));
    }

    /// Insert into `frame`; returns (assigned, timed out)
    fn assign(&self, frame: &Frame, measurement: &Measurement) -> (bool, bool) {
        match &self.assign {
            Some(assign) => {
                let assigned = assign(frame, measurement);
                (assigned, !assigned)
            }
            None => {
                let outcome = frame.assign_downsampled(
                    measurement,
                    self.settings.downsampling(),
                    &self.value_filter,
                    self.settings.sort_lock_timeout,
                );
                (outcome.is_assigned(), outcome == Assignment::TimedOut)
            }
        }
    }

    fn sort_batch(&self, measurements: &[Measurement]) {
        let allow_sorts_by_arrival = self.settings.allow_sorts_by_arrival.load(Ordering::Acquire);
        let track_latest = self.settings.track_latest_measurements.load(Ordering::Acquire);
        let ignore_bad_timestamps = self.settings.ignore_bad_timestamps.load(Ordering::Acquire);
        let by_received = self.settings.process_by_received_timestamp();
        let reasonability_check = self.realtime.checks_reasonability();
        let lag_time = self.settings.lag_time();
        let lead_time = self.realtime.lead_time();

        let mut processed = 0u64;
        let mut sorted_by_arrival = 0u64;
        let mut discarded: Vec<Measurement> = Vec::new();
        let mut cached: Option<(Ticks, Arc<Frame>)> = None;

        for original in measurements {
            let mut measurement = Cow::Borrowed(original);
            let mut keep = true;

            if !ignore_bad_timestamps && !measurement.timestamp_quality_is_good {
                if allow_sorts_by_arrival {
                    measurement.to_mut().timestamp = self.realtime.now();
                    sorted_by_arrival += 1;
                } else {
                    keep = false;
                }
            }

            if keep {
                let ticks = measurement.timestamp;
                let out_of_window = !by_received && {
                    let distance = (self.realtime.now() - ticks).to_seconds();
                    distance > lag_time || (reasonability_check && distance < -lead_time)
                };

                if out_of_window {
                    keep = false;
                } else {
                    let frame = match &cached {
                        Some((cached_ticks, frame)) if *cached_ticks == ticks => Some(frame.clone()),
                        _ => self.queue.get_frame(ticks),
                    };

                    match frame {
                        Some(frame) => {
                            let (assigned, timed_out) = self.assign(&frame, &measurement);
                            if assigned {
                                frame.record_sort(&measurement, self.realtime.local_now());
                                if track_latest {
                                    self.latest.update(&measurement);
                                }
                                processed += 1;
                            } else {
                                if timed_out {
                                    self.stats.record_missed_sort();
                                }
                                keep = false;
                            }
                            cached = Some((ticks, frame));
                        }
                        None => keep = false,
                    }
                }
            }

            if keep {
                self.realtime.observe(measurement.timestamp);
            } else {
                log::trace!(
                    "[{}] Discarded {} at {}",
                    self.name,
                    measurement.identity(),
                    measurement.timestamp
                );
                discarded.push(measurement.into_owned());
            }
        }

        self.stats.record_sort_batch(
            measurements.len() as u64,
            processed,
            discarded.len() as u64,
            sorted_by_arrival,
        );

        if let Some(last) = discarded.last() {
            self.stats
                .record_last_discarded(last, self.realtime.now() - last.timestamp);
            self.notify(|observer| observer.discarding_measurements(&discarded));
        }
    }

    fn lag_ticks(&self) -> Ticks {
        Ticks::from_seconds(self.settings.lag_time())
    }

    fn unpublished_seconds(&self) -> usize {
        let frames_per_second = self.queue.frames_per_second().max(1) as usize;
        (self.queue.count() / frames_per_second).saturating_sub(1)
    }
}

/// Cooperative cancellation shared with one run's worker threads
struct StopToken {
    stopped: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl StopToken {
    fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _guard = self.lock.lock();
        self.wake.notify_all();
    }

    /// Sleep for `duration` unless stopped first; returns whether stopped
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.lock.lock();
        while !self.is_stopped() {
            if self.wake.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_stopped()
    }
}

#[derive(Default)]
struct Completion {
    done: Mutex<bool>,
    finished: Condvar,
}

/// Flags completion when the worker closure returns or unwinds
struct CompletionGuard(Arc<Completion>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        *self.0.done.lock() = true;
        self.0.finished.notify_all();
    }
}

struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    completion: Arc<Completion>,
}

impl Worker {
    fn spawn(name: &'static str, body: impl FnOnce() + Send + 'static) -> Result<Self> {
        let completion = Arc::new(Completion::default());
        let guard = CompletionGuard(completion.clone());
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                body();
            })
            .map_err(|e| ConcentratorError::Spawn(format!("{}: {}", name, e)))?;
        Ok(Self {
            name,
            handle,
            completion,
        })
    }

    /// Join, giving up after `timeout` and leaving the thread detached
    fn join(self, timeout: Duration) {
        if self.handle.thread().id() == thread::current().id() {
            // Stopped from inside its own callback; the loop exits on its own
            return;
        }

        let deadline = Instant::now() + timeout;
        let finished = {
            let mut done = self.completion.done.lock();
            while !*done {
                if self
                    .completion
                    .finished
                    .wait_until(&mut done, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            *done
        };

        if !finished {
            log::warn!(
                "{} thread did not stop within {:?}, detaching it",
                self.name,
                timeout
            );
            return;
        }
        if self.handle.join().is_err() {
            log::warn!("{} thread panicked", self.name);
        }
    }
}

struct Runtime {
    token: Arc<StopToken>,
    publisher: Worker,
    monitor: Worker,
}

/// Time-aligns measurement streams into ordered, exactly-once frames
pub struct Concentrator {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
}

/// Assembles a [`Concentrator`] with optional injected collaborators
pub struct ConcentratorBuilder {
    config: ConcentratorConfig,
    name: String,
    clock: Option<Arc<dyn Clock>>,
    frame_factory: Option<FrameFactory>,
    assign: Option<AssignFn>,
    value_filter: Option<ValueFilter>,
    observers: Vec<Arc<dyn ConcentratorObserver>>,
}

impl ConcentratorBuilder {
    /// Start from a configuration
    pub fn new(config: ConcentratorConfig) -> Self {
        Self {
            config,
            name: "concentrator".to_string(),
            clock: None,
            frame_factory: None,
            assign: None,
            value_filter: None,
            observers: Vec::new(),
        }
    }

    /// Name used in logs, status and health reports
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Local clock (defaults to [`SystemClock`])
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Frame constructor (defaults to [`Frame::new`])
    pub fn frame_factory(mut self, factory: impl Fn(Ticks) -> Frame + Send + Sync + 'static) -> Self {
        self.frame_factory = Some(Arc::new(factory));
        self
    }

    /// Insertion strategy (defaults to the frame's guarded insert)
    ///
    /// Returning `false` discards the measurement and counts a missed sort.
    pub fn assign_strategy(
        mut self,
        assign: impl Fn(&Frame, &Measurement) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.assign = Some(Arc::new(assign));
        self
    }

    /// Reduction used by [`DownsamplingMethod::Filtered`] (defaults to the mean)
    pub fn value_filter(mut self, filter: impl Fn(&[f64]) -> f64 + Send + Sync + 'static) -> Self {
        self.value_filter = Some(Arc::new(filter));
        self
    }

    /// Register an observer
    pub fn observer(mut self, observer: Arc<dyn ConcentratorObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Build a stopped concentrator that publishes through `publish`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the timing parameters are invalid.
    pub fn build<F>(self, publish: F) -> Result<Concentrator>
    where
        F: Fn(Arc<Frame>, u32) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        let mut config = self.config;
        config.validate()?;
        if config.process_by_received_timestamp {
            config.use_local_clock_as_real_time = true;
            config.allow_sorts_by_arrival = false;
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let realtime = Arc::new(RealTimeEstimate::new(
            clock,
            config.lead_time,
            config.use_local_clock_as_real_time,
        ));
        realtime.set_reasonability_check(config.perform_timestamp_reasonability_check);
        let queue = FrameQueue::new(
            config.frames_per_second,
            self.frame_factory.unwrap_or_else(Frame::factory),
        )?;
        queue.set_time_resolution(config.time_resolution)?;
        queue.set_round_to_nearest_timestamp(config.round_to_nearest_timestamp);
        let latest = LatestMeasurements::new(realtime.clone(), config.lag_time, config.lead_time)?;

        Ok(Concentrator {
            shared: Arc::new(Shared {
                name: self.name,
                settings: Settings::new(&config),
                realtime,
                queue,
                latest,
                stats: Statistics::new(),
                publish: Arc::new(publish),
                assign: self.assign,
                value_filter: self.value_filter.unwrap_or_else(average_filter),
                observers: RwLock::new(self.observers),
                tolerances: Mutex::new(()),
            }),
            runtime: Mutex::new(None),
        })
    }
}

impl Concentrator {
    /// Create a concentrator with default collaborators
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the timing parameters are invalid.
    pub fn new<F>(config: ConcentratorConfig, publish: F) -> Result<Self>
    where
        F: Fn(Arc<Frame>, u32) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        ConcentratorBuilder::new(config).build(publish)
    }

    /// Start building a concentrator
    pub fn builder(config: ConcentratorConfig) -> ConcentratorBuilder {
        ConcentratorBuilder::new(config)
    }

    /// Name given at construction
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    // Lifecycle

    /// Start publishing; does nothing if already running
    ///
    /// Statistics and queued frames are reset.
    ///
    /// # Errors
    ///
    /// Returns [`ConcentratorError::Spawn`] if a worker thread cannot be
    /// created; the concentrator is left stopped.
    pub fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Ok(());
        }

        let shared = &self.shared;
        shared.stats.reset();
        shared.stats.mark_started(shared.realtime.local_now());
        shared.queue.clear();
        shared.realtime.reset();
        shared.queue.start()?;

        let token = Arc::new(StopToken::new());

        let publisher = {
            let shared = shared.clone();
            let token = token.clone();
            Worker::spawn("concentrator-publisher", move || {
                publication_loop(&shared, &token)
            })
        };
        let publisher = match publisher {
            Ok(worker) => worker,
            Err(e) => {
                shared.queue.stop();
                return Err(e);
            }
        };

        let monitor = {
            let shared = shared.clone();
            let token = token.clone();
            Worker::spawn("concentrator-monitor", move || monitor_loop(&shared, &token))
        };
        let monitor = match monitor {
            Ok(worker) => worker,
            Err(e) => {
                token.stop();
                publisher.join(shared.settings.stop_timeout);
                shared.queue.stop();
                return Err(e);
            }
        };

        *runtime = Some(Runtime {
            token,
            publisher,
            monitor,
        });

        log::info!(
            "[{}] Started at {} fps, lag {}s, lead {}s",
            shared.name,
            shared.queue.frames_per_second(),
            shared.settings.lag_time(),
            shared.realtime.lead_time()
        );
        Ok(())
    }

    /// Stop publishing; does nothing if already stopped
    ///
    /// A publish call in progress is allowed to finish, up to the configured
    /// stop timeout. Frames still queued are dropped.
    pub fn stop(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        let shared = &self.shared;
        runtime.token.stop();
        runtime.publisher.join(shared.settings.stop_timeout);
        runtime.monitor.join(shared.settings.stop_timeout);
        shared.queue.stop();
        shared.queue.clear();
        shared.stats.mark_stopped(shared.realtime.local_now());

        log::info!("[{}] Stopped", shared.name);
    }

    /// Whether the publication thread is running
    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    // Ingestion

    /// Sort one measurement into its frame
    pub fn sort(&self, measurement: Measurement) {
        self.shared.sort_batch(std::slice::from_ref(&measurement));
    }

    /// Sort a batch of measurements
    pub fn sort_batch(&self, measurements: &[Measurement]) {
        if measurements.is_empty() {
            return;
        }
        self.shared.sort_batch(measurements);
    }

    // Configuration

    /// Frame buckets per second
    pub fn frames_per_second(&self) -> u32 {
        self.shared.queue.frames_per_second()
    }

    /// Change the frame rate
    ///
    /// # Errors
    ///
    /// Returns a configuration error for zero, or for a rate at which the
    /// time resolution exceeds half a frame.
    pub fn set_frames_per_second(&self, frames_per_second: u32) -> Result<()> {
        self.shared.queue.set_frames_per_second(frames_per_second)?;
        log::info!("[{}] Frame rate set to {} fps", self.shared.name, frames_per_second);
        Ok(())
    }

    /// Width of one frame in ticks
    pub fn ticks_per_frame(&self) -> f64 {
        self.shared.queue.ticks_per_frame()
    }

    /// Past tolerance in seconds
    pub fn lag_time(&self) -> f64 {
        self.shared.settings.lag_time()
    }

    /// Change the past tolerance
    ///
    /// The latest-value index is updated before observers hear about it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless `lag_time` is positive.
    pub fn set_lag_time(&self, lag_time: f64) -> Result<()> {
        let lag_time = ConfigError::check_lag_time(lag_time)?;
        {
            let _tolerances = self.shared.tolerances.lock();
            self.shared.latest.set_tolerances(lag_time, self.lead_time())?;
            self.shared
                .settings
                .lag_time
                .store(lag_time.to_bits(), Ordering::Release);
        }
        log::info!("[{}] Lag time set to {}s", self.shared.name, lag_time);
        self.shared.notify(|observer| observer.lag_time_changed(lag_time));
        Ok(())
    }

    /// Future tolerance in seconds
    pub fn lead_time(&self) -> f64 {
        self.shared.realtime.lead_time()
    }

    /// Change the future tolerance
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless `lead_time` is positive.
    pub fn set_lead_time(&self, lead_time: f64) -> Result<()> {
        let lead_time = ConfigError::check_lead_time(lead_time)?;
        {
            let _tolerances = self.shared.tolerances.lock();
            self.shared.latest.set_tolerances(self.lag_time(), lead_time)?;
            self.shared.realtime.set_lead_time(lead_time);
        }
        log::info!("[{}] Lead time set to {}s", self.shared.name, lead_time);
        self.shared.notify(|observer| observer.lead_time_changed(lead_time));
        Ok(())
    }

    /// Whether badly stamped measurements are sorted by arrival
    pub fn allow_sorts_by_arrival(&self) -> bool {
        self.shared
            .settings
            .allow_sorts_by_arrival
            .load(Ordering::Acquire)
    }

    /// Re-stamp (`true`) or discard (`false`) badly stamped measurements
    ///
    /// Stays off while processing by received timestamp.
    pub fn set_allow_sorts_by_arrival(&self, allow: bool) {
        let allow = allow && !self.process_by_received_timestamp();
        self.shared
            .settings
            .allow_sorts_by_arrival
            .store(allow, Ordering::Release);
    }

    /// Whether real time is the local clock
    pub fn use_local_clock_as_real_time(&self) -> bool {
        self.shared.realtime.uses_local_clock()
    }

    /// Choose between the local clock and the newest measurement as real time
    ///
    /// Stays on while processing by received timestamp.
    pub fn set_use_local_clock_as_real_time(&self, enabled: bool) {
        let enabled = enabled || self.process_by_received_timestamp();
        self.shared.realtime.set_use_local_clock(enabled);
        log::info!(
            "[{}] Real time now follows {}",
            self.shared.name,
            if enabled { "the local clock" } else { "the latest measurement" }
        );
    }

    /// Whether sorted measurements feed the latest-value index
    pub fn track_latest_measurements(&self) -> bool {
        self.shared
            .settings
            .track_latest_measurements
            .load(Ordering::Acquire)
    }

    /// Enable or disable the latest-value index
    pub fn set_track_latest_measurements(&self, enabled: bool) {
        self.shared
            .settings
            .track_latest_measurements
            .store(enabled, Ordering::Release);
    }

    /// Whether frames may be published before their lag time elapses
    pub fn allow_preemptive_publishing(&self) -> bool {
        self.shared
            .settings
            .allow_preemptive_publishing
            .load(Ordering::Acquire)
    }

    /// Enable or disable early publication of complete frames
    pub fn set_allow_preemptive_publishing(&self, enabled: bool) {
        self.shared
            .settings
            .allow_preemptive_publishing
            .store(enabled, Ordering::Release);
    }

    /// Measurements a complete frame holds (0 = unknown)
    pub fn expected_measurements(&self) -> usize {
        self.shared
            .settings
            .expected_measurements
            .load(Ordering::Acquire)
    }

    /// Set how many measurements make a frame complete
    pub fn set_expected_measurements(&self, expected: usize) {
        self.shared
            .settings
            .expected_measurements
            .store(expected, Ordering::Release);
    }

    /// Which value a frame keeps for a stream reporting faster than the frame rate
    pub fn downsampling_method(&self) -> DownsamplingMethod {
        self.shared.settings.downsampling()
    }

    pub fn set_downsampling_method(&self, method: DownsamplingMethod) {
        self.shared
            .settings
            .downsampling
            .store(method.to_u8(), Ordering::Release);
    }

    /// Resolution bucket timestamps are truncated to
    pub fn time_resolution(&self) -> Ticks {
        self.shared.queue.time_resolution()
    }

    /// Change the time resolution; frames already queued keep their buckets
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `resolution` is negative or wider
    /// than half a frame.
    pub fn set_time_resolution(&self, resolution: Ticks) -> Result<()> {
        self.shared.queue.set_time_resolution(resolution)
    }

    /// Whether measurements go to the nearest bucket
    pub fn round_to_nearest_timestamp(&self) -> bool {
        self.shared.queue.round_to_nearest_timestamp()
    }

    pub fn set_round_to_nearest_timestamp(&self, round: bool) {
        self.shared.queue.set_round_to_nearest_timestamp(round);
    }

    /// Whether the bad-timestamp flag is disregarded
    pub fn ignore_bad_timestamps(&self) -> bool {
        self.shared
            .settings
            .ignore_bad_timestamps
            .load(Ordering::Acquire)
    }

    pub fn set_ignore_bad_timestamps(&self, ignore: bool) {
        self.shared
            .settings
            .ignore_bad_timestamps
            .store(ignore, Ordering::Release);
    }

    /// Whether future timestamps are checked against the lead time
    pub fn perform_timestamp_reasonability_check(&self) -> bool {
        self.shared.realtime.checks_reasonability()
    }

    /// Enable or disable the lead-time gate
    ///
    /// With the check off, measurements from any distance in the future are
    /// sorted and the newest one always becomes real time.
    pub fn set_perform_timestamp_reasonability_check(&self, enabled: bool) {
        self.shared.realtime.set_reasonability_check(enabled);
    }

    /// Whether every measurement is sorted regardless of its age
    pub fn process_by_received_timestamp(&self) -> bool {
        self.shared.settings.process_by_received_timestamp()
    }

    /// Sort everything on arrival and publish frames a lag time after their first sort
    ///
    /// Enabling it also switches real time to the local clock and turns
    /// sorting by arrival off.
    pub fn set_process_by_received_timestamp(&self, enabled: bool) {
        self.shared
            .settings
            .process_by_received_timestamp
            .store(enabled, Ordering::Release);
        if enabled {
            self.shared.realtime.set_use_local_clock(true);
            self.shared
                .settings
                .allow_sorts_by_arrival
                .store(false, Ordering::Release);
        }
    }

    /// Subscribe to notifications
    pub fn add_observer(&self, observer: Arc<dyn ConcentratorObserver>) {
        self.shared.observers.write().push(observer);
    }

    // Time

    /// Current real-time estimate
    pub fn real_time(&self) -> Ticks {
        self.shared.realtime.now()
    }

    /// Local clock time
    pub fn local_time(&self) -> Ticks {
        self.shared.realtime.local_now()
    }

    /// Seconds `timestamp` lies behind real time (negative if ahead)
    pub fn seconds_from_real_time(&self, timestamp: Ticks) -> f64 {
        self.shared.realtime.seconds_from(timestamp)
    }

    /// Milliseconds `timestamp` lies behind real time (negative if ahead)
    pub fn milliseconds_from_real_time(&self, timestamp: Ticks) -> f64 {
        (self.shared.realtime.now() - timestamp).to_milliseconds()
    }

    // State

    /// Latest-value index
    pub fn latest_measurements(&self) -> &LatestMeasurements {
        &self.shared.latest
    }

    /// Index within its second of the frame holding `ticks`
    pub fn frame_index_in_second(&self, ticks: Ticks) -> u32 {
        self.shared.queue.frame_index_in_second(ticks)
    }

    /// Frames waiting in the queue
    pub fn queued_frames(&self) -> usize {
        self.shared.queue.count()
    }

    /// Seconds of data waiting to be published
    pub fn unpublished_seconds(&self) -> usize {
        self.shared.unpublished_seconds()
    }

    /// Most recently published frame
    pub fn last_frame(&self) -> Option<Arc<Frame>> {
        self.shared.queue.last()
    }

    /// Most recently discarded measurement
    pub fn last_discarded_measurement(&self) -> Option<Measurement> {
        self.shared.stats.last_discarded()
    }

    /// Snapshot of the counters
    pub fn statistics(&self) -> StatsSnapshot {
        self.shared.stats.snapshot(self.shared.realtime.local_now())
    }

    /// Zero every counter
    pub fn reset_statistics(&self) {
        self.shared.stats.reset();
    }

    /// Multi-line status report
    pub fn status(&self) -> String {
        let shared = &self.shared;
        let stats = self.statistics();
        let local_time = shared.realtime.local_now();
        let mut status = String::new();

        status.push_str(&format!("=== Concentrator '{}' ===\n\n", shared.name));
        status.push_str(&format!(
            "                    State: {}\n",
            if self.is_running() { "running" } else { "stopped" }
        ));
        match stats.start_time {
            Some(start) => status.push_str(&format!(
                "                 Run time: {:.3} s (since {})\n",
                stats.run_time, start
            )),
            None => status.push_str("                 Run time: never started\n"),
        }
        status.push_str(&format!(
            "                 Lag time: {} s\n",
            self.lag_time()
        ));
        status.push_str(&format!(
            "                Lead time: {} s\n",
            self.lead_time()
        ));
        status.push_str(&format!("         Local clock (UTC): {}\n", local_time));
        status.push_str(&format!(
            "       Real-time source: {}\n",
            if self.use_local_clock_as_real_time() {
                "local clock"
            } else {
                "latest measurement"
            }
        ));
        if !self.use_local_clock_as_real_time() {
            status.push_str(&format!(
                "   Local clock deviation: {:.4} s from latest time\n",
                self.seconds_from_real_time(local_time)
            ));
        }
        status.push_str(&format!(
            "    Ignore bad timestamps: {}\n",
            self.ignore_bad_timestamps()
        ));
        status.push_str(&format!(
            "    Sorts by arrival: {}\n",
            if self.allow_sorts_by_arrival() { "allowed" } else { "discarded" }
        ));
        status.push_str(&format!(
            " Time reasonability check: {}\n",
            if self.perform_timestamp_reasonability_check() { "Enabled" } else { "Disabled" }
        ));
        status.push_str(&format!(
            " Process by received time: {}\n",
            self.process_by_received_timestamp()
        ));
        status.push_str(&format!(
            "     Down-sampling method: {:?}\n",
            self.downsampling_method()
        ));
        status.push_str(&format!(
            "  Maximum time resolution: {} ticks{}\n",
            self.time_resolution().value(),
            if self.round_to_nearest_timestamp() { ", rounded to nearest frame" } else { "" }
        ));
        if self.allow_preemptive_publishing() && self.expected_measurements() > 0 {
            status.push_str(&format!(
                "    Preemptive publishing: at {} measurements\n",
                self.expected_measurements()
            ));
        }
        status.push('\n');
        status.push_str(&stats.report());
        status.push('\n');

        let ticks_per_frame = self.ticks_per_frame();
        let publish_ticks = stats.average_publication_time_per_frame() * Ticks::PER_MILLISECOND as f64;
        status.push_str(&format!(
            "      Publisher utilization: {:.4}% of each frame\n",
            publish_ticks / ticks_per_frame * 100.0
        ));
        status.push_str(&format!(
            "       Defined frame rate: {} frames/sec, {:.2} ticks/frame\n",
            self.frames_per_second(),
            ticks_per_frame
        ));
        status.push_str(&format!(
            "     Actual mean frame rate: {:.2} frames/sec\n",
            stats.actual_frame_rate()
        ));
        status.push_str(&format!(
            "       Queued frame count: {}\n",
            self.queued_frames()
        ));

        match self.last_discarded_measurement() {
            Some(m) => status.push_str(&format!(
                "   Last discarded measurement: {} at {}\n",
                m, m.timestamp
            )),
            None => status.push_str("   Last discarded measurement: <none>\n"),
        }
        match self.last_frame() {
            Some(frame) => {
                status.push_str(&format!(
                    "     Last published frame: {} ({} measurements)\n",
                    frame.timestamp(),
                    frame.published_measurements()
                ));
                if let Some(m) = frame.last_sorted_measurement() {
                    status.push_str(&format!("   Last sorted measurement: {}\n", m));
                }
            }
            None => status.push_str("     Last published frame: <none>\n"),
        }

        status
    }
}

impl Drop for Concentrator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Concentrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Concentrator")
            .field("name", &self.shared.name)
            .field("running", &self.is_running())
            .field("frames_per_second", &self.frames_per_second())
            .field("lag_time", &self.lag_time())
            .field("lead_time", &self.lead_time())
            .finish()
    }
}

/// Wait out the head frame's lag time, or until it is complete
///
/// Returns `None` if stopped or if the head changed while waiting, and
/// otherwise whether the frame is being published ahead of schedule.
/// `taken` is when the frame became the head.
fn await_publication(
    shared: &Shared,
    token: &StopToken,
    frame: &Arc<Frame>,
    taken: Ticks,
) -> Option<bool> {
    loop {
        if token.is_stopped() {
            return None;
        }
        match shared.queue.peek_head() {
            Some(head) if Arc::ptr_eq(&head, frame) => {}
            _ => return None,
        }

        // By received timestamp, the lag runs from the first sort into the frame
        let reference = if shared.settings.process_by_received_timestamp() {
            frame.start_sort_time().unwrap_or(taken)
        } else {
            frame.timestamp()
        };
        let remaining = shared.lag_ticks() - (shared.realtime.now() - reference);
        if remaining <= Ticks::ZERO {
            return Some(false);
        }
        if let Some(expected) = shared.settings.preemptive_threshold() {
            if frame.len() >= expected {
                return Some(true);
            }
        }

        if remaining > SPIN_THRESHOLD {
            let nap = (remaining - SPIN_THRESHOLD).to_duration().min(COARSE_SLEEP);
            if token.sleep(nap) {
                return None;
            }
        } else {
            thread::yield_now();
        }
    }
}

fn publication_loop(shared: &Shared, token: &StopToken) {
    log::debug!("[{}] Publication thread running", shared.name);

    while !token.is_stopped() {
        let Some(frame) = shared.queue.wait_for_head(HEAD_POLL_INTERVAL) else {
            continue;
        };

        let wait_started = shared.realtime.local_now();
        let Some(ahead_of_schedule) = await_publication(shared, token, &frame, wait_started) else {
            continue;
        };

        // Closing the head also rejects any bucket that would sort before it
        if !shared.queue.claim_head(&frame) {
            continue;
        }

        let publish_started = shared.realtime.local_now();
        let timestamp = frame.timestamp();
        let frame_index = shared.queue.frame_index_in_second(timestamp);
        let measurements = frame.mark_published();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            (shared.publish)(frame.clone(), frame_index)
        }));

        // A stop may have cleared the queue and a new run taken over while
        // the callback ran; its head and counters are not ours
        let popped = shared.queue.pop_if(&frame).is_some();

        let published = shared.realtime.local_now();
        if popped && !token.is_stopped() {
            shared.stats.record_publication(
                measurements,
                frame.sort_span(),
                publish_started - wait_started,
                published - publish_started,
                ahead_of_schedule,
            );
            shared.stats.record_downsampled(frame.downsampled_measurements());
        }

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => shared.report_exception(ConcentratorError::Publish {
                timestamp,
                reason: e.to_string(),
            }),
            Err(payload) => shared.report_exception(ConcentratorError::PublishPanic {
                timestamp,
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    log::debug!("[{}] Publication thread exiting", shared.name);
}

fn monitor_loop(shared: &Shared, token: &StopToken) {
    while !token.sleep(shared.settings.monitor_interval) {
        let seconds = shared.unpublished_seconds();
        shared.notify(|observer| observer.unpublished_samples(seconds));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::Identity;
    use std::sync::mpsc;

    fn start_time() -> Ticks {
        Ticks::new(1_000_000 * Ticks::PER_SECOND)
    }

    fn stopped(config: ConcentratorConfig) -> (Arc<ManualClock>, Concentrator) {
        let clock = Arc::new(ManualClock::new(start_time()));
        let concentrator = Concentrator::builder(config)
            .clock(clock.clone())
            .build(|_, _| Ok(()))
            .unwrap();
        (clock, concentrator)
    }

    fn sample(id: u32, value: f64, ticks: Ticks) -> Measurement {
        Measurement::new(Identity::new(id, "PMU").unwrap(), value, ticks)
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = Concentrator::new(ConcentratorConfig::new(0, 3.0, 1.0), |_, _| Ok(()));
        assert!(matches!(
            result,
            Err(ConcentratorError::Config(ConfigError::InvalidFramesPerSecond(0)))
        ));
        assert!(Concentrator::new(ConcentratorConfig::new(30, -1.0, 1.0), |_, _| Ok(())).is_err());
    }

    #[test]
    fn test_setters_validate() {
        let (_clock, concentrator) = stopped(ConcentratorConfig::default());
        assert!(concentrator.set_frames_per_second(0).is_err());
        assert!(concentrator.set_lag_time(0.0).is_err());
        assert!(concentrator.set_lead_time(f64::NAN).is_err());
        assert_eq!(concentrator.lag_time(), 3.0);
        assert_eq!(concentrator.lead_time(), 1.0);

        concentrator.set_frames_per_second(60).unwrap();
        assert!((concentrator.ticks_per_frame() - 166_666.666).abs() < 0.001);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let (_clock, concentrator) = stopped(ConcentratorConfig::default());
        concentrator.stop();
        assert!(!concentrator.is_running());

        concentrator.start().unwrap();
        concentrator.start().unwrap();
        assert!(concentrator.is_running());

        concentrator.stop();
        concentrator.stop();
        assert!(!concentrator.is_running());
        assert!(concentrator.statistics().stop_time.is_some());
    }

    #[test]
    fn test_admission_window() {
        let config = ConcentratorConfig::new(30, 3.0, 1.0).with_local_clock(true);
        let (_clock, concentrator) = stopped(config);
        concentrator.start().unwrap();

        concentrator.sort(sample(1, 1.0, start_time() - Ticks::from_seconds(2.9)));
        concentrator.sort(sample(2, 1.0, start_time() - Ticks::from_seconds(3.1)));
        concentrator.sort(sample(3, 1.0, start_time() + Ticks::from_seconds(1.5)));

        let stats = concentrator.statistics();
        assert_eq!(stats.received_measurements, 3);
        assert_eq!(stats.processed_measurements, 1);
        assert_eq!(stats.discarded_measurements, 2);
        assert_eq!(concentrator.queued_frames(), 1);
        assert_eq!(
            concentrator.last_discarded_measurement().unwrap().identity().id(),
            3
        );
    }

    #[test]
    fn test_sort_by_arrival() {
        let config = ConcentratorConfig::new(30, 3.0, 1.0).with_local_clock(true);
        let (_clock, concentrator) = stopped(config);
        concentrator.start().unwrap();

        let bad = sample(1, 1.0, Ticks::ZERO).with_quality(true, false);
        concentrator.sort(bad.clone());
        assert_eq!(concentrator.statistics().measurements_sorted_by_arrival, 1);
        assert_eq!(concentrator.statistics().processed_measurements, 1);

        concentrator.set_allow_sorts_by_arrival(false);
        concentrator.sort(bad);
        let stats = concentrator.statistics();
        assert_eq!(stats.measurements_sorted_by_arrival, 1);
        assert_eq!(stats.discarded_measurements, 1);
    }

    #[test]
    fn test_custom_assign_strategy_refusal_counts_as_missed() {
        let clock = Arc::new(ManualClock::new(start_time()));
        let concentrator = Concentrator::builder(ConcentratorConfig::default().with_local_clock(true))
            .clock(clock)
            .assign_strategy(|_, _| false)
            .build(|_, _| Ok(()))
            .unwrap();
        concentrator.start().unwrap();

        concentrator.sort(sample(1, 1.0, start_time()));
        let stats = concentrator.statistics();
        assert_eq!(stats.missed_sorts_by_timeout, 1);
        assert_eq!(stats.discarded_measurements, 1);
    }

    #[test]
    fn test_publishes_after_lag() {
        let clock = Arc::new(ManualClock::new(start_time()));
        let (sender, published) = mpsc::channel();
        let sender = Mutex::new(sender);
        let concentrator = Concentrator::builder(ConcentratorConfig::new(10, 0.5, 0.5).with_local_clock(true))
            .clock(clock.clone())
            .build(move |frame, index| {
                let _ = sender.lock().send((frame.timestamp(), index, frame.len()));
                Ok(())
            })
            .unwrap();
        concentrator.start().unwrap();

        let ticks = start_time() + Ticks::from_milliseconds(250.0);
        concentrator.sort(sample(1, 1.0, ticks));
        concentrator.sort(sample(2, 2.0, ticks));

        assert!(published.recv_timeout(Duration::from_millis(100)).is_err());

        clock.advance_seconds(1.0);
        let (timestamp, index, count) = published.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(timestamp, start_time() + Ticks::from_milliseconds(200.0));
        assert_eq!(index, 2);
        assert_eq!(count, 2);

        concentrator.stop();
        let stats = concentrator.statistics();
        assert_eq!(stats.published_frames, 1);
        assert_eq!(stats.published_measurements, 2);
    }

    #[test]
    fn test_runtime_option_setters() {
        let (_clock, concentrator) = stopped(ConcentratorConfig::default());
        concentrator.set_downsampling_method(DownsamplingMethod::BestQuality);
        assert_eq!(concentrator.downsampling_method(), DownsamplingMethod::BestQuality);

        concentrator
            .set_time_resolution(Ticks::new(Ticks::PER_MILLISECOND))
            .unwrap();
        assert!(concentrator.set_frames_per_second(1000).is_err());
        concentrator.set_round_to_nearest_timestamp(true);
        concentrator.set_ignore_bad_timestamps(true);
        concentrator.set_perform_timestamp_reasonability_check(false);

        let status = concentrator.status();
        assert!(status.contains("Down-sampling method: BestQuality"));
        assert!(status.contains("Maximum time resolution: 10000 ticks, rounded to nearest frame"));
        assert!(status.contains("Ignore bad timestamps: true"));
        assert!(status.contains("Time reasonability check: Disabled"));

        concentrator.set_process_by_received_timestamp(true);
        assert!(concentrator.use_local_clock_as_real_time());
        assert!(!concentrator.allow_sorts_by_arrival());
        concentrator.set_process_by_received_timestamp(false);
        concentrator.set_allow_sorts_by_arrival(true);
        assert!(concentrator.allow_sorts_by_arrival());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_stop_token_interrupts_sleep() {
        let token = Arc::new(StopToken::new());
        let sleeper = {
            let token = token.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let stopped = token.sleep(Duration::from_secs(10));
                (stopped, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        token.stop();
        let (stopped, elapsed) = sleeper.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
    }
}
