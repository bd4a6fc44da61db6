//! Ordered frame queue
//!
//! Frames are kept in ascending bucket order with a parallel index for O(1)
//! lookup. The earliest unconsumed frame is the *head*; the publication loop
//! blocks until one exists, and producers assign it whenever they create a
//! frame at the very front.
//!
//! Popping is split in two. [`FrameQueue::pop`] only detaches the head and
//! advances the high-water mark, then hands the bucket to a background
//! remover thread. The remover takes the queue lock with `try_lock` and
//! backs off on contention, so a busy producer never stalls publication.
//! No frame is ever created at or below the high-water mark.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{ConcentratorError, ConfigError, Result};
use crate::frame::{Frame, FrameFactory};
use crate::ticks::Ticks;

/// Contended attempts that only yield before the remover starts sleeping
const REMOVAL_SPIN_ATTEMPTS: u32 = 16;

/// Back-off between contended removal attempts once spinning gave up
const REMOVAL_BACKOFF: Duration = Duration::from_micros(100);

#[derive(Default)]
struct QueueState {
    frames: VecDeque<Arc<Frame>>,
    index: HashMap<Ticks, Arc<Frame>>,
    head: Option<Arc<Frame>>,
    last: Option<Arc<Frame>>,
}

impl QueueState {
    fn remove(&mut self, bucket: Ticks) {
        self.index.remove(&bucket);
        if let Some(position) = self.frames.iter().position(|f| f.timestamp() == bucket) {
            self.frames.remove(position);
        }
    }
}

struct QueueShared {
    state: Mutex<QueueState>,
    head_ready: Condvar,
    frames_per_second: AtomicU32,
    time_resolution: AtomicI64,
    round_to_nearest: AtomicBool,
    high_water_mark: AtomicI64,
    factory: FrameFactory,
}

impl QueueShared {
    /// Remove a popped bucket and promote the next head
    fn complete_removal(&self, state: &mut QueueState, bucket: Ticks) {
        state.remove(bucket);
        if state.head.is_none() {
            state.head = state.frames.front().cloned();
            if state.head.is_some() {
                self.head_ready.notify_all();
            }
        }
    }

    fn remove_with_backoff(&self, bucket: Ticks) {
        let mut attempts = 0u32;
        loop {
            if let Some(mut state) = self.state.try_lock() {
                self.complete_removal(&mut state, bucket);
                return;
            }
            attempts += 1;
            if attempts < REMOVAL_SPIN_ATTEMPTS {
                thread::yield_now();
            } else {
                thread::sleep(REMOVAL_BACKOFF);
            }
        }
    }
}

const PER_SECOND: i128 = Ticks::PER_SECOND as i128;

/// Bucketing settings read once per lookup
struct Bucketing {
    fps: i128,
    resolution: i128,
    round: bool,
}

impl Bucketing {
    /// Frames since the epoch up to the bucket holding `ticks`
    fn frame_number(&self, ticks: Ticks) -> i128 {
        let mut ticks = i128::from(ticks.value());
        if self.resolution > 1 {
            if self.round {
                ticks += PER_SECOND / (2 * self.fps);
            }
            // Frame covering the last tick of the resolution cell
            let cell_end = ticks.div_euclid(self.resolution) * self.resolution + self.resolution;
            (cell_end * self.fps - 1).div_euclid(PER_SECOND)
        } else if self.round {
            (2 * ticks * self.fps + PER_SECOND).div_euclid(2 * PER_SECOND)
        } else {
            (ticks * self.fps).div_euclid(PER_SECOND)
        }
    }
}

struct Remover {
    sender: Sender<Ticks>,
    handle: JoinHandle<()>,
}

/// Time-ordered queue of frames awaiting publication
pub struct FrameQueue {
    shared: Arc<QueueShared>,
    remover: Mutex<Option<Remover>>,
}

impl FrameQueue {
    /// Create a queue producing frames with `factory`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `frames_per_second` is zero.
    pub fn new(frames_per_second: u32, factory: FrameFactory) -> Result<Self> {
        let frames_per_second = ConfigError::check_frames_per_second(frames_per_second)?;
        Ok(Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState::default()),
                head_ready: Condvar::new(),
                frames_per_second: AtomicU32::new(frames_per_second),
                time_resolution: AtomicI64::new(0),
                round_to_nearest: AtomicBool::new(false),
                high_water_mark: AtomicI64::new(i64::MIN),
                factory,
            }),
            remover: Mutex::new(None),
        })
    }

    /// Frame rate used for bucketing
    pub fn frames_per_second(&self) -> u32 {
        self.shared.frames_per_second.load(Ordering::Acquire)
    }

    /// Change the frame rate; frames already queued keep their buckets
    ///
    /// # Errors
    ///
    /// Fails if the rate is zero or the current time resolution is wider
    /// than half a frame at the new rate.
    pub fn set_frames_per_second(&self, frames_per_second: u32) -> Result<()> {
        let frames_per_second = ConfigError::check_frames_per_second(frames_per_second)?;
        ConfigError::check_time_resolution(self.time_resolution(), frames_per_second)?;
        self.shared
            .frames_per_second
            .store(frames_per_second, Ordering::Release);
        Ok(())
    }

    /// Sorting resolution; `0` and `1` both mean full tick precision
    pub fn time_resolution(&self) -> Ticks {
        Ticks::new(self.shared.time_resolution.load(Ordering::Acquire))
    }

    /// Change the sorting resolution
    ///
    /// Bucket timestamps are truncated to a multiple of the resolution, so
    /// 30 fps at one millisecond yields 0, 33 and 66 ms instead of the
    /// exact thirds of a second.
    pub fn set_time_resolution(&self, resolution: Ticks) -> Result<()> {
        let resolution = ConfigError::check_time_resolution(resolution, self.frames_per_second())?;
        self.shared
            .time_resolution
            .store(resolution.value(), Ordering::Release);
        Ok(())
    }

    /// Whether timestamps go to the nearest bucket instead of the one they fall in
    pub fn round_to_nearest_timestamp(&self) -> bool {
        self.shared.round_to_nearest.load(Ordering::Acquire)
    }

    pub fn set_round_to_nearest_timestamp(&self, round: bool) {
        self.shared.round_to_nearest.store(round, Ordering::Release);
    }

    /// Width of one bucket in (fractional) ticks
    pub fn ticks_per_frame(&self) -> f64 {
        Ticks::PER_SECOND as f64 / self.frames_per_second() as f64
    }

    fn bucketing(&self) -> Bucketing {
        Bucketing {
            fps: i128::from(self.frames_per_second()),
            resolution: i128::from(self.time_resolution().value()),
            round: self.round_to_nearest_timestamp(),
        }
    }

    /// Bucket timestamp that `ticks` falls into
    ///
    /// Buckets start at `ceil(n * PER_SECOND / fps)` so every bucket
    /// timestamp maps back onto its own bucket, even when a frame is not a
    /// whole number of ticks wide. With a coarser time resolution the start
    /// is truncated to a multiple of it instead.
    pub fn bucket(&self, ticks: Ticks) -> Ticks {
        let bucketing = self.bucketing();
        let span = bucketing.frame_number(ticks) * PER_SECOND;
        let start = if bucketing.resolution > 1 {
            let exact = span.div_euclid(bucketing.fps);
            exact.div_euclid(bucketing.resolution) * bucketing.resolution
        } else {
            -(-span).div_euclid(bucketing.fps)
        };
        Ticks::new(start as i64)
    }

    /// Index of the bucket holding `ticks` within its second
    pub fn frame_index_in_second(&self, ticks: Ticks) -> u32 {
        let bucketing = self.bucketing();
        bucketing.frame_number(ticks).rem_euclid(bucketing.fps) as u32
    }

    /// Bucket of the most recently popped frame
    pub fn high_water_mark(&self) -> Option<Ticks> {
        match self.shared.high_water_mark.load(Ordering::Acquire) {
            i64::MIN => None,
            ticks => Some(Ticks::new(ticks)),
        }
    }

    /// Frame for the bucket holding `ticks`, created on first reference
    ///
    /// Returns `None` when the bucket is at or below the high-water mark;
    /// the caller must discard the measurement.
    pub fn get_frame(&self, ticks: Ticks) -> Option<Arc<Frame>> {
        let bucket = self.bucket(ticks);
        if bucket.value() <= self.shared.high_water_mark.load(Ordering::Acquire) {
            return None;
        }

        let mut state = self.shared.state.lock();
        if bucket.value() <= self.shared.high_water_mark.load(Ordering::Acquire) {
            return None;
        }
        if let Some(frame) = state.index.get(&bucket) {
            return Some(frame.clone());
        }

        let frame = Arc::new((self.shared.factory)(bucket));

        // New buckets almost always belong at the back
        let mut position = state.frames.len();
        while position > 0 && state.frames[position - 1].timestamp() > bucket {
            position -= 1;
        }
        state.frames.insert(position, frame.clone());
        state.index.insert(bucket, frame.clone());

        if position == 0 {
            state.head = Some(frame.clone());
            self.shared.head_ready.notify_all();
        }

        log::debug!("Created frame {} at queue position {}", bucket, position);
        Some(frame)
    }

    /// Current head, blocking until one is assigned
    pub fn head(&self) -> Arc<Frame> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(head) = &state.head {
                return head.clone();
            }
            self.shared.head_ready.wait(&mut state);
        }
    }

    /// Current head, waiting at most `timeout` for one to be assigned
    pub fn wait_for_head(&self, timeout: Duration) -> Option<Arc<Frame>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(head) = &state.head {
                return Some(head.clone());
            }
            if self
                .shared
                .head_ready
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.head.clone();
            }
        }
    }

    /// Current head without waiting
    pub fn peek_head(&self) -> Option<Arc<Frame>> {
        self.shared.state.lock().head.clone()
    }

    /// Close the bucket range up to `frame` if it is still the head
    ///
    /// Advances the high-water mark to the frame's bucket, so no frame can
    /// be created in front of it while it is being published. Returns
    /// `false` if another frame became head in the meantime.
    pub fn claim_head(&self, frame: &Arc<Frame>) -> bool {
        let state = self.shared.state.lock();
        match &state.head {
            Some(head) if Arc::ptr_eq(head, frame) => {
                self.shared
                    .high_water_mark
                    .fetch_max(frame.timestamp().value(), Ordering::AcqRel);
                true
            }
            _ => false,
        }
    }

    /// Detach the head and schedule its removal
    ///
    /// The next head is assigned once the remover has taken the popped
    /// frame out of the queue.
    pub fn pop(&self) -> Option<Arc<Frame>> {
        let head = {
            let mut state = self.shared.state.lock();
            let head = state.head.take()?;
            self.detach(&mut state, head)
        };
        self.schedule_removal(head.timestamp());
        Some(head)
    }

    /// Pop the head only if it is still `frame`
    ///
    /// A publisher that outlived a stop must not pop the head of the next
    /// run, so it pops through this instead of [`FrameQueue::pop`].
    pub fn pop_if(&self, frame: &Arc<Frame>) -> Option<Arc<Frame>> {
        let head = {
            let mut state = self.shared.state.lock();
            match &state.head {
                Some(head) if Arc::ptr_eq(head, frame) => {}
                _ => return None,
            }
            let head = state.head.take()?;
            self.detach(&mut state, head)
        };
        self.schedule_removal(head.timestamp());
        Some(head)
    }

    fn detach(&self, state: &mut QueueState, head: Arc<Frame>) -> Arc<Frame> {
        state.last = Some(head.clone());
        self.shared
            .high_water_mark
            .fetch_max(head.timestamp().value(), Ordering::AcqRel);
        head
    }

    fn schedule_removal(&self, bucket: Ticks) {
        log::debug!("Popped frame {}", bucket);

        let queued = self
            .remover
            .lock()
            .as_ref()
            .map(|remover| remover.sender.send(bucket).is_ok())
            .unwrap_or(false);
        if !queued {
            let mut state = self.shared.state.lock();
            self.shared.complete_removal(&mut state, bucket);
        }
    }

    /// Most recently popped frame
    pub fn last(&self) -> Option<Arc<Frame>> {
        self.shared.state.lock().last.clone()
    }

    /// Number of frames in the queue
    pub fn count(&self) -> usize {
        self.shared.state.lock().frames.len()
    }

    /// Bucket timestamps currently queued, in order
    pub fn timestamps(&self) -> Vec<Ticks> {
        self.shared
            .state
            .lock()
            .frames
            .iter()
            .map(|frame| frame.timestamp())
            .collect()
    }

    /// Drop every queued frame and forget the high-water mark
    ///
    /// The last popped frame is kept for status reporting.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        state.frames.clear();
        state.index.clear();
        state.head = None;
        self.shared.high_water_mark.store(i64::MIN, Ordering::Release);
    }

    /// Start the background remover; no-op if it is already running
    ///
    /// # Errors
    ///
    /// Returns [`ConcentratorError::Spawn`] if the thread cannot be created.
    pub fn start(&self) -> Result<()> {
        let mut remover = self.remover.lock();
        if remover.is_some() {
            return Ok(());
        }

        let (sender, receiver) = mpsc::channel::<Ticks>();
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("frame-queue-remover".to_string())
            .spawn(move || {
                // Exits once the sender is dropped and the backlog is drained
                while let Ok(bucket) = receiver.recv() {
                    shared.remove_with_backoff(bucket);
                }
            })
            .map_err(|e| ConcentratorError::Spawn(format!("frame-queue-remover: {}", e)))?;

        *remover = Some(Remover { sender, handle });
        Ok(())
    }

    /// Stop the remover after it drains pending removals; idempotent
    pub fn stop(&self) {
        let Some(Remover { sender, handle }) = self.remover.lock().take() else {
            return;
        };
        drop(sender);
        if handle.join().is_err() {
            log::warn!("Frame queue remover thread panicked");
        }
    }

    /// Whether the remover thread is running
    pub fn is_running(&self) -> bool {
        self.remover.lock().is_some()
    }
}

impl Drop for FrameQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameQueue")
            .field("frames_per_second", &self.frames_per_second())
            .field("count", &self.count())
            .field("high_water_mark", &self.high_water_mark())
            .finish()
    }
}
