//! Concentrator notifications
//!
//! Owners subscribe with a [`ConcentratorObserver`]. Every method has a
//! no-op default so observers only implement what they care about.
//! [`ChannelObserver`] forwards everything onto an mpsc channel, which is
//! the easiest way to consume events from another thread.

use std::sync::mpsc::{self, Receiver, Sender};

use parking_lot::Mutex;

use crate::error::ConcentratorError;
use crate::measurement::Measurement;

/// Callbacks raised by a running concentrator
///
/// Observers are called from the concentrator's worker and producer
/// threads and must not block.
pub trait ConcentratorObserver: Send + Sync {
    /// Seconds of data waiting in the queue, raised by the backlog monitor
    fn unpublished_samples(&self, _seconds: usize) {}

    /// A fault that did not stop the concentrator
    fn process_exception(&self, _error: &ConcentratorError) {}

    /// Lag tolerance changed
    fn lag_time_changed(&self, _lag_time: f64) {}

    /// Lead tolerance changed
    fn lead_time_changed(&self, _lead_time: f64) {}

    /// Measurements from one sort call that were discarded
    fn discarding_measurements(&self, _measurements: &[Measurement]) {}
}

/// Owned form of every notification
#[derive(Debug, Clone, PartialEq)]
pub enum ConcentratorEvent {
    /// Backlog in whole seconds
    UnpublishedSamples(usize),
    /// Non-fatal fault
    ProcessException(ConcentratorError),
    /// New lag tolerance
    LagTimeChanged(f64),
    /// New lead tolerance
    LeadTimeChanged(f64),
    /// Discarded measurements from one sort call
    DiscardingMeasurements(Vec<Measurement>),
}

/// Observer that sends every notification down a channel
pub struct ChannelObserver {
    sender: Mutex<Sender<ConcentratorEvent>>,
}

impl ChannelObserver {
    /// Create an observer and the receiving end of its channel
    pub fn new() -> (Self, Receiver<ConcentratorEvent>) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Mutex::new(sender),
            },
            receiver,
        )
    }

    fn send(&self, event: ConcentratorEvent) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.sender.lock().send(event);
    }
}

impl ConcentratorObserver for ChannelObserver {
    fn unpublished_samples(&self, seconds: usize) {
        self.send(ConcentratorEvent::UnpublishedSamples(seconds));
    }

    fn process_exception(&self, error: &ConcentratorError) {
        self.send(ConcentratorEvent::ProcessException(error.clone()));
    }

    fn lag_time_changed(&self, lag_time: f64) {
        self.send(ConcentratorEvent::LagTimeChanged(lag_time));
    }

    fn lead_time_changed(&self, lead_time: f64) {
        self.send(ConcentratorEvent::LeadTimeChanged(lead_time));
    }

    fn discarding_measurements(&self, measurements: &[Measurement]) {
        self.send(ConcentratorEvent::DiscardingMeasurements(
            measurements.to_vec(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::ticks::Ticks;

    struct Silent;
    impl ConcentratorObserver for Silent {}

    #[test]
    fn test_default_methods_are_no_ops() {
        let observer = Silent;
        observer.unpublished_samples(3);
        observer.lag_time_changed(1.0);
        observer.discarding_measurements(&[]);
    }

    #[test]
    fn test_channel_observer_forwards_events() {
        let (observer, events) = ChannelObserver::new();
        let m = Measurement::new(Identity::new(1, "PMU").unwrap(), 1.0, Ticks::new(5));

        observer.unpublished_samples(2);
        observer.lead_time_changed(0.5);
        observer.discarding_measurements(std::slice::from_ref(&m));
        observer.process_exception(&ConcentratorError::Spawn("x".to_string()));

        let received: Vec<ConcentratorEvent> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![
                ConcentratorEvent::UnpublishedSamples(2),
                ConcentratorEvent::LeadTimeChanged(0.5),
                ConcentratorEvent::DiscardingMeasurements(vec![m]),
                ConcentratorEvent::ProcessException(ConcentratorError::Spawn("x".to_string())),
            ]
        );
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (observer, events) = ChannelObserver::new();
        drop(events);
        observer.unpublished_samples(1);
    }
}
