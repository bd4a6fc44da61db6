//! Latest-value index
//!
//! Keeps the newest value per identity regardless of frame timing. Entries
//! are [`TemporalMeasurement`]s created lazily with the current lag/lead
//! tolerances, so an identity that stops reporting reads back as NaN once
//! real time moves past its window. Identities can be grouped under tags
//! for ad hoc aggregates.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ConfigError, Result};
use crate::identity::Identity;
use crate::measurement::{Measurement, TemporalMeasurement};
use crate::realtime::RealTimeEstimate;

/// Newest value per identity, gated by the shared real-time estimate
pub struct LatestMeasurements {
    realtime: Arc<RealTimeEstimate>,
    entries: RwLock<HashMap<Identity, TemporalMeasurement>>,
    tags: RwLock<HashMap<String, BTreeSet<Identity>>>,
    lag_time: AtomicU64,
    lead_time: AtomicU64,
}

impl LatestMeasurements {
    /// Create an empty index
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless both tolerances are positive.
    pub fn new(realtime: Arc<RealTimeEstimate>, lag_time: f64, lead_time: f64) -> Result<Self> {
        let lag_time = ConfigError::check_lag_time(lag_time)?;
        let lead_time = ConfigError::check_lead_time(lead_time)?;
        Ok(Self {
            realtime,
            entries: RwLock::new(HashMap::new()),
            tags: RwLock::new(HashMap::new()),
            lag_time: AtomicU64::new(lag_time.to_bits()),
            lead_time: AtomicU64::new(lead_time.to_bits()),
        })
    }

    /// Past tolerance applied to entries
    pub fn lag_time(&self) -> f64 {
        f64::from_bits(self.lag_time.load(Ordering::Acquire))
    }

    /// Future tolerance applied to entries
    pub fn lead_time(&self) -> f64 {
        f64::from_bits(self.lead_time.load(Ordering::Acquire))
    }

    /// Apply a measurement under the newest-wins rule
    ///
    /// Returns `true` if the stored value changed.
    pub fn update(&self, measurement: &Measurement) -> bool {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(measurement.identity()) {
            return entry.update(measurement);
        }
        match TemporalMeasurement::from_measurement(
            measurement.clone(),
            self.lag_time(),
            self.lead_time(),
        ) {
            Ok(entry) => {
                entries.insert(measurement.identity().clone(), entry);
                true
            }
            // Tolerances are validated on every change, so this cannot fire
            Err(_) => false,
        }
    }

    /// Current value of `identity`, NaN if unknown or outside its window
    pub fn value(&self, identity: &Identity) -> f64 {
        let now = self.realtime.now();
        self.entries
            .read()
            .get(identity)
            .map(|entry| entry.get(now))
            .unwrap_or(f64::NAN)
    }

    /// Stored entry for `identity`, regardless of its window
    pub fn measurement(&self, identity: &Identity) -> Option<TemporalMeasurement> {
        self.entries.read().get(identity).cloned()
    }

    /// Number of tracked identities
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is tracked yet
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Tracked identities, ordered
    pub fn identities(&self) -> Vec<Identity> {
        let mut identities: Vec<Identity> = self.entries.read().keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Forget every entry (tags are kept)
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Average of every current value, `None` if none is current
    pub fn average(&self) -> Option<f64> {
        aggregate(self.current_values(None)).map(|a| a.average())
    }

    /// Smallest current value
    pub fn minimum(&self) -> Option<f64> {
        aggregate(self.current_values(None)).map(|a| a.minimum)
    }

    /// Largest current value
    pub fn maximum(&self) -> Option<f64> {
        aggregate(self.current_values(None)).map(|a| a.maximum)
    }

    /// Average over the identities tagged `tag`
    pub fn tagged_average(&self, tag: &str) -> Option<f64> {
        aggregate(self.current_values(Some(tag))).map(|a| a.average())
    }

    /// Minimum over the identities tagged `tag`
    pub fn tagged_minimum(&self, tag: &str) -> Option<f64> {
        aggregate(self.current_values(Some(tag))).map(|a| a.minimum)
    }

    /// Maximum over the identities tagged `tag`
    pub fn tagged_maximum(&self, tag: &str) -> Option<f64> {
        aggregate(self.current_values(Some(tag))).map(|a| a.maximum)
    }

    /// Put `identity` in the `tag` group
    pub fn add_tag(&self, tag: impl Into<String>, identity: Identity) {
        self.tags.write().entry(tag.into()).or_default().insert(identity);
    }

    /// Take `identity` out of the `tag` group; empty groups are dropped
    pub fn remove_tag(&self, tag: &str, identity: &Identity) -> bool {
        let mut tags = self.tags.write();
        let Some(group) = tags.get_mut(tag) else {
            return false;
        };
        let removed = group.remove(identity);
        if group.is_empty() {
            tags.remove(tag);
        }
        removed
    }

    /// Identities in the `tag` group, ordered
    pub fn tag_identities(&self, tag: &str) -> Vec<Identity> {
        self.tags
            .read()
            .get(tag)
            .map(|group| group.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Known tag names, sorted
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.tags.read().keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Push new tolerances to the index and every tracked entry
    ///
    /// # Errors
    ///
    /// Returns a configuration error, leaving everything unchanged, unless
    /// both tolerances are positive.
    pub fn set_tolerances(&self, lag_time: f64, lead_time: f64) -> Result<()> {
        let lag_time = ConfigError::check_lag_time(lag_time)?;
        let lead_time = ConfigError::check_lead_time(lead_time)?;

        let mut entries = self.entries.write();
        self.lag_time.store(lag_time.to_bits(), Ordering::Release);
        self.lead_time.store(lead_time.to_bits(), Ordering::Release);
        for entry in entries.values_mut() {
            entry.set_lag_time(lag_time)?;
            entry.set_lead_time(lead_time)?;
        }
        Ok(())
    }

    fn current_values(&self, tag: Option<&str>) -> Vec<f64> {
        let now = self.realtime.now();
        let entries = self.entries.read();
        match tag {
            None => entries.values().map(|entry| entry.get(now)).collect(),
            Some(tag) => {
                let tags = self.tags.read();
                let Some(group) = tags.get(tag) else {
                    return Vec::new();
                };
                group
                    .iter()
                    .filter_map(|identity| entries.get(identity))
                    .map(|entry| entry.get(now))
                    .collect()
            }
        }
    }
}

struct Aggregate {
    sum: f64,
    count: usize,
    minimum: f64,
    maximum: f64,
}

impl Aggregate {
    fn average(&self) -> f64 {
        self.sum / self.count as f64
    }
}

fn aggregate(values: Vec<f64>) -> Option<Aggregate> {
    values
        .into_iter()
        .filter(|value| !value.is_nan())
        .fold(None, |acc: Option<Aggregate>, value| {
            Some(match acc {
                None => Aggregate {
                    sum: value,
                    count: 1,
                    minimum: value,
                    maximum: value,
                },
                Some(a) => Aggregate {
                    sum: a.sum + value,
                    count: a.count + 1,
                    minimum: a.minimum.min(value),
                    maximum: a.maximum.max(value),
                },
            })
        })
}

impl fmt::Debug for LatestMeasurements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LatestMeasurements")
            .field("entries", &self.len())
            .field("tags", &self.tags.read().len())
            .field("lag_time", &self.lag_time())
            .field("lead_time", &self.lead_time())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ticks::Ticks;

    fn start() -> Ticks {
        Ticks::new(500 * Ticks::PER_SECOND)
    }

    fn index() -> (Arc<ManualClock>, LatestMeasurements) {
        let clock = Arc::new(ManualClock::new(start()));
        let realtime = Arc::new(RealTimeEstimate::new(clock.clone(), 1.0, true));
        (clock, LatestMeasurements::new(realtime, 3.0, 1.0).unwrap())
    }

    fn sample(id: u32, value: f64, ticks: Ticks) -> Measurement {
        Measurement::new(Identity::new(id, "BUS").unwrap(), value, ticks)
    }

    #[test]
    fn test_update_is_newest_wins() {
        let (_clock, latest) = index();
        let id = Identity::new(1, "BUS").unwrap();

        assert!(latest.update(&sample(1, 10.0, start())));
        assert!(!latest.update(&sample(1, 5.0, start() - Ticks::from_seconds(0.5))));
        assert_eq!(latest.value(&id), 10.0);

        assert!(latest.update(&sample(1, 12.0, start() + Ticks::from_seconds(0.1))));
        assert_eq!(latest.value(&id), 12.0);
    }

    #[test]
    fn test_value_expires_with_real_time() {
        let (clock, latest) = index();
        let id = Identity::new(1, "BUS").unwrap();
        latest.update(&sample(1, 10.0, start()));

        clock.advance_seconds(2.5);
        assert_eq!(latest.value(&id), 10.0);
        clock.advance_seconds(1.0);
        assert!(latest.value(&id).is_nan());
        assert!(latest.measurement(&id).is_some());
    }

    #[test]
    fn test_unknown_identity_is_nan() {
        let (_clock, latest) = index();
        assert!(latest.value(&Identity::new(9, "BUS").unwrap()).is_nan());
        assert!(latest.average().is_none());
    }

    #[test]
    fn test_aggregates_skip_nan() {
        let (_clock, latest) = index();
        latest.update(&sample(1, 2.0, start()));
        latest.update(&sample(2, 4.0, start()));
        latest.update(&sample(3, 9.0, start() - Ticks::from_seconds(10.0)));

        assert_eq!(latest.average(), Some(3.0));
        assert_eq!(latest.minimum(), Some(2.0));
        assert_eq!(latest.maximum(), Some(4.0));
    }

    #[test]
    fn test_tag_groups() {
        let (_clock, latest) = index();
        for (id, value) in [(1, 1.0), (2, 5.0), (3, 100.0)] {
            latest.update(&sample(id, value, start()));
        }
        latest.add_tag("feeder", Identity::new(1, "BUS").unwrap());
        latest.add_tag("feeder", Identity::new(2, "BUS").unwrap());

        assert_eq!(latest.tagged_average("feeder"), Some(3.0));
        assert_eq!(latest.tagged_maximum("feeder"), Some(5.0));
        assert_eq!(latest.tagged_minimum("unknown"), None);
        assert_eq!(latest.tags(), vec!["feeder".to_string()]);

        assert!(latest.remove_tag("feeder", &Identity::new(1, "BUS").unwrap()));
        assert!(latest.remove_tag("feeder", &Identity::new(2, "BUS").unwrap()));
        assert!(latest.tags().is_empty());
    }

    #[test]
    fn test_tolerance_broadcast() {
        let (clock, latest) = index();
        let id = Identity::new(1, "BUS").unwrap();
        latest.update(&sample(1, 10.0, start()));
        clock.advance_seconds(4.0);
        assert!(latest.value(&id).is_nan());

        latest.set_tolerances(5.0, 1.0).unwrap();
        assert_eq!(latest.value(&id), 10.0);
        assert_eq!(latest.measurement(&id).unwrap().lag_time(), 5.0);

        assert!(latest.set_tolerances(0.0, 1.0).is_err());
        assert_eq!(latest.lag_time(), 5.0);
    }
}
