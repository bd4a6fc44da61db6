//! Latest-value index fed through a running concentrator

use std::sync::Arc;

use approx::assert_relative_eq;
use ::concentrator::*;

fn base() -> Ticks {
    Ticks::new(1_650_000_000 * Ticks::PER_SECOND)
}

fn phasor(id: u32, value: f64, ticks: Ticks) -> Measurement {
    Measurement::new(Identity::new(id, "BUS").unwrap(), value, ticks)
}

fn tracking() -> (Arc<ManualClock>, Concentrator) {
    let clock = Arc::new(ManualClock::new(base()));
    let config = ConcentratorConfig::new(30, 2.0, 1.0)
        .with_local_clock(true)
        .with_latest_measurements(true);
    let concentrator = Concentrator::builder(config)
        .clock(clock.clone())
        .build(|_, _| Ok(()))
        .unwrap();
    concentrator.start().unwrap();
    (clock, concentrator)
}

#[test]
fn test_sorted_measurements_feed_the_index() {
    let (_clock, concentrator) = tracking();
    concentrator.sort_batch(&[
        phasor(1, 10.0, base()),
        phasor(2, 20.0, base()),
        phasor(3, 30.0, base()).with_adjustment(2.0, 1.0),
    ]);

    let latest = concentrator.latest_measurements();
    assert_eq!(latest.len(), 3);
    assert_eq!(latest.value(&Identity::new(3, "bus").unwrap()), 61.0);
    assert_relative_eq!(latest.average().unwrap(), 91.0 / 3.0, epsilon = 1e-12);
    assert_eq!(latest.minimum(), Some(10.0));
    assert_eq!(latest.maximum(), Some(61.0));
}

#[test]
fn test_discarded_measurements_never_reach_the_index() {
    let (_clock, concentrator) = tracking();
    concentrator.sort(phasor(1, 10.0, base() - Ticks::from_seconds(5.0)));
    assert!(concentrator.latest_measurements().is_empty());
}

#[test]
fn test_tracking_can_be_switched_off() {
    let (_clock, concentrator) = tracking();
    concentrator.set_track_latest_measurements(false);
    concentrator.sort(phasor(1, 10.0, base()));
    assert!(concentrator.latest_measurements().is_empty());
}

#[test]
fn test_older_samples_do_not_overwrite() {
    let (_clock, concentrator) = tracking();
    let id = Identity::new(1, "BUS").unwrap();

    concentrator.sort(phasor(1, 10.0, base()));
    concentrator.sort(phasor(1, 99.0, base() - Ticks::from_milliseconds(100.0)));
    assert_eq!(concentrator.latest_measurements().value(&id), 10.0);
}

#[test]
fn test_values_expire_and_lag_change_revives_them() {
    let (clock, concentrator) = tracking();
    let id = Identity::new(1, "BUS").unwrap();
    concentrator.sort(phasor(1, 10.0, base()));

    clock.advance_seconds(3.0);
    assert!(concentrator.latest_measurements().value(&id).is_nan());
    assert_eq!(concentrator.latest_measurements().average(), None);

    concentrator.set_lag_time(4.0).unwrap();
    assert_eq!(concentrator.latest_measurements().value(&id), 10.0);
}

#[test]
fn test_tag_aggregates() {
    let (_clock, concentrator) = tracking();
    let latest = concentrator.latest_measurements();
    for (id, value) in [(1, 59.95), (2, 60.05), (3, 61.0)] {
        concentrator.sort(phasor(id, value, base()));
    }
    latest.add_tag("east", Identity::new(1, "BUS").unwrap());
    latest.add_tag("east", Identity::new(2, "BUS").unwrap());
    latest.add_tag("west", Identity::new(3, "BUS").unwrap());
    latest.add_tag("west", Identity::new(4, "BUS").unwrap());

    assert_relative_eq!(latest.tagged_average("east").unwrap(), 60.0, epsilon = 1e-9);
    assert_eq!(latest.tagged_minimum("east"), Some(59.95));
    // Tagged but never reported identities are ignored
    assert_eq!(latest.tagged_average("west"), Some(61.0));
    assert_eq!(latest.tag_identities("west").len(), 2);
}
