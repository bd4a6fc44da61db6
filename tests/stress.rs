//! Stress tests for the concentrator
//!
//! These tests are marked #[ignore] by default because they take time.
//! Run with: cargo test --test stress -- --ignored

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ::concentrator::*;
use rand::Rng;

fn stream(source: usize, id: usize) -> Identity {
    Identity::new(id as u32, &format!("PMU_{}", source)).unwrap()
}

#[test]
#[ignore]
fn stress_test_sort_throughput() {
    let clock = Arc::new(ManualClock::new(Ticks::from_seconds(1_700_000_000.0)));
    let config = ConcentratorConfig::new(30, 5.0, 5.0).with_local_clock(true);
    let concentrator = Concentrator::builder(config)
        .clock(clock.clone())
        .build(|_, _| Ok(()))
        .unwrap();

    let streams: Vec<_> = (0..100).map(|i| stream(i / 10, i % 10)).collect();
    let iterations = 10_000;
    let start = Instant::now();

    for i in 0..iterations {
        let ticks = clock.now() + Ticks::from_milliseconds((i % 30) as f64 * 33.3);
        let batch: Vec<_> = streams
            .iter()
            .map(|id| Measurement::new(id.clone(), i as f64, ticks))
            .collect();
        concentrator.sort_batch(&batch);
        if i % 30 == 29 {
            clock.advance_seconds(1.0);
        }
    }

    let elapsed = start.elapsed();
    let total = iterations * streams.len();
    let rate = total as f64 / elapsed.as_secs_f64();

    println!("Sorted {} measurements in {:?}", total, elapsed);
    println!("Rate: {:.0} measurements/second", rate);

    let stats = concentrator.statistics();
    assert_eq!(stats.received_measurements, total as u64);
    assert!(
        rate > 200_000.0,
        "Should sort at least 200k measurements/s, got {:.0}",
        rate
    );
}

#[test]
#[ignore]
fn stress_test_jittered_producers() {
    let published = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&published);

    let config = ConcentratorConfig::new(30, 0.5, 0.5).with_local_clock(true);
    let concentrator = Arc::new(
        Concentrator::new(config, move |frame, index| {
            sink.lock().unwrap().push((frame.timestamp(), index, frame.len()));
            Ok(())
        })
        .unwrap(),
    );
    concentrator.start().unwrap();

    let num_threads = 4;
    let streams_per_thread = 10;
    let run_for = Duration::from_secs(3);

    let handles: Vec<_> = (0..num_threads)
        .map(|thread_id| {
            let concentrator = Arc::clone(&concentrator);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let ids: Vec<_> = (0..streams_per_thread)
                    .map(|i| stream(thread_id, i))
                    .collect();
                let started = Instant::now();
                while started.elapsed() < run_for {
                    // Up to 100 ms of transport delay, occasionally far too late
                    let delay = if rng.gen_ratio(1, 200) {
                        rng.gen_range(600.0..2000.0)
                    } else {
                        rng.gen_range(0.0..100.0)
                    };
                    let ticks = concentrator.local_time() - Ticks::from_milliseconds(delay);
                    let batch: Vec<_> = ids
                        .iter()
                        .map(|id| Measurement::new(id.clone(), rng.gen_range(59.9..60.1), ticks))
                        .collect();
                    concentrator.sort_batch(&batch);
                    thread::sleep(Duration::from_millis(10));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    thread::sleep(Duration::from_secs(1));
    concentrator.stop();

    let published = published.lock().unwrap();
    let stats = concentrator.statistics();

    println!("Published {} frames", published.len());
    println!("{}", stats.report());

    assert!(!published.is_empty());
    for pair in published.windows(2) {
        assert!(
            pair[0].0 < pair[1].0,
            "Frames out of order: {} then {}",
            pair[0].0,
            pair[1].0
        );
    }
    for (timestamp, index, _) in published.iter() {
        assert_eq!(*index, concentrator.frame_index_in_second(*timestamp));
        assert!(*index < 30);
    }

    let in_frames: usize = published.iter().map(|(_, _, len)| len).sum();
    assert_eq!(stats.published_measurements as usize, in_frames);
    assert_eq!(
        stats.received_measurements,
        stats.processed_measurements + stats.discarded_measurements
    );
    assert!(stats.discarded_measurements > 0);
}

#[test]
#[ignore]
fn stress_test_restart_cycles() {
    let config = ConcentratorConfig::new(60, 0.2, 0.2).with_local_clock(true);
    let concentrator = Concentrator::new(config, |_, _| Ok(())).unwrap();
    let id = stream(0, 1);

    let cycles = 50;
    let start = Instant::now();

    for cycle in 0..cycles {
        concentrator.start().unwrap();
        for _ in 0..20 {
            concentrator.sort(Measurement::new(id.clone(), cycle as f64, concentrator.local_time()));
            thread::sleep(Duration::from_millis(1));
        }
        concentrator.stop();
        assert!(!concentrator.is_running());
        assert_eq!(concentrator.queued_frames(), 0);
    }

    let elapsed = start.elapsed();
    println!("{} start/stop cycles in {:?}", cycles, elapsed);

    assert!(
        elapsed < Duration::from_secs(30),
        "Restart cycles should not stall, took {:?}",
        elapsed
    );
}
