//! Benchmarks for measurement sorting and frame lookup

use std::sync::Arc;
use std::time::Duration;

use concentrator::{
    average_filter, Concentrator, ConcentratorConfig, DownsamplingMethod, Frame, FrameQueue, Identity, LatestMeasurements,
    ManualClock, Measurement, RealTimeEstimate, Ticks,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn base() -> Ticks {
    Ticks::from_seconds(1_700_000_000.0)
}

fn generate_batch(streams: usize, ticks: Ticks) -> Vec<Measurement> {
    (0..streams)
        .map(|i| {
            let id = Identity::new((i % 16) as u32, format!("PMU_{}", i / 16)).unwrap();
            Measurement::new(id, 60.0 + (i as f64 % 10.0) * 0.001, ticks)
        })
        .collect()
}

fn bench_sort_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("sorting");

    let clock = Arc::new(ManualClock::new(base()));
    let config = ConcentratorConfig::new(30, 5.0, 5.0).with_local_clock(true);
    let concentrator = Concentrator::builder(config)
        .clock(clock.clone())
        .build(|_, _| Ok(()))
        .unwrap();

    let batch = generate_batch(1000, base());
    group.throughput(Throughput::Elements(1000));

    group.bench_function("sort_batch_1000", |b| {
        b.iter(|| concentrator.sort_batch(black_box(&batch)))
    });

    let tracking = Concentrator::builder(config.with_latest_measurements(true))
        .clock(clock)
        .build(|_, _| Ok(()))
        .unwrap();

    group.bench_function("sort_batch_1000_tracking_latest", |b| {
        b.iter(|| tracking.sort_batch(black_box(&batch)))
    });

    group.finish();
}

fn bench_frame_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_queue");

    let queue = FrameQueue::new(30, Frame::factory()).unwrap();
    let timestamps: Vec<_> = (0..1000)
        .map(|i| base() + Ticks::from_milliseconds(i as f64 * 7.0))
        .collect();
    for ticks in &timestamps {
        queue.get_frame(*ticks);
    }

    group.throughput(Throughput::Elements(1000));

    group.bench_function("get_existing_frame_1000", |b| {
        b.iter(|| {
            for ticks in &timestamps {
                black_box(queue.get_frame(*ticks));
            }
        })
    });

    group.bench_function("bucket_1000", |b| {
        b.iter(|| {
            for ticks in &timestamps {
                black_box(queue.bucket(*ticks));
            }
        })
    });

    group.finish();
}

fn bench_frame_assign(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame");
    let batch = generate_batch(1000, base());

    group.throughput(Throughput::Elements(1000));

    group.bench_function("assign_1000", |b| {
        b.iter(|| {
            let frame = Frame::new(base());
            for m in &batch {
                black_box(frame.assign(m, Duration::from_millis(10)));
            }
            frame
        })
    });

    // Every stream reported twice per frame
    let filter = average_filter();
    group.bench_function("assign_filtered_2x1000", |b| {
        b.iter(|| {
            let frame = Frame::new(base());
            for m in batch.iter().chain(batch.iter()) {
                black_box(frame.assign_downsampled(
                    m,
                    DownsamplingMethod::Filtered,
                    &filter,
                    Duration::from_millis(10),
                ));
            }
            frame
        })
    });

    group.finish();
}

fn bench_latest_aggregates(c: &mut Criterion) {
    let mut group = c.benchmark_group("latest");

    let clock = Arc::new(ManualClock::new(base()));
    let realtime = Arc::new(RealTimeEstimate::new(clock, 5.0, true));
    let latest = LatestMeasurements::new(realtime, 5.0, 5.0).unwrap();
    let batch = generate_batch(1000, base());
    for m in &batch {
        latest.update(m);
    }

    group.bench_function("average_1000", |b| b.iter(|| black_box(latest.average())));

    group.finish();
}

criterion_group!(
    benches,
    bench_sort_batch,
    bench_frame_queue,
    bench_frame_assign,
    bench_latest_aggregates,
);

criterion_main!(benches);
