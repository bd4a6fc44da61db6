//! # Measurement concentrator
//!
//! Time-aligns jittered, out-of-order measurement streams into ordered
//! frames, one per sampling interval, and hands each frame to a publisher
//! exactly once after a bounded wait.
//!
//! ## Key Features
//!
//! - **Lock-light ingestion**: every frame has its own insertion guard; the
//!   real-time estimate is a single compare-and-swap scalar
//! - **Lag/lead admission**: late and far-future samples are discarded and
//!   counted, never raised as errors
//! - **Ordered, at-most-once publication**: a dedicated thread publishes
//!   frames in bucket order and never reopens a closed bucket
//! - **Latest-value index**: newest value per stream with tag aggregates
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use concentrator::{Concentrator, ConcentratorConfig, Identity, ManualClock, Measurement, Ticks};
//!
//! let clock = Arc::new(ManualClock::new(Ticks::from_seconds(1_700_000_000.0)));
//! let config = ConcentratorConfig::new(30, 1.0, 0.5).with_local_clock(true);
//! let concentrator = Concentrator::builder(config)
//!     .clock(clock.clone())
//!     .build(|frame, index| {
//!         println!("#{} {} -> {} values", index, frame.timestamp(), frame.len());
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! concentrator.start().unwrap();
//! let id: Identity = "PMU_A:1".parse().unwrap();
//! concentrator.sort(Measurement::new(id, 59.99, concentrator.real_time()));
//! assert_eq!(concentrator.statistics().processed_measurements, 1);
//! concentrator.stop();
//! ```
//!
//! ## Modules
//!
//! - [`ticks`]: 100 ns timestamps and bucket arithmetic helpers
//! - [`clock`]: injected local clocks
//! - [`realtime`]: the shared real-time estimate
//! - [`identity`], [`measurement`]: value types
//! - [`frame`], [`frame_queue`]: time buckets and their ordered queue
//! - [`downsampling`]: choosing among several values for one stream in one frame
//! - [`latest`]: latest-value index
//! - [`concentrator`]: ingestion and publication
//! - [`stats`], [`health`], [`events`]: observability

// Modules
pub mod clock;
pub mod concentrator;
pub mod config;
pub mod downsampling;
pub mod error;
pub mod events;
pub mod frame;
pub mod frame_queue;
pub mod health;
pub mod identity;
pub mod latest;
pub mod measurement;
pub mod realtime;
pub mod stats;
pub mod ticks;

// Re-exports for convenient access
pub use clock::{Clock, ManualClock, SystemClock};
pub use concentrator::{Concentrator, ConcentratorBuilder, PublishFn};
pub use config::ConcentratorConfig;
pub use downsampling::{average_filter, DownsamplingMethod, ValueFilter};
pub use error::{BoxError, ConcentratorError, ConfigError, Result};
pub use events::{ChannelObserver, ConcentratorEvent, ConcentratorObserver};
pub use frame::{AssignFn, Assignment, Frame, FrameFactory};
pub use frame_queue::FrameQueue;
pub use health::{HealthCheck, HealthCheckable, HealthConfig, HealthMonitor, HealthStatus};
pub use identity::Identity;
pub use latest::LatestMeasurements;
pub use measurement::{Measurement, TemporalMeasurement};
pub use realtime::RealTimeEstimate;
pub use stats::{Statistics, StatsSnapshot};
pub use ticks::Ticks;
