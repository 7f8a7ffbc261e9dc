//! VoltageEMS Time-Series Storage
//!
//! Bounded, compressed signal history and the telemetry sink rule outputs
//! are written to.
//!
//! # Key Components
//!
//! - **TimeSeriesBuffer**: ordered points with trajectory compression,
//!   retention and closed-interval window statistics
//! - **TimeSeries**: a signal's buffer plus its health flags and timeliness
//! - **MemoryTimeSeriesStore**: signals by id
//! - **SinkWriter**: queues writes from many rule instances into one sink

pub mod buffer;

pub mod error;

pub mod series;

pub mod sink;

pub mod store;

pub mod time;

// Re-exports
pub use buffer::{SignalValue, TimeSeriesBuffer, TimedValue, DEFAULT_COMPRESSION};
pub use error::{Result, RtdbError};
pub use series::{SignalKind, SignalStatus, TimeSeries, ValidRange};
pub use sink::{
    LoggingSink, MemorySink, SinkRecord, SinkWriter, SinkWriterConfig, SinkWriterStats,
    SinkWriterStatsSnapshot, TelemetrySink,
};
pub use store::{MemoryTimeSeriesStore, SharedSeries};
pub use time::{FixedTimeProvider, SystemTimeProvider, TimeProvider};
