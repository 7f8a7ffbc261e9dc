//! Time provider abstraction
//!
//! Rule evaluation never reads the wall clock directly. Replay drives a
//! [`FixedTimeProvider`] forward from telemetry timestamps, the live service
//! uses [`SystemTimeProvider`].

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Time provider trait for the engine's notion of "now"
pub trait TimeProvider: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// System time provider using local clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable time provider for tests and replay
///
/// Holds milliseconds since the Unix epoch so it can be shared behind an
/// `Arc` and advanced without locking.
#[derive(Debug)]
pub struct FixedTimeProvider {
    timestamp_ms: AtomicI64,
}

impl FixedTimeProvider {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            timestamp_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.timestamp_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn advance(&self, delta: TimeDelta) {
        self.timestamp_ms
            .fetch_add(delta.num_milliseconds(), Ordering::Relaxed);
    }
}

impl TimeProvider for FixedTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms.load(Ordering::Relaxed))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_system_time_provider() {
        let provider = SystemTimeProvider;
        let time1 = provider.now();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let time2 = provider.now();

        assert!(time2 >= time1);
    }

    #[test]
    fn test_fixed_time_provider() {
        let start = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let provider = FixedTimeProvider::new(start);

        assert_eq!(provider.now(), start);
        assert_eq!(provider.now(), start); // Always returns same value

        provider.advance(TimeDelta::minutes(5));
        assert_eq!(provider.now(), start + TimeDelta::minutes(5));

        provider.set(start);
        assert_eq!(provider.now(), start);
    }
}
