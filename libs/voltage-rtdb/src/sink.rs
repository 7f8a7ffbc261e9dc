//! Telemetry sink and serialized sink writer
//!
//! Rule instances run in parallel but the downstream sink sees one write at
//! a time: every write is queued into a single consumer task. Callers wait
//! for the outcome with a short timeout and treat a timeout as a skipped
//! write rather than a failure.
//!
//! # Usage
//! ```ignore
//! let shutdown = Arc::new(Notify::new());
//! let (writer, handle) = SinkWriter::spawn(Arc::new(LoggingSink), SinkWriterConfig::default(), shutdown.clone());
//!
//! writer.write_with_timeout(record).await?;
//!
//! shutdown.notify_one();
//! handle.await?;
//! ```

use crate::error::{Result, RtdbError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

/// One value written to the telemetry sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRecord {
    pub signal_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// Source metadata such as rule id and rule instance id
    #[serde(default)]
    pub source: BTreeMap<String, String>,
}

impl SinkRecord {
    pub fn new(signal_id: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            signal_id: signal_id.into(),
            timestamp,
            value,
            source: BTreeMap::new(),
        }
    }

    pub fn with_source(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.source.insert(key.into(), value.into());
        self
    }
}

/// Downstream telemetry writer
#[async_trait]
pub trait TelemetrySink: Send + Sync + 'static {
    async fn write(&self, record: SinkRecord) -> Result<()>;
}

/// Sink that logs every record, used by the service when no store is wired
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

#[async_trait]
impl TelemetrySink for LoggingSink {
    async fn write(&self, record: SinkRecord) -> Result<()> {
        tracing::info!(
            signal_id = %record.signal_id,
            timestamp = %record.timestamp,
            value = record.value,
            "Telemetry emitted"
        );
        Ok(())
    }
}

/// Sink that keeps records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<SinkRecord>>,
    delay: Option<Duration>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every write, for exercising timeouts
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            delay: Some(delay),
        }
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn write(&self, record: SinkRecord) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.records.lock().push(record);
        Ok(())
    }
}

// ============================================================================
// Serialized writer
// ============================================================================

/// Sink writer configuration
#[derive(Clone, Debug)]
pub struct SinkWriterConfig {
    /// Queue capacity (default: 1024)
    pub queue_capacity: usize,
    /// Per write timeout in milliseconds (default: 100ms)
    pub write_timeout_ms: u64,
}

impl Default for SinkWriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            write_timeout_ms: 100,
        }
    }
}

impl SinkWriterConfig {
    pub fn low_latency() -> Self {
        Self {
            queue_capacity: 256,
            write_timeout_ms: 50,
        }
    }

    pub fn high_throughput() -> Self {
        Self {
            queue_capacity: 8192,
            write_timeout_ms: 500,
        }
    }

    pub fn with_timeout_ms(mut self, write_timeout_ms: u64) -> Self {
        self.write_timeout_ms = write_timeout_ms;
        self
    }
}

/// Statistics for monitoring sink writes
#[derive(Debug, Default)]
pub struct SinkWriterStats {
    /// Writes accepted by the sink
    pub written: AtomicU64,
    /// Writes the caller gave up waiting for
    pub timed_out: AtomicU64,
    /// Writes the sink rejected
    pub failed: AtomicU64,
    /// Fire and forget writes dropped on a full queue
    pub dropped: AtomicU64,
}

impl SinkWriterStats {
    pub fn snapshot(&self) -> SinkWriterStatsSnapshot {
        SinkWriterStatsSnapshot {
            written: self.written.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkWriterStatsSnapshot {
    pub written: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub dropped: u64,
}

struct WriteRequest {
    record: SinkRecord,
    ack: Option<oneshot::Sender<Result<()>>>,
}

/// Cloneable handle queueing writes into a single consumer task
#[derive(Clone)]
pub struct SinkWriter {
    tx: mpsc::Sender<WriteRequest>,
    config: SinkWriterConfig,
    stats: Arc<SinkWriterStats>,
}

impl SinkWriter {
    /// Start the consumer task, it stops on `shutdown` after draining the queue
    pub fn spawn(
        sink: Arc<dyn TelemetrySink>,
        config: SinkWriterConfig,
        shutdown: Arc<Notify>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(SinkWriterStats::default());
        let handle = tokio::spawn(run_consumer(sink, rx, Arc::clone(&stats), shutdown));
        (Self { tx, config, stats }, handle)
    }

    pub fn config(&self) -> &SinkWriterConfig {
        &self.config
    }

    pub fn stats(&self) -> &SinkWriterStats {
        &self.stats
    }

    /// Queue a write and wait for the sink, bounded by the configured timeout
    pub async fn write_with_timeout(&self, record: SinkRecord) -> Result<()> {
        let timeout_ms = self.config.write_timeout_ms;
        let (ack_tx, ack_rx) = oneshot::channel();
        let request = WriteRequest {
            record,
            ack: Some(ack_tx),
        };

        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), async {
            self.tx
                .send(request)
                .await
                .map_err(|_| RtdbError::SinkClosed)?;
            ack_rx.await.map_err(|_| RtdbError::SinkClosed)?
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                Err(RtdbError::SinkTimeout(timeout_ms))
            },
        }
    }

    /// Queue a write without waiting, dropped when the queue is full
    pub fn enqueue(&self, record: SinkRecord) -> Result<()> {
        match self.tx.try_send(WriteRequest { record, ack: None }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(RtdbError::SinkRejected("queue full".to_string()))
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RtdbError::SinkClosed),
        }
    }
}

async fn run_consumer(
    sink: Arc<dyn TelemetrySink>,
    mut rx: mpsc::Receiver<WriteRequest>,
    stats: Arc<SinkWriterStats>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            biased;  // Check shutdown first

            _ = shutdown.notified() => {
                tracing::debug!("SinkWriter received shutdown signal");
                rx.close();
                while let Some(request) = rx.recv().await {
                    process(sink.as_ref(), request, &stats).await;
                }
                break;
            }
            request = rx.recv() => match request {
                Some(request) => process(sink.as_ref(), request, &stats).await,
                None => break,
            },
        }
    }

    tracing::debug!("SinkWriter stopped");
}

async fn process(sink: &dyn TelemetrySink, request: WriteRequest, stats: &SinkWriterStats) {
    let signal_id = request.record.signal_id.clone();
    let result = sink.write(request.record).await;
    match &result {
        Ok(()) => {
            stats.written.fetch_add(1, Ordering::Relaxed);
        },
        Err(e) => {
            tracing::warn!(signal_id = %signal_id, error = %e, "Telemetry sink write failed");
            stats.failed.fetch_add(1, Ordering::Relaxed);
        },
    }
    if let Some(ack) = request.ack {
        // The caller may have timed out already
        let _ = ack.send(result);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn record(id: &str, value: f64) -> SinkRecord {
        SinkRecord::new(id, DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(), value)
    }

    #[test]
    fn test_config_presets() {
        let config = SinkWriterConfig::default();
        assert_eq!(config.write_timeout_ms, 100);
        assert_eq!(SinkWriterConfig::low_latency().write_timeout_ms, 50);
        assert_eq!(SinkWriterConfig::high_throughput().queue_capacity, 8192);
    }

    #[tokio::test]
    async fn test_write_reaches_sink() {
        let sink = Arc::new(MemorySink::new());
        let shutdown = Arc::new(Notify::new());
        let (writer, handle) =
            SinkWriter::spawn(sink.clone(), SinkWriterConfig::default(), shutdown.clone());

        writer
            .write_with_timeout(record("r1_cost", 12.5).with_source("rule_id", "r1"))
            .await
            .unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source.get("rule_id").map(String::as_str), Some("r1"));
        assert_eq!(writer.stats().snapshot().written, 1);

        shutdown.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_sink_times_out() {
        let sink = Arc::new(MemorySink::with_delay(Duration::from_millis(200)));
        let shutdown = Arc::new(Notify::new());
        let (writer, handle) = SinkWriter::spawn(
            sink.clone(),
            SinkWriterConfig::default().with_timeout_ms(20),
            shutdown.clone(),
        );

        let err = writer.write_with_timeout(record("r1_cost", 1.0)).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(writer.stats().snapshot().timed_out, 1);

        shutdown.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let sink = Arc::new(MemorySink::new());
        let shutdown = Arc::new(Notify::new());
        let (writer, handle) =
            SinkWriter::spawn(sink.clone(), SinkWriterConfig::default(), shutdown.clone());

        for i in 0..5 {
            writer.enqueue(record("r1_cost", i as f64)).unwrap();
        }
        shutdown.notify_one();
        handle.await.unwrap();

        assert_eq!(sink.len(), 5);
        assert!(matches!(
            writer.enqueue(record("r1_cost", 9.0)),
            Err(RtdbError::SinkClosed)
        ));
    }
}
