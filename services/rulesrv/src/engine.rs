//! Engine assembly
//!
//! Wires the loaded inputs into a store, a serialized sink writer and a
//! rule runner.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voltage_model::GraphCache;
use voltage_rtdb::{MemoryTimeSeriesStore, SinkWriter, SinkWriterConfig, TelemetrySink};
use voltage_rules::RuleRunner;

use crate::config::RulesrvConfig;
use crate::loader::{register_signals, Inputs};

pub struct Engine {
    pub runner: Arc<RuleRunner>,
    pub store: Arc<MemoryTimeSeriesStore>,
    sink: SinkWriter,
    sink_shutdown: Arc<Notify>,
    sink_handle: JoinHandle<()>,
}

impl Engine {
    /// Build the engine, must run inside a Tokio runtime
    pub fn build(config: &RulesrvConfig, inputs: Inputs, sink: Arc<dyn TelemetrySink>) -> Result<Self> {
        let store = Arc::new(MemoryTimeSeriesStore::new());
        register_signals(&inputs.graph, &store);

        let sink_config = SinkWriterConfig::default().with_timeout_ms(config.engine.sink_timeout_ms);
        let sink_shutdown = Arc::new(Notify::new());
        let (writer, sink_handle) = SinkWriter::spawn(sink, sink_config, Arc::clone(&sink_shutdown));

        let runner = RuleRunner::new(
            config.runner_config(),
            Arc::new(GraphCache::new(inputs.graph)),
            Arc::new(inputs.ontology),
            Arc::clone(&store),
        )
        .with_sink(writer.clone());
        let count = runner.load(inputs.rules).context("Invalid rule set")?;
        info!(instances = count, "Rule engine ready");

        Ok(Self {
            runner: Arc::new(runner),
            store,
            sink: writer,
            sink_shutdown,
            sink_handle,
        })
    }

    pub fn sink(&self) -> &SinkWriter {
        &self.sink
    }

    /// Drain the sink queue and stop its consumer
    pub async fn shutdown(self) {
        self.sink_shutdown.notify_one();
        if let Err(e) = self.sink_handle.await {
            warn!("Sink writer task failed: {}", e);
        }
        let stats = self.sink.stats().snapshot();
        debug!(
            written = stats.written,
            timed_out = stats.timed_out,
            failed = stats.failed,
            dropped = stats.dropped,
            "Sink writer stopped"
        );
    }
}
