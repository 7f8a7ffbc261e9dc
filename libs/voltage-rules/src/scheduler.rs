//! Rule Scheduler - Periodic rule execution scheduler
//!
//! Drives the [`RuleRunner`] on a fixed tick and, when a graph service is
//! configured, refreshes the twin graph on its own interval. A graph refresh
//! bumps the graph generation, which invalidates every cached binding.
//!
//! Time comes from a [`TimeProvider`] so replays and tests can drive the
//! scheduler with simulated time.

use crate::runner::{RuleRunner, TickBatchReport};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use voltage_model::TwinGraphService;
use voltage_rtdb::TimeProvider;

/// Default scheduler tick interval (1 minute)
pub const DEFAULT_TICK_MS: u64 = 60_000;

/// Rule Scheduler - ticks every rule instance periodically
pub struct RuleScheduler {
    runner: Arc<RuleRunner>,
    time: Arc<dyn TimeProvider>,
    /// Source of graph refreshes, none keeps the loaded graph
    graph_service: Option<Arc<dyn TwinGraphService>>,
    graph_refresh: Duration,
    /// Shutdown signal
    shutdown: Arc<Notify>,
    /// Stops instances that have not started yet
    cancel: CancellationToken,
    /// Running state
    running: Arc<AtomicBool>,
    /// Scheduler tick interval in milliseconds
    tick_ms: u64,
    ticks: AtomicU64,
    last_report: Mutex<Option<TickBatchReport>>,
}

impl RuleScheduler {
    pub fn new(runner: Arc<RuleRunner>, time: Arc<dyn TimeProvider>, tick_ms: u64) -> Self {
        Self {
            runner,
            time,
            graph_service: None,
            graph_refresh: Duration::from_secs(3600),
            shutdown: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
            tick_ms: tick_ms.max(1),
            ticks: AtomicU64::new(0),
            last_report: Mutex::new(None),
        }
    }

    /// Refresh the twin graph from `service` every `every`
    pub fn with_graph_refresh(mut self, service: Arc<dyn TwinGraphService>, every: Duration) -> Self {
        self.graph_service = Some(service);
        self.graph_refresh = every.max(Duration::from_millis(1));
        self
    }

    pub fn runner(&self) -> &Arc<RuleRunner> {
        &self.runner
    }

    /// Token cancelled by [`stop`](Self::stop)
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the scheduler loop, returns after [`stop`](Self::stop)
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("Scheduler already running");
            return;
        }
        info!("Starting rule scheduler with {}ms tick", self.tick_ms);

        let mut tick_interval = interval(Duration::from_millis(self.tick_ms));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut refresh_interval =
            interval_at(Instant::now() + self.graph_refresh, self.graph_refresh);
        refresh_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    self.tick().await;
                }
                _ = refresh_interval.tick(), if self.graph_service.is_some() => {
                    self.refresh_graph().await;
                }
                _ = self.shutdown.notified() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::Relaxed);
        info!("Rule scheduler stopped");
    }

    /// Stop the scheduler
    ///
    /// Instances not yet started in the current tick are abandoned; running
    /// ones finish.
    pub fn stop(&self) {
        info!("Stopping rule scheduler...");
        self.cancel.cancel();
        self.shutdown.notify_one();
    }

    /// Check if scheduler is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Single scheduler tick over every instance
    pub async fn tick(&self) -> TickBatchReport {
        let now = self.time.now();
        let report = self.runner.tick(now, &self.cancel).await;
        let count = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if report.excluded > 0 || report.cancelled > 0 {
            info!(
                tick = count,
                evaluated = report.evaluated,
                excluded = report.excluded,
                cancelled = report.cancelled,
                "Tick finished with skipped instances"
            );
        } else {
            debug!(tick = count, evaluated = report.evaluated, "Tick finished");
        }
        *self.last_report.lock() = Some(report);
        report
    }

    /// Reload the graph around every instance's twin
    pub async fn refresh_graph(&self) {
        let Some(service) = &self.graph_service else {
            return;
        };
        let mut seeds: Vec<String> = self
            .runner
            .instances()
            .into_iter()
            .map(|i| i.twin_id)
            .collect();
        seeds.sort();
        seeds.dedup();

        match self.runner.graph().refresh(service.as_ref(), &seeds).await {
            Ok(generation) => debug!(generation, seeds = seeds.len(), "Bindings invalidated by graph refresh"),
            Err(e) => error!("Twin graph refresh failed: {}", e),
        }
    }

    /// Get scheduler status
    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.is_running(),
            total_rules: self.runner.rules().len(),
            total_instances: self.runner.instances().len(),
            excluded_instances: self.runner.cache().failures().len(),
            tick_interval_ms: self.tick_ms,
            ticks: self.ticks.load(Ordering::Relaxed),
            last_report: *self.last_report.lock(),
        }
    }
}

/// Scheduler status information
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub total_rules: usize,
    pub total_instances: usize,
    pub excluded_instances: usize,
    pub tick_interval_ms: u64,
    pub ticks: u64,
    pub last_report: Option<TickBatchReport>,
}
