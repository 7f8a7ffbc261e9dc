//! Rule runner
//!
//! Ticks every rule instance with bounded parallelism. Each instance's actor
//! state sits behind its own async mutex, so one instance is never evaluated
//! twice at once while different instances run side by side. Cancellation
//! stops new instances from starting; ticks already running finish.

use crate::binding::{Binding, BindingCache};
use crate::definition::{RuleDefinition, RuleInstance, RuleSet};
use crate::error::Result;
use crate::state::{ActorSnapshot, ActorState};
use crate::trigger::{trigger, ModelInvoker, TriggerDependencies};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use voltage_binding::DEFAULT_MAX_FOLD_COUNT;
use voltage_calc::Env;
use voltage_model::{GraphCache, ModelOntology};
use voltage_rtdb::{MemoryTimeSeriesStore, SinkWriter};

/// Default number of instances evaluated concurrently
pub const DEFAULT_MAX_WORKERS: usize = 10;

/// Default age after which an input counts as missing
pub const DEFAULT_MAX_STALENESS_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunnerConfig {
    pub max_workers: usize,
    pub max_staleness: TimeDelta,
    pub max_fold_count: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            max_staleness: TimeDelta::minutes(DEFAULT_MAX_STALENESS_MINUTES),
            max_fold_count: DEFAULT_MAX_FOLD_COUNT,
        }
    }
}

/// Counts from one tick over all instances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickBatchReport {
    pub evaluated: usize,
    /// Disabled rules or instances whose rule is gone
    pub skipped: usize,
    /// Instances that failed to bind
    pub excluded: usize,
    /// Not started because of cancellation
    pub cancelled: usize,
}

impl TickBatchReport {
    pub fn total(&self) -> usize {
        self.evaluated + self.skipped + self.excluded + self.cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Evaluated,
    Skipped,
    Excluded,
    Cancelled,
}

type StateSlot = Arc<Mutex<Option<ActorState>>>;

pub struct RuleRunner {
    config: RunnerConfig,
    graph: Arc<GraphCache>,
    ontology: Arc<dyn ModelOntology>,
    store: Arc<MemoryTimeSeriesStore>,
    sink: Option<SinkWriter>,
    models: Option<Arc<dyn ModelInvoker>>,
    rules: RwLock<FxHashMap<String, Arc<RuleDefinition>>>,
    instances: RwLock<Vec<RuleInstance>>,
    states: DashMap<String, StateSlot>,
    cache: BindingCache,
}

impl RuleRunner {
    pub fn new(
        config: RunnerConfig,
        graph: Arc<GraphCache>,
        ontology: Arc<dyn ModelOntology>,
        store: Arc<MemoryTimeSeriesStore>,
    ) -> Self {
        Self {
            cache: BindingCache::new(config.max_fold_count),
            config,
            graph,
            ontology,
            store,
            sink: None,
            models: None,
            rules: RwLock::new(FxHashMap::default()),
            instances: RwLock::new(Vec::new()),
            states: DashMap::new(),
        }
    }

    pub fn with_sink(mut self, sink: SinkWriter) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_models(mut self, models: Arc<dyn ModelInvoker>) -> Self {
        self.models = Some(models);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<GraphCache> {
        &self.graph
    }

    pub fn store(&self) -> &Arc<MemoryTimeSeriesStore> {
        &self.store
    }

    pub fn cache(&self) -> &BindingCache {
        &self.cache
    }

    // ========================================================================
    // Rules
    // ========================================================================

    /// Replace all rules and instances
    ///
    /// State of instances that are no longer listed is dropped.
    pub fn load(&self, set: RuleSet) -> Result<usize> {
        set.validate()?;
        let rules: FxHashMap<String, Arc<RuleDefinition>> = set
            .rules
            .into_iter()
            .map(|rule| (rule.id.clone(), Arc::new(rule)))
            .collect();

        let keep: FxHashSet<&str> =
            set.instances.iter().map(|i| i.id.as_str()).collect();
        let removed: Vec<String> = self
            .states
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| !keep.contains(id.as_str()))
            .collect();
        for id in &removed {
            self.states.remove(id);
            self.cache.invalidate(id);
        }

        let count = set.instances.len();
        info!(rules = rules.len(), instances = count, "Rules loaded");
        *self.rules.write() = rules;
        *self.instances.write() = set.instances;
        Ok(count)
    }

    /// Add or replace one rule
    pub fn upsert_rule(&self, rule: RuleDefinition) -> Result<()> {
        rule.validate()?;
        self.rules.write().insert(rule.id.clone(), Arc::new(rule));
        Ok(())
    }

    /// Add an instance unless one with the same id exists
    pub fn add_instance(&self, instance: RuleInstance) -> bool {
        let mut instances = self.instances.write();
        if instances.iter().any(|i| i.id == instance.id) {
            return false;
        }
        instances.push(instance);
        true
    }

    pub fn rules(&self) -> Vec<Arc<RuleDefinition>> {
        let mut rules: Vec<_> = self.rules.read().values().cloned().collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    pub fn instances(&self) -> Vec<RuleInstance> {
        self.instances.read().clone()
    }

    fn rule(&self, id: &str) -> Option<Arc<RuleDefinition>> {
        self.rules.read().get(id).cloned()
    }

    /// Bind every instance now, returning each outcome
    pub fn check(&self) -> Vec<(RuleInstance, Binding)> {
        self.instances()
            .into_iter()
            .map(|instance| {
                let binding = match self.rule(&instance.rule_id) {
                    Some(rule) => self.cache.get_or_bind(
                        &rule,
                        &instance,
                        &self.graph,
                        self.ontology.as_ref(),
                    ),
                    None => Binding::Excluded(format!("Rule not found: {}", instance.rule_id)),
                };
                (instance, binding)
            })
            .collect()
    }

    // ========================================================================
    // State
    // ========================================================================

    pub async fn state(&self, instance_id: &str) -> Option<ActorSnapshot> {
        self.with_state(instance_id, ActorState::snapshot).await
    }

    /// Run `f` against an instance's state, `None` before its first tick
    pub async fn with_state<R>(&self, instance_id: &str, f: impl FnOnce(&ActorState) -> R) -> Option<R> {
        let slot = self.states.get(instance_id).map(|s| Arc::clone(s.value()))?;
        let guard = slot.lock().await;
        guard.as_ref().map(f)
    }

    /// Snapshots of every instance that has ticked, by instance id
    pub async fn snapshots(&self) -> Vec<ActorSnapshot> {
        let slots: Vec<StateSlot> = self.states.iter().map(|s| Arc::clone(s.value())).collect();
        let mut snapshots = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(state) = slot.lock().await.as_ref() {
                snapshots.push(state.snapshot());
            }
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    // ========================================================================
    // Ticks
    // ========================================================================

    /// Tick every instance at `now`
    pub async fn tick(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> TickBatchReport {
        let instances = self.instances();
        let outcomes: Vec<TickOutcome> = stream::iter(instances)
            .map(|instance| self.tick_instance(instance, now, cancel))
            .buffer_unordered(self.config.max_workers.max(1))
            .collect()
            .await;

        let mut report = TickBatchReport::default();
        for outcome in outcomes {
            match outcome {
                TickOutcome::Evaluated => report.evaluated += 1,
                TickOutcome::Skipped => report.skipped += 1,
                TickOutcome::Excluded => report.excluded += 1,
                TickOutcome::Cancelled => report.cancelled += 1,
            }
        }
        debug!(
            evaluated = report.evaluated,
            skipped = report.skipped,
            excluded = report.excluded,
            cancelled = report.cancelled,
            "Tick complete"
        );
        report
    }

    async fn tick_instance(
        &self,
        instance: RuleInstance,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> TickOutcome {
        if cancel.is_cancelled() {
            return TickOutcome::Cancelled;
        }
        let Some(rule) = self.rule(&instance.rule_id) else {
            debug!(instance_id = %instance.id, rule_id = %instance.rule_id, "Rule not found, skipping");
            return TickOutcome::Skipped;
        };
        if !rule.enabled {
            return TickOutcome::Skipped;
        }

        let bound = match self
            .cache
            .get_or_bind(&rule, &instance, &self.graph, self.ontology.as_ref())
        {
            Binding::Bound(bound) => bound,
            Binding::Excluded(_) => return TickOutcome::Excluded,
        };
        bound.extend_retention(&self.store);

        let slot = Arc::clone(
            self.states
                .entry(instance.id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .value(),
        );
        let mut guard = slot.lock().await;

        let state = match guard.take() {
            Some(state) if state.version == rule.version => state,
            Some(_) => {
                info!(instance_id = %instance.id, version = rule.version, "Rule changed, resetting state");
                ActorState::new(&instance, now, rule.version).with_output_retention(bound.retention)
            },
            None => ActorState::new(&instance, now, rule.version).with_output_retention(bound.retention),
        };

        let deps = TriggerDependencies {
            store: &self.store,
            sink: self.sink.as_ref(),
            models: self.models.as_deref(),
            max_staleness: self.config.max_staleness,
        };
        let next = trigger(now, Env::new(), &bound, state, &deps).await;
        *guard = Some(next);
        TickOutcome::Evaluated
    }
}
