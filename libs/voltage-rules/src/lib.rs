//! Voltage Rules - Rule Engine Library
//!
//! Evaluates fault-detection and calculation rules against live telemetry,
//! one actor state per rule instance (a rule applied to one subject twin):
//! - Rule definitions with fields, templates, impact scores and triggers
//! - Binding of rule expressions against the twin graph, cached per graph generation
//! - Per-tick evaluation with readiness diagnostics and hysteresis
//! - Bounded-parallel runner and interval scheduler
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Scheduler  │────▶│    Runner    │────▶│   trigger    │
//! │  (tick)     │     │ (N workers)  │     │ (one tick)   │
//! └─────────────┘     └──────────────┘     └──────────────┘
//!        │                   │                    │
//!        ▼                   ▼                    ▼
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ GraphCache  │◀────│BindingCache  │     │ TimeSeries   │
//! │ (refresh)   │     │(rule, graph) │     │ store / sink │
//! └─────────────┘     └──────────────┘     └──────────────┘
//! ```

pub mod binding;
pub mod definition;
mod error;
pub mod runner;
mod scheduler;
pub mod state;
pub mod template;
pub mod trigger;

// Re-export public API
pub use binding::{
    bind_rule, Binding, BindingCache, BoundExpression, BoundField, BoundRule, BoundTrigger,
    Capability,
};
pub use definition::{
    CumulativeMode, Field, ImpactScore, MacroDefinition, RuleDefinition, RuleInstance, RuleSet,
    Template, TriggerDefinition, MAX_BUFFER_DAYS, RESULT_FIELD,
};
pub use error::{Result, RuleError};
pub use runner::{RuleRunner, RunnerConfig, TickBatchReport, DEFAULT_MAX_WORKERS};
pub use scheduler::{RuleScheduler, SchedulerStatus, DEFAULT_TICK_MS};
pub use state::{ActorSnapshot, ActorState, CommandState, InstanceStatus, OutputPoint};
pub use template::{apply_hysteresis, Decision};
pub use trigger::{trigger, ModelInvoker, TriggerDependencies, ALMOST_ZERO, MAX_DIAGNOSTICS};
