//! Rule service for VoltageEMS
//!
//! Loads a twin graph, an ontology and a rule set, then evaluates every rule
//! instance on a fixed tick. Telemetry can be replayed from CSV.

pub mod config;
pub mod engine;
pub mod loader;
pub mod replay;

pub use config::RulesrvConfig;
pub use engine::Engine;
pub use loader::{FileGraphService, Inputs};
