//! voltage-binding - Graph binder for VoltageEMS rule expressions
//!
//! Resolves the symbolic names in a parsed expression (model ids, tags,
//! partial twin ids, `this`) against a [`voltage_model::TwinGraph`] around a
//! subject twin, producing a tree the evaluator can run.
//!
//! # Example
//!
//! ```rust
//! use voltage_binding::Binder;
//! use voltage_calc::parse;
//! use voltage_model::{MemoryOntology, RelationKind, Twin, TwinGraph};
//!
//! let mut graph = TwinGraph::new();
//! graph.add_twin(Twin::new("AHU-0001", "dtmi:com:willowinc:AirHandlingUnit;1"));
//! graph.add_twin(Twin::new("SAT-0001", "dtmi:com:willowinc:SupplyAirTemperatureSensor;1"));
//! graph
//!     .add_relation("SAT-0001", RelationKind::IsCapabilityOf, "AHU-0001")
//!     .unwrap();
//! let ontology = MemoryOntology::new();
//!
//! let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();
//! let outcome = binder.bind(&parse("[SupplyAirTemperatureSensor;1] > 30").unwrap());
//! assert!(outcome.success);
//! assert_eq!(outcome.expr.twins()[0].id, "SAT-0001");
//! ```

pub mod binder;
pub mod error;

pub use binder::{BindOutcome, Binder, DEFAULT_MAX_FOLD_COUNT, RESERVED_VARIABLES};
pub use error::{BindError, Result};
