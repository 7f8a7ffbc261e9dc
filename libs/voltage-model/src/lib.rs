//! Voltage Model Library
//!
//! The twin graph rules are bound against: twins and typed relations, an
//! arena graph with breadth-first distance search, the model ontology and
//! the cache the graph is served from.
//!
//! # Modules
//!
//! - `twin`: twins, relation kinds and relations
//! - `graph`: arena graph, direct relations, distance groups
//! - `ontology`: model inheritance and capability types
//! - `service`: neighbourhood extraction for binders
//! - `cache`: atomically swapped graph snapshot with a generation counter
//!
//! # Example
//!
//! ```
//! use voltage_model::{Twin, TwinGraph};
//!
//! let mut graph = TwinGraph::new();
//! graph.add_twin(Twin::new("ahu-1", "dtmi:com:willowinc:AirHandlingUnit;1"));
//! graph.add_twin(Twin::new("sat-1", "dtmi:com:willowinc:SupplyAirTemperatureSensor;1"));
//! graph.add_relation("sat-1", "isCapabilityOf", "ahu-1").unwrap();
//!
//! let ahu = graph.index_of("ahu-1").unwrap();
//! assert_eq!(graph.direct_relations(ahu).len(), 1);
//! ```

pub mod cache;
pub mod error;
pub mod graph;
pub mod model_id;
pub mod ontology;
pub mod service;
pub mod twin;

// Re-exports for convenience
pub use cache::GraphCache;
pub use error::{ModelError, Result};
pub use graph::{Edge, GraphDocument, NodeIndex, TwinGraph};
pub use model_id::{is_model_id, normalize_model_id, DEFAULT_MODEL_NAMESPACE};
pub use ontology::{MemoryOntology, ModelDefinition, ModelOntology, OntologyDocument};
pub use service::{MemoryTwinGraphService, TwinGraphService, DEFAULT_GRAPH_HOPS};
pub use twin::{Relation, RelationKind, Twin};
