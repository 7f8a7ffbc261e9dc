//! Model ontology
//!
//! Models form a multiple-inheritance hierarchy. Capability types are the
//! models that carry telemetry (sensors, setpoints, actuators); any model
//! inheriting from a capability root is a capability.

use crate::error::Result;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

pub trait ModelOntology: Send + Sync {
    /// Strict inheritance, a model does not inherit from itself
    fn inherits_from(&self, model: &str, ancestor: &str) -> bool;

    fn inherits_from_or_equal(&self, model: &str, ancestor: &str) -> bool {
        model == ancestor || self.inherits_from(model, ancestor)
    }

    fn is_capability_type(&self, model: &str) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub id: String,
    #[serde(default)]
    pub extends: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OntologyDocument {
    pub models: Vec<ModelDefinition>,
    #[serde(default)]
    pub capability_roots: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryOntology {
    parents: FxHashMap<String, Vec<String>>,
    capability_roots: FxHashSet<String>,
}

impl MemoryOntology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(document: OntologyDocument) -> Self {
        let mut ontology = Self::new();
        for model in document.models {
            ontology.add_model(model.id, model.extends);
        }
        for root in document.capability_roots {
            ontology.add_capability_root(root);
        }
        ontology
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(Self::from_document(serde_json::from_str(json)?))
    }

    pub fn add_model<I, S>(&mut self, id: impl Into<String>, extends: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parents
            .entry(id.into())
            .or_default()
            .extend(extends.into_iter().map(Into::into));
    }

    pub fn add_capability_root(&mut self, model: impl Into<String>) {
        self.capability_roots.insert(model.into());
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// All transitive ancestors of `model`
    pub fn ancestors(&self, model: &str) -> FxHashSet<&str> {
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        let mut stack: Vec<&str> = self
            .parents
            .get(model)
            .map(|p| p.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if !seen.insert(next) {
                continue;
            }
            if let Some(parents) = self.parents.get(next) {
                stack.extend(parents.iter().map(String::as_str));
            }
        }
        seen
    }
}

impl ModelOntology for MemoryOntology {
    fn inherits_from(&self, model: &str, ancestor: &str) -> bool {
        model != ancestor && self.ancestors(model).contains(ancestor)
    }

    fn is_capability_type(&self, model: &str) -> bool {
        self.capability_roots.contains(model)
            || self
                .ancestors(model)
                .iter()
                .any(|a| self.capability_roots.contains(*a))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn sample() -> MemoryOntology {
        MemoryOntology::from_json(
            r#"{
                "models": [
                    {"id": "Capability;1"},
                    {"id": "Sensor;1", "extends": ["Capability;1"]},
                    {"id": "TemperatureSensor;1", "extends": ["Sensor;1"]},
                    {"id": "AirTemperatureSensor;1", "extends": ["TemperatureSensor;1"]},
                    {"id": "ZoneAirTemperatureSensor;1", "extends": ["AirTemperatureSensor;1"]},
                    {"id": "Equipment;1"},
                    {"id": "AirHandlingUnit;1", "extends": ["Equipment;1"]}
                ],
                "capability_roots": ["Capability;1"]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_transitive_inheritance() {
        let ontology = sample();
        assert!(ontology.inherits_from("ZoneAirTemperatureSensor;1", "TemperatureSensor;1"));
        assert!(!ontology.inherits_from("TemperatureSensor;1", "ZoneAirTemperatureSensor;1"));
        assert!(!ontology.inherits_from("Sensor;1", "Sensor;1"));
        assert!(ontology.inherits_from_or_equal("Sensor;1", "Sensor;1"));
    }

    #[test]
    fn test_capability_types() {
        let ontology = sample();
        assert!(ontology.is_capability_type("ZoneAirTemperatureSensor;1"));
        assert!(ontology.is_capability_type("Capability;1"));
        assert!(!ontology.is_capability_type("AirHandlingUnit;1"));
        assert!(!ontology.is_capability_type("Unknown;1"));
    }

    #[test]
    fn test_cyclic_definitions_terminate() {
        let mut ontology = MemoryOntology::new();
        ontology.add_model("A;1", ["B;1"]);
        ontology.add_model("B;1", ["A;1"]);
        assert!(ontology.inherits_from("A;1", "B;1"));
        assert!(!ontology.inherits_from("A;1", "C;1"));
    }
}
