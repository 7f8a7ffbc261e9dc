//! Input document loading
//!
//! Graph, ontology and rules come from JSON or YAML files, picked by
//! extension. Signal metadata carried by the twins (unit, valid range,
//! reporting interval) seeds the time-series store before any telemetry.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::TimeDelta;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use voltage_model::{
    GraphDocument, MemoryOntology, ModelError, OntologyDocument, TwinGraph, TwinGraphService,
    DEFAULT_GRAPH_HOPS,
};
use voltage_rtdb::{MemoryTimeSeriesStore, TimeSeries, ValidRange};
use voltage_rules::RuleSet;

use crate::config::DataConfig;

/// Everything the engine needs besides telemetry
#[derive(Debug)]
pub struct Inputs {
    pub graph: TwinGraph,
    pub ontology: MemoryOntology,
    pub rules: RuleSet,
}

impl Inputs {
    pub fn load(data: &DataConfig) -> Result<Self> {
        let graph = load_graph(&data.graph)?;
        let ontology = match &data.ontology {
            Some(path) => load_ontology(path)?,
            None => MemoryOntology::new(),
        };
        let rules = RuleSet::load(&data.rules)
            .with_context(|| format!("Failed to load rules from {}", data.rules.display()))?;

        info!(
            twins = graph.len(),
            relations = graph.edge_count(),
            models = ontology.len(),
            rules = rules.rules.len(),
            instances = rules.instances.len(),
            "Inputs loaded"
        );
        Ok(Self {
            graph,
            ontology,
            rules,
        })
    }
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text)
            .with_context(|| format!("Invalid JSON in {}", path.display())),
        Some("yaml") | Some("yml") => serde_yaml::from_str(&text)
            .with_context(|| format!("Invalid YAML in {}", path.display())),
        other => bail!("Unsupported file extension {:?} for {}", other, path.display()),
    }
}

pub fn load_graph(path: &Path) -> Result<TwinGraph> {
    let document: GraphDocument = read_document(path)?;
    TwinGraph::from_document(document)
        .with_context(|| format!("Invalid twin graph in {}", path.display()))
}

pub fn load_ontology(path: &Path) -> Result<MemoryOntology> {
    let document: OntologyDocument = read_document(path)?;
    Ok(MemoryOntology::from_document(document))
}

/// Re-reads the graph file on every refresh
#[derive(Debug, Clone)]
pub struct FileGraphService {
    path: PathBuf,
}

impl FileGraphService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TwinGraphService for FileGraphService {
    async fn graph_around(&self, twin_ids: &[String]) -> voltage_model::Result<TwinGraph> {
        let path = self.path.clone();
        let graph = tokio::task::spawn_blocking(move || load_graph(&path))
            .await
            .map_err(|e| ModelError::graph_service(e.to_string()))?
            .map_err(|e| ModelError::graph_service(format!("{:#}", e)))?;
        if twin_ids.is_empty() {
            return Ok(graph);
        }

        let seeds: Vec<&str> = twin_ids
            .iter()
            .map(String::as_str)
            .filter(|id| graph.contains(id))
            .collect();
        if seeds.len() < twin_ids.len() {
            warn!(
                missing = twin_ids.len() - seeds.len(),
                "Rule subjects missing from the refreshed graph"
            );
        }
        Ok(graph.neighborhood(&seeds, DEFAULT_GRAPH_HOPS))
    }
}

/// Register a series for every twin that declares signal metadata
///
/// Returns the number of series created.
pub fn register_signals(graph: &TwinGraph, store: &MemoryTimeSeriesStore) -> usize {
    let mut registered = 0;
    for (_, twin) in graph.twins() {
        let declares_signal = twin.has_signal()
            || twin.valid_range.is_some()
            || twin.trend_interval_secs.is_some();
        if !declares_signal {
            continue;
        }

        let mut series = TimeSeries::new(twin.signal_id()).with_model_id(twin.model_id.clone());
        if let Some(unit) = &twin.unit {
            series = series.with_unit(unit.clone());
        }
        if let Some((min, max)) = twin.valid_range {
            series = series.with_valid_range(ValidRange::new(min, max));
        }
        if let Some(secs) = twin.trend_interval_secs {
            series = series.with_trend_interval(TimeDelta::seconds(secs as i64));
        }
        store.insert(series);
        registered += 1;
    }
    debug!(registered, "Signal series registered from twin metadata");
    registered
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    fn file(suffix: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    const GRAPH_YAML: &str = r#"
twins:
  - id: AHU-0001
    model_id: "dtmi:com:willowinc:AirHandlingUnit;1"
  - id: SAT-0001
    model_id: "dtmi:com:willowinc:SupplyAirTemperatureSensor;1"
    name: Supply Air Temp
    trend_id: sat-trend
    unit: degC
    valid_range: [-20.0, 60.0]
relations:
  - source: SAT-0001
    target: AHU-0001
    kind: isCapabilityOf
"#;

    #[test]
    fn test_load_yaml_graph() {
        let file = file(".yaml", GRAPH_YAML);
        let graph = load_graph(file.path()).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.twin("SAT-0001").unwrap().display_name(), "Supply Air Temp");
    }

    #[test]
    fn test_unsupported_extension() {
        let file = file(".txt", GRAPH_YAML);
        let err = load_graph(file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported file extension"));
    }

    #[test]
    fn test_register_signals_from_metadata() {
        let file = file(".yaml", GRAPH_YAML);
        let graph = load_graph(file.path()).unwrap();
        let store = MemoryTimeSeriesStore::new();

        assert_eq!(register_signals(&graph, &store), 1);
        let series = store.get("sat-trend").unwrap();
        let series = series.read();
        assert_eq!(series.unit.as_deref(), Some("degC"));
        assert_eq!(series.valid_range, Some(ValidRange::new(-20.0, 60.0)));
    }

    #[tokio::test]
    async fn test_file_service_skips_unknown_seeds() {
        let file = file(".yaml", GRAPH_YAML);
        let service = FileGraphService::new(file.path());
        let graph = service
            .graph_around(&["AHU-0001".to_string(), "AHU-9999".to_string()])
            .await
            .unwrap();
        assert!(graph.contains("AHU-0001"));
        assert!(graph.contains("SAT-0001"));
    }

    #[tokio::test]
    async fn test_file_service_reports_broken_file() {
        let file = file(".json", "{ not json");
        let service = FileGraphService::new(file.path());
        assert!(service.graph_around(&[]).await.is_err());
    }
}
