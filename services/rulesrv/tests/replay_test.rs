//! End to end tests: files on disk through loader, engine and replay

#![allow(clippy::disallowed_methods)] // Integration test - unwrap is acceptable

use chrono::TimeDelta;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use voltage_rtdb::MemorySink;
use voltage_rules::InstanceStatus;

use rulesrv::config::DataConfig;
use rulesrv::replay::{read_telemetry, replay};
use rulesrv::{Engine, Inputs, RulesrvConfig};

const GRAPH: &str = r#"{
  "twins": [
    {"id": "AHU-0001", "model_id": "dtmi:com:willowinc:AirHandlingUnit;1"},
    {"id": "AHU-0002", "model_id": "dtmi:com:willowinc:AirHandlingUnit;1"},
    {"id": "SAT-0001", "model_id": "dtmi:com:willowinc:SupplyAirTemperatureSensor;1",
     "name": "Supply Air Temp", "valid_range": [-20.0, 60.0]}
  ],
  "relations": [
    {"source": "SAT-0001", "target": "AHU-0001", "kind": "isCapabilityOf"}
  ]
}"#;

const RULES: &str = r#"
rules:
  - id: high-sat
    name: High supply air temperature
    template:
      type: fault
      threshold: 0.5
    window_hours: 1.0
    fields:
      - id: sat
        expression: "[SupplyAirTemperatureSensor;1]"
      - id: result
        expression: "sat > 30"
instances:
  - id: AHU-0001_high-sat
    rule_id: high-sat
    twin_id: AHU-0001
  - id: AHU-0002_high-sat
    rule_id: high-sat
    twin_id: AHU-0002
"#;

// ============================================================================
// Fixture
// ============================================================================

fn write(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// Supply air at 35 every 10 minutes for two hours
fn telemetry() -> String {
    let mut csv = String::from("timestamp,signal_id,value\n");
    for step in 0..=12 {
        let minute = step * 10;
        writeln!(csv, "2024-03-01T{:02}:{:02}:00Z,SAT-0001,35", minute / 60, minute % 60).unwrap();
    }
    csv
}

fn config(dir: &Path) -> RulesrvConfig {
    let mut config = RulesrvConfig::default();
    config.data = DataConfig {
        graph: write(dir, "graph.json", GRAPH),
        ontology: None,
        rules: write(dir, "rules.yaml", RULES),
        telemetry: Some(write(dir, "telemetry.csv", &telemetry())),
    };
    config.engine.tick_interval_ms = 10 * 60 * 1000;
    config
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_replay_reaches_fault() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let inputs = Inputs::load(&config.data).unwrap();
    let engine = Engine::build(&config, inputs, Arc::new(MemorySink::new())).unwrap();
    let points = read_telemetry(config.data.telemetry.as_deref().unwrap()).unwrap();

    let summary = replay(&engine, points, TimeDelta::minutes(10)).await.unwrap();
    engine.shutdown().await;

    assert_eq!(summary.rows, 13);
    assert_eq!(summary.accepted, 13);
    // Boundaries 00:10 through 01:50, then the last row at 02:00
    assert_eq!(summary.ticks, 12);

    let report = summary.last_report.unwrap();
    assert_eq!(report.evaluated, 1);
    assert_eq!(report.excluded, 1);

    assert_eq!(summary.states.len(), 1);
    let state = &summary.states[0];
    assert_eq!(state.id, "AHU-0001_high-sat");
    assert_eq!(state.status, InstanceStatus::Valid);
    assert!(state.faulted);
}

#[tokio::test]
async fn test_check_reports_unbound_subject() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let inputs = Inputs::load(&config.data).unwrap();
    let engine = Engine::build(&config, inputs, Arc::new(MemorySink::new())).unwrap();
    let outcomes: Vec<(String, bool)> = engine
        .runner
        .check()
        .into_iter()
        .map(|(instance, binding)| (instance.id, binding.is_bound()))
        .collect();
    engine.shutdown().await;

    assert_eq!(
        outcomes,
        vec![
            ("AHU-0001_high-sat".to_string(), true),
            ("AHU-0002_high-sat".to_string(), false),
        ]
    );
}

#[tokio::test]
async fn test_out_of_range_rows_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let csv = write(
        dir.path(),
        "bad.csv",
        "timestamp,signal_id,value\n\
         2024-03-01T00:00:00Z,SAT-0001,35\n\
         2024-03-01T00:10:00Z,SAT-0001,99\n",
    );

    let inputs = Inputs::load(&config.data).unwrap();
    let engine = Engine::build(&config, inputs, Arc::new(MemorySink::new())).unwrap();
    let summary = replay(&engine, read_telemetry(&csv).unwrap(), TimeDelta::minutes(10))
        .await
        .unwrap();
    engine.shutdown().await;

    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.states[0].status, InstanceStatus::InvalidValue);
}

#[test]
fn test_missing_rules_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.data.rules = dir.path().join("missing.yaml");

    let err = Inputs::load(&config.data).unwrap_err();
    assert!(err.to_string().contains("missing.yaml"));
}
