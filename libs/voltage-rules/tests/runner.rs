//! Integration tests for the rule runner
//!
//! Covers batch ticks, exclusion of instances that cannot bind, disabled
//! rules, cancellation and state resets on rule changes.

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use voltage_model::{GraphCache, MemoryOntology, RelationKind, Twin, TwinGraph};
use voltage_rtdb::{MemoryTimeSeriesStore, TimedValue};
use voltage_rules::{
    Field, InstanceStatus, RuleDefinition, RuleInstance, RuleRunner, RuleSet, RunnerConfig,
    TickBatchReport, Template,
};

// ============================================================================
// Fixture
// ============================================================================

fn at(minutes: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_709_251_200, 0).unwrap() + TimeDelta::minutes(minutes)
}

fn ahu(graph: &mut TwinGraph, ahu: &str, sat: &str) {
    graph.add_twin(Twin::new(ahu, "dtmi:com:willowinc:AirHandlingUnit;1"));
    graph.add_twin(
        Twin::new(sat, "dtmi:com:willowinc:SupplyAirTemperatureSensor;1")
            .with_name("Supply Air Temp"),
    );
    graph
        .add_relation(sat, RelationKind::IsCapabilityOf, ahu)
        .unwrap();
}

fn graph() -> TwinGraph {
    let mut graph = TwinGraph::new();
    ahu(&mut graph, "AHU-0001", "SAT-0001");
    ahu(&mut graph, "AHU-0002", "SAT-0002");
    // No supply air sensor
    graph.add_twin(Twin::new("AHU-0003", "dtmi:com:willowinc:AirHandlingUnit;1"));
    graph
}

fn high_sat() -> RuleDefinition {
    RuleDefinition::new(
        "high-sat",
        Template::Calculated,
        vec![
            Field::new("sat", "[SupplyAirTemperatureSensor;1]"),
            Field::new("result", "sat > 30"),
        ],
    )
}

fn rule_set() -> RuleSet {
    RuleSet {
        rules: vec![high_sat()],
        instances: ["AHU-0001", "AHU-0002", "AHU-0003"]
            .into_iter()
            .map(|twin| RuleInstance::new("high-sat", twin))
            .collect(),
    }
}

fn runner() -> RuleRunner {
    let store = Arc::new(MemoryTimeSeriesStore::new());
    for signal in ["SAT-0001", "SAT-0002"] {
        store.ingest(signal, TimedValue::new(at(-10), 35.0));
        store.ingest(signal, TimedValue::new(at(0), 35.0));
    }
    let runner = RuleRunner::new(
        RunnerConfig::default(),
        Arc::new(GraphCache::new(graph())),
        Arc::new(MemoryOntology::new()),
        store,
    );
    runner.load(rule_set()).unwrap();
    runner
}

// ============================================================================
// Ticks
// ============================================================================

#[tokio::test]
async fn test_tick_evaluates_and_excludes() {
    let runner = runner();
    let report = runner.tick(at(0), &CancellationToken::new()).await;
    assert_eq!(
        report,
        TickBatchReport {
            evaluated: 2,
            skipped: 0,
            excluded: 1,
            cancelled: 0,
        }
    );

    let snapshot = runner.state("AHU-0001_high-sat").await.unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Valid);
    assert_eq!(snapshot.rule_id, "high-sat");
    assert!(runner.state("AHU-0003_high-sat").await.is_none());

    let failures = runner.cache().failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "AHU-0003_high-sat");
}

#[tokio::test]
async fn test_graph_change_rebinds_excluded_instance() {
    let runner = runner();
    runner.tick(at(0), &CancellationToken::new()).await;

    let mut graph = graph();
    graph.add_twin(
        Twin::new("SAT-0003", "dtmi:com:willowinc:SupplyAirTemperatureSensor;1")
            .with_name("Supply Air Temp"),
    );
    graph
        .add_relation("SAT-0003", RelationKind::IsCapabilityOf, "AHU-0003")
        .unwrap();
    runner.graph().replace(graph);

    let report = runner.tick(at(1), &CancellationToken::new()).await;
    assert_eq!(report.evaluated, 3);
    assert_eq!(report.excluded, 0);

    let snapshot = runner.state("AHU-0003_high-sat").await.unwrap();
    assert_eq!(snapshot.status, InstanceStatus::MissingValue);
}

#[tokio::test]
async fn test_cancelled_tick_starts_nothing() {
    let runner = runner();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = runner.tick(at(0), &cancel).await;
    assert_eq!(report.cancelled, 3);
    assert_eq!(report.total(), 3);
    assert!(runner.snapshots().await.is_empty());
}

#[tokio::test]
async fn test_disabled_rule_is_skipped() {
    let runner = runner();
    let mut rule = high_sat();
    rule.enabled = false;
    runner.upsert_rule(rule).unwrap();

    let report = runner.tick(at(0), &CancellationToken::new()).await;
    assert_eq!(report.skipped, 3);
    assert_eq!(report.evaluated, 0);
}

#[tokio::test]
async fn test_rule_version_change_resets_state() {
    let runner = runner();
    runner.tick(at(0), &CancellationToken::new()).await;
    let version = runner.with_state("AHU-0001_high-sat", |s| s.version).await;
    assert_eq!(version, Some(1));

    let mut rule = high_sat();
    rule.version = 2;
    runner.upsert_rule(rule).unwrap();
    runner.tick(at(1), &CancellationToken::new()).await;

    let state = runner
        .with_state("AHU-0001_high-sat", |s| (s.version, s.earliest_seen))
        .await
        .unwrap();
    assert_eq!(state, (2, at(1)));
}

// ============================================================================
// Rule management
// ============================================================================

#[tokio::test]
async fn test_reload_drops_removed_instances() {
    let runner = runner();
    runner.tick(at(0), &CancellationToken::new()).await;
    assert_eq!(runner.snapshots().await.len(), 2);

    let mut set = rule_set();
    set.instances.retain(|i| i.twin_id == "AHU-0002");
    assert_eq!(runner.load(set).unwrap(), 1);

    let snapshots = runner.snapshots().await;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].id, "AHU-0002_high-sat");
}

#[test]
fn test_add_instance_rejects_duplicates() {
    let runner = runner();
    assert!(!runner.add_instance(RuleInstance::new("high-sat", "AHU-0001")));
    assert!(runner.add_instance(RuleInstance::new("high-sat", "AHU-0004")));
    assert_eq!(runner.instances().len(), 4);
}

#[test]
fn test_check_reports_each_binding() {
    let runner = runner();
    let bound: Vec<(String, bool)> = runner
        .check()
        .into_iter()
        .map(|(instance, binding)| (instance.twin_id, binding.is_bound()))
        .collect();
    assert_eq!(
        bound,
        vec![
            ("AHU-0001".to_string(), true),
            ("AHU-0002".to_string(), true),
            ("AHU-0003".to_string(), false),
        ]
    );
}
