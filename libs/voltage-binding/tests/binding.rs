//! Binder scenarios against a small air-handling graph
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use voltage_binding::{BindError, Binder};
use voltage_calc::{parse, BinaryOp, Constant, Env, Expr, Macro};
use voltage_model::{MemoryOntology, RelationKind, Twin, TwinGraph};

const NS: &str = "dtmi:com:willowinc:";

fn model(name: &str) -> String {
    format!("{NS}{name};1")
}

/// AHU-0001 with zone and supply sensors, feeding a VAV, located on a floor
/// that carries the outside air sensor.
fn graph(second_zone_sensor: bool) -> TwinGraph {
    let mut graph = TwinGraph::new();
    graph.add_twin(
        Twin::new("AHU-0001", model("AirHandlingUnit"))
            .with_tags(["ahu"])
            .with_property("ratedFlow", serde_json::json!(1200.0)),
    );
    graph.add_twin(
        Twin::new("ZAT-0001", model("ZoneAirTemperatureSensor"))
            .with_unit("degF")
            .with_trend_id("trend-zat-1")
            .with_tags(["zone", "air", "temperature", "sensor"]),
    );
    graph.add_twin(Twin::new("SAT-0001", model("SupplyAirTemperatureSensor")).with_unit("degC"));
    graph.add_twin(Twin::new("VAV-0001", model("VariableAirVolumeBox")));
    graph.add_twin(Twin::new("VAV-ZAT-01", model("ZoneAirTemperatureSensor")));
    graph.add_twin(Twin::new("FLR-0001", model("Level")));
    graph.add_twin(Twin::new("OAT-0001", model("OutsideAirTemperatureSensor")));

    graph
        .add_relation("ZAT-0001", RelationKind::IsCapabilityOf, "AHU-0001")
        .unwrap();
    graph
        .add_relation("SAT-0001", RelationKind::IsCapabilityOf, "AHU-0001")
        .unwrap();
    graph
        .add_relation("AHU-0001", RelationKind::Feeds, "VAV-0001")
        .unwrap();
    graph
        .add_relation("VAV-ZAT-01", RelationKind::IsCapabilityOf, "VAV-0001")
        .unwrap();
    graph
        .add_relation("AHU-0001", RelationKind::LocatedIn, "FLR-0001")
        .unwrap();
    graph
        .add_relation("OAT-0001", RelationKind::IsCapabilityOf, "FLR-0001")
        .unwrap();

    if second_zone_sensor {
        graph.add_twin(Twin::new("ZAT-0002", model("ZoneAirTemperatureSensor")));
        graph
            .add_relation("ZAT-0002", RelationKind::IsCapabilityOf, "AHU-0001")
            .unwrap();
    }
    graph
}

fn ontology() -> MemoryOntology {
    let mut ontology = MemoryOntology::new();
    ontology.add_model(model("TemperatureSensor"), Vec::<String>::new());
    ontology.add_model(model("AirTemperatureSensor"), [model("TemperatureSensor")]);
    for sensor in [
        "ZoneAirTemperatureSensor",
        "SupplyAirTemperatureSensor",
        "OutsideAirTemperatureSensor",
    ] {
        ontology.add_model(model(sensor), [model("AirTemperatureSensor")]);
    }
    ontology.add_capability_root(model("TemperatureSensor"));
    ontology
}

fn twin_id(expr: &Expr) -> &str {
    match expr {
        Expr::Twin(twin) => &twin.id,
        other => panic!("expected a twin, got {:?}", other),
    }
}

fn array_ids(expr: &Expr) -> Vec<&str> {
    match expr {
        Expr::Array(items) => items.iter().map(twin_id).collect(),
        other => panic!("expected an array, got {:?}", other),
    }
}

// ============================================================================
// Model-id resolution
// ============================================================================

#[test]
fn test_single_direct_relation_binds_to_twin() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(&parse("[ZoneAirTemperatureSensor;1]").unwrap());
    assert!(outcome.success);
    match &outcome.expr {
        Expr::Twin(twin) => {
            assert_eq!(twin.id, "ZAT-0001");
            assert_eq!(twin.signal_id.as_deref(), Some("trend-zat-1"));
            assert_eq!(twin.unit.as_deref(), Some("degF"));
        },
        other => panic!("expected a twin, got {:?}", other),
    }
}

#[test]
fn test_two_direct_relations_bind_to_ambiguous_array() {
    let graph = graph(true);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(&parse("[ZoneAirTemperatureSensor;1]").unwrap());
    assert!(outcome.success);
    assert_eq!(array_ids(&outcome.expr), vec!["ZAT-0001", "ZAT-0002"]);
}

#[test]
fn test_inherited_model_matches_when_no_exact_match() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(&parse("[AirTemperatureSensor;1]").unwrap());
    assert!(outcome.success);
    assert_eq!(array_ids(&outcome.expr), vec!["ZAT-0001", "SAT-0001"]);
}

#[test]
fn test_search_widens_by_hop_distance() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "ZAT-0001").unwrap();

    let outcome = binder.bind(&parse("[OutsideAirTemperatureSensor;1]").unwrap());
    assert!(outcome.success);
    assert_eq!(twin_id(&outcome.expr), "OAT-0001");
}

#[test]
fn test_unmatched_model_fails_with_reason() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(&parse("[ChillerSensor;1] > 3").unwrap());
    assert!(!outcome.success);
    assert_eq!(
        outcome.failures(),
        vec!["No twin matches found for ChillerSensor;1"]
    );
}

// ============================================================================
// Folding
// ============================================================================

#[test]
fn test_binary_folds_over_ambiguous_binding() {
    let graph = graph(true);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let sensors = binder.bind(&parse("[ZoneAirTemperatureSensor;1]").unwrap());
    let Expr::Array(items) = sensors.expr else {
        panic!("expected an array");
    };
    let expected = Expr::Array(
        items
            .into_iter()
            .map(|twin| Expr::binary(BinaryOp::Add, Expr::number(10.0), twin))
            .collect(),
    );

    let outcome = binder.bind(&parse("10 + [ZoneAirTemperatureSensor;1]").unwrap());
    assert!(outcome.success);
    assert_eq!(outcome.expr, expected);
}

#[test]
fn test_logical_operator_rejects_arrays() {
    let graph = graph(true);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(&parse("[ZoneAirTemperatureSensor;1] > 20 & TRUE").unwrap());
    assert!(!outcome.success);
    assert_eq!(
        outcome.failures(),
        vec!["Cannot apply & to an array, use ALL or ANY"]
    );
}

#[test]
fn test_all_over_short_array_collapses_to_and_chain() {
    let graph = graph(true);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(&parse("ALL([ZoneAirTemperatureSensor;1] > 20)").unwrap());
    assert!(outcome.success);
    assert!(matches!(
        outcome.expr,
        Expr::Binary {
            op: BinaryOp::And,
            ..
        }
    ));
    assert_eq!(outcome.expr.twins().len(), 2);
}

#[test]
fn test_fold_ceiling_fails_the_bind() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001")
        .unwrap()
        .with_max_fold_count(1);

    let outcome = binder.bind(&parse("10 + [AirTemperatureSensor;1]").unwrap());
    assert!(!outcome.success);
    assert_eq!(outcome.failures(), vec!["Max array count of 1 reached"]);

    // Counting bindings is exempt from the ceiling
    let counted = binder.bind(&parse("COUNT_BINDINGS([AirTemperatureSensor;1])").unwrap());
    assert!(counted.success);
    assert_eq!(counted.expr, Expr::number(2.0));
}

// ============================================================================
// Special functions
// ============================================================================

#[test]
fn test_option_takes_first_bindable_child() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(
        &parse("OPTION([ChillerSensor;1], [SupplyAirTemperatureSensor;1], [ZoneAirTemperatureSensor;1])")
            .unwrap(),
    );
    assert!(outcome.success);
    assert_eq!(twin_id(&outcome.expr), "SAT-0001");
}

#[test]
fn test_tolerant_option_keeps_every_bindable_child() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(
        &parse("TOLERANTOPTION([ChillerSensor;1], [SupplyAirTemperatureSensor;1], [ZoneAirTemperatureSensor;1])")
            .unwrap(),
    );
    assert!(outcome.success);
    match &outcome.expr {
        Expr::Call { name, args } => {
            assert_eq!(name, "TOLERANTOPTION");
            assert_eq!(args.iter().map(twin_id).collect::<Vec<_>>(), vec!["SAT-0001", "ZAT-0001"]);
        },
        other => panic!("expected a call, got {:?}", other),
    }

    let constants = binder.bind(&parse("TOLERANTOPTION([ChillerSensor;1], 5, 6)").unwrap());
    assert!(constants.success);
    assert_eq!(constants.expr, Expr::number(5.0));
}

#[test]
fn test_exists_never_fails_the_bind() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(&parse("EXISTS([ChillerSensor;1]) ? 1 : 0").unwrap());
    assert!(outcome.success);
    assert_eq!(
        outcome.expr,
        Expr::ternary(Expr::boolean(false), Expr::number(1.0), Expr::number(0.0))
    );

    let present = binder.bind(&parse("EXISTS([SupplyAirTemperatureSensor;1])").unwrap());
    assert_eq!(present.expr, Expr::boolean(true));
}

#[test]
fn test_unit_conversion_rewrites_or_fails() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let converted = binder.bind(&parse("FAHRENHEIT([SupplyAirTemperatureSensor;1])").unwrap());
    assert!(converted.success);
    assert_eq!(converted.expr.unit(), Some("degF"));

    let rejected = binder.bind(&parse("PERCENTAGE([SupplyAirTemperatureSensor;1])").unwrap());
    assert!(!rejected.success);
    assert_eq!(rejected.failures(), vec!["Cannot coerce degC to PERCENTAGE"]);

    let missing = binder.bind(&Expr::call("CELSIUS", vec![]));
    assert!(!missing.success);
    assert_eq!(missing.failures(), vec!["Argument expected"]);
}

#[test]
fn test_each_binds_body_per_twin() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(&parse("EACH([AirTemperatureSensor;1], s, s > 20)").unwrap());
    assert!(outcome.success);
    let Expr::Array(items) = &outcome.expr else {
        panic!("expected an array, got {:?}", outcome.expr);
    };
    assert_eq!(items.len(), 2);
    assert!(items
        .iter()
        .all(|item| matches!(item, Expr::Binary { op: BinaryOp::Greater, .. })));
    // The loop variable does not leak
    assert!(!binder.env().is_defined("s"));
}

#[test]
fn test_each_with_no_bindable_body_reports_failures() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(
        &parse("EACH([AirTemperatureSensor;1], s, s.[ChillerSensor;1])").unwrap(),
    );
    assert!(!outcome.success);
    assert_eq!(outcome.failures(), vec!["EACH Argument is empty. 2 failed."]);
}

#[test]
fn test_is_checks_inheritance_and_distributes() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let own = binder.bind(&parse("IS(this, 'AirHandlingUnit;1')").unwrap());
    assert_eq!(own.expr, Expr::boolean(true));

    let sensors = binder.bind(&parse("IS([AirTemperatureSensor;1], 'TemperatureSensor;1')").unwrap());
    assert_eq!(
        sensors.expr,
        Expr::Array(vec![Expr::boolean(true), Expr::boolean(true)])
    );
}

#[test]
fn test_macro_expands_with_bound_arguments() {
    let graph = graph(false);
    let ontology = ontology();
    let mut env = Env::new();
    env.register_function(Macro {
        name: "DIFF".to_string(),
        parameters: vec!["a".to_string(), "b".to_string()],
        body: parse("a - b").unwrap(),
    });
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001")
        .unwrap()
        .with_env(env);

    let outcome = binder.bind(&parse("DIFF([ZoneAirTemperatureSensor;1], 2)").unwrap());
    assert!(outcome.success);
    match &outcome.expr {
        Expr::Binary {
            op: BinaryOp::Subtract,
            left,
            right,
            ..
        } => {
            assert_eq!(twin_id(left), "ZAT-0001");
            assert_eq!(**right, Expr::number(2.0));
        },
        other => panic!("expected a subtraction, got {:?}", other),
    }

    let wrong = binder.bind(&parse("DIFF(1)").unwrap());
    assert!(!wrong.success);
    assert_eq!(wrong.failures(), vec!["DIFF expects 2 arguments, got 1"]);
}

// ============================================================================
// Temporal helpers and TIMER
// ============================================================================

#[test]
fn test_temporal_over_computed_value_registers_helper() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(
        &parse("AVERAGE([ZoneAirTemperatureSensor;1] - [SupplyAirTemperatureSensor;1], 1h)")
            .unwrap(),
    );
    assert!(outcome.success);
    let Expr::Temporal { child, .. } = &outcome.expr else {
        panic!("expected a temporal node, got {:?}", outcome.expr);
    };
    let Expr::Variable { name, .. } = child.as_ref() else {
        panic!("expected a helper variable, got {:?}", child);
    };
    assert!(name.starts_with("auto_"));

    let definition = binder.helpers().get(name).unwrap();
    assert!(matches!(
        definition,
        Expr::Binary {
            op: BinaryOp::Subtract,
            ..
        }
    ));
}

#[test]
fn test_temporal_over_twin_needs_no_helper() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(&parse("MAX([SupplyAirTemperatureSensor;1], 1h)").unwrap());
    assert!(outcome.success);
    assert!(binder.helpers().is_empty());
    let Expr::Temporal { child, .. } = &outcome.expr else {
        panic!("expected a temporal node");
    };
    assert_eq!(twin_id(child), "SAT-0001");
}

#[test]
fn test_failed_option_branch_does_not_leave_helpers() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(
        &parse("OPTION(AVERAGE([ChillerSensor;1] - 1, 1h), [SupplyAirTemperatureSensor;1])")
            .unwrap(),
    );
    assert!(outcome.success);
    assert!(binder.helpers().is_empty());
}

#[test]
fn test_timer_becomes_accumulating_helper() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(&parse("TIMER([SupplyAirTemperatureSensor;1] > 30, m)").unwrap());
    assert!(outcome.success);
    let Expr::Variable { name, .. } = &outcome.expr else {
        panic!("expected a helper variable, got {:?}", outcome.expr);
    };
    assert!(name.starts_with("auto_"));
    assert!(name.ends_with("_timer"));

    let definition = binder.helpers().get(name).unwrap();
    assert!(matches!(definition, Expr::Ternary { .. }));
    assert!(definition.variables().contains(&"DELTA_TIME_S"));
    assert!(definition.variables().contains(&name.as_str()));

    let invalid = binder.bind(&parse("TIMER(TRUE, fortnight)").unwrap());
    assert!(!invalid.success);
    assert_eq!(invalid.failures(), vec!["Invalid TIMER unit"]);
}

// ============================================================================
// Fallback resolution
// ============================================================================

#[test]
fn test_tag_match_is_assigned_into_env() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(&parse("[zone air temperature]").unwrap());
    assert!(outcome.success);
    assert_eq!(twin_id(&outcome.expr), "ZAT-0001");
    assert!(binder.env().expression("zone air temperature").is_some());
}

#[test]
fn test_direct_id_and_suffix_lookup() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let direct = binder.bind(&Expr::variable("OAT-0001"));
    assert_eq!(twin_id(&direct.expr), "OAT-0001");

    let suffix = binder.bind(&Expr::variable("AT-01"));
    assert!(suffix.success);
    assert_eq!(twin_id(&suffix.expr), "VAV-ZAT-01");
}

#[test]
fn test_reserved_and_runtime_names_are_left_for_evaluation() {
    let graph = graph(false);
    let ontology = ontology();
    let mut env = Env::new();
    env.assign_value("threshold", 3.0);
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001")
        .unwrap()
        .with_env(env);

    let source = parse("IS_FAULTY | DELTA_TIME_S > threshold").unwrap();
    let outcome = binder.bind(&source);
    assert!(outcome.success);
    assert_eq!(outcome.expr, source);
}

#[test]
fn test_properties_parent_and_rerooting() {
    let graph = graph(false);
    let ontology = ontology();

    let mut ahu = Binder::new(&graph, &ontology, "AHU-0001").unwrap();
    let flow = ahu.bind(&parse("this.ratedFlow").unwrap());
    assert_eq!(flow.expr, Expr::Constant(Constant::Number(1200.0)));

    let mut sensor = Binder::new(&graph, &ontology, "ZAT-0001").unwrap();
    let parent = sensor.bind(&parse("this.parent").unwrap());
    assert_eq!(twin_id(&parent.expr), "AHU-0001");

    let mut floor = Binder::new(&graph, &ontology, "FLR-0001").unwrap();
    let supply = floor.bind(&parse("[AirHandlingUnit;1].[SupplyAirTemperatureSensor;1]").unwrap());
    assert!(supply.success);
    assert_eq!(twin_id(&supply.expr), "SAT-0001");
}

#[test]
fn test_unresolved_name_and_unknown_subject() {
    let graph = graph(false);
    let ontology = ontology();
    let mut binder = Binder::new(&graph, &ontology, "AHU-0001").unwrap();

    let outcome = binder.bind(&parse("[Nonexistent Thing] + 1").unwrap());
    assert!(!outcome.success);
    match outcome.into_result() {
        Err(BindError::Failed { reason, .. }) => {
            assert_eq!(reason, "Could not resolve variable Nonexistent Thing")
        },
        other => panic!("expected a binding failure, got {:?}", other),
    }

    assert!(matches!(
        Binder::new(&graph, &ontology, "missing"),
        Err(BindError::UnknownSubject(_))
    ));
}
