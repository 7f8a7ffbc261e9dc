//! Rule binding
//!
//! Binds every expression of a rule against one subject twin and caches the
//! outcome. A cached binding stays valid until the rule version or the graph
//! generation changes; an instance that fails to bind is logged once and
//! excluded from ticks until then.

use crate::definition::{CumulativeMode, RuleDefinition, RuleInstance, MAX_BUFFER_DAYS};
use crate::error::{Result, RuleError};
use chrono::TimeDelta;
use dashmap::DashMap;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use voltage_binding::{Binder, RESERVED_VARIABLES};
use voltage_calc::{parse, Env, Expr, HelperVariable, InvalidReason, Macro, TwinRef, Value};
use voltage_model::{GraphCache, ModelOntology, TwinGraph};
use voltage_rtdb::MemoryTimeSeriesStore;

/// Functions whose arguments may be invalid without invalidating the call
const TOLERANT_FUNCTIONS: &[&str] = &["TOLERANCE", "TOLERANTOPTION", "OPTION", "IFNAN"];

/// A bound expression plus the helper variables it reads
#[derive(Debug, Clone, PartialEq)]
pub struct BoundExpression {
    pub expr: Expr,
    /// Helpers to compute (in order) before `expr`
    pub helpers: Vec<HelperVariable>,
}

/// A bound field or impact score
#[derive(Debug, Clone, PartialEq)]
pub struct BoundField {
    pub id: String,
    pub name: String,
    /// Source text, for diagnostics
    pub source: String,
    pub unit: Option<String>,
    pub cumulative: CumulativeMode,
    pub buffered: bool,
    pub bound: BoundExpression,
}

impl BoundField {
    /// A plain reference to one capability, kept as a live alias
    pub fn alias(&self) -> Option<&TwinRef> {
        match &self.bound.expr {
            Expr::Twin(twin) if self.cumulative.is_simple() => Some(twin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundTrigger {
    pub id: String,
    pub condition: BoundExpression,
    pub value: BoundExpression,
}

/// A capability twin referenced by the rule
#[derive(Debug, Clone, PartialEq)]
pub struct Capability {
    pub twin: TwinRef,
    /// Display name for diagnostics
    pub name: String,
    /// Referenced outside any tolerant function
    pub required: bool,
}

/// A rule bound to one subject twin, immutable once built
#[derive(Debug, Clone)]
pub struct BoundRule {
    pub instance: RuleInstance,
    pub rule: Arc<RuleDefinition>,
    pub fields: Vec<BoundField>,
    pub impacts: Vec<BoundField>,
    pub triggers: Vec<BoundTrigger>,
    pub capabilities: Vec<Capability>,
    /// History every buffer of this instance must keep
    pub retention: TimeDelta,
}

impl BoundRule {
    pub fn required(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter().filter(|c| c.required)
    }

    pub fn result(&self) -> Option<&BoundField> {
        self.fields.iter().find(|f| f.id == crate::definition::RESULT_FIELD)
    }

    /// Grow the retention of every referenced signal already in the store
    pub fn extend_retention(&self, store: &MemoryTimeSeriesStore) {
        for capability in &self.capabilities {
            if let Some(series) = store.get(capability.twin.signal_key()) {
                series.write().buffer_mut().set_max_retention(self.retention);
            }
        }
    }
}

/// Bind every expression of `rule` against the instance's twin
pub fn bind_rule(
    rule: &Arc<RuleDefinition>,
    instance: &RuleInstance,
    graph: &TwinGraph,
    ontology: &dyn ModelOntology,
    max_fold_count: usize,
) -> Result<BoundRule> {
    rule.validate()?;

    let mut env = Env::new();
    for definition in &rule.macros {
        let body = parse(&definition.body).map_err(|e| {
            RuleError::invalid_definition(format!("macro {}: {}", definition.name, e))
        })?;
        env.register_function(Macro {
            name: definition.name.clone(),
            parameters: definition.parameters.clone(),
            body,
        });
    }
    // Placeholders so later expressions bind field ids as runtime values
    let placeholders = rule
        .fields
        .iter()
        .map(|f| f.id.as_str())
        .chain(rule.impact_scores.iter().map(|s| s.id.as_str()))
        .chain(RESERVED_VARIABLES.iter().copied());
    for name in placeholders {
        env.assign_value(name, Value::Invalid(InvalidReason::NoData(name.to_string())));
    }

    let mut binder = Binder::new(graph, ontology, &instance.twin_id)?
        .with_env(env)
        .with_max_fold_count(max_fold_count);

    let mut fields = Vec::with_capacity(rule.fields.len());
    for field in &rule.fields {
        let bound = bind_expression(&mut binder, &field.id, &field.expression)?;
        fields.push(BoundField {
            id: field.id.clone(),
            name: display_name(&field.name, &field.id),
            source: field.expression.clone(),
            unit: field.unit.clone(),
            cumulative: field.cumulative,
            buffered: field.buffered || field.is_result(),
            bound,
        });
    }

    let mut impacts = Vec::with_capacity(rule.impact_scores.len());
    for score in &rule.impact_scores {
        let bound = bind_expression(&mut binder, &score.id, &score.expression)?;
        impacts.push(BoundField {
            id: score.id.clone(),
            name: display_name(&score.name, &score.id),
            source: score.expression.clone(),
            unit: score.unit.clone(),
            cumulative: CumulativeMode::Simple,
            buffered: true,
            bound,
        });
    }

    let mut triggers = Vec::with_capacity(rule.triggers.len());
    for trigger in &rule.triggers {
        let condition = bind_expression(&mut binder, &trigger.id, &trigger.condition)?;
        let value = bind_expression(&mut binder, &trigger.id, &trigger.value)?;
        triggers.push(BoundTrigger {
            id: trigger.id.clone(),
            condition,
            value,
        });
    }

    let expressions: Vec<&BoundExpression> = fields
        .iter()
        .chain(impacts.iter())
        .map(|f| &f.bound)
        .chain(triggers.iter().flat_map(|t| [&t.condition, &t.value]))
        .collect();

    let capabilities = collect_capabilities(&expressions, graph);
    let history = expressions
        .iter()
        .flat_map(|b| std::iter::once(&b.expr).chain(b.helpers.iter().map(|h| &h.expression)))
        .map(longest_history)
        .max()
        .unwrap_or_else(TimeDelta::zero);
    let retention = rule
        .retention()
        .max(history * 2)
        .min(TimeDelta::days(MAX_BUFFER_DAYS));

    debug!(
        instance_id = %instance.id,
        fields = fields.len(),
        capabilities = capabilities.len(),
        "Rule bound"
    );

    Ok(BoundRule {
        instance: instance.clone(),
        rule: Arc::clone(rule),
        fields,
        impacts,
        triggers,
        capabilities,
        retention,
    })
}

fn display_name(name: &str, id: &str) -> String {
    if name.is_empty() { id } else { name }.to_string()
}

fn bind_expression(binder: &mut Binder<'_>, id: &str, text: &str) -> Result<BoundExpression> {
    let parsed = parse(text)
        .map_err(|e| RuleError::invalid_definition(format!("{}: {}", id, e)))?;
    let mark = binder.helpers().len();
    let outcome = binder.bind(&parsed);
    if !outcome.success {
        let failures = outcome.failures().join("; ");
        return Err(RuleError::Binding(format!("{}: {}", id, failures)));
    }
    let helpers = binder.helpers().iter().skip(mark).cloned().collect();
    Ok(BoundExpression {
        expr: outcome.expr,
        helpers,
    })
}

/// Every twin in the expressions, required unless only read through a tolerant function
fn collect_capabilities(expressions: &[&BoundExpression], graph: &TwinGraph) -> Vec<Capability> {
    let mut capabilities: Vec<Capability> = Vec::new();
    let mut seen = FxHashSet::default();

    let roots = expressions
        .iter()
        .flat_map(|b| std::iter::once(&b.expr).chain(b.helpers.iter().map(|h| &h.expression)));
    for root in roots {
        let mut found = Vec::new();
        walk_twins(root, false, &mut found);
        for (twin, tolerant) in found {
            if seen.insert(twin.id.clone()) {
                let name = graph
                    .twin(&twin.id)
                    .map_or_else(|| twin.id.clone(), |t| t.display_name().to_string());
                capabilities.push(Capability {
                    twin: twin.clone(),
                    name,
                    required: !tolerant,
                });
            } else if !tolerant {
                if let Some(existing) = capabilities.iter_mut().find(|c| c.twin.id == twin.id) {
                    existing.required = true;
                }
            }
        }
    }
    capabilities
}

fn walk_twins<'a>(expr: &'a Expr, tolerant: bool, found: &mut Vec<(&'a TwinRef, bool)>) {
    match expr {
        Expr::Twin(twin) => found.push((twin, tolerant)),
        Expr::Call { name, args } => {
            let tolerant = tolerant
                || TOLERANT_FUNCTIONS
                    .iter()
                    .any(|f| f.eq_ignore_ascii_case(name));
            for arg in args {
                walk_twins(arg, tolerant, found);
            }
        },
        other => {
            for child in other.children() {
                walk_twins(child, tolerant, found);
            }
        },
    }
}

/// Longest look-back of any temporal operator in the tree
fn longest_history(expr: &Expr) -> TimeDelta {
    let own = match expr {
        Expr::Temporal { window, offset, .. } => {
            window.unwrap_or_else(TimeDelta::zero) - (*offset).min(TimeDelta::zero())
        },
        _ => TimeDelta::zero(),
    };
    expr.children()
        .into_iter()
        .map(longest_history)
        .fold(own, TimeDelta::max)
}

// ============================================================================
// Cache
// ============================================================================

/// Outcome of looking an instance up in the cache
#[derive(Debug, Clone)]
pub enum Binding {
    Bound(Arc<BoundRule>),
    /// Binding failed, the instance is skipped until the rule or graph changes
    Excluded(String),
}

impl Binding {
    pub fn is_bound(&self) -> bool {
        matches!(self, Binding::Bound(_))
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    version: u32,
    generation: u64,
    binding: Binding,
}

/// Bound rules by instance id
#[derive(Debug)]
pub struct BindingCache {
    entries: DashMap<String, CacheEntry>,
    max_fold_count: usize,
}

impl BindingCache {
    pub fn new(max_fold_count: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_fold_count,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached binding for the current rule version and graph generation,
    /// binding afresh when either moved on
    pub fn get_or_bind(
        &self,
        rule: &Arc<RuleDefinition>,
        instance: &RuleInstance,
        graph: &GraphCache,
        ontology: &dyn ModelOntology,
    ) -> Binding {
        let generation = graph.generation();
        if let Some(entry) = self.entries.get(&instance.id) {
            if entry.version == rule.version && entry.generation == generation {
                return entry.binding.clone();
            }
        }

        let snapshot = graph.load();
        let binding = match bind_rule(rule, instance, &snapshot, ontology, self.max_fold_count) {
            Ok(bound) => Binding::Bound(Arc::new(bound)),
            Err(e) => {
                warn!(
                    rule_id = %rule.id,
                    instance_id = %instance.id,
                    error = %e,
                    "Rule instance excluded"
                );
                Binding::Excluded(e.to_string())
            },
        };

        self.entries.insert(
            instance.id.clone(),
            CacheEntry {
                version: rule.version,
                generation,
                binding: binding.clone(),
            },
        );
        binding
    }

    pub fn invalidate(&self, instance_id: &str) {
        self.entries.remove(instance_id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Excluded instances with their binding errors
    pub fn failures(&self) -> Vec<(String, String)> {
        let mut failures: Vec<(String, String)> = self
            .entries
            .iter()
            .filter_map(|entry| match &entry.binding {
                Binding::Excluded(reason) => Some((entry.key().clone(), reason.clone())),
                Binding::Bound(_) => None,
            })
            .collect();
        failures.sort();
        failures
    }
}
