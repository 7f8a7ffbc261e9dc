//! Graph binder
//!
//! Rewrites a parsed rule expression so every identifier points at a
//! concrete twin. A bare name is resolved in this order, stopping at the
//! first step that yields candidates:
//!
//! 1. `this` or the subject id
//! 2. names held in the [`Env`] (bound expressions, runtime values, macros)
//! 3. reserved runtime variables
//! 4. model ids, direct relations first, then by increasing hop distance
//! 5. twin ids
//! 6. tag sets
//! 7. id suffixes
//!
//! Failures never abort the walk. The offending node is wrapped in
//! [`Expr::Failed`] and the success flag drops, so one pass reports every
//! unresolved name.

use crate::error::{BindError, Result};
use chrono::TimeDelta;
use rustc_hash::FxHashSet;
use tracing::debug;
use voltage_calc::{
    helper_key, is_helper, takes_arrays, transform, ArrayFunction, BinaryOp, Constant, Conversion,
    Env, EnvEntry, Expr, HelperVariables, Macro, ReplaceVariable, SuccessFlag, TemporalOp, TwinRef,
    UnaryOp, Visitor,
};
use voltage_model::{
    is_model_id, normalize_model_id, ModelOntology, NodeIndex, RelationKind, Twin, TwinGraph,
};

/// Default ceiling on array expansions per bind
pub const DEFAULT_MAX_FOLD_COUNT: usize = 10;

/// Names assigned by the rule runtime before every evaluation
pub const RESERVED_VARIABLES: &[&str] = &[
    "NOW",
    "TIME",
    "DELTA_TIME_S",
    "IS_FAULTY",
    "LAST_TRIGGER_TIME",
    "PERCENTAGE_FAULTED",
    "AREA_OUTSIDE",
    "COUNT",
    "STUCK_HOURS",
];

const MIN_TWIN_ID_LENGTH: usize = 6;
const MAX_MACRO_DEPTH: usize = 16;

/// Result of binding one expression
#[derive(Debug, Clone, PartialEq)]
pub struct BindOutcome {
    pub expr: Expr,
    pub success: bool,
}

impl BindOutcome {
    /// Every failure reason in the bound tree, outermost first
    pub fn failures(&self) -> Vec<&str> {
        let mut found = Vec::new();
        let mut stack = vec![&self.expr];
        while let Some(node) = stack.pop() {
            if let Expr::Failed { reason, .. } = node {
                found.push(reason.as_str());
            }
            let mut children = node.children();
            children.reverse();
            stack.extend(children);
        }
        found
    }

    pub fn into_result(self) -> Result<Expr> {
        if self.success {
            return Ok(self.expr);
        }
        let reason = self
            .expr
            .first_failure()
            .unwrap_or("binding failed")
            .to_string();
        Err(BindError::failed(self.expr.to_string(), reason))
    }
}

/// Resolves expressions relative to a subject twin
pub struct Binder<'a> {
    graph: &'a TwinGraph,
    ontology: &'a dyn ModelOntology,
    subject: NodeIndex,
    /// Current search root, moves during EACH and property access
    root: NodeIndex,
    env: Env,
    helpers: HelperVariables,
    reserved: FxHashSet<String>,
    max_fold_count: usize,
    fold_count: usize,
    unlimited_folds: bool,
    macro_depth: usize,
    flag: SuccessFlag,
}

impl<'a> Binder<'a> {
    pub fn new(graph: &'a TwinGraph, ontology: &'a dyn ModelOntology, subject: &str) -> Result<Self> {
        let subject = graph
            .index_of(subject)
            .ok_or_else(|| BindError::unknown_subject(subject))?;
        Ok(Self {
            graph,
            ontology,
            subject,
            root: subject,
            env: Env::new(),
            helpers: HelperVariables::new(),
            reserved: RESERVED_VARIABLES.iter().map(|s| s.to_string()).collect(),
            max_fold_count: DEFAULT_MAX_FOLD_COUNT,
            fold_count: 0,
            unlimited_folds: false,
            macro_depth: 0,
            flag: SuccessFlag::default(),
        })
    }

    pub fn with_env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    pub fn with_max_fold_count(mut self, max_fold_count: usize) -> Self {
        self.max_fold_count = max_fold_count;
        self
    }

    /// Extra names to leave untouched for the runtime to assign
    pub fn with_reserved<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.reserved
            .extend(names.into_iter().map(|n| n.as_ref().to_ascii_uppercase()));
        self
    }

    pub fn subject(&self) -> &Twin {
        self.graph.node(self.subject)
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Env {
        &mut self.env
    }

    pub fn helpers(&self) -> &HelperVariables {
        &self.helpers
    }

    pub fn into_parts(self) -> (Env, HelperVariables) {
        (self.env, self.helpers)
    }

    /// Bind one expression against the subject
    ///
    /// Helper variables registered along the way accumulate across calls, so
    /// a rule's fields can be bound one after another with the same binder.
    pub fn bind(&mut self, expr: &Expr) -> BindOutcome {
        self.flag = SuccessFlag::default();
        self.fold_count = 0;
        self.root = self.subject;
        let bound = transform(expr, self);
        let success = self.flag.get() && !bound.contains_failure();
        BindOutcome {
            expr: bound,
            success,
        }
    }

    // ========================================================================
    // Sub-visits
    // ========================================================================

    /// Run a sub-visit that may fail without failing the whole bind
    ///
    /// Helper variables registered by a failed attempt are discarded.
    fn attempt<F>(&mut self, visit: F) -> Option<Expr>
    where
        F: FnOnce(&mut Self) -> Expr,
    {
        let outer = self.flag;
        let mark = self.helpers.len();
        self.flag = SuccessFlag::default();
        let bound = visit(self);
        let ok = self.flag.get();
        self.flag = outer;
        if ok {
            Some(bound)
        } else {
            self.helpers.truncate(mark);
            None
        }
    }

    fn bind_unlimited(&mut self, expr: &Expr) -> Expr {
        let previous = std::mem::replace(&mut self.unlimited_folds, true);
        let bound = transform(expr, self);
        self.unlimited_folds = previous;
        bound
    }

    fn with_root<F>(&mut self, root: NodeIndex, visit: F) -> Expr
    where
        F: FnOnce(&mut Self) -> Expr,
    {
        let previous = std::mem::replace(&mut self.root, root);
        let bound = visit(self);
        self.root = previous;
        bound
    }

    /// Count one array expansion, false once the ceiling is passed
    fn count_fold(&mut self) -> bool {
        self.fold_count += 1;
        self.unlimited_folds || self.fold_count <= self.max_fold_count
    }

    fn fold_ceiling(&mut self, original: &Expr) -> Expr {
        let reason = format!("Max array count of {} reached", self.max_fold_count);
        self.fail(&reason, original.clone())
    }

    /// Distribute a node over the first array among its bound children
    ///
    /// `a + {x, y}` becomes `{a + x, a + y}`. Remaining arrays are folded
    /// recursively.
    fn fold(
        &mut self,
        children: Vec<Expr>,
        original: &Expr,
        build: &dyn Fn(Vec<Expr>) -> Expr,
    ) -> Expr {
        let Some(position) = children.iter().position(|c| matches!(c, Expr::Array(_))) else {
            return build(children);
        };
        let Expr::Array(items) = &children[position] else {
            return build(children);
        };

        let mut folded = Vec::with_capacity(items.len());
        for item in items.clone() {
            if !self.count_fold() {
                return self.fold_ceiling(original);
            }
            let mut next = children.clone();
            next[position] = item;
            folded.push(self.fold(next, original, build));
        }
        Expr::Array(folded)
    }

    // ========================================================================
    // Graph search
    // ========================================================================

    fn twin_expr(&self, idx: NodeIndex) -> Expr {
        let twin = self.graph.node(idx);
        Expr::Twin(TwinRef {
            id: twin.id.clone(),
            model_id: twin.model_id.clone(),
            signal_id: twin.trend_id.clone(),
            unit: twin.unit.clone(),
        })
    }

    /// One match binds to the twin, several to an ambiguous array
    fn matches_expr(&self, mut nodes: Vec<NodeIndex>) -> Expr {
        if nodes.len() == 1 {
            return self.twin_expr(nodes.swap_remove(0));
        }
        Expr::Array(nodes.into_iter().map(|n| self.twin_expr(n)).collect())
    }

    fn find_by_model(&self, model: &str) -> Vec<NodeIndex> {
        let direct = self.graph.direct_relations(self.root);
        let found = self.match_model(&direct, model);
        if !found.is_empty() {
            return found;
        }
        self.nearest(|binder, group| binder.match_model(group, model))
    }

    /// Exact model matches win over inherited ones
    fn match_model(&self, candidates: &[NodeIndex], model: &str) -> Vec<NodeIndex> {
        let exact: Vec<NodeIndex> = candidates
            .iter()
            .copied()
            .filter(|&n| self.graph.node(n).model_id == model)
            .collect();
        if !exact.is_empty() {
            return exact;
        }
        candidates
            .iter()
            .copied()
            .filter(|&n| self.ontology.inherits_from(&self.graph.node(n).model_id, model))
            .collect()
    }

    /// First non-empty result over hop-distance groups around the root
    fn nearest<F>(&self, select: F) -> Vec<NodeIndex>
    where
        F: Fn(&Self, &[NodeIndex]) -> Vec<NodeIndex>,
    {
        for group in self.graph.nodes_by_distance(self.root) {
            let found = select(self, &group);
            if !found.is_empty() {
                return found;
            }
        }
        Vec::new()
    }

    fn find_by_tags(&self, tags: &[&str]) -> Vec<NodeIndex> {
        let graph = self.graph;
        if graph.node(self.root).has_all_tags(tags) {
            return vec![self.root];
        }
        self.nearest(|_, group| {
            group
                .iter()
                .copied()
                .filter(|&n| graph.node(n).has_all_tags(tags))
                .collect()
        })
    }

    fn find_by_suffix(&self, suffix: &str) -> Vec<NodeIndex> {
        self.graph
            .twins()
            .filter(|(_, twin)| twin.id.ends_with(suffix))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn parent_of(&self, idx: NodeIndex) -> Option<NodeIndex> {
        [
            RelationKind::IsCapabilityOf,
            RelationKind::IsPartOf,
            RelationKind::LocatedIn,
        ]
        .iter()
        .find_map(|kind| self.graph.follow(idx, kind).first().copied())
    }

    fn is_reserved(&self, name: &str) -> bool {
        self.reserved.contains(&name.to_ascii_uppercase())
    }

    // ========================================================================
    // Properties
    // ========================================================================

    fn property_of(&mut self, target: Expr, name: &str) -> Expr {
        match target {
            Expr::Twin(twin) => self.twin_property(&twin, name),
            Expr::Array(items) => {
                let original = Expr::Property {
                    child: Box::new(Expr::Array(items.clone())),
                    name: name.to_string(),
                };
                let mut results = Vec::new();
                for item in items {
                    match self.attempt(|binder| binder.property_of(item, name)) {
                        Some(Expr::Array(nested)) => results.extend(nested),
                        Some(bound) => results.push(bound),
                        None => {},
                    }
                }
                match results.len() {
                    0 => {
                        let reason = format!("{} has no valid children", original);
                        self.fail(&reason, original)
                    },
                    1 => results.swap_remove(0),
                    _ => Expr::Array(results),
                }
            },
            failed @ Expr::Failed { .. } => Expr::Property {
                child: Box::new(failed),
                name: name.to_string(),
            },
            other => {
                let reason = format!("Cannot read {} of {}", name, other);
                self.fail(
                    &reason,
                    Expr::Property {
                        child: Box::new(other),
                        name: name.to_string(),
                    },
                )
            },
        }
    }

    fn twin_property(&mut self, twin: &TwinRef, name: &str) -> Expr {
        let original = Expr::Property {
            child: Box::new(Expr::Twin(twin.clone())),
            name: name.to_string(),
        };
        let graph = self.graph;
        let Some(idx) = graph.index_of(&twin.id) else {
            let reason = format!("Twin {} is not in the graph", twin.id);
            return self.fail(&reason, original);
        };

        if name.eq_ignore_ascii_case("parent") {
            return match self.parent_of(idx) {
                Some(parent) => self.twin_expr(parent),
                None => {
                    let reason = format!("{} has no parent", twin.id);
                    self.fail(&reason, original)
                },
            };
        }

        if let Some(value) = graph.node(idx).property(name) {
            return match json_constant(value) {
                Some(constant) => constant,
                None => {
                    let reason = format!("Property {} of {} is not a scalar", name, twin.id);
                    self.fail(&reason, original)
                },
            };
        }

        // Anything else is a name relative to the twin
        self.with_root(idx, |binder| binder.visit_variable(name, None))
    }

    // ========================================================================
    // Special functions
    // ========================================================================

    fn bind_option(&mut self, args: &[Expr]) -> Expr {
        for arg in args {
            if let Some(bound) = self.attempt(|binder| transform(arg, binder)) {
                return bound;
            }
        }
        self.fail(
            "No OPTION could be bound",
            Expr::call("OPTION", args.to_vec()),
        )
    }

    fn bind_tolerant_option(&mut self, args: &[Expr]) -> Expr {
        let mut bound: Vec<Expr> = args
            .iter()
            .filter_map(|arg| self.attempt(|binder| transform(arg, binder)))
            .collect();
        if bound.is_empty() {
            return self.fail(
                "No TOLERANTOPTION could be bound",
                Expr::call("TOLERANTOPTION", args.to_vec()),
            );
        }
        if bound.iter().all(Expr::is_constant) {
            return bound.swap_remove(0);
        }
        Expr::call("TOLERANTOPTION", bound)
    }

    fn bind_exists(&mut self, args: &[Expr]) -> Expr {
        let exists = match args {
            [arg] => self.attempt(|binder| transform(arg, binder)).is_some(),
            _ => false,
        };
        Expr::boolean(exists)
    }

    fn count_bindings(&mut self, args: &[Expr]) -> Expr {
        let [arg] = args else {
            return self.fail(
                "Argument expected",
                Expr::call("COUNT_BINDINGS", args.to_vec()),
            );
        };
        let previous = std::mem::replace(&mut self.unlimited_folds, true);
        let bound = self.attempt(|binder| transform(arg, binder));
        self.unlimited_folds = previous;

        let count = match bound {
            Some(Expr::Array(items)) => items.len(),
            Some(_) => 1,
            None => 0,
        };
        Expr::number(count as f64)
    }

    fn bind_conversion(&mut self, conversion: Conversion, name: &str, args: &[Expr]) -> Expr {
        let original = Expr::call(name, args.to_vec());
        let [arg] = args else {
            return self.fail("Argument expected", original);
        };
        let bound = transform(arg, self);
        if bound.contains_failure() {
            return Expr::call(name, vec![bound]);
        }
        self.convert(conversion, bound, &original)
    }

    fn convert(&mut self, conversion: Conversion, bound: Expr, original: &Expr) -> Expr {
        match bound {
            Expr::Array(items) => Expr::Array(
                items
                    .into_iter()
                    .map(|item| self.convert(conversion, item, original))
                    .collect(),
            ),
            other => match conversion.apply(other) {
                Ok(converted) => converted,
                Err(reason) => self.fail(&reason, original.clone()),
            },
        }
    }

    fn expand_macro(&mut self, function: &Macro, args: &[Expr]) -> Expr {
        let original = Expr::call(function.name.clone(), args.to_vec());
        if function.parameters.len() != args.len() {
            let reason = format!(
                "{} expects {} arguments, got {}",
                function.name,
                function.parameters.len(),
                args.len()
            );
            return self.fail(&reason, original);
        }
        if self.macro_depth >= MAX_MACRO_DEPTH {
            let reason = format!("{} expands too deeply", function.name);
            return self.fail(&reason, original);
        }

        let mut body = function.body.clone();
        for (parameter, arg) in function.parameters.iter().zip(args) {
            let bound = transform(arg, self);
            body = transform(&body, &mut ReplaceVariable::new(parameter, &bound));
        }

        self.macro_depth += 1;
        let expanded = transform(&body, self);
        self.macro_depth -= 1;
        expanded
    }

    fn bind_each(&mut self, args: &[Expr]) -> Expr {
        let original = Expr::call("EACH", args.to_vec());
        let [enumerable, Expr::Variable { name: variable, .. }, body] = args else {
            return self.fail("EACH expects (enumerable, variable, body)", original);
        };

        let items = match self.bind_unlimited(enumerable) {
            Expr::Array(items) => items,
            failed @ Expr::Failed { .. } => {
                return Expr::call("EACH", vec![failed, args[1].clone(), body.clone()])
            },
            single => vec![single],
        };

        let mut results = Vec::new();
        let mut failed = 0usize;
        for item in items {
            let root = match &item {
                Expr::Twin(twin) => self.graph.index_of(&twin.id).unwrap_or(self.root),
                _ => self.root,
            };
            self.env.push();
            self.env.assign_expr(variable.clone(), item);
            let bound = self.attempt(|binder| binder.with_root(root, |b| transform(body, b)));
            self.env.pop();
            match bound {
                Some(bound) => results.push(bound),
                None => failed += 1,
            }
        }

        match results.len() {
            0 => {
                let reason = if failed > 0 {
                    format!("EACH Argument is empty. {} failed.", failed)
                } else {
                    "EACH Argument is empty".to_string()
                };
                self.fail(&reason, original)
            },
            1 => results.swap_remove(0),
            _ => Expr::Array(results),
        }
    }

    fn bind_is(&mut self, args: &[Expr]) -> Expr {
        let original = Expr::call("IS", args.to_vec());
        let [target, model] = args else {
            return self.fail("IS expects (twin, model)", original);
        };
        let Some(model) = name_of(model) else {
            return self.fail("IS expects a model id", original);
        };
        let model = normalize_model_id(&model);
        let bound = transform(target, self);
        self.is_model(bound, &model, &original)
    }

    fn is_model(&mut self, bound: Expr, model: &str, original: &Expr) -> Expr {
        match bound {
            Expr::Twin(twin) => {
                Expr::boolean(self.ontology.inherits_from_or_equal(&twin.model_id, model))
            },
            Expr::Array(items) => Expr::Array(
                items
                    .into_iter()
                    .map(|item| self.is_model(item, model, original))
                    .collect(),
            ),
            failed @ Expr::Failed { .. } => failed,
            other => {
                let reason = format!("IS expects a twin, got {}", other);
                self.fail(&reason, original.clone())
            },
        }
    }

    /// `TIMER(cond[, unit])` accumulates elapsed time while `cond` holds
    ///
    /// The accumulator is a helper variable that reads its own previous value:
    /// `cond ? IFNAN(key, 0) + DELTA_TIME_S / k : 0`.
    fn bind_timer(&mut self, args: &[Expr]) -> Expr {
        let original = Expr::call("TIMER", args.to_vec());
        let (condition, divisor) = match args {
            [condition] => (condition, Some(1.0)),
            [condition, unit] => (condition, name_of(unit).and_then(|u| timer_divisor(&u))),
            _ => return self.fail("TIMER expects (condition[, unit])", original),
        };
        let Some(divisor) = divisor else {
            return self.fail("Invalid TIMER unit", original);
        };

        let bound = transform(condition, self);
        let key = format!("{}_timer", helper_key(&bound));
        let accumulated = Expr::binary(
            BinaryOp::Add,
            Expr::call("IFNAN", vec![Expr::variable(key.clone()), Expr::number(0.0)]),
            Expr::binary(
                BinaryOp::Divide,
                Expr::variable("DELTA_TIME_S"),
                Expr::number(divisor),
            ),
        );
        self.helpers
            .insert(key.clone(), Expr::ternary(bound, accumulated, Expr::number(0.0)));
        Expr::variable(key)
    }

    /// Aggregates see whole arrays, so their arguments are never folded
    fn bind_aggregate(&mut self, name: &str, args: &[Expr]) -> Expr {
        let bound: Vec<Expr> = args.iter().map(|arg| self.bind_unlimited(arg)).collect();
        let collapsed = match (ArrayFunction::from_name(name), bound.as_slice()) {
            (Some(ArrayFunction::All), [Expr::Array(items)]) => collapse(BinaryOp::And, items),
            (Some(ArrayFunction::Any), [Expr::Array(items)]) => collapse(BinaryOp::Or, items),
            _ => None,
        };
        collapsed.unwrap_or_else(|| Expr::call(name, bound))
    }

    fn temporal_over(
        &mut self,
        op: TemporalOp,
        bound: Expr,
        window: Option<TimeDelta>,
        offset: TimeDelta,
        original: &Expr,
    ) -> Expr {
        let rebuild = |child: Expr| Expr::Temporal {
            op,
            child: Box::new(child),
            window,
            offset,
        };
        match bound {
            Expr::Twin(_) | Expr::Variable { .. } | Expr::Failed { .. } => rebuild(bound),
            Expr::Array(items) => {
                let mut folded = Vec::with_capacity(items.len());
                for item in items {
                    if !self.count_fold() {
                        return self.fold_ceiling(original);
                    }
                    folded.push(self.temporal_over(op, item, window, offset, original));
                }
                Expr::Array(folded)
            },
            // History of a computed value is kept under a helper variable
            other => {
                let key = self.helpers.register(other);
                debug!(helper = %key, op = op.name(), "Registered temporal helper variable");
                rebuild(Expr::variable(key))
            },
        }
    }
}

impl Visitor for Binder<'_> {
    fn flag(&self) -> &SuccessFlag {
        &self.flag
    }

    fn flag_mut(&mut self) -> &mut SuccessFlag {
        &mut self.flag
    }

    fn visit_variable(&mut self, name: &str, unit: Option<&str>) -> Expr {
        let unresolved = Expr::Variable {
            name: name.to_string(),
            unit: unit.map(str::to_string),
        };
        let graph = self.graph;

        if name.eq_ignore_ascii_case("this") || name == graph.node(self.root).id {
            return self.twin_expr(self.root);
        }
        if is_helper(name) {
            return unresolved;
        }

        match self.env.get(name) {
            Some(EnvEntry::Expr(expr)) => {
                if let Some(reason) = expr.first_failure() {
                    let reason = format!("Variable {} failed to bind: {}", name, reason);
                    return self.fail(&reason, unresolved);
                }
                return expr.clone();
            },
            Some(EnvEntry::Value(_)) => return unresolved,
            None => {},
        }
        if let Some(function) = self.env.function(name).cloned() {
            return self.expand_macro(&function, &[]);
        }
        if self.is_reserved(name) {
            return unresolved;
        }

        if is_model_id(name) {
            let model = normalize_model_id(name);
            let found = self.find_by_model(&model);
            debug!(variable = name, matches = found.len(), "Resolved model reference");
            if found.is_empty() {
                let reason = format!("No twin matches found for {}", name);
                return self.fail(&reason, unresolved);
            }
            return self.matches_expr(found);
        }

        if !name.starts_with("dtmi:") && !name.contains(' ') && name.len() >= MIN_TWIN_ID_LENGTH {
            if let Some(idx) = graph.index_of(name) {
                return self.twin_expr(idx);
            }
        }

        let tags: Vec<&str> = name.split_whitespace().collect();
        let found = self.find_by_tags(&tags);
        if !found.is_empty() {
            let bound = self.matches_expr(found);
            if self.root == self.subject {
                self.env.assign_expr(name, bound.clone());
            }
            return bound;
        }

        if !name.is_empty() {
            let found = self.find_by_suffix(name);
            if !found.is_empty() {
                return self.matches_expr(found);
            }
        }

        let reason = format!("Could not resolve variable {}", name);
        self.fail(&reason, unresolved)
    }

    fn visit_property(&mut self, child: &Expr, name: &str) -> Expr {
        let bound = transform(child, self);
        self.property_of(bound, name)
    }

    fn visit_call(&mut self, name: &str, args: &[Expr]) -> Expr {
        let upper = name.to_ascii_uppercase();
        match upper.as_str() {
            "OPTION" => return self.bind_option(args),
            "TOLERANTOPTION" => return self.bind_tolerant_option(args),
            "EXISTS" => return self.bind_exists(args),
            "COUNT_BINDINGS" => return self.count_bindings(args),
            "EACH" => return self.bind_each(args),
            "IS" => return self.bind_is(args),
            "TIMER" => return self.bind_timer(args),
            "FAILED" => return self.fail("FAILED", Expr::call(name, args.to_vec())),
            _ => {},
        }

        if let Some(conversion) = Conversion::from_name(&upper) {
            return self.bind_conversion(conversion, name, args);
        }
        if let Some(function) = self.env.function(&upper).cloned() {
            return self.expand_macro(&function, args);
        }
        if takes_arrays(&upper) {
            return self.bind_aggregate(&upper, args);
        }

        let original = Expr::call(name, args.to_vec());
        let bound: Vec<Expr> = args.iter().map(|arg| transform(arg, self)).collect();
        self.fold(bound, &original, &|args| Expr::call(name, args))
    }

    fn visit_unary(&mut self, op: UnaryOp, child: &Expr) -> Expr {
        let original = Expr::unary(op, child.clone());
        let bound = transform(child, self);
        if op == UnaryOp::Not && matches!(bound, Expr::Array(_)) {
            return self.fail("Cannot negate an array, use ALL or ANY", original);
        }
        self.fold(vec![bound], &original, &|children| {
            let [child] = first_n::<1>(children);
            Expr::unary(op, child)
        })
    }

    fn visit_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr, unit: Option<&str>) -> Expr {
        let original = Expr::Binary {
            op,
            left: Box::new(left.clone()),
            right: Box::new(right.clone()),
            unit: unit.map(str::to_string),
        };
        let left = transform(left, self);
        let right = transform(right, self);
        if op.is_logical()
            && (matches!(left, Expr::Array(_)) || matches!(right, Expr::Array(_)))
        {
            let reason = format!("Cannot apply {} to an array, use ALL or ANY", op.symbol());
            return self.fail(&reason, original);
        }
        self.fold(vec![left, right], &original, &|children| {
            let [left, right] = first_n::<2>(children);
            Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                unit: unit.map(str::to_string),
            }
        })
    }

    fn visit_ternary(&mut self, condition: &Expr, then: &Expr, otherwise: &Expr) -> Expr {
        let original = Expr::ternary(condition.clone(), then.clone(), otherwise.clone());
        let children = vec![
            transform(condition, self),
            transform(then, self),
            transform(otherwise, self),
        ];
        self.fold(children, &original, &|children| {
            let [condition, then, otherwise] = first_n::<3>(children);
            Expr::ternary(condition, then, otherwise)
        })
    }

    fn visit_temporal(
        &mut self,
        op: TemporalOp,
        child: &Expr,
        window: Option<TimeDelta>,
        offset: TimeDelta,
    ) -> Expr {
        // Runtime-assigned names keep their own buffers
        if let Expr::Variable { name, .. } = child {
            if is_helper(name) || self.is_reserved(name) || self.env.value(name).is_some() {
                return Expr::Temporal {
                    op,
                    child: Box::new(child.clone()),
                    window,
                    offset,
                };
            }
        }
        let original = Expr::Temporal {
            op,
            child: Box::new(child.clone()),
            window,
            offset,
        };
        let bound = transform(child, self);
        self.temporal_over(op, bound, window, offset, &original)
    }
}

/// Name carried by a bare identifier or a text literal
fn name_of(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Variable { name, .. } => Some(name.clone()),
        Expr::Constant(Constant::Text(text)) => Some(text.clone()),
        _ => None,
    }
}

fn timer_divisor(unit: &str) -> Option<f64> {
    match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "second" | "seconds" => Some(1.0),
        "m" | "min" | "minute" | "minutes" => Some(60.0),
        "h" | "hour" | "hours" => Some(3600.0),
        "d" | "day" | "days" => Some(86400.0),
        _ => None,
    }
}

fn json_constant(value: &serde_json::Value) -> Option<Expr> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().map(Expr::number),
        serde_json::Value::Bool(b) => Some(Expr::boolean(*b)),
        serde_json::Value::String(s) => Some(Expr::text(s.clone())),
        _ => None,
    }
}

/// ALL/ANY over a short array become a chain of And/Or
fn collapse(op: BinaryOp, items: &[Expr]) -> Option<Expr> {
    match items.len() {
        0 => Some(Expr::boolean(false)),
        n if n < 4 => items
            .iter()
            .cloned()
            .reduce(|acc, item| Expr::binary(op, acc, item)),
        _ => None,
    }
}

/// Split folded children back into a fixed arity
fn first_n<const N: usize>(children: Vec<Expr>) -> [Expr; N] {
    let mut parts = children.into_iter();
    std::array::from_fn(|_| parts.next().unwrap_or(Expr::Constant(Constant::Null)))
}
