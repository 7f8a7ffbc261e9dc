//! Tree rewriting framework
//!
//! A [`Visitor`] has one handler per node variant. Every handler defaults to
//! "rewrite the children, rebuild the same variant", so concrete visitors only
//! override the variants they care about. [`transform`] is the single
//! dispatcher.
//!
//! Failure is reported through a [`SuccessFlag`], never through panics:
//! callers check [`Visitor::success`] after visiting.

use crate::ast::{BinaryOp, Constant, Expr, TemporalOp, TwinRef, UnaryOp};
use chrono::TimeDelta;

/// Monotonic success flag, starts true and can only go false
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuccessFlag(bool);

impl Default for SuccessFlag {
    fn default() -> Self {
        Self(true)
    }
}

impl SuccessFlag {
    pub fn get(&self) -> bool {
        self.0
    }

    pub fn fail(&mut self) {
        self.0 = false;
    }

    /// Fold in the outcome of a sub-visit
    pub fn merge(&mut self, other: bool) {
        if !other {
            self.0 = false;
        }
    }
}

/// Tree visitor with reconstructing defaults
pub trait Visitor {
    fn flag(&self) -> &SuccessFlag;

    fn flag_mut(&mut self) -> &mut SuccessFlag;

    fn success(&self) -> bool {
        self.flag().get()
    }

    /// Mark the visit failed and wrap the offending node
    fn fail(&mut self, reason: &str, expr: Expr) -> Expr {
        self.flag_mut().fail();
        Expr::failed(reason, expr)
    }

    fn visit_constant(&mut self, value: &Constant) -> Expr {
        Expr::Constant(value.clone())
    }

    fn visit_variable(&mut self, name: &str, unit: Option<&str>) -> Expr {
        Expr::Variable {
            name: name.to_string(),
            unit: unit.map(str::to_string),
        }
    }

    fn visit_property(&mut self, child: &Expr, name: &str) -> Expr {
        walk_property(self, child, name)
    }

    fn visit_call(&mut self, name: &str, args: &[Expr]) -> Expr {
        walk_call(self, name, args)
    }

    fn visit_unary(&mut self, op: UnaryOp, child: &Expr) -> Expr {
        walk_unary(self, op, child)
    }

    fn visit_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr, unit: Option<&str>) -> Expr {
        walk_binary(self, op, left, right, unit)
    }

    fn visit_ternary(&mut self, condition: &Expr, then: &Expr, otherwise: &Expr) -> Expr {
        walk_ternary(self, condition, then, otherwise)
    }

    fn visit_array(&mut self, items: &[Expr]) -> Expr {
        walk_array(self, items)
    }

    fn visit_temporal(
        &mut self,
        op: TemporalOp,
        child: &Expr,
        window: Option<TimeDelta>,
        offset: TimeDelta,
    ) -> Expr {
        walk_temporal(self, op, child, window, offset)
    }

    fn visit_twin(&mut self, twin: &TwinRef) -> Expr {
        Expr::Twin(twin.clone())
    }

    /// Failed subtrees are not entered, but they always fail the visit
    fn visit_failed(&mut self, reason: &str, inner: &Expr) -> Expr {
        self.flag_mut().fail();
        Expr::failed(reason, inner.clone())
    }
}

/// Dispatch a node to the matching visitor handler
pub fn transform<V: Visitor + ?Sized>(expr: &Expr, visitor: &mut V) -> Expr {
    match expr {
        Expr::Constant(value) => visitor.visit_constant(value),
        Expr::Variable { name, unit } => visitor.visit_variable(name, unit.as_deref()),
        Expr::Property { child, name } => visitor.visit_property(child, name),
        Expr::Call { name, args } => visitor.visit_call(name, args),
        Expr::Unary { op, child } => visitor.visit_unary(*op, child),
        Expr::Binary {
            op,
            left,
            right,
            unit,
        } => visitor.visit_binary(*op, left, right, unit.as_deref()),
        Expr::Ternary {
            condition,
            then,
            otherwise,
        } => visitor.visit_ternary(condition, then, otherwise),
        Expr::Array(items) => visitor.visit_array(items),
        Expr::Temporal {
            op,
            child,
            window,
            offset,
        } => visitor.visit_temporal(*op, child, *window, *offset),
        Expr::Twin(twin) => visitor.visit_twin(twin),
        Expr::Failed { reason, inner } => visitor.visit_failed(reason, inner),
    }
}

// ============================================================================
// Default walks
// ============================================================================

pub fn walk_property<V: Visitor + ?Sized>(visitor: &mut V, child: &Expr, name: &str) -> Expr {
    Expr::Property {
        child: Box::new(transform(child, visitor)),
        name: name.to_string(),
    }
}

pub fn walk_call<V: Visitor + ?Sized>(visitor: &mut V, name: &str, args: &[Expr]) -> Expr {
    Expr::Call {
        name: name.to_string(),
        args: args.iter().map(|arg| transform(arg, visitor)).collect(),
    }
}

pub fn walk_unary<V: Visitor + ?Sized>(visitor: &mut V, op: UnaryOp, child: &Expr) -> Expr {
    Expr::unary(op, transform(child, visitor))
}

pub fn walk_binary<V: Visitor + ?Sized>(
    visitor: &mut V,
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    unit: Option<&str>,
) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(transform(left, visitor)),
        right: Box::new(transform(right, visitor)),
        unit: unit.map(str::to_string),
    }
}

pub fn walk_ternary<V: Visitor + ?Sized>(
    visitor: &mut V,
    condition: &Expr,
    then: &Expr,
    otherwise: &Expr,
) -> Expr {
    Expr::ternary(
        transform(condition, visitor),
        transform(then, visitor),
        transform(otherwise, visitor),
    )
}

pub fn walk_array<V: Visitor + ?Sized>(visitor: &mut V, items: &[Expr]) -> Expr {
    Expr::Array(items.iter().map(|item| transform(item, visitor)).collect())
}

pub fn walk_temporal<V: Visitor + ?Sized>(
    visitor: &mut V,
    op: TemporalOp,
    child: &Expr,
    window: Option<TimeDelta>,
    offset: TimeDelta,
) -> Expr {
    Expr::Temporal {
        op,
        child: Box::new(transform(child, visitor)),
        window,
        offset,
    }
}

// ============================================================================
// Stock visitors
// ============================================================================

/// Replaces every access to one variable with an expression
///
/// Used to expand macro bodies with their call arguments.
#[derive(Debug)]
pub struct ReplaceVariable<'a> {
    name: &'a str,
    replacement: &'a Expr,
    flag: SuccessFlag,
}

impl<'a> ReplaceVariable<'a> {
    pub fn new(name: &'a str, replacement: &'a Expr) -> Self {
        Self {
            name,
            replacement,
            flag: SuccessFlag::default(),
        }
    }
}

impl Visitor for ReplaceVariable<'_> {
    fn flag(&self) -> &SuccessFlag {
        &self.flag
    }

    fn flag_mut(&mut self) -> &mut SuccessFlag {
        &mut self.flag
    }

    fn visit_variable(&mut self, name: &str, unit: Option<&str>) -> Expr {
        if name == self.name {
            self.replacement.clone()
        } else {
            Expr::Variable {
                name: name.to_string(),
                unit: unit.map(str::to_string),
            }
        }
    }
}
