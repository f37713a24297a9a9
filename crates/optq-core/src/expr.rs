//! # Interned Expression Model
//!
//! Expressions form a deduplicated DAG: every structurally equal subtree is
//! interned to one arena node, so expression equality is id equality and a
//! column is usable as a bitset member. Nodes are immutable once interned.
//!
//! Each node carries a [`Value`]: the expression's type plus an estimated
//! cardinality (distinct-count for columns and keys, row count where the
//! expression stands for a relation's worth of values).

use crate::context::{self, Name, PathId};
use crate::object::{ExprId, ObjectId, PlanObjectSet};
use crate::types::{DataType, ScalarValue};
use crate::error::Result;

/// Type and estimated value cardinality of an expression.
#[derive(Debug, Clone)]
pub struct Value {
    pub data_type: DataType,
    /// Estimated number of distinct values.
    pub cardinality: f64,
}

impl Value {
    pub fn new(data_type: DataType, cardinality: f64) -> Self {
        Self {
            data_type,
            cardinality,
        }
    }

    pub fn untyped_count(cardinality: f64) -> Self {
        Self::new(DataType::Bigint, cardinality)
    }
}

/// Expression variants. Operand ids always refer to already-interned nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExprKind {
    /// A column of a base or derived table. Subfield-pushdown columns carry
    /// the access path and a backlink to the top-level column they project
    /// from.
    Column {
        name: Name,
        relation: ObjectId,
        path: Option<PathId>,
        top_column: Option<ExprId>,
    },
    Literal(ScalarValue),
    Call {
        func: Name,
        args: Vec<ExprId>,
    },
    /// Struct field access over `base`.
    Field {
        base: ExprId,
        field: Option<Name>,
        index: u32,
    },
    Lambda {
        args: Vec<ExprId>,
        body: ExprId,
    },
    /// Aggregate function application, including the optional filter
    /// condition and per-aggregate ordering.
    Aggregate {
        func: Name,
        args: Vec<ExprId>,
        condition: Option<ExprId>,
        distinct: bool,
        order: Vec<ExprId>,
    },
}

#[derive(Debug, Clone)]
pub struct ExprNode {
    pub id: ExprId,
    pub kind: ExprKind,
    pub value: Value,
}

impl ExprNode {
    pub fn is_column(&self) -> bool {
        matches!(self.kind, ExprKind::Column { .. })
    }
}

pub fn intern_column(
    name: Name,
    relation: ObjectId,
    value: Value,
    path: Option<PathId>,
    top_column: Option<ExprId>,
) -> Result<ExprId> {
    context::intern_expr(
        ExprKind::Column {
            name,
            relation,
            path,
            top_column,
        },
        value,
    )
}

pub fn intern_literal(value: ScalarValue, data_type: DataType) -> Result<ExprId> {
    context::intern_expr(ExprKind::Literal(value), Value::new(data_type, 1.0))
}

pub fn intern_call(func: Name, args: Vec<ExprId>, value: Value) -> Result<ExprId> {
    context::intern_expr(ExprKind::Call { func, args }, value)
}

/// True if `id` is a call to the named function.
pub fn is_call_to(id: ExprId, name: &str) -> bool {
    match context::expr(id).kind {
        ExprKind::Call { func, .. } => func == context::intern_name(name),
        _ => false,
    }
}

/// Splits top-level ANDs into a flat conjunct list. A non-AND expression is
/// its own single conjunct.
pub fn split_conjuncts(id: ExprId) -> Vec<ExprId> {
    let node = context::expr(id);
    if let ExprKind::Call { func, args } = &node.kind {
        if *func == context::intern_name("and") {
            return args.iter().flat_map(|&a| split_conjuncts(a)).collect();
        }
    }
    vec![id]
}

/// Adds all column ids referenced by the expression subtree to `out`.
pub fn collect_columns(id: ExprId, out: &mut PlanObjectSet) {
    let node = context::expr(id);
    match &node.kind {
        ExprKind::Column { .. } => out.add(id),
        ExprKind::Literal(_) => {}
        ExprKind::Call { args, .. } => {
            for &a in args {
                collect_columns(a, out);
            }
        }
        ExprKind::Field { base, .. } => collect_columns(*base, out),
        ExprKind::Lambda { body, .. } => collect_columns(*body, out),
        ExprKind::Aggregate {
            args,
            condition,
            order,
            ..
        } => {
            for &a in args {
                collect_columns(a, out);
            }
            if let Some(c) = condition {
                collect_columns(*c, out);
            }
            for &o in order {
                collect_columns(o, out);
            }
        }
    }
}

pub fn columns_of(id: ExprId) -> PlanObjectSet {
    let mut set = PlanObjectSet::new();
    collect_columns(id, &mut set);
    set
}

pub fn columns_of_all(ids: &[ExprId]) -> PlanObjectSet {
    let mut set = PlanObjectSet::new();
    for &id in ids {
        collect_columns(id, &mut set);
    }
    set
}

/// The set of relations (base/derived table ids) the expression's columns
/// belong to.
pub fn relations_of(id: ExprId) -> PlanObjectSet {
    let mut out = PlanObjectSet::new();
    for column in columns_of(id).iter() {
        if let ExprKind::Column { relation, .. } = context::expr(column).kind {
            out.add(relation);
        }
    }
    out
}

/// If every column of the expression comes from one relation, that relation.
pub fn single_relation(id: ExprId) -> Option<ObjectId> {
    let relations = relations_of(id);
    let mut iter = relations.iter();
    match (iter.next(), iter.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    }
}

/// Renders an expression. When `with_cnames` is false, correlation names are
/// suppressed so that logically equivalent nodes print identically; history
/// cache keys use this form.
pub fn expr_text(id: ExprId, with_cnames: bool) -> String {
    let node = context::expr(id);
    match &node.kind {
        ExprKind::Column { name, relation, .. } => {
            if with_cnames {
                if let Some(cname) = context::relation_cname(*relation) {
                    return format!("{}.{}", context::name_str(cname), context::name_str(*name));
                }
            }
            context::name_str(*name)
        }
        ExprKind::Literal(v) => v.to_string(),
        ExprKind::Call { func, args } => {
            let args: Vec<String> = args.iter().map(|&a| expr_text(a, with_cnames)).collect();
            format!("{}({})", context::name_str(*func), args.join(", "))
        }
        ExprKind::Field { base, field, index } => match field {
            Some(f) => format!(
                "{}.{}",
                expr_text(*base, with_cnames),
                context::name_str(*f)
            ),
            None => format!("{}.{}", expr_text(*base, with_cnames), index),
        },
        ExprKind::Lambda { args, body } => {
            let args: Vec<String> = args.iter().map(|&a| expr_text(a, with_cnames)).collect();
            format!("({}) -> {}", args.join(", "), expr_text(*body, with_cnames))
        }
        ExprKind::Aggregate {
            func,
            args,
            condition,
            distinct,
            ..
        } => {
            let args: Vec<String> = args.iter().map(|&a| expr_text(a, with_cnames)).collect();
            let mut text = format!(
                "{}({}{})",
                context::name_str(*func),
                if *distinct { "distinct " } else { "" },
                args.join(", ")
            );
            if let Some(c) = condition {
                text.push_str(&format!(" filter ({})", expr_text(*c, with_cnames)));
            }
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextGuard;

    fn column(name: &str, relation: ObjectId) -> ExprId {
        intern_column(
            context::intern_name(name),
            relation,
            Value::new(DataType::Bigint, 100.0),
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_expr_dedup() {
        let _guard = ContextGuard::install();
        let rel = ObjectId(0);
        let a = column("a", rel);
        let b = column("a", rel);
        assert_eq!(a, b);

        let lit = intern_literal(ScalarValue::Int64(7), DataType::Bigint).unwrap();
        let gt = context::intern_name("gt");
        let c1 = intern_call(gt, vec![a, lit], Value::new(DataType::Boolean, 2.0)).unwrap();
        let c2 = intern_call(gt, vec![b, lit], Value::new(DataType::Boolean, 2.0)).unwrap();
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_split_conjuncts() {
        let _guard = ContextGuard::install();
        let rel = ObjectId(0);
        let a = column("a", rel);
        let b = column("b", rel);
        let and = context::intern_name("and");
        let bool_val = Value::new(DataType::Boolean, 2.0);
        let inner = intern_call(and, vec![a, b], bool_val.clone()).unwrap();
        let c = column("c", rel);
        let outer = intern_call(and, vec![inner, c], bool_val).unwrap();
        assert_eq!(split_conjuncts(outer), vec![a, b, c]);
    }

    #[test]
    fn test_collect_columns() {
        let _guard = ContextGuard::install();
        let rel = ObjectId(0);
        let a = column("a", rel);
        let b = column("b", rel);
        let plus = context::intern_name("plus");
        let sum = intern_call(plus, vec![a, b], Value::new(DataType::Bigint, 100.0)).unwrap();
        let cols = columns_of(sum);
        assert!(cols.contains(a));
        assert!(cols.contains(b));
        assert_eq!(cols.len(), 2);
    }
}
