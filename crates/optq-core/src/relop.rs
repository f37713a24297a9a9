//! # Physical Relation Ops
//!
//! The physical plan nodes the enumerator builds and the lowering consumes.
//! Ops live in the arena; once installed they are immutable and shared
//! between plans (a memoized build side is reused by many candidates).
//!
//! Every op carries its output columns, its output [`Distribution`] and its
//! [`Cost`]. An index-lookup join is a `TableScan` with lookup `keys` and a
//! probe input rather than a separate join node.

use crate::context::{self, Name};
use crate::cost::Cost;
use crate::object::{ExprId, ObjectId, RelId};
use crate::types::{JoinType, OrderType, RowType, ScalarValue};
use serde::{Deserialize, Serialize};

/// Partitioning and ordering of an op's output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Distribution {
    /// Hash partition keys; empty means unpartitioned or see the flags.
    pub partition: Vec<ExprId>,
    pub order: Vec<ExprId>,
    pub order_types: Vec<OrderType>,
    /// All rows on a single node.
    pub is_gather: bool,
    /// Every row on every node.
    pub is_broadcast: bool,
}

impl Distribution {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn hashed(partition: Vec<ExprId>) -> Self {
        Self {
            partition,
            ..Default::default()
        }
    }

    pub fn gather() -> Self {
        Self {
            is_gather: true,
            ..Default::default()
        }
    }

    pub fn broadcast() -> Self {
        Self {
            is_broadcast: true,
            ..Default::default()
        }
    }

    pub fn with_order(mut self, order: Vec<ExprId>, order_types: Vec<OrderType>) -> Self {
        self.order = order;
        self.order_types = order_types;
        self
    }

    /// True if data partitioned this way is co-located for a join on `keys`:
    /// every partition key must appear among the join keys.
    pub fn is_colocated_for(&self, keys: &[ExprId]) -> bool {
        !self.partition.is_empty() && self.partition.iter().all(|k| keys.contains(k))
    }

    /// True if a repartition to `required` would be a no-op.
    pub fn satisfies(&self, required: &Distribution) -> bool {
        if required.is_gather {
            return self.is_gather;
        }
        if required.is_broadcast {
            return self.is_broadcast;
        }
        if required.partition.is_empty() {
            return true;
        }
        self.is_colocated_for(&required.partition) || self.is_broadcast
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMethod {
    Hash,
    Cross,
}

/// Distributed aggregation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggStep {
    Single,
    Partial,
    Final,
}

#[derive(Debug, Clone)]
pub enum RelKind {
    /// Leaf scan of a base table, or an index lookup when `keys` is
    /// non-empty (then the op has the probe side as input).
    TableScan {
        base_table: ObjectId,
        layout: usize,
        keys: Vec<ExprId>,
    },
    /// Literal rows.
    Values {
        row_type: RowType,
        rows: Vec<Vec<ScalarValue>>,
    },
    Filter {
        exprs: Vec<ExprId>,
    },
    /// Output column i is the value of `exprs[i]`, named by `columns[i]`.
    Project {
        exprs: Vec<ExprId>,
    },
    /// Inputs are [probe, build]; the build input is a `HashBuild` for hash
    /// joins.
    Join {
        method: JoinMethod,
        join_type: JoinType,
        left_keys: Vec<ExprId>,
        right_keys: Vec<ExprId>,
        filter: Vec<ExprId>,
        /// Expected right-side hits per probe row.
        fanout: f64,
    },
    HashBuild {
        keys: Vec<ExprId>,
        build_id: u32,
    },
    Aggregation {
        step: AggStep,
        grouping: Vec<ExprId>,
        /// Deduplicated `Aggregate` expressions.
        aggregates: Vec<ExprId>,
    },
    /// Order keys live in the op's distribution. A limit pushed into the
    /// order-by becomes a top-N during lowering; -1 means none.
    OrderBy {
        limit: i64,
        offset: i64,
    },
    Limit {
        offset: i64,
        count: i64,
    },
    /// Shuffle; the op's distribution is the target distribution.
    Repartition,
    UnionAll,
}

#[derive(Debug, Clone)]
pub struct RelNode {
    pub id: RelId,
    pub kind: RelKind,
    pub inputs: Vec<RelId>,
    /// Output columns, as column expression ids.
    pub columns: Vec<ExprId>,
    pub distribution: Distribution,
    pub cost: Cost,
}

impl RelNode {
    pub(crate) fn placeholder() -> Self {
        Self {
            id: ObjectId(0),
            kind: RelKind::UnionAll,
            inputs: Vec::new(),
            columns: Vec::new(),
            distribution: Distribution::any(),
            cost: Cost::default(),
        }
    }

    pub fn input(&self) -> RelId {
        self.inputs[0]
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            RelKind::TableScan { keys, .. } if !keys.is_empty() => "index-lookup",
            RelKind::TableScan { .. } => "scan",
            RelKind::Values { .. } => "values",
            RelKind::Filter { .. } => "filter",
            RelKind::Project { .. } => "project",
            RelKind::Join { .. } => "join",
            RelKind::HashBuild { .. } => "hash-build",
            RelKind::Aggregation { .. } => "aggregation",
            RelKind::OrderBy { .. } => "order-by",
            RelKind::Limit { .. } => "limit",
            RelKind::Repartition => "repartition",
            RelKind::UnionAll => "union-all",
        }
    }
}

fn names_text(names: &[Name]) -> String {
    names
        .iter()
        .map(|n| context::name_str(*n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renders an op tree with one node per line. Used for traces, the
/// determinism test and debugging.
pub fn rel_text(id: RelId, detail: bool) -> String {
    let mut out = String::new();
    append_rel_text(id, 0, detail, &mut out);
    out
}

fn append_rel_text(id: RelId, indent: usize, detail: bool, out: &mut String) {
    let node = context::rel(id);
    out.push_str(&"  ".repeat(indent));
    out.push_str(node.name());
    match &node.kind {
        RelKind::TableScan {
            base_table, keys, ..
        } => {
            let table = context::base_table(*base_table);
            out.push_str(&format!(
                " {} as {}",
                names_text(&[table.schema_table]),
                names_text(&[table.cname])
            ));
            if !keys.is_empty() {
                out.push_str(&format!(
                    " keys ({})",
                    keys.iter()
                        .map(|&k| crate::expr::expr_text(k, true))
                        .collect::<Vec<_>>()
                        .join(", ")
                ));
            }
        }
        RelKind::Join {
            method,
            join_type,
            left_keys,
            right_keys,
            ..
        } => {
            out.push_str(&format!(" {method:?} {join_type:?}"));
            if !left_keys.is_empty() {
                let pairs: Vec<String> = left_keys
                    .iter()
                    .zip(right_keys.iter())
                    .map(|(&l, &r)| {
                        format!(
                            "{} = {}",
                            crate::expr::expr_text(l, true),
                            crate::expr::expr_text(r, true)
                        )
                    })
                    .collect();
                out.push_str(&format!(" on {}", pairs.join(" and ")));
            }
        }
        RelKind::Filter { exprs } => {
            out.push_str(&format!(
                " ({})",
                exprs
                    .iter()
                    .map(|&e| crate::expr::expr_text(e, true))
                    .collect::<Vec<_>>()
                    .join(" and ")
            ));
        }
        RelKind::Aggregation { step, grouping, .. } => {
            out.push_str(&format!(" {step:?} keys {}", grouping.len()));
        }
        RelKind::Limit { offset, count } => {
            out.push_str(&format!(" ({offset}, {count})"));
        }
        RelKind::Repartition => {
            if node.distribution.is_broadcast {
                out.push_str(" broadcast");
            } else if node.distribution.is_gather {
                out.push_str(" gather");
            } else {
                out.push_str(&format!(" hash {} keys", node.distribution.partition.len()));
            }
        }
        _ => {}
    }
    if detail {
        out.push_str(&format!(
            "  [rows {:.0} unit {:.1}]",
            node.cost.out_cardinality(),
            node.cost.unit_cost
        ));
    }
    out.push('\n');
    for input in node.inputs {
        append_rel_text(input, indent + 1, detail, out);
    }
}
