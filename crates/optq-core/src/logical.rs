//! # Logical Plan Input
//!
//! The typed relational tree the optimizer consumes. An external
//! parser/builder produces this; [`PlanBuilder`] is the programmatic way to
//! construct one (tests use it heavily).
//!
//! Validation happens at construction: duplicate output names, non-boolean
//! predicates, mistyped Values rows and mismatched set-operation inputs are
//! `InvalidPlan` errors here rather than surprises during graph translation.

use crate::error::{OptError, Result};
use crate::schema::{resolve_table, Schema};
use crate::types::{DataType, JoinType, OrderType, RowType, ScalarValue, SetOperation};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub type LExprRef = Arc<LExpr>;

/// A typed scalar expression of the logical plan.
#[derive(Debug, Clone)]
pub struct LExpr {
    pub kind: LExprKind,
    pub data_type: DataType,
}

#[derive(Debug, Clone)]
pub enum LExprKind {
    /// Reference to an input column by name.
    Input(String),
    Literal(ScalarValue),
    Call { name: String, args: Vec<LExprRef> },
    /// Struct field dereference.
    Field { base: LExprRef, field: String },
    Lambda {
        params: Vec<(String, DataType)>,
        body: LExprRef,
    },
}

impl LExpr {
    pub fn is_constant(&self) -> bool {
        match &self.kind {
            LExprKind::Literal(_) => true,
            LExprKind::Input(_) => false,
            LExprKind::Call { args, .. } => args.iter().all(|a| a.is_constant()),
            LExprKind::Field { base, .. } => base.is_constant(),
            LExprKind::Lambda { .. } => false,
        }
    }
}

pub fn input(name: impl Into<String>, data_type: DataType) -> LExprRef {
    Arc::new(LExpr {
        kind: LExprKind::Input(name.into()),
        data_type,
    })
}

pub fn lit_i64(v: i64) -> LExprRef {
    Arc::new(LExpr {
        kind: LExprKind::Literal(ScalarValue::Int64(v)),
        data_type: DataType::Bigint,
    })
}

pub fn lit_str(v: impl Into<String>) -> LExprRef {
    Arc::new(LExpr {
        kind: LExprKind::Literal(ScalarValue::Utf8(v.into())),
        data_type: DataType::Varchar,
    })
}

pub fn lit(value: ScalarValue, data_type: DataType) -> LExprRef {
    Arc::new(LExpr {
        kind: LExprKind::Literal(value),
        data_type,
    })
}

pub fn call(data_type: DataType, name: impl Into<String>, args: Vec<LExprRef>) -> LExprRef {
    Arc::new(LExpr {
        kind: LExprKind::Call {
            name: name.into(),
            args,
        },
        data_type,
    })
}

fn comparison(name: &str, left: LExprRef, right: LExprRef) -> LExprRef {
    call(DataType::Boolean, name, vec![left, right])
}

pub fn eq(left: LExprRef, right: LExprRef) -> LExprRef {
    comparison("eq", left, right)
}

pub fn lt(left: LExprRef, right: LExprRef) -> LExprRef {
    comparison("lt", left, right)
}

pub fn gt(left: LExprRef, right: LExprRef) -> LExprRef {
    comparison("gt", left, right)
}

pub fn and(conjuncts: Vec<LExprRef>) -> LExprRef {
    call(DataType::Boolean, "and", conjuncts)
}

pub fn field(base: LExprRef, name: impl Into<String>) -> Result<LExprRef> {
    let name = name.into();
    let (_, field_type) = base
        .data_type
        .row_field(&name)
        .ok_or_else(|| OptError::invalid(format!("no field {name} in {:?}", base.data_type)))?;
    let data_type = field_type.clone();
    Ok(Arc::new(LExpr {
        kind: LExprKind::Field { base, field: name },
        data_type,
    }))
}

/// `subscript(container, key)` over an array or map.
pub fn subscript(base: LExprRef, key: LExprRef) -> Result<LExprRef> {
    let value_type = base
        .data_type
        .subscript_type()
        .ok_or_else(|| OptError::invalid(format!("subscript over {:?}", base.data_type)))?
        .clone();
    Ok(call(value_type, "subscript", vec![base, key]))
}

pub fn cardinality(base: LExprRef) -> LExprRef {
    call(DataType::Bigint, "cardinality", vec![base])
}

/// One order-by key.
#[derive(Debug, Clone)]
pub struct SortField {
    pub expr: LExprRef,
    pub order: OrderType,
}

/// Aggregate function application in an Aggregate node.
#[derive(Debug, Clone)]
pub struct AggregateCall {
    pub func: String,
    pub args: Vec<LExprRef>,
    pub filter: Option<LExprRef>,
    pub distinct: bool,
    pub order: Vec<SortField>,
    pub data_type: DataType,
}

impl AggregateCall {
    pub fn new(func: impl Into<String>, args: Vec<LExprRef>, data_type: DataType) -> Self {
        Self {
            func: func.into(),
            args,
            filter: None,
            distinct: false,
            order: Vec::new(),
            data_type,
        }
    }

    pub fn with_filter(mut self, filter: LExprRef) -> Self {
        self.filter = Some(filter);
        self
    }
}

pub type LogicalPlanRef = Arc<LogicalPlan>;

#[derive(Debug, Clone)]
pub enum LogicalKind {
    TableScan {
        table: String,
        columns: Vec<String>,
        row_type: RowType,
    },
    Filter {
        predicate: LExprRef,
    },
    Project {
        names: Vec<String>,
        exprs: Vec<LExprRef>,
    },
    Join {
        join_type: JoinType,
        condition: Option<LExprRef>,
    },
    Aggregate {
        keys: Vec<LExprRef>,
        key_names: Vec<String>,
        aggregates: Vec<AggregateCall>,
        agg_names: Vec<String>,
    },
    Sort {
        keys: Vec<SortField>,
    },
    Limit {
        offset: i64,
        count: i64,
    },
    Values {
        row_type: RowType,
        rows: Vec<Vec<ScalarValue>>,
    },
    Set {
        op: SetOperation,
    },
}

#[derive(Debug)]
pub struct LogicalPlan {
    /// Unique node id; the subfield analysis keys its maps with it.
    pub id: u32,
    pub kind: LogicalKind,
    pub inputs: Vec<LogicalPlanRef>,
    pub output: RowType,
}

static NODE_IDS: AtomicU32 = AtomicU32::new(0);

fn check_unique_names(names: impl Iterator<Item = impl AsRef<str>>) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name.as_ref().to_string()) {
            return Err(OptError::invalid(format!(
                "duplicate output name: {}",
                name.as_ref()
            )));
        }
    }
    Ok(())
}

impl LogicalPlan {
    pub fn try_new(kind: LogicalKind, inputs: Vec<LogicalPlanRef>) -> Result<LogicalPlanRef> {
        let output = Self::derive_output(&kind, &inputs)?;
        Ok(Arc::new(LogicalPlan {
            id: NODE_IDS.fetch_add(1, Ordering::Relaxed),
            kind,
            inputs,
            output,
        }))
    }

    fn derive_output(kind: &LogicalKind, inputs: &[LogicalPlanRef]) -> Result<RowType> {
        match kind {
            LogicalKind::TableScan { row_type, .. } => {
                check_unique_names(row_type.fields.iter().map(|(n, _)| n))?;
                Ok(row_type.clone())
            }
            LogicalKind::Filter { predicate } => {
                if predicate.data_type != DataType::Boolean {
                    return Err(OptError::invalid("filter predicate must be boolean"));
                }
                Ok(only_input(inputs)?.output.clone())
            }
            LogicalKind::Project { names, exprs } => {
                if names.len() != exprs.len() {
                    return Err(OptError::invalid("projection name/expression arity mismatch"));
                }
                check_unique_names(names.iter())?;
                Ok(RowType::new(
                    names
                        .iter()
                        .zip(exprs.iter())
                        .map(|(n, e)| (n.clone(), e.data_type.clone()))
                        .collect(),
                ))
            }
            LogicalKind::Join { join_type, .. } => {
                if inputs.len() != 2 {
                    return Err(OptError::invalid("join requires two inputs"));
                }
                let mut fields = inputs[0].output.fields.clone();
                if !matches!(join_type, JoinType::Semi | JoinType::Anti) {
                    fields.extend(inputs[1].output.fields.clone());
                }
                check_unique_names(fields.iter().map(|(n, _)| n))?;
                Ok(RowType::new(fields))
            }
            LogicalKind::Aggregate {
                keys,
                key_names,
                aggregates,
                agg_names,
            } => {
                if keys.len() != key_names.len() || aggregates.len() != agg_names.len() {
                    return Err(OptError::invalid("aggregate name arity mismatch"));
                }
                let mut fields: Vec<(String, DataType)> = key_names
                    .iter()
                    .zip(keys.iter())
                    .map(|(n, k)| (n.clone(), k.data_type.clone()))
                    .collect();
                fields.extend(
                    agg_names
                        .iter()
                        .zip(aggregates.iter())
                        .map(|(n, a)| (n.clone(), a.data_type.clone())),
                );
                check_unique_names(fields.iter().map(|(n, _)| n))?;
                Ok(RowType::new(fields))
            }
            LogicalKind::Sort { .. } => Ok(only_input(inputs)?.output.clone()),
            LogicalKind::Limit { offset, count } => {
                if *offset < 0 || *count < 0 {
                    return Err(OptError::invalid("negative limit or offset"));
                }
                Ok(only_input(inputs)?.output.clone())
            }
            LogicalKind::Values { row_type, rows } => {
                for row in rows {
                    if row.len() != row_type.len() {
                        return Err(OptError::invalid("values row arity mismatch"));
                    }
                }
                Ok(row_type.clone())
            }
            LogicalKind::Set { .. } => {
                if inputs.is_empty() {
                    return Err(OptError::invalid("set operation requires inputs"));
                }
                let first = &inputs[0].output;
                for other in &inputs[1..] {
                    if other.output.len() != first.len() {
                        return Err(OptError::invalid("set operation arity mismatch"));
                    }
                    for ((_, a), (_, b)) in first.fields.iter().zip(other.output.fields.iter()) {
                        if a != b {
                            return Err(OptError::invalid("set operation type mismatch"));
                        }
                    }
                }
                Ok(first.clone())
            }
        }
    }
}

fn only_input(inputs: &[LogicalPlanRef]) -> Result<&LogicalPlanRef> {
    match inputs {
        [one] => Ok(one),
        _ => Err(OptError::invalid("expected exactly one input")),
    }
}

/// Fluent construction of logical plans against a schema.
pub struct PlanBuilder<'a> {
    schema: &'a dyn Schema,
    node: Option<LogicalPlanRef>,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(schema: &'a dyn Schema) -> Self {
        Self { schema, node: None }
    }

    fn current(&self) -> Result<&LogicalPlanRef> {
        self.node
            .as_ref()
            .ok_or_else(|| OptError::invalid("plan builder has no input node"))
    }

    /// A typed reference to a column of the current node's output.
    pub fn col(&self, name: &str) -> Result<LExprRef> {
        let node = self.current()?;
        let data_type = node
            .output
            .type_of(name)
            .ok_or_else(|| OptError::invalid(format!("unresolvable column: {name}")))?
            .clone();
        Ok(input(name, data_type))
    }

    pub fn table_scan(mut self, table: &str) -> Result<Self> {
        let schema_table = resolve_table(self.schema, table)?;
        let row_type = schema_table.row_type();
        let columns = schema_table.columns.iter().map(|c| c.name.clone()).collect();
        self.node = Some(LogicalPlan::try_new(
            LogicalKind::TableScan {
                table: table.to_string(),
                columns,
                row_type,
            },
            vec![],
        )?);
        Ok(self)
    }

    pub fn values(mut self, row_type: RowType, rows: Vec<Vec<ScalarValue>>) -> Result<Self> {
        self.node = Some(LogicalPlan::try_new(
            LogicalKind::Values { row_type, rows },
            vec![],
        )?);
        Ok(self)
    }

    pub fn filter(mut self, predicate: LExprRef) -> Result<Self> {
        let input = self.current()?.clone();
        self.node = Some(LogicalPlan::try_new(
            LogicalKind::Filter { predicate },
            vec![input],
        )?);
        Ok(self)
    }

    pub fn project(mut self, exprs: Vec<LExprRef>, names: Vec<&str>) -> Result<Self> {
        let input = self.current()?.clone();
        self.node = Some(LogicalPlan::try_new(
            LogicalKind::Project {
                names: names.into_iter().map(str::to_string).collect(),
                exprs,
            },
            vec![input],
        )?);
        Ok(self)
    }

    pub fn join(
        mut self,
        right: LogicalPlanRef,
        join_type: JoinType,
        condition: Option<LExprRef>,
    ) -> Result<Self> {
        let left = self.current()?.clone();
        self.node = Some(LogicalPlan::try_new(
            LogicalKind::Join {
                join_type,
                condition,
            },
            vec![left, right],
        )?);
        Ok(self)
    }

    /// Key names default to the input column name for plain references, and
    /// aggregate outputs are named `agg0`, `agg1`, ...
    pub fn aggregate(
        mut self,
        keys: Vec<LExprRef>,
        aggregates: Vec<AggregateCall>,
    ) -> Result<Self> {
        let input = self.current()?.clone();
        let key_names: Vec<String> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| match &k.kind {
                LExprKind::Input(name) => name.clone(),
                _ => format!("k{i}"),
            })
            .collect();
        let agg_names: Vec<String> = (0..aggregates.len()).map(|i| format!("agg{i}")).collect();
        self.node = Some(LogicalPlan::try_new(
            LogicalKind::Aggregate {
                keys,
                key_names,
                aggregates,
                agg_names,
            },
            vec![input],
        )?);
        Ok(self)
    }

    pub fn order_by(mut self, keys: Vec<SortField>) -> Result<Self> {
        let input = self.current()?.clone();
        self.node = Some(LogicalPlan::try_new(LogicalKind::Sort { keys }, vec![input])?);
        Ok(self)
    }

    pub fn limit(mut self, offset: i64, count: i64) -> Result<Self> {
        let input = self.current()?.clone();
        self.node = Some(LogicalPlan::try_new(
            LogicalKind::Limit { offset, count },
            vec![input],
        )?);
        Ok(self)
    }

    pub fn union_all(mut self, other: LogicalPlanRef) -> Result<Self> {
        let left = self.current()?.clone();
        self.node = Some(LogicalPlan::try_new(
            LogicalKind::Set {
                op: SetOperation::UnionAll,
            },
            vec![left, other],
        )?);
        Ok(self)
    }

    pub fn build(self) -> Result<LogicalPlanRef> {
        Ok(self.current()?.clone())
    }
}
