//! # Query Graph
//!
//! Translation of the logical plan into a tree of derived tables. Each
//! logical node maps onto an operation allowed within the current derived
//! table; a node that would break reorderability (aggregation below more
//! operators, non-inner join right sides, set-operation branches) wraps the
//! work so far into a nested derived table and continues in a fresh one.
//!
//! Conjuncts are split on top-level AND. Single-table conjuncts become base
//! table filters (pushdown candidates when they touch one column); equality
//! conjuncts between two tables' columns become [`JoinEdge`] equalities with
//! fanouts derived from distinct counts; everything else stays on the derived
//! table and is placed by the enumerator once its columns are available.

use crate::context::{self, Name, PathId, Step};
use crate::error::{OptError, Result};
use crate::expr::{self, ExprKind, Value};
use crate::logical::{AggregateCall, LExprKind, LExprRef, LogicalKind, LogicalPlanRef};
use crate::object::{ExprId, ObjectId, PlanObjectSet};
use crate::options::OptimizerOptions;
use crate::schema::{resolve_table, Schema};
use crate::subfield::{FunctionRegistry, PlanSubfields, SubfieldAnalyzer};
use crate::types::{DataType, JoinType, OrderType, RowType, ScalarValue, SetOperation};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Accessed subfield paths per column expression.
pub type SubfieldSet = BTreeMap<ExprId, BTreeSet<PathId>>;

/// One occurrence of a schema table in the query.
#[derive(Debug, Clone)]
pub struct BaseTable {
    pub id: ObjectId,
    /// Correlation name, unique within the optimization.
    pub cname: Name,
    pub schema_table: Name,
    /// Top-level columns the query reads, in schema order.
    pub columns: Vec<ExprId>,
    /// Single-column conjuncts, candidates for connector pushdown.
    pub column_filters: Vec<ExprId>,
    /// Remaining single-table conjuncts.
    pub filter: Vec<ExprId>,
    pub filter_selectivity: f64,
    pub cardinality: f64,
    pub join_edges: Vec<ObjectId>,
    pub control_subfields: SubfieldSet,
    pub payload_subfields: SubfieldSet,
    /// Literal rows when this occurrence is a VALUES relation.
    pub values: Option<(RowType, Vec<Vec<ScalarValue>>)>,
}

impl BaseTable {
    pub(crate) fn placeholder() -> Self {
        Self {
            id: ObjectId(0),
            cname: Name::placeholder(),
            schema_table: Name::placeholder(),
            columns: Vec::new(),
            column_filters: Vec::new(),
            filter: Vec::new(),
            filter_selectivity: 1.0,
            cardinality: 0.0,
            join_edges: Vec::new(),
            control_subfields: SubfieldSet::new(),
            payload_subfields: SubfieldSet::new(),
            values: None,
        }
    }

    /// Number of filtered rows the scan produces.
    pub fn filtered_cardinality(&self) -> f64 {
        self.cardinality * self.filter_selectivity
    }
}

/// An equi-join relationship between two tables of one derived table.
/// Undirected for inner joins; `join_type` constrains reordering otherwise.
#[derive(Debug, Clone)]
pub struct JoinEdge {
    pub id: ObjectId,
    pub left: ObjectId,
    pub right: ObjectId,
    pub left_keys: Vec<ExprId>,
    pub right_keys: Vec<ExprId>,
    pub join_type: JoinType,
    /// Expected right rows per left row.
    pub lr_fanout: f64,
    /// Expected left rows per right row.
    pub rl_fanout: f64,
    /// Non-equality conjuncts evaluated with the join.
    pub filter: Vec<ExprId>,
}

impl JoinEdge {
    pub(crate) fn placeholder() -> Self {
        Self {
            id: ObjectId(0),
            left: ObjectId(0),
            right: ObjectId(0),
            left_keys: Vec::new(),
            right_keys: Vec::new(),
            join_type: JoinType::Inner,
            lr_fanout: 1.0,
            rl_fanout: 1.0,
            filter: Vec::new(),
        }
    }

    pub fn other_side(&self, table: ObjectId) -> ObjectId {
        if self.left == table {
            self.right
        } else {
            self.left
        }
    }

    /// (own keys, other side's keys, fanout toward the other side).
    pub fn sides_for(&self, placed: ObjectId) -> (Vec<ExprId>, Vec<ExprId>, f64) {
        if self.left == placed {
            (self.left_keys.clone(), self.right_keys.clone(), self.lr_fanout)
        } else {
            (self.right_keys.clone(), self.left_keys.clone(), self.rl_fanout)
        }
    }

    /// True when the join reduces the side it lands on; used for bushy build
    /// sides and existence imports.
    pub fn reduces(&self, toward: ObjectId) -> bool {
        if self.right == toward {
            self.lr_fanout < 0.9
        } else {
            self.rl_fanout < 0.9
        }
    }
}

/// The aggregation of one derived table.
#[derive(Debug, Clone)]
pub struct AggregationSpec {
    pub grouping: Vec<ExprId>,
    /// Deduplicated aggregate expressions.
    pub aggregates: Vec<ExprId>,
    /// Output column per aggregate, 1:1 with `aggregates`.
    pub agg_columns: Vec<ExprId>,
}

/// A SELECT: the unit of planning.
#[derive(Debug, Clone)]
pub struct DerivedTable {
    pub id: ObjectId,
    pub cname: Name,
    pub tables: Vec<ObjectId>,
    pub table_set: PlanObjectSet,
    pub joins: Vec<ObjectId>,
    pub conjuncts: Vec<ExprId>,
    /// Output columns (relation = this dt).
    pub columns: Vec<ExprId>,
    /// Definition of each output column over inner columns.
    pub exprs: Vec<ExprId>,
    pub aggregation: Option<AggregationSpec>,
    pub order_keys: Vec<ExprId>,
    pub order_types: Vec<OrderType>,
    /// -1 means no limit.
    pub limit: i64,
    pub offset: i64,
    /// Set when this dt is a set operation over `tables` (each a dt).
    pub set_op: Option<SetOperation>,
    pub cardinality: f64,
}

impl DerivedTable {
    pub(crate) fn placeholder() -> Self {
        Self {
            id: ObjectId(0),
            cname: Name::placeholder(),
            tables: Vec::new(),
            table_set: PlanObjectSet::new(),
            joins: Vec::new(),
            conjuncts: Vec::new(),
            columns: Vec::new(),
            exprs: Vec::new(),
            aggregation: None,
            order_keys: Vec::new(),
            order_types: Vec::new(),
            limit: -1,
            offset: 0,
            set_op: None,
            cardinality: 0.0,
        }
    }

    pub fn has_limit(&self) -> bool {
        self.limit >= 0
    }
}

/// Scan cardinality of a base or derived table, for edge fanouts.
pub fn table_cardinality(id: ObjectId) -> f64 {
    if context::is_base_table(id) {
        context::base_table(id).filtered_cardinality()
    } else {
        context::derived_table(id).cardinality
    }
}

struct DtBuilder {
    dt_id: ObjectId,
    tables: Vec<ObjectId>,
    joins: Vec<ObjectId>,
    edge_by_pair: HashMap<(ObjectId, ObjectId), ObjectId>,
    conjuncts: Vec<ExprId>,
    aggregation: Option<AggregationSpec>,
    order_keys: Vec<ExprId>,
    order_types: Vec<OrderType>,
    limit: i64,
    offset: i64,
    /// Visible column names.
    scope: HashMap<String, ExprId>,
}

impl DtBuilder {
    fn new(dt_id: ObjectId) -> Self {
        Self {
            dt_id,
            tables: Vec::new(),
            joins: Vec::new(),
            edge_by_pair: HashMap::new(),
            conjuncts: Vec::new(),
            aggregation: None,
            order_keys: Vec::new(),
            order_types: Vec::new(),
            limit: -1,
            offset: 0,
            scope: HashMap::new(),
        }
    }

    fn has_postprocess(&self) -> bool {
        self.aggregation.is_some() || !self.order_keys.is_empty() || self.limit >= 0
    }
}

/// Builds the query graph from a logical plan.
pub struct ToGraph<'a> {
    schema: &'a dyn Schema,
    options: &'a OptimizerOptions,
    registry: FunctionRegistry,
    pub control_subfields: PlanSubfields,
    pub payload_subfields: PlanSubfields,
    cname_counter: u32,
}

impl<'a> ToGraph<'a> {
    pub fn new(schema: &'a dyn Schema, options: &'a OptimizerOptions) -> Self {
        Self {
            schema,
            options,
            registry: FunctionRegistry::default(),
            control_subfields: PlanSubfields::default(),
            payload_subfields: PlanSubfields::default(),
            cname_counter: 0,
        }
    }

    fn new_cname(&mut self, prefix: &str) -> Name {
        self.cname_counter += 1;
        context::intern_name(&format!("{prefix}{}", self.cname_counter))
    }

    /// Translates `plan` into the root derived table.
    pub fn build(&mut self, plan: &LogicalPlanRef) -> Result<ObjectId> {
        let (control, payload) = {
            let mut analyzer = SubfieldAnalyzer::new(&self.registry);
            analyzer.mark_all(plan)?;
            (analyzer.control, analyzer.payload)
        };
        self.control_subfields = control;
        self.payload_subfields = payload;

        let dt_id = context::add_derived_table(DerivedTable::placeholder())?;
        let mut builder = DtBuilder::new(dt_id);
        self.process(plan, &mut builder)?;
        self.finish_dt(builder, &plan.output)
    }

    fn process(&mut self, node: &LogicalPlanRef, b: &mut DtBuilder) -> Result<()> {
        match &node.kind {
            LogicalKind::TableScan { table, .. } => self.add_base_table(node, table, b),
            LogicalKind::Values { row_type, rows } => {
                self.add_values_table(node, row_type, rows.clone(), b)
            }
            LogicalKind::Filter { predicate } => {
                self.process(&node.inputs[0], b)?;
                if b.has_postprocess() {
                    self.wrap_dt(b, &node.inputs[0].output)?;
                }
                let translated = self.translate(predicate, b)?;
                for conjunct in expr::split_conjuncts(translated) {
                    self.place_conjunct(conjunct, b)?;
                }
                Ok(())
            }
            LogicalKind::Project { names, exprs } => {
                self.process(&node.inputs[0], b)?;
                let mut new_names: Vec<(String, ExprId)> = Vec::with_capacity(names.len());
                for (name, e) in names.iter().zip(exprs.iter()) {
                    new_names.push((name.clone(), self.translate(e, b)?));
                }
                // Rename map: later references by name resolve to the
                // deduplicated expressions.
                b.scope = new_names.into_iter().collect();
                Ok(())
            }
            LogicalKind::Join {
                join_type,
                condition,
            } => self.add_join(node, *join_type, condition.as_ref(), b),
            LogicalKind::Aggregate {
                keys,
                key_names,
                aggregates,
                agg_names,
            } => {
                self.process(&node.inputs[0], b)?;
                if b.has_postprocess() {
                    self.wrap_dt(b, &node.inputs[0].output)?;
                }
                self.add_aggregation(keys, key_names, aggregates, agg_names, b)
            }
            LogicalKind::Sort { keys } => {
                self.process(&node.inputs[0], b)?;
                if !b.order_keys.is_empty() || b.limit >= 0 {
                    self.wrap_dt(b, &node.inputs[0].output)?;
                }
                for key in keys {
                    let translated = self.translate(&key.expr, b)?;
                    b.order_keys.push(translated);
                    b.order_types.push(key.order);
                }
                Ok(())
            }
            LogicalKind::Limit { offset, count } => {
                self.process(&node.inputs[0], b)?;
                if b.limit >= 0 {
                    self.wrap_dt(b, &node.inputs[0].output)?;
                }
                b.offset = *offset;
                b.limit = *count;
                Ok(())
            }
            LogicalKind::Set { op } => self.add_set(node, *op, b),
        }
    }

    fn add_base_table(
        &mut self,
        node: &LogicalPlanRef,
        table: &str,
        b: &mut DtBuilder,
    ) -> Result<()> {
        let schema_table = resolve_table(self.schema, table)?;
        let cname = self.new_cname("t");
        let table_id = context::add_base_table(BaseTable::placeholder())?;

        // Only channels the query reads become columns.
        let mut used: BTreeSet<usize> = self.control_subfields.used_ordinals(node.id);
        used.extend(self.payload_subfields.used_ordinals(node.id));
        if used.is_empty() && !schema_table.columns.is_empty() {
            used.insert(0);
        }

        let mut columns = Vec::new();
        let mut control = SubfieldSet::new();
        let mut payload = SubfieldSet::new();
        for ordinal in used {
            let schema_column = &schema_table.columns[ordinal];
            let column = expr::intern_column(
                context::intern_name(&schema_column.name),
                table_id,
                Value::new(
                    schema_column.data_type.clone(),
                    schema_column.stats.distinct_count,
                ),
                None,
                None,
            )?;
            columns.push(column);
            b.scope.insert(schema_column.name.clone(), column);

            if let Some(paths) = self.control_subfields.paths_for(node.id, ordinal) {
                control.insert(column, paths.clone());
            }
            if let Some(paths) = self.payload_subfields.paths_for(node.id, ordinal) {
                payload.insert(column, paths.clone());
            }
            self.check_map_as_struct(table, &schema_column.name, &control, &payload, column)?;
        }

        let schema_name = context::intern_name(table);
        let cardinality = schema_table.num_rows;
        context::update_base_table(table_id, |t| {
            t.cname = cname;
            t.schema_table = schema_name;
            t.columns = columns;
            t.cardinality = cardinality;
            t.control_subfields = control;
            t.payload_subfields = payload;
        });
        b.tables.push(table_id);
        Ok(())
    }

    /// A map column read as a struct of its accessed keys cannot answer
    /// `cardinality` of the full map.
    fn check_map_as_struct(
        &self,
        table: &str,
        column_name: &str,
        control: &SubfieldSet,
        payload: &SubfieldSet,
        column: ExprId,
    ) -> Result<()> {
        if !self.options.is_map_as_struct(table, column_name) {
            return Ok(());
        }
        for set in [control.get(&column), payload.get(&column)].into_iter().flatten() {
            for &path in set {
                let steps = context::path_steps(path);
                if matches!(steps.first(), Some(Step::Cardinality)) {
                    return Err(OptError::UnsupportedSubfield(format!(
                        "cardinality over pruned map {table}.{column_name}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn add_values_table(
        &mut self,
        node: &LogicalPlanRef,
        row_type: &RowType,
        rows: Vec<Vec<ScalarValue>>,
        b: &mut DtBuilder,
    ) -> Result<()> {
        let _ = node;
        let cname = self.new_cname("v");
        let table_id = context::add_base_table(BaseTable::placeholder())?;
        let cardinality = rows.len() as f64;
        let mut columns = Vec::new();
        for (name, data_type) in &row_type.fields {
            let column = expr::intern_column(
                context::intern_name(name),
                table_id,
                Value::new(data_type.clone(), cardinality.max(1.0)),
                None,
                None,
            )?;
            columns.push(column);
            b.scope.insert(name.clone(), column);
        }
        let schema_name = context::intern_name("$values");
        let values = Some((row_type.clone(), rows));
        context::update_base_table(table_id, |t| {
            t.cname = cname;
            t.schema_table = schema_name;
            t.columns = columns;
            t.cardinality = cardinality;
            t.values = values;
        });
        b.tables.push(table_id);
        Ok(())
    }

    fn add_join(
        &mut self,
        node: &LogicalPlanRef,
        join_type: JoinType,
        condition: Option<&LExprRef>,
        b: &mut DtBuilder,
    ) -> Result<()> {
        self.process(&node.inputs[0], b)?;
        if b.has_postprocess() {
            self.wrap_dt(b, &node.inputs[0].output)?;
        }

        let right_table = match join_type {
            JoinType::Inner | JoinType::Cross => {
                // Freely reorderable: the right side joins the current dt.
                // Both sides' names stay visible; uniqueness was checked at
                // plan construction.
                let left_scope = std::mem::take(&mut b.scope);
                self.process(&node.inputs[1], b)?;
                let right_scope = std::mem::take(&mut b.scope);
                b.scope = left_scope;
                b.scope.extend(right_scope);
                None
            }
            JoinType::Full => {
                return Err(OptError::unsupported("full outer joins are not reordered"));
            }
            _ => {
                // Non-inner joins are not freely reorderable: the right side
                // becomes its own derived table.
                let inner_id = context::add_derived_table(DerivedTable::placeholder())?;
                let mut inner = DtBuilder::new(inner_id);
                self.process(&node.inputs[1], &mut inner)?;
                let dt_id = self.finish_dt(inner, &node.inputs[1].output)?;
                let dt = context::derived_table(dt_id);
                if !matches!(join_type, JoinType::Semi | JoinType::Anti) {
                    for (column, (name, _)) in
                        dt.columns.iter().zip(node.inputs[1].output.fields.iter())
                    {
                        b.scope.insert(name.clone(), *column);
                    }
                }
                b.tables.push(dt_id);
                Some(dt_id)
            }
        };

        if let Some(condition) = condition {
            // Semi/anti right-side columns are not in the output scope but
            // are referencable from the join condition.
            let mut join_scope = b.scope.clone();
            if let Some(dt_id) = right_table {
                if matches!(join_type, JoinType::Semi | JoinType::Anti) {
                    let dt = context::derived_table(dt_id);
                    for (column, (name, _)) in
                        dt.columns.iter().zip(node.inputs[1].output.fields.iter())
                    {
                        join_scope.insert(name.clone(), *column);
                    }
                }
            }
            let saved_scope = std::mem::replace(&mut b.scope, join_scope);
            let translated = self.translate(condition, b)?;
            b.scope = saved_scope;

            for conjunct in expr::split_conjuncts(translated) {
                self.place_join_conjunct(conjunct, join_type, right_table, b)?;
            }
        } else if join_type != JoinType::Cross && right_table.is_none() {
            return Err(OptError::invalid("non-cross join without condition"));
        }
        Ok(())
    }

    /// Routes one join conjunct: an equality between two relations' columns
    /// becomes a join edge equality, anything else a dt conjunct (or, for a
    /// non-inner join, an edge filter).
    fn place_join_conjunct(
        &mut self,
        conjunct: ExprId,
        join_type: JoinType,
        right_table: Option<ObjectId>,
        b: &mut DtBuilder,
    ) -> Result<()> {
        if let ExprKind::Call { func, args } = context::expr(conjunct).kind {
            if func == context::intern_name("eq") && args.len() == 2 {
                let left_rel = expr::single_relation(args[0]);
                let right_rel = expr::single_relation(args[1]);
                if let (Some(a), Some(bb)) = (left_rel, right_rel) {
                    if a != bb {
                        self.add_edge_equality(a, args[0], bb, args[1], join_type, b)?;
                        return Ok(());
                    }
                }
            }
        }
        match (join_type, right_table) {
            (JoinType::Inner | JoinType::Cross, _) => self.place_conjunct(conjunct, b),
            (_, Some(dt_id)) => {
                // Keep non-equality conjuncts of an outer/semi join with the
                // edge; they cannot be pulled above or below it.
                let placed = b.tables.first().copied().unwrap_or(dt_id);
                let edge = self.edge_for(placed, dt_id, join_type, b)?;
                context::update_join_edge(edge, |e| e.filter.push(conjunct));
                Ok(())
            }
            _ => self.place_conjunct(conjunct, b),
        }
    }

    fn place_conjunct(&mut self, conjunct: ExprId, b: &mut DtBuilder) -> Result<()> {
        let relations = {
            let mut out = PlanObjectSet::new();
            for column in expr::columns_of(conjunct).iter() {
                if let ExprKind::Column { relation, .. } = context::expr(column).kind {
                    out.add(relation);
                }
            }
            out
        };
        let mut iter = relations.iter();
        match (iter.next(), iter.next()) {
            (Some(table), None) if context::is_base_table(table) => {
                let columns = expr::columns_of(conjunct);
                let single_column = columns.len() == 1;
                context::update_base_table(table, |t| {
                    if single_column {
                        t.column_filters.push(conjunct);
                    } else {
                        t.filter.push(conjunct);
                    }
                    // Default selectivity; history or sampling refine it.
                    t.filter_selectivity *= 0.8;
                });
                Ok(())
            }
            _ => {
                b.conjuncts.push(conjunct);
                Ok(())
            }
        }
    }

    fn edge_for(
        &mut self,
        left: ObjectId,
        right: ObjectId,
        join_type: JoinType,
        b: &mut DtBuilder,
    ) -> Result<ObjectId> {
        let key = if left <= right { (left, right) } else { (right, left) };
        if let Some(&edge) = b.edge_by_pair.get(&key) {
            return Ok(edge);
        }
        let mut edge = JoinEdge::placeholder();
        edge.left = left;
        edge.right = right;
        edge.join_type = join_type;
        let edge_id = context::add_join_edge(edge)?;
        b.edge_by_pair.insert(key, edge_id);
        b.joins.push(edge_id);
        for table in [left, right] {
            if context::is_base_table(table) {
                context::update_base_table(table, |t| t.join_edges.push(edge_id));
            } else {
                context::update_derived_table(table, |t| t.joins.push(edge_id));
            }
        }
        Ok(edge_id)
    }

    fn add_edge_equality(
        &mut self,
        rel_a: ObjectId,
        key_a: ExprId,
        rel_b: ObjectId,
        key_b: ExprId,
        join_type: JoinType,
        b: &mut DtBuilder,
    ) -> Result<()> {
        let edge_id = self.edge_for(rel_a, rel_b, join_type, b)?;
        let edge = context::join_edge(edge_id);
        let (left_key, right_key) = if edge.left == rel_a {
            (key_a, key_b)
        } else {
            (key_b, key_a)
        };
        // Combined key distinct counts cap at the table cardinality.
        let left_card = table_cardinality(edge.left);
        let right_card = table_cardinality(edge.right);
        let left_ndv: f64 = edge
            .left_keys
            .iter()
            .chain([&left_key])
            .map(|&k| context::expr(k).value.cardinality)
            .product::<f64>()
            .min(left_card.max(1.0));
        let right_ndv: f64 = edge
            .right_keys
            .iter()
            .chain([&right_key])
            .map(|&k| context::expr(k).value.cardinality)
            .product::<f64>()
            .min(right_card.max(1.0));
        let lr_fanout = right_card / right_ndv.max(left_ndv).max(1.0);
        let rl_fanout = left_card / right_ndv.max(left_ndv).max(1.0);
        context::update_join_edge(edge_id, |e| {
            e.left_keys.push(left_key);
            e.right_keys.push(right_key);
            e.lr_fanout = lr_fanout;
            e.rl_fanout = rl_fanout;
        });
        Ok(())
    }

    fn add_aggregation(
        &mut self,
        keys: &[LExprRef],
        key_names: &[String],
        aggregates: &[AggregateCall],
        agg_names: &[String],
        b: &mut DtBuilder,
    ) -> Result<()> {
        let mut grouping = Vec::new();
        for key in keys {
            grouping.push(self.translate(key, b)?);
        }

        // Interning deduplicates aggregates equal up to function, arguments,
        // filter and distinct; duplicate outputs share one physical
        // aggregate.
        let mut unique: Vec<ExprId> = Vec::new();
        let mut agg_columns: Vec<ExprId> = Vec::new();
        let mut scope: HashMap<String, ExprId> = HashMap::new();
        let dt_id = b.dt_id;

        for (call, name) in aggregates.iter().zip(agg_names.iter()) {
            let mut args = Vec::new();
            for arg in &call.args {
                args.push(self.translate(arg, b)?);
            }
            let condition = call
                .filter
                .as_ref()
                .map(|f| self.translate(f, b))
                .transpose()?;
            let mut order = Vec::new();
            for key in &call.order {
                order.push(self.translate(&key.expr, b)?);
            }
            let agg = context::intern_expr(
                ExprKind::Aggregate {
                    func: context::intern_name(&call.func),
                    args,
                    condition,
                    distinct: call.distinct,
                    order,
                },
                Value::new(call.data_type.clone(), 1000.0),
            )?;
            let column = match unique.iter().position(|&u| u == agg) {
                Some(pos) => agg_columns[pos],
                None => {
                    let column = expr::intern_column(
                        context::intern_name(name),
                        dt_id,
                        Value::new(call.data_type.clone(), 1000.0),
                        None,
                        None,
                    )?;
                    unique.push(agg);
                    agg_columns.push(column);
                    column
                }
            };
            scope.insert(name.clone(), column);
        }

        for (name, key) in key_names.iter().zip(grouping.iter()) {
            scope.insert(name.clone(), *key);
        }

        b.scope = scope;
        b.aggregation = Some(AggregationSpec {
            grouping,
            aggregates: unique,
            agg_columns,
        });
        Ok(())
    }

    fn add_set(
        &mut self,
        node: &LogicalPlanRef,
        op: SetOperation,
        b: &mut DtBuilder,
    ) -> Result<()> {
        match op {
            SetOperation::UnionAll | SetOperation::Union => {}
            other => {
                return Err(OptError::unsupported(format!(
                    "set operation {other:?} is not supported"
                )))
            }
        }
        let mut children = Vec::new();
        for input in &node.inputs {
            let inner_id = context::add_derived_table(DerivedTable::placeholder())?;
            let mut inner = DtBuilder::new(inner_id);
            self.process(input, &mut inner)?;
            children.push(self.finish_dt(inner, &input.output)?);
        }
        let cname = self.new_cname("set");
        let cardinality: f64 = children
            .iter()
            .map(|&c| context::derived_table(c).cardinality)
            .sum();
        let set_id = context::add_derived_table(DerivedTable::placeholder())?;
        let mut columns = Vec::new();
        let mut exprs = Vec::new();
        let first = context::derived_table(children[0]);
        for (column, (name, data_type)) in first.columns.iter().zip(node.output.fields.iter()) {
            let out = expr::intern_column(
                context::intern_name(name),
                set_id,
                Value::new(data_type.clone(), cardinality.max(1.0)),
                None,
                None,
            )?;
            columns.push(out);
            exprs.push(*column);
        }
        let table_set = PlanObjectSet::of(children.iter().copied());
        let children_clone = children.clone();
        context::update_derived_table(set_id, |dt| {
            dt.cname = cname;
            dt.tables = children_clone;
            dt.table_set = table_set;
            dt.columns = columns.clone();
            dt.exprs = exprs;
            dt.set_op = Some(SetOperation::UnionAll);
            dt.cardinality = cardinality;
        });

        b.tables.push(set_id);
        for (column, (name, _)) in columns.iter().zip(node.output.fields.iter()) {
            b.scope.insert(name.clone(), *column);
        }
        if op == SetOperation::Union {
            // Distinct enforced by a separate aggregation over all columns.
            b.aggregation = Some(AggregationSpec {
                grouping: columns,
                aggregates: Vec::new(),
                agg_columns: Vec::new(),
            });
        }
        Ok(())
    }

    /// Finalizes the builder's state into its derived table.
    fn finish_dt(&mut self, b: DtBuilder, output: &RowType) -> Result<ObjectId> {
        let dt_id = b.dt_id;
        let cname = self.new_cname("dt");
        let mut columns = Vec::new();
        let mut exprs = Vec::new();
        for (name, data_type) in &output.fields {
            let inner = *b.scope.get(name).ok_or_else(|| {
                OptError::invalid(format!("unresolvable output column: {name}"))
            })?;
            let inner_cardinality = context::expr(inner).value.cardinality;
            // A dt output that is already a same-named column of this dt
            // (aggregation outputs) is reused as is; a deduplicated
            // aggregate read under a second name gets its own output column.
            let reuse = match context::expr(inner).kind {
                ExprKind::Column {
                    relation,
                    name: column_name,
                    ..
                } => relation == dt_id && context::name_str(column_name) == *name,
                _ => false,
            };
            let column = if reuse {
                inner
            } else {
                expr::intern_column(
                    context::intern_name(name),
                    dt_id,
                    Value::new(data_type.clone(), inner_cardinality),
                    None,
                    None,
                )?
            };
            columns.push(column);
            exprs.push(inner);
        }

        let cardinality = self.estimate_dt_cardinality(&b);
        let table_set = PlanObjectSet::of(b.tables.iter().copied());
        context::update_derived_table(dt_id, |dt| {
            dt.cname = cname;
            dt.tables = b.tables;
            dt.table_set = table_set;
            dt.joins = b.joins;
            dt.conjuncts = b.conjuncts;
            dt.columns = columns;
            dt.exprs = exprs;
            dt.aggregation = b.aggregation;
            dt.order_keys = b.order_keys;
            dt.order_types = b.order_types;
            dt.limit = b.limit;
            dt.offset = b.offset;
            dt.cardinality = cardinality;
        });
        Ok(dt_id)
    }

    fn estimate_dt_cardinality(&self, b: &DtBuilder) -> f64 {
        let mut cardinality: f64 = b
            .tables
            .iter()
            .map(|&t| table_cardinality(t))
            .fold(1.0, |a, c| a * c.max(1.0));
        for &join in &b.joins {
            let edge = context::join_edge(join);
            let reduced = table_cardinality(edge.right).max(1.0);
            cardinality = (cardinality / reduced * edge.lr_fanout).max(1.0);
        }
        cardinality *= 0.8f64.powi(b.conjuncts.len() as i32);
        if let Some(agg) = &b.aggregation {
            let domain: f64 = agg
                .grouping
                .iter()
                .map(|&k| context::expr(k).value.cardinality)
                .fold(1.0, |a, c| a * c.max(1.0));
            cardinality = crate::cost::expected_groups(domain, cardinality);
        }
        if b.limit >= 0 {
            cardinality = cardinality.min(b.limit as f64);
        }
        cardinality.max(1.0)
    }

    /// Wraps the work so far into a nested derived table and restarts the
    /// builder with that dt as its only table.
    fn wrap_dt(&mut self, b: &mut DtBuilder, output: &RowType) -> Result<()> {
        let new_id = context::add_derived_table(DerivedTable::placeholder())?;
        let inner = std::mem::replace(b, DtBuilder::new(new_id));
        let inner_id = self.finish_dt(inner, output)?;
        b.tables.push(inner_id);
        let dt = context::derived_table(inner_id);
        for (column, (name, _)) in dt.columns.iter().zip(output.fields.iter()) {
            b.scope.insert(name.clone(), *column);
        }
        Ok(())
    }

    fn translate(&mut self, e: &LExprRef, b: &mut DtBuilder) -> Result<ExprId> {
        match &e.kind {
            LExprKind::Input(name) => b
                .scope
                .get(name)
                .copied()
                .ok_or_else(|| OptError::invalid(format!("unresolvable column: {name}"))),
            LExprKind::Literal(value) => {
                expr::intern_literal(value.clone(), e.data_type.clone())
            }
            LExprKind::Call { name, args } => {
                let mut translated = Vec::with_capacity(args.len());
                for arg in args {
                    translated.push(self.translate(arg, b)?);
                }
                let cardinality = translated
                    .iter()
                    .map(|&a| context::expr(a).value.cardinality)
                    .fold(1.0f64, f64::max);
                let cardinality = if e.data_type == DataType::Boolean {
                    2.0
                } else {
                    cardinality
                };
                expr::intern_call(
                    context::intern_name(name),
                    translated,
                    Value::new(e.data_type.clone(), cardinality),
                )
            }
            LExprKind::Field { base, field } => {
                let base_id = self.translate(base, b)?;
                let index = base
                    .data_type
                    .row_field(field)
                    .map(|(i, _)| i as u32)
                    .ok_or_else(|| OptError::invalid(format!("no field {field}")))?;
                let cardinality = context::expr(base_id).value.cardinality;
                context::intern_expr(
                    ExprKind::Field {
                        base: base_id,
                        field: Some(context::intern_name(field)),
                        index,
                    },
                    Value::new(e.data_type.clone(), cardinality),
                )
            }
            LExprKind::Lambda { params, body } => {
                let saved: Vec<(String, Option<ExprId>)> = params
                    .iter()
                    .map(|(n, _)| (n.clone(), b.scope.get(n).copied()))
                    .collect();
                let mut args = Vec::new();
                for (name, data_type) in params {
                    let param = expr::intern_column(
                        context::intern_name(name),
                        b.dt_id,
                        Value::new(data_type.clone(), 1000.0),
                        None,
                        None,
                    )?;
                    args.push(param);
                    b.scope.insert(name.clone(), param);
                }
                let body_id = self.translate(body, b);
                for (name, old) in saved {
                    match old {
                        Some(old) => b.scope.insert(name, old),
                        None => b.scope.remove(&name),
                    };
                }
                context::intern_expr(
                    ExprKind::Lambda {
                        args,
                        body: body_id?,
                    },
                    Value::new(e.data_type.clone(), 1000.0),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextGuard;
    use crate::logical::{self, PlanBuilder};
    use crate::schema::InMemorySchema;

    fn two_table_schema() -> InMemorySchema {
        let mut schema = InMemorySchema::new();
        schema.add_table_with_stats(
            "orders",
            1_500_000.0,
            &[
                ("o_orderkey", DataType::Bigint, 1_500_000.0),
                ("o_custkey", DataType::Bigint, 100_000.0),
                ("o_totalprice", DataType::Double, 1_000_000.0),
            ],
        );
        schema.add_table_with_stats(
            "customer",
            150_000.0,
            &[
                ("c_custkey", DataType::Bigint, 150_000.0),
                ("c_name", DataType::Varchar, 150_000.0),
            ],
        );
        schema
    }

    fn build_join_graph(schema: &InMemorySchema) -> ObjectId {
        let customer = PlanBuilder::new(schema).table_scan("customer").unwrap().build().unwrap();
        let builder = PlanBuilder::new(schema).table_scan("orders").unwrap();
        let o_custkey = builder.col("o_custkey").unwrap();
        let builder = builder
            .join(
                customer,
                JoinType::Inner,
                Some(logical::eq(
                    o_custkey,
                    logical::input("c_custkey", DataType::Bigint),
                )),
            )
            .unwrap();
        let price = builder.col("o_totalprice").unwrap();
        let plan = builder
            .filter(logical::gt(price, logical::lit_i64(100)))
            .unwrap()
            .build()
            .unwrap();
        let options = OptimizerOptions::default();
        ToGraph::new(schema, &options).build(&plan).unwrap()
    }

    #[test]
    fn test_join_edge_and_filter_split() {
        let _guard = ContextGuard::install();
        let schema = two_table_schema();
        let dt = context::derived_table(build_join_graph(&schema));

        assert_eq!(dt.tables.len(), 2);
        assert_eq!(dt.joins.len(), 1);
        let edge = context::join_edge(dt.joins[0]);
        assert_eq!(edge.left_keys.len(), 1);
        // ~10 orders per customer.
        let orders_side_fanout = edge.lr_fanout.max(edge.rl_fanout);
        assert!(orders_side_fanout > 5.0 && orders_side_fanout < 20.0);

        // The price filter landed on the orders base table, not the dt.
        assert!(dt.conjuncts.is_empty());
        let orders = context::base_table(dt.tables[0]);
        assert_eq!(orders.column_filters.len(), 1);
        assert!(orders.filter_selectivity < 1.0);
    }

    #[test]
    fn test_aggregate_dedup() {
        let _guard = ContextGuard::install();
        let schema = two_table_schema();
        let builder = PlanBuilder::new(&schema).table_scan("orders").unwrap();
        let price = builder.col("o_totalprice").unwrap();
        let positive = logical::gt(builder.col("o_totalprice").unwrap(), logical::lit_i64(0));
        let negative = logical::lt(builder.col("o_totalprice").unwrap(), logical::lit_i64(0));
        let plan = builder
            .aggregate(
                vec![],
                vec![
                    AggregateCall::new("sum", vec![price.clone()], DataType::Double)
                        .with_filter(positive.clone()),
                    AggregateCall::new("sum", vec![price.clone()], DataType::Double)
                        .with_filter(negative),
                    AggregateCall::new("sum", vec![price], DataType::Double)
                        .with_filter(positive),
                ],
            )
            .unwrap()
            .build()
            .unwrap();

        let options = OptimizerOptions::default();
        let dt_id = ToGraph::new(&schema, &options).build(&plan).unwrap();
        let dt = context::derived_table(dt_id);
        let agg = dt.aggregation.expect("aggregation");
        // Two physical aggregates for three outputs.
        assert_eq!(agg.aggregates.len(), 2);
        assert_eq!(dt.columns.len(), 3);
        // The duplicate output re-reads the first column.
        assert_eq!(dt.exprs[0], dt.exprs[2]);
    }

    #[test]
    fn test_semi_join_wraps_right_side() {
        let _guard = ContextGuard::install();
        let schema = two_table_schema();
        let customer = PlanBuilder::new(&schema).table_scan("customer").unwrap().build().unwrap();
        let builder = PlanBuilder::new(&schema).table_scan("orders").unwrap();
        let o_custkey = builder.col("o_custkey").unwrap();
        let plan = builder
            .join(
                customer,
                JoinType::Semi,
                Some(logical::eq(
                    o_custkey,
                    logical::input("c_custkey", DataType::Bigint),
                )),
            )
            .unwrap()
            .build()
            .unwrap();
        let options = OptimizerOptions::default();
        let dt_id = ToGraph::new(&schema, &options).build(&plan).unwrap();
        let dt = context::derived_table(dt_id);
        assert_eq!(dt.tables.len(), 2);
        assert!(context::is_base_table(dt.tables[0]));
        assert!(context::is_derived_table(dt.tables[1]));
        let edge = context::join_edge(dt.joins[0]);
        assert_eq!(edge.join_type, JoinType::Semi);
    }
}
