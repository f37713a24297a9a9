//! # Join Enumeration
//!
//! The search core: recursive branch-and-bound over join orders with
//! memoization. From a derived table and a [`PlanState`] the enumerator
//! places ready conjuncts, generates [`JoinCandidate`]s for every joinable
//! table (including bushy reducing build sides and imported existence
//! semijoins), tries hash, right-hash, index-lookup and cross methods for
//! each, and recurses into the surviving [`NextJoin`]s. A partial plan whose
//! cost exceeds the best completed plan plus a shuffle is cut off.
//!
//! Build sides and derived tables are planned through the memo: a
//! [`MemoKey`] identifies the subproblem and the stored [`PlanSet`] answers
//! later requests, possibly with a different required distribution (then a
//! shuffle is inserted by the caller).

use crate::context;
use crate::cost::{self, Cost};
use crate::error::{OptError, Result};
use crate::expr;
use crate::graph::{table_cardinality, DerivedTable, JoinEdge};
use crate::history::{leaf_key, History};
use crate::memo::{MemoKey, Plan, PlanSet};
use crate::object::{ExprId, ObjectId, PlanObjectSet, RelId};
use crate::options::{FragmentOptions, OptimizerOptions};
use crate::relop::{AggStep, Distribution, JoinMethod, RelKind, RelNode};
use crate::schema::Schema;
use crate::types::{reverse_join_type, JoinType};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Builds whose output is at most this many rows may be broadcast instead of
/// repartitioning both sides.
const BROADCAST_LIMIT_ROWS: f64 = 100_000.0;

/// Tracks the tables and columns placed while constructing a partial plan.
pub struct PlanState {
    pub dt: ObjectId,
    /// Tables this subproblem must cover.
    pub target_tables: PlanObjectSet,
    /// Columns that must be available at the end of the plan.
    pub target_columns: PlanObjectSet,
    /// Placed tables and conjuncts.
    pub placed: PlanObjectSet,
    /// Columns with a value from placed tables.
    pub columns: PlanObjectSet,
    pub cost: Cost,
    pub builds: Vec<RelId>,
    pub has_cutoff: bool,
    /// Reducing semijoin sets to apply before finishing the plan.
    pub existences: Vec<PlanObjectSet>,
    pub exists_fanout: f64,
    /// Whether aggregation/order/limit/projection are added at the end.
    pub with_postprocess: bool,
    pub plans: PlanSet,
}

impl PlanState {
    fn new(dt: ObjectId) -> Self {
        Self {
            dt,
            target_tables: PlanObjectSet::new(),
            target_columns: PlanObjectSet::new(),
            placed: PlanObjectSet::new(),
            columns: PlanObjectSet::new(),
            cost: Cost::accumulator(),
            builds: Vec::new(),
            has_cutoff: true,
            existences: Vec::new(),
            exists_fanout: 1.0,
            with_postprocess: false,
            plans: PlanSet::default(),
        }
    }

    /// True if the accumulated cost is already beyond the best complete plan
    /// plus a shuffle.
    pub fn is_over_best(&self) -> bool {
        self.has_cutoff
            && self.plans.best_cost_with_shuffle != 0.0
            && self.cost.total() > self.plans.best_cost_with_shuffle
    }

    pub fn add_cost(&mut self, op: &Cost) {
        self.cost.add_op(op);
    }
}

/// Snapshot of the mutable search state, restored when a branch backtracks.
pub struct PlanStateSaver {
    placed: PlanObjectSet,
    columns: PlanObjectSet,
    cost: Cost,
    num_builds: usize,
}

impl PlanStateSaver {
    pub fn save(state: &PlanState) -> Self {
        Self {
            placed: state.placed.clone(),
            columns: state.columns.clone(),
            cost: state.cost,
            num_builds: state.builds.len(),
        }
    }

    pub fn restore(self, state: &mut PlanState) {
        state.placed = self.placed;
        state.columns = self.columns;
        state.cost = self.cost;
        state.builds.truncate(self.num_builds);
    }
}

/// The next table or bushy table set to join.
#[derive(Debug, Clone)]
struct JoinCandidate {
    edge: ObjectId,
    /// Tables joined on the build side; none already placed.
    tables: Vec<ObjectId>,
    /// Right-side hits per probe row; existences do not contribute.
    fanout: f64,
    /// Reducing semijoins imported from the probe side to shrink a build.
    existences: Vec<PlanObjectSet>,
    /// Selectivity from `existences`.
    exists_fanout: f64,
}

/// One join placed on top of a partial plan; one candidate can produce
/// several of these for different methods and partitionings.
struct NextJoin {
    plan: RelId,
    cost: Cost,
    placed: PlanObjectSet,
    columns: PlanObjectSet,
    builds: Vec<RelId>,
}

impl NextJoin {
    /// True if only `other` is worth trying: same output distribution and no
    /// cheaper.
    fn is_worse(&self, other: &NextJoin) -> bool {
        self.cost.total() > other.cost.total()
            && context::rel(self.plan).distribution == context::rel(other.plan).distribution
    }
}

/// One optimization run over a constructed query graph.
pub struct Optimization<'a> {
    schema: &'a dyn Schema,
    history: &'a dyn History,
    pub options: OptimizerOptions,
    pub frag: FragmentOptions,
    root_dt: ObjectId,
    memo: HashMap<MemoKey, PlanSet>,
    build_counter: u32,
}

impl<'a> Optimization<'a> {
    pub fn new(
        schema: &'a dyn Schema,
        history: &'a dyn History,
        options: OptimizerOptions,
        frag: FragmentOptions,
        root_dt: ObjectId,
    ) -> Result<Self> {
        let optimization = Self {
            schema,
            history,
            options,
            frag,
            root_dt,
            memo: HashMap::new(),
            build_counter: 0,
        };
        optimization.update_leaf_selectivities(root_dt)?;
        Ok(optimization)
    }

    pub fn root_dt(&self) -> ObjectId {
        self.root_dt
    }

    pub fn schema(&self) -> &dyn Schema {
        self.schema
    }

    pub fn history(&self) -> &dyn History {
        self.history
    }

    /// History and sampling refine the default filter selectivity of every
    /// base table before enumeration.
    fn update_leaf_selectivities(&self, dt_id: ObjectId) -> Result<()> {
        let dt = context::derived_table(dt_id);
        for &table in &dt.tables {
            if context::is_derived_table(table) {
                self.update_leaf_selectivities(table)?;
                continue;
            }
            let base = context::base_table(table);
            if base.values.is_some() {
                continue;
            }
            if base.column_filters.is_empty() && base.filter.is_empty() {
                continue;
            }
            let key = leaf_key(&base);
            if let Some(selectivity) = self.history.leaf_selectivity(&key, base.cardinality) {
                context::update_base_table(table, |t| t.filter_selectivity = selectivity);
                continue;
            }
            if self.options.sample_pct > 0.0 {
                let schema_table =
                    crate::schema::resolve_table(self.schema, &context::name_str(base.schema_table))?;
                let filters: Vec<String> = base
                    .column_filters
                    .iter()
                    .chain(base.filter.iter())
                    .map(|&f| expr::expr_text(f, false))
                    .collect();
                let (total, matching) =
                    self.schema
                        .sample(&schema_table, 0, &filters, self.options.sample_pct)?;
                if total > 0.0 && matching < total {
                    let selectivity = (matching / total).clamp(0.0, 1.0);
                    context::update_base_table(table, |t| t.filter_selectivity = selectivity);
                }
            }
        }
        Ok(())
    }

    /// The best plan for the root derived table.
    pub fn best_plan(&mut self) -> Result<Plan> {
        let (plan, _) = self.plan_dt(self.root_dt, &Distribution::any())?;
        debug!(
            cost = plan.cost.total(),
            rows = plan.cost.out_cardinality(),
            "optimization complete"
        );
        Ok(plan)
    }

    /// Retrieves or makes the plan set for a whole derived table and returns
    /// its best plan for `distribution`, with `needs_shuffle` when the best
    /// plan is partitioned differently.
    pub fn plan_dt(&mut self, dt_id: ObjectId, distribution: &Distribution) -> Result<(Plan, bool)> {
        let dt = context::derived_table(dt_id);
        let key = MemoKey::for_tables(
            dt_id,
            PlanObjectSet::of(dt.columns.iter().copied()),
            if dt.set_op.is_some() {
                PlanObjectSet::of([dt_id])
            } else {
                dt.table_set.clone()
            },
        );
        if !self.memo.contains_key(&key) {
            let plans = if dt.set_op.is_some() {
                self.plan_union(&dt)?
            } else {
                self.enumerate(&dt, &key, true)?
            };
            if plans.plans.is_empty() {
                return Err(OptError::unsupported(format!(
                    "no plan found for derived table {}",
                    context::name_str(dt.cname)
                )));
            }
            self.memo.insert(key.clone(), plans);
        }
        let plans = &self.memo[&key];
        let (plan, needs_shuffle) = plans
            .best(distribution)
            .ok_or_else(|| OptError::unsupported("empty plan set"))?;
        Ok((plan.clone(), needs_shuffle))
    }

    /// Only the union-all case is supported; distinct is a separate
    /// aggregation added during graph construction.
    fn plan_union(&mut self, dt: &DerivedTable) -> Result<PlanSet> {
        let mut inputs = Vec::new();
        let mut cost = Cost::accumulator();
        let mut input_cardinality = 0.0;
        let mut builds = Vec::new();
        for &child in &dt.tables {
            let (plan, _) = self.plan_dt(child, &Distribution::any())?;
            input_cardinality += plan.cost.out_cardinality();
            cost.setup_cost += plan.cost.total();
            builds.extend(plan.builds.iter().copied());
            inputs.push(plan.root);
        }
        let union = context::add_rel(RelNode {
            id: ObjectId(0),
            kind: RelKind::UnionAll,
            inputs,
            columns: dt.columns.clone(),
            distribution: Distribution::any(),
            cost: Cost {
                input_cardinality,
                fanout: 1.0,
                ..Default::default()
            },
        })?;
        cost.fanout = input_cardinality.max(1.0);
        let mut plans = PlanSet::default();
        plans.add_plan(Plan {
            root: union,
            cost,
            tables: PlanObjectSet::of([dt.id]),
            columns: PlanObjectSet::of(dt.columns.iter().copied()),
            input: PlanObjectSet::new(),
            builds,
            fully_imported: PlanObjectSet::new(),
        });
        Ok(plans)
    }

    /// Enumerates join orders for `key` over `dt`, trying each table of the
    /// key as the first table. Returns the set of interesting plans.
    fn enumerate(
        &mut self,
        dt: &DerivedTable,
        key: &MemoKey,
        with_postprocess: bool,
    ) -> Result<PlanSet> {
        let mut state = PlanState::new(dt.id);
        state.target_tables = key.tables.clone();
        state.target_columns = key.columns.clone();
        state.existences = key.existences.clone();
        state.with_postprocess = with_postprocess;
        if with_postprocess {
            state.target_columns.union_with(&self.dt_referenced_columns(dt));
        }

        // Deterministic: start tables in ascending id order.
        let starts: Vec<ObjectId> = key.tables.iter().collect();
        for start in starts {
            let saver = PlanStateSaver::save(&state);
            match self.place_table(start, &mut state) {
                Ok(plan) => {
                    self.make_joins(plan, &mut state)?;
                }
                Err(e) => {
                    trace!(table = %start, error = %e, "first table placement infeasible");
                }
            }
            saver.restore(&mut state);
        }
        Ok(state.plans)
    }

    /// Every column the derived table's own processing refers to.
    fn dt_referenced_columns(&self, dt: &DerivedTable) -> PlanObjectSet {
        let mut out = expr::columns_of_all(&dt.exprs);
        for &c in &dt.conjuncts {
            out.union_with(&expr::columns_of(c));
        }
        if let Some(agg) = &dt.aggregation {
            out.union_with(&expr::columns_of_all(&agg.grouping));
            out.union_with(&expr::columns_of_all(&agg.aggregates));
        }
        out.union_with(&expr::columns_of_all(&dt.order_keys));
        out
    }

    /// Columns referenced by anything not yet placed: unplaced conjuncts,
    /// join keys toward unplaced tables, and the target columns. Shrinks as
    /// more tables are placed.
    fn downstream_columns(&self, state: &PlanState) -> PlanObjectSet {
        let dt = context::derived_table(state.dt);
        let mut out = state.target_columns.clone();
        for &c in &dt.conjuncts {
            if !state.placed.contains(c) {
                out.union_with(&expr::columns_of(c));
            }
        }
        for &edge_id in &dt.joins {
            let edge = context::join_edge(edge_id);
            if !state.placed.contains(edge.left) || !state.placed.contains(edge.right) {
                out.union_with(&expr::columns_of_all(&edge.left_keys));
                out.union_with(&expr::columns_of_all(&edge.right_keys));
                out.union_with(&expr::columns_of_all(&edge.filter));
            }
        }
        out
    }

    /// Memoized planning of a join subset used as a hash build side.
    fn make_key_plan(
        &mut self,
        dt_id: ObjectId,
        key: &MemoKey,
        distribution: &Distribution,
    ) -> Result<(Plan, bool)> {
        if !self.memo.contains_key(key) {
            let dt = context::derived_table(dt_id);
            let plans = self.enumerate(&dt, key, false)?;
            if plans.plans.is_empty() {
                return Err(OptError::unsupported("no plan for build side"));
            }
            self.memo.insert(key.clone(), plans);
        }
        let (plan, needs_shuffle) = self.memo[key]
            .best(distribution)
            .ok_or_else(|| OptError::unsupported("empty build plan set"))?;
        Ok((plan.clone(), needs_shuffle))
    }

    /// Places `table` as the first table of a partial plan.
    fn place_table(&mut self, table: ObjectId, state: &mut PlanState) -> Result<RelId> {
        let rel = if context::is_base_table(table) {
            let rel = self.scan_rel(table, state)?;
            state.add_cost(&context::rel(rel).cost);
            rel
        } else {
            let (plan, _) = self.plan_dt(table, &Distribution::any())?;
            state.builds.extend(plan.builds.iter().copied());
            // The dt's plan carries its fully accumulated cost; the root
            // op's own cost is only the marginal cost of the topmost node.
            // Fold the plan in with the leaf convention: the accumulated
            // total as the unit cost and the absolute output cardinality as
            // the fanout.
            let as_leaf = Cost {
                unit_cost: plan.cost.total(),
                fanout: plan.cost.out_cardinality(),
                total_bytes: plan.cost.total_bytes,
                transfer_bytes: plan.cost.transfer_bytes,
                ..Default::default()
            };
            state.add_cost(&as_leaf);
            plan.root
        };
        let node = context::rel(rel);
        state.placed.add(table);
        for &column in &node.columns {
            state.columns.add(column);
        }
        Ok(rel)
    }

    /// Leaf scan of a base table (or literal values). The base table's
    /// filters are part of the scan: its cost already reflects the filter
    /// selectivity and the filters are attached to the scan handle during
    /// lowering.
    fn scan_rel(&mut self, table: ObjectId, state: &PlanState) -> Result<RelId> {
        let base = context::base_table(table);
        let downstream = self.downstream_columns(state);
        let mut columns: Vec<ExprId> = base
            .columns
            .iter()
            .copied()
            .filter(|&c| downstream.contains(c))
            .collect();
        if columns.is_empty() {
            columns = base.columns.clone();
        }
        let values: Vec<_> = columns
            .iter()
            .map(|&c| context::expr(c).value)
            .collect();
        let cost = cost::leaf_cost(base.filtered_cardinality(), &values);
        let kind = match &base.values {
            Some((row_type, rows)) => RelKind::Values {
                row_type: row_type.clone(),
                rows: rows.clone(),
            },
            None => RelKind::TableScan {
                base_table: table,
                layout: 0,
                keys: Vec::new(),
            },
        };
        context::add_rel(RelNode {
            id: ObjectId(0),
            kind,
            inputs: Vec::new(),
            columns,
            distribution: Distribution::any(),
            cost,
        })
    }

    /// Lists the joins possible on top of `state.placed` and extends the
    /// partial plan by each, recursing into the interesting ones. When all
    /// target tables are placed, adds postprocess and records the plan.
    fn make_joins(&mut self, plan: RelId, state: &mut PlanState) -> Result<()> {
        if state.is_over_best() {
            if self.options.trace_level & OptimizerOptions::TRACE_EXCEEDED_BEST != 0 {
                trace!(cost = state.cost.total(), "cutoff");
            }
            return Ok(());
        }
        if self.place_conjuncts(plan, state)? {
            return Ok(());
        }

        let candidates = self.next_joins(state);
        if candidates.is_empty() {
            if state.target_tables.is_subset_of(&state.placed) {
                return self.finish_plan(plan, state);
            }
            // Only genuinely disconnected tables may cross join. An unplaced
            // table whose edge to the placed set is unusable from this
            // placement order (the constrained side of a non-inner join)
            // makes this order a dead end; another start order covers it.
            let dt = context::derived_table(state.dt);
            let mut unplaced: Vec<ObjectId> = state
                .target_tables
                .iter()
                .filter(|&t| !state.placed.contains(t))
                .filter(|&t| {
                    !dt.joins.iter().any(|&edge_id| {
                        let edge = context::join_edge(edge_id);
                        (edge.left == t && state.placed.contains(edge.right))
                            || (edge.right == t && state.placed.contains(edge.left))
                    })
                })
                .collect();
            unplaced.sort_by(|&a, &b| {
                table_cardinality(a)
                    .partial_cmp(&table_cardinality(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.cmp(&b))
            });
            let mut to_try = Vec::new();
            if let Some(&table) = unplaced.first() {
                let candidate = JoinCandidate {
                    edge: ObjectId(0),
                    tables: vec![table],
                    fanout: table_cardinality(table).max(1.0),
                    existences: Vec::new(),
                    exists_fanout: 1.0,
                };
                if let Err(e) = self.cross_join(plan, &candidate, state, &mut to_try) {
                    trace!(error = %e, "cross join candidate infeasible");
                }
            }
            return self.try_next_joins(state, to_try);
        }

        let mut to_try = Vec::new();
        for candidate in &candidates {
            self.add_join(candidate, plan, state, &mut to_try);
        }
        self.try_next_joins(state, to_try)
    }

    /// Adds every conjunct whose columns are all placed as a filter and
    /// recurses. Returns false when nothing was placeable.
    fn place_conjuncts(&mut self, plan: RelId, state: &mut PlanState) -> Result<bool> {
        let dt = context::derived_table(state.dt);
        let placeable: Vec<ExprId> = dt
            .conjuncts
            .iter()
            .copied()
            .filter(|&c| {
                !state.placed.contains(c) && expr::columns_of(c).is_subset_of(&state.columns)
            })
            .collect();
        if placeable.is_empty() {
            return Ok(false);
        }
        let input = context::rel(plan);
        let filter_cost = cost::filter_cost(placeable.len(), state.cost.fanout);
        let filter = context::add_rel(RelNode {
            id: ObjectId(0),
            kind: RelKind::Filter {
                exprs: placeable.clone(),
            },
            inputs: vec![plan],
            columns: input.columns,
            distribution: input.distribution,
            cost: filter_cost,
        })?;
        for c in placeable {
            state.placed.add(c);
        }
        state.add_cost(&filter_cost);
        self.make_joins(filter, state)?;
        Ok(true)
    }

    /// Join candidates reachable from the placed tables, most reducing
    /// first.
    fn next_joins(&self, state: &PlanState) -> Vec<JoinCandidate> {
        let dt = context::derived_table(state.dt);
        let mut out: Vec<JoinCandidate> = Vec::new();
        for &edge_id in &dt.joins {
            let edge = context::join_edge(edge_id);
            if edge.left_keys.is_empty() {
                continue;
            }
            let left_placed = state.placed.contains(edge.left);
            let right_placed = state.placed.contains(edge.right);
            if left_placed == right_placed {
                continue;
            }
            let (new_table, fanout) = if left_placed {
                (edge.right, edge.lr_fanout)
            } else {
                (edge.left, edge.rl_fanout)
            };
            if !state.target_tables.contains(new_table) {
                continue;
            }
            // Non-inner joins keep their sides: the derived table side can
            // only be placed after the outer side.
            if edge.join_type != JoinType::Inner && !left_placed {
                continue;
            }
            let mut candidate = JoinCandidate {
                edge: edge_id,
                tables: vec![new_table],
                fanout,
                existences: Vec::new(),
                exists_fanout: 1.0,
            };
            if edge.join_type == JoinType::Inner && context::is_base_table(new_table) {
                self.extend_candidate(&edge, new_table, state, &mut candidate, &mut out);
            }
            out.push(candidate);
        }
        out.sort_by(|a, b| {
            a.fanout
                .partial_cmp(&b.fanout)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.tables[0].cmp(&b.tables[0]))
        });
        out
    }

    /// Adds bushy build-side variants (the candidate joined with further
    /// reducing unplaced tables) and imports probe-side reducing semijoins
    /// as existences.
    fn extend_candidate(
        &self,
        edge: &JoinEdge,
        new_table: ObjectId,
        state: &PlanState,
        candidate: &mut JoinCandidate,
        out: &mut Vec<JoinCandidate>,
    ) {
        let base = context::base_table(new_table);
        for &other_edge_id in &base.join_edges {
            if other_edge_id == edge.id {
                continue;
            }
            let other_edge = context::join_edge(other_edge_id);
            if other_edge.join_type != JoinType::Inner || other_edge.left_keys.is_empty() {
                continue;
            }
            let other = other_edge.other_side(new_table);
            if !other_edge.reduces(new_table) {
                continue;
            }
            let (_, _, toward_other) = other_edge.sides_for(new_table);
            if state.placed.contains(other) {
                // A reducing join to an already placed table: the probe
                // already enforces it, so it can shrink the build as a
                // semijoin.
                candidate.existences.push(PlanObjectSet::of([other]));
                candidate.exists_fanout *= toward_other.min(1.0);
            } else if state.target_tables.contains(other) {
                // A reducing join to another unplaced table makes a bushy
                // build side.
                out.push(JoinCandidate {
                    edge: edge.id,
                    tables: vec![new_table, other],
                    fanout: candidate.fanout * toward_other.min(1.0),
                    existences: Vec::new(),
                    exists_fanout: 1.0,
                });
            }
        }
    }

    /// Tries all applicable join methods for one candidate; errors while
    /// costing a candidate mean the candidate is infeasible and are
    /// discarded.
    fn add_join(
        &mut self,
        candidate: &JoinCandidate,
        plan: RelId,
        state: &mut PlanState,
        to_try: &mut Vec<NextJoin>,
    ) {
        let mut batch = Vec::new();
        let edge = context::join_edge(candidate.edge);
        if let Err(e) = self.join_by_hash(plan, candidate, &edge, state, &mut batch) {
            trace!(error = %e, "hash join candidate infeasible");
        }
        if matches!(edge.join_type, JoinType::Left | JoinType::Semi) {
            if let Err(e) = self.join_by_hash_right(plan, candidate, &edge, state, &mut batch) {
                trace!(error = %e, "right hash variant infeasible");
            }
        }
        if let Err(e) = self.join_by_index(plan, candidate, &edge, state, &mut batch) {
            trace!(error = %e, "index join candidate infeasible");
        }

        // Drop clearly dominated methods for this candidate.
        let mut keep: Vec<NextJoin> = Vec::new();
        'outer: for next in batch {
            if keep.iter().any(|other| next.is_worse(other)) {
                continue 'outer;
            }
            keep.retain(|other| !other.is_worse(&next));
            keep.push(next);
        }
        to_try.extend(keep);
    }

    /// Recurses into each kept join, cheapest first, restoring the search
    /// state between attempts.
    fn try_next_joins(&mut self, state: &mut PlanState, mut to_try: Vec<NextJoin>) -> Result<()> {
        to_try.sort_by(|a, b| {
            a.cost
                .total()
                .partial_cmp(&b.cost.total())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.plan.cmp(&b.plan))
        });
        for next in to_try {
            let saver = PlanStateSaver::save(state);
            state.placed = next.placed.clone();
            state.columns = next.columns.clone();
            state.cost = next.cost;
            state.builds = next.builds.clone();
            self.make_joins(next.plan, state)?;
            saver.restore(state);
        }
        Ok(())
    }

    /// The columns a join output must carry.
    fn join_output_columns(
        &self,
        state: &PlanState,
        probe_columns: &PlanObjectSet,
        build_columns: &PlanObjectSet,
        join_type: JoinType,
    ) -> (PlanObjectSet, Vec<ExprId>) {
        let mut available = probe_columns.clone();
        match join_type {
            JoinType::Semi | JoinType::Anti => {}
            JoinType::RightSemi => {
                available = build_columns.clone();
            }
            _ => available.union_with(build_columns),
        }
        let mut out = available.clone();
        out.intersect_with(&self.downstream_columns(state));
        if out.is_empty() {
            out = available.clone();
        }
        let columns: Vec<ExprId> = out.iter().collect();
        (available, columns)
    }

    fn add_repartition(&mut self, input: RelId, target: Distribution) -> Result<(RelId, Cost)> {
        let node = context::rel(input);
        let values: Vec<_> = node
            .columns
            .iter()
            .map(|&c| context::expr(c).value)
            .collect();
        let repart_cost = cost::repartition_cost(&values, node.cost.out_cardinality());
        let rel = context::add_rel(RelNode {
            id: ObjectId(0),
            kind: RelKind::Repartition,
            inputs: vec![input],
            columns: node.columns,
            distribution: target,
            cost: repart_cost,
        })?;
        Ok((rel, repart_cost))
    }

    /// Plans the build side of a hash join: a plain scan for a single table
    /// without existences, otherwise a memoized sub-join.
    fn build_side_plan(
        &mut self,
        candidate: &JoinCandidate,
        build_keys: &[ExprId],
        state: &PlanState,
    ) -> Result<(RelId, f64, Vec<RelId>)> {
        if candidate.tables.len() == 1
            && candidate.existences.is_empty()
            && context::is_base_table(candidate.tables[0])
        {
            let rel = self.scan_rel(candidate.tables[0], state)?;
            let node = context::rel(rel);
            return Ok((rel, node.cost.total(), Vec::new()));
        }
        if candidate.tables.len() == 1 && context::is_derived_table(candidate.tables[0]) {
            let (plan, _) = self.plan_dt(candidate.tables[0], &Distribution::hashed(build_keys.to_vec()))?;
            return Ok((plan.root, plan.cost.total(), plan.builds));
        }
        let mut columns = self.downstream_columns(state);
        let mut build_tables = PlanObjectSet::new();
        for &t in &candidate.tables {
            build_tables.add(t);
        }
        let mut build_columns = PlanObjectSet::new();
        for &t in &candidate.tables {
            if context::is_base_table(t) {
                for &c in &context::base_table(t).columns {
                    build_columns.add(c);
                }
            } else {
                for &c in &context::derived_table(t).columns {
                    build_columns.add(c);
                }
            }
        }
        columns.intersect_with(&build_columns);
        for &k in build_keys {
            columns.union_with(&expr::columns_of(k));
        }
        let key = MemoKey {
            first_table: candidate.tables[0],
            columns,
            tables: build_tables,
            existences: candidate.existences.clone(),
        };
        let (plan, _) =
            self.make_key_plan(state.dt, &key, &Distribution::hashed(build_keys.to_vec()))?;
        Ok((plan.root, plan.cost.total(), plan.builds))
    }

    fn join_by_hash(
        &mut self,
        plan: RelId,
        candidate: &JoinCandidate,
        edge: &JoinEdge,
        state: &PlanState,
        to_try: &mut Vec<NextJoin>,
    ) -> Result<()> {
        let placed_is_left = state.placed.contains(edge.left);
        let (probe_keys, build_keys) = if placed_is_left {
            (edge.left_keys.clone(), edge.right_keys.clone())
        } else {
            (edge.right_keys.clone(), edge.left_keys.clone())
        };
        let (build_input, build_total, imported_builds) =
            self.build_side_plan(candidate, &build_keys, state)?;
        let build_node = context::rel(build_input);
        let build_rows = build_node.cost.out_cardinality() * candidate.exists_fanout;
        let distributed = !self.frag.is_single_node();

        // Partitioned variant, and a broadcast variant for small builds.
        let mut variants = vec![false];
        if distributed && build_rows <= BROADCAST_LIMIT_ROWS {
            variants.push(true);
        }
        for broadcast in variants {
            let mut cost_acc = state.cost;
            cost_acc.setup_cost += build_total;

            let mut probe = plan;
            if distributed
                && !broadcast
                && !context::rel(plan).distribution.is_colocated_for(&probe_keys)
            {
                let (repart, repart_cost) =
                    self.add_repartition(plan, Distribution::hashed(probe_keys.clone()))?;
                cost_acc.add_op(&repart_cost);
                probe = repart;
            }

            let mut build = build_input;
            if distributed {
                let target = if broadcast {
                    Distribution::broadcast()
                } else {
                    Distribution::hashed(build_keys.clone())
                };
                if !context::rel(build).distribution.satisfies(&target) {
                    let (repart, repart_cost) = self.add_repartition(build, target)?;
                    cost_acc.setup_cost += repart_cost.unit_cost * build_rows.max(1.0);
                    build = repart;
                }
            }

            self.build_counter += 1;
            let build_values: Vec<_> = context::rel(build)
                .columns
                .iter()
                .map(|&c| context::expr(c).value)
                .collect();
            let hb_cost = cost::hash_build_cost(build_keys.len(), build_rows, &build_values);
            let hash_build = context::add_rel(RelNode {
                id: ObjectId(0),
                kind: RelKind::HashBuild {
                    keys: build_keys.clone(),
                    build_id: self.build_counter,
                },
                inputs: vec![build],
                columns: context::rel(build).columns,
                distribution: context::rel(build).distribution,
                cost: hb_cost,
            })?;
            cost_acc.setup_cost += hb_cost.unit_cost * build_rows.max(1.0);

            let fanout = join_fanout(edge.join_type, candidate.fanout, candidate.exists_fanout);
            let build_column_set = PlanObjectSet::of(context::rel(build).columns);
            let (available, columns) = self.join_output_columns(
                state,
                &state.columns,
                &build_column_set,
                edge.join_type,
            );
            let join_cost = cost::hash_join_cost(
                build_rows,
                context::rel(build).columns.len(),
                probe_keys.len(),
                fanout,
                cost_acc.fanout,
            );
            let join = context::add_rel(RelNode {
                id: ObjectId(0),
                kind: RelKind::Join {
                    method: JoinMethod::Hash,
                    join_type: edge.join_type,
                    left_keys: probe_keys.clone(),
                    right_keys: build_keys.clone(),
                    filter: edge.filter.clone(),
                    fanout,
                },
                inputs: vec![probe, hash_build],
                columns,
                distribution: context::rel(probe).distribution,
                cost: join_cost,
            })?;
            cost_acc.add_op(&join_cost);

            let mut placed = state.placed.clone();
            for &t in &candidate.tables {
                placed.add(t);
            }
            let mut builds = state.builds.clone();
            builds.push(hash_build);
            builds.extend(imported_builds.iter().copied());
            push_next_join(
                state,
                NextJoin {
                    plan: join,
                    cost: cost_acc,
                    placed,
                    columns: available,
                    builds,
                },
                to_try,
            );
        }
        Ok(())
    }

    /// Right hash variant of a left outer or left semijoin: the new table
    /// probes and everything placed so far becomes the build.
    fn join_by_hash_right(
        &mut self,
        plan: RelId,
        candidate: &JoinCandidate,
        edge: &JoinEdge,
        state: &PlanState,
        to_try: &mut Vec<NextJoin>,
    ) -> Result<()> {
        if candidate.tables.len() != 1 || !context::is_base_table(candidate.tables[0]) {
            return Ok(());
        }
        let table = candidate.tables[0];
        let probe = self.scan_rel(table, state)?;
        let probe_node = context::rel(probe);
        let probe_rows = probe_node.cost.out_cardinality();

        let build_keys = edge.left_keys.clone();
        let probe_keys = edge.right_keys.clone();
        let build_rows = state.cost.fanout.max(1.0);

        self.build_counter += 1;
        let build_values: Vec<_> = context::rel(plan)
            .columns
            .iter()
            .map(|&c| context::expr(c).value)
            .collect();
        let hb_cost = cost::hash_build_cost(build_keys.len(), build_rows, &build_values);
        let hash_build = context::add_rel(RelNode {
            id: ObjectId(0),
            kind: RelKind::HashBuild {
                keys: build_keys.clone(),
                build_id: self.build_counter,
            },
            inputs: vec![plan],
            columns: context::rel(plan).columns,
            distribution: context::rel(plan).distribution,
            cost: hb_cost,
        })?;

        let out_rows = state.cost.fanout.max(1.0) * candidate.fanout.max(1e-10);
        let fanout = out_rows / probe_rows.max(1.0);
        let join_type = reverse_join_type(edge.join_type);
        let probe_column_set = PlanObjectSet::of(probe_node.columns.iter().copied());
        let (available, columns) =
            self.join_output_columns(state, &probe_column_set, &state.columns, join_type);
        let join_cost = cost::hash_join_cost(
            build_rows,
            context::rel(plan).columns.len(),
            probe_keys.len(),
            fanout,
            probe_rows,
        );
        let join = context::add_rel(RelNode {
            id: ObjectId(0),
            kind: RelKind::Join {
                method: JoinMethod::Hash,
                join_type,
                left_keys: probe_keys,
                right_keys: build_keys,
                filter: edge.filter.clone(),
                fanout,
            },
            inputs: vec![probe, hash_build],
            columns,
            distribution: probe_node.distribution,
            cost: join_cost,
        })?;

        // The old spine is now a build: its cost becomes setup.
        let mut cost_acc = Cost::accumulator();
        cost_acc.setup_cost =
            state.cost.total() + hb_cost.unit_cost * build_rows;
        cost_acc.add_op(&probe_node.cost);
        cost_acc.add_op(&join_cost);

        let mut placed = state.placed.clone();
        placed.add(table);
        let mut builds = state.builds.clone();
        builds.push(hash_build);
        push_next_join(
            state,
            NextJoin {
                plan: join,
                cost: cost_acc,
                placed,
                columns: available,
                builds,
            },
            to_try,
        );
        Ok(())
    }

    /// Index lookup: if the new table has a layout whose order columns are a
    /// prefix of the join equalities, probe it directly instead of building.
    fn join_by_index(
        &mut self,
        plan: RelId,
        candidate: &JoinCandidate,
        edge: &JoinEdge,
        state: &PlanState,
        to_try: &mut Vec<NextJoin>,
    ) -> Result<()> {
        if candidate.tables.len() != 1
            || !candidate.existences.is_empty()
            || !context::is_base_table(candidate.tables[0])
        {
            return Ok(());
        }
        let table = candidate.tables[0];
        let base = context::base_table(table);
        if base.values.is_some() {
            return Ok(());
        }
        let placed_is_left = state.placed.contains(edge.left);
        let (probe_keys, lookup_keys) = if placed_is_left {
            (edge.left_keys.clone(), edge.right_keys.clone())
        } else {
            (edge.right_keys.clone(), edge.left_keys.clone())
        };
        let schema_table =
            crate::schema::resolve_table(self.schema, &context::name_str(base.schema_table))?;
        let lookup_names: Vec<String> = lookup_keys
            .iter()
            .map(|&k| match context::expr(k).kind {
                crate::expr::ExprKind::Column { name, .. } => context::name_str(name),
                _ => String::new(),
            })
            .collect();
        let Some((layout_index, layout)) =
            schema_table.layouts.iter().enumerate().find(|(_, layout)| {
                !layout.order_columns.is_empty()
                    && layout
                        .order_columns
                        .iter()
                        .zip(lookup_names.iter())
                        .all(|(o, k)| o == k)
                    && layout.order_columns.len() <= lookup_names.len()
            })
        else {
            return Ok(());
        };

        let prefix_selectivity: f64 = lookup_keys
            .iter()
            .take(layout.order_columns.len())
            .map(|&k| context::expr(k).value.cardinality)
            .product();
        let scan_cost = cost::index_scan_cost(
            layout.num_rows.max(base.cardinality),
            prefix_selectivity,
            candidate.fanout * base.filter_selectivity,
            state.cost.fanout,
        );

        let mut table_column_set = PlanObjectSet::new();
        for &c in &base.columns {
            table_column_set.add(c);
        }
        let (available, columns) =
            self.join_output_columns(state, &state.columns, &table_column_set, edge.join_type);
        let lookup = context::add_rel(RelNode {
            id: ObjectId(0),
            kind: RelKind::TableScan {
                base_table: table,
                layout: layout_index,
                keys: probe_keys,
            },
            inputs: vec![plan],
            columns,
            // A lookup preserves the probe's partitioning.
            distribution: context::rel(plan).distribution,
            cost: scan_cost,
        })?;
        let mut cost_acc = state.cost;
        cost_acc.add_op(&scan_cost);

        let mut placed = state.placed.clone();
        placed.add(table);
        push_next_join(
            state,
            NextJoin {
                plan: lookup,
                cost: cost_acc,
                placed,
                columns: available,
                builds: state.builds.clone(),
            },
            to_try,
        );
        Ok(())
    }

    /// Cross join for candidates with no equalities, e.g. a non-correlated
    /// single-row subquery.
    fn cross_join(
        &mut self,
        plan: RelId,
        candidate: &JoinCandidate,
        state: &PlanState,
        to_try: &mut Vec<NextJoin>,
    ) -> Result<()> {
        let table = candidate.tables[0];
        let (build, build_total, imported_builds) = if context::is_base_table(table) {
            let rel = self.scan_rel(table, state)?;
            let total = context::rel(rel).cost.total();
            (rel, total, Vec::new())
        } else {
            let (plan, _) = self.plan_dt(table, &Distribution::any())?;
            (plan.root, plan.cost.total(), plan.builds)
        };
        let mut cost_acc = state.cost;
        cost_acc.setup_cost += build_total;

        let mut build = build;
        if !self.frag.is_single_node() {
            let (repart, repart_cost) = self.add_repartition(build, Distribution::broadcast())?;
            cost_acc.setup_cost +=
                repart_cost.unit_cost * context::rel(build).cost.out_cardinality().max(1.0);
            build = repart;
        }

        let build_rows = context::rel(build).cost.out_cardinality().max(1.0);
        let build_column_set = PlanObjectSet::of(context::rel(build).columns);
        let (available, columns) =
            self.join_output_columns(state, &state.columns, &build_column_set, JoinType::Inner);
        let join_cost = Cost {
            unit_cost: build_rows * cost::ARRAY_PROBE_COST,
            fanout: build_rows,
            input_cardinality: cost_acc.fanout,
            ..Default::default()
        };
        let join = context::add_rel(RelNode {
            id: ObjectId(0),
            kind: RelKind::Join {
                method: JoinMethod::Cross,
                join_type: JoinType::Inner,
                left_keys: Vec::new(),
                right_keys: Vec::new(),
                filter: Vec::new(),
                fanout: build_rows,
            },
            inputs: vec![plan, build],
            columns,
            distribution: context::rel(plan).distribution,
            cost: join_cost,
        })?;
        cost_acc.add_op(&join_cost);

        let mut placed = state.placed.clone();
        placed.add(table);
        let mut builds = state.builds.clone();
        builds.extend(imported_builds);
        push_next_join(
            state,
            NextJoin {
                plan: join,
                cost: cost_acc,
                placed,
                columns: available,
                builds,
            },
            to_try,
        );
        Ok(())
    }

    /// Applies pending existence semijoins, adds postprocess when planning a
    /// whole derived table, and records the completed plan.
    fn finish_plan(&mut self, plan: RelId, state: &mut PlanState) -> Result<()> {
        let saver = PlanStateSaver::save(state);
        let mut root = plan;
        let existences = state.existences.clone();
        for existence in &existences {
            root = self.place_existence(root, existence, state)?;
        }
        if state.with_postprocess {
            root = self.add_postprocess(root, state)?;
        }

        let dt = context::derived_table(state.dt);
        let mut tables = state.placed.clone();
        tables.intersect_with(&dt.table_set);
        let plan_record = Plan {
            root,
            cost: state.cost,
            tables,
            columns: state.columns.clone(),
            input: PlanObjectSet::new(),
            builds: state.builds.clone(),
            fully_imported: PlanObjectSet::new(),
        };
        let kept = state.plans.add_plan(plan_record);
        if kept && self.options.trace_level & OptimizerOptions::TRACE_RETAINED != 0 {
            debug!(cost = state.cost.total(), "retained plan");
        }
        saver.restore(state);
        Ok(())
    }

    /// A reducing semijoin imported from the probe side: builds on the
    /// existence table and semijoins the partial plan against it.
    fn place_existence(
        &mut self,
        plan: RelId,
        existence: &PlanObjectSet,
        state: &mut PlanState,
    ) -> Result<RelId> {
        let Some(table) = existence.first() else {
            return Ok(plan);
        };
        let dt = context::derived_table(state.dt);
        // The edge connecting the existence table to a placed build table.
        let edge = dt
            .joins
            .iter()
            .map(|&e| context::join_edge(e))
            .find(|e| {
                (e.left == table && state.placed.contains(e.right))
                    || (e.right == table && state.placed.contains(e.left))
            })
            .ok_or_else(|| OptError::unsupported("existence table has no edge to build"))?;
        let (probe_keys, build_keys, toward) = if edge.right == table {
            (edge.left_keys.clone(), edge.right_keys.clone(), edge.lr_fanout)
        } else {
            (edge.right_keys.clone(), edge.left_keys.clone(), edge.rl_fanout)
        };

        let build = self.scan_rel(table, state)?;
        let build_rows = context::rel(build).cost.out_cardinality();
        let mut cost_acc = state.cost;
        cost_acc.setup_cost += context::rel(build).cost.total();

        self.build_counter += 1;
        let build_values: Vec<_> = context::rel(build)
            .columns
            .iter()
            .map(|&c| context::expr(c).value)
            .collect();
        let hb_cost = cost::hash_build_cost(build_keys.len(), build_rows, &build_values);
        let hash_build = context::add_rel(RelNode {
            id: ObjectId(0),
            kind: RelKind::HashBuild {
                keys: build_keys.clone(),
                build_id: self.build_counter,
            },
            inputs: vec![build],
            columns: context::rel(build).columns,
            distribution: context::rel(build).distribution,
            cost: hb_cost,
        })?;
        cost_acc.setup_cost += hb_cost.unit_cost * build_rows.max(1.0);

        let fanout = toward.min(1.0);
        let join_cost = cost::hash_join_cost(build_rows, 0, probe_keys.len(), fanout, cost_acc.fanout);
        let join = context::add_rel(RelNode {
            id: ObjectId(0),
            kind: RelKind::Join {
                method: JoinMethod::Hash,
                join_type: JoinType::Semi,
                left_keys: probe_keys,
                right_keys: build_keys,
                filter: Vec::new(),
                fanout,
            },
            inputs: vec![plan, hash_build],
            columns: context::rel(plan).columns,
            distribution: context::rel(plan).distribution,
            cost: join_cost,
        })?;
        state.cost = cost_acc;
        state.add_cost(&join_cost);
        state.builds.push(hash_build);
        Ok(join)
    }

    /// Group by, order by, limit and the final projection on top of a
    /// completed join tree. With an order-by present, the limit is pushed
    /// into it (a top-N during lowering) and the projection goes on top;
    /// otherwise the projection precedes the limit.
    fn add_postprocess(&mut self, plan: RelId, state: &mut PlanState) -> Result<RelId> {
        let dt = context::derived_table(state.dt);
        let distributed = !self.frag.is_single_node();
        let mut root = plan;

        if let Some(agg) = &dt.aggregation {
            root = self.add_aggregation(root, agg, state)?;
        }

        if !dt.order_keys.is_empty() {
            let node = context::rel(root);
            let values: Vec<_> = node
                .columns
                .iter()
                .map(|&c| context::expr(c).value)
                .collect();
            let order_cost = cost::order_by_cost(cost::byte_size(&values), state.cost.fanout);
            // Lowering ends a distributed order-by on a single merging
            // consumer.
            let distribution = Distribution {
                partition: Vec::new(),
                order: dt.order_keys.clone(),
                order_types: dt.order_types.clone(),
                is_gather: distributed,
                is_broadcast: false,
            };
            root = context::add_rel(RelNode {
                id: ObjectId(0),
                kind: RelKind::OrderBy {
                    limit: dt.limit,
                    offset: dt.offset,
                },
                inputs: vec![root],
                columns: node.columns,
                distribution,
                cost: order_cost,
            })?;
            state.add_cost(&order_cost);
            if dt.has_limit() {
                let limit_cost = cost::limit_cost(dt.limit, state.cost.fanout);
                state.add_cost(&limit_cost);
            }
            root = self.add_final_project(root, &dt, state)?;
            return Ok(root);
        }

        root = self.add_final_project(root, &dt, state)?;

        if dt.has_limit() {
            let node = context::rel(root);
            let limit_cost = cost::limit_cost(dt.limit, state.cost.fanout);
            let mut distribution = node.distribution.clone();
            distribution.is_gather = distributed;
            root = context::add_rel(RelNode {
                id: ObjectId(0),
                kind: RelKind::Limit {
                    offset: dt.offset,
                    count: dt.limit,
                },
                inputs: vec![root],
                columns: node.columns,
                distribution,
                cost: limit_cost,
            })?;
            state.add_cost(&limit_cost);
        }
        Ok(root)
    }

    fn add_final_project(
        &mut self,
        plan: RelId,
        dt: &DerivedTable,
        state: &mut PlanState,
    ) -> Result<RelId> {
        if dt.columns.is_empty() || dt.columns == context::rel(plan).columns {
            return Ok(plan);
        }
        let node = context::rel(plan);
        let project_cost = Cost {
            unit_cost: 0.1 * dt.exprs.len() as f64,
            fanout: 1.0,
            input_cardinality: state.cost.fanout,
            ..Default::default()
        };
        let root = context::add_rel(RelNode {
            id: ObjectId(0),
            kind: RelKind::Project {
                exprs: dt.exprs.clone(),
            },
            inputs: vec![plan],
            columns: dt.columns.clone(),
            distribution: node.distribution,
            cost: project_cost,
        })?;
        state.add_cost(&project_cost);
        Ok(root)
    }

    /// Single aggregation when the input is already partitioned on the
    /// grouping keys (or execution is single-node); otherwise partial +
    /// repartition + final.
    fn add_aggregation(
        &mut self,
        plan: RelId,
        agg: &crate::graph::AggregationSpec,
        state: &mut PlanState,
    ) -> Result<RelId> {
        let key_domain: f64 = agg
            .grouping
            .iter()
            .map(|&k| context::expr(k).value.cardinality)
            .fold(1.0, |a, c| a * c.max(1.0));
        let mut out_columns = agg.grouping.clone();
        out_columns.extend(agg.agg_columns.iter().copied());
        let row_values: Vec<_> = out_columns
            .iter()
            .map(|&c| context::expr(c).value)
            .collect();
        let row_bytes = cost::byte_size(&row_values);

        let input_dist = context::rel(plan).distribution;
        let colocated = !agg.grouping.is_empty() && input_dist.is_colocated_for(&agg.grouping);
        let single = self.frag.is_single_node() || colocated;

        if single {
            let agg_cost =
                cost::aggregation_cost(key_domain, agg.grouping.len(), row_bytes, state.cost.fanout);
            let rel = context::add_rel(RelNode {
                id: ObjectId(0),
                kind: RelKind::Aggregation {
                    step: AggStep::Single,
                    grouping: agg.grouping.clone(),
                    aggregates: agg.aggregates.clone(),
                },
                inputs: vec![plan],
                columns: out_columns,
                distribution: input_dist,
                cost: agg_cost,
            })?;
            state.add_cost(&agg_cost);
            return Ok(rel);
        }

        // Partial on the workers, shuffle on the grouping keys (gather for a
        // global aggregate), then final.
        let partial_cost =
            cost::aggregation_cost(key_domain, agg.grouping.len(), row_bytes, state.cost.fanout);
        let partial = context::add_rel(RelNode {
            id: ObjectId(0),
            kind: RelKind::Aggregation {
                step: AggStep::Partial,
                grouping: agg.grouping.clone(),
                aggregates: agg.aggregates.clone(),
            },
            inputs: vec![plan],
            columns: out_columns.clone(),
            distribution: input_dist,
            cost: partial_cost,
        })?;
        state.add_cost(&partial_cost);

        let target = if agg.grouping.is_empty() {
            Distribution::gather()
        } else {
            Distribution::hashed(agg.grouping.clone())
        };
        let (shuffle, shuffle_cost) = self.add_repartition(partial, target.clone())?;
        state.add_cost(&shuffle_cost);

        let final_cost =
            cost::aggregation_cost(key_domain, agg.grouping.len(), row_bytes, state.cost.fanout);
        let final_agg = context::add_rel(RelNode {
            id: ObjectId(0),
            kind: RelKind::Aggregation {
                step: AggStep::Final,
                grouping: agg.grouping.clone(),
                aggregates: agg.aggregates.clone(),
            },
            inputs: vec![shuffle],
            columns: out_columns,
            distribution: target,
            cost: final_cost,
        })?;
        state.add_cost(&final_cost);
        Ok(final_agg)
    }
}

/// Combined join fanout including existence selectivity, adjusted for the
/// join type's semantics.
fn join_fanout(join_type: JoinType, fanout: f64, exists_fanout: f64) -> f64 {
    let combined = fanout * exists_fanout;
    match join_type {
        JoinType::Semi | JoinType::RightSemi => combined.min(1.0),
        JoinType::Anti => (1.0 - combined.min(1.0)).max(0.05),
        JoinType::Left => combined.max(1.0),
        _ => combined,
    }
}

/// Cutoff check before keeping a candidate for recursion.
fn push_next_join(state: &PlanState, next: NextJoin, to_try: &mut Vec<NextJoin>) {
    if state.has_cutoff
        && state.plans.best_cost_with_shuffle != 0.0
        && next.cost.total() > state.plans.best_cost_with_shuffle
    {
        return;
    }
    to_try.push(next);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextGuard;
    use crate::graph::ToGraph;
    use crate::history::NoHistory;
    use crate::logical::{self, PlanBuilder};
    use crate::relop::rel_text;
    use crate::schema::InMemorySchema;
    use crate::types::DataType;

    fn tpch_mini_schema() -> InMemorySchema {
        let mut schema = InMemorySchema::new();
        schema.add_table_with_stats(
            "lineitem",
            6_000_000.0,
            &[
                ("l_orderkey", DataType::Bigint, 1_500_000.0),
                ("l_suppkey", DataType::Bigint, 10_000.0),
                ("l_extendedprice", DataType::Double, 1_000_000.0),
            ],
        );
        schema.add_table_with_stats(
            "orders",
            1_500_000.0,
            &[
                ("o_orderkey", DataType::Bigint, 1_500_000.0),
                ("o_custkey", DataType::Bigint, 100_000.0),
            ],
        );
        schema.add_table_with_stats(
            "supplier",
            10_000.0,
            &[
                ("s_suppkey", DataType::Bigint, 10_000.0),
                ("s_nationkey", DataType::Bigint, 25.0),
            ],
        );
        schema
    }

    fn three_way_join(schema: &InMemorySchema) -> crate::logical::LogicalPlanRef {
        let orders = PlanBuilder::new(schema).table_scan("orders").unwrap().build().unwrap();
        let supplier = PlanBuilder::new(schema).table_scan("supplier").unwrap().build().unwrap();
        let builder = PlanBuilder::new(schema).table_scan("lineitem").unwrap();
        let l_orderkey = builder.col("l_orderkey").unwrap();
        let builder = builder
            .join(
                orders,
                crate::types::JoinType::Inner,
                Some(logical::eq(
                    l_orderkey,
                    logical::input("o_orderkey", DataType::Bigint),
                )),
            )
            .unwrap();
        let l_suppkey = builder.col("l_suppkey").unwrap();
        let builder = builder
            .join(
                supplier,
                crate::types::JoinType::Inner,
                Some(logical::eq(
                    l_suppkey,
                    logical::input("s_suppkey", DataType::Bigint),
                )),
            )
            .unwrap();
        let price = builder.col("l_extendedprice").unwrap();
        builder
            .project(vec![price], vec!["l_extendedprice"])
            .unwrap()
            .build()
            .unwrap()
    }

    fn optimize_text(schema: &InMemorySchema, cutoff: bool) -> (f64, String) {
        let plan = three_way_join(schema);
        let options = OptimizerOptions::default();
        let root = ToGraph::new(schema, &options).build(&plan).unwrap();
        let mut optimization = Optimization::new(
            schema,
            &NoHistory,
            options,
            FragmentOptions {
                num_workers: 4,
                num_drivers: 4,
            },
            root,
        )
        .unwrap();
        if !cutoff {
            // Disabling the cutoff explores every join order.
            let best = optimization.plan_dt_without_cutoff().unwrap();
            return (best.cost.total(), rel_text(best.root, false));
        }
        let best = optimization.best_plan().unwrap();
        (best.cost.total(), rel_text(best.root, false))
    }

    impl<'a> Optimization<'a> {
        /// Test-only: full enumeration with pruning disabled.
        fn plan_dt_without_cutoff(&mut self) -> Result<Plan> {
            let dt = context::derived_table(self.root_dt);
            let key = MemoKey::for_tables(
                self.root_dt,
                PlanObjectSet::of(dt.columns.iter().copied()),
                dt.table_set.clone(),
            );
            let mut state = PlanState::new(dt.id);
            state.target_tables = key.tables.clone();
            state.target_columns = key.columns.clone();
            state.with_postprocess = true;
            state.has_cutoff = false;
            state
                .target_columns
                .union_with(&self.dt_referenced_columns(&dt));
            let starts: Vec<ObjectId> = key.tables.iter().collect();
            for start in starts {
                let saver = PlanStateSaver::save(&state);
                if let Ok(plan) = self.place_table(start, &mut state) {
                    self.make_joins(plan, &mut state)?;
                }
                saver.restore(&mut state);
            }
            state
                .plans
                .best(&Distribution::any())
                .map(|(p, _)| p.clone())
                .ok_or_else(|| OptError::unsupported("no plan"))
        }
    }

    #[test]
    fn test_three_way_join_plans_all_tables() {
        let _guard = ContextGuard::install();
        let schema = tpch_mini_schema();
        let (cost, text) = optimize_text(&schema, true);
        assert!(cost > 0.0);
        assert_eq!(text.matches("scan").count(), 3, "{text}");
        assert_eq!(text.matches("join").count(), 2, "{text}");
    }

    #[test]
    fn test_cutoff_soundness() {
        // Disabling the cutoff may only find plans at least as good.
        let guard = ContextGuard::install();
        let schema = tpch_mini_schema();
        let (with_cutoff, _) = optimize_text(&schema, true);
        drop(guard);
        let _guard = ContextGuard::install();
        let (without_cutoff, _) = optimize_text(&schema, false);
        assert!(without_cutoff <= with_cutoff * 1.0001);
    }

    #[test]
    fn test_deterministic_enumeration() {
        let guard = ContextGuard::install();
        let schema = tpch_mini_schema();
        let (_, first) = optimize_text(&schema, true);
        drop(guard);
        let _guard = ContextGuard::install();
        let (_, second) = optimize_text(&schema, true);
        assert_eq!(first, second);
    }
}
