//! # Memo
//!
//! Costed plans and the memo that caches them. Any table or derived table
//! with a particular set of projected columns and an optional set of reducing
//! joins and semijoins (existences) is planned once; the resulting
//! [`PlanSet`] may hold several plans with different output orders and
//! distributions, and `best_cost_with_shuffle` gates branch-and-bound
//! pruning: with a cutoff enabled, nothing more expensive than the best plan
//! plus a shuffle is worth trying.

use crate::cost::{self, Cost};
use crate::object::{ObjectId, PlanObjectSet, RelId};
use crate::relop::Distribution;

/// A fully costed physical plan for some coverage of tables.
#[derive(Debug, Clone)]
pub struct Plan {
    pub root: RelId,
    pub cost: Cost,
    /// Tables of the join graph covered by this plan. For a derived table
    /// the covered object is the derived table, not its constituents.
    pub tables: PlanObjectSet,
    /// Produced columns, including input columns.
    pub columns: PlanObjectSet,
    /// Columns fixed on input, for index paths into a derived table.
    pub input: PlanObjectSet,
    /// Hash join builds placed in the plan; a build can be reused.
    pub builds: Vec<RelId>,
    /// Tables fully imported into this plan that enclosing plans need not
    /// address again.
    pub fully_imported: PlanObjectSet,
}

/// All interesting plans for one (table set, column set): the best by cost
/// plus any plan with a useful output order.
#[derive(Debug, Default)]
pub struct PlanSet {
    pub plans: Vec<Plan>,
    /// Cost of the cheapest plan plus a shuffle of its output. 0 until a
    /// first plan lands.
    pub best_cost_with_shuffle: f64,
}

impl PlanSet {
    /// The best plan that produces `distribution`; falls back to the overall
    /// best with `needs_shuffle` set.
    pub fn best(&self, distribution: &Distribution) -> Option<(&Plan, bool)> {
        let mut best: Option<&Plan> = None;
        let mut best_matching: Option<&Plan> = None;
        for plan in &self.plans {
            if best.map_or(true, |b| plan.cost.total() < b.cost.total()) {
                best = Some(plan);
            }
            let dist = crate::context::rel(plan.root).distribution;
            if dist.satisfies(distribution)
                && best_matching.map_or(true, |b| plan.cost.total() < b.cost.total())
            {
                best_matching = Some(plan);
            }
        }
        match (best_matching, best) {
            (Some(matching), _) => Some((matching, false)),
            (None, Some(best)) => Some((best, true)),
            (None, None) => None,
        }
    }

    /// Retains `plan` if it is interesting: cheaper than the best so far, or
    /// carrying an output order no cheaper plan has. Returns whether it was
    /// kept.
    pub fn add_plan(&mut self, plan: Plan) -> bool {
        let total = plan.cost.total();
        let order = crate::context::rel(plan.root).distribution.order.clone();
        let beats_all = self
            .plans
            .iter()
            .all(|existing| total < existing.cost.total());
        let interesting_order = !order.is_empty()
            && !self.plans.iter().any(|existing| {
                existing.cost.total() <= total
                    && crate::context::rel(existing.root).distribution.order == order
            });
        if !self.plans.is_empty() && !beats_all && !interesting_order {
            return false;
        }

        if beats_all {
            // Orderless plans that just lost are no longer interesting.
            self.plans.retain(|existing| {
                !crate::context::rel(existing.root).distribution.order.is_empty()
            });
            let out_columns: Vec<_> = crate::context::rel(plan.root)
                .columns
                .iter()
                .map(|&c| crate::context::expr(c).value)
                .collect();
            let shuffle_unit = cost::byte_size(&out_columns) * cost::BYTE_SHUFFLE_COST;
            self.best_cost_with_shuffle =
                total + shuffle_unit * plan.cost.out_cardinality().max(1.0);
        }
        self.plans.push(plan);
        true
    }
}

/// Canonical identifier of a memoized subproblem: the first table, the
/// projected columns, the reducing joins applied (including the table
/// itself), and reducing semijoin sets imported from the probe side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoKey {
    pub first_table: ObjectId,
    pub columns: PlanObjectSet,
    pub tables: PlanObjectSet,
    pub existences: Vec<PlanObjectSet>,
}

impl MemoKey {
    pub fn for_tables(
        first_table: ObjectId,
        columns: PlanObjectSet,
        tables: PlanObjectSet,
    ) -> Self {
        Self {
            first_table,
            columns,
            tables,
            existences: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_memo_key_equality() {
        let columns = PlanObjectSet::of([ObjectId(3), ObjectId(4)]);
        let tables = PlanObjectSet::of([ObjectId(1)]);
        let a = MemoKey::for_tables(ObjectId(1), columns.clone(), tables.clone());
        let b = MemoKey::for_tables(ObjectId(1), columns.clone(), tables.clone());
        let c = MemoKey {
            existences: vec![PlanObjectSet::of([ObjectId(9)])],
            ..a.clone()
        };
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut memo: HashMap<MemoKey, u32> = HashMap::new();
        memo.insert(a, 1);
        assert_eq!(memo.get(&b), Some(&1));
        assert_eq!(memo.get(&c), None);
    }
}
