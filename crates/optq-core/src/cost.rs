//! # Cost Model
//!
//! Per-operation costs for the target system. The base unit is the time to
//! memcpy one cache line in a large memcpy on one core, ~6GB/s, so ~10ns.
//! Other times are multiples of that.
//!
//! A [`Cost`] composes along the left-deep spine of a plan: the accumulated
//! unit cost is the sum of each op's unit cost multiplied by the product of
//! the fanouts of everything below it; setup cost adds outside the product.
//! For leaf ops the fanout is the output cardinality and the unit cost is the
//! total cost.

use crate::expr::Value;
use crate::object::ExprId;
use serde::{Deserialize, Serialize};

/// Shuffle cost per byte, ~500MB/s.
pub const BYTE_SHUFFLE_COST: f64 = 12.0;
/// ~30 instructions to find, decode and compare a key.
pub const KEY_COMPARE_COST: f64 = 6.0;
/// ~10 instructions.
pub const ARRAY_PROBE_COST: f64 = 2.0;
/// ~50 instructions.
pub const SMALL_HASH_COST: f64 = 10.0;
/// Two LLC misses.
pub const LARGE_HASH_COST: f64 = 40.0;
pub const COLUMN_ROW_COST: f64 = 5.0;
pub const COLUMN_BYTE_COST: f64 = 0.1;
/// Hash function on one column.
pub const HASH_COLUMN_COST: f64 = 0.5;
/// Getting a column out of a hash table.
pub const HASH_EXTRACT_COLUMN_COST: f64 = 0.5;
/// Minimal cost of calling a filter function.
pub const MINIMUM_FILTER_COST: f64 = 2.0;

/// Probe cost as a step function of the table's cardinality: in-cache array,
/// small hash table, large hash table.
pub fn hash_probe_cost(cardinality: f64) -> f64 {
    if cardinality < 10_000.0 {
        ARRAY_PROBE_COST
    } else if cardinality < 500_000.0 {
        SMALL_HASH_COST
    } else {
        LARGE_HASH_COST
    }
}

/// Cost of one index lookup over `range` candidate rows. The +2 makes a
/// repeat hit of the same row still cost a compare and an access.
pub fn lookup_cost(range: f64) -> f64 {
    KEY_COMPARE_COST * (range + 2.0).log2()
}

/// Estimated byte width of one row of the given expressions.
pub fn byte_size(values: &[Value]) -> f64 {
    values.iter().map(|v| v.data_type.byte_width()).sum()
}

pub fn byte_size_of(exprs: &[ExprId]) -> f64 {
    exprs
        .iter()
        .map(|&e| crate::context::expr(e).value.data_type.byte_width())
        .sum()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Cost {
    /// Cost per input row for interior ops; total cost for leaves.
    pub unit_cost: f64,
    /// One-time cost independent of input cardinality.
    pub setup_cost: f64,
    /// Output rows per input row; output cardinality for leaves.
    pub fanout: f64,
    /// Bytes of transient memory, e.g. a hash table.
    pub total_bytes: f64,
    /// Bytes moved across workers.
    pub transfer_bytes: f64,
    /// Rows arriving at this op.
    pub input_cardinality: f64,
}

impl Default for Cost {
    fn default() -> Self {
        Self {
            unit_cost: 0.0,
            setup_cost: 0.0,
            fanout: 1.0,
            total_bytes: 0.0,
            transfer_bytes: 0.0,
            input_cardinality: 0.0,
        }
    }
}

impl Cost {
    /// Accumulator for a partial plan: starts with no cost and a cardinality
    /// multiplier of one.
    pub fn accumulator() -> Self {
        Self::default()
    }

    /// Output cardinality of the op this cost belongs to.
    pub fn out_cardinality(&self) -> f64 {
        self.fanout * self.input_cardinality.max(1.0)
    }

    /// Folds an op's cost into this accumulator. `self.fanout` is the row
    /// count flowing into the op (1.0 before any leaf is placed).
    pub fn add_op(&mut self, op: &Cost) {
        self.unit_cost += self.fanout.max(1.0) * op.unit_cost;
        self.setup_cost += op.setup_cost;
        self.total_bytes += op.total_bytes;
        self.transfer_bytes += op.transfer_bytes;
        self.fanout *= op.fanout;
    }

    /// Comparable scalar; lower wins.
    pub fn total(&self) -> f64 {
        self.unit_cost + self.setup_cost
    }
}

/// Leaf cost shared by full scans and values: fanout is the cardinality,
/// unit cost is the total cost of producing it.
pub fn leaf_cost(cardinality: f64, columns: &[Value]) -> Cost {
    let size = byte_size(columns);
    let num_columns = columns.len() as f64;
    let row_cost =
        num_columns * COLUMN_ROW_COST + (size - 8.0 * num_columns).max(0.0) * COLUMN_BYTE_COST;
    Cost {
        unit_cost: cardinality * row_cost,
        fanout: cardinality,
        ..Default::default()
    }
}

/// Index lookup scan: amortizes the lookup over a batch of up to 10k probe
/// rows. `lookup_range` is the indexed cardinality, `prefix_selectivity` the
/// combined cardinality of the matched key prefix.
pub fn index_scan_cost(
    lookup_range: f64,
    prefix_selectivity: f64,
    fanout: f64,
    input_cardinality: f64,
) -> Cost {
    let distance = lookup_range / prefix_selectivity.max(1.0);
    let batch_size = input_cardinality.min(10_000.0);
    let batch_cost = lookup_cost(lookup_range) + lookup_cost(distance) * batch_size.max(1.0);
    Cost {
        unit_cost: batch_cost / batch_size.max(1.0),
        fanout,
        input_cardinality,
        ..Default::default()
    }
}

pub fn hash_build_cost(num_keys: usize, input_cardinality: f64, input_columns: &[Value]) -> Cost {
    Cost {
        unit_cost: num_keys as f64 * HASH_COLUMN_COST
            + hash_probe_cost(input_cardinality)
            + 2.0 * input_columns.len() as f64 * HASH_EXTRACT_COLUMN_COST,
        fanout: 1.0,
        total_bytes: input_cardinality * byte_size(input_columns),
        input_cardinality,
        ..Default::default()
    }
}

pub fn hash_join_cost(
    build_size: f64,
    num_build_columns: usize,
    num_probe_keys: usize,
    fanout: f64,
    input_cardinality: f64,
) -> Cost {
    Cost {
        unit_cost: hash_probe_cost(build_size)
            + fanout * num_build_columns as f64 * HASH_EXTRACT_COLUMN_COST
            + num_probe_keys as f64 * HASH_COLUMN_COST,
        fanout,
        input_cardinality,
        ..Default::default()
    }
}

/// Expected distinct groups after `n` input rows over a key domain of `d`:
/// `d - d * (1 - 1/d)^n`, which approaches `d` as `n` grows.
pub fn expected_groups(key_domain: f64, input_cardinality: f64) -> f64 {
    let d = key_domain.max(1.0);
    (d - d * (1.0 - 1.0 / d).powf(input_cardinality)).max(1.0)
}

pub fn aggregation_cost(
    key_domain: f64,
    num_keys: usize,
    row_byte_size: f64,
    input_cardinality: f64,
) -> Cost {
    let groups = expected_groups(key_domain, input_cardinality);
    Cost {
        unit_cost: num_keys as f64 * hash_probe_cost(groups),
        fanout: groups / input_cardinality.max(1.0),
        total_bytes: groups * row_byte_size,
        input_cardinality,
        ..Default::default()
    }
}

/// Each conjunct is assumed to select 4/5. The small effect leaves the better
/// known scan and join selectivities with more influence on plan cardinality;
/// history overrides it per base table.
pub fn filter_cost(num_conjuncts: usize, input_cardinality: f64) -> Cost {
    Cost {
        unit_cost: MINIMUM_FILTER_COST * num_conjuncts as f64,
        fanout: 0.8f64.powi(num_conjuncts as i32),
        input_cardinality,
        ..Default::default()
    }
}

pub fn repartition_cost(columns: &[Value], input_cardinality: f64) -> Cost {
    let size = byte_size(columns);
    Cost {
        unit_cost: size * BYTE_SHUFFLE_COST,
        fanout: 1.0,
        transfer_bytes: input_cardinality * size,
        input_cardinality,
        ..Default::default()
    }
}

pub fn limit_cost(limit: i64, input_cardinality: f64) -> Cost {
    let fanout = if input_cardinality <= limit as f64 {
        1.0
    } else {
        limit as f64 / input_cardinality.max(1.0)
    };
    Cost {
        unit_cost: 0.01,
        fanout,
        input_cardinality,
        ..Default::default()
    }
}

pub fn order_by_cost(row_byte_size: f64, input_cardinality: f64) -> Cost {
    Cost {
        unit_cost: KEY_COMPARE_COST * (input_cardinality + 2.0).log2(),
        fanout: 1.0,
        total_bytes: input_cardinality * row_byte_size,
        input_cardinality,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    #[test]
    fn test_hash_probe_steps() {
        assert_eq!(hash_probe_cost(100.0), ARRAY_PROBE_COST);
        assert_eq!(hash_probe_cost(100_000.0), SMALL_HASH_COST);
        assert_eq!(hash_probe_cost(1_000_000.0), LARGE_HASH_COST);
    }

    #[test]
    fn test_left_spine_composition() {
        let mut acc = Cost::accumulator();
        let leaf = leaf_cost(1000.0, &[Value::new(DataType::Bigint, 1000.0)]);
        acc.add_op(&leaf);
        assert!((acc.fanout - 1000.0).abs() < 1e-9);

        let filter = filter_cost(1, acc.fanout);
        acc.add_op(&filter);
        // Filter's per-row cost is scaled by the 1000 rows flowing in.
        assert!((acc.fanout - 800.0).abs() < 1e-9);
        assert!(acc.unit_cost > leaf.unit_cost);
    }

    #[test]
    fn test_expected_groups_monotone_in_domain() {
        let n = 10_000.0;
        let mut last = 0.0;
        for d in [10.0, 100.0, 1000.0, 100_000.0] {
            let g = expected_groups(d, n);
            assert!(g >= last);
            last = g;
        }
        // Never more groups than the domain.
        assert!(expected_groups(50.0, 1e9) <= 50.0 + 1e-6);
    }

    #[test]
    fn test_limit_fanout() {
        let c = limit_cost(10, 1000.0);
        assert!((c.fanout - 0.01).abs() < 1e-9);
        let noop = limit_cost(10, 5.0);
        assert!((noop.fanout - 1.0).abs() < 1e-9);
    }
}
