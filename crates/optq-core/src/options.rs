//! Optimization and fragmentation options.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Knobs for one optimization run.
#[derive(Debug, Clone)]
pub struct OptimizerOptions {
    /// Bit mask of trace events to log (retained plans, cutoff hits, memo
    /// samples). 0 is silent.
    pub trace_level: i32,
    /// Narrow scans of complex-typed columns to the accessed subfields.
    pub push_down_subfields: bool,
    /// Map columns to read as a struct of their accessed keys, per table.
    pub map_as_struct: HashMap<String, Vec<String>>,
    /// Percent of rows to sample when refreshing leaf selectivities.
    pub sample_pct: f64,
    /// Propagated to the runner: build bloom filters from join builds to
    /// pre-filter probes.
    pub pre_filter_bf: bool,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            trace_level: 0,
            push_down_subfields: true,
            map_as_struct: HashMap::new(),
            sample_pct: 1.0,
            pre_filter_bf: false,
        }
    }
}

impl OptimizerOptions {
    pub const TRACE_RETAINED: i32 = 1;
    pub const TRACE_EXCEEDED_BEST: i32 = 2;
    pub const TRACE_SAMPLE: i32 = 4;

    pub fn is_map_as_struct(&self, table: &str, column: &str) -> bool {
        self.map_as_struct
            .get(table)
            .is_some_and(|columns| columns.iter().any(|c| c == column))
    }
}

/// Shape of the produced multi-fragment plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FragmentOptions {
    pub num_workers: u32,
    pub num_drivers: u32,
}

impl Default for FragmentOptions {
    fn default() -> Self {
        Self {
            num_workers: 5,
            num_drivers: 5,
        }
    }
}

impl FragmentOptions {
    pub fn is_single_node(&self) -> bool {
        self.num_workers <= 1
    }

    pub fn is_single_stream(&self) -> bool {
        self.num_workers <= 1 && self.num_drivers <= 1
    }
}
