//! # Executable Fragments
//!
//! The runner-facing plan: an ordered sequence of fragments, each a tree of
//! physical nodes plus the input stages it consumes. Plan-node ids are
//! strings `"0"`, `"1"`, ...; the runner receives no other plan metadata
//! from the optimizer.

use optq_core::options::FragmentOptions;
use optq_core::relop::AggStep;
use optq_core::schema::{ColumnHandle, TableHandle};
use optq_core::types::{JoinType, OrderType, RowType, ScalarValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference from a consuming exchange node to the fragment that feeds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputStage {
    /// Id of the exchange node in the consuming fragment.
    pub consumer_node_id: String,
    /// Task prefix of the producing fragment.
    pub producer_task_prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitStep {
    Partial,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputKind {
    Partitioned,
    Broadcast,
    Gather,
}

/// One node of a fragment's operator tree. Expressions are carried in their
/// canonical text form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PhysicalKind {
    TableScan {
        handle: TableHandle,
        columns: Vec<ColumnHandle>,
    },
    /// Index lookup into a table, driven by the keys of its input.
    IndexLookup {
        handle: TableHandle,
        columns: Vec<ColumnHandle>,
        keys: Vec<String>,
    },
    Values {
        row_type: RowType,
        rows: Vec<Vec<ScalarValue>>,
    },
    Filter {
        predicate: String,
    },
    Project {
        names: Vec<String>,
        exprs: Vec<String>,
    },
    HashJoin {
        join_type: JoinType,
        left_keys: Vec<String>,
        right_keys: Vec<String>,
        filter: Option<String>,
    },
    NestedLoopJoin {
        join_type: JoinType,
    },
    Aggregation {
        step: AggStep,
        keys: Vec<String>,
        aggregates: Vec<String>,
    },
    OrderBy {
        keys: Vec<String>,
        orders: Vec<OrderType>,
    },
    TopN {
        keys: Vec<String>,
        orders: Vec<OrderType>,
        count: i64,
    },
    /// Merge of already-sorted driver-local streams.
    LocalMerge {
        keys: Vec<String>,
        orders: Vec<OrderType>,
    },
    /// Driver-local round-robin exchange.
    LocalPartition,
    Limit {
        step: LimitStep,
        offset: i64,
        count: i64,
    },
    PartitionedOutput {
        kind: OutputKind,
        keys: Vec<String>,
        num_partitions: u32,
    },
    Exchange,
    MergeExchange {
        keys: Vec<String>,
        orders: Vec<OrderType>,
    },
    UnionAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalNode {
    pub id: String,
    pub kind: PhysicalKind,
    pub inputs: Vec<PhysicalNode>,
}

impl PhysicalNode {
    pub fn name(&self) -> &'static str {
        match &self.kind {
            PhysicalKind::TableScan { .. } => "table-scan",
            PhysicalKind::IndexLookup { .. } => "index-lookup",
            PhysicalKind::Values { .. } => "values",
            PhysicalKind::Filter { .. } => "filter",
            PhysicalKind::Project { .. } => "project",
            PhysicalKind::HashJoin { .. } => "hash-join",
            PhysicalKind::NestedLoopJoin { .. } => "nested-loop-join",
            PhysicalKind::Aggregation {
                step: AggStep::Partial,
                ..
            } => "partial-aggregation",
            PhysicalKind::Aggregation {
                step: AggStep::Final,
                ..
            } => "final-aggregation",
            PhysicalKind::Aggregation { .. } => "aggregation",
            PhysicalKind::OrderBy { .. } => "order-by",
            PhysicalKind::TopN { .. } => "top-n",
            PhysicalKind::LocalMerge { .. } => "local-merge",
            PhysicalKind::LocalPartition => "local-partition",
            PhysicalKind::Limit {
                step: LimitStep::Partial,
                ..
            } => "partial-limit",
            PhysicalKind::Limit { .. } => "final-limit",
            PhysicalKind::PartitionedOutput { .. } => "partitioned-output",
            PhysicalKind::Exchange => "exchange",
            PhysicalKind::MergeExchange { .. } => "merge-exchange",
            PhysicalKind::UnionAll => "union-all",
        }
    }

    /// Node names from source to sink along the first-input spine, e.g.
    /// `["table-scan", "project", "final-limit"]`. Tests match plan shapes
    /// with this.
    pub fn spine(&self) -> Vec<&'static str> {
        let mut names = match self.inputs.first() {
            Some(input) => input.spine(),
            None => Vec::new(),
        };
        names.push(self.name());
        names
    }

    fn fmt_tree(&self, indent: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}{} #{}", "  ".repeat(indent), self.name(), self.id)?;
        for input in &self.inputs {
            input.fmt_tree(indent + 1, f)?;
        }
        Ok(())
    }
}

impl fmt::Display for PhysicalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_tree(0, f)
    }
}

/// One stage of the distributed plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutableFragment {
    pub task_prefix: String,
    /// Number of workers running this fragment.
    pub width: u32,
    pub root: PhysicalNode,
    /// Node ids of the table scans in this fragment.
    pub scans: Vec<String>,
    pub num_broadcast_destinations: u32,
    pub input_stages: Vec<InputStage>,
}

/// The fragmented plan handed to the runner. Producing fragments precede
/// their consumers; the last fragment is the top of the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiFragmentPlan {
    pub fragments: Vec<ExecutableFragment>,
    pub options: FragmentOptions,
}

impl MultiFragmentPlan {
    /// True if the input-stage graph has no cycles. The construction emits
    /// producers before consumers, so a producer referenced by an earlier
    /// fragment is a defect.
    pub fn is_acyclic(&self) -> bool {
        for (index, fragment) in self.fragments.iter().enumerate() {
            for stage in &fragment.input_stages {
                let producer = self
                    .fragments
                    .iter()
                    .position(|f| f.task_prefix == stage.producer_task_prefix);
                match producer {
                    Some(p) if p < index => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

impl fmt::Display for MultiFragmentPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for fragment in &self.fragments {
            writeln!(
                f,
                "fragment {} width {} inputs [{}]",
                fragment.task_prefix,
                fragment.width,
                fragment
                    .input_stages
                    .iter()
                    .map(|s| format!("{}<-{}", s.consumer_node_id, s.producer_task_prefix))
                    .collect::<Vec<_>>()
                    .join(", ")
            )?;
            write!(f, "{}", fragment.root)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optq_core::schema::TableHandle;

    fn scan_node() -> PhysicalNode {
        PhysicalNode {
            id: "0".to_string(),
            kind: PhysicalKind::TableScan {
                handle: TableHandle {
                    table: "nation".to_string(),
                    layout: 0,
                    pushdown_filters: vec!["gt(n_regionkey, 2)".to_string()],
                },
                columns: Vec::new(),
            },
            inputs: Vec::new(),
        }
    }

    #[test]
    fn test_spine() {
        let limit = PhysicalNode {
            id: "1".to_string(),
            kind: PhysicalKind::Limit {
                step: LimitStep::Final,
                offset: 0,
                count: 10,
            },
            inputs: vec![scan_node()],
        };
        assert_eq!(limit.spine(), vec!["table-scan", "final-limit"]);
    }

    #[test]
    fn test_fragment_wire_round_trip() {
        let plan = MultiFragmentPlan {
            fragments: vec![ExecutableFragment {
                task_prefix: "stage0".to_string(),
                width: 1,
                root: scan_node(),
                scans: vec!["0".to_string()],
                num_broadcast_destinations: 0,
                input_stages: Vec::new(),
            }],
            options: FragmentOptions {
                num_workers: 1,
                num_drivers: 1,
            },
        };
        let json = serde_json::to_string(&plan).expect("serialize");
        let parsed: MultiFragmentPlan = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.fragments.len(), 1);
        assert_eq!(parsed.fragments[0].root.name(), "table-scan");
        assert!(parsed.is_acyclic());
    }

    #[test]
    fn test_acyclicity_detects_forward_reference() {
        let mut fragment = ExecutableFragment {
            task_prefix: "stage0".to_string(),
            width: 1,
            root: scan_node(),
            scans: Vec::new(),
            num_broadcast_destinations: 0,
            input_stages: Vec::new(),
        };
        fragment.input_stages.push(InputStage {
            consumer_node_id: "9".to_string(),
            producer_task_prefix: "stage1".to_string(),
        });
        let plan = MultiFragmentPlan {
            fragments: vec![fragment],
            options: FragmentOptions {
                num_workers: 1,
                num_drivers: 1,
            },
        };
        assert!(!plan.is_acyclic());
    }
}
