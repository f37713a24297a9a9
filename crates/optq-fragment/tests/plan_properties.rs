//! Property tests over whole optimizations: output coverage, shuffle
//! minimality, determinism, aggregate deduplication, subfield pruning and
//! history round trips.

use optq_core::history::{FileHistory, History, HistoryRecord, NoHistory};
use optq_core::logical::{self, AggregateCall, PlanBuilder};
use optq_core::schema::InMemorySchema;
use optq_core::types::{DataType, JoinType};
use optq_core::{FragmentOptions, OptimizerOptions};
use optq_fragment::{optimize, PhysicalKind, PhysicalNode, PlanAndStats};

fn sales_schema() -> InMemorySchema {
    let mut schema = InMemorySchema::new();
    schema.add_table_with_stats(
        "sales",
        1_000_000.0,
        &[
            ("s_id", DataType::Bigint, 1_000_000.0),
            ("s_customer", DataType::Bigint, 50_000.0),
            ("s_amount", DataType::Double, 500_000.0),
        ],
    );
    schema.add_table_with_stats(
        "customer",
        50_000.0,
        &[
            ("c_id", DataType::Bigint, 50_000.0),
            ("c_region", DataType::Varchar, 50.0),
        ],
    );
    schema.add_table_with_stats(
        "events",
        100_000.0,
        &[
            ("e_id", DataType::Bigint, 100_000.0),
            (
                "e_tags",
                DataType::Map(Box::new(DataType::Varchar), Box::new(DataType::Bigint)),
                1_000.0,
            ),
        ],
    );
    schema
}

fn join_plan(schema: &InMemorySchema) -> optq_core::logical::LogicalPlanRef {
    let customer = PlanBuilder::new(schema).table_scan("customer").unwrap().build().unwrap();
    let builder = PlanBuilder::new(schema).table_scan("sales").unwrap();
    let s_customer = builder.col("s_customer").unwrap();
    let builder = builder
        .join(
            customer,
            JoinType::Inner,
            Some(logical::eq(
                s_customer,
                logical::input("c_id", DataType::Bigint),
            )),
        )
        .unwrap();
    let amount = builder.col("s_amount").unwrap();
    let region = builder.col("c_region").unwrap();
    builder
        .project(vec![amount, region], vec!["s_amount", "c_region"])
        .unwrap()
        .build()
        .unwrap()
}

fn walk<'a>(node: &'a PhysicalNode, out: &mut Vec<&'a PhysicalNode>) {
    out.push(node);
    for input in &node.inputs {
        walk(input, out);
    }
}

fn all_nodes(result: &PlanAndStats) -> Vec<&PhysicalNode> {
    let mut out = Vec::new();
    for fragment in &result.plan.fragments {
        walk(&fragment.root, &mut out);
    }
    out
}

#[test]
fn test_plan_covers_request() {
    let schema = sales_schema();
    let plan = join_plan(&schema);
    let result = optimize(
        &plan,
        &schema,
        OptimizerOptions::default(),
        &NoHistory,
        FragmentOptions {
            num_workers: 1,
            num_drivers: 1,
        },
    )
    .unwrap();

    // The top fragment's root projection produces exactly the logical
    // plan's output names.
    let top = &result.plan.fragments.last().unwrap().root;
    match &top.kind {
        PhysicalKind::Project { names, .. } => {
            assert_eq!(names, &vec!["s_amount".to_string(), "c_region".to_string()]);
        }
        other => panic!("expected project at top, got {other:?}"),
    }
}

#[test]
fn test_shuffles_only_between_incompatible_distributions() {
    let schema = sales_schema();
    let plan = join_plan(&schema);
    let distributed = optimize(
        &plan,
        &schema,
        OptimizerOptions::default(),
        &NoHistory,
        FragmentOptions {
            num_workers: 4,
            num_drivers: 4,
        },
    )
    .unwrap();
    let outputs = all_nodes(&distributed)
        .into_iter()
        .filter(|n| matches!(n.kind, PhysicalKind::PartitionedOutput { .. }))
        .count();
    // One gather at the top plus at most one alignment per join side.
    assert!((1..=3).contains(&outputs), "{}", distributed.plan);
    assert!(distributed.plan.is_acyclic());

    // Single node: no exchanges at all.
    let single = optimize(
        &plan,
        &schema,
        OptimizerOptions::default(),
        &NoHistory,
        FragmentOptions {
            num_workers: 1,
            num_drivers: 4,
        },
    )
    .unwrap();
    assert_eq!(single.plan.fragments.len(), 1);
    assert_eq!(
        all_nodes(&single)
            .into_iter()
            .filter(|n| matches!(
                n.kind,
                PhysicalKind::PartitionedOutput { .. } | PhysicalKind::Exchange
            ))
            .count(),
        0
    );
}

#[test]
fn test_memoization_equivalence() {
    let schema = sales_schema();
    let plan = join_plan(&schema);
    let run = || {
        optimize(
            &plan,
            &schema,
            OptimizerOptions::default(),
            &NoHistory,
            FragmentOptions {
                num_workers: 4,
                num_drivers: 4,
            },
        )
        .unwrap()
        .plan
        .to_string()
    };
    assert_eq!(run(), run());
}

#[test]
fn test_duplicate_aggregates_share_one_physical_aggregate() {
    let schema = sales_schema();
    let builder = PlanBuilder::new(&schema).table_scan("sales").unwrap();
    let amount = builder.col("s_amount").unwrap();
    let positive = logical::gt(builder.col("s_amount").unwrap(), logical::lit_i64(0));
    let negative = logical::lt(builder.col("s_amount").unwrap(), logical::lit_i64(0));
    let plan = builder
        .aggregate(
            vec![],
            vec![
                AggregateCall::new("sum", vec![amount.clone()], DataType::Double)
                    .with_filter(positive.clone()),
                AggregateCall::new("sum", vec![amount.clone()], DataType::Double)
                    .with_filter(negative),
                AggregateCall::new("sum", vec![amount], DataType::Double).with_filter(positive),
            ],
        )
        .unwrap()
        .build()
        .unwrap();

    let result = optimize(
        &plan,
        &schema,
        OptimizerOptions::default(),
        &NoHistory,
        FragmentOptions {
            num_workers: 1,
            num_drivers: 1,
        },
    )
    .unwrap();

    let nodes = all_nodes(&result);
    let agg = nodes
        .iter()
        .find_map(|n| match &n.kind {
            PhysicalKind::Aggregation { aggregates, .. } => Some(aggregates),
            _ => None,
        })
        .expect("aggregation node");
    assert_eq!(agg.len(), 2, "{}", result.plan);

    // The final projection repeats the first aggregate for the duplicate.
    let project = nodes
        .iter()
        .find_map(|n| match &n.kind {
            PhysicalKind::Project { names, exprs } if names.contains(&"agg0".to_string()) => {
                Some(exprs.clone())
            }
            _ => None,
        })
        .expect("final projection");
    assert_eq!(project.len(), 3);
    assert_eq!(project[0], project[2]);
    assert_ne!(project[0], project[1]);
}

#[test]
fn test_subfield_pruning_narrows_scan() {
    let schema = sales_schema();
    let builder = PlanBuilder::new(&schema).table_scan("events").unwrap();
    let tags = builder.col("e_tags").unwrap();
    let clicks = logical::subscript(tags, logical::lit_str("clicks")).unwrap();
    let plan = builder
        .filter(logical::gt(clicks, logical::lit_i64(10)))
        .unwrap()
        .project(
            vec![logical::input("e_id", DataType::Bigint)],
            vec!["e_id"],
        )
        .unwrap()
        .build()
        .unwrap();

    let mut options = OptimizerOptions::default();
    options
        .map_as_struct
        .insert("events".to_string(), vec!["e_tags".to_string()]);
    let result = optimize(
        &plan,
        &schema,
        options,
        &NoHistory,
        FragmentOptions {
            num_workers: 1,
            num_drivers: 1,
        },
    )
    .unwrap();

    let nodes = all_nodes(&result);
    let columns = nodes
        .iter()
        .find_map(|n| match &n.kind {
            PhysicalKind::TableScan { columns, .. } => Some(columns.clone()),
            _ => None,
        })
        .expect("scan node");
    let tags_handle = columns
        .iter()
        .find(|c| c.name == "e_tags")
        .expect("tags handle");
    assert_eq!(tags_handle.subfields, vec!["e_tags[\"clicks\"]".to_string()]);
    match &tags_handle.cast_to_struct {
        Some(DataType::Row(fields)) => {
            assert_eq!(fields.len(), 1);
            assert_eq!(fields[0].0, "clicks");
            assert_eq!(fields[0].1, DataType::Bigint);
        }
        other => panic!("expected struct cast, got {other:?}"),
    }
}

#[test]
fn test_history_selectivity_overrides_default() {
    let schema = sales_schema();
    let builder = PlanBuilder::new(&schema).table_scan("sales").unwrap();
    let amount = builder.col("s_amount").unwrap();
    let plan = builder
        .filter(logical::gt(amount, logical::lit_i64(100)))
        .unwrap()
        .project(
            vec![logical::input("s_id", DataType::Bigint)],
            vec!["s_id"],
        )
        .unwrap()
        .build()
        .unwrap();

    let run = |history: &dyn History| {
        let result = optimize(
            &plan,
            &schema,
            OptimizerOptions::default(),
            history,
            FragmentOptions {
                num_workers: 1,
                num_drivers: 1,
            },
        )
        .unwrap();
        // The scan's recorded prediction reflects the filter selectivity.
        let scan_id = result.plan.fragments[0].scans[0].clone();
        result.prediction[&scan_id].cardinality
    };

    let default_rows = run(&NoHistory);
    assert!((default_rows - 800_000.0).abs() < 1.0);

    let history = FileHistory::new();
    history.record(HistoryRecord {
        key: "scan sales [gt(s_amount, 100)]".to_string(),
        observed_rows: 10_000,
        observed_bytes: 0,
        predicted_rows: 0.0,
        predicted_bytes: 0.0,
        version: 1,
    });
    let calibrated_rows = run(&history);
    assert!((calibrated_rows - 10_000.0).abs() < 1.0, "{calibrated_rows}");
}
