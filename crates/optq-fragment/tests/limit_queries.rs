//! Fragment-shape tests for limit and order-by queries over `nation`,
//! across the worker/driver matrix: single stream, single node with
//! multiple drivers, and distributed.

use optq_core::logical::{PlanBuilder, SortField};
use optq_core::schema::InMemorySchema;
use optq_core::types::{DataType, OrderType};
use optq_core::{FragmentOptions, OptimizerOptions};
use optq_fragment::{optimize, PlanAndStats};

fn nation_schema() -> InMemorySchema {
    let mut schema = InMemorySchema::new();
    schema.add_table_with_stats(
        "nation",
        25.0,
        &[
            ("n_nationkey", DataType::Bigint, 25.0),
            ("n_name", DataType::Varchar, 25.0),
            ("n_regionkey", DataType::Bigint, 5.0),
        ],
    );
    schema
}

fn limit_plan(schema: &InMemorySchema) -> optq_core::logical::LogicalPlanRef {
    PlanBuilder::new(schema)
        .table_scan("nation")
        .unwrap()
        .limit(0, 10)
        .unwrap()
        .build()
        .unwrap()
}

fn order_by_limit_plan(schema: &InMemorySchema) -> optq_core::logical::LogicalPlanRef {
    let builder = PlanBuilder::new(schema).table_scan("nation").unwrap();
    let name = builder.col("n_name").unwrap();
    builder
        .order_by(vec![SortField {
            expr: name,
            order: OrderType::DescNullsLast,
        }])
        .unwrap()
        .limit(0, 10)
        .unwrap()
        .build()
        .unwrap()
}

fn run(
    plan: &optq_core::logical::LogicalPlanRef,
    schema: &InMemorySchema,
    num_workers: u32,
    num_drivers: u32,
) -> PlanAndStats {
    optimize(
        plan,
        schema,
        OptimizerOptions::default(),
        &optq_core::history::NoHistory,
        FragmentOptions {
            num_workers,
            num_drivers,
        },
    )
    .unwrap()
}

#[test]
fn test_limit_single_stream() {
    let schema = nation_schema();
    let result = run(&limit_plan(&schema), &schema, 1, 1);
    let fragments = &result.plan.fragments;
    assert_eq!(fragments.len(), 1);
    assert_eq!(
        fragments[0].root.spine(),
        vec!["table-scan", "project", "final-limit"],
        "{}",
        result.plan
    );
    assert_eq!(fragments[0].scans.len(), 1);
}

#[test]
fn test_limit_single_node_multi_driver() {
    let schema = nation_schema();
    let result = run(&limit_plan(&schema), &schema, 1, 4);
    let fragments = &result.plan.fragments;
    assert_eq!(fragments.len(), 1);
    assert_eq!(
        fragments[0].root.spine(),
        vec![
            "table-scan",
            "project",
            "partial-limit",
            "local-partition",
            "final-limit"
        ],
        "{}",
        result.plan
    );
}

#[test]
fn test_limit_distributed() {
    let schema = nation_schema();
    let result = run(&limit_plan(&schema), &schema, 4, 4);
    let fragments = &result.plan.fragments;
    assert_eq!(fragments.len(), 2, "{}", result.plan);

    assert_eq!(fragments[0].scans.len(), 1);
    assert_eq!(fragments[1].scans.len(), 0);
    assert_eq!(
        fragments[0].root.spine(),
        vec![
            "table-scan",
            "project",
            "partial-limit",
            "local-partition",
            "final-limit",
            "partitioned-output"
        ],
        "{}",
        result.plan
    );
    assert_eq!(fragments[1].root.spine(), vec!["exchange", "final-limit"]);
    assert_eq!(fragments[1].width, 1);
    assert_eq!(fragments[1].input_stages.len(), 1);
    assert_eq!(
        fragments[1].input_stages[0].producer_task_prefix,
        fragments[0].task_prefix
    );
    assert!(result.plan.is_acyclic());
}

#[test]
fn test_order_by_limit_single_stream() {
    let schema = nation_schema();
    let result = run(&order_by_limit_plan(&schema), &schema, 1, 1);
    let fragments = &result.plan.fragments;
    assert_eq!(fragments.len(), 1);
    assert_eq!(
        fragments[0].root.spine(),
        vec!["table-scan", "top-n", "project"],
        "{}",
        result.plan
    );
}

#[test]
fn test_order_by_limit_distributed() {
    let schema = nation_schema();
    let result = run(&order_by_limit_plan(&schema), &schema, 4, 4);
    let fragments = &result.plan.fragments;
    assert_eq!(fragments.len(), 2, "{}", result.plan);

    assert_eq!(
        fragments[0].root.spine(),
        vec!["table-scan", "top-n", "local-merge", "partitioned-output"],
        "{}",
        result.plan
    );
    assert_eq!(
        fragments[1].root.spine(),
        vec!["merge-exchange", "final-limit", "project"],
        "{}",
        result.plan
    );
    assert_eq!(fragments[1].width, 1);
    assert!(result.plan.is_acyclic());
}

#[test]
fn test_plan_node_ids_are_sequential_strings() {
    let schema = nation_schema();
    let result = run(&limit_plan(&schema), &schema, 1, 1);
    let mut ids = Vec::new();
    fn collect(node: &optq_fragment::PhysicalNode, ids: &mut Vec<u32>) {
        ids.push(node.id.parse().expect("numeric id"));
        for input in &node.inputs {
            collect(input, ids);
        }
    }
    for fragment in &result.plan.fragments {
        collect(&fragment.root, &mut ids);
    }
    ids.sort_unstable();
    let expected: Vec<u32> = (0..ids.len() as u32).collect();
    assert_eq!(ids, expected);
}
