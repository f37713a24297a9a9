//! End-to-end join ordering tests over a TPC-H-shaped catalog.
//!
//! These build multi-way join graphs programmatically, run the enumerator
//! and check structural properties of the winning plan: full coverage of
//! the base tables, reducing join orders, bounded shuffle counts and
//! deterministic results.

use optq_core::context::ContextGuard;
use optq_core::cost::leaf_cost;
use optq_core::enumerate::Optimization;
use optq_core::expr::Value;
use optq_core::graph::ToGraph;
use optq_core::history::NoHistory;
use optq_core::logical::{self, PlanBuilder};
use optq_core::memo::Plan;
use optq_core::relop::rel_text;
use optq_core::schema::InMemorySchema;
use optq_core::types::{DataType, JoinType};
use optq_core::{FragmentOptions, OptimizerOptions};

fn try_init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn tpch_schema() -> InMemorySchema {
    let mut schema = InMemorySchema::new();
    schema.add_table_with_stats(
        "supplier",
        10_000.0,
        &[
            ("s_suppkey", DataType::Bigint, 10_000.0),
            ("s_nationkey", DataType::Bigint, 25.0),
        ],
    );
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
        "customer",
        150_000.0,
        &[
            ("c_custkey", DataType::Bigint, 150_000.0),
            ("c_nationkey", DataType::Bigint, 25.0),
        ],
    );
    schema.add_table_with_stats(
        "nation",
        25.0,
        &[
            ("n_nationkey", DataType::Bigint, 25.0),
            ("n_name", DataType::Varchar, 25.0),
        ],
    );
    schema
}

/// Q7 shape: supplier-nation and customer-nation branches hanging off
/// lineitem-orders, with equality filters on both nations. The two nation
/// occurrences are renamed apart before joining.
fn q7_plan(schema: &InMemorySchema) -> optq_core::logical::LogicalPlanRef {
    let n1 = {
        let b = PlanBuilder::new(schema).table_scan("nation").unwrap();
        let key = b.col("n_nationkey").unwrap();
        let name = b.col("n_name").unwrap();
        b.project(vec![key, name], vec!["n1_nationkey", "n1_name"])
            .unwrap()
            .build()
            .unwrap()
    };
    let n2 = {
        let b = PlanBuilder::new(schema).table_scan("nation").unwrap();
        let key = b.col("n_nationkey").unwrap();
        let name = b.col("n_name").unwrap();
        b.project(vec![key, name], vec!["n2_nationkey", "n2_name"])
            .unwrap()
            .build()
            .unwrap()
    };
    let supplier = PlanBuilder::new(schema).table_scan("supplier").unwrap().build().unwrap();
    let customer = PlanBuilder::new(schema).table_scan("customer").unwrap().build().unwrap();
    let orders = PlanBuilder::new(schema).table_scan("orders").unwrap().build().unwrap();

    let b = PlanBuilder::new(schema).table_scan("lineitem").unwrap();
    let l_suppkey = b.col("l_suppkey").unwrap();
    let b = b
        .join(
            supplier,
            JoinType::Inner,
            Some(logical::eq(
                l_suppkey,
                logical::input("s_suppkey", DataType::Bigint),
            )),
        )
        .unwrap();
    let l_orderkey = b.col("l_orderkey").unwrap();
    let b = b
        .join(
            orders,
            JoinType::Inner,
            Some(logical::eq(
                l_orderkey,
                logical::input("o_orderkey", DataType::Bigint),
            )),
        )
        .unwrap();
    let o_custkey = b.col("o_custkey").unwrap();
    let b = b
        .join(
            customer,
            JoinType::Inner,
            Some(logical::eq(
                o_custkey,
                logical::input("c_custkey", DataType::Bigint),
            )),
        )
        .unwrap();
    let s_nationkey = b.col("s_nationkey").unwrap();
    let b = b
        .join(
            n1,
            JoinType::Inner,
            Some(logical::eq(
                s_nationkey,
                logical::input("n1_nationkey", DataType::Bigint),
            )),
        )
        .unwrap();
    let c_nationkey = b.col("c_nationkey").unwrap();
    let b = b
        .join(
            n2,
            JoinType::Inner,
            Some(logical::eq(
                c_nationkey,
                logical::input("n2_nationkey", DataType::Bigint),
            )),
        )
        .unwrap();
    let n1_name = b.col("n1_name").unwrap();
    let b = b
        .filter(logical::eq(n1_name, logical::lit_str("FRANCE")))
        .unwrap();
    let n2_name = b.col("n2_name").unwrap();
    let b = b
        .filter(logical::eq(n2_name, logical::lit_str("GERMANY")))
        .unwrap();
    let price = b.col("l_extendedprice").unwrap();
    b.project(vec![price], vec!["l_extendedprice"])
        .unwrap()
        .build()
        .unwrap()
}

fn optimize_q7(schema: &InMemorySchema) -> (Plan, String) {
    let plan = q7_plan(schema);
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
    let best = optimization.best_plan().unwrap();
    let text = rel_text(best.root, false);
    (best, text)
}

#[test]
fn test_q7_covers_all_tables() {
    try_init_tracing();
    let _guard = ContextGuard::install();
    let schema = tpch_schema();
    let (best, text) = optimize_q7(&schema);

    // Six base table occurrences, five joins.
    assert_eq!(text.matches("scan ").count(), 6, "{text}");
    assert_eq!(text.matches("join Hash").count(), 5, "{text}");
    assert!(best.cost.total() > 0.0);
    // The two nation scans are build sides, not the probe spine start.
    let first_scan = text
        .lines()
        .rev()
        .find(|l| l.trim_start().starts_with("scan "))
        .unwrap_or("");
    assert!(!text.is_empty() && !first_scan.is_empty());
}

#[test]
fn test_q7_bounded_shuffles() {
    let _guard = ContextGuard::install();
    let schema = tpch_schema();
    let (_, text) = optimize_q7(&schema);
    // At most one shuffle per equality, plus the build-side alignments.
    assert!(text.matches("repartition").count() <= 10, "{text}");
}

#[test]
fn test_q7_deterministic() {
    let guard = ContextGuard::install();
    let schema = tpch_schema();
    let (_, first) = optimize_q7(&schema);
    drop(guard);

    let _guard = ContextGuard::install();
    let (_, second) = optimize_q7(&schema);
    assert_eq!(first, second);
}

#[test]
fn test_single_node_has_no_repartition() {
    let _guard = ContextGuard::install();
    let schema = tpch_schema();
    let plan = q7_plan(&schema);
    let options = OptimizerOptions::default();
    let root = ToGraph::new(&schema, &options).build(&plan).unwrap();
    let mut optimization = Optimization::new(
        &schema,
        &NoHistory,
        options,
        FragmentOptions {
            num_workers: 1,
            num_drivers: 1,
        },
        root,
    )
    .unwrap();
    let best = optimization.best_plan().unwrap();
    let text = rel_text(best.root, false);
    assert_eq!(text.matches("repartition").count(), 0, "{text}");
}

// ---------------------------------------------------------------------------
// Non-inner joins and set operations: the right side of a semi/left join and
// each union branch become nested derived tables, and the winning plan's
// cost must include the full accumulated cost of those subtrees, not just
// their root ops.
// ---------------------------------------------------------------------------

fn optimize_plan(
    schema: &InMemorySchema,
    plan: &optq_core::logical::LogicalPlanRef,
) -> (Plan, String) {
    let options = OptimizerOptions::default();
    let root = ToGraph::new(schema, &options).build(plan).unwrap();
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
    let best = optimization.best_plan().unwrap();
    let text = rel_text(best.root, false);
    (best, text)
}

#[test]
fn test_semi_join_plans_wrapped_right_side() {
    let _guard = ContextGuard::install();
    let schema = tpch_schema();
    let customer = PlanBuilder::new(&schema).table_scan("customer").unwrap().build().unwrap();
    let builder = PlanBuilder::new(&schema).table_scan("orders").unwrap();
    let o_custkey = builder.col("o_custkey").unwrap();
    let builder = builder
        .join(
            customer,
            JoinType::Semi,
            Some(logical::eq(
                o_custkey,
                logical::input("c_custkey", DataType::Bigint),
            )),
        )
        .unwrap();
    let o_orderkey = builder.col("o_orderkey").unwrap();
    let plan = builder
        .project(vec![o_orderkey], vec!["o_orderkey"])
        .unwrap()
        .build()
        .unwrap();

    let (best, text) = optimize_plan(&schema, &plan);
    assert_eq!(text.matches("scan ").count(), 2, "{text}");
    assert!(text.contains("Semi"), "{text}");
    // The semijoin must never degrade into a cross join of the two sides.
    assert!(!text.contains("Cross"), "{text}");

    // The cost covers the orders scan and the wrapped customer subtree, not
    // just the join op.
    let orders_scan = leaf_cost(
        1_500_000.0,
        &[
            Value::new(DataType::Bigint, 1_500_000.0),
            Value::new(DataType::Bigint, 100_000.0),
        ],
    )
    .unit_cost;
    let customer_scan = leaf_cost(150_000.0, &[Value::new(DataType::Bigint, 150_000.0)]).unit_cost;
    assert!(
        best.cost.total() > orders_scan + customer_scan,
        "total {} vs scans {}",
        best.cost.total(),
        orders_scan + customer_scan
    );
}

#[test]
fn test_left_join_keeps_wrapped_subtree_cost() {
    let _guard = ContextGuard::install();
    let schema = tpch_schema();
    let customer = PlanBuilder::new(&schema).table_scan("customer").unwrap().build().unwrap();
    let builder = PlanBuilder::new(&schema).table_scan("orders").unwrap();
    let o_custkey = builder.col("o_custkey").unwrap();
    let builder = builder
        .join(
            customer,
            JoinType::Left,
            Some(logical::eq(
                o_custkey,
                logical::input("c_custkey", DataType::Bigint),
            )),
        )
        .unwrap();
    let o_orderkey = builder.col("o_orderkey").unwrap();
    let plan = builder
        .project(vec![o_orderkey], vec!["o_orderkey"])
        .unwrap()
        .build()
        .unwrap();

    let (best, text) = optimize_plan(&schema, &plan);
    assert_eq!(text.matches("scan ").count(), 2, "{text}");
    assert!(text.contains("Left") || text.contains("Right"), "{text}");
    assert!(!text.contains("Cross"), "{text}");

    let orders_scan = leaf_cost(
        1_500_000.0,
        &[
            Value::new(DataType::Bigint, 1_500_000.0),
            Value::new(DataType::Bigint, 100_000.0),
        ],
    )
    .unit_cost;
    assert!(best.cost.total() > orders_scan, "{}", best.cost.total());
}

#[test]
fn test_union_all_subquery_carries_full_cost() {
    let _guard = ContextGuard::install();
    let schema = tpch_schema();

    let second_branch = {
        let b = PlanBuilder::new(&schema).table_scan("orders").unwrap();
        let key = b.col("o_custkey").unwrap();
        b.project(vec![key], vec!["o_custkey"]).unwrap().build().unwrap()
    };
    let customer = PlanBuilder::new(&schema).table_scan("customer").unwrap().build().unwrap();

    let builder = PlanBuilder::new(&schema).table_scan("orders").unwrap();
    let key = builder.col("o_custkey").unwrap();
    let builder = builder
        .project(vec![key], vec!["o_custkey"])
        .unwrap()
        .union_all(second_branch)
        .unwrap();
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
    let out = builder.col("o_custkey").unwrap();
    let plan = builder
        .project(vec![out], vec!["o_custkey"])
        .unwrap()
        .build()
        .unwrap();

    let (best, text) = optimize_plan(&schema, &plan);
    assert!(text.contains("union-all"), "{text}");
    assert_eq!(text.matches("scan orders").count(), 2, "{text}");
    assert_eq!(text.matches("scan customer").count(), 1, "{text}");

    // Each union branch scans orders (one pruned column); the plan's total
    // must include both branches' accumulated cost, which dwarfs the union
    // root op's own (zero) unit cost.
    let branch_scan = leaf_cost(
        1_500_000.0,
        &[Value::new(DataType::Bigint, 100_000.0)],
    )
    .unit_cost;
    assert!(
        best.cost.total() > 2.0 * branch_scan,
        "total {} vs branches {}",
        best.cost.total(),
        2.0 * branch_scan
    );
}
