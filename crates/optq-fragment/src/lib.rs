//! # optq-fragment: Fragmented Plan Emission
//!
//! Lowers the winning relation-op tree of `optq-core` into a
//! [`fragment::MultiFragmentPlan`]: an ordered sequence of executable
//! fragments connected by exchanges, with pushed-down scan handles and
//! per-node history keys for post-execution calibration.
//!
//! [`optimize`] is the library entry point: it installs the per-run context,
//! builds the query graph, runs subfield analysis and join enumeration, and
//! lowers the best plan, releasing the context on every exit path.

pub mod fragment;
pub mod lower;

pub use fragment::{ExecutableFragment, InputStage, MultiFragmentPlan, PhysicalKind, PhysicalNode};
pub use lower::PlanAndStats;

use optq_core::context::ContextGuard;
use optq_core::enumerate::Optimization;
use optq_core::error::Result;
use optq_core::graph::ToGraph;
use optq_core::history::History;
use optq_core::logical::LogicalPlanRef;
use optq_core::options::{FragmentOptions, OptimizerOptions};
use optq_core::schema::Schema;
use tracing::debug;

/// Optimizes a logical plan into a fragmented physical plan.
///
/// One call is one optimization: the arena context is installed on the
/// calling thread for the duration and dropped before returning, so the
/// result owns no arena references. Many optimizations may run in parallel,
/// each on its own thread.
pub fn optimize(
    plan: &LogicalPlanRef,
    schema: &dyn Schema,
    options: OptimizerOptions,
    history: &dyn History,
    frag_options: FragmentOptions,
) -> Result<PlanAndStats> {
    let _guard = ContextGuard::install();
    let root_dt = ToGraph::new(schema, &options).build(plan)?;
    let mut optimization = Optimization::new(schema, history, options, frag_options, root_dt)?;
    let best = optimization.best_plan()?;
    let result = lower::lower(&optimization, &best)?;
    debug!(
        fragments = result.plan.fragments.len(),
        "produced fragmented plan"
    );
    Ok(result)
}
