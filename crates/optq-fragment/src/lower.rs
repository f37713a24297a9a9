//! # Physical Lowering
//!
//! Walks the winning relation-op tree into executable fragments. Repartition
//! ops split the plan: the source side becomes its own fragment terminated
//! by a partitioned output and the consumer begins with an exchange naming
//! the source stage. Scans turn into connector handles with pushdown filters
//! and per-column subfield lists; order-by and limit split into
//! partial/final forms according to the worker/driver matrix; a gather is
//! added on top when the plan runs on more than one worker.
//!
//! Every node derived from a relation op records its predicted cardinality
//! and a canonical history key, so the runner's observed stats can calibrate
//! future optimizations.

use crate::fragment::{
    ExecutableFragment, InputStage, LimitStep, MultiFragmentPlan, OutputKind, PhysicalKind,
    PhysicalNode,
};
use optq_core::context::{self, Step};
use optq_core::enumerate::Optimization;
use optq_core::error::Result;
use optq_core::expr::{expr_text, ExprKind};
use optq_core::graph::BaseTable;
use optq_core::history::{leaf_key, NodePrediction};
use optq_core::memo::Plan;
use optq_core::object::{ExprId, ObjectId, RelId};
use optq_core::relop::{Distribution, JoinMethod, RelKind, RelNode};
use optq_core::schema::{resolve_table, ColumnHandle, PushdownFilter};
use optq_core::types::{DataType, OrderType};
use std::collections::BTreeMap;

/// The fragmented plan plus the keys for recording per-node execution
/// history and the planning-time predictions.
#[derive(Debug)]
pub struct PlanAndStats {
    pub plan: MultiFragmentPlan,
    /// Plan-node id to canonical history key.
    pub node_history: BTreeMap<String, String>,
    /// Plan-node id to predicted cardinality and bytes.
    pub prediction: BTreeMap<String, NodePrediction>,
}

struct FragmentBuilder {
    task_prefix: String,
    width: u32,
    scans: Vec<String>,
    num_broadcast_destinations: u32,
    input_stages: Vec<InputStage>,
}

impl FragmentBuilder {
    fn new(task_prefix: String, width: u32) -> Self {
        Self {
            task_prefix,
            width,
            scans: Vec::new(),
            num_broadcast_destinations: 0,
            input_stages: Vec::new(),
        }
    }

    fn finish(self, root: PhysicalNode) -> ExecutableFragment {
        ExecutableFragment {
            task_prefix: self.task_prefix,
            width: self.width,
            root,
            scans: self.scans,
            num_broadcast_destinations: self.num_broadcast_destinations,
            input_stages: self.input_stages,
        }
    }
}

pub struct Lowering<'a, 'b> {
    optimization: &'a Optimization<'b>,
    stage_counter: u32,
    node_counter: u32,
    node_history: BTreeMap<String, String>,
    prediction: BTreeMap<String, NodePrediction>,
}

/// Lowers a costed plan into the runner's fragmented form. The optimization
/// context must still be installed.
pub fn lower(optimization: &Optimization<'_>, plan: &Plan) -> Result<PlanAndStats> {
    let mut lowering = Lowering {
        optimization,
        stage_counter: 0,
        node_counter: 0,
        node_history: BTreeMap::new(),
        prediction: BTreeMap::new(),
    };
    let frag = optimization.frag;

    let mut root = plan.root;
    if !frag.is_single_node() && !context::rel(root).distribution.is_gather {
        root = add_gather(root)?;
    }

    let mut stages: Vec<ExecutableFragment> = Vec::new();
    let mut top = FragmentBuilder::new("stage0".to_string(), frag.num_workers);
    let top_root = lowering.make_fragment(root, &mut top, &mut stages)?;
    stages.push(top.finish(top_root));

    Ok(PlanAndStats {
        plan: MultiFragmentPlan {
            fragments: stages,
            options: frag,
        },
        node_history: lowering.node_history,
        prediction: lowering.prediction,
    })
}

/// Repartition to a single consumer, added atop a distributed plan that does
/// not already gather.
fn add_gather(root: RelId) -> Result<RelId> {
    let node = context::rel(root);
    context::add_rel(RelNode {
        id: ObjectId(0),
        kind: RelKind::Repartition,
        inputs: vec![root],
        columns: node.columns,
        distribution: Distribution::gather(),
        cost: node.cost,
    })
}

fn column_name(column: ExprId) -> String {
    match context::expr(column).kind {
        ExprKind::Column { name, .. } => context::name_str(name),
        _ => expr_text(column, true),
    }
}

fn exprs_text(exprs: &[ExprId]) -> Vec<String> {
    exprs.iter().map(|&e| expr_text(e, true)).collect()
}

fn and_text(exprs: &[ExprId]) -> String {
    exprs
        .iter()
        .map(|&e| expr_text(e, true))
        .collect::<Vec<_>>()
        .join(" and ")
}

/// Renders an access path for a column handle, e.g. `tags["clicks"].count`.
/// A path touching only a container's cardinality cannot prune the column;
/// `None` means read the whole column.
fn subfield_text(column: &str, steps: &[Step]) -> Option<String> {
    let mut out = String::from(column);
    for step in steps {
        match step {
            Step::Field { name, index } => match name {
                Some(name) => out.push_str(&format!(".{}", context::name_str(*name))),
                None => out.push_str(&format!(".{index}")),
            },
            Step::Subscript { name, index, all } => {
                if *all {
                    out.push_str("[*]");
                } else {
                    match name {
                        Some(name) => {
                            out.push_str(&format!("[\"{}\"]", context::name_str(*name)))
                        }
                        None => out.push_str(&format!("[{index}]")),
                    }
                }
            }
            Step::Cardinality => return None,
        }
    }
    Some(out)
}

impl<'a, 'b> Lowering<'a, 'b> {
    fn next_id(&mut self) -> String {
        let id = self.node_counter.to_string();
        self.node_counter += 1;
        id
    }

    /// A node id that also records the relation op's prediction and history
    /// key for post-execution telemetry.
    fn next_id_for(&mut self, rel: &RelNode) -> String {
        let id = self.next_id();
        self.prediction.insert(
            id.clone(),
            NodePrediction {
                cardinality: rel.cost.out_cardinality(),
                bytes: rel.cost.total_bytes,
            },
        );
        self.node_history.insert(id.clone(), history_key(rel));
        id
    }

    fn node(&mut self, rel: &RelNode, kind: PhysicalKind, inputs: Vec<PhysicalNode>) -> PhysicalNode {
        PhysicalNode {
            id: self.next_id_for(rel),
            kind,
            inputs,
        }
    }

    fn plain_node(&mut self, kind: PhysicalKind, inputs: Vec<PhysicalNode>) -> PhysicalNode {
        PhysicalNode {
            id: self.next_id(),
            kind,
            inputs,
        }
    }

    fn make_fragment(
        &mut self,
        rel: RelId,
        fragment: &mut FragmentBuilder,
        stages: &mut Vec<ExecutableFragment>,
    ) -> Result<PhysicalNode> {
        let node = context::rel(rel);
        match &node.kind {
            RelKind::Project { exprs } => {
                let input = self.make_fragment(node.input(), fragment, stages)?;
                let names = node.columns.iter().map(|&c| column_name(c)).collect();
                Ok(self.node(
                    &node,
                    PhysicalKind::Project {
                        names,
                        exprs: exprs_text(exprs),
                    },
                    vec![input],
                ))
            }
            RelKind::Filter { exprs } => {
                let input = self.make_fragment(node.input(), fragment, stages)?;
                Ok(self.node(
                    &node,
                    PhysicalKind::Filter {
                        predicate: and_text(exprs),
                    },
                    vec![input],
                ))
            }
            RelKind::Aggregation {
                step,
                grouping,
                aggregates,
            } => {
                let input = self.make_fragment(node.input(), fragment, stages)?;
                Ok(self.node(
                    &node,
                    PhysicalKind::Aggregation {
                        step: *step,
                        keys: exprs_text(grouping),
                        aggregates: exprs_text(aggregates),
                    },
                    vec![input],
                ))
            }
            RelKind::OrderBy { limit, offset } => {
                self.make_order_by(&node, *limit, *offset, fragment, stages)
            }
            RelKind::Limit { offset, count } => {
                self.make_limit(&node, *offset, *count, fragment, stages)
            }
            RelKind::Repartition => self.make_repartition(&node, fragment, stages),
            RelKind::TableScan { base_table, layout, keys } => {
                if keys.is_empty() {
                    self.make_scan(&node, *base_table, *layout, fragment)
                } else {
                    let probe = self.make_fragment(node.input(), fragment, stages)?;
                    let base = context::base_table(*base_table);
                    let (handle, _) = self.scan_handle(&base, *layout, &node)?;
                    let columns = self.column_handles(&base)?;
                    let scan = self.node(
                        &node,
                        PhysicalKind::IndexLookup {
                            handle,
                            columns,
                            keys: exprs_text(keys),
                        },
                        vec![probe],
                    );
                    fragment.scans.push(scan.id.clone());
                    Ok(scan)
                }
            }
            RelKind::Values { row_type, rows } => Ok(self.node(
                &node,
                PhysicalKind::Values {
                    row_type: row_type.clone(),
                    rows: rows.clone(),
                },
                vec![],
            )),
            RelKind::Join {
                method,
                join_type,
                left_keys,
                right_keys,
                filter,
                ..
            } => {
                let probe = self.make_fragment(node.inputs[0], fragment, stages)?;
                // The build input is the hash build; lowering emits the
                // build subtree directly.
                let build_rel = context::rel(node.inputs[1]);
                let build_input = match &build_rel.kind {
                    RelKind::HashBuild { .. } => build_rel.input(),
                    _ => node.inputs[1],
                };
                let build = self.make_fragment(build_input, fragment, stages)?;
                let filter_text = if filter.is_empty() {
                    None
                } else {
                    Some(and_text(filter))
                };
                match method {
                    JoinMethod::Hash => Ok(self.node(
                        &node,
                        PhysicalKind::HashJoin {
                            join_type: *join_type,
                            left_keys: exprs_text(left_keys),
                            right_keys: exprs_text(right_keys),
                            filter: filter_text,
                        },
                        vec![probe, build],
                    )),
                    JoinMethod::Cross => {
                        let join = self.node(
                            &node,
                            PhysicalKind::NestedLoopJoin {
                                join_type: *join_type,
                            },
                            vec![probe, build],
                        );
                        Ok(match filter_text {
                            Some(predicate) => self
                                .plain_node(PhysicalKind::Filter { predicate }, vec![join]),
                            None => join,
                        })
                    }
                }
            }
            RelKind::HashBuild { .. } => self.make_fragment(node.input(), fragment, stages),
            RelKind::UnionAll => {
                let mut inputs = Vec::with_capacity(node.inputs.len());
                for &input in &node.inputs {
                    inputs.push(self.make_fragment(input, fragment, stages)?);
                }
                Ok(self.node(&node, PhysicalKind::UnionAll, inputs))
            }
        }
    }

    fn scan_handle(
        &mut self,
        base: &BaseTable,
        layout: usize,
        _node: &RelNode,
    ) -> Result<(optq_core::schema::TableHandle, Vec<PushdownFilter>)> {
        let table_name = context::name_str(base.schema_table);
        let schema_table = resolve_table(self.optimization.schema(), &table_name)?;
        let mut filters: Vec<PushdownFilter> = base
            .column_filters
            .iter()
            .map(|&f| {
                let column = optq_core::expr::columns_of(f)
                    .first()
                    .map(column_name);
                PushdownFilter {
                    column,
                    text: expr_text(f, false),
                }
            })
            .collect();
        filters.extend(base.filter.iter().map(|&f| PushdownFilter {
            column: None,
            text: expr_text(f, false),
        }));
        let (handle, rejected) =
            self.optimization
                .schema()
                .create_table_handle(&schema_table, layout, filters);
        Ok((handle, rejected))
    }

    /// Per-column handles with subfield lists and map-as-struct casts. The
    /// handles cover every column the scan reads, including columns only
    /// referenced by pushed-down filters; the scan's output columns are a
    /// subset.
    fn column_handles(&mut self, base: &BaseTable) -> Result<Vec<ColumnHandle>> {
        let table_name = context::name_str(base.schema_table);
        let schema_table = resolve_table(self.optimization.schema(), &table_name)?;
        let options = &self.optimization.options;
        let mut handles = Vec::with_capacity(base.columns.len());
        for &column in &base.columns {
            let name = column_name(column);
            let mut subfields: Vec<String> = Vec::new();
            let mut whole_column = false;
            let mut skyline: Vec<String> = Vec::new();
            for set in [
                base.control_subfields.get(&column),
                base.payload_subfields.get(&column),
            ]
            .into_iter()
            .flatten()
            {
                for &path in set {
                    let steps = context::path_steps(path);
                    if steps.is_empty() {
                        whole_column = true;
                        continue;
                    }
                    if let Some(first) = steps.first() {
                        if let Step::Subscript {
                            name: Some(key), ..
                        } = first
                        {
                            let key = context::name_str(*key);
                            if !skyline.contains(&key) {
                                skyline.push(key);
                            }
                        }
                    }
                    match subfield_text(&name, &steps) {
                        Some(text) => {
                            if !subfields.contains(&text) {
                                subfields.push(text);
                            }
                        }
                        None => whole_column = true,
                    }
                }
            }
            if whole_column || !options.push_down_subfields {
                subfields.clear();
            }
            let cast_to_struct = if options.is_map_as_struct(&table_name, &name) {
                let value_type = match &context::expr(column).value.data_type {
                    DataType::Map(_, value) => (**value).clone(),
                    other => other.clone(),
                };
                skyline.sort();
                Some(DataType::Row(
                    skyline
                        .into_iter()
                        .map(|key| (key, value_type.clone()))
                        .collect(),
                ))
            } else {
                None
            };
            handles.push(self.optimization.schema().create_column_handle(
                &schema_table,
                &name,
                subfields,
                cast_to_struct,
            ));
        }
        Ok(handles)
    }

    fn make_scan(
        &mut self,
        node: &RelNode,
        base_table: ObjectId,
        layout: usize,
        fragment: &mut FragmentBuilder,
    ) -> Result<PhysicalNode> {
        let base = context::base_table(base_table);
        let (handle, rejected) = self.scan_handle(&base, layout, node)?;
        let columns = self.column_handles(&base)?;
        let map_as_struct = columns.iter().any(|c| c.cast_to_struct.is_some());
        let scan = self.node(node, PhysicalKind::TableScan { handle, columns }, vec![]);
        fragment.scans.push(scan.id.clone());

        let mut out = scan;
        if !rejected.is_empty() {
            let predicate = rejected
                .iter()
                .map(|f| f.text.clone())
                .collect::<Vec<_>>()
                .join(" and ");
            out = self.plain_node(PhysicalKind::Filter { predicate }, vec![out]);
        }
        if map_as_struct {
            // The scan produced struct-typed columns; a projection restores
            // the logical names over the narrowed types.
            let names: Vec<String> = node.columns.iter().map(|&c| column_name(c)).collect();
            out = self.plain_node(
                PhysicalKind::Project {
                    names: names.clone(),
                    exprs: names,
                },
                vec![out],
            );
        }
        Ok(out)
    }

    fn order_keys(&self, node: &RelNode) -> (Vec<String>, Vec<OrderType>) {
        (
            exprs_text(&node.distribution.order),
            node.distribution.order_types.clone(),
        )
    }

    fn make_order_by(
        &mut self,
        node: &RelNode,
        limit: i64,
        offset: i64,
        fragment: &mut FragmentBuilder,
        stages: &mut Vec<ExecutableFragment>,
    ) -> Result<PhysicalNode> {
        let frag_opts = self.optimization.frag;
        let (keys, orders) = self.order_keys(node);
        let has_limit = limit >= 0;
        let final_count = if has_limit { limit } else { i64::MAX };

        let sort = |lowering: &mut Self, input: PhysicalNode| {
            if has_limit {
                lowering.node(
                    node,
                    PhysicalKind::TopN {
                        keys: keys.clone(),
                        orders: orders.clone(),
                        count: limit + offset,
                    },
                    vec![input],
                )
            } else {
                lowering.node(
                    node,
                    PhysicalKind::OrderBy {
                        keys: keys.clone(),
                        orders: orders.clone(),
                    },
                    vec![input],
                )
            }
        };

        if frag_opts.is_single_stream() {
            let input = self.make_fragment(node.input(), fragment, stages)?;
            let mut out = sort(self, input);
            if offset > 0 {
                out = self.plain_node(
                    PhysicalKind::Limit {
                        step: LimitStep::Final,
                        offset,
                        count: final_count,
                    },
                    vec![out],
                );
            }
            return Ok(out);
        }

        if frag_opts.is_single_node() {
            // Per-driver sort, then a merging exchange within the node.
            let input = self.make_fragment(node.input(), fragment, stages)?;
            let sorted = sort(self, input);
            let merged = self.plain_node(
                PhysicalKind::LocalMerge {
                    keys: keys.clone(),
                    orders: orders.clone(),
                },
                vec![sorted],
            );
            let out = self.plain_node(
                PhysicalKind::Limit {
                    step: LimitStep::Final,
                    offset,
                    count: final_count,
                },
                vec![merged],
            );
            return Ok(out);
        }

        // Distributed: per-worker top-N and local merge feed a gathering
        // merge exchange on a single consumer.
        self.stage_counter += 1;
        let mut source = FragmentBuilder::new(
            format!("stage{}", self.stage_counter),
            frag_opts.num_workers,
        );
        let input = self.make_fragment(node.input(), &mut source, stages)?;
        let sorted = sort(self, input);
        let merged = self.plain_node(
            PhysicalKind::LocalMerge {
                keys: keys.clone(),
                orders: orders.clone(),
            },
            vec![sorted],
        );
        let output = self.plain_node(
            PhysicalKind::PartitionedOutput {
                kind: OutputKind::Gather,
                keys: Vec::new(),
                num_partitions: 1,
            },
            vec![merged],
        );
        let producer_prefix = source.task_prefix.clone();
        stages.push(source.finish(output));

        fragment.width = 1;
        let merge = self.plain_node(
            PhysicalKind::MergeExchange { keys, orders },
            vec![],
        );
        fragment.input_stages.push(InputStage {
            consumer_node_id: merge.id.clone(),
            producer_task_prefix: producer_prefix,
        });
        if has_limit || offset > 0 {
            return Ok(self.plain_node(
                PhysicalKind::Limit {
                    step: LimitStep::Final,
                    offset,
                    count: final_count,
                },
                vec![merge],
            ));
        }
        Ok(merge)
    }

    fn make_limit(
        &mut self,
        node: &RelNode,
        offset: i64,
        count: i64,
        fragment: &mut FragmentBuilder,
        stages: &mut Vec<ExecutableFragment>,
    ) -> Result<PhysicalNode> {
        let frag_opts = self.optimization.frag;

        if frag_opts.is_single_stream() {
            let input = self.make_fragment(node.input(), fragment, stages)?;
            return Ok(self.node(
                node,
                PhysicalKind::Limit {
                    step: LimitStep::Final,
                    offset,
                    count,
                },
                vec![input],
            ));
        }

        if frag_opts.is_single_node() {
            let input = self.make_fragment(node.input(), fragment, stages)?;
            let partial = self.plain_node(
                PhysicalKind::Limit {
                    step: LimitStep::Partial,
                    offset: 0,
                    count: offset + count,
                },
                vec![input],
            );
            let exchanged = self.plain_node(PhysicalKind::LocalPartition, vec![partial]);
            return Ok(self.node(
                node,
                PhysicalKind::Limit {
                    step: LimitStep::Final,
                    offset,
                    count,
                },
                vec![exchanged],
            ));
        }

        // Distributed: partial limits on the workers, final limit on a
        // single consumer.
        self.stage_counter += 1;
        let mut source = FragmentBuilder::new(
            format!("stage{}", self.stage_counter),
            frag_opts.num_workers,
        );
        let input = self.make_fragment(node.input(), &mut source, stages)?;
        let partial = self.plain_node(
            PhysicalKind::Limit {
                step: LimitStep::Partial,
                offset: 0,
                count: offset + count,
            },
            vec![input],
        );
        let exchanged = self.plain_node(PhysicalKind::LocalPartition, vec![partial]);
        let worker_final = self.plain_node(
            PhysicalKind::Limit {
                step: LimitStep::Final,
                offset: 0,
                count: offset + count,
            },
            vec![exchanged],
        );
        let output = self.plain_node(
            PhysicalKind::PartitionedOutput {
                kind: OutputKind::Gather,
                keys: Vec::new(),
                num_partitions: 1,
            },
            vec![worker_final],
        );
        let producer_prefix = source.task_prefix.clone();
        stages.push(source.finish(output));

        fragment.width = 1;
        let exchange = self.plain_node(PhysicalKind::Exchange, vec![]);
        fragment.input_stages.push(InputStage {
            consumer_node_id: exchange.id.clone(),
            producer_task_prefix: producer_prefix,
        });
        Ok(self.node(
            node,
            PhysicalKind::Limit {
                step: LimitStep::Final,
                offset,
                count,
            },
            vec![exchange],
        ))
    }

    /// A repartition ends the producing fragment with a partitioned output
    /// and starts the consumer with an exchange.
    fn make_repartition(
        &mut self,
        node: &RelNode,
        fragment: &mut FragmentBuilder,
        stages: &mut Vec<ExecutableFragment>,
    ) -> Result<PhysicalNode> {
        let frag_opts = self.optimization.frag;
        self.stage_counter += 1;
        let mut source = FragmentBuilder::new(
            format!("stage{}", self.stage_counter),
            frag_opts.num_workers,
        );
        let input = self.make_fragment(node.input(), &mut source, stages)?;

        let distribution = &node.distribution;
        let (kind, keys, num_partitions) = if distribution.is_broadcast {
            (OutputKind::Broadcast, Vec::new(), frag_opts.num_workers)
        } else if distribution.partition.is_empty() {
            (OutputKind::Gather, Vec::new(), 1)
        } else {
            (
                OutputKind::Partitioned,
                exprs_text(&distribution.partition),
                frag_opts.num_workers,
            )
        };
        if distribution.is_broadcast {
            source.num_broadcast_destinations = frag_opts.num_workers;
        }
        if kind == OutputKind::Gather {
            fragment.width = 1;
        }
        let output = self.node(
            node,
            PhysicalKind::PartitionedOutput {
                kind,
                keys,
                num_partitions,
            },
            vec![input],
        );
        let producer_prefix = source.task_prefix.clone();
        stages.push(source.finish(output));

        let exchange = self.plain_node(PhysicalKind::Exchange, vec![]);
        fragment.input_stages.push(InputStage {
            consumer_node_id: exchange.id.clone(),
            producer_task_prefix: producer_prefix,
        });
        Ok(exchange)
    }
}

/// Canonical summary of a relation op and its inputs, with correlation names
/// suppressed so equivalent nodes collide across queries.
fn history_key(rel: &RelNode) -> String {
    match &rel.kind {
        RelKind::TableScan { base_table, keys, .. } => {
            let base = context::base_table(*base_table);
            if keys.is_empty() {
                leaf_key(&base)
            } else {
                format!(
                    "lookup {} [{}] ({})",
                    context::name_str(base.schema_table),
                    keys.iter()
                        .map(|&k| expr_text(k, false))
                        .collect::<Vec<_>>()
                        .join(", "),
                    history_key(&context::rel(rel.inputs[0]))
                )
            }
        }
        RelKind::Values { rows, .. } => format!("values {}", rows.len()),
        RelKind::Filter { exprs } => {
            let mut texts: Vec<String> = exprs.iter().map(|&e| expr_text(e, false)).collect();
            texts.sort();
            format!(
                "filter [{}] ({})",
                texts.join(" and "),
                history_key(&context::rel(rel.inputs[0]))
            )
        }
        RelKind::Project { .. } => history_key(&context::rel(rel.inputs[0])),
        RelKind::Join {
            join_type,
            left_keys,
            right_keys,
            ..
        } => format!(
            "join {:?} [{} = {}] ({}) ({})",
            join_type,
            left_keys
                .iter()
                .map(|&k| expr_text(k, false))
                .collect::<Vec<_>>()
                .join(", "),
            right_keys
                .iter()
                .map(|&k| expr_text(k, false))
                .collect::<Vec<_>>()
                .join(", "),
            history_key(&context::rel(rel.inputs[0])),
            history_key(&context::rel(rel.inputs[1]))
        ),
        RelKind::HashBuild { .. } => format!(
            "build ({})",
            history_key(&context::rel(rel.inputs[0]))
        ),
        RelKind::Aggregation { grouping, .. } => format!(
            "agg [{}] ({})",
            grouping
                .iter()
                .map(|&k| expr_text(k, false))
                .collect::<Vec<_>>()
                .join(", "),
            history_key(&context::rel(rel.inputs[0]))
        ),
        RelKind::OrderBy { .. } => format!(
            "orderby ({})",
            history_key(&context::rel(rel.inputs[0]))
        ),
        RelKind::Limit { offset, count } => format!(
            "limit {offset},{count} ({})",
            history_key(&context::rel(rel.inputs[0]))
        ),
        RelKind::Repartition => format!(
            "shuffle ({})",
            history_key(&context::rel(rel.inputs[0]))
        ),
        RelKind::UnionAll => {
            let inputs: Vec<String> = rel
                .inputs
                .iter()
                .map(|&i| history_key(&context::rel(i)))
                .collect();
            format!("union ({})", inputs.join(") ("))
        }
    }
}
