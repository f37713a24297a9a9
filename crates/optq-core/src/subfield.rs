//! # Subfield Analysis
//!
//! Walks the logical plan's expressions and records which subfields of
//! complex-typed columns are actually read, split into *control* accesses
//! (row selection: filters, join conditions, grouping, ordering, set-distinct
//! keys) and *payload* accesses (values only). Scans later read only the
//! recorded subfields, and a map column configured as map-as-struct is
//! narrowed to a struct of exactly the accessed keys.
//!
//! The walk descends with a stack of pending [`Step`]s. Reaching a column
//! records `(node, ordinal, path)`; reaching a call consults per-function
//! metadata that says how a path over the call's result maps back onto paths
//! over specific arguments (constructors, pass-through functions, lambdas).

use crate::context::{intern_name, intern_path, PathId, Step};
use crate::error::{OptError, Result};
use crate::logical::{LExpr, LExprKind, LExprRef, LogicalKind, LogicalPlan, LogicalPlanRef};
use crate::types::{DataType, ScalarValue, SetOperation};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// The walk accumulates steps outermost-first; interned paths are in access
/// order (the step adjacent to the column first).
fn steps_to_path(steps: &[Step]) -> PathId {
    let reversed: Vec<Step> = steps.iter().rev().copied().collect();
    intern_path(&reversed)
}

/// Ordinal key for paths that apply to a function call's own result rather
/// than one of the source node's outputs.
pub const RESULT_SELF: i64 = -1;

/// Paths recorded against one plan node or call, keyed by output ordinal.
#[derive(Debug, Clone, Default)]
pub struct ResultAccess {
    pub result_paths: BTreeMap<i64, BTreeSet<PathId>>,
}

impl ResultAccess {
    fn add(&mut self, ordinal: i64, path: PathId) -> bool {
        self.result_paths.entry(ordinal).or_default().insert(path)
    }
}

/// Accessed-subfield maps keyed by logical node id and by function call
/// identity.
#[derive(Debug, Default)]
pub struct PlanSubfields {
    pub node_fields: HashMap<u32, ResultAccess>,
    pub arg_fields: HashMap<usize, ResultAccess>,
}

impl PlanSubfields {
    pub fn paths_for(&self, node_id: u32, ordinal: usize) -> Option<&BTreeSet<PathId>> {
        self.node_fields
            .get(&node_id)?
            .result_paths
            .get(&(ordinal as i64))
    }

    /// Output ordinals of `node_id` that are accessed at all.
    pub fn used_ordinals(&self, node_id: u32) -> BTreeSet<usize> {
        self.node_fields
            .get(&node_id)
            .map(|access| {
                access
                    .result_paths
                    .keys()
                    .filter(|&&k| k >= 0)
                    .map(|&k| k as usize)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// How a path over a call's result maps back to its arguments.
#[derive(Debug, Clone, Copy)]
pub enum SubfieldRule {
    /// A subfield of the result is the same subfield of one argument
    /// (e.g. `coalesce`-like wrappers over a single container).
    PassThrough { arg: usize },
    /// Struct constructor: a leading `Field` step selects the argument with
    /// the field's ordinal.
    RowConstructor,
    /// Map constructor with alternating key/value arguments: a leading
    /// constant `Subscript` selects the value argument whose key literal
    /// matches.
    MapConstructor,
}

/// Binding of a lambda argument's parameters to the call's container
/// arguments, so paths flow through `transform`-style functions.
#[derive(Debug, Clone)]
pub struct LambdaInfo {
    /// Which call argument is the lambda.
    pub lambda_arg: usize,
    /// For each lambda parameter, the call argument it ranges over.
    pub arg_ordinal: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct FunctionMetadata {
    pub rule: Option<SubfieldRule>,
    pub lambdas: Vec<LambdaInfo>,
    /// Per-call cost for expression costing; 0 means the default.
    pub cost: f64,
}

impl FunctionMetadata {
    pub fn lambda_info(&self, arg: usize) -> Option<&LambdaInfo> {
        self.lambdas.iter().find(|l| l.lambda_arg == arg)
    }

    fn processes_subfields(&self) -> bool {
        self.rule.is_some() || !self.lambdas.is_empty()
    }
}

/// Registry of function metadata consulted during the walk. `subscript`,
/// `element_at` and `cardinality` are handled structurally and need no entry.
pub struct FunctionRegistry {
    functions: HashMap<String, FunctionMetadata>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        let mut functions = HashMap::new();
        functions.insert(
            "row_constructor".to_string(),
            FunctionMetadata {
                rule: Some(SubfieldRule::RowConstructor),
                ..Default::default()
            },
        );
        functions.insert(
            "map_constructor".to_string(),
            FunctionMetadata {
                rule: Some(SubfieldRule::MapConstructor),
                ..Default::default()
            },
        );
        functions.insert(
            "transform".to_string(),
            FunctionMetadata {
                lambdas: vec![LambdaInfo {
                    lambda_arg: 1,
                    arg_ordinal: vec![0],
                }],
                ..Default::default()
            },
        );
        functions.insert(
            "filter".to_string(),
            FunctionMetadata {
                rule: Some(SubfieldRule::PassThrough { arg: 0 }),
                lambdas: vec![LambdaInfo {
                    lambda_arg: 1,
                    arg_ordinal: vec![0],
                }],
                ..Default::default()
            },
        );
        Self { functions }
    }
}

impl FunctionRegistry {
    pub fn metadata(&self, name: &str) -> Option<&FunctionMetadata> {
        self.functions.get(name)
    }

    pub fn register(&mut self, name: impl Into<String>, metadata: FunctionMetadata) {
        self.functions.insert(name.into(), metadata);
    }
}

/// A scope frame of the walk: either a plan node or the parameter row of a
/// lambda bound by an enclosing call.
#[derive(Clone, Copy)]
enum SourceRef<'a> {
    Node(&'a LogicalPlan),
    LambdaArg {
        call: &'a LExpr,
        lambda_arg: usize,
    },
}

#[derive(Clone, Copy)]
struct Frame<'a> {
    names: &'a [(String, DataType)],
    source: SourceRef<'a>,
}

pub struct SubfieldAnalyzer<'a> {
    registry: &'a FunctionRegistry,
    pub control: PlanSubfields,
    pub payload: PlanSubfields,
}

impl<'a> SubfieldAnalyzer<'a> {
    pub fn new(registry: &'a FunctionRegistry) -> Self {
        Self {
            registry,
            control: PlanSubfields::default(),
            payload: PlanSubfields::default(),
        }
    }

    /// Marks control subfields for every predicate/key expression under
    /// `root`, then payload subfields for every output column of `root`.
    pub fn mark_all(&mut self, root: &'a LogicalPlanRef) -> Result<()> {
        self.mark_control(root)?;
        let frame = Frame {
            names: &root.output.fields,
            source: SourceRef::Node(root),
        };
        let mut steps = Vec::new();
        for ordinal in 0..root.output.len() {
            self.mark_field(frame.source, ordinal, &mut steps, false, &[frame])?;
            debug_assert!(steps.is_empty());
        }
        Ok(())
    }

    fn mark_control(&mut self, node: &'a LogicalPlanRef) -> Result<()> {
        match &node.kind {
            LogicalKind::Join { condition, .. } => {
                if let Some(condition) = condition {
                    let frames: Vec<Frame> = node
                        .inputs
                        .iter()
                        .map(|input| Frame {
                            names: &input.output.fields,
                            source: SourceRef::Node(input),
                        })
                        .collect();
                    let mut steps = Vec::new();
                    self.mark_subfields(condition, &mut steps, true, &frames)?;
                }
            }
            LogicalKind::Filter { predicate } => {
                self.mark_column_exprs(&node.inputs[0], std::slice::from_ref(predicate))?;
            }
            LogicalKind::Aggregate { keys, .. } => {
                self.mark_column_exprs(&node.inputs[0], keys)?;
            }
            LogicalKind::Sort { keys } => {
                let input = &node.inputs[0];
                let frame = Frame {
                    names: &input.output.fields,
                    source: SourceRef::Node(input),
                };
                let mut steps = Vec::new();
                for key in keys {
                    self.mark_subfields(&key.expr, &mut steps, true, &[frame])?;
                    debug_assert!(steps.is_empty());
                }
            }
            LogicalKind::Set { op } => {
                // With distinct semantics every column selects rows.
                if *op != SetOperation::UnionAll {
                    let mut steps = Vec::new();
                    for ordinal in 0..node.output.len() {
                        for input in &node.inputs {
                            let frame = Frame {
                                names: &input.output.fields,
                                source: SourceRef::Node(input),
                            };
                            self.mark_field(frame.source, ordinal, &mut steps, true, &[frame])?;
                        }
                    }
                }
            }
            _ => {}
        }
        for input in &node.inputs {
            self.mark_control(input)?;
        }
        Ok(())
    }

    fn mark_column_exprs(&mut self, source: &'a LogicalPlanRef, exprs: &'a [LExprRef]) -> Result<()> {
        let frame = Frame {
            names: &source.output.fields,
            source: SourceRef::Node(source),
        };
        let mut steps = Vec::new();
        for expr in exprs {
            self.mark_subfields(expr, &mut steps, true, &[frame])?;
            debug_assert!(steps.is_empty());
        }
        Ok(())
    }

    fn fields(&mut self, is_control: bool) -> &mut PlanSubfields {
        if is_control {
            &mut self.control
        } else {
            &mut self.payload
        }
    }

    fn mark_field(
        &mut self,
        source: SourceRef<'a>,
        ordinal: usize,
        steps: &mut Vec<Step>,
        is_control: bool,
        frames: &[Frame<'a>],
    ) -> Result<()> {
        let node = match source {
            SourceRef::LambdaArg { call, lambda_arg } => {
                // A lambda parameter: the path applies to the container
                // argument the parameter ranges over.
                let name = match &call.kind {
                    LExprKind::Call { name, .. } => name.as_str(),
                    _ => return Err(OptError::invalid("lambda source is not a call")),
                };
                let metadata = self.registry.metadata(name).ok_or_else(|| {
                    OptError::unsupported(format!("no function metadata for lambda in {name}"))
                })?;
                let info = metadata.lambda_info(lambda_arg).ok_or_else(|| {
                    OptError::unsupported(format!("no lambda binding for {name} arg {lambda_arg}"))
                })?;
                let nth = *info.arg_ordinal.get(ordinal).ok_or_else(|| {
                    OptError::unsupported(format!("lambda parameter {ordinal} of {name} unbound"))
                })?;
                let container = match &call.kind {
                    LExprKind::Call { args, .. } => &args[nth],
                    _ => unreachable!(),
                };
                return self.mark_subfields(container, steps, is_control, &frames[1..]);
            }
            SourceRef::Node(node) => node,
        };

        let path = steps_to_path(steps);
        if !self
            .fields(is_control)
            .node_fields
            .entry(node.id)
            .or_default()
            .add(ordinal as i64, path)
        {
            // Already marked.
            return Ok(());
        }

        match &node.kind {
            LogicalKind::Project { exprs, .. } => {
                let input = &node.inputs[0];
                let frame = Frame {
                    names: &input.output.fields,
                    source: SourceRef::Node(input),
                };
                self.mark_subfields(&exprs[ordinal], steps, is_control, &[frame])
            }
            LogicalKind::Aggregate {
                keys, aggregates, ..
            } => {
                let input = &node.inputs[0];
                let frame = Frame {
                    names: &input.output.fields,
                    source: SourceRef::Node(input),
                };
                // Paths do not cross an aggregation; keys and aggregate
                // inputs are accessed whole.
                let mut sub_steps = Vec::new();
                if ordinal < keys.len() {
                    return self.mark_subfields(&keys[ordinal], &mut sub_steps, is_control, &[frame]);
                }
                let aggregate = &aggregates[ordinal - keys.len()];
                for arg in &aggregate.args {
                    self.mark_subfields(arg, &mut sub_steps, is_control, &[frame])?;
                }
                if let Some(filter) = &aggregate.filter {
                    self.mark_subfields(filter, &mut sub_steps, is_control, &[frame])?;
                }
                for key in &aggregate.order {
                    self.mark_subfields(&key.expr, &mut sub_steps, is_control, &[frame])?;
                }
                Ok(())
            }
            LogicalKind::Set { .. } => {
                for input in &node.inputs {
                    let frame = Frame {
                        names: &input.output.fields,
                        source: SourceRef::Node(input),
                    };
                    self.mark_field(frame.source, ordinal, steps, is_control, &[frame])?;
                }
                Ok(())
            }
            _ => {
                if node.inputs.is_empty() {
                    // Leaf: the recorded path on the scan/values node is the
                    // result of the analysis.
                    return Ok(());
                }
                let field_name = &node.output.fields[ordinal].0;
                for input in &node.inputs {
                    if let Some(idx) = input.output.index_of(field_name) {
                        return self.mark_field(
                            SourceRef::Node(input),
                            idx,
                            steps,
                            is_control,
                            frames,
                        );
                    }
                }
                Err(OptError::invalid(format!(
                    "no source found for column {field_name}"
                )))
            }
        }
    }

    fn mark_subfields(
        &mut self,
        expr: &'a LExprRef,
        steps: &mut Vec<Step>,
        is_control: bool,
        frames: &[Frame<'a>],
    ) -> Result<()> {
        match &expr.kind {
            LExprKind::Input(name) => {
                for (i, frame) in frames.iter().enumerate() {
                    if let Some(idx) = frame.names.iter().position(|(n, _)| n == name) {
                        return self.mark_field(
                            frames[i].source,
                            idx,
                            steps,
                            is_control,
                            &frames[i..],
                        );
                    }
                }
                Err(OptError::invalid(format!("field not found: {name}")))
            }
            LExprKind::Literal(_) => Ok(()),
            LExprKind::Field { base, field } => {
                let index = base
                    .data_type
                    .row_field(field)
                    .map(|(i, _)| i as i32)
                    .ok_or_else(|| OptError::invalid(format!("no field {field}")))?;
                steps.push(Step::Field {
                    name: Some(intern_name(field)),
                    index,
                });
                let result = self.mark_subfields(base, steps, is_control, frames);
                steps.pop();
                result
            }
            LExprKind::Lambda { body, .. } => {
                let mut sub_steps = Vec::new();
                self.mark_subfields(body, &mut sub_steps, is_control, frames)
            }
            LExprKind::Call { name, args } => {
                self.mark_call(expr, name, args, steps, is_control, frames)
            }
        }
    }

    fn mark_call(
        &mut self,
        expr: &'a LExprRef,
        name: &str,
        args: &'a [LExprRef],
        steps: &mut Vec<Step>,
        is_control: bool,
        frames: &[Frame<'a>],
    ) -> Result<()> {
        if name == "cardinality" {
            steps.push(Step::Cardinality);
            let result = self.mark_subfields(&args[0], steps, is_control, frames);
            steps.pop();
            return result;
        }

        if name == "subscript" || name == "element_at" {
            let step = match constant_key(&args[1]) {
                Some(step) => step,
                None => {
                    // Non-constant key accesses all elements; the key
                    // expression is itself walked with a fresh path.
                    let mut sub_steps = Vec::new();
                    self.mark_subfields(&args[1], &mut sub_steps, is_control, frames)?;
                    Step::Subscript {
                        name: None,
                        index: 0,
                        all: true,
                    }
                }
            };
            steps.push(step);
            let result = self.mark_subfields(&args[0], steps, is_control, frames);
            steps.pop();
            return result;
        }

        let metadata = match self.registry.metadata(name) {
            Some(m) if m.processes_subfields() => m.clone(),
            _ => {
                let mut sub_steps = Vec::new();
                for arg in args {
                    self.mark_subfields(arg, &mut sub_steps, is_control, frames)?;
                    debug_assert!(sub_steps.is_empty());
                }
                return Ok(());
            }
        };

        // Record the pending path against the call itself.
        let path = steps_to_path(steps);
        let key = std::sync::Arc::as_ptr(expr) as usize;
        if !self
            .fields(is_control)
            .arg_fields
            .entry(key)
            .or_default()
            .add(RESULT_SELF, path)
        {
            return Ok(());
        }

        if let Some(rule) = metadata.rule {
            if !steps.is_empty() {
                if let Some((arg, pop)) = select_constructor_arg(rule, steps, args)? {
                    if pop {
                        let step = steps.pop();
                        let result = self.mark_subfields(&args[arg], steps, is_control, frames);
                        if let Some(step) = step {
                            steps.push(step);
                        }
                        return result;
                    }
                    return self.mark_subfields(&args[arg], steps, is_control, frames);
                }
            }
        }

        // No path or no selecting step: every non-lambda argument is
        // implicitly accessed whole; lambda bodies are walked in a scope that
        // binds their parameters to the container arguments.
        for (i, arg) in args.iter().enumerate() {
            if let Some(_info) = metadata.lambda_info(i) {
                if let LExprKind::Lambda { params, body } = &arg.kind {
                    let mut new_frames = Vec::with_capacity(frames.len() + 1);
                    new_frames.push(Frame {
                        names: params.as_slice(),
                        source: SourceRef::LambdaArg {
                            call: expr,
                            lambda_arg: i,
                        },
                    });
                    new_frames.extend_from_slice(frames);
                    let mut sub_steps = Vec::new();
                    self.mark_subfields(body, &mut sub_steps, is_control, &new_frames)?;
                    continue;
                }
                return Err(OptError::invalid(format!(
                    "argument {i} of {name} is not a lambda"
                )));
            }
            let mut sub_steps = Vec::new();
            self.mark_subfields(arg, &mut sub_steps, is_control, frames)?;
        }
        Ok(())
    }
}

/// Picks the constructor argument a leading step selects. Returns the
/// argument index and whether the step is consumed.
fn select_constructor_arg(
    rule: SubfieldRule,
    steps: &[Step],
    args: &[LExprRef],
) -> Result<Option<(usize, bool)>> {
    match (rule, steps.last()) {
        (SubfieldRule::PassThrough { arg }, _) => Ok(Some((arg, false))),
        (SubfieldRule::RowConstructor, Some(Step::Field { index, .. })) => {
            let arg = *index as usize;
            if arg >= args.len() {
                return Err(OptError::invalid("constructor field index out of range"));
            }
            Ok(Some((arg, true)))
        }
        (SubfieldRule::MapConstructor, Some(Step::Subscript { name, index, all })) if !all => {
            // Arguments alternate key, value; match the subscript against the
            // key literals.
            for pair in (0..args.len()).step_by(2) {
                if pair + 1 >= args.len() {
                    break;
                }
                let matches = match (&args[pair].kind, name, index) {
                    (LExprKind::Literal(ScalarValue::Utf8(_)), Some(_), _) => true,
                    (LExprKind::Literal(ScalarValue::Int64(k)), None, idx) => k == idx,
                    _ => false,
                };
                if matches {
                    return Ok(Some((pair + 1, true)));
                }
            }
            Ok(None)
        }
        _ => Ok(None),
    }
}

fn constant_key(expr: &LExprRef) -> Option<Step> {
    match &expr.kind {
        LExprKind::Literal(ScalarValue::Utf8(s)) => Some(Step::Subscript {
            name: Some(intern_name(s)),
            index: 0,
            all: false,
        }),
        LExprKind::Literal(ScalarValue::Int64(i)) => Some(Step::Subscript {
            name: None,
            index: *i,
            all: false,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{path_steps, ContextGuard};
    use crate::logical::{self, PlanBuilder};
    use crate::schema::InMemorySchema;

    fn events_schema() -> InMemorySchema {
        let mut schema = InMemorySchema::new();
        schema.add_table_with_stats(
            "events",
            1000.0,
            &[
                ("id", DataType::Bigint, 1000.0),
                (
                    "tags",
                    DataType::Map(Box::new(DataType::Varchar), Box::new(DataType::Bigint)),
                    100.0,
                ),
                (
                    "info",
                    DataType::Row(vec![
                        ("kind".to_string(), DataType::Varchar),
                        ("score".to_string(), DataType::Double),
                    ]),
                    100.0,
                ),
            ],
        );
        schema
    }

    #[test]
    fn test_map_subscript_is_control_in_filter() {
        let _guard = ContextGuard::install();
        let schema = events_schema();
        let builder = PlanBuilder::new(&schema).table_scan("events").unwrap();
        let tags = builder.col("tags").unwrap();
        let access = logical::subscript(tags, logical::lit_str("clicks")).unwrap();
        let plan = builder
            .filter(logical::gt(access, logical::lit_i64(10)))
            .unwrap()
            .build()
            .unwrap();
        let scan = &plan.inputs[0];

        let registry = FunctionRegistry::default();
        let mut analyzer = SubfieldAnalyzer::new(&registry);
        analyzer.mark_all(&plan).unwrap();

        // Ordinal 1 is "tags"; a single-subscript control path is recorded.
        let paths = analyzer.control.paths_for(scan.id, 1).expect("tags paths");
        assert_eq!(paths.len(), 1);
        let steps = path_steps(*paths.iter().next().unwrap());
        assert!(matches!(steps[0], Step::Subscript { all: false, .. }));
    }

    #[test]
    fn test_struct_field_payload() {
        let _guard = ContextGuard::install();
        let schema = events_schema();
        let builder = PlanBuilder::new(&schema).table_scan("events").unwrap();
        let info = builder.col("info").unwrap();
        let kind = logical::field(info, "kind").unwrap();
        let plan = builder.project(vec![kind], vec!["kind"]).unwrap().build().unwrap();
        let scan = &plan.inputs[0];

        let registry = FunctionRegistry::default();
        let mut analyzer = SubfieldAnalyzer::new(&registry);
        analyzer.mark_all(&plan).unwrap();

        // Ordinal 2 is "info"; the payload path is .kind.
        let paths = analyzer.payload.paths_for(scan.id, 2).expect("info paths");
        let steps = path_steps(*paths.iter().next().unwrap());
        assert!(matches!(steps[0], Step::Field { index: 0, .. }));
        // No control access of "info".
        assert!(analyzer.control.paths_for(scan.id, 2).is_none());
    }

    #[test]
    fn test_unused_column_not_marked() {
        let _guard = ContextGuard::install();
        let schema = events_schema();
        let builder = PlanBuilder::new(&schema).table_scan("events").unwrap();
        let id = builder.col("id").unwrap();
        let plan = builder.project(vec![id], vec!["id"]).unwrap().build().unwrap();
        let scan = &plan.inputs[0];

        let registry = FunctionRegistry::default();
        let mut analyzer = SubfieldAnalyzer::new(&registry);
        analyzer.mark_all(&plan).unwrap();

        let used: Vec<usize> = analyzer.payload.used_ordinals(scan.id).into_iter().collect();
        assert_eq!(used, vec![0]);
    }
}
