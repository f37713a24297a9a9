//! # Query Graph Context
//!
//! Per-optimization arena and interners. There is no process-wide state: the
//! context is installed in a thread local for the duration of one
//! optimization and dropped on exit. Everything interned here — names, paths,
//! expressions, plan objects, relation ops — lives exactly as long as the
//! [`ContextGuard`].
//!
//! All constructors that need the arena reach it through the thread local;
//! accessors take a short borrow and copy small nodes out, so calls never
//! nest a borrow inside another.
//!
//! Interning rules:
//! - names: equal strings share one [`Name`]; equality is id equality.
//! - paths: equal step sequences share one [`PathId`].
//! - expressions: structurally equal subtrees (same kind, type and operand
//!   ids) share one [`ExprId`]. The estimated-cardinality part of a `Value`
//!   is not part of the dedup key.

use crate::error::{OptError, Result};
use crate::expr::{ExprKind, ExprNode, Value};
use crate::graph::{BaseTable, DerivedTable, JoinEdge};
use crate::object::{ExprId, ObjectId, RelId};
use crate::relop::RelNode;
use crate::types::DataType;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

/// Interned identifier. Two equal strings intern to the same `Name`, so name
/// equality is a single integer compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(u32);

impl Name {
    /// A name slot that is always overwritten before use. Never interned and
    /// never resolvable; must not reach `name_str`.
    pub(crate) fn placeholder() -> Self {
        Name(u32::MAX)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", name_str(*self))
    }
}

/// Interned access path (sequence of steps addressing a subfield).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(u32);

/// One step of a subfield access path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Struct field access, by name and ordinal.
    Field { name: Option<Name>, index: i32 },
    /// Array or map subscript with a constant key. `all` marks a subscript
    /// with a non-constant key, which accesses every element.
    Subscript {
        name: Option<Name>,
        index: i64,
        all: bool,
    },
    /// `cardinality(x)` — accesses only the container size.
    Cardinality,
}

/// Everything allocated in the per-optimization arena.
#[derive(Debug, Clone)]
pub enum PlanObject {
    Expr(ExprNode),
    BaseTable(BaseTable),
    DerivedTable(DerivedTable),
    JoinEdge(JoinEdge),
    Rel(RelNode),
}

/// Dedup key for interned expressions: kind (with operand ids) plus type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ExprKey {
    kind: ExprKind,
    data_type: DataType,
}

/// Arena, name table, path table, expression dedup map and id counter for one
/// optimization.
pub struct QueryGraphContext {
    names: Vec<String>,
    name_ids: HashMap<String, Name>,
    paths: Vec<Vec<Step>>,
    path_ids: HashMap<Vec<Step>, PathId>,
    objects: Vec<PlanObject>,
    expr_ids: HashMap<ExprKey, ExprId>,
    max_objects: usize,
}

const DEFAULT_MAX_OBJECTS: usize = 1 << 22;

impl QueryGraphContext {
    fn new() -> Self {
        Self {
            names: Vec::new(),
            name_ids: HashMap::new(),
            paths: Vec::new(),
            path_ids: HashMap::new(),
            objects: Vec::new(),
            expr_ids: HashMap::new(),
            max_objects: DEFAULT_MAX_OBJECTS,
        }
    }

    fn allocate(&mut self, object: PlanObject) -> Result<ObjectId> {
        if self.objects.len() >= self.max_objects {
            return Err(OptError::ArenaExhausted(format!(
                "plan object arena limit of {} reached",
                self.max_objects
            )));
        }
        let id = ObjectId(self.objects.len() as u32);
        self.objects.push(object);
        Ok(id)
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<QueryGraphContext>> = RefCell::new(None);
}

/// Installs a fresh context on the current thread and clears it on drop, on
/// all exit paths. Not `Send`; the optimization stays on one thread.
pub struct ContextGuard {
    _not_send: PhantomData<*const ()>,
}

impl ContextGuard {
    pub fn install() -> Self {
        CONTEXT.with(|cell| {
            let mut slot = cell.borrow_mut();
            assert!(
                slot.is_none(),
                "an optimization context is already installed on this thread"
            );
            *slot = Some(QueryGraphContext::new());
        });
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT.with(|cell| *cell.borrow_mut() = None);
    }
}

pub(crate) fn with_ctx<R>(f: impl FnOnce(&mut QueryGraphContext) -> R) -> R {
    CONTEXT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let ctx = slot
            .as_mut()
            .expect("no optimization context installed on this thread");
        f(ctx)
    })
}

pub fn context_installed() -> bool {
    CONTEXT.with(|cell| cell.borrow().is_some())
}

/// Interns a string; amortized O(1).
pub fn intern_name(s: &str) -> Name {
    with_ctx(|cx| {
        if let Some(&name) = cx.name_ids.get(s) {
            return name;
        }
        let name = Name(cx.names.len() as u32);
        cx.names.push(s.to_string());
        cx.name_ids.insert(s.to_string(), name);
        name
    })
}

pub fn name_str(name: Name) -> String {
    with_ctx(|cx| cx.names[name.0 as usize].clone())
}

/// Interns a step sequence. Equal paths compare by id.
pub fn intern_path(steps: &[Step]) -> PathId {
    with_ctx(|cx| {
        if let Some(&id) = cx.path_ids.get(steps) {
            return id;
        }
        let id = PathId(cx.paths.len() as u32);
        cx.paths.push(steps.to_vec());
        cx.path_ids.insert(steps.to_vec(), id);
        id
    })
}

pub fn path_steps(path: PathId) -> Vec<Step> {
    with_ctx(|cx| cx.paths[path.0 as usize].clone())
}

/// Interns an expression, deduplicating by structural hash and equality.
/// Operands must already be interned.
pub fn intern_expr(kind: ExprKind, value: Value) -> Result<ExprId> {
    with_ctx(|cx| {
        let key = ExprKey {
            kind: kind.clone(),
            data_type: value.data_type.clone(),
        };
        if let Some(&id) = cx.expr_ids.get(&key) {
            return Ok(id);
        }
        let id = cx.allocate(PlanObject::Expr(ExprNode {
            id: ObjectId(0),
            kind,
            value,
        }))?;
        if let PlanObject::Expr(node) = &mut cx.objects[id.index()] {
            node.id = id;
        }
        cx.expr_ids.insert(key, id);
        Ok(id)
    })
}

/// The interned expression for `id`. Panics if `id` is not an expression;
/// callers hold ids they created.
pub fn expr(id: ExprId) -> ExprNode {
    with_ctx(|cx| match &cx.objects[id.index()] {
        PlanObject::Expr(node) => node.clone(),
        other => panic!("object {id} is not an expression: {other:?}"),
    })
}

pub fn is_expr(id: ObjectId) -> bool {
    with_ctx(|cx| matches!(&cx.objects[id.index()], PlanObject::Expr(_)))
}

pub fn add_base_table(mut table: BaseTable) -> Result<ObjectId> {
    with_ctx(|cx| {
        let id = cx.allocate(PlanObject::BaseTable(BaseTable::placeholder()))?;
        table.id = id;
        cx.objects[id.index()] = PlanObject::BaseTable(table);
        Ok(id)
    })
}

pub fn base_table(id: ObjectId) -> BaseTable {
    with_ctx(|cx| match &cx.objects[id.index()] {
        PlanObject::BaseTable(t) => t.clone(),
        other => panic!("object {id} is not a base table: {other:?}"),
    })
}

pub fn is_base_table(id: ObjectId) -> bool {
    with_ctx(|cx| matches!(&cx.objects[id.index()], PlanObject::BaseTable(_)))
}

/// In-place update of a base table. The closure must not call back into the
/// context.
pub fn update_base_table(id: ObjectId, f: impl FnOnce(&mut BaseTable)) {
    with_ctx(|cx| match &mut cx.objects[id.index()] {
        PlanObject::BaseTable(t) => f(t),
        other => panic!("object {id} is not a base table: {other:?}"),
    })
}

pub fn add_derived_table(mut dt: DerivedTable) -> Result<ObjectId> {
    with_ctx(|cx| {
        let id = cx.allocate(PlanObject::DerivedTable(DerivedTable::placeholder()))?;
        dt.id = id;
        cx.objects[id.index()] = PlanObject::DerivedTable(dt);
        Ok(id)
    })
}

pub fn derived_table(id: ObjectId) -> DerivedTable {
    with_ctx(|cx| match &cx.objects[id.index()] {
        PlanObject::DerivedTable(t) => t.clone(),
        other => panic!("object {id} is not a derived table: {other:?}"),
    })
}

pub fn is_derived_table(id: ObjectId) -> bool {
    with_ctx(|cx| matches!(&cx.objects[id.index()], PlanObject::DerivedTable(_)))
}

pub fn update_derived_table(id: ObjectId, f: impl FnOnce(&mut DerivedTable)) {
    with_ctx(|cx| match &mut cx.objects[id.index()] {
        PlanObject::DerivedTable(t) => f(t),
        other => panic!("object {id} is not a derived table: {other:?}"),
    })
}

pub fn add_join_edge(mut edge: JoinEdge) -> Result<ObjectId> {
    with_ctx(|cx| {
        let id = cx.allocate(PlanObject::JoinEdge(JoinEdge::placeholder()))?;
        edge.id = id;
        cx.objects[id.index()] = PlanObject::JoinEdge(edge);
        Ok(id)
    })
}

pub fn join_edge(id: ObjectId) -> JoinEdge {
    with_ctx(|cx| match &cx.objects[id.index()] {
        PlanObject::JoinEdge(e) => e.clone(),
        other => panic!("object {id} is not a join edge: {other:?}"),
    })
}

pub fn update_join_edge(id: ObjectId, f: impl FnOnce(&mut JoinEdge)) {
    with_ctx(|cx| match &mut cx.objects[id.index()] {
        PlanObject::JoinEdge(e) => f(e),
        other => panic!("object {id} is not a join edge: {other:?}"),
    })
}

pub fn add_rel(mut rel: RelNode) -> Result<RelId> {
    with_ctx(|cx| {
        let id = cx.allocate(PlanObject::Rel(RelNode::placeholder()))?;
        rel.id = id;
        cx.objects[id.index()] = PlanObject::Rel(rel);
        Ok(id)
    })
}

pub fn rel(id: RelId) -> RelNode {
    with_ctx(|cx| match &cx.objects[id.index()] {
        PlanObject::Rel(r) => r.clone(),
        other => panic!("object {id} is not a relation op: {other:?}"),
    })
}

/// Number of objects allocated so far. Also the next id to be assigned.
pub fn object_count() -> usize {
    with_ctx(|cx| cx.objects.len())
}

/// Correlation name of a base or derived table, for expression display.
pub fn relation_cname(id: ObjectId) -> Option<Name> {
    with_ctx(|cx| match &cx.objects[id.index()] {
        PlanObject::BaseTable(t) => Some(t.cname),
        PlanObject::DerivedTable(t) => Some(t.cname),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_interning() {
        let _guard = ContextGuard::install();
        let a = intern_name("lineitem");
        let b = intern_name("lineitem");
        let c = intern_name("orders");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(name_str(c), "orders");
    }

    #[test]
    fn test_path_interning() {
        let _guard = ContextGuard::install();
        let field = intern_name("shipmode");
        let p1 = intern_path(&[Step::Field {
            name: Some(field),
            index: 0,
        }]);
        let p2 = intern_path(&[Step::Field {
            name: Some(field),
            index: 0,
        }]);
        let p3 = intern_path(&[Step::Cardinality]);
        assert_eq!(p1, p2);
        assert_ne!(p1, p3);
        assert_eq!(path_steps(p3), vec![Step::Cardinality]);
    }

    #[test]
    fn test_guard_clears_context() {
        {
            let _guard = ContextGuard::install();
            assert!(context_installed());
        }
        assert!(!context_installed());
    }
}
