//! # optq-core: Cost-Based Optimizer Core
//!
//! This crate implements the data structures and search algorithm of the
//! optq query optimizer for a distributed columnar SQL engine. It consumes a
//! logical relational plan plus a schema and produces a costed physical
//! operator tree; the sibling `optq-fragment` crate lowers that tree into
//! the fragmented plan an execution runner consumes.
//!
//! ## Module Overview
//!
//! - **`context`**: the per-optimization arena, name/path interners and
//!   expression dedup map, installed thread-locally by a scoped guard.
//! - **`object`**: plan object ids and the id bitset every set-membership
//!   question is answered with.
//! - **`expr`**: the deduplicated expression DAG (columns, literals, calls,
//!   field accesses, lambdas, aggregates).
//! - **`logical`**: the typed logical plan input and a builder for it.
//! - **`graph`**: query-graph construction -- base tables, derived tables,
//!   join edges, conjunct splitting.
//! - **`subfield`**: which subfields of complex-typed columns the query
//!   actually reads (control vs. payload), for scan pruning.
//! - **`cost`**: per-operator cost and cardinality functions.
//! - **`relop`**: physical relation ops with distributions and costs.
//! - **`memo`** / **`enumerate`**: the memoized branch-and-bound join
//!   enumeration.
//! - **`history`**: recorded execution statistics that calibrate
//!   selectivities across runs.
//! - **`schema`**: the catalog collaborator interface.

pub mod context;
pub mod cost;
pub mod enumerate;
pub mod error;
pub mod expr;
pub mod graph;
pub mod history;
pub mod logical;
pub mod memo;
pub mod object;
pub mod options;
pub mod relop;
pub mod schema;
pub mod subfield;
pub mod types;

pub use context::ContextGuard;
pub use enumerate::Optimization;
pub use error::{OptError, Result};
pub use options::{FragmentOptions, OptimizerOptions};
