//! # Optimizer Errors
//!
//! All fallible optimizer entry points return [`Result`]. Errors carry a kind
//! plus a free-text detail; no partial plan is ever returned on failure.
//!
//! Inside the join enumerator, an error while costing *one* candidate means
//! the candidate is infeasible and is silently discarded. Errors raised
//! anywhere else (graph construction, postprocessing, lowering) abort the
//! optimization.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptError {
    /// The logical input violates a precondition: duplicate output name,
    /// wrong arity, unresolvable column, mistyped Values row.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// A construct the optimizer does not handle, e.g. a correlated subquery
    /// shape or a set operation other than union.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// A subfield access that cannot be expressed, e.g. cardinality over a
    /// map column that was pruned to a struct of accessed keys.
    #[error("unsupported subfield: {0}")]
    UnsupportedSubfield(String),

    /// The per-optimization arena hit its object limit. Fatal for the run.
    #[error("arena exhausted: {0}")]
    ArenaExhausted(String),

    /// Propagated from the schema/catalog collaborator: table not found,
    /// sampling failed.
    #[error("schema failure: {0}")]
    SchemaFailure(String),
}

pub type Result<T> = std::result::Result<T, OptError>;

impl OptError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        OptError::InvalidPlan(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        OptError::UnsupportedFeature(msg.into())
    }
}
