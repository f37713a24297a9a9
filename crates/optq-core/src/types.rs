//! # Value and Relational Types
//!
//! Scalar values, column data types, row types and join types shared by the
//! logical input tree, the interned expression DAG and the physical plan.
//!
//! `ScalarValue` wraps `f64` in `OrderedFloat` so that literals can be used
//! as hash-cons keys (Eq/Hash are required for expression deduplication).

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Column data type of the columnar engine. Complex types nest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Tinyint,
    Smallint,
    Integer,
    Bigint,
    Real,
    Double,
    Varchar,
    Varbinary,
    Date,
    Timestamp,
    Array(Box<DataType>),
    Map(Box<DataType>, Box<DataType>),
    Row(Vec<(String, DataType)>),
}

impl DataType {
    /// Estimated in-memory width of one value, used for row-size and shuffle
    /// cost estimates.
    pub fn byte_width(&self) -> f64 {
        match self {
            DataType::Boolean | DataType::Tinyint => 1.0,
            DataType::Smallint => 2.0,
            DataType::Integer | DataType::Real | DataType::Date => 4.0,
            DataType::Bigint | DataType::Double | DataType::Timestamp => 8.0,
            DataType::Varchar | DataType::Varbinary => 16.0,
            DataType::Array(elem) => 4.0 + 8.0 * elem.byte_width(),
            DataType::Map(k, v) => 4.0 + 8.0 * (k.byte_width() + v.byte_width()),
            DataType::Row(fields) => fields.iter().map(|(_, t)| t.byte_width()).sum(),
        }
    }

    pub fn is_complex(&self) -> bool {
        matches!(
            self,
            DataType::Array(_) | DataType::Map(_, _) | DataType::Row(_)
        )
    }

    /// Field index and type for a named struct field.
    pub fn row_field(&self, name: &str) -> Option<(usize, &DataType)> {
        match self {
            DataType::Row(fields) => fields
                .iter()
                .enumerate()
                .find(|(_, (n, _))| n == name)
                .map(|(i, (_, t))| (i, t)),
            _ => None,
        }
    }

    /// The type produced by a subscript over this container.
    pub fn subscript_type(&self) -> Option<&DataType> {
        match self {
            DataType::Array(elem) => Some(elem),
            DataType::Map(_, value) => Some(value),
            _ => None,
        }
    }
}

/// Scalar value for literals. `OrderedFloat` makes doubles usable in Eq/Hash
/// comparisons, which expression interning depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(OrderedFloat<f64>),
    Utf8(String),
    /// Days since the Unix epoch.
    Date(i32),
}

impl ScalarValue {
    pub fn from_f64(v: f64) -> Self {
        ScalarValue::Float64(OrderedFloat(v))
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a == b,
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ScalarValue {}

impl std::hash::Hash for ScalarValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(v) => v.hash(state),
            Self::Int64(v) => v.hash(state),
            Self::Float64(v) => v.hash(state),
            Self::Utf8(v) => v.hash(state),
            Self::Date(v) => v.hash(state),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "'{v}'"),
            Self::Date(v) => write!(f, "date({v})"),
        }
    }
}

/// Named, typed output signature of a relational node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowType {
    pub fields: Vec<(String, DataType)>,
}

impl RowType {
    pub fn new(fields: Vec<(String, DataType)>) -> Self {
        Self { fields }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }

    pub fn type_of(&self, name: &str) -> Option<&DataType> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// SQL join types. Inner joins reorder freely; the others constrain the
/// enumerator (a new derived table wraps the non-reorderable side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    /// Left rows with at least one match on the right; right columns are not
    /// projected.
    Semi,
    /// Build-side variant of a semijoin: right rows with at least one probe
    /// match. Produced only by the optimizer when it swaps a semijoin's
    /// sides.
    RightSemi,
    /// Left rows with no match on the right.
    Anti,
    Cross,
}

/// The mirror image of a join, e.g. right outer for left outer. Used when a
/// probe/build swap turns a left join into its right-hash variant.
pub fn reverse_join_type(join_type: JoinType) -> JoinType {
    match join_type {
        JoinType::Left => JoinType::Right,
        JoinType::Right => JoinType::Left,
        JoinType::Semi => JoinType::RightSemi,
        JoinType::RightSemi => JoinType::Semi,
        other => other,
    }
}

/// Sort direction plus null placement for one order-by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    AscNullsFirst,
    AscNullsLast,
    DescNullsFirst,
    DescNullsLast,
}

impl OrderType {
    pub fn is_ascending(&self) -> bool {
        matches!(self, OrderType::AscNullsFirst | OrderType::AscNullsLast)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetOperation {
    UnionAll,
    /// Union with distinct, planned as union-all below a grouping
    /// aggregation.
    Union,
    Intersect,
    Except,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_value_eq_hash() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(ScalarValue::from_f64(1.5));
        set.insert(ScalarValue::from_f64(1.5));
        set.insert(ScalarValue::Int64(1));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_row_field_lookup() {
        let t = DataType::Row(vec![
            ("a".to_string(), DataType::Bigint),
            ("b".to_string(), DataType::Varchar),
        ]);
        assert_eq!(t.row_field("b").map(|(i, _)| i), Some(1));
        assert!(t.row_field("c").is_none());
    }

    #[test]
    fn test_reverse_join_type() {
        assert_eq!(reverse_join_type(JoinType::Left), JoinType::Right);
        assert_eq!(reverse_join_type(JoinType::Inner), JoinType::Inner);
    }
}
