//! # Schema Collaborator Interface
//!
//! The catalog resolves table names to layouts, columns and statistics, and
//! creates the scan handles the runner consumes. The optimizer only reads
//! from it. `InMemorySchema` is the programmatic implementation used by
//! tests.

use crate::error::{OptError, Result};
use crate::types::{DataType, RowType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Column-level statistics used for selectivity and fanout estimation.
#[derive(Debug, Clone)]
pub struct ColumnStats {
    /// Number of distinct values.
    pub distinct_count: f64,
    /// Fraction of rows that are NULL, in [0, 1].
    pub null_fraction: f64,
    /// Average value width in bytes.
    pub avg_size: f64,
}

impl ColumnStats {
    pub fn new(distinct_count: f64, null_fraction: f64) -> Self {
        Self {
            distinct_count,
            null_fraction,
            avg_size: 8.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchemaColumn {
    pub name: String,
    pub data_type: DataType,
    pub stats: ColumnStats,
}

/// One physical layout of a table. A layout with non-empty `order_columns`
/// supports index lookups on a prefix of those columns; `partition_columns`
/// describe how the layout is distributed across workers.
#[derive(Debug, Clone, Default)]
pub struct TableLayout {
    pub order_columns: Vec<String>,
    pub partition_columns: Vec<String>,
    pub num_rows: f64,
}

#[derive(Debug, Clone)]
pub struct SchemaTable {
    pub name: String,
    pub columns: Vec<SchemaColumn>,
    pub layouts: Vec<TableLayout>,
    pub num_rows: f64,
}

impl SchemaTable {
    pub fn row_type(&self) -> RowType {
        RowType::new(
            self.columns
                .iter()
                .map(|c| (c.name.clone(), c.data_type.clone()))
                .collect(),
        )
    }

    pub fn column(&self, name: &str) -> Option<&SchemaColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Scan handle passed through to the runner. Filters are rendered in their
/// canonical text form; the runner receives no other plan metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableHandle {
    pub table: String,
    pub layout: usize,
    /// Filters the connector accepted for pushdown.
    pub pushdown_filters: Vec<String>,
}

/// Per-column scan handle with the subfield projection and optional
/// map-as-struct cast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnHandle {
    pub name: String,
    /// Subfield paths, rendered `column.step.step`, that the scan must
    /// populate. Empty means the whole column.
    pub subfields: Vec<String>,
    /// When a map column is read as a struct of its accessed keys, the struct
    /// type the scan produces instead of the map type.
    pub cast_to_struct: Option<DataType>,
}

/// A candidate pushdown filter. `column` is set for single-column
/// comparisons, which the default connector accepts.
#[derive(Debug, Clone)]
pub struct PushdownFilter {
    pub column: Option<String>,
    pub text: String,
}

/// Opaque split source handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionHandle {
    pub sequence: u32,
}

pub trait Schema: Send + Sync {
    fn find_table(&self, name: &str) -> Option<Arc<SchemaTable>>;

    /// Samples `pct` percent of the layout under the given filters and
    /// returns (total sampled, matching) row counts. The default claims the
    /// filters match everything; catalogs with sampling support override.
    fn sample(
        &self,
        table: &SchemaTable,
        _layout: usize,
        _filters: &[String],
        _pct: f64,
    ) -> Result<(f64, f64)> {
        Ok((table.num_rows, table.num_rows))
    }

    /// Builds a scan handle, partitioning `filters` into pushed-down and
    /// rejected. The default accepts single-column comparisons only.
    fn create_table_handle(
        &self,
        table: &SchemaTable,
        layout: usize,
        filters: Vec<PushdownFilter>,
    ) -> (TableHandle, Vec<PushdownFilter>) {
        let (accepted, rejected): (Vec<_>, Vec<_>) =
            filters.into_iter().partition(|f| f.column.is_some());
        (
            TableHandle {
                table: table.name.clone(),
                layout,
                pushdown_filters: accepted.into_iter().map(|f| f.text).collect(),
            },
            rejected,
        )
    }

    fn create_column_handle(
        &self,
        _table: &SchemaTable,
        name: &str,
        subfields: Vec<String>,
        cast_to_struct: Option<DataType>,
    ) -> ColumnHandle {
        ColumnHandle {
            name: name.to_string(),
            subfields,
            cast_to_struct,
        }
    }

    /// Splits for a scan. One partition per layout by default.
    fn list_partitions(&self, _handle: &TableHandle) -> Vec<PartitionHandle> {
        vec![PartitionHandle { sequence: 0 }]
    }
}

/// HashMap-backed catalog for tests and development.
#[derive(Default)]
pub struct InMemorySchema {
    tables: HashMap<String, Arc<SchemaTable>>,
}

impl InMemorySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, table: SchemaTable) {
        self.tables.insert(table.name.clone(), Arc::new(table));
    }

    /// Convenience for test catalogs: columns as (name, type, distinct
    /// count), one unordered layout.
    pub fn add_table_with_stats(
        &mut self,
        name: &str,
        num_rows: f64,
        columns: &[(&str, DataType, f64)],
    ) {
        let table = SchemaTable {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|(n, t, ndv)| SchemaColumn {
                    name: n.to_string(),
                    data_type: t.clone(),
                    stats: ColumnStats::new(*ndv, 0.0),
                })
                .collect(),
            layouts: vec![TableLayout {
                order_columns: Vec::new(),
                partition_columns: Vec::new(),
                num_rows,
            }],
            num_rows,
        };
        self.add_table(table);
    }
}

impl Schema for InMemorySchema {
    fn find_table(&self, name: &str) -> Option<Arc<SchemaTable>> {
        self.tables.get(name).cloned()
    }
}

/// Resolves a table or fails with `SchemaFailure`.
pub fn resolve_table(schema: &dyn Schema, name: &str) -> Result<Arc<SchemaTable>> {
    schema
        .find_table(name)
        .ok_or_else(|| OptError::SchemaFailure(format!("table not found: {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_schema() {
        let mut schema = InMemorySchema::new();
        schema.add_table_with_stats(
            "nation",
            25.0,
            &[
                ("n_nationkey", DataType::Bigint, 25.0),
                ("n_name", DataType::Varchar, 25.0),
            ],
        );
        let table = schema.find_table("nation").expect("nation");
        assert_eq!(table.num_rows, 25.0);
        assert_eq!(table.row_type().len(), 2);
        assert!(schema.find_table("region").is_none());
    }

    #[test]
    fn test_default_table_handle_pushdown() {
        let mut schema = InMemorySchema::new();
        schema.add_table_with_stats("t", 10.0, &[("a", DataType::Bigint, 10.0)]);
        let table = schema.find_table("t").expect("t");
        let filters = vec![
            PushdownFilter {
                column: Some("a".to_string()),
                text: "eq(a, 1)".to_string(),
            },
            PushdownFilter {
                column: None,
                text: "gt(plus(a, b), 1)".to_string(),
            },
        ];
        let (handle, rejected) = schema.create_table_handle(&table, 0, filters);
        assert_eq!(handle.pushdown_filters, vec!["eq(a, 1)".to_string()]);
        assert_eq!(rejected.len(), 1);
    }
}
