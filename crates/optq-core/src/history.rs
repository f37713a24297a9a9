//! # Execution History
//!
//! The history store lives across optimizations and is the only shared
//! mutable state: the optimizer reads stored selectivities from it, and the
//! runner appends observed cardinalities after execution. Implementations
//! are internally synchronized.
//!
//! Keys are canonical plan-node summaries with correlation names suppressed
//! so that logically equivalent nodes collide across queries.
//!
//! The wire format is a concatenation of newline-separated JSON objects.
//! Duplicate keys update in place; an absent file is a valid empty state.

use crate::context;
use crate::error::{OptError, Result};
use crate::expr::expr_text;
use crate::graph::BaseTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// One persisted observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub key: String,
    pub observed_rows: i64,
    pub observed_bytes: i64,
    pub predicted_rows: f64,
    pub predicted_bytes: f64,
    pub version: i32,
}

/// Planning-time prediction recorded against a plan node id, for comparison
/// with the observed run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodePrediction {
    pub cardinality: f64,
    pub bytes: f64,
}

pub trait History: Send + Sync {
    /// Stored selectivity for a leaf scan key, given the unfiltered row
    /// count. `None` when nothing is recorded.
    fn leaf_selectivity(&self, key: &str, total_rows: f64) -> Option<f64>;

    fn lookup(&self, key: &str) -> Option<HistoryRecord>;

    /// Inserts or updates in place.
    fn record(&self, record: HistoryRecord);
}

/// History that never answers; the default for tests.
pub struct NoHistory;

impl History for NoHistory {
    fn leaf_selectivity(&self, _key: &str, _total_rows: f64) -> Option<f64> {
        None
    }

    fn lookup(&self, _key: &str) -> Option<HistoryRecord> {
        None
    }

    fn record(&self, _record: HistoryRecord) {}
}

/// File-backed history with the newline-separated JSON wire format.
#[derive(Default)]
pub struct FileHistory {
    records: Mutex<HashMap<String, HistoryRecord>>,
}

impl FileHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and merges records. A missing file is an empty history.
    pub fn update_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = match std::fs::read_to_string(path.as_ref()) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(OptError::SchemaFailure(format!(
                    "history read {}: {e}",
                    path.as_ref().display()
                )))
            }
        };
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let record: HistoryRecord = serde_json::from_str(line).map_err(|e| {
                OptError::SchemaFailure(format!("history parse: {e}"))
            })?;
            self.record(record);
        }
        Ok(())
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let records = self.records.lock().expect("history lock");
        let mut keys: Vec<&String> = records.keys().collect();
        keys.sort();
        let mut out = String::new();
        for key in keys {
            out.push_str(
                &serde_json::to_string(&records[key])
                    .map_err(|e| OptError::SchemaFailure(format!("history serialize: {e}")))?,
            );
            out.push('\n');
        }
        std::fs::write(path.as_ref(), out).map_err(|e| {
            OptError::SchemaFailure(format!("history write {}: {e}", path.as_ref().display()))
        })
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("history lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl History for FileHistory {
    fn leaf_selectivity(&self, key: &str, total_rows: f64) -> Option<f64> {
        let records = self.records.lock().expect("history lock");
        let record = records.get(key)?;
        if total_rows <= 0.0 {
            return None;
        }
        Some((record.observed_rows as f64 / total_rows).clamp(0.0, 1.0))
    }

    fn lookup(&self, key: &str) -> Option<HistoryRecord> {
        self.records.lock().expect("history lock").get(key).cloned()
    }

    fn record(&self, record: HistoryRecord) {
        let mut records = self.records.lock().expect("history lock");
        match records.get_mut(&record.key) {
            Some(existing) => {
                let version = existing.version.max(record.version);
                *existing = record;
                existing.version = version;
            }
            None => {
                records.insert(record.key.clone(), record);
            }
        }
    }
}

/// Canonical history key of a base table scan: table name plus its filters
/// with correlation names suppressed, sorted for stability.
pub fn leaf_key(table: &BaseTable) -> String {
    let mut filters: Vec<String> = table
        .column_filters
        .iter()
        .chain(table.filter.iter())
        .map(|&f| expr_text(f, false))
        .collect();
    filters.sort();
    format!(
        "scan {} [{}]",
        context::name_str(table.schema_table),
        filters.join(" and ")
    )
}

/// Records one executed plan: observed per-node stats are written back under
/// the node's canonical key together with the planning-time prediction.
pub fn record_execution(
    node_history: &std::collections::BTreeMap<String, String>,
    predictions: &std::collections::BTreeMap<String, NodePrediction>,
    observed: &HashMap<String, (i64, i64)>,
    history: &dyn History,
) {
    for (node_id, key) in node_history {
        let Some(&(rows, bytes)) = observed.get(node_id) else {
            continue;
        };
        let prediction = predictions.get(node_id);
        history.record(HistoryRecord {
            key: key.clone(),
            observed_rows: rows,
            observed_bytes: bytes,
            predicted_rows: prediction.map_or(0.0, |p| p.cardinality),
            predicted_bytes: prediction.map_or(0.0, |p| p.bytes),
            version: 1,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, rows: i64) -> HistoryRecord {
        HistoryRecord {
            key: key.to_string(),
            observed_rows: rows,
            observed_bytes: rows * 100,
            predicted_rows: 0.0,
            predicted_bytes: 0.0,
            version: 1,
        }
    }

    #[test]
    fn test_duplicate_keys_update_in_place() {
        let history = FileHistory::new();
        history.record(record("scan t []", 100));
        history.record(record("scan t []", 50));
        assert_eq!(history.len(), 1);
        assert_eq!(history.lookup("scan t []").unwrap().observed_rows, 50);
    }

    #[test]
    fn test_leaf_selectivity() {
        let history = FileHistory::new();
        history.record(record("scan t [gt(a, 10)]", 250));
        assert_eq!(
            history.leaf_selectivity("scan t [gt(a, 10)]", 1000.0),
            Some(0.25)
        );
        assert_eq!(history.leaf_selectivity("scan u []", 1000.0), None);
    }

    #[test]
    fn test_wire_format_round_trip() {
        let dir = std::env::temp_dir().join(format!("optq-history-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("history.jsonl");

        let history = FileHistory::new();
        history.record(record("scan a []", 10));
        history.record(record("scan b []", 20));
        history.save_to_file(&path).unwrap();

        let loaded = FileHistory::new();
        loaded.update_from_file(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.lookup("scan b []").unwrap().observed_rows, 20);

        // Loading on top updates in place rather than duplicating.
        loaded.update_from_file(&path).unwrap();
        assert_eq!(loaded.len(), 2);

        let absent = FileHistory::new();
        absent.update_from_file(dir.join("missing.jsonl")).unwrap();
        assert!(absent.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}
