//! Per-load result records

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A chunk whose transaction was rolled back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFailure {
    /// Zero-based chunk index within the batch
    pub chunk_index: usize,
    /// Batch row range covered by the chunk
    pub rows: Range<usize>,
    /// Cause reported by the store
    pub error: String,
}

/// Result of a single load operation
///
/// Returned to the caller; the loader never persists it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    /// Target table
    pub table: String,
    /// Rows handed to the store (rows of aborted-before chunks are not counted)
    pub rows_attempted: usize,
    /// Rows written as new records
    pub rows_inserted: usize,
    /// Dimension rows closed (valid_to set, is_current cleared)
    pub rows_updated_closed: usize,
    /// Dimension rows that matched their current version
    pub rows_unchanged: usize,
    /// Rows of chunks that were rolled back
    pub rows_failed: usize,
    /// Number of committed transactions
    pub chunks_committed: usize,
    /// Rolled back chunks, in batch order
    pub chunk_failures: Vec<ChunkFailure>,
    /// Whether loading stopped at the first failed chunk
    pub aborted: bool,
    /// Summary of the first failure, if any
    pub error_detail: Option<String>,
    /// Duration of the load in milliseconds
    pub duration_ms: u64,
}

impl LoadOutcome {
    /// Create an empty outcome for a table
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// Check if every attempted row was applied
    pub fn is_success(&self) -> bool {
        self.rows_failed == 0 && self.chunk_failures.is_empty() && !self.aborted
    }

    /// Record a rolled back chunk
    pub fn record_failure(&mut self, failure: ChunkFailure) {
        self.rows_failed += failure.rows.len();
        if self.error_detail.is_none() {
            self.error_detail = Some(format!(
                "chunk {} (rows {}..{}): {}",
                failure.chunk_index, failure.rows.start, failure.rows.end, failure.error
            ));
        }
        self.chunk_failures.push(failure);
    }
}

impl std::fmt::Display for LoadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: attempted={} inserted={} closed={} unchanged={} failed={}",
            self.table,
            self.rows_attempted,
            self.rows_inserted,
            self.rows_updated_closed,
            self.rows_unchanged,
            self.rows_failed
        )?;
        if self.aborted {
            write!(f, " (aborted)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_outcome_is_success() {
        let outcome = LoadOutcome::new("dwh.fact_transactions");
        assert!(outcome.is_success());
        assert_eq!(outcome.rows_attempted, 0);
        assert!(outcome.error_detail.is_none());
    }

    #[test]
    fn test_record_failure_keeps_first_detail() {
        let mut outcome = LoadOutcome::new("t");
        outcome.record_failure(ChunkFailure {
            chunk_index: 1,
            rows: 10..20,
            error: "duplicate key".to_string(),
        });
        outcome.record_failure(ChunkFailure {
            chunk_index: 3,
            rows: 30..35,
            error: "other".to_string(),
        });

        assert!(!outcome.is_success());
        assert_eq!(outcome.rows_failed, 15);
        assert_eq!(outcome.chunk_failures.len(), 2);
        assert!(outcome.error_detail.unwrap().contains("chunk 1"));
    }
}
