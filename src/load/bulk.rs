//! Chunked bulk loading
//!
//! A batch is split into ordered chunks of at most `chunk_size` rows. With
//! [`TransactionScope::PerChunk`] each chunk is written in its own
//! transaction: a chunk either lands completely or not at all, failed chunks
//! are reported in the [`LoadOutcome`] and, unless the policy says otherwise,
//! loading continues with the next chunk. With [`TransactionScope::WholeBatch`]
//! every chunk runs inside one transaction and any failure rolls back the
//! whole batch.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, info, warn};

use super::WarehouseLoader;
use crate::database::config::LoadSection;
use crate::database::{
    ConflictPolicy, LoadError, LoadResult, TableName, Warehouse, WarehouseSession,
};
use crate::models::{ChunkFailure, LoadOutcome, TabularBatch};

/// Default rows per chunk transaction
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// What to do after a chunk fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and load the remaining chunks
    #[default]
    Continue,
    /// Stop after the first failed chunk
    AbortOnFirstFailure,
}

/// How many transactions a bulk load uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionScope {
    /// One transaction per chunk
    #[default]
    PerChunk,
    /// One transaction around every chunk of the batch
    WholeBatch,
}

/// Options for [`WarehouseLoader::bulk_load`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkLoadOptions {
    pub chunk_size: usize,
    pub on_conflict: ConflictPolicy,
    pub failure_policy: FailurePolicy,
    pub transaction_scope: TransactionScope,
}

impl Default for BulkLoadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            on_conflict: ConflictPolicy::Error,
            failure_policy: FailurePolicy::Continue,
            transaction_scope: TransactionScope::PerChunk,
        }
    }
}

impl BulkLoadOptions {
    /// Options taken from the `[load]` configuration section
    pub fn from_config(load: &LoadSection) -> Self {
        Self {
            chunk_size: load.chunk_size,
            failure_policy: if load.abort_on_failure {
                FailurePolicy::AbortOnFirstFailure
            } else {
                FailurePolicy::Continue
            },
            transaction_scope: if load.single_transaction {
                TransactionScope::WholeBatch
            } else {
                TransactionScope::PerChunk
            },
            ..Default::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_conflict_policy(mut self, on_conflict: ConflictPolicy) -> Self {
        self.on_conflict = on_conflict;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn with_transaction_scope(mut self, transaction_scope: TransactionScope) -> Self {
        self.transaction_scope = transaction_scope;
        self
    }
}

/// Check that every batch column exists in the target table
///
/// Table columns missing from the batch are left to their defaults.
pub(crate) async fn check_columns_exist<S: WarehouseSession>(
    session: &mut S,
    table: &TableName,
    columns: &[String],
) -> LoadResult<Vec<String>> {
    let table_columns = session.table_columns(table).await?;
    if table_columns.is_empty() {
        return Err(LoadError::SchemaMismatch(format!(
            "table {} does not exist",
            table
        )));
    }

    let missing: Vec<&str> = columns
        .iter()
        .filter(|c| !table_columns.contains(c))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(LoadError::SchemaMismatch(format!(
            "columns not found in {}: {}",
            table,
            missing.join(", ")
        )));
    }

    Ok(table_columns)
}

/// Roll back after a failure; a rollback that fails ends the load
async fn rollback<S: WarehouseSession>(
    session: &mut S,
    table: &TableName,
    context: String,
    outcome: &LoadOutcome,
    cause: &LoadError,
) -> LoadResult<()> {
    session
        .rollback()
        .await
        .map_err(|rollback_error| LoadError::TransactionFailed {
            table: table.to_string(),
            context: format!("{} rollback, {} chunks committed", context, outcome.chunks_committed),
            message: format!("{} (after: {})", rollback_error, cause),
        })
}

async fn load_per_chunk<S: WarehouseSession>(
    session: &mut S,
    table: &TableName,
    batch: &TabularBatch,
    columns: &[String],
    options: &BulkLoadOptions,
    outcome: &mut LoadOutcome,
) -> LoadResult<()> {
    for (chunk_index, chunk) in batch.chunks(options.chunk_size).enumerate() {
        let first_row = chunk_index * options.chunk_size;
        let rows: Range<usize> = first_row..first_row + chunk.len();
        outcome.rows_attempted += chunk.len();

        // No transaction could be opened, so the session is not trusted further
        if let Err(e) = session.begin().await {
            warn!(%table, chunk = chunk_index, error = %e, "begin failed, stopping load");
            outcome.record_failure(ChunkFailure {
                chunk_index,
                rows,
                error: e.to_string(),
            });
            outcome.aborted = true;
            break;
        }

        let written = match session
            .insert_many(table, columns, chunk, options.on_conflict)
            .await
        {
            Ok(written) => session.commit().await.map(|_| written),
            Err(e) => Err(e),
        };

        match written {
            Ok(written) => {
                outcome.rows_inserted += written as usize;
                outcome.chunks_committed += 1;
                debug!(%table, chunk = chunk_index, rows = chunk.len(), written, "chunk committed");
            }
            Err(e) => {
                rollback(session, table, format!("chunk {}", chunk_index), outcome, &e).await?;

                warn!(%table, chunk = chunk_index, rows = ?rows, error = %e, "chunk rolled back");
                outcome.record_failure(ChunkFailure {
                    chunk_index,
                    rows,
                    error: e.to_string(),
                });

                if options.failure_policy == FailurePolicy::AbortOnFirstFailure {
                    outcome.aborted = true;
                    break;
                }
            }
        }
    }

    Ok(())
}

/// All chunks inside one transaction; a failure is recorded against the
/// whole batch since none of it is kept
async fn load_whole_batch<S: WarehouseSession>(
    session: &mut S,
    table: &TableName,
    batch: &TabularBatch,
    columns: &[String],
    options: &BulkLoadOptions,
    outcome: &mut LoadOutcome,
) -> LoadResult<()> {
    if batch.is_empty() {
        return Ok(());
    }
    outcome.rows_attempted = batch.len();

    if let Err(e) = session.begin().await {
        warn!(%table, error = %e, "begin failed");
        outcome.record_failure(ChunkFailure {
            chunk_index: 0,
            rows: 0..batch.len(),
            error: e.to_string(),
        });
        outcome.aborted = true;
        return Ok(());
    }

    let mut written = 0u64;
    let mut failure = None;
    for (chunk_index, chunk) in batch.chunks(options.chunk_size).enumerate() {
        match session
            .insert_many(table, columns, chunk, options.on_conflict)
            .await
        {
            Ok(n) => {
                written += n;
                debug!(%table, chunk = chunk_index, rows = chunk.len(), written = n, "chunk inserted");
            }
            Err(e) => {
                failure = Some((chunk_index, e));
                break;
            }
        }
    }

    let (chunk_index, e) = match failure {
        None => match session.commit().await {
            Ok(()) => {
                outcome.rows_inserted = written as usize;
                outcome.chunks_committed = 1;
                return Ok(());
            }
            Err(e) => (batch.len().div_ceil(options.chunk_size) - 1, e),
        },
        Some(failure) => failure,
    };

    rollback(session, table, "batch".to_string(), outcome, &e).await?;
    warn!(%table, chunk = chunk_index, error = %e, "batch rolled back");
    outcome.record_failure(ChunkFailure {
        chunk_index,
        rows: 0..batch.len(),
        error: e.to_string(),
    });
    outcome.aborted = true;

    Ok(())
}

impl<W: Warehouse> WarehouseLoader<W> {
    /// Append a batch to a table in chunk-sized inserts
    ///
    /// Validation problems (`chunk_size` of zero, unknown table or columns)
    /// are returned as errors before anything is written. Chunk failures are
    /// reported in the outcome. An error is also returned when a failed
    /// transaction cannot be rolled back, since the session can no longer be
    /// trusted.
    pub async fn bulk_load(
        &self,
        batch: &TabularBatch,
        table: &str,
        options: &BulkLoadOptions,
    ) -> LoadResult<LoadOutcome> {
        let start = std::time::Instant::now();

        if options.chunk_size == 0 {
            return Err(LoadError::InvalidInput(
                "chunk_size must be greater than zero".to_string(),
            ));
        }

        let table = self.resolve_table(table)?;
        let columns = batch.schema().column_names();
        let mut outcome = LoadOutcome::new(table.to_string());

        let mut session = self.open_session().await?;
        check_columns_exist(&mut session, &table, &columns).await?;

        match options.transaction_scope {
            TransactionScope::PerChunk => {
                load_per_chunk(&mut session, &table, batch, &columns, options, &mut outcome).await?
            }
            TransactionScope::WholeBatch => {
                load_whole_batch(&mut session, &table, batch, &columns, options, &mut outcome)
                    .await?
            }
        }

        outcome.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            %table,
            scope = ?options.transaction_scope,
            attempted = outcome.rows_attempted,
            inserted = outcome.rows_inserted,
            failed = outcome.rows_failed,
            chunks = outcome.chunks_committed,
            aborted = outcome.aborted,
            "bulk load finished"
        );

        Ok(outcome)
    }
}
