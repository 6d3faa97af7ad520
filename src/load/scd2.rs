//! SCD Type 2 dimension loading
//!
//! A batch holds the current state of a set of dimension entities. Each row is
//! matched to the current persisted version of its natural key:
//! - no current version: the row is inserted as a new version
//! - tracked columns all equal: nothing is written
//! - any tracked column differs: the current version is closed at the
//!   effective time and the row is inserted as the new current version
//!
//! The whole batch is reconciled inside one transaction. All reads and checks
//! run before the first write, so a rejected batch leaves no trace.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::bulk::check_columns_exist;
use super::{WarehouseLoader, abort};
use crate::database::schema::{
    IS_CURRENT, SCD2_COLUMNS, SURROGATE_KEY, VALID_FROM, VALID_TO, close_version_sql,
};
use crate::database::{
    ConflictPolicy, LoadError, LoadResult, Record, TableName, Warehouse, WarehouseSession,
};
use crate::models::value::truncate_to_micros;
use crate::models::{ColumnType, LoadOutcome, TabularBatch, Value};

/// One SCD2 load: where the batch goes and how it is versioned
#[derive(Debug, Clone)]
pub struct Scd2Request {
    pub table: String,
    pub natural_key_column: String,
    /// Columns whose changes open a new version; other columns are carried
    /// along but never trigger one
    pub tracked_columns: Vec<String>,
    pub effective_time: DateTime<Utc>,
}

impl Scd2Request {
    pub fn new(
        table: impl Into<String>,
        natural_key_column: impl Into<String>,
        tracked_columns: &[&str],
        effective_time: DateTime<Utc>,
    ) -> Self {
        Self {
            table: table.into(),
            natural_key_column: natural_key_column.into(),
            tracked_columns: tracked_columns.iter().map(|c| c.to_string()).collect(),
            effective_time: truncate_to_micros(effective_time),
        }
    }
}

/// Classification of one batch row against the store
#[derive(Debug, Clone, PartialEq)]
enum Change {
    New,
    Unchanged,
    Changed { surrogate_key: Value },
}

/// Positions and types of the tracked columns within the batch
struct TrackedColumn<'a> {
    index: usize,
    name: &'a str,
    column_type: ColumnType,
}

/// Check the natural key and tracked columns against the batch schema
fn resolve_columns<'a>(
    batch: &'a TabularBatch,
    request: &Scd2Request,
) -> LoadResult<(usize, Vec<TrackedColumn<'a>>)> {
    let schema = batch.schema();

    if let Some(reserved) = schema
        .columns
        .iter()
        .find(|c| SCD2_COLUMNS.contains(&c.name.as_str()))
    {
        return Err(LoadError::SchemaMismatch(format!(
            "batch column '{}' is managed by the loader",
            reserved.name
        )));
    }

    let natural_key_index = schema.index_of(&request.natural_key_column).ok_or_else(|| {
        LoadError::SchemaMismatch(format!(
            "natural key column '{}' is not in the batch",
            request.natural_key_column
        ))
    })?;

    if request.tracked_columns.is_empty() {
        return Err(LoadError::SchemaMismatch(
            "at least one tracked column is required".to_string(),
        ));
    }

    let mut tracked = Vec::with_capacity(request.tracked_columns.len());
    for name in &request.tracked_columns {
        let index = schema.index_of(name).ok_or_else(|| {
            LoadError::SchemaMismatch(format!("tracked column '{}' is not in the batch", name))
        })?;
        let column = &schema.columns[index];
        tracked.push(TrackedColumn {
            index,
            name: &column.name,
            column_type: column.column_type,
        });
    }

    Ok((natural_key_index, tracked))
}

/// Natural keys in batch order; rejects nulls and duplicates
fn natural_keys<'a>(
    batch: &'a TabularBatch,
    natural_key_index: usize,
    natural_key_column: &str,
) -> LoadResult<Vec<&'a Value>> {
    let mut first_seen: HashMap<&Value, usize> = HashMap::with_capacity(batch.len());
    let mut keys = Vec::with_capacity(batch.len());

    for (row_idx, row) in batch.rows().iter().enumerate() {
        let key = &row[natural_key_index];
        if key.is_null() {
            return Err(LoadError::InvalidInput(format!(
                "null natural key in column '{}' at row {}",
                natural_key_column, row_idx
            )));
        }
        if let Some(&first_row) = first_seen.get(key) {
            return Err(LoadError::DuplicateKeyInBatch {
                column: natural_key_column.to_string(),
                key: key.to_string(),
                first_row,
                second_row: row_idx,
            });
        }
        first_seen.insert(key, row_idx);
        keys.push(key);
    }

    Ok(keys)
}

/// Whether every tracked column of `row` equals the persisted version
fn is_unchanged(row: &[Value], tracked: &[TrackedColumn<'_>], current: &Record) -> bool {
    tracked.iter().all(|column| {
        let persisted = current
            .get(column.name)
            .cloned()
            .unwrap_or(Value::Null)
            .coerce_to(column.column_type);
        row[column.index] == persisted
    })
}

fn key_failure(table: &TableName, key: &Value, error: LoadError) -> LoadError {
    match error {
        LoadError::CorruptHistory { .. } | LoadError::TransactionFailed { .. } => error,
        other => LoadError::TransactionFailed {
            table: table.to_string(),
            context: format!("key {}", key),
            message: other.to_string(),
        },
    }
}

/// Classify every row against the current versions in the store
async fn classify<S: WarehouseSession>(
    session: &mut S,
    table: &TableName,
    request: &Scd2Request,
    batch: &TabularBatch,
    keys: &[&Value],
    tracked: &[TrackedColumn<'_>],
) -> LoadResult<Vec<Change>> {
    let mut plan = Vec::with_capacity(keys.len());

    for (row, key) in batch.rows().iter().zip(keys) {
        let current = session
            .current_row(table, &request.natural_key_column, key)
            .await
            .map_err(|e| key_failure(table, key, e))?;

        let change = match current {
            None => Change::New,
            Some(record) => {
                let valid_from = record
                    .get(VALID_FROM)
                    .cloned()
                    .map(|v| v.coerce_to(ColumnType::Timestamp))
                    .and_then(|v| v.as_timestamp())
                    .ok_or_else(|| LoadError::CorruptHistory {
                        table: table.to_string(),
                        message: format!("current version of key {} has no valid_from", key),
                    })?;

                if request.effective_time < valid_from {
                    return Err(LoadError::StaleEffectiveTime {
                        table: table.to_string(),
                        key: key.to_string(),
                        effective_time: request.effective_time,
                        valid_from,
                    });
                }

                if is_unchanged(row, tracked, &record) {
                    Change::Unchanged
                } else {
                    let surrogate_key = record
                        .get(SURROGATE_KEY)
                        .filter(|v| !v.is_null())
                        .cloned()
                        .ok_or_else(|| LoadError::CorruptHistory {
                            table: table.to_string(),
                            message: format!("current version of key {} has no surrogate key", key),
                        })?;
                    Change::Changed { surrogate_key }
                }
            }
        };

        debug!(%table, %key, change = ?change, "classified");
        plan.push(change);
    }

    Ok(plan)
}

/// Apply a classified batch: close changed versions, insert new ones
async fn apply<S: WarehouseSession>(
    session: &mut S,
    table: &TableName,
    request: &Scd2Request,
    batch: &TabularBatch,
    keys: &[&Value],
    plan: Vec<Change>,
    outcome: &mut LoadOutcome,
) -> LoadResult<()> {
    let close_sql = close_version_sql(table);
    let effective = Value::Timestamp(request.effective_time);

    let mut insert_columns = vec![SURROGATE_KEY.to_string()];
    insert_columns.extend(batch.schema().column_names());
    insert_columns.extend([VALID_FROM, VALID_TO, IS_CURRENT].map(str::to_string));

    let mut versions = Vec::new();
    for ((row, key), change) in batch.rows().iter().zip(keys).zip(plan) {
        match change {
            Change::Unchanged => {
                outcome.rows_unchanged += 1;
                continue;
            }
            Change::New => {}
            Change::Changed { surrogate_key } => {
                let closed = session
                    .execute(&close_sql, &[effective.clone(), surrogate_key])
                    .await
                    .map_err(|e| key_failure(table, key, e))?;
                if closed != 1 {
                    return Err(LoadError::TransactionFailed {
                        table: table.to_string(),
                        context: format!("key {}", key),
                        message: format!("expected to close 1 current version, closed {}", closed),
                    });
                }
                outcome.rows_updated_closed += 1;
            }
        }

        let mut version = Vec::with_capacity(insert_columns.len());
        version.push(Value::Uuid(Uuid::new_v4()));
        version.extend(row.iter().cloned());
        version.extend([effective.clone(), Value::Null, Value::Bool(true)]);
        versions.push(version);
    }

    let inserted = session
        .insert_many(table, &insert_columns, &versions, ConflictPolicy::Error)
        .await
        .map_err(|e| LoadError::TransactionFailed {
            table: table.to_string(),
            context: "insert versions".to_string(),
            message: e.to_string(),
        })?;
    outcome.rows_inserted = inserted as usize;

    Ok(())
}

impl<W: Warehouse> WarehouseLoader<W> {
    /// Reconcile a batch of current-state rows into an SCD2 dimension
    ///
    /// Schema problems, duplicate or null natural keys and stale effective
    /// times are reported before anything is written. Any store failure rolls
    /// back the whole batch.
    pub async fn load_scd2(
        &self,
        batch: &TabularBatch,
        request: &Scd2Request,
    ) -> LoadResult<LoadOutcome> {
        let start = std::time::Instant::now();
        // Stores keep microsecond timestamps
        let request = &Scd2Request {
            effective_time: truncate_to_micros(request.effective_time),
            ..request.clone()
        };
        let table = self.resolve_table(&request.table)?;

        let (natural_key_index, tracked) = resolve_columns(batch, request)?;
        let keys = natural_keys(batch, natural_key_index, &request.natural_key_column)?;

        let mut outcome = LoadOutcome::new(table.to_string());
        outcome.rows_attempted = batch.len();

        let mut session = self.open_session().await?;

        let mut required = batch.schema().column_names();
        required.extend(SCD2_COLUMNS.map(str::to_string));
        check_columns_exist(&mut session, &table, &required).await?;

        session
            .begin()
            .await
            .map_err(|e| LoadError::TransactionFailed {
                table: table.to_string(),
                context: "begin".to_string(),
                message: e.to_string(),
            })?;

        let plan = match classify(&mut session, &table, request, batch, &keys, &tracked).await {
            Ok(plan) => plan,
            Err(e) => return Err(abort(&mut session, &table, "classify", e).await),
        };

        if let Err(e) = apply(&mut session, &table, request, batch, &keys, plan, &mut outcome).await {
            return Err(abort(&mut session, &table, "apply", e).await);
        }

        if let Err(e) = session.commit().await {
            return Err(abort(&mut session, &table, "commit", e).await);
        }
        outcome.chunks_committed = 1;
        outcome.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            %table,
            effective_time = %request.effective_time,
            inserted = outcome.rows_inserted,
            closed = outcome.rows_updated_closed,
            unchanged = outcome.rows_unchanged,
            "scd2 load committed"
        );

        Ok(outcome)
    }

    /// Current version of a dimension entity
    pub async fn current_row(
        &self,
        table: &str,
        natural_key_column: &str,
        key: &Value,
    ) -> LoadResult<Option<Record>> {
        let table = self.resolve_table(table)?;
        let mut session = self.open_session().await?;
        session.current_row(&table, natural_key_column, key).await
    }

    /// Version of a dimension entity valid at `at`
    pub async fn row_as_of(
        &self,
        table: &str,
        natural_key_column: &str,
        key: &Value,
        at: DateTime<Utc>,
    ) -> LoadResult<Option<Record>> {
        let table = self.resolve_table(table)?;
        let mut session = self.open_session().await?;
        session.row_as_of(&table, natural_key_column, key, at).await
    }

    /// Surrogate key a fact occurring at `at` should reference
    pub async fn surrogate_as_of(
        &self,
        table: &str,
        natural_key_column: &str,
        key: &Value,
        at: DateTime<Utc>,
    ) -> LoadResult<Option<Value>> {
        let row = self.row_as_of(table, natural_key_column, key, at).await?;
        Ok(row.and_then(|r| r.get(SURROGATE_KEY).cloned()))
    }
}
