//! DuckDB warehouse backend
//!
//! Embedded warehouse used for local loads and tests. Every session works on
//! its own clone of the database connection, so sessions opened from the same
//! [`DuckDbWarehouse`] see the same data (including in-memory databases).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::schema::insert_sql;
use super::{
    ConflictPolicy, Dialect, LoadError, LoadResult, QueryResult, TableName, Warehouse,
    WarehouseSession,
};
use crate::models::Value;

/// DuckDB warehouse
///
/// Supports both file-based persistence and in-memory mode.
pub struct DuckDbWarehouse {
    /// Path to the database file (None for in-memory)
    db_path: Option<PathBuf>,
    /// Root connection that sessions are cloned from
    connection: Mutex<duckdb::Connection>,
}

impl DuckDbWarehouse {
    /// Open (or create) a file-based warehouse
    pub fn new(db_path: impl AsRef<Path>) -> LoadResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let connection = duckdb::Connection::open(&path).map_err(|e| {
            LoadError::ConnectionFailed(format!("Failed to open DuckDB: {}", e))
        })?;

        Ok(Self {
            db_path: Some(path),
            connection: Mutex::new(connection),
        })
    }

    /// Create an in-memory warehouse
    pub fn in_memory() -> LoadResult<Self> {
        let connection = duckdb::Connection::open_in_memory().map_err(|e| {
            LoadError::ConnectionFailed(format!("Failed to create in-memory DuckDB: {}", e))
        })?;

        Ok(Self {
            db_path: None,
            connection: Mutex::new(connection),
        })
    }

    /// Get the database file path (None for in-memory)
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Check if this is an in-memory database
    pub fn is_in_memory(&self) -> bool {
        self.db_path.is_none()
    }
}

#[async_trait(?Send)]
impl Warehouse for DuckDbWarehouse {
    type Session = DuckDbSession;

    async fn session(&self) -> LoadResult<DuckDbSession> {
        let root = self
            .connection
            .lock()
            .map_err(|e| LoadError::ConnectionFailed(format!("Lock error: {}", e)))?;

        let connection = root.try_clone().map_err(|e| {
            LoadError::ConnectionFailed(format!("Failed to open DuckDB session: {}", e))
        })?;

        Ok(DuckDbSession {
            connection,
            in_transaction: false,
        })
    }

    fn backend_type(&self) -> &'static str {
        "duckdb"
    }
}

/// Session on a DuckDB warehouse
///
/// An open transaction is rolled back when the session is dropped.
pub struct DuckDbSession {
    connection: duckdb::Connection,
    in_transaction: bool,
}

impl DuckDbSession {
    fn execute_batch(&self, sql: &str) -> LoadResult<()> {
        self.connection
            .execute_batch(sql)
            .map_err(|e| LoadError::QueryFailed(format!("{} failed: {}", sql, e)))
    }

    /// Convert a DuckDB ValueRef to a cell value
    fn value_from_ref(value: duckdb::types::ValueRef) -> Value {
        use duckdb::types::{TimeUnit, ValueRef};

        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Boolean(b) => Value::Bool(b),
            ValueRef::TinyInt(i) => Value::Int(i.into()),
            ValueRef::SmallInt(i) => Value::Int(i.into()),
            ValueRef::Int(i) => Value::Int(i.into()),
            ValueRef::BigInt(i) => Value::Int(i),
            ValueRef::HugeInt(i) => i64::try_from(i)
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Text(i.to_string())),
            ValueRef::UTinyInt(i) => Value::Int(i.into()),
            ValueRef::USmallInt(i) => Value::Int(i.into()),
            ValueRef::UInt(i) => Value::Int(i.into()),
            ValueRef::UBigInt(i) => i64::try_from(i)
                .map(Value::Int)
                .unwrap_or_else(|_| Value::Text(i.to_string())),
            ValueRef::Float(f) => Value::Float(f.into()),
            ValueRef::Double(f) => Value::Float(f),
            ValueRef::Decimal(d) => d
                .to_string()
                .parse::<f64>()
                .map(Value::Float)
                .unwrap_or_else(|_| Value::Text(d.to_string())),
            ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => {
                use base64::Engine;
                Value::Text(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            ValueRef::Timestamp(unit, raw) => {
                let timestamp = match unit {
                    TimeUnit::Second => DateTime::<Utc>::from_timestamp(raw, 0),
                    TimeUnit::Millisecond => DateTime::<Utc>::from_timestamp_millis(raw),
                    TimeUnit::Microsecond => DateTime::<Utc>::from_timestamp_micros(raw),
                    TimeUnit::Nanosecond => Some(DateTime::<Utc>::from_timestamp_nanos(raw)),
                };
                timestamp
                    .map(Value::Timestamp)
                    .unwrap_or_else(|| Value::Text(raw.to_string()))
            }
            ValueRef::Date32(days) => DateTime::<Utc>::from_timestamp(i64::from(days) * 86_400, 0)
                .map(|t| Value::Date(t.date_naive()))
                .unwrap_or_else(|| Value::Text(days.to_string())),
            other => Value::Text(format!("{:?}", other)),
        }
    }

    fn collect_rows(
        rows: &mut duckdb::Rows<'_>,
    ) -> LoadResult<(Vec<String>, Vec<Vec<Value>>)> {
        // Column metadata is only available once the statement has run
        let column_count = rows.as_ref().map(|r| r.column_count()).unwrap_or(0);
        let columns: Vec<String> = (0..column_count)
            .map(|i| {
                rows.as_ref()
                    .and_then(|r| r.column_name(i).ok())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("col{}", i))
            })
            .collect();

        let mut collected = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| LoadError::QueryFailed(format!("Row fetch error: {}", e)))?
        {
            let values = (0..column_count)
                .map(|i| {
                    row.get_ref(i)
                        .map(Self::value_from_ref)
                        .unwrap_or(Value::Null)
                })
                .collect();
            collected.push(values);
        }

        Ok((columns, collected))
    }
}

impl Drop for DuckDbSession {
    fn drop(&mut self) {
        if self.in_transaction {
            warn!("DuckDB session dropped inside a transaction; rolling back");
            let _ = self.connection.execute_batch("ROLLBACK");
        }
    }
}

#[async_trait(?Send)]
impl WarehouseSession for DuckDbSession {
    fn dialect(&self) -> Dialect {
        Dialect::DuckDb
    }

    async fn begin(&mut self) -> LoadResult<()> {
        self.execute_batch("BEGIN TRANSACTION")?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> LoadResult<()> {
        let result = self.execute_batch("COMMIT");
        // A failed COMMIT leaves DuckDB's transaction aborted but open
        if result.is_ok() {
            self.in_transaction = false;
        }
        result
    }

    async fn rollback(&mut self) -> LoadResult<()> {
        let result = self.execute_batch("ROLLBACK");
        self.in_transaction = false;
        result
    }

    async fn execute(&mut self, statement: &str, params: &[Value]) -> LoadResult<u64> {
        debug!(statement, params = params.len(), "duckdb execute");
        let affected = self
            .connection
            .execute(statement, duckdb::params_from_iter(params.iter()))
            .map_err(|e| LoadError::QueryFailed(format!("Execute failed: {}", e)))?;
        Ok(affected as u64)
    }

    async fn query(&mut self, statement: &str, params: &[Value]) -> LoadResult<QueryResult> {
        let start = std::time::Instant::now();

        let mut stmt = self
            .connection
            .prepare(statement)
            .map_err(|e| LoadError::QueryFailed(format!("Prepare failed: {}", e)))?;

        let mut rows = stmt
            .query(duckdb::params_from_iter(params.iter()))
            .map_err(|e| LoadError::QueryFailed(format!("Query failed: {}", e)))?;

        let (columns, rows) = Self::collect_rows(&mut rows)?;

        Ok(QueryResult {
            columns,
            rows,
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn insert_many(
        &mut self,
        table: &TableName,
        columns: &[String],
        rows: &[Vec<Value>],
        on_conflict: ConflictPolicy,
    ) -> LoadResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let sql = insert_sql(table, columns, on_conflict);
        let mut stmt = self
            .connection
            .prepare(&sql)
            .map_err(|e| LoadError::QueryFailed(format!("Prepare failed: {}", e)))?;

        let mut written = 0u64;
        for (i, row) in rows.iter().enumerate() {
            written += stmt
                .execute(duckdb::params_from_iter(row.iter()))
                .map_err(|e| {
                    LoadError::QueryFailed(format!("Insert into {} failed at row {}: {}", table, i, e))
                })? as u64;
        }

        Ok(written)
    }
}

impl duckdb::ToSql for Value {
    fn to_sql(&self) -> duckdb::Result<duckdb::types::ToSqlOutput<'_>> {
        use duckdb::types::{TimeUnit, ToSqlOutput, Value as DuckValue};

        let value = match self {
            Value::Null => DuckValue::Null,
            Value::Bool(b) => DuckValue::Boolean(*b),
            Value::Int(i) => DuckValue::BigInt(*i),
            Value::Float(f) => DuckValue::Double(*f),
            Value::Timestamp(t) => DuckValue::Timestamp(TimeUnit::Microsecond, t.timestamp_micros()),
            Value::Date(d) => {
                let days = d.signed_duration_since(chrono::NaiveDate::default()).num_days();
                DuckValue::Date32(days as i32)
            }
            // Surrogate keys are VARCHAR columns on DuckDB
            Value::Uuid(u) => DuckValue::Text(u.to_string()),
            Value::Text(s) => DuckValue::Text(s.clone()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn session_with_table() -> (DuckDbWarehouse, DuckDbSession) {
        let warehouse = DuckDbWarehouse::in_memory().unwrap();
        let mut session = warehouse.session().await.unwrap();
        session
            .execute(
                "CREATE TABLE agents (agent_id BIGINT PRIMARY KEY, region VARCHAR, opened TIMESTAMP)",
                &[],
            )
            .await
            .unwrap();
        (warehouse, session)
    }

    #[tokio::test]
    async fn test_in_memory_warehouse() {
        let warehouse = DuckDbWarehouse::in_memory().unwrap();
        assert!(warehouse.is_in_memory());
        assert!(warehouse.db_path().is_none());
        assert_eq!(warehouse.backend_type(), "duckdb");
    }

    #[tokio::test]
    async fn test_file_warehouse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dwh.duckdb");
        let warehouse = DuckDbWarehouse::new(&path).unwrap();
        assert_eq!(warehouse.db_path(), Some(path.as_path()));

        let mut session = warehouse.session().await.unwrap();
        let result = session.query("SELECT 1 AS ok", &[]).await.unwrap();
        assert_eq!(result.scalar(), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_insert_and_query_round_trip() {
        let (_warehouse, mut session) = session_with_table().await;
        let opened = Utc.with_ymd_and_hms(2024, 1, 15, 8, 30, 0).unwrap();

        let table = TableName::new(None, "agents");
        let columns = vec!["agent_id".to_string(), "region".to_string(), "opened".to_string()];
        let written = session
            .insert_many(
                &table,
                &columns,
                &[
                    vec![Value::Int(1), Value::from("Dakar"), Value::Timestamp(opened)],
                    vec![Value::Int(2), Value::Null, Value::Null],
                ],
                ConflictPolicy::Error,
            )
            .await
            .unwrap();
        assert_eq!(written, 2);

        let result = session
            .query(
                "SELECT agent_id, region, opened FROM agents WHERE agent_id = $1",
                &[Value::Int(1)],
            )
            .await
            .unwrap();
        assert_eq!(result.columns, columns);
        assert_eq!(
            result.rows[0],
            vec![Value::Int(1), Value::from("Dakar"), Value::Timestamp(opened)]
        );
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let (warehouse, mut session) = session_with_table().await;

        session.begin().await.unwrap();
        session
            .execute("INSERT INTO agents (agent_id) VALUES ($1)", &[Value::Int(9)])
            .await
            .unwrap();
        session.rollback().await.unwrap();

        let mut other = warehouse.session().await.unwrap();
        let count = other.query("SELECT COUNT(*) FROM agents", &[]).await.unwrap();
        assert_eq!(count.scalar(), Some(&Value::Int(0)));
    }

    #[tokio::test]
    async fn test_conflict_skip() {
        let (_warehouse, mut session) = session_with_table().await;
        let table = TableName::new(None, "agents");
        let columns = vec!["agent_id".to_string()];
        let rows = vec![vec![Value::Int(1)]];

        session
            .insert_many(&table, &columns, &rows, ConflictPolicy::Error)
            .await
            .unwrap();
        assert!(
            session
                .insert_many(&table, &columns, &rows, ConflictPolicy::Error)
                .await
                .is_err()
        );
        assert!(
            session
                .insert_many(&table, &columns, &rows, ConflictPolicy::Skip)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_table_columns() {
        let (_warehouse, mut session) = session_with_table().await;
        let columns = session
            .table_columns(&TableName::new(None, "agents"))
            .await
            .unwrap();
        assert_eq!(columns, vec!["agent_id", "region", "opened"]);
    }
}
