//! Warehouse session abstraction
//!
//! This module provides the store-facing half of the loader:
//! - [`Warehouse`]: hands out one session per load operation
//! - [`WarehouseSession`]: a transactional handle (begin / execute /
//!   insert_many / commit / rollback) with current-row lookups built on top
//! - DuckDB: embedded warehouse for local runs and tests
//! - PostgreSQL: pooled sessions for the deployed warehouse
//!
//! Loaders never keep a session between calls; callers pass the warehouse
//! handle explicitly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Value;

// Re-export implementations based on features
#[cfg(feature = "duckdb-backend")]
pub mod duckdb;

#[cfg(feature = "postgres-backend")]
pub mod postgres;

pub mod config;
pub mod schema;

#[cfg(feature = "duckdb-backend")]
pub use self::duckdb::{DuckDbSession, DuckDbWarehouse};

#[cfg(feature = "postgres-backend")]
pub use self::postgres::{PostgresSession, PostgresWarehouse};

pub use config::LoaderConfig;
pub use schema::{ConflictPolicy, DimensionSchema, TableName, quote_ident};

/// Error type for load and database operations
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Could not acquire a warehouse session
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Batch columns do not line up with the target table or tracked columns
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The same natural key appears more than once in one SCD2 batch
    #[error("Duplicate natural key {key} in column '{column}' (rows {first_row} and {second_row})")]
    DuplicateKeyInBatch {
        column: String,
        key: String,
        first_row: usize,
        second_row: usize,
    },

    /// The effective time precedes the start of the current version of a key
    #[error(
        "Effective time {effective_time} precedes valid_from {valid_from} of key {key} in {table}"
    )]
    StaleEffectiveTime {
        table: String,
        key: String,
        effective_time: DateTime<Utc>,
        valid_from: DateTime<Utc>,
    },

    /// The store rejected a transaction; it was rolled back
    #[error("Transaction failed on {table} ({context}): {message}")]
    TransactionFailed {
        table: String,
        context: String,
        message: String,
    },

    /// Persisted history breaks the one-current-row invariant
    #[error("Corrupt history in {table}: {message}")]
    CorruptHistory { table: String, message: String },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

impl LoadError {
    /// Whether the error was raised before anything was written
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LoadError::SchemaMismatch(_)
                | LoadError::DuplicateKeyInBatch { .. }
                | LoadError::StaleEffectiveTime { .. }
                | LoadError::InvalidInput(_)
        )
    }
}

impl From<crate::models::BatchError> for LoadError {
    fn from(e: crate::models::BatchError) -> Self {
        match e {
            crate::models::BatchError::Io(message) => LoadError::IoError(message),
            other => LoadError::InvalidInput(other.to_string()),
        }
    }
}

/// Result type for load and database operations
pub type LoadResult<T> = Result<T, LoadError>;

/// SQL dialect spoken by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    DuckDb,
    Postgres,
}

impl Dialect {
    /// Statement emptying a table
    pub fn truncate_sql(&self, table: &TableName) -> String {
        match self {
            Dialect::DuckDb => format!("TRUNCATE {}", table.quoted()),
            Dialect::Postgres => format!("TRUNCATE TABLE {} CASCADE", table.quoted()),
        }
    }

    /// Whether `CREATE UNIQUE INDEX ... WHERE` is available
    pub fn supports_partial_index(&self) -> bool {
        matches!(self, Dialect::Postgres)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::DuckDb => write!(f, "duckdb"),
            Dialect::Postgres => write!(f, "postgres"),
        }
    }
}

/// One row returned by a query, with its column names
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl Record {
    /// Value of a named column
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }
}

/// Query result set
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Rows of data, in column order
    pub rows: Vec<Vec<Value>>,
    /// Execution time in milliseconds
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Create a new query result
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows,
            execution_time_ms: 0,
        }
    }

    /// Create an empty result
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Get the number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Consume the result into named records
    pub fn into_records(self) -> Vec<Record> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|values| Record {
                columns: columns.clone(),
                values,
            })
            .collect()
    }

    /// First column of the first row
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|r| r.first())
    }
}

/// Source of warehouse sessions
///
/// Each load operation acquires exactly one session and releases it before
/// returning.
#[async_trait(?Send)]
pub trait Warehouse {
    type Session: WarehouseSession;

    /// Acquire a session; failures surface as [`LoadError::ConnectionFailed`]
    async fn session(&self) -> LoadResult<Self::Session>;

    /// Get the database backend type name
    fn backend_type(&self) -> &'static str;
}

/// Transactional handle to the warehouse
///
/// Statements use `$1, $2, ...` placeholders on every backend.
#[async_trait(?Send)]
pub trait WarehouseSession {
    /// SQL dialect of the underlying store
    fn dialect(&self) -> Dialect;

    /// Open a transaction
    async fn begin(&mut self) -> LoadResult<()>;

    /// Commit the open transaction
    async fn commit(&mut self) -> LoadResult<()>;

    /// Roll back the open transaction
    async fn rollback(&mut self) -> LoadResult<()>;

    /// Execute a statement, returning the number of affected rows
    async fn execute(&mut self, statement: &str, params: &[Value]) -> LoadResult<u64>;

    /// Execute a query and collect its rows
    async fn query(&mut self, statement: &str, params: &[Value]) -> LoadResult<QueryResult>;

    /// Insert rows (in `columns` order) into `table`, returning rows written
    async fn insert_many(
        &mut self,
        table: &TableName,
        columns: &[String],
        rows: &[Vec<Value>],
        on_conflict: ConflictPolicy,
    ) -> LoadResult<u64>;

    /// Current version of a dimension row, if the key has one
    async fn current_row(
        &mut self,
        table: &TableName,
        natural_key_column: &str,
        key: &Value,
    ) -> LoadResult<Option<Record>> {
        let sql = format!(
            "SELECT * FROM {} WHERE {} = $1 AND {}",
            table.quoted(),
            quote_ident(natural_key_column),
            quote_ident(schema::IS_CURRENT)
        );
        let mut records = self.query(&sql, std::slice::from_ref(key)).await?.into_records();

        match records.len() {
            0 => Ok(None),
            1 => Ok(records.pop()),
            n => Err(LoadError::CorruptHistory {
                table: table.to_string(),
                message: format!("{} current rows for key {}", n, key),
            }),
        }
    }

    /// Version of a dimension row whose validity window contains `at`
    async fn row_as_of(
        &mut self,
        table: &TableName,
        natural_key_column: &str,
        key: &Value,
        at: DateTime<Utc>,
    ) -> LoadResult<Option<Record>> {
        let sql = format!(
            "SELECT * FROM {table} WHERE {nk} = $1 AND {from} <= $2 \
             AND ({to} IS NULL OR {to} > $2) ORDER BY {from} DESC",
            table = table.quoted(),
            nk = quote_ident(natural_key_column),
            from = quote_ident(schema::VALID_FROM),
            to = quote_ident(schema::VALID_TO),
        );
        let mut records = self
            .query(&sql, &[key.clone(), Value::Timestamp(at)])
            .await?
            .into_records();

        match records.len() {
            0 => Ok(None),
            1 => Ok(records.pop()),
            n => Err(LoadError::CorruptHistory {
                table: table.to_string(),
                message: format!("{} overlapping versions of key {} at {}", n, key, at),
            }),
        }
    }

    /// Column names of a table, in ordinal order
    async fn table_columns(&mut self, table: &TableName) -> LoadResult<Vec<String>> {
        let (sql, params) = match &table.schema {
            Some(schema) => (
                "SELECT column_name::text AS column_name FROM information_schema.columns \
                 WHERE table_schema::text = $1 AND table_name::text = $2 \
                 ORDER BY ordinal_position",
                vec![Value::from(schema.as_str()), Value::from(table.name.as_str())],
            ),
            None => (
                "SELECT column_name::text AS column_name FROM information_schema.columns \
                 WHERE table_schema::text = current_schema() AND table_name::text = $1 \
                 ORDER BY ordinal_position",
                vec![Value::from(table.name.as_str())],
            ),
        };

        let result = self.query(sql, &params).await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }
}

/// Output format for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

/// Format query results for display
pub fn format_query_result(result: &QueryResult, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => format_as_json(result),
        OutputFormat::Csv => format_as_csv(result),
        OutputFormat::Table => format_as_table(result),
    }
}

fn format_as_json(result: &QueryResult) -> String {
    let rows: Vec<serde_json::Map<String, serde_json::Value>> = result
        .rows
        .iter()
        .map(|row| {
            result
                .columns
                .iter()
                .cloned()
                .zip(row.iter().map(|v| serde_json::to_value(v).unwrap_or_default()))
                .collect()
        })
        .collect();
    serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
}

fn format_as_csv(result: &QueryResult) -> String {
    let mut output = String::new();

    output.push_str(&result.columns.join(","));
    output.push('\n');

    for row in &result.rows {
        let values: Vec<String> = row
            .iter()
            .map(|value| match value {
                Value::Null => String::new(),
                Value::Text(s) if s.contains(',') || s.contains('"') || s.contains('\n') => {
                    format!("\"{}\"", s.replace('"', "\"\""))
                }
                other => other.to_display_string(),
            })
            .collect();
        output.push_str(&values.join(","));
        output.push('\n');
    }

    output
}

fn format_as_table(result: &QueryResult) -> String {
    if result.is_empty() {
        return "(0 rows)".to_string();
    }

    let rendered: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| row.iter().map(Value::to_display_string).collect())
        .collect();

    let mut widths: Vec<usize> = result.columns.iter().map(|c| c.len()).collect();
    for row in &rendered {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.len());
            }
        }
    }

    let mut output = String::new();

    let header: Vec<String> = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{:width$}", c, width = widths[i]))
        .collect();
    output.push_str(&header.join(" | "));
    output.push('\n');

    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    output.push_str(&separator.join("-+-"));
    output.push('\n');

    for row in &rendered {
        let values: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{:width$}", s, width = widths.get(i).copied().unwrap_or(0)))
            .collect();
        output.push_str(&values.join(" | "));
        output.push('\n');
    }

    output.push_str(&format!("({} rows)", result.row_count()));

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(
            OutputFormat::from_str("table").unwrap(),
            OutputFormat::Table
        );
        assert_eq!(OutputFormat::from_str("JSON").unwrap(), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str("csv").unwrap(), OutputFormat::Csv);
        assert!(OutputFormat::from_str("unknown").is_err());
    }

    #[test]
    fn test_query_result_records() {
        let result = QueryResult::new(
            vec!["client_id".to_string(), "segment".to_string()],
            vec![vec![Value::Int(1), Value::from("PME")]],
        );
        assert_eq!(result.scalar(), Some(&Value::Int(1)));

        let records = result.into_records();
        assert_eq!(records[0].get("segment"), Some(&Value::from("PME")));
        assert_eq!(records[0].get("missing"), None);
    }

    #[test]
    fn test_format_as_table() {
        let result = QueryResult::new(
            vec!["table_name".to_string(), "row_count".to_string()],
            vec![
                vec![Value::from("dim_client"), Value::Int(10)],
                vec![Value::from("fact_transactions"), Value::Int(100)],
            ],
        );

        let output = format_as_table(&result);
        assert!(output.contains("table_name"));
        assert!(output.contains("dim_client"));
        assert!(output.contains("(2 rows)"));
        assert_eq!(format_as_table(&QueryResult::empty()), "(0 rows)");
    }

    #[test]
    fn test_format_as_csv() {
        let result = QueryResult::new(
            vec!["name".to_string(), "sector".to_string()],
            vec![
                vec![Value::from("acme"), Value::from("Retail")],
                vec![Value::from("globex"), Value::from("Banking, Insurance")],
                vec![Value::from("initech"), Value::Null],
            ],
        );

        let output = format_as_csv(&result);
        assert!(output.starts_with("name,sector\n"));
        assert!(output.contains("acme,Retail"));
        assert!(output.contains("\"Banking, Insurance\""));
        assert!(output.contains("initech,\n"));
    }

    #[test]
    fn test_format_as_json() {
        let result = QueryResult::new(
            vec!["client_id".to_string()],
            vec![vec![Value::Int(7)]],
        );
        let output = format_query_result(&result, OutputFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed[0]["client_id"], 7);
    }

    #[test]
    fn test_truncate_sql_by_dialect() {
        let table = TableName::parse("dwh.dim_client").unwrap();
        assert_eq!(
            Dialect::Postgres.truncate_sql(&table),
            r#"TRUNCATE TABLE "dwh"."dim_client" CASCADE"#
        );
        assert_eq!(
            Dialect::DuckDb.truncate_sql(&table),
            r#"TRUNCATE "dwh"."dim_client""#
        );
    }

    #[test]
    fn test_validation_errors_are_flagged() {
        assert!(LoadError::SchemaMismatch("x".into()).is_validation());
        assert!(!LoadError::ConnectionFailed("x".into()).is_validation());
    }
}
