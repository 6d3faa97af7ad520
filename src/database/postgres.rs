//! PostgreSQL warehouse backend
//!
//! Sessions are pooled connections handed out by deadpool-postgres. Each
//! session holds one connection for its whole lifetime.

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use rust_decimal::Decimal;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tracing::{debug, warn};
use uuid::Uuid;

use super::config::{PostgresSection, mask_password};
use super::schema::insert_sql;
use super::{
    ConflictPolicy, Dialect, LoadError, LoadResult, QueryResult, TableName, Warehouse,
    WarehouseSession,
};
use crate::models::Value;

/// PostgreSQL warehouse
pub struct PostgresWarehouse {
    /// Connection string with the password masked
    connection_string_masked: String,
    pool: Pool,
}

impl PostgresWarehouse {
    /// Create a warehouse with a pool of at most `pool_size` connections
    ///
    /// Connections are opened lazily when sessions are requested.
    pub fn new(connection_string: &str, pool_size: usize) -> LoadResult<Self> {
        let pg_config: tokio_postgres::Config = connection_string.parse().map_err(|e| {
            LoadError::ConfigError(format!("Invalid PostgreSQL connection string: {}", e))
        })?;

        let manager = Manager::from_config(
            pg_config,
            tokio_postgres::NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        let pool = Pool::builder(manager)
            .max_size(pool_size)
            .build()
            .map_err(|e| LoadError::ConfigError(format!("Failed to build pool: {}", e)))?;

        Ok(Self {
            connection_string_masked: mask_password(connection_string),
            pool,
        })
    }

    /// Create a warehouse from the `[postgres]` configuration section
    pub fn from_config(config: &PostgresSection) -> LoadResult<Self> {
        Self::new(&config.connection_string(), config.pool_size)
    }

    /// Get the connection string (masked for security)
    pub fn connection_string_masked(&self) -> &str {
        &self.connection_string_masked
    }

    /// Maximum number of pooled connections
    pub fn pool_size(&self) -> usize {
        self.pool.status().max_size
    }
}

#[async_trait(?Send)]
impl Warehouse for PostgresWarehouse {
    type Session = PostgresSession;

    async fn session(&self) -> LoadResult<PostgresSession> {
        let client = self.pool.get().await.map_err(|e| {
            LoadError::ConnectionFailed(format!(
                "Failed to connect to PostgreSQL at {}: {}",
                self.connection_string_masked, e
            ))
        })?;

        Ok(PostgresSession {
            client: Some(client),
            in_transaction: false,
        })
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}

/// Session holding one pooled PostgreSQL connection
///
/// A session dropped inside a transaction detaches its connection from the
/// pool instead of returning it, so the server aborts the transaction when
/// the connection closes.
pub struct PostgresSession {
    client: Option<Object>,
    in_transaction: bool,
}

impl PostgresSession {
    fn client(&self) -> LoadResult<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| LoadError::ConnectionFailed("Session already released".to_string()))
    }

    fn params(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
        params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
    }

    /// Read one column of a row into a cell value
    ///
    /// Column types with no cell representation are an error rather than
    /// a silent null.
    fn column_value(row: &tokio_postgres::Row, idx: usize) -> LoadResult<Value> {
        let column = &row.columns()[idx];
        let ty = column.type_().clone();

        let value = match ty {
            Type::BOOL => row.try_get::<_, Option<bool>>(idx).map(Value::from),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(idx)
                .map(|v| Value::from(v.map(i64::from))),
            Type::INT4 => row.try_get::<_, Option<i32>>(idx).map(Value::from),
            Type::INT8 => row.try_get::<_, Option<i64>>(idx).map(Value::from),
            Type::OID => row
                .try_get::<_, Option<u32>>(idx)
                .map(|v| Value::from(v.map(i64::from))),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(idx)
                .map(|v| Value::from(v.map(f64::from))),
            Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map(Value::from),
            Type::NUMERIC => row
                .try_get::<_, Option<Decimal>>(idx)
                .map(|v| v.map_or(Value::Null, decimal_value)),
            Type::TIMESTAMPTZ => row.try_get::<_, Option<DateTime<Utc>>>(idx).map(Value::from),
            Type::TIMESTAMP => row
                .try_get::<_, Option<NaiveDateTime>>(idx)
                .map(|v| Value::from(v.map(|t| t.and_utc()))),
            Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx).map(Value::from),
            Type::UUID => row.try_get::<_, Option<Uuid>>(idx).map(Value::from),
            _ => row.try_get::<_, Option<String>>(idx).map(Value::from),
        };

        value.map_err(|e| {
            LoadError::QueryFailed(format!(
                "Cannot decode column {} of type {}: {}",
                column.name(),
                ty,
                e
            ))
        })
    }
}

/// NUMERIC values surface as floats, or as text beyond f64 range
fn decimal_value(d: Decimal) -> Value {
    d.to_string()
        .parse::<f64>()
        .map(Value::Float)
        .unwrap_or_else(|_| Value::Text(d.to_string()))
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        if self.in_transaction
            && let Some(client) = self.client.take()
        {
            warn!("PostgreSQL session dropped inside a transaction; discarding connection");
            drop(Object::take(client));
        }
    }
}

#[async_trait(?Send)]
impl WarehouseSession for PostgresSession {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn begin(&mut self) -> LoadResult<()> {
        self.client()?
            .batch_execute("BEGIN")
            .await
            .map_err(|e| LoadError::QueryFailed(format!("BEGIN failed: {}", e)))?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> LoadResult<()> {
        let result = self
            .client()?
            .batch_execute("COMMIT")
            .await
            .map_err(|e| LoadError::QueryFailed(format!("COMMIT failed: {}", e)));
        self.in_transaction = false;
        result
    }

    async fn rollback(&mut self) -> LoadResult<()> {
        let result = self
            .client()?
            .batch_execute("ROLLBACK")
            .await
            .map_err(|e| LoadError::QueryFailed(format!("ROLLBACK failed: {}", e)));
        if result.is_ok() {
            self.in_transaction = false;
        }
        result
    }

    async fn execute(&mut self, statement: &str, params: &[Value]) -> LoadResult<u64> {
        debug!(statement, params = params.len(), "postgres execute");
        self.client()?
            .execute(statement, &Self::params(params))
            .await
            .map_err(|e| LoadError::QueryFailed(format!("Execute failed: {}", e)))
    }

    async fn query(&mut self, statement: &str, params: &[Value]) -> LoadResult<QueryResult> {
        let start = std::time::Instant::now();
        let client = self.client()?;

        let prepared = client
            .prepare(statement)
            .await
            .map_err(|e| LoadError::QueryFailed(format!("Prepare failed: {}", e)))?;

        let rows = client
            .query(&prepared, &Self::params(params))
            .await
            .map_err(|e| LoadError::QueryFailed(format!("Query failed: {}", e)))?;

        let columns: Vec<String> = prepared
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let rows = rows
            .iter()
            .map(|row| {
                (0..columns.len())
                    .map(|i| Self::column_value(row, i))
                    .collect::<LoadResult<Vec<_>>>()
            })
            .collect::<LoadResult<Vec<_>>>()?;

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

        let client = self.client()?;
        let sql = insert_sql(table, columns, on_conflict);
        let prepared = client
            .prepare(&sql)
            .await
            .map_err(|e| LoadError::QueryFailed(format!("Prepare failed: {}", e)))?;

        let mut written = 0u64;
        for (i, row) in rows.iter().enumerate() {
            written += client
                .execute(&prepared, &Self::params(row))
                .await
                .map_err(|e| {
                    LoadError::QueryFailed(format!("Insert into {} failed at row {}: {}", table, i, e))
                })?;
        }

        Ok(written)
    }
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*i).to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*f)?.to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            Value::Timestamp(t) => match *ty {
                Type::TIMESTAMP => t.naive_utc().to_sql(ty, out),
                _ => t.to_sql(ty, out),
            },
            Value::Date(d) => d.to_sql(ty, out),
            Value::Uuid(u) => match *ty {
                Type::UUID => u.to_sql(ty, out),
                _ => u.to_string().to_sql(ty, out),
            },
            Value::Text(s) => match *ty {
                Type::UUID => Uuid::parse_str(s)?.to_sql(ty, out),
                _ => s.to_sql(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
