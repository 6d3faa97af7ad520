//! Table maintenance: resets and inspection

use serde::Serialize;
use tracing::info;

use super::WarehouseLoader;
use crate::database::{Dialect, LoadError, LoadResult, TableName, Warehouse, WarehouseSession};
use crate::models::Value;

/// A warehouse table with its current size
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub row_count: u64,
    /// Human-readable on-disk size, where the store reports one
    pub size: Option<String>,
}

async fn count_rows<S: WarehouseSession>(session: &mut S, table: &TableName) -> LoadResult<u64> {
    let sql = format!("SELECT COUNT(*) FROM {}", table.quoted());
    let result = session.query(&sql, &[]).await?;
    result
        .scalar()
        .and_then(Value::as_i64)
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| LoadError::QueryFailed(format!("COUNT(*) on {} returned no number", table)))
}

impl<W: Warehouse> WarehouseLoader<W> {
    /// Remove every row of a table (cascading to dependents on Postgres)
    pub async fn truncate(&self, table: &str) -> LoadResult<()> {
        let table = self.resolve_table(table)?;
        let mut session = self.open_session().await?;
        let sql = session.dialect().truncate_sql(&table);

        session
            .execute(&sql, &[])
            .await
            .map_err(|e| LoadError::TransactionFailed {
                table: table.to_string(),
                context: "truncate".to_string(),
                message: e.to_string(),
            })?;

        info!(%table, "table truncated");
        Ok(())
    }

    /// Number of rows in a table
    pub async fn row_count(&self, table: &str) -> LoadResult<u64> {
        let table = self.resolve_table(table)?;
        let mut session = self.open_session().await?;
        count_rows(&mut session, &table).await
    }

    /// Tables of a schema with row counts and sizes
    ///
    /// Falls back to the loader's default schema, then to the session's
    /// current schema.
    pub async fn table_info(&self, schema: Option<&str>) -> LoadResult<Vec<TableInfo>> {
        let mut session = self.open_session().await?;

        let schema = match schema.or(self.default_schema()) {
            Some(schema) => schema.to_string(),
            None => session
                .query("SELECT current_schema()::text", &[])
                .await?
                .scalar()
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| LoadError::QueryFailed("no current schema".to_string()))?,
        };

        let names = session
            .query(
                "SELECT table_name::text AS table_name FROM information_schema.tables \
                 WHERE table_schema::text = $1 AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
                &[Value::from(schema.as_str())],
            )
            .await?;

        let mut tables = Vec::with_capacity(names.row_count());
        for name in names.rows.iter().filter_map(|r| r.first().and_then(Value::as_str)) {
            let table = TableName::new(Some(&schema), name);
            let row_count = count_rows(&mut session, &table).await?;

            let size = match session.dialect() {
                Dialect::Postgres => session
                    .query(
                        "SELECT pg_size_pretty(pg_total_relation_size($1::text::regclass))",
                        &[Value::from(table.quoted())],
                    )
                    .await?
                    .scalar()
                    .and_then(Value::as_str)
                    .map(str::to_string),
                Dialect::DuckDb => None,
            };

            tables.push(TableInfo {
                schema: schema.clone(),
                name: name.to_string(),
                row_count,
                size,
            });
        }

        Ok(tables)
    }

    /// Check that a session can be opened and answers `SELECT 1`
    pub async fn health_check(&self) -> LoadResult<bool> {
        let mut session = self.open_session().await?;
        let result = session.query("SELECT 1", &[]).await?;
        Ok(result.scalar().and_then(Value::as_i64) == Some(1))
    }
}
