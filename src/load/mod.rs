//! Load API
//!
//! [`WarehouseLoader`] wraps a [`Warehouse`] and exposes the load operations:
//! - [`bulk_load`](WarehouseLoader::bulk_load): chunked, append-only inserts,
//!   one transaction per chunk or per batch
//! - [`load_scd2`](WarehouseLoader::load_scd2): SCD Type 2 reconciliation
//! - maintenance: truncate, row counts, table listing, health check
//!
//! Every operation acquires its own session and releases it before
//! returning, on success and on error.

pub mod bulk;
pub mod maintenance;
pub mod scd2;

pub use bulk::{BulkLoadOptions, FailurePolicy, TransactionScope};
pub use maintenance::TableInfo;
pub use scd2::Scd2Request;

use tracing::{info, warn};

use crate::database::{
    DimensionSchema, LoadError, LoadResult, QueryResult, TableName, Warehouse, WarehouseSession,
};
use crate::models::{BatchSchema, Value};

/// Load operations over a warehouse
pub struct WarehouseLoader<W: Warehouse> {
    warehouse: W,
    default_schema: Option<String>,
}

impl<W: Warehouse> WarehouseLoader<W> {
    /// Create a loader; unqualified table names stay unqualified
    pub fn new(warehouse: W) -> Self {
        Self {
            warehouse,
            default_schema: None,
        }
    }

    /// Schema applied to table names given without one
    pub fn with_default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = Some(schema.into());
        self
    }

    /// Get reference to the warehouse
    pub fn warehouse(&self) -> &W {
        &self.warehouse
    }

    pub fn default_schema(&self) -> Option<&str> {
        self.default_schema.as_deref()
    }

    /// Parse a table name, applying the default schema
    pub fn resolve_table(&self, table: &str) -> LoadResult<TableName> {
        Ok(TableName::parse(table)?.with_default_schema(self.default_schema.as_deref()))
    }

    pub(crate) async fn open_session(&self) -> LoadResult<W::Session> {
        self.warehouse.session().await.map_err(|e| match e {
            LoadError::ConnectionFailed(_) => e,
            other => LoadError::ConnectionFailed(other.to_string()),
        })
    }

    /// Run a statement and collect its rows
    pub async fn query(&self, statement: &str, params: &[Value]) -> LoadResult<QueryResult> {
        let mut session = self.open_session().await?;
        session.query(statement, params).await
    }

    /// Create an SCD2 dimension table (and its indexes) for a batch schema
    pub async fn create_dimension(
        &self,
        table: &str,
        natural_key_column: &str,
        columns: BatchSchema,
    ) -> LoadResult<DimensionSchema> {
        let dimension = DimensionSchema::new(self.resolve_table(table)?, natural_key_column, columns)?;
        let mut session = self.open_session().await?;
        let dialect = session.dialect();

        session.begin().await?;
        for statement in dimension.create_statements(dialect) {
            if let Err(e) = session.execute(&statement, &[]).await {
                return Err(abort(&mut session, &dimension.table, "create dimension", e).await);
            }
        }
        if let Err(e) = session.commit().await {
            return Err(abort(&mut session, &dimension.table, "commit", e).await);
        }

        info!(table = %dimension.table, %dialect, "dimension table ready");
        Ok(dimension)
    }
}

/// Roll back the open transaction and describe the failure
///
/// A rollback that itself fails is logged; the session is dropped by the
/// caller, which releases the connection without reusing the transaction.
pub(crate) async fn abort<S: WarehouseSession>(
    session: &mut S,
    table: &TableName,
    context: impl Into<String>,
    error: LoadError,
) -> LoadError {
    let context = context.into();
    if let Err(rollback_error) = session.rollback().await {
        warn!(%table, %context, error = %rollback_error, "rollback failed");
    }
    match error {
        LoadError::TransactionFailed { .. }
        | LoadError::StaleEffectiveTime { .. }
        | LoadError::CorruptHistory { .. }
        | LoadError::ConnectionFailed(_) => error,
        other => LoadError::TransactionFailed {
            table: table.to_string(),
            context,
            message: other.to_string(),
        },
    }
}
