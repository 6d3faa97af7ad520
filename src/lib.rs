//! DWH Loader - Loading layer for the B2B mobile-money data warehouse
//!
//! Provides:
//! - Chunked bulk loads of fact and staging tables
//! - SCD Type 2 reconciliation of dimension tables
//! - Table maintenance (truncate, row counts, table listing)
//! - DuckDB (embedded) and PostgreSQL warehouse backends
//!
//! ```no_run
//! # async fn run() -> dwh_loader::LoadResult<()> {
//! use chrono::Utc;
//! use dwh_loader::{DuckDbWarehouse, Scd2Request, TabularBatch, WarehouseLoader};
//!
//! let loader = WarehouseLoader::new(DuckDbWarehouse::new("dwh.duckdb")?).with_default_schema("dwh");
//! let batch = TabularBatch::from_json_file("clients.json".as_ref())?;
//!
//! let request = Scd2Request::new("dim_client", "client_id", &["segment", "sector"], Utc::now());
//! let outcome = loader.load_scd2(&batch, &request).await?;
//! println!("{}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod load;
pub mod models;

#[cfg(feature = "cli")]
pub mod cli;

pub use database::config::{DatabaseBackendType, LoaderConfig};
pub use database::{
    ConflictPolicy, Dialect, DimensionSchema, LoadError, LoadResult, OutputFormat, QueryResult,
    Record, TableName, Warehouse, WarehouseSession, format_query_result,
};
pub use load::{
    BulkLoadOptions, FailurePolicy, Scd2Request, TableInfo, TransactionScope, WarehouseLoader,
};
pub use models::{
    BatchError, BatchSchema, ChunkFailure, ColumnDef, ColumnType, LoadOutcome, TabularBatch, Value,
};

#[cfg(feature = "duckdb-backend")]
pub use database::{DuckDbSession, DuckDbWarehouse};

#[cfg(feature = "postgres-backend")]
pub use database::{PostgresSession, PostgresWarehouse};
