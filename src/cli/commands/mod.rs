//! CLI command implementations
//!
//! Each command is written once against [`WarehouseLoader`] and run on the
//! backend selected by the project's `.dwh-loader.toml`.

pub mod load;
pub mod maintenance;
pub mod query;

use std::path::Path;

use crate::cli::error::CliError;
use crate::database::Warehouse;
use crate::database::config::{DatabaseBackendType, LoaderConfig};
use crate::load::WarehouseLoader;

/// A command that runs against the configured warehouse
pub(crate) trait WarehouseCommand {
    async fn run<W: Warehouse>(
        &self,
        loader: &WarehouseLoader<W>,
        config: &LoaderConfig,
    ) -> Result<(), CliError>;
}

/// Load the project configuration (file plus environment overrides)
pub(crate) fn load_config(project: &Path) -> Result<LoaderConfig, CliError> {
    LoaderConfig::load(project).map_err(|e| CliError::ConfigError(e.to_string()))
}

fn with_schema<W: Warehouse>(loader: WarehouseLoader<W>, config: &LoaderConfig) -> WarehouseLoader<W> {
    match &config.load.schema {
        Some(schema) => loader.with_default_schema(schema.clone()),
        None => loader,
    }
}

/// Open the configured warehouse and run `command` on it
pub(crate) fn run_command<C: WarehouseCommand>(project: &Path, command: &C) -> Result<(), CliError> {
    let config = load_config(project)?;

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::IoError(format!("Failed to create runtime: {}", e)))?;

    rt.block_on(async {
        match config.database.backend {
            DatabaseBackendType::DuckDB => {
                #[cfg(feature = "duckdb-backend")]
                {
                    let db_path = config.get_duckdb_path(project);
                    tracing::debug!(path = %db_path.display(), "opening DuckDB warehouse");
                    let warehouse = crate::database::DuckDbWarehouse::new(&db_path)?;
                    command
                        .run(&with_schema(WarehouseLoader::new(warehouse), &config), &config)
                        .await
                }
                #[cfg(not(feature = "duckdb-backend"))]
                {
                    Err(CliError::InvalidArgument(
                        "DuckDB backend not enabled. Build with --features duckdb-backend"
                            .to_string(),
                    ))
                }
            }
            DatabaseBackendType::Postgres => {
                #[cfg(feature = "postgres-backend")]
                {
                    tracing::debug!(
                        connection = %config.postgres.connection_string_masked(),
                        "opening PostgreSQL warehouse"
                    );
                    let warehouse =
                        crate::database::PostgresWarehouse::from_config(&config.postgres)?;
                    command
                        .run(&with_schema(WarehouseLoader::new(warehouse), &config), &config)
                        .await
                }
                #[cfg(not(feature = "postgres-backend"))]
                {
                    Err(CliError::InvalidArgument(
                        "PostgreSQL backend not enabled. Build with --features postgres-backend"
                            .to_string(),
                    ))
                }
            }
        }
    })
}
