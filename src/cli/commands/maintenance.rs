//! Warehouse inspection and reset commands: `init`, `status`, `tables`,
//! `count` and `truncate`

use std::path::PathBuf;

use super::{WarehouseCommand, run_command};
use crate::cli::error::CliError;
use crate::database::config::{CONFIG_FILENAME, DatabaseBackendType, LoaderConfig, sample_config};
use crate::database::{OutputFormat, QueryResult, Warehouse, format_query_result};
use crate::load::{TableInfo, WarehouseLoader};
use crate::models::Value;

/// Init command arguments
#[derive(Debug, Clone)]
pub struct InitArgs {
    pub project: PathBuf,
    /// Overwrite an existing configuration file
    pub force: bool,
}

/// Write a sample `.dwh-loader.toml` into the project directory
pub fn handle_init(args: &InitArgs) -> Result<(), CliError> {
    let config_path = args.project.join(CONFIG_FILENAME);
    if config_path.exists() && !args.force {
        return Err(CliError::InvalidArgument(format!(
            "{} already exists. Use --force to overwrite.",
            config_path.display()
        )));
    }

    std::fs::write(&config_path, sample_config())
        .map_err(|e| CliError::IoError(format!("Failed to write {}: {}", config_path.display(), e)))?;

    println!("Wrote {}", config_path.display());
    Ok(())
}

/// Status command arguments
#[derive(Debug, Clone)]
pub struct StatusArgs {
    pub project: PathBuf,
}

struct StatusCommand<'a> {
    project: &'a std::path::Path,
}

impl WarehouseCommand for StatusCommand<'_> {
    async fn run<W: Warehouse>(
        &self,
        loader: &WarehouseLoader<W>,
        config: &LoaderConfig,
    ) -> Result<(), CliError> {
        let location = match config.database.backend {
            DatabaseBackendType::DuckDB => config.get_duckdb_path(self.project).display().to_string(),
            DatabaseBackendType::Postgres => config.postgres.connection_string_masked(),
        };

        println!("Backend:    {}", loader.warehouse().backend_type());
        println!("Location:   {}", location);
        println!("Schema:     {}", loader.default_schema().unwrap_or("(session default)"));
        println!("Chunk size: {}", config.load.chunk_size);

        match loader.health_check().await {
            Ok(true) => println!("Health:     OK"),
            Ok(false) => println!("Health:     unexpected answer to SELECT 1"),
            Err(e) => {
                println!("Health:     FAILED");
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// Show the configured warehouse and check that it answers
pub fn handle_status(args: &StatusArgs) -> Result<(), CliError> {
    run_command(
        &args.project,
        &StatusCommand {
            project: &args.project,
        },
    )
}

/// Tables command arguments
#[derive(Debug, Clone)]
pub struct TablesArgs {
    pub project: PathBuf,
    /// Schema to list (default: configured schema)
    pub schema: Option<String>,
    /// Output format (table, json, csv)
    pub format: String,
}

struct TablesCommand<'a> {
    schema: Option<&'a str>,
    format: OutputFormat,
}

fn table_info_result(tables: Vec<TableInfo>) -> QueryResult {
    let columns = ["schema", "table_name", "row_count", "size"]
        .map(str::to_string)
        .to_vec();
    let rows = tables
        .into_iter()
        .map(|t| {
            vec![
                Value::Text(t.schema),
                Value::Text(t.name),
                Value::Int(t.row_count as i64),
                Value::from(t.size),
            ]
        })
        .collect();
    QueryResult::new(columns, rows)
}

impl WarehouseCommand for TablesCommand<'_> {
    async fn run<W: Warehouse>(
        &self,
        loader: &WarehouseLoader<W>,
        _config: &LoaderConfig,
    ) -> Result<(), CliError> {
        let tables = loader.table_info(self.schema).await?;
        println!("{}", format_query_result(&table_info_result(tables), self.format));
        Ok(())
    }
}

/// List tables with row counts and sizes
pub fn handle_tables(args: &TablesArgs) -> Result<(), CliError> {
    let format: OutputFormat = args
        .format
        .parse()
        .map_err(|e: String| CliError::InvalidArgument(e))?;

    run_command(
        &args.project,
        &TablesCommand {
            schema: args.schema.as_deref(),
            format,
        },
    )
}

/// Count command arguments
#[derive(Debug, Clone)]
pub struct CountArgs {
    pub project: PathBuf,
    pub table: String,
}

impl WarehouseCommand for CountArgs {
    async fn run<W: Warehouse>(
        &self,
        loader: &WarehouseLoader<W>,
        _config: &LoaderConfig,
    ) -> Result<(), CliError> {
        let count = loader.row_count(&self.table).await?;
        println!("{}", count);
        Ok(())
    }
}

/// Print the number of rows in a table
pub fn handle_count(args: &CountArgs) -> Result<(), CliError> {
    run_command(&args.project, args)
}

/// Truncate command arguments
#[derive(Debug, Clone)]
pub struct TruncateArgs {
    pub project: PathBuf,
    pub table: String,
    /// Confirm the truncation
    pub yes: bool,
}

impl WarehouseCommand for TruncateArgs {
    async fn run<W: Warehouse>(
        &self,
        loader: &WarehouseLoader<W>,
        _config: &LoaderConfig,
    ) -> Result<(), CliError> {
        loader.truncate(&self.table).await?;
        println!("Truncated {}", loader.resolve_table(&self.table)?);
        Ok(())
    }
}

/// Empty a table
pub fn handle_truncate(args: &TruncateArgs) -> Result<(), CliError> {
    if !args.yes {
        return Err(CliError::InvalidArgument(format!(
            "Refusing to truncate {} without --yes",
            args.table
        )));
    }
    run_command(&args.project, args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_info_result() {
        let result = table_info_result(vec![TableInfo {
            schema: "dwh".to_string(),
            name: "dim_client".to_string(),
            row_count: 3,
            size: None,
        }]);
        assert_eq!(result.columns.len(), 4);
        assert_eq!(result.rows[0][2], Value::Int(3));
        assert_eq!(result.rows[0][3], Value::Null);
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let args = InitArgs {
            project: dir.path().to_path_buf(),
            force: false,
        };
        handle_init(&args).unwrap();
        assert!(dir.path().join(CONFIG_FILENAME).exists());
        assert!(matches!(handle_init(&args), Err(CliError::InvalidArgument(_))));

        let forced = InitArgs {
            force: true,
            ..args
        };
        assert!(handle_init(&forced).is_ok());
    }
}
