//! SQL query CLI command
//!
//! Runs an ad-hoc SQL statement against the warehouse and prints the result.

use std::path::PathBuf;

use super::{WarehouseCommand, run_command};
use crate::cli::error::CliError;
use crate::database::config::LoaderConfig;
use crate::database::{OutputFormat, Warehouse, format_query_result};
use crate::load::WarehouseLoader;

/// Query command arguments
#[derive(Debug, Clone)]
pub struct QueryArgs {
    /// SQL query to execute
    pub sql: String,
    /// Project path (holds `.dwh-loader.toml`)
    pub project: PathBuf,
    /// Output format
    pub format: String,
}

struct QueryCommand<'a> {
    sql: &'a str,
    format: OutputFormat,
}

impl WarehouseCommand for QueryCommand<'_> {
    async fn run<W: Warehouse>(
        &self,
        loader: &WarehouseLoader<W>,
        _config: &LoaderConfig,
    ) -> Result<(), CliError> {
        let result = loader.query(self.sql, &[]).await?;

        println!("{}", format_query_result(&result, self.format));

        // Print execution time for non-JSON formats
        if self.format != OutputFormat::Json {
            eprintln!("\nExecution time: {}ms", result.execution_time_ms);
        }
        Ok(())
    }
}

/// Execute a SQL query against the warehouse
pub fn handle_query(args: &QueryArgs) -> Result<(), CliError> {
    let format: OutputFormat = args
        .format
        .parse()
        .map_err(|e: String| CliError::InvalidArgument(e))?;

    run_command(
        &args.project,
        &QueryCommand {
            sql: &args.sql,
            format,
        },
    )
}
