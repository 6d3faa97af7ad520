//! Load commands: `load`, `load-scd2` and `init-dimension`
//!
//! Batches are read from JSON documents of the form
//! `{"columns": [{"name": ..., "type": ...}], "rows": [{...}, ...]}`.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use super::{WarehouseCommand, load_config, run_command};
use crate::cli::error::CliError;
use crate::database::config::{DatabaseBackendType, LoaderConfig};
use crate::database::{ConflictPolicy, Dialect, DimensionSchema, Warehouse};
use crate::load::{BulkLoadOptions, FailurePolicy, Scd2Request, TransactionScope, WarehouseLoader};
use crate::models::{LoadOutcome, TabularBatch};

fn read_batch(path: &Path) -> Result<TabularBatch, CliError> {
    if !path.exists() {
        return Err(CliError::FileNotFound(path.to_path_buf()));
    }
    Ok(TabularBatch::from_json_file(path)?)
}

/// Parse an RFC 3339 effective time, defaulting to now
pub fn parse_effective_time(value: Option<&str>) -> Result<DateTime<Utc>, CliError> {
    match value {
        None => Ok(Utc::now()),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| CliError::InvalidArgument(format!("Invalid effective time '{}': {}", s, e))),
    }
}

fn report(outcome: &LoadOutcome, json: bool) -> Result<(), CliError> {
    if json {
        let rendered = serde_json::to_string_pretty(outcome)
            .map_err(|e| CliError::IoError(format!("Failed to render outcome: {}", e)))?;
        println!("{}", rendered);
    } else {
        println!("{}", outcome);
        for failure in &outcome.chunk_failures {
            eprintln!(
                "  chunk {} (rows {}..{}): {}",
                failure.chunk_index, failure.rows.start, failure.rows.end, failure.error
            );
        }
        eprintln!("Duration: {}ms", outcome.duration_ms);
    }

    if outcome.is_success() {
        Ok(())
    } else {
        Err(CliError::LoadIncomplete(
            outcome
                .error_detail
                .clone()
                .unwrap_or_else(|| format!("{} rows failed", outcome.rows_failed)),
        ))
    }
}

/// Bulk load command arguments
#[derive(Debug, Clone)]
pub struct LoadArgs {
    pub project: PathBuf,
    pub table: String,
    pub file: PathBuf,
    /// Rows per transaction (default: configured chunk size)
    pub chunk_size: Option<usize>,
    pub on_conflict: ConflictPolicy,
    pub abort_on_failure: bool,
    /// Load the whole batch in one transaction
    pub single_transaction: bool,
    /// Print the outcome as JSON
    pub json: bool,
}

struct LoadCommand<'a> {
    args: &'a LoadArgs,
    batch: TabularBatch,
}

impl WarehouseCommand for LoadCommand<'_> {
    async fn run<W: Warehouse>(
        &self,
        loader: &WarehouseLoader<W>,
        config: &LoaderConfig,
    ) -> Result<(), CliError> {
        let mut options =
            BulkLoadOptions::from_config(&config.load).with_conflict_policy(self.args.on_conflict);
        if let Some(chunk_size) = self.args.chunk_size {
            options = options.with_chunk_size(chunk_size);
        }
        if self.args.abort_on_failure {
            options = options.with_failure_policy(FailurePolicy::AbortOnFirstFailure);
        }
        if self.args.single_transaction {
            options = options.with_transaction_scope(TransactionScope::WholeBatch);
        }

        let outcome = loader.bulk_load(&self.batch, &self.args.table, &options).await?;
        report(&outcome, self.args.json)
    }
}

/// Append a batch file to a table
pub fn handle_load(args: &LoadArgs) -> Result<(), CliError> {
    let batch = read_batch(&args.file)?;
    run_command(&args.project, &LoadCommand { args, batch })
}

/// SCD2 load command arguments
#[derive(Debug, Clone)]
pub struct Scd2Args {
    pub project: PathBuf,
    pub table: String,
    pub file: PathBuf,
    pub natural_key: String,
    /// Tracked columns (default: every batch column except the natural key)
    pub track: Vec<String>,
    /// RFC 3339 effective time (default: now)
    pub effective_time: Option<String>,
    pub json: bool,
}

struct Scd2Command<'a> {
    args: &'a Scd2Args,
    batch: TabularBatch,
    request: Scd2Request,
}

impl WarehouseCommand for Scd2Command<'_> {
    async fn run<W: Warehouse>(
        &self,
        loader: &WarehouseLoader<W>,
        _config: &LoaderConfig,
    ) -> Result<(), CliError> {
        let outcome = loader.load_scd2(&self.batch, &self.request).await?;
        report(&outcome, self.args.json)
    }
}

/// Reconcile a batch file into an SCD2 dimension
pub fn handle_load_scd2(args: &Scd2Args) -> Result<(), CliError> {
    let batch = read_batch(&args.file)?;
    let effective_time = parse_effective_time(args.effective_time.as_deref())?;

    let tracked_columns = if args.track.is_empty() {
        batch
            .schema()
            .column_names()
            .into_iter()
            .filter(|c| c != &args.natural_key)
            .collect()
    } else {
        args.track.clone()
    };

    let request = Scd2Request {
        table: args.table.clone(),
        natural_key_column: args.natural_key.clone(),
        tracked_columns,
        effective_time,
    };

    run_command(
        &args.project,
        &Scd2Command {
            args,
            batch,
            request,
        },
    )
}

/// Dimension DDL command arguments
#[derive(Debug, Clone)]
pub struct InitDimensionArgs {
    pub project: PathBuf,
    pub table: String,
    /// Batch file whose column list defines the dimension attributes
    pub file: PathBuf,
    pub natural_key: String,
    /// Print the statements instead of running them
    pub dry_run: bool,
}

struct InitDimensionCommand<'a> {
    args: &'a InitDimensionArgs,
    batch: TabularBatch,
}

impl WarehouseCommand for InitDimensionCommand<'_> {
    async fn run<W: Warehouse>(
        &self,
        loader: &WarehouseLoader<W>,
        _config: &LoaderConfig,
    ) -> Result<(), CliError> {
        let dimension = loader
            .create_dimension(
                &self.args.table,
                &self.args.natural_key,
                self.batch.schema().clone(),
            )
            .await?;
        println!("Dimension {} ready", dimension.table);
        Ok(())
    }
}

/// Create an SCD2 dimension table shaped after a batch file
pub fn handle_init_dimension(args: &InitDimensionArgs) -> Result<(), CliError> {
    let batch = read_batch(&args.file)?;

    if args.dry_run {
        let config = load_config(&args.project)?;
        let dialect = match config.database.backend {
            DatabaseBackendType::DuckDB => Dialect::DuckDb,
            DatabaseBackendType::Postgres => Dialect::Postgres,
        };
        let table = crate::database::TableName::parse(&args.table)?
            .with_default_schema(config.load.schema.as_deref());
        let dimension = DimensionSchema::new(table, &args.natural_key, batch.schema().clone())?;
        for statement in dimension.create_statements(dialect) {
            println!("{};\n", statement);
        }
        return Ok(());
    }

    run_command(&args.project, &InitDimensionCommand { args, batch })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_effective_time() {
        let t = parse_effective_time(Some("2024-03-01T10:00:00+02:00")).unwrap();
        assert_eq!(t.to_rfc3339(), "2024-03-01T08:00:00+00:00");
        assert!(parse_effective_time(Some("yesterday")).is_err());
        assert!(parse_effective_time(None).is_ok());
    }

    #[test]
    fn test_read_batch_missing_file() {
        assert!(matches!(
            read_batch(Path::new("/nonexistent/batch.json")),
            Err(CliError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_report_flags_incomplete_loads() {
        let mut outcome = LoadOutcome::new("dwh.fact_transactions");
        assert!(report(&outcome, true).is_ok());

        outcome.record_failure(crate::models::ChunkFailure {
            chunk_index: 0,
            rows: 0..10,
            error: "duplicate key".to_string(),
        });
        let err = report(&outcome, false).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
