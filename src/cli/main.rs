//! CLI binary entry point for dwh-loader

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use dwh_loader::ConflictPolicy;
use dwh_loader::cli::commands::load::{
    InitDimensionArgs, LoadArgs, Scd2Args, handle_init_dimension, handle_load, handle_load_scd2,
};
use dwh_loader::cli::commands::maintenance::{
    CountArgs, InitArgs, StatusArgs, TablesArgs, TruncateArgs, handle_count, handle_init,
    handle_status, handle_tables, handle_truncate,
};
use dwh_loader::cli::commands::query::{QueryArgs, handle_query};

#[derive(Parser)]
#[command(name = "dwh-loader")]
#[command(about = "Bulk and SCD2 loads for the B2B mobile-money data warehouse")]
#[command(version)]
struct Cli {
    /// Project directory holding .dwh-loader.toml
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a sample .dwh-loader.toml
    Init {
        /// Overwrite an existing configuration file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the configured warehouse and check connectivity
    Status,

    /// List tables with row counts and sizes
    Tables {
        /// Schema to list (default: configured schema)
        #[arg(short, long)]
        schema: Option<String>,
        /// Output format (table, json, csv)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Count the rows of a table
    Count {
        /// Table name (schema.table or table)
        table: String,
    },

    /// Remove every row of a table
    Truncate {
        /// Table name (schema.table or table)
        table: String,
        /// Confirm the truncation
        #[arg(long)]
        yes: bool,
    },

    /// Execute SQL queries against the warehouse
    Query {
        /// SQL query to execute
        sql: String,
        /// Output format (table, json, csv)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Append a batch file to a table in chunked transactions
    Load {
        /// Target table
        table: String,
        /// Batch file (JSON)
        file: PathBuf,
        /// Rows per transaction (default: configured chunk size)
        #[arg(short, long)]
        chunk_size: Option<usize>,
        /// What a uniqueness conflict does (error, skip)
        #[arg(long, default_value = "error")]
        on_conflict: ConflictPolicy,
        /// Stop at the first failed chunk
        #[arg(long)]
        abort_on_failure: bool,
        /// Load the whole batch in one transaction
        #[arg(long)]
        single_transaction: bool,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Reconcile a batch file into an SCD2 dimension
    #[command(name = "load-scd2")]
    LoadScd2 {
        /// Dimension table
        table: String,
        /// Batch file (JSON)
        file: PathBuf,
        /// Natural key column
        #[arg(short, long)]
        natural_key: String,
        /// Tracked column (repeatable; default: all but the natural key)
        #[arg(short, long = "track")]
        track: Vec<String>,
        /// Effective time, RFC 3339 (default: now)
        #[arg(short, long)]
        effective_time: Option<String>,
        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create an SCD2 dimension table shaped after a batch file
    #[command(name = "init-dimension")]
    InitDimension {
        /// Dimension table
        table: String,
        /// Batch file (JSON) defining the attribute columns
        file: PathBuf,
        /// Natural key column
        #[arg(short, long)]
        natural_key: String,
        /// Print the DDL instead of running it
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let project = cli.project;
    let result = match cli.command {
        Commands::Init { force } => handle_init(&InitArgs { project, force }),
        Commands::Status => handle_status(&StatusArgs { project }),
        Commands::Tables { schema, format } => handle_tables(&TablesArgs {
            project,
            schema,
            format,
        }),
        Commands::Count { table } => handle_count(&CountArgs { project, table }),
        Commands::Truncate { table, yes } => handle_truncate(&TruncateArgs {
            project,
            table,
            yes,
        }),
        Commands::Query { sql, format } => handle_query(&QueryArgs {
            sql,
            project,
            format,
        }),
        Commands::Load {
            table,
            file,
            chunk_size,
            on_conflict,
            abort_on_failure,
            single_transaction,
            json,
        } => handle_load(&LoadArgs {
            project,
            table,
            file,
            chunk_size,
            on_conflict,
            abort_on_failure,
            single_transaction,
            json,
        }),
        Commands::LoadScd2 {
            table,
            file,
            natural_key,
            track,
            effective_time,
            json,
        } => handle_load_scd2(&Scd2Args {
            project,
            table,
            file,
            natural_key,
            track,
            effective_time,
            json,
        }),
        Commands::InitDimension {
            table,
            file,
            natural_key,
            dry_run,
        } => handle_init_dimension(&InitDimensionArgs {
            project,
            table,
            file,
            natural_key,
            dry_run,
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
