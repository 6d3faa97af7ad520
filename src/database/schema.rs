//! Table naming and SQL generation
//!
//! Identifiers are always double-quoted so table and column names coming
//! from batches or the command line can never splice SQL.

use serde::{Deserialize, Serialize};

use super::{Dialect, LoadError, LoadResult};
use crate::models::{BatchSchema, ColumnType};

/// Generated identifier of a dimension row version
pub const SURROGATE_KEY: &str = "surrogate_key";
/// Start of the validity window (inclusive)
pub const VALID_FROM: &str = "valid_from";
/// End of the validity window (exclusive, null while current)
pub const VALID_TO: &str = "valid_to";
/// Current-version flag
pub const IS_CURRENT: &str = "is_current";

/// Columns managed by the SCD2 loader; batches may not carry them
pub const SCD2_COLUMNS: [&str; 4] = [SURROGATE_KEY, VALID_FROM, VALID_TO, IS_CURRENT];

/// Quote an identifier, doubling embedded quotes
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Optionally schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(schema: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.map(str::to_string),
            name: name.into(),
        }
    }

    /// Parse `table` or `schema.table`
    pub fn parse(s: &str) -> LoadResult<Self> {
        let parts: Vec<&str> = s.split('.').map(str::trim).collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new(None, *name)),
            [schema, name] if !schema.is_empty() && !name.is_empty() => {
                Ok(Self::new(Some(*schema), *name))
            }
            _ => Err(LoadError::InvalidInput(format!("Invalid table name: '{}'", s))),
        }
    }

    /// Qualify with `schema` unless a schema is already present
    pub fn with_default_schema(mut self, schema: Option<&str>) -> Self {
        if self.schema.is_none() {
            self.schema = schema.map(str::to_string);
        }
        self
    }

    /// Quoted form for use in SQL
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// What an insert does when it hits a uniqueness constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// The statement fails and the enclosing chunk is rolled back
    #[default]
    Error,
    /// Conflicting rows are skipped (`ON CONFLICT DO NOTHING`)
    Skip,
}

impl std::str::FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" | "fail" => Ok(ConflictPolicy::Error),
            "skip" | "ignore" | "do-nothing" => Ok(ConflictPolicy::Skip),
            _ => Err(format!(
                "Unknown conflict policy: {}. Use 'error' or 'skip'.",
                s
            )),
        }
    }
}

/// Single-row parameterised INSERT for `columns`
pub fn insert_sql(table: &TableName, columns: &[String], on_conflict: ConflictPolicy) -> String {
    let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.quoted(),
        column_list.join(", "),
        placeholders.join(", ")
    );
    if on_conflict == ConflictPolicy::Skip {
        sql.push_str(" ON CONFLICT DO NOTHING");
    }
    sql
}

/// Statement closing the current version identified by its surrogate key
pub fn close_version_sql(table: &TableName) -> String {
    format!(
        "UPDATE {} SET {} = $1, {} = FALSE WHERE {} = $2 AND {}",
        table.quoted(),
        quote_ident(VALID_TO),
        quote_ident(IS_CURRENT),
        quote_ident(SURROGATE_KEY),
        quote_ident(IS_CURRENT)
    )
}

fn column_sql_type(dialect: Dialect, column_type: ColumnType) -> &'static str {
    match (dialect, column_type) {
        (Dialect::Postgres, ColumnType::Timestamp) => "TIMESTAMPTZ",
        (Dialect::DuckDb, ColumnType::Uuid) => "VARCHAR",
        (_, other) => other.sql_type(),
    }
}

/// DDL generator for an SCD Type 2 dimension table
///
/// The table holds the batch columns plus the loader-managed history
/// columns. On Postgres a partial unique index guarantees at most one current
/// row per natural key; DuckDB has no partial indexes, so there the loader's
/// close-before-insert transaction is the only guard.
#[derive(Debug, Clone)]
pub struct DimensionSchema {
    pub table: TableName,
    pub natural_key_column: String,
    pub columns: BatchSchema,
}

impl DimensionSchema {
    pub fn new(
        table: TableName,
        natural_key_column: impl Into<String>,
        columns: BatchSchema,
    ) -> LoadResult<Self> {
        let natural_key_column = natural_key_column.into();

        if !columns.contains(&natural_key_column) {
            return Err(LoadError::SchemaMismatch(format!(
                "natural key column '{}' is not part of the dimension columns",
                natural_key_column
            )));
        }
        if let Some(reserved) = columns
            .columns
            .iter()
            .find(|c| SCD2_COLUMNS.contains(&c.name.as_str()))
        {
            return Err(LoadError::SchemaMismatch(format!(
                "column '{}' is managed by the loader",
                reserved.name
            )));
        }

        Ok(Self {
            table,
            natural_key_column,
            columns,
        })
    }

    /// Name of the current-row uniqueness index
    pub fn current_index_name(&self) -> String {
        format!("ux_{}_current", self.table.name)
    }

    /// `CREATE SCHEMA` / `CREATE TABLE` / index statements, in order
    pub fn create_statements(&self, dialect: Dialect) -> Vec<String> {
        let mut statements = Vec::new();

        if let Some(schema) = &self.table.schema {
            statements.push(format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)));
        }

        let surrogate_type = match dialect {
            Dialect::Postgres => "UUID",
            Dialect::DuckDb => "VARCHAR",
        };
        let timestamp_type = column_sql_type(dialect, ColumnType::Timestamp);

        let mut lines = vec![format!(
            "    {} {} PRIMARY KEY",
            quote_ident(SURROGATE_KEY),
            surrogate_type
        )];
        for column in &self.columns.columns {
            let not_null = if column.name == self.natural_key_column || !column.nullable {
                " NOT NULL"
            } else {
                ""
            };
            lines.push(format!(
                "    {} {}{}",
                quote_ident(&column.name),
                column_sql_type(dialect, column.column_type),
                not_null
            ));
        }
        lines.push(format!(
            "    {} {} NOT NULL",
            quote_ident(VALID_FROM),
            timestamp_type
        ));
        lines.push(format!("    {} {}", quote_ident(VALID_TO), timestamp_type));
        lines.push(format!(
            "    {} BOOLEAN NOT NULL DEFAULT TRUE",
            quote_ident(IS_CURRENT)
        ));

        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
            self.table.quoted(),
            lines.join(",\n")
        ));

        if dialect.supports_partial_index() {
            statements.push(format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({}) WHERE {}",
                quote_ident(&self.current_index_name()),
                self.table.quoted(),
                quote_ident(&self.natural_key_column),
                quote_ident(IS_CURRENT)
            ));
        }

        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({}, {})",
            quote_ident(&format!("ix_{}_history", self.table.name)),
            self.table.quoted(),
            quote_ident(&self.natural_key_column),
            quote_ident(VALID_FROM)
        ));

        statements
    }
}
