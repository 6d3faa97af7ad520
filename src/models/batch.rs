//! Tabular batches: the unit of input to every load operation

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::value::{ColumnType, Value};

/// Column definition within a batch schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name (must match the target table column name)
    pub name: String,
    /// Logical type of the column
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Whether the column accepts nulls
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Ordered schema shared by every row of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSchema {
    pub columns: Vec<ColumnDef>,
}

impl BatchSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    /// Position of a column by name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Error raised while assembling a batch
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BatchError {
    #[error("Duplicate column in batch schema: {0}")]
    DuplicateColumn(String),

    #[error("Row {row} has {found} values, schema has {expected} columns")]
    ArityMismatch {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("Row {row}, column '{column}': {message}")]
    InvalidValue {
        row: usize,
        column: String,
        message: String,
    },

    #[error("Failed to read batch file: {0}")]
    Io(String),

    #[error("Failed to parse batch file: {0}")]
    Parse(String),
}

/// Ordered, schema-checked collection of rows
///
/// Batches are owned by the caller and only borrowed by the loaders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabularBatch {
    schema: BatchSchema,
    rows: Vec<Vec<Value>>,
}

impl TabularBatch {
    /// Create a batch, checking row arity and value types against the schema
    pub fn new(schema: BatchSchema, mut rows: Vec<Vec<Value>>) -> Result<Self, BatchError> {
        let mut seen = std::collections::HashSet::new();
        for column in &schema.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(BatchError::DuplicateColumn(column.name.clone()));
            }
        }

        for (row_idx, row) in rows.iter_mut().enumerate() {
            if row.len() != schema.len() {
                return Err(BatchError::ArityMismatch {
                    row: row_idx,
                    expected: schema.len(),
                    found: row.len(),
                });
            }
            for (column, value) in schema.columns.iter().zip(row.iter_mut()) {
                if !column.column_type.accepts(value) {
                    return Err(BatchError::InvalidValue {
                        row: row_idx,
                        column: column.name.clone(),
                        message: format!("{} is not a {}", value, column.column_type),
                    });
                }
                if value.is_null() && !column.nullable {
                    return Err(BatchError::InvalidValue {
                        row: row_idx,
                        column: column.name.clone(),
                        message: "null in a non-nullable column".to_string(),
                    });
                }
                let owned = std::mem::replace(value, Value::Null);
                *value = owned.coerce_to(column.column_type);
            }
        }

        Ok(Self { schema, rows })
    }

    /// Create an empty batch with the given schema
    pub fn empty(schema: BatchSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    /// Build a batch from JSON records keyed by column name
    ///
    /// Missing keys become nulls; keys not in the schema are ignored.
    pub fn from_json_records(
        schema: BatchSchema,
        records: &[serde_json::Map<String, serde_json::Value>],
    ) -> Result<Self, BatchError> {
        let mut rows = Vec::with_capacity(records.len());

        for (row_idx, record) in records.iter().enumerate() {
            let mut row = Vec::with_capacity(schema.len());
            for column in &schema.columns {
                let json = record.get(&column.name).unwrap_or(&serde_json::Value::Null);
                let value = Value::from_json(json, column.column_type).map_err(|message| {
                    BatchError::InvalidValue {
                        row: row_idx,
                        column: column.name.clone(),
                        message,
                    }
                })?;
                row.push(value);
            }
            rows.push(row);
        }

        Self::new(schema, rows)
    }

    /// Parse a batch document: `{"columns": [...], "rows": [{...}, ...]}`
    pub fn from_json_str(content: &str) -> Result<Self, BatchError> {
        let file: BatchFile =
            serde_json::from_str(content).map_err(|e| BatchError::Parse(e.to_string()))?;
        Self::from_json_records(BatchSchema::new(file.columns), &file.rows)
    }

    /// Read a batch document from disk
    pub fn from_json_file(path: &Path) -> Result<Self, BatchError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BatchError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&content)
    }

    pub fn schema(&self) -> &BatchSchema {
        &self.schema
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of a named column in a given row
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.schema.index_of(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Iterate over ordered chunks of at most `chunk_size` rows
    ///
    /// `chunk_size` must be greater than zero.
    pub fn chunks(&self, chunk_size: usize) -> std::slice::Chunks<'_, Vec<Value>> {
        self.rows.chunks(chunk_size)
    }
}

#[derive(Debug, Deserialize)]
struct BatchFile {
    columns: Vec<ColumnDef>,
    #[serde(default)]
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
}
