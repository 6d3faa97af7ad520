//! Data types consumed and produced by the loaders

pub mod batch;
pub mod outcome;
pub mod value;

pub use batch::{BatchError, BatchSchema, ColumnDef, TabularBatch};
pub use outcome::{ChunkFailure, LoadOutcome};
pub use value::{ColumnType, Value};
