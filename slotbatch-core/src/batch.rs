//! Batches of rows sharing one schema

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::row::Row;
use crate::schema::{ColumnSpec, RowSchema};

/// Schema information for a stream of batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMeta {
    /// Schema every row in the batch conforms to
    row_schema: Arc<RowSchema>,
}

impl BatchMeta {
    /// Create batch metadata over a row schema
    pub fn new(row_schema: Arc<RowSchema>) -> Self {
        Self { row_schema }
    }

    /// Get the row schema
    pub fn row_schema(&self) -> &Arc<RowSchema> {
        &self.row_schema
    }

    /// Columns of the underlying row schema
    pub fn columns(&self) -> &[ColumnSpec] {
        self.row_schema.columns()
    }
}

/// A fixed-capacity, ordered collection of rows
///
/// Rows are shared, so a row may outlive the batch that carried it.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Metadata shared by every batch from the same stage
    meta: Arc<BatchMeta>,

    /// Rows in arrival order
    rows: Vec<Arc<Row>>,

    /// Maximum number of rows
    capacity: usize,
}

impl Batch {
    /// Create an empty batch
    pub fn new(meta: Arc<BatchMeta>, capacity: usize) -> Self {
        Self {
            meta,
            rows: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a row
    pub fn push(&mut self, row: Arc<Row>) -> Result<()> {
        if self.is_full() {
            return Err(Error::InvalidArgument(format!(
                "Batch is full at {} rows",
                self.capacity
            )));
        }
        let schema = row.schema();
        if !Arc::ptr_eq(schema, self.meta.row_schema()) && **schema != **self.meta.row_schema() {
            return Err(Error::SchemaMismatch(
                "Row schema differs from the batch schema".into(),
            ));
        }

        self.rows.push(row);
        Ok(())
    }

    /// Get the batch metadata
    pub fn meta(&self) -> &Arc<BatchMeta> {
        &self.meta
    }

    /// Get the row schema
    pub fn schema(&self) -> &Arc<RowSchema> {
        self.meta.row_schema()
    }

    /// Get all rows
    pub fn rows(&self) -> &[Arc<Row>] {
        &self.rows
    }

    /// Get a row by index
    pub fn row(&self, index: usize) -> Result<&Arc<Row>> {
        self.rows.get(index).ok_or(Error::IndexOutOfBounds {
            index,
            len: self.rows.len(),
        })
    }

    /// Number of rows in the batch
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the batch holds no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Maximum number of rows
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the batch has reached its capacity
    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.capacity
    }
}

impl fmt::Display for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Batch: {}/{} rows, {} columns",
            self.rows.len(),
            self.capacity,
            self.meta.columns().len()
        )
    }
}
