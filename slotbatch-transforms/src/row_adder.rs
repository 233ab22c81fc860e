//! Schema extension stage
//!
//! [`RowAdder`] appends columns to every row flowing through it. A user
//! closure computes the new values from the row as it arrives.

use std::fmt;
use std::sync::Arc;

use slotbatch_core::error::{Error, Result};
use slotbatch_core::{ColumnKind, ColumnSpec, DataType, Row, RowSchema, Stage, StreamMeta};
use tracing::debug;

/// Value computed for one added column
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    /// Values for a dense column
    Dense(Vec<f32>),

    /// Ids for a sparse column
    SparseIds(Vec<i64>),

    /// Weights for a sparse weight column
    SparseWeights(Vec<f32>),

    /// Bytes for a string column
    Bytes(Vec<u8>),
}

impl ColumnData {
    fn label(&self) -> &'static str {
        match self {
            ColumnData::Dense(_) => "dense values",
            ColumnData::SparseIds(_) => "sparse ids",
            ColumnData::SparseWeights(_) => "sparse weights",
            ColumnData::Bytes(_) => "bytes",
        }
    }
}

/// Stage that extends each upstream row with computed columns
pub struct RowAdder<S, F> {
    /// Row-producing stage
    upstream: S,

    /// Upstream schema plus the added columns
    schema: Arc<RowSchema>,

    /// Index of the first added column
    first_added: usize,

    /// Computes the added values
    transform: F,

    /// Rows extended so far
    rows_added: u64,
}

impl<S, F> RowAdder<S, F>
where
    S: Stage<Item = Row>,
    F: FnMut(&Row) -> anyhow::Result<Vec<ColumnData>>,
{
    /// Extend the rows of `upstream` with `columns`
    pub fn new(upstream: S, columns: Vec<ColumnSpec>, transform: F) -> Result<Self> {
        if columns.is_empty() {
            return Err(Error::InvalidArgument("RowAdder needs at least one column".into()));
        }
        let base = upstream.output_meta().expect_rows()?;
        let schema = Arc::new(base.extend(columns)?);

        Ok(Self {
            upstream,
            first_added: base.len(),
            schema,
            transform,
            rows_added: 0,
        })
    }

    /// Schema of produced rows
    pub fn schema(&self) -> &Arc<RowSchema> {
        &self.schema
    }

    /// Number of rows extended so far
    pub fn rows_added(&self) -> u64 {
        self.rows_added
    }

    fn write(&self, row: &mut Row, index: usize, data: ColumnData) -> Result<()> {
        let column = self.schema.column(index)?;
        match (column.kind(), column.data_type(), data) {
            (ColumnKind::Dense, DataType::Float32, ColumnData::Dense(values)) => {
                check_count(column, values.len())?;
                row.write_values(index, &values)
            }
            (ColumnKind::Sparse, DataType::Int64, ColumnData::SparseIds(ids)) => {
                check_count(column, ids.len())?;
                row.write_values(index, &ids)
            }
            (ColumnKind::Sparse, DataType::Float32, ColumnData::SparseWeights(weights)) => {
                check_count(column, weights.len())?;
                row.write_values(index, &weights)
            }
            (ColumnKind::String, DataType::Utf8, ColumnData::Bytes(bytes)) => {
                row.write_values(index, &bytes)
            }
            (kind, data_type, data) => Err(Error::SchemaMismatch(format!(
                "Column '{}' is {kind} {data_type}, transform returned {}",
                column.name(),
                data.label()
            ))),
        }
    }
}

fn check_count(column: &ColumnSpec, count: usize) -> Result<()> {
    match column.item_count() {
        Some(expected) if expected != count => Err(Error::SchemaMismatch(format!(
            "Column '{}' expects {expected} values, transform returned {count}",
            column.name()
        ))),
        Some(_) => Ok(()),
        None => column
            .resolve_shape(count * column.data_type().size_bytes())
            .map(|_| ()),
    }
}

impl<S, F> Stage for RowAdder<S, F>
where
    S: Stage<Item = Row>,
    F: FnMut(&Row) -> anyhow::Result<Vec<ColumnData>>,
{
    type Item = Row;

    fn output_meta(&self) -> StreamMeta {
        StreamMeta::Rows(self.schema.clone())
    }

    fn next(&mut self) -> Result<Option<Row>> {
        let Some(mut row) = self.upstream.next()? else {
            debug!(rows = self.rows_added, "row adder reached end of input");
            return Ok(None);
        };
        row.rebind(self.schema.clone())?;

        let values = (self.transform)(&row).map_err(|e| Error::callback("row adder", e))?;
        let added = self.schema.len() - self.first_added;
        if values.len() != added {
            return Err(Error::SchemaMismatch(format!(
                "Transform returned {} values for {added} added columns",
                values.len()
            )));
        }

        for (offset, data) in values.into_iter().enumerate() {
            self.write(&mut row, self.first_added + offset, data)?;
        }
        self.rows_added += 1;
        Ok(Some(row))
    }
}

impl<S, F> fmt::Debug for RowAdder<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowAdder")
            .field("first_added", &self.first_added)
            .field("columns", &self.schema.len())
            .field("rows_added", &self.rows_added)
            .finish_non_exhaustive()
    }
}
