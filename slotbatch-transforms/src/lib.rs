//! Transform stages for slot-format pipelines
//!
//! Stages here consume rows from any upstream [`Stage`]: [`RowAdder`]
//! appends computed columns, [`BatchCollator`] filters rows and groups them
//! into batches, and [`materialize`] turns a batch into padded arrays.

#![warn(missing_docs)]

pub mod batcher;
pub mod materialize;
pub mod row_adder;

pub use batcher::{BatchCollator, CollatorOptions, CollatorStats, RowPredicate};
pub use materialize::materialize;
pub use row_adder::{ColumnData, RowAdder};

// Re-export core types
pub use slotbatch_core::{Batch, Error, MaterializedBatch, Result, Row, Stage};
