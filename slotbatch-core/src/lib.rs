//! Core data structures for slot-format training-sample pipelines
//!
//! This crate provides the foundational components the reader and transform
//! crates build upon: a pool of reusable memory regions, per-row arenas,
//! row schemas, rows with inline or arena-backed column blocks, batches, the
//! batched arrays they materialize into, and the pull-stage protocol.

#![warn(missing_docs)]

pub mod arena;
pub mod batch;
pub mod error;
pub mod memory;
pub mod row;
pub mod schema;
pub mod stage;
pub mod tensor;

// Re-export key types for convenience
pub use arena::{ArenaSpan, RowArena};
pub use batch::{Batch, BatchMeta};
pub use error::{Error, ErrorKind, Result};
pub use memory::{MemoryPool, PoolConfig, PoolStats, RegionHandle};
pub use row::{ColumnBlock, Row, INLINE_CAPACITY};
pub use schema::{infer_shape, ColumnKind, ColumnSpec, DataType, Element, RowSchema};
pub use stage::{Stage, StageIter, StreamMeta};
pub use tensor::{BatchArray, MaterializedBatch, Tensor, TensorType};
