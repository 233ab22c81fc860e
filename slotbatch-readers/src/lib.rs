//! Readers for slot-format training samples
//!
//! This crate provides the byte-chunk supplier seam, a line splitter that
//! works across chunk boundaries, and the record parser stage that turns
//! slot-format text into rows.

#![warn(missing_docs)]

pub mod chunk;
pub mod lines;
pub mod slot;

pub use chunk::{ChunkSource, MemoryChunks, ReaderChunks, DEFAULT_CHUNK_SIZE};
pub use lines::{Line, LineSplitter};
pub use slot::{ParserOptions, RecordParser, SlotGrammar, SparseWeights};

// Re-export core types
pub use slotbatch_core::{Error, Result, Row, RowSchema, Stage};
