//! Slot-format record parsing
//!
//! This module turns delimiter-encoded training samples into rows. Records
//! are split out of an arbitrary chunk stream, matched field by field against
//! a declared format, and their `dense` and `sparse` slots are written into
//! the row's typed columns.

mod grammar;
mod options;
mod parser;

pub use grammar::SlotGrammar;
pub use options::{ParserOptions, SparseWeights, DEFAULT_WEIGHT_SUFFIX, DENSE_FIELD, SPARSE_FIELD};
pub use parser::RecordParser;
