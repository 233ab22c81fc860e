//! Record parser stage: chunks in, rows out

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use slotbatch_core::error::Result;
use slotbatch_core::{MemoryPool, Row, RowSchema, Stage, StreamMeta};
use tracing::debug;

use super::grammar::SlotGrammar;
use super::options::ParserOptions;
use crate::chunk::{ChunkSource, MemoryChunks, ReaderChunks};
use crate::lines::LineSplitter;

/// Parses slot-format records into rows
pub struct RecordParser<C> {
    /// Line source over the chunk supplier
    lines: LineSplitter<C>,

    /// Compiled grammar
    grammar: SlotGrammar,

    /// Pool backing every parsed row
    pool: MemoryPool,

    /// Rows produced so far
    rows_parsed: u64,
}

impl<C: ChunkSource> RecordParser<C> {
    /// Create a parser drawing row memory from the shared pool
    pub fn new(source: C, schema: Arc<RowSchema>, options: &ParserOptions) -> Result<Self> {
        Self::with_pool(source, schema, options, MemoryPool::shared())
    }

    /// Create a parser drawing row memory from `pool`
    pub fn with_pool(
        source: C,
        schema: Arc<RowSchema>,
        options: &ParserOptions,
        pool: MemoryPool,
    ) -> Result<Self> {
        let grammar = SlotGrammar::new(schema, options)?;
        let lines = LineSplitter::new(source)
            .strip_carriage_return(options.strip_carriage_return)
            .skip_empty_lines(options.skip_empty_lines);

        Ok(Self {
            lines,
            grammar,
            pool,
            rows_parsed: 0,
        })
    }

    /// Schema of produced rows
    pub fn schema(&self) -> &Arc<RowSchema> {
        self.grammar.schema()
    }

    /// Number of rows produced so far
    pub fn rows_parsed(&self) -> u64 {
        self.rows_parsed
    }
}

impl RecordParser<MemoryChunks> {
    /// Parse records held in memory
    pub fn from_bytes(data: &[u8], schema: Arc<RowSchema>, options: &ParserOptions) -> Result<Self> {
        let source = MemoryChunks::from_bytes(data, options.chunk_size)?;
        Self::new(source, schema, options)
    }
}

impl RecordParser<ReaderChunks<File>> {
    /// Parse records from a file
    pub fn open<P: AsRef<Path>>(path: P, schema: Arc<RowSchema>, options: &ParserOptions) -> Result<Self> {
        let source = ReaderChunks::open(path, options.chunk_size)?;
        Self::new(source, schema, options)
    }
}

impl<C: ChunkSource> Stage for RecordParser<C> {
    type Item = Row;

    fn output_meta(&self) -> StreamMeta {
        StreamMeta::Rows(self.grammar.schema().clone())
    }

    fn next(&mut self) -> Result<Option<Row>> {
        let Some(line) = self.lines.next_line()? else {
            debug!(rows = self.rows_parsed, "record parser reached end of input");
            return Ok(None);
        };

        let mut row = Row::new(self.grammar.schema().clone(), self.pool.clone());
        self.grammar.parse_record(&line.bytes, line.number, &mut row)?;

        self.rows_parsed += 1;
        Ok(Some(row))
    }
}
