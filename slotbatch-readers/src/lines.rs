//! Line splitting across chunk boundaries

use std::borrow::Cow;
use std::mem;

use slotbatch_core::error::Result;
use tracing::debug;

use crate::chunk::ChunkSource;

/// One line of input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line<'a> {
    /// 1-based line number, counting skipped lines
    pub number: u64,

    /// Line contents without the terminator
    ///
    /// Borrowed from the current chunk when the line lies inside it, owned
    /// when it had to be stitched together across chunks.
    pub bytes: Cow<'a, [u8]>,
}

enum Found {
    View { start: usize, end: usize },
    Carried,
}

/// Splits a chunk stream into `\n`-terminated lines
pub struct LineSplitter<C> {
    /// Supplier of raw chunks
    source: C,

    /// Chunk currently being scanned
    chunk: Vec<u8>,

    /// Scan position within `chunk`
    pos: usize,

    /// Partial line carried over from earlier chunks
    carry: Vec<u8>,

    /// Whether the source is exhausted
    exhausted: bool,

    /// Lines seen so far
    line_number: u64,

    /// Drop one trailing `\r` from each line
    strip_carriage_return: bool,

    /// Do not yield empty lines
    skip_empty_lines: bool,
}

impl<C: ChunkSource> LineSplitter<C> {
    /// Create a splitter over `source`
    pub fn new(source: C) -> Self {
        Self {
            source,
            chunk: Vec::new(),
            pos: 0,
            carry: Vec::new(),
            exhausted: false,
            line_number: 0,
            strip_carriage_return: true,
            skip_empty_lines: true,
        }
    }

    /// Set whether a trailing `\r` is removed from each line
    pub fn strip_carriage_return(mut self, strip: bool) -> Self {
        self.strip_carriage_return = strip;
        self
    }

    /// Set whether empty lines are skipped
    pub fn skip_empty_lines(mut self, skip: bool) -> Self {
        self.skip_empty_lines = skip;
        self
    }

    /// Number of lines seen so far
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    /// Next line, or None at end of input
    pub fn next_line(&mut self) -> Result<Option<Line<'_>>> {
        let found = loop {
            let Some(found) = self.find_line()? else {
                return Ok(None);
            };
            self.line_number += 1;

            let empty = match found {
                Found::View { start, end } => start == end,
                Found::Carried => self.carry.is_empty(),
            };
            if !(empty && self.skip_empty_lines) {
                break found;
            }
        };

        let bytes = match found {
            Found::View { start, end } => Cow::Borrowed(&self.chunk[start..end]),
            Found::Carried => Cow::Owned(mem::take(&mut self.carry)),
        };

        Ok(Some(Line {
            number: self.line_number,
            bytes,
        }))
    }

    fn find_line(&mut self) -> Result<Option<Found>> {
        loop {
            if self.pos < self.chunk.len() {
                let rest = &self.chunk[self.pos..];
                if let Some(offset) = rest.iter().position(|&b| b == b'\n') {
                    let start = self.pos;
                    let end = start + offset;
                    self.pos = end + 1;

                    if self.carry.is_empty() {
                        let end = if self.strip_carriage_return && end > start && self.chunk[end - 1] == b'\r' {
                            end - 1
                        } else {
                            end
                        };
                        return Ok(Some(Found::View { start, end }));
                    }

                    self.carry.extend_from_slice(&self.chunk[start..end]);
                    self.trim_carry();
                    return Ok(Some(Found::Carried));
                }

                // No terminator left in this chunk
                self.carry.extend_from_slice(rest);
                self.pos = self.chunk.len();
            }

            if self.exhausted {
                if self.carry.is_empty() {
                    return Ok(None);
                }
                self.trim_carry();
                return Ok(Some(Found::Carried));
            }

            match self.source.next_chunk()? {
                Some(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                None => {
                    debug!(lines = self.line_number, "line splitter reached end of input");
                    self.exhausted = true;
                    self.chunk.clear();
                    self.pos = 0;
                }
            }
        }
    }

    fn trim_carry(&mut self) {
        if self.strip_carriage_return && self.carry.last() == Some(&b'\r') {
            self.carry.pop();
        }
    }
}
