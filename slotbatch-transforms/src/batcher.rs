//! Batch collation with row predicates

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use slotbatch_core::error::{Error, Result};
use slotbatch_core::{Batch, BatchMeta, Row, Stage, StreamMeta};
use tracing::{debug, trace};

/// Row filter; returning `false` drops the row
pub type RowPredicate = Box<dyn FnMut(&Row) -> anyhow::Result<bool> + Send>;

/// Options for batch collation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollatorOptions {
    /// Rows per batch
    pub batch_size: usize,

    /// Drop a final batch smaller than `batch_size`
    pub drop_last_batch: bool,
}

impl Default for CollatorOptions {
    fn default() -> Self {
        Self {
            batch_size: 256,
            drop_last_batch: false,
        }
    }
}

/// Collation counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollatorStats {
    /// Rows pulled from upstream
    pub rows_seen: u64,

    /// Rows rejected by a predicate
    pub rows_dropped: u64,

    /// Batches returned
    pub batches: u64,
}

/// Accumulates upstream rows into fixed-capacity batches
pub struct BatchCollator<S> {
    /// Row-producing stage
    upstream: S,

    /// Collation options
    options: CollatorOptions,

    /// Metadata shared by every produced batch
    meta: Arc<BatchMeta>,

    /// Filters applied in order to every row
    predicates: Vec<RowPredicate>,

    /// Whether upstream has been exhausted
    exhausted: bool,

    /// Counters
    stats: CollatorStats,
}

impl<S: Stage<Item = Row>> BatchCollator<S> {
    /// Create a collator over a row stage
    pub fn new(upstream: S, options: CollatorOptions) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(Error::InvalidArgument("Batch size must be positive".into()));
        }
        let schema = upstream.output_meta().expect_rows()?;

        Ok(Self {
            upstream,
            options,
            meta: Arc::new(BatchMeta::new(schema)),
            predicates: Vec::new(),
            exhausted: false,
            stats: CollatorStats::default(),
        })
    }

    /// Add a predicate, builder style
    #[must_use]
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: FnMut(&Row) -> anyhow::Result<bool> + Send + 'static,
    {
        self.add_predicate(predicate);
        self
    }

    /// Add a predicate evaluated after the existing ones
    pub fn add_predicate<P>(&mut self, predicate: P)
    where
        P: FnMut(&Row) -> anyhow::Result<bool> + Send + 'static,
    {
        self.predicates.push(Box::new(predicate));
    }

    /// Collation options
    pub fn options(&self) -> &CollatorOptions {
        &self.options
    }

    /// Collation counters
    pub fn stats(&self) -> CollatorStats {
        self.stats
    }

    /// Collect the next batch
    ///
    /// Returns None once upstream is exhausted and no rows are pending, or
    /// when only a short final batch remains and `drop_last_batch` is set.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.exhausted {
            return Ok(None);
        }

        let start = Instant::now();
        let mut batch = Batch::new(self.meta.clone(), self.options.batch_size);

        'rows: while !batch.is_full() {
            let Some(row) = self.upstream.next()? else {
                self.exhausted = true;
                break;
            };
            self.stats.rows_seen += 1;

            for predicate in &mut self.predicates {
                let keep = predicate(&row).map_err(|e| Error::callback("batch collator", e))?;
                if !keep {
                    self.stats.rows_dropped += 1;
                    continue 'rows;
                }
            }

            batch.push(Arc::new(row))?;
        }

        if batch.is_empty() {
            return Ok(None);
        }
        if !batch.is_full() {
            if self.options.drop_last_batch {
                debug!(rows = batch.len(), "dropping short final batch");
                return Ok(None);
            }
            debug!(rows = batch.len(), batch_size = self.options.batch_size, "flushing short final batch");
        }

        self.stats.batches += 1;
        trace!(
            rows = batch.len(),
            elapsed_us = start.elapsed().as_micros(),
            "collated batch"
        );
        Ok(Some(batch))
    }
}

impl<S: Stage<Item = Row>> Stage for BatchCollator<S> {
    type Item = Batch;

    fn output_meta(&self) -> StreamMeta {
        StreamMeta::Batches(self.meta.clone())
    }

    fn next(&mut self) -> Result<Option<Batch>> {
        self.next_batch()
    }
}

impl<S> fmt::Debug for BatchCollator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCollator")
            .field("options", &self.options)
            .field("predicates", &self.predicates.len())
            .field("exhausted", &self.exhausted)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotbatch_core::{ColumnSpec, ErrorKind, MemoryPool, RowSchema};
    use slotbatch_readers::{MemoryChunks, ParserOptions, RecordParser};
    use test_case::test_case;

    fn parser(rows: usize) -> RecordParser<MemoryChunks> {
        let schema = Arc::new(
            RowSchema::new(vec![
                ColumnSpec::string("id").unwrap(),
                ColumnSpec::dense("f", &[1]).unwrap(),
            ])
            .unwrap(),
        );
        let data: String = (0..rows).map(|i| format!("{i}|f@{i}.0\n")).collect();
        let source = MemoryChunks::from_bytes(data.as_bytes(), 64).unwrap();
        RecordParser::with_pool(source, schema, &ParserOptions::with_format("id|dense"), MemoryPool::new()).unwrap()
    }

    fn sizes(collator: &mut BatchCollator<RecordParser<MemoryChunks>>) -> Vec<usize> {
        let mut sizes = Vec::new();
        while let Some(batch) = collator.next_batch().unwrap() {
            sizes.push(batch.len());
        }
        sizes
    }

    #[test_case(10, 4, false => vec![4, 4, 2]; "keeps short batch")]
    #[test_case(10, 4, true => vec![4, 4]; "drops short batch")]
    #[test_case(8, 4, true => vec![4, 4]; "exact multiple")]
    #[test_case(0, 4, false => Vec::<usize>::new(); "empty input")]
    fn test_batch_sizes(rows: usize, batch_size: usize, drop_last_batch: bool) -> Vec<usize> {
        let options = CollatorOptions {
            batch_size,
            drop_last_batch,
        };
        let mut collator = BatchCollator::new(parser(rows), options).unwrap();
        sizes(&mut collator)
    }

    #[test]
    fn test_predicates_filter_rows() {
        let options = CollatorOptions {
            batch_size: 3,
            drop_last_batch: false,
        };
        let mut collator = BatchCollator::new(parser(10), options)
            .unwrap()
            .with_predicate(|row| Ok(row.dense("f")?[0] as i64 % 2 == 0));

        let batch = collator.next_batch().unwrap().unwrap();
        let values: Vec<f32> = batch.rows().iter().map(|r| r.dense("f").unwrap()[0]).collect();
        assert_eq!(values, vec![0.0, 2.0, 4.0]);

        assert_eq!(sizes(&mut collator), vec![2]);
        let stats = collator.stats();
        assert_eq!(stats.rows_seen, 10);
        assert_eq!(stats.rows_dropped, 5);
        assert_eq!(stats.batches, 2);
    }

    #[test]
    fn test_rejecting_predicate_yields_nothing() {
        let mut collator = BatchCollator::new(parser(20), CollatorOptions::default())
            .unwrap()
            .with_predicate(|_| Ok(true))
            .with_predicate(|_| Ok(false));

        assert!(collator.next_batch().unwrap().is_none());
        assert_eq!(collator.stats().rows_dropped, 20);
    }

    #[test]
    fn test_predicate_failure_surfaces() {
        let mut collator = BatchCollator::new(parser(3), CollatorOptions::default())
            .unwrap()
            .with_predicate(|_| anyhow::bail!("bad row"));

        let err = collator.next_batch().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CallbackFailure);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let options = CollatorOptions {
            batch_size: 0,
            drop_last_batch: false,
        };
        assert!(BatchCollator::new(parser(1), options).is_err());
    }
}
