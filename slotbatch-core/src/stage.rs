//! Pull-based stage protocol shared by parsers and collators

use std::sync::Arc;

use crate::batch::BatchMeta;
use crate::error::{Error, Result};
use crate::schema::RowSchema;

/// What a stage produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMeta {
    /// A stream of rows conforming to a schema
    Rows(Arc<RowSchema>),

    /// A stream of batches
    Batches(Arc<BatchMeta>),
}

impl StreamMeta {
    /// Row schema of a row stream, or a schema mismatch
    pub fn expect_rows(&self) -> Result<Arc<RowSchema>> {
        match self {
            StreamMeta::Rows(schema) => Ok(schema.clone()),
            StreamMeta::Batches(_) => Err(Error::SchemaMismatch(
                "Expected a row stream, upstream produces batches".into(),
            )),
        }
    }

    /// Batch metadata of a batch stream, or a schema mismatch
    pub fn expect_batches(&self) -> Result<Arc<BatchMeta>> {
        match self {
            StreamMeta::Batches(meta) => Ok(meta.clone()),
            StreamMeta::Rows(_) => Err(Error::SchemaMismatch(
                "Expected a batch stream, upstream produces rows".into(),
            )),
        }
    }
}

/// A pipeline stage pulled one item at a time
pub trait Stage {
    /// The type of items produced by this stage
    type Item;

    /// Describe the items this stage produces
    fn output_meta(&self) -> StreamMeta;

    /// Produce the next item
    /// Returns None when exhausted
    fn next(&mut self) -> Result<Option<Self::Item>>;
}

impl<S: Stage + ?Sized> Stage for Box<S> {
    type Item = S::Item;

    fn output_meta(&self) -> StreamMeta {
        (**self).output_meta()
    }

    fn next(&mut self) -> Result<Option<Self::Item>> {
        (**self).next()
    }
}

/// Iterator adapter over a stage with one item of lookahead
pub struct StageIter<S: Stage> {
    stage: S,
    peeked: Option<Result<Option<S::Item>>>,
}

impl<S: Stage> StageIter<S> {
    /// Wrap a stage
    pub fn new(stage: S) -> Self {
        Self { stage, peeked: None }
    }

    /// Whether another item is available
    ///
    /// Pulls one item ahead; an upstream error counts as an available item
    /// and is returned by the following `next`.
    pub fn has_next(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = Some(self.stage.next());
        }
        !matches!(self.peeked, Some(Ok(None)))
    }

    /// Unwrap the underlying stage
    pub fn into_inner(self) -> S {
        self.stage
    }
}

impl<S: Stage> Iterator for StageIter<S> {
    type Item = Result<S::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let pulled = match self.peeked.take() {
            Some(pulled) => pulled,
            None => self.stage.next(),
        };
        match pulled {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                // Stay exhausted
                self.peeked = Some(Ok(None));
                None
            }
            Err(e) => Some(Err(e)),
        }
    }
}
