//! Row storage: column blocks backed by a per-row arena
//!
//! A [`Row`] holds one [`ColumnBlock`] per schema column. Payloads of at most
//! [`INLINE_CAPACITY`] bytes live inside the block itself; larger payloads
//! are spilled into the row's [`RowArena`].

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use static_assertions::{assert_impl_all, const_assert};

use crate::arena::{ArenaSpan, RowArena};
use crate::error::{Error, Result};
use crate::memory::MemoryPool;
use crate::schema::{ColumnKind, ColumnSpec, DataType, Element, RowSchema};

/// Largest payload stored inline in a column block
pub const INLINE_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
enum BlockRepr {
    #[default]
    Unset,
    Inline {
        len: u8,
        word: u64,
    },
    Arena(ArenaSpan),
}

/// Storage slot for one column of one row
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnBlock {
    repr: BlockRepr,
}

const_assert!(mem::size_of::<ColumnBlock>() <= 32);
assert_impl_all!(Row: Send, Sync);

impl ColumnBlock {
    /// Payload size in bytes, zero when unset
    pub fn byte_size(&self) -> usize {
        match self.repr {
            BlockRepr::Unset => 0,
            BlockRepr::Inline { len, .. } => usize::from(len),
            BlockRepr::Arena(span) => span.len(),
        }
    }

    /// Whether the block has been allocated
    pub fn is_set(&self) -> bool {
        !matches!(self.repr, BlockRepr::Unset)
    }

    /// Whether the payload lives inside the block
    pub fn is_inline(&self) -> bool {
        matches!(self.repr, BlockRepr::Inline { .. })
    }

    fn fill_inline(&mut self, len: usize) -> &mut [u8] {
        debug_assert!(len <= INLINE_CAPACITY);
        #[allow(clippy::cast_possible_truncation)]
        let len_tag = len as u8;
        self.repr = BlockRepr::Inline { len: len_tag, word: 0 };
        match &mut self.repr {
            BlockRepr::Inline { word, .. } => &mut bytemuck::bytes_of_mut(word)[..len],
            _ => &mut [],
        }
    }
}

/// One record's column data plus its external side table
#[derive(Debug)]
pub struct Row {
    schema: Arc<RowSchema>,
    base: Box<[ColumnBlock]>,
    extended: Vec<ColumnBlock>,
    external: HashMap<String, String>,
    arena: RowArena,
}

impl Row {
    /// Create an empty row bound to `schema`, allocating from `pool`
    pub fn new(schema: Arc<RowSchema>, pool: MemoryPool) -> Self {
        let base = vec![ColumnBlock::default(); schema.original_column_size()].into_boxed_slice();
        let extended = vec![ColumnBlock::default(); schema.extended_columns().len()];

        Self {
            schema,
            base,
            extended,
            external: HashMap::new(),
            arena: RowArena::new(pool),
        }
    }

    /// Schema this row is bound to
    pub fn schema(&self) -> &Arc<RowSchema> {
        &self.schema
    }

    /// Arena backing this row's spilled payloads
    pub fn arena(&self) -> &RowArena {
        &self.arena
    }

    /// Get the block for a column
    pub fn block(&self, index: usize) -> Result<&ColumnBlock> {
        self.schema.column(index)?;
        let original = self.schema.original_column_size();
        Ok(if index < original {
            &self.base[index]
        } else {
            &self.extended[index - original]
        })
    }

    /// Allocate storage for a column and return its bytes for filling
    ///
    /// Each block is allocated once; a second allocation of the same block
    /// is rejected with [`Error::BlockAlreadyAllocated`].
    pub fn allocate_column(&mut self, index: usize, byte_size: usize) -> Result<&mut [u8]> {
        let column = self.schema.column(index)?;
        let align = column.data_type().align();

        let original = self.schema.original_column_size();
        let block = if index < original {
            &mut self.base[index]
        } else {
            &mut self.extended[index - original]
        };

        if block.is_set() {
            return Err(Error::BlockAlreadyAllocated {
                column: column.name().to_string(),
            });
        }

        if byte_size <= INLINE_CAPACITY {
            return Ok(block.fill_inline(byte_size));
        }

        let span = self.arena.allocate(byte_size, align)?;
        block.repr = BlockRepr::Arena(span);
        self.arena.bytes_mut(span)
    }

    /// Allocate a column sized for `count` elements, zero-initialized
    pub fn allocate_values<T: Element>(&mut self, index: usize, count: usize) -> Result<&mut [T]> {
        self.check_type::<T>(index)?;
        let bytes = self.allocate_column(index, count * mem::size_of::<T>())?;
        let values: &mut [T] = bytemuck::try_cast_slice_mut(bytes)
            .map_err(|e| Error::InvalidArgument(format!("Misaligned column storage: {e}")))?;
        values.fill(T::zeroed());
        Ok(values)
    }

    /// Allocate a column and copy `values` into it
    pub fn write_values<T: Element>(&mut self, index: usize, values: &[T]) -> Result<()> {
        self.allocate_values::<T>(index, values.len())?.copy_from_slice(values);
        Ok(())
    }

    /// Raw bytes of a populated column
    pub fn column_bytes(&self, index: usize) -> Result<&[u8]> {
        let block = self.block(index)?;
        match &block.repr {
            BlockRepr::Unset => Err(Error::InvalidArgument(format!(
                "Column '{}' read before it was allocated",
                self.schema.columns()[index].name()
            ))),
            BlockRepr::Inline { len, word } => Ok(&bytemuck::bytes_of(word)[..usize::from(*len)]),
            BlockRepr::Arena(span) => self.arena.bytes(*span),
        }
    }

    /// Typed view of a populated column
    pub fn values<T: Element>(&self, index: usize) -> Result<&[T]> {
        self.check_type::<T>(index)?;
        bytemuck::try_cast_slice(self.column_bytes(index)?)
            .map_err(|e| Error::InvalidArgument(format!("Misaligned column storage: {e}")))
    }

    /// Concrete per-row shape of a populated column
    pub fn column_shape(&self, index: usize) -> Result<Vec<usize>> {
        let column = self.schema.column(index)?;
        column.resolve_shape(self.block(index)?.byte_size())
    }

    fn check_type<T: Element>(&self, index: usize) -> Result<()> {
        let column = self.schema.column(index)?;
        if column.data_type() != T::DATA_TYPE {
            return Err(Error::SchemaMismatch(format!(
                "Column '{}' holds {}, not {}",
                column.name(),
                column.data_type(),
                T::DATA_TYPE
            )));
        }
        Ok(())
    }

    fn named(&self, name: &str, kind: ColumnKind, data_type: DataType) -> Result<usize> {
        let index = self.schema.index_of(name)?;
        let column: &ColumnSpec = &self.schema.columns()[index];
        if column.kind() != kind || column.data_type() != data_type {
            return Err(Error::SchemaMismatch(format!(
                "Column '{name}' is {} {}, expected {kind} {data_type}",
                column.kind(),
                column.data_type()
            )));
        }
        Ok(index)
    }

    /// Values of a dense column by name
    pub fn dense(&self, name: &str) -> Result<&[f32]> {
        self.values(self.named(name, ColumnKind::Dense, DataType::Float32)?)
    }

    /// Ids of a sparse column by name
    pub fn sparse_ids(&self, name: &str) -> Result<&[i64]> {
        self.values(self.named(name, ColumnKind::Sparse, DataType::Int64)?)
    }

    /// Weights of a sparse weight column by name
    pub fn sparse_weights(&self, name: &str) -> Result<&[f32]> {
        self.values(self.named(name, ColumnKind::Sparse, DataType::Float32)?)
    }

    /// Raw bytes of a string column by name
    pub fn string_bytes(&self, name: &str) -> Result<&[u8]> {
        self.values(self.named(name, ColumnKind::String, DataType::Utf8)?)
    }

    /// Contents of a string column by name
    pub fn string(&self, name: &str) -> Result<&str> {
        std::str::from_utf8(self.string_bytes(name)?)
            .map_err(|e| Error::InvalidArgument(format!("Column '{name}' is not valid UTF-8: {e}")))
    }

    /// First base column that has not been populated
    pub fn missing_base_column(&self) -> Option<&str> {
        self.base
            .iter()
            .position(|block| !block.is_set())
            .map(|i| self.schema.columns()[i].name())
    }

    /// Set an external side-table value
    pub fn set_external(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.external.insert(key.into(), value.into());
    }

    /// Get an external side-table value
    pub fn external(&self, key: &str) -> Option<&str> {
        self.external.get(key).map(String::as_str)
    }

    /// Full external side table
    pub fn external_data(&self) -> &HashMap<String, String> {
        &self.external
    }

    /// Bind this row to an extension of its current schema
    ///
    /// Populated blocks are kept and newly added extended slots start unset.
    /// The new schema must keep every current column at its index.
    pub fn rebind(&mut self, schema: Arc<RowSchema>) -> Result<()> {
        if Arc::ptr_eq(&self.schema, &schema) {
            return Ok(());
        }

        let old_extended = self.extended.len();
        let new_extended = schema.extended_columns().len();
        if new_extended < old_extended {
            return Err(Error::SchemaMismatch(format!(
                "Cannot rebind row from {old_extended} to {new_extended} extended columns"
            )));
        }
        if !self.schema.is_prefix_of(&schema) {
            return Err(Error::SchemaMismatch(
                "Rebind target does not extend the row's current schema".into(),
            ));
        }

        self.extended.resize(new_extended, ColumnBlock::default());
        self.schema = schema;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<RowSchema> {
        Arc::new(
            RowSchema::new(vec![
                ColumnSpec::string("id").unwrap(),
                ColumnSpec::dense("f1", &[2]).unwrap(),
                ColumnSpec::dense("big", &[16]).unwrap(),
                ColumnSpec::sparse("s1", &[-1]).unwrap(),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn test_column_block_fits_small() {
        assert!(mem::size_of::<ColumnBlock>() <= 32);
        assert!(!ColumnBlock::default().is_set());
    }

    #[test]
    fn test_inline_and_spilled_columns() {
        let pool = MemoryPool::new();
        let mut row = Row::new(schema(), pool);

        row.write_values::<f32>(1, &[1.0, 2.0]).unwrap();
        assert!(row.block(1).unwrap().is_inline());
        assert_eq!(row.dense("f1").unwrap(), &[1.0, 2.0]);

        let big: Vec<f32> = (0..16).map(|i| i as f32).collect();
        row.write_values(2, &big).unwrap();
        assert!(!row.block(2).unwrap().is_inline());
        assert_eq!(row.dense("big").unwrap(), big.as_slice());
        assert_eq!(row.arena().regions().len(), 1);
    }

    #[test]
    fn test_double_allocation_rejected() {
        let mut row = Row::new(schema(), MemoryPool::new());
        row.allocate_column(1, 8).unwrap();

        let err = row.allocate_column(1, 8).unwrap_err();
        assert!(matches!(err, Error::BlockAlreadyAllocated { column } if column == "f1"));
    }

    #[test]
    fn test_read_before_write_fails() {
        let row = Row::new(schema(), MemoryPool::new());
        assert!(row.column_bytes(0).is_err());
        assert!(matches!(row.block(9), Err(Error::IndexOutOfBounds { index: 9, len: 4 })));
    }

    #[test]
    fn test_typed_access_checks_types() {
        let mut row = Row::new(schema(), MemoryPool::new());
        row.write_values::<i64>(3, &[10, 20, 30]).unwrap();

        assert_eq!(row.sparse_ids("s1").unwrap(), &[10, 20, 30]);
        assert_eq!(row.column_shape(3).unwrap(), vec![3]);
        assert!(row.values::<f32>(3).is_err());
        assert!(row.dense("s1").is_err());
        assert!(row.write_values::<f32>(0, &[1.0]).is_err());
    }

    #[test]
    fn test_empty_string_is_set() {
        let mut row = Row::new(schema(), MemoryPool::new());
        row.allocate_column(0, 0).unwrap();

        assert!(row.block(0).unwrap().is_set());
        assert_eq!(row.string("id").unwrap(), "");
        assert_eq!(row.missing_base_column(), Some("f1"));
    }

    #[test]
    fn test_rebind_preserves_blocks() {
        let base = schema();
        let mut row = Row::new(base.clone(), MemoryPool::new());
        row.write_values::<f32>(1, &[3.0, 4.0]).unwrap();

        let once = Arc::new(base.extend(vec![ColumnSpec::dense("e1", &[1]).unwrap()]).unwrap());
        row.rebind(once.clone()).unwrap();
        row.write_values::<f32>(4, &[9.0]).unwrap();

        let twice = Arc::new(once.extend(vec![ColumnSpec::dense("e2", &[1]).unwrap()]).unwrap());
        row.rebind(twice.clone()).unwrap();

        assert_eq!(row.dense("f1").unwrap(), &[3.0, 4.0]);
        assert_eq!(row.dense("e1").unwrap(), &[9.0]);
        assert!(!row.block(5).unwrap().is_set());

        // Shrinking the extended suffix is refused
        assert!(matches!(row.rebind(once), Err(Error::SchemaMismatch(_))));
        // So is a schema that is not an extension of the current one
        assert!(row.rebind(schema()).is_err());
    }

    #[test]
    fn test_external_side_table() {
        let mut row = Row::new(schema(), MemoryPool::new());
        row.set_external("label", "1");

        assert_eq!(row.external("label"), Some("1"));
        assert_eq!(row.external("missing"), None);
        assert_eq!(row.external_data().len(), 1);
    }

    #[test]
    fn test_rows_share_pool_regions() {
        let pool = MemoryPool::new();
        let big: Vec<f32> = vec![1.0; 16];

        let mut first = Row::new(schema(), pool.clone());
        first.write_values(2, &big).unwrap();
        let mut second = Row::new(schema(), pool.clone());
        second.write_values(2, &big).unwrap();

        assert!(first.arena().regions()[0].ptr_eq(&second.arena().regions()[0]));
        drop(first);
        assert_eq!(second.dense("big").unwrap(), big.as_slice());
    }
}
