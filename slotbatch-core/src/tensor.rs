//! Batched column arrays produced by materialization

use std::collections::HashMap;
use std::fmt;

use bytemuck::Pod;

use crate::error::{Error, Result};

/// Trait for types that can be used in tensors
pub trait TensorType: Pod + Send + Sync + 'static {}

impl<T: Pod + Send + Sync + 'static> TensorType for T {}

/// A dense `[batch, ...column_shape]` array
///
/// Rows are laid out one after another along the batch dimension. Inside a
/// row, elements follow column-major (Fortran) order over the column shape.
#[derive(Clone, PartialEq)]
pub struct Tensor<T: TensorType> {
    /// Element storage
    data: Vec<T>,

    /// Shape of the tensor (dimensions)
    shape: Vec<usize>,

    /// Strides of the tensor (elements to skip per dimension)
    strides: Vec<usize>,
}

impl<T: TensorType> Tensor<T> {
    /// Create a zero-filled tensor with the given shape
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size = shape.iter().product();
        let strides = Self::compute_strides(&shape);

        Self {
            data: vec![T::zeroed(); size],
            shape,
            strides,
        }
    }

    /// Create a tensor from its elements
    pub fn from_vec(data: Vec<T>, shape: Vec<usize>) -> Result<Self> {
        let expected_size: usize = shape.iter().product();
        if data.len() != expected_size {
            return Err(Error::InvalidArgument(format!(
                "Data length {} doesn't match shape {:?} (expected {})",
                data.len(),
                shape,
                expected_size
            )));
        }

        let strides = Self::compute_strides(&shape);
        Ok(Self { data, shape, strides })
    }

    /// Compute strides for a given shape
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let Some((_, row_dims)) = shape.split_first() else {
            return Vec::new();
        };

        let mut strides = vec![0; shape.len()];
        strides[0] = row_dims.iter().product();

        let mut stride = 1;
        for (i, &dim) in row_dims.iter().enumerate() {
            strides[i + 1] = stride;
            stride *= dim;
        }

        strides
    }

    /// Get the shape of this tensor
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the strides of this tensor
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Get the total number of elements in this tensor
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if this tensor is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the number of dimensions in this tensor
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Calculate the size in bytes of this tensor
    pub fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<T>()
    }

    /// All elements in storage order
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Raw bytes in storage order
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    /// Consume the tensor and return its elements
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Elements of one batch row
    pub fn row(&self, index: usize) -> Result<&[T]> {
        let batch = self.shape.first().copied().unwrap_or(0);
        if index >= batch {
            return Err(Error::IndexOutOfBounds { index, len: batch });
        }
        let row_len = self.strides[0];
        Ok(&self.data[index * row_len..(index + 1) * row_len])
    }

    /// Mutable elements of one batch row
    pub fn row_mut(&mut self, index: usize) -> Result<&mut [T]> {
        let batch = self.shape.first().copied().unwrap_or(0);
        if index >= batch {
            return Err(Error::IndexOutOfBounds { index, len: batch });
        }
        let row_len = self.strides[0];
        Ok(&mut self.data[index * row_len..(index + 1) * row_len])
    }

    /// Get the value at the specified indices
    pub fn get(&self, indices: &[usize]) -> Result<T> {
        if indices.len() != self.shape.len() {
            return Err(Error::InvalidArgument(
                "Number of indices must match number of dimensions".into(),
            ));
        }

        // Validate indices
        for (&idx, &dim) in indices.iter().zip(&self.shape) {
            if idx >= dim {
                return Err(Error::IndexOutOfBounds { index: idx, len: dim });
            }
        }

        let offset: usize = indices.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
        Ok(self.data[offset])
    }
}

impl<T: TensorType + fmt::Debug> fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor<{}>{{ shape: {:?}, size: {} }}",
            std::any::type_name::<T>(),
            self.shape,
            self.data.len()
        )
    }
}

/// One materialized column of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum BatchArray {
    /// Dense values or sparse weights
    Float32(Tensor<f32>),

    /// Sparse ids
    Int64(Tensor<i64>),

    /// One byte sequence per row, unpadded
    Bytes(Vec<Vec<u8>>),
}

impl BatchArray {
    /// Shape of the array, `[batch]` for byte lists
    pub fn shape(&self) -> Vec<usize> {
        match self {
            BatchArray::Float32(t) => t.shape().to_vec(),
            BatchArray::Int64(t) => t.shape().to_vec(),
            BatchArray::Bytes(rows) => vec![rows.len()],
        }
    }

    /// Size of the array payload in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            BatchArray::Float32(t) => t.size_bytes(),
            BatchArray::Int64(t) => t.size_bytes(),
            BatchArray::Bytes(rows) => rows.iter().map(Vec::len).sum(),
        }
    }

    /// Float tensor, if this is one
    pub fn as_f32(&self) -> Option<&Tensor<f32>> {
        match self {
            BatchArray::Float32(t) => Some(t),
            _ => None,
        }
    }

    /// Integer tensor, if this is one
    pub fn as_i64(&self) -> Option<&Tensor<i64>> {
        match self {
            BatchArray::Int64(t) => Some(t),
            _ => None,
        }
    }

    /// Byte list, if this is one
    pub fn as_bytes(&self) -> Option<&[Vec<u8>]> {
        match self {
            BatchArray::Bytes(rows) => Some(rows),
            _ => None,
        }
    }
}

/// Column name to batched array, in schema order
#[derive(Debug, Clone, Default)]
pub struct MaterializedBatch {
    columns: Vec<(String, BatchArray)>,
    column_indices: HashMap<String, usize>,
    batch_size: usize,
}

impl MaterializedBatch {
    /// Create an empty result for `batch_size` rows
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    /// Append a column
    pub fn push(&mut self, name: impl Into<String>, array: BatchArray) -> Result<()> {
        let name = name.into();
        let leading = array.shape().first().copied().unwrap_or(0);
        if leading != self.batch_size {
            return Err(Error::InvalidArgument(format!(
                "Column '{name}' has {leading} rows, batch has {}",
                self.batch_size
            )));
        }
        if self.column_indices.contains_key(&name) {
            return Err(Error::SchemaMismatch(format!("Duplicate column name: {name}")));
        }

        self.column_indices.insert(name.clone(), self.columns.len());
        self.columns.push((name, array));
        Ok(())
    }

    /// Get a column by name
    pub fn get(&self, name: &str) -> Option<&BatchArray> {
        self.column_indices.get(name).map(|&i| &self.columns[i].1)
    }

    /// Iterate over columns in schema order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BatchArray)> {
        self.columns.iter().map(|(name, array)| (name.as_str(), array))
    }

    /// Number of rows
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if no column has been added
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Total payload bytes over all columns
    pub fn size_bytes(&self) -> usize {
        self.columns.iter().map(|(_, array)| array.size_bytes()).sum()
    }

    /// Consume into a name-keyed map
    pub fn into_map(self) -> HashMap<String, BatchArray> {
        self.columns.into_iter().collect()
    }
}
