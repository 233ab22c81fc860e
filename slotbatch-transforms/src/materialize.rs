//! Batch-to-tensor transpose
//!
//! Each column of a batch becomes one array with a leading batch dimension.
//! Static columns copy row payloads as-is; ragged sparse columns are padded
//! with zeros to the largest row in the batch; string columns become one
//! byte sequence per row.

use std::time::Instant;

use slotbatch_core::error::{Error, Result};
use slotbatch_core::{
    Batch, BatchArray, ColumnKind, ColumnSpec, DataType, Element, MaterializedBatch, Tensor, TensorType,
};
use tracing::trace;

/// Materialize every column of `batch`, in schema order
pub fn materialize(batch: &Batch) -> Result<MaterializedBatch> {
    let start = Instant::now();
    let mut out = MaterializedBatch::new(batch.len());

    for (index, column) in batch.schema().columns().iter().enumerate() {
        let array = match (column.kind(), column.data_type()) {
            (ColumnKind::String, _) => BatchArray::Bytes(
                batch
                    .rows()
                    .iter()
                    .map(|row| row.column_bytes(index).map(<[u8]>::to_vec))
                    .collect::<Result<_>>()?,
            ),
            (_, DataType::Float32) => BatchArray::Float32(collate::<f32>(batch, index, column)?),
            (_, DataType::Int64) => BatchArray::Int64(collate::<i64>(batch, index, column)?),
            (kind, data_type) => {
                return Err(Error::SchemaMismatch(format!(
                    "Column '{}' ({kind} {data_type}) cannot be materialized",
                    column.name()
                )))
            }
        };
        out.push(column.name(), array)?;
    }

    trace!(
        rows = batch.len(),
        columns = out.len(),
        bytes = out.size_bytes(),
        elapsed_us = start.elapsed().as_micros(),
        "materialized batch"
    );
    Ok(out)
}

/// Copy one numeric column of every row into a padded tensor
fn collate<T: Element + TensorType>(batch: &Batch, index: usize, column: &ColumnSpec) -> Result<Tensor<T>> {
    let rows = batch.rows();
    let row_shapes = rows
        .iter()
        .map(|row| row.column_shape(index))
        .collect::<Result<Vec<_>>>()?;

    // Static dims are equal across rows; the dynamic one takes the max
    let padded: Vec<usize> = column
        .shape()
        .iter()
        .enumerate()
        .map(|(d, &declared)| {
            row_shapes
                .iter()
                .map(|shape| shape[d])
                .max()
                .unwrap_or_else(|| usize::try_from(declared).unwrap_or(0))
        })
        .collect();

    let mut dims = Vec::with_capacity(padded.len() + 1);
    dims.push(rows.len());
    dims.extend_from_slice(&padded);
    let mut tensor = Tensor::<T>::zeros(dims);

    for (i, (row, shape)) in rows.iter().zip(&row_shapes).enumerate() {
        let values = row.values::<T>(index)?;
        if values.len() != shape.iter().product::<usize>() {
            return Err(Error::ShapeInference(format!(
                "Row {i} of column '{}' holds {} values, shape {shape:?} needs {}",
                column.name(),
                values.len(),
                shape.iter().product::<usize>()
            )));
        }
        let dst = tensor.row_mut(i)?;
        if *shape == padded {
            dst.copy_from_slice(values);
        } else {
            scatter_fortran(values, shape, dst, &padded);
        }
    }

    Ok(tensor)
}

/// Place a column-major block of `src_shape` into a larger column-major block
fn scatter_fortran<T: Copy>(src: &[T], src_shape: &[usize], dst: &mut [T], dst_shape: &[usize]) {
    let mut dst_strides = Vec::with_capacity(dst_shape.len());
    let mut stride = 1;
    for &dim in dst_shape {
        dst_strides.push(stride);
        stride *= dim;
    }

    let mut coord = vec![0; src_shape.len()];
    for &value in src {
        let offset: usize = coord.iter().zip(&dst_strides).map(|(c, s)| c * s).sum();
        dst[offset] = value;

        // First dimension varies fastest
        for (c, &dim) in coord.iter_mut().zip(src_shape) {
            *c += 1;
            if *c < dim {
                break;
            }
            *c = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use slotbatch_core::{BatchMeta, MemoryPool, Row, RowSchema};

    fn batch_of(schema: &Arc<RowSchema>, fill: &[&dyn Fn(&mut Row)]) -> Batch {
        let pool = MemoryPool::new();
        let mut batch = Batch::new(Arc::new(BatchMeta::new(schema.clone())), fill.len());
        for f in fill {
            let mut row = Row::new(schema.clone(), pool.clone());
            f(&mut row);
            batch.push(Arc::new(row)).unwrap();
        }
        batch
    }

    #[test]
    fn test_ragged_ids_padded() {
        let schema = Arc::new(RowSchema::new(vec![ColumnSpec::sparse("s1", &[-1]).unwrap()]).unwrap());
        let batch = batch_of(
            &schema,
            &[
                &|row| row.write_values::<i64>(0, &[10, 20]).unwrap(),
                &|row| row.write_values::<i64>(0, &[5]).unwrap(),
            ],
        );

        let out = materialize(&batch).unwrap();
        let ids = out.get("s1").unwrap().as_i64().unwrap();
        assert_eq!(ids.shape(), &[2, 2]);
        assert_eq!(ids.as_slice(), &[10, 20, 5, 0]);
    }

    #[test]
    fn test_dense_fortran_layout() {
        let schema = Arc::new(RowSchema::new(vec![ColumnSpec::dense("m", &[2, 3]).unwrap()]).unwrap());
        let values: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let batch = batch_of(&schema, &[&|row| row.write_values(0, &values).unwrap()]);

        let out = materialize(&batch).unwrap();
        let m = out.get("m").unwrap().as_f32().unwrap();
        assert_eq!(m.shape(), &[1, 2, 3]);
        assert_eq!(m.strides(), &[6, 1, 2]);
        // Element (r, c) of the row sits at r + 2c
        assert_eq!(m.get(&[0, 1, 2]).unwrap(), 5.0);
        assert_eq!(m.get(&[0, 0, 1]).unwrap(), 2.0);
    }

    #[test]
    fn test_leading_dynamic_dim_padding() {
        let schema = Arc::new(RowSchema::new(vec![ColumnSpec::sparse("p", &[-1, 2]).unwrap()]).unwrap());
        // Row 0 is 1x2: [[1, 2]], row 1 is 2x2 column-major [[3, 5], [4, 6]]
        let batch = batch_of(
            &schema,
            &[
                &|row| row.write_values::<i64>(0, &[1, 2]).unwrap(),
                &|row| row.write_values::<i64>(0, &[3, 4, 5, 6]).unwrap(),
            ],
        );

        let out = materialize(&batch).unwrap();
        let p = out.get("p").unwrap().as_i64().unwrap();
        assert_eq!(p.shape(), &[2, 2, 2]);
        assert_eq!(p.get(&[0, 0, 0]).unwrap(), 1);
        assert_eq!(p.get(&[0, 0, 1]).unwrap(), 2);
        assert_eq!(p.get(&[0, 1, 0]).unwrap(), 0);
        assert_eq!(p.get(&[0, 1, 1]).unwrap(), 0);
        assert_eq!(p.row(1).unwrap(), &[3, 4, 5, 6]);
    }

    #[test]
    fn test_strings_unpadded() {
        let schema = Arc::new(RowSchema::new(vec![ColumnSpec::string("id").unwrap()]).unwrap());
        let batch = batch_of(
            &schema,
            &[
                &|row| row.allocate_column(0, 5).unwrap().copy_from_slice(b"hello"),
                &|row| {
                    row.allocate_column(0, 0).unwrap();
                }
            ],
        );

        let out = materialize(&batch).unwrap();
        let ids = out.get("id").unwrap().as_bytes().unwrap();
        assert_eq!(ids, &[b"hello".to_vec(), Vec::new()]);
    }

    #[test]
    fn test_unpopulated_column_fails() {
        let schema = Arc::new(RowSchema::new(vec![ColumnSpec::dense("f", &[1]).unwrap()]).unwrap());
        let batch = batch_of(&schema, &[&|_row| {}]);
        assert!(materialize(&batch).is_err());
    }
}
