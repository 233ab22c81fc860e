//! Row schema definition for slot-format samples

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type tag for column values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit floating point
    Float32,

    /// 64-bit signed integer
    Int64,

    /// UTF-8 encoded bytes
    #[serde(alias = "string")]
    Utf8,
}

impl DataType {
    /// Get the size of this type in bytes
    pub fn size_bytes(self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Int64 => 8,
            DataType::Utf8 => 1,
        }
    }

    /// Alignment required for arena storage of this type
    pub fn align(self) -> usize {
        self.size_bytes()
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Float32 => write!(f, "Float32"),
            DataType::Int64 => write!(f, "Int64"),
            DataType::Utf8 => write!(f, "Utf8"),
        }
    }
}

/// Rust element types that can be viewed inside a column block
pub trait Element: bytemuck::Pod {
    /// Tag of the column type holding this element
    const DATA_TYPE: DataType;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::Float32;
}

impl Element for i64 {
    const DATA_TYPE: DataType = DataType::Int64;
}

impl Element for u8 {
    const DATA_TYPE: DataType = DataType::Utf8;
}

/// How a column's values are produced and batched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    /// Fixed-shape float values from a `dense` slot
    Dense,

    /// Id lists (or their weights) from a `sparse` slot
    Sparse,

    /// Opaque bytes copied from a whole record field
    String,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKind::Dense => write!(f, "Dense"),
            ColumnKind::Sparse => write!(f, "Sparse"),
            ColumnKind::String => write!(f, "String"),
        }
    }
}

/// Resolve a declared shape against an observed byte size
///
/// A declared dimension of `-1` is inferred as
/// `byte_size / (element_size * product_of_other_dims)`. Fully static shapes
/// are returned as-is.
pub fn infer_shape(declared: &[i64], byte_size: usize, element_size: usize) -> Result<Vec<usize>> {
    let mut dynamic = None;
    let mut static_items: usize = 1;

    for (i, &dim) in declared.iter().enumerate() {
        match dim {
            -1 => {
                if dynamic.is_some() {
                    return Err(Error::ShapeInference(format!(
                        "Shape {declared:?} has more than one dynamic dimension"
                    )));
                }
                dynamic = Some(i);
            }
            d if d > 0 => {
                static_items = usize::try_from(d)
                    .ok()
                    .and_then(|d| static_items.checked_mul(d))
                    .ok_or_else(|| Error::ShapeInference(format!("Shape {declared:?} overflows")))?;
            }
            d => {
                return Err(Error::ShapeInference(format!(
                    "Shape {declared:?} has invalid dimension {d}"
                )));
            }
        }
    }

    let mut shape: Vec<usize> = declared.iter().map(|&d| usize::try_from(d).unwrap_or(0)).collect();

    if let Some(i) = dynamic {
        let item_bytes = static_items * element_size;
        if item_bytes == 0 {
            return Err(Error::ShapeInference(format!(
                "Shape {declared:?} has a zero-sized static part"
            )));
        }
        if byte_size % item_bytes != 0 {
            return Err(Error::ShapeInference(format!(
                "{byte_size} bytes do not divide into items of {item_bytes} bytes for shape {declared:?}"
            )));
        }
        let inferred = byte_size / item_bytes;
        if inferred == 0 {
            return Err(Error::ShapeInference(format!(
                "Inferred a non-positive dimension for shape {declared:?} from {byte_size} bytes"
            )));
        }
        shape[i] = inferred;
    }

    Ok(shape)
}

fn validate_shape(name: &str, shape: &[i64]) -> Result<Option<usize>> {
    let mut dynamic = 0;
    let mut items: usize = 1;
    for &dim in shape {
        if dim == -1 {
            dynamic += 1;
        } else if dim > 0 {
            items = usize::try_from(dim)
                .ok()
                .and_then(|d| items.checked_mul(d))
                .ok_or_else(|| Error::ShapeInference(format!("Column '{name}' shape {shape:?} overflows")))?;
        } else {
            return Err(Error::ShapeInference(format!(
                "Column '{name}' has invalid dimension {dim} in shape {shape:?}"
            )));
        }
    }

    if dynamic > 1 {
        return Err(Error::ShapeInference(format!(
            "Column '{name}' shape {shape:?} has more than one dynamic dimension"
        )));
    }

    Ok((dynamic == 0).then_some(items))
}

/// Declaration of a single column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ColumnDecl", into = "ColumnDecl")]
pub struct ColumnSpec {
    name: String,
    data_type: DataType,
    shape: Vec<i64>,
    kind: ColumnKind,
    item_count: Option<usize>,
}

/// Serialized form of a [`ColumnSpec`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ColumnDecl {
    name: String,
    dtype: DataType,
    #[serde(default)]
    shape: Vec<i64>,
    kind: ColumnKind,
}

impl TryFrom<ColumnDecl> for ColumnSpec {
    type Error = Error;

    fn try_from(decl: ColumnDecl) -> Result<Self> {
        ColumnSpec::new(decl.name, decl.dtype, decl.shape, decl.kind)
    }
}

impl From<ColumnSpec> for ColumnDecl {
    fn from(spec: ColumnSpec) -> Self {
        Self {
            name: spec.name,
            dtype: spec.data_type,
            shape: spec.shape,
            kind: spec.kind,
        }
    }
}

impl ColumnSpec {
    /// Create a new column declaration
    ///
    /// Dense columns must be `Float32` with a fully static shape, sparse
    /// columns `Int64` ids or `Float32` weights, and string columns `Utf8`
    /// without a shape.
    pub fn new(name: impl Into<String>, data_type: DataType, shape: Vec<i64>, kind: ColumnKind) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidArgument("Column name must not be empty".into()));
        }

        let item_count = validate_shape(&name, &shape)?;

        match (kind, data_type) {
            (ColumnKind::Dense, DataType::Float32) => {
                if item_count.is_none() {
                    return Err(Error::SchemaMismatch(format!(
                        "Dense column '{name}' must have a static shape, got {shape:?}"
                    )));
                }
            }
            (ColumnKind::Sparse, DataType::Int64 | DataType::Float32) => {
                if shape.is_empty() {
                    return Err(Error::SchemaMismatch(format!("Sparse column '{name}' needs a shape")));
                }
            }
            (ColumnKind::String, DataType::Utf8) => {
                if !shape.is_empty() {
                    return Err(Error::SchemaMismatch(format!(
                        "String column '{name}' cannot declare a shape"
                    )));
                }
            }
            (kind, data_type) => {
                return Err(Error::SchemaMismatch(format!(
                    "Column '{name}' cannot be {kind} with element type {data_type}"
                )));
            }
        }

        Ok(Self {
            name,
            data_type,
            shape,
            kind,
            item_count,
        })
    }

    /// Dense float column with a static shape
    pub fn dense(name: impl Into<String>, shape: &[i64]) -> Result<Self> {
        Self::new(name, DataType::Float32, shape.to_vec(), ColumnKind::Dense)
    }

    /// Sparse id column; use `-1` in `shape` for ragged lists
    pub fn sparse(name: impl Into<String>, shape: &[i64]) -> Result<Self> {
        Self::new(name, DataType::Int64, shape.to_vec(), ColumnKind::Sparse)
    }

    /// Sparse weight column paired with an id column
    pub fn sparse_weights(name: impl Into<String>, shape: &[i64]) -> Result<Self> {
        Self::new(name, DataType::Float32, shape.to_vec(), ColumnKind::Sparse)
    }

    /// String column
    pub fn string(name: impl Into<String>) -> Result<Self> {
        Self::new(name, DataType::Utf8, Vec::new(), ColumnKind::String)
    }

    /// Get the name of this column
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the element type of this column
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Declared shape, `-1` marking the inferred dimension
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Get the kind of this column
    pub fn kind(&self) -> ColumnKind {
        self.kind
    }

    /// Element count when the shape is fully static
    pub fn item_count(&self) -> Option<usize> {
        self.item_count
    }

    /// Whether the shape contains a dynamic dimension
    pub fn is_dynamic(&self) -> bool {
        self.item_count.is_none()
    }

    /// Concrete per-row shape for a block of `byte_size` bytes
    pub fn resolve_shape(&self, byte_size: usize) -> Result<Vec<usize>> {
        infer_shape(&self.shape, byte_size, self.data_type.size_bytes())
    }
}

impl fmt::Display for ColumnSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {} {:?}", self.name, self.kind, self.data_type, self.shape)
    }
}

/// Ordered set of columns a row conforms to
///
/// The first `original_column_size` columns are the base columns fixed at
/// construction; columns appended by [`extend`](Self::extend) follow them.
/// Declaration order is preserved, so indices never move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSchema {
    columns: Vec<ColumnSpec>,
    original_column_size: usize,
    column_indices: HashMap<String, usize>,
}

fn index_columns(columns: &[ColumnSpec]) -> Result<HashMap<String, usize>> {
    let mut column_indices = HashMap::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        if column_indices.insert(column.name.clone(), i).is_some() {
            return Err(Error::SchemaMismatch(format!("Duplicate column name: {}", column.name)));
        }
    }
    Ok(column_indices)
}

impl RowSchema {
    /// Create a schema whose columns are all base columns
    pub fn new(columns: Vec<ColumnSpec>) -> Result<Self> {
        let column_indices = index_columns(&columns)?;
        Ok(Self {
            original_column_size: columns.len(),
            columns,
            column_indices,
        })
    }

    /// New schema with `additional` columns appended after the existing ones
    pub fn extend(&self, additional: Vec<ColumnSpec>) -> Result<Self> {
        let mut columns = self.columns.clone();
        columns.extend(additional);
        let column_indices = index_columns(&columns)?;

        Ok(Self {
            columns,
            original_column_size: self.original_column_size,
            column_indices,
        })
    }

    /// Get all columns in this schema
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Columns fixed at construction
    pub fn base_columns(&self) -> &[ColumnSpec] {
        &self.columns[..self.original_column_size]
    }

    /// Columns appended by extension
    pub fn extended_columns(&self) -> &[ColumnSpec] {
        &self.columns[self.original_column_size..]
    }

    /// Number of base columns
    pub fn original_column_size(&self) -> usize {
        self.original_column_size
    }

    /// Get a column by index
    pub fn column(&self, index: usize) -> Result<&ColumnSpec> {
        self.columns.get(index).ok_or(Error::IndexOutOfBounds {
            index,
            len: self.columns.len(),
        })
    }

    /// Get a column by name
    pub fn column_by_name(&self, name: &str) -> Result<&ColumnSpec> {
        let index = self.index_of(name)?;
        Ok(&self.columns[index])
    }

    /// Get the index of a column by name
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.position(name)
            .ok_or_else(|| Error::SchemaMismatch(format!("Column not found: {name}")))
    }

    /// Index of a column by name, if present
    pub fn position(&self, name: &str) -> Option<usize> {
        self.column_indices.get(name).copied()
    }

    /// Get the number of columns in this schema
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if this schema is empty
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Whether `other` keeps this schema's columns as a prefix
    pub fn is_prefix_of(&self, other: &RowSchema) -> bool {
        self.original_column_size == other.original_column_size
            && other.columns.len() >= self.columns.len()
            && other.columns[..self.columns.len()] == self.columns[..]
    }
}

impl fmt::Display for RowSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "RowSchema: {} columns ({} base)",
            self.columns.len(),
            self.original_column_size
        )?;
        for column in &self.columns {
            writeln!(f, "  {column}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(&[2, 3], 24, 4 => vec![2, 3]; "static shape")]
    #[test_case(&[-1], 16, 8 => vec![2]; "ragged ids")]
    #[test_case(&[-1, 4], 64, 4 => vec![4, 4]; "leading dynamic")]
    #[test_case(&[3, -1], 24, 4 => vec![3, 2]; "trailing dynamic")]
    fn test_infer_shape(declared: &[i64], byte_size: usize, elem: usize) -> Vec<usize> {
        infer_shape(declared, byte_size, elem).unwrap()
    }

    #[test_case(&[-1, -1], 16, 4; "two dynamic dims")]
    #[test_case(&[-1], 0, 8; "empty ragged")]
    #[test_case(&[-1, 3], 16, 4; "not divisible")]
    #[test_case(&[0, -1], 16, 4; "zero dim")]
    fn test_infer_shape_rejects(declared: &[i64], byte_size: usize, elem: usize) {
        let err = infer_shape(declared, byte_size, elem).unwrap_err();
        assert!(matches!(err, Error::ShapeInference(_)));
    }

    #[test]
    fn test_column_spec_rejects_two_dynamic_dims() {
        let err = ColumnSpec::sparse("s", &[-1, -1]).unwrap_err();
        assert!(matches!(err, Error::ShapeInference(_)));
    }

    #[test]
    fn test_column_spec_kind_pairing() {
        assert!(ColumnSpec::dense("d", &[-1]).is_err());
        assert!(ColumnSpec::new("d", DataType::Int64, vec![2], ColumnKind::Dense).is_err());
        assert!(ColumnSpec::new("s", DataType::Utf8, vec![2], ColumnKind::Sparse).is_err());
        assert!(ColumnSpec::new("t", DataType::Utf8, vec![1], ColumnKind::String).is_err());

        let dense = ColumnSpec::dense("d", &[2, 3]).unwrap();
        assert_eq!(dense.item_count(), Some(6));

        let ragged = ColumnSpec::sparse("s", &[-1]).unwrap();
        assert!(ragged.is_dynamic());
    }

    #[test]
    fn test_column_spec_from_json() {
        let spec: ColumnSpec =
            serde_json::from_str(r#"{"name": "s1", "dtype": "int64", "shape": [-1], "kind": "sparse"}"#).unwrap();
        assert_eq!(spec.name(), "s1");
        assert_eq!(spec.kind(), ColumnKind::Sparse);
        assert_eq!(spec.item_count(), None);

        let bad = serde_json::from_str::<ColumnSpec>(
            r#"{"name": "d", "dtype": "float32", "shape": [-1, -1], "kind": "dense"}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_schema_extend_keeps_indices() {
        let schema = RowSchema::new(vec![
            ColumnSpec::string("id").unwrap(),
            ColumnSpec::dense("f1", &[2]).unwrap(),
            ColumnSpec::sparse("s1", &[-1]).unwrap(),
        ])
        .unwrap();

        let extended = schema.extend(vec![ColumnSpec::dense("extra", &[1]).unwrap()]).unwrap();

        assert_eq!(extended.original_column_size(), 3);
        assert_eq!(extended.len(), 4);
        for name in ["id", "f1", "s1"] {
            assert_eq!(schema.index_of(name).unwrap(), extended.index_of(name).unwrap());
        }
        assert_eq!(extended.index_of("extra").unwrap(), 3);
        assert_eq!(extended.extended_columns().len(), 1);
        assert!(schema.is_prefix_of(&extended));
        assert!(!extended.is_prefix_of(&schema));
    }

    #[test]
    fn test_schema_rejects_duplicates() {
        let schema = RowSchema::new(vec![ColumnSpec::dense("f1", &[1]).unwrap()]).unwrap();
        assert!(schema.extend(vec![ColumnSpec::dense("f1", &[1]).unwrap()]).is_err());
    }

    #[test]
    fn test_column_lookup_errors() {
        let schema = RowSchema::new(vec![ColumnSpec::dense("f1", &[1]).unwrap()]).unwrap();
        assert!(matches!(schema.column(3), Err(Error::IndexOutOfBounds { index: 3, len: 1 })));
        assert!(matches!(schema.index_of("nope"), Err(Error::SchemaMismatch(_))));
    }

    proptest! {
        #[test]
        fn prop_infer_recovers_dynamic_dim(
            dims in proptest::collection::vec(1i64..5, 0..3),
            pos in 0usize..3,
            count in 1usize..50,
        ) {
            let pos = pos.min(dims.len());
            let mut declared = dims.clone();
            declared.insert(pos, -1);

            let static_items: usize = dims.iter().map(|&d| d as usize).product();
            let byte_size = static_items * count * 8;

            let shape = infer_shape(&declared, byte_size, 8).unwrap();
            prop_assert_eq!(shape[pos], count);
            prop_assert_eq!(shape.iter().product::<usize>() * 8, byte_size);
        }
    }
}
