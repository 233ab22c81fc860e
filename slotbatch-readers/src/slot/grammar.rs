//! Slot grammar: one text record into one row
//!
//! A record is a sequence of `field_delim`-separated fields matched by
//! position against the configured format. The `dense` and `sparse` fields
//! carry `slot_delim`-separated slots of the form `name@v1,v2,...`; sparse
//! values are `id:weight` pairs.

use std::mem;
use std::str::{self, FromStr};
use std::sync::Arc;

use slotbatch_core::error::{Error, Result};
use slotbatch_core::{ColumnKind, ColumnSpec, DataType, Row, RowSchema};
use tracing::trace;

use super::options::{Delimiters, ParserOptions, SparseWeights, DENSE_FIELD, SPARSE_FIELD};

/// Role of one format field
#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldRole {
    Dense,
    Sparse,
    Column(usize),
    External(String),
    Skip,
}

/// Compiled parsing rules for one schema and option set
#[derive(Debug)]
pub struct SlotGrammar {
    /// Schema rows are parsed against
    schema: Arc<RowSchema>,

    /// Role of each format field, by position
    fields: Vec<FieldRole>,

    /// Weight column paired with each column, by column index
    weight_columns: Vec<Option<usize>>,

    /// Byte delimiters
    delims: Delimiters,

    /// Reused buffers for sparse slots
    scratch: Scratch,
}

#[derive(Debug, Default)]
struct Scratch {
    ids: Vec<i64>,
    weights: Vec<f32>,
}

impl SlotGrammar {
    /// Compile the grammar for `schema`
    pub fn new(schema: Arc<RowSchema>, options: &ParserOptions) -> Result<Self> {
        options.validate()?;
        let delims = options.delimiters()?;

        let fields = options
            .format_fields()
            .into_iter()
            .map(|name| Self::field_role(&schema, options, name))
            .collect::<Result<Vec<_>>>()?;

        let weight_columns = Self::pair_weight_columns(&schema, &options.sparse_weights)?;

        Ok(Self {
            schema,
            fields,
            weight_columns,
            delims,
            scratch: Scratch::default(),
        })
    }

    fn field_role(schema: &RowSchema, options: &ParserOptions, name: &str) -> Result<FieldRole> {
        if name == DENSE_FIELD {
            return Ok(FieldRole::Dense);
        }
        if name == SPARSE_FIELD {
            return Ok(FieldRole::Sparse);
        }
        if let Some(index) = schema.position(name) {
            let column = &schema.columns()[index];
            if column.kind() != ColumnKind::String {
                return Err(Error::SchemaMismatch(format!(
                    "Format field '{name}' names {} column; only string columns are filled from whole fields",
                    column.kind()
                )));
            }
            return Ok(FieldRole::Column(index));
        }
        if options.external_keys.iter().any(|key| key == name) {
            return Ok(FieldRole::External(name.to_string()));
        }
        Ok(FieldRole::Skip)
    }

    fn pair_weight_columns(schema: &RowSchema, mode: &SparseWeights) -> Result<Vec<Option<usize>>> {
        let mut paired = vec![None; schema.len()];
        let mut is_companion = vec![false; schema.len()];

        if let SparseWeights::Retain { suffix } = mode {
            for (index, column) in schema.base_columns().iter().enumerate() {
                if column.kind() != ColumnKind::Sparse || column.data_type() != DataType::Int64 {
                    continue;
                }
                let weight_name = format!("{}{suffix}", column.name());
                let weight_index = schema.position(&weight_name).ok_or_else(|| {
                    Error::SchemaMismatch(format!(
                        "Sparse column '{}' has no weight column '{weight_name}'",
                        column.name()
                    ))
                })?;
                let weight = &schema.columns()[weight_index];
                if weight.kind() != ColumnKind::Sparse
                    || weight.data_type() != DataType::Float32
                    || weight.shape() != column.shape()
                {
                    return Err(Error::SchemaMismatch(format!(
                        "Weight column '{weight_name}' must be sparse Float32 with shape {:?}",
                        column.shape()
                    )));
                }
                paired[index] = Some(weight_index);
                is_companion[weight_index] = true;
            }
        }

        // A weight column nobody fills would fail every record
        for (index, column) in schema.base_columns().iter().enumerate() {
            if column.kind() == ColumnKind::Sparse && column.data_type() == DataType::Float32 && !is_companion[index] {
                return Err(Error::SchemaMismatch(format!(
                    "Sparse weight column '{}' is not paired with an id column",
                    column.name()
                )));
            }
        }

        Ok(paired)
    }

    /// Schema rows are parsed against
    pub fn schema(&self) -> &Arc<RowSchema> {
        &self.schema
    }

    /// Parse one record into `row`
    ///
    /// `line` is the 1-based line number used in error reports.
    pub fn parse_record(&mut self, record: &[u8], line: u64, row: &mut Row) -> Result<()> {
        let mut scratch = mem::take(&mut self.scratch);
        let result = self.parse_fields(record, line, row, &mut scratch);
        self.scratch = scratch;
        result
    }

    fn parse_fields(&self, record: &[u8], line: u64, row: &mut Row, scratch: &mut Scratch) -> Result<()> {
        let field_delim = self.delims.field;
        let mut values = record.split(|&b| b == field_delim);

        // Surplus fields beyond the format are ignored
        for (i, role) in self.fields.iter().enumerate() {
            let Some(value) = values.next() else {
                break;
            };
            match role {
                FieldRole::Dense => self.parse_dense(value, line, row)?,
                FieldRole::Sparse => self.parse_sparse(value, line, row, scratch)?,
                FieldRole::Column(index) => {
                    row.allocate_column(*index, value.len())?.copy_from_slice(value);
                }
                FieldRole::External(key) => {
                    let text = str::from_utf8(value)
                        .map_err(|_| Error::format(line, format!("field '{key}' is not valid UTF-8")))?;
                    row.set_external(key.clone(), text);
                }
                FieldRole::Skip => trace!(line, field = i, "skipping unregistered field"),
            }
        }

        if let Some(name) = row.missing_base_column() {
            return Err(Error::format(line, format!("column '{name}' missing from record")));
        }
        Ok(())
    }

    /// Split a field into `(slot index, values)` pairs, skipping unknown slots
    fn slots<'a>(&self, field: &'a [u8], line: u64) -> Result<Vec<(usize, &'a [u8])>> {
        let mut slots = Vec::new();
        for group in field.split(|&b| b == self.delims.slot) {
            if group.is_empty() {
                continue;
            }
            let at = group
                .iter()
                .position(|&b| b == self.delims.slot_name)
                .ok_or_else(|| Error::format(line, "slot without a name separator"))?;
            let name = str::from_utf8(&group[..at])
                .map_err(|_| Error::format(line, "slot name is not valid UTF-8"))?;

            match self.schema.position(name) {
                Some(index) => slots.push((index, &group[at + 1..])),
                None => trace!(line, slot = name, "skipping unknown slot"),
            }
        }
        Ok(slots)
    }

    fn claim(&self, index: usize, line: u64, row: &Row) -> Result<&ColumnSpec> {
        let column = self.schema.column(index)?;
        if row.block(index)?.is_set() {
            return Err(Error::format(
                line,
                format!("slot '{}' appears more than once", column.name()),
            ));
        }
        Ok(column)
    }

    fn parse_dense(&self, field: &[u8], line: u64, row: &mut Row) -> Result<()> {
        for (index, values) in self.slots(field, line)? {
            let column = self.claim(index, line, row)?;
            let item_count = match (column.kind(), column.item_count()) {
                (ColumnKind::Dense, Some(n)) if n > 0 => n,
                _ => {
                    return Err(Error::SchemaMismatch(format!(
                        "Dense slot '{}' maps to {} column",
                        column.name(),
                        column.kind()
                    )))
                }
            };

            let out = row.allocate_values::<f32>(index, item_count)?;
            // Short slots stay zero-filled, surplus values are dropped
            for (dst, token) in out.iter_mut().zip(tokens(values, self.delims.value)) {
                *dst = parse_number(token, line)?;
            }
        }
        Ok(())
    }

    fn parse_sparse(&self, field: &[u8], line: u64, row: &mut Row, scratch: &mut Scratch) -> Result<()> {
        for (index, values) in self.slots(field, line)? {
            let column = self.claim(index, line, row)?;
            if column.kind() != ColumnKind::Sparse || column.data_type() != DataType::Int64 {
                return Err(Error::SchemaMismatch(format!(
                    "Sparse slot '{}' maps to {} {} column",
                    column.name(),
                    column.kind(),
                    column.data_type()
                )));
            }
            let name = column.name().to_string();
            let item_count = column.item_count();
            let weight_index = self.weight_columns[index];

            scratch.ids.clear();
            scratch.weights.clear();
            for token in tokens(values, self.delims.value) {
                let (id, weight) = match token.iter().position(|&b| b == self.delims.id) {
                    Some(p) => (&token[..p], Some(&token[p + 1..])),
                    None => (token, None),
                };
                scratch.ids.push(parse_number(id, line)?);
                scratch.weights.push(match weight {
                    Some(w) => parse_number(w, line)?,
                    None => 1.0,
                });
            }

            let count = match item_count {
                Some(n) => n,
                None if scratch.ids.is_empty() => {
                    return Err(Error::format(line, format!("ragged slot '{name}' has no ids")));
                }
                None => {
                    // Reject counts the declared shape cannot hold
                    self.schema.columns()[index].resolve_shape(scratch.ids.len() * DataType::Int64.size_bytes())?;
                    scratch.ids.len()
                }
            };

            let out = row.allocate_values::<i64>(index, count)?;
            let n = count.min(scratch.ids.len());
            out[..n].copy_from_slice(&scratch.ids[..n]);

            if let Some(weight_index) = weight_index {
                let out = row.allocate_values::<f32>(weight_index, count)?;
                out[..n].copy_from_slice(&scratch.weights[..n]);
            }
        }
        Ok(())
    }
}

/// Values of a slot; an empty slot has none
fn tokens(values: &[u8], value_delim: u8) -> impl Iterator<Item = &[u8]> {
    let empty = values.is_empty();
    values.split(move |&b| b == value_delim).filter(move |_| !empty)
}

fn parse_number<T: FromStr>(token: &[u8], line: u64) -> Result<T> {
    str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            Error::format(
                line,
                format!("invalid number '{}'", String::from_utf8_lossy(token)),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotbatch_core::{ErrorKind, MemoryPool};
    use test_case::test_case;

    fn schema(columns: Vec<ColumnSpec>) -> Arc<RowSchema> {
        Arc::new(RowSchema::new(columns).unwrap())
    }

    fn parse(schema: &Arc<RowSchema>, options: &ParserOptions, record: &str) -> Result<Row> {
        let mut grammar = SlotGrammar::new(schema.clone(), options)?;
        let mut row = Row::new(schema.clone(), MemoryPool::new());
        grammar.parse_record(record.as_bytes(), 1, &mut row)?;
        Ok(row)
    }

    #[test]
    fn test_dense_round_trip() {
        let schema = schema(vec![
            ColumnSpec::dense("f1", &[2]).unwrap(),
            ColumnSpec::dense("f2", &[1]).unwrap(),
        ]);
        let row = parse(&schema, &ParserOptions::with_format("dense"), "f1@1.0,2.0;f2@3.0").unwrap();

        assert_eq!(row.dense("f1").unwrap(), &[1.0, 2.0]);
        assert_eq!(row.dense("f2").unwrap(), &[3.0]);
    }

    #[test_case("f@1.5", &[1.5, 0.0, 0.0]; "short slot zero filled")]
    #[test_case("f@1,2,3,4,5", &[1.0, 2.0, 3.0]; "long slot truncated")]
    #[test_case("f@", &[0.0, 0.0, 0.0]; "empty slot")]
    fn test_dense_padding(record: &str, expected: &[f32]) {
        let schema = schema(vec![ColumnSpec::dense("f", &[3]).unwrap()]);
        let row = parse(&schema, &ParserOptions::with_format("dense"), record).unwrap();
        assert_eq!(row.dense("f").unwrap(), expected);
    }

    #[test]
    fn test_sparse_ragged_ids() {
        let schema = schema(vec![ColumnSpec::sparse("s1", &[-1]).unwrap()]);
        let row = parse(&schema, &ParserOptions::with_format("sparse"), "s1@10:0.1,20:0.2").unwrap();

        assert_eq!(row.sparse_ids("s1").unwrap(), &[10, 20]);
        assert_eq!(row.column_shape(0).unwrap(), vec![2]);
    }

    #[test]
    fn test_sparse_static_pads_and_truncates() {
        let schema = schema(vec![
            ColumnSpec::sparse("a", &[3]).unwrap(),
            ColumnSpec::sparse("b", &[2]).unwrap(),
        ]);
        let row = parse(&schema, &ParserOptions::with_format("sparse"), "a@7:1.0;b@1:1,2:1,3:1").unwrap();

        assert_eq!(row.sparse_ids("a").unwrap(), &[7, 0, 0]);
        assert_eq!(row.sparse_ids("b").unwrap(), &[1, 2]);
    }

    #[test]
    fn test_sparse_weights_retained() {
        let schema = schema(vec![
            ColumnSpec::sparse("s", &[-1]).unwrap(),
            ColumnSpec::sparse_weights("s_weight", &[-1]).unwrap(),
        ]);
        let options = ParserOptions {
            sparse_weights: SparseWeights::retain(),
            ..ParserOptions::with_format("sparse")
        };
        let row = parse(&schema, &options, "s@10:0.5,11").unwrap();

        assert_eq!(row.sparse_ids("s").unwrap(), &[10, 11]);
        assert_eq!(row.sparse_weights("s_weight").unwrap(), &[0.5, 1.0]);
    }

    #[test]
    fn test_retain_requires_weight_column() {
        let schema = schema(vec![ColumnSpec::sparse("s", &[-1]).unwrap()]);
        let options = ParserOptions {
            sparse_weights: SparseWeights::retain(),
            ..ParserOptions::with_format("sparse")
        };
        let err = SlotGrammar::new(schema, &options).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    }

    #[test]
    fn test_fields_strings_and_externals() {
        let schema = schema(vec![
            ColumnSpec::string("sample_id").unwrap(),
            ColumnSpec::dense("f", &[1]).unwrap(),
        ]);
        let options = ParserOptions {
            external_keys: vec!["label".into()],
            ..ParserOptions::with_format("sample_id|group|dense|label")
        };
        let row = parse(&schema, &options, "abc|g7|f@2.5;unknown@1,2|1|surplus").unwrap();

        assert_eq!(row.string("sample_id").unwrap(), "abc");
        assert_eq!(row.dense("f").unwrap(), &[2.5]);
        assert_eq!(row.external("label"), Some("1"));
        assert_eq!(row.external("group"), None);
    }

    #[test_case("s@", ErrorKind::FormatViolation; "empty ragged slot")]
    #[test_case("s@x:1", ErrorKind::FormatViolation; "bad id")]
    #[test_case("s@1:y", ErrorKind::FormatViolation; "bad weight")]
    #[test_case("s1,2", ErrorKind::FormatViolation; "missing name separator")]
    #[test_case("s@1;s@2", ErrorKind::FormatViolation; "duplicate slot")]
    #[test_case("other@1", ErrorKind::FormatViolation; "missing base column")]
    #[test_case("d@1", ErrorKind::SchemaMismatch; "dense column in sparse field")]
    fn test_sparse_errors(record: &str, kind: ErrorKind) {
        let schema = schema(vec![
            ColumnSpec::sparse("s", &[-1]).unwrap(),
            ColumnSpec::dense("d", &[1]).unwrap(),
        ]);
        // `d` only ever arrives through a dense field
        let options = ParserOptions::with_format("sparse");
        let err = parse(&schema, &options, record).unwrap_err();
        assert_eq!(err.kind(), kind);
    }

    #[test]
    fn test_dense_slot_mapped_to_sparse_column() {
        let schema = schema(vec![ColumnSpec::sparse("s", &[-1]).unwrap()]);
        let err = parse(&schema, &ParserOptions::with_format("dense"), "s@1.0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    }

    #[test]
    fn test_non_string_column_as_field_rejected() {
        let schema = schema(vec![ColumnSpec::dense("f", &[1]).unwrap()]);
        assert!(SlotGrammar::new(schema, &ParserOptions::with_format("f")).is_err());
    }

    #[test]
    fn test_reparse_is_byte_identical() {
        let schema = schema(vec![
            ColumnSpec::string("id").unwrap(),
            ColumnSpec::dense("f", &[4]).unwrap(),
            ColumnSpec::sparse("s", &[-1]).unwrap(),
        ]);
        let options = ParserOptions::with_format("id|dense|sparse");
        let record = "row-17|f@0.5,1.5,2.5|s@1:1,2:1,3:1,4:1,5:1";

        let a = parse(&schema, &options, record).unwrap();
        let b = parse(&schema, &options, record).unwrap();
        for index in 0..schema.len() {
            assert_eq!(a.column_bytes(index).unwrap(), b.column_bytes(index).unwrap());
        }
    }
}
