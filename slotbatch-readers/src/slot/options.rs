//! Configuration for the slot-format record parser

use serde::{Deserialize, Serialize};

use slotbatch_core::error::{Error, Result};

use crate::chunk::DEFAULT_CHUNK_SIZE;

/// Format field holding dense slots
pub const DENSE_FIELD: &str = "dense";

/// Format field holding sparse slots
pub const SPARSE_FIELD: &str = "sparse";

/// Default suffix naming the weight column paired with a sparse id column
pub const DEFAULT_WEIGHT_SUFFIX: &str = "_weight";

/// What happens to the weight attached to each sparse id
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SparseWeights {
    /// Validate each weight, then drop it
    #[default]
    Discard,

    /// Store weights in the sparse weight column named `<ids column><suffix>`
    Retain {
        /// Suffix appended to the id column name
        suffix: String,
    },
}

impl SparseWeights {
    /// Retain weights using [`DEFAULT_WEIGHT_SUFFIX`]
    pub fn retain() -> Self {
        SparseWeights::Retain {
            suffix: DEFAULT_WEIGHT_SUFFIX.to_string(),
        }
    }
}

/// Options for slot-format parsing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserOptions {
    /// Field names of a record, separated by `field_delim`
    pub format: String,

    /// Separator between record fields
    pub field_delim: char,

    /// Separator between slots in a dense or sparse field
    pub slot_delim: char,

    /// Separator between values within a slot
    pub value_delim: char,

    /// Separator between a sparse id and its weight
    pub id_delim: char,

    /// Separator between a slot name and its values
    pub slot_name_delim: char,

    /// Fields kept as external side-table entries
    pub external_keys: Vec<String>,

    /// Handling of sparse weights
    pub sparse_weights: SparseWeights,

    /// Whether to drop a trailing `\r` from each line
    pub strip_carriage_return: bool,

    /// Whether to skip empty lines
    pub skip_empty_lines: bool,

    /// Read size when pulling from files and streams
    pub chunk_size: usize,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            format: String::new(),
            field_delim: '|',
            slot_delim: ';',
            value_delim: ',',
            id_delim: ':',
            slot_name_delim: '@',
            external_keys: Vec::new(),
            sparse_weights: SparseWeights::Discard,
            strip_carriage_return: true,
            skip_empty_lines: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Delimiters as bytes, after validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Delimiters {
    pub field: u8,
    pub slot: u8,
    pub value: u8,
    pub id: u8,
    pub slot_name: u8,
}

impl ParserOptions {
    /// Options for the given record format, other settings default
    pub fn with_format(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            ..Self::default()
        }
    }

    /// Field names of the record format
    pub fn format_fields(&self) -> Vec<&str> {
        self.format.split(self.field_delim).collect()
    }

    /// Check the options and return the delimiters as bytes
    pub(crate) fn delimiters(&self) -> Result<Delimiters> {
        let pairs = [
            ("field_delim", self.field_delim),
            ("slot_delim", self.slot_delim),
            ("value_delim", self.value_delim),
            ("id_delim", self.id_delim),
            ("slot_name_delim", self.slot_name_delim),
        ];

        let mut bytes = [0u8; 5];
        for (i, (name, delim)) in pairs.iter().enumerate() {
            if !delim.is_ascii() || *delim == '\n' || *delim == '\r' {
                return Err(Error::InvalidArgument(format!(
                    "{name} must be a single-byte ASCII character other than a line break, got {delim:?}"
                )));
            }
            // Checked ASCII above
            #[allow(clippy::cast_possible_truncation)]
            let byte = *delim as u8;
            if let Some(j) = bytes[..i].iter().position(|&b| b == byte) {
                return Err(Error::InvalidArgument(format!(
                    "{name} and {} are both {delim:?}",
                    pairs[j].0
                )));
            }
            bytes[i] = byte;
        }

        Ok(Delimiters {
            field: bytes[0],
            slot: bytes[1],
            value: bytes[2],
            id: bytes[3],
            slot_name: bytes[4],
        })
    }

    /// Check that the options describe a usable parser
    pub fn validate(&self) -> Result<()> {
        self.delimiters()?;
        if self.format.is_empty() {
            return Err(Error::InvalidArgument("Record format must not be empty".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidArgument("Chunk size must be positive".into()));
        }
        if let SparseWeights::Retain { suffix } = &self.sparse_weights {
            if suffix.is_empty() {
                return Err(Error::InvalidArgument("Sparse weight suffix must not be empty".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_default_delimiters() {
        let options = ParserOptions::with_format("id|dense|sparse");
        options.validate().unwrap();

        let delims = options.delimiters().unwrap();
        assert_eq!(delims.field, b'|');
        assert_eq!(delims.slot_name, b'@');
        assert_eq!(options.format_fields(), vec!["id", "dense", "sparse"]);
    }

    #[test_case(ParserOptions { slot_delim: '|', ..ParserOptions::with_format("a") }; "duplicate delimiter")]
    #[test_case(ParserOptions { value_delim: 'é', ..ParserOptions::with_format("a") }; "non ascii")]
    #[test_case(ParserOptions { id_delim: '\n', ..ParserOptions::with_format("a") }; "line break")]
    #[test_case(ParserOptions::default(); "empty format")]
    #[test_case(ParserOptions { chunk_size: 0, ..ParserOptions::with_format("a") }; "zero chunk")]
    fn test_invalid_options(options: ParserOptions) {
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_options_from_json() {
        let options: ParserOptions = serde_json::from_str(
            r#"{
                "format": "id,dense",
                "field_delim": ",",
                "slot_delim": "|",
                "value_delim": "/",
                "external_keys": ["id"],
                "sparse_weights": {"mode": "retain", "suffix": "_w"}
            }"#,
        )
        .unwrap();

        options.validate().unwrap();
        assert_eq!(options.format_fields(), vec!["id", "dense"]);
        assert_eq!(options.sparse_weights, SparseWeights::Retain { suffix: "_w".into() });
        assert_eq!(options.value_delim, '/');
        assert_eq!(options.id_delim, ':');
    }
}
