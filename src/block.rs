//! Columnar blocks and the block codec.
//!
//! A [`Block`] is the unit of data exchanged between the connection and the execution
//! engine: result sets, insert payloads, totals, extremes, log batches and profile
//! events all travel as blocks. On the wire a block is carried as an opaque payload
//! inside a packet; the payload is produced by [`encode_block`] and consumed by
//! [`decode_block`], optionally LZ4-compressed depending on the query's negotiated
//! [`Compression`].
//!
//! A block with zero rows is "empty". Clients terminate insert, scalar and external
//! table streams by sending an empty block.
use std::fmt;

use bincode::{Decode, Encode, decode_from_slice, encode_to_vec};
use thiserror::Error;

use crate::protocol::{MAX_PACKET_SIZE, limited_wire_config, wire_config};

/// Errors produced while building, validating or coding blocks.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("column '{name}' has {rows} rows, expected {expected}")]
    RowCountMismatch {
        name: String,
        rows: usize,
        expected: usize,
    },

    #[error("block structure mismatch: expected {expected} columns, got {actual}")]
    ColumnCount { expected: usize, actual: usize },

    #[error("block structure mismatch at column #{position}: expected '{expected}', got '{actual}'")]
    ColumnMismatch {
        position: usize,
        expected: String,
        actual: String,
    },

    #[error("failed to encode block: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode block: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("failed to decompress block: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("compressed block claims {0} bytes, more than the packet limit")]
    TooLarge(usize),
}

/// Compression mode of block payloads for one query.
#[derive(Debug, Default, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum Compression {
    #[default]
    Disable,
    Enable,
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum DataType {
    UInt64,
    Int64,
    Float64,
    String,
}

impl DataType {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "UInt64" | "UInt32" | "UInt16" | "UInt8" => Some(DataType::UInt64),
            "Int64" | "Int32" | "Int16" | "Int8" => Some(DataType::Int64),
            "Float64" | "Float32" => Some(DataType::Float64),
            "String" => Some(DataType::String),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::UInt64 => "UInt64",
            DataType::Int64 => "Int64",
            DataType::Float64 => "Float64",
            DataType::String => "String",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub enum Column {
    UInt64(Vec<u64>),
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    String(Vec<String>),
}

impl Column {
    pub fn empty(data_type: DataType) -> Self {
        match data_type {
            DataType::UInt64 => Column::UInt64(Vec::new()),
            DataType::Int64 => Column::Int64(Vec::new()),
            DataType::Float64 => Column::Float64(Vec::new()),
            DataType::String => Column::String(Vec::new()),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Column::UInt64(_) => DataType::UInt64,
            Column::Int64(_) => DataType::Int64,
            Column::Float64(_) => DataType::Float64,
            Column::String(_) => DataType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::UInt64(v) => v.len(),
            Column::Int64(v) => v.len(),
            Column::Float64(v) => v.len(),
            Column::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate in-memory size, used for progress and profile accounting.
    pub fn byte_size(&self) -> usize {
        match self {
            Column::UInt64(v) => v.len() * size_of::<u64>(),
            Column::Int64(v) => v.len() * size_of::<i64>(),
            Column::Float64(v) => v.len() * size_of::<f64>(),
            Column::String(v) => v.iter().map(|s| s.len() + size_of::<u64>()).sum(),
        }
    }

    /// Appends `other` to this column. Both columns must share a type.
    fn extend(&mut self, other: &Column) -> bool {
        match (self, other) {
            (Column::UInt64(a), Column::UInt64(b)) => a.extend_from_slice(b),
            (Column::Int64(a), Column::Int64(b)) => a.extend_from_slice(b),
            (Column::Float64(a), Column::Float64(b)) => a.extend_from_slice(b),
            (Column::String(a), Column::String(b)) => a.extend_from_slice(b),
            _ => return false,
        }
        true
    }

    pub fn slice(&self, start: usize, end: usize) -> Column {
        match self {
            Column::UInt64(v) => Column::UInt64(v[start..end].to_vec()),
            Column::Int64(v) => Column::Int64(v[start..end].to_vec()),
            Column::Float64(v) => Column::Float64(v[start..end].to_vec()),
            Column::String(v) => Column::String(v[start..end].to_vec()),
        }
    }

    /// Renders a single value for display purposes.
    pub fn value_string(&self, row: usize) -> Option<String> {
        match self {
            Column::UInt64(v) => v.get(row).map(|x| x.to_string()),
            Column::Int64(v) => v.get(row).map(|x| x.to_string()),
            Column::Float64(v) => v.get(row).map(|x| x.to_string()),
            Column::String(v) => v.get(row).cloned(),
        }
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialEq)]
pub struct NamedColumn {
    pub name: String,
    pub column: Column,
}

#[derive(Debug, Default, Clone, Encode, Decode, PartialEq)]
pub struct Block {
    columns: Vec<NamedColumn>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a block, checking every column has the same number of rows.
    pub fn from_columns(columns: Vec<NamedColumn>) -> Result<Self, BlockError> {
        if let Some(first) = columns.first() {
            let expected = first.column.len();
            if let Some(bad) = columns.iter().find(|c| c.column.len() != expected) {
                return Err(BlockError::RowCountMismatch {
                    name: bad.name.clone(),
                    rows: bad.column.len(),
                    expected,
                });
            }
        }
        Ok(Self { columns })
    }

    pub fn with_column(mut self, name: &str, column: Column) -> Result<Self, BlockError> {
        if let Some(first) = self.columns.first() {
            if first.column.len() != column.len() {
                return Err(BlockError::RowCountMismatch {
                    name: name.to_string(),
                    rows: column.len(),
                    expected: first.column.len(),
                });
            }
        }
        self.columns.push(NamedColumn {
            name: name.to_string(),
            column,
        });
        Ok(self)
    }

    pub fn columns(&self) -> &[NamedColumn] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.column)
    }

    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.column.len())
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    pub fn byte_size(&self) -> usize {
        self.columns.iter().map(|c| c.column.byte_size()).sum()
    }

    /// Returns a zero-row block with the same structure.
    pub fn header(&self) -> Block {
        Block {
            columns: self
                .columns
                .iter()
                .map(|c| NamedColumn {
                    name: c.name.clone(),
                    column: Column::empty(c.column.data_type()),
                })
                .collect(),
        }
    }

    /// Checks that this block has exactly the structure of `expected`: same column
    /// count, and at each position the same name and type.
    pub fn check_header(&self, expected: &Block) -> Result<(), BlockError> {
        if self.columns.len() != expected.columns.len() {
            return Err(BlockError::ColumnCount {
                expected: expected.columns.len(),
                actual: self.columns.len(),
            });
        }

        for (position, (actual, wanted)) in self.columns.iter().zip(&expected.columns).enumerate()
        {
            if actual.name != wanted.name || actual.column.data_type() != wanted.column.data_type()
            {
                return Err(BlockError::ColumnMismatch {
                    position,
                    expected: format!("{} {}", wanted.name, wanted.column.data_type()),
                    actual: format!("{} {}", actual.name, actual.column.data_type()),
                });
            }
        }
        Ok(())
    }

    /// Appends the rows of `other`. An empty, column-less block adopts the structure
    /// of `other`.
    pub fn append(&mut self, other: &Block) -> Result<(), BlockError> {
        if self.columns.is_empty() {
            self.columns = other.columns.clone();
            return Ok(());
        }
        other.check_header(&self.header())?;
        for (position, (dst, src)) in self.columns.iter_mut().zip(&other.columns).enumerate() {
            if !dst.column.extend(&src.column) {
                return Err(BlockError::ColumnMismatch {
                    position,
                    expected: dst.column.data_type().to_string(),
                    actual: src.column.data_type().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Splits the block into consecutive blocks of at most `max_rows` rows.
    pub fn split(&self, max_rows: usize) -> Vec<Block> {
        let rows = self.rows();
        let max_rows = max_rows.max(1);
        (0..rows)
            .step_by(max_rows)
            .map(|start| {
                let end = (start + max_rows).min(rows);
                Block {
                    columns: self
                        .columns
                        .iter()
                        .map(|c| NamedColumn {
                            name: c.name.clone(),
                            column: c.column.slice(start, end),
                        })
                        .collect(),
                }
            })
            .collect()
    }

    /// Column description in `name Type, ...` form, as sent in TableColumns packets.
    pub fn describe_columns(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.column.data_type()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Encodes a block into a packet payload.
pub fn encode_block(block: &Block, compression: Compression) -> Result<Vec<u8>, BlockError> {
    let raw = encode_to_vec(block, wire_config())?;
    Ok(match compression {
        Compression::Disable => raw,
        Compression::Enable => lz4_flex::compress_prepend_size(&raw),
    })
}

/// Decodes a packet payload produced by [`encode_block`] with the same compression.
pub fn decode_block(payload: &[u8], compression: Compression) -> Result<Block, BlockError> {
    let block = match compression {
        Compression::Disable => decode_from_slice(payload, limited_wire_config())?.0,
        Compression::Enable => {
            if let Some(size) = payload.first_chunk::<4>() {
                let size = u32::from_le_bytes(*size) as usize;
                if size > MAX_PACKET_SIZE {
                    return Err(BlockError::TooLarge(size));
                }
            }
            let raw = lz4_flex::decompress_size_prepended(payload)?;
            decode_from_slice(&raw, limited_wire_config())?.0
        }
    };
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Block {
        Block::new()
            .with_column("id", Column::UInt64(vec![1, 2, 3]))
            .unwrap()
            .with_column(
                "name",
                Column::String(vec!["a".into(), "bb".into(), "ccc".into()]),
            )
            .unwrap()
    }

    #[test]
    fn compressed_payload_reproduces_block() {
        let block = sample();
        let payload = encode_block(&block, Compression::Enable).unwrap();
        let decoded = decode_block(&payload, Compression::Enable).unwrap();

        assert_eq!(decoded, block);
        assert_eq!(decoded.rows(), 3);
    }

    #[test]
    fn payload_decoded_with_wrong_compression_fails() {
        let payload = encode_block(&sample(), Compression::Disable).unwrap();

        assert!(decode_block(&payload, Compression::Enable).is_err());
    }

    #[test]
    fn compressed_size_above_limit_rejected() {
        let mut payload = encode_block(&sample(), Compression::Enable).unwrap();
        payload[..4].copy_from_slice(&u32::MAX.to_le_bytes());

        assert!(matches!(
            decode_block(&payload, Compression::Enable),
            Err(BlockError::TooLarge(size)) if size == u32::MAX as usize
        ));
    }

    #[test]
    fn column_length_above_limit_rejected() {
        // One String column named "s" whose row count claims a terabyte.
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u64.to_be_bytes());
        payload.extend_from_slice(&1u64.to_be_bytes());
        payload.push(b's');
        payload.extend_from_slice(&3u32.to_be_bytes());
        payload.extend_from_slice(&(1u64 << 40).to_be_bytes());

        assert!(matches!(
            decode_block(&payload, Compression::Disable),
            Err(BlockError::Decode(bincode::error::DecodeError::LimitExceeded))
        ));
    }

    #[test]
    fn mismatched_row_counts_rejected() {
        let err = Block::new()
            .with_column("a", Column::UInt64(vec![1]))
            .unwrap()
            .with_column("b", Column::UInt64(vec![1, 2]))
            .unwrap_err();

        assert!(matches!(err, BlockError::RowCountMismatch { expected: 1, .. }));
    }

    #[test]
    fn header_check_detects_type_change() {
        let expected = sample().header();
        let other = Block::new()
            .with_column("id", Column::Int64(vec![1]))
            .unwrap()
            .with_column("name", Column::String(vec!["x".into()]))
            .unwrap();

        let err = other.check_header(&expected).unwrap_err();
        assert!(matches!(err, BlockError::ColumnMismatch { position: 0, .. }));
    }

    #[test]
    fn header_check_detects_column_count() {
        let expected = sample().header();
        let other = Block::new()
            .with_column("id", Column::UInt64(vec![1]))
            .unwrap();

        assert!(matches!(
            other.check_header(&expected),
            Err(BlockError::ColumnCount {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn append_concatenates_rows() {
        let mut acc = Block::new();
        acc.append(&sample()).unwrap();
        acc.append(&sample()).unwrap();

        assert_eq!(acc.rows(), 6);
        assert_eq!(
            acc.column("id"),
            Some(&Column::UInt64(vec![1, 2, 3, 1, 2, 3]))
        );
    }

    #[test]
    fn split_keeps_every_row() {
        let mut big = Block::new();
        for _ in 0..3 {
            big.append(&sample()).unwrap();
        }
        let parts = big.split(4);

        assert_eq!(parts.iter().map(Block::rows).collect::<Vec<_>>(), vec![4, 4, 1]);
        assert_eq!(
            parts[2].column("name"),
            Some(&Column::String(vec!["ccc".into()]))
        );
    }

    #[test]
    fn header_has_no_rows() {
        let header = sample().header();

        assert!(header.is_empty());
        assert_eq!(header.columns().len(), 2);
        assert_eq!(header.describe_columns(), "id UInt64, name String");
    }
}
