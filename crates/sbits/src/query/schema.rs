//! Record schemas for the operator layer.

use crate::error::{DbError, Result};

/// A fixed-width integer column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    size: u8,
    signed: bool,
}

impl Column {
    /// An unsigned column of `size` bytes.
    pub const fn unsigned(size: u8) -> Self {
        Self { size, signed: false }
    }

    /// A signed column of `size` bytes.
    pub const fn signed(size: u8) -> Self {
        Self { size, signed: true }
    }

    /// Width in bytes.
    pub fn size(&self) -> usize {
        usize::from(self.size)
    }

    /// Returns true for two's complement columns.
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// Size with the sign convention of [`Schema::column_sizes`].
    pub fn signed_size(&self) -> i8 {
        let size = self.size as i8;
        if self.signed {
            -size
        } else {
            size
        }
    }
}

/// Column layout of the records flowing through an operator.
///
/// Records are the concatenation of their columns, little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// Creates the schema of a stored table: the key column followed by the data columns.
    ///
    /// # Errors
    ///
    /// Returns `Config` if there are fewer than two columns, the key column
    /// is signed, or a column has size zero.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        if columns.len() < 2 {
            return Err(DbError::config(
                "a table schema needs the key column and at least one data column",
            ));
        }
        if columns[0].is_signed() {
            return Err(DbError::config("the key column must be unsigned"));
        }
        if columns.iter().any(|c| c.size == 0) {
            return Err(DbError::config("column size must be greater than zero"));
        }
        Ok(Self { columns })
    }

    /// Creates a table schema from signed sizes, negative meaning a signed column.
    pub fn from_sizes(sizes: &[i8]) -> Result<Self> {
        let columns = sizes
            .iter()
            .map(|&size| {
                if size < 0 {
                    Column::signed(size.unsigned_abs())
                } else {
                    Column::unsigned(size as u8)
                }
            })
            .collect();
        Self::new(columns)
    }

    /// Schema of an operator output, which need not start with a key.
    pub(crate) fn derived(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// All columns.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column `index`.
    pub fn column(&self, index: usize) -> Option<Column> {
        self.columns.get(index).copied()
    }

    /// Sizes of every column, negative for signed columns.
    pub fn column_sizes(&self) -> Vec<i8> {
        self.columns.iter().map(Column::signed_size).collect()
    }

    /// Byte offset of column `index` within a record.
    pub fn offset(&self, index: usize) -> usize {
        self.columns[..index].iter().map(Column::size).sum()
    }

    /// Bytes of column `index` within `record`.
    pub fn field<'r>(&self, record: &'r [u8], index: usize) -> &'r [u8] {
        let start = self.offset(index);
        &record[start..start + self.columns[index].size()]
    }

    /// Total record width.
    pub fn record_size(&self) -> usize {
        self.columns.iter().map(Column::size).sum()
    }
}
