use super::{Operator, Schema};
use crate::config::{compare_signed, compare_unsigned, CompareFn};
use crate::error::{DbError, Result};
use std::cmp::Ordering;

/// Keeps a subset of the input columns.
pub struct Projection<'a> {
    input: Box<dyn Operator + 'a>,
    /// `(offset, size)` of each kept input column.
    fields: Vec<(usize, usize)>,
    schema: Schema,
    record: Vec<u8>,
}

impl<'a> Projection<'a> {
    /// Projects `columns` of `input`, which must be strictly ascending.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `columns` is empty, not strictly ascending, or
    /// names a column the input does not have.
    pub fn new(input: Box<dyn Operator + 'a>, columns: &[usize]) -> Result<Self> {
        if columns.is_empty() {
            return Err(DbError::config("projection needs at least one column"));
        }
        if columns.windows(2).any(|pair| pair[1] <= pair[0]) {
            return Err(DbError::config(
                "projection columns must be strictly ascending",
            ));
        }
        let input_schema = input.schema();
        let mut fields = Vec::with_capacity(columns.len());
        let mut kept = Vec::with_capacity(columns.len());
        for &index in columns {
            let column = input_schema.column(index).ok_or_else(|| {
                DbError::config(format!(
                    "projection column {index} out of range for {} input columns",
                    input_schema.len()
                ))
            })?;
            fields.push((input_schema.offset(index), column.size()));
            kept.push(column);
        }
        let schema = Schema::derived(kept);
        Ok(Self {
            input,
            fields,
            record: vec![0u8; schema.record_size()],
            schema,
        })
    }
}

impl Operator for Projection<'_> {
    fn init(&mut self) -> Result<()> {
        self.input.init()
    }

    fn next(&mut self) -> Result<bool> {
        if !self.input.next()? {
            return Ok(false);
        }
        let source = self.input.record();
        let mut pos = 0;
        for &(offset, size) in &self.fields {
            self.record[pos..pos + size].copy_from_slice(&source[offset..offset + size]);
            pos += size;
        }
        Ok(true)
    }

    fn close(&mut self) {
        self.input.close();
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn record(&self) -> &[u8] {
        &self.record
    }
}

/// Comparison applied by a [`Selection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOp {
    /// Column greater than the value.
    Gt,
    /// Column less than the value.
    Lt,
    /// Column greater than or equal to the value.
    Gte,
    /// Column less than or equal to the value.
    Lte,
    /// Column equal to the value.
    Eq,
    /// Column not equal to the value.
    Neq,
}

impl SelectOp {
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            SelectOp::Gt => ordering == Ordering::Greater,
            SelectOp::Lt => ordering == Ordering::Less,
            SelectOp::Gte => ordering != Ordering::Less,
            SelectOp::Lte => ordering != Ordering::Greater,
            SelectOp::Eq => ordering == Ordering::Equal,
            SelectOp::Neq => ordering != Ordering::Equal,
        }
    }
}

/// Passes the input records whose column compares to a constant as requested.
pub struct Selection<'a> {
    input: Box<dyn Operator + 'a>,
    column: usize,
    op: SelectOp,
    value: Vec<u8>,
    signed: bool,
    schema: Schema,
}

impl<'a> Selection<'a> {
    /// Selects records where `column <op> value`.
    ///
    /// `value` is a little-endian integer as wide as the column, compared
    /// signed or unsigned according to the column type.
    pub fn new(
        input: Box<dyn Operator + 'a>,
        column: usize,
        op: SelectOp,
        value: &[u8],
    ) -> Result<Self> {
        let schema = input.schema().clone();
        let col = schema.column(column).ok_or_else(|| {
            DbError::config(format!("selection column {column} out of range"))
        })?;
        if value.len() != col.size() {
            return Err(DbError::config(format!(
                "selection value is {} bytes, column {column} is {} bytes",
                value.len(),
                col.size()
            )));
        }
        Ok(Self {
            input,
            column,
            op,
            value: value.to_vec(),
            signed: col.is_signed(),
            schema,
        })
    }
}

impl Operator for Selection<'_> {
    fn init(&mut self) -> Result<()> {
        self.input.init()
    }

    fn next(&mut self) -> Result<bool> {
        let compare: CompareFn = if self.signed {
            compare_signed
        } else {
            compare_unsigned
        };
        while self.input.next()? {
            let field = self.schema.field(self.input.record(), self.column);
            if self.op.accepts(compare(field, &self.value)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn close(&mut self) {
        self.input.close();
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn record(&self) -> &[u8] {
        self.input.record()
    }
}
