//! Group-by aggregation over sorted input.

use super::{Column, Operator, Schema};
use crate::config::{bytes_to_i64, key_to_u64, u64_to_key};
use crate::error::{DbError, Result};

/// Decides whether `record` belongs to the same group as `last`.
pub type GroupFn<'a> = Box<dyn FnMut(&[u8], &[u8]) -> bool + 'a>;

/// One output column of an [`Aggregate`].
pub trait AggregateFunc {
    /// Type of the output column.
    fn output(&self, input: &Schema) -> Column;

    /// Input column the function reads, if any.
    fn input_column(&self) -> Option<usize> {
        None
    }

    /// Starts a new group.
    fn reset(&mut self);

    /// Adds a record of the current group.
    fn add(&mut self, input: &Schema, record: &[u8]);

    /// Writes the result for the finished group into `out`, which is as
    /// wide as the output column. `last` is the group's last record.
    fn compute(&self, input: &Schema, last: &[u8], out: &mut [u8]);
}

/// Widest column a value function can read.
const MAX_VALUE_SIZE: usize = 8;

/// Column value widened so unsigned and signed 8-byte columns both fit.
fn read_value(input: &Schema, record: &[u8], column: usize) -> i128 {
    let field = input.field(record, column);
    match input.column(column) {
        Some(col) if col.is_signed() => i128::from(bytes_to_i64(field)),
        _ => i128::from(key_to_u64(field)),
    }
}

/// Number of records in the group, as a `u32`.
#[derive(Debug, Default)]
pub struct Count {
    count: u32,
}

impl Count {
    /// Creates a counter.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AggregateFunc for Count {
    fn output(&self, _input: &Schema) -> Column {
        Column::unsigned(4)
    }

    fn reset(&mut self) {
        self.count = 0;
    }

    fn add(&mut self, _input: &Schema, _record: &[u8]) {
        self.count += 1;
    }

    fn compute(&self, _input: &Schema, _last: &[u8], out: &mut [u8]) {
        out.copy_from_slice(&self.count.to_le_bytes());
    }
}

/// Sum of a column, as an `i64` that wraps on overflow.
#[derive(Debug)]
pub struct Sum {
    column: usize,
    total: i128,
}

impl Sum {
    /// Sums `column`.
    pub fn new(column: usize) -> Self {
        Self { column, total: 0 }
    }
}

impl AggregateFunc for Sum {
    fn output(&self, _input: &Schema) -> Column {
        Column::signed(8)
    }

    fn input_column(&self) -> Option<usize> {
        Some(self.column)
    }

    fn reset(&mut self) {
        self.total = 0;
    }

    fn add(&mut self, input: &Schema, record: &[u8]) {
        self.total = self.total.wrapping_add(read_value(input, record, self.column));
    }

    fn compute(&self, _input: &Schema, _last: &[u8], out: &mut [u8]) {
        out.copy_from_slice(&(self.total as i64).to_le_bytes());
    }
}

/// Smallest value of a column, in the column's own type.
#[derive(Debug)]
pub struct Min {
    column: usize,
    current: Option<i128>,
}

impl Min {
    /// Tracks the minimum of `column`.
    pub fn new(column: usize) -> Self {
        Self {
            column,
            current: None,
        }
    }
}

impl AggregateFunc for Min {
    fn output(&self, input: &Schema) -> Column {
        input.column(self.column).unwrap_or(Column::signed(8))
    }

    fn input_column(&self) -> Option<usize> {
        Some(self.column)
    }

    fn reset(&mut self) {
        self.current = None;
    }

    fn add(&mut self, input: &Schema, record: &[u8]) {
        let value = read_value(input, record, self.column);
        self.current = Some(self.current.map_or(value, |c| c.min(value)));
    }

    fn compute(&self, _input: &Schema, _last: &[u8], out: &mut [u8]) {
        u64_to_key(self.current.unwrap_or_default() as u64, out);
    }
}

/// Largest value of a column, in the column's own type.
#[derive(Debug)]
pub struct Max {
    column: usize,
    current: Option<i128>,
}

impl Max {
    /// Tracks the maximum of `column`.
    pub fn new(column: usize) -> Self {
        Self {
            column,
            current: None,
        }
    }
}

impl AggregateFunc for Max {
    fn output(&self, input: &Schema) -> Column {
        input.column(self.column).unwrap_or(Column::signed(8))
    }

    fn input_column(&self) -> Option<usize> {
        Some(self.column)
    }

    fn reset(&mut self) {
        self.current = None;
    }

    fn add(&mut self, input: &Schema, record: &[u8]) {
        let value = read_value(input, record, self.column);
        self.current = Some(self.current.map_or(value, |c| c.max(value)));
    }

    fn compute(&self, _input: &Schema, _last: &[u8], out: &mut [u8]) {
        u64_to_key(self.current.unwrap_or_default() as u64, out);
    }
}

/// Mean of a column, as an `f32` or `f64`.
#[derive(Debug)]
pub struct Avg {
    column: usize,
    output_size: u8,
    sum: i128,
    count: u64,
}

impl Avg {
    /// Averages `column` into a 4-byte `f32` or 8-byte `f64`.
    ///
    /// # Errors
    ///
    /// Returns `Config` for any other output size.
    pub fn new(column: usize, output_size: u8) -> Result<Self> {
        if output_size != 4 && output_size != 8 {
            return Err(DbError::config(format!(
                "average output must be 4 or 8 bytes, got {output_size}"
            )));
        }
        Ok(Self {
            column,
            output_size,
            sum: 0,
            count: 0,
        })
    }
}

impl AggregateFunc for Avg {
    fn output(&self, _input: &Schema) -> Column {
        Column::signed(self.output_size)
    }

    fn input_column(&self) -> Option<usize> {
        Some(self.column)
    }

    fn reset(&mut self) {
        self.sum = 0;
        self.count = 0;
    }

    fn add(&mut self, input: &Schema, record: &[u8]) {
        self.sum = self.sum.wrapping_add(read_value(input, record, self.column));
        self.count += 1;
    }

    fn compute(&self, _input: &Schema, _last: &[u8], out: &mut [u8]) {
        let mean = if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        };
        if self.output_size == 4 {
            out.copy_from_slice(&(mean as f32).to_le_bytes());
        } else {
            out.copy_from_slice(&mean.to_le_bytes());
        }
    }
}

/// Emits one record per group of consecutive input records.
///
/// Output column `i` is produced by function `i`.
pub struct Aggregate<'a> {
    input: Box<dyn Operator + 'a>,
    same_group: GroupFn<'a>,
    functions: Vec<Box<dyn AggregateFunc + 'a>>,
    schema: Schema,
    record: Vec<u8>,
    last: Vec<u8>,
    /// First record of the next group, read while closing the previous one.
    pending: Option<Vec<u8>>,
}

impl<'a> Aggregate<'a> {
    /// Groups `input` with `same_group` and evaluates `functions` per group.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `functions` is empty or a function reads a
    /// column the input lacks or one wider than 8 bytes.
    pub fn new(
        input: Box<dyn Operator + 'a>,
        same_group: GroupFn<'a>,
        functions: Vec<Box<dyn AggregateFunc + 'a>>,
    ) -> Result<Self> {
        if functions.is_empty() {
            return Err(DbError::config("aggregate needs at least one function"));
        }
        for column in functions.iter().filter_map(|f| f.input_column()) {
            match input.schema().column(column) {
                Some(col) if col.size() <= MAX_VALUE_SIZE => {}
                Some(col) => {
                    return Err(DbError::config(format!(
                        "aggregate column {column} is {} bytes wide, at most {MAX_VALUE_SIZE} supported",
                        col.size()
                    )))
                }
                None => {
                    return Err(DbError::config(format!(
                        "aggregate column {column} is not in the input schema of {} columns",
                        input.schema().len()
                    )))
                }
            }
        }
        let columns = functions
            .iter()
            .map(|f| f.output(input.schema()))
            .collect();
        let schema = Schema::derived(columns);
        Ok(Self {
            input,
            same_group,
            functions,
            record: vec![0u8; schema.record_size()],
            schema,
            last: Vec::new(),
            pending: None,
        })
    }

    fn add_to_group(&mut self, record: &[u8]) {
        let input_schema = self.input.schema();
        for function in &mut self.functions {
            function.add(input_schema, record);
        }
        self.last.clear();
        self.last.extend_from_slice(record);
    }
}

impl Operator for Aggregate<'_> {
    fn init(&mut self) -> Result<()> {
        self.pending = None;
        self.input.init()
    }

    fn next(&mut self) -> Result<bool> {
        for function in &mut self.functions {
            function.reset();
        }

        let mut started = false;
        if let Some(first) = self.pending.take() {
            self.add_to_group(&first);
            started = true;
        }
        while self.input.next()? {
            let record = self.input.record().to_vec();
            if started && !(self.same_group)(&self.last, &record) {
                self.pending = Some(record);
                break;
            }
            self.add_to_group(&record);
            started = true;
        }
        if !started {
            return Ok(false);
        }

        let input_schema = self.input.schema();
        let mut pos = 0;
        for (function, column) in self.functions.iter().zip(self.schema.columns()) {
            let size = column.size();
            function.compute(input_schema, &self.last, &mut self.record[pos..pos + size]);
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
