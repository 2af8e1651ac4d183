use super::{Operator, Schema};
use crate::config::compare_unsigned;
use crate::error::{DbError, Result};
use std::cmp::Ordering;

/// Merge equi-join of two inputs on their key column.
///
/// Both inputs must be sorted ascending by key with unique keys. Each
/// output record is the left record followed by the right record.
pub struct KeyJoin<'a> {
    left: Box<dyn Operator + 'a>,
    right: Box<dyn Operator + 'a>,
    key_size: usize,
    schema: Schema,
    record: Vec<u8>,
}

impl<'a> KeyJoin<'a> {
    /// Joins `left` and `right` on column 0.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the key columns differ in width.
    pub fn new(left: Box<dyn Operator + 'a>, right: Box<dyn Operator + 'a>) -> Result<Self> {
        let left_key = left.schema().column(0);
        let right_key = right.schema().column(0);
        let key_size = match (left_key, right_key) {
            (Some(l), Some(r)) if l.size() == r.size() => l.size(),
            _ => {
                return Err(DbError::config(
                    "join inputs must have key columns of the same width",
                ))
            }
        };
        let columns = left
            .schema()
            .columns()
            .iter()
            .chain(right.schema().columns())
            .copied()
            .collect();
        let schema = Schema::derived(columns);
        Ok(Self {
            left,
            right,
            key_size,
            record: vec![0u8; schema.record_size()],
            schema,
        })
    }
}

impl Operator for KeyJoin<'_> {
    fn init(&mut self) -> Result<()> {
        self.left.init()?;
        self.right.init()
    }

    fn next(&mut self) -> Result<bool> {
        if !self.left.next()? || !self.right.next()? {
            return Ok(false);
        }
        loop {
            let left = self.left.record();
            let right = self.right.record();
            match compare_unsigned(&left[..self.key_size], &right[..self.key_size]) {
                Ordering::Equal => {
                    self.record[..left.len()].copy_from_slice(left);
                    self.record[left.len()..].copy_from_slice(right);
                    return Ok(true);
                }
                Ordering::Less => {
                    if !self.left.next()? {
                        return Ok(false);
                    }
                }
                Ordering::Greater => {
                    if !self.right.next()? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn close(&mut self) {
        self.left.close();
        self.right.close();
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn record(&self) -> &[u8] {
        &self.record
    }
}
