use super::{Operator, Schema};
use crate::engine::RecordIter;
use crate::error::{DbError, Result};

/// Leaf operator producing the records of an engine scan as `key ‖ data`.
#[derive(Debug)]
pub struct TableScan<'a> {
    iter: RecordIter<'a>,
    schema: Schema,
    record: Vec<u8>,
}

impl<'a> TableScan<'a> {
    /// Wraps `iter`, describing its records with `schema`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the key column or the record width of `schema`
    /// does not match the engine's key and data sizes.
    pub fn new(iter: RecordIter<'a>, schema: Schema) -> Result<Self> {
        let layout = iter.layout();
        let key_size = schema.column(0).map_or(0, |c| c.size());
        if key_size != layout.key_size {
            return Err(DbError::config(format!(
                "schema key column is {key_size} bytes, engine keys are {}",
                layout.key_size
            )));
        }
        let expected = layout.key_size + layout.data_size;
        if schema.record_size() != expected {
            return Err(DbError::config(format!(
                "schema describes {}-byte records, engine records are {expected} bytes",
                schema.record_size()
            )));
        }
        Ok(Self {
            iter,
            record: vec![0u8; expected],
            schema,
        })
    }
}

impl Operator for TableScan<'_> {
    fn next(&mut self) -> Result<bool> {
        match self.iter.next() {
            Some(record) => {
                let key_size = record.key.len();
                self.record[..key_size].copy_from_slice(&record.key);
                self.record[key_size..].copy_from_slice(&record.data);
                Ok(true)
            }
            None => match self.iter.take_error() {
                Some(e) => Err(e),
                None => Ok(false),
            },
        }
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn record(&self) -> &[u8] {
        &self.record
    }
}
