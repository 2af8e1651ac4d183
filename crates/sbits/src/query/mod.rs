//! Pull-based relational operators over engine scans.
//!
//! An operator tree is built bottom-up from a [`TableScan`] and driven by
//! calling [`Operator::next`] on the root until it returns `false`. After
//! each `true` the current output record is available from
//! [`Operator::record`], laid out according to [`Operator::schema`].
//!
//! Operators assume their input is sorted by the key column, which every
//! scan of an [`Engine`](crate::Engine) guarantees.

mod aggregate;
mod join;
mod ops;
mod scan;
mod schema;

pub use aggregate::{Aggregate, AggregateFunc, Avg, Count, GroupFn, Max, Min, Sum};
pub use join::KeyJoin;
pub use ops::{Projection, SelectOp, Selection};
pub use scan::TableScan;
pub use schema::{Column, Schema};

use crate::error::Result;

/// A node of an operator tree.
pub trait Operator {
    /// Prepares the operator and its inputs.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Produces the next output record. Returns `false` when exhausted.
    fn next(&mut self) -> Result<bool>;

    /// Releases the operator and its inputs.
    fn close(&mut self) {}

    /// Layout of the output records.
    fn schema(&self) -> &Schema;

    /// Current output record, valid after `next` returned `true`.
    fn record(&self) -> &[u8];
}

impl<O: Operator + ?Sized> Operator for Box<O> {
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }

    fn next(&mut self) -> Result<bool> {
        (**self).next()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn schema(&self) -> &Schema {
        (**self).schema()
    }

    fn record(&self) -> &[u8] {
        (**self).record()
    }
}

/// Runs `op` to completion and collects its output records.
pub fn collect(op: &mut dyn Operator) -> Result<Vec<Vec<u8>>> {
    op.init()?;
    let mut records = Vec::new();
    while op.next()? {
        records.push(op.record().to_vec());
    }
    op.close();
    Ok(records)
}
