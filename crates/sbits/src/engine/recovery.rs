//! Rebuilding engine state from the pages on the devices.
//!
//! Every physical slot is scanned and the largest logical id of a valid
//! page in each stream determines where writing resumes. The oldest live
//! page follows from the log capacity and erase size, since pages are
//! always reclaimed in whole erase blocks from the front. A reclamation
//! cut short between the erase and the next write leaves an erased block at
//! the front; recovery skips it.

use super::{page_max_error, Engine, PageLog};
use crate::buffer::{PageBuffer, Stream};
use crate::error::{DbError, Result};
use crate::page::{var_first_live_key, var_page_id, DataPage, IndexPage};
use std::io;
use tracing::{debug, warn};

/// Advances `log.min_id` past leading erase blocks whose first page does
/// not hold logical page `min_id`.
fn skip_erased_blocks(
    buffer: &mut PageBuffer,
    stream: Stream,
    log: &mut PageLog,
    holds: impl Fn(&[u8], u32) -> bool,
) -> Result<()> {
    while log.min_id < log.next_id {
        let buf = buffer.read_uncounted(stream, log.physical(log.min_id))?;
        if holds(buf, log.min_id) {
            return Ok(());
        }
        let skipped = log.erase_size.min(log.next_id - log.min_id);
        warn!(
            ?stream,
            min_page = log.min_id,
            skipped,
            "Skipping erased block at the start of the log"
        );
        log.min_id += skipped;
        log.num_avail += skipped;
    }
    Ok(())
}

impl Engine {
    pub(super) fn recover(&mut self) -> Result<()> {
        self.recover_data()?;
        if self.index_log.is_some() {
            self.recover_index()?;
        }
        if self.config.parameters.use_var_data() {
            self.recover_var()?;
        }
        Ok(())
    }

    /// Largest logical id among the valid pages of `stream`.
    fn scan(&mut self, stream: Stream, capacity: u32) -> Result<Option<u32>> {
        let mut max_id = None;
        for slot in 0..capacity {
            let buf = match self.buffer.read_uncounted(stream, slot) {
                Ok(buf) => buf,
                Err(DbError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            let id = match stream {
                Stream::Data => {
                    let page = DataPage::new(buf, &self.layout);
                    page.validate(slot).ok().map(|()| page.id())
                }
                Stream::Index => {
                    let page = IndexPage::new(buf, &self.layout);
                    match page.verify() {
                        Ok(()) => Some(page.id()),
                        Err(e @ DbError::ChecksumMismatch { .. }) => {
                            warn!(slot, error = %e, "Skipping corrupt index page");
                            None
                        }
                        Err(_) => None,
                    }
                }
                Stream::Var => Some(var_page_id(buf)),
            };
            if let Some(id) = id.filter(|id| id % capacity == slot) {
                max_id = Some(max_id.map_or(id, |max: u32| max.max(id)));
            }
        }
        Ok(max_id)
    }

    fn recover_data(&mut self) -> Result<()> {
        let capacity = self.config.num_data_pages;
        let erase_size = self.config.erase_size_in_pages;
        let Some(max_id) = self.scan(Stream::Data, capacity)? else {
            debug!("No data pages found, starting empty");
            return Ok(());
        };

        let mut log = PageLog::recovered(max_id + 1, capacity, erase_size);
        let layout = &self.layout;
        skip_erased_blocks(&mut self.buffer, Stream::Data, &mut log, |buf, id| {
            let page = DataPage::new(buf, layout);
            page.validate(id).is_ok() && page.id() == id
        })?;
        self.data_log = log;
        self.index = Self::new_index(&self.config, log.min_id);

        let mut max_error = 0;
        for id in log.min_id..log.next_id {
            let physical = log.physical(id);
            let buf = self.buffer.read_uncounted(Stream::Data, physical)?;
            let page = DataPage::new(buf, &self.layout);
            page.validate(physical)?;
            let first_key = page.first_key();
            max_error = max_error.max(page_max_error(&page, self.layout.max_records_per_page));
            if id == log.min_id {
                self.min_key = Some(first_key);
            }
            if id == max_id {
                self.last_key = Some(page.key(page.count() - 1).to_vec());
            }
            self.index.add(first_key)?;
        }
        self.max_error = Some(max_error);
        if let Some(last) = self.last_key.as_deref().map(crate::config::key_to_u64) {
            self.update_avg_key_diff(last);
        }

        debug!(
            next_page = log.next_id,
            min_page = log.min_id,
            min_key = self.min_key,
            avg_key_diff = self.avg_key_diff,
            "Recovered data log"
        );
        Ok(())
    }

    fn recover_index(&mut self) -> Result<()> {
        let capacity = self.config.num_index_pages;
        let erase_size = self.config.erase_size_in_pages;
        let mut log = match self.scan(Stream::Index, capacity)? {
            Some(max_id) => PageLog::recovered(max_id + 1, capacity, erase_size),
            None => PageLog::new(capacity, erase_size),
        };
        let layout = &self.layout;
        skip_erased_blocks(&mut self.buffer, Stream::Index, &mut log, |buf, id| {
            let page = IndexPage::new(buf, layout);
            page.verify().is_ok() && page.id() == id
        })?;
        self.index_log = Some(log);
        self.reset_index_page(self.data_log.next_id);
        debug!(
            next_page = log.next_id,
            min_page = log.min_id,
            "Recovered index log"
        );
        Ok(())
    }

    fn recover_var(&mut self) -> Result<()> {
        let capacity = self.config.num_var_pages;
        let erase_size = self.config.erase_size_in_pages;
        let mut log = match self.scan(Stream::Var, capacity)? {
            Some(max_id) => PageLog::recovered(max_id + 1, capacity, erase_size),
            None => PageLog::new(capacity, erase_size),
        };
        skip_erased_blocks(&mut self.buffer, Stream::Var, &mut log, |buf, id| {
            var_page_id(buf) == id
        })?;

        let mut state = super::vardata::VarState::new(log);
        if log.min_id > 0 {
            let buf = self.buffer.read_uncounted(Stream::Var, log.physical(log.min_id))?;
            state.min_record_id = var_first_live_key(buf, self.layout.key_size);
        }
        self.var = Some(state);
        self.open_var_page()?;

        if let Some(state) = &self.var {
            debug!(
                next_page = state.log.next_id,
                min_page = state.log.min_id,
                min_record_id = state.min_record_id,
                "Recovered var log"
            );
        }
        Ok(())
    }
}
