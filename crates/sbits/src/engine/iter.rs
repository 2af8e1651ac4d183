//! Range iteration over records.

use super::{Engine, VarData, VarDataStream};
use crate::bitmap::overlaps;
use crate::buffer::Stream;
use crate::config::{key_to_u64, CompareFn};
use crate::error::{DbError, Result};
use crate::page::{DataPage, IndexPage, PageLayout};
use std::cmp::Ordering;
use tracing::{trace, warn};

/// Bounds of a range scan. Every bound is inclusive and optional.
#[derive(Debug, Clone, Default)]
pub struct IteratorQuery {
    min_key: Option<u64>,
    max_key: Option<u64>,
    min_data: Option<Vec<u8>>,
    max_data: Option<Vec<u8>>,
}

impl IteratorQuery {
    /// A query matching every record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Skips records with a smaller key.
    pub fn min_key(mut self, key: u64) -> Self {
        self.min_key = Some(key);
        self
    }

    /// Stops at the first record with a larger key.
    pub fn max_key(mut self, key: u64) -> Self {
        self.max_key = Some(key);
        self
    }

    /// Skips records whose data compares below `data`.
    pub fn min_data(mut self, data: &[u8]) -> Self {
        self.min_data = Some(data.to_vec());
        self
    }

    /// Skips records whose data compares above `data`.
    pub fn max_data(mut self, data: &[u8]) -> Self {
        self.max_data = Some(data.to_vec());
        self
    }

    fn has_data_bounds(&self) -> bool {
        self.min_data.is_some() || self.max_data.is_some()
    }
}

/// A record returned by an iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Data bytes.
    pub data: Vec<u8>,
    /// Location of the variable payload, or `NO_VAR_DATA`.
    pub var_pointer: u32,
}

impl Record {
    /// Key as an integer.
    pub fn key_u64(&self) -> u64 {
        key_to_u64(&self.key)
    }
}

#[derive(Debug, Clone, Copy)]
enum Cursor {
    None,
    /// Records of the page held in the data read slot.
    Page { index: usize, count: usize },
    /// Records of the unflushed write page.
    WriteBuffer { index: usize, count: usize },
}

/// Iterator over the records matching an [`IteratorQuery`], in key order.
///
/// Pages are pruned with the index bitmaps, the page header bitmaps and
/// min/max fields when those are enabled. An I/O error ends the iteration
/// and is kept for [`RecordIter::take_error`].
#[derive(Debug)]
pub struct RecordIter<'a> {
    db: &'a mut Engine,
    query: IteratorQuery,
    query_bitmap: Option<Vec<u8>>,
    next_page: u32,
    end_page: u32,
    /// Logical index page to search first for the next entry.
    idx_page: u32,
    cursor: Cursor,
    done: bool,
    error: Option<DbError>,
}

impl Engine {
    /// Starts a range scan.
    ///
    /// Records inserted after this call are not visited; the iterator holds
    /// the engine exclusively until it is dropped.
    pub fn iter(&mut self, query: IteratorQuery) -> Result<RecordIter<'_>> {
        let query_bitmap = match (&self.config.bitmap, self.layout.has_bitmap()) {
            (Some(policy), true) if query.has_data_bounds() => {
                let mut bitmap = vec![0u8; self.layout.bitmap_size];
                policy.build_from_range(
                    query.min_data.as_deref(),
                    query.max_data.as_deref(),
                    &mut bitmap,
                );
                Some(bitmap)
            }
            _ => None,
        };
        let next_page = match query.min_key {
            Some(key) => self.seed_page(key),
            None => self.data_log.min_id,
        };
        let end_page = self.data_log.next_id;
        let idx_page = self.index_log.map_or(0, |log| log.min_id);
        trace!(next_page, end_page, "Starting iterator");
        Ok(RecordIter {
            db: self,
            query,
            query_bitmap,
            next_page,
            end_page,
            idx_page,
            cursor: Cursor::None,
            done: false,
            error: None,
        })
    }
}

impl RecordIter<'_> {
    /// Page geometry of the engine being scanned.
    pub fn layout(&self) -> &PageLayout {
        self.db.layout()
    }

    /// Error that ended the iteration, if any.
    pub fn take_error(&mut self) -> Option<DbError> {
        self.error.take()
    }

    /// Next record together with its variable payload.
    pub fn next_var(&mut self) -> Option<(Record, VarData)> {
        let record = self.next()?;
        match self.db.open_var(record.key_u64(), record.var_pointer) {
            Ok(var) => Some((record, var)),
            Err(e) => {
                self.fail(e);
                None
            }
        }
    }

    /// Reads from a payload returned by [`RecordIter::next_var`].
    pub fn read_var(&mut self, stream: &mut VarDataStream, buf: &mut [u8]) -> Result<usize> {
        stream.read(self.db, buf)
    }

    fn fail(&mut self, error: DbError) {
        warn!(error = %error, "Iterator stopped on error");
        self.error = Some(error);
        self.done = true;
    }

    /// Moves to the next page that may hold matching records.
    fn advance_page(&mut self) -> Result<bool> {
        while self.next_page < self.end_page {
            let id = self.next_page;
            self.next_page += 1;

            if let Some(query_bitmap) = &self.query_bitmap {
                if let Some(entry) = index_entry(self.db, &mut self.idx_page, id)? {
                    if !overlaps(&entry, query_bitmap) {
                        trace!(page = id, "Skipped page by index bitmap");
                        continue;
                    }
                }
            }

            let physical = self.db.data_log.physical(id);
            let buf = self.db.buffer.read_page(Stream::Data, physical)?;
            let page = DataPage::new(buf, &self.db.layout);
            page.validate(physical)?;

            if matches!(self.query.max_key, Some(max) if page.first_key() > max) {
                self.done = true;
                return Ok(false);
            }
            if matches!(self.query.min_key, Some(min) if page.last_key() < min) {
                continue;
            }
            let compare = self.db.config.compare_data;
            if !page_may_match(&page, &self.query, self.query_bitmap.as_deref(), compare) {
                trace!(page = id, "Skipped page by header summary");
                continue;
            }
            self.cursor = Cursor::Page {
                index: 0,
                count: page.count(),
            };
            return Ok(true);
        }
        Ok(false)
    }

    fn enter_write_buffer(&mut self) -> bool {
        let compare = self.db.config.compare_data;
        let page = self.db.write_page();
        if page.is_empty()
            || !page_may_match(&page, &self.query, self.query_bitmap.as_deref(), compare)
        {
            return false;
        }
        self.cursor = Cursor::WriteBuffer {
            index: 0,
            count: page.count(),
        };
        true
    }

    /// Checks record `index` of the current page. `None` ends the scan.
    fn take_record(&mut self, from_write_buffer: bool, index: usize) -> Option<Option<Record>> {
        let stream_buf = if from_write_buffer {
            self.db.buffer.write_buf(Stream::Data)
        } else {
            self.db.buffer.read_buf(Stream::Data)
        };
        let page = DataPage::new(stream_buf, &self.db.layout);
        let key = page.key_u64(index);
        if matches!(self.query.max_key, Some(max) if key > max) {
            return None;
        }
        if matches!(self.query.min_key, Some(min) if key < min) {
            return Some(None);
        }
        let data = page.data(index);
        let compare = self.db.config.compare_data;
        if let Some(min) = &self.query.min_data {
            if compare(data, min) == Ordering::Less {
                return Some(None);
            }
        }
        if let Some(max) = &self.query.max_data {
            if compare(data, max) == Ordering::Greater {
                return Some(None);
            }
        }
        Some(Some(Record {
            key: page.key(index).to_vec(),
            data: data.to_vec(),
            var_pointer: page.var_pointer(index),
        }))
    }
}

/// Index bitmap of logical data page `page`, if an index page covers it.
///
/// `idx_page` is the first index page worth searching and only moves forward.
fn index_entry(db: &mut Engine, idx_page: &mut u32, page: u32) -> Result<Option<Vec<u8>>> {
    let Some(log) = db.index_log else {
        return Ok(None);
    };
    if let Some(entry) =
        IndexPage::new(db.buffer.write_buf(Stream::Index), &db.layout).entry_for(page)
    {
        return Ok(Some(entry.to_vec()));
    }

    *idx_page = (*idx_page).max(log.min_id);
    while *idx_page < log.next_id {
        let physical = log.physical(*idx_page);
        let buf = if db.buffer.cached_page(Stream::Index) == Some(physical) {
            db.buffer.read_buf(Stream::Index)
        } else {
            let buf = db.buffer.read_page(Stream::Index, physical)?;
            IndexPage::new(buf, &db.layout).verify()?;
            buf
        };
        let index_page = IndexPage::new(buf, &db.layout);
        if page < index_page.first_data_page() {
            return Ok(None);
        }
        if let Some(entry) = index_page.entry_for(page) {
            return Ok(Some(entry.to_vec()));
        }
        *idx_page += 1;
    }
    Ok(None)
}

/// Returns false if the page summaries rule out every record.
fn page_may_match(
    page: &DataPage<'_>,
    query: &IteratorQuery,
    query_bitmap: Option<&[u8]>,
    compare: CompareFn,
) -> bool {
    if let Some(query_bitmap) = query_bitmap {
        if !overlaps(page.bitmap(), query_bitmap) {
            return false;
        }
    }
    if let (Some(min), Some(page_max)) = (&query.min_data, page.max_data()) {
        if compare(page_max, min) == Ordering::Less {
            return false;
        }
    }
    if let (Some(max), Some(page_min)) = (&query.max_data, page.min_data()) {
        if compare(page_min, max) == Ordering::Greater {
            return false;
        }
    }
    true
}

impl Iterator for RecordIter<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        loop {
            if self.done {
                return None;
            }
            let (from_write_buffer, index) = match self.cursor {
                Cursor::Page { index, count } if index < count => {
                    self.cursor = Cursor::Page {
                        index: index + 1,
                        count,
                    };
                    (false, index)
                }
                Cursor::WriteBuffer { index, count } if index < count => {
                    self.cursor = Cursor::WriteBuffer {
                        index: index + 1,
                        count,
                    };
                    (true, index)
                }
                Cursor::WriteBuffer { .. } => {
                    self.done = true;
                    return None;
                }
                Cursor::None | Cursor::Page { .. } => {
                    match self.advance_page() {
                        Ok(true) => {}
                        Ok(false) if self.done => return None,
                        Ok(false) => {
                            if !self.enter_write_buffer() {
                                self.done = true;
                                return None;
                            }
                        }
                        Err(e) => {
                            self.fail(e);
                            return None;
                        }
                    }
                    continue;
                }
            };
            match self.take_record(from_write_buffer, index) {
                Some(Some(record)) => return Some(record),
                Some(None) => {}
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}
