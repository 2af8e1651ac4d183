//! The storage engine.
//!
//! An [`Engine`] owns three circular page logs: fixed-size records, an
//! optional index of per-page bitmaps, and an optional log of variable
//! length payloads. Records are appended in strictly increasing key order
//! into a write page; full pages are written to the next physical slot and
//! their first key is fed to the learned index used by [`Engine::get`].
//!
//! When a log runs out of free slots the oldest erase block is reclaimed
//! and the records it held disappear from every query.

mod iter;
mod recovery;
mod vardata;

pub use iter::{IteratorQuery, Record, RecordIter};
pub use vardata::{VarData, VarDataStream};

use crate::buffer::{IoStats, PageBuffer, Stream};
use crate::config::{key_to_u64, EngineConfig, SearchMethod};
use crate::error::{DbError, Result};
use crate::page::{DataPage, DataPageMut, IndexPage, IndexPageMut, PageLayout, NO_VAR_DATA};
use crate::radix::RadixSpline;
use crate::spline::Spline;
use crate::storage::{FileDevice, MemoryDevice, PageDevice};
use std::cmp::Ordering;
use std::path::Path;
use tracing::{debug, trace};

/// File name of the data log inside a directory opened with [`Engine::open_in_dir`].
pub const DATA_FILE: &str = "data.bin";
/// File name of the index log.
pub const INDEX_FILE: &str = "index.bin";
/// File name of the variable data log.
pub const VAR_FILE: &str = "var.bin";

/// Devices backing an engine.
#[derive(Debug)]
pub struct Devices {
    /// Data log device.
    pub data: Box<dyn PageDevice>,
    /// Index log device, required with `USE_INDEX`.
    pub index: Option<Box<dyn PageDevice>>,
    /// Variable data log device, required with `USE_VDATA`.
    pub var: Option<Box<dyn PageDevice>>,
}

impl Devices {
    /// Creates a device set with only a data log.
    pub fn new(data: impl PageDevice + 'static) -> Self {
        Self {
            data: Box::new(data),
            index: None,
            var: None,
        }
    }

    /// Adds an index log device.
    pub fn with_index(mut self, index: impl PageDevice + 'static) -> Self {
        self.index = Some(Box::new(index));
        self
    }

    /// Adds a variable data log device.
    pub fn with_var(mut self, var: impl PageDevice + 'static) -> Self {
        self.var = Some(Box::new(var));
        self
    }

    /// In-memory devices for every stream `config` enables.
    pub fn in_memory(config: &EngineConfig) -> Self {
        let params = config.parameters;
        Self {
            data: Box::new(MemoryDevice::new()),
            index: params
                .use_index()
                .then(|| Box::new(MemoryDevice::new()) as Box<dyn PageDevice>),
            var: params
                .use_var_data()
                .then(|| Box::new(MemoryDevice::new()) as Box<dyn PageDevice>),
        }
    }
}

/// Allocation state of one circular page log.
///
/// Logical ids grow forever; page `id` lives in physical slot
/// `id % capacity`. Pages `min_id..next_id` are live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageLog {
    pub(crate) next_id: u32,
    pub(crate) min_id: u32,
    pub(crate) num_avail: u32,
    pub(crate) capacity: u32,
    pub(crate) erase_size: u32,
}

impl PageLog {
    fn new(capacity: u32, erase_size: u32) -> Self {
        Self {
            next_id: 0,
            min_id: 0,
            num_avail: capacity,
            capacity,
            erase_size,
        }
    }

    /// State after pages `0..next_id` were written and reclaimed in whole erase blocks.
    pub(crate) fn recovered(next_id: u32, capacity: u32, erase_size: u32) -> Self {
        let min_id = if next_id <= capacity {
            0
        } else {
            (next_id - capacity).div_ceil(erase_size) * erase_size
        };
        Self {
            next_id,
            min_id,
            num_avail: capacity + min_id - next_id,
            capacity,
            erase_size,
        }
    }

    pub(crate) fn physical(&self, id: u32) -> u32 {
        id % self.capacity
    }

    pub(crate) fn live_pages(&self) -> u32 {
        self.next_id - self.min_id
    }

    /// Takes one free slot, reclaiming the oldest erase block first if none
    /// is left. Returns the old minimum id when a block was reclaimed.
    fn reserve(&mut self) -> Option<u32> {
        let reclaimed = if self.num_avail == 0 {
            let old_min = self.min_id;
            self.min_id += self.erase_size;
            self.num_avail += self.erase_size;
            Some(old_min)
        } else {
            None
        };
        self.num_avail -= 1;
        reclaimed
    }

    /// Physical ranges covering one erase block starting at logical `start`.
    fn erase_ranges(&self, start: u32) -> [(u32, u32); 2] {
        let first = self.physical(start);
        let end = first + self.erase_size;
        if end <= self.capacity {
            [(first, end), (0, 0)]
        } else {
            [(first, self.capacity), (0, end - self.capacity)]
        }
    }
}

/// First and last key of a data page.
#[derive(Debug, Clone, Copy)]
struct PageKeys {
    first: u64,
    last: u64,
}

/// Snapshot of the engine's allocation and derived state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineState {
    /// Next logical data page id.
    pub next_data_page_id: u32,
    /// Oldest live logical data page id.
    pub min_data_page_id: u32,
    /// Physical slot of the oldest live data page.
    pub first_data_page: u32,
    /// Free data slots before reclamation.
    pub num_avail_data_pages: u32,
    /// Smallest live key.
    pub min_key: Option<u64>,
    /// Average key difference between consecutive records.
    pub avg_key_diff: u64,
    /// Largest in-page interpolation error seen.
    pub max_error: Option<u32>,
    /// Next logical index page id.
    pub next_idx_page_id: Option<u32>,
    /// Oldest live logical index page id.
    pub min_idx_page_id: Option<u32>,
    /// Logical id of the var page being filled.
    pub next_var_page_id: Option<u32>,
    /// Physical byte location of the next var write.
    pub current_var_loc: Option<u64>,
    /// Records with a smaller key have lost their var payload.
    pub min_var_record_id: Option<u64>,
    /// Free var slots before reclamation.
    pub num_avail_var_pages: Option<u32>,
}

/// An embedded append-only time-series store.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    layout: PageLayout,
    buffer: PageBuffer,
    data_log: PageLog,
    index_log: Option<PageLog>,
    var: Option<vardata::VarState>,
    index: RadixSpline,
    min_key: Option<u64>,
    last_key: Option<Vec<u8>>,
    avg_key_diff: u64,
    max_error: Option<u32>,
}

impl Engine {
    /// Opens an engine over `devices`.
    ///
    /// With `RESET_DATA` the devices are truncated and the engine starts
    /// empty; otherwise the state is rebuilt from the pages on the devices.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid or the devices do
    /// not match the enabled streams, or `Io` if recovery cannot read a device.
    pub fn open(config: EngineConfig, devices: Devices) -> Result<Self> {
        config.validate()?;
        let params = config.parameters;
        if params.use_index() != devices.index.is_some() {
            return Err(DbError::config("index device must be given exactly when USE_INDEX is set"));
        }
        if params.use_var_data() != devices.var.is_some() {
            return Err(DbError::config("var device must be given exactly when USE_VDATA is set"));
        }

        let layout = PageLayout::new(&config);
        let buffer = PageBuffer::new(config.page_size, devices.data, devices.index, devices.var);
        let mut engine = Self {
            data_log: PageLog::new(config.num_data_pages, config.erase_size_in_pages),
            index_log: params
                .use_index()
                .then(|| PageLog::new(config.num_index_pages, config.erase_size_in_pages)),
            var: None,
            index: Self::new_index(&config, 0),
            min_key: None,
            last_key: None,
            avg_key_diff: 1,
            max_error: None,
            layout,
            buffer,
            config,
        };

        if params.reset_data() {
            engine.buffer.truncate_all()?;
            engine.reset_index_page(0);
            if params.use_var_data() {
                engine.var = Some(vardata::VarState::new(PageLog::new(
                    engine.config.num_var_pages,
                    engine.config.erase_size_in_pages,
                )));
                engine.open_var_page()?;
            }
        } else {
            engine.recover()?;
        }
        engine.buffer.reset_stats();

        debug!(
            header_size = engine.layout.header_size,
            record_size = engine.layout.record_size,
            records_per_page = engine.layout.max_records_per_page,
            buffer_slots = engine.buffer.slot_count(),
            "Opened engine"
        );
        Ok(engine)
    }

    /// Opens an engine over files in `dir`, creating the directory if needed.
    pub fn open_in_dir(config: EngineConfig, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let reset = config.parameters.reset_data();
        let params = config.parameters;

        let mut devices = Devices::new(FileDevice::open(dir.join(DATA_FILE), reset)?);
        if params.use_index() {
            devices = devices.with_index(FileDevice::open(dir.join(INDEX_FILE), reset)?);
        }
        if params.use_var_data() {
            devices = devices.with_var(FileDevice::open(dir.join(VAR_FILE), reset)?);
        }
        Self::open(config, devices)
    }

    fn new_index(config: &EngineConfig, start: u32) -> RadixSpline {
        RadixSpline::new(
            Spline::starting_at(config.num_spline_points, config.index_max_error, u64::from(start)),
            config.radix_bits,
        )
    }

    /// Configuration the engine was opened with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Page geometry.
    pub fn layout(&self) -> &PageLayout {
        &self.layout
    }

    /// Learned index over page minimum keys.
    pub fn index(&self) -> &RadixSpline {
        &self.index
    }

    /// I/O counters since open or the last reset.
    pub fn stats(&self) -> IoStats {
        self.buffer.stats()
    }

    /// Clears the I/O counters.
    pub fn reset_stats(&mut self) {
        self.buffer.reset_stats();
    }

    /// Snapshot of allocation and derived state.
    pub fn state(&self) -> EngineState {
        EngineState {
            next_data_page_id: self.data_log.next_id,
            min_data_page_id: self.data_log.min_id,
            first_data_page: self.data_log.physical(self.data_log.min_id),
            num_avail_data_pages: self.data_log.num_avail,
            min_key: self.min_key,
            avg_key_diff: self.avg_key_diff,
            max_error: self.max_error,
            next_idx_page_id: self.index_log.map(|log| log.next_id),
            min_idx_page_id: self.index_log.map(|log| log.min_id),
            next_var_page_id: self.var.as_ref().map(|v| v.log.next_id),
            current_var_loc: self.var.as_ref().map(|v| v.loc),
            min_var_record_id: self.var.as_ref().map(|v| v.min_record_id),
            num_avail_var_pages: self.var.as_ref().map(|v| v.log.num_avail),
        }
    }

    /// Number of records in the unflushed write page.
    pub fn buffered_records(&self) -> usize {
        self.write_page().count()
    }

    fn write_page(&self) -> DataPage<'_> {
        DataPage::new(self.buffer.write_buf(Stream::Data), &self.layout)
    }

    fn check_record(&self, key: &[u8], data: &[u8]) -> Result<()> {
        if key.len() != self.layout.key_size {
            return Err(DbError::config(format!(
                "key must be {} bytes, got {}",
                self.layout.key_size,
                key.len()
            )));
        }
        if data.len() != self.layout.data_size {
            return Err(DbError::config(format!(
                "data must be {} bytes, got {}",
                self.layout.data_size,
                data.len()
            )));
        }
        if let Some(last) = &self.last_key {
            let (value, last_value) = (key_to_u64(key), key_to_u64(last));
            match (self.config.compare_key)(key, last) {
                Ordering::Equal => return Err(DbError::DuplicateKey(value)),
                // Pages are indexed by unsigned key value.
                Ordering::Greater if value > last_value => {}
                _ => {
                    return Err(DbError::OrderViolation {
                        key: value,
                        last: last_value,
                    })
                }
            }
        }
        Ok(())
    }

    /// Inserts a record.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` or `OrderViolation` if `key` is not larger
    /// than every key inserted so far. A rejected record changes nothing.
    pub fn put(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        self.check_record(key, data)?;
        self.make_room()?;
        self.append(key, data, NO_VAR_DATA);
        Ok(())
    }

    /// Writes the write page if it is full.
    fn make_room(&mut self) -> Result<()> {
        if self.write_page().count() >= self.layout.max_records_per_page {
            self.write_data_page()?;
        }
        Ok(())
    }

    fn append(&mut self, key: &[u8], data: &[u8], var_pointer: u32) {
        let compare_data = self.config.compare_data;
        let mut page = DataPageMut::new(self.buffer.write_buf_mut(Stream::Data), &self.layout);
        page.push(key, data, var_pointer, compare_data);
        if self.layout.has_bitmap() {
            if let Some(policy) = &self.config.bitmap {
                policy.update(data, page.bitmap_mut());
            }
        }
        if self.min_key.is_none() {
            self.min_key = Some(key_to_u64(key));
        }
        match &mut self.last_key {
            Some(last) => last.copy_from_slice(key),
            None => self.last_key = Some(key.to_vec()),
        }
    }

    /// Writes the active data page, and index and var pages it depends on.
    ///
    /// Flushing an empty write page does nothing.
    pub fn flush(&mut self) -> Result<()> {
        if self.write_page().is_empty() {
            return Ok(());
        }
        self.write_data_page()?;
        if self.index_log.is_some() && !self.index_write_page().is_empty() {
            self.write_index_page()?;
            self.reset_index_page(self.data_log.next_id);
        }
        self.buffer.sync()
    }

    /// Syncs the devices and returns them.
    ///
    /// Records still in the write page are not written; call
    /// [`Engine::flush`] first to keep them.
    pub fn close(mut self) -> Result<Devices> {
        self.buffer.sync()?;
        let (data, index, var) = self.buffer.into_devices();
        debug!(next_page = self.data_log.next_id, "Closed engine");
        Ok(Devices { data, index, var })
    }

    fn erase_block(&mut self, stream: Stream, log: PageLog, start: u32) -> Result<()> {
        for (from, to) in log.erase_ranges(start) {
            if to > from {
                self.buffer.erase(stream, from, to)?;
            }
        }
        Ok(())
    }

    /// Writes the data write page to the next slot of the data log.
    ///
    /// Every step that can fail runs before the page is committed. On error
    /// the write page and the learned index are unchanged and the write can
    /// be retried; only an erase block already reclaimed stays reclaimed.
    fn write_data_page(&mut self) -> Result<()> {
        let id = self.data_log.next_id;
        DataPageMut::new(self.buffer.write_buf_mut(Stream::Data), &self.layout).set_id(id);
        let page = DataPage::new(self.buffer.write_buf(Stream::Data), &self.layout);
        let keys = PageKeys {
            first: page.first_key(),
            last: page.last_key(),
        };
        let page_error = page_max_error(&page, self.layout.max_records_per_page);
        let bitmap = page.bitmap().to_vec();

        if let Some(last) = self.index.spline().last_key() {
            if keys.first < last {
                return Err(DbError::OrderViolation {
                    key: keys.first,
                    last,
                });
            }
        }

        if self.var.is_some() {
            self.flush_var_page()?;
        }

        let mut log = self.data_log;
        if let Some(old_min) = log.reserve() {
            self.erase_block(Stream::Data, log, old_min)?;
            let min = self.read_data_page(log.min_id)?;
            // The erased block is gone even if the write below fails.
            self.data_log.min_id = log.min_id;
            self.data_log.num_avail += log.erase_size;
            self.min_key = Some(min.first);
            self.index.spline_mut().erase_below(min.first);
            debug!(
                erased_from = old_min,
                min_page = log.min_id,
                min_key = min.first,
                "Reclaimed data erase block"
            );
        }
        if self.index_log.is_some() {
            self.make_index_room(id)?;
        }
        self.buffer.write_page(Stream::Data, log.physical(id))?;

        log.next_id += 1;
        self.data_log = log;
        self.index.add(keys.first)?;
        if self.index_log.is_some() {
            IndexPageMut::new(self.buffer.write_buf_mut(Stream::Index), &self.layout)
                .push(&bitmap);
        }
        self.update_avg_key_diff(keys.last);
        self.max_error = Some(self.max_error.map_or(page_error, |e| e.max(page_error)));

        DataPageMut::new(self.buffer.write_buf_mut(Stream::Data), &self.layout).clear();
        Ok(())
    }

    fn update_avg_key_diff(&mut self, last_key: u64) {
        let min_key = self.min_key.unwrap_or(last_key);
        let records = u64::from(self.data_log.live_pages().max(1))
            * self.layout.max_records_per_page as u64;
        self.avg_key_diff = (last_key.saturating_sub(min_key) / records).max(1);
    }

    fn index_write_page(&self) -> IndexPage<'_> {
        IndexPage::new(self.buffer.write_buf(Stream::Index), &self.layout)
    }

    fn reset_index_page(&mut self, first_data_page: u32) {
        if self.index_log.is_some() {
            IndexPageMut::new(self.buffer.write_buf_mut(Stream::Index), &self.layout)
                .reset(first_data_page);
        }
    }

    /// Writes the index write page if it is full, so the entry of
    /// `data_page` starts a new one.
    fn make_index_room(&mut self, data_page: u32) -> Result<()> {
        if self.index_write_page().count() >= self.layout.max_idx_records_per_page {
            self.write_index_page()?;
            self.reset_index_page(data_page);
        }
        Ok(())
    }

    fn write_index_page(&mut self) -> Result<()> {
        let Some(mut log) = self.index_log else {
            return Ok(());
        };
        if let Some(old_min) = log.reserve() {
            self.erase_block(Stream::Index, log, old_min)?;
        }
        let id = log.next_id;
        let mut page = IndexPageMut::new(self.buffer.write_buf_mut(Stream::Index), &self.layout);
        page.set_id(id);
        page.seal();
        self.buffer.write_page(Stream::Index, log.physical(id))?;
        log.next_id += 1;
        self.index_log = Some(log);
        debug!(
            index_page = id,
            first_data_page = self.index_write_page().first_data_page(),
            "Wrote index page"
        );
        Ok(())
    }

    /// Reads logical data page `id` into the data read slot.
    fn read_data_page(&mut self, id: u32) -> Result<PageKeys> {
        let physical = self.data_log.physical(id);
        let buf = self.buffer.read_page(Stream::Data, physical)?;
        let page = DataPage::new(buf, &self.layout);
        page.validate(physical)?;
        Ok(PageKeys {
            first: page.first_key(),
            last: page.last_key(),
        })
    }

    /// Slope-based first probe for an in-page search.
    fn page_hint(&self, page: &DataPage<'_>, key: u64) -> Option<usize> {
        self.max_error?;
        let count = page.count();
        if count < 2 {
            return None;
        }
        let first = page.first_key();
        let slope = page.last_key().saturating_sub(first) as f64 / (count - 1) as f64;
        if slope <= 0.0 {
            return None;
        }
        let estimate = (key.checked_sub(first)? as f64 / slope) as usize;
        (estimate > 0 && estimate < count).then_some(estimate)
    }

    /// Finds `key`, copies its data into `out` and returns its var pointer.
    fn lookup(&mut self, key: &[u8], out: &mut [u8]) -> Result<u32> {
        if key.len() != self.layout.key_size || out.len() < self.layout.data_size {
            return Err(DbError::config("key or output buffer has the wrong size"));
        }
        let compare = self.config.compare_key;
        let value = key_to_u64(key);

        let page = self.write_page();
        if !page.is_empty() && compare(key, page.key(0)) != Ordering::Less {
            let hint = self.page_hint(&page, value);
            let index = page.search(key, compare, hint).ok_or(DbError::NotFound)?;
            out[..self.layout.data_size].copy_from_slice(page.data(index));
            return Ok(page.var_pointer(index));
        }

        let Some(min_key) = self.min_key else {
            return Err(DbError::NotFound);
        };
        if self.data_log.live_pages() == 0 || value < min_key {
            return Err(DbError::NotFound);
        }

        match self.config.search_method {
            SearchMethod::ModifiedBinary => self.search_modified_binary(value, min_key)?,
            SearchMethod::Binary => self.search_binary(value)?,
            SearchMethod::Spline => self.search_spline(value, min_key)?,
        }

        let page = DataPage::new(self.buffer.read_buf(Stream::Data), &self.layout);
        let hint = self.page_hint(&page, value);
        let index = page.search(key, compare, hint).ok_or(DbError::NotFound)?;
        out[..self.layout.data_size].copy_from_slice(page.data(index));
        Ok(page.var_pointer(index))
    }

    /// Looks up `key` and copies its data into `out`.
    ///
    /// Records still in the write page are found as well.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is absent or was reclaimed.
    pub fn get(&mut self, key: &[u8], out: &mut [u8]) -> Result<()> {
        self.lookup(key, out).map(|_| ())
    }

    fn live_range(&self) -> (i64, i64) {
        (
            i64::from(self.data_log.min_id),
            i64::from(self.data_log.next_id) - 1,
        )
    }

    /// Leaves the candidate page for `key` in the data read slot.
    fn search_modified_binary(&mut self, key: u64, min_key: u64) -> Result<()> {
        let records = self.layout.max_records_per_page as u64;
        let avg = self.avg_key_diff.max(1);
        let (mut first, mut last) = self.live_range();
        let jump = |distance: u64| i64::try_from(distance / records / avg).unwrap_or(i64::MAX);

        let mut page_id = first.saturating_add(jump(key - min_key)).min(last);
        loop {
            let keys = self.read_data_page(page_id as u32)?;
            trace!(page_id, first, last, "Modified binary search probe");
            if first >= last {
                break;
            }
            if key < keys.first {
                last = page_id - 1;
                let offset = -jump(keys.first - key) - 1;
                page_id = (page_id + offset).max(first);
            } else if key > keys.last {
                first = page_id + 1;
                let offset = jump(key - keys.last).saturating_add(1);
                page_id = page_id.saturating_add(offset).min(last);
            } else {
                break;
            }
        }
        Ok(())
    }

    fn search_binary(&mut self, key: u64) -> Result<()> {
        let (min_page, max_page) = self.live_range();
        let (mut first, mut last) = (min_page, max_page);
        let mut page_id = (first + last) / 2;
        loop {
            let keys = self.read_data_page(page_id as u32)?;
            trace!(page_id, first, last, "Binary search probe");
            if first >= last {
                break;
            }
            if key < keys.first {
                last = page_id - 1;
            } else if key > keys.last {
                first = page_id + 1;
            } else {
                break;
            }
            page_id = ((first + last) / 2).clamp(min_page, max_page);
        }
        Ok(())
    }

    fn search_spline(&mut self, key: u64, min_key: u64) -> Result<()> {
        let (min_page, max_page) = self.live_range();
        let first_point = self.index.spline().point(0).map(|p| p.key);
        let bounds = match (first_point, self.index.find(key)) {
            (Some(first), Ok(bounds)) if first <= key => bounds,
            _ => return self.search_modified_binary(key, min_key),
        };
        let low = (bounds.low.saturating_sub(1) as i64).max(min_page);
        let high = (bounds.high as i64).min(max_page);
        if low > high {
            return self.search_modified_binary(key, min_key);
        }

        let mut page_id = (bounds.location as i64).clamp(low, high);
        loop {
            let keys = self.read_data_page(page_id as u32)?;
            trace!(page_id, low, high, "Spline search probe");
            if key < keys.first {
                if page_id <= low {
                    return Err(DbError::NotFound);
                }
                page_id -= 1;
            } else if key > keys.last {
                if page_id >= high {
                    return Err(DbError::NotFound);
                }
                page_id += 1;
            } else {
                return Ok(());
            }
        }
    }

    /// First logical page that can hold `key`, according to the learned index.
    fn seed_page(&self, key: u64) -> u32 {
        let min_page = self.data_log.min_id;
        let first_point = self.index.spline().point(0).map(|p| p.key);
        match (first_point, self.index.find(key)) {
            (Some(first), Ok(bounds)) if first <= key => {
                let low = bounds.low.saturating_sub(1).min(u64::from(self.data_log.next_id));
                (low as u32).max(min_page)
            }
            _ => min_page,
        }
    }
}

/// Largest distance between a record's slot and its slope-interpolated slot.
fn page_max_error(page: &DataPage<'_>, max_records: usize) -> u32 {
    let count = page.count();
    if count < 2 {
        return 0;
    }
    let first = page.first_key();
    let slope = page.last_key().saturating_sub(first) as f64 / (count - 1) as f64;
    if slope <= 0.0 {
        return max_records as u32;
    }
    let worst = (0..count)
        .map(|i| {
            let estimate = (page.key_u64(i) - first) as f64 / slope;
            (estimate - i as f64).abs()
        })
        .fold(0.0f64, f64::max);
    (worst as u32).min(max_records as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Parameters;
    use tempfile::TempDir;

    fn create_test_engine() -> Engine {
        Engine::open(EngineConfig::default(), Devices::in_memory(&EngineConfig::default())).unwrap()
    }

    fn put_u32(db: &mut Engine, key: u32, value: u32) -> Result<()> {
        db.put(&key.to_le_bytes(), &value.to_le_bytes())
    }

    fn get_u32(db: &mut Engine, key: u32) -> Result<u32> {
        let mut out = [0u8; 4];
        db.get(&key.to_le_bytes(), &mut out)?;
        Ok(u32::from_le_bytes(out))
    }

    #[test]
    fn test_page_log_recovered_matches_runtime() {
        let mut log = PageLog::new(16, 4);
        for next in 1..=60u32 {
            log.reserve();
            log.next_id += 1;
            assert_eq!(log, PageLog::recovered(next, 16, 4), "after {next} pages");
        }
    }

    #[test]
    fn test_erase_ranges_wrap() {
        let log = PageLog::new(10, 4);
        assert_eq!(log.erase_ranges(4), [(4, 8), (0, 0)]);
        assert_eq!(log.erase_ranges(8), [(8, 10), (0, 2)]);
    }

    #[test]
    fn test_put_get_single_page() {
        let mut db = create_test_engine();
        for key in 1..=10u32 {
            put_u32(&mut db, key, key * 10).unwrap();
        }
        assert_eq!(get_u32(&mut db, 7).unwrap(), 70);
        assert!(matches!(get_u32(&mut db, 11), Err(DbError::NotFound)));
        assert_eq!(db.stats().num_writes, 0);
    }

    #[test]
    fn test_rejects_out_of_order_keys() {
        let mut db = create_test_engine();
        put_u32(&mut db, 5, 0).unwrap();
        assert!(matches!(put_u32(&mut db, 5, 1), Err(DbError::DuplicateKey(5))));
        assert!(matches!(
            put_u32(&mut db, 4, 1),
            Err(DbError::OrderViolation { key: 4, last: 5 })
        ));
        assert_eq!(db.buffered_records(), 1);
    }

    /// Orders keys by their low three bytes only.
    fn compare_low_bytes(a: &[u8], b: &[u8]) -> Ordering {
        crate::config::compare_unsigned(&a[..3], &b[..3])
    }

    #[test]
    fn test_rejects_keys_the_comparator_misorders() {
        let config = EngineConfig {
            compare_key: compare_low_bytes,
            ..EngineConfig::default()
        };
        let mut db = Engine::open(config.clone(), Devices::in_memory(&config)).unwrap();
        put_u32(&mut db, 0x0100_0000, 1).unwrap();
        let before = db.state();

        assert!(matches!(
            put_u32(&mut db, 5, 2),
            Err(DbError::OrderViolation {
                key: 5,
                last: 0x0100_0000
            })
        ));
        assert_eq!(db.state(), before);
        assert_eq!(db.buffered_records(), 1);
        put_u32(&mut db, 0x0100_0001, 3).unwrap();
    }

    #[test]
    fn test_flush_writes_partial_index_page() {
        let config = EngineConfig {
            parameters: Parameters::new()
                .with(Parameters::RESET_DATA)
                .with(Parameters::USE_INDEX),
            buffer_size_in_blocks: 4,
            ..EngineConfig::default()
        }
        .with_bitmap(std::sync::Arc::new(crate::bitmap::BucketBitmap::int8()));
        let mut db = Engine::open(config.clone(), Devices::in_memory(&config)).unwrap();
        put_u32(&mut db, 1, 15).unwrap();
        db.flush().unwrap();
        assert_eq!(db.state().next_idx_page_id, Some(1));
        assert!(db.index_write_page().is_empty());
        assert_eq!(db.index_write_page().first_data_page(), 1);

        db.flush().unwrap();
        assert_eq!(db.state().next_idx_page_id, Some(1));
    }

    #[test]
    fn test_pages_written_when_full() {
        let mut db = create_test_engine();
        for key in 0..200u32 {
            put_u32(&mut db, key, key).unwrap();
        }
        // 63 records per 512-byte page with 4-byte keys and data.
        assert_eq!(db.stats().num_writes, 3);
        assert_eq!(db.state().next_data_page_id, 3);
        assert_eq!(db.buffered_records(), 200 - 3 * 63);
        for key in [0u32, 62, 63, 150, 199] {
            assert_eq!(get_u32(&mut db, key).unwrap(), key);
        }
    }

    #[test]
    fn test_flush_is_idempotent() {
        let mut db = create_test_engine();
        put_u32(&mut db, 1, 1).unwrap();
        db.flush().unwrap();
        db.flush().unwrap();
        assert_eq!(db.stats().num_writes, 1);
        assert_eq!(get_u32(&mut db, 1).unwrap(), 1);
    }

    #[test]
    fn test_reclamation_advances_min_key() {
        let config = EngineConfig {
            num_data_pages: 8,
            erase_size_in_pages: 2,
            ..EngineConfig::default()
        };
        let mut db = Engine::open(config.clone(), Devices::in_memory(&config)).unwrap();
        for key in 0..(63 * 12u32) {
            put_u32(&mut db, key, key).unwrap();
        }
        db.flush().unwrap();

        let state = db.state();
        assert_eq!(state.next_data_page_id, 12);
        assert_eq!(state.min_data_page_id, 4);
        assert_eq!(state.first_data_page, 4);
        assert_eq!(state.min_key, Some(4 * 63));
        assert!(matches!(get_u32(&mut db, 10), Err(DbError::NotFound)));
        assert_eq!(get_u32(&mut db, 4 * 63).unwrap(), 4 * 63);
        assert_eq!(get_u32(&mut db, 12 * 63 - 1).unwrap(), 12 * 63 - 1);
    }

    #[test]
    fn test_open_in_dir_requires_matching_devices() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            parameters: Parameters::new().with(Parameters::RESET_DATA),
            ..EngineConfig::default()
        };
        let db = Engine::open_in_dir(config.clone(), dir.path()).unwrap();
        assert!(dir.path().join(DATA_FILE).exists());
        assert!(!dir.path().join(INDEX_FILE).exists());
        drop(db);

        let with_var = EngineConfig {
            parameters: config.parameters.with(Parameters::USE_VDATA),
            buffer_size_in_blocks: 4,
            ..config
        };
        let err = Engine::open(with_var, Devices::new(MemoryDevice::new())).unwrap_err();
        assert!(matches!(err, DbError::Config(_)));
    }

    #[test]
    fn test_page_max_error() {
        let config = EngineConfig::default();
        let layout = PageLayout::new(&config);
        let mut buf = vec![0u8; 512];
        let mut page = DataPageMut::new(&mut buf, &layout);
        for key in [0u32, 1, 2, 30] {
            page.push(&key.to_le_bytes(), &[0; 4], NO_VAR_DATA, crate::config::compare_unsigned);
        }
        // slope 10: key 2 interpolates to slot 0.2 instead of 2.
        assert_eq!(page_max_error(&DataPage::new(&buf, &layout), 63), 1);
    }
}
