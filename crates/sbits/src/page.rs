//! Page layouts and typed page views.
//!
//! # Data page
//!
//! ```text
//! +---------+-------+----------+---------------------------------------+---------+
//! | id (4)  | count | bitmap   | min key | max key | min data | max data | records |
//! |         | (2)   | (b)      | (k)     | (k)     | (d)      | (d)      |         |
//! +---------+-------+----------+---------------------------------------+---------+
//! ```
//!
//! The bitmap is present when a bitmap or the index is enabled, the four
//! min/max fields only with `USE_MAX_MIN`. A record is `key || data`,
//! followed by a 4-byte var pointer when variable data is enabled.
//!
//! # Index page
//!
//! ```text
//! | id (4) | count (2) | pad (2) | first data page (4) | crc32 (4) | bitmaps ... |
//! ```
//!
//! # Var page
//!
//! ```text
//! | id (4) | first live key (k) | payload stream ... |
//! ```
//!
//! All integers are little-endian.

use crate::config::{key_to_u64, CompareFn, EngineConfig};
use crate::error::{DbError, Result};
use std::cmp::Ordering;

/// Size of the id and count fields shared by data and index pages.
pub const BASE_HEADER_SIZE: usize = 6;

/// Size of the index page header.
pub const INDEX_HEADER_SIZE: usize = 16;

/// Size of a var pointer stored after each record.
pub const VAR_POINTER_SIZE: usize = 4;

/// Var pointer value for a record without variable data.
pub const NO_VAR_DATA: u32 = u32::MAX;

const COUNT_OFFSET: usize = 4;
const INDEX_FIRST_PAGE_OFFSET: usize = 8;
const INDEX_CRC_OFFSET: usize = 12;

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

#[inline]
fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

/// Derived page geometry for one engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageLayout {
    /// Page size in bytes.
    pub page_size: usize,
    /// Key width in bytes.
    pub key_size: usize,
    /// Data width in bytes.
    pub data_size: usize,
    /// Bytes per stored record, including the var pointer if any.
    pub record_size: usize,
    /// Width of the bitmap stored in data page headers and index entries.
    pub bitmap_size: usize,
    /// Data page header size.
    pub header_size: usize,
    /// Records that fit in one data page.
    pub max_records_per_page: usize,
    /// Bitmap entries that fit in one index page.
    pub max_idx_records_per_page: usize,
    /// Var page header size.
    pub var_header_size: usize,
    has_bitmap: bool,
    has_max_min: bool,
    has_var_data: bool,
}

impl PageLayout {
    /// Computes the layout for `config`.
    pub fn new(config: &EngineConfig) -> Self {
        let params = config.parameters;
        let has_bitmap = (params.use_bitmap() || params.use_index()) && config.bitmap_size > 0;
        let bitmap_size = if has_bitmap { config.bitmap_size } else { 0 };
        let has_max_min = params.use_max_min();
        let has_var_data = params.use_var_data();

        let mut header_size = BASE_HEADER_SIZE + bitmap_size;
        if has_max_min {
            header_size += 2 * config.key_size + 2 * config.data_size;
        }
        let mut record_size = config.key_size + config.data_size;
        if has_var_data {
            record_size += VAR_POINTER_SIZE;
        }
        let max_records_per_page = config.page_size.saturating_sub(header_size) / record_size.max(1);
        let max_idx_records_per_page = if bitmap_size > 0 {
            config.page_size.saturating_sub(INDEX_HEADER_SIZE) / bitmap_size
        } else {
            0
        };

        Self {
            page_size: config.page_size,
            key_size: config.key_size,
            data_size: config.data_size,
            record_size,
            bitmap_size,
            header_size,
            max_records_per_page,
            max_idx_records_per_page,
            var_header_size: 4 + config.key_size,
            has_bitmap,
            has_max_min,
            has_var_data,
        }
    }

    /// Returns true if data page headers carry a bitmap.
    pub fn has_bitmap(&self) -> bool {
        self.has_bitmap
    }

    /// Returns true if data page headers carry min/max fields.
    pub fn has_max_min(&self) -> bool {
        self.has_max_min
    }

    /// Returns true if records carry a var pointer.
    pub fn has_var_data(&self) -> bool {
        self.has_var_data
    }

    fn min_key_offset(&self) -> usize {
        BASE_HEADER_SIZE + self.bitmap_size
    }

    fn record_offset(&self, index: usize) -> usize {
        self.header_size + index * self.record_size
    }
}

/// Read-only view of a data page.
#[derive(Debug, Clone, Copy)]
pub struct DataPage<'a> {
    buf: &'a [u8],
    layout: &'a PageLayout,
}

impl<'a> DataPage<'a> {
    /// Wraps `buf`, which must be one page long.
    pub fn new(buf: &'a [u8], layout: &'a PageLayout) -> Self {
        debug_assert_eq!(buf.len(), layout.page_size);
        Self { buf, layout }
    }

    /// Logical page id.
    pub fn id(&self) -> u32 {
        read_u32(self.buf, 0)
    }

    /// Number of records.
    pub fn count(&self) -> usize {
        usize::from(read_u16(self.buf, COUNT_OFFSET))
    }

    /// Returns true if the page holds no records.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Checks that the header describes a plausible page.
    pub fn validate(&self, physical: u32) -> Result<()> {
        let count = self.count();
        if count == 0 {
            return Err(DbError::InvalidPage {
                page: physical,
                reason: "empty page",
            });
        }
        if count > self.layout.max_records_per_page {
            return Err(DbError::InvalidPage {
                page: physical,
                reason: "record count exceeds page capacity",
            });
        }
        Ok(())
    }

    /// Bitmap summary, empty if the layout has none.
    pub fn bitmap(&self) -> &'a [u8] {
        &self.buf[BASE_HEADER_SIZE..BASE_HEADER_SIZE + self.layout.bitmap_size]
    }

    /// Minimum data value header field.
    pub fn min_data(&self) -> Option<&'a [u8]> {
        self.max_min_field(2 * self.layout.key_size, self.layout.data_size)
    }

    /// Maximum data value header field.
    pub fn max_data(&self) -> Option<&'a [u8]> {
        self.max_min_field(
            2 * self.layout.key_size + self.layout.data_size,
            self.layout.data_size,
        )
    }

    /// Minimum key header field.
    pub fn min_key_field(&self) -> Option<&'a [u8]> {
        self.max_min_field(0, self.layout.key_size)
    }

    /// Maximum key header field.
    pub fn max_key_field(&self) -> Option<&'a [u8]> {
        self.max_min_field(self.layout.key_size, self.layout.key_size)
    }

    fn max_min_field(&self, delta: usize, len: usize) -> Option<&'a [u8]> {
        if !self.layout.has_max_min {
            return None;
        }
        let start = self.layout.min_key_offset() + delta;
        Some(&self.buf[start..start + len])
    }

    /// Key of record `index`.
    pub fn key(&self, index: usize) -> &'a [u8] {
        let start = self.layout.record_offset(index);
        &self.buf[start..start + self.layout.key_size]
    }

    /// Key of record `index` as an integer.
    pub fn key_u64(&self, index: usize) -> u64 {
        key_to_u64(self.key(index))
    }

    /// Data of record `index`.
    pub fn data(&self, index: usize) -> &'a [u8] {
        let start = self.layout.record_offset(index) + self.layout.key_size;
        &self.buf[start..start + self.layout.data_size]
    }

    /// Var pointer of record `index`, or `NO_VAR_DATA`.
    pub fn var_pointer(&self, index: usize) -> u32 {
        if !self.layout.has_var_data {
            return NO_VAR_DATA;
        }
        read_u32(
            self.buf,
            self.layout.record_offset(index) + self.layout.key_size + self.layout.data_size,
        )
    }

    /// Smallest key in the page.
    pub fn first_key(&self) -> u64 {
        self.key_u64(0)
    }

    /// Largest key in the page.
    pub fn last_key(&self) -> u64 {
        self.key_u64(self.count().saturating_sub(1))
    }

    /// Binary search for `key` among the first `count` records.
    ///
    /// `hint` is probed first when it is in range.
    pub fn search(&self, key: &[u8], compare: CompareFn, hint: Option<usize>) -> Option<usize> {
        let count = self.count();
        if count == 0 {
            return None;
        }
        let mut first = 0usize;
        let mut last = count - 1;
        let mut middle = match hint {
            Some(h) if h < count => h,
            _ => count / 2,
        };
        loop {
            match compare(self.key(middle), key) {
                Ordering::Equal => return Some(middle),
                Ordering::Less => first = middle + 1,
                Ordering::Greater => {
                    if middle == 0 {
                        return None;
                    }
                    last = middle - 1;
                }
            }
            if first > last {
                return None;
            }
            middle = first + (last - first) / 2;
        }
    }
}

/// Mutable view of a data page.
#[derive(Debug)]
pub struct DataPageMut<'a> {
    buf: &'a mut [u8],
    layout: &'a PageLayout,
}

impl<'a> DataPageMut<'a> {
    /// Wraps `buf`, which must be one page long.
    pub fn new(buf: &'a mut [u8], layout: &'a PageLayout) -> Self {
        debug_assert_eq!(buf.len(), layout.page_size);
        Self { buf, layout }
    }

    /// Read-only view of the same page.
    pub fn as_page(&self) -> DataPage<'_> {
        DataPage::new(self.buf, self.layout)
    }

    /// Zeroes the page.
    pub fn clear(&mut self) {
        self.buf.fill(0);
    }

    /// Sets the logical page id.
    pub fn set_id(&mut self, id: u32) {
        write_u32(self.buf, 0, id);
    }

    fn set_count(&mut self, count: usize) {
        let count = count as u16;
        self.buf[COUNT_OFFSET..COUNT_OFFSET + 2].copy_from_slice(&count.to_le_bytes());
    }

    /// Mutable bitmap summary.
    pub fn bitmap_mut(&mut self) -> &mut [u8] {
        &mut self.buf[BASE_HEADER_SIZE..BASE_HEADER_SIZE + self.layout.bitmap_size]
    }

    /// Appends a record and updates the min/max header fields.
    ///
    /// The caller has checked that the page has room and that `key` is
    /// larger than every key already present.
    pub fn push(&mut self, key: &[u8], data: &[u8], var_pointer: u32, compare_data: CompareFn) {
        let layout = self.layout;
        let count = self.as_page().count();
        debug_assert!(count < layout.max_records_per_page);

        let start = layout.record_offset(count);
        self.buf[start..start + layout.key_size].copy_from_slice(key);
        let data_start = start + layout.key_size;
        self.buf[data_start..data_start + layout.data_size].copy_from_slice(data);
        if layout.has_var_data {
            write_u32(self.buf, data_start + layout.data_size, var_pointer);
        }
        self.set_count(count + 1);

        if layout.has_max_min {
            let k = layout.key_size;
            let d = layout.data_size;
            let base = layout.min_key_offset();
            if count == 0 {
                self.buf[base..base + k].copy_from_slice(key);
                self.buf[base + 2 * k..base + 2 * k + d].copy_from_slice(data);
                self.buf[base + 2 * k + d..base + 2 * k + 2 * d].copy_from_slice(data);
            } else {
                let min = base + 2 * k;
                if compare_data(data, &self.buf[min..min + d]) == Ordering::Less {
                    self.buf[min..min + d].copy_from_slice(data);
                }
                let max = min + d;
                if compare_data(data, &self.buf[max..max + d]) == Ordering::Greater {
                    self.buf[max..max + d].copy_from_slice(data);
                }
            }
            self.buf[base + k..base + 2 * k].copy_from_slice(key);
        }
    }
}

/// Read-only view of an index page.
#[derive(Debug, Clone, Copy)]
pub struct IndexPage<'a> {
    buf: &'a [u8],
    layout: &'a PageLayout,
}

impl<'a> IndexPage<'a> {
    /// Wraps `buf`, which must be one page long.
    pub fn new(buf: &'a [u8], layout: &'a PageLayout) -> Self {
        Self { buf, layout }
    }

    /// Logical page id.
    pub fn id(&self) -> u32 {
        read_u32(self.buf, 0)
    }

    /// Number of bitmap entries.
    pub fn count(&self) -> usize {
        usize::from(read_u16(self.buf, COUNT_OFFSET))
    }

    /// Returns true if the page holds no entries.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Logical id of the data page described by entry 0.
    pub fn first_data_page(&self) -> u32 {
        read_u32(self.buf, INDEX_FIRST_PAGE_OFFSET)
    }

    /// Stored checksum.
    pub fn stored_checksum(&self) -> u32 {
        read_u32(self.buf, INDEX_CRC_OFFSET)
    }

    /// Checksum of the entry area.
    pub fn compute_checksum(&self) -> u32 {
        let count = self.count().min(self.layout.max_idx_records_per_page);
        let end = INDEX_HEADER_SIZE + count * self.layout.bitmap_size;
        crc32fast::hash(&self.buf[INDEX_HEADER_SIZE..end])
    }

    /// Checks the entry count and checksum.
    pub fn verify(&self) -> Result<()> {
        if self.count() == 0 || self.count() > self.layout.max_idx_records_per_page {
            return Err(DbError::InvalidPage {
                page: self.id(),
                reason: "index entry count out of range",
            });
        }
        let expected = self.stored_checksum();
        let actual = self.compute_checksum();
        if expected != actual {
            return Err(DbError::ChecksumMismatch {
                page: self.id(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Bitmap entry `index`.
    pub fn entry(&self, index: usize) -> &'a [u8] {
        let start = INDEX_HEADER_SIZE + index * self.layout.bitmap_size;
        &self.buf[start..start + self.layout.bitmap_size]
    }

    /// Bitmap entry for logical data page `data_page`, if this page covers it.
    pub fn entry_for(&self, data_page: u32) -> Option<&'a [u8]> {
        let first = self.first_data_page();
        let offset = data_page.checked_sub(first)? as usize;
        (offset < self.count()).then(|| self.entry(offset))
    }
}

/// Mutable view of an index page.
#[derive(Debug)]
pub struct IndexPageMut<'a> {
    buf: &'a mut [u8],
    layout: &'a PageLayout,
}

impl<'a> IndexPageMut<'a> {
    /// Wraps `buf`, which must be one page long.
    pub fn new(buf: &'a mut [u8], layout: &'a PageLayout) -> Self {
        Self { buf, layout }
    }

    /// Read-only view of the same page.
    pub fn as_page(&self) -> IndexPage<'_> {
        IndexPage::new(self.buf, self.layout)
    }

    /// Zeroes the page and records the first covered data page.
    pub fn reset(&mut self, first_data_page: u32) {
        self.buf.fill(0);
        write_u32(self.buf, INDEX_FIRST_PAGE_OFFSET, first_data_page);
    }

    /// Sets the logical page id.
    pub fn set_id(&mut self, id: u32) {
        write_u32(self.buf, 0, id);
    }

    /// Appends a bitmap entry.
    pub fn push(&mut self, bitmap: &[u8]) {
        let count = self.as_page().count();
        let start = INDEX_HEADER_SIZE + count * self.layout.bitmap_size;
        self.buf[start..start + self.layout.bitmap_size].copy_from_slice(bitmap);
        let count = (count + 1) as u16;
        self.buf[COUNT_OFFSET..COUNT_OFFSET + 2].copy_from_slice(&count.to_le_bytes());
    }

    /// Stores the checksum of the current entries.
    pub fn seal(&mut self) {
        let crc = self.as_page().compute_checksum();
        write_u32(self.buf, INDEX_CRC_OFFSET, crc);
    }
}

/// Logical id of a var page.
pub fn var_page_id(buf: &[u8]) -> u32 {
    read_u32(buf, 0)
}

/// First live key header of a var page.
pub fn var_first_live_key(buf: &[u8], key_size: usize) -> u64 {
    key_to_u64(&buf[4..4 + key_size])
}

/// Writes the var page header.
pub fn write_var_header(buf: &mut [u8], id: u32, first_live_key: u64, key_size: usize) {
    write_u32(buf, 0, id);
    let bytes = first_live_key.to_le_bytes();
    buf[4..4 + key_size].copy_from_slice(&bytes[..key_size]);
}
