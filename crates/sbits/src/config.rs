//! Engine configuration.
//!
//! An [`EngineConfig`] fixes the record geometry, the capacity of each
//! circular page log, the optional features, and the callbacks used to
//! compare keys and values. It is validated once in
//! [`Engine::open`](crate::Engine::open); the engine never starts with a
//! configuration that fails [`EngineConfig::validate`].

use crate::bitmap::BitmapPolicy;
use crate::error::{DbError, Result};
use crate::radix::MAX_RADIX_BITS;
use std::cmp::Ordering;
use std::sync::Arc;

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 512;

/// Default key size in bytes.
pub const DEFAULT_KEY_SIZE: usize = 4;

/// Default data size in bytes.
pub const DEFAULT_DATA_SIZE: usize = 4;

/// Default number of page-sized buffer slots.
pub const DEFAULT_BUFFER_BLOCKS: usize = 2;

/// Default data log capacity in pages.
pub const DEFAULT_DATA_PAGES: u32 = 1000;

/// Default index log capacity in pages.
pub const DEFAULT_INDEX_PAGES: u32 = 48;

/// Default variable data log capacity in pages.
pub const DEFAULT_VAR_PAGES: u32 = 1000;

/// Default erase block size in pages.
pub const DEFAULT_ERASE_SIZE: u32 = 4;

/// Default spline point capacity.
pub const DEFAULT_SPLINE_POINTS: usize = 300;

/// Default spline error bound, in pages.
pub const DEFAULT_INDEX_MAX_ERROR: u32 = 1;

/// Byte comparator for keys and values.
pub type CompareFn = fn(&[u8], &[u8]) -> Ordering;

/// Compares two little-endian unsigned integers of equal width.
pub fn compare_unsigned(a: &[u8], b: &[u8]) -> Ordering {
    debug_assert_eq!(a.len(), b.len());
    a.iter().rev().cmp(b.iter().rev())
}

/// Returns true if `compare` agrees with unsigned order on `size`-byte keys
/// whose top bits differ.
fn orders_unsigned(compare: CompareFn, size: usize) -> bool {
    let high = vec![0xffu8; size];
    let mut low = vec![0u8; size];
    low[0] = 1;
    compare(&high, &low) == Ordering::Greater && compare(&low, &high) == Ordering::Less
}

/// Compares two little-endian two's complement integers of equal width.
pub fn compare_signed(a: &[u8], b: &[u8]) -> Ordering {
    debug_assert_eq!(a.len(), b.len());
    let (Some(&hi_a), Some(&hi_b)) = (a.last(), b.last()) else {
        return Ordering::Equal;
    };
    let neg_a = hi_a & 0x80 != 0;
    let neg_b = hi_b & 0x80 != 0;
    match (neg_a, neg_b) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => compare_unsigned(a, b),
    }
}

/// Decodes up to 8 little-endian bytes as an unsigned integer.
pub fn key_to_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(buf)
}

/// Encodes `value` into `out` as little-endian, truncating to `out.len()`.
pub fn u64_to_key(value: u64, out: &mut [u8]) {
    let bytes = value.to_le_bytes();
    let n = out.len().min(8);
    out[..n].copy_from_slice(&bytes[..n]);
}

/// Decodes up to 8 little-endian bytes as a sign-extended integer.
pub fn bytes_to_i64(bytes: &[u8]) -> i64 {
    let n = bytes.len().min(8);
    if n == 0 {
        return 0;
    }
    let fill = if bytes[n - 1] & 0x80 != 0 { 0xff } else { 0 };
    let mut buf = [fill; 8];
    buf[..n].copy_from_slice(&bytes[..n]);
    i64::from_le_bytes(buf)
}

/// Optional engine features, stored as a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Parameters(u8);

impl Parameters {
    /// Maintain a secondary index file of per-page bitmaps.
    pub const USE_INDEX: u8 = 0b0000_0001;
    /// Track min/max key and data in each data page header.
    pub const USE_MAX_MIN: u8 = 0b0000_0010;
    /// Maintain a bitmap summary in each data page header.
    pub const USE_BMAP: u8 = 0b0000_0100;
    /// Enable the variable-length data log.
    pub const USE_VDATA: u8 = 0b0000_1000;
    /// Discard existing files on open instead of recovering them.
    pub const RESET_DATA: u8 = 0b0001_0000;

    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self(0)
    }

    /// Creates a parameter set from raw bits.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Returns a copy with `flag` set.
    pub fn with(self, flag: u8) -> Self {
        Self(self.0 | flag)
    }

    /// Returns a copy with `flag` cleared.
    pub fn without(self, flag: u8) -> Self {
        Self(self.0 & !flag)
    }

    /// Returns true if the index file is enabled.
    pub fn use_index(self) -> bool {
        self.0 & Self::USE_INDEX != 0
    }

    /// Returns true if page headers carry min/max fields.
    pub fn use_max_min(self) -> bool {
        self.0 & Self::USE_MAX_MIN != 0
    }

    /// Returns true if page headers carry a bitmap summary.
    pub fn use_bitmap(self) -> bool {
        self.0 & Self::USE_BMAP != 0
    }

    /// Returns true if variable-length data is enabled.
    pub fn use_var_data(self) -> bool {
        self.0 & Self::USE_VDATA != 0
    }

    /// Returns true if existing files are discarded on open.
    pub fn reset_data(self) -> bool {
        self.0 & Self::RESET_DATA != 0
    }
}

/// Strategy used by `get` to locate the data page holding a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMethod {
    /// Binary search seeded by the average key difference, with offset jumps.
    #[default]
    ModifiedBinary,
    /// Plain binary search over the live page range.
    Binary,
    /// Spline (and radix table, if enabled) estimate followed by a bounded walk.
    Spline,
}

/// Configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Key width in bytes (1..=8).
    pub key_size: usize,
    /// Fixed data width in bytes.
    pub data_size: usize,
    /// Page size in bytes.
    pub page_size: usize,
    /// Number of page-sized buffer slots.
    pub buffer_size_in_blocks: usize,
    /// Data log capacity in pages.
    pub num_data_pages: u32,
    /// Index log capacity in pages.
    pub num_index_pages: u32,
    /// Variable data log capacity in pages.
    pub num_var_pages: u32,
    /// Reclamation granularity in pages.
    pub erase_size_in_pages: u32,
    /// Maximum number of spline points kept in memory.
    pub num_spline_points: usize,
    /// Spline error bound in pages.
    pub index_max_error: u32,
    /// Radix table width in bits, at most [`MAX_RADIX_BITS`]; 0 disables the table.
    pub radix_bits: u8,
    /// Bitmap summary width in bytes.
    pub bitmap_size: usize,
    /// Optional features.
    pub parameters: Parameters,
    /// Page search strategy for `get`.
    pub search_method: SearchMethod,
    /// Key comparator.
    ///
    /// Keys are ordered as unsigned little-endian integers; the comparator
    /// must agree with that order.
    pub compare_key: CompareFn,
    /// Data comparator, used by iterator predicates and min/max tracking.
    pub compare_data: CompareFn,
    /// Bitmap bucketing policy.
    pub bitmap: Option<Arc<dyn BitmapPolicy>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key_size: DEFAULT_KEY_SIZE,
            data_size: DEFAULT_DATA_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            buffer_size_in_blocks: DEFAULT_BUFFER_BLOCKS,
            num_data_pages: DEFAULT_DATA_PAGES,
            num_index_pages: DEFAULT_INDEX_PAGES,
            num_var_pages: DEFAULT_VAR_PAGES,
            erase_size_in_pages: DEFAULT_ERASE_SIZE,
            num_spline_points: DEFAULT_SPLINE_POINTS,
            index_max_error: DEFAULT_INDEX_MAX_ERROR,
            radix_bits: 0,
            bitmap_size: 0,
            parameters: Parameters::new().with(Parameters::RESET_DATA),
            search_method: SearchMethod::default(),
            compare_key: compare_unsigned,
            compare_data: compare_unsigned,
            bitmap: None,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with the given record geometry and defaults elsewhere.
    pub fn new(key_size: usize, data_size: usize, page_size: usize) -> Self {
        Self {
            key_size,
            data_size,
            page_size,
            ..Self::default()
        }
    }

    /// Installs a bitmap policy and sets the bitmap size to match it.
    pub fn with_bitmap(mut self, policy: Arc<dyn BitmapPolicy>) -> Self {
        self.bitmap_size = policy.size();
        self.bitmap = Some(policy);
        self.parameters = self.parameters.with(Parameters::USE_BMAP);
        self
    }

    /// Number of buffer slots the enabled features require.
    pub fn required_buffer_blocks(&self) -> usize {
        2 + 2 * usize::from(self.parameters.use_index())
            + 2 * usize::from(self.parameters.use_var_data())
    }

    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let params = self.parameters;
        if self.key_size == 0 || self.key_size > 8 {
            return Err(DbError::config(format!(
                "key size must be between 1 and 8 bytes, got {}",
                self.key_size
            )));
        }
        if self.data_size == 0 {
            return Err(DbError::config("data size must be non-zero"));
        }
        if self.erase_size_in_pages == 0 {
            return Err(DbError::config("erase size must be non-zero"));
        }
        if self.page_size < 16 {
            return Err(DbError::config("page size must be at least 16 bytes"));
        }
        if self.num_spline_points < 2 {
            return Err(DbError::config("spline needs room for at least two points"));
        }
        if self.radix_bits > MAX_RADIX_BITS {
            return Err(DbError::config(format!(
                "radix table width must be at most {MAX_RADIX_BITS} bits, got {}",
                self.radix_bits
            )));
        }
        if !orders_unsigned(self.compare_key, self.key_size) {
            return Err(DbError::config(
                "key comparator must order keys as unsigned integers",
            ));
        }

        let min_pages = (2 * u32::from(params.use_index()) + 2) * self.erase_size_in_pages;
        if self.num_data_pages < min_pages {
            return Err(DbError::config(format!(
                "{} data pages configured, at least {} required",
                self.num_data_pages, min_pages
            )));
        }
        if params.use_index() && self.num_index_pages < 2 * self.erase_size_in_pages {
            return Err(DbError::config(
                "index log must hold at least two erase blocks",
            ));
        }
        if params.use_var_data() && self.num_var_pages < 2 * self.erase_size_in_pages {
            return Err(DbError::config(
                "variable data log must hold at least two erase blocks",
            ));
        }

        let required = self.required_buffer_blocks();
        if self.buffer_size_in_blocks < required {
            return Err(DbError::config(format!(
                "{} buffer blocks configured, {} required",
                self.buffer_size_in_blocks, required
            )));
        }

        if params.use_bitmap() || params.use_index() {
            let Some(policy) = &self.bitmap else {
                return Err(DbError::config("bitmap index requires a bitmap policy"));
            };
            if self.bitmap_size == 0 || policy.size() != self.bitmap_size {
                return Err(DbError::config(format!(
                    "bitmap size {} does not match policy size {}",
                    self.bitmap_size,
                    policy.size()
                )));
            }
        }

        let layout = crate::page::PageLayout::new(self);
        if layout.max_records_per_page == 0 {
            return Err(DbError::config(format!(
                "page size {} cannot hold a single {}-byte record after a {}-byte header",
                self.page_size, layout.record_size, layout.header_size
            )));
        }
        if params.use_index() && layout.max_idx_records_per_page == 0 {
            return Err(DbError::config("page size cannot hold an index entry"));
        }
        if params.use_var_data() && layout.var_header_size >= self.page_size {
            return Err(DbError::config("page size cannot hold a variable data header"));
        }
        if params.use_var_data()
            && u64::from(self.num_var_pages) * self.page_size as u64 >= u64::from(u32::MAX)
        {
            return Err(DbError::config(
                "variable data log is too large for 32-bit record pointers",
            ));
        }
        Ok(())
    }
}
