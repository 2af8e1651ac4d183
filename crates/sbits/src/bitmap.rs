//! Bitmap summaries over data values.
//!
//! A bitmap partitions the data domain into ordered buckets, one bit per
//! bucket. Bit 0 in [`Msb0`] order (the high bit of the first byte) is the
//! bucket of the smallest values. A page summary is the OR of the buckets
//! of its records; a query bitmap is built from a `[min, max]` range and a
//! page can be skipped only when the two share no bit.

use crate::config::bytes_to_i64;
use bitvec::prelude::*;
use std::fmt;

/// A bucketing policy over data values.
pub trait BitmapPolicy: fmt::Debug + Send + Sync {
    /// Width of a bitmap in bytes.
    fn size(&self) -> usize;

    /// ORs the bucket of `data` into `bitmap`.
    fn update(&self, data: &[u8], bitmap: &mut [u8]);

    /// Returns true if the bucket of `data` is set in `bitmap`.
    fn in_bitmap(&self, data: &[u8], bitmap: &[u8]) -> bool {
        let mut probe = vec![0u8; self.size()];
        self.update(data, &mut probe);
        overlaps(&probe, bitmap)
    }

    /// Fills `bitmap` with every bucket a value in `[min, max]` can fall into.
    ///
    /// A missing bound is unbounded on that side.
    fn build_from_range(&self, min: Option<&[u8]>, max: Option<&[u8]>, bitmap: &mut [u8]) {
        if min.is_none() && max.is_none() {
            bitmap.fill(0xff);
            return;
        }
        bitmap.fill(0);

        let mut start = 0;
        if let Some(min) = min {
            self.update(min, bitmap);
            start = bitmap.view_bits::<Msb0>().first_one().map_or(0, |bit| bit + 1);
        }

        let bits = bitmap.view_bits_mut::<Msb0>();
        match max {
            Some(max) => {
                let mut upper = vec![0u8; self.size()];
                self.update(max, &mut upper);
                if let Some(end) = upper.view_bits::<Msb0>().first_one() {
                    if end >= start {
                        bits[start..=end].fill(true);
                    }
                }
            }
            None => {
                if start < bits.len() {
                    bits[start..].fill(true);
                }
            }
        }
    }
}

/// Returns true if `a` and `b` share at least one set bit.
pub fn overlaps(a: &[u8], b: &[u8]) -> bool {
    a.iter().zip(b).any(|(x, y)| x & y != 0)
}

fn set_bucket(bitmap: &mut [u8], bucket: usize) {
    let bits = bitmap.view_bits_mut::<Msb0>();
    let last = bits.len().saturating_sub(1);
    bits.set(bucket.min(last), true);
}

fn read_value(data: &[u8], width: usize) -> i64 {
    bytes_to_i64(&data[..width.min(data.len())])
}

/// Buckets delimited by explicit upper bounds.
///
/// A value falls in the first bucket whose bound exceeds it; values at or
/// above the last bound share an overflow bucket.
#[derive(Debug, Clone)]
pub struct BucketBitmap {
    bounds: Vec<i64>,
    value_width: usize,
}

impl BucketBitmap {
    /// Creates a policy from ascending upper bounds over a signed
    /// little-endian value of `value_width` bytes at the start of the data.
    pub fn new(bounds: Vec<i64>, value_width: usize) -> Self {
        debug_assert!(bounds.windows(2).all(|w| w[0] < w[1]));
        Self {
            bounds,
            value_width,
        }
    }

    /// One-byte bitmap over an `i32`: bounds 10, 20, 30, 40, 50, 60, 100.
    pub fn int8() -> Self {
        Self::new(vec![10, 20, 30, 40, 50, 60, 100], 4)
    }

    fn bucket(&self, value: i64) -> usize {
        self.bounds.partition_point(|&bound| bound <= value)
    }
}

impl BitmapPolicy for BucketBitmap {
    fn size(&self) -> usize {
        (self.bounds.len() + 1).div_ceil(8)
    }

    fn update(&self, data: &[u8], bitmap: &mut [u8]) {
        let value = read_value(data, self.value_width);
        set_bucket(bitmap, self.bucket(value));
    }
}

/// Evenly spaced buckets above a base value.
///
/// Values at or below `base` land in bucket 0. Each further `step` moves one
/// bucket up, and everything beyond the last bucket is folded into it.
#[derive(Debug, Clone)]
pub struct StepBitmap {
    base: i64,
    step: i64,
    bits: usize,
    value_width: usize,
}

impl StepBitmap {
    /// Creates a policy with `bits` buckets over a signed little-endian value
    /// of `value_width` bytes.
    pub fn new(base: i64, step: i64, bits: usize, value_width: usize) -> Self {
        debug_assert!(step > 0 && bits > 0);
        Self {
            base,
            step,
            bits,
            value_width,
        }
    }

    /// Two-byte bitmap over an `i32`, base 320, step 30.
    pub fn int16() -> Self {
        Self::new(320, 30, 16, 4)
    }

    /// Eight-byte bitmap over an `i32`, base 320, step 10.
    pub fn int64() -> Self {
        Self::new(320, 10, 64, 4)
    }

    fn bucket(&self, value: i64) -> usize {
        if value <= self.base {
            return 0;
        }
        let steps = (value - self.base + self.step - 1) / self.step;
        usize::try_from(steps).map_or(self.bits - 1, |s| s.min(self.bits - 1))
    }
}

impl BitmapPolicy for StepBitmap {
    fn size(&self) -> usize {
        self.bits.div_ceil(8)
    }

    fn update(&self, data: &[u8], bitmap: &mut [u8]) {
        let value = read_value(data, self.value_width);
        set_bucket(bitmap, self.bucket(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits_of(policy: &dyn BitmapPolicy, value: i32) -> Vec<u8> {
        let mut bm = vec![0u8; policy.size()];
        policy.update(&value.to_le_bytes(), &mut bm);
        bm
    }

    #[test]
    fn test_int8_buckets() {
        let policy = BucketBitmap::int8();
        assert_eq!(policy.size(), 1);
        assert_eq!(bits_of(&policy, 5), vec![0x80]);
        assert_eq!(bits_of(&policy, 10), vec![0x40]);
        assert_eq!(bits_of(&policy, 59), vec![0x04]);
        assert_eq!(bits_of(&policy, 99), vec![0x02]);
        assert_eq!(bits_of(&policy, 100), vec![0x01]);
        assert_eq!(bits_of(&policy, -3), vec![0x80]);
    }

    #[test]
    fn test_step_buckets() {
        let policy = StepBitmap::int16();
        assert_eq!(policy.size(), 2);
        assert_eq!(bits_of(&policy, 320), vec![0x80, 0x00]);
        assert_eq!(bits_of(&policy, 321), vec![0x40, 0x00]);
        assert_eq!(bits_of(&policy, 10_000), vec![0x00, 0x01]);

        let wide = StepBitmap::int64();
        assert_eq!(wide.size(), 8);
        let bm = bits_of(&wide, 400);
        assert_eq!(bm.view_bits::<Msb0>().first_one(), Some(8));
    }

    #[test]
    fn test_build_from_range() {
        let policy = BucketBitmap::int8();
        let mut bm = [0u8; 1];

        policy.build_from_range(None, None, &mut bm);
        assert_eq!(bm, [0xff]);

        policy.build_from_range(Some(&25i32.to_le_bytes()), Some(&45i32.to_le_bytes()), &mut bm);
        assert_eq!(bm, [0b0011_1000]);

        policy.build_from_range(Some(&21i32.to_le_bytes()), Some(&22i32.to_le_bytes()), &mut bm);
        assert_eq!(bm, [0b0010_0000]);

        policy.build_from_range(Some(&55i32.to_le_bytes()), None, &mut bm);
        assert_eq!(bm, [0b0000_0111]);

        policy.build_from_range(None, Some(&15i32.to_le_bytes()), &mut bm);
        assert_eq!(bm, [0b1100_0000]);
    }

    #[test]
    fn test_in_bitmap() {
        let policy = StepBitmap::int16();
        let mut query = [0u8; 2];
        policy.build_from_range(Some(&330i32.to_le_bytes()), Some(&400i32.to_le_bytes()), &mut query);
        assert!(policy.in_bitmap(&350i32.to_le_bytes(), &query));
        assert!(!policy.in_bitmap(&300i32.to_le_bytes(), &query));
        assert!(!policy.in_bitmap(&900i32.to_le_bytes(), &query));
    }
}
