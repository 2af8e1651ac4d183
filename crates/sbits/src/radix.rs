//! Radix table over spline points.
//!
//! The table maps the top `bits` bits of `key - min_key` to the position of
//! the first spline point carrying that prefix, so a lookup only searches
//! the handful of points between two adjacent table entries. With zero bits
//! there is no table and lookups search every point.
//!
//! Only committed spline points are registered. The spline's last point
//! moves with every new key, so keys past the last registered point search
//! from that point to the end.

use crate::error::Result;
use crate::spline::{Spline, SplineBounds};

const EMPTY: u32 = u32::MAX;

/// Widest radix table supported.
pub const MAX_RADIX_BITS: u8 = 24;

/// A spline with an optional radix accelerator.
#[derive(Debug, Clone)]
pub struct RadixSpline {
    spline: Spline,
    bits: u8,
    table: Vec<u32>,
    shift: u32,
    min_key: u64,
    prev_prefix: usize,
    points_seen: u64,
}

impl RadixSpline {
    /// Creates an empty index. Widths above [`MAX_RADIX_BITS`] are clamped.
    pub fn new(spline: Spline, bits: u8) -> Self {
        Self {
            spline,
            bits: bits.min(MAX_RADIX_BITS),
            table: Vec::new(),
            shift: 0,
            min_key: 0,
            prev_prefix: 0,
            points_seen: 0,
        }
    }

    /// Underlying spline.
    pub fn spline(&self) -> &Spline {
        &self.spline
    }

    /// Mutable underlying spline.
    pub fn spline_mut(&mut self) -> &mut Spline {
        &mut self.spline
    }

    /// Radix table width in bits.
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Current prefix shift.
    pub fn shift(&self) -> u32 {
        self.shift
    }

    fn size(&self) -> usize {
        1usize << self.bits
    }

    /// Adds a key to the spline and registers any newly committed point.
    pub fn add(&mut self, key: u64) -> Result<()> {
        self.spline.add(key)?;
        if self.bits == 0 {
            return Ok(());
        }
        while self.points_seen < self.spline.committed_points() {
            let point = self
                .points_seen
                .checked_sub(self.spline.dropped())
                .and_then(|p| self.spline.point(p as usize));
            match point {
                Some(point) => self.register(point.key),
                // Evicted before it was registered.
                None => self.points_seen += 1,
            }
        }
        Ok(())
    }

    fn register(&mut self, key: u64) {
        if self.table.is_empty() {
            self.table = vec![EMPTY; self.size()];
            self.min_key = key;
        }

        let diff = key - self.min_key;
        let used = 64 - diff.leading_zeros();
        let new_shift = used.saturating_sub(u32::from(self.bits));
        if new_shift > self.shift {
            self.rebuild(new_shift - self.shift);
            self.shift = new_shift;
        }

        let prefix = (diff >> self.shift) as usize;
        let seen = self.points_seen as u32;
        if prefix != self.prev_prefix {
            for entry in &mut self.table[self.prev_prefix..prefix] {
                *entry = seen;
            }
            self.prev_prefix = prefix;
        }
        self.table[prefix] = seen;
        self.points_seen += 1;
    }

    fn rebuild(&mut self, amount: u32) {
        let size = self.size();
        let keep = size.checked_shr(amount).unwrap_or(0);
        for i in 0..keep {
            self.table[i] = self.table[i << amount];
        }
        for entry in &mut self.table[keep..] {
            *entry = EMPTY;
        }
        self.prev_prefix = self.prev_prefix.checked_shr(amount).unwrap_or(0);
    }

    /// Range of point positions that may bracket `key`.
    fn candidate_range(&self, key: u64) -> Option<(usize, usize)> {
        if self.bits == 0 || self.table.is_empty() || key < self.min_key {
            return None;
        }
        let len = self.spline.len();
        if len < 2 {
            return None;
        }
        let size = self.size() as u64;
        let dropped = self.spline.dropped();
        let to_position = |entry: u32| -> usize {
            if entry == EMPTY {
                len - 1
            } else {
                (u64::from(entry).saturating_sub(dropped) as usize).min(len - 1)
            }
        };
        let last_registered = to_position((self.points_seen - 1) as u32);

        let diff = key - self.min_key;
        let prefix = diff >> self.shift;
        if prefix >= size {
            return Some((last_registered.max(1), len - 1));
        }
        let prefix = prefix as usize;

        let end = if diff == (prefix as u64) << self.shift {
            self.table[prefix]
        } else if prefix + 1 < size as usize {
            self.table[prefix + 1]
        } else {
            EMPTY
        };
        let begin = match prefix {
            0 => 0,
            _ if self.table[prefix - 1] == EMPTY => last_registered,
            _ => to_position(self.table[prefix - 1]),
        };
        Some((begin.max(1), to_position(end).max(1)))
    }

    /// Location of `key` with error bounds.
    pub fn find(&self, key: u64) -> Result<SplineBounds> {
        self.spline.find_with_hint(key, self.candidate_range(key))
    }
}
