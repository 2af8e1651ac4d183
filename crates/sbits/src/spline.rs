//! Greedy spline corridor over a non-decreasing key stream.
//!
//! Keys are added one at a time and mapped to consecutive locations. The
//! spline keeps a set of control points such that interpolating between the
//! two points bracketing a key predicts its location within `max_error`.
//! The construction is the GreedySplineCorridor of Neumann and Michel
//! ("Smooth interpolating histograms with error guarantees", BNCOD 2008).

use crate::error::{DbError, Result};
use std::collections::VecDeque;
use tracing::warn;

/// A control point mapping a key to a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SplinePoint {
    /// Key.
    pub key: u64,
    /// Location of the key, a logical page id in the engine.
    pub loc: u64,
}

/// Estimated location of a key with its error bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplineBounds {
    /// Interpolated location.
    pub location: u64,
    /// Lowest location the key can have.
    pub low: u64,
    /// Highest location the key can have.
    pub high: u64,
}

#[inline]
fn is_left(x1: i128, y1: i128, x2: i128, y2: i128) -> bool {
    y1 * x2 > y2 * x1
}

#[inline]
fn is_right(x1: i128, y1: i128, x2: i128, y2: i128) -> bool {
    y1 * x2 < y2 * x1
}

/// Bounded-error piecewise linear index.
#[derive(Debug, Clone)]
pub struct Spline {
    points: VecDeque<SplinePoint>,
    capacity: usize,
    max_error: u64,
    /// Location assigned to the first key.
    start: u64,
    /// Number of keys added, duplicates included.
    seen: u64,
    last_key: u64,
    last_loc: u64,
    lower: SplinePoint,
    upper: SplinePoint,
    temp_last_point: bool,
    /// Points removed from the front since creation.
    dropped: u64,
}

impl Spline {
    /// Creates an empty spline holding at most `capacity` points.
    pub fn new(capacity: usize, max_error: u32) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
            max_error: u64::from(max_error),
            start: 0,
            seen: 0,
            last_key: 0,
            last_loc: 0,
            lower: SplinePoint::default(),
            upper: SplinePoint::default(),
            temp_last_point: false,
            dropped: 0,
        }
    }

    /// Creates an empty spline whose first key maps to location `start`.
    pub fn starting_at(capacity: usize, max_error: u32, start: u64) -> Self {
        Self {
            start,
            ..Self::new(capacity, max_error)
        }
    }

    /// Error bound in locations.
    pub fn max_error(&self) -> u64 {
        self.max_error
    }

    /// Number of points held.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns true if no key has been added.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Points held, oldest first.
    pub fn points(&self) -> impl Iterator<Item = &SplinePoint> {
        self.points.iter()
    }

    /// Point at position `index` among the points held.
    pub fn point(&self, index: usize) -> Option<SplinePoint> {
        self.points.get(index).copied()
    }

    /// Most recent point, which always sits on the last key added.
    pub fn last_point(&self) -> Option<SplinePoint> {
        self.points.back().copied()
    }

    /// Points ever created, including those removed from the front.
    pub fn total_points(&self) -> u64 {
        self.dropped + self.points.len() as u64
    }

    /// Points ever created that will not move again: all but a temporary
    /// last point.
    pub fn committed_points(&self) -> u64 {
        self.total_points() - u64::from(self.temp_last_point)
    }

    /// Points removed from the front since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Last key added.
    pub fn last_key(&self) -> Option<u64> {
        (self.seen > 0).then_some(self.last_key)
    }

    fn push(&mut self, point: SplinePoint) {
        if self.points.len() == self.capacity {
            warn!(
                capacity = self.capacity,
                evicted_key = self.points.front().map(|p| p.key),
                "spline at capacity, evicting oldest point"
            );
            self.points.pop_front();
            self.dropped += 1;
        }
        self.points.push_back(point);
    }

    fn lower_bound(&self, loc: u64) -> u64 {
        loc.saturating_sub(self.max_error)
    }

    /// Adds the next key.
    ///
    /// # Errors
    ///
    /// Returns `OrderViolation` if `key` is smaller than the last key added.
    pub fn add(&mut self, key: u64) -> Result<()> {
        let loc = self.start + self.seen;

        if self.seen == 0 {
            self.push(SplinePoint { key, loc });
            self.last_key = key;
            self.last_loc = loc;
            self.seen = 1;
            return Ok(());
        }

        if key < self.last_key {
            return Err(DbError::OrderViolation {
                key,
                last: self.last_key,
            });
        }

        // Second key only opens the corridor.
        if self.seen == 1 {
            self.lower = SplinePoint {
                key,
                loc: self.lower_bound(loc),
            };
            self.upper = SplinePoint {
                key,
                loc: loc + self.max_error,
            };
            self.last_key = key;
            self.last_loc = loc;
            self.seen += 1;
            return Ok(());
        }

        if key == self.last_key {
            self.seen += 1;
            return Ok(());
        }

        if self.temp_last_point {
            self.points.pop_back();
            self.temp_last_point = false;
        }
        let last = self.points.back().copied().unwrap_or(SplinePoint {
            key: self.last_key,
            loc: self.last_loc,
        });

        let base_x = i128::from(last.key);
        let base_y = i128::from(last.loc);
        let xdiff = i128::from(key) - base_x;
        let ydiff = i128::from(loc) - base_y;
        let upper_xdiff = i128::from(self.upper.key) - base_x;
        let upper_ydiff = i128::from(self.upper.loc) - base_y;
        let lower_xdiff = i128::from(self.lower.key) - base_x;
        let lower_ydiff = i128::from(self.lower.loc) - base_y;

        if is_left(xdiff, ydiff, upper_xdiff, upper_ydiff)
            || is_right(xdiff, ydiff, lower_xdiff, lower_ydiff)
        {
            self.push(SplinePoint {
                key: self.last_key,
                loc: self.last_loc,
            });
            self.lower = SplinePoint {
                key,
                loc: self.lower_bound(loc),
            };
            self.upper = SplinePoint {
                key,
                loc: loc + self.max_error,
            };
        } else {
            let upper_loc = loc + self.max_error;
            if is_left(upper_xdiff, upper_ydiff, xdiff, i128::from(upper_loc) - base_y) {
                self.upper = SplinePoint {
                    key,
                    loc: upper_loc,
                };
            }
            let lower_loc = self.lower_bound(loc);
            if is_right(lower_xdiff, lower_ydiff, xdiff, i128::from(lower_loc) - base_y) {
                self.lower = SplinePoint {
                    key,
                    loc: lower_loc,
                };
            }
        }

        self.last_loc = loc;
        self.last_key = key;
        self.seen += 1;
        self.push(SplinePoint { key, loc });
        self.temp_last_point = true;
        Ok(())
    }

    /// Drops points that only describe keys below `min_key`.
    ///
    /// The point bracketing `min_key` from below and at least two points are
    /// always kept.
    pub fn erase_below(&mut self, min_key: u64) {
        while self.points.len() > 2 && self.points[1].key <= min_key {
            self.points.pop_front();
            self.dropped += 1;
        }
    }

    /// Index of the first point in `lo..=hi` whose key is not below `key`,
    /// or `hi` if there is none.
    fn search_range(&self, key: u64, lo: usize, hi: usize) -> usize {
        let (mut lo, mut hi) = (lo, hi);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.points[mid].key < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn brackets(&self, index: usize, key: u64) -> bool {
        let last = self.points.len() - 1;
        let up = self.points[index].key;
        let down = self.points[index - 1].key;
        down <= key && (key <= up || index == last)
    }

    /// Predicted location of `key`.
    ///
    /// `hint` narrows the search to an inclusive range of point positions;
    /// it is ignored if it does not bracket the key.
    pub fn estimate(&self, key: u64, hint: Option<(usize, usize)>) -> Result<u64> {
        let Some(first) = self.points.front() else {
            return Err(DbError::NotReady);
        };
        if key <= first.key || self.points.len() == 1 {
            return Ok(first.loc);
        }

        let last = self.points.len() - 1;
        let mut index = match hint {
            Some((lo, hi)) if lo <= hi && hi <= last => self.search_range(key, lo, hi).max(1),
            _ => 0,
        };
        if index == 0 || !self.brackets(index, key) {
            index = self.search_range(key, 1, last);
        }

        let down = self.points[index - 1];
        let up = self.points[index];
        if key == up.key {
            return Ok(up.loc);
        }
        if up.key == down.key {
            return Ok(down.loc);
        }
        let slope = (up.loc - down.loc) as f64 / (up.key - down.key) as f64;
        let value = (key - down.key) as f64 * slope + down.loc as f64;
        Ok((value as u64).min(up.loc))
    }

    /// Location of `key` with error bounds clamped to the locations indexed.
    pub fn find(&self, key: u64) -> Result<SplineBounds> {
        self.find_with_hint(key, None)
    }

    /// Same as [`Spline::find`] with a search hint over point positions.
    pub fn find_with_hint(&self, key: u64, hint: Option<(usize, usize)>) -> Result<SplineBounds> {
        let location = self.estimate(key, hint)?;
        let last_loc = self.points.back().map_or(location, |p| p.loc);
        Ok(SplineBounds {
            location,
            low: location.saturating_sub(self.max_error),
            high: (location + self.max_error).min(last_loc),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(keys: impl IntoIterator<Item = u64>, max_error: u32) -> Spline {
        let mut spline = Spline::new(10_000, max_error);
        for key in keys {
            spline.add(key).unwrap();
        }
        spline
    }

    #[test]
    fn test_sequential_keys_need_two_points() {
        let spline = build(0..10_000, 1);
        assert_eq!(spline.len(), 2);
        assert_eq!(spline.point(0), Some(SplinePoint { key: 0, loc: 0 }));
        assert_eq!(
            spline.last_point(),
            Some(SplinePoint {
                key: 9_999,
                loc: 9_999
            })
        );
    }

    #[test]
    fn test_error_bound_on_irregular_keys() {
        let mut keys = Vec::new();
        let mut key = 100u64;
        for i in 0..2_000u64 {
            key += 1 + (i * 7919) % 23 + if i % 250 == 0 { 500 } else { 0 };
            keys.push(key);
        }
        let spline = build(keys.iter().copied(), 2);
        assert!(spline.len() > 2);

        for (loc, key) in keys.iter().enumerate() {
            let bounds = spline.find(*key).unwrap();
            let loc = loc as u64;
            assert!(
                bounds.low <= loc && loc <= bounds.high,
                "key {key} at {loc} outside {bounds:?}"
            );
        }
    }

    #[test]
    fn test_duplicates_advance_location() {
        let spline = build([5, 6, 6, 6, 7, 8], 1);
        assert_eq!(spline.last_point(), Some(SplinePoint { key: 8, loc: 5 }));
    }

    #[test]
    fn test_order_violation() {
        let mut spline = build([10, 20], 1);
        let err = spline.add(15).unwrap_err();
        assert!(matches!(err, DbError::OrderViolation { key: 15, last: 20 }));
    }

    #[test]
    fn test_empty_spline_not_ready() {
        let spline = Spline::new(8, 1);
        assert!(matches!(spline.find(3), Err(DbError::NotReady)));
    }

    #[test]
    fn test_starting_location() {
        let mut spline = Spline::starting_at(8, 1, 40);
        for key in [100, 200, 300] {
            spline.add(key).unwrap();
        }
        assert_eq!(spline.find(200).unwrap().location, 41);
        assert_eq!(spline.find(50).unwrap().location, 40);
    }

    #[test]
    fn test_capacity_and_erase_below() {
        let mut spline = Spline::new(4, 0);
        for key in [0u64, 1, 10, 11, 30, 31, 60, 61] {
            spline.add(key).unwrap();
        }
        assert!(spline.len() <= 4);
        assert!(spline.dropped() > 0);

        let mut spline = build([0u64, 1, 10, 11, 30, 31, 60, 61], 0);
        let before = spline.len();
        spline.erase_below(30);
        assert!(spline.len() < before);
        assert!(spline.point(0).unwrap().key <= 30);
        assert!(spline.point(1).unwrap().key > 30);
        assert_eq!(spline.total_points(), before as u64);
    }

    #[test]
    fn test_committed_points_exclude_moving_last_point() {
        let mut spline = Spline::new(16, 0);
        for key in 0..10u64 {
            spline.add(key).unwrap();
        }
        assert_eq!(spline.total_points(), 2);
        assert_eq!(spline.committed_points(), 1);

        spline.add(1_000).unwrap();
        assert_eq!(spline.committed_points(), 2);
        assert_eq!(spline.point(1).unwrap().key, 9);
    }
}
