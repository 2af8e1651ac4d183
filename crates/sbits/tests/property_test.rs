//! Property-based tests for the engine and its index structures.
//!
//! Uses proptest to check the spline error bound, bitmap soundness, and that
//! lookups and range scans agree with a plain in-memory model.

use alopex_sbits::bitmap::{BitmapPolicy, BucketBitmap, StepBitmap};
use alopex_sbits::{
    DbError, Devices, Engine, EngineConfig, IteratorQuery, Parameters, RadixSpline, SearchMethod,
    Spline,
};
use proptest::prelude::*;
use std::sync::Arc;

/// Strictly increasing keys built from bounded gaps.
fn key_strategy(max_len: usize) -> impl Strategy<Value = Vec<u64>> {
    (0u64..1_000_000, prop::collection::vec(1u64..2_000, 1..max_len)).prop_map(|(base, gaps)| {
        let mut key = base;
        gaps.into_iter()
            .map(|gap| {
                key += gap;
                key
            })
            .collect()
    })
}

/// Records with strictly increasing keys and small data values.
fn record_strategy() -> impl Strategy<Value = Vec<(u32, u32)>> {
    prop::collection::vec((1u32..50, 0u32..120), 1..1_500).prop_map(|pairs| {
        let mut key = 0u32;
        pairs
            .into_iter()
            .map(|(gap, value)| {
                key += gap;
                (key, value)
            })
            .collect()
    })
}

fn search_method_strategy() -> impl Strategy<Value = SearchMethod> {
    prop_oneof![
        Just(SearchMethod::ModifiedBinary),
        Just(SearchMethod::Binary),
        Just(SearchMethod::Spline),
    ]
}

fn indexed_config() -> EngineConfig {
    EngineConfig {
        parameters: Parameters::new()
            .with(Parameters::RESET_DATA)
            .with(Parameters::USE_INDEX)
            .with(Parameters::USE_MAX_MIN),
        buffer_size_in_blocks: 4,
        ..EngineConfig::default()
    }
    .with_bitmap(Arc::new(BucketBitmap::int8()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every key is predicted within the configured error of its position.
    #[test]
    fn test_spline_error_bound_proptest(keys in key_strategy(3_000), max_error in 0u32..5) {
        let mut spline = Spline::new(keys.len() + 2, max_error);
        for &key in &keys {
            spline.add(key).unwrap();
        }
        for (loc, &key) in keys.iter().enumerate() {
            let bounds = spline.find(key).unwrap();
            let loc = loc as u64;
            prop_assert!(bounds.low <= loc && loc <= bounds.high, "key {} at {}: {:?}", key, loc, bounds);
        }
    }

    /// The radix table only narrows the search; it never changes the estimate.
    #[test]
    fn test_radix_matches_spline_proptest(keys in key_strategy(3_000), bits in 1u8..12) {
        let mut radix = RadixSpline::new(Spline::new(keys.len() + 2, 2), bits);
        for &key in &keys {
            radix.add(key).unwrap();
        }
        for &key in keys.iter().step_by(7) {
            let expected = radix.spline().find(key).unwrap();
            prop_assert_eq!(radix.find(key).unwrap(), expected);
        }
    }

    /// A value inside a query range is always admitted by the query bitmap.
    #[test]
    fn test_bitmap_has_no_false_negatives_proptest(
        a in -1_000i32..2_000,
        b in -1_000i32..2_000,
        t in 0.0f64..=1.0,
    ) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let value = lo + ((hi - lo) as f64 * t) as i32;
        let buckets = BucketBitmap::int8();
        let steps = StepBitmap::int16();
        let policies: [&dyn BitmapPolicy; 2] = [&buckets, &steps];
        for policy in policies {
            let mut query = vec![0u8; policy.size()];
            policy.build_from_range(Some(&lo.to_le_bytes()), Some(&hi.to_le_bytes()), &mut query);
            prop_assert!(policy.in_bitmap(&value.to_le_bytes(), &query));
        }
    }

    /// Every inserted key is found and keys in the gaps are not.
    #[test]
    fn test_get_matches_model_proptest(
        records in record_strategy(),
        method in search_method_strategy(),
    ) {
        let config = EngineConfig {
            search_method: method,
            radix_bits: 5,
            ..EngineConfig::default()
        };
        let mut db = Engine::open(config.clone(), Devices::in_memory(&config)).unwrap();
        for &(key, value) in &records {
            db.put(&key.to_le_bytes(), &value.to_le_bytes()).unwrap();
        }

        let mut out = [0u8; 4];
        for (i, &(key, value)) in records.iter().enumerate() {
            db.get(&key.to_le_bytes(), &mut out).unwrap();
            prop_assert_eq!(u32::from_le_bytes(out), value);

            let next = records.get(i + 1).map_or(u32::MAX, |r| r.0);
            if key + 1 < next {
                let missing = db.get(&(key + 1).to_le_bytes(), &mut out);
                prop_assert!(matches!(missing, Err(DbError::NotFound)));
            }
        }
    }

    /// Range scans return exactly the records a filter over the model returns.
    #[test]
    fn test_iterator_matches_model_proptest(
        records in record_strategy(),
        key_bounds in (0u32..40_000, 0u32..40_000),
        data_bounds in (0u32..120, 0u32..120),
        flush in any::<bool>(),
    ) {
        let config = indexed_config();
        let mut db = Engine::open(config.clone(), Devices::in_memory(&config)).unwrap();
        for &(key, value) in &records {
            db.put(&key.to_le_bytes(), &value.to_le_bytes()).unwrap();
        }
        if flush {
            db.flush().unwrap();
        }

        let (min_key, max_key) = (key_bounds.0.min(key_bounds.1), key_bounds.0.max(key_bounds.1));
        let (min_data, max_data) = (data_bounds.0.min(data_bounds.1), data_bounds.0.max(data_bounds.1));
        let expected: Vec<(u32, u32)> = records
            .iter()
            .copied()
            .filter(|&(k, v)| (min_key..=max_key).contains(&k) && (min_data..=max_data).contains(&v))
            .collect();

        let query = IteratorQuery::new()
            .min_key(u64::from(min_key))
            .max_key(u64::from(max_key))
            .min_data(&min_data.to_le_bytes())
            .max_data(&max_data.to_le_bytes());
        let mut iter = db.iter(query).unwrap();
        let actual: Vec<(u32, u32)> = iter
            .by_ref()
            .map(|r| (r.key_u64() as u32, u32::from_le_bytes(r.data[..4].try_into().unwrap())))
            .collect();
        prop_assert!(iter.take_error().is_none());
        prop_assert_eq!(actual, expected);
    }

    /// A put succeeds exactly when its key exceeds every key accepted before it.
    #[test]
    fn test_monotonic_acceptance_proptest(keys in prop::collection::vec(0u32..500, 1..400)) {
        let config = EngineConfig::default();
        let mut db = Engine::open(config.clone(), Devices::in_memory(&config)).unwrap();
        let mut last: Option<u32> = None;
        let mut accepted = Vec::new();
        for key in keys {
            let result = db.put(&key.to_le_bytes(), &key.to_le_bytes());
            match last {
                Some(prev) if key <= prev => prop_assert!(result.is_err()),
                _ => {
                    prop_assert!(result.is_ok());
                    last = Some(key);
                    accepted.push(u64::from(key));
                }
            }
        }
        let scanned: Vec<u64> = db.iter(IteratorQuery::new()).unwrap().map(|r| r.key_u64()).collect();
        prop_assert_eq!(scanned, accepted);
    }
}
