//! Shard key resolution.
//!
//! Pure functions mapping a shard-key value to a shard slot. Everything here is
//! stateless and safe to call concurrently.
//!
//! The hash is the 32-bit polynomial string hash `h = h * 31 + unit` computed
//! with wrapping `i32` arithmetic over the UTF-16 code units of the key's
//! string form (`Value::key_string`), folded with its absolute value and
//! reduced modulo the shard count. This is the same value JavaScript's
//! `((h << 5) - h + s.charCodeAt(i)) | 0` loop produces, so shard placement
//! can be checked from other runtimes.

use crate::config::{ShardStrategy, ShardingConfig};
use crate::core::{Document, Result, ShardError, Value};
use std::cmp::Ordering;

/// 32-bit polynomial hash of a string.
pub fn polynomial_hash(key: &str) -> i32 {
    key.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_mul(31).wrapping_add(unit as i32)
    })
}

/// Hash placement: `|hash(key_string)| mod shard_count`.
pub fn index_for_hash(key: &Value, shard_count: usize) -> usize {
    if shard_count == 0 {
        return 0;
    }
    let folded = polynomial_hash(&key.key_string()).unsigned_abs() as usize;
    folded % shard_count
}

/// Range placement: the range `i` with `ranges[i] <= key < ranges[i + 1]`; the
/// last range is open-ended.
pub fn index_for_range(key: &Value, ranges: &[Value]) -> Result<usize> {
    let Some(first) = ranges.first() else {
        return Err(ShardError::InvalidConfig(
            "range strategy has no boundaries".to_string(),
        ));
    };
    if key.is_null() || key.compare(first)? == Ordering::Less {
        return Err(ShardError::OutOfRange {
            value: key.to_string(),
            first_boundary: first.to_string(),
        });
    }

    // Last boundary <= key; boundaries are non-decreasing so this is the
    // first range whose half-open interval contains the key.
    let mut slot = 0;
    for (i, boundary) in ranges.iter().enumerate().skip(1) {
        if key.compare(boundary)? == Ordering::Less {
            break;
        }
        slot = i;
    }
    Ok(slot)
}

/// Deterministic physical shard name.
pub fn shard_name(collection: &str, index: usize) -> String {
    format!("{}_shard_{}", collection, index)
}

/// Resolves a shard-key value under a configuration.
pub fn resolve(config: &ShardingConfig, key: &Value) -> Result<usize> {
    match config.strategy {
        ShardStrategy::Hash => Ok(index_for_hash(key, config.shard_count)),
        ShardStrategy::Range => index_for_range(key, &config.ranges),
    }
}

/// Extracts the shard key from a document.
pub fn shard_key_of<'a>(config: &ShardingConfig, doc: &'a Document) -> Result<&'a Value> {
    match doc.get(&config.shard_key) {
        Some(value) if !value.is_null() => Ok(value),
        _ => Err(ShardError::MissingShardKey(config.shard_key.clone())),
    }
}

/// Resolves the slot owning a document.
pub fn index_for_document(config: &ShardingConfig, doc: &Document) -> Result<usize> {
    resolve(config, shard_key_of(config, doc)?)
}

/// A bound of a shard-key interval: `(value, inclusive)`.
pub type KeyBound = (Value, bool);

/// Range slots that may hold keys inside `[lower, upper]`.
///
/// Bounds whose kind does not match the boundaries widen to the full slot span.
pub fn range_slots_for_interval(
    ranges: &[Value],
    lower: Option<&KeyBound>,
    upper: Option<&KeyBound>,
) -> Vec<usize> {
    if ranges.is_empty() {
        return Vec::new();
    }
    let last = ranges.len() - 1;

    let start = match lower {
        // below the first boundary (or incomparable) starts at slot 0
        Some((value, _)) => index_for_range(value, ranges).unwrap_or(0),
        None => 0,
    };

    let end = match upper {
        Some((value, inclusive)) => {
            let mut end: Option<usize> = None;
            for (i, boundary) in ranges.iter().enumerate() {
                let reachable = match boundary.compare(value) {
                    Ok(Ordering::Less) => true,
                    Ok(Ordering::Equal) => *inclusive,
                    Ok(Ordering::Greater) => false,
                    Err(_) => true,
                };
                if reachable {
                    end = Some(i);
                }
            }
            match end {
                Some(end) => end,
                None => return Vec::new(),
            }
        }
        None => last,
    };

    if start > end {
        return Vec::new();
    }
    (start..=end).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polynomial_hash_matches_reference_values() {
        // "abc": ((97 * 31) + 98) * 31 + 99
        assert_eq!(polynomial_hash("abc"), 96354);
        assert_eq!(polynomial_hash(""), 0);
        // Wraps like a 32-bit signed integer.
        assert_eq!(polynomial_hash("polygenelubricants"), i32::MIN);
    }

    #[test]
    fn hash_index_is_deterministic_and_bounded() {
        for shard_count in 1..=16 {
            for i in 0..500 {
                let key = Value::from(format!("user-{}", i));
                let first = index_for_hash(&key, shard_count);
                assert_eq!(first, index_for_hash(&key, shard_count));
                assert!(first < shard_count);
            }
        }
        // i32::MIN folds without overflow.
        let key = Value::from("polygenelubricants");
        assert!(index_for_hash(&key, 7) < 7);
    }

    #[test]
    fn numeric_keys_hash_by_decimal_form() {
        assert_eq!(
            index_for_hash(&Value::Integer(42), 5),
            index_for_hash(&Value::from("42"), 5)
        );
    }

    #[test]
    fn range_index_uses_half_open_intervals() {
        let ranges = vec![Value::Integer(0), Value::Integer(100), Value::Integer(200)];
        assert_eq!(index_for_range(&Value::Integer(0), &ranges).unwrap(), 0);
        assert_eq!(index_for_range(&Value::Integer(99), &ranges).unwrap(), 0);
        assert_eq!(index_for_range(&Value::Integer(100), &ranges).unwrap(), 1);
        assert_eq!(index_for_range(&Value::Integer(150), &ranges).unwrap(), 1);
        assert_eq!(index_for_range(&Value::Integer(250), &ranges).unwrap(), 2);
        assert_eq!(index_for_range(&Value::Float(1e12), &ranges).unwrap(), 2);
        assert!(matches!(
            index_for_range(&Value::Integer(-1), &ranges),
            Err(ShardError::OutOfRange { .. })
        ));
    }

    #[test]
    fn every_number_maps_to_exactly_one_range() {
        let ranges = vec![
            Value::Integer(-50),
            Value::Integer(0),
            Value::Integer(0),
            Value::Integer(75),
        ];
        for n in -50..300 {
            let key = Value::Integer(n);
            let slot = index_for_range(&key, &ranges).unwrap();
            let owners = (0..ranges.len())
                .filter(|&i| {
                    let above_start = key.compare(&ranges[i]).unwrap() != Ordering::Less;
                    let below_end = ranges
                        .get(i + 1)
                        .map(|next| key.compare(next).unwrap() == Ordering::Less)
                        .unwrap_or(true);
                    above_start && below_end
                })
                .collect::<Vec<_>>();
            assert_eq!(owners, vec![slot], "key {}", n);
        }
    }

    #[test]
    fn interval_targeting_selects_overlapping_ranges() {
        let ranges = vec![Value::Integer(0), Value::Integer(100), Value::Integer(200)];
        let lower = (Value::Integer(120), true);
        let upper = (Value::Integer(200), false);
        assert_eq!(
            range_slots_for_interval(&ranges, Some(&lower), Some(&upper)),
            vec![1]
        );
        let upper_inclusive = (Value::Integer(200), true);
        assert_eq!(
            range_slots_for_interval(&ranges, Some(&lower), Some(&upper_inclusive)),
            vec![1, 2]
        );
        let below_all = (Value::Integer(-5), false);
        assert!(range_slots_for_interval(&ranges, None, Some(&below_all)).is_empty());
        assert_eq!(range_slots_for_interval(&ranges, None, None), vec![0, 1, 2]);
    }

    #[test]
    fn names_are_deterministic() {
        assert_eq!(shard_name("orders", 3), "orders_shard_3");
    }
}
