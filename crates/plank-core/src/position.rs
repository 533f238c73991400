//! Fractional ordering keys for sibling lists.
//!
//! A `PositionKey` is the sole sort key for cards within a column and columns
//! within a board. `key_between` bisects the gap between two neighbors; when
//! f64 precision can no longer represent a strictly-between value it reports
//! `Exhausted` and the caller rebalances the whole sibling list.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Gap between keys handed out for fresh or appended siblings. Wide on
/// purpose: every doubling of the gap buys one more bisection before a
/// rebalance is needed.
const STRIDE: f64 = 1.0;

/// Densely-sortable position value. Total order via `f64::total_cmp`;
/// keys are produced only by this module and are never NaN.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionKey(f64);

impl PositionKey {
    pub const fn from_raw(value: f64) -> Self {
        Self(value)
    }

    pub fn raw(&self) -> f64 {
        self.0
    }
}

impl PartialEq for PositionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for PositionKey {}

impl PartialOrd for PositionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PositionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PositionError {
    /// The gap between the neighbors is no longer representable; the sibling
    /// list must be rebalanced before another key can be minted here.
    #[error("no key exists strictly between {lower} and {upper}")]
    Exhausted { lower: f64, upper: f64 },

    #[error("bounds out of order: {lower} >= {upper}")]
    InvertedBounds { lower: f64, upper: f64 },
}

/// Produce a key strictly between `lower` and `upper`.
///
/// `None` bounds mean "before the first sibling" / "after the last sibling";
/// with both absent the list is empty and any key works. The returned key
/// never collides with either neighbor.
pub fn key_between(
    lower: Option<&PositionKey>,
    upper: Option<&PositionKey>,
) -> Result<PositionKey, PositionError> {
    match (lower, upper) {
        (None, None) => Ok(PositionKey(STRIDE)),
        (Some(a), None) => Ok(PositionKey(a.0 + STRIDE)),
        (None, Some(b)) => Ok(PositionKey(b.0 - STRIDE)),
        (Some(a), Some(b)) => {
            if a.0 >= b.0 {
                return Err(PositionError::InvertedBounds {
                    lower: a.0,
                    upper: b.0,
                });
            }
            let mid = a.0 / 2.0 + b.0 / 2.0;
            if mid <= a.0 || mid >= b.0 {
                return Err(PositionError::Exhausted {
                    lower: a.0,
                    upper: b.0,
                });
            }
            Ok(PositionKey(mid))
        }
    }
}

/// Evenly-spaced replacement keys for a sibling list of `len` entries.
/// Callers zip the result against the list in its current order, so relative
/// order is preserved exactly.
pub fn rebalanced(len: usize) -> Vec<PositionKey> {
    (1..=len).map(|i| PositionKey(i as f64 * STRIDE)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_gets_a_key() {
        let k = key_between(None, None).unwrap();
        assert!(k.raw() > 0.0);
    }

    #[test]
    fn append_sorts_after_lower() {
        let a = PositionKey::from_raw(3.0);
        let k = key_between(Some(&a), None).unwrap();
        assert!(k > a);
    }

    #[test]
    fn prepend_sorts_before_upper() {
        let b = PositionKey::from_raw(1.0);
        let k = key_between(None, Some(&b)).unwrap();
        assert!(k < b);
    }

    #[test]
    fn between_is_strictly_between() {
        let a = PositionKey::from_raw(1.0);
        let b = PositionKey::from_raw(2.0);
        let k = key_between(Some(&a), Some(&b)).unwrap();
        assert!(a < k && k < b, "got {k}");
    }

    #[test]
    fn inverted_bounds_rejected() {
        let a = PositionKey::from_raw(2.0);
        let b = PositionKey::from_raw(1.0);
        assert!(matches!(
            key_between(Some(&a), Some(&b)),
            Err(PositionError::InvertedBounds { .. })
        ));
        assert!(matches!(
            key_between(Some(&a), Some(&a)),
            Err(PositionError::InvertedBounds { .. })
        ));
    }

    #[test]
    fn repeated_bisection_exhausts_rather_than_collides() {
        // Keep inserting between a fixed lower bound and the last key minted.
        // Every minted key must satisfy the strict contract until the module
        // reports Exhausted; it must never return a colliding key.
        let lower = PositionKey::from_raw(1.0);
        let mut upper = PositionKey::from_raw(2.0);
        let mut minted = 0;
        loop {
            match key_between(Some(&lower), Some(&upper)) {
                Ok(k) => {
                    assert!(lower < k && k < upper, "non-strict key {k} after {minted}");
                    upper = k;
                    minted += 1;
                    assert!(minted < 10_000, "bisection never exhausted");
                }
                Err(PositionError::Exhausted { .. }) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(minted > 30, "exhausted suspiciously early: {minted}");
    }

    #[test]
    fn rebalanced_keys_are_even_and_ascending() {
        let keys = rebalanced(4);
        assert_eq!(keys.len(), 4);
        for w in keys.windows(2) {
            assert!(w[0] < w[1]);
        }
        // Evenly spaced: constant gap between consecutive keys.
        let gap = keys[1].raw() - keys[0].raw();
        for w in keys.windows(2) {
            assert!((w[1].raw() - w[0].raw() - gap).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn rebalance_restores_room_in_a_crowded_list() {
        // A list whose keys are nearly indistinguishable, as after heavy
        // same-spot inserting: [1.0, 1.0000000001, 1.0000000002].
        let crowded = [1.0, 1.000_000_000_1, 1.000_000_000_2];
        let a = PositionKey::from_raw(crowded[1]);
        let b = PositionKey::from_raw(crowded[2]);
        // The crowded gap may or may not still admit one key; drive it to
        // exhaustion to prove rebalance is eventually required.
        let mut upper = b;
        loop {
            match key_between(Some(&a), Some(&upper)) {
                Ok(k) => upper = k,
                Err(PositionError::Exhausted { .. }) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        // Rebalance for 4 entries (the 3 originals plus the insert).
        let fresh = rebalanced(4);
        assert_eq!(fresh.len(), 4);
        for w in fresh.windows(2) {
            assert!(w[0] < w[1]);
        }
        // And the fresh spacing admits further inserts again.
        assert!(key_between(Some(&fresh[1]), Some(&fresh[2])).is_ok());
    }

    #[test]
    fn total_order_is_consistent() {
        let mut keys = vec![
            PositionKey::from_raw(2.0),
            PositionKey::from_raw(-1.0),
            PositionKey::from_raw(0.5),
        ];
        keys.sort();
        assert_eq!(keys[0].raw(), -1.0);
        assert_eq!(keys[2].raw(), 2.0);
    }

    #[test]
    fn serde_roundtrip() {
        let k = key_between(None, None).unwrap();
        let json = serde_json::to_string(&k).unwrap();
        let parsed: PositionKey = serde_json::from_str(&json).unwrap();
        assert_eq!(k, parsed);
    }
}
