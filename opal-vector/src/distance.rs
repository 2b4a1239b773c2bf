//! Distance functions for vector similarity

use crate::lru::LruCache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Distance functions understood by the index.
///
/// Cosine variants return a distance in [0, 2]: 0 means identical direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceKind {
    /// Full cosine distance: `1 - a.b / (|a||b|)`
    Cosine,

    /// Cosine distance assuming unit-length inputs: `1 - a.b`.
    /// Normalization is the caller's responsibility.
    CosinePrenormalized,

    /// A caller-supplied distance callable. Treated as opaque; never memoized.
    Custom,
}

/// A caller-supplied distance function for [`DistanceKind::Custom`].
#[derive(Clone)]
pub struct DistanceFn(pub Arc<dyn Fn(&[f64], &[f64]) -> f64 + Send + Sync>);

impl std::fmt::Debug for DistanceFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DistanceFn(..)")
    }
}

/// Calculate cosine distance between two vectors.
///
/// Zero-magnitude vectors are treated as maximally distant from everything.
#[inline]
pub fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let mag_a = magnitude(a);
    let mag_b = magnitude(b);
    if mag_a == 0.0 || mag_b == 0.0 {
        return 1.0;
    }
    1.0 - dot_product(a, b) / (mag_a * mag_b)
}

/// Calculate cosine distance assuming both vectors are unit length.
#[inline]
pub fn cosine_prenormalized(a: &[f64], b: &[f64]) -> f64 {
    1.0 - dot_product(a, b)
}

/// Calculate dot product (inner product) of two vectors.
#[inline]
pub fn dot_product(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Calculate the magnitude (L2 norm) of a vector.
#[inline]
pub fn magnitude(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Normalize a vector to unit length in place.
pub fn normalize(v: &mut [f64]) {
    let mag = magnitude(v);
    if mag > 0.0 {
        for x in v.iter_mut() {
            *x /= mag;
        }
    }
}

/// Get a normalized copy of a vector.
pub fn normalized(v: &[f64]) -> Vec<f64> {
    let mut copy = v.to_vec();
    normalize(&mut copy);
    copy
}

/// Round a distance to `precision` decimal places.
///
/// Edge weights are rounded before storage so that equal graphs serialize
/// equal regardless of which process computed them.
#[inline]
pub fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

/// Wrapper for f64 to make it orderable (for BinaryHeap)
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct OrderedFloat(pub f64);

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .partial_cmp(&other.0)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// Memoization table for node-to-node distances.
///
/// Disabled by default: re-enabling requires symmetric-pair handling and an
/// eviction policy tuned against the node cache. Query vectors have no stable
/// key and always bypass it. Custom distances are never memoized.
pub(crate) struct DistanceCache {
    cache: LruCache<(String, String), f64>,
    enabled: bool,
}

impl DistanceCache {
    pub(crate) fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            cache: LruCache::new(capacity),
            enabled,
        }
    }

    fn pair(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    pub(crate) fn get(&mut self, a: &str, b: &str) -> Option<f64> {
        if !self.enabled {
            return None;
        }
        self.cache.get(&Self::pair(a, b)).copied()
    }

    pub(crate) fn put(&mut self, a: &str, b: &str, distance: f64) {
        if self.enabled {
            self.cache.put(Self::pair(a, b), distance);
        }
    }
}
