//! Filter Policy
//!
//! Value objects describing the probabilistic filter a column family's
//! tables are built with. Passed through to the engine untouched.

use serde::{Deserialize, Serialize};

/// Filter configuration for block-based tables
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FilterPolicy {
    /// Classic Bloom filter
    Bloom { bits_per_key: f64 },

    /// Ribbon filter, sized to match a Bloom filter of the given bits per key.
    /// Levels below `bloom_before_level` keep using Bloom filters.
    Ribbon {
        bloom_equivalent_bits_per_key: f64,
        bloom_before_level: i32,
    },
}

impl FilterPolicy {
    /// Bloom filter with `bits_per_key` bits per key
    pub fn bloom(bits_per_key: f64) -> Self {
        FilterPolicy::Bloom { bits_per_key }
    }

    /// Ribbon filter with Bloom-equivalent sizing, Ribbon on every level
    pub fn ribbon(bloom_equivalent_bits_per_key: f64) -> Self {
        FilterPolicy::Ribbon {
            bloom_equivalent_bits_per_key,
            bloom_before_level: 0,
        }
    }

    /// Ribbon filter that keeps Bloom filters before `level`
    pub fn ribbon_with_bloom_before(bloom_equivalent_bits_per_key: f64, level: i32) -> Self {
        FilterPolicy::Ribbon {
            bloom_equivalent_bits_per_key,
            bloom_before_level: level,
        }
    }

    /// Wire tag understood by the engine (1 = Bloom, 2 = Ribbon)
    pub fn type_tag(&self) -> u32 {
        match self {
            FilterPolicy::Bloom { .. } => 1,
            FilterPolicy::Ribbon { .. } => 2,
        }
    }

    /// Effective bits per key
    pub fn bits_per_key(&self) -> f64 {
        match self {
            FilterPolicy::Bloom { bits_per_key } => *bits_per_key,
            FilterPolicy::Ribbon {
                bloom_equivalent_bits_per_key,
                ..
            } => *bloom_equivalent_bits_per_key,
        }
    }
}

impl Default for FilterPolicy {
    fn default() -> Self {
        FilterPolicy::bloom(10.0)
    }
}
