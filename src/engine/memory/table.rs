//! Ordered key-value table for one column family
//!
//! BTreeMap-based, shared copy-on-write so snapshots and iterator cursors
//! can hold a point-in-time view without copying on creation.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;

use crate::engine::NativeRange;

/// In-memory ordered table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    data: Arc<BTreeMap<Bytes, Bytes>>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from entries (any order)
    pub fn from_entries(entries: impl IntoIterator<Item = (Bytes, Bytes)>) -> Self {
        Self {
            data: Arc::new(entries.into_iter().collect()),
        }
    }

    /// Get a value by key
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    /// Insert or overwrite a key
    pub fn put(&mut self, key: Bytes, value: Bytes) {
        Arc::make_mut(&mut self.data).insert(key, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        if self.data.contains_key(key) {
            Arc::make_mut(&mut self.data).remove(key);
        }
    }

    /// Remove every key in `[start, end)`
    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) {
        let doomed: Vec<Bytes> = self
            .scan(Bound::Included(start), Bound::Excluded(end), false, usize::MAX)
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        if doomed.is_empty() {
            return;
        }

        let data = Arc::make_mut(&mut self.data);
        for key in doomed {
            data.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Up to `count` entries inside the bounds, ascending or descending
    pub fn scan(
        &self,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        reverse: bool,
        count: usize,
    ) -> Vec<(Bytes, Bytes)> {
        if count == 0 || range_is_empty(lower, upper) {
            return Vec::new();
        }

        let range = self.data.range::<[u8], _>((lower, upper));
        let pair = |(k, v): (&Bytes, &Bytes)| (k.clone(), v.clone());

        if reverse {
            range.rev().take(count).map(pair).collect()
        } else {
            range.take(count).map(pair).collect()
        }
    }

    /// Sum of key and value lengths in `[start, end)`
    pub fn approximate_size(&self, start: &[u8], end: &[u8]) -> u64 {
        self.scan(Bound::Included(start), Bound::Excluded(end), false, usize::MAX)
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }

    /// All entries in key order
    pub fn entries(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.data.iter()
    }
}

/// Resolved scan bounds for an iterator cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub lower: Bound<Bytes>,
    pub upper: Bound<Bytes>,
}

impl KeyRange {
    /// `gt` wins over `gte`, `lt` over `lte`
    pub fn from_native(range: &NativeRange) -> Self {
        let lower = match (&range.gt, &range.gte) {
            (Some(gt), _) => Bound::Excluded(gt.clone()),
            (None, Some(gte)) => Bound::Included(gte.clone()),
            (None, None) => Bound::Unbounded,
        };
        let upper = match (&range.lt, &range.lte) {
            (Some(lt), _) => Bound::Excluded(lt.clone()),
            (None, Some(lte)) => Bound::Included(lte.clone()),
            (None, None) => Bound::Unbounded,
        };
        Self { lower, upper }
    }
}

/// Borrow an owned bound as a slice bound
pub fn borrow_bound(bound: &Bound<Bytes>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_ref()),
        Bound::Excluded(key) => Bound::Excluded(key.as_ref()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

// BTreeMap::range panics on inverted bounds
fn range_is_empty(lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> bool {
    match (lower, upper) {
        (Bound::Included(start), Bound::Included(end)) => start > end,
        (Bound::Included(start), Bound::Excluded(end))
        | (Bound::Excluded(start), Bound::Included(end))
        | (Bound::Excluded(start), Bound::Excluded(end)) => start >= end,
        _ => false,
    }
}
