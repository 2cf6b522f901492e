//! BTree index implementation.

use crate::error::CoreResult;
use crate::index::traits::{duplicate_key, Index, IndexKey, IndexSpec};
use crate::types::ObjectId;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeBounds;

/// Ordered index: the default for `INDEXED` and `UNIQUE` properties and
/// for to-one relations. Supports range scans in addition to equality.
pub struct BTreeIndex<K: IndexKey> {
    spec: IndexSpec<K>,
    entries: BTreeMap<K, BTreeSet<ObjectId>>,
    count: usize,
}

impl<K: IndexKey> BTreeIndex<K> {
    /// Creates a new BTree index.
    pub fn new(spec: IndexSpec<K>) -> Self {
        Self {
            spec,
            entries: BTreeMap::new(),
            count: 0,
        }
    }

    /// Returns objects whose key falls in `range`, ascending by ID.
    pub fn range<R>(&self, range: R) -> Vec<ObjectId>
    where
        R: RangeBounds<K>,
    {
        let mut ids: Vec<ObjectId> = self
            .entries
            .range(range)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl<K: IndexKey> Index<K> for BTreeIndex<K> {
    fn spec(&self) -> &IndexSpec<K> {
        &self.spec
    }

    fn insert(&mut self, key: K, id: ObjectId) -> CoreResult<()> {
        if self.spec.unique {
            if let Some(existing) = self.entries.get(&key) {
                if existing.iter().any(|other| *other != id) {
                    return Err(duplicate_key(&self.spec, &key));
                }
            }
        }
        if self.entries.entry(key).or_default().insert(id) {
            self.count += 1;
        }
        Ok(())
    }

    fn remove(&mut self, key: &K, id: ObjectId) -> bool {
        let Some(set) = self.entries.get_mut(key) else {
            return false;
        };
        if !set.remove(&id) {
            return false;
        }
        self.count -= 1;
        if set.is_empty() {
            self.entries.remove(key);
        }
        true
    }

    fn lookup(&self, key: &K) -> Vec<ObjectId> {
        self.entries
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn len(&self) -> usize {
        self.count
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityTypeId, PropertyId};
    use proptest::prelude::*;

    fn index() -> BTreeIndex<i64> {
        BTreeIndex::new(IndexSpec::new(
            EntityTypeId::new(1),
            PropertyId::new(3),
            "Note.year",
        ))
    }

    #[test]
    fn range_scan() {
        let mut idx = index();
        for (year, id) in [(2001, 1), (1999, 2), (2010, 3), (2001, 4)] {
            idx.insert(year, id).unwrap();
        }
        assert_eq!(idx.range(2000..=2005), vec![1, 4]);
        assert_eq!(idx.range(..2001), vec![2]);
        assert_eq!(idx.lookup(&2001), vec![1, 4]);
    }

    proptest! {
        #[test]
        fn range_matches_filter(entries in prop::collection::vec((-50i64..50, 1u64..500), 0..60),
                                lo in -60i64..60, span in 0i64..40) {
            let mut idx = index();
            for (key, id) in &entries {
                idx.insert(*key, *id).unwrap();
            }
            let hi = lo + span;
            let mut expected: Vec<u64> = entries
                .iter()
                .filter(|(k, _)| *k >= lo && *k <= hi)
                .map(|(_, id)| *id)
                .collect();
            expected.sort_unstable();
            expected.dedup();
            let mut got = idx.range(lo..=hi);
            got.dedup();
            prop_assert_eq!(got, expected);
        }
    }
}
