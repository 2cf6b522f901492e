//! Hash index implementation.

use crate::error::CoreResult;
use crate::index::traits::{duplicate_key, Index, IndexKey, IndexSpec};
use crate::types::ObjectId;
use std::collections::{HashMap, HashSet};

/// Hash-based index for equality lookups on properties flagged
/// `INDEX_HASH`.
pub struct HashIndex<K: IndexKey> {
    spec: IndexSpec<K>,
    entries: HashMap<K, HashSet<ObjectId>>,
    count: usize,
}

impl<K: IndexKey> HashIndex<K> {
    /// Creates a new hash index.
    pub fn new(spec: IndexSpec<K>) -> Self {
        Self {
            spec,
            entries: HashMap::new(),
            count: 0,
        }
    }
}

impl<K: IndexKey> Index<K> for HashIndex<K> {
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
        let mut ids: Vec<ObjectId> = self
            .entries
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
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
    use crate::error::ErrorKind;
    use crate::types::{EntityTypeId, PropertyId};

    fn spec() -> IndexSpec<String> {
        IndexSpec::new(EntityTypeId::new(1), PropertyId::new(2), "Note.title")
    }

    #[test]
    fn insert_lookup_remove() {
        let mut index = HashIndex::new(spec());
        index.insert("a".into(), 3).unwrap();
        index.insert("a".into(), 1).unwrap();
        index.insert("b".into(), 2).unwrap();

        assert_eq!(index.lookup(&"a".into()), vec![1, 3]);
        assert_eq!(index.len(), 3);
        assert!(index.remove(&"a".into(), 3));
        assert!(!index.remove(&"a".into(), 3));
        assert_eq!(index.lookup(&"a".into()), vec![1]);
        assert!(index.lookup(&"zzz".into()).is_empty());
    }

    #[test]
    fn unique_rejects_second_owner() {
        let mut index = HashIndex::new(spec().unique());
        index.insert("a".into(), 1).unwrap();
        index.insert("a".into(), 1).unwrap();
        let err = index.insert("a".into(), 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UniqueViolation);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn clear_empties() {
        let mut index = HashIndex::new(spec());
        index.insert("x".into(), 1).unwrap();
        index.clear();
        assert!(index.is_empty());
        assert!(!index.contains(&"x".into()));
    }
}
