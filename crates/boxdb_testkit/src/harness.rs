//! Model-checking harness for cross-crate tests.
//!
//! [`NoteHarness`] mirrors every write it performs in a plain map and
//! checks the store against that map on demand.

use crate::fixtures::{Note, TestStore};
use boxdb_core::{CoreResult, EntityBox, ObjectId};
use std::collections::BTreeMap;

/// A store plus the notes it is expected to contain.
pub struct NoteHarness {
    /// The store under test.
    pub store: TestStore,
    notes: EntityBox<Note>,
    expected: BTreeMap<ObjectId, Note>,
}

impl NoteHarness {
    /// Creates a harness over a fresh in-memory store.
    pub fn new() -> Self {
        Self::with_store(TestStore::memory())
    }

    /// Creates a harness over `store`, which must be empty.
    pub fn with_store(store: TestStore) -> Self {
        let notes = store.entity_box::<Note>().expect("Failed to open note box");
        assert!(notes.is_empty().expect("Failed to count"), "store must be empty");
        Self {
            store,
            notes,
            expected: BTreeMap::new(),
        }
    }

    /// The note box.
    pub fn notes(&self) -> &EntityBox<Note> {
        &self.notes
    }

    /// Puts `note` and tracks it on success.
    pub fn put(&mut self, note: &mut Note) -> CoreResult<ObjectId> {
        let id = self.notes.put(note)?;
        self.expected.insert(id, note.clone());
        Ok(id)
    }

    /// Puts `batch` in one transaction; tracks all of it only on success.
    pub fn put_many(&mut self, batch: &mut [Note]) -> CoreResult<Vec<ObjectId>> {
        let ids = self.notes.put_many(batch)?;
        for note in batch.iter() {
            self.expected.insert(note.id, note.clone());
        }
        Ok(ids)
    }

    /// Removes `id` and checks the result against the tracked state.
    pub fn remove(&mut self, id: ObjectId) -> CoreResult<bool> {
        let removed = self.notes.remove(id)?;
        assert_eq!(
            removed,
            self.expected.remove(&id).is_some(),
            "remove({id}) disagrees with the tracked state"
        );
        Ok(removed)
    }

    /// Loads `id` and asserts it equals the tracked note.
    pub fn get_and_verify(&self, id: ObjectId) -> Option<Note> {
        let actual = self.notes.get(id).expect("Failed to get note");
        assert_eq!(
            actual.as_ref(),
            self.expected.get(&id),
            "note {id} differs from the tracked value"
        );
        actual
    }

    /// Asserts the box holds exactly the tracked notes, in ID order.
    pub fn verify_all(&self) {
        let actual = self.notes.all().expect("Failed to load notes");
        let expected: Vec<&Note> = self.expected.values().collect();
        assert_eq!(actual.iter().collect::<Vec<_>>(), expected);
        assert_eq!(
            self.notes.count().expect("Failed to count"),
            self.expected.len() as u64
        );
    }

    /// The tracked IDs, ascending.
    pub fn tracked_ids(&self) -> Vec<ObjectId> {
        self.expected.keys().copied().collect()
    }

    /// Number of tracked notes.
    pub fn tracked_count(&self) -> usize {
        self.expected.len()
    }
}

impl Default for NoteHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::note_batch_strategy;
    use proptest::prelude::*;

    #[test]
    fn tracks_puts_and_removes() {
        let mut harness = NoteHarness::new();
        let a = harness.put(&mut Note::new("a")).unwrap();
        let b = harness.put(&mut Note::new("b")).unwrap();
        assert!(harness.remove(a).unwrap());
        assert!(!harness.remove(a).unwrap());
        harness.get_and_verify(b).unwrap();
        harness.verify_all();
        assert_eq!(harness.tracked_ids(), vec![b]);
    }

    #[test]
    fn survives_reopen() {
        let mut harness = NoteHarness::with_store(TestStore::file());
        harness.put(&mut Note::new("durable").with_rating(4.5)).unwrap();
        let NoteHarness {
            store, expected, ..
        } = harness;
        let store = store.reopen();
        let notes = store.entity_box::<Note>().unwrap();
        let reopened = NoteHarness {
            store,
            notes,
            expected,
        };
        reopened.verify_all();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn generated_batches_round_trip(mut batch in note_batch_strategy(24)) {
            let mut harness = NoteHarness::new();
            harness.put_many(&mut batch).unwrap();
            prop_assert!(batch.iter().all(|n| n.id != 0));
            harness.verify_all();
        }
    }
}
