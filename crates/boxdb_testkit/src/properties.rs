//! Cross-crate checks of the store's guaranteed behaviour, one test per
//! property.

use crate::fixtures::{scenarios, Author, Note, TestStore};
use crate::generators::{note_batch_strategy, note_strategy, record_values_strategy};
use boxdb_codec::{RecordBuilder, RecordReader, Value};
use boxdb_core::{ErrorKind, ObjectId, ObserverFlags};
use proptest::prelude::*;
use std::sync::mpsc;
use std::time::Duration;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn codec_round_trip(values in record_values_strategy()) {
        let bytes = RecordBuilder::from_values(&values).unwrap();
        let reader = RecordReader::new(&bytes);
        for (id, ty, value) in &values {
            prop_assert_eq!(&reader.read_value(*id, *ty), value);
        }
        // one past the last declared slot was never written
        let absent = values.iter().map(|(id, _, _)| *id).max().unwrap_or(1) + 1;
        prop_assert_eq!(reader.read_value(absent, boxdb_codec::PropertyType::Long), Value::Null);
        prop_assert_eq!(reader.read_string(absent), "");
        prop_assert_eq!(reader.read_i64(absent), 0);
    }

    #[test]
    fn stored_note_round_trip(mut note in note_strategy()) {
        let test_store = TestStore::memory();
        let notes = test_store.entity_box::<Note>().unwrap();
        let id = notes.put(&mut note).unwrap();
        prop_assert_eq!(notes.get(id).unwrap(), Some(note));
    }
}

#[test]
fn absent_optional_fields_read_as_defaults() {
    let test_store = TestStore::memory();
    let notes = test_store.entity_box::<Note>().unwrap();
    let id = notes.put(&mut Note::new("bare")).unwrap();

    let loaded = notes.get(id).unwrap().unwrap();
    assert_eq!(loaded.body, None);
    assert_eq!(loaded.rating, None);
    assert_eq!(loaded.attachment, None);
    assert!(loaded.author.is_null());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn id_assignment_is_monotonic(batches in prop::collection::vec(note_batch_strategy(8), 1..6)) {
        let test_store = TestStore::memory();
        let notes = test_store.entity_box::<Note>().unwrap();
        let mut highest: ObjectId = 0;
        for mut batch in batches {
            let ids = notes.put_many(&mut batch).unwrap();
            prop_assert_eq!(ids.len(), batch.len());
            for id in ids {
                prop_assert!(id > highest, "{} not above {}", id, highest);
                highest = id;
            }
        }
    }
}

#[test]
fn failed_batch_persists_nothing() {
    let test_store = TestStore::memory();
    let authors = test_store.entity_box::<Author>().unwrap();
    let mut batch: Vec<Author> = (0..8).map(|i| Author::new(&format!("author-{i}"))).collect();
    batch[4].name = batch[0].name.clone();

    let err = authors.put_many(&mut batch).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UniqueViolation);
    assert_eq!(authors.count().unwrap(), 0);
    assert!(authors
        .query()
        .filter(Author::NAME.eq("author-1"))
        .build()
        .unwrap()
        .find()
        .unwrap()
        .is_empty());
}

#[test]
fn open_read_is_isolated_from_later_commits() {
    let test_store = TestStore::memory();
    let notes = test_store.entity_box::<Note>().unwrap();
    notes.put(&mut Note::new("before")).unwrap();

    let guard = test_store.begin_read().unwrap();
    assert_eq!(notes.count().unwrap(), 1);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let writer = test_store.entity_box::<Note>().unwrap();
            writer.put(&mut Note::new("during")).unwrap();
        });
    });

    assert_eq!(notes.count().unwrap(), 1);
    assert!(notes
        .query()
        .filter(Note::TITLE.eq("during"))
        .build()
        .unwrap()
        .find()
        .unwrap()
        .is_empty());
    drop(guard);

    assert_eq!(notes.count().unwrap(), 2);
}

#[test]
fn rebinding_narrows_without_rebuilding() {
    let test_store = scenarios::populated_store(100);
    let notes = test_store.entity_box::<Note>().unwrap();
    let mut query = notes
        .query()
        .filter(Note::PRIORITY.gt(18))
        .build()
        .unwrap();

    let adults = query.find_ids().unwrap();
    assert_eq!(adults.len(), 81);

    query.set_parameter(Note::PRIORITY, 65_i64).unwrap();
    let seniors = query.find_ids().unwrap();
    assert_eq!(seniors.len(), 34);
    assert!(seniors.iter().all(|id| adults.contains(id)));
    assert!(seniors.len() < adults.len());
}

#[test]
fn removing_missing_ids_is_not_an_error() {
    let test_store = TestStore::memory();
    let notes = test_store.entity_box::<Note>().unwrap();
    assert!(!notes.remove(12_345).unwrap());
    assert_eq!(notes.remove_many(&[7, 8, 9]).unwrap(), 0);

    let id = notes.put(&mut Note::new("doomed")).unwrap();
    assert!(notes.remove(id).unwrap());
    assert_eq!(notes.get(id).unwrap(), None);
    assert!(!notes.remove(id).unwrap());
}

#[test]
fn send_initial_delivers_once_before_writes() {
    let test_store = TestStore::memory();
    let notes = test_store.entity_box::<Note>().unwrap();
    let (tx, rx) = mpsc::channel();

    let observer = notes
        .subscribe(ObserverFlags::SEND_INITIAL, move || {
            let _ = tx.send(());
        })
        .unwrap();

    rx.recv_timeout(Duration::from_secs(5))
        .expect("initial notification");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    notes.put(&mut Note::new("trigger")).unwrap();
    rx.recv_timeout(Duration::from_secs(5))
        .expect("notification after put");
    observer.unsubscribe();
}

#[test]
fn note_end_to_end() {
    let test_store = TestStore::file();
    let notes = test_store.entity_box::<Note>().unwrap();

    notes.put(&mut Note::new("a")).unwrap();
    notes.put(&mut Note::new("b")).unwrap();
    assert_eq!(notes.count().unwrap(), 2);

    let found = notes
        .query()
        .filter(Note::TITLE.eq("a"))
        .build()
        .unwrap()
        .find()
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].title, "a");

    assert_eq!(notes.remove_all().unwrap(), 2);
    assert_eq!(notes.count().unwrap(), 0);
}

#[test]
fn links_aggregates_and_ordering_together() {
    let (test_store, authors) = scenarios::authored_store();
    let notes = test_store.entity_box::<Note>().unwrap();

    let by_grace = notes
        .query()
        .link(Note::AUTHOR, Author::NAME.eq("grace"))
        .order_by(Note::PRIORITY, boxdb_core::OrderFlags::DESCENDING)
        .build()
        .unwrap();
    let titles: Vec<String> = by_grace.find().unwrap().into_iter().map(|n| n.title).collect();
    assert_eq!(titles, vec!["compiler", "groceries"]);
    assert_eq!(
        by_grace.property(Note::PRIORITY).unwrap().sum_i64().unwrap(),
        6
    );

    let unauthored = notes
        .query()
        .filter(Note::AUTHOR.is_null())
        .build()
        .unwrap()
        .find()
        .unwrap();
    assert_eq!(unauthored.len(), 1);
    assert_eq!(unauthored[0].title, "loose");
    assert!(authors.iter().all(|a| a.id != 0));
}
