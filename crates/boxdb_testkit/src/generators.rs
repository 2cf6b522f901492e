//! Property-based test generators using proptest.
//!
//! Strategies produce values that satisfy the model of
//! [`notes_model`](crate::fixtures::notes_model), so generated notes can be
//! stored without further filtering.

use crate::fixtures::Note;
use boxdb_codec::{PropertyType, Value};
use proptest::prelude::*;

/// Strategy for note titles, including empty and non-ASCII ones.
pub fn title_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        prop::string::string_regex("[a-zA-Z0-9 ]{1,24}").expect("Invalid regex"),
        "\\PC{1,12}",
    ]
}

/// Strategy for optional byte attachments.
pub fn attachment_strategy() -> impl Strategy<Value = Option<Vec<u8>>> {
    prop::option::of(prop::collection::vec(any::<u8>(), 0..256))
}

/// Strategy for finite ratings. NaN is excluded so notes compare equal
/// after a round trip.
pub fn rating_strategy() -> impl Strategy<Value = Option<f64>> {
    prop::option::of(prop::num::f64::NORMAL | prop::num::f64::ZERO | prop::num::f64::SUBNORMAL)
}

/// Strategy for unsaved notes without relations.
pub fn note_strategy() -> impl Strategy<Value = Note> {
    (
        title_strategy(),
        prop::option::of("[a-z ]{0,64}"),
        any::<i64>(),
        any::<i32>(),
        rating_strategy(),
        attachment_strategy(),
        any::<bool>(),
    )
        .prop_map(
            |(title, body, created, priority, rating, attachment, pinned)| {
                let mut note = Note::new(&title);
                note.body = body;
                note.created = created;
                note.priority = priority;
                note.rating = rating;
                note.attachment = attachment;
                note.pinned = pinned;
                note
            },
        )
}

/// Strategy for batches of `1..max` unsaved notes.
pub fn note_batch_strategy(max: usize) -> impl Strategy<Value = Vec<Note>> {
    prop::collection::vec(note_strategy(), 1..max.max(2))
}

/// Strategy for a property type paired with a value that fits it.
pub fn typed_value_strategy() -> impl Strategy<Value = (PropertyType, Value)> {
    prop_oneof![
        any::<bool>().prop_map(|b| (PropertyType::Bool, Value::Bool(b))),
        any::<i8>().prop_map(|v| (PropertyType::Byte, Value::Int(i64::from(v)))),
        any::<i16>().prop_map(|v| (PropertyType::Short, Value::Int(i64::from(v)))),
        any::<i32>().prop_map(|v| (PropertyType::Int, Value::Int(i64::from(v)))),
        any::<i64>().prop_map(|v| (PropertyType::Long, Value::Int(v))),
        any::<i64>().prop_map(|v| (PropertyType::Date, Value::Int(v))),
        prop::num::f64::NORMAL.prop_map(|v| (PropertyType::Double, Value::Float(v))),
        ".{0,32}".prop_map(|s| (PropertyType::String, Value::Text(s))),
        prop::collection::vec(any::<u8>(), 0..64)
            .prop_map(|b| (PropertyType::ByteVector, Value::Bytes(b))),
    ]
}

/// Strategy for a whole record: property ids 2.. with values, some absent.
pub fn record_values_strategy() -> impl Strategy<Value = Vec<(u16, PropertyType, Value)>> {
    prop::collection::vec(prop::option::of(typed_value_strategy()), 1..12).prop_map(|slots| {
        slots
            .into_iter()
            .zip(2u16..)
            .filter_map(|(slot, id)| slot.map(|(ty, value)| (id, ty, value)))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn generated_notes_are_unsaved() {
        let mut runner = TestRunner::default();
        for _ in 0..32 {
            let note = note_strategy().new_tree(&mut runner).unwrap().current();
            assert_eq!(note.id, 0);
            assert!(note.rating.map_or(true, f64::is_finite));
        }
    }

    #[test]
    fn typed_values_fit_their_type() {
        let mut runner = TestRunner::default();
        for _ in 0..64 {
            let (ty, value) = typed_value_strategy().new_tree(&mut runner).unwrap().current();
            assert!(value.fits(ty), "{value:?} does not fit {ty:?}");
        }
    }

    proptest! {
        #[test]
        fn record_ids_are_distinct(values in record_values_strategy()) {
            let mut ids: Vec<u16> = values.iter().map(|(id, _, _)| *id).collect();
            ids.dedup();
            prop_assert_eq!(ids.len(), values.len());
        }
    }
}
