//! Record decoding.

use crate::builder::{HEADER_SIZE, SLOT_SIZE};
use crate::property::PropertyType;
use crate::value::Value;

/// Read-only view over an encoded record.
///
/// Reading never fails. A slot that is absent, out of range or points
/// outside the buffer reads as absent: typed accessors return `0`,
/// `false`, an empty string or empty bytes, and the `read_opt_*` accessors
/// return `None`. Strings with invalid UTF-8 read as empty strings.
#[derive(Debug, Clone, Copy)]
pub struct RecordReader<'a> {
    buf: &'a [u8],
    slot_count: usize,
}

impl<'a> RecordReader<'a> {
    /// Wraps an encoded record. A buffer too short for its own slot table
    /// is treated as a record without slots.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        let declared = buf
            .get(0..2)
            .map_or(0, |b| usize::from(u16::from_le_bytes([b[0], b[1]])));
        let fits = HEADER_SIZE + declared * SLOT_SIZE <= buf.len();
        Self {
            buf,
            slot_count: if fits { declared } else { 0 },
        }
    }

    /// Number of slots in the table.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Returns `true` if property `id` holds a value.
    #[must_use]
    pub fn has(&self, id: u16) -> bool {
        self.slot_offset(id).is_some()
    }

    fn slot_offset(&self, id: u16) -> Option<usize> {
        let index = usize::from(id).checked_sub(1)?;
        if index >= self.slot_count {
            return None;
        }
        let at = HEADER_SIZE + index * SLOT_SIZE;
        let raw = u32::from_le_bytes(self.buf.get(at..at + 4)?.try_into().ok()?);
        if raw == 0 {
            None
        } else {
            usize::try_from(raw).ok()
        }
    }

    fn fixed<const N: usize>(&self, id: u16) -> Option<[u8; N]> {
        let at = self.slot_offset(id)?;
        self.buf.get(at..at.checked_add(N)?)?.try_into().ok()
    }

    fn variable(&self, id: u16) -> Option<&'a [u8]> {
        let at = self.slot_offset(id)?;
        let len = u32::from_le_bytes(self.buf.get(at..at.checked_add(4)?)?.try_into().ok()?);
        let start = at + 4;
        self.buf.get(start..start.checked_add(usize::try_from(len).ok()?)?)
    }

    /// Reads an optional boolean.
    #[must_use]
    pub fn read_opt_bool(&self, id: u16) -> Option<bool> {
        self.fixed::<1>(id).map(|b| b[0] != 0)
    }

    /// Reads a boolean, `false` if absent.
    #[must_use]
    pub fn read_bool(&self, id: u16) -> bool {
        self.read_opt_bool(id).unwrap_or(false)
    }

    /// Reads an optional signed byte.
    #[must_use]
    pub fn read_opt_i8(&self, id: u16) -> Option<i8> {
        self.fixed::<1>(id).map(i8::from_le_bytes)
    }

    /// Reads a signed byte, 0 if absent.
    #[must_use]
    pub fn read_i8(&self, id: u16) -> i8 {
        self.read_opt_i8(id).unwrap_or(0)
    }

    /// Reads an optional signed 16-bit integer.
    #[must_use]
    pub fn read_opt_i16(&self, id: u16) -> Option<i16> {
        self.fixed::<2>(id).map(i16::from_le_bytes)
    }

    /// Reads a signed 16-bit integer, 0 if absent.
    #[must_use]
    pub fn read_i16(&self, id: u16) -> i16 {
        self.read_opt_i16(id).unwrap_or(0)
    }

    /// Reads an optional 16-bit char code.
    #[must_use]
    pub fn read_opt_u16(&self, id: u16) -> Option<u16> {
        self.fixed::<2>(id).map(u16::from_le_bytes)
    }

    /// Reads an optional signed 32-bit integer.
    #[must_use]
    pub fn read_opt_i32(&self, id: u16) -> Option<i32> {
        self.fixed::<4>(id).map(i32::from_le_bytes)
    }

    /// Reads a signed 32-bit integer, 0 if absent.
    #[must_use]
    pub fn read_i32(&self, id: u16) -> i32 {
        self.read_opt_i32(id).unwrap_or(0)
    }

    /// Reads an optional signed 64-bit integer.
    #[must_use]
    pub fn read_opt_i64(&self, id: u16) -> Option<i64> {
        self.fixed::<8>(id).map(i64::from_le_bytes)
    }

    /// Reads a signed 64-bit integer, 0 if absent.
    #[must_use]
    pub fn read_i64(&self, id: u16) -> i64 {
        self.read_opt_i64(id).unwrap_or(0)
    }

    /// Reads an optional unsigned 64-bit integer.
    #[must_use]
    pub fn read_opt_u64(&self, id: u16) -> Option<u64> {
        self.fixed::<8>(id).map(u64::from_le_bytes)
    }

    /// Reads an unsigned 64-bit integer, 0 if absent.
    #[must_use]
    pub fn read_u64(&self, id: u16) -> u64 {
        self.read_opt_u64(id).unwrap_or(0)
    }

    /// Reads an optional 32-bit float.
    #[must_use]
    pub fn read_opt_f32(&self, id: u16) -> Option<f32> {
        self.fixed::<4>(id).map(f32::from_le_bytes)
    }

    /// Reads a 32-bit float, 0.0 if absent.
    #[must_use]
    pub fn read_f32(&self, id: u16) -> f32 {
        self.read_opt_f32(id).unwrap_or(0.0)
    }

    /// Reads an optional 64-bit float.
    #[must_use]
    pub fn read_opt_f64(&self, id: u16) -> Option<f64> {
        self.fixed::<8>(id).map(f64::from_le_bytes)
    }

    /// Reads a 64-bit float, 0.0 if absent.
    #[must_use]
    pub fn read_f64(&self, id: u16) -> f64 {
        self.read_opt_f64(id).unwrap_or(0.0)
    }

    /// Reads an optional string. Invalid UTF-8 yields `Some("")`.
    #[must_use]
    pub fn read_opt_string(&self, id: u16) -> Option<String> {
        self.variable(id)
            .map(|raw| std::str::from_utf8(raw).map(str::to_owned).unwrap_or_default())
    }

    /// Reads a string, empty if absent or not valid UTF-8.
    #[must_use]
    pub fn read_string(&self, id: u16) -> String {
        self.read_opt_string(id).unwrap_or_default()
    }

    /// Reads optional bytes.
    #[must_use]
    pub fn read_opt_bytes(&self, id: u16) -> Option<Vec<u8>> {
        self.variable(id).map(<[u8]>::to_vec)
    }

    /// Reads bytes, empty if absent.
    #[must_use]
    pub fn read_bytes(&self, id: u16) -> Vec<u8> {
        self.read_opt_bytes(id).unwrap_or_default()
    }

    /// Reads slot `id` as a dynamic value of type `ty`.
    #[must_use]
    pub fn read_value(&self, id: u16, ty: PropertyType) -> Value {
        let value = match ty {
            PropertyType::Bool => self.read_opt_bool(id).map(Value::Bool),
            PropertyType::Byte => self.read_opt_i8(id).map(|v| Value::Int(i64::from(v))),
            PropertyType::Short => self.read_opt_i16(id).map(|v| Value::Int(i64::from(v))),
            PropertyType::Char => self.read_opt_u16(id).map(|v| Value::Int(i64::from(v))),
            PropertyType::Int => self.read_opt_i32(id).map(|v| Value::Int(i64::from(v))),
            PropertyType::Long
            | PropertyType::Date
            | PropertyType::DateNano
            | PropertyType::Relation => self.read_opt_i64(id).map(Value::Int),
            PropertyType::Float => self.read_opt_f32(id).map(|v| Value::Float(f64::from(v))),
            PropertyType::Double => self.read_opt_f64(id).map(Value::Float),
            PropertyType::String => self.read_opt_string(id).map(Value::Text),
            PropertyType::ByteVector => self.read_opt_bytes(id).map(Value::Bytes),
        };
        value.unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RecordBuilder;
    use proptest::prelude::*;

    #[test]
    fn defaults_for_absent_slots() {
        let bytes = RecordBuilder::new().finish().unwrap();
        let reader = RecordReader::new(&bytes);

        assert!(!reader.read_bool(4));
        assert_eq!(reader.read_i64(1), 0);
        assert_eq!(reader.read_f64(2), 0.0);
        assert_eq!(reader.read_string(3), "");
        assert!(reader.read_bytes(3).is_empty());
        assert_eq!(reader.read_opt_string(3), None);
        assert_eq!(reader.read_value(3, PropertyType::String), Value::Null);
    }

    #[test]
    fn truncated_buffers_read_as_absent() {
        let mut builder = RecordBuilder::new();
        let name = builder.prepare_string("a fairly long string value").unwrap();
        builder.collect_offset(2, name);
        builder.collect_i64(1, 99);
        let bytes = builder.finish().unwrap();

        for cut in 0..bytes.len() {
            let reader = RecordReader::new(&bytes[..cut]);
            // must not panic; values are either intact or absent
            let id = reader.read_i64(1);
            assert!(id == 0 || id == 99);
            let name = reader.read_string(2);
            assert!(name.is_empty() || name == "a fairly long string value");
        }
        assert!(RecordReader::new(&[]).read_opt_i64(1).is_none());
    }

    #[test]
    fn invalid_utf8_degrades_to_empty() {
        let mut builder = RecordBuilder::new();
        let bad = builder.prepare_bytes(&[0xff, 0xfe, 0x00]).unwrap();
        builder.collect_offset(1, bad);
        let bytes = builder.finish().unwrap();

        let reader = RecordReader::new(&bytes);
        assert_eq!(reader.read_opt_string(1), Some(String::new()));
        assert_eq!(reader.read_bytes(1), vec![0xff, 0xfe, 0x00]);
    }

    #[test]
    fn dynamic_values_round_trip() {
        let values = vec![
            (1, PropertyType::Long, Value::Int(12)),
            (2, PropertyType::String, Value::Text("note".into())),
            (3, PropertyType::Bool, Value::Bool(true)),
            (4, PropertyType::Double, Value::Float(2.5)),
            (5, PropertyType::ByteVector, Value::Bytes(vec![1, 2, 3])),
            (6, PropertyType::Short, Value::Int(-7)),
            (7, PropertyType::Date, Value::Null),
        ];
        let bytes = RecordBuilder::from_values(&values).unwrap();
        let reader = RecordReader::new(&bytes);
        for (id, ty, value) in &values {
            assert_eq!(&reader.read_value(*id, *ty), value);
        }
    }

    proptest! {
        #[test]
        fn scalars_strings_and_bytes_round_trip(
            id in any::<u64>(),
            count in any::<i32>(),
            ratio in any::<f64>().prop_filter("comparable", |f| !f.is_nan()),
            flag in any::<bool>(),
            title in ".*",
            blob in prop::collection::vec(any::<u8>(), 0..256),
            created in any::<i64>(),
            maybe in proptest::option::of(any::<i64>()),
        ) {
            let mut builder = RecordBuilder::new();
            let title_at = builder.prepare_string(&title).unwrap();
            let blob_at = builder.prepare_bytes(&blob).unwrap();
            builder.collect_u64(1, id);
            builder.collect_offset(2, title_at);
            builder.collect_i32(3, count);
            builder.collect_f64(4, ratio);
            builder.collect_bool(5, flag);
            builder.collect_offset(6, blob_at);
            builder.collect_i64(7, created);
            builder.collect_opt_i64(8, maybe);
            let bytes = builder.finish().unwrap();

            let reader = RecordReader::new(&bytes);
            prop_assert_eq!(reader.read_u64(1), id);
            prop_assert_eq!(reader.read_string(2), title);
            prop_assert_eq!(reader.read_i32(3), count);
            prop_assert_eq!(reader.read_f64(4), ratio);
            prop_assert_eq!(reader.read_bool(5), flag);
            prop_assert_eq!(reader.read_bytes(6), blob);
            prop_assert_eq!(reader.read_i64(7), created);
            prop_assert_eq!(reader.read_opt_i64(8), maybe);
        }
    }
}
