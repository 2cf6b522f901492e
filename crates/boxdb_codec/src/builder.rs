//! Record construction.

use crate::error::{CodecError, CodecResult};
use crate::property::PropertyType;
use crate::value::Value;
use bytes::{BufMut, BytesMut};

/// Version tag written into every record header.
pub const FORMAT_VERSION: u16 = 1;

/// `slot_count (2) | version (2)`
pub(crate) const HEADER_SIZE: usize = 4;

/// Each slot holds a `u32` absolute offset, 0 meaning absent.
pub(crate) const SLOT_SIZE: usize = 4;

/// Handle to a variable-length payload prepared in a [`RecordBuilder`].
///
/// Only meaningful for the builder that returned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataOffset(u32);

#[derive(Debug, Clone, Copy)]
enum Slot {
    Absent,
    Scalar(u32),
    Variable(DataOffset),
}

/// Collects property values into the flat record layout.
///
/// ```text
/// | slot_count (2) | version (2) | slot[0..n] (4 each) | scalars | variable data |
/// ```
///
/// Slot `i` belongs to property id `i + 1` and stores the absolute offset
/// of the value, or 0 when the property is absent. Scalars are stored
/// inline at that offset; strings and byte vectors are stored as
/// `len (4) | bytes`.
///
/// Building happens in two phases. All out-of-line values are prepared
/// first with [`RecordBuilder::prepare_string`] and
/// [`RecordBuilder::prepare_bytes`]; the first `collect_*` call starts the
/// slot table, after which preparing fails with
/// [`CodecError::TableInProgress`].
///
/// ```rust
/// use boxdb_codec::{RecordBuilder, RecordReader};
///
/// let mut builder = RecordBuilder::new();
/// let title = builder.prepare_string("groceries").unwrap();
/// builder.collect_u64(1, 7);
/// builder.collect_offset(2, title);
/// let bytes = builder.finish().unwrap();
///
/// let reader = RecordReader::new(&bytes);
/// assert_eq!(reader.read_u64(1), 7);
/// assert_eq!(reader.read_string(2), "groceries");
/// ```
#[derive(Debug, Default)]
pub struct RecordBuilder {
    variable: BytesMut,
    scalars: BytesMut,
    slots: Vec<Slot>,
    table_started: bool,
    invalid_slot: bool,
}

impl RecordBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes a string into the side buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TableInProgress`] once any slot was collected.
    pub fn prepare_string(&mut self, value: &str) -> CodecResult<DataOffset> {
        self.prepare_bytes(value.as_bytes())
    }

    /// Serializes a byte vector into the side buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TableInProgress`] once any slot was collected,
    /// or [`CodecError::RecordTooLarge`] if the payload exceeds 4 GiB.
    pub fn prepare_bytes(&mut self, value: &[u8]) -> CodecResult<DataOffset> {
        if self.table_started {
            return Err(CodecError::TableInProgress);
        }
        let len = u32::try_from(value.len())
            .map_err(|_| CodecError::RecordTooLarge { len: value.len() })?;
        let offset = u32::try_from(self.variable.len()).map_err(|_| CodecError::RecordTooLarge {
            len: self.variable.len(),
        })?;
        self.variable.put_u32_le(len);
        self.variable.put_slice(value);
        Ok(DataOffset(offset))
    }

    /// Prepares an optional string; `None` prepares nothing.
    ///
    /// # Errors
    ///
    /// See [`RecordBuilder::prepare_string`].
    pub fn prepare_opt_string(&mut self, value: Option<&str>) -> CodecResult<Option<DataOffset>> {
        value.map(|v| self.prepare_string(v)).transpose()
    }

    /// Prepares optional bytes; `None` prepares nothing.
    ///
    /// # Errors
    ///
    /// See [`RecordBuilder::prepare_bytes`].
    pub fn prepare_opt_bytes(&mut self, value: Option<&[u8]>) -> CodecResult<Option<DataOffset>> {
        value.map(|v| self.prepare_bytes(v)).transpose()
    }

    /// Writes a prepared payload's offset into slot `id`.
    pub fn collect_offset(&mut self, id: u16, offset: DataOffset) {
        self.set_slot(id, Slot::Variable(offset));
    }

    /// Writes an optional prepared offset; `None` leaves the slot absent.
    pub fn collect_opt_offset(&mut self, id: u16, offset: Option<DataOffset>) {
        if let Some(offset) = offset {
            self.collect_offset(id, offset);
        }
    }

    /// Collects a boolean.
    pub fn collect_bool(&mut self, id: u16, value: bool) {
        self.put_scalar(id, |buf| buf.put_u8(u8::from(value)));
    }

    /// Collects a signed byte.
    pub fn collect_i8(&mut self, id: u16, value: i8) {
        self.put_scalar(id, |buf| buf.put_i8(value));
    }

    /// Collects a signed 16-bit integer.
    pub fn collect_i16(&mut self, id: u16, value: i16) {
        self.put_scalar(id, |buf| buf.put_i16_le(value));
    }

    /// Collects a 16-bit char code.
    pub fn collect_u16(&mut self, id: u16, value: u16) {
        self.put_scalar(id, |buf| buf.put_u16_le(value));
    }

    /// Collects a signed 32-bit integer.
    pub fn collect_i32(&mut self, id: u16, value: i32) {
        self.put_scalar(id, |buf| buf.put_i32_le(value));
    }

    /// Collects a signed 64-bit integer (also used for dates).
    pub fn collect_i64(&mut self, id: u16, value: i64) {
        self.put_scalar(id, |buf| buf.put_i64_le(value));
    }

    /// Collects an unsigned 64-bit integer (object and relation ids).
    pub fn collect_u64(&mut self, id: u16, value: u64) {
        self.put_scalar(id, |buf| buf.put_u64_le(value));
    }

    /// Collects a 32-bit float.
    pub fn collect_f32(&mut self, id: u16, value: f32) {
        self.put_scalar(id, |buf| buf.put_f32_le(value));
    }

    /// Collects a 64-bit float.
    pub fn collect_f64(&mut self, id: u16, value: f64) {
        self.put_scalar(id, |buf| buf.put_f64_le(value));
    }

    /// Collects an optional signed 64-bit integer.
    pub fn collect_opt_i64(&mut self, id: u16, value: Option<i64>) {
        if let Some(v) = value {
            self.collect_i64(id, v);
        }
    }

    /// Collects an optional signed 32-bit integer.
    pub fn collect_opt_i32(&mut self, id: u16, value: Option<i32>) {
        if let Some(v) = value {
            self.collect_i32(id, v);
        }
    }

    /// Collects an optional boolean.
    pub fn collect_opt_bool(&mut self, id: u16, value: Option<bool>) {
        if let Some(v) = value {
            self.collect_bool(id, v);
        }
    }

    /// Collects an optional 64-bit float.
    pub fn collect_opt_f64(&mut self, id: u16, value: Option<f64>) {
        if let Some(v) = value {
            self.collect_f64(id, v);
        }
    }

    /// Collects a fixed-width dynamic value, narrowing it to `ty`.
    ///
    /// Out-of-line values must go through [`RecordBuilder::from_values`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TypeMismatch`] if the value does not fit `ty`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn collect_value(&mut self, id: u16, ty: PropertyType, value: &Value) -> CodecResult<()> {
        let mismatch = || CodecError::TypeMismatch {
            expected: ty.name(),
            actual: value.kind(),
        };
        if value.is_null() {
            return Ok(());
        }
        if !value.fits(ty) || ty.fixed_width().is_none() {
            return Err(mismatch());
        }
        match ty {
            PropertyType::Float => {
                let v = value.as_f64().ok_or_else(mismatch)?;
                self.collect_f32(id, v as f32);
            }
            PropertyType::Double => self.collect_f64(id, value.as_f64().ok_or_else(mismatch)?),
            PropertyType::Bool => self.collect_bool(id, value.as_i64().ok_or_else(mismatch)? != 0),
            PropertyType::Byte => self.collect_i8(id, value.as_i64().ok_or_else(mismatch)? as i8),
            PropertyType::Short => {
                self.collect_i16(id, value.as_i64().ok_or_else(mismatch)? as i16);
            }
            PropertyType::Char => {
                self.collect_u16(id, value.as_i64().ok_or_else(mismatch)? as u16);
            }
            PropertyType::Int => self.collect_i32(id, value.as_i64().ok_or_else(mismatch)? as i32),
            _ => self.collect_i64(id, value.as_i64().ok_or_else(mismatch)?),
        }
        Ok(())
    }

    /// Builds a whole record from dynamic values, preparing out-of-line
    /// data before starting the slot table.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TypeMismatch`] for values that do not fit
    /// their declared type, or any error of [`RecordBuilder::finish`].
    pub fn from_values(values: &[(u16, PropertyType, Value)]) -> CodecResult<Vec<u8>> {
        let mut builder = Self::new();
        let mut prepared = Vec::new();
        for (id, ty, value) in values {
            let offset = match (ty, value) {
                (_, Value::Null) => continue,
                (PropertyType::String, Value::Text(s)) => builder.prepare_string(s)?,
                (PropertyType::ByteVector, Value::Bytes(b)) => builder.prepare_bytes(b)?,
                (PropertyType::String | PropertyType::ByteVector, other) => {
                    return Err(CodecError::TypeMismatch {
                        expected: ty.name(),
                        actual: other.kind(),
                    })
                }
                _ => continue,
            };
            prepared.push((*id, offset));
        }
        for (id, offset) in prepared {
            builder.collect_offset(id, offset);
        }
        for (id, ty, value) in values {
            if ty.fixed_width().is_some() {
                builder.collect_value(*id, *ty, value)?;
            }
        }
        builder.finish()
    }

    /// Lays out header, slot table, scalars and variable data.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidSlot`] if a value was collected for
    /// property id 0, or [`CodecError::RecordTooLarge`] if offsets
    /// overflow 32 bits.
    pub fn finish(self) -> CodecResult<Vec<u8>> {
        if self.invalid_slot {
            return Err(CodecError::InvalidSlot);
        }
        let slot_count = u16::try_from(self.slots.len())
            .map_err(|_| CodecError::RecordTooLarge { len: self.slots.len() })?;
        let table_end = HEADER_SIZE + self.slots.len() * SLOT_SIZE;
        let variable_start = table_end + self.scalars.len();
        let total = variable_start + self.variable.len();
        if u32::try_from(total).is_err() {
            return Err(CodecError::RecordTooLarge { len: total });
        }

        let mut out = BytesMut::with_capacity(total);
        out.put_u16_le(slot_count);
        out.put_u16_le(FORMAT_VERSION);
        for slot in &self.slots {
            // total fits in u32, so every absolute offset does too
            let absolute = match slot {
                Slot::Absent => 0,
                Slot::Scalar(at) => table_end as u32 + at,
                Slot::Variable(DataOffset(at)) => variable_start as u32 + at,
            };
            out.put_u32_le(absolute);
        }
        out.put_slice(&self.scalars);
        out.put_slice(&self.variable);
        Ok(out.to_vec())
    }

    fn put_scalar(&mut self, id: u16, write: impl FnOnce(&mut BytesMut)) {
        // scalar area stays far below 4 GiB for any sane schema; finish() checks the total
        let at = u32::try_from(self.scalars.len()).unwrap_or(u32::MAX);
        write(&mut self.scalars);
        self.set_slot(id, Slot::Scalar(at));
    }

    fn set_slot(&mut self, id: u16, slot: Slot) {
        self.table_started = true;
        let Some(index) = usize::from(id).checked_sub(1) else {
            self.invalid_slot = true;
            return;
        };
        if self.slots.len() <= index {
            self.slots.resize(index + 1, Slot::Absent);
        }
        self.slots[index] = slot;
    }
}
