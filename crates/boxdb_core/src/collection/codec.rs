//! Entity codec trait implemented by generated bindings.

use crate::entity::RelationWriter;
use crate::error::CoreResult;
use crate::types::{EntityTypeId, ObjectId};
use boxdb_codec::{RecordBuilder, RecordReader};

/// Version of the binding contract this engine implements.
///
/// Bindings produced for another version are rejected the first time a
/// box is opened for them.
pub const BINDING_VERSION: u32 = 1;

/// Trait for types that can be stored in a box.
///
/// Implementations are normally generated from the model; they translate
/// between a Rust value and the flat record format. Property IDs used in
/// `encode` and `decode` must match the entity declaration in the
/// [`Model`](crate::Model).
///
/// # Example
///
/// ```rust,ignore
/// struct Note {
///     id: u64,
///     title: String,
/// }
///
/// impl EntityCodec for Note {
///     const ENTITY_TYPE: EntityTypeId = EntityTypeId::new(1);
///
///     fn id(&self) -> ObjectId {
///         self.id
///     }
///
///     fn set_id(&mut self, id: ObjectId) {
///         self.id = id;
///     }
///
///     fn encode(&self, id: ObjectId, builder: &mut RecordBuilder) -> CoreResult<()> {
///         // variable-length data first, then the slots
///         let title = builder.prepare_string(&self.title)?;
///         builder.collect_u64(1, id);
///         builder.collect_offset(2, title);
///         Ok(())
///     }
///
///     fn decode(id: ObjectId, reader: &RecordReader<'_>) -> CoreResult<Self> {
///         Ok(Note { id, title: reader.read_string(2) })
///     }
/// }
/// ```
pub trait EntityCodec: Sized + Send + 'static {
    /// Entity type this binding encodes.
    const ENTITY_TYPE: EntityTypeId;

    /// Binding contract version the implementation was generated for.
    fn binding_version() -> u32 {
        BINDING_VERSION
    }

    /// Returns the object ID, 0 if the object was never stored.
    fn id(&self) -> ObjectId;

    /// Writes an assigned ID back into the object.
    fn set_id(&mut self, id: ObjectId);

    /// Encodes the object under `id`.
    ///
    /// All strings and byte vectors must be prepared before the first
    /// slot is collected.
    fn encode(&self, id: ObjectId, builder: &mut RecordBuilder) -> CoreResult<()>;

    /// Decodes an object stored under `id`.
    fn decode(id: ObjectId, reader: &RecordReader<'_>) -> CoreResult<Self>;

    /// Writes pending to-many links. Called once the object received its
    /// ID on first insert, inside the inserting transaction.
    fn write_relations(&self, _links: &mut RelationWriter<'_>) -> CoreResult<()> {
        Ok(())
    }
}

/// Encodes `entity` under `id` into a finished record.
pub(crate) fn encode_record<T: EntityCodec>(entity: &T, id: ObjectId) -> CoreResult<Vec<u8>> {
    let mut builder = RecordBuilder::new();
    entity.encode(id, &mut builder)?;
    Ok(builder.finish()?)
}

/// Decodes a stored record.
pub(crate) fn decode_record<T: EntityCodec>(id: ObjectId, payload: &[u8]) -> CoreResult<T> {
    T::decode(id, &RecordReader::new(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Sample {
        id: ObjectId,
        name: String,
        score: Option<i64>,
    }

    impl EntityCodec for Sample {
        const ENTITY_TYPE: EntityTypeId = EntityTypeId::new(9);

        fn id(&self) -> ObjectId {
            self.id
        }

        fn set_id(&mut self, id: ObjectId) {
            self.id = id;
        }

        fn encode(&self, id: ObjectId, builder: &mut RecordBuilder) -> CoreResult<()> {
            let name = builder.prepare_string(&self.name)?;
            builder.collect_u64(1, id);
            builder.collect_offset(2, name);
            builder.collect_opt_i64(3, self.score);
            Ok(())
        }

        fn decode(id: ObjectId, reader: &RecordReader<'_>) -> CoreResult<Self> {
            Ok(Self {
                id,
                name: reader.read_string(2),
                score: reader.read_opt_i64(3),
            })
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let sample = Sample {
            id: 0,
            name: "first".into(),
            score: Some(-4),
        };
        let bytes = encode_record(&sample, 12).unwrap();
        let decoded: Sample = decode_record(12, &bytes).unwrap();
        assert_eq!(decoded.id, 12);
        assert_eq!(decoded.name, "first");
        assert_eq!(decoded.score, Some(-4));
        assert_eq!(RecordReader::new(&bytes).read_u64(1), 12);
    }

    #[test]
    fn absent_optional_reads_as_none() {
        let sample = Sample {
            id: 3,
            name: String::new(),
            score: None,
        };
        let bytes = encode_record(&sample, 3).unwrap();
        let decoded: Sample = decode_record(3, &bytes).unwrap();
        assert_eq!(decoded.score, None);
        assert_eq!(decoded, sample);
    }

    #[test]
    fn default_binding_version() {
        assert_eq!(Sample::binding_version(), BINDING_VERSION);
    }
}
