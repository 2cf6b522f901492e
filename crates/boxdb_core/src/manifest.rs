//! Store manifest: format version, checkpoint position, ID sequences and
//! the persisted schema used to reject incompatible model changes.

use std::collections::BTreeMap;

use boxdb_codec::PropertyType;

use crate::error::{CoreError, CoreResult};
use crate::schema::Model;
use crate::types::{EntityTypeId, PropertyId, RelationId, SequenceNumber};
use crate::wal::compute_crc32;

/// Magic bytes for manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"BMFN";

/// Current manifest version.
pub const MANIFEST_VERSION: u16 = 1;

/// A property as remembered by the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredProperty {
    /// Property name when last opened.
    pub name: String,
    /// Stored type; must never change for an existing ID.
    pub ty: PropertyType,
}

/// An entity type as remembered by the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoredEntity {
    /// Entity name when last opened.
    pub name: String,
    /// Known properties.
    pub properties: BTreeMap<PropertyId, StoredProperty>,
}

/// Store manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Last sequence fully covered by the segment file.
    pub last_checkpoint: SequenceNumber,
    /// Last assigned object ID per entity type.
    pub id_sequences: BTreeMap<EntityTypeId, u64>,
    /// Every entity type the store has ever seen.
    pub entities: BTreeMap<EntityTypeId, StoredEntity>,
    /// Every relation the store has ever seen, as (source, target).
    pub relations: BTreeMap<RelationId, (EntityTypeId, EntityTypeId)>,
}

impl Manifest {
    /// Creates a new empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks that `model` only adds to what this store already holds.
    ///
    /// A property ID may not change its type and a relation ID may not
    /// change its endpoints. New types, properties and relations are fine,
    /// and so are renames.
    pub fn check_compatible(&self, model: &Model) -> CoreResult<()> {
        for entity in model.entities() {
            let Some(stored) = self.entities.get(&entity.id) else {
                continue;
            };
            for prop in entity.properties() {
                if let Some(old) = stored.properties.get(&prop.id) {
                    if old.ty != prop.ty {
                        return Err(CoreError::schema(format!(
                            "{}.{} ({}) was stored as {} and cannot become {}",
                            entity.name,
                            prop.name,
                            prop.id,
                            old.ty.name(),
                            prop.ty.name()
                        )));
                    }
                }
            }
        }
        for relation in model.relations() {
            if let Some(&(source, target)) = self.relations.get(&relation.id) {
                if source != relation.source || target != relation.target {
                    return Err(CoreError::schema(format!(
                        "relation {} ({}) cannot change its endpoints",
                        relation.name, relation.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Records the model's elements, keeping entries the model no longer has.
    pub fn absorb_model(&mut self, model: &Model) {
        for entity in model.entities() {
            let stored = self.entities.entry(entity.id).or_default();
            stored.name.clone_from(&entity.name);
            for prop in entity.properties() {
                stored.properties.insert(
                    prop.id,
                    StoredProperty {
                        name: prop.name.clone(),
                        ty: prop.ty,
                    },
                );
            }
        }
        for relation in model.relations() {
            self.relations
                .insert(relation.id, (relation.source, relation.target));
        }
    }

    /// Encodes the manifest to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.last_checkpoint.as_u64().to_le_bytes());

        put_len(&mut buf, self.id_sequences.len());
        for (ty, last) in &self.id_sequences {
            buf.extend_from_slice(&ty.as_u32().to_le_bytes());
            buf.extend_from_slice(&last.to_le_bytes());
        }

        put_len(&mut buf, self.entities.len());
        for (ty, entity) in &self.entities {
            buf.extend_from_slice(&ty.as_u32().to_le_bytes());
            put_str(&mut buf, &entity.name);
            put_len(&mut buf, entity.properties.len());
            for (id, prop) in &entity.properties {
                buf.extend_from_slice(&id.as_u16().to_le_bytes());
                buf.push(prop.ty.as_byte());
                put_str(&mut buf, &prop.name);
            }
        }

        put_len(&mut buf, self.relations.len());
        for (id, (source, target)) in &self.relations {
            buf.extend_from_slice(&id.as_u32().to_le_bytes());
            buf.extend_from_slice(&source.as_u32().to_le_bytes());
            buf.extend_from_slice(&target.as_u32().to_le_bytes());
        }

        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a manifest from bytes.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < 10 || data[0..4] != MANIFEST_MAGIC {
            return Err(CoreError::file_corrupt("invalid manifest magic"));
        }
        let (body, crc) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if stored != compute_crc32(body) {
            return Err(CoreError::file_corrupt("manifest checksum mismatch"));
        }

        let mut r = Reader { buf: body, pos: 4 };
        let version = r.u16()?;
        if version == 0 || version > MANIFEST_VERSION {
            return Err(CoreError::file_corrupt(format!(
                "unsupported manifest version: {version}"
            )));
        }

        let mut manifest = Self::new();
        manifest.last_checkpoint = SequenceNumber::new(r.u64()?);

        for _ in 0..r.u32()? {
            let ty = EntityTypeId::new(r.u32()?);
            manifest.id_sequences.insert(ty, r.u64()?);
        }

        for _ in 0..r.u32()? {
            let ty = EntityTypeId::new(r.u32()?);
            let mut entity = StoredEntity {
                name: r.string()?,
                properties: BTreeMap::new(),
            };
            for _ in 0..r.u32()? {
                let id = PropertyId::new(r.u16()?);
                let type_byte = r.u8()?;
                let ty = PropertyType::from_byte(type_byte).ok_or_else(|| {
                    CoreError::file_corrupt(format!("unknown property type {type_byte}"))
                })?;
                entity.properties.insert(
                    id,
                    StoredProperty {
                        name: r.string()?,
                        ty,
                    },
                );
            }
            manifest.entities.insert(ty, entity);
        }

        for _ in 0..r.u32()? {
            let id = RelationId::new(r.u32()?);
            let source = EntityTypeId::new(r.u32()?);
            let target = EntityTypeId::new(r.u32()?);
            manifest.relations.insert(id, (source, target));
        }

        if r.pos != body.len() {
            return Err(CoreError::file_corrupt("trailing bytes in manifest"));
        }
        Ok(manifest)
    }
}

fn put_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&u32::try_from(len).unwrap_or(u32::MAX).to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_len(buf, s.len());
    buf.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> CoreResult<&[u8]> {
        let end = self.pos.saturating_add(n);
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| CoreError::file_corrupt("manifest too short"))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn string(&mut self) -> CoreResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?.to_vec();
        String::from_utf8(bytes).map_err(|_| CoreError::file_corrupt("manifest name is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::schema::{EntityBuilder, ModelBuilder};

    fn model(score_type: PropertyType) -> Model {
        ModelBuilder::new()
            .entity(
                EntityBuilder::new(1, "Note")
                    .id_property(1, "id")
                    .property(2, "score", score_type),
            )
            .entity(EntityBuilder::new(2, "Tag").id_property(1, "id"))
            .relation(1, "tags", 1, 2)
            .build()
            .unwrap()
    }

    #[test]
    fn encode_decode() {
        let mut manifest = Manifest::new();
        manifest.absorb_model(&model(PropertyType::Int));
        manifest.last_checkpoint = SequenceNumber::new(12);
        manifest.id_sequences.insert(EntityTypeId::new(1), 40);

        let decoded = Manifest::decode(&manifest.encode()).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn type_change_is_rejected() {
        let mut manifest = Manifest::new();
        manifest.absorb_model(&model(PropertyType::Int));
        let err = manifest
            .check_compatible(&model(PropertyType::String))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert!(manifest.check_compatible(&model(PropertyType::Int)).is_ok());
    }

    #[test]
    fn additions_are_accepted() {
        let mut manifest = Manifest::new();
        manifest.absorb_model(&model(PropertyType::Int));
        let grown = ModelBuilder::new()
            .entity(
                EntityBuilder::new(1, "Memo")
                    .id_property(1, "id")
                    .property(2, "score", PropertyType::Int)
                    .property(3, "body", PropertyType::String),
            )
            .build()
            .unwrap();
        assert!(manifest.check_compatible(&grown).is_ok());
        manifest.absorb_model(&grown);
        assert_eq!(manifest.entities[&EntityTypeId::new(1)].name, "Memo");
        // relation from the earlier model is still remembered
        assert!(manifest.relations.contains_key(&RelationId::new(1)));
    }

    #[test]
    fn corrupt_manifest_is_detected() {
        let mut bytes = Manifest::new().encode();
        bytes[6] ^= 1;
        assert_eq!(
            Manifest::decode(&bytes).unwrap_err().kind(),
            ErrorKind::FileCorrupt
        );
    }
}
