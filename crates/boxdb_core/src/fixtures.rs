//! Entity bindings shared by the unit tests.

use crate::collection::EntityCodec;
use crate::entity::{RelationHandle, RelationWriter, ToMany, ToOne};
use crate::error::CoreResult;
use crate::query::{Property, ToOneProperty};
use crate::schema::{EntityBuilder, Model, ModelBuilder, PropertyFlags};
use crate::store::Store;
use crate::types::{EntityTypeId, ObjectId};
use boxdb_codec::{PropertyType, RecordBuilder, RecordReader};
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) const MEMBERS: RelationHandle<Company, Person> = RelationHandle::new(1);

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Person {
    pub id: ObjectId,
    pub name: String,
    pub age: i32,
    pub score: f64,
    pub email: Option<String>,
    pub employer: ToOne<Company>,
    pub avatar: Option<Vec<u8>>,
    pub active: bool,
}

impl Person {
    pub const NAME: Property<Person, String> = Property::new(2);
    pub const AGE: Property<Person, i64> = Property::new(3);
    pub const SCORE: Property<Person, f64> = Property::new(4);
    pub const EMAIL: Property<Person, String> = Property::new(5);
    pub const EMPLOYER: ToOneProperty<Person, Company> = ToOneProperty::new(6);
    pub const AVATAR: Property<Person, Vec<u8>> = Property::new(7);
    pub const ACTIVE: Property<Person, bool> = Property::new(8);

    pub fn named(name: &str) -> Self {
        Self::new(name, 0)
    }

    pub fn new(name: &str, age: i32) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            age,
            score: 0.0,
            email: None,
            employer: ToOne::none(),
            avatar: None,
            active: true,
        }
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }
}

impl EntityCodec for Person {
    const ENTITY_TYPE: EntityTypeId = EntityTypeId::new(1);

    fn id(&self) -> ObjectId {
        self.id
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    fn encode(&self, id: ObjectId, builder: &mut RecordBuilder) -> CoreResult<()> {
        let employer = self.employer.encode_id()?;
        let name = builder.prepare_string(&self.name)?;
        let email = builder.prepare_opt_string(self.email.as_deref())?;
        let avatar = builder.prepare_opt_bytes(self.avatar.as_deref())?;
        builder.collect_u64(1, id);
        builder.collect_offset(2, name);
        builder.collect_i32(3, self.age);
        builder.collect_f64(4, self.score);
        builder.collect_opt_offset(5, email);
        if employer != 0 {
            builder.collect_u64(6, employer);
        }
        builder.collect_opt_offset(7, avatar);
        builder.collect_bool(8, self.active);
        Ok(())
    }

    fn decode(id: ObjectId, reader: &RecordReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            id,
            name: reader.read_string(2),
            age: reader.read_i32(3),
            score: reader.read_f64(4),
            email: reader.read_opt_string(5),
            employer: ToOne::from_id(reader.read_u64(6)),
            avatar: reader.read_opt_bytes(7),
            active: reader.read_bool(8),
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Company {
    pub id: ObjectId,
    pub name: String,
    pub city: Option<String>,
    pub members: ToMany<Person>,
}

impl Company {
    pub const NAME: Property<Company, String> = Property::new(2);
    pub const CITY: Property<Company, String> = Property::new(3);

    pub fn named(name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            city: None,
            members: ToMany::new(),
        }
    }
}

impl EntityCodec for Company {
    const ENTITY_TYPE: EntityTypeId = EntityTypeId::new(2);

    fn id(&self) -> ObjectId {
        self.id
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    fn encode(&self, id: ObjectId, builder: &mut RecordBuilder) -> CoreResult<()> {
        let name = builder.prepare_string(&self.name)?;
        let city = builder.prepare_opt_string(self.city.as_deref())?;
        builder.collect_u64(1, id);
        builder.collect_offset(2, name);
        builder.collect_opt_offset(3, city);
        Ok(())
    }

    fn decode(id: ObjectId, reader: &RecordReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            id,
            name: reader.read_string(2),
            city: reader.read_opt_string(3),
            members: ToMany::new(),
        })
    }

    fn write_relations(&self, links: &mut RelationWriter<'_>) -> CoreResult<()> {
        links.apply(MEMBERS, &self.members)
    }
}

pub(crate) fn company_model() -> Model {
    ModelBuilder::new()
        .entity(
            EntityBuilder::new(1, "Person")
                .id_property(1, "id")
                .property_with_flags(2, "name", PropertyType::String, PropertyFlags::INDEXED)
                .property(3, "age", PropertyType::Int)
                .property(4, "score", PropertyType::Double)
                .property_with_flags(5, "email", PropertyType::String, PropertyFlags::UNIQUE)
                .to_one(6, "employer", 2)
                .property(7, "avatar", PropertyType::ByteVector)
                .property(8, "active", PropertyType::Bool),
        )
        .entity(
            EntityBuilder::new(2, "Company")
                .id_property(1, "id")
                .property(2, "name", PropertyType::String)
                .property(3, "city", PropertyType::String),
        )
        .relation(1, "members", 2, 1)
        .build()
        .expect("fixture model is valid")
}

/// Opens a fresh in-memory store with a name no other test uses.
pub(crate) fn memory_store() -> Store {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let name = format!("fixture-{}", NEXT.fetch_add(1, Ordering::Relaxed));
    Store::open_in_memory(company_model(), &name).expect("in-memory store opens")
}
