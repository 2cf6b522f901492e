//! Sample entity bindings and store helpers.
//!
//! The bindings below are written the way generated code would look: one
//! [`EntityCodec`] impl per struct plus typed property constants used to
//! build queries.

use boxdb_codec::{PropertyType, RecordBuilder, RecordReader};
use boxdb_core::{
    Config, CoreResult, EntityBuilder, EntityCodec, EntityTypeId, Model, ModelBuilder, ObjectId,
    Property, PropertyFlags, RelationHandle, RelationWriter, Store, ToMany, ToOne,
    ToOneProperty,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Tags attached to a note.
pub const NOTE_TAGS: RelationHandle<Note, Tag> = RelationHandle::new(1);

/// A note with a title, optional body and an author.
#[derive(Debug, Clone)]
pub struct Note {
    /// Object ID, 0 until stored.
    pub id: ObjectId,
    /// Title, indexed.
    pub title: String,
    /// Free text.
    pub body: Option<String>,
    /// Creation time in milliseconds since the epoch.
    pub created: i64,
    /// Sort weight.
    pub priority: i32,
    /// Reader rating, absent until rated.
    pub rating: Option<f64>,
    /// Raw attachment.
    pub attachment: Option<Vec<u8>>,
    /// Pinned to the top.
    pub pinned: bool,
    /// Who wrote it.
    pub author: ToOne<Author>,
    /// Labels.
    pub tags: ToMany<Tag>,
}

impl Note {
    /// `title` property.
    pub const TITLE: Property<Note, String> = Property::new(2);
    /// `body` property.
    pub const BODY: Property<Note, String> = Property::new(3);
    /// `created` property.
    pub const CREATED: Property<Note, i64> = Property::new(4);
    /// `priority` property.
    pub const PRIORITY: Property<Note, i64> = Property::new(5);
    /// `rating` property.
    pub const RATING: Property<Note, f64> = Property::new(6);
    /// `attachment` property.
    pub const ATTACHMENT: Property<Note, Vec<u8>> = Property::new(7);
    /// `pinned` property.
    pub const PINNED: Property<Note, bool> = Property::new(8);
    /// `author` relation property.
    pub const AUTHOR: ToOneProperty<Note, Author> = ToOneProperty::new(9);

    /// An unsaved note with `title` and defaults elsewhere.
    pub fn new(title: &str) -> Self {
        Self {
            id: 0,
            title: title.to_string(),
            body: None,
            created: 0,
            priority: 0,
            rating: None,
            attachment: None,
            pinned: false,
            author: ToOne::none(),
            tags: ToMany::new(),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self
    }

    /// Sets the rating.
    #[must_use]
    pub fn with_rating(mut self, rating: f64) -> Self {
        self.rating = Some(rating);
        self
    }

    /// Sets the author.
    #[must_use]
    pub fn by(mut self, author: &Author) -> Self {
        self.author.set(author);
        self
    }
}

// Pending tag changes are not part of the stored record.
impl PartialEq for Note {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.title == other.title
            && self.body == other.body
            && self.created == other.created
            && self.priority == other.priority
            && self.rating == other.rating
            && self.attachment == other.attachment
            && self.pinned == other.pinned
            && self.author == other.author
    }
}

impl EntityCodec for Note {
    const ENTITY_TYPE: EntityTypeId = EntityTypeId::new(1);

    fn id(&self) -> ObjectId {
        self.id
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    fn encode(&self, id: ObjectId, builder: &mut RecordBuilder) -> CoreResult<()> {
        let author = self.author.encode_id()?;
        let title = builder.prepare_string(&self.title)?;
        let body = builder.prepare_opt_string(self.body.as_deref())?;
        let attachment = builder.prepare_opt_bytes(self.attachment.as_deref())?;
        builder.collect_u64(1, id);
        builder.collect_offset(2, title);
        builder.collect_opt_offset(3, body);
        builder.collect_i64(4, self.created);
        builder.collect_i32(5, self.priority);
        builder.collect_opt_f64(6, self.rating);
        builder.collect_opt_offset(7, attachment);
        builder.collect_bool(8, self.pinned);
        if author != 0 {
            builder.collect_u64(9, author);
        }
        Ok(())
    }

    fn decode(id: ObjectId, reader: &RecordReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            id,
            title: reader.read_string(2),
            body: reader.read_opt_string(3),
            created: reader.read_i64(4),
            priority: reader.read_i32(5),
            rating: reader.read_opt_f64(6),
            attachment: reader.read_opt_bytes(7),
            pinned: reader.read_bool(8),
            author: ToOne::from_id(reader.read_u64(9)),
            tags: ToMany::new(),
        })
    }

    fn write_relations(&self, links: &mut RelationWriter<'_>) -> CoreResult<()> {
        links.apply(NOTE_TAGS, &self.tags)
    }
}

/// Someone writing notes. Names are unique.
#[derive(Debug, Clone, PartialEq)]
pub struct Author {
    /// Object ID.
    pub id: ObjectId,
    /// Unique display name.
    pub name: String,
    /// Contact address.
    pub email: Option<String>,
}

impl Author {
    /// `name` property.
    pub const NAME: Property<Author, String> = Property::new(2);
    /// `email` property.
    pub const EMAIL: Property<Author, String> = Property::new(3);

    /// An unsaved author.
    pub fn new(name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            email: None,
        }
    }
}

impl EntityCodec for Author {
    const ENTITY_TYPE: EntityTypeId = EntityTypeId::new(2);

    fn id(&self) -> ObjectId {
        self.id
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    fn encode(&self, id: ObjectId, builder: &mut RecordBuilder) -> CoreResult<()> {
        let name = builder.prepare_string(&self.name)?;
        let email = builder.prepare_opt_string(self.email.as_deref())?;
        builder.collect_u64(1, id);
        builder.collect_offset(2, name);
        builder.collect_opt_offset(3, email);
        Ok(())
    }

    fn decode(id: ObjectId, reader: &RecordReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            id,
            name: reader.read_string(2),
            email: reader.read_opt_string(3),
        })
    }
}

/// A label.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    /// Object ID.
    pub id: ObjectId,
    /// Label text, hash indexed.
    pub label: String,
}

impl Tag {
    /// `label` property.
    pub const LABEL: Property<Tag, String> = Property::new(2);

    /// An unsaved tag.
    pub fn new(label: &str) -> Self {
        Self {
            id: 0,
            label: label.to_string(),
        }
    }
}

impl EntityCodec for Tag {
    const ENTITY_TYPE: EntityTypeId = EntityTypeId::new(3);

    fn id(&self) -> ObjectId {
        self.id
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    fn encode(&self, id: ObjectId, builder: &mut RecordBuilder) -> CoreResult<()> {
        let label = builder.prepare_string(&self.label)?;
        builder.collect_u64(1, id);
        builder.collect_offset(2, label);
        Ok(())
    }

    fn decode(id: ObjectId, reader: &RecordReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            id,
            label: reader.read_string(2),
        })
    }
}

/// The model declaring [`Note`], [`Author`], [`Tag`] and [`NOTE_TAGS`].
pub fn notes_model() -> Model {
    ModelBuilder::new()
        .entity(
            EntityBuilder::new(1, "Note")
                .id_property(1, "id")
                .property_with_flags(2, "title", PropertyType::String, PropertyFlags::INDEXED)
                .property(3, "body", PropertyType::String)
                .property(4, "created", PropertyType::Date)
                .property(5, "priority", PropertyType::Int)
                .property(6, "rating", PropertyType::Double)
                .property(7, "attachment", PropertyType::ByteVector)
                .property(8, "pinned", PropertyType::Bool)
                .to_one(9, "author", 2),
        )
        .entity(
            EntityBuilder::new(2, "Author")
                .id_property(1, "id")
                .property_with_flags(
                    2,
                    "name",
                    PropertyType::String,
                    PropertyFlags::INDEXED | PropertyFlags::UNIQUE,
                )
                .property(3, "email", PropertyType::String),
        )
        .entity(
            EntityBuilder::new(3, "Tag")
                .id_property(1, "id")
                .property_with_flags(
                    2,
                    "label",
                    PropertyType::String,
                    PropertyFlags::INDEXED | PropertyFlags::INDEX_HASH,
                ),
        )
        .relation(1, "tags", 1, 3)
        .build()
        .expect("notes model is valid")
}

/// Returns an in-memory store name no other caller in this process gets.
pub fn unique_memory_name() -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!("testkit-{}", NEXT.fetch_add(1, Ordering::Relaxed))
}

/// A store over [`notes_model`] that cleans up after itself.
pub struct TestStore {
    /// The open store.
    pub store: Store,
    temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Opens a fresh in-memory store.
    pub fn memory() -> Self {
        Self {
            store: Store::open_in_memory(notes_model(), &unique_memory_name())
                .expect("Failed to open in-memory store"),
            temp_dir: None,
        }
    }

    /// Opens a fresh store in a temporary directory.
    pub fn file() -> Self {
        Self::file_with_config(Config::default())
    }

    /// Opens a fresh store in a temporary directory with `config`.
    pub fn file_with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Store::open(notes_model(), store_dir(temp_dir.path()), config)
            .expect("Failed to open file store");
        Self {
            store,
            temp_dir: Some(temp_dir),
        }
    }

    /// Directory of a file store, `None` in memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| store_dir(d.path()))
    }

    /// Closes the store and opens the same directory again.
    ///
    /// # Panics
    ///
    /// Panics for in-memory stores, which do not survive closing.
    pub fn reopen(self) -> Self {
        let Self { store, temp_dir } = self;
        let temp_dir = temp_dir.expect("Only file stores can be reopened");
        store.close().expect("Failed to close store");
        drop(store);
        let store = Store::open(notes_model(), store_dir(temp_dir.path()), Config::default())
            .expect("Failed to reopen store");
        Self {
            store,
            temp_dir: Some(temp_dir),
        }
    }
}

fn store_dir(root: &Path) -> PathBuf {
    root.join("notes.boxdb")
}

impl std::ops::Deref for TestStore {
    type Target = Store;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Runs `f` against a fresh in-memory store.
///
/// ```rust,ignore
/// use boxdb_testkit::prelude::*;
///
/// with_temp_store(|store| {
///     let notes = store.entity_box::<Note>().unwrap();
///     notes.put(&mut Note::new("a")).unwrap();
/// });
/// ```
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&Store) -> R,
{
    let test_store = TestStore::memory();
    f(&test_store.store)
}

/// Runs `f` against a fresh store in a temporary directory.
pub fn with_file_store<F, R>(f: F) -> R
where
    F: FnOnce(&Store, &Path) -> R,
{
    let test_store = TestStore::file();
    let path = test_store.path().expect("File store should have a path");
    f(&test_store.store, &path)
}

/// Prepopulated stores.
pub mod scenarios {
    use super::*;

    /// A store holding `count` notes titled `note-0`, `note-1`, ... with
    /// priority equal to their index.
    pub fn populated_store(count: usize) -> TestStore {
        let test_store = TestStore::memory();
        let notes = test_store.entity_box::<Note>().expect("Failed to open box");
        let mut batch: Vec<Note> = (0..count)
            .map(|i| {
                Note::new(&format!("note-{i}"))
                    .with_priority(i32::try_from(i).expect("count fits in i32"))
            })
            .collect();
        notes.put_many(&mut batch).expect("Failed to put notes");
        test_store
    }

    /// A store with two authors, three tags and five notes linking them.
    /// Returns the store and the stored authors.
    pub fn authored_store() -> (TestStore, Vec<Author>) {
        let test_store = TestStore::memory();
        let authors_box = test_store.entity_box::<Author>().expect("Failed to open box");
        let tags_box = test_store.entity_box::<Tag>().expect("Failed to open box");
        let notes_box = test_store.entity_box::<Note>().expect("Failed to open box");

        let mut authors = vec![Author::new("ada"), Author::new("grace")];
        authors_box.put_many(&mut authors).expect("Failed to put authors");
        let mut tags = vec![Tag::new("work"), Tag::new("home"), Tag::new("idea")];
        tags_box.put_many(&mut tags).expect("Failed to put tags");

        let mut notes = vec![
            Note::new("plan").by(&authors[0]).with_priority(3),
            Note::new("groceries").by(&authors[1]).with_priority(1),
            Note::new("compiler").by(&authors[1]).with_priority(5),
            Note::new("garden").by(&authors[0]).with_priority(2),
            Note::new("loose").with_priority(0),
        ];
        notes[0].tags.add(&tags[0]);
        notes[0].tags.add(&tags[2]);
        notes[1].tags.add(&tags[1]);
        notes[2].tags.add(&tags[0]);
        notes[3].tags.add(&tags[1]);
        notes_box.put_many(&mut notes).expect("Failed to put notes");

        (test_store, authors)
    }
}
