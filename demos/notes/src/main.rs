//! Notes demo
//!
//! Walks through the public API of boxdb:
//! - Declaring a model and entity bindings
//! - Putting, reading and removing objects
//! - Queries with ordering, parameters and aggregates
//! - To-many relations and links
//! - Observers and the change feed
//!
//! Run with `RUST_LOG=boxdb_core=debug` to see the engine's logs.

use boxdb_codec::{PropertyType, RecordBuilder, RecordReader};
use boxdb_core::{
    Config, CoreResult, EntityBuilder, EntityCodec, EntityTypeId, Model, ModelBuilder, ObjectId,
    ObserverFlags, OrderFlags, Property, PropertyFlags, RelationHandle, RelationWriter, Store,
    ToMany,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

const NOTE_TAGS: RelationHandle<Note, Tag> = RelationHandle::new(1);

#[derive(Debug, Clone)]
struct Note {
    id: ObjectId,
    title: String,
    content: String,
    created_at: i64,
    pinned: bool,
    tags: ToMany<Tag>,
}

impl Note {
    const TITLE: Property<Note, String> = Property::new(2);
    const CONTENT: Property<Note, String> = Property::new(3);
    const CREATED_AT: Property<Note, i64> = Property::new(4);
    const PINNED: Property<Note, bool> = Property::new(5);

    fn new(title: &str, content: &str, created_at: i64) -> Self {
        Self {
            id: 0,
            title: title.to_string(),
            content: content.to_string(),
            created_at,
            pinned: false,
            tags: ToMany::new(),
        }
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
        let title = builder.prepare_string(&self.title)?;
        let content = builder.prepare_string(&self.content)?;
        builder.collect_u64(1, id);
        builder.collect_offset(2, title);
        builder.collect_offset(3, content);
        builder.collect_i64(4, self.created_at);
        builder.collect_bool(5, self.pinned);
        Ok(())
    }

    fn decode(id: ObjectId, reader: &RecordReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            id,
            title: reader.read_string(2),
            content: reader.read_string(3),
            created_at: reader.read_i64(4),
            pinned: reader.read_bool(5),
            tags: ToMany::new(),
        })
    }

    fn write_relations(&self, links: &mut RelationWriter<'_>) -> CoreResult<()> {
        links.apply(NOTE_TAGS, &self.tags)
    }
}

#[derive(Debug, Clone)]
struct Tag {
    id: ObjectId,
    name: String,
}

impl Tag {
    const NAME: Property<Tag, String> = Property::new(2);

    fn new(name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
        }
    }
}

impl EntityCodec for Tag {
    const ENTITY_TYPE: EntityTypeId = EntityTypeId::new(2);

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
        Ok(())
    }

    fn decode(id: ObjectId, reader: &RecordReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            id,
            name: reader.read_string(2),
        })
    }
}

fn model() -> CoreResult<Model> {
    ModelBuilder::new()
        .entity(
            EntityBuilder::new(1, "Note")
                .id_property(1, "id")
                .property_with_flags(2, "title", PropertyType::String, PropertyFlags::INDEXED)
                .property(3, "content", PropertyType::String)
                .property(4, "created_at", PropertyType::Date)
                .property(5, "pinned", PropertyType::Bool),
        )
        .entity(
            EntityBuilder::new(2, "Tag").id_property(1, "id").property_with_flags(
                2,
                "name",
                PropertyType::String,
                PropertyFlags::INDEXED | PropertyFlags::UNIQUE,
            ),
        )
        .relation(1, "tags", 1, 2)
        .build()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let temp_dir = TempDir::new()?;
    let store_path = temp_dir.path().join("notes.boxdb");

    println!("Notes demo");
    println!("==========\n");

    let store = Store::open(model()?, store_path, Config::default())?;
    let notes = store.entity_box::<Note>()?;
    let tags = store.entity_box::<Tag>()?;

    // Count every commit touching notes.
    let commits = Arc::new(AtomicUsize::new(0));
    let observer = {
        let commits = Arc::clone(&commits);
        notes.subscribe(ObserverFlags::NONE, move || {
            commits.fetch_add(1, Ordering::Relaxed);
        })?
    };
    let changes = store.subscribe_changes()?;

    let mut tag_list = vec![Tag::new("work"), Tag::new("cooking"), Tag::new("ideas")];
    tags.put_many(&mut tag_list)?;
    let [work, cooking, ideas] = [&tag_list[0], &tag_list[1], &tag_list[2]];

    let mut batch = vec![
        Note::new("Meeting notes", "Discussed the roadmap and priorities.", 1_700_000_000),
        Note::new("Recipe: pasta", "Boil water, add pasta, cook for 10 minutes.", 1_700_001_000),
        Note::new("Book ideas", "Write about embedded databases.", 1_700_002_000),
        Note::new("Project checklist", "Setup, implementation, testing, deploy.", 1_700_003_000),
    ];
    batch[0].tags.add(work);
    batch[1].tags.add(cooking);
    batch[2].tags.add(ideas);
    batch[3].tags.add(work);
    batch[3].pinned = true;

    println!("Inserting {} notes...", batch.len());
    notes.put_many(&mut batch)?;

    println!("\nAll notes, newest first:");
    let newest_first = notes
        .query()
        .order_by(Note::CREATED_AT, OrderFlags::DESCENDING)
        .build()?;
    for note in newest_first.find()? {
        let marker = if note.pinned { "*" } else { " " };
        println!("  {marker} [{}] {}", note.id, note.title);
    }

    println!("\nNotes tagged 'work':");
    let tagged = notes
        .query()
        .link_many(NOTE_TAGS, Tag::NAME.eq("work"))
        .order_by(Note::TITLE, OrderFlags::NONE)
        .build()?;
    for note in tagged.find()? {
        println!("  {}", note.title);
    }

    println!("\nNotes mentioning 'database':");
    let mut search = notes
        .query()
        .filter(Note::CONTENT.contains("database").case_sensitive(false).alias("term"))
        .build()?;
    println!("  {}", search.describe_parameters());
    for note in search.find()? {
        println!("  {}", note.title);
    }
    search.set_parameter("term", "pasta")?;
    println!("  after rebinding to 'pasta': {} match(es)", search.count()?);

    println!("\nEditing the meeting note...");
    let meeting_query = notes.query().filter(Note::TITLE.eq("Meeting notes")).build()?;
    if let Some(mut meeting) = meeting_query.find_unique()? {
        meeting.content.push_str("\n\nUpdate: action items assigned.");
        notes.put(&mut meeting)?;
    }

    let all = notes.query().build()?;
    let created = all.property(Note::CREATED_AT)?;
    let pinned = notes.query().filter(Note::PINNED.eq(true)).build()?.count()?;
    println!("\nStatistics:");
    println!("  Total notes: {}", notes.count()?);
    println!("  Pinned: {pinned}");
    println!("  Oldest: {:?}", created.min_i64()?);
    println!("  Newest: {:?}", created.max_i64()?);
    println!("  Titles: {}", all.property(Note::TITLE)?.find_strings()?.join(", "));
    println!(
        "  Notes per tag 'work': {}",
        tags.sources(NOTE_TAGS, work.id)?.len()
    );

    let removed = notes.query().filter(Note::PINNED.eq(false)).build()?.remove()?;
    println!("\nRemoved {removed} unpinned note(s); {} left", notes.count()?);

    store.checkpoint()?;
    println!("Size on disk: {} bytes", store.size_on_disk()?);

    observer.unsubscribe();
    let feed: Vec<_> = changes.try_iter().collect();
    println!(
        "Observer saw {} commit(s); change feed delivered {} set(s)",
        commits.load(Ordering::Relaxed),
        feed.len()
    );

    store.close()?;
    println!("\nStore closed");

    Ok(())
}
