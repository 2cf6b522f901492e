//! Built queries.

use crate::collection::{decode_record, EntityBox, EntityCodec};
use crate::error::{CoreError, CoreResult};
use crate::observer::{Dispatcher, Observer, ObserverFlags};
use crate::query::condition::{Leaf, Node, Op};
use crate::query::eval::{self, Order, Row};
use crate::query::property::{Property, PropertyValue, ToOneProperty};
use crate::query::property_query::PropertyQuery;
use crate::schema::EntitySchema;
use crate::store::StoreInner;
use crate::transaction::Transaction;
use crate::types::{EntityTypeId, ObjectId, PropertyId};
use boxdb_codec::Value;
use parking_lot::RwLock;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Identifies the condition(s) a parameter setter rebinds: every
/// condition on a property that has no alias, or the conditions carrying
/// an alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterKey {
    /// Condition on this property of this entity type.
    Property(EntityTypeId, PropertyId),
    /// Condition named with [`Condition::alias`](crate::query::Condition::alias).
    Alias(String),
}

impl ParameterKey {
    fn selects(&self, leaf: &Leaf) -> bool {
        match self {
            Self::Property(entity, property) => {
                leaf.alias.is_none() && leaf.entity == *entity && leaf.property == *property
            }
            Self::Alias(alias) => leaf.alias.as_deref() == Some(alias.as_str()),
        }
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Property(entity, property) => write!(f, "{entity}/{property}"),
            Self::Alias(alias) => write!(f, "alias {alias:?}"),
        }
    }
}

impl<E: EntityCodec, V> From<Property<E, V>> for ParameterKey {
    fn from(property: Property<E, V>) -> Self {
        Self::Property(E::ENTITY_TYPE, property.id())
    }
}

impl<E: EntityCodec, T> From<ToOneProperty<E, T>> for ParameterKey {
    fn from(property: ToOneProperty<E, T>) -> Self {
        Self::Property(E::ENTITY_TYPE, property.id())
    }
}

impl From<&str> for ParameterKey {
    fn from(alias: &str) -> Self {
        Self::Alias(alias.to_string())
    }
}

impl From<String> for ParameterKey {
    fn from(alias: String) -> Self {
        Self::Alias(alias)
    }
}

#[derive(Clone, Copy)]
enum Shape {
    Single,
    Pair,
    List,
}

impl Shape {
    fn fits(self, op: Op) -> bool {
        match (self, op.arity()) {
            (Self::Single, Some(1)) | (Self::Pair, Some(2)) | (Self::List, None) => true,
            _ => false,
        }
    }
}

/// Conditions with their current values, plus sort orders. Shared with
/// the query's subscriptions so rebinding reaches them.
#[derive(Clone)]
struct Bound {
    root: Option<Node>,
    orders: Vec<Order>,
}

/// A reusable query over `T`.
///
/// Conditions and sort orders are fixed; literal values can be rebound
/// with the parameter setters and the query re-run. Every execution reads
/// one consistent snapshot (or the calling thread's open transaction).
/// Subscriptions follow later rebinding; a clone is an independent query.
pub struct Query<T: EntityCodec> {
    store: Arc<StoreInner>,
    schema: Arc<EntitySchema>,
    bound: Arc<RwLock<Bound>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: EntityCodec> Query<T> {
    pub(crate) fn new(
        store: Arc<StoreInner>,
        schema: Arc<EntitySchema>,
        root: Option<Node>,
        orders: Vec<Order>,
    ) -> Self {
        Self {
            store,
            schema,
            bound: Arc::new(RwLock::new(Bound { root, orders })),
            _marker: PhantomData,
        }
    }

    fn bound(&self) -> Bound {
        self.bound.read().clone()
    }

    pub(crate) fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    /// Matching rows in result order.
    pub(crate) fn rows(&self, tx: &Transaction) -> CoreResult<Vec<Row>> {
        let Bound { root, orders } = self.bound();
        let rows = eval::matching(tx, T::ENTITY_TYPE, root.as_ref())?;
        Ok(eval::sort(rows, &orders))
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&Transaction) -> CoreResult<R>) -> CoreResult<R> {
        self.store.read(f)
    }

    /// Every match.
    pub fn find(&self) -> CoreResult<Vec<T>> {
        self.find_range(0, 0)
    }

    /// Matches `offset..offset + limit` in result order; `limit` 0 means
    /// no limit.
    pub fn find_range(&self, offset: u64, limit: u64) -> CoreResult<Vec<T>> {
        self.read(|tx| {
            window(self.rows(tx)?, offset, limit)
                .map(|(id, payload)| decode_record(id, &payload))
                .collect()
        })
    }

    /// IDs of every match, in result order.
    pub fn find_ids(&self) -> CoreResult<Vec<ObjectId>> {
        self.find_ids_range(0, 0)
    }

    /// IDs of the matches `offset..offset + limit`; `limit` 0 means no
    /// limit.
    pub fn find_ids_range(&self, offset: u64, limit: u64) -> CoreResult<Vec<ObjectId>> {
        self.read(|tx| Ok(window(self.rows(tx)?, offset, limit).map(|(id, _)| id).collect()))
    }

    /// The first match in result order.
    pub fn find_first(&self) -> CoreResult<Option<T>> {
        Ok(self.find_range(0, 1)?.pop())
    }

    /// The only match, if any.
    ///
    /// # Errors
    ///
    /// `NonUniqueResult` if more than one object matches.
    pub fn find_unique(&self) -> CoreResult<Option<T>> {
        let root = self.bound().root;
        self.read(|tx| {
            let mut rows = eval::matching(tx, T::ENTITY_TYPE, root.as_ref())?;
            if rows.len() > 1 {
                return Err(CoreError::NonUniqueResult { count: rows.len() });
            }
            rows.pop()
                .map(|(id, payload)| decode_record(id, &payload))
                .transpose()
        })
    }

    /// Number of matches.
    pub fn count(&self) -> CoreResult<u64> {
        let root = self.bound().root;
        self.read(|tx| Ok(eval::matching(tx, T::ENTITY_TYPE, root.as_ref())?.len() as u64))
    }

    /// Removes every match in one transaction; returns how many were
    /// removed.
    pub fn remove(&self) -> CoreResult<u64> {
        let target = EntityBox::<T>::new(Arc::clone(&self.store), Arc::clone(&self.schema));
        let root = self.bound().root;
        self.store.write(|tx| {
            let mut removed = 0;
            for (id, _) in eval::matching(tx, T::ENTITY_TYPE, root.as_ref())? {
                if target.remove_in(tx, id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    /// Human-readable form of the conditions and their current values.
    #[must_use]
    pub fn describe_parameters(&self) -> String {
        match &self.bound.read().root {
            Some(node) => format!("{}: {node}", self.schema.name),
            None => format!("{}: all objects", self.schema.name),
        }
    }

    /// Rebinds the value of a single-value condition (`eq`, `gt`,
    /// `starts_with`, ...).
    ///
    /// # Errors
    ///
    /// `IllegalArgument` if no condition matches `key`, if several
    /// unaliased conditions share the property, or if the value's type or
    /// count does not fit the condition.
    pub fn set_parameter(
        &mut self,
        key: impl Into<ParameterKey>,
        value: impl Into<Value>,
    ) -> CoreResult<()> {
        self.rebind(key.into(), Shape::Single, vec![value.into()])
    }

    /// Rebinds both values of a `between` condition (or of
    /// `eq_with_tolerance`, which is stored as one).
    pub fn set_parameters(
        &mut self,
        key: impl Into<ParameterKey>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> CoreResult<()> {
        self.rebind(key.into(), Shape::Pair, vec![low.into(), high.into()])
    }

    /// Rebinds the set of a `one_of`/`none_of` condition.
    pub fn set_parameter_list<V: Into<Value>>(
        &mut self,
        key: impl Into<ParameterKey>,
        values: impl IntoIterator<Item = V>,
    ) -> CoreResult<()> {
        let values = values.into_iter().map(Into::into).collect();
        self.rebind(key.into(), Shape::List, values)
    }

    fn rebind(&mut self, key: ParameterKey, shape: Shape, values: Vec<Value>) -> CoreResult<()> {
        let entity = &self.schema.name;
        let mut bound = self.bound.write();
        let Some(root) = bound.root.as_mut() else {
            return Err(CoreError::illegal_argument(format!(
                "query over {entity} has no conditions"
            )));
        };
        let leaves: Vec<&mut Leaf> = root
            .leaves_mut()
            .into_iter()
            .filter(|leaf| key.selects(leaf))
            .collect();
        match leaves.len() {
            0 => {
                return Err(CoreError::illegal_argument(format!(
                    "query over {entity} has no condition for {key}"
                )))
            }
            n if n > 1 && matches!(key, ParameterKey::Property(..)) => {
                return Err(CoreError::illegal_argument(format!(
                    "{n} conditions match {key}; give them aliases"
                )))
            }
            _ => {}
        }
        for leaf in &leaves {
            if !shape.fits(leaf.op) {
                return Err(CoreError::illegal_argument(format!(
                    "condition on {} takes a different number of values",
                    leaf.name
                )));
            }
            if let Some(bad) = values.iter().find(|v| !leaf.kind.admits(v)) {
                return Err(CoreError::illegal_argument(format!(
                    "condition on {} expects {} values, got {}",
                    leaf.name,
                    leaf.kind.name(),
                    bad.kind()
                )));
            }
        }
        for leaf in leaves {
            leaf.values.clone_from(&values);
        }
        Ok(())
    }

    /// Aggregates over `property` of the matches.
    pub fn property<V: PropertyValue>(&self, property: Property<T, V>) -> CoreResult<PropertyQuery<T>> {
        let prop = self.schema.require_property(property.id())?.clone();
        Ok(PropertyQuery::new(self.clone(), prop))
    }

    /// Delivers fresh results to `handler` on the store's default
    /// dispatcher after every commit touching an entity type the query
    /// reads. Notifications may arrive when the results did not change.
    pub fn subscribe(
        &self,
        flags: ObserverFlags,
        handler: impl Fn(CoreResult<Vec<T>>) + Send + Sync + 'static,
    ) -> CoreResult<Observer> {
        let dispatcher = self.store.default_dispatcher()?;
        self.subscribe_on(dispatcher, flags, handler)
    }

    /// Like [`Query::subscribe`] on the given dispatcher.
    ///
    /// # Errors
    ///
    /// `IllegalArgument` for `DONT_SUBSCRIBE` without `SEND_INITIAL`.
    pub fn subscribe_on(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
        flags: ObserverFlags,
        handler: impl Fn(CoreResult<Vec<T>>) + Send + Sync + 'static,
    ) -> CoreResult<Observer> {
        self.store.ensure_open()?;
        flags.check()?;
        let mut entities = vec![T::ENTITY_TYPE];
        if let Some(root) = &self.bound.read().root {
            root.collect_entities(&mut entities);
        }
        let store = Arc::downgrade(&self.store);
        let schema = Arc::clone(&self.schema);
        let bound = Arc::clone(&self.bound);
        let callback = Arc::new(move || {
            let Some(store) = store.upgrade() else {
                return;
            };
            let query = Query::<T> {
                store,
                schema: Arc::clone(&schema),
                bound: Arc::clone(&bound),
                _marker: PhantomData,
            };
            handler(query.find());
        });
        Ok(self
            .store
            .observers()
            .subscribe(entities, dispatcher, flags, callback))
    }
}

fn window(rows: Vec<Row>, offset: u64, limit: u64) -> impl Iterator<Item = Row> {
    let offset = usize::try_from(offset).unwrap_or(usize::MAX);
    let limit = match usize::try_from(limit) {
        Ok(0) | Err(_) => usize::MAX,
        Ok(n) => n,
    };
    rows.into_iter().skip(offset).take(limit)
}

impl<T: EntityCodec> Clone for Query<T> {
    fn clone(&self) -> Self {
        let Bound { root, orders } = self.bound();
        Self::new(Arc::clone(&self.store), Arc::clone(&self.schema), root, orders)
    }
}

impl<T: EntityCodec> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("conditions", &self.describe_parameters())
            .field("orders", &self.bound.read().orders.len())
            .finish()
    }
}
