//! Query construction.

use crate::collection::EntityCodec;
use crate::entity::RelationHandle;
use crate::error::CoreResult;
use crate::query::condition::{Condition, Node};
use crate::query::eval::{self, Order};
use crate::query::property::{Property, PropertyValue, ToOneProperty};
use crate::query::Query;
use crate::schema::EntitySchema;
use crate::store::StoreInner;
use crate::types::PropertyId;
use std::marker::PhantomData;
use std::ops::BitOr;
use std::sync::Arc;

/// Sort flags of [`QueryBuilder::order_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OrderFlags(u8);

impl OrderFlags {
    /// Ascending, case-insensitive strings, nulls first.
    pub const NONE: Self = Self(0);
    /// Largest first.
    pub const DESCENDING: Self = Self(0x01);
    /// Compare strings respecting case.
    pub const CASE_SENSITIVE: Self = Self(0x02);
    /// Compare integers as unsigned.
    pub const UNSIGNED: Self = Self(0x04);
    /// Place objects without a value last instead of first.
    pub const NULLS_LAST: Self = Self(0x08);
    /// Treat a missing value as zero (or the empty string).
    pub const NULLS_ZERO: Self = Self(0x10);

    /// Returns `true` if every flag of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OrderFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Collects conditions and sort orders for a [`Query`] over `T`.
///
/// Conditions added with [`QueryBuilder::filter`] and the link methods are
/// combined with AND. Nothing is checked against the schema until
/// [`QueryBuilder::build`].
pub struct QueryBuilder<T: EntityCodec> {
    store: Arc<StoreInner>,
    schema: Arc<EntitySchema>,
    root: Option<Node>,
    orders: Vec<(PropertyId, OrderFlags)>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: EntityCodec> QueryBuilder<T> {
    pub(crate) fn new(store: Arc<StoreInner>, schema: Arc<EntitySchema>) -> Self {
        Self {
            store,
            schema,
            root: None,
            orders: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// ANDs `condition` into the query.
    #[must_use]
    pub fn filter(mut self, condition: Condition<T>) -> Self {
        self.root = Some(match self.root.take() {
            None => condition.node,
            Some(existing) => Condition::<T>::from_node(existing).and(condition).node,
        });
        self
    }

    /// Keeps objects whose to-one `property` points at a `U` matching
    /// `condition`.
    #[must_use]
    pub fn link<U: EntityCodec>(self, property: ToOneProperty<T, U>, condition: Condition<U>) -> Self {
        self.filter(property.link(condition))
    }

    /// Keeps objects that some `S` points at through its to-one
    /// `property`, where that `S` matches `condition`.
    #[must_use]
    pub fn backlink<S: EntityCodec>(
        self,
        property: ToOneProperty<S, T>,
        condition: Condition<S>,
    ) -> Self {
        self.filter(property.backlink(condition))
    }

    /// Keeps objects linked through `relation` to a `U` matching
    /// `condition`.
    #[must_use]
    pub fn link_many<U: EntityCodec>(
        self,
        relation: RelationHandle<T, U>,
        condition: Condition<U>,
    ) -> Self {
        self.filter(relation.link(condition))
    }

    /// Keeps objects some `S` links to through `relation`, where that `S`
    /// matches `condition`.
    #[must_use]
    pub fn backlink_many<S: EntityCodec>(
        self,
        relation: RelationHandle<S, T>,
        condition: Condition<S>,
    ) -> Self {
        self.filter(relation.backlink(condition))
    }

    /// Sorts by `property`; later calls break ties of earlier ones. Without
    /// any order results come in ascending ID order.
    #[must_use]
    pub fn order_by<V: PropertyValue>(mut self, property: Property<T, V>, flags: OrderFlags) -> Self {
        self.orders.push((property.id(), flags));
        self
    }

    /// Checks the conditions against the model and builds the query.
    ///
    /// # Errors
    ///
    /// `PropertyTypeMismatch` when a condition's value kind does not fit
    /// its property, `Schema`/`IllegalArgument` for unknown properties or
    /// links that do not connect the entity types.
    pub fn build(self) -> CoreResult<Query<T>> {
        self.store.ensure_open()?;
        let model = Arc::clone(self.store.model());
        let mut root = self.root;
        if let Some(node) = root.as_mut() {
            eval::resolve(&model, node, T::ENTITY_TYPE)?;
        }
        let orders = self
            .orders
            .into_iter()
            .map(|(property, flags)| {
                let prop = self.schema.require_property(property)?;
                Ok(Order {
                    property,
                    ty: prop.ty,
                    flags,
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;
        tracing::debug!(entity = %self.schema.name, "query built");
        Ok(Query::new(self.store, self.schema, root, orders))
    }
}

impl<T: EntityCodec> std::fmt::Debug for QueryBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("entity", &self.schema.name)
            .field("orders", &self.orders.len())
            .finish_non_exhaustive()
    }
}
