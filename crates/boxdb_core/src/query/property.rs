//! Typed property handles.
//!
//! Entity bindings expose one constant per property, for example
//! `Person::AGE: Property<Person, i64>`. The value marker picks which
//! conditions are available: `i64` for every integer-like property (dates
//! and booleans stored as integers included), `f64` for floats, `String`,
//! `Vec<u8>` and `bool`.

use crate::collection::EntityCodec;
use crate::entity::RelationHandle;
use crate::query::condition::{Condition, Leaf, Link, LinkKind, Node, Op, ValueKind};
use crate::types::{ObjectId, PropertyId};
use boxdb_codec::{PropertyType, Value};
use std::fmt;
use std::marker::PhantomData;

mod sealed {
    pub trait Sealed {}
    impl Sealed for i64 {}
    impl Sealed for f64 {}
    impl Sealed for String {}
    impl Sealed for Vec<u8> {}
    impl Sealed for bool {}
}

/// Value markers usable in [`Property`].
pub trait PropertyValue: sealed::Sealed {
    #[doc(hidden)]
    const KIND: ValueKindTag;
    #[doc(hidden)]
    const DECLARED: PropertyType;
}

#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKindTag {
    Integer,
    Float,
    Text,
    Bytes,
}

impl ValueKindTag {
    pub(crate) const fn kind(self) -> ValueKind {
        match self {
            Self::Integer => ValueKind::Integer,
            Self::Float => ValueKind::Float,
            Self::Text => ValueKind::Text,
            Self::Bytes => ValueKind::Bytes,
        }
    }
}

impl PropertyValue for i64 {
    const KIND: ValueKindTag = ValueKindTag::Integer;
    const DECLARED: PropertyType = PropertyType::Long;
}

impl PropertyValue for f64 {
    const KIND: ValueKindTag = ValueKindTag::Float;
    const DECLARED: PropertyType = PropertyType::Double;
}

impl PropertyValue for String {
    const KIND: ValueKindTag = ValueKindTag::Text;
    const DECLARED: PropertyType = PropertyType::String;
}

impl PropertyValue for Vec<u8> {
    const KIND: ValueKindTag = ValueKindTag::Bytes;
    const DECLARED: PropertyType = PropertyType::ByteVector;
}

impl PropertyValue for bool {
    const KIND: ValueKindTag = ValueKindTag::Integer;
    const DECLARED: PropertyType = PropertyType::Bool;
}

/// Handle of property `id` of entity `E`, holding values of kind `V`.
pub struct Property<E, V> {
    id: PropertyId,
    _marker: PhantomData<fn() -> (E, V)>,
}

impl<E, V> Property<E, V> {
    /// Creates a handle for property `id`.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self {
            id: PropertyId::new(id),
            _marker: PhantomData,
        }
    }

    /// Returns the property ID.
    #[must_use]
    pub const fn id(&self) -> PropertyId {
        self.id
    }
}

impl<E, V> Clone for Property<E, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E, V> Copy for Property<E, V> {}

impl<E, V> fmt::Debug for Property<E, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Property").field(&self.id).finish()
    }
}

impl<E: EntityCodec, V: PropertyValue> Property<E, V> {
    fn condition(self, op: Op, values: Vec<Value>) -> Condition<E> {
        Condition::leaf(Leaf::new(
            E::ENTITY_TYPE,
            self.id,
            V::KIND.kind(),
            V::DECLARED,
            op,
            values,
        ))
    }

    /// Property has no value.
    #[must_use]
    pub fn is_null(self) -> Condition<E> {
        Condition::leaf(Leaf::new(
            E::ENTITY_TYPE,
            self.id,
            ValueKind::Any,
            V::DECLARED,
            Op::IsNull,
            vec![],
        ))
    }

    /// Property has a value.
    #[must_use]
    pub fn is_not_null(self) -> Condition<E> {
        Condition::leaf(Leaf::new(
            E::ENTITY_TYPE,
            self.id,
            ValueKind::Any,
            V::DECLARED,
            Op::NotNull,
            vec![],
        ))
    }
}

impl<E: EntityCodec> Property<E, i64> {
    /// `property == value`
    #[must_use]
    pub fn eq(self, value: i64) -> Condition<E> {
        self.condition(Op::Eq, vec![Value::Int(value)])
    }

    /// `property != value`
    #[must_use]
    pub fn ne(self, value: i64) -> Condition<E> {
        self.condition(Op::Ne, vec![Value::Int(value)])
    }

    /// `property < value`
    #[must_use]
    pub fn lt(self, value: i64) -> Condition<E> {
        self.condition(Op::Lt, vec![Value::Int(value)])
    }

    /// `property <= value`
    #[must_use]
    pub fn le(self, value: i64) -> Condition<E> {
        self.condition(Op::Le, vec![Value::Int(value)])
    }

    /// `property > value`
    #[must_use]
    pub fn gt(self, value: i64) -> Condition<E> {
        self.condition(Op::Gt, vec![Value::Int(value)])
    }

    /// `property >= value`
    #[must_use]
    pub fn ge(self, value: i64) -> Condition<E> {
        self.condition(Op::Ge, vec![Value::Int(value)])
    }

    /// `low <= property <= high`
    #[must_use]
    pub fn between(self, low: i64, high: i64) -> Condition<E> {
        self.condition(Op::Between, vec![Value::Int(low), Value::Int(high)])
    }

    /// Property equals one of `values`.
    #[must_use]
    pub fn one_of(self, values: &[i64]) -> Condition<E> {
        self.condition(Op::OneOf, values.iter().map(|v| Value::Int(*v)).collect())
    }

    /// Property equals none of `values`.
    #[must_use]
    pub fn none_of(self, values: &[i64]) -> Condition<E> {
        self.condition(Op::NoneOf, values.iter().map(|v| Value::Int(*v)).collect())
    }
}

impl<E: EntityCodec> Property<E, f64> {
    /// `property < value`
    #[must_use]
    pub fn lt(self, value: f64) -> Condition<E> {
        self.condition(Op::Lt, vec![Value::Float(value)])
    }

    /// `property <= value`
    #[must_use]
    pub fn le(self, value: f64) -> Condition<E> {
        self.condition(Op::Le, vec![Value::Float(value)])
    }

    /// `property > value`
    #[must_use]
    pub fn gt(self, value: f64) -> Condition<E> {
        self.condition(Op::Gt, vec![Value::Float(value)])
    }

    /// `property >= value`
    #[must_use]
    pub fn ge(self, value: f64) -> Condition<E> {
        self.condition(Op::Ge, vec![Value::Float(value)])
    }

    /// `low <= property <= high`
    #[must_use]
    pub fn between(self, low: f64, high: f64) -> Condition<E> {
        self.condition(Op::Between, vec![Value::Float(low), Value::Float(high)])
    }

    /// `|property - value| <= tolerance`, expressed as a range so it can
    /// be rebound with two values.
    #[must_use]
    pub fn eq_with_tolerance(self, value: f64, tolerance: f64) -> Condition<E> {
        let tolerance = tolerance.abs();
        self.between(value - tolerance, value + tolerance)
    }
}

impl<E: EntityCodec> Property<E, String> {
    fn text(self, op: Op, value: &str) -> Condition<E> {
        self.condition(op, vec![Value::Text(value.to_string())])
    }

    /// `property == value`
    #[must_use]
    pub fn eq(self, value: &str) -> Condition<E> {
        self.text(Op::Eq, value)
    }

    /// `property != value`
    #[must_use]
    pub fn ne(self, value: &str) -> Condition<E> {
        self.text(Op::Ne, value)
    }

    /// `property < value`, lexicographically.
    #[must_use]
    pub fn lt(self, value: &str) -> Condition<E> {
        self.text(Op::Lt, value)
    }

    /// `property <= value`
    #[must_use]
    pub fn le(self, value: &str) -> Condition<E> {
        self.text(Op::Le, value)
    }

    /// `property > value`
    #[must_use]
    pub fn gt(self, value: &str) -> Condition<E> {
        self.text(Op::Gt, value)
    }

    /// `property >= value`
    #[must_use]
    pub fn ge(self, value: &str) -> Condition<E> {
        self.text(Op::Ge, value)
    }

    /// Property starts with `prefix`.
    #[must_use]
    pub fn starts_with(self, prefix: &str) -> Condition<E> {
        self.text(Op::StartsWith, prefix)
    }

    /// Property ends with `suffix`.
    #[must_use]
    pub fn ends_with(self, suffix: &str) -> Condition<E> {
        self.text(Op::EndsWith, suffix)
    }

    /// Property contains `needle`.
    #[must_use]
    pub fn contains(self, needle: &str) -> Condition<E> {
        self.text(Op::Contains, needle)
    }

    /// Property equals one of `values`.
    #[must_use]
    pub fn one_of(self, values: &[&str]) -> Condition<E> {
        self.condition(
            Op::OneOf,
            values.iter().map(|v| Value::Text((*v).to_string())).collect(),
        )
    }
}

impl<E: EntityCodec> Property<E, Vec<u8>> {
    fn bytes(self, op: Op, value: &[u8]) -> Condition<E> {
        self.condition(op, vec![Value::Bytes(value.to_vec())])
    }

    /// `property == value`
    #[must_use]
    pub fn eq(self, value: &[u8]) -> Condition<E> {
        self.bytes(Op::Eq, value)
    }

    /// `property < value`, compared bytewise.
    #[must_use]
    pub fn lt(self, value: &[u8]) -> Condition<E> {
        self.bytes(Op::Lt, value)
    }

    /// `property <= value`
    #[must_use]
    pub fn le(self, value: &[u8]) -> Condition<E> {
        self.bytes(Op::Le, value)
    }

    /// `property > value`
    #[must_use]
    pub fn gt(self, value: &[u8]) -> Condition<E> {
        self.bytes(Op::Gt, value)
    }

    /// `property >= value`
    #[must_use]
    pub fn ge(self, value: &[u8]) -> Condition<E> {
        self.bytes(Op::Ge, value)
    }
}

impl<E: EntityCodec> Property<E, bool> {
    /// `property == value`
    #[must_use]
    pub fn eq(self, value: bool) -> Condition<E> {
        self.condition(Op::Eq, vec![Value::Int(i64::from(value))])
    }

    /// `property != value`
    #[must_use]
    pub fn ne(self, value: bool) -> Condition<E> {
        self.condition(Op::Ne, vec![Value::Int(i64::from(value))])
    }
}

/// Handle of the to-one property `id` of entity `E`, pointing at `T`.
pub struct ToOneProperty<E, T> {
    id: PropertyId,
    _marker: PhantomData<fn() -> (E, T)>,
}

impl<E, T> ToOneProperty<E, T> {
    /// Creates a handle for property `id`.
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self {
            id: PropertyId::new(id),
            _marker: PhantomData,
        }
    }

    /// Returns the property ID.
    #[must_use]
    pub const fn id(&self) -> PropertyId {
        self.id
    }
}

impl<E, T> Clone for ToOneProperty<E, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E, T> Copy for ToOneProperty<E, T> {}

impl<E, T> fmt::Debug for ToOneProperty<E, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ToOneProperty").field(&self.id).finish()
    }
}

impl<E: EntityCodec, T: EntityCodec> ToOneProperty<E, T> {
    fn condition(self, op: Op, values: Vec<Value>) -> Condition<E> {
        let kind = if values.is_empty() {
            ValueKind::Any
        } else {
            ValueKind::Integer
        };
        Condition::leaf(Leaf::new(
            E::ENTITY_TYPE,
            self.id,
            kind,
            PropertyType::Relation,
            op,
            values,
        ))
    }

    /// Relation points at object `target`.
    #[must_use]
    pub fn eq(self, target: ObjectId) -> Condition<E> {
        self.condition(Op::Eq, vec![Value::from(target)])
    }

    /// Relation points at one of `targets`.
    #[must_use]
    pub fn one_of(self, targets: &[ObjectId]) -> Condition<E> {
        self.condition(Op::OneOf, targets.iter().map(|t| Value::from(*t)).collect())
    }

    /// Relation is unset.
    #[must_use]
    pub fn is_null(self) -> Condition<E> {
        self.condition(Op::IsNull, vec![])
    }

    /// Relation is set.
    #[must_use]
    pub fn is_not_null(self) -> Condition<E> {
        self.condition(Op::NotNull, vec![])
    }

    /// Holds when the target of this relation satisfies `condition`.
    #[must_use]
    pub fn link(self, condition: Condition<T>) -> Condition<E> {
        Condition::from_node(Node::Link(Box::new(Link {
            kind: LinkKind::ToOne(self.id),
            outer: E::ENTITY_TYPE,
            related: T::ENTITY_TYPE,
            node: condition.node,
        })))
    }

    /// Holds for a `T` when at least one `E` pointing at it satisfies
    /// `condition`.
    #[must_use]
    pub fn backlink(self, condition: Condition<E>) -> Condition<T> {
        Condition::from_node(Node::Link(Box::new(Link {
            kind: LinkKind::Backlink(self.id),
            outer: T::ENTITY_TYPE,
            related: E::ENTITY_TYPE,
            node: condition.node,
        })))
    }
}

impl<S: EntityCodec, T: EntityCodec> RelationHandle<S, T> {
    /// Holds for an `S` when at least one linked `T` satisfies
    /// `condition`.
    #[must_use]
    pub fn link(self, condition: Condition<T>) -> Condition<S> {
        Condition::from_node(Node::Link(Box::new(Link {
            kind: LinkKind::Many(self.id()),
            outer: S::ENTITY_TYPE,
            related: T::ENTITY_TYPE,
            node: condition.node,
        })))
    }

    /// Holds for a `T` when at least one `S` linking to it satisfies
    /// `condition`.
    #[must_use]
    pub fn backlink(self, condition: Condition<S>) -> Condition<T> {
        Condition::from_node(Node::Link(Box::new(Link {
            kind: LinkKind::BacklinkMany(self.id()),
            outer: T::ENTITY_TYPE,
            related: S::ENTITY_TYPE,
            node: condition.node,
        })))
    }
}
