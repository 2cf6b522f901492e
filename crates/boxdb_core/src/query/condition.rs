//! Predicate trees.
//!
//! A [`Condition`] is a tree of leaf comparisons joined by AND/OR, plus
//! link nodes that scope a sub-tree to a related entity type. Leaves keep
//! their literal values so they can be rebound after the query is built.

use crate::types::{EntityTypeId, PropertyId, RelationId};
use boxdb_codec::{PropertyType, Value};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{BitAnd, BitOr};

/// Comparison of a leaf condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Between,
    OneOf,
    NoneOf,
    StartsWith,
    EndsWith,
    Contains,
    IsNull,
    NotNull,
}

impl Op {
    /// Number of values the comparison takes; `None` for list operators.
    pub(crate) const fn arity(self) -> Option<usize> {
        match self {
            Self::IsNull | Self::NotNull => Some(0),
            Self::Between => Some(2),
            Self::OneOf | Self::NoneOf => None,
            _ => Some(1),
        }
    }

    const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Between => "between",
            Self::OneOf => "in",
            Self::NoneOf => "not in",
            Self::StartsWith => "starts with",
            Self::EndsWith => "ends with",
            Self::Contains => "contains",
            Self::IsNull => "is null",
            Self::NotNull => "is not null",
        }
    }
}

/// Family of values a leaf compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueKind {
    Integer,
    Float,
    Text,
    Bytes,
    /// Null checks accept any property type.
    Any,
}

impl ValueKind {
    pub(crate) const fn accepts(self, ty: PropertyType) -> bool {
        match self {
            Self::Integer => ty.is_integer(),
            Self::Float => ty.is_float(),
            Self::Text => matches!(ty, PropertyType::String),
            Self::Bytes => matches!(ty, PropertyType::ByteVector),
            Self::Any => true,
        }
    }

    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Text => "string",
            Self::Bytes => "bytes",
            Self::Any => "any",
        }
    }

    /// Returns `true` if `value` is a valid literal of this kind.
    pub(crate) fn admits(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Integer, Value::Int(_) | Value::Bool(_))
            | (Self::Float, Value::Float(_) | Value::Int(_))
            | (Self::Text, Value::Text(_))
            | (Self::Bytes, Value::Bytes(_)) => true,
            _ => false,
        }
    }
}

/// One comparison against one property.
#[derive(Debug, Clone)]
pub(crate) struct Leaf {
    pub entity: EntityTypeId,
    pub property: PropertyId,
    pub kind: ValueKind,
    /// Declared type; replaced by the schema type when the query is built.
    pub ty: PropertyType,
    pub unsigned: bool,
    pub op: Op,
    pub values: Vec<Value>,
    pub case_sensitive: bool,
    pub alias: Option<String>,
    /// Property name, filled in when the query is built.
    pub name: String,
}

impl Leaf {
    pub(crate) fn new(
        entity: EntityTypeId,
        property: PropertyId,
        kind: ValueKind,
        ty: PropertyType,
        op: Op,
        values: Vec<Value>,
    ) -> Self {
        Self {
            entity,
            property,
            kind,
            ty,
            unsigned: false,
            op,
            values,
            case_sensitive: true,
            alias: None,
            name: String::new(),
        }
    }
}

/// How a link node reaches the related entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkKind {
    /// Outer object's to-one property points at the related object.
    ToOne(PropertyId),
    /// Related object's to-one property points at the outer object.
    Backlink(PropertyId),
    /// Outer object links to the related object through a relation.
    Many(RelationId),
    /// Related object links to the outer object through a relation.
    BacklinkMany(RelationId),
}

#[derive(Debug, Clone)]
pub(crate) struct Link {
    pub kind: LinkKind,
    pub outer: EntityTypeId,
    pub related: EntityTypeId,
    pub node: Node,
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Leaf(Leaf),
    All(Vec<Node>),
    Any(Vec<Node>),
    Link(Box<Link>),
}

impl Node {
    fn join(self, other: Self, all: bool) -> Self {
        match (self, all) {
            (Self::All(mut nodes), true) => {
                nodes.push(other);
                Self::All(nodes)
            }
            (Self::Any(mut nodes), false) => {
                nodes.push(other);
                Self::Any(nodes)
            }
            (node, true) => Self::All(vec![node, other]),
            (node, false) => Self::Any(vec![node, other]),
        }
    }

    /// Every leaf of this node, links included, in tree order.
    pub(crate) fn leaves_mut(&mut self) -> Vec<&mut Leaf> {
        let mut out = Vec::new();
        self.push_leaves(&mut out);
        out
    }

    fn push_leaves<'a>(&'a mut self, out: &mut Vec<&'a mut Leaf>) {
        match self {
            Self::Leaf(leaf) => out.push(leaf),
            Self::All(nodes) | Self::Any(nodes) => {
                for node in nodes {
                    node.push_leaves(out);
                }
            }
            Self::Link(link) => link.node.push_leaves(out),
        }
    }

    /// Entity types this node reads from.
    pub(crate) fn collect_entities(&self, out: &mut Vec<EntityTypeId>) {
        match self {
            Self::Leaf(leaf) => {
                if !out.contains(&leaf.entity) {
                    out.push(leaf.entity);
                }
            }
            Self::All(nodes) | Self::Any(nodes) => {
                for node in nodes {
                    node.collect_entities(out);
                }
            }
            Self::Link(link) => {
                for entity in [link.outer, link.related] {
                    if !out.contains(&entity) {
                        out.push(entity);
                    }
                }
                link.node.collect_entities(out);
            }
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaf(leaf) => {
                write!(f, "{} {}", leaf.name, leaf.op.symbol())?;
                match leaf.values.as_slice() {
                    [] => {}
                    [one] if leaf.op.arity().is_some() => write!(f, " {}", DisplayValue(one))?,
                    [low, high] if leaf.op == Op::Between => {
                        write!(f, " {} and {}", DisplayValue(low), DisplayValue(high))?;
                    }
                    many => {
                        f.write_str(" (")?;
                        for (i, value) in many.iter().enumerate() {
                            if i > 0 {
                                f.write_str(", ")?;
                            }
                            write!(f, "{}", DisplayValue(value))?;
                        }
                        f.write_str(")")?;
                    }
                }
                if !leaf.case_sensitive {
                    f.write_str(" (case insensitive)")?;
                }
                if let Some(alias) = &leaf.alias {
                    write!(f, " [{alias}]")?;
                }
                Ok(())
            }
            Self::All(nodes) | Self::Any(nodes) => {
                let sep = if matches!(self, Self::All(_)) { " AND " } else { " OR " };
                f.write_str("(")?;
                for (i, node) in nodes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    write!(f, "{node}")?;
                }
                f.write_str(")")
            }
            Self::Link(link) => {
                let how = match link.kind {
                    LinkKind::ToOne(p) => format!("link {p}"),
                    LinkKind::Backlink(p) => format!("backlink {}.{p}", link.related),
                    LinkKind::Many(r) => format!("link relation {r}"),
                    LinkKind::BacklinkMany(r) => format!("backlink relation {r}"),
                };
                write!(f, "{how} {{ {} }}", link.node)
            }
        }
    }
}

struct DisplayValue<'a>(&'a Value);

impl fmt::Display for DisplayValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// A predicate over objects of entity type `E`.
///
/// Conditions are created from property handles (`Person::AGE.gt(18)`),
/// combined with [`Condition::and`] / [`Condition::or`] or the `&` / `|`
/// operators, and handed to a query builder.
pub struct Condition<E> {
    pub(crate) node: Node,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Condition<E> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub(crate) fn leaf(leaf: Leaf) -> Self {
        Self::from_node(Node::Leaf(leaf))
    }

    /// Both conditions must hold.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::from_node(self.node.join(other.node, true))
    }

    /// Either condition must hold.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::from_node(self.node.join(other.node, false))
    }

    /// Names this leaf so its values can be rebound by alias.
    ///
    /// Only meaningful on a single comparison; on a combined condition it
    /// has no effect.
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        if let Node::Leaf(leaf) = &mut self.node {
            leaf.alias = Some(alias.into());
        }
        self
    }

    /// Sets whether string comparisons of this leaf respect case.
    #[must_use]
    pub fn case_sensitive(mut self, sensitive: bool) -> Self {
        if let Node::Leaf(leaf) = &mut self.node {
            leaf.case_sensitive = sensitive;
        }
        self
    }
}

impl<E> Clone for Condition<E> {
    fn clone(&self) -> Self {
        Self::from_node(self.node.clone())
    }
}

impl<E> fmt::Debug for Condition<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Condition").field(&self.node).finish()
    }
}

impl<E> BitAnd for Condition<E> {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.and(rhs)
    }
}

impl<E> BitOr for Condition<E> {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.or(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(property: u16, op: Op, value: i64) -> Condition<()> {
        Condition::leaf(Leaf::new(
            EntityTypeId::new(1),
            PropertyId::new(property),
            ValueKind::Integer,
            PropertyType::Long,
            op,
            vec![Value::Int(value)],
        ))
    }

    #[test]
    fn chained_and_flattens() {
        let c = leaf(2, Op::Gt, 1) & leaf(3, Op::Lt, 5) & leaf(4, Op::Eq, 0);
        match c.node {
            Node::All(nodes) => assert_eq!(nodes.len(), 3),
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn mixed_operators_nest() {
        let c = (leaf(2, Op::Gt, 1) | leaf(2, Op::Lt, -1)) & leaf(3, Op::Eq, 7);
        match c.node {
            Node::All(nodes) => {
                assert!(matches!(nodes[0], Node::Any(_)));
                assert!(matches!(nodes[1], Node::Leaf(_)));
            }
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn alias_applies_to_leaves_only() {
        let single = leaf(2, Op::Gt, 1).alias("min");
        match &single.node {
            Node::Leaf(l) => assert_eq!(l.alias.as_deref(), Some("min")),
            other => panic!("unexpected node {other:?}"),
        }
        let combined = (leaf(2, Op::Gt, 1) & leaf(3, Op::Lt, 2)).alias("ignored");
        let mut node = combined.node;
        let aliases: Vec<_> = node.leaves_mut().into_iter().map(|l| l.alias.clone()).collect();
        assert_eq!(aliases, vec![None, None]);
    }

    #[test]
    fn kinds_accept_matching_types() {
        assert!(ValueKind::Integer.accepts(PropertyType::Int));
        assert!(ValueKind::Integer.accepts(PropertyType::Date));
        assert!(!ValueKind::Integer.accepts(PropertyType::String));
        assert!(ValueKind::Float.accepts(PropertyType::Float));
        assert!(ValueKind::Any.accepts(PropertyType::ByteVector));
        assert!(ValueKind::Float.admits(&Value::Int(3)));
        assert!(!ValueKind::Text.admits(&Value::Int(3)));
    }
}
