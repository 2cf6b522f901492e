//! Query evaluation.
//!
//! Link nodes are semi-joins: before the outer table is scanned, each link
//! is reduced to the set of outer IDs it admits, so an outer object is
//! returned at most once however many related objects match.

use crate::entity;
use crate::error::{CoreError, CoreResult};
use crate::query::builder::OrderFlags;
use crate::query::condition::{Leaf, Link, LinkKind, Node, Op, ValueKind};
use crate::schema::Model;
use crate::transaction::Transaction;
use crate::types::{EntityTypeId, ObjectId, PropertyId, TableId};
use crate::index::IndexValue;
use boxdb_codec::{PropertyType, RecordReader, Value};
use std::cmp::Ordering;
use std::collections::HashSet;

pub(crate) type Row = (ObjectId, Vec<u8>);

/// One sort key of a query.
#[derive(Debug, Clone)]
pub(crate) struct Order {
    pub property: PropertyId,
    pub ty: PropertyType,
    pub flags: OrderFlags,
}

/// Checks `node` against the model and fills in schema types and names.
pub(crate) fn resolve(model: &Model, node: &mut Node, entity: EntityTypeId) -> CoreResult<()> {
    match node {
        Node::Leaf(leaf) => resolve_leaf(model, leaf, entity),
        Node::All(nodes) | Node::Any(nodes) => {
            for node in nodes {
                resolve(model, node, entity)?;
            }
            Ok(())
        }
        Node::Link(link) => {
            resolve_link(model, link, entity)?;
            let related = link.related;
            resolve(model, &mut link.node, related)
        }
    }
}

fn resolve_leaf(model: &Model, leaf: &mut Leaf, entity: EntityTypeId) -> CoreResult<()> {
    let schema = model.entity(entity)?;
    if leaf.entity != entity {
        return Err(CoreError::illegal_argument(format!(
            "condition on {} used in a query over {}",
            leaf.entity, schema.name
        )));
    }
    let prop = schema.require_property(leaf.property)?;
    let relation_expected = leaf.ty == PropertyType::Relation;
    let relation_found = prop.ty == PropertyType::Relation;
    if !leaf.kind.accepts(prop.ty) || (relation_expected && !relation_found) {
        return Err(CoreError::type_mismatch(
            format!("{}.{}", schema.name, prop.name),
            if relation_expected {
                PropertyType::Relation.name()
            } else {
                leaf.kind.name()
            },
            prop.ty.name(),
        ));
    }
    if let Some(arity) = leaf.op.arity() {
        if leaf.values.len() != arity {
            return Err(CoreError::illegal_argument(format!(
                "{}.{} takes {arity} value(s), got {}",
                schema.name,
                prop.name,
                leaf.values.len()
            )));
        }
    }
    leaf.ty = prop.ty;
    leaf.unsigned = prop.is_unsigned();
    leaf.name = prop.name.clone();
    Ok(())
}

fn resolve_link(model: &Model, link: &Link, entity: EntityTypeId) -> CoreResult<()> {
    if link.outer != entity {
        return Err(CoreError::illegal_argument(format!(
            "link from {} used in a query over {entity}",
            link.outer
        )));
    }
    let ok = match link.kind {
        LinkKind::ToOne(property) => {
            let prop = model.entity(link.outer)?.require_property(property)?;
            prop.target == Some(link.related)
        }
        LinkKind::Backlink(property) => {
            let prop = model.entity(link.related)?.require_property(property)?;
            prop.target == Some(link.outer)
        }
        LinkKind::Many(relation) => {
            let rel = model.relation(relation)?;
            rel.source == link.outer && rel.target == link.related
        }
        LinkKind::BacklinkMany(relation) => {
            let rel = model.relation(relation)?;
            rel.source == link.related && rel.target == link.outer
        }
    };
    if ok {
        Ok(())
    } else {
        Err(CoreError::illegal_argument(format!(
            "{:?} does not connect {} and {}",
            link.kind, link.outer, link.related
        )))
    }
}

enum Prepared<'a> {
    Leaf(&'a Leaf),
    All(Vec<Prepared<'a>>),
    Any(Vec<Prepared<'a>>),
    /// To-one property value must be one of the targets.
    Points(PropertyId, HashSet<ObjectId>),
    /// Object ID must be in the set.
    Within(HashSet<ObjectId>),
}

impl Prepared<'_> {
    fn matches(&self, id: ObjectId, reader: &RecordReader<'_>) -> bool {
        match self {
            Self::Leaf(leaf) => leaf_matches(leaf, reader),
            Self::All(nodes) => nodes.iter().all(|n| n.matches(id, reader)),
            Self::Any(nodes) => nodes.iter().any(|n| n.matches(id, reader)),
            Self::Points(property, targets) => {
                let target = reader.read_u64(property.as_u16());
                target != 0 && targets.contains(&target)
            }
            Self::Within(ids) => ids.contains(&id),
        }
    }
}

fn prepare<'a>(tx: &Transaction, node: &'a Node) -> CoreResult<Prepared<'a>> {
    Ok(match node {
        Node::Leaf(leaf) => Prepared::Leaf(leaf),
        Node::All(nodes) => Prepared::All(
            nodes
                .iter()
                .map(|n| prepare(tx, n))
                .collect::<CoreResult<_>>()?,
        ),
        Node::Any(nodes) => Prepared::Any(
            nodes
                .iter()
                .map(|n| prepare(tx, n))
                .collect::<CoreResult<_>>()?,
        ),
        Node::Link(link) => prepare_link(tx, link)?,
    })
}

fn prepare_link<'a>(tx: &Transaction, link: &Link) -> CoreResult<Prepared<'a>> {
    let related: Vec<Row> = matching(tx, link.related, Some(&link.node))?;
    Ok(match link.kind {
        LinkKind::ToOne(property) => {
            Prepared::Points(property, related.into_iter().map(|(id, _)| id).collect())
        }
        LinkKind::Backlink(property) => Prepared::Within(
            related
                .iter()
                .map(|(_, payload)| RecordReader::new(payload).read_u64(property.as_u16()))
                .filter(|target| *target != 0)
                .collect(),
        ),
        LinkKind::Many(relation) => {
            let wanted: HashSet<ObjectId> = related.into_iter().map(|(id, _)| id).collect();
            Prepared::Within(
                entity::all_links(tx, relation)?
                    .into_iter()
                    .filter(|(_, targets)| targets.iter().any(|t| wanted.contains(t)))
                    .map(|(source, _)| source)
                    .collect(),
            )
        }
        LinkKind::BacklinkMany(relation) => {
            let mut ids = HashSet::new();
            for (source, _) in related {
                ids.extend(entity::targets(tx, relation, source)?);
            }
            Prepared::Within(ids)
        }
    })
}

/// Rows of `entity` matching `node`, ascending by ID.
pub(crate) fn matching(
    tx: &Transaction,
    entity: EntityTypeId,
    node: Option<&Node>,
) -> CoreResult<Vec<Row>> {
    let table = TableId::entity(entity);
    let Some(node) = node else {
        return tx.scan(table);
    };
    let prepared = prepare(tx, node)?;
    let mut out = Vec::new();
    match index_candidates(tx, entity, node)? {
        Some(ids) => {
            for id in ids {
                if let Some(payload) = tx.get(table, id)? {
                    if prepared.matches(id, &RecordReader::new(&payload)) {
                        out.push((id, payload));
                    }
                }
            }
        }
        None => {
            for (id, payload) in tx.scan(table)? {
                if prepared.matches(id, &RecordReader::new(&payload)) {
                    out.push((id, payload));
                }
            }
        }
    }
    Ok(out)
}

/// Candidate IDs from a secondary index, when one answers a top-level
/// leaf and reflects exactly what `tx` sees.
fn index_candidates(
    tx: &Transaction,
    entity: EntityTypeId,
    node: &Node,
) -> CoreResult<Option<Vec<ObjectId>>> {
    let leaves: Vec<&Leaf> = match node {
        Node::Leaf(leaf) => vec![leaf],
        Node::All(nodes) => nodes
            .iter()
            .filter_map(|n| match n {
                Node::Leaf(leaf) => Some(leaf),
                _ => None,
            })
            .collect(),
        _ => return Ok(None),
    };
    let indexes = tx.manager().indexes();
    let probe = leaves.into_iter().find_map(|leaf| {
        if leaf.kind == ValueKind::Text && !leaf.case_sensitive {
            return None;
        }
        match (leaf.op, leaf.values.as_slice()) {
            (Op::Eq, [value]) => {
                let key = IndexValue::from_value(value)?;
                indexes.lookup(entity, leaf.property, &key)
            }
            (Op::Between, [low, high]) if !leaf.unsigned => {
                let low = IndexValue::from_value(low)?;
                let high = IndexValue::from_value(high)?;
                indexes.range(entity, leaf.property, &low, &high)
            }
            _ => None,
        }
    });
    let Some(hits) = probe else {
        return Ok(None);
    };
    if hits.as_of != tx.snapshot() || tx.has_pending(TableId::entity(entity))? {
        return Ok(None);
    }
    let mut ids = hits.ids;
    ids.sort_unstable();
    ids.dedup();
    Ok(Some(ids))
}

fn read(reader: &RecordReader<'_>, property: PropertyId, ty: PropertyType) -> Value {
    let value = reader.read_value(property.as_u16(), ty);
    if ty == PropertyType::Relation && value == Value::Int(0) {
        Value::Null
    } else {
        value
    }
}

fn leaf_matches(leaf: &Leaf, reader: &RecordReader<'_>) -> bool {
    let value = read(reader, leaf.property, leaf.ty);
    match leaf.op {
        Op::IsNull => return value.is_null(),
        Op::NotNull => return !value.is_null(),
        _ if value.is_null() => return false,
        _ => {}
    }
    let cmp = |other: &Value| compare(leaf, &value, other);
    match (leaf.op, leaf.values.as_slice()) {
        (Op::Eq, [v]) => cmp(v) == Some(Ordering::Equal),
        (Op::Ne, [v]) => cmp(v).is_some_and(Ordering::is_ne),
        (Op::Lt, [v]) => cmp(v) == Some(Ordering::Less),
        (Op::Le, [v]) => cmp(v).is_some_and(Ordering::is_le),
        (Op::Gt, [v]) => cmp(v) == Some(Ordering::Greater),
        (Op::Ge, [v]) => cmp(v).is_some_and(Ordering::is_ge),
        (Op::Between, [low, high]) => {
            cmp(low).is_some_and(Ordering::is_ge) && cmp(high).is_some_and(Ordering::is_le)
        }
        (Op::OneOf, values) => values.iter().any(|v| cmp(v) == Some(Ordering::Equal)),
        (Op::NoneOf, values) => !values.iter().any(|v| cmp(v) == Some(Ordering::Equal)),
        (Op::StartsWith | Op::EndsWith | Op::Contains, [Value::Text(needle)]) => {
            let Some(text) = value.as_str() else {
                return false;
            };
            let (text, needle) = if leaf.case_sensitive {
                (text.to_string(), needle.clone())
            } else {
                (text.to_lowercase(), needle.to_lowercase())
            };
            match leaf.op {
                Op::StartsWith => text.starts_with(&needle),
                Op::EndsWith => text.ends_with(&needle),
                _ => text.contains(&needle),
            }
        }
        _ => false,
    }
}

#[allow(clippy::cast_sign_loss)]
fn compare(leaf: &Leaf, value: &Value, literal: &Value) -> Option<Ordering> {
    match leaf.kind {
        ValueKind::Integer => {
            let (a, b) = (value.as_i64()?, literal.as_i64()?);
            Some(if leaf.unsigned {
                (a as u64).cmp(&(b as u64))
            } else {
                a.cmp(&b)
            })
        }
        ValueKind::Float => value.as_f64()?.partial_cmp(&literal.as_f64()?),
        ValueKind::Text => {
            let (a, b) = (value.as_str()?, literal.as_str()?);
            Some(if leaf.case_sensitive {
                a.cmp(b)
            } else {
                a.to_lowercase().cmp(&b.to_lowercase())
            })
        }
        ValueKind::Bytes => Some(value.as_bytes()?.cmp(literal.as_bytes()?)),
        ValueKind::Any => None,
    }
}

/// Sorts `rows` by `orders`, ties broken by ascending ID.
pub(crate) fn sort(rows: Vec<Row>, orders: &[Order]) -> Vec<Row> {
    if orders.is_empty() {
        return rows;
    }
    let mut keyed: Vec<(Vec<Value>, Row)> = rows
        .into_iter()
        .map(|row| {
            let reader = RecordReader::new(&row.1);
            let keys = orders
                .iter()
                .map(|o| read(&reader, o.property, o.ty))
                .collect();
            (keys, row)
        })
        .collect();
    keyed.sort_by(|(ka, ra), (kb, rb)| {
        orders
            .iter()
            .zip(ka.iter().zip(kb))
            .map(|(order, (a, b))| compare_keys(order, a, b))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| ra.0.cmp(&rb.0))
    });
    keyed.into_iter().map(|(_, row)| row).collect()
}

fn zero_of(ty: PropertyType) -> Value {
    if ty.is_float() {
        Value::Float(0.0)
    } else if ty == PropertyType::String {
        Value::Text(String::new())
    } else if ty == PropertyType::ByteVector {
        Value::Bytes(Vec::new())
    } else {
        Value::Int(0)
    }
}

#[allow(clippy::cast_sign_loss)]
fn compare_keys(order: &Order, a: &Value, b: &Value) -> Ordering {
    let flags = order.flags;
    let zero = || zero_of(order.ty);
    let (a, b) = if flags.contains(OrderFlags::NULLS_ZERO) {
        (
            if a.is_null() { zero() } else { a.clone() },
            if b.is_null() { zero() } else { b.clone() },
        )
    } else {
        (a.clone(), b.clone())
    };
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) | (false, true) => {
            let null_first = if flags.contains(OrderFlags::NULLS_LAST) {
                Ordering::Greater
            } else {
                Ordering::Less
            };
            return if a.is_null() {
                null_first
            } else {
                null_first.reverse()
            };
        }
        (false, false) => {}
    }
    let ord = match (&a, &b) {
        (Value::Text(x), Value::Text(y)) => {
            if flags.contains(OrderFlags::CASE_SENSITIVE) {
                x.cmp(y)
            } else {
                x.to_lowercase().cmp(&y.to_lowercase())
            }
        }
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            let x = a.as_f64().unwrap_or(f64::NAN);
            let y = b.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        _ => {
            let x = a.as_i64().unwrap_or_default();
            let y = b.as_i64().unwrap_or_default();
            if flags.contains(OrderFlags::UNSIGNED) {
                (x as u64).cmp(&(y as u64))
            } else {
                x.cmp(&y)
            }
        }
    };
    if flags.contains(OrderFlags::DESCENDING) {
        ord.reverse()
    } else {
        ord
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_leaf(op: Op, value: &str, case_sensitive: bool) -> Leaf {
        let mut leaf = Leaf::new(
            EntityTypeId::new(1),
            PropertyId::new(2),
            ValueKind::Text,
            PropertyType::String,
            op,
            vec![Value::Text(value.to_string())],
        );
        leaf.case_sensitive = case_sensitive;
        leaf
    }

    fn record(name: Option<&str>) -> Vec<u8> {
        let mut builder = boxdb_codec::RecordBuilder::new();
        let offset = builder.prepare_opt_string(name).unwrap();
        builder.collect_opt_offset(2, offset);
        builder.finish().unwrap()
    }

    #[test]
    fn string_leaves_respect_case_flag() {
        let payload = record(Some("Alice"));
        let reader = RecordReader::new(&payload);
        assert!(leaf_matches(&text_leaf(Op::Eq, "Alice", true), &reader));
        assert!(!leaf_matches(&text_leaf(Op::Eq, "alice", true), &reader));
        assert!(leaf_matches(&text_leaf(Op::Eq, "alice", false), &reader));
        assert!(leaf_matches(&text_leaf(Op::StartsWith, "AL", false), &reader));
        assert!(!leaf_matches(&text_leaf(Op::StartsWith, "AL", true), &reader));
        assert!(leaf_matches(&text_leaf(Op::Contains, "lic", true), &reader));
        assert!(leaf_matches(&text_leaf(Op::EndsWith, "ce", true), &reader));
    }

    #[test]
    fn null_only_matches_null_checks() {
        let payload = record(None);
        let reader = RecordReader::new(&payload);
        assert!(!leaf_matches(&text_leaf(Op::Ne, "x", true), &reader));
        let mut is_null = text_leaf(Op::IsNull, "", true);
        is_null.values.clear();
        assert!(leaf_matches(&is_null, &reader));
    }

    #[test]
    fn unsigned_integers_compare_by_bit_pattern() {
        let mut leaf = Leaf::new(
            EntityTypeId::new(1),
            PropertyId::new(2),
            ValueKind::Integer,
            PropertyType::Long,
            Op::Gt,
            vec![Value::Int(1)],
        );
        assert_eq!(compare(&leaf, &Value::Int(-1), &Value::Int(1)), Some(Ordering::Less));
        leaf.unsigned = true;
        assert_eq!(compare(&leaf, &Value::Int(-1), &Value::Int(1)), Some(Ordering::Greater));
    }

    #[test]
    fn order_keys_place_nulls() {
        let order = |flags| Order {
            property: PropertyId::new(2),
            ty: PropertyType::Long,
            flags,
        };
        let null = Value::Null;
        let one = Value::Int(1);
        assert_eq!(compare_keys(&order(OrderFlags::NONE), &null, &one), Ordering::Less);
        assert_eq!(compare_keys(&order(OrderFlags::NULLS_LAST), &null, &one), Ordering::Greater);
        assert_eq!(
            compare_keys(&order(OrderFlags::DESCENDING), &null, &one),
            Ordering::Less
        );
        assert_eq!(
            compare_keys(&order(OrderFlags::NULLS_ZERO), &null, &Value::Int(0)),
            Ordering::Equal
        );
        assert_eq!(
            compare_keys(&order(OrderFlags::DESCENDING), &Value::Int(2), &one),
            Ordering::Less
        );
    }
}
