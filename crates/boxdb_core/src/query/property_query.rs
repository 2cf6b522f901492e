//! Aggregates over one property of a query's matches.

use crate::collection::EntityCodec;
use crate::error::{CoreError, CoreResult};
use crate::query::Query;
use crate::schema::PropertySchema;
use boxdb_codec::{PropertyType, RecordReader, Value};
use std::collections::HashSet;

#[derive(Hash, PartialEq, Eq)]
enum DistinctKey {
    Int(i64),
    Float(u64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Values of one property across the matches of a [`Query`].
///
/// Objects without a value are skipped unless a replacement is set with
/// [`PropertyQuery::null_value`].
pub struct PropertyQuery<T: EntityCodec> {
    query: Query<T>,
    property: PropertySchema,
    distinct: bool,
    case_sensitive: bool,
    null_value: Option<Value>,
}

impl<T: EntityCodec> PropertyQuery<T> {
    pub(crate) fn new(query: Query<T>, property: PropertySchema) -> Self {
        Self {
            query,
            property,
            distinct: false,
            case_sensitive: true,
            null_value: None,
        }
    }

    /// Drops repeated values.
    #[must_use]
    pub fn distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    /// Whether distinct strings compare with case; on by default.
    #[must_use]
    pub fn case_sensitive(mut self, sensitive: bool) -> Self {
        self.case_sensitive = sensitive;
        self
    }

    /// Uses `value` for objects without a value instead of skipping them.
    ///
    /// # Errors
    ///
    /// `IllegalArgument` if `value` cannot be stored in the property.
    pub fn null_value(mut self, value: impl Into<Value>) -> CoreResult<Self> {
        let value = value.into();
        if value.is_null() || !value.fits(self.property.ty) {
            return Err(CoreError::illegal_argument(format!(
                "{} value cannot stand in for {}",
                value.kind(),
                self.property.name
            )));
        }
        self.null_value = Some(value);
        Ok(self)
    }

    fn qualified_name(&self) -> String {
        format!("{}.{}", self.query.schema().name, self.property.name)
    }

    fn require(&self, ok: bool, expected: &str) -> CoreResult<()> {
        if ok {
            Ok(())
        } else {
            Err(CoreError::type_mismatch(
                self.qualified_name(),
                expected,
                self.property.ty.name(),
            ))
        }
    }

    fn require_integer(&self) -> CoreResult<()> {
        self.require(self.property.ty.is_integer(), "integer")
    }

    fn unsigned(&self) -> bool {
        self.property.is_unsigned()
    }

    #[allow(clippy::cast_sign_loss)]
    fn unsigned_sum(&self) -> CoreResult<u64> {
        self.values()?.iter().filter_map(Value::as_i64).try_fold(0u64, |acc, v| {
            acc.checked_add(v as u64)
                .ok_or_else(|| CoreError::overflow(format!("sum of {}", self.qualified_name())))
        })
    }

    fn require_numeric(&self) -> CoreResult<()> {
        let ty = self.property.ty;
        self.require(ty.is_integer() || ty.is_float(), "number")
    }

    fn distinct_key(&self, value: &Value) -> DistinctKey {
        match value {
            Value::Text(s) if !self.case_sensitive => DistinctKey::Text(s.to_lowercase()),
            Value::Text(s) => DistinctKey::Text(s.clone()),
            Value::Bytes(b) => DistinctKey::Bytes(b.clone()),
            Value::Float(f) => DistinctKey::Float(if *f == 0.0 { 0 } else { f.to_bits() }),
            other => DistinctKey::Int(other.as_i64().unwrap_or_default()),
        }
    }

    fn values(&self) -> CoreResult<Vec<Value>> {
        let id = self.property.id.as_u16();
        let ty = self.property.ty;
        let rows = self.query.read(|tx| self.query.rows(tx))?;
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(rows.len());
        for (_, payload) in rows {
            let mut value = RecordReader::new(&payload).read_value(id, ty);
            if ty == PropertyType::Relation && value == Value::Int(0) {
                value = Value::Null;
            }
            if value.is_null() {
                match &self.null_value {
                    Some(replacement) => value = replacement.clone(),
                    None => continue,
                }
            }
            if self.distinct && !seen.insert(self.distinct_key(&value)) {
                continue;
            }
            out.push(value);
        }
        Ok(out)
    }

    /// Number of values.
    pub fn count(&self) -> CoreResult<u64> {
        Ok(self.values()?.len() as u64)
    }

    /// Sum of an integer property.
    ///
    /// # Errors
    ///
    /// `NumericOverflow` if the sum does not fit in an `i64`.
    pub fn sum_i64(&self) -> CoreResult<i64> {
        self.require_integer()?;
        if self.unsigned() {
            let sum = self.unsigned_sum()?;
            return i64::try_from(sum)
                .map_err(|_| CoreError::overflow(format!("sum of {}", self.qualified_name())));
        }
        self.values()?.iter().try_fold(0i64, |acc, v| {
            acc.checked_add(v.as_i64().unwrap_or_default())
                .ok_or_else(|| CoreError::overflow(format!("sum of {}", self.qualified_name())))
        })
    }

    /// Sum of an `UNSIGNED` integer property.
    ///
    /// # Errors
    ///
    /// `PropertyTypeMismatch` for signed properties, `NumericOverflow` if
    /// the sum does not fit in a `u64`.
    pub fn sum_u64(&self) -> CoreResult<u64> {
        self.require(
            self.property.ty.is_integer() && self.unsigned(),
            "unsigned integer",
        )?;
        self.unsigned_sum()
    }

    /// Values as floating point, reading `UNSIGNED` integers as `u64`.
    #[allow(clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn numbers(&self) -> CoreResult<Vec<f64>> {
        self.require_numeric()?;
        let values = self.values()?;
        if self.property.ty.is_integer() && self.unsigned() {
            return Ok(values
                .iter()
                .filter_map(Value::as_i64)
                .map(|v| v as u64 as f64)
                .collect());
        }
        Ok(values.iter().filter_map(Value::as_f64).collect())
    }

    /// Sum of a numeric property as floating point.
    pub fn sum_f64(&self) -> CoreResult<f64> {
        Ok(self.numbers()?.into_iter().sum())
    }

    /// Smallest value of an integer property; `None` without values.
    /// `UNSIGNED` properties compare as `u64` and return its bits.
    #[allow(clippy::cast_sign_loss)]
    pub fn min_i64(&self) -> CoreResult<Option<i64>> {
        self.require_integer()?;
        let values = self.values()?;
        let ints = values.iter().filter_map(Value::as_i64);
        Ok(if self.unsigned() {
            ints.min_by_key(|v| *v as u64)
        } else {
            ints.min()
        })
    }

    /// Largest value of an integer property; `None` without values.
    /// `UNSIGNED` properties compare as `u64` and return its bits.
    #[allow(clippy::cast_sign_loss)]
    pub fn max_i64(&self) -> CoreResult<Option<i64>> {
        self.require_integer()?;
        let values = self.values()?;
        let ints = values.iter().filter_map(Value::as_i64);
        Ok(if self.unsigned() {
            ints.max_by_key(|v| *v as u64)
        } else {
            ints.max()
        })
    }

    /// Smallest value of a numeric property; `None` without values.
    pub fn min_f64(&self) -> CoreResult<Option<f64>> {
        Ok(self.numbers()?.into_iter().reduce(f64::min))
    }

    /// Largest value of a numeric property; `None` without values.
    pub fn max_f64(&self) -> CoreResult<Option<f64>> {
        Ok(self.numbers()?.into_iter().reduce(f64::max))
    }

    /// Mean of a numeric property; NaN without values. Integers are
    /// summed exactly before dividing.
    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
    pub fn average(&self) -> CoreResult<f64> {
        self.require_numeric()?;
        let values = self.values()?;
        if values.is_empty() {
            return Ok(f64::NAN);
        }
        let n = values.len() as f64;
        if self.property.ty.is_integer() {
            let unsigned = self.unsigned();
            let sum: i128 = values
                .iter()
                .filter_map(Value::as_i64)
                .map(|v| if unsigned { i128::from(v as u64) } else { i128::from(v) })
                .sum();
            Ok(sum as f64 / n)
        } else {
            Ok(values.iter().filter_map(Value::as_f64).sum::<f64>() / n)
        }
    }

    /// Every value, in the query's result order.
    pub fn find_values(&self) -> CoreResult<Vec<Value>> {
        self.values()
    }

    /// Values of an integer property.
    pub fn find_i64s(&self) -> CoreResult<Vec<i64>> {
        self.require_integer()?;
        Ok(self.values()?.iter().filter_map(Value::as_i64).collect())
    }

    /// Values of a numeric property as floating point.
    pub fn find_f64s(&self) -> CoreResult<Vec<f64>> {
        self.numbers()
    }

    /// Values of a string property.
    pub fn find_strings(&self) -> CoreResult<Vec<String>> {
        self.require(self.property.ty == PropertyType::String, "string")?;
        Ok(self
            .values()?
            .into_iter()
            .filter_map(|v| match v {
                Value::Text(s) => Some(s),
                _ => None,
            })
            .collect())
    }

    /// The only value, if any.
    ///
    /// # Errors
    ///
    /// `NonUniqueResult` if there is more than one value; combine with
    /// [`PropertyQuery::distinct`] to collapse repeats first.
    pub fn find_unique_value(&self) -> CoreResult<Option<Value>> {
        let mut values = self.values()?;
        if values.len() > 1 {
            return Err(CoreError::NonUniqueResult {
                count: values.len(),
            });
        }
        Ok(values.pop())
    }
}

impl<T: EntityCodec> Clone for PropertyQuery<T> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            property: self.property.clone(),
            distinct: self.distinct,
            case_sensitive: self.case_sensitive,
            null_value: self.null_value.clone(),
        }
    }
}

impl<T: EntityCodec> std::fmt::Debug for PropertyQuery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyQuery")
            .field("property", &self.qualified_name())
            .field("distinct", &self.distinct)
            .field("case_sensitive", &self.case_sensitive)
            .field("null_value", &self.null_value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{memory_store, Person};
    use crate::query::{OrderFlags, Property};
    use crate::schema::{EntityBuilder, ModelBuilder, PropertyFlags};
    use crate::store::Store;
    use crate::types::{EntityTypeId, ObjectId};
    use boxdb_codec::RecordBuilder;

    fn seeded() -> crate::store::Store {
        let store = memory_store();
        store
            .entity_box::<Person>()
            .unwrap()
            .put_many_immutable(&[
                Person::new("ann", 30).with_score(1.5),
                Person::new("Ann", 40).with_score(2.5),
                Person::new("ben", 30).with_email("ben@example.com"),
                Person::new("cid", 20).with_score(4.0),
            ])
            .unwrap();
        store
    }

    #[test]
    fn aggregates() {
        let store = seeded();
        let people = store.entity_box::<Person>().unwrap();
        let all = people.query().build().unwrap();

        let ages = all.property(Person::AGE).unwrap();
        assert_eq!(ages.count().unwrap(), 4);
        assert_eq!(ages.sum_i64().unwrap(), 120);
        assert_eq!(ages.min_i64().unwrap(), Some(20));
        assert_eq!(ages.max_i64().unwrap(), Some(40));
        assert!((ages.average().unwrap() - 30.0).abs() < f64::EPSILON);
        assert_eq!(ages.clone().distinct(true).count().unwrap(), 3);

        let scores = all.property(Person::SCORE).unwrap();
        assert!((scores.sum_f64().unwrap() - 8.0).abs() < 1e-9);
        assert_eq!(scores.max_f64().unwrap(), Some(4.0));
        assert!(matches!(
            scores.sum_i64(),
            Err(CoreError::PropertyTypeMismatch { .. })
        ));
    }

    #[test]
    fn empty_matches() {
        let store = seeded();
        let people = store.entity_box::<Person>().unwrap();
        let none = people.query().filter(Person::AGE.gt(99)).build().unwrap();
        let ages = none.property(Person::AGE).unwrap();
        assert_eq!(ages.min_i64().unwrap(), None);
        assert_eq!(ages.max_f64().unwrap(), None);
        assert!(ages.average().unwrap().is_nan());
        assert_eq!(ages.sum_i64().unwrap(), 0);
        assert_eq!(ages.find_unique_value().unwrap(), None);
    }

    #[test]
    fn strings_nulls_and_distinct() {
        let store = seeded();
        let people = store.entity_box::<Person>().unwrap();
        let by_name = people
            .query()
            .order_by(Person::NAME, OrderFlags::CASE_SENSITIVE)
            .build()
            .unwrap();

        let names = by_name.property(Person::NAME).unwrap();
        assert_eq!(names.find_strings().unwrap(), ["Ann", "ann", "ben", "cid"]);
        assert_eq!(
            names
                .clone()
                .distinct(true)
                .case_sensitive(false)
                .find_strings()
                .unwrap(),
            ["Ann", "ben", "cid"]
        );

        let emails = by_name.property(Person::EMAIL).unwrap();
        assert_eq!(emails.find_strings().unwrap(), ["ben@example.com"]);
        assert_eq!(
            emails.clone().null_value("-").unwrap().count().unwrap(),
            4
        );
        assert!(emails.clone().null_value(3).is_err());
        assert!(matches!(
            emails.find_i64s(),
            Err(CoreError::PropertyTypeMismatch { .. })
        ));
    }

    #[test]
    fn unique_value() {
        let store = memory_store();
        let people = store.entity_box::<Person>().unwrap();
        people
            .put_many_immutable(&[Person::new("a", 5), Person::new("b", 5)])
            .unwrap();
        let ages = people.query().build().unwrap().property(Person::AGE).unwrap();
        assert!(matches!(
            ages.find_unique_value(),
            Err(CoreError::NonUniqueResult { count: 2 })
        ));
        assert_eq!(
            ages.clone().distinct(true).find_unique_value().unwrap(),
            Some(Value::Int(5))
        );
    }

    struct Counter {
        id: ObjectId,
        hits: u64,
    }

    impl Counter {
        const HITS: Property<Counter, i64> = Property::new(2);
    }

    impl EntityCodec for Counter {
        const ENTITY_TYPE: EntityTypeId = EntityTypeId::new(1);

        fn id(&self) -> ObjectId {
            self.id
        }

        fn set_id(&mut self, id: ObjectId) {
            self.id = id;
        }

        fn encode(&self, id: ObjectId, builder: &mut RecordBuilder) -> CoreResult<()> {
            builder.collect_u64(1, id);
            builder.collect_u64(2, self.hits);
            Ok(())
        }

        fn decode(id: ObjectId, reader: &RecordReader<'_>) -> CoreResult<Self> {
            Ok(Self {
                id,
                hits: reader.read_u64(2),
            })
        }
    }

    #[test]
    fn unsigned_aggregates() {
        let model = ModelBuilder::new()
            .entity(EntityBuilder::new(1, "Counter").id_property(1, "id").property_with_flags(
                2,
                "hits",
                PropertyType::Long,
                PropertyFlags::UNSIGNED,
            ))
            .build()
            .unwrap();
        let store = Store::open_in_memory(model, "unsigned-aggregates").unwrap();
        let counters = store.entity_box::<Counter>().unwrap();
        let big = u64::MAX - 1;
        counters
            .put_many_immutable(&[Counter { id: 0, hits: 7 }, Counter { id: 0, hits: big }])
            .unwrap();

        let hits = counters.query().build().unwrap().property(Counter::HITS).unwrap();
        assert_eq!(hits.min_i64().unwrap().map(|v| v as u64), Some(7));
        assert_eq!(hits.max_i64().unwrap().map(|v| v as u64), Some(big));
        assert_eq!(hits.max_f64().unwrap(), Some(big as f64));
        assert!(matches!(hits.sum_i64(), Err(CoreError::NumericOverflow { .. })));
        assert!(matches!(hits.sum_u64(), Err(CoreError::NumericOverflow { .. })));

        counters.remove_all().unwrap();
        counters
            .put_many_immutable(&[Counter { id: 0, hits: 1 << 62 }, Counter { id: 0, hits: 1 << 62 }])
            .unwrap();
        assert_eq!(hits.sum_u64().unwrap(), 1 << 63);
        assert!(matches!(hits.sum_i64(), Err(CoreError::NumericOverflow { .. })));

        let store = seeded();
        let people = store.entity_box::<Person>().unwrap();
        let ages = people.query().build().unwrap().property(Person::AGE).unwrap();
        assert!(matches!(
            ages.sum_u64(),
            Err(CoreError::PropertyTypeMismatch { .. })
        ));
    }
}
