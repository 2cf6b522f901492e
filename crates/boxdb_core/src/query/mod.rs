//! Queries.
//!
//! A query is built once from typed conditions and re-run as often as
//! needed:
//!
//! ```ignore
//! let mut adults = people
//!     .query()
//!     .filter(Person::AGE.ge(18) & Person::NAME.starts_with("A"))
//!     .order_by(Person::NAME, OrderFlags::NONE)
//!     .build()?;
//! let found = adults.find()?;
//! adults.set_parameter(Person::AGE, 65)?;
//! let seniors = adults.find_ids()?;
//! ```
//!
//! Conditions may reach related objects through to-one properties,
//! standalone relations and their back-links; those behave as EXISTS
//! filters and never repeat an outer object. Equality and range
//! conditions on indexed properties are answered from the index when it
//! reflects exactly the snapshot being read.

mod builder;
mod built;
mod condition;
mod eval;
mod property;
mod property_query;

pub use builder::{OrderFlags, QueryBuilder};
pub use built::{ParameterKey, Query};
pub use condition::Condition;
pub use property::{Property, PropertyValue, ToOneProperty};
pub use property_query::PropertyQuery;
