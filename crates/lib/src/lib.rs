//! Shared data model of the quern in-memory analytical database.
//!
//! This crate holds everything the execution backend consumes but does not
//! own: column types and runtime values, schemas with their deduplicated
//! views, tuples, the expression AST used by plan predicates and projections,
//! the physical operator tree, result-set data layouts, a simple row store,
//! and the ordered index structures served to queries by integer id.

pub mod expr;
pub mod index;
pub mod layout;
pub mod plan;
pub mod schema;
pub mod store;
pub mod tuple;
pub mod types;
pub mod value;

pub use schema::{Schema, SchemaEntry};
pub use tuple::Tuple;
pub use types::Type;
pub use value::Value;
