//! Query Builder - fetch requests and their SQL form
//!
//! A [`FetchRequest`] names an entity, an optional [`Predicate`](crate::Predicate),
//! ordered sort keys and an optional limit. Before it runs, the request is
//! bound to the model so that unknown fields fail early and literals carry
//! the field's type. The store executes the bound request as SQL; contexts
//! evaluate the same request in memory against their pending objects.

pub mod request;
pub mod sql;

pub use request::{build_query, FetchRequest, SortKey};
pub use sql::CompiledQuery;
