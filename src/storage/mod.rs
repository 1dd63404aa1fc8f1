//! Storage Layer - SQLite-backed persistence
//!
//! One table per entity, keyed by object id:
//! - <entity>(_object_id, <field>...)
//! - _datastack_metadata(key, value) holding the model the store was built from

pub mod migration;
pub mod schema;
pub mod sqlite;

pub use migration::MigrationStep;
pub use sqlite::{DbStats, MigrationDataLoss, OpenedStore, StoreHandle};
