//! # Datastack - layered persistence over SQLite
//!
//! A tree of contexts in front of an embedded store:
//! - a root context owning the SQLite connection
//! - a main context for the application's main queue
//! - short-lived read and save contexts for individual units of work
//!
//! Saves cascade upward one level at a time until the root writes them to
//! the store. Reads see the pending changes of every ancestor.

pub mod entity;
pub mod model;
pub mod predicate;
pub mod query;
pub mod storage;
pub mod context;
pub mod stack;
pub mod config;
pub mod ui;

// Re-exports for convenient access
pub use entity::{Entity, ObjectId, Value};
pub use model::{EntityDescription, FieldDescription, FieldType, Model};
pub use predicate::{CompareOp, Predicate};
pub use query::{build_query, FetchRequest, SortKey};
pub use context::{CommitFailure, Context, ContextId, ContextKind, ContextPhase, Queue};
pub use storage::{MigrationDataLoss, StoreHandle};
pub use stack::DataStorage;

use std::path::PathBuf;

/// Result type alias for datastack operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for datastack operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot initialize store at {}: {reason}", .path.display())]
    Initialization { path: PathBuf, reason: String },

    #[error("Store is incompatible with the model: {0}")]
    Incompatible(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Unknown field {entity}.{field}")]
    UnknownField { entity: String, field: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Parent context {0} has been released")]
    ParentReleased(ContextId),

    #[error("Queue {0} is closed")]
    QueueClosed(String),

    #[error(transparent)]
    Commit(#[from] CommitFailure),
}
