//! SQLite storage implementation

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use super::migration;
use super::schema::{self, quote_ident, METADATA_TABLE, MODEL_HASH_KEY, MODEL_KEY, OBJECT_ID_COLUMN};
use crate::context::{Change, ChangeSet};
use crate::entity::{Entity, ObjectId, Value};
use crate::model::{FieldDescription, Model};
use crate::query::{sql, FetchRequest};
use crate::{Error, Result};

/// The store was incompatible with the model and has been recreated empty.
///
/// Not an error: the stack is usable, but everything previously persisted is
/// gone and callers should tell the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDataLoss {
    pub path: PathBuf,
    pub reason: String,
}

impl std::fmt::Display for MigrationDataLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "store {} was recreated and its data discarded: {}",
            self.path.display(),
            self.reason
        )
    }
}

/// Result of opening a store file
pub struct OpenedStore {
    pub handle: StoreHandle,
    pub data_loss: Option<MigrationDataLoss>,
}

/// Connection to the embedded store, built from one model.
///
/// Owned by the root context; every other context reaches the store through
/// the root's queue.
pub struct StoreHandle {
    conn: Mutex<Connection>,
    model: Arc<Model>,
    path: PathBuf,
}

impl StoreHandle {
    /// Open a store file, recreating it when it cannot be attached with `model`.
    pub fn open(path: &Path, model: Arc<Model>) -> Result<OpenedStore> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match Self::attach(path, model.clone()) {
            Ok(handle) => Ok(OpenedStore { handle, data_loss: None }),
            Err(first) => {
                warn!(path = %path.display(), error = %first, "store cannot be attached, recreating it");
                destroy_store_files(path).map_err(|e| Error::Initialization {
                    path: path.to_path_buf(),
                    reason: format!("could not remove incompatible store: {}", e),
                })?;

                let handle = Self::attach(path, model).map_err(|second| Error::Initialization {
                    path: path.to_path_buf(),
                    reason: second.to_string(),
                })?;

                let loss = MigrationDataLoss {
                    path: path.to_path_buf(),
                    reason: first.to_string(),
                };
                warn!("{}", loss);
                Ok(OpenedStore { handle, data_loss: Some(loss) })
            }
        }
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory(model: Arc<Model>) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        attach_connection(&mut conn, &model)?;
        Ok(Self {
            conn: Mutex::new(conn),
            model,
            path: PathBuf::from(":memory:"),
        })
    }

    fn attach(path: &Path, model: Arc<Model>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        attach_connection(&mut conn, &model)?;
        info!(path = %path.display(), model = %model.name, version = model.version, "store attached");
        Ok(Self {
            conn: Mutex::new(conn),
            model,
            path: path.to_path_buf(),
        })
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw connection access for tests that need to tamper with the schema
    #[cfg(test)]
    pub(crate) fn with_connection<R>(&self, f: impl FnOnce(&Connection) -> R) -> R {
        f(&self.conn.lock())
    }

    // ========== Change Operations ==========

    /// Persist a change set in a single transaction
    pub fn apply(&self, changes: &ChangeSet) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for (id, change) in changes.iter() {
            match change {
                Change::Upsert(entity) => {
                    let description = self.model.require_entity(&entity.entity)?;
                    let mut columns = vec![quote_ident(OBJECT_ID_COLUMN)];
                    let mut values = vec![Value::Text(id.to_string())];
                    for field in &description.fields {
                        columns.push(quote_ident(&field.name));
                        values.push(entity.get(&field.name).clone());
                    }
                    let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{}", i)).collect();
                    let stmt = format!(
                        "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
                        quote_ident(&description.name),
                        columns.join(", "),
                        placeholders.join(", ")
                    );
                    tx.execute(&stmt, params_from_iter(values.iter()))?;
                }
                Change::Delete { entity } => {
                    let description = self.model.require_entity(entity)?;
                    let stmt = format!(
                        "DELETE FROM {} WHERE {} = ?1",
                        quote_ident(&description.name),
                        quote_ident(OBJECT_ID_COLUMN)
                    );
                    tx.execute(&stmt, [id.to_string()])?;
                }
            }
        }

        tx.commit()?;
        debug!(changes = changes.len(), "change set persisted");
        Ok(())
    }

    // ========== Query Operations ==========

    /// Run a bound fetch request against persisted rows only
    pub fn execute(&self, request: &FetchRequest) -> Result<Vec<Entity>> {
        let description = self.model.require_entity(&request.entity)?;
        let compiled = sql::compile(request, description);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&compiled.sql)?;
        let entities = stmt
            .query_map(params_from_iter(compiled.params.iter()), |row| {
                row_to_entity(row, &request.entity, &compiled.columns)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entities)
    }

    /// Count persisted rows of an entity
    pub fn count(&self, entity: &str) -> Result<usize> {
        let description = self.model.require_entity(entity)?;
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&description.name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats> {
        let mut entities = Vec::new();
        for entity in &self.model.entities {
            entities.push((entity.name.clone(), self.count(&entity.name)?));
        }
        Ok(DbStats {
            path: self.path.clone(),
            model: self.model.name.clone(),
            version: self.model.version,
            entities,
        })
    }
}

/// Bring a connection in line with the model: create a fresh schema, accept a
/// matching one, or migrate additive changes in place.
fn attach_connection(conn: &mut Connection, model: &Model) -> Result<()> {
    let fingerprint = model.fingerprint()?;

    let stored = if table_exists(conn, METADATA_TABLE)? {
        let json = read_metadata(conn, MODEL_KEY)?;
        let hash = read_metadata(conn, MODEL_HASH_KEY)?;
        json.map(|json| (json, hash))
    } else {
        None
    };

    match stored {
        None => {
            let tables: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )?;
            if tables > 0 {
                return Err(Error::Incompatible("store has tables but no model metadata".to_string()));
            }

            let tx = conn.transaction()?;
            for stmt in schema::all_schema_statements(model) {
                tx.execute(&stmt, [])?;
            }
            write_metadata(&tx, model, &fingerprint)?;
            tx.commit()?;
            debug!(model = %model.name, "created fresh store schema");
            Ok(())
        }
        Some((_, Some(hash))) if hash == fingerprint => Ok(()),
        Some((json, _)) => {
            let stored: Model = serde_json::from_str(&json)
                .map_err(|e| Error::Incompatible(format!("unreadable model metadata: {}", e)))?;
            let steps = migration::plan(&stored, model).map_err(Error::Incompatible)?;

            let tx = conn.transaction()?;
            for step in &steps {
                if let Some(stmt) = step.sql(model) {
                    tx.execute(&stmt, [])?;
                }
            }
            write_metadata(&tx, model, &fingerprint)?;
            tx.commit()?;
            info!(
                from = stored.version,
                to = model.version,
                steps = steps.len(),
                "lightweight migration applied"
            );
            Ok(())
        }
    }
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn read_metadata(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        &format!("SELECT value FROM {} WHERE key = ?1", METADATA_TABLE),
        [key],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

fn write_metadata(conn: &Connection, model: &Model, fingerprint: &str) -> Result<()> {
    let json = serde_json::to_string(model).map_err(|e| Error::Model(e.to_string()))?;
    let stmt = format!("INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)", METADATA_TABLE);
    conn.execute(&stmt, [MODEL_KEY, json.as_str()])?;
    conn.execute(&stmt, [MODEL_HASH_KEY, fingerprint])?;
    Ok(())
}

/// Remove a store file and the files SQLite keeps next to it
fn destroy_store_files(path: &Path) -> std::io::Result<()> {
    let mut candidates = vec![path.to_path_buf()];
    for suffix in ["-journal", "-wal", "-shm"] {
        let mut sibling = path.as_os_str().to_owned();
        sibling.push(suffix);
        candidates.push(PathBuf::from(sibling));
    }
    for candidate in candidates {
        match std::fs::remove_file(&candidate) {
            Ok(()) => debug!(path = %candidate.display(), "removed store file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Helper to convert a row to an Entity
fn row_to_entity(row: &rusqlite::Row, entity: &str, columns: &[FieldDescription]) -> rusqlite::Result<Entity> {
    let id_str: String = row.get(0)?;
    let id: ObjectId = id_str.parse().map_err(|e: Error| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let mut record = Entity::with_id(id, entity);
    for (i, field) in columns.iter().enumerate() {
        let value = Value::from_sql(row.get_ref(i + 1)?, field.ty)?;
        if !value.is_null() {
            record.fields.insert(field.name.clone(), value);
        }
    }
    Ok(record)
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DbStats {
    pub path: PathBuf,
    pub model: String,
    pub version: u32,
    pub entities: Vec<(String, usize)>,
}

impl std::fmt::Display for DbStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Database Statistics ({} v{}):", self.model, self.version)?;
        for (entity, count) in &self.entities {
            writeln!(f, "  {}: {}", entity, count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityDescription, FieldType};
    use crate::predicate::Predicate;
    use crate::query::SortKey;

    fn library_v1() -> Model {
        Model::new("Library", 1).entity(
            EntityDescription::new("Book")
                .field("title", FieldType::Text)
                .optional_field("pages", FieldType::Integer),
        )
    }

    fn book(title: &str, pages: i64) -> Entity {
        Entity::new("Book").with("title", title).with("pages", pages)
    }

    #[test]
    fn test_apply_and_execute() {
        let store = StoreHandle::open_in_memory(Arc::new(library_v1())).unwrap();

        let dune = book("Dune", 412);
        let mut changes = ChangeSet::default();
        changes.upsert(dune.clone());
        changes.upsert(book("Emma", 300));
        store.apply(&changes).unwrap();

        let request = FetchRequest::new("Book")
            .filter(Predicate::eq("title", "Dune"))
            .bind(store.model())
            .unwrap();
        let found = store.execute(&request).unwrap();
        assert_eq!(found, vec![dune.clone()]);

        let mut changes = ChangeSet::default();
        changes.delete(&dune);
        store.apply(&changes).unwrap();
        assert_eq!(store.count("Book").unwrap(), 1);
    }

    #[test]
    fn test_execute_orders_rows() {
        let store = StoreHandle::open_in_memory(Arc::new(library_v1())).unwrap();
        let mut changes = ChangeSet::default();
        for (title, pages) in [("b", 20), ("a", 30), ("c", 10)] {
            changes.upsert(book(title, pages));
        }
        store.apply(&changes).unwrap();

        let request = FetchRequest::new("Book").sort_by(SortKey::asc("pages"));
        let titles: Vec<String> = store
            .execute(&request)
            .unwrap()
            .iter()
            .filter_map(|b| b.get_str("title").map(str::to_string))
            .collect();
        assert_eq!(titles, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_failed_apply_rolls_back() {
        let store = StoreHandle::open_in_memory(Arc::new(library_v1())).unwrap();
        let mut changes = ChangeSet::default();
        changes.upsert(book("Dune", 412));
        changes.upsert(Entity::new("Shelf"));
        assert!(store.apply(&changes).is_err());
        assert_eq!(store.count("Book").unwrap(), 0);
    }

    #[test]
    fn test_reopen_with_same_model_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.sqlite");
        let model = Arc::new(library_v1());

        let opened = StoreHandle::open(&path, model.clone()).unwrap();
        assert!(opened.data_loss.is_none());
        let mut changes = ChangeSet::default();
        changes.upsert(book("Dune", 412));
        opened.handle.apply(&changes).unwrap();
        drop(opened);

        let reopened = StoreHandle::open(&path, model).unwrap();
        assert!(reopened.data_loss.is_none());
        assert_eq!(reopened.handle.count("Book").unwrap(), 1);
    }

    #[test]
    fn test_additive_model_migrates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.sqlite");

        let opened = StoreHandle::open(&path, Arc::new(library_v1())).unwrap();
        let mut changes = ChangeSet::default();
        changes.upsert(book("Dune", 412));
        opened.handle.apply(&changes).unwrap();
        drop(opened);

        let v2 = Model::new("Library", 2)
            .entity(
                EntityDescription::new("Book")
                    .field("title", FieldType::Text)
                    .optional_field("pages", FieldType::Integer)
                    .optional_field("isbn", FieldType::Text),
            )
            .entity(EntityDescription::new("Author").field("name", FieldType::Text));
        let reopened = StoreHandle::open(&path, Arc::new(v2)).unwrap();
        assert!(reopened.data_loss.is_none());
        assert_eq!(reopened.handle.count("Book").unwrap(), 1);
        assert_eq!(reopened.handle.count("Author").unwrap(), 0);
    }

    #[test]
    fn test_incompatible_model_recreates_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.sqlite");

        let opened = StoreHandle::open(&path, Arc::new(library_v1())).unwrap();
        let mut changes = ChangeSet::default();
        changes.upsert(book("Dune", 412));
        opened.handle.apply(&changes).unwrap();
        drop(opened);

        let v2 = Model::new("Library", 2)
            .entity(EntityDescription::new("Book").field("title", FieldType::Integer));
        let reopened = StoreHandle::open(&path, Arc::new(v2)).unwrap();
        let loss = reopened.data_loss.expect("data loss must be reported");
        assert_eq!(loss.path, path);
        assert!(loss.reason.contains("changed type"));
        assert_eq!(reopened.handle.count("Book").unwrap(), 0);
    }

    #[test]
    fn test_garbage_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.sqlite");
        std::fs::write(&path, b"definitely not a database, just some bytes that are long enough").unwrap();

        let opened = StoreHandle::open(&path, Arc::new(library_v1())).unwrap();
        assert!(opened.data_loss.is_some());
        assert_eq!(opened.handle.count("Book").unwrap(), 0);
    }

    #[test]
    fn test_unrecoverable_path_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // A directory can be neither attached nor removed as a file.
        let path = dir.path().join("store.sqlite");
        std::fs::create_dir(&path).unwrap();

        match StoreHandle::open(&path, Arc::new(library_v1())) {
            Err(Error::Initialization { .. }) => {}
            Err(other) => panic!("expected initialization failure, got {other}"),
            Ok(_) => panic!("expected initialization failure"),
        }
    }
}
