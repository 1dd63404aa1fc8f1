//! Contexts - scratchpads of pending changes arranged in a tree
//!
//! The root owns the store handle; main is the root's child; short-lived read
//! and save contexts hang off main. Every context runs its work on one serial
//! queue, and changes travel upward one level per save.

pub mod arena;
pub mod changes;
pub mod factory;
pub mod queue;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::entity::Entity;
use crate::model::{EntityDescription, Model};
use crate::query::FetchRequest;
use crate::storage::StoreHandle;
use crate::{Error, Result};

pub use arena::{ContextArena, ContextId};
pub use changes::{Change, ChangeSet};
pub use factory::ContextFactory;
pub use queue::{Queue, QueueId, WorkerPool};

/// Role of a context in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Root,
    Main,
    Read,
    Save,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Root => "root",
            ContextKind::Main => "main",
            ContextKind::Read => "read",
            ContextKind::Save => "save",
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPhase {
    Clean,
    Dirty,
    Committing,
}

/// A cascading commit stopped at `level` (0 is the context it started from).
///
/// Levels below `level` were persisted into their parents and stay that way.
#[derive(Debug, thiserror::Error)]
#[error("commit failed at level {level} ({kind} context {context}): {source}")]
pub struct CommitFailure {
    pub level: usize,
    pub context: ContextId,
    pub kind: ContextKind,
    pub source: Box<Error>,
}

#[derive(Debug)]
struct ContextState {
    changes: ChangeSet,
    phase: ContextPhase,
}

pub(crate) struct ContextInner {
    id: ContextId,
    kind: ContextKind,
    parent: Option<ContextId>,
    queue: Queue,
    model: Arc<Model>,
    arena: Arc<ContextArena>,
    store: Option<StoreHandle>,
    state: Mutex<ContextState>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.arena.release(self.id);
        debug!(context = %self.id, kind = %self.kind, "context released");
    }
}

/// Handle to a context; clones refer to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    fn create(
        arena: &Arc<ContextArena>,
        kind: ContextKind,
        parent: Option<ContextId>,
        queue: Queue,
        model: Arc<Model>,
        store: Option<StoreHandle>,
    ) -> Self {
        let id = arena.allocate();
        let inner = Arc::new(ContextInner {
            id,
            kind,
            parent,
            queue,
            model,
            arena: Arc::clone(arena),
            store,
            state: Mutex::new(ContextState {
                changes: ChangeSet::default(),
                phase: ContextPhase::Clean,
            }),
        });
        arena.register(id, Arc::downgrade(&inner));
        debug!(context = %id, kind = %kind, parent = ?parent, "context created");
        Self { inner }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn kind(&self) -> ContextKind {
        self.inner.kind
    }

    pub fn queue(&self) -> &Queue {
        &self.inner.queue
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.inner.model
    }

    /// The store handle; only the root has one
    pub fn store(&self) -> Option<&StoreHandle> {
        self.inner.store.as_ref()
    }

    pub fn parent_id(&self) -> Option<ContextId> {
        self.inner.parent
    }

    /// The parent context, or `None` for the root
    pub fn parent(&self) -> Result<Option<Context>> {
        match self.inner.parent {
            None => Ok(None),
            Some(id) => self
                .inner
                .arena
                .resolve(id)
                .map(Some)
                .ok_or(Error::ParentReleased(id)),
        }
    }

    // ========== Execution ==========

    /// Run `work` on this context's queue and wait for its result
    pub fn perform_sync<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        let ctx = self.clone();
        self.inner.queue.dispatch_sync(move || work(&ctx))
    }

    /// Schedule `work` on this context's queue
    pub fn perform_async<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        let ctx = self.clone();
        self.inner.queue.dispatch(move || work(&ctx))
    }

    // ========== Staging ==========

    /// Stage an object for insertion, replacing any object with the same id.
    ///
    /// Null fields are dropped and values are converted to their field types
    /// where possible; anything still invalid is reported at save time.
    pub fn insert(&self, entity: Entity) -> Result<()> {
        let description = self.inner.model.require_entity(&entity.entity)?;
        let entity = normalize(description, entity);
        let mut state = self.inner.state.lock();
        state.changes.upsert(entity);
        state.phase = ContextPhase::Dirty;
        Ok(())
    }

    /// Stage an object for deletion
    pub fn delete(&self, entity: &Entity) -> Result<()> {
        self.inner.model.require_entity(&entity.entity)?;
        let mut state = self.inner.state.lock();
        state.changes.delete(entity);
        state.phase = ContextPhase::Dirty;
        Ok(())
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.inner.state.lock().changes.is_empty()
    }

    pub fn pending_change_count(&self) -> usize {
        self.inner.state.lock().changes.len()
    }

    pub fn phase(&self) -> ContextPhase {
        self.inner.state.lock().phase
    }

    // ========== Fetching ==========

    /// Objects matching `request` as seen from this context: persisted rows
    /// with the pending changes of every level from the root down to here.
    pub fn fetch(&self, request: &FetchRequest) -> Result<Vec<Entity>> {
        let request = Arc::new(request.clone().bind(&self.inner.model)?);
        let merged = self.collect(&request)?;
        Ok(request.finish(merged))
    }

    /// Number of objects `fetch` would return
    pub fn count(&self, request: &FetchRequest) -> Result<usize> {
        Ok(self.fetch(request)?.len())
    }

    fn collect(&self, request: &Arc<FetchRequest>) -> Result<Vec<Entity>> {
        let base = match (&self.inner.store, self.parent()?) {
            (Some(store), _) => store.execute(request)?,
            (None, Some(parent)) => {
                let request = Arc::clone(request);
                parent.perform_sync(move |p| p.collect(&request))??
            }
            (None, None) => return Err(Error::ParentReleased(self.inner.id)),
        };
        let state = self.inner.state.lock();
        Ok(state.changes.overlay(request, base))
    }

    // ========== Saving ==========

    /// Persist this context's changes, then its parent's, up to the root.
    ///
    /// Stops at the first level that fails. Levels already saved are not
    /// rolled back; the failing level keeps its changes.
    pub fn commit_cascading(&self) -> std::result::Result<(), CommitFailure> {
        let mut current = self.clone();
        let mut level = 0;

        loop {
            if !current.has_pending_changes() {
                return Ok(());
            }

            let fail = |ctx: &Context, source: Error| {
                let failure = CommitFailure {
                    level,
                    context: ctx.id(),
                    kind: ctx.kind(),
                    source: Box::new(source),
                };
                warn!("{}", failure);
                failure
            };

            let parent = current.parent().map_err(|e| fail(&current, e))?;
            let target = parent.clone();
            current
                .perform_sync(move |ctx| ctx.save_level(target.as_ref()))
                .and_then(|saved| saved)
                .map_err(|e| fail(&current, e))?;
            debug!(level, context = %current.id(), kind = %current.kind(), "level saved");

            match parent {
                Some(parent) => current = parent,
                None => return Ok(()),
            }
            level += 1;
        }
    }

    /// Save one level; runs on this context's queue
    fn save_level(&self, parent: Option<&Context>) -> Result<()> {
        let changes = {
            let mut state = self.inner.state.lock();
            if state.changes.is_empty() {
                state.phase = ContextPhase::Clean;
                return Ok(());
            }
            state.phase = ContextPhase::Committing;
            std::mem::take(&mut state.changes)
        };

        let result = changes.validate(&self.inner.model).and_then(|()| {
            match (&self.inner.store, parent) {
                (Some(store), _) => store.apply(&changes),
                (None, Some(parent)) => {
                    let staged = changes.clone();
                    parent.perform_sync(move |p| p.absorb(staged))
                }
                (None, None) => Err(Error::ParentReleased(self.inner.id)),
            }
        });

        let mut state = self.inner.state.lock();
        match result {
            Ok(()) => {
                state.phase = if state.changes.is_empty() {
                    ContextPhase::Clean
                } else {
                    ContextPhase::Dirty
                };
                Ok(())
            }
            Err(e) => {
                // Keep anything staged while committing on top of the restored set
                let newer = std::mem::replace(&mut state.changes, changes);
                state.changes.merge(newer);
                state.phase = ContextPhase::Dirty;
                Err(e)
            }
        }
    }

    /// Take over a child's changes; runs on this context's queue
    fn absorb(&self, changes: ChangeSet) {
        let mut state = self.inner.state.lock();
        state.changes.merge(changes);
        state.phase = ContextPhase::Dirty;
    }
}

fn normalize(description: &EntityDescription, mut entity: Entity) -> Entity {
    entity.fields = std::mem::take(&mut entity.fields)
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| match description.field_named(&name) {
            Some(field) => {
                let value = value.clone().coerce(field.ty).unwrap_or(value);
                (name, value)
            }
            None => (name, value),
        })
        .collect();
    entity
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("parent", &self.inner.parent)
            .field("queue", &self.inner.queue.label())
            .finish()
    }
}
