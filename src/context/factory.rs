//! Context construction

use std::sync::Arc;

use super::{Context, ContextArena, ContextKind, Queue, WorkerPool};
use crate::model::Model;
use crate::storage::StoreHandle;
use crate::Result;

/// Label of the main context's queue
pub const MAIN_QUEUE_LABEL: &str = "datastack-main";

/// Label of the root context's queue
pub const ROOT_QUEUE_LABEL: &str = "datastack-root";

/// Builds contexts for one stack and wires them to their parents.
///
/// Constructors only register the new context and record its parent; no
/// work is scheduled.
pub struct ContextFactory {
    arena: Arc<ContextArena>,
    model: Arc<Model>,
    pool: WorkerPool,
}

impl ContextFactory {
    pub fn new(model: Arc<Model>, worker_threads: usize) -> Result<Self> {
        Ok(Self {
            arena: Arc::new(ContextArena::new()),
            model,
            pool: WorkerPool::new(worker_threads)?,
        })
    }

    pub fn arena(&self) -> &Arc<ContextArena> {
        &self.arena
    }

    /// Root context: owns the store, runs on its own background queue
    pub fn create_root(&self, store: StoreHandle) -> Result<Context> {
        let queue = Queue::dedicated(ROOT_QUEUE_LABEL)?;
        Ok(Context::create(
            &self.arena,
            ContextKind::Root,
            None,
            queue,
            Arc::clone(&self.model),
            Some(store),
        ))
    }

    /// Main context: child of the root, runs on the main queue
    pub fn create_main(&self, root: &Context) -> Result<Context> {
        let queue = Queue::dedicated(MAIN_QUEUE_LABEL)?;
        Ok(self.child(ContextKind::Main, root, queue))
    }

    /// Short-lived context for one read
    pub fn create_read_context(&self, main: &Context) -> Context {
        self.ephemeral(ContextKind::Read, main)
    }

    /// Short-lived context for one save or remove
    pub fn create_save_context(&self, main: &Context) -> Context {
        self.ephemeral(ContextKind::Save, main)
    }

    fn ephemeral(&self, kind: ContextKind, main: &Context) -> Context {
        let queue = Queue::pooled(format!("datastack-{}", kind), &self.pool);
        self.child(kind, main, queue)
    }

    fn child(&self, kind: ContextKind, parent: &Context, queue: Queue) -> Context {
        Context::create(
            &self.arena,
            kind,
            Some(parent.id()),
            queue,
            Arc::clone(&self.model),
            None,
        )
    }
}
