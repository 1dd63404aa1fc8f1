//! Registry of live contexts, indexed by id

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use parking_lot::RwLock;

use super::{Context, ContextInner};

/// Identity of a context within one stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Slots hold weak references: the arena never keeps a context alive, and a
/// context clears its own slot when dropped.
#[derive(Default)]
pub struct ContextArena {
    next_id: AtomicU64,
    slots: RwLock<HashMap<ContextId, Weak<ContextInner>>>,
}

impl ContextArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn allocate(&self) -> ContextId {
        ContextId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(super) fn register(&self, id: ContextId, inner: Weak<ContextInner>) {
        self.slots.write().insert(id, inner);
    }

    pub(super) fn release(&self, id: ContextId) {
        self.slots.write().remove(&id);
    }

    /// Look up a live context
    pub fn resolve(&self, id: ContextId) -> Option<Context> {
        self.slots
            .read()
            .get(&id)
            .and_then(Weak::upgrade)
            .map(|inner| Context { inner })
    }

    /// Number of contexts currently alive
    pub fn live_count(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }
}

impl fmt::Debug for ContextArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<ContextId> = self.slots.read().keys().copied().collect();
        ids.sort();
        f.debug_struct("ContextArena").field("live", &ids).finish()
    }
}
