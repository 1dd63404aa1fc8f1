//! DataStorage - the facade over the context tree
//!
//! Reads run synchronously on the main context (when called from the main
//! queue) or on a fresh read context. Saves run on a fresh save context and
//! cascade to the store; their outcome is reported through a completion that
//! is called exactly once.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::context::{Context, ContextFactory, Queue};
use crate::entity::{Entity, Value};
use crate::model::Model;
use crate::predicate::Predicate;
use crate::query::{build_query, FetchRequest, SortKey};
use crate::storage::{DbStats, MigrationDataLoss, StoreHandle};
use crate::{Error, Result};

/// Pool size used when the caller does not pick one
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Calls the wrapped completion once: with the outcome when finished, or
/// with `false` when dropped unfinished (work never scheduled, or panicked).
struct Completion<C: FnOnce(bool)>(Option<C>);

impl<C: FnOnce(bool)> Completion<C> {
    fn new(completion: C) -> Self {
        Self(Some(completion))
    }

    fn finish(mut self, success: bool) {
        if let Some(completion) = self.0.take() {
            completion(success);
        }
    }
}

impl<C: FnOnce(bool)> Drop for Completion<C> {
    fn drop(&mut self) {
        if let Some(completion) = self.0.take() {
            completion(false);
        }
    }
}

struct StackInner {
    model: Arc<Model>,
    factory: ContextFactory,
    root: Context,
    main: Context,
    data_loss: Option<MigrationDataLoss>,
}

/// Persistence facade: a root context owning the store, a main context above
/// it, and short-lived contexts for individual reads and saves.
///
/// Cheap to clone; clones share the same stack.
#[derive(Clone)]
pub struct DataStorage {
    inner: Arc<StackInner>,
}

impl DataStorage {
    /// Open (or create) the store at `path` for `model`
    pub fn open(path: impl AsRef<Path>, model: Model) -> Result<Self> {
        Self::open_with(path, model, DEFAULT_WORKER_THREADS)
    }

    pub fn open_with(path: impl AsRef<Path>, model: Model, worker_threads: usize) -> Result<Self> {
        model.validate()?;
        let model = Arc::new(model);
        let opened = StoreHandle::open(path.as_ref(), Arc::clone(&model))?;
        Self::assemble(model, opened.handle, opened.data_loss, worker_threads)
    }

    /// Stack over an in-memory store
    pub fn open_in_memory(model: Model) -> Result<Self> {
        model.validate()?;
        let model = Arc::new(model);
        let store = StoreHandle::open_in_memory(Arc::clone(&model))?;
        Self::assemble(model, store, None, DEFAULT_WORKER_THREADS)
    }

    fn assemble(
        model: Arc<Model>,
        store: StoreHandle,
        data_loss: Option<MigrationDataLoss>,
        worker_threads: usize,
    ) -> Result<Self> {
        let path = store.path().to_path_buf();
        let factory = ContextFactory::new(Arc::clone(&model), worker_threads)?;
        let root = factory.create_root(store)?;
        let main = factory.create_main(&root)?;

        if let Some(loss) = &data_loss {
            warn!(path = %loss.path.display(), reason = %loss.reason, "store recreated, previous data discarded");
        }
        info!(
            path = %path.display(),
            model = %model.name,
            version = model.version,
            workers = worker_threads,
            "data stack ready"
        );

        Ok(Self {
            inner: Arc::new(StackInner {
                model,
                factory,
                root,
                main,
                data_loss,
            }),
        })
    }

    // ========== Accessors ==========

    pub fn model(&self) -> &Arc<Model> {
        &self.inner.model
    }

    pub fn main_context(&self) -> &Context {
        &self.inner.main
    }

    pub fn root_context(&self) -> &Context {
        &self.inner.root
    }

    /// Queue of the main context; work dispatched here reads and removes
    /// through the main context directly
    pub fn main_queue(&self) -> &Queue {
        self.inner.main.queue()
    }

    /// Set when opening had to recreate the store
    pub fn migration_report(&self) -> Option<&MigrationDataLoss> {
        self.inner.data_loss.as_ref()
    }

    /// Contexts currently alive, including root and main
    pub fn live_contexts(&self) -> usize {
        self.inner.factory.arena().live_count()
    }

    /// Persisted row counts per entity
    pub fn stats(&self) -> Result<DbStats> {
        self.inner.root.perform_sync(|root| match root.store() {
            Some(store) => store.stats(),
            None => Err(Error::Model("root context has no store".to_string())),
        })?
    }

    // ========== Units of Work ==========

    /// Run `work` synchronously and return its result.
    ///
    /// From the main queue the main context is used; anywhere else a fresh
    /// read context.
    pub fn read<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.inner.main.queue().is_current() {
            return Ok(work(&self.inner.main));
        }
        let context = self.inner.factory.create_read_context(&self.inner.main);
        context.perform_sync(work)
    }

    /// Run `work` on a fresh save context in the background, then cascade
    /// its changes to the store.
    pub fn save<W, C>(&self, work: W, completion: C)
    where
        W: FnOnce(&Context) -> Result<()> + Send + 'static,
        C: FnOnce(bool) + Send + 'static,
    {
        let context = self.inner.factory.create_save_context(&self.inner.main);
        commit_async(context, work, Completion::new(completion));
    }

    /// `save`, started from `queue`
    pub fn save_on<W, C>(&self, queue: &Queue, work: W, completion: C)
    where
        W: FnOnce(&Context) -> Result<()> + Send + 'static,
        C: FnOnce(bool) + Send + 'static,
    {
        let stack = self.clone();
        let completion = Completion::new(completion);
        hop(queue, move || stack.save(work, move |ok| completion.finish(ok)));
    }

    /// Like `save`, but blocks the caller until the cascade has finished
    pub fn save_and_wait<W, C>(&self, work: W, completion: C)
    where
        W: FnOnce(&Context) -> Result<()> + Send + 'static,
        C: FnOnce(bool) + Send + 'static,
    {
        let context = self.inner.factory.create_save_context(&self.inner.main);
        let completion = Completion::new(completion);
        let outcome = context.perform_sync(move |ctx| completion.finish(run_and_commit(ctx, work)));
        if let Err(e) = outcome {
            error!(error = %e, "save could not run");
        }
    }

    /// `save_and_wait`, blocking `queue` instead of the caller
    pub fn save_and_wait_on<W, C>(&self, queue: &Queue, work: W, completion: C)
    where
        W: FnOnce(&Context) -> Result<()> + Send + 'static,
        C: FnOnce(bool) + Send + 'static,
    {
        let stack = self.clone();
        let completion = Completion::new(completion);
        hop(queue, move || stack.save_and_wait(work, move |ok| completion.finish(ok)));
    }

    /// Like `save`, except that from the main queue the main context itself
    /// stages and commits the work.
    pub fn remove<W, C>(&self, work: W, completion: C)
    where
        W: FnOnce(&Context) -> Result<()> + Send + 'static,
        C: FnOnce(bool) + Send + 'static,
    {
        let context = if self.inner.main.queue().is_current() {
            self.inner.main.clone()
        } else {
            self.inner.factory.create_save_context(&self.inner.main)
        };
        commit_async(context, work, Completion::new(completion));
    }

    /// `remove`, started from `queue`
    pub fn remove_on<W, C>(&self, queue: &Queue, work: W, completion: C)
    where
        W: FnOnce(&Context) -> Result<()> + Send + 'static,
        C: FnOnce(bool) + Send + 'static,
    {
        let stack = self.clone();
        let completion = Completion::new(completion);
        hop(queue, move || stack.remove(work, move |ok| completion.finish(ok)));
    }

    // ========== Finders ==========

    /// Fetch with errors reported to the caller
    pub fn fetch(&self, request: FetchRequest) -> Result<Vec<Entity>> {
        self.read(move |ctx| ctx.fetch(&request))?
    }

    /// First object whose `field` equals `value`
    pub fn find_object(&self, entity: &str, field: &str, value: impl Into<Value>) -> Option<Entity> {
        let request = FetchRequest::new(entity).filter(Predicate::eq(field, value));
        self.find_one(request)
    }

    pub fn find_object_where(&self, entity: &str, predicate: Predicate) -> Option<Entity> {
        self.find_one(FetchRequest::new(entity).filter(predicate))
    }

    pub fn find_first(&self, entity: &str) -> Option<Entity> {
        self.find_one(FetchRequest::new(entity))
    }

    pub fn find_all(&self, entity: &str) -> Option<Vec<Entity>> {
        self.find(FetchRequest::new(entity))
    }

    /// All objects whose `field` equals `value`
    pub fn find_all_by(&self, entity: &str, field: &str, value: impl Into<Value>) -> Option<Vec<Entity>> {
        self.find(FetchRequest::new(entity).filter(Predicate::eq(field, value)))
    }

    pub fn find_all_where(&self, entity: &str, predicate: Predicate) -> Option<Vec<Entity>> {
        self.find(FetchRequest::new(entity).filter(predicate))
    }

    pub fn find_all_sorted(
        &self,
        entity: &str,
        predicate: Option<Predicate>,
        sort: Vec<SortKey>,
    ) -> Option<Vec<Entity>> {
        self.find(build_query(entity, predicate, Some(sort)))
    }

    fn find_one(&self, request: FetchRequest) -> Option<Entity> {
        self.find(request.limit(1))?.into_iter().next()
    }

    /// `None` for an empty result and for a failed fetch; failures are logged
    fn find(&self, request: FetchRequest) -> Option<Vec<Entity>> {
        let entity = request.entity.clone();
        match self.fetch(request) {
            Ok(found) if found.is_empty() => None,
            Ok(found) => Some(found),
            Err(e) => {
                error!(entity = %entity, error = %e, "fetch failed");
                None
            }
        }
    }
}

fn run_and_commit<W>(context: &Context, work: W) -> bool
where
    W: FnOnce(&Context) -> Result<()>,
{
    if let Err(e) = work(context) {
        warn!(context = %context.id(), error = %e, "unit of work failed, nothing committed");
        return false;
    }
    context.commit_cascading().is_ok()
}

fn commit_async<W, C>(context: Context, work: W, completion: Completion<C>)
where
    W: FnOnce(&Context) -> Result<()> + Send + 'static,
    C: FnOnce(bool) + Send + 'static,
{
    let scheduled = context.perform_async(move |ctx| completion.finish(run_and_commit(ctx, work)));
    if let Err(e) = scheduled {
        error!(error = %e, "save could not be scheduled");
    }
}

fn hop<F>(queue: &Queue, job: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Err(e) = queue.dispatch(job) {
        error!(queue = %queue.label(), error = %e, "could not hand work to queue");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextKind, ContextPhase};
    use crate::model::{EntityDescription, FieldType};
    use crossbeam::channel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn library() -> Model {
        Model::new("Library", 1)
            .entity(
                EntityDescription::new("Book")
                    .field("isbn", FieldType::Text)
                    .field("title", FieldType::Text)
                    .optional_field("pages", FieldType::Integer),
            )
            .entity(
                EntityDescription::new("Pair")
                    .field("left", FieldType::Integer)
                    .field("right", FieldType::Integer),
            )
    }

    fn book(isbn: &str, title: &str) -> Entity {
        Entity::new("Book").with("isbn", isbn).with("title", title)
    }

    fn save_book(stack: &DataStorage, entity: Entity) -> bool {
        let (tx, rx) = channel::bounded(1);
        stack.save_and_wait(move |ctx| ctx.insert(entity), move |ok| tx.send(ok).unwrap());
        rx.recv_timeout(WAIT).unwrap()
    }

    #[test]
    fn test_save_then_find_round_trip() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        let dune = book("978-0441013593", "Dune").with("pages", 412);
        assert!(save_book(&stack, dune.clone()));

        let found = stack.find_object("Book", "isbn", "978-0441013593").unwrap();
        assert_eq!(found, dune);
        assert_eq!(stack.find_all_by("Book", "pages", 412).unwrap().len(), 1);
    }

    #[test]
    fn test_successful_save_leaves_every_level_clean() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        assert!(save_book(&stack, book("1", "Emma")));

        for ctx in [stack.main_context(), stack.root_context()] {
            assert!(!ctx.has_pending_changes());
            assert_eq!(ctx.phase(), ContextPhase::Clean);
        }
        assert_eq!(stack.stats().unwrap().entities[0], ("Book".to_string(), 1));
    }

    #[test]
    fn test_second_cascade_is_a_noop() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        assert!(save_book(&stack, book("1", "Emma")));

        stack.main_context().commit_cascading().unwrap();
        stack.main_context().commit_cascading().unwrap();
        assert_eq!(stack.find_all("Book").unwrap().len(), 1);
    }

    #[test]
    fn test_missing_record_is_none() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        assert!(stack.find_object("Book", "isbn", "nope").is_none());
        assert!(stack.find_first("Book").is_none());
        assert!(stack.find_all("Book").is_none());
    }

    #[test]
    fn test_failed_fetch_is_none_but_typed_fetch_errors() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        assert!(save_book(&stack, book("1", "Emma")));

        assert!(stack.find_all("Shelf").is_none());
        assert!(stack.find_object("Book", "colour", "red").is_none());
        assert!(matches!(
            stack.fetch(FetchRequest::new("Shelf")),
            Err(Error::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_find_all_sorted_and_where() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        for (isbn, title, pages) in [("1", "b", 20), ("2", "a", 30), ("3", "c", 10)] {
            assert!(save_book(&stack, book(isbn, title).with("pages", pages)));
        }

        let sorted = stack
            .find_all_sorted("Book", None, vec![SortKey::desc("pages")])
            .unwrap();
        let titles: Vec<_> = sorted.iter().filter_map(|b| b.get_str("title")).collect();
        assert_eq!(titles, vec!["a", "b", "c"]);

        let predicate = Predicate::parse("pages >= 20 AND title LIKE 'B%'").unwrap();
        let found = stack.find_all_where("Book", predicate.clone()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(stack.find_object_where("Book", predicate).unwrap().get_str("isbn"), Some("1"));
    }

    #[test]
    fn test_concurrent_saves_both_land() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        let (tx, rx) = channel::unbounded();

        let handles: Vec<_> = ["1", "2"]
            .into_iter()
            .map(|isbn| {
                let stack = stack.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    let entity = book(isbn, "Concurrent");
                    stack.save(move |ctx| ctx.insert(entity), move |ok| tx.send(ok).unwrap());
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(rx.recv_timeout(WAIT).unwrap());
        assert!(rx.recv_timeout(WAIT).unwrap());
        assert_eq!(stack.find_all_by("Book", "title", "Concurrent").unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_reader_never_sees_torn_record() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        let pair = Entity::new("Pair").with("left", 0).with("right", 0);
        let id = pair.id;
        assert!(save_book(&stack, pair));

        let reader_stack = stack.clone();
        let reader = thread::spawn(move || {
            for _ in 0..200 {
                let found = reader_stack.find_all("Pair").unwrap();
                assert_eq!(found.len(), 1);
                assert_eq!(found[0].get("left"), found[0].get("right"));
            }
        });

        for i in 1..=100i64 {
            let pair = Entity::with_id(id, "Pair").with("left", i).with("right", i);
            assert!(save_book(&stack, pair));
        }
        reader.join().unwrap();

        let last = stack.find_first("Pair").unwrap();
        assert_eq!(last.get_i64("left"), Some(100));
    }

    #[test]
    fn test_failing_work_commits_nothing() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        let (tx, rx) = channel::bounded(1);
        stack.save_and_wait(
            |ctx| {
                ctx.insert(book("1", "Emma"))?;
                Err(Error::Validation("changed my mind".to_string()))
            },
            move |ok| tx.send(ok).unwrap(),
        );
        assert!(!rx.recv_timeout(WAIT).unwrap());
        assert!(stack.find_all("Book").is_none());
    }

    #[test]
    fn test_completion_called_once_when_work_panics() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel::bounded(1);

        let counter = Arc::clone(&calls);
        stack.save(
            |_| panic!("work exploded"),
            move |ok| {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(ok).unwrap();
            },
        );

        assert!(!rx.recv_timeout(WAIT).unwrap());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_save_on_hops_to_queue() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        let queue = Queue::dedicated("test-caller").unwrap();
        let (tx, rx) = channel::bounded(1);

        stack.save_and_wait_on(
            &queue,
            |ctx| ctx.insert(book("1", "Emma")),
            move |ok| tx.send(ok).unwrap(),
        );
        assert!(rx.recv_timeout(WAIT).unwrap());

        let (tx, rx) = channel::bounded(1);
        stack.save_on(
            &queue,
            |ctx| ctx.insert(book("2", "Dune")),
            move |ok| tx.send(ok).unwrap(),
        );
        assert!(rx.recv_timeout(WAIT).unwrap());
        assert_eq!(stack.find_all("Book").unwrap().len(), 2);
    }

    #[test]
    fn test_main_queue_uses_main_context() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        let emma = book("1", "Emma");
        assert!(save_book(&stack, emma.clone()));

        let (kind_tx, kind_rx) = channel::bounded(2);
        let (done_tx, done_rx) = channel::bounded(1);
        let on_main = stack.clone();
        stack
            .main_queue()
            .dispatch(move || {
                let read_kind = on_main.read(|ctx| ctx.kind()).unwrap();
                kind_tx.send(read_kind).unwrap();
                on_main.remove(
                    move |ctx| {
                        kind_tx.send(ctx.kind()).unwrap();
                        ctx.delete(&emma)
                    },
                    move |ok| done_tx.send(ok).unwrap(),
                );
            })
            .unwrap();

        assert_eq!(kind_rx.recv_timeout(WAIT).unwrap(), ContextKind::Main);
        assert_eq!(kind_rx.recv_timeout(WAIT).unwrap(), ContextKind::Main);
        assert!(done_rx.recv_timeout(WAIT).unwrap());
        assert!(stack.find_all("Book").is_none());
        assert_eq!(stack.read(|ctx| ctx.kind()).unwrap(), ContextKind::Read);
    }

    #[test]
    fn test_remove_off_main_queue() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        let emma = book("1", "Emma");
        assert!(save_book(&stack, emma.clone()));

        let (tx, rx) = channel::bounded(1);
        stack.remove(move |ctx| ctx.delete(&emma), move |ok| tx.send(ok).unwrap());
        assert!(rx.recv_timeout(WAIT).unwrap());
        assert!(stack.find_object("Book", "isbn", "1").is_none());
    }

    #[test]
    fn test_save_and_wait_from_main_queue() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        let on_main = stack.clone();
        let ok = stack
            .main_context()
            .perform_sync(move |_| save_book(&on_main, book("1", "Emma")))
            .unwrap();
        assert!(ok);
        assert!(stack.find_object("Book", "isbn", "1").is_some());
    }

    #[test]
    fn test_main_level_failure_leaves_root_clean_until_retry() {
        let stack = DataStorage::open_in_memory(library()).unwrap();

        // Lacks the required title; only rejected once main saves
        let broken = Entity::new("Book").with("isbn", "0");
        let repaired = broken.clone().with("title", "Untitled");
        stack
            .main_context()
            .perform_sync(move |ctx| ctx.insert(broken))
            .unwrap()
            .unwrap();

        assert!(!save_book(&stack, book("1", "Emma")));
        assert!(stack.main_context().has_pending_changes());
        assert_eq!(stack.main_context().phase(), ContextPhase::Dirty);
        assert!(!stack.root_context().has_pending_changes());
        assert_eq!(stack.stats().unwrap().entities[0].1, 0);

        let failure = stack.main_context().commit_cascading().unwrap_err();
        assert_eq!(failure.kind, ContextKind::Main);
        assert_eq!(failure.level, 0);

        stack
            .main_context()
            .perform_sync(move |ctx| ctx.insert(repaired))
            .unwrap()
            .unwrap();
        stack.main_context().commit_cascading().unwrap();
        assert!(!stack.main_context().has_pending_changes());
        assert_eq!(stack.find_all("Book").unwrap().len(), 2);
    }

    #[test]
    fn test_ephemeral_contexts_are_released() {
        let stack = DataStorage::open_in_memory(library()).unwrap();
        assert_eq!(stack.live_contexts(), 2);
        assert!(save_book(&stack, book("1", "Emma")));
        assert!(stack.find_all("Book").is_some());
        assert_eq!(stack.live_contexts(), 2);
    }

    #[test]
    fn test_incompatible_model_recreates_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.sqlite");

        let stack = DataStorage::open(&path, library()).unwrap();
        assert!(stack.migration_report().is_none());
        assert!(save_book(&stack, book("1", "Emma")));
        drop(stack);

        let v2 = Model::new("Library", 2).entity(
            EntityDescription::new("Book")
                .field("isbn", FieldType::Integer)
                .field("title", FieldType::Text),
        );
        let stack = DataStorage::open(&path, v2).unwrap();
        let report = stack.migration_report().unwrap();
        assert_eq!(report.path, path);
        assert!(stack.find_all("Book").is_none());
    }

    #[test]
    fn test_additive_model_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.sqlite");

        let stack = DataStorage::open(&path, library()).unwrap();
        assert!(save_book(&stack, book("1", "Emma")));
        drop(stack);

        let v2 = library()
            .entity(EntityDescription::new("Author").field("name", FieldType::Text));
        let v2 = Model { version: 2, ..v2 };
        let stack = DataStorage::open(&path, v2).unwrap();
        assert!(stack.migration_report().is_none());
        assert_eq!(stack.find_first("Book").unwrap().get_str("title"), Some("Emma"));
    }
}
