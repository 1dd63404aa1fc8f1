//! Serial queues - the execution affinity of a context
//!
//! Two kinds of queue exist:
//! - dedicated: one worker thread fed by a channel (root and main contexts)
//! - pooled: a strand of jobs drained by whichever pool thread picks it up
//!   (ephemeral contexts)
//!
//! Both run their jobs one at a time in submission order.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Identity of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(u64);

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

impl QueueId {
    fn next() -> Self {
        Self(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

thread_local! {
    /// Queues held by the running thread, innermost last. A thread holds a
    /// queue while it runs one of its jobs, including any nested sync calls.
    static HELD_QUEUES: RefCell<Vec<QueueId>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` while holding queue `id`, catching panics
fn run_as<R>(id: QueueId, f: impl FnOnce() -> R) -> thread::Result<R> {
    HELD_QUEUES.with(|held| held.borrow_mut().push(id));
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    HELD_QUEUES.with(|held| held.borrow_mut().pop());
    outcome
}

/// Background threads shared by all pooled queues
#[derive(Clone)]
pub struct WorkerPool {
    tx: Sender<Job>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self> {
        let (tx, rx) = channel::unbounded::<Job>();
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("datastack-pool-{}", i))
                .spawn(move || {
                    for job in rx {
                        job();
                    }
                })?;
        }
        Ok(Self { tx })
    }

    fn submit(&self, job: Job) -> bool {
        self.tx.send(job).is_ok()
    }
}

#[derive(Default)]
struct Strand {
    pending: VecDeque<Job>,
    running: bool,
}

enum Backend {
    Dedicated(Sender<Job>),
    Pooled { pool: WorkerPool, strand: Mutex<Strand> },
}

struct QueueInner {
    id: QueueId,
    label: String,
    backend: Backend,
}

/// Handle to a serial queue; clones refer to the same queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    /// Queue with its own worker thread. The thread exits once every handle
    /// is dropped and the remaining jobs have run.
    pub fn dedicated(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let id = QueueId::next();
        let (tx, rx) = channel::unbounded::<Job>();

        let thread_label = label.clone();
        thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                for job in rx {
                    if run_as(id, job).is_err() {
                        error!(queue = %thread_label, "unit of work panicked");
                    }
                }
                debug!(queue = %thread_label, "queue closed");
            })?;

        Ok(Self {
            inner: Arc::new(QueueInner {
                id,
                label,
                backend: Backend::Dedicated(tx),
            }),
        })
    }

    /// Queue whose jobs run on `pool`
    pub fn pooled(label: impl Into<String>, pool: &WorkerPool) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                id: QueueId::next(),
                label: label.into(),
                backend: Backend::Pooled {
                    pool: pool.clone(),
                    strand: Mutex::new(Strand::default()),
                },
            }),
        }
    }

    pub fn id(&self) -> QueueId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether the calling code runs on this queue, directly or from a
    /// nested sync call made by one of its jobs
    pub fn is_current(&self) -> bool {
        HELD_QUEUES.with(|held| held.borrow().contains(&self.inner.id))
    }

    /// Schedule `job` without waiting for it
    pub fn dispatch<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.inner.backend {
            Backend::Dedicated(tx) => tx
                .send(Box::new(job))
                .map_err(|_| Error::QueueClosed(self.inner.label.clone())),
            Backend::Pooled { strand, .. } => {
                let start = {
                    let mut strand = strand.lock();
                    strand.pending.push_back(Box::new(job));
                    !std::mem::replace(&mut strand.running, true)
                };
                if start {
                    self.inner.schedule_drain()?;
                }
                Ok(())
            }
        }
    }

    /// Run `job` on this queue and wait for its result.
    ///
    /// Runs inline when the calling thread already holds this queue, through
    /// any depth of nested sync calls made on that thread. On an idle pooled
    /// queue the job runs on the caller's thread while holding the strand.
    /// Otherwise it runs on another thread, and a job there that syncs back
    /// onto a queue blocked waiting for it deadlocks; contexts only sync
    /// toward their parents.
    /// A panic in `job` is re-raised in the caller.
    pub fn dispatch_sync<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(job());
        }

        if let Backend::Pooled { strand, .. } = &self.inner.backend {
            let claimed = {
                let mut strand = strand.lock();
                if !strand.running && strand.pending.is_empty() {
                    strand.running = true;
                    true
                } else {
                    false
                }
            };
            if claimed {
                let outcome = run_as(self.inner.id, job);
                self.inner.release_strand();
                return match outcome {
                    Ok(result) => Ok(result),
                    Err(payload) => panic::resume_unwind(payload),
                };
            }
        }

        let (tx, rx) = channel::bounded(1);
        self.dispatch(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(job));
            let _ = tx.send(outcome);
        })?;

        match rx.recv() {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(Error::QueueClosed(self.inner.label.clone())),
        }
    }
}

impl QueueInner {
    fn schedule_drain(self: &Arc<Self>) -> Result<()> {
        let Backend::Pooled { pool, strand } = &self.backend else {
            return Ok(());
        };
        let queue = Arc::clone(self);
        if pool.submit(Box::new(move || queue.drain())) {
            Ok(())
        } else {
            strand.lock().running = false;
            Err(Error::QueueClosed(self.label.clone()))
        }
    }

    /// Run pending jobs until the strand is empty
    fn drain(self: Arc<Self>) {
        let Backend::Pooled { strand, .. } = &self.backend else {
            return;
        };
        loop {
            let job = {
                let mut strand = strand.lock();
                match strand.pending.pop_front() {
                    Some(job) => job,
                    None => {
                        strand.running = false;
                        return;
                    }
                }
            };
            if run_as(self.id, job).is_err() {
                error!(queue = %self.label, "unit of work panicked");
            }
        }
    }

    /// Give the strand back after an inline job; hand queued work to the pool
    fn release_strand(self: &Arc<Self>) {
        let Backend::Pooled { strand, .. } = &self.backend else {
            return;
        };
        let has_pending = {
            let mut strand = strand.lock();
            if strand.pending.is_empty() {
                strand.running = false;
            }
            !strand.pending.is_empty()
        };
        if has_pending {
            if let Err(e) = self.schedule_drain() {
                error!(queue = %self.label, error = %e, "could not resume queued work");
            }
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner.backend {
            Backend::Dedicated(_) => "dedicated",
            Backend::Pooled { .. } => "pooled",
        };
        f.debug_struct("Queue")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("kind", &kind)
            .finish()
    }
}
