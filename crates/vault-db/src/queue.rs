//! Atomic queues: one-at-a-time FIFO execution of async jobs.
//!
//! Jobs are drained by a background task. A failing (or panicking) job never
//! stops the drain; its outcome is logged and handed to the optional
//! observer instead of being propagated.
//!
//! [`ConditionalQueue`] additionally coalesces repeated jobs for the same id:
//! when the pending head already targets that id and more than one job is
//! waiting, the superseded pending jobs for the id are discarded and only the
//! latest one is kept.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Error type jobs may fail with.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), JobError>> + Send>;

/// How a queued job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Succeeded,
    Failed(String),
    /// Dropped before running because a newer job for the same id arrived.
    Superseded,
}

/// Result of one queued unit, delivered to the queue observer.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Acceptance order within the queue.
    pub seq: u64,
    pub id: Option<String>,
    pub status: JobStatus,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

pub type QueueObserver = Arc<dyn Fn(&JobOutcome) + Send + Sync>;

struct Entry {
    seq: u64,
    id: Option<String>,
    job: Job,
}

#[derive(Default)]
struct State {
    entries: VecDeque<Entry>,
    running: bool,
    next_seq: u64,
}

struct Inner {
    name: String,
    coalesce: bool,
    state: Mutex<State>,
    idle: watch::Sender<bool>,
    observer: RwLock<Option<QueueObserver>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn report(&self, outcome: JobOutcome) {
        let observer = self
            .observer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(observer) = observer {
            observer(&outcome);
        }
    }

    fn push(self: &Arc<Self>, id: Option<String>, job: Job) -> u64 {
        let mut superseded = Vec::new();
        let mut state = self.lock();

        if self.coalesce {
            if let Some(id) = id.as_deref() {
                let head_matches = state.entries.front().and_then(|e| e.id.as_deref()) == Some(id);
                if state.entries.len() > 1 && head_matches {
                    let mut kept = VecDeque::with_capacity(state.entries.len());
                    for entry in state.entries.drain(..) {
                        if entry.id.as_deref() == Some(id) {
                            superseded.push(entry.seq);
                        } else {
                            kept.push_back(entry);
                        }
                    }
                    state.entries = kept;
                }
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push_back(Entry {
            seq,
            id: id.clone(),
            job,
        });

        let start = !state.running;
        if start {
            state.running = true;
            self.idle.send_replace(false);
        }
        drop(state);

        for old in superseded {
            debug!("Queue {}: job {} superseded by {}", self.name, old, seq);
            self.report(JobOutcome {
                seq: old,
                id: id.clone(),
                status: JobStatus::Superseded,
            });
        }

        if start {
            tokio::spawn(drain(Arc::clone(self)));
        }
        seq
    }
}

async fn drain(inner: Arc<Inner>) {
    loop {
        let entry = {
            let mut state = inner.lock();
            match state.entries.pop_front() {
                Some(entry) => entry,
                None => {
                    state.running = false;
                    inner.idle.send_replace(true);
                    return;
                }
            }
        };

        let result = AssertUnwindSafe((entry.job)()).catch_unwind().await;
        let status = match result {
            Ok(Ok(())) => JobStatus::Succeeded,
            Ok(Err(e)) => {
                warn!("Queue {}: job {} failed: {}", inner.name, entry.seq, e);
                JobStatus::Failed(e.to_string())
            }
            Err(_) => {
                warn!("Queue {}: job {} panicked", inner.name, entry.seq);
                JobStatus::Failed("job panicked".to_string())
            }
        };

        inner.report(JobOutcome {
            seq: entry.seq,
            id: entry.id,
            status,
        });
    }
}

fn boxed<F, Fut>(f: F) -> Job
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

fn new_inner(name: String, coalesce: bool) -> Arc<Inner> {
    let (idle, _) = watch::channel(true);
    Arc::new(Inner {
        name,
        coalesce,
        state: Mutex::new(State::default()),
        idle,
        observer: RwLock::new(None),
    })
}

async fn wait_idle(inner: &Inner) {
    let mut rx = inner.idle.subscribe();
    // The sender lives as long as `inner`, so this only fails on shutdown.
    let _ = rx.wait_for(|idle| *idle).await;
}

/// Strict FIFO queue. Clones share the same queue.
#[derive(Clone)]
pub struct AtomicQueue {
    inner: Arc<Inner>,
}

impl AtomicQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: new_inner(name.into(), false),
        }
    }

    /// Install the observer that receives every job outcome.
    pub fn set_observer(&self, observer: QueueObserver) {
        *self.inner.observer.write().unwrap_or_else(|e| e.into_inner()) = Some(observer);
    }

    /// Enqueue a job. Returns its sequence number.
    pub fn execute<F, Fut>(&self, f: F) -> u64
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.inner.push(None, boxed(f))
    }

    /// Resolves once the queue is empty and no job is running.
    pub async fn await_queue_finish(&self) {
        wait_idle(&self.inner).await
    }

    /// Jobs waiting to run (the running job is not counted).
    pub fn pending(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_idle(&self) -> bool {
        *self.inner.idle.borrow()
    }
}

/// FIFO queue whose jobs carry an id; see the module docs for coalescing.
#[derive(Clone)]
pub struct ConditionalQueue {
    inner: Arc<Inner>,
}

impl ConditionalQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: new_inner(name.into(), true),
        }
    }

    pub fn set_observer(&self, observer: QueueObserver) {
        *self.inner.observer.write().unwrap_or_else(|e| e.into_inner()) = Some(observer);
    }

    pub fn execute<F, Fut>(&self, id: impl Into<String>, f: F) -> u64
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.inner.push(Some(id.into()), boxed(f))
    }

    pub async fn await_queue_finish(&self) {
        wait_idle(&self.inner).await
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

/// Lazily created per-vault queues, one family per scope name.
#[derive(Default)]
pub struct VaultQueues {
    queues: Mutex<HashMap<(String, String), AtomicQueue>>,
    observer: RwLock<Option<QueueObserver>>,
}

impl VaultQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer installed on every queue created from now on.
    pub fn set_observer(&self, observer: QueueObserver) {
        *self.observer.write().unwrap_or_else(|e| e.into_inner()) = Some(observer);
    }

    /// The queue for `scope` in `vault_id`, created on first use.
    pub fn get(&self, scope: &str, vault_id: &str) -> AtomicQueue {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry((scope.to_string(), vault_id.to_string()))
            .or_insert_with(|| {
                let queue = AtomicQueue::new(format!("{}:{}", scope, vault_id));
                if let Some(observer) = self
                    .observer
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                {
                    queue.set_observer(observer);
                }
                queue
            })
            .clone()
    }

    /// Wait until every queue of the vault has drained.
    pub async fn await_vault(&self, vault_id: &str) {
        let queues: Vec<AtomicQueue> = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|((_, vault), _)| vault == vault_id)
            .map(|(_, q)| q.clone())
            .collect();
        for queue in queues {
            queue.await_queue_finish().await;
        }
    }
}
