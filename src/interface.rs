//! Delivery of output batches to listeners.
//!
//! Listeners are plain synchronous callbacks. Each statement owns one
//! [`Dispatcher`]: sending threads enqueue finished batches in flush order and
//! whichever thread finds the dispatcher idle drains the queue, so callbacks of
//! one statement never run concurrently and never out of order. Destroying a
//! statement waits for a running delivery to finish, after which no callback
//! of that statement fires again.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::thread::{self, ThreadId};

use tracing::trace;

use crate::context::PartitionId;
use crate::schema::Event;

/// Identifies a statement for the lifetime of its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementId(pub u64);

/// One flush of one statement in one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBatch {
    pub statement: StatementId,
    pub statement_name: String,
    pub context: Option<String>,
    pub partition: PartitionId,
    /// Set for the flush that ends a partition.
    pub terminal: bool,
    pub inserted: Vec<Event>,
    pub removed: Vec<Event>,
}

pub trait UpdateListener: Send + Sync {
    fn update(&self, batch: &OutputBatch);
}

impl<F> UpdateListener for F
where
    F: Fn(&OutputBatch) + Send + Sync,
{
    fn update(&self, batch: &OutputBatch) {
        self(batch)
    }
}

// listener panics must not wedge delivery for everyone else
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ------------- Provided listeners -------------
/// Keeps every batch it receives.
#[derive(Debug, Default)]
pub struct CollectingListener {
    batches: Mutex<Vec<OutputBatch>>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn batches(&self) -> Vec<OutputBatch> {
        lock(&self.batches).clone()
    }
    /// Removes and returns everything received so far.
    pub fn take(&self) -> Vec<OutputBatch> {
        std::mem::take(&mut *lock(&self.batches))
    }
    pub fn inserted_rows(&self) -> Vec<Event> {
        lock(&self.batches).iter().flat_map(|b| b.inserted.iter().cloned()).collect()
    }
    pub fn removed_rows(&self) -> Vec<Event> {
        lock(&self.batches).iter().flat_map(|b| b.removed.iter().cloned()).collect()
    }
    pub fn terminal_count(&self) -> usize {
        lock(&self.batches).iter().filter(|b| b.terminal).count()
    }
    pub fn len(&self) -> usize {
        lock(&self.batches).len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UpdateListener for CollectingListener {
    fn update(&self, batch: &OutputBatch) {
        lock(&self.batches).push(batch.clone());
    }
}

/// Forwards batches into a bounded channel. Delivery blocks while the
/// channel is full and stops quietly once the receiver is gone.
#[derive(Debug)]
pub struct ChannelListener {
    sender: SyncSender<OutputBatch>,
}

impl ChannelListener {
    pub fn bounded(capacity: usize) -> (Self, Receiver<OutputBatch>) {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        (Self { sender }, receiver)
    }
}

impl UpdateListener for ChannelListener {
    fn update(&self, batch: &OutputBatch) {
        let _ = self.sender.send(batch.clone());
    }
}

/// Cancellation token shared with a worker thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ------------- Dispatcher -------------
pub struct Dispatcher {
    statement: String,
    listeners: RwLock<Vec<Arc<dyn UpdateListener>>>,
    queue: Mutex<VecDeque<OutputBatch>>,
    delivering: Mutex<()>,
    deliverer: Mutex<Option<ThreadId>>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("statement", &self.statement)
            .field("queued", &lock(&self.queue).len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(statement: &str) -> Self {
        Self {
            statement: statement.to_string(),
            listeners: RwLock::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            delivering: Mutex::new(()),
            deliverer: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn UpdateListener>) {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner).push(listener);
    }

    pub fn remove_all_listeners(&self) {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Queues a batch behind every batch enqueued before it.
    pub fn enqueue(&self, batch: OutputBatch) {
        if self.is_destroyed() {
            return;
        }
        lock(&self.queue).push_back(batch);
    }

    /// Drains the queue unless another thread already is. That thread will
    /// see anything enqueued before it lets go.
    pub fn deliver(&self) {
        loop {
            let guard = match self.delivering.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            *lock(&self.deliverer) = Some(thread::current().id());
            while !self.is_destroyed() {
                let Some(batch) = lock(&self.queue).pop_front() else { break };
                let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner).clone();
                trace!(statement = %self.statement, rows = batch.inserted.len(), "delivering batch");
                for listener in listeners {
                    if self.is_destroyed() {
                        break;
                    }
                    listener.update(&batch);
                }
            }
            *lock(&self.deliverer) = None;
            drop(guard);
            if self.is_destroyed() || lock(&self.queue).is_empty() {
                return;
            }
        }
    }

    /// After this returns no listener of the statement is called again.
    /// Called from within one of its own callbacks it cannot wait for that
    /// callback, so it only stops the ones after it.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        let current = thread::current().id();
        if *lock(&self.deliverer) != Some(current) {
            let _wait = lock(&self.delivering);
        }
        lock(&self.queue).clear();
        self.remove_all_listeners();
    }
}
