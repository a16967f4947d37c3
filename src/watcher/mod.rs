//! Retention watcher
//!
//! `watch` hands an object to the watcher at the point it is expected to
//! become unreachable. After a grace period, and once the host is idle, the
//! watcher checks whether the object was reclaimed. If it was not, it forces
//! one collection, checks again, and as a last resort dumps the heap and
//! hands the dump to the analysis dispatcher.

mod host;
mod reference;

pub use host::{
    AnalysisDispatcher, ArcHeap, DirectoryHeapDumper, GcTrigger, HeapDumper, IdleGate, ImmediateIdle,
    ReferenceRegistry,
};
pub use reference::{KeyedWeakReference, ReferenceQueue, Referent, RetainedKeySet, WatchKey};

use crate::config::WatchConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the background thread running retention checks
pub const WORKER_THREAD_NAME: &str = "watch_leak";

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to dump heap to {}: {source}", path.display())]
    Dump {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start the watch_leak thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A confirmed leak, ready for analysis
#[derive(Debug, Clone, Serialize)]
pub struct HeapDump {
    pub path: PathBuf,
    pub key: WatchKey,
    pub reference_name: String,
    /// Time between `watch` and the confirmation
    pub watch_duration: Duration,
}

/// Outcome of a retention check
#[derive(Debug, Clone)]
pub enum Retention {
    Collected,
    /// Still reachable after a forced collection; the dump was dispatched
    Retained(HeapDump),
    /// Still reachable, but the heap could not be dumped
    DumpFailed,
}

/// Host facilities the watcher relies on
pub struct Collaborators {
    pub registry: Arc<dyn ReferenceRegistry>,
    pub gc: Arc<dyn GcTrigger>,
    pub idle: Arc<dyn IdleGate>,
    pub dumper: Arc<dyn HeapDumper>,
    pub dispatcher: Arc<dyn AnalysisDispatcher>,
}

impl Collaborators {
    pub fn new(
        registry: Arc<dyn ReferenceRegistry>,
        gc: Arc<dyn GcTrigger>,
        dumper: Arc<dyn HeapDumper>,
        dispatcher: Arc<dyn AnalysisDispatcher>,
    ) -> Self {
        Self {
            registry,
            gc,
            idle: Arc::new(ImmediateIdle),
            dumper,
            dispatcher,
        }
    }

    /// Collaborators backed by an [`ArcHeap`], which is both registry and collector
    pub fn for_arc_heap(
        heap: Arc<ArcHeap>,
        dumper: Arc<dyn HeapDumper>,
        dispatcher: Arc<dyn AnalysisDispatcher>,
    ) -> Self {
        Self::new(heap.clone(), heap, dumper, dispatcher)
    }

    pub fn with_idle_gate(mut self, idle: Arc<dyn IdleGate>) -> Self {
        self.idle = idle;
        self
    }
}

/// A scheduled retention check
struct Check {
    due: Instant,
    reference: KeyedWeakReference,
}

impl PartialEq for Check {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for Check {}

impl PartialOrd for Check {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Check {
    // earliest due first out of the max-heap
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.due.cmp(&self.due)
    }
}

enum Message {
    Schedule(Check),
    Shutdown,
}

/// State shared between the watcher handle and its worker
struct Shared {
    retained: RetainedKeySet,
    queue: Arc<ReferenceQueue>,
    collaborators: Collaborators,
    pending: AtomicUsize,
    /// One retention check at a time
    check_lock: Mutex<()>,
}

impl Shared {
    fn remove_weakly_reachable(&self) {
        let removed = self.retained.drain_from(&self.queue);
        if removed > 0 {
            debug!("{} watched references were reclaimed", removed);
        }
    }

    fn is_gone(&self, key: &WatchKey) -> bool {
        !self.retained.contains(key)
    }

    fn ensure_gone(&self, reference: &KeyedWeakReference) -> Retention {
        let key = reference.key();
        let _check = self.check_lock.lock();

        self.remove_weakly_reachable();
        if self.is_gone(&key) {
            debug!("{} ({}) was reclaimed", reference.name(), key);
            return Retention::Collected;
        }

        self.collaborators.gc.run_gc();
        self.remove_weakly_reachable();
        if self.is_gone(&key) {
            debug!("{} ({}) was reclaimed after a forced collection", reference.name(), key);
            return Retention::Collected;
        }

        let path = match self.collaborators.dumper.dump_heap(&key) {
            Ok(path) => path,
            Err(e) => {
                warn!("Could not dump heap for {} ({}): {}", reference.name(), key, e);
                return Retention::DumpFailed;
            }
        };

        let dump = HeapDump {
            path,
            key,
            reference_name: reference.name().to_string(),
            watch_duration: reference.watch_duration(),
        };
        info!(
            "{} ({}) is still retained after {:?}, dumped to {}",
            dump.reference_name,
            key,
            dump.watch_duration,
            dump.path.display()
        );
        self.collaborators.dispatcher.dispatch(dump.clone());
        self.retained.remove(&key);
        Retention::Retained(dump)
    }
}

/// Watches objects that should soon be reclaimed
pub struct RetentionWatcher {
    shared: Arc<Shared>,
    grace_period: Duration,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RetentionWatcher {
    pub fn new(config: &WatchConfig, collaborators: Collaborators) -> Result<Self, WatchError> {
        let shared = Arc::new(Shared {
            retained: RetainedKeySet::new(),
            queue: Arc::new(ReferenceQueue::new()),
            collaborators,
            pending: AtomicUsize::new(0),
            check_lock: Mutex::new(()),
        });

        let (sender, receiver) = mpsc::channel();
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || run_worker(worker_shared, receiver))
            .map_err(WatchError::Spawn)?;

        let grace_period = config.grace_period();
        debug!("Retention watcher started, grace period {:?}", grace_period);

        Ok(Self {
            shared,
            grace_period,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Start watching `target`. A `None` target, or a watcher that was shut
    /// down, is ignored.
    pub fn watch<T: Send + Sync + 'static>(&self, target: Option<&Arc<T>>, name: &str) -> Option<WatchKey> {
        let target = target?;
        // held until the check is queued so shutdown cannot slip in between
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            warn!("Watcher is shut down, not watching {}", name);
            return None;
        };

        let key = WatchKey::generate();
        self.shared.retained.insert(key);

        let reference = KeyedWeakReference::new(target, key, name, self.shared.queue.clone());
        self.shared.collaborators.registry.register(reference.clone());

        let check = Check {
            due: Instant::now() + self.grace_period,
            reference,
        };
        // counted before the worker can see the check
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(Message::Schedule(check)).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            self.shared.retained.remove(&key);
            warn!("{} thread is gone, {} ({}) will not be checked", WORKER_THREAD_NAME, name, key);
            return None;
        }

        debug!("Watching {} ({})", name, key);
        Some(key)
    }

    /// Run a retention check now, on the calling thread. Waits for any
    /// check the worker is running.
    pub fn ensure_gone(&self, reference: &KeyedWeakReference) -> Retention {
        self.shared.ensure_gone(reference)
    }

    pub fn retained_keys(&self) -> Vec<WatchKey> {
        self.shared.retained.snapshot()
    }

    pub fn is_retained(&self, key: &WatchKey) -> bool {
        self.shared.retained.contains(key)
    }

    /// Checks scheduled but not yet run
    pub fn pending_checks(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Queue the host delivers reclaimed keys to
    pub fn reference_queue(&self) -> Arc<ReferenceQueue> {
        self.shared.queue.clone()
    }

    /// Stop the worker. Checks not yet due are dropped.
    pub fn shutdown(&self) {
        if let Some(sender) = self.sender.lock().take() {
            // the worker may already be gone
            let _ = sender.send(Message::Shutdown);
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("{} thread panicked", WORKER_THREAD_NAME);
            }
        }
    }
}

impl Drop for RetentionWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: Arc<Shared>, receiver: mpsc::Receiver<Message>) {
    let mut checks: BinaryHeap<Check> = BinaryHeap::new();

    loop {
        let message = match checks.peek() {
            Some(next) => receiver.recv_timeout(next.due.saturating_duration_since(Instant::now())),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match message {
            Ok(Message::Schedule(check)) => checks.push(check),
            Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        while checks.peek().is_some_and(|c| c.due <= Instant::now()) {
            let Some(check) = checks.pop() else {
                break;
            };
            shared.collaborators.idle.await_idle();
            shared.ensure_gone(&check.reference);
            shared.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    debug!("{} thread stopped with {} checks pending", WORKER_THREAD_NAME, checks.len());
}
