// Host collaborators of the retention watcher
//
// The watcher never talks to a collector, a UI loop or a capture facility
// directly. Each of those is a trait here, with an in-process implementation
// for Rust objects held in `Arc`s.

use super::reference::KeyedWeakReference;
use super::{HeapDump, WatchError, WatchKey};
use crate::config::WatchConfig;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Forces a full collection cycle
pub trait GcTrigger: Send + Sync {
    fn run_gc(&self);
}

/// Blocks until the host is idle enough to run a check
pub trait IdleGate: Send + Sync {
    fn await_idle(&self);
}

/// Hosts without an idle signal run checks as soon as they are due
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateIdle;

impl IdleGate for ImmediateIdle {
    fn await_idle(&self) {}
}

/// Captures the heap to a file
pub trait HeapDumper: Send + Sync {
    fn dump_heap(&self, key: &WatchKey) -> Result<PathBuf, WatchError>;
}

/// Receives confirmed leaks for out-of-band analysis
pub trait AnalysisDispatcher: Send + Sync {
    fn dispatch(&self, dump: HeapDump);
}

impl<F> AnalysisDispatcher for F
where
    F: Fn(HeapDump) + Send + Sync,
{
    fn dispatch(&self, dump: HeapDump) {
        self(dump)
    }
}

/// Accepts weak references and delivers them once their referent is gone
pub trait ReferenceRegistry: Send + Sync {
    fn register(&self, reference: KeyedWeakReference);
}

/// Collector stand-in for objects shared through `Arc`.
///
/// A referent is reclaimed when its last strong handle drops; `sweep`
/// notices that and delivers the reference to its queue.
#[derive(Debug, Default)]
pub struct ArcHeap {
    tracked: Mutex<Vec<KeyedWeakReference>>,
    forced_collections: AtomicUsize,
}

impl ArcHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every cleared reference. Returns how many were delivered.
    pub fn sweep(&self) -> usize {
        let mut tracked = self.tracked.lock();
        let before = tracked.len();
        tracked.retain(|reference| {
            if reference.is_cleared() {
                reference.enqueue();
                false
            } else {
                true
            }
        });
        before - tracked.len()
    }

    /// References whose referent is still alive
    pub fn tracked(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Number of `run_gc` calls so far
    pub fn forced_collections(&self) -> usize {
        self.forced_collections.load(Ordering::SeqCst)
    }
}

impl ReferenceRegistry for ArcHeap {
    fn register(&self, reference: KeyedWeakReference) {
        self.tracked.lock().push(reference);
    }
}

impl GcTrigger for ArcHeap {
    fn run_gc(&self) {
        self.forced_collections.fetch_add(1, Ordering::SeqCst);
        let delivered = self.sweep();
        debug!("Forced collection delivered {} references", delivered);
    }
}

/// Writes dumps into a directory, naming each `<uuid>_pending.hprof`.
///
/// The bytes come from the host capture callback, which receives the
/// destination path.
pub struct DirectoryHeapDumper<F> {
    directory: PathBuf,
    capture: F,
}

impl<F> DirectoryHeapDumper<F>
where
    F: Fn(&Path) -> std::io::Result<()> + Send + Sync,
{
    pub fn new(directory: impl Into<PathBuf>, capture: F) -> Self {
        Self {
            directory: directory.into(),
            capture,
        }
    }

    /// Dumper writing into the configured dump directory
    pub fn from_config(config: &WatchConfig, capture: F) -> Self {
        Self::new(config.dump_directory(), capture)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl<F> HeapDumper for DirectoryHeapDumper<F>
where
    F: Fn(&Path) -> std::io::Result<()> + Send + Sync,
{
    fn dump_heap(&self, key: &WatchKey) -> Result<PathBuf, WatchError> {
        let path = self
            .directory
            .join(format!("{}_pending.hprof", uuid::Uuid::new_v4()));

        std::fs::create_dir_all(&self.directory).map_err(|source| WatchError::Dump {
            path: path.clone(),
            source,
        })?;
        (self.capture)(&path).map_err(|source| WatchError::Dump {
            path: path.clone(),
            source,
        })?;

        debug!("Dumped heap for {} to {}", key, path.display());
        Ok(path)
    }
}
