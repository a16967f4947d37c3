//! Watch keys, keyed weak references and the queues they are delivered to

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Unique identity of one watch request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchKey(uuid::Uuid);

impl WatchKey {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something that may or may not have been reclaimed yet
pub trait Referent: Send + Sync {
    fn is_cleared(&self) -> bool;
}

impl<T: Send + Sync> Referent for Weak<T> {
    fn is_cleared(&self) -> bool {
        self.strong_count() == 0
    }
}

/// Keys delivered by the host once their referent is gone
#[derive(Debug, Default)]
pub struct ReferenceQueue {
    keys: Mutex<VecDeque<WatchKey>>,
}

impl ReferenceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, key: WatchKey) {
        self.keys.lock().push_back(key);
    }

    pub fn poll(&self) -> Option<WatchKey> {
        self.keys.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

/// Keys whose referent has not been reported as reclaimed
#[derive(Debug, Default)]
pub struct RetainedKeySet {
    keys: Mutex<HashSet<WatchKey>>,
}

impl RetainedKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the key was already present
    pub fn insert(&self, key: WatchKey) -> bool {
        self.keys.lock().insert(key)
    }

    pub fn remove(&self, key: &WatchKey) -> bool {
        self.keys.lock().remove(key)
    }

    pub fn contains(&self, key: &WatchKey) -> bool {
        self.keys.lock().contains(key)
    }

    pub fn snapshot(&self) -> Vec<WatchKey> {
        self.keys.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }

    /// Remove every key the queue has delivered so far
    pub fn drain_from(&self, queue: &ReferenceQueue) -> usize {
        let mut removed = 0;
        while let Some(key) = queue.poll() {
            if self.remove(&key) {
                removed += 1;
            }
        }
        removed
    }
}

/// A non-owning handle on a watched object, tagged with its watch key.
///
/// Clones share the referent; none of them keeps it alive.
#[derive(Clone)]
pub struct KeyedWeakReference {
    key: WatchKey,
    name: String,
    watch_start: Instant,
    referent: Arc<dyn Referent>,
    queue: Arc<ReferenceQueue>,
}

impl KeyedWeakReference {
    pub fn new<T: Send + Sync + 'static>(
        target: &Arc<T>,
        key: WatchKey,
        name: &str,
        queue: Arc<ReferenceQueue>,
    ) -> Self {
        Self {
            key,
            name: name.to_string(),
            watch_start: Instant::now(),
            referent: Arc::new(Arc::downgrade(target)),
            queue,
        }
    }

    pub fn key(&self) -> WatchKey {
        self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cleared(&self) -> bool {
        self.referent.is_cleared()
    }

    pub fn watch_duration(&self) -> Duration {
        self.watch_start.elapsed()
    }

    /// Deliver the key to its queue; called by the host once the referent is gone
    pub fn enqueue(&self) {
        self.queue.enqueue(self.key);
    }
}

impl fmt::Debug for KeyedWeakReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedWeakReference")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("cleared", &self.is_cleared())
            .finish()
    }
}
