//! Retention watcher tests against the in-process `ArcHeap` collector

use leaktrace::config::WatchConfig;
use leaktrace::watcher::{
    AnalysisDispatcher, ArcHeap, Collaborators, DirectoryHeapDumper, HeapDump, HeapDumper,
    IdleGate, RetentionWatcher,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const GRACE_MS: u64 = 50;

/// Dispatcher collecting every dump it receives
#[derive(Default)]
struct Collected {
    dumps: Mutex<Vec<HeapDump>>,
}

impl Collected {
    fn len(&self) -> usize {
        self.dumps.lock().len()
    }
}

impl AnalysisDispatcher for Collected {
    fn dispatch(&self, dump: HeapDump) {
        self.dumps.lock().push(dump);
    }
}

/// Records when checks were let through
#[derive(Default)]
struct RecordingIdle {
    calls: Mutex<Vec<Instant>>,
}

impl IdleGate for RecordingIdle {
    fn await_idle(&self) {
        self.calls.lock().push(Instant::now());
    }
}

struct Fixture {
    heap: Arc<ArcHeap>,
    dispatched: Arc<Collected>,
    watcher: RetentionWatcher,
    dir: TempDir,
}

fn fixture_with(idle: Option<Arc<dyn IdleGate>>) -> Fixture {
    let dir = TempDir::new().unwrap();
    let heap = Arc::new(ArcHeap::new());
    let dispatched = Arc::new(Collected::default());

    let dumper: Arc<dyn HeapDumper> = Arc::new(DirectoryHeapDumper::new(
        dir.path().join("dumps"),
        |path: &Path| std::fs::write(path, b"heap"),
    ));
    let mut collaborators = Collaborators::for_arc_heap(heap.clone(), dumper, dispatched.clone());
    if let Some(idle) = idle {
        collaborators = collaborators.with_idle_gate(idle);
    }

    let config = WatchConfig {
        grace_period_ms: GRACE_MS,
        ..WatchConfig::default()
    };
    let watcher = RetentionWatcher::new(&config, collaborators).unwrap();

    Fixture {
        heap,
        dispatched,
        watcher,
        dir,
    }
}

fn fixture() -> Fixture {
    fixture_with(None)
}

/// Poll until `done` holds or a generous deadline passes
fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn test_retained_object_is_dumped_once() {
    let f = fixture();
    let activity = Arc::new(String::from("MainActivity"));
    let key = f.watcher.watch(Some(&activity), "MainActivity").unwrap();
    assert!(f.watcher.is_retained(&key));

    assert!(wait_for(|| f.watcher.pending_checks() == 0));
    assert_eq!(f.dispatched.len(), 1);
    assert_eq!(f.heap.forced_collections(), 1);
    assert!(!f.watcher.is_retained(&key));

    let dumps = f.dispatched.dumps.lock();
    let dump = &dumps[0];
    assert_eq!(dump.key, key);
    assert_eq!(dump.reference_name, "MainActivity");
    assert!(dump.watch_duration >= Duration::from_millis(GRACE_MS));
    assert!(dump.path.starts_with(f.dir.path().join("dumps")));
    assert!(dump
        .path
        .to_string_lossy()
        .ends_with("_pending.hprof"));
    assert_eq!(std::fs::read(&dump.path).unwrap(), b"heap");

    drop(activity);
}

#[test]
fn test_object_reclaimed_before_check_is_not_collected_again() {
    let f = fixture();
    let activity = Arc::new(vec![0u8; 16]);
    let key = f.watcher.watch(Some(&activity), "buffer").unwrap();

    drop(activity);
    assert_eq!(f.heap.sweep(), 1);

    assert!(wait_for(|| f.watcher.pending_checks() == 0));
    assert!(!f.watcher.is_retained(&key));
    assert_eq!(f.heap.forced_collections(), 0);
    assert_eq!(f.dispatched.len(), 0);
}

#[test]
fn test_forced_collection_reclaims_dropped_object() {
    let f = fixture();
    let activity = Arc::new(42u64);
    let key = f.watcher.watch(Some(&activity), "answer").unwrap();

    // dropped but never swept: only the forced collection notices
    drop(activity);

    assert!(wait_for(|| f.watcher.pending_checks() == 0));
    assert!(!f.watcher.is_retained(&key));
    assert_eq!(f.heap.forced_collections(), 1);
    assert_eq!(f.dispatched.len(), 0);
}

#[test]
fn test_check_waits_for_grace_period_and_idle() {
    let idle = Arc::new(RecordingIdle::default());
    let f = fixture_with(Some(idle.clone()));

    let target = Arc::new(7i32);
    let watched_at = Instant::now();
    f.watcher.watch(Some(&target), "seven");

    assert!(wait_for(|| f.watcher.pending_checks() == 0));
    let calls = idle.calls.lock();
    assert_eq!(calls.len(), 1);
    assert!(calls[0] >= watched_at + Duration::from_millis(GRACE_MS));
}

#[test]
fn test_many_watches_are_checked_independently() {
    let f = fixture();
    let kept: Vec<_> = (0..3).map(|i| Arc::new(format!("kept-{i}"))).collect();
    let dropped: Vec<_> = (0..5).map(|i| Arc::new(format!("dropped-{i}"))).collect();

    let kept_keys: Vec<_> = kept
        .iter()
        .map(|t| f.watcher.watch(Some(t), t).unwrap())
        .collect();
    let dropped_keys: Vec<_> = dropped
        .iter()
        .map(|t| f.watcher.watch(Some(t), t).unwrap())
        .collect();
    assert_eq!(f.watcher.retained_keys().len(), 8);

    drop(dropped);
    f.heap.sweep();

    assert!(wait_for(|| f.watcher.pending_checks() == 0));
    assert_eq!(f.dispatched.len(), kept_keys.len());
    assert!(f.watcher.retained_keys().is_empty());

    let dumped: Vec<_> = f.dispatched.dumps.lock().iter().map(|d| d.key).collect();
    for key in &kept_keys {
        assert!(dumped.contains(key));
    }
    for key in &dropped_keys {
        assert!(!dumped.contains(key));
    }
    drop(kept);
}
