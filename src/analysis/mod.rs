//! Leak analysis over a heap snapshot
//!
//! Given a snapshot and the key of a watched reference, the analyzer locates
//! the leaking instance, finds the shortest strong reference chain from the
//! GC roots to it and turns that chain into an annotated [`LeakTrace`].

mod builder;
pub mod exclusions;
mod path_finder;
pub mod reachability;
mod retained_size;
mod trace;

pub use builder::{is_anonymous_class, LeakTraceBuilder};
pub use exclusions::{ExclusionError, ExclusionMatch, ExclusionMatcher, ExclusionRule, ExclusionTable};
pub use path_finder::{LeakNode, LeakNodeId, PathResult, ShortestPathFinder, ROOT_SENTINEL};
pub use reachability::{Reachability, ReachabilityClassifier, ReachabilityInspector};
pub use retained_size::{is_ignored_dominator, IgnoredDominators};
pub use trace::{Holder, LeakReference, LeakTrace, LeakTraceElement, ReferenceKind};

use crate::config::Config;
use crate::snapshot::{self, ObjectId, Snapshot, SnapshotError, Value};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Class of the weak references the watcher creates
pub const DEFAULT_REFERENCE_CLASS: &str = "leaktrace.KeyedWeakReference";

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("heap dump {} is not available: {reason}", path.display())]
    CaptureUnavailable { path: PathBuf, reason: String },

    #[error("heap dump could not be decoded: {0}")]
    MalformedSnapshot(String),

    #[error("could not find the {class} class in the heap dump")]
    WatchedTypeNotFound { class: String },

    #[error("could not find weak reference with key {key} in {keys_found:?}")]
    KeyNotFound {
        key: String,
        keys_found: Vec<Option<String>>,
    },

    #[error("instance watched with key {key} was collected before the heap dump")]
    FalseAlarm { key: String },

    #[error("no path from any GC root to {object:#x}")]
    Unreachable { object: ObjectId },
}

impl AnalysisError {
    /// Fatal errors point at a mismatch between the watcher and the dump, or
    /// a broken graph; the others are expected outcomes of a race.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AnalysisError::CaptureUnavailable { .. } | AnalysisError::FalseAlarm { .. }
        )
    }
}

impl From<SnapshotError> for AnalysisError {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::Io { path, source } => AnalysisError::CaptureUnavailable {
                path: PathBuf::from(path),
                reason: source.to_string(),
            },
            other => AnalysisError::MalformedSnapshot(other.to_string()),
        }
    }
}

/// Outcome of a successful analysis
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub leak_found: bool,
    /// The only path found goes through excluded references
    pub excluded_leak: bool,
    pub class_name: String,
    pub trace: LeakTrace,
    /// Retained size of the leaking instance
    pub retained_size: u64,
    /// Size held through native roots that only the leak keeps alive
    pub ignored_retained_size: u64,
    pub analysis_duration_ms: u64,
}

impl AnalysisResult {
    /// Everything the leaking instance keeps alive
    pub fn total_retained_size(&self) -> u64 {
        self.retained_size + self.ignored_retained_size
    }
}

/// Finds and describes the leak behind a watch key
pub struct HeapAnalyzer {
    reference_class: String,
    finder: ShortestPathFinder,
    builder: LeakTraceBuilder,
    ignored: IgnoredDominators,
}

impl Default for HeapAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapAnalyzer {
    /// Analyzer with the Android exclusions and inspectors
    pub fn new() -> Self {
        Self {
            reference_class: DEFAULT_REFERENCE_CLASS.to_string(),
            finder: ShortestPathFinder::new(ExclusionTable::android_defaults()),
            builder: LeakTraceBuilder::new().with_classifier(ReachabilityClassifier::android_defaults()),
            ignored: IgnoredDominators::default(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, crate::config::ConfigError> {
        let analysis = &config.analysis;
        let exclusions = config.exclusion_table()?;
        Ok(Self::new()
            .with_reference_class(&analysis.reference_class)
            .with_finder(ShortestPathFinder::new(exclusions).with_ignore_strings(analysis.ignore_strings))
            .with_builder(
                LeakTraceBuilder::new()
                    .with_classifier(ReachabilityClassifier::android_defaults())
                    .with_anonymous_interfaces(analysis.anonymous_interfaces.clone()),
            )
            .with_ignored_dominators(
                IgnoredDominators::new(&analysis.ignored_class, &analysis.buffer_field)
                    .with_parallel(analysis.parallel),
            ))
    }

    pub fn with_reference_class(mut self, class_name: &str) -> Self {
        self.reference_class = class_name.to_string();
        self
    }

    pub fn with_finder(mut self, finder: ShortestPathFinder) -> Self {
        self.finder = finder;
        self
    }

    pub fn with_builder(mut self, builder: LeakTraceBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_ignored_dominators(mut self, ignored: IgnoredDominators) -> Self {
        self.ignored = ignored;
        self
    }

    pub fn exclusions(&self) -> &ExclusionTable {
        self.finder.exclusions()
    }

    /// Load a snapshot file and analyze it
    pub fn analyze(&self, path: &Path, key: &str) -> Result<AnalysisResult, AnalysisError> {
        info!("Loading heap dump {}", path.display());
        let mut snapshot = Snapshot::from_file(path)?;
        self.analyze_snapshot(&mut snapshot, key)
    }

    /// Analyze an in-memory snapshot. Roots are deduplicated and missing
    /// dominator data is derived in place.
    pub fn analyze_snapshot(&self, snapshot: &mut Snapshot, key: &str) -> Result<AnalysisResult, AnalysisError> {
        let start = Instant::now();

        snapshot::deduplicate_gc_roots(snapshot);
        snapshot::dominators::compute(snapshot);

        let reference = self.find_leaking_reference(snapshot, key)?;
        let leaking = match snapshot.get_instance(reference).and_then(|r| r.field("referent")) {
            Some(Value::Object(id)) if snapshot.contains(id) => id,
            _ => {
                info!("Reference {} was cleared before the dump", key);
                return Err(AnalysisError::FalseAlarm { key: key.to_string() });
            }
        };
        debug!("Leaking instance {:#x} held by reference {:#x}", leaking, reference);

        let path = self.finder.find_path(snapshot, leaking)?;
        let trace = self.builder.build_trace(snapshot, &path);

        let class_name = snapshot.class_name_of(leaking).unwrap_or("<unknown>").to_string();
        let retained_size = snapshot
            .get_instance(leaking)
            .map(|i| i.total_retained_size())
            .unwrap_or(0);
        let ignored_retained_size = self.ignored.ignored_retained_size(snapshot, leaking);

        let elapsed = start.elapsed();
        if path.excluding_known_leaks {
            warn!("{} is only retained through excluded references", class_name);
        }
        info!("Analysis of {} finished in {:?}", key, elapsed);

        Ok(AnalysisResult {
            leak_found: !path.excluding_known_leaks,
            excluded_leak: path.excluding_known_leaks,
            class_name,
            trace,
            retained_size,
            ignored_retained_size,
            analysis_duration_ms: elapsed.as_millis() as u64,
        })
    }

    /// The reference instance carrying `key`
    fn find_leaking_reference(&self, snapshot: &Snapshot, key: &str) -> Result<ObjectId, AnalysisError> {
        let Some(class_id) = snapshot.find_class(&self.reference_class) else {
            return Err(AnalysisError::WatchedTypeNotFound {
                class: self.reference_class.clone(),
            });
        };

        let mut keys_found = Vec::new();
        for &id in snapshot.instances_of(class_id) {
            let candidate = snapshot
                .get_instance(id)
                .and_then(|i| i.field("key"))
                .and_then(|v| v.as_object())
                .and_then(|s| snapshot.string_value(s));
            if candidate == Some(key) {
                return Ok(id);
            }
            keys_found.push(candidate.map(str::to_string));
        }

        Err(AnalysisError::KeyNotFound {
            key: key.to_string(),
            keys_found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Field, GcRoot, RootType, SnapshotBuilder, OBJECT_CLASS, STRING_CLASS};

    /// static root -> A -> B -> T, and an unrooted keyed reference to T
    fn leaking_snapshot(referent: Field) -> Snapshot {
        let mut builder = SnapshotBuilder::new();
        builder
            .class(1, OBJECT_CLASS, None)
            .class(2, STRING_CLASS, Some(1))
            .class(3, "java.lang.ref.Reference", Some(1))
            .class(4, DEFAULT_REFERENCE_CLASS, Some(3))
            .class(5, "com.example.A", Some(1))
            .class(6, "com.example.B", Some(1))
            .class(7, "com.example.LeakyActivity", Some(1))
            .string(20, 2, "key-1")
            .object(30, 4, vec![Field::object("key", 20), referent])
            .object(40, 5, vec![Field::object("leaker", 41)])
            .object(41, 6, vec![Field::object("ref", 42)])
            .object(42, 7, vec![])
            .root(GcRoot::new(RootType::JavaStatic, 40))
            .root(GcRoot::new(RootType::JavaStatic, 40));
        builder.build().unwrap()
    }

    #[test]
    fn test_leak_trace_for_key() {
        let mut snapshot = leaking_snapshot(Field::object("referent", 42));
        let result = HeapAnalyzer::new().analyze_snapshot(&mut snapshot, "key-1").unwrap();

        assert!(result.leak_found);
        assert!(!result.excluded_leak);
        assert_eq!(result.class_name, "com.example.LeakyActivity");
        assert_eq!(result.trace.len(), 3);
        assert!(result.trace.elements.iter().all(|e| e.holder == Holder::Object));
        assert_eq!(
            result.trace.expected_reachability,
            vec![
                Reachability::Reachable,
                Reachability::Unknown,
                Reachability::Unreachable
            ]
        );
        // duplicate root was collapsed
        assert_eq!(snapshot.gc_roots().len(), 1);
    }

    #[test]
    fn test_cleared_referent_is_false_alarm() {
        let mut snapshot = leaking_snapshot(Field::null("referent"));
        let err = HeapAnalyzer::new()
            .analyze_snapshot(&mut snapshot, "key-1")
            .unwrap_err();
        assert!(matches!(err, AnalysisError::FalseAlarm { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_dangling_referent_is_false_alarm() {
        let mut snapshot = leaking_snapshot(Field::object("referent", 0xdead));
        let err = HeapAnalyzer::new()
            .analyze_snapshot(&mut snapshot, "key-1")
            .unwrap_err();
        assert!(matches!(err, AnalysisError::FalseAlarm { .. }));
    }

    #[test]
    fn test_unknown_key_lists_keys_found() {
        let mut snapshot = leaking_snapshot(Field::object("referent", 42));
        let err = HeapAnalyzer::new()
            .analyze_snapshot(&mut snapshot, "key-2")
            .unwrap_err();
        match &err {
            AnalysisError::KeyNotFound { key, keys_found } => {
                assert_eq!(key, "key-2");
                assert_eq!(keys_found, &vec![Some("key-1".to_string())]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_reference_class() {
        let mut snapshot = leaking_snapshot(Field::object("referent", 42));
        let err = HeapAnalyzer::new()
            .with_reference_class("com.other.WatchedReference")
            .analyze_snapshot(&mut snapshot, "key-1")
            .unwrap_err();
        assert!(matches!(err, AnalysisError::WatchedTypeNotFound { .. }));
        assert!(err.is_fatal());
    }
}
