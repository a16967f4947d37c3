//! End-to-end analysis tests over snapshot fixtures

use leaktrace::analysis::{
    AnalysisError, ExclusionTable, HeapAnalyzer, Holder, Reachability, ReferenceKind,
    ShortestPathFinder,
};
use leaktrace::snapshot::{Field, GcRoot, RootType, Snapshot, SnapshotBuilder, Value};
use std::path::PathBuf;
use tempfile::TempDir;

const FIXTURE_KEY: &str = "5d2f1c3e-7a41-4c8e-9b0a-2f6d1e3c4b5a";

/// Get the path to the test fixtures directory
fn fixtures_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn fixture(name: &str) -> PathBuf {
    let path = fixtures_path().join(name);
    if !path.exists() {
        panic!("Fixture not found: {:?}", path);
    }
    path
}

// ============================================================================
// Fixture analysis
// ============================================================================

mod fixture_tests {
    use super::*;

    #[test]
    fn test_path_from_static_root() {
        let mut snapshot = Snapshot::from_file(&fixture("activity_leak.json")).unwrap();
        leaktrace::snapshot::deduplicate_gc_roots(&mut snapshot);

        let result = ShortestPathFinder::new(ExclusionTable::new())
            .find_path(&snapshot, 300)
            .unwrap();
        let path: Vec<_> = result.path().iter().map(|n| n.instance).collect();
        assert_eq!(path, vec![None, Some(200), Some(201), Some(300)]);
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn test_leak_trace() {
        let result = HeapAnalyzer::new()
            .analyze(&fixture("activity_leak.json"), FIXTURE_KEY)
            .unwrap();

        assert!(result.leak_found);
        assert!(!result.excluded_leak);
        assert_eq!(result.class_name, "com.example.MainActivity");

        let trace = &result.trace;
        assert_eq!(trace.len(), 3);
        assert!(trace.elements.iter().all(|e| e.holder == Holder::Object));
        assert_eq!(
            trace.expected_reachability,
            vec![
                Reachability::Reachable,
                Reachability::Unknown,
                Reachability::Unreachable
            ]
        );

        let names: Vec<_> = trace
            .elements
            .iter()
            .map(|e| e.reference.as_ref().and_then(|r| r.name.clone()))
            .collect();
        assert_eq!(
            names,
            vec![Some("leaker".to_string()), Some("ref".to_string()), None]
        );
        assert_eq!(
            trace.elements[0].reference.as_ref().unwrap().kind,
            ReferenceKind::InstanceField
        );
        assert_eq!(
            trace.elements[2].field_reference_value("mDestroyed"),
            Some("true")
        );
    }

    #[test]
    fn test_bitmap_behind_native_root_is_attributed() {
        let result = HeapAnalyzer::new()
            .analyze(&fixture("activity_leak.json"), FIXTURE_KEY)
            .unwrap();
        assert_eq!(result.retained_size, 200);
        assert_eq!(result.ignored_retained_size, 64 + 4096);
        assert_eq!(result.total_retained_size(), 200 + 64 + 4096);
    }

    #[test]
    fn test_trace_display() {
        let result = HeapAnalyzer::new()
            .analyze(&fixture("activity_leak.json"), FIXTURE_KEY)
            .unwrap();
        let text = result.trace.to_string();
        assert!(text.contains("* GC ROOT com.example.App.leaker [reachable]"));
        assert!(text.contains("* references com.example.Registry.ref [unknown]"));
        assert!(text.contains("* leaks com.example.MainActivity instance [unreachable]"));
    }

    #[test]
    fn test_result_serializes() {
        let result = HeapAnalyzer::new()
            .analyze(&fixture("activity_leak.json"), FIXTURE_KEY)
            .unwrap();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["leak_found"], true);
        assert_eq!(json["trace"]["elements"].as_array().unwrap().len(), 3);
        assert_eq!(json["trace"]["expected_reachability"][0], "REACHABLE");
    }
}

// ============================================================================
// Error outcomes
// ============================================================================

mod error_tests {
    use super::*;

    #[test]
    fn test_cleared_reference_is_false_alarm() {
        let err = HeapAnalyzer::new()
            .analyze(&fixture("cleared_reference.json"), FIXTURE_KEY)
            .unwrap_err();
        assert!(matches!(err, AnalysisError::FalseAlarm { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_missing_dump_is_capture_unavailable() {
        let dir = TempDir::new().unwrap();
        let err = HeapAnalyzer::new()
            .analyze(&dir.path().join("gone.json"), FIXTURE_KEY)
            .unwrap_err();
        assert!(matches!(err, AnalysisError::CaptureUnavailable { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_garbage_dump_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dump.json");
        std::fs::write(&path, "JAVA PROFILE 1.0.3\0").unwrap();
        let err = HeapAnalyzer::new().analyze(&path, FIXTURE_KEY).unwrap_err();
        assert!(matches!(err, AnalysisError::MalformedSnapshot(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_wrong_key_is_fatal() {
        let err = HeapAnalyzer::new()
            .analyze(&fixture("activity_leak.json"), "not-a-key")
            .unwrap_err();
        match &err {
            AnalysisError::KeyNotFound { keys_found, .. } => {
                assert_eq!(keys_found, &vec![Some(FIXTURE_KEY.to_string())]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unreachable_leak_is_fatal() {
        // the referent exists but nothing roots it
        let mut builder = SnapshotBuilder::new();
        builder
            .class(1, "java.lang.Object", None)
            .class(2, "java.lang.String", Some(1))
            .class(3, "leaktrace.KeyedWeakReference", Some(1))
            .string(10, 2, "k")
            .object(
                11,
                3,
                vec![Field::object("key", 10), Field::object("referent", 20)],
            )
            .object(20, 1, vec![]);
        let mut snapshot = builder.build().unwrap();

        let err = HeapAnalyzer::new()
            .analyze_snapshot(&mut snapshot, "k")
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Unreachable { object: 20 }));
        assert!(err.is_fatal());
    }
}

// ============================================================================
// Exclusions
// ============================================================================

mod exclusion_tests {
    use super::*;

    /// Activity held only through a platform text cache
    fn platform_leak() -> Snapshot {
        let mut builder = SnapshotBuilder::new();
        builder
            .class(1, "java.lang.Object", None)
            .class(2, "java.lang.String", Some(1))
            .class(3, "leaktrace.KeyedWeakReference", Some(1))
            .class_with_statics(
                4,
                "android.text.TextLine",
                Some(1),
                vec![Field::object("sCached", 30)],
            )
            .class(5, "java.lang.Object[]", Some(1))
            .class(6, "android.app.Activity", Some(1))
            .string(10, 2, "k")
            .object(
                11,
                3,
                vec![Field::object("key", 10), Field::object("referent", 40)],
            )
            .object_array(30, 5, vec![Value::Object(40), Value::Null])
            .object(40, 6, vec![Field::new("mDestroyed", Value::Boolean(true))])
            .root(GcRoot::new(RootType::SystemClass, 4));
        builder.build().unwrap()
    }

    #[test]
    fn test_only_excluded_path_is_flagged() {
        let mut snapshot = platform_leak();
        let result = HeapAnalyzer::new()
            .analyze_snapshot(&mut snapshot, "k")
            .unwrap();
        assert!(!result.leak_found);
        assert!(result.excluded_leak);

        let root = &result.trace.elements[0];
        assert_eq!(root.holder, Holder::Class);
        let exclusion = root.exclusion.as_ref().unwrap();
        assert!(exclusion.reason.contains("TextLine"));
    }

    #[test]
    fn test_native_root_leak_explains_itself() {
        let mut builder = SnapshotBuilder::new();
        builder
            .class(1, "java.lang.Object", None)
            .class(2, "java.lang.String", Some(1))
            .class(3, "leaktrace.KeyedWeakReference", Some(1))
            .class(4, "com.example.Holder", Some(1))
            .class(5, "com.example.LeakyActivity", Some(1))
            .string(10, 2, "k")
            .object(
                11,
                3,
                vec![Field::object("key", 10), Field::object("referent", 40)],
            )
            .object(30, 4, vec![Field::object("activity", 40)])
            .object(40, 5, vec![])
            .root(GcRoot::new(RootType::Unknown, 30));
        let mut snapshot = builder.build().unwrap();

        let result = HeapAnalyzer::new()
            .analyze_snapshot(&mut snapshot, "k")
            .unwrap();
        assert!(!result.leak_found);
        assert!(result.excluded_leak);

        let holder = &result.trace.elements[0];
        assert_eq!(holder.class_name(), "com.example.Holder");
        assert!(holder.exclusion.is_some());
        assert!(result.trace.to_string().contains("matching exclusion unknown root"));
    }

    #[test]
    fn test_without_rules_the_same_path_is_a_leak() {
        let mut snapshot = platform_leak();
        let result = HeapAnalyzer::new()
            .with_finder(ShortestPathFinder::new(ExclusionTable::new()))
            .analyze_snapshot(&mut snapshot, "k")
            .unwrap();
        assert!(result.leak_found);
        assert_eq!(result.trace.len(), 3);
        assert_eq!(result.trace.elements[1].holder, Holder::Array);
    }
}
