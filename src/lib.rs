//! leaktrace - Memory leak detection for managed heaps
//!
//! The crate has two halves connected by a heap dump:
//!
//! 1. **Watching** - [`RetentionWatcher`] holds weak references to objects
//!    that should soon be reclaimed and, if one survives a grace period and a
//!    forced collection, dumps the heap and hands the dump off for analysis.
//! 2. **Analysis** - [`HeapAnalyzer`] loads the snapshot, finds the instance
//!    behind the watch key and reports the shortest strong reference chain
//!    from the GC roots to it as a [`LeakTrace`].

pub mod analysis;
pub mod config;
pub mod report;
pub mod snapshot;
pub mod watcher;

pub use analysis::{
    AnalysisError, AnalysisResult, ExclusionTable, HeapAnalyzer, LeakTrace, Reachability,
    ShortestPathFinder,
};
pub use config::Config;
pub use report::{ReportFormat, Reporter};
pub use snapshot::{GcRoot, RootType, Snapshot, SnapshotBuilder};
pub use watcher::{HeapDump, Retention, RetentionWatcher, WatchKey};
