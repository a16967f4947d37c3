// GC root deduplication
//
// Heap dumps since Marshmallow routinely list the same root thousands of
// times. Every duplicate would be seeded into the path search and multiply
// its fan-out without adding reachability information.

use super::{ObjectId, RootType, Snapshot};
use std::collections::HashSet;
use tracing::debug;

/// Collapse roots sharing the same `(type, object)` pair, keeping the first.
///
/// Returns the number of entries removed.
pub fn deduplicate_gc_roots(snapshot: &mut Snapshot) -> usize {
    let roots = snapshot.gc_roots();
    let before = roots.len();

    let mut seen: HashSet<(RootType, ObjectId)> = HashSet::with_capacity(before);
    let unique: Vec<_> = roots
        .iter()
        .filter(|root| seen.insert((root.root_type, root.object)))
        .cloned()
        .collect();

    let removed = before - unique.len();
    debug!(
        "Deduplicated GC roots: {} -> {} ({} removed)",
        before,
        unique.len(),
        removed
    );
    snapshot.set_gc_roots(unique);
    removed
}
