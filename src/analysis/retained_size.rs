//! Retained size hidden behind native roots
//!
//! Bitmaps (and similar classes) keep their pixel buffer alive from native
//! code, so the dominator tree parks them under an unknown root even when a
//! leaking object is the only thing keeping them around. This walks up the
//! dominator chain of every such instance, stepping around unknown roots,
//! and attributes the ones that end at the leaking instance.

use crate::snapshot::{Dominator, ObjectId, RootType, Snapshot, Value};
use rayon::prelude::*;
use tracing::debug;

/// Upper bound on dominator hops, guards against cycles in stored data
const MAX_DOMINATOR_HOPS: usize = 4096;

pub const DEFAULT_IGNORED_CLASS: &str = "android.graphics.Bitmap";
pub const DEFAULT_BUFFER_FIELD: &str = "mBuffer";

#[derive(Debug, Clone)]
pub struct IgnoredDominators {
    class_name: String,
    buffer_field: String,
    parallel: bool,
}

impl Default for IgnoredDominators {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORED_CLASS, DEFAULT_BUFFER_FIELD)
    }
}

impl IgnoredDominators {
    pub fn new(class_name: &str, buffer_field: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            buffer_field: buffer_field.to_string(),
            parallel: true,
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Total size held through native roots by instances that only the
    /// leaking instance keeps alive
    pub fn ignored_retained_size(&self, snapshot: &Snapshot, leaking: ObjectId) -> u64 {
        let Some(class_id) = snapshot.find_class(&self.class_name) else {
            debug!("No {} class in snapshot", self.class_name);
            return 0;
        };
        let candidates = snapshot.instances_of(class_id);

        let total: u64 = if self.parallel {
            candidates
                .par_iter()
                .map(|&id| self.counted_size(snapshot, id, leaking))
                .sum()
        } else {
            candidates
                .iter()
                .map(|&id| self.counted_size(snapshot, id, leaking))
                .sum()
        };

        debug!(
            "Ignored retained size: {} bytes from {} {} instances",
            total,
            candidates.len(),
            self.class_name
        );
        total
    }

    fn counted_size(&self, snapshot: &Snapshot, id: ObjectId, leaking: ObjectId) -> u64 {
        let Some(instance) = snapshot.get_instance(id) else {
            return 0;
        };
        let buffer = match instance.field(&self.buffer_field) {
            Some(Value::Object(buffer)) => snapshot.get_instance(buffer),
            _ => None,
        };
        let Some(buffer) = buffer else {
            return 0;
        };
        if !is_ignored_dominator(snapshot, id, leaking) {
            return 0;
        }

        let retained = instance.total_retained_size();
        let buffer_retained = buffer.total_retained_size();
        // the buffer may hang from a native root of its own
        if retained < buffer_retained {
            retained + buffer_retained
        } else {
            retained
        }
    }
}

/// Whether `leaking` dominates `id` once unknown roots are stepped around.
///
/// Only a path that actually stepped around an unknown root counts: a plain
/// dominator chain to `leaking` is already part of its retained size.
pub fn is_ignored_dominator(snapshot: &Snapshot, id: ObjectId, leaking: ObjectId) -> bool {
    let mut found_native_root = false;
    let mut current = id;

    for _ in 0..MAX_DOMINATOR_HOPS {
        let Some(instance) = snapshot.get_instance(current) else {
            return false;
        };
        current = match instance.immediate_dominator {
            Some(Dominator::Root(RootType::Unknown)) => {
                found_native_root = true;
                match instance.next_instance_to_gc_root {
                    Some(next) => next,
                    None => return false,
                }
            }
            Some(Dominator::Object(dominator)) => dominator,
            Some(Dominator::Root(_)) | None => return false,
        };
        if current == leaking {
            return found_native_root;
        }
    }
    false
}
