// Shortest path from the GC roots to a leaking instance
//
// Breadth-first search with two lanes:
// 1. References matching no exclusion go to the normal lane
// 2. References matching an exclusion go to the deferred lane
// 3. The deferred lane is only consumed once the normal lane is empty
//
// Both lanes are FIFO, so the first clean discovery of the target is the
// shortest clean path, and excluded paths are reported only when nothing
// cleaner exists.

use super::exclusions::{ExclusionMatch, ExclusionTable};
use super::trace::{LeakReference, ReferenceKind};
use super::AnalysisError;
use crate::snapshot::{GcRoot, InstanceKind, ObjectId, RootType, Snapshot, Value};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

/// Index of a node in the search arena
pub type LeakNodeId = usize;

/// Id of the synthetic node every root hangs from
pub const ROOT_SENTINEL: LeakNodeId = 0;

/// A node of the search tree
#[derive(Debug, Clone, PartialEq)]
pub struct LeakNode {
    /// `None` only for the root sentinel
    pub instance: Option<ObjectId>,
    pub parent: Option<LeakNodeId>,
    /// Reference from the parent that reached this node
    pub reference: Option<LeakReference>,
    pub exclusion: Option<ExclusionMatch>,
    /// Root this node was seeded from
    pub root: Option<GcRoot>,
}

/// Outcome of a successful search
#[derive(Debug, Clone)]
pub struct PathResult {
    nodes: Vec<LeakNode>,
    leaking_node: LeakNodeId,
    /// Nodes on the path, sentinel included
    len: usize,
    /// The path relies on at least one excluded reference
    pub excluding_known_leaks: bool,
}

impl PathResult {
    pub fn leaking_node(&self) -> &LeakNode {
        &self.nodes[self.leaking_node]
    }

    pub fn node(&self, id: LeakNodeId) -> Option<&LeakNode> {
        self.nodes.get(id)
    }

    /// The chain from the root sentinel down to the leaking node
    pub fn path(&self) -> Vec<&LeakNode> {
        let mut chain = Vec::new();
        let mut current = Some(self.leaking_node);
        while let Some(id) = current {
            let node = &self.nodes[id];
            chain.push(node);
            current = node.parent;
        }
        chain.reverse();
        chain
    }

    /// Number of nodes on the path, sentinel included
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Finds the shortest reference chain to a target instance
pub struct ShortestPathFinder {
    exclusions: ExclusionTable,
    /// Strings cannot reference application objects; skip expanding them
    ignore_strings: bool,
}

impl ShortestPathFinder {
    pub fn new(exclusions: ExclusionTable) -> Self {
        Self {
            exclusions,
            ignore_strings: true,
        }
    }

    pub fn with_ignore_strings(mut self, ignore: bool) -> Self {
        self.ignore_strings = ignore;
        self
    }

    pub fn exclusions(&self) -> &ExclusionTable {
        &self.exclusions
    }

    pub fn find_path(&self, snapshot: &Snapshot, target: ObjectId) -> Result<PathResult, AnalysisError> {
        let mut search = Search::new(self, snapshot, target);

        let found = match search.enqueue_gc_roots() {
            Some(found) => Some(found),
            None => search.run(),
        };

        debug!(
            "Path search expanded {} of {} instances",
            search.expanded.len(),
            snapshot.len()
        );

        let Some(leaking_node) = found else {
            return Err(AnalysisError::Unreachable { object: target });
        };

        let mut result = PathResult {
            nodes: search.nodes,
            leaking_node,
            len: 0,
            excluding_known_leaks: false,
        };
        let path = result.path();
        let (len, excluding_known_leaks) = (path.len(), path.iter().any(|n| n.exclusion.is_some()));
        result.len = len;
        result.excluding_known_leaks = excluding_known_leaks;

        info!(
            "Found path of {} hops to {:#x}{}",
            result.len() - 1,
            target,
            if result.excluding_known_leaks {
                " (through excluded references)"
            } else {
                ""
            }
        );
        Ok(result)
    }
}

struct Search<'a> {
    finder: &'a ShortestPathFinder,
    snapshot: &'a Snapshot,
    target: ObjectId,
    nodes: Vec<LeakNode>,
    normal: VecDeque<LeakNodeId>,
    deferred: VecDeque<LeakNodeId>,
    in_normal: HashSet<ObjectId>,
    in_deferred: HashSet<ObjectId>,
    expanded: HashSet<ObjectId>,
}

impl<'a> Search<'a> {
    fn new(finder: &'a ShortestPathFinder, snapshot: &'a Snapshot, target: ObjectId) -> Self {
        let sentinel = LeakNode {
            instance: None,
            parent: None,
            reference: None,
            exclusion: None,
            root: None,
        };
        Self {
            finder,
            snapshot,
            target,
            nodes: vec![sentinel],
            normal: VecDeque::new(),
            deferred: VecDeque::new(),
            in_normal: HashSet::new(),
            in_deferred: HashSet::new(),
            expanded: HashSet::new(),
        }
    }

    /// Seed the lanes from the roots; returns early if a root is the target
    fn enqueue_gc_roots(&mut self) -> Option<LeakNodeId> {
        let snapshot = self.snapshot;
        for root in snapshot.gc_roots() {
            if !snapshot.contains(root.object) {
                continue;
            }

            let found = match root.root_type {
                RootType::JavaLocal => self.enqueue_java_local(root),
                root_type if !root_type.can_hold_leak() => self.enqueue(
                    ROOT_SENTINEL,
                    root.object,
                    None,
                    Some(ExclusionMatch::for_root(root_type)),
                    Some(root),
                ),
                _ => self.enqueue(ROOT_SENTINEL, root.object, None, None, Some(root)),
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    /// Locals hang from their thread, which becomes the first holder
    fn enqueue_java_local(&mut self, root: &GcRoot) -> Option<LeakNodeId> {
        let thread = root.thread.filter(|t| self.snapshot.contains(*t));
        let Some(thread) = thread else {
            return self.enqueue(
                ROOT_SENTINEL,
                root.object,
                Some(LeakReference::local()),
                None,
                Some(root),
            );
        };

        let exclusion = self
            .snapshot
            .thread_name(thread)
            .and_then(|name| self.finder.exclusions.match_thread(name));

        let holder = self.push_node(LeakNode {
            instance: Some(thread),
            parent: Some(ROOT_SENTINEL),
            reference: None,
            exclusion: None,
            root: Some(root.clone()),
        });
        self.enqueue(
            holder,
            root.object,
            Some(LeakReference::local()),
            exclusion,
            Some(root),
        )
    }

    fn push_node(&mut self, node: LeakNode) -> LeakNodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Queue `child` unless already seen. Returns the node when a clean
    /// reference reaches the target.
    fn enqueue(
        &mut self,
        parent: LeakNodeId,
        child: ObjectId,
        reference: Option<LeakReference>,
        exclusion: Option<ExclusionMatch>,
        root: Option<&GcRoot>,
    ) -> Option<LeakNodeId> {
        if !self.snapshot.contains(child)
            || self.in_normal.contains(&child)
            || self.expanded.contains(&child)
        {
            return None;
        }
        let clean = exclusion.is_none();
        if !clean && self.in_deferred.contains(&child) {
            return None;
        }
        if self.finder.ignore_strings && child != self.target && self.snapshot.is_string(child) {
            return None;
        }

        let id = self.push_node(LeakNode {
            instance: Some(child),
            parent: Some(parent),
            reference,
            exclusion,
            root: root.cloned(),
        });

        if clean {
            if child == self.target {
                return Some(id);
            }
            self.in_normal.insert(child);
            self.normal.push_back(id);
        } else {
            self.in_deferred.insert(child);
            self.deferred.push_back(id);
        }
        None
    }

    fn run(&mut self) -> Option<LeakNodeId> {
        loop {
            let (id, deferred) = match self.normal.pop_front() {
                Some(id) => (id, false),
                None => (self.deferred.pop_front()?, true),
            };
            let Some(instance) = self.nodes[id].instance else {
                continue;
            };

            // only excluded references park the target here
            if deferred && instance == self.target {
                return Some(id);
            }
            if !self.expanded.insert(instance) {
                continue;
            }
            if let Some(found) = self.expand(id, instance) {
                return Some(found);
            }
        }
    }

    fn expand(&mut self, id: LeakNodeId, instance: ObjectId) -> Option<LeakNodeId> {
        let snapshot = self.snapshot;
        let finder = self.finder;
        let exclusions = &finder.exclusions;
        let holder = snapshot.get_instance(instance)?;

        match &holder.kind {
            InstanceKind::Class(class) => {
                for field in &class.static_fields {
                    let Value::Object(child) = field.value else {
                        continue;
                    };
                    if field.name == "$staticOverhead" {
                        continue;
                    }
                    let exclusion = exclusions.match_static_field(&class.name, &field.name);
                    let reference = LeakReference::new(
                        ReferenceKind::StaticField,
                        &field.name,
                        snapshot.value_as_string(&field.value),
                    );
                    if let Some(found) = self.enqueue(id, child, Some(reference), exclusion, None) {
                        return Some(found);
                    }
                }
            }
            InstanceKind::Object(object) => {
                let hierarchy = snapshot.class_hierarchy(object.class);
                for field in &object.fields {
                    let Value::Object(child) = field.value else {
                        continue;
                    };
                    let exclusion = exclusions.match_field(&hierarchy, &field.name);
                    let reference = LeakReference::new(
                        ReferenceKind::InstanceField,
                        &field.name,
                        snapshot.value_as_string(&field.value),
                    );
                    if let Some(found) = self.enqueue(id, child, Some(reference), exclusion, None) {
                        return Some(found);
                    }
                }
            }
            InstanceKind::Array(array) => {
                for (index, value) in array.elements.iter().enumerate() {
                    let Value::Object(child) = *value else {
                        continue;
                    };
                    let reference = LeakReference::new(
                        ReferenceKind::ArrayEntry,
                        &index.to_string(),
                        snapshot.value_as_string(value),
                    );
                    if let Some(found) = self.enqueue(id, child, Some(reference), None, None) {
                        return Some(found);
                    }
                }
            }
        }
        None
    }
}
