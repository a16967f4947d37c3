// Dominator tree and retained sizes
//
// Decoders that already ran a dominator pass put the results in the snapshot
// document. For everything else this fills in the gaps: immediate dominators,
// retained sizes and the next hop toward a GC root. Values already present
// are never overwritten.

use super::{Dominator, ObjectId, RootType, Snapshot};
use petgraph::algo::dominators::simple_fast;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
enum DomNode {
    /// Synthetic root above every GC root; objects it dominates directly
    /// are held by several roots and report an unknown root
    SuperRoot,
    Root(RootType),
    Object(ObjectId),
}

/// Fill in missing dominator, retained size and next-hop data
pub fn compute(snapshot: &mut Snapshot) {
    let object_count = snapshot.inner().node_count();
    let mut graph: DiGraph<DomNode, ()> = snapshot
        .inner()
        .map(|_, id| DomNode::Object(*id), |_, _| ());

    let super_root = graph.add_node(DomNode::SuperRoot);
    let mut root_objects = Vec::new();
    for root in snapshot.gc_roots() {
        let Some(target) = snapshot.node_index(root.object) else {
            continue;
        };
        let root_node = graph.add_node(DomNode::Root(root.root_type));
        graph.add_edge(super_root, root_node, ());
        graph.add_edge(root_node, target, ());
        root_objects.push(target);
    }

    let dominators = simple_fast(&graph, super_root);

    // Dominator tree children, indexed by graph node
    let mut children: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    let mut idoms: Vec<Option<Dominator>> = vec![None; object_count];
    for index in 0..object_count {
        let node = NodeIndex::new(index);
        let Some(idom) = dominators.immediate_dominator(node) else {
            continue;
        };
        children.entry(idom).or_default().push(node);
        idoms[index] = match graph[idom] {
            DomNode::SuperRoot => Some(Dominator::Root(RootType::Unknown)),
            DomNode::Root(root_type) => Some(Dominator::Root(root_type)),
            DomNode::Object(id) => Some(Dominator::Object(id)),
        };
    }

    // Pre-order walk of the dominator tree, accumulated in reverse
    let mut order = Vec::with_capacity(graph.node_count());
    let mut stack = vec![super_root];
    while let Some(node) = stack.pop() {
        order.push(node);
        if let Some(kids) = children.get(&node) {
            stack.extend(kids.iter().copied());
        }
    }

    let mut retained: Vec<u64> = (0..object_count)
        .map(|index| {
            let id = snapshot.inner()[NodeIndex::new(index)];
            snapshot
                .get_instance(id)
                .map(|i| i.shallow_size)
                .unwrap_or(0)
        })
        .collect();
    for node in order.iter().rev() {
        if node.index() >= object_count {
            continue;
        }
        let Some(kids) = children.get(node) else {
            continue;
        };
        let subtree: u64 = kids
            .iter()
            .filter(|k| k.index() < object_count)
            .map(|k| retained[k.index()])
            .sum();
        retained[node.index()] += subtree;
    }

    let next_hops = next_hops_to_roots(snapshot, &root_objects);

    let mut filled = 0usize;
    for index in 0..object_count {
        let id = snapshot.inner()[NodeIndex::new(index)];
        let next_hop = next_hops.get(&id).copied();
        if let Some(instance) = snapshot.get_instance_mut(id) {
            if instance.immediate_dominator.is_none() {
                instance.immediate_dominator = idoms[index];
            }
            if instance.retained_size.is_none() {
                instance.retained_size = Some(retained[index]);
                filled += 1;
            }
            if instance.next_instance_to_gc_root.is_none() {
                instance.next_instance_to_gc_root = next_hop;
            }
        }
    }

    debug!(
        "Dominator pass: {} objects, {} roots, {} retained sizes derived",
        object_count,
        root_objects.len(),
        filled
    );
}

/// Breadth-first parents from the GC roots outward
fn next_hops_to_roots(snapshot: &Snapshot, roots: &[NodeIndex]) -> HashMap<ObjectId, ObjectId> {
    let graph = snapshot.inner();
    let mut next = HashMap::new();
    let mut seen = vec![false; graph.node_count()];
    let mut queue = VecDeque::new();

    for &root in roots {
        if !seen[root.index()] {
            seen[root.index()] = true;
            queue.push_back(root);
        }
    }

    while let Some(node) = queue.pop_front() {
        for neighbor in graph.neighbors(node) {
            if seen[neighbor.index()] {
                continue;
            }
            seen[neighbor.index()] = true;
            next.insert(graph[neighbor], graph[node]);
            queue.push_back(neighbor);
        }
    }

    next
}
