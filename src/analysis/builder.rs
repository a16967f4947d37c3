// Turns a search path into a human readable leak trace

use super::exclusions::ExclusionMatch;
use super::path_finder::{LeakNode, PathResult, ROOT_SENTINEL};
use super::reachability::ReachabilityClassifier;
use super::trace::{Holder, LeakReference, LeakTrace, LeakTraceElement, ReferenceKind};
use crate::snapshot::{
    ElementType, Instance, InstanceKind, ObjectId, Snapshot, OBJECT_CLASS, THREAD_CLASS,
};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

/// Compiler-generated names of anonymous classes: `Outer$1`, `Outer$Inner$12`
fn anonymous_class_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^.+\$\d+$").expect("anonymous class pattern is valid"))
}

pub fn is_anonymous_class(name: &str) -> bool {
    anonymous_class_pattern().is_match(name)
}

/// Builds trace elements from the nodes of a path
#[derive(Default)]
pub struct LeakTraceBuilder {
    /// Anonymous class name to the interface it implements, for dumps that
    /// did not record interfaces
    anonymous_interfaces: HashMap<String, String>,
    classifier: ReachabilityClassifier,
}

impl LeakTraceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_anonymous_interfaces(mut self, table: HashMap<String, String>) -> Self {
        self.anonymous_interfaces = table;
        self
    }

    pub fn with_classifier(mut self, classifier: ReachabilityClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// One element per node after the root sentinel
    pub fn build(&self, snapshot: &Snapshot, path: &PathResult) -> Vec<LeakTraceElement> {
        let nodes = path.path();
        let hops: Vec<&LeakNode> = nodes.into_iter().filter(|n| n.instance.is_some()).collect();

        let mut elements = Vec::with_capacity(hops.len());
        for (i, node) in hops.iter().enumerate() {
            let next = hops.get(i + 1);
            // a root seeded in the deferred lane carries its own exclusion
            let root_exclusion = (node.parent == Some(ROOT_SENTINEL))
                .then(|| node.exclusion.clone())
                .flatten();
            let Some(element) = self.build_element(
                snapshot,
                node,
                next.and_then(|n| n.reference.clone()),
                next.and_then(|n| n.exclusion.clone()).or(root_exclusion),
            ) else {
                continue;
            };
            elements.push(element);
        }

        debug!("Built {} trace elements", elements.len());
        elements
    }

    /// Elements plus reachability verdicts
    pub fn build_trace(&self, snapshot: &Snapshot, path: &PathResult) -> LeakTrace {
        let elements = self.build(snapshot, path);
        let reachability = self.classifier.compute(&elements);
        LeakTrace::new(elements, reachability)
    }

    fn build_element(
        &self,
        snapshot: &Snapshot,
        node: &LeakNode,
        reference: Option<LeakReference>,
        exclusion: Option<ExclusionMatch>,
    ) -> Option<LeakTraceElement> {
        let instance = snapshot.get_instance(node.instance?)?;
        let class_id = instance.class_id();
        let class_hierarchy: Vec<String> = snapshot
            .class_hierarchy(class_id)
            .into_iter()
            .map(str::to_string)
            .collect();

        let (holder, extra) = match &instance.kind {
            InstanceKind::Class(_) => (Holder::Class, None),
            InstanceKind::Array(_) => (Holder::Array, None),
            InstanceKind::Object(_) if snapshot.extends(class_id, THREAD_CLASS) => {
                let extra = snapshot
                    .thread_name(instance.id)
                    .map(|name| format!("(named '{}')", name));
                (Holder::Thread, extra)
            }
            InstanceKind::Object(_) => (Holder::Object, self.anonymous_label(snapshot, class_id)),
        };

        Some(LeakTraceElement {
            reference,
            holder,
            class_hierarchy,
            extra,
            exclusion,
            field_references: field_references(snapshot, instance),
        })
    }

    fn anonymous_label(&self, snapshot: &Snapshot, class_id: ObjectId) -> Option<String> {
        let class = snapshot.get_class(class_id)?;
        if !is_anonymous_class(&class.name) {
            return None;
        }

        let super_name = snapshot.super_class_name(class_id).unwrap_or(OBJECT_CLASS);
        if super_name != OBJECT_CLASS {
            return Some(format!("(anonymous subclass of {})", super_name));
        }

        let interface = class
            .interfaces
            .first()
            .or_else(|| self.anonymous_interfaces.get(&class.name));
        Some(match interface {
            Some(interface) => format!("(anonymous implementation of {})", interface),
            None => format!("(anonymous subclass of {})", OBJECT_CLASS),
        })
    }
}

/// Diagnostic dump of a holder's own fields
fn field_references(snapshot: &Snapshot, instance: &Instance) -> Vec<LeakReference> {
    let statics = |class_id| {
        snapshot
            .get_class(class_id)
            .map(|class| {
                class
                    .static_fields
                    .iter()
                    .filter(|f| f.name != "$staticOverhead")
                    .map(|f| {
                        LeakReference::new(
                            ReferenceKind::StaticField,
                            &f.name,
                            snapshot.value_as_string(&f.value),
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };

    match &instance.kind {
        InstanceKind::Class(_) => statics(instance.id),
        InstanceKind::Array(array) => {
            if array.element_type != ElementType::Object {
                return Vec::new();
            }
            array
                .elements
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    LeakReference::new(
                        ReferenceKind::ArrayEntry,
                        &i.to_string(),
                        snapshot.value_as_string(v),
                    )
                })
                .collect()
        }
        InstanceKind::Object(object) => {
            let mut refs = statics(object.class);
            refs.extend(object.fields.iter().map(|f| {
                LeakReference::new(
                    ReferenceKind::InstanceField,
                    &f.name,
                    snapshot.value_as_string(&f.value),
                )
            }));
            refs
        }
    }
}
