//! Heap snapshot graph model
//!
//! A snapshot is the decoded form of a heap dump: class objects, class
//! instances and arrays, plus the GC roots that anchor them. Instances are
//! kept in a map for field access and mirrored into a `petgraph` graph so
//! graph algorithms (dominators, distances to roots) can run over it.

pub mod dominators;
mod format;
mod roots;

pub use format::{SnapshotError, SnapshotFile};
pub use roots::deduplicate_gc_roots;

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Address of an object in the heap dump
pub type ObjectId = u64;

/// Name of the universal base class, never listed in class hierarchies
pub const OBJECT_CLASS: &str = "java.lang.Object";

/// Name of the string class, whose instances carry decoded text
pub const STRING_CLASS: &str = "java.lang.String";

/// Name of the thread base class
pub const THREAD_CLASS: &str = "java.lang.Thread";

/// Upper bound on superclass hops, guards against corrupted class data
pub const MAX_HIERARCHY_DEPTH: usize = 64;

/// Kind of GC root, mirroring the hprof root tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootType {
    Unknown,
    JniGlobal,
    JniLocal,
    JavaLocal,
    NativeStack,
    SystemClass,
    ThreadBlock,
    BusyMonitor,
    NativeMonitor,
    Finalizing,
    Debugger,
    ReferenceCleanup,
    VmInternal,
    JniMonitor,
    InternedString,
    Unreachable,
    InvalidType,
    JavaStatic,
}

impl RootType {
    pub fn name(&self) -> &'static str {
        match self {
            RootType::Unknown => "unknown",
            RootType::JniGlobal => "native static",
            RootType::JniLocal => "native local",
            RootType::JavaLocal => "java local",
            RootType::NativeStack => "native stack",
            RootType::SystemClass => "system class",
            RootType::ThreadBlock => "thread block",
            RootType::BusyMonitor => "busy monitor",
            RootType::NativeMonitor => "native monitor",
            RootType::Finalizing => "finalizing",
            RootType::Debugger => "debugger",
            RootType::ReferenceCleanup => "reference cleanup",
            RootType::VmInternal => "vm internal",
            RootType::JniMonitor => "jni monitor",
            RootType::InternedString => "interned string",
            RootType::Unreachable => "unreachable",
            RootType::InvalidType => "invalid type",
            RootType::JavaStatic => "java static",
        }
    }

    /// Whether an object held only by this root can be blamed for a leak.
    ///
    /// Unknown native roots, interned strings, debugger and finalizer
    /// bookkeeping keep objects alive without the application asking for it.
    pub fn can_hold_leak(&self) -> bool {
        !matches!(
            self,
            RootType::Unknown
                | RootType::InternedString
                | RootType::Debugger
                | RootType::Unreachable
                | RootType::Finalizing
                | RootType::InvalidType
        )
    }
}

impl fmt::Display for RootType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A traversal origin
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GcRoot {
    #[serde(rename = "type")]
    pub root_type: RootType,
    pub object: ObjectId,
    /// Thread owning the stack frame, for `JavaLocal` roots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<ObjectId>,
}

impl GcRoot {
    pub fn new(root_type: RootType, object: ObjectId) -> Self {
        Self {
            root_type,
            object,
            thread: None,
        }
    }

    pub fn java_local(object: ObjectId, thread: ObjectId) -> Self {
        Self {
            root_type: RootType::JavaLocal,
            object,
            thread: Some(thread),
        }
    }
}

/// A field or array slot value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Object(ObjectId),
    Boolean(bool),
    Char(char),
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }
}

/// A named field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: Value,
}

impl Field {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn object(name: impl Into<String>, id: ObjectId) -> Self {
        Self::new(name, Value::Object(id))
    }

    pub fn null(name: impl Into<String>) -> Self {
        Self::new(name, Value::Null)
    }
}

/// Element type of an array instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Object,
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

/// A class, as an object in its own right
#[derive(Debug, Clone, PartialEq)]
pub struct ClassObject {
    pub name: String,
    pub super_class: Option<ObjectId>,
    /// Interfaces implemented by this class, when the dump recorded them
    pub interfaces: Vec<String>,
    pub static_fields: Vec<Field>,
}

/// An ordinary object
#[derive(Debug, Clone, PartialEq)]
pub struct ClassInstance {
    pub class: ObjectId,
    /// Field values, most-derived class first
    pub fields: Vec<Field>,
    /// Decoded contents for `java.lang.String` instances
    pub string: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayInstance {
    pub class: ObjectId,
    pub element_type: ElementType,
    pub elements: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceKind {
    Class(ClassObject),
    Object(ClassInstance),
    Array(ArrayInstance),
}

/// Immediate dominator of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dominator {
    Object(ObjectId),
    Root(RootType),
}

/// A node of the heap graph
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub id: ObjectId,
    pub kind: InstanceKind,
    pub shallow_size: u64,
    pub retained_size: Option<u64>,
    pub immediate_dominator: Option<Dominator>,
    /// Next hop on a shortest path toward a GC root
    pub next_instance_to_gc_root: Option<ObjectId>,
}

impl Instance {
    pub fn new(id: ObjectId, kind: InstanceKind) -> Self {
        Self {
            id,
            kind,
            shallow_size: 0,
            retained_size: None,
            immediate_dominator: None,
            next_instance_to_gc_root: None,
        }
    }

    pub fn with_shallow_size(mut self, size: u64) -> Self {
        self.shallow_size = size;
        self
    }

    pub fn with_retained_size(mut self, size: u64) -> Self {
        self.retained_size = Some(size);
        self
    }

    pub fn with_dominator(mut self, dominator: Dominator) -> Self {
        self.immediate_dominator = Some(dominator);
        self
    }

    pub fn with_next_to_gc_root(mut self, next: ObjectId) -> Self {
        self.next_instance_to_gc_root = Some(next);
        self
    }

    /// Class of this instance; a class object answers with itself
    pub fn class_id(&self) -> ObjectId {
        match &self.kind {
            InstanceKind::Class(_) => self.id,
            InstanceKind::Object(object) => object.class,
            InstanceKind::Array(array) => array.class,
        }
    }

    /// Retained size, falling back to the shallow size when unknown
    pub fn total_retained_size(&self) -> u64 {
        self.retained_size.unwrap_or(self.shallow_size)
    }

    /// Field value by name, for class instances
    pub fn field(&self, name: &str) -> Option<Value> {
        match &self.kind {
            InstanceKind::Object(object) => object
                .fields
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.value),
            InstanceKind::Class(class) => class
                .static_fields
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.value),
            InstanceKind::Array(_) => None,
        }
    }

    /// Every object this instance references, in traversal order
    pub fn outgoing(&self) -> Vec<(EdgeKind, String, ObjectId)> {
        match &self.kind {
            InstanceKind::Class(class) => class
                .static_fields
                .iter()
                .filter_map(|f| {
                    f.value
                        .as_object()
                        .map(|id| (EdgeKind::StaticField, f.name.clone(), id))
                })
                .collect(),
            InstanceKind::Object(object) => object
                .fields
                .iter()
                .filter_map(|f| {
                    f.value
                        .as_object()
                        .map(|id| (EdgeKind::InstanceField, f.name.clone(), id))
                })
                .collect(),
            InstanceKind::Array(array) => array
                .elements
                .iter()
                .enumerate()
                .filter_map(|(i, v)| {
                    v.as_object()
                        .map(|id| (EdgeKind::ArrayEntry, i.to_string(), id))
                })
                .collect(),
        }
    }
}

/// Kind of a reference edge in the heap graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    StaticField,
    InstanceField,
    ArrayEntry,
    /// Ownership of a stack-local by its thread
    Local,
}

/// Edge weight of the heap graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub kind: EdgeKind,
    pub name: String,
}

/// In-memory heap snapshot
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    graph: DiGraph<ObjectId, Edge>,
    node_indices: HashMap<ObjectId, NodeIndex>,
    instances: HashMap<ObjectId, Instance>,
    classes_by_name: HashMap<String, ObjectId>,
    instances_by_class: HashMap<ObjectId, Vec<ObjectId>>,
    gc_roots: Vec<GcRoot>,
}

impl Snapshot {
    /// Build a snapshot from instances and roots.
    ///
    /// References to ids that are not part of the dump are kept as field
    /// values but produce no graph edge.
    pub fn new(instances: Vec<Instance>, gc_roots: Vec<GcRoot>) -> Result<Self, SnapshotError> {
        let mut snapshot = Snapshot {
            gc_roots,
            ..Default::default()
        };

        for instance in instances {
            let id = instance.id;
            if snapshot.instances.contains_key(&id) {
                return Err(SnapshotError::DuplicateId(id));
            }
            let index = snapshot.graph.add_node(id);
            snapshot.node_indices.insert(id, index);
            if let InstanceKind::Class(class) = &instance.kind {
                snapshot.classes_by_name.insert(class.name.clone(), id);
            }
            snapshot.instances.insert(id, instance);
        }

        let mut ids: Vec<ObjectId> = snapshot.instances.keys().copied().collect();
        ids.sort_unstable();

        for id in ids {
            let instance = &snapshot.instances[&id];
            if let InstanceKind::Object(_) | InstanceKind::Array(_) = instance.kind {
                let class_id = instance.class_id();
                match snapshot.instances.get(&class_id) {
                    Some(Instance {
                        kind: InstanceKind::Class(_),
                        ..
                    }) => {}
                    _ => return Err(SnapshotError::UnknownClass { id, class: class_id }),
                }
                snapshot.instances_by_class.entry(class_id).or_default().push(id);
            }

            let from = snapshot.node_indices[&id];
            for (kind, name, target) in instance.outgoing() {
                if let Some(&to) = snapshot.node_indices.get(&target) {
                    snapshot.graph.add_edge(from, to, Edge { kind, name });
                }
            }
        }

        Ok(snapshot)
    }

    /// The underlying reference graph
    pub fn inner(&self) -> &DiGraph<ObjectId, Edge> {
        &self.graph
    }

    pub fn node_index(&self, id: ObjectId) -> Option<NodeIndex> {
        self.node_indices.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.instances.contains_key(&id)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn get_instance(&self, id: ObjectId) -> Option<&Instance> {
        self.instances.get(&id)
    }

    pub(crate) fn get_instance_mut(&mut self, id: ObjectId) -> Option<&mut Instance> {
        self.instances.get_mut(&id)
    }

    pub fn gc_roots(&self) -> &[GcRoot] {
        &self.gc_roots
    }

    pub(crate) fn set_gc_roots(&mut self, roots: Vec<GcRoot>) {
        self.gc_roots = roots;
    }

    pub fn get_class(&self, id: ObjectId) -> Option<&ClassObject> {
        match self.instances.get(&id).map(|i| &i.kind) {
            Some(InstanceKind::Class(class)) => Some(class),
            _ => None,
        }
    }

    /// Look up a class object by its fully qualified name
    pub fn find_class(&self, name: &str) -> Option<ObjectId> {
        self.classes_by_name.get(name).copied()
    }

    /// All instances (not subclasses) of the given class
    pub fn instances_of(&self, class_id: ObjectId) -> &[ObjectId] {
        self.instances_by_class
            .get(&class_id)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    /// Class name of an instance; a class object answers with its own name
    pub fn class_name_of(&self, id: ObjectId) -> Option<&str> {
        let instance = self.instances.get(&id)?;
        self.get_class(instance.class_id()).map(|c| c.name.as_str())
    }

    /// Class names from `class_id` upward, most-derived first, stopping
    /// before `java.lang.Object`
    pub fn class_hierarchy(&self, class_id: ObjectId) -> Vec<&str> {
        let mut hierarchy = Vec::new();
        let mut current = Some(class_id);
        while let Some(id) = current {
            if hierarchy.len() >= MAX_HIERARCHY_DEPTH {
                break;
            }
            let Some(class) = self.get_class(id) else {
                break;
            };
            if class.name == OBJECT_CLASS {
                break;
            }
            hierarchy.push(class.name.as_str());
            current = class.super_class;
        }
        hierarchy
    }

    /// Name of the superclass, if the dump recorded one
    pub fn super_class_name(&self, class_id: ObjectId) -> Option<&str> {
        let super_id = self.get_class(class_id)?.super_class?;
        self.get_class(super_id).map(|c| c.name.as_str())
    }

    /// Whether `class_id` is, or extends, the class named `ancestor`
    pub fn extends(&self, class_id: ObjectId, ancestor: &str) -> bool {
        let mut current = Some(class_id);
        for _ in 0..MAX_HIERARCHY_DEPTH {
            let Some(class) = current.and_then(|id| self.get_class(id)) else {
                return false;
            };
            if class.name == ancestor {
                return true;
            }
            current = class.super_class;
        }
        false
    }

    pub fn is_string(&self, id: ObjectId) -> bool {
        self.class_name_of(id) == Some(STRING_CLASS)
            && !matches!(
                self.instances.get(&id).map(|i| &i.kind),
                Some(InstanceKind::Class(_))
            )
    }

    /// Decoded text of a string instance
    pub fn string_value(&self, id: ObjectId) -> Option<&str> {
        match self.instances.get(&id).map(|i| &i.kind) {
            Some(InstanceKind::Object(object)) => object.string.as_deref(),
            _ => None,
        }
    }

    /// Name of a thread instance, read from its `name` field
    pub fn thread_name(&self, thread: ObjectId) -> Option<&str> {
        let name = self.instances.get(&thread)?.field("name")?.as_object()?;
        self.string_value(name)
    }

    /// Human readable rendering of a field value
    pub fn value_as_string(&self, value: &Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Object(id) => {
                if let Some(text) = self.string_value(*id) {
                    return format!("\"{}\"", text);
                }
                match self.class_name_of(*id) {
                    Some(name) => format!("{}@{:#x}", name, id),
                    None => format!("{:#x}", id),
                }
            }
            Value::Boolean(b) => b.to_string(),
            Value::Char(c) => c.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
        }
    }
}

/// Incremental construction of a snapshot, mostly for tests and tools
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    instances: Vec<Instance>,
    roots: Vec<GcRoot>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class(&mut self, id: ObjectId, name: &str, super_class: Option<ObjectId>) -> &mut Self {
        self.class_with_statics(id, name, super_class, Vec::new())
    }

    pub fn class_with_statics(
        &mut self,
        id: ObjectId,
        name: &str,
        super_class: Option<ObjectId>,
        static_fields: Vec<Field>,
    ) -> &mut Self {
        self.instances.push(Instance::new(
            id,
            InstanceKind::Class(ClassObject {
                name: name.to_string(),
                super_class,
                interfaces: Vec::new(),
                static_fields,
            }),
        ));
        self
    }

    pub fn object(&mut self, id: ObjectId, class: ObjectId, fields: Vec<Field>) -> &mut Self {
        self.instances.push(Instance::new(
            id,
            InstanceKind::Object(ClassInstance {
                class,
                fields,
                string: None,
            }),
        ));
        self
    }

    pub fn string(&mut self, id: ObjectId, class: ObjectId, text: &str) -> &mut Self {
        self.instances.push(Instance::new(
            id,
            InstanceKind::Object(ClassInstance {
                class,
                fields: Vec::new(),
                string: Some(text.to_string()),
            }),
        ));
        self
    }

    pub fn object_array(&mut self, id: ObjectId, class: ObjectId, elements: Vec<Value>) -> &mut Self {
        self.instances.push(Instance::new(
            id,
            InstanceKind::Array(ArrayInstance {
                class,
                element_type: ElementType::Object,
                elements,
            }),
        ));
        self
    }

    /// Add a fully specified instance
    pub fn instance(&mut self, instance: Instance) -> &mut Self {
        self.instances.push(instance);
        self
    }

    pub fn root(&mut self, root: GcRoot) -> &mut Self {
        self.roots.push(root);
        self
    }

    pub fn build(&mut self) -> Result<Snapshot, SnapshotError> {
        Snapshot::new(
            std::mem::take(&mut self.instances),
            std::mem::take(&mut self.roots),
        )
    }
}
