// On-disk snapshot document
//
// The native capture produces an hprof file; the external decoder turns it
// into this JSON document, which is what the analyzer loads.

use super::{
    ArrayInstance, ClassInstance, ClassObject, Dominator, ElementType, Field, GcRoot, Instance,
    InstanceKind, ObjectId, Snapshot, Value,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read snapshot {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode snapshot: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("object id {0:#x} appears more than once")]
    DuplicateId(ObjectId),

    #[error("instance {id:#x} refers to missing class {class:#x}")]
    UnknownClass { id: ObjectId, class: ObjectId },
}

/// Serialized snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotFile {
    #[serde(default)]
    pub classes: Vec<ClassRecord>,
    #[serde(default)]
    pub instances: Vec<InstanceRecord>,
    #[serde(default)]
    pub arrays: Vec<ArrayRecord>,
    #[serde(default)]
    pub roots: Vec<GcRoot>,
}

/// Size and dominator data shared by every record kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeapStats {
    #[serde(default)]
    pub shallow_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retained_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominator: Option<Dominator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_to_gc_root: Option<ObjectId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassRecord {
    pub id: ObjectId,
    pub name: String,
    #[serde(default)]
    pub super_class: Option<ObjectId>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub static_fields: Vec<Field>,
    #[serde(flatten)]
    pub stats: HeapStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: ObjectId,
    pub class: ObjectId,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,
    #[serde(flatten)]
    pub stats: HeapStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayRecord {
    pub id: ObjectId,
    pub class: ObjectId,
    #[serde(default = "default_element_type")]
    pub element_type: ElementType,
    #[serde(default)]
    pub elements: Vec<Value>,
    #[serde(flatten)]
    pub stats: HeapStats,
}

fn default_element_type() -> ElementType {
    ElementType::Object
}

fn with_stats(id: ObjectId, kind: InstanceKind, stats: HeapStats) -> Instance {
    Instance {
        id,
        kind,
        shallow_size: stats.shallow_size,
        retained_size: stats.retained_size,
        immediate_dominator: stats.dominator,
        next_instance_to_gc_root: stats.next_to_gc_root,
    }
}

impl SnapshotFile {
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn into_snapshot(self) -> Result<Snapshot, SnapshotError> {
        let mut instances =
            Vec::with_capacity(self.classes.len() + self.instances.len() + self.arrays.len());

        for class in self.classes {
            instances.push(with_stats(
                class.id,
                InstanceKind::Class(ClassObject {
                    name: class.name,
                    super_class: class.super_class,
                    interfaces: class.interfaces,
                    static_fields: class.static_fields,
                }),
                class.stats,
            ));
        }
        for object in self.instances {
            instances.push(with_stats(
                object.id,
                InstanceKind::Object(ClassInstance {
                    class: object.class,
                    fields: object.fields,
                    string: object.string,
                }),
                object.stats,
            ));
        }
        for array in self.arrays {
            instances.push(with_stats(
                array.id,
                InstanceKind::Array(ArrayInstance {
                    class: array.class,
                    element_type: array.element_type,
                    elements: array.elements,
                }),
                array.stats,
            ));
        }

        Snapshot::new(instances, self.roots)
    }
}

impl Snapshot {
    /// Load a snapshot document from disk
    pub fn from_file(path: &Path) -> Result<Self, SnapshotError> {
        let content = std::fs::read_to_string(path).map_err(|source| SnapshotError::Io {
            path: path.display().to_string(),
            source,
        })?;
        SnapshotFile::from_json(&content)?.into_snapshot()
    }
}
