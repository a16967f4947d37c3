//! Expected reachability of leak trace elements
//!
//! Inspectors encode domain knowledge about specific holders ("a destroyed
//! Activity should be gone", "the Application lives forever"). They only
//! annotate a trace; they never influence which path was found.

use super::trace::{Holder, LeakTraceElement};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reachability {
    /// The holder is expected to be alive
    Reachable,
    Unknown,
    /// The holder should have been collected
    Unreachable,
}

impl Reachability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reachability::Reachable => "reachable",
            Reachability::Unknown => "unknown",
            Reachability::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for Reachability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Domain knowledge about one kind of holder
pub trait ReachabilityInspector: Send + Sync {
    fn expected_reachability(&self, element: &LeakTraceElement) -> Reachability;
}

/// Inspector driven by a single field of a given class
struct FieldInspector {
    class_names: &'static [&'static str],
    field: &'static str,
    /// Rendered field value meaning the holder is dead
    dead_value: &'static str,
}

impl ReachabilityInspector for FieldInspector {
    fn expected_reachability(&self, element: &LeakTraceElement) -> Reachability {
        if !self.class_names.iter().any(|c| element.is_instance_of(c)) {
            return Reachability::Unknown;
        }
        match element.field_reference_value(self.field) {
            None => Reachability::Unknown,
            Some(value) if value == self.dead_value => Reachability::Unreachable,
            Some(_) => Reachability::Reachable,
        }
    }
}

/// The Application object lives as long as the process
pub struct ApplicationInspector;

impl ReachabilityInspector for ApplicationInspector {
    fn expected_reachability(&self, element: &LeakTraceElement) -> Reachability {
        if element.is_instance_of("android.app.Application") {
            Reachability::Reachable
        } else {
            Reachability::Unknown
        }
    }
}

/// The main thread never terminates
pub struct MainThreadInspector;

impl ReachabilityInspector for MainThreadInspector {
    fn expected_reachability(&self, element: &LeakTraceElement) -> Reachability {
        if element.holder == Holder::Thread && element.extra.as_deref() == Some("(named 'main')") {
            Reachability::Reachable
        } else {
            Reachability::Unknown
        }
    }
}

pub fn activity_inspector() -> impl ReachabilityInspector {
    FieldInspector {
        class_names: &["android.app.Activity"],
        field: "mDestroyed",
        dead_value: "true",
    }
}

pub fn view_inspector() -> impl ReachabilityInspector {
    FieldInspector {
        class_names: &["android.view.View"],
        field: "mAttachInfo",
        dead_value: "null",
    }
}

pub fn dialog_inspector() -> impl ReachabilityInspector {
    FieldInspector {
        class_names: &["android.app.Dialog"],
        field: "mDecor",
        dead_value: "null",
    }
}

pub fn fragment_inspector() -> impl ReachabilityInspector {
    FieldInspector {
        class_names: &[
            "android.app.Fragment",
            "android.support.v4.app.Fragment",
            "androidx.fragment.app.Fragment",
        ],
        field: "mFragmentManager",
        dead_value: "null",
    }
}

pub fn message_queue_inspector() -> impl ReachabilityInspector {
    FieldInspector {
        class_names: &["android.os.MessageQueue"],
        field: "mQuitting",
        dead_value: "true",
    }
}

/// A reference object whose referent was cleared is plain bookkeeping
pub struct ClearedReferenceInspector;

impl ReachabilityInspector for ClearedReferenceInspector {
    fn expected_reachability(&self, element: &LeakTraceElement) -> Reachability {
        if element.is_instance_of("java.lang.ref.Reference")
            && element.field_reference_value("referent") == Some("null")
        {
            Reachability::Reachable
        } else {
            Reachability::Unknown
        }
    }
}

/// Ordered registry of inspectors
#[derive(Default)]
pub struct ReachabilityClassifier {
    inspectors: Vec<Box<dyn ReachabilityInspector>>,
}

impl ReachabilityClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in Android inspectors
    pub fn android_defaults() -> Self {
        Self::new()
            .with_inspector(ApplicationInspector)
            .with_inspector(MainThreadInspector)
            .with_inspector(activity_inspector())
            .with_inspector(view_inspector())
            .with_inspector(dialog_inspector())
            .with_inspector(fragment_inspector())
            .with_inspector(message_queue_inspector())
            .with_inspector(ClearedReferenceInspector)
    }

    pub fn with_inspector(mut self, inspector: impl ReachabilityInspector + 'static) -> Self {
        self.inspectors.push(Box::new(inspector));
        self
    }

    pub fn len(&self) -> usize {
        self.inspectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inspectors.is_empty()
    }

    /// Verdict per element. The first element is the GC root contribution and
    /// the last is the watched instance, so neither is inspected.
    pub fn compute(&self, elements: &[LeakTraceElement]) -> Vec<Reachability> {
        if elements.is_empty() {
            return Vec::new();
        }
        let last_index = elements.len() - 1;
        let mut last_reachable = 0;
        let mut first_unreachable = last_index;

        'elements: for (i, element) in elements.iter().enumerate().take(last_index).skip(1) {
            for inspector in &self.inspectors {
                match inspector.expected_reachability(element) {
                    Reachability::Reachable => {
                        last_reachable = i;
                        break;
                    }
                    Reachability::Unreachable => {
                        first_unreachable = i;
                        break 'elements;
                    }
                    Reachability::Unknown => {}
                }
            }
        }

        (0..elements.len())
            .map(|i| {
                if i <= last_reachable {
                    Reachability::Reachable
                } else if i >= first_unreachable {
                    Reachability::Unreachable
                } else {
                    Reachability::Unknown
                }
            })
            .collect()
    }
}
