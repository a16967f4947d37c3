// Leak trace types: the reportable output of an analysis

use super::exclusions::ExclusionMatch;
use super::reachability::Reachability;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a holder references the next hop of the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    StaticField,
    InstanceField,
    ArrayEntry,
    Local,
}

/// A named reference, with the referenced value rendered as text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakReference {
    pub kind: ReferenceKind,
    pub name: Option<String>,
    pub value: Option<String>,
}

impl LeakReference {
    pub fn new(kind: ReferenceKind, name: &str, value: String) -> Self {
        Self {
            kind,
            name: Some(name.to_string()),
            value: Some(value),
        }
    }

    /// A stack-local held by a thread
    pub fn local() -> Self {
        Self {
            kind: ReferenceKind::Local,
            name: None,
            value: None,
        }
    }

    /// The name as displayed in a trace
    pub fn display_name(&self) -> String {
        match (self.kind, &self.name) {
            (ReferenceKind::ArrayEntry, Some(name)) => format!("[{}]", name),
            (ReferenceKind::Local, _) => "<Java Local>".to_string(),
            (_, Some(name)) => name.clone(),
            (_, None) => String::new(),
        }
    }
}

impl fmt::Display for LeakReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ReferenceKind::StaticField => write!(f, "static {}", self.display_name())?,
            _ => write!(f, "{}", self.display_name())?,
        }
        if let Some(value) = &self.value {
            write!(f, " = {}", value)?;
        }
        Ok(())
    }
}

/// Structural kind of a holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Holder {
    Class,
    Array,
    Thread,
    Object,
}

/// One hop of a leak trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakTraceElement {
    /// Reference from this holder to the next element; absent on the leaking instance
    pub reference: Option<LeakReference>,
    pub holder: Holder,
    /// Most-derived first, without `java.lang.Object`
    pub class_hierarchy: Vec<String>,
    pub extra: Option<String>,
    pub exclusion: Option<ExclusionMatch>,
    /// The holder's own field values, for diagnostics
    pub field_references: Vec<LeakReference>,
}

impl LeakTraceElement {
    pub fn class_name(&self) -> &str {
        self.class_hierarchy
            .first()
            .map(|s| s.as_str())
            .unwrap_or("java.lang.Object")
    }

    pub fn simple_class_name(&self) -> &str {
        let name = self.class_name();
        name.rsplit('.').next().unwrap_or(name)
    }

    /// Whether the holder's class is, or extends, `class_name`
    pub fn is_instance_of(&self, class_name: &str) -> bool {
        self.class_hierarchy.iter().any(|c| c == class_name)
    }

    /// Rendered value of one of the holder's fields
    pub fn field_reference_value(&self, name: &str) -> Option<&str> {
        self.field_references
            .iter()
            .find(|r| r.name.as_deref() == Some(name))
            .and_then(|r| r.value.as_deref())
    }

    /// Single-line rendering with the simple class name
    pub fn to_short_string(&self) -> String {
        self.render(self.simple_class_name())
    }

    fn render(&self, class_name: &str) -> String {
        let mut out = String::new();
        let is_static = matches!(
            self.reference.as_ref().map(|r| r.kind),
            Some(ReferenceKind::StaticField)
        );
        if is_static {
            out.push_str("static ");
        }
        match self.holder {
            Holder::Array | Holder::Thread => {
                out.push_str(&format!("{:?} ", self.holder).to_lowercase());
            }
            Holder::Class | Holder::Object => {}
        }
        out.push_str(class_name);
        if let Some(reference) = &self.reference {
            match reference.kind {
                ReferenceKind::ArrayEntry => out.push_str(&reference.display_name()),
                _ => {
                    out.push('.');
                    out.push_str(&reference.display_name());
                }
            }
        } else {
            out.push_str(" instance");
        }
        if let Some(extra) = &self.extra {
            out.push(' ');
            out.push_str(extra);
        }
        if let Some(exclusion) = &self.exclusion {
            out.push_str(&format!(", matching exclusion {}", exclusion.matcher));
        }
        out
    }
}

impl fmt::Display for LeakTraceElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(self.class_name()))
    }
}

/// Ordered chain from a GC root to the leaking instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakTrace {
    pub elements: Vec<LeakTraceElement>,
    /// Parallel to `elements`
    pub expected_reachability: Vec<Reachability>,
}

impl LeakTrace {
    pub fn new(elements: Vec<LeakTraceElement>, expected_reachability: Vec<Reachability>) -> Self {
        debug_assert_eq!(elements.len(), expected_reachability.len());
        Self {
            elements,
            expected_reachability,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Trace text with every holder's field dump
    pub fn to_detailed_string(&self) -> String {
        let mut out = String::new();
        for element in &self.elements {
            out.push_str(&format!("* {}\n", element));
            for field in &element.field_references {
                out.push_str(&format!("|   {}\n", field));
            }
        }
        out
    }
}

impl fmt::Display for LeakTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.elements.len().saturating_sub(1);
        for (i, (element, reachability)) in self
            .elements
            .iter()
            .zip(&self.expected_reachability)
            .enumerate()
        {
            let prefix = if i == 0 {
                "* GC ROOT "
            } else if i == last {
                "* leaks "
            } else {
                "* references "
            };
            writeln!(f, "{}{} [{}]", prefix, element, reachability)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(holder: Holder, class: &str, reference: Option<LeakReference>) -> LeakTraceElement {
        LeakTraceElement {
            reference,
            holder,
            class_hierarchy: vec![class.to_string()],
            extra: None,
            exclusion: None,
            field_references: vec![LeakReference::new(
                ReferenceKind::InstanceField,
                "mDestroyed",
                "true".to_string(),
            )],
        }
    }

    #[test]
    fn test_element_rendering() {
        let static_ref = element(
            Holder::Class,
            "com.example.Singleton",
            Some(LeakReference::new(
                ReferenceKind::StaticField,
                "sInstance",
                "x".to_string(),
            )),
        );
        assert_eq!(static_ref.to_string(), "static com.example.Singleton.sInstance");
        assert_eq!(static_ref.to_short_string(), "static Singleton.sInstance");

        let array = element(
            Holder::Array,
            "java.lang.Object[]",
            Some(LeakReference::new(
                ReferenceKind::ArrayEntry,
                "3",
                "x".to_string(),
            )),
        );
        assert_eq!(array.to_string(), "array java.lang.Object[][3]");

        let leak = element(Holder::Object, "com.example.MainActivity", None);
        assert_eq!(leak.to_string(), "com.example.MainActivity instance");
    }

    #[test]
    fn test_field_lookup() {
        let leak = element(Holder::Object, "android.app.Activity", None);
        assert_eq!(leak.field_reference_value("mDestroyed"), Some("true"));
        assert_eq!(leak.field_reference_value("mFinished"), None);
        assert!(leak.is_instance_of("android.app.Activity"));
    }

    #[test]
    fn test_trace_display() {
        let trace = LeakTrace::new(
            vec![
                element(
                    Holder::Object,
                    "a.Root",
                    Some(LeakReference::new(
                        ReferenceKind::InstanceField,
                        "child",
                        "b".to_string(),
                    )),
                ),
                element(Holder::Object, "a.Leak", None),
            ],
            vec![Reachability::Reachable, Reachability::Unreachable],
        );
        let text = trace.to_string();
        assert!(text.starts_with("* GC ROOT a.Root.child [reachable]"));
        assert!(text.contains("* leaks a.Leak instance [unreachable]"));
        assert!(trace.to_detailed_string().contains("|   mDestroyed = true"));
    }
}
