//! Known-safe reference patterns
//!
//! Some references are held by the platform for reasons the application
//! cannot control (framework bugs, daemon threads, reference queues). The
//! path finder still follows them, but only after every cleaner path has been
//! tried, and the resulting trace says which rule applied.

use crate::snapshot::RootType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExclusionError {
    #[error("more than one exclusion rule for {class}#{field}")]
    DuplicateRule { class: String, field: String },
}

/// What an exclusion rule matches
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExclusionMatcher {
    InstanceField { class: String, field: String },
    StaticField { class: String, field: String },
    /// Thread name; a trailing `*` matches any name with that prefix
    Thread { name: String },
    /// Built-in, for roots that never explain a leak
    Root { root_type: RootType },
}

impl ExclusionMatcher {
    pub fn instance_field(class: &str, field: &str) -> Self {
        ExclusionMatcher::InstanceField {
            class: class.to_string(),
            field: field.to_string(),
        }
    }

    pub fn static_field(class: &str, field: &str) -> Self {
        ExclusionMatcher::StaticField {
            class: class.to_string(),
            field: field.to_string(),
        }
    }

    pub fn thread(name: &str) -> Self {
        ExclusionMatcher::Thread {
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ExclusionMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionMatcher::InstanceField { class, field } => write!(f, "field {}#{}", class, field),
            ExclusionMatcher::StaticField { class, field } => {
                write!(f, "static field {}#{}", class, field)
            }
            ExclusionMatcher::Thread { name } => write!(f, "thread '{}'", name),
            ExclusionMatcher::Root { root_type } => write!(f, "{} root", root_type),
        }
    }
}

/// A rule of the exclusion table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRule {
    pub matcher: ExclusionMatcher,
    pub reason: String,
    /// Lower values are stronger justifications
    #[serde(default)]
    pub priority: i32,
}

impl ExclusionRule {
    pub fn new(matcher: ExclusionMatcher, reason: &str, priority: i32) -> Self {
        Self {
            matcher,
            reason: reason.to_string(),
            priority,
        }
    }
}

/// Result of a successful rule lookup, attached to the traversed edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionMatch {
    pub matcher: ExclusionMatcher,
    pub reason: String,
    pub priority: i32,
}

impl ExclusionMatch {
    /// Match for roots whose type cannot explain a leak
    pub fn for_root(root_type: RootType) -> Self {
        Self {
            matcher: ExclusionMatcher::Root { root_type },
            reason: format!(
                "held only by a {} root, which the application does not control",
                root_type
            ),
            priority: i32::MAX,
        }
    }
}

impl From<&ExclusionRule> for ExclusionMatch {
    fn from(rule: &ExclusionRule) -> Self {
        Self {
            matcher: rule.matcher.clone(),
            reason: rule.reason.clone(),
            priority: rule.priority,
        }
    }
}

/// Default rules for Android hosts: `(matcher, reason, priority)`
fn default_rules() -> Vec<ExclusionRule> {
    use ExclusionMatcher as M;
    vec![
        ExclusionRule::new(
            M::instance_field("java.lang.ref.Reference", "referent"),
            "Weak, soft and phantom references do not keep their referent alive",
            0,
        ),
        ExclusionRule::new(
            M::instance_field("java.lang.ref.FinalizerReference", "zombie"),
            "Objects waiting for finalization are released once the finalizer runs",
            0,
        ),
        ExclusionRule::new(
            M::thread("FinalizerWatchdogDaemon"),
            "The finalizer watchdog holds the object currently being finalized",
            5,
        ),
        ExclusionRule::new(
            M::thread("LeakCanary-Heap-Dump"),
            "The heap dump thread holds the object being dumped",
            5,
        ),
        ExclusionRule::new(
            M::instance_field("android.view.inputmethod.InputMethodManager", "mNextServedView"),
            "InputMethodManager keeps the last focused view until another view takes focus",
            10,
        ),
        ExclusionRule::new(
            M::instance_field("android.view.inputmethod.InputMethodManager", "mServedView"),
            "InputMethodManager keeps the served view until another view takes focus",
            10,
        ),
        ExclusionRule::new(
            M::instance_field("android.view.inputmethod.InputMethodManager", "mCurRootView"),
            "InputMethodManager keeps the root view of the last focused window",
            10,
        ),
        ExclusionRule::new(
            M::static_field("android.text.TextLine", "sCached"),
            "TextLine.sCached is a pool of 3 TextLine instances that keep their spans",
            10,
        ),
        ExclusionRule::new(
            M::instance_field("android.app.ActivityManager", "mContext"),
            "Some vendor builds create ActivityManager with the Activity context",
            15,
        ),
        ExclusionRule::new(
            M::instance_field("android.view.textservice.SpellCheckerSession$1", "this$0"),
            "SpellCheckerSession listener outlives the session on some releases",
            15,
        ),
        ExclusionRule::new(
            M::static_field("android.sec.clipboard.ClipboardUIManager", "sInstance"),
            "Samsung clipboard manager singleton holds the first context it saw",
            15,
        ),
        ExclusionRule::new(
            M::static_field("android.widget.BubblePopupHelper", "sHelper"),
            "Samsung BubblePopupHelper singleton keeps the last anchor view",
            15,
        ),
        ExclusionRule::new(
            M::thread("main"),
            "Stack locals of the main thread are short lived",
            20,
        ),
    ]
}

/// Table of exclusion rules queried during path search
#[derive(Debug, Clone, Default)]
pub struct ExclusionTable {
    instance_fields: HashMap<(String, String), ExclusionRule>,
    static_fields: HashMap<(String, String), ExclusionRule>,
    threads: Vec<ExclusionRule>,
}

impl ExclusionTable {
    /// An empty table: every edge is followed in the normal lane
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in Android rule set
    pub fn android_defaults() -> Self {
        let mut table = Self::new();
        for rule in default_rules() {
            // built-in rules are unique by construction
            if let Err(e) = table.insert(rule) {
                debug!("Skipping built-in exclusion: {}", e);
            }
        }
        table
    }

    pub fn from_rules(rules: impl IntoIterator<Item = ExclusionRule>) -> Result<Self, ExclusionError> {
        let mut table = Self::new();
        table.extend(rules)?;
        Ok(table)
    }

    pub fn extend(&mut self, rules: impl IntoIterator<Item = ExclusionRule>) -> Result<(), ExclusionError> {
        for rule in rules {
            self.insert(rule)?;
        }
        Ok(())
    }

    /// Add a rule. A second rule for the same `(class, field)` is rejected.
    pub fn insert(&mut self, rule: ExclusionRule) -> Result<(), ExclusionError> {
        match rule.matcher.clone() {
            ExclusionMatcher::InstanceField { class, field } => {
                Self::insert_unique(&mut self.instance_fields, class, field, rule)
            }
            ExclusionMatcher::StaticField { class, field } => {
                Self::insert_unique(&mut self.static_fields, class, field, rule)
            }
            ExclusionMatcher::Thread { .. } | ExclusionMatcher::Root { .. } => {
                self.threads.push(rule);
                self.threads.sort_by_key(|r| r.priority);
                Ok(())
            }
        }
    }

    fn insert_unique(
        map: &mut HashMap<(String, String), ExclusionRule>,
        class: String,
        field: String,
        rule: ExclusionRule,
    ) -> Result<(), ExclusionError> {
        let key = (class, field);
        if map.contains_key(&key) {
            let (class, field) = key;
            return Err(ExclusionError::DuplicateRule { class, field });
        }
        map.insert(key, rule);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.instance_fields.len() + self.static_fields.len() + self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All rules, instance fields first, then statics, then threads
    pub fn rules(&self) -> Vec<&ExclusionRule> {
        let mut fields: Vec<_> = self.instance_fields.values().collect();
        fields.sort_by_key(|r| (r.priority, r.matcher.to_string()));
        let mut statics: Vec<_> = self.static_fields.values().collect();
        statics.sort_by_key(|r| (r.priority, r.matcher.to_string()));
        fields
            .into_iter()
            .chain(statics)
            .chain(self.threads.iter())
            .collect()
    }

    /// Instance field lookup over the holder's class hierarchy, most-derived first
    pub fn match_field(&self, hierarchy: &[&str], field: &str) -> Option<ExclusionMatch> {
        if self.instance_fields.is_empty() {
            return None;
        }
        hierarchy.iter().find_map(|class| {
            self.instance_fields
                .get(&(class.to_string(), field.to_string()))
                .map(ExclusionMatch::from)
        })
    }

    pub fn match_static_field(&self, class: &str, field: &str) -> Option<ExclusionMatch> {
        self.static_fields
            .get(&(class.to_string(), field.to_string()))
            .map(ExclusionMatch::from)
    }

    /// Lowest-priority thread rule matching `thread_name`
    pub fn match_thread(&self, thread_name: &str) -> Option<ExclusionMatch> {
        // threads are kept sorted by priority
        self.threads
            .iter()
            .find(|rule| match &rule.matcher {
                ExclusionMatcher::Thread { name } => match name.strip_suffix('*') {
                    Some(prefix) => thread_name.starts_with(prefix),
                    None => thread_name == name,
                },
                _ => false,
            })
            .map(ExclusionMatch::from)
    }
}
