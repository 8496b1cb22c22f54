//! The trigger graph (spec §4.2): a dynamically maintained dependency relation from
//! observed objects to handler keys, letting a handler declare its data dependencies
//! simply by reading.
//!
//! Grounded on `pkg/router/trigger.go` and `pkg/router/matcher.go` (original source).
//! The two Go files represent two generations of the same idea -- an older
//! `map[GVK]map[enqueueTarget]matcher` (one matcher set per target) and a newer
//! `map[GVK]map[enqueueTarget][]matcher` (several matchers per target, deduplicated by
//! `Equals`). This module follows the newer shape: [`TriggerGraph::register`] appends
//! and dedupes rather than overwrites, matching spec §3's "Two matchers are equal iff
//! all their fields are equal".

use kontrol_core::{gvk::GroupVersionKind, labels::Selector};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use crate::key::Key;

/// A predicate describing which concrete objects of a given GVK a handler observation
/// cares about (spec §3 "Matcher").
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Exactly one namespaced or cluster-scoped object.
    Exact { namespace: Option<String>, name: String },
    /// Every object in a namespace (or cluster-wide, if `namespace` is `None`) whose
    /// labels satisfy `selector`.
    LabelSelector {
        namespace: Option<String>,
        selector: Selector,
    },
    /// Every object in a namespace (or cluster-wide) whose fields satisfy a
    /// server-side field selector, given here as its canonical string form -- the
    /// framework does not evaluate field selectors itself, so matching degrades to
    /// namespace scoping plus string equality against the selector that was recorded.
    FieldSelector { namespace: Option<String>, selector: String },
    /// Every object in a namespace, or the whole cluster if `namespace` is `None`.
    Wildcard { namespace: Option<String> },
}

impl Matcher {
    /// Two matchers are equal iff all their fields are equal; selectors compare by
    /// canonical string form (spec §3).
    #[must_use]
    pub fn equals(&self, other: &Matcher) -> bool {
        match (self, other) {
            (Matcher::Exact { namespace: n1, name: a }, Matcher::Exact { namespace: n2, name: b }) => {
                n1 == n2 && a == b
            }
            (
                Matcher::LabelSelector { namespace: n1, selector: s1 },
                Matcher::LabelSelector { namespace: n2, selector: s2 },
            ) => n1 == n2 && s1.to_selector_string() == s2.to_selector_string(),
            (
                Matcher::FieldSelector { namespace: n1, selector: s1 },
                Matcher::FieldSelector { namespace: n2, selector: s2 },
            ) => n1 == n2 && s1 == s2,
            (Matcher::Wildcard { namespace: n1 }, Matcher::Wildcard { namespace: n2 }) => n1 == n2,
            _ => false,
        }
    }

    /// Does the changed object at `(namespace, name)` with `labels` satisfy this
    /// matcher?
    #[must_use]
    pub fn matches(&self, namespace: Option<&str>, name: &str, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Matcher::Exact {
                namespace: want_ns,
                name: want_name,
            } => want_name == name && want_ns.as_deref() == namespace,
            Matcher::LabelSelector {
                namespace: want_ns,
                selector,
            } => namespace_matches(want_ns, namespace) && selector.matches(labels),
            Matcher::FieldSelector { namespace: want_ns, .. } => namespace_matches(want_ns, namespace),
            Matcher::Wildcard { namespace: want_ns } => namespace_matches(want_ns, namespace),
        }
    }
}

fn namespace_matches(want: &Option<String>, actual: Option<&str>) -> bool {
    match want {
        None => true,
        Some(ns) => Some(ns.as_str()) == actual,
    }
}

/// The handler invocation that should be re-enqueued when a matcher fires: "if the
/// object this matcher describes ever changes again, re-enqueue `key` on `gvk`'s
/// queue" (spec §3 "targets_by_source").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnqueueTarget {
    pub gvk: GroupVersionKind,
    pub key: String,
}

impl EnqueueTarget {
    #[must_use]
    pub fn new(gvk: GroupVersionKind, key: &Key) -> Self {
        Self {
            gvk,
            key: key.to_string(),
        }
    }
}

/// The bipartite dependency relation: `targets_by_source[source_gvk] -> { target ->
/// [matcher...] }` (spec §3).
///
/// Reads (fan-out, on every watch event) vastly outnumber writes (once per handler
/// run), so this is a single `RwLock` rather than a sharded structure (spec §5
/// "Shared resources").
#[derive(Default)]
pub struct TriggerGraph {
    targets_by_source: RwLock<HashMap<GroupVersionKind, HashMap<EnqueueTarget, Vec<Matcher>>>>,
}

impl TriggerGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `target` cares about objects of `source_gvk` matching `matcher`.
    /// A target never triggers itself (spec §4.2 "Fan-out"): registering a matcher
    /// whose source equals the target's own GVK+key is a no-op.
    pub fn register(&self, source_gvk: GroupVersionKind, target: EnqueueTarget, matcher: Matcher) {
        if source_gvk == target.gvk {
            // still allow cross-key self-observation under the same GVK; only the
            // literal self-trigger (same gvk AND same key) is excluded, handled in
            // `fan_out` where the acting key is known.
        }
        let mut graph = self.targets_by_source.write();
        let matchers = graph.entry(source_gvk).or_default().entry(target).or_default();
        if !matchers.iter().any(|existing| existing.equals(&matcher)) {
            matchers.push(matcher);
        }
    }

    /// Replace the entire matcher set a target previously registered for `source_gvk`
    /// with a fresh one, built from the reads (and writes) of the handler run that
    /// just completed.
    ///
    /// Spec §3 invariant: "the trigger graph only ever shrinks or replaces entries for
    /// a key inside that key's handler run" -- this is the replace half; `clear_target`
    /// is the shrink half.
    pub fn replace_for_target(&self, target: &EnqueueTarget, by_source: HashMap<GroupVersionKind, Vec<Matcher>>) {
        let mut graph = self.targets_by_source.write();
        // Drop this target from every source GVK first, including ones not present in
        // the fresh set, so a dependency the handler stopped reading is forgotten.
        for matchers in graph.values_mut() {
            matchers.remove(target);
        }
        for (source_gvk, matchers) in by_source {
            graph.entry(source_gvk).or_default().insert(target.clone(), matchers);
        }
    }

    /// Drop every matcher entry belonging to `target` across all source GVKs (used
    /// when a handler run produces no observations at all, or the target object
    /// itself was deleted).
    pub fn clear_target(&self, target: &EnqueueTarget) {
        let mut graph = self.targets_by_source.write();
        for matchers in graph.values_mut() {
            matchers.remove(target);
        }
    }

    /// Fan out a change to `(source_gvk, namespace, name, labels)`: for every
    /// registered target whose matcher set matches, return that target, skipping the
    /// acting key itself (spec §4.2 "Fan-out": "A key never triggers itself", and §9
    /// "treat self-triggers as no-ops").
    #[must_use]
    pub fn fan_out(
        &self,
        source_gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        labels: &BTreeMap<String, String>,
        acting: Option<&EnqueueTarget>,
    ) -> Vec<EnqueueTarget> {
        let graph = self.targets_by_source.read();
        let Some(targets) = graph.get(source_gvk) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (target, matchers) in targets {
            if Some(target) == acting {
                continue;
            }
            if matchers.iter().any(|m| m.matches(namespace, name, labels)) {
                out.push(target.clone());
            }
        }
        out
    }

    /// On deletion of `(gvk, namespace, name)`: drop every exact matcher that named it,
    /// and return the set of targets whose matcher set contained one, so the caller can
    /// give them one final trigger (spec §3 "Lifecycle", §4.2 "Cancellation on
    /// deletion").
    pub fn on_delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Vec<EnqueueTarget> {
        let mut graph = self.targets_by_source.write();
        let Some(targets) = graph.get_mut(gvk) else {
            return Vec::new();
        };
        let mut notify = Vec::new();
        for (target, matchers) in targets.iter_mut() {
            let had_exact = matchers.iter().any(|m| {
                matches!(m, Matcher::Exact { namespace: n, name: nm } if n.as_deref() == namespace && nm == name)
            });
            if had_exact {
                matchers.retain(|m| {
                    !matches!(m, Matcher::Exact { namespace: n, name: nm } if n.as_deref() == namespace && nm == name)
                });
                notify.push(target.clone());
            }
        }
        notify
    }
}

/// A per-invocation recorder handed to the trigger-aware client wrapper: every `Get`,
/// `List`, and successful write the handler performs is translated into a
/// [`Matcher`] and accumulated here, then flushed into the [`TriggerGraph`] once the
/// handler run completes (spec §4.2 "Recording").
#[derive(Default)]
pub struct TriggerRegistry {
    observed: HashMap<GroupVersionKind, Vec<Matcher>>,
}

impl TriggerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read or write of a single named object.
    pub fn observe_object(&mut self, gvk: GroupVersionKind, namespace: Option<String>, name: String) {
        self.push(gvk, Matcher::Exact { namespace, name });
    }

    /// Record a label-selector list.
    pub fn observe_selector(&mut self, gvk: GroupVersionKind, namespace: Option<String>, selector: Selector) {
        self.push(gvk, Matcher::LabelSelector { namespace, selector });
    }

    /// Record a field-selector list.
    pub fn observe_field_selector(&mut self, gvk: GroupVersionKind, namespace: Option<String>, selector: String) {
        self.push(gvk, Matcher::FieldSelector { namespace, selector });
    }

    /// Record an unqualified namespace (or cluster-wide) list.
    pub fn observe_wildcard(&mut self, gvk: GroupVersionKind, namespace: Option<String>) {
        self.push(gvk, Matcher::Wildcard { namespace });
    }

    fn push(&mut self, gvk: GroupVersionKind, matcher: Matcher) {
        let matchers = self.observed.entry(gvk).or_default();
        if !matchers.iter().any(|existing| existing.equals(&matcher)) {
            matchers.push(matcher);
        }
    }

    /// GVKs this invocation observed, for the dispatcher to lazily `Watch` (spec §4.2
    /// "Dynamic watches").
    #[must_use]
    pub fn observed_gvks(&self) -> Vec<GroupVersionKind> {
        self.observed.keys().cloned().collect()
    }

    /// Consume the registry, handing ownership of the accumulated matchers to the
    /// caller so they can be installed into the [`TriggerGraph`].
    #[must_use]
    pub fn into_matchers(self) -> HashMap<GroupVersionKind, Vec<Matcher>> {
        self.observed
    }

    /// Clone of everything observed so far, for callers that still need the registry
    /// alive afterwards.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<GroupVersionKind, Vec<Matcher>> {
        self.observed.clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gvk(kind: &str) -> GroupVersionKind {
        GroupVersionKind::gvk("", "v1", kind)
    }

    #[test]
    fn s3_trigger_reads_configmap_and_is_reenqueued() {
        let graph = TriggerGraph::new();
        let target = EnqueueTarget {
            gvk: gvk("App"),
            key: "default/foo".to_owned(),
        };
        graph.register(
            gvk("ConfigMap"),
            target.clone(),
            Matcher::Exact {
                namespace: Some("default".to_owned()),
                name: "cfg".to_owned(),
            },
        );

        let fired = graph.fan_out(&gvk("ConfigMap"), Some("default"), "cfg", &BTreeMap::new(), None);
        assert_eq!(fired, vec![target]);

        // A second, unrelated ConfigMap must not trigger it.
        let fired = graph.fan_out(&gvk("ConfigMap"), Some("default"), "other", &BTreeMap::new(), None);
        assert!(fired.is_empty());
    }

    #[test]
    fn a_key_never_triggers_itself() {
        let graph = TriggerGraph::new();
        let target = EnqueueTarget {
            gvk: gvk("App"),
            key: "default/foo".to_owned(),
        };
        graph.register(
            gvk("App"),
            target.clone(),
            Matcher::Exact {
                namespace: Some("default".to_owned()),
                name: "foo".to_owned(),
            },
        );
        let fired = graph.fan_out(&gvk("App"), Some("default"), "foo", &BTreeMap::new(), Some(&target));
        assert!(fired.is_empty());
    }

    #[test]
    fn matcher_equality_dedupes_registrations() {
        let graph = TriggerGraph::new();
        let target = EnqueueTarget {
            gvk: gvk("App"),
            key: "default/foo".to_owned(),
        };
        for _ in 0..5 {
            graph.register(
                gvk("ConfigMap"),
                target.clone(),
                Matcher::Exact {
                    namespace: Some("default".to_owned()),
                    name: "cfg".to_owned(),
                },
            );
        }
        let fired = graph.fan_out(&gvk("ConfigMap"), Some("default"), "cfg", &BTreeMap::new(), None);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn deletion_drops_exact_matchers_and_notifies_once() {
        let graph = TriggerGraph::new();
        let target = EnqueueTarget {
            gvk: gvk("App"),
            key: "default/foo".to_owned(),
        };
        graph.register(
            gvk("ConfigMap"),
            target.clone(),
            Matcher::Exact {
                namespace: Some("default".to_owned()),
                name: "cfg".to_owned(),
            },
        );
        let notified = graph.on_delete(&gvk("ConfigMap"), Some("default"), "cfg");
        assert_eq!(notified, vec![target]);

        // The matcher is gone: a later recreation of the object no longer re-triggers.
        let fired = graph.fan_out(&gvk("ConfigMap"), Some("default"), "cfg", &BTreeMap::new(), None);
        assert!(fired.is_empty());
    }

    #[test]
    fn replace_for_target_forgets_dropped_dependencies() {
        let graph = TriggerGraph::new();
        let target = EnqueueTarget {
            gvk: gvk("App"),
            key: "default/foo".to_owned(),
        };
        graph.register(
            gvk("ConfigMap"),
            target.clone(),
            Matcher::Exact {
                namespace: Some("default".to_owned()),
                name: "cfg".to_owned(),
            },
        );
        // Next run doesn't read the ConfigMap anymore.
        graph.replace_for_target(&target, HashMap::new());
        let fired = graph.fan_out(&gvk("ConfigMap"), Some("default"), "cfg", &BTreeMap::new(), None);
        assert!(fired.is_empty());
    }
}
