//! The canonical work-item key: `namespace/name` (or bare `name`), tagged with the
//! reason it ended up on the queue.
//!
//! Grounded on `TriggerPrefix`/`newRequest` in `pkg/router/handler.go`: the original
//! stores the origin as a string prefix (`"_t "`) glued onto the queue key itself.
//! We keep the same two-bit distinction (normal vs. trigger vs. replay) but as a
//! proper enum field, since Rust's queues aren't stuck with bare strings.

use std::fmt;

/// Why a [`Key`] was placed on a work queue.
///
/// The dispatcher consults this to decide whether the fairness limiter applies
/// (§4.1 step 3): trigger- and replay-induced work skips it, since it was already
/// paced by whatever produced it (the trigger graph's fan-out, or the limiter's own
/// deferred replay).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyOrigin {
    /// A normal watch-driven change.
    Normal,
    /// Re-enqueued by the trigger graph because an observed dependency changed.
    Trigger,
    /// Re-enqueued by the fairness limiter after a deferred replay delay elapsed.
    Replay,
}

impl KeyOrigin {
    /// Trigger- and replay-induced work bypasses the fairness limiter; it was already
    /// paced by whatever produced it.
    #[must_use]
    pub fn bypasses_fairness_limiter(self) -> bool {
        !matches!(self, KeyOrigin::Normal)
    }
}

/// A scheduled work item: the object identity plus why it's being processed.
///
/// Two `Key`s with the same namespace/name but different `origin` are still the *same*
/// queue item for deduplication purposes (`Eq`/`Hash` ignore `origin`) -- re-adding a
/// pending key is a no-op regardless of why the second add happened, matching the
/// work queue's "adding a key that is already pending is a no-op" invariant (§4.1).
#[derive(Debug, Clone)]
pub struct Key {
    namespace: Option<String>,
    name: String,
    origin: KeyOrigin,
}

impl Key {
    /// A namespaced key.
    #[must_use]
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
            origin: KeyOrigin::Normal,
        }
    }

    /// A cluster-scoped key.
    #[must_use]
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
            origin: KeyOrigin::Normal,
        }
    }

    /// Reparent this key under a new origin, keeping identity the same.
    #[must_use]
    pub fn with_origin(mut self, origin: KeyOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// This key's namespace, if namespaced.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// This key's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Why this key was scheduled.
    #[must_use]
    pub fn origin(&self) -> KeyOrigin {
        self.origin
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{name}", name = self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}
impl Eq for Key {}

impl std::hash::Hash for Key {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.name.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_go_key_format() {
        assert_eq!(Key::namespaced("default", "foo").to_string(), "default/foo");
        assert_eq!(Key::cluster_scoped("foo").to_string(), "foo");
    }

    #[test]
    fn equality_and_hash_ignore_origin() {
        use std::collections::HashSet;
        let a = Key::namespaced("default", "foo");
        let b = a.clone().with_origin(KeyOrigin::Trigger);
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}
