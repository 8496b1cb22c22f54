use super::ObjectRef;
use crate::watcher;
use kontrol_client::Resource;
use parking_lot::RwLock;
use std::{collections::HashMap, fmt::Debug, hash::Hash, sync::Arc};

type Cache<K> = Arc<RwLock<HashMap<ObjectRef<K>, K>>>;

/// A writable store handle.
///
/// This is exclusive since it's not safe to share a single writer between multiple
/// reflectors: a `Restarted` event clobbers the state contributed by other writers.
pub struct Writer<K: 'static + Resource>
where
    K::DynamicType: Eq + Hash,
{
    store: Cache<K>,
}

impl<K: 'static + Resource> Default for Writer<K>
where
    K::DynamicType: Eq + Hash + Default,
{
    fn default() -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<K> Writer<K>
where
    K: 'static + Resource + Clone,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    /// Returns a read handle to the store.
    ///
    /// Multiple read handles may be obtained, either by calling this repeatedly or by
    /// cloning the returned [`Store`].
    #[must_use]
    pub fn as_reader(&self) -> Store<K> {
        Store {
            store: self.store.clone(),
        }
    }

    /// Applies a single watcher event to the store.
    pub fn apply_watcher_event(&mut self, event: &watcher::Event<K>) {
        let mut store = self.store.write();
        match event {
            watcher::Event::Applied(obj) => {
                store.insert(ObjectRef::from_obj(obj), obj.clone());
            }
            watcher::Event::Deleted(obj) => {
                store.remove(&ObjectRef::from_obj(obj));
            }
            watcher::Event::Restarted(new_objs) => {
                let new_objs = new_objs
                    .iter()
                    .map(|obj| (ObjectRef::from_obj(obj), obj))
                    .collect::<HashMap<_, _>>();
                // Can't do the whole replacement atomically, but at least don't drop
                // objects that are still present in the relist.
                store.retain(|key, _| new_objs.contains_key(key));
                for (key, obj) in new_objs {
                    store.insert(key, obj.clone());
                }
            }
        }
    }
}

/// A readable cache of cluster objects of kind `K`.
///
/// Cloning produces a new handle to the same backing store. Cannot be constructed
/// directly: obtain one from [`Writer::as_reader`] or [`store`].
pub struct Store<K: 'static + Resource>
where
    K::DynamicType: Eq + Hash,
{
    store: Cache<K>,
}

impl<K: 'static + Resource> Clone for Store<K>
where
    K::DynamicType: Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<K> Store<K>
where
    K: 'static + Resource + Clone,
    K::DynamicType: Eq + Hash + Clone,
{
    /// Retrieves a clone of the entry referred to by `key`, if present.
    ///
    /// `key.namespace` is ignored for cluster-scoped resources: if an exact match
    /// isn't found, a lookup with the namespace erased is retried.
    ///
    /// This is a cache and may lag the cluster: deleted objects may still be present,
    /// and new objects may not have arrived yet.
    #[must_use]
    pub fn get(&self, key: &ObjectRef<K>) -> Option<K> {
        let store = self.store.read();
        store.get(key).cloned().or_else(|| {
            let mut cluster_key = key.clone();
            cluster_key.namespace = None;
            store.get(&cluster_key).cloned()
        })
    }

    /// Returns a full snapshot of the current values.
    #[must_use]
    pub fn state(&self) -> Vec<K> {
        self.store.read().values().cloned().collect()
    }

    /// Returns the number of objects currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Returns `true` if the store holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }
}

/// Creates a new writer/reader pair backing a reflector's cache.
#[must_use]
pub fn store<K>() -> (Store<K>, Writer<K>)
where
    K: 'static + Resource + Clone,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    let writer = Writer::default();
    let reader = writer.as_reader();
    (reader, writer)
}

#[cfg(test)]
mod tests {
    use super::Writer;
    use crate::{reflector::ObjectRef, watcher};
    use k8s_openapi::api::core::v1::ConfigMap;
    use kontrol_core::ObjectMeta;

    #[test]
    fn should_allow_getting_namespaced_object_by_namespaced_ref() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("obj".to_string()),
                namespace: Some("ns".to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        let mut store_w = Writer::default();
        store_w.apply_watcher_event(&watcher::Event::Applied(cm.clone()));
        let store = store_w.as_reader();
        assert_eq!(store.get(&ObjectRef::from_obj(&cm)), Some(cm));
    }

    #[test]
    fn should_not_allow_getting_namespaced_object_by_clusterscoped_ref() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("obj".to_string()),
                namespace: Some("ns".to_string()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        let mut cluster_cm = cm.clone();
        cluster_cm.metadata.namespace = None;
        let mut store_w = Writer::default();
        store_w.apply_watcher_event(&watcher::Event::Applied(cm));
        let store = store_w.as_reader();
        assert_eq!(store.get(&ObjectRef::from_obj(&cluster_cm)), None);
    }

    #[test]
    fn should_allow_getting_clusterscoped_object_by_clusterscoped_ref() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("obj".to_string()),
                namespace: None,
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        let mut store_w = Writer::default();
        store_w.apply_watcher_event(&watcher::Event::Applied(cm.clone()));
        let store = store_w.as_reader();
        assert_eq!(store.get(&ObjectRef::from_obj(&cm)), Some(cm));
    }

    #[test]
    fn should_allow_getting_clusterscoped_object_by_namespaced_ref() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("obj".to_string()),
                namespace: None,
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        let mut nsed_cm = cm.clone();
        nsed_cm.metadata.namespace = Some("ns".to_string());
        let mut store_w = Writer::default();
        store_w.apply_watcher_event(&watcher::Event::Applied(cm.clone()));
        let store = store_w.as_reader();
        assert_eq!(store.get(&ObjectRef::from_obj(&nsed_cm)), Some(cm));
    }
}
