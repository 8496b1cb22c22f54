//! The hybrid cached/write-through client (spec §3 "Write-through cache entry", §4.1).
//!
//! Grounded on `pkg/runtime/cached.go`: the Go `cacheClient` wraps an informer-backed
//! cached reader and an uncached live client, keeping a `recent` map of objects this
//! process itself just wrote so a read immediately following a write doesn't race the
//! informer's watch lag. `newer(oldRV, newRV)` is ported byte-for-byte (§open question,
//! recorded in DESIGN.md): equal-length resource versions compare lexicographically,
//! otherwise both are parsed as integers and the numeric comparison wins; a parse
//! failure on the *old* side treats it as older (so the live/recent value wins), a
//! parse failure on the *new* side treats it as not-newer (so the cached value wins).
//!
//! The uncached escape hatch (`uncached.Holder`/`uncached.HolderList` in the original)
//! is [`Uncached`]: wrapping a value in it and asking a [`CachedClient`] for it routes
//! straight to the live API, skipping both the informer store and the write-through map.

use kontrol_client::{Api, Resource, ResourceExt};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::reflector::{ObjectRef, Store};

const CACHE_DURATION: Duration = Duration::from_secs(10);

/// Wraps a value to force a [`CachedClient`] operation straight to the live API,
/// bypassing both the informer-backed store and the write-through map.
pub struct Uncached<T>(pub T);

/// `oldRV < newRV`, Go `cached.go`'s `newer()` ported exactly.
#[must_use]
pub fn resource_version_is_newer(old_rv: &str, new_rv: &str) -> bool {
    if old_rv.len() == new_rv.len() {
        return old_rv < new_rv;
    }
    let Ok(old_i) = old_rv.parse::<i64>() else {
        return true;
    };
    let Ok(new_i) = new_rv.parse::<i64>() else {
        return false;
    };
    old_i < new_i
}

struct Entry<K> {
    object: K,
    inserted: Instant,
}

/// A read-through cache sitting in front of an `Api<K>`, backed by an informer
/// [`Store`] for bulk reads and a short-lived write-through map for objects this
/// process itself just wrote.
pub struct CachedClient<K: Resource + Clone + 'static> {
    api: Api<K>,
    store: Store<K>,
    recent: Arc<Mutex<HashMap<ObjectRef<K>, Entry<K>>>>,
}

impl<K> CachedClient<K>
where
    K: Resource + ResourceExt + Clone + serde::de::DeserializeOwned + serde::Serialize + Send + Sync + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone + Default,
{
    #[must_use]
    pub fn new(api: Api<K>, store: Store<K>) -> Self {
        Self {
            api,
            store,
            recent: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Read `key`, preferring the write-through entry when it is newer than whatever
    /// the informer store currently holds (or when the store doesn't have it at all).
    pub async fn get(&self, key: &ObjectRef<K>) -> kontrol_client::Result<Option<K>> {
        let cached = self.store.get(key);
        let recent = self.recent.lock().get(key).map(|e| e.object.clone());

        match (cached, recent) {
            (None, Some(recent)) => Ok(Some(recent)),
            (Some(cached), Some(recent))
                if resource_version_is_newer(&cached.resource_version().unwrap_or_default(), &recent.resource_version().unwrap_or_default()) =>
            {
                Ok(Some(recent))
            }
            (Some(cached), _) => Ok(Some(cached)),
            (None, None) => {
                let name = key.name.clone();
                match self.api.get_opt(&name).await? {
                    Some(obj) => Ok(Some(obj)),
                    None => Ok(None),
                }
            }
        }
    }

    /// Write-through: perform the create against the live API, then remember the
    /// result so an immediate subsequent `get` sees it even before the informer's
    /// watch delivers the corresponding event.
    pub async fn create(&self, pp: &kontrol_client::api::PostParams, obj: &K) -> kontrol_client::Result<K> {
        let created = self.api.create(pp, obj).await?;
        self.store_recent(&created);
        Ok(created)
    }

    pub async fn delete(
        &self,
        name: &str,
        dp: &kontrol_client::api::DeleteParams,
    ) -> kontrol_client::Result<either::Either<K, kontrol_client::api::Status>> {
        let result = self.api.delete(name, dp).await?;
        self.evict(name);
        Ok(result)
    }

    /// Record a write performed through some other `Api<K>` than the one this cache
    /// owns (the dispatcher builds a fresh, namespace-scoped `Api` per write since a
    /// single GVK-wide cache serves every namespace) -- without this, a read
    /// immediately following such a write would race the informer's watch lag.
    pub fn note_write(&self, obj: &K) {
        self.store_recent(obj);
    }

    /// Record a deletion performed through some other `Api<K>`. See [`Self::note_write`].
    pub fn note_delete(&self, name: &str) {
        self.evict(name);
    }

    fn store_recent(&self, obj: &K) {
        let key = ObjectRef::from_obj(obj);
        self.recent.lock().insert(
            key,
            Entry {
                object: obj.clone(),
                inserted: Instant::now(),
            },
        );
    }

    fn evict(&self, name: &str) {
        self.recent.lock().retain(|k, _| k.name != name);
    }

    /// Drop every write-through entry older than the cache duration. Intended to be
    /// driven by a background task on a fixed cadence (§3 "Purge runs on a background
    /// cadence").
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.recent
            .lock()
            .retain(|_, entry| now.saturating_duration_since(entry.inserted) < CACHE_DURATION);
    }

    /// Spawn the background purge loop; drop the returned handle to stop it.
    #[must_use]
    pub fn spawn_purge_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()>
    where
        K: Send + Sync,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_DURATION);
            loop {
                interval.tick().await;
                this.purge_expired();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_length_compares_lexicographically() {
        assert!(resource_version_is_newer("100", "101"));
        assert!(!resource_version_is_newer("101", "100"));
    }

    #[test]
    fn different_length_compares_numerically() {
        assert!(resource_version_is_newer("9", "10"));
        assert!(!resource_version_is_newer("10", "9"));
    }

    #[test]
    fn unparseable_old_is_treated_as_older() {
        assert!(resource_version_is_newer("not-a-number", "10"));
    }

    #[test]
    fn unparseable_new_is_treated_as_not_newer() {
        assert!(!resource_version_is_newer("10", "not-a-number"));
    }
}
