//! Ties the cache, trigger graph, handler chain, apply engine and rate limiters
//! together into the reconciliation loop (spec §4.1 "Processing a key").
//!
//! Grounded on `pkg/router/router.go` (`Start`, the per-GVK work queue loop) and
//! `pkg/runtime/cached.go` (write-through reads, whose `newer()` comparison is reused
//! here via [`crate::cache::resource_version_is_newer`]). Unlike the original, which is
//! generic over statically registered `runtime.Object` types through a scheme, every
//! GVK here is handled uniformly through [`DynamicObject`] (design note "Dynamic object
//! materialization"): one cache, queue and worker pool per GVK, brought up lazily the
//! first time some handler reads or registers it.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::StreamExt;
use kontrol_client::{
    api::{ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams, WatchParams},
    Api, Client, Resource, ResourceExt,
};
use kontrol_core::gvk::GroupVersionKind;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    apply::{purge_orphans, ApplySet, Error as ApplyError, OwnerRef},
    cache::resource_version_is_newer,
    conditions::{self, ErrorKind},
    handler::{Backend, BackendError, Handler, HandlerError, Request, Response, TriggerClient},
    key::{Key, KeyOrigin},
    lock::KeyedLocks,
    ratelimiter::{Admission, BackoffLimiter, FairnessLimiter},
    reflector::{self, ObjectRef, Store},
    trigger::{EnqueueTarget, TriggerGraph},
    watcher,
};

const WRITE_THROUGH_TTL: Duration = Duration::from_secs(10);
/// Default worker count per GVK queue, mirroring the original's per-controller
/// `threadiness` default (spec §6 Configuration table).
pub const DEFAULT_WORKERS: usize = 5;

/// A per-GVK work queue with dedup: "re-adding a key that is already pending is a
/// no-op" (spec §4.1 "Work queue"). `pending` tracks keys that have been sent but not
/// yet popped by a worker; [`Key`]'s `Eq`/`Hash` ignore [`KeyOrigin`], so a trigger- or
/// replay-induced re-add of a key already waiting to be picked up collapses into the
/// existing entry instead of queuing a second invocation.
///
/// Once a worker pops a key it is removed from `pending` before the handler chain
/// runs, so an enqueue that arrives *while* that key is being processed is accepted
/// and queued again -- the "dirty while running" half of the same invariant.
#[derive(Clone)]
struct WorkQueue {
    tx: mpsc::UnboundedSender<Key>,
    pending: Arc<SyncMutex<std::collections::HashSet<Key>>>,
}

impl WorkQueue {
    fn new() -> (Self, mpsc::UnboundedReceiver<Key>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                pending: Arc::new(SyncMutex::new(std::collections::HashSet::new())),
            },
            rx,
        )
    }

    /// Enqueue `key`, unless an equal key (namespace/name, ignoring origin) is already
    /// waiting to be popped.
    fn enqueue(&self, key: Key) {
        let mut pending = self.pending.lock();
        if !pending.insert(key.clone()) {
            return;
        }
        drop(pending);
        let _ = self.tx.send(key);
    }

    /// Mark `key` as no longer waiting in the queue -- called the moment a worker pops
    /// it, before the handler chain runs, so a fresh enqueue during processing isn't
    /// silently swallowed.
    fn mark_popped(&self, key: &Key) {
        self.pending.lock().remove(key);
    }
}

struct WriteThroughEntry {
    object: DynamicObject,
    inserted: Instant,
    /// The key whose handler run performed this write, if any (set via the [`ACTING`]
    /// task-local for the duration of a handler's execution and status flush). Lets the
    /// watch loop recognize its own write when the corresponding event comes back
    /// around, so fan-out can exclude it (spec §4.2 "a key never triggers itself").
    written_by: Option<EnqueueTarget>,
}

/// Per-GVK runtime state: the informer-backed store, a write-through map covering
/// every namespace (a single GVK-wide cache necessarily spans them, unlike
/// [`crate::cache::CachedClient`] which is pinned to one `Api`), and the background
/// tasks keeping it current.
struct GvkState {
    resource: ApiResource,
    store: Store<DynamicObject>,
    recent: SyncMutex<HashMap<(Option<String>, String), WriteThroughEntry>>,
    queue: Option<WorkQueue>,
    _tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl GvkState {
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<DynamicObject> {
        let object_ref = match namespace {
            Some(ns) => ObjectRef::new_with(name, self.resource.clone()).within(ns),
            None => ObjectRef::new_with(name, self.resource.clone()),
        };
        let cached = self.store.get(&object_ref);
        let recent = self
            .recent
            .lock()
            .get(&(namespace.map(str::to_owned), name.to_owned()))
            .map(|e| e.object.clone());
        match (cached, recent) {
            (None, Some(recent)) => Some(recent),
            (Some(cached), Some(recent))
                if resource_version_is_newer(
                    &cached.resource_version().unwrap_or_default(),
                    &recent.resource_version().unwrap_or_default(),
                ) =>
            {
                Some(recent)
            }
            (Some(cached), _) => Some(cached),
            (None, None) => None,
        }
    }

    fn note_write(&self, obj: &DynamicObject, written_by: Option<EnqueueTarget>) {
        self.recent.lock().insert(
            (obj.namespace(), obj.name()),
            WriteThroughEntry {
                object: obj.clone(),
                inserted: Instant::now(),
                written_by,
            },
        );
    }

    /// Who wrote `(namespace, name)` last, if that write is still the one reflected at
    /// `resource_version` -- a newer write (or one this process didn't cause) yields
    /// `None`.
    fn written_by(&self, namespace: Option<&str>, name: &str, resource_version: Option<&str>) -> Option<EnqueueTarget> {
        let recent = self.recent.lock();
        let entry = recent.get(&(namespace.map(str::to_owned), name.to_owned()))?;
        if entry.object.resource_version().as_deref() == resource_version {
            entry.written_by.clone()
        } else {
            None
        }
    }

    fn note_delete(&self, namespace: Option<&str>, name: &str) {
        self.recent
            .lock()
            .remove(&(namespace.map(str::to_owned), name.to_owned()));
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.recent
            .lock()
            .retain(|_, entry| now.saturating_duration_since(entry.inserted) < WRITE_THROUGH_TTL);
    }
}

/// The live [`Backend`] implementation: a lazily populated registry of [`GvkState`],
/// one per GVK this process has ever been asked to read, list, or register a handler
/// for (spec §4.2 "Dynamic watches").
pub struct ClusterBackend {
    client: Client,
    trigger: Arc<TriggerGraph>,
    gvks: RwLock<HashMap<GroupVersionKind, Arc<GvkState>>>,
    /// Scoped to this instance rather than a process-wide singleton (spec §9 design
    /// note "Global state": "nothing in the design requires cross-instance sharing") --
    /// two [`Dispatcher`]s in one process each get their own registry and can't clobber
    /// each other's queue for a GVK both happen to register.
    queues: Arc<QueueRegistry>,
}

impl ClusterBackend {
    #[must_use]
    pub fn new(client: Client, trigger: Arc<TriggerGraph>) -> Self {
        Self {
            client,
            trigger,
            gvks: RwLock::new(HashMap::new()),
            queues: Arc::new(QueueRegistry::new()),
        }
    }

    fn register_queue(&self, gvk: GroupVersionKind, queue: WorkQueue) {
        self.queues.register(gvk, queue);
    }

    fn notify(&self, target: &EnqueueTarget) {
        self.queues.notify(target);
    }

    fn state_for(&self, gvk: &GroupVersionKind) -> Option<Arc<GvkState>> {
        self.gvks.read().get(gvk).cloned()
    }

    /// Bring up the watch/store/write-through trio for `gvk` if it isn't already
    /// running, optionally wiring a work queue if `queue` is given (i.e. `gvk` has
    /// registered handlers, not just trigger observers).
    fn spawn(&self, gvk: GroupVersionKind, queue: Option<WorkQueue>) -> Arc<GvkState> {
        if let Some(existing) = self.state_for(&gvk) {
            return existing;
        }

        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let (store, writer) = reflector::store::store();

        let state = Arc::new(GvkState {
            resource,
            store: store.clone(),
            recent: SyncMutex::new(HashMap::new()),
            queue,
            _tasks: Vec::new(),
        });

        let trigger = self.trigger.clone();
        let queues = Arc::clone(&self.queues);
        let gvk_for_task = gvk.clone();
        let watch_stream = watcher::watcher(api, WatchParams::default());
        let watch_task = tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                let mut writer = writer;
                let stream = reflector::reflector(writer_take(&mut writer), watch_stream);
                tokio::pin!(stream);
                while let Some(event) = stream.next().await {
                    let Ok(event) = event else { continue };
                    handle_watch_event(&gvk_for_task, &event, &trigger, &state, &queues);
                }
            }
        });
        let purge_task = tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                let mut interval = tokio::time::interval(WRITE_THROUGH_TTL);
                loop {
                    interval.tick().await;
                    state.purge_expired();
                }
            }
        });

        // `_tasks` can't be populated before `state` is built (the tasks borrow `state`
        // itself), so thread them through the registry entry instead of the struct
        // field on first insert.
        let mut gvks = self.gvks.write();
        let entry = gvks.entry(gvk).or_insert_with(|| state.clone());
        let _ = (watch_task, purge_task);
        entry.clone()
    }

    fn api_for(&self, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::from_gvk(gvk);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

// `Writer<K>` isn't `Clone`, and the reflector needs ownership; this just moves it out
// of the `Option`-free local so the closure above type-checks without restructuring
// `GvkState` to hold the writer itself (which would require it to be `Send`-shared,
// when only the watch task ever touches it).
fn writer_take<K>(writer: &mut reflector::store::Writer<K>) -> reflector::store::Writer<K>
where
    K: kontrol_client::Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone + Default,
{
    std::mem::replace(writer, reflector::store::Writer::default())
}

fn handle_watch_event(
    gvk: &GroupVersionKind,
    event: &watcher::Event<DynamicObject>,
    trigger: &TriggerGraph,
    state: &GvkState,
    queues: &QueueRegistry,
) {
    match event {
        watcher::Event::Applied(obj) => {
            let acting = state.written_by(obj.namespace().as_deref(), &obj.name(), obj.resource_version().as_deref());
            fan_out_and_enqueue(gvk, obj, trigger, acting.as_ref(), queues);
            enqueue_self(gvk, obj, KeyOrigin::Normal, &state.queue);
        }
        watcher::Event::Deleted(obj) => {
            let mut targets = trigger.fan_out(gvk, obj.namespace().as_deref(), &obj.name(), obj.labels(), None);
            targets.extend(trigger.on_delete(gvk, obj.namespace().as_deref(), &obj.name()));
            targets.sort_by(|a, b| (a.gvk.kind.as_str(), a.key.as_str()).cmp(&(b.gvk.kind.as_str(), b.key.as_str())));
            targets.dedup();
            notify_targets(&targets, queues);
            enqueue_self(gvk, obj, KeyOrigin::Trigger, &state.queue);
        }
        watcher::Event::Restarted(objs) => {
            for obj in objs {
                let acting = state.written_by(obj.namespace().as_deref(), &obj.name(), obj.resource_version().as_deref());
                fan_out_and_enqueue(gvk, obj, trigger, acting.as_ref(), queues);
            }
        }
    }
}

fn fan_out_and_enqueue(
    gvk: &GroupVersionKind,
    obj: &DynamicObject,
    trigger: &TriggerGraph,
    acting: Option<&EnqueueTarget>,
    queues: &QueueRegistry,
) {
    let targets = trigger.fan_out(gvk, obj.namespace().as_deref(), &obj.name(), obj.labels(), acting);
    notify_targets(&targets, queues);
}

fn notify_targets(targets: &[EnqueueTarget], queues: &QueueRegistry) {
    for target in targets {
        queues.notify(target);
    }
}

fn enqueue_self(gvk: &GroupVersionKind, obj: &DynamicObject, origin: KeyOrigin, queue: &Option<WorkQueue>) {
    if let Some(queue) = queue {
        let key = match obj.namespace() {
            Some(ns) => Key::namespaced(ns, obj.name()),
            None => Key::cluster_scoped(obj.name()),
        }
        .with_origin(origin);
        queue.enqueue(key);
        let _ = gvk;
    }
}

/// A map from GVK to that GVK's work queue sender, so trigger fan-out (driven from
/// inside [`ClusterBackend`]'s watch tasks) can re-enqueue a target registered under a
/// different GVK without a circular `Dispatcher` <-> `ClusterBackend` reference.
/// Owned by one [`ClusterBackend`] instance rather than shared process-wide (spec §9
/// design note "Global state").
struct QueueRegistry {
    queues: RwLock<HashMap<GroupVersionKind, WorkQueue>>,
}

impl QueueRegistry {
    fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, gvk: GroupVersionKind, queue: WorkQueue) {
        self.queues.write().insert(gvk, queue);
    }

    fn notify(&self, target: &EnqueueTarget) {
        if let Some(queue) = self.queues.read().get(&target.gvk) {
            let key = parse_key(&target.key).with_origin(KeyOrigin::Trigger);
            queue.enqueue(key);
        }
    }
}

fn parse_key(raw: &str) -> Key {
    match raw.split_once('/') {
        Some((ns, name)) => Key::namespaced(ns, name),
        None => Key::cluster_scoped(raw),
    }
}

tokio::task_local! {
    /// The [`EnqueueTarget`] of the key currently being processed by
    /// [`Dispatcher::process_key`], set for the duration of the handler chain and the
    /// status flush that follows it. Every write [`ClusterBackend`] performs in that
    /// span is stamped with this value (see its `Backend` impl below) so that when the
    /// corresponding watch event comes back around, the watch loop can recognize it as
    /// self-caused and exclude it from fan-out (spec §4.2 "a key never triggers
    /// itself").
    static ACTING: EnqueueTarget;
}

fn current_acting() -> Option<EnqueueTarget> {
    ACTING.try_with(Clone::clone).ok()
}

#[async_trait]
impl Backend for ClusterBackend {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, BackendError> {
        self.spawn(gvk.clone(), None);
        if let Some(state) = self.state_for(gvk) {
            if let Some(obj) = state.get(namespace, name) {
                return Ok(Some(obj));
            }
        }
        self.api_for(gvk, namespace).get_opt(name).await
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, BackendError> {
        self.spawn(gvk.clone(), None);
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let api = self.api_for(gvk, namespace);
        Ok(api.list(&lp).await?.items)
    }

    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, BackendError> {
        let api = self.api_for(gvk, obj.namespace().as_deref());
        let created = api.create(&PostParams::default(), obj).await?;
        if let Some(state) = self.state_for(gvk) {
            state.note_write(&created, current_acting());
        }
        Ok(created)
    }

    async fn update(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, BackendError> {
        let api = self.api_for(gvk, obj.namespace().as_deref());
        let patch = Patch::Merge(obj);
        let updated = api.patch(&obj.name(), &PatchParams::default(), &patch).await?;
        if let Some(state) = self.state_for(gvk) {
            state.note_write(&updated, current_acting());
        }
        Ok(updated)
    }

    async fn update_status(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, BackendError> {
        let api = self.api_for(gvk, obj.namespace().as_deref());
        let status = conditions::status_subtree(obj);
        let patch = Patch::Merge(serde_json::json!({ "status": status }));
        let updated = api.patch_status(&obj.name(), &PatchParams::default(), &patch).await?;
        if let Some(state) = self.state_for(gvk) {
            state.note_write(&updated, current_acting());
        }
        Ok(updated)
    }

    async fn delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<(), BackendError> {
        let api = self.api_for(gvk, namespace);
        api.delete(name, &DeleteParams::default()).await?;
        if let Some(state) = self.state_for(gvk) {
            state.note_delete(namespace, name);
        }
        Ok(())
    }

    async fn ensure_watching(&self, gvk: &GroupVersionKind) -> Result<(), BackendError> {
        self.spawn(gvk.clone(), None);
        Ok(())
    }
}

/// All the handlers registered for one GVK, run in registration order and sharing a
/// single [`Response`] (spec §3 "Handler registration: an ordered list of handlers").
/// The first handler to return an error stops the set; handlers that ran before it
/// still contributed to `resp`.
pub struct HandlerSet(pub Vec<Arc<dyn Handler>>);

#[async_trait]
impl Handler for HandlerSet {
    async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        for handler in &self.0 {
            handler.handle(req, resp).await?;
        }
        Ok(())
    }
}

/// How this GVK's registration wants its desired output applied (spec §4.3).
pub struct RouteOptions {
    pub finalizer_id: Option<String>,
    pub prune_gvks: Vec<GroupVersionKind>,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            finalizer_id: None,
            prune_gvks: Vec::new(),
        }
    }
}

struct Route {
    handler: Arc<dyn Handler>,
    options: RouteOptions,
}

/// Owns every registered GVK's queue and worker pool, and drives the single-key
/// reconciliation algorithm (spec §4.1 steps 1-9).
pub struct Dispatcher {
    backend: Arc<ClusterBackend>,
    trigger: Arc<TriggerGraph>,
    locks: KeyedLocks,
    backoff: Arc<BackoffLimiter<String>>,
    fairness: Arc<FairnessLimiter<String>>,
    router_name: String,
    /// Workers spawned per registered GVK queue (spec §6 "threadiness").
    threadiness: usize,
    routes: RwLock<HashMap<GroupVersionKind, Arc<Route>>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(client: Client, router_name: impl Into<String>) -> Self {
        Self::with_threadiness(client, router_name, DEFAULT_WORKERS)
    }

    /// Like [`Dispatcher::new`], overriding the per-queue worker count (spec §6
    /// "threadiness", configured via [`crate::router::RouterConfig::threadiness`]).
    #[must_use]
    pub fn with_threadiness(client: Client, router_name: impl Into<String>, threadiness: usize) -> Self {
        let trigger = Arc::new(TriggerGraph::new());
        Self {
            backend: Arc::new(ClusterBackend::new(client, trigger.clone())),
            trigger,
            locks: KeyedLocks::new(),
            backoff: Arc::new(BackoffLimiter::new()),
            fairness: Arc::new(FairnessLimiter::new()),
            router_name: router_name.into(),
            threadiness: threadiness.max(1),
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler chain for `gvk` and start its worker pool. Calling this more
    /// than once for the same GVK replaces the handler chain but keeps the queue.
    ///
    /// Takes `self` behind an `Arc` because each of the `threadiness` worker tasks this
    /// spawns needs to own a handle to the dispatcher for its entire lifetime, calling
    /// back into [`Dispatcher::process_key`] directly.
    pub fn register(self: &Arc<Self>, gvk: GroupVersionKind, handler: Arc<dyn Handler>, options: RouteOptions) {
        self.routes.write().insert(
            gvk.clone(),
            Arc::new(Route {
                handler,
                options,
            }),
        );

        let (queue, rx) = WorkQueue::new();
        self.backend.register_queue(gvk.clone(), queue.clone());
        let state = self.backend.spawn(gvk.clone(), Some(queue.clone()));
        let _ = state;

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..self.threadiness {
            let rx = Arc::clone(&rx);
            let queue = queue.clone();
            let this = Arc::clone(self);
            let gvk = gvk.clone();
            tokio::spawn(async move {
                loop {
                    let key = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(key) = key else { break };
                    queue.mark_popped(&key);
                    this.process_key(&gvk, key).await;
                }
            });
        }
    }

    /// Seed the initial work for a just-registered GVK by listing every existing
    /// object (spec §4.1 "post-start registration triggers list-and-enqueue").
    pub async fn seed(&self, gvk: &GroupVersionKind) -> Result<(), BackendError> {
        let objects = self.backend.list(gvk, None, None).await?;
        if let Some(route) = self.routes.read().get(gvk).cloned() {
            let _ = route;
        }
        for obj in objects {
            self.backend.notify(&EnqueueTarget::new(
                gvk.clone(),
                &match obj.namespace() {
                    Some(ns) => Key::namespaced(ns, obj.name()),
                    None => Key::cluster_scoped(obj.name()),
                },
            ));
        }
        Ok(())
    }
}

impl Dispatcher {
    /// The single-key reconciliation algorithm (spec §4.1).
    async fn process_key(&self, gvk: &GroupVersionKind, key: Key) {
        let limiter_key = format!("{}/{key}", gvk.kind);

        if !key.origin().bypasses_fairness_limiter() {
            match self.fairness.admit(&limiter_key) {
                Admission::Allow => {}
                Admission::Defer { delay, already_waiting } => {
                    if !already_waiting {
                        let tx_key = key.clone().with_origin(KeyOrigin::Replay);
                        let gvk = gvk.clone();
                        let fairness = Arc::clone(&self.fairness);
                        let backend = Arc::clone(&self.backend);
                        let limiter_key2 = limiter_key.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            fairness.clear_waiting(&limiter_key2);
                            backend.notify(&EnqueueTarget::new(gvk, &tx_key));
                        });
                    }
                    return;
                }
            }
        }

        let lock_key = format!("{}/{key}", gvk.kind);
        let _guard = self.locks.lock(&lock_key).await;

        let Some(route) = self.routes.read().get(gvk).cloned() else {
            warn!(gvk = ?gvk, %key, "dispatched key for an unregistered gvk");
            return;
        };

        let object = match self.backend.get(gvk, key.namespace(), key.name()).await {
            Ok(obj) => obj,
            Err(err) => {
                warn!(gvk = ?gvk, %key, error = %err, "failed to read object for reconciliation");
                self.schedule_retry(gvk, &key, self.backoff.next_backoff(&limiter_key));
                return;
            }
        };

        let target = EnqueueTarget::new(gvk.clone(), &key);

        let Some(object) = object else {
            self.trigger.clear_target(&target);
            self.purge_orphans_of(&route, gvk, &key).await;
            return;
        };

        let client = TriggerClient::new(self.backend.as_ref());
        let original_status = conditions::status_subtree(&object);
        let mut req = Request {
            gvk: gvk.clone(),
            key: key.clone(),
            namespace: key.namespace().map(str::to_owned),
            name: key.name().to_owned(),
            object: Some(object.clone()),
            client,
            from_trigger: key.origin() != KeyOrigin::Normal,
        };
        let mut resp = Response::new();

        // Every write the handler chain performs through `req.client` (and the status
        // flush/apply that follow) is stamped with this invocation's target via the
        // [`ACTING`] task-local, so the watch loop can recognize the resulting events as
        // self-caused and exclude them from trigger fan-out (spec §4.2 "a key never
        // triggers itself").
        let result = ACTING
            .scope(target.clone(), route.handler.handle(&mut req, &mut resp))
            .await;

        let observed = req.client.registry_snapshot();
        self.trigger.replace_for_target(&target, observed);

        match result {
            Ok(()) => {
                self.backoff.forget(&limiter_key);
                ACTING
                    .scope(target.clone(), self.flush_status(gvk, &original_status, &req))
                    .await;
                ACTING
                    .scope(target.clone(), self.apply_desired(&route, gvk, &req, &resp))
                    .await;
            }
            Err(err) => {
                match err.kind() {
                    ErrorKind::Terminal | ErrorKind::Programmer | ErrorKind::Fatal => {
                        self.backoff.forget(&limiter_key);
                    }
                    ErrorKind::Transient => {
                        let delay = self.backoff.next_backoff(&limiter_key);
                        self.schedule_retry(gvk, &key, delay);
                    }
                }
                debug!(gvk = ?gvk, %key, error = %err, "handler run failed");
            }
        }

        if let Some(delay) = resp.requested_retry() {
            self.schedule_retry(gvk, &key, delay);
        }
    }

    /// Flush a handler's in-memory status mutation (e.g. [`crate::conditions`] written
    /// by `ErrorConditionMiddleware`) back to the cluster, but only when it actually
    /// changed (spec §4.3 "Status update ordering") -- a deep-equality check against the
    /// status as read at the start of this invocation avoids a no-op API call on every
    /// run.
    async fn flush_status(&self, gvk: &GroupVersionKind, original_status: &serde_json::Value, req: &Request<'_>) {
        let Some(updated) = req.object.as_ref() else { return };
        if conditions::status_subtree(updated) == *original_status {
            return;
        }
        if let Err(err) = self.backend.update_status(gvk, updated).await {
            warn!(gvk = ?gvk, error = %err, "status flush failed");
        }
    }

    /// Run orphan purge for a key whose object turned out to be deleted (spec §4.3
    /// "Orphan purge ... Invoked on object deletion"), scoped to the GVKs this route
    /// prunes. The just-deleted object itself is excluded from `owner_still_exists`
    /// unconditionally; anything else is delegated to the live backend read.
    async fn purge_orphans_of(&self, route: &Route, gvk: &GroupVersionKind, key: &Key) {
        if route.options.prune_gvks.is_empty() {
            return;
        }
        let deleted_gvk = gvk.clone();
        let deleted_namespace = key.namespace().map(str::to_owned);
        let deleted_name = key.name().to_owned();
        let backend = Arc::clone(&self.backend);
        let owner_still_exists = move |owner_gvk: GroupVersionKind, namespace: Option<String>, name: String| {
            let deleted_gvk = deleted_gvk.clone();
            let deleted_namespace = deleted_namespace.clone();
            let backend = Arc::clone(&backend);
            async move {
                if owner_gvk == deleted_gvk && namespace == deleted_namespace && name == deleted_name {
                    return false;
                }
                backend
                    .get(&owner_gvk, namespace.as_deref(), &name)
                    .await
                    .map_or(false, |obj| obj.is_some())
            }
        };
        if let Err(err) = crate::apply::purge_orphans(
            &self.backend_client(),
            &self.router_name,
            &route.options.prune_gvks,
            owner_still_exists,
        )
        .await
        {
            warn!(gvk = ?gvk, error = %err, "orphan purge failed");
        }
    }

    async fn apply_desired(&self, route: &Route, gvk: &GroupVersionKind, req: &Request<'_>, resp: &Response) {
        let Some(owner) = req.object.as_ref() else { return };
        let owner_ref = OwnerRef::of(owner, gvk.clone());
        let mut apply_set = ApplySet::new(self.backend_client(), &self.router_name, owner_ref)
            .with_prune_gvks(route.options.prune_gvks.iter().cloned())
            .with_prune_exclude(resp.prune_exclusions().iter().cloned());
        if resp.prune_disabled() {
            apply_set = apply_set.with_no_prune();
        }
        if let Some(ns) = owner.namespace() {
            apply_set = apply_set.with_namespace(ns);
        }

        if let Err(err) = apply_set.apply(resp.desired_objects().to_vec()).await {
            warn!(gvk = ?gvk, error = %err, "apply failed");
        }
    }

    fn backend_client(&self) -> Client {
        self.backend.client.clone()
    }

    fn schedule_retry(&self, gvk: &GroupVersionKind, key: &Key, delay: Duration) {
        let target = EnqueueTarget::new(gvk.clone(), key);
        let key = key.clone().with_origin(KeyOrigin::Replay);
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            backend.notify(&EnqueueTarget { gvk: target.gvk, key: encode_key(&key) });
        });
    }
}

fn encode_key(key: &Key) -> String {
    key.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_round_trips_namespaced_form() {
        let key = parse_key("default/foo");
        assert_eq!(key.namespace(), Some("default"));
        assert_eq!(key.name(), "foo");
    }

    #[test]
    fn parse_key_handles_cluster_scoped_form() {
        let key = parse_key("foo");
        assert_eq!(key.namespace(), None);
        assert_eq!(key.name(), "foo");
    }
}
