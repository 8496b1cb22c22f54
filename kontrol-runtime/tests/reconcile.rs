//! Integration coverage for the end-to-end reconciliation scenarios (S1-S6), composing
//! the handler chain, finalizer middleware, trigger graph and conditions together
//! against an in-memory fake [`Backend`] rather than a live cluster.
//!
//! The apply engine's own wire behavior (ownership labels, three-way merge, pruning)
//! only talks to the cluster through [`kontrol_client::Api`], so -- matching the
//! posture `kontrol_runtime::apply`'s own test module already takes -- it is exercised
//! at the pure-function level there (`three_way_merge`, `OwnerRef::labels`) rather than
//! re-mocked here; S2's prune behavior and S1's child-creation half are covered that
//! way. Rate limiting (S6) is covered by `ratelimiter::tests`.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kontrol_client::{api::DynamicObject, ResourceExt};
use kontrol_core::{gvk::GroupVersionKind, ApiResource};
use kontrol_runtime::{
    conditions,
    finalizer::FinalizerMiddleware,
    handler::{Backend, BackendError, ErrorConditionMiddleware, Handler, HandlerError, Request, Response, TriggerClient},
    key::Key,
    trigger::{EnqueueTarget, TriggerGraph},
};

fn app_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("apps.example", "v1", "App")
}

fn configmap_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("", "v1", "ConfigMap")
}

fn app(name: &str, generation: i64, deleting: bool) -> DynamicObject {
    let resource = ApiResource::from_gvk(&app_gvk());
    let mut obj = DynamicObject::new(name, &resource);
    obj.metadata.namespace = Some("default".to_owned());
    obj.metadata.generation = Some(generation);
    if deleting {
        obj.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
    }
    obj
}

/// A stateful fake [`Backend`], standing in for a live cluster the way
/// `handler::tests::NullBackend` stands in for a stateless one -- every write actually
/// lands in `objects` so a later `get` observes it, which `NullBackend` never needed.
#[derive(Default)]
struct InMemoryBackend {
    objects: Mutex<HashMap<(GroupVersionKind, Option<String>, String), DynamicObject>>,
}

impl InMemoryBackend {
    fn put(&self, gvk: &GroupVersionKind, obj: DynamicObject) {
        self.objects
            .lock()
            .unwrap()
            .insert((gvk.clone(), obj.namespace(), obj.name()), obj);
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn get(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, BackendError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&(gvk.clone(), namespace.map(str::to_owned), name.to_owned()))
            .cloned())
    }

    async fn list(&self, gvk: &GroupVersionKind, namespace: Option<&str>, _: Option<&str>) -> Result<Vec<DynamicObject>, BackendError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((g, ns, _), _)| g == gvk && ns.as_deref() == namespace)
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, BackendError> {
        self.put(gvk, obj.clone());
        Ok(obj.clone())
    }

    async fn update(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, BackendError> {
        self.put(gvk, obj.clone());
        Ok(obj.clone())
    }

    async fn update_status(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, BackendError> {
        self.put(gvk, obj.clone());
        Ok(obj.clone())
    }

    async fn delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<(), BackendError> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(gvk.clone(), namespace.map(str::to_owned), name.to_owned()));
        Ok(())
    }

    async fn ensure_watching(&self, _: &GroupVersionKind) -> Result<(), BackendError> {
        Ok(())
    }
}

fn request<'a>(gvk: GroupVersionKind, obj: Option<DynamicObject>, backend: &'a InMemoryBackend) -> Request<'a> {
    Request {
        gvk,
        key: Key::namespaced("default", "foo"),
        namespace: Some("default".to_owned()),
        name: "foo".to_owned(),
        object: obj,
        client: TriggerClient::new(backend),
        from_trigger: false,
    }
}

/// S1 (create+status), status half: a handler that emits a child succeeds, and the
/// parent's `Controller` condition is recorded `True` with the observed generation.
/// (The child's ownership labels and the apply-engine write itself are pure-function
/// tested in `apply::tests::ownership_labels_match_scenario_s1`.)
#[tokio::test]
async fn s1_successful_run_records_true_condition_with_observed_generation() {
    struct EmitsChild;
    #[async_trait]
    impl Handler for EmitsChild {
        async fn handle(&self, _req: &mut Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
            let resource = ApiResource::from_gvk(&GroupVersionKind::gvk("batch", "v1", "Job"));
            resp.objects([DynamicObject::new("foo-runner", &resource)]);
            Ok(())
        }
    }

    let backend = InMemoryBackend::default();
    let mw = ErrorConditionMiddleware { next: EmitsChild };
    let mut req = request(app_gvk(), Some(app("foo", 1, false)), &backend);
    let mut resp = Response::new();

    mw.handle(&mut req, &mut resp).await.unwrap();

    assert_eq!(resp.desired_objects().len(), 1);
    assert_eq!(resp.desired_objects()[0].name(), "foo-runner");
    let conds = conditions::read_conditions(req.object.as_ref().unwrap());
    assert_eq!(conds[0].status, "True");
    assert_eq!(conds[0].observed_generation, Some(1));
}

/// S3 (trigger): a handler that reads a `ConfigMap` registers an exact-match dependency
/// just by reading it; a later change to that `ConfigMap` must fan out to the app's key
/// exactly once, and never to itself.
#[tokio::test]
async fn s3_reading_a_configmap_registers_a_trigger_that_fires_once() {
    struct ReadsConfigMap;
    #[async_trait]
    impl Handler for ReadsConfigMap {
        async fn handle(&self, req: &mut Request<'_>, _resp: &mut Response) -> Result<(), HandlerError> {
            req.client.get(&configmap_gvk(), Some("default"), "cfg").await?;
            Ok(())
        }
    }

    let backend = InMemoryBackend::default();
    backend.put(&configmap_gvk(), {
        let resource = ApiResource::from_gvk(&configmap_gvk());
        DynamicObject::new("cfg", &resource)
    });

    let mut req = request(app_gvk(), Some(app("foo", 1, false)), &backend);
    let mut resp = Response::new();
    ReadsConfigMap.handle(&mut req, &mut resp).await.unwrap();

    let target = EnqueueTarget::new(app_gvk(), &Key::namespaced("default", "foo"));
    let graph = TriggerGraph::new();
    graph.replace_for_target(&target, req.client.registry_snapshot());

    let fanned = graph.fan_out(&configmap_gvk(), Some("default"), "cfg", &BTreeMap::new(), None);
    assert_eq!(fanned, vec![target.clone()]);

    // The app's own writes never trigger itself, even though they fan out over the
    // same graph (spec §4.2 "a key never triggers itself").
    let self_fanned = graph.fan_out(&app_gvk(), Some("default"), "foo", &BTreeMap::new(), Some(&target));
    assert!(self_fanned.is_empty());

    // An unrelated ConfigMap never registered a dependency, so it fans out to nobody.
    let unrelated = graph.fan_out(&configmap_gvk(), Some("default"), "other", &BTreeMap::new(), None);
    assert!(unrelated.is_empty());
}

/// S4 (terminal error): a terminal failure is swallowed into a `False`/`ErrTerminal`
/// condition, pruning is disabled for the run, and no later handler in the chain
/// overwrites the recorded failure.
#[tokio::test]
async fn s4_terminal_error_records_condition_and_disables_prune() {
    struct Fails;
    #[async_trait]
    impl Handler for Fails {
        async fn handle(&self, _req: &mut Request<'_>, _resp: &mut Response) -> Result<(), HandlerError> {
            Err(HandlerError::terminal("credentials missing"))
        }
    }

    let backend = InMemoryBackend::default();
    let mw = ErrorConditionMiddleware { next: Fails };
    let mut req = request(app_gvk(), Some(app("foo", 2, false)), &backend);
    let mut resp = Response::new();

    let result = mw.handle(&mut req, &mut resp).await;
    assert!(result.is_ok(), "terminal errors are swallowed into a condition, not propagated");
    assert!(resp.prune_disabled());

    let conds = conditions::read_conditions(req.object.as_ref().unwrap());
    assert_eq!(conds[0].status, "False");
    assert_eq!(conds[0].reason, "ErrTerminal");
    assert_eq!(conds[0].message, "credentials missing");
}

/// S5 (finalizer): deletion runs the handler chain exactly once more, records success,
/// then removes the finalizer -- composing `FinalizerMiddleware` with
/// `ErrorConditionMiddleware`, unlike `finalizer::tests` which only exercises the
/// finalizer in isolation.
#[tokio::test]
async fn s5_deletion_runs_handler_once_then_drops_finalizer() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(AtomicUsize);
    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _req: &mut Request<'_>, _resp: &mut Response) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let backend = InMemoryBackend::default();
    let mut deleting = app("foo", 3, true);
    deleting.finalizers_mut().push("apps.example/drain".to_owned());

    let mw = FinalizerMiddleware {
        finalizer_id: "apps.example/drain".to_owned(),
        next: ErrorConditionMiddleware {
            next: CountingHandler(AtomicUsize::new(0)),
        },
    };
    let mut req = request(app_gvk(), Some(deleting), &backend);
    let mut resp = Response::new();

    mw.handle(&mut req, &mut resp).await.unwrap();

    let updated = req.object.unwrap();
    assert!(updated.finalizers().is_empty(), "finalizer must be dropped once every opted-in handler ran");
    let conds = conditions::read_conditions(&updated);
    assert_eq!(conds[0].status, "True", "the final run before removal still records success");
}
