//! The handler chain (spec §4.4): `Handler` trait, the trigger-recording client handed
//! to every handler, and the middleware each registered handler is wrapped in.
//!
//! Grounded on `pkg/router/types.go`, `pkg/router/handler.go`, `pkg/router/handlers.go`,
//! `pkg/router/router.go` (deletion/selector/name-namespace filters), `pkg/router/finalizer.go`,
//! and `pkg/conditions/setter.go` (error-to-condition wrapper) -- all from
//! `examples/original_source`.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use async_trait::async_trait;
use kontrol_client::api::DynamicObject;
use kontrol_client::{Resource, ResourceExt};
use kontrol_core::{gvk::GroupVersionKind, labels::Selector};
use thiserror::Error;

use crate::{
    conditions::{self, ErrorKind},
    key::Key,
    trigger::TriggerRegistry,
};

/// Errors a [`Backend`] call can fail with.
pub type BackendError = kontrol_client::Error;

/// The cluster operations a handler's client needs, abstracted away from the concrete
/// transport so `handler.rs` doesn't depend on `dispatcher.rs` (which owns the real
/// implementation, backed by the cached/write-through client of spec §4.1).
///
/// Corresponds to the `backend.Backend`/`backend.Reader`/`backend.Writer` interfaces
/// consumed by `HandlerSet`/`triggers`/`save` in the original source.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, BackendError>;

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, BackendError>;

    async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, BackendError>;

    async fn update(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, BackendError>;

    async fn update_status(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, BackendError>;

    async fn delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<(), BackendError>;

    /// Register that this GVK must be watched, if it isn't already (spec §4.2 "Dynamic
    /// watches"). Idempotent.
    async fn ensure_watching(&self, gvk: &GroupVersionKind) -> Result<(), BackendError>;
}

/// Forces the wrapped operation straight to the live API, skipping both the informer
/// cache and the write-through memory (spec §4.1 "uncached escape hatch").
pub struct Uncached<T>(pub T);

/// The client handed to a handler. Every `get`/`list`/write call is both forwarded to
/// the [`Backend`] and recorded into the per-invocation [`TriggerRegistry`], which is
/// exactly what lets a handler declare its dependencies just by reading (spec §4.2
/// "Recording").
pub struct TriggerClient<'a> {
    backend: &'a dyn Backend,
    registry: Mutex<TriggerRegistry>,
}

impl<'a> TriggerClient<'a> {
    #[must_use]
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self {
            backend,
            registry: Mutex::new(TriggerRegistry::new()),
        }
    }

    pub async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>, BackendError> {
        self.registry
            .lock()
            .unwrap()
            .observe_object(gvk.clone(), namespace.map(str::to_owned), name.to_owned());
        self.backend.get(gvk, namespace, name).await
    }

    /// Bypasses both cache layers; still recorded, since the handler still cares about
    /// this object going forward.
    pub async fn get_uncached(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        name: &str,
        _marker: Uncached<()>,
    ) -> Result<Option<DynamicObject>, BackendError> {
        self.get(gvk, namespace, name).await
    }

    pub async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>, BackendError> {
        self.registry
            .lock()
            .unwrap()
            .observe_wildcard(gvk.clone(), namespace.map(str::to_owned));
        self.backend.list(gvk, namespace, None).await
    }

    pub async fn list_selector(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<DynamicObject>, BackendError> {
        self.registry
            .lock()
            .unwrap()
            .observe_selector(gvk.clone(), namespace.map(str::to_owned), selector.clone());
        self.backend
            .list(gvk, namespace, Some(&selector.to_selector_string()))
            .await
    }

    pub async fn create(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, BackendError> {
        let created = self.backend.create(gvk, obj).await?;
        self.observe_write(gvk, &created);
        Ok(created)
    }

    pub async fn update(&self, gvk: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, BackendError> {
        let updated = self.backend.update(gvk, obj).await?;
        self.observe_write(gvk, &updated);
        Ok(updated)
    }

    pub async fn update_status(
        &self,
        gvk: &GroupVersionKind,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, BackendError> {
        let updated = self.backend.update_status(gvk, obj).await?;
        self.observe_write(gvk, &updated);
        Ok(updated)
    }

    pub async fn delete(&self, gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Result<(), BackendError> {
        self.backend.delete(gvk, namespace, name).await
    }

    fn observe_write(&self, gvk: &GroupVersionKind, obj: &DynamicObject) {
        self.registry
            .lock()
            .unwrap()
            .observe_object(gvk.clone(), obj.namespace(), obj.name());
    }

    /// Consume the client, handing back everything this invocation observed (spec
    /// §4.2 "Recording").
    #[must_use]
    pub fn into_registry(self) -> TriggerRegistry {
        self.registry.into_inner().unwrap()
    }

    /// Snapshot everything observed so far without consuming the client. The
    /// dispatcher needs this after the handler chain returns (to flush into the
    /// [`crate::trigger::TriggerGraph`]) while `req` -- and the client inside it -- is
    /// still needed afterwards for the apply step.
    #[must_use]
    pub fn registry_snapshot(&self) -> HashMap<GroupVersionKind, Vec<crate::trigger::Matcher>> {
        self.registry.lock().unwrap().snapshot()
    }
}

/// A single reconciliation's input and identity.
pub struct Request<'a> {
    pub gvk: GroupVersionKind,
    pub key: Key,
    pub namespace: Option<String>,
    pub name: String,
    /// The object as read from the cache at dispatch time; `None` means the object has
    /// been deleted (spec §4.1 "Not-found on `Get` during reconciliation is treated as
    /// deletion").
    pub object: Option<DynamicObject>,
    pub client: TriggerClient<'a>,
    /// Set for trigger- and replay-induced invocations (spec §3 "Key").
    pub from_trigger: bool,
}

impl<'a> Request<'a> {
    /// Snapshot what `client` has observed so far, without consuming the request (the
    /// dispatcher needs `req` again afterwards to apply the handler's desired state).
    #[must_use]
    pub fn client_registry_snapshot(&self) -> HashMap<GroupVersionKind, Vec<crate::trigger::Matcher>> {
        self.client.registry_snapshot()
    }
}

/// What a handler run produced: the desired child set plus any requeue/prune
/// preferences (spec §4 "response" struct).
#[derive(Default)]
pub struct Response {
    objects: Vec<DynamicObject>,
    retry_after: Option<Duration>,
    no_prune: bool,
    prune_exclude: Vec<GroupVersionKind>,
    /// A loose attribute bag, mirroring Go's `resp.Attributes() map[string]interface{}`
    /// -- used by the error-to-condition wrapper to avoid clobbering a condition a
    /// preceding handler in the same chain already recorded.
    attributes: HashMap<String, serde_json::Value>,
}

impl Response {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add objects to the desired child set.
    pub fn objects(&mut self, objs: impl IntoIterator<Item = DynamicObject>) {
        self.objects.extend(objs);
    }

    #[must_use]
    pub fn desired_objects(&self) -> &[DynamicObject] {
        &self.objects
    }

    /// Ask to be re-invoked after `delay`, taking the earliest such request if called
    /// more than once (spec §3 "response.RetryAfter").
    pub fn retry_after(&mut self, delay: Duration) {
        self.retry_after = Some(match self.retry_after {
            Some(existing) if existing <= delay => existing,
            _ => delay,
        });
    }

    #[must_use]
    pub fn requested_retry(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Disable pruning entirely for this invocation (spec §4.3 "Scoped opt-out" (a)).
    pub fn disable_prune(&mut self) {
        self.no_prune = true;
    }

    #[must_use]
    pub fn prune_disabled(&self) -> bool {
        self.no_prune
    }

    /// Exclude a GVK from pruning while leaving others in scope (spec §4.3 "Scoped
    /// opt-out" (b)).
    pub fn exclude_from_prune(&mut self, gvk: GroupVersionKind) {
        self.prune_exclude.push(gvk);
    }

    #[must_use]
    pub fn prune_exclusions(&self) -> &[GroupVersionKind] {
        &self.prune_exclude
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.insert(key.into(), value);
    }

    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }
}

/// How a handler invocation failed (spec §7 taxonomy).
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{kind}: {message}")]
    Classified {
        kind: ErrorKind,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl HandlerError {
    #[must_use]
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Classified {
            kind: ErrorKind::Terminal,
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Classified {
            kind: ErrorKind::Transient,
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Classified { kind, .. } => *kind,
            HandlerError::Backend(_) => ErrorKind::Transient,
        }
    }
}

/// A single step in the handler chain, mirroring `router.Handler` from the original.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), HandlerError>;
}

/// Adapts a bare async closure into a [`Handler`] (mirrors `router.HandlerFunc`).
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(&mut Request<'_>, &mut Response) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        (self.0)(req, resp).await
    }
}

/// Skips handling entirely once the object has been removed from the cluster -- the
/// outermost layer of the chain (spec §4.4; `router.IgnoreRemoveHandler`).
///
/// Handlers that need to observe deletion opt in via [`crate::finalizer::FinalizerMiddleware`], which
/// sits *inside* this filter in the original stack order but is only reached by
/// objects that still exist (with a deletion timestamp set).
pub struct IgnoreDeletedFilter<H> {
    pub next: H,
}

#[async_trait]
impl<H: Handler> Handler for IgnoreDeletedFilter<H> {
    async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        if req.object.is_none() {
            return Ok(());
        }
        self.next.handle(req, resp).await
    }
}

/// Restricts a handler to a specific name and/or namespace (`router.NameNamespaceFilter`).
pub struct NameNamespaceFilter<H> {
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub next: H,
}

#[async_trait]
impl<H: Handler> Handler for NameNamespaceFilter<H> {
    async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        if let Some(name) = &self.name {
            if name != &req.name {
                return Ok(());
            }
        }
        if let Some(ns) = &self.namespace {
            if Some(ns.as_str()) != req.namespace.as_deref() {
                return Ok(());
            }
        }
        self.next.handle(req, resp).await
    }
}

/// Restricts a handler to objects whose labels satisfy a selector
/// (`router.SelectorFilter`).
pub struct SelectorFilter<H> {
    pub selector: Selector,
    pub next: H,
}

#[async_trait]
impl<H: Handler> Handler for SelectorFilter<H> {
    async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        let Some(obj) = &req.object else {
            return Ok(());
        };
        if !self.selector.matches(obj.labels()) {
            return Ok(());
        }
        self.next.handle(req, resp).await
    }
}

/// The error-to-condition wrapper (spec §4.4, §7; `pkg/conditions/setter.go`
/// `ErrorMiddleware`): writes `Controller=True`/`Controller=False` onto the parent
/// after every invocation and disables pruning when it records an error, so a partial
/// output set can't cause cascading destruction (S4).
pub struct ErrorConditionMiddleware<H> {
    pub next: H,
}

#[async_trait]
impl<H: Handler> Handler for ErrorConditionMiddleware<H> {
    async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        // A sibling handler earlier in this GVK's list already recorded a failure for
        // this request; don't let a later handler's success clobber it (mirrors Go's
        // `_errormiddleware:errored` attribute).
        if resp.attribute("_errormiddleware:errored").is_some() {
            return self.next.handle(req, resp).await.map(|_| ()).or(Ok(()));
        }

        let Some(mut obj) = req.object.clone() else {
            return self.next.handle(req, resp).await;
        };

        let generation = obj.meta().generation.unwrap_or_default();
        let result = self.next.handle(req, resp).await;

        match result {
            Ok(()) => {
                conditions::write_condition(&mut obj, conditions::success_condition(generation));
                req.object = Some(obj);
                Ok(())
            }
            Err(err) => match err.kind() {
                ErrorKind::Transient | ErrorKind::Terminal => {
                    conditions::write_condition(&mut obj, conditions::error_condition(err.kind(), err.to_string(), generation));
                    req.object = Some(obj);
                    resp.set_attribute("_errormiddleware:errored", serde_json::Value::Bool(true));
                    resp.disable_prune();
                    if err.kind() == ErrorKind::Terminal {
                        Ok(())
                    } else {
                        Err(err)
                    }
                }
                ErrorKind::Programmer | ErrorKind::Fatal => Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _req: &mut Request<'_>, _resp: &mut Response) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn dynamic_object(name: &str, deleting: bool) -> DynamicObject {
        let resource = kontrol_core::ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "App"));
        let mut obj = DynamicObject::new(name, &resource);
        if deleting {
            obj.metadata.deletion_timestamp =
                Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(k8s_openapi::chrono::Utc::now()));
        }
        obj
    }

    struct NullBackend;

    #[async_trait]
    impl Backend for NullBackend {
        async fn get(&self, _: &GroupVersionKind, _: Option<&str>, _: &str) -> Result<Option<DynamicObject>, BackendError> {
            Ok(None)
        }
        async fn list(&self, _: &GroupVersionKind, _: Option<&str>, _: Option<&str>) -> Result<Vec<DynamicObject>, BackendError> {
            Ok(vec![])
        }
        async fn create(&self, _: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, BackendError> {
            Ok(obj.clone())
        }
        async fn update(&self, _: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, BackendError> {
            Ok(obj.clone())
        }
        async fn update_status(&self, _: &GroupVersionKind, obj: &DynamicObject) -> Result<DynamicObject, BackendError> {
            Ok(obj.clone())
        }
        async fn delete(&self, _: &GroupVersionKind, _: Option<&str>, _: &str) -> Result<(), BackendError> {
            Ok(())
        }
        async fn ensure_watching(&self, _: &GroupVersionKind) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn request(obj: Option<DynamicObject>, backend: &NullBackend) -> Request<'_> {
        Request {
            gvk: GroupVersionKind::gvk("", "v1", "App"),
            key: Key::namespaced("default", "foo"),
            namespace: Some("default".to_owned()),
            name: "foo".to_owned(),
            object: obj,
            client: TriggerClient::new(backend),
            from_trigger: false,
        }
    }

    #[tokio::test]
    async fn ignore_deleted_filter_skips_absent_objects() {
        let backend = NullBackend;
        let inner = CountingHandler(AtomicUsize::new(0));
        let filter = IgnoreDeletedFilter { next: inner };
        let mut req = request(None, &backend);
        let mut resp = Response::new();
        filter.handle(&mut req, &mut resp).await.unwrap();
        assert_eq!(filter.next.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn error_condition_middleware_records_terminal_and_disables_prune() {
        struct Failing;
        #[async_trait]
        impl Handler for Failing {
            async fn handle(&self, _req: &mut Request<'_>, _resp: &mut Response) -> Result<(), HandlerError> {
                Err(HandlerError::terminal("credentials missing"))
            }
        }
        let backend = NullBackend;
        let mw = ErrorConditionMiddleware { next: Failing };
        let mut req = request(Some(dynamic_object("foo", false)), &backend);
        let mut resp = Response::new();
        let result = mw.handle(&mut req, &mut resp).await;
        assert!(result.is_ok(), "terminal errors are swallowed into a condition");
        assert!(resp.prune_disabled());
        let conds = conditions::read_conditions(req.object.as_ref().unwrap());
        assert_eq!(conds[0].status, "False");
        assert_eq!(conds[0].reason, "ErrTerminal");
        assert_eq!(conds[0].message, "credentials missing");
    }

    #[tokio::test]
    async fn error_condition_middleware_records_success() {
        let backend = NullBackend;
        let mw = ErrorConditionMiddleware {
            next: CountingHandler(AtomicUsize::new(0)),
        };
        let mut req = request(Some(dynamic_object("foo", false)), &backend);
        let mut resp = Response::new();
        mw.handle(&mut req, &mut resp).await.unwrap();
        let conds = conditions::read_conditions(req.object.as_ref().unwrap());
        assert_eq!(conds[0].status, "True");
    }
}
