//! The finalizer wrapper (spec §4.3 "Finalizers", §4.4 handler chain).
//!
//! Grounded on `pkg/router/finalizer.go`'s `FinalizerHandler`: it ensures
//! `finalizer_id` is present on an object before the wrapped handler ever sees it, and
//! on deletion lets handlers run one last time (in finalizer-registration order --
//! here, simply whichever `FinalizerMiddleware` currently owns the front of the
//! `finalizers` list) before removing their entry.

use async_trait::async_trait;

use crate::handler::{Handler, HandlerError, Request, Response};

/// Ensures `finalizer_id` is present before the wrapped handler runs, and runs it one
/// last time on deletion before removing the finalizer.
///
/// Handlers that do not opt into a finalizer are skipped entirely once the object is
/// being deleted (spec §4.3: "Handlers that do not opt in are skipped when the object
/// is being deleted").
pub struct FinalizerMiddleware<H> {
    pub finalizer_id: String,
    pub next: H,
}

#[async_trait]
impl<H: Handler> Handler for FinalizerMiddleware<H> {
    async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        let Some(obj) = req.object.clone() else {
            return Ok(());
        };

        if obj.meta().deletion_timestamp.is_none() {
            if !obj.finalizers().iter().any(|f| f == &self.finalizer_id) {
                let mut with_finalizer = obj;
                with_finalizer.finalizers_mut().push(self.finalizer_id.clone());
                let updated = req.client.update(&req.gvk, &with_finalizer).await?;
                req.object = Some(updated);
            }
            return Ok(());
        }

        let has_our_finalizer = obj.finalizers().first().is_some_and(|f| f == &self.finalizer_id);
        if !has_our_finalizer {
            // Another finalizer must run first; this handler does not opt in yet.
            return Ok(());
        }

        self.next.handle(req, resp).await?;

        let mut cleaned = req.object.clone().unwrap_or(obj);
        cleaned.finalizers_mut().retain(|f| f != &self.finalizer_id);
        let updated = req.client.update(&req.gvk, &cleaned).await?;
        req.object = Some(updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Backend, BackendError, TriggerClient};
    use crate::key::Key;
    use kontrol_client::api::DynamicObject;
    use kontrol_client::ResourceExt;
    use kontrol_core::gvk::GroupVersionKind;
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
    async fn finalizer_middleware_adds_finalizer_before_running_next() {
        let backend = NullBackend;
        let inner = CountingHandler(AtomicUsize::new(0));
        let mw = FinalizerMiddleware {
            finalizer_id: "apps.example/drain".to_owned(),
            next: inner,
        };
        let mut req = request(Some(dynamic_object("foo", false)), &backend);
        let mut resp = Response::new();
        mw.handle(&mut req, &mut resp).await.unwrap();
        // Finalizer addition short-circuits; the wrapped handler does not run yet.
        assert_eq!(mw.next.0.load(Ordering::SeqCst), 0);
        assert!(req.object.unwrap().finalizers().iter().any(|f| f == "apps.example/drain"));
    }

    #[tokio::test]
    async fn finalizer_middleware_runs_and_removes_on_delete() {
        let backend = NullBackend;
        let inner = CountingHandler(AtomicUsize::new(0));
        let mw = FinalizerMiddleware {
            finalizer_id: "apps.example/drain".to_owned(),
            next: inner,
        };
        let mut obj = dynamic_object("foo", true);
        obj.finalizers_mut().push("apps.example/drain".to_owned());
        let mut req = request(Some(obj), &backend);
        let mut resp = Response::new();
        mw.handle(&mut req, &mut resp).await.unwrap();
        assert_eq!(mw.next.0.load(Ordering::SeqCst), 1);
        assert!(req.object.unwrap().finalizers().is_empty());
    }

    #[tokio::test]
    async fn finalizer_middleware_skips_if_another_finalizer_goes_first() {
        let backend = NullBackend;
        let inner = CountingHandler(AtomicUsize::new(0));
        let mw = FinalizerMiddleware {
            finalizer_id: "apps.example/drain".to_owned(),
            next: inner,
        };
        let mut obj = dynamic_object("foo", true);
        obj.finalizers_mut().push("apps.example/other".to_owned());
        obj.finalizers_mut().push("apps.example/drain".to_owned());
        let mut req = request(Some(obj), &backend);
        let mut resp = Response::new();
        mw.handle(&mut req, &mut resp).await.unwrap();
        assert_eq!(mw.next.0.load(Ordering::SeqCst), 0);
        assert_eq!(req.object.unwrap().finalizers().len(), 2);
    }
}
