//! Admission webhook matching and dispatch (spec §6 "Admission webhook (peripheral)").
//!
//! Grounded on `pkg/webhook/match.go` (rule matching by group/version/kind/resource/
//! subresource/name/namespace/operation/dry-run) and `pkg/webhook/router.go` (dispatch
//! to a user handler, JSON-Patch response computed by diffing the handler's mutated
//! object against the incoming one). Serving this over HTTP is out of scope (spec §1);
//! this module only covers the matching/dispatch logic an HTTP layer would call into.

use async_trait::async_trait;
use serde_json::Value;

/// The kind of admission operation an incoming request represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

/// A single admission request, already decoded from the `AdmissionReview` envelope an
/// (out-of-scope) HTTP layer would parse.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub resource: String,
    pub subresource: Option<String>,
    pub name: String,
    pub namespace: Option<String>,
    pub operation: Operation,
    pub dry_run: bool,
    pub object: Value,
}

/// What a webhook handler decided: allow or deny, an optional JSON-Patch mutation, and
/// any warnings to surface to the caller.
#[derive(Debug, Clone)]
pub struct AdmissionResponse {
    pub allowed: bool,
    pub reason: Option<String>,
    pub patch: Option<json_patch::Patch>,
    pub warnings: Vec<String>,
}

impl AdmissionResponse {
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            patch: None,
            warnings: Vec::new(),
        }
    }

    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            patch: None,
            warnings: Vec::new(),
        }
    }
}

/// A user-supplied admission callback. Handlers that mutate return the object as they
/// want it to end up; [`WebhookRouter::admit`] computes the JSON-Patch diff itself so
/// handlers never construct patches by hand (spec §6: "JSON-Patch responses computed
/// by diffing the handler's mutated object against the incoming one").
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn admit(&self, req: &AdmissionRequest) -> AdmissionOutcome;
}

/// What a [`WebhookHandler`] returns: either a straight allow/deny, or a mutated copy
/// of the object for the router to diff into a patch.
pub enum AdmissionOutcome {
    Allow,
    Deny(String),
    Mutate(Value),
}

/// One registration: which requests a handler wants to see, expressed the same way as
/// [`crate::trigger::Matcher`] -- `None` in any field means "match any".
#[derive(Debug, Clone, Default)]
pub struct Rule {
    pub group: Option<String>,
    pub version: Option<String>,
    pub kind: Option<String>,
    pub resource: Option<String>,
    pub subresource: Option<String>,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub operations: Option<Vec<Operation>>,
    /// When `Some(false)`, this rule is skipped for dry-run requests; when `Some(true)`,
    /// it only matches dry-run requests; `None` matches either.
    pub dry_run: Option<bool>,
}

impl Rule {
    #[must_use]
    pub fn matches(&self, req: &AdmissionRequest) -> bool {
        field_matches(&self.group, &req.group)
            && field_matches(&self.version, &req.version)
            && field_matches(&self.kind, &req.kind)
            && field_matches(&self.resource, &req.resource)
            && option_matches(&self.subresource, &req.subresource)
            && field_matches(&self.name, &req.name)
            && option_matches(&self.namespace, &req.namespace)
            && self
                .operations
                .as_ref()
                .is_none_or(|ops| ops.contains(&req.operation))
            && self.dry_run.is_none_or(|want| want == req.dry_run)
    }
}

fn field_matches(want: &Option<String>, actual: &str) -> bool {
    want.as_deref().is_none_or(|w| w == actual)
}

fn option_matches(want: &Option<String>, actual: &Option<String>) -> bool {
    match (want, actual) {
        (None, _) => true,
        (Some(w), Some(a)) => w == a,
        (Some(_), None) => false,
    }
}

struct Route {
    rule: Rule,
    handler: Box<dyn WebhookHandler>,
}

/// Matches incoming admission requests against registered rules, in registration
/// order, and dispatches to the first match (`pkg/webhook/router.go`'s linear scan).
#[derive(Default)]
pub struct WebhookRouter {
    routes: Vec<Route>,
}

impl WebhookRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rule: Rule, handler: impl WebhookHandler + 'static) {
        self.routes.push(Route {
            rule,
            handler: Box::new(handler),
        });
    }

    /// Find the first matching route and run its handler, diffing a [`AdmissionOutcome::Mutate`]
    /// result against the incoming object to produce a patch. Requests matching no
    /// route are allowed unconditionally, mirroring the original's default-allow when
    /// no webhook opted in.
    pub async fn admit(&self, req: &AdmissionRequest) -> AdmissionResponse {
        let Some(route) = self.routes.iter().find(|r| r.rule.matches(req)) else {
            return AdmissionResponse::allow();
        };
        match route.handler.admit(req).await {
            AdmissionOutcome::Allow => AdmissionResponse::allow(),
            AdmissionOutcome::Deny(reason) => AdmissionResponse::deny(reason),
            AdmissionOutcome::Mutate(mutated) => {
                let patch = json_patch::diff(&req.object, &mutated);
                AdmissionResponse {
                    allowed: true,
                    reason: None,
                    patch: Some(patch),
                    warnings: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(op: Operation) -> AdmissionRequest {
        AdmissionRequest {
            group: "apps.example".to_owned(),
            version: "v1".to_owned(),
            kind: "App".to_owned(),
            resource: "apps".to_owned(),
            subresource: None,
            name: "foo".to_owned(),
            namespace: Some("default".to_owned()),
            operation: op,
            dry_run: false,
            object: serde_json::json!({"spec": {"replicas": 1}}),
        }
    }

    struct SetReplicas(i64);

    #[async_trait]
    impl WebhookHandler for SetReplicas {
        async fn admit(&self, req: &AdmissionRequest) -> AdmissionOutcome {
            let mut obj = req.object.clone();
            obj["spec"]["replicas"] = serde_json::json!(self.0);
            AdmissionOutcome::Mutate(obj)
        }
    }

    #[tokio::test]
    async fn unmatched_request_is_allowed_by_default() {
        let router = WebhookRouter::new();
        let resp = router.admit(&request(Operation::Create)).await;
        assert!(resp.allowed);
        assert!(resp.patch.is_none());
    }

    #[tokio::test]
    async fn matched_rule_dispatches_and_diffs_mutation_into_a_patch() {
        let mut router = WebhookRouter::new();
        router.register(
            Rule {
                kind: Some("App".to_owned()),
                operations: Some(vec![Operation::Create]),
                ..Rule::default()
            },
            SetReplicas(3),
        );
        let resp = router.admit(&request(Operation::Create)).await;
        assert!(resp.allowed);
        let patch = resp.patch.expect("mutation should produce a patch");
        assert!(!patch.0.is_empty());
    }

    #[tokio::test]
    async fn operation_mismatch_falls_through_to_default_allow() {
        let mut router = WebhookRouter::new();
        router.register(
            Rule {
                kind: Some("App".to_owned()),
                operations: Some(vec![Operation::Delete]),
                ..Rule::default()
            },
            SetReplicas(3),
        );
        let resp = router.admit(&request(Operation::Create)).await;
        assert!(resp.allowed);
        assert!(resp.patch.is_none());
    }

    #[tokio::test]
    async fn deny_outcome_carries_its_reason() {
        struct AlwaysDeny;
        #[async_trait]
        impl WebhookHandler for AlwaysDeny {
            async fn admit(&self, _req: &AdmissionRequest) -> AdmissionOutcome {
                AdmissionOutcome::Deny("replicas must be positive".to_owned())
            }
        }
        let mut router = WebhookRouter::new();
        router.register(Rule::default(), AlwaysDeny);
        let resp = router.admit(&request(Operation::Update)).await;
        assert!(!resp.allowed);
        assert_eq!(resp.reason.as_deref(), Some("replicas must be positive"));
    }
}
