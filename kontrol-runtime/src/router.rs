//! The top-level entry point: wires a [`kontrol_client::Client`] to the
//! [`crate::dispatcher::Dispatcher`], exposes the typed configuration surface from spec
//! §6, and drives the startup protocol (spec §4.1 "Startup protocol").
//!
//! Grounded on `pkg/router/router.go`'s `Start`/`DefaultRouter` and the teacher's
//! `kube_runtime::Controller` builder-pattern configuration (`Config::default()` with
//! a `concurrency()` setter).

use std::{collections::HashMap, sync::Arc};

use kontrol_core::gvk::GroupVersionKind;
use kontrol_client::{Api, Client};
use parking_lot::RwLock;
use tracing::info;

use crate::{
    dispatcher::{Dispatcher, RouteOptions},
    handler::{BackendError, Handler},
    lease::{Elector, RunError as LeaseRunError},
};

/// Typed surface for spec §6's Configuration table, with defaults matching the
/// documented values (`threadiness: 5`, `healthzPort: 8888`).
pub struct RouterConfig {
    /// Ownership sub-context; also the leader-election lease name.
    pub router_name: String,
    /// Namespace used when handlers/apply specify none.
    pub default_namespace: Option<String>,
    /// Port for the health probe server; `0` disables it. Serving the probes over HTTP
    /// is out of scope (spec §1) -- this only gates [`Router::is_healthy`]'s caller.
    pub healthz_port: u16,
    /// Workers per GVK queue.
    pub threadiness: usize,
    /// When set, the router only reconciles while it holds the named lease.
    pub election_config: Option<ElectionConfig>,
    /// Per-API-group client overrides, for routing different groups to different
    /// clusters/credentials.
    pub api_group_configs: HashMap<String, Client>,
}

impl RouterConfig {
    #[must_use]
    pub fn new(router_name: impl Into<String>) -> Self {
        Self {
            router_name: router_name.into(),
            default_namespace: None,
            healthz_port: 8888,
            threadiness: threadiness_from_env().unwrap_or(5),
            election_config: None,
            api_group_configs: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_default_namespace(mut self, ns: impl Into<String>) -> Self {
        self.default_namespace = Some(ns.into());
        self
    }

    #[must_use]
    pub fn with_healthz_port(mut self, port: u16) -> Self {
        self.healthz_port = port;
        self
    }

    #[must_use]
    pub fn with_threadiness(mut self, n: usize) -> Self {
        self.threadiness = n;
        self
    }

    #[must_use]
    pub fn with_election(mut self, config: ElectionConfig) -> Self {
        self.election_config = Some(config);
        self
    }

    #[must_use]
    pub fn with_api_group_client(mut self, group: impl Into<String>, client: Client) -> Self {
        self.api_group_configs.insert(group.into(), client);
        self
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new("kontrol")
    }
}

/// `threadiness` is documented as "env-overridable" (spec §6 Configuration table);
/// an unset or unparsable variable falls back to the compiled-in default of 5.
fn threadiness_from_env() -> Option<usize> {
    std::env::var("KONTROL_THREADINESS").ok()?.parse().ok()
}

/// Leader-election parameters: the lease name defaults to `RouterConfig::router_name`,
/// scoped to `namespace`.
pub struct ElectionConfig {
    pub namespace: String,
    pub identity: String,
    pub lease_duration_secs: i32,
}

/// One registered GVK's informer-sync status, tracked so [`Router::is_ready`] can
/// aggregate across every GVK the router was asked to watch (spec §6 "health and
/// readiness").
struct Registration {
    synced: std::sync::atomic::AtomicBool,
}

/// Owns the [`Dispatcher`] and every registration, and drives startup.
pub struct Router {
    config: RouterConfig,
    client: Client,
    dispatcher: Arc<Dispatcher>,
    registrations: RwLock<HashMap<GroupVersionKind, Arc<Registration>>>,
}

impl Router {
    #[must_use]
    pub fn new(client: Client, config: RouterConfig) -> Self {
        let dispatcher = Arc::new(Dispatcher::with_threadiness(
            client.clone(),
            config.router_name.clone(),
            config.threadiness,
        ));
        Self {
            config,
            client,
            dispatcher,
            registrations: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler chain for `gvk` (spec §3 "Handler registration").
    ///
    /// Registering a GVK whose group has no matching entry in
    /// `api_group_configs`, when that map is non-empty, is a programmer error: it would
    /// silently watch the wrong cluster. Caught eagerly here rather than surfacing as a
    /// reconciliation-time `BackendError` later (spec §7 "fail fast").
    pub fn register(&self, gvk: GroupVersionKind, handler: Arc<dyn Handler>, options: RouteOptions) {
        if !self.config.api_group_configs.is_empty() && !self.config.api_group_configs.contains_key(&gvk.group) {
            panic!(
                "registered {gvk:?} whose group {:?} has no entry in RouterConfig::api_group_configs",
                gvk.group
            );
        }
        self.registrations.write().insert(
            gvk.clone(),
            Arc::new(Registration {
                synced: std::sync::atomic::AtomicBool::new(false),
            }),
        );
        self.dispatcher.register(gvk, handler, options);
    }

    /// Start every registered GVK's queue, blocking until each informer's initial list
    /// has synced, then seed post-start registration triggers by listing and enqueuing
    /// every existing object (spec §4.1 "Startup protocol").
    ///
    /// If `election_config` is set, the returned future only resolves once the router
    /// has acquired (and released) the leader-election lease; reconciliation itself
    /// runs for as long as the lease is held.
    pub async fn start(self: Arc<Self>) -> Result<(), RouterError> {
        if let Some(election) = &self.config.election_config {
            let lease_api: Api<k8s_openapi::api::coordination::v1::Lease> =
                Api::namespaced(self.client.clone(), &election.namespace);
            let elector = Elector::new(
                lease_api,
                &self.config.router_name,
                &election.identity,
                election.lease_duration_secs,
            );
            let this = Arc::clone(&self);
            return elector
                .run(async move { this.run_registered().await })
                .await
                .map_err(RouterError::Election)?;
        }
        self.run_registered().await
    }

    async fn run_registered(&self) -> Result<(), RouterError> {
        let gvks: Vec<GroupVersionKind> = self.registrations.read().keys().cloned().collect();
        for gvk in &gvks {
            self.dispatcher.seed(gvk).await.map_err(RouterError::Seed)?;
            if let Some(reg) = self.registrations.read().get(gvk) {
                reg.synced.store(true, std::sync::atomic::Ordering::SeqCst);
            }
            info!(gvk = ?gvk, router = %self.config.router_name, "registration synced and seeded");
        }
        Ok(())
    }

    /// Whether every registered GVK's informer has completed its initial sync.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.registrations
            .read()
            .values()
            .all(|r| r.synced.load(std::sync::atomic::Ordering::SeqCst))
    }

    /// Liveness: the router considers itself healthy once it exists. A real health
    /// server (out of scope, spec §1) would additionally poll `is_ready`.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        true
    }

    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("leader election failed")]
    Election(#[source] LeaseRunError),
    #[error("failed to seed initial work for a registered gvk")]
    Seed(#[source] BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.threadiness, 5);
        assert_eq!(config.healthz_port, 8888);
        assert!(config.election_config.is_none());
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = RouterConfig::new("my-router")
            .with_default_namespace("apps")
            .with_healthz_port(0)
            .with_threadiness(10);
        assert_eq!(config.router_name, "my-router");
        assert_eq!(config.default_namespace.as_deref(), Some("apps"));
        assert_eq!(config.healthz_port, 0);
        assert_eq!(config.threadiness, 10);
    }
}
