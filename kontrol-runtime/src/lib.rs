#![deny(clippy::all)]
#![deny(clippy::pedantic)]
// Triggered by many derive macros (educe, async-trait)
#![allow(clippy::default_trait_access)]
#![allow(clippy::module_name_repetitions)]

pub mod apply;
pub mod cache;
pub mod conditions;
pub mod dispatcher;
pub mod finalizer;
pub mod handler;
pub mod key;
pub mod lease;
pub mod lock;
pub mod ratelimiter;
pub mod reflector;
pub mod router;
pub mod scheduler;
pub mod trigger;
pub mod utils;
pub mod watcher;
pub mod webhook;

pub use dispatcher::{ClusterBackend, Dispatcher};
pub use handler::{Handler, HandlerError, Request, Response};
pub use key::Key;
pub use reflector::reflector;
pub use router::{Router, RouterConfig};
pub use scheduler::scheduler;
pub use trigger::{Matcher, TriggerGraph};
pub use watcher::watcher;
pub use webhook::WebhookRouter;
