//! Facade crate re-exporting the pieces of the cluster orchestration controller
//! framework: the object model ([`kontrol_core`]), the cluster API client
//! ([`kontrol_client`], behind the `client` feature), and the reconciliation /
//! trigger-graph / apply engine ([`kontrol_runtime`], behind the `runtime`
//! feature).
//!
//! Most applications only need:
//!
//! ```rust,no_run
//! use kontrol::{Client, Api, runtime::router::{Router, RouterConfig}};
//! ```

#![deny(missing_docs)]

pub use kontrol_core as core;
pub use kontrol_core::{Resource, ResourceExt};

#[cfg(feature = "client")]
pub use kontrol_client::{self as client, Api, Client, Config, Error};

#[cfg(feature = "runtime")]
pub use kontrol_runtime as runtime;

/// Re-exports commonly imported by reconciler implementations.
pub mod prelude {
    pub use kontrol_core::{Resource, ResourceExt};

    #[cfg(feature = "client")]
    pub use kontrol_client::{Api, Client};

    #[cfg(feature = "runtime")]
    pub use kontrol_runtime::handler::{Handler, Request, Response};
    #[cfg(feature = "runtime")]
    pub use kontrol_runtime::router::{Router, RouterConfig};
}
