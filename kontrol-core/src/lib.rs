#[cfg(feature = "admission")] pub mod admission;

pub mod api_resource;
pub use api_resource::ApiResource;
pub mod dynamic;
pub use dynamic::DynamicObject;

pub mod gvk;
pub use gvk::{GroupVersionKind, GroupVersionResource};

pub mod labels;
pub use labels::Selector;

pub mod metadata;

pub mod object;

pub mod watch;
pub use watch::WatchEvent;

pub mod params;

pub mod request;
pub use request::Request;

mod resource;
pub use resource::{ObjectMeta, Resource, ResourceExt};

pub mod response;

pub mod subresource;

mod error;
pub use error::{Error, ErrorResponse};
pub type Result<T, E = Error> = std::result::Result<T, E>;
