//! Named service routing for the exposer broker
//!
//! The broker keeps one [`ServiceRegistry`] for its whole lifetime. Expose
//! sessions reserve a name, bind their multiplexed session to it, and remove
//! it when the session dies; link sessions and the HTTP gateway look
//! services up by name.

pub mod attribute;
pub mod registry;
pub mod service;

pub use attribute::AttributeStore;
pub use registry::{RegistryError, ServiceRegistry};
pub use service::{CloseFn, OpenFn, Service, ServiceError};
