//! Service registration and discovery

pub mod service;

pub use service::{AddressFamily, ServiceEndpoint, ServiceRecord, ServiceRegistry};
