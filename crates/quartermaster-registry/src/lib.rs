//! quartermaster-registry — sourcing bundle specs from container registries.
//!
//! A `Registry` pairs one adapter (Docker Hub, Quay, a plain v2 API
//! registry, Ansible Galaxy, a Helm repository, or a static list) with a
//! white/black regex filter and produces the validated set of bundle specs
//! the broker publishes in its catalog.

pub mod adapters;
pub mod auth;
pub mod error;
pub mod filter;
pub mod manifest;
pub mod oci;
pub mod registry;

pub use auth::{RegistryCredentials, SecretSource};
pub use error::{RegistryError, RegistryResult};
pub use filter::Filter;
pub use registry::Registry;
