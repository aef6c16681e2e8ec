//! Cluster-facing implementations.
//!
//! Everything that actually talks to the Kubernetes API lives here:
//! the sandbox/pod runtime behind
//! [`quartermaster_engine::ClusterRuntime`], the registry credential
//! source behind [`quartermaster_registry::SecretSource`], and the
//! dynamic-object client behind
//! [`quartermaster_dao::ResourceClient`].

pub mod client;
pub mod resource;
pub mod runtime;
pub mod secrets;

pub use client::cluster_client;
pub use resource::KubeResourceClient;
pub use runtime::KubeRuntime;
pub use secrets::KubeSecretSource;
