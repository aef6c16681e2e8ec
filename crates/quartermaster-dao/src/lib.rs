//! Persistence layer for broker state.
//!
//! Two backends serve the same [`BrokerDao`] contract: an embedded
//! hierarchical key-value store ([`kv::KvDao`]) and a typed-resource
//! store ([`resource::ResourceDao`]) that persists broker state as
//! labelled cluster resources.

pub mod convert;
pub mod kv;
pub mod resource;
pub mod wire;

use async_trait::async_trait;
use thiserror::Error;

use qm_core::{BindInstance, InstanceId, JobState, ServiceInstance, Spec, State};

pub use kv::KvDao;
pub use resource::{MemoryResourceClient, ResourceClient, ResourceDao, ResourceKind};

/// Result type alias for DAO operations.
pub type DaoResult<T> = Result<T, DaoError>;

/// Errors that can occur during DAO operations.
#[derive(Debug, Error)]
pub enum DaoError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Whether an error is the DAO's not-found marker.
pub fn is_not_found(err: &DaoError) -> bool {
    matches!(err, DaoError::NotFound(_))
}

/// A job state paired with the instance it belongs to, as returned by
/// cross-instance job queries during recovery.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoverStatus {
    pub instance_id: InstanceId,
    pub state: JobState,
}

/// Storage contract for broker state.
///
/// Job-state writes never regress a terminal state: once a job is
/// succeeded or failed, later writes for the same token are dropped.
#[async_trait]
pub trait BrokerDao: Send + Sync {
    async fn get_spec(&self, id: &str) -> DaoResult<Spec>;
    async fn set_spec(&self, spec: &Spec) -> DaoResult<()>;
    async fn delete_spec(&self, id: &str) -> DaoResult<()>;
    async fn batch_get_specs(&self) -> DaoResult<Vec<Spec>>;
    async fn batch_set_specs(&self, specs: &[Spec]) -> DaoResult<()>;
    async fn batch_delete_specs(&self, specs: &[Spec]) -> DaoResult<()>;

    async fn get_service_instance(&self, id: &str) -> DaoResult<ServiceInstance>;
    async fn set_service_instance(&self, instance: &ServiceInstance) -> DaoResult<()>;
    async fn delete_service_instance(&self, id: &str) -> DaoResult<()>;

    async fn get_bind_instance(&self, id: &str) -> DaoResult<BindInstance>;
    async fn set_bind_instance(&self, binding: &BindInstance) -> DaoResult<()>;
    async fn delete_bind_instance(&self, id: &str) -> DaoResult<()>;

    /// Delete a binding and unlink it from its service instance.
    /// The binding record goes first so a crash can never leave a
    /// dangling id in the instance's binding set.
    async fn delete_binding(
        &self,
        binding: &BindInstance,
        instance: &ServiceInstance,
    ) -> DaoResult<()> {
        self.delete_bind_instance(&binding.id).await?;
        let mut updated = instance.clone();
        updated.remove_binding(&binding.id);
        self.set_service_instance(&updated).await
    }

    /// Persist a job state for an instance. Returns the state key.
    async fn set_state(&self, instance_id: &str, state: &JobState) -> DaoResult<String>;
    async fn get_state(&self, instance_id: &str, token: &str) -> DaoResult<JobState>;
    async fn get_state_by_key(&self, key: &str) -> DaoResult<JobState>;

    /// All jobs in the given state, across all instances.
    async fn find_job_state_by_state(&self, state: State) -> DaoResult<Vec<RecoverStatus>>;

    /// All jobs for one instance in the given state.
    async fn get_svc_inst_jobs_by_state(
        &self,
        instance_id: &str,
        state: State,
    ) -> DaoResult<Vec<JobState>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_classification() {
        assert!(is_not_found(&DaoError::NotFound("x".to_string())));
        assert!(!is_not_found(&DaoError::Read("x".to_string())));
    }
}
