//! Broker error taxonomy.
//!
//! These errors are sentinels for the HTTP layer: each variant maps to
//! one OSB response (gone, conflict, async-required, and so on).

use thiserror::Error;

use qm_core::JobMethod;
use quartermaster_dao::DaoError;
use quartermaster_engine::EngineError;
use quartermaster_registry::RegistryError;

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("service instance not found")]
    InstanceNotFound,

    #[error("binding not found")]
    BindingNotFound,

    #[error("service class {0} not found")]
    SpecNotFound(String),

    #[error("plan {0} not found")]
    PlanNotFound(String),

    /// Same id, different request body.
    #[error("resource already exists with different attributes")]
    Duplicate,

    #[error("service instance has active bindings")]
    BindingExists,

    #[error("this service plan requires client support for asynchronous service operations")]
    AsyncRequired,

    /// A conflicting job is already running against the instance.
    #[error("another operation for this service instance is in progress")]
    OperationInProgress,

    #[error("plan transition from '{from}' to '{to}' is not possible")]
    PlanTransitionNotPossible { from: String, to: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no credentials found for instance {0}")]
    CredentialsNotFound(String),

    #[error("{method} failed: {reason}")]
    JobFailed { method: JobMethod, reason: String },

    #[error("all registries failed to load specs")]
    AllRegistriesFailed,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dao(#[from] DaoError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
