//! Execution engine for bundle actions.
//!
//! Lifecycle operations (provision, bind, ...) run as short-lived pods
//! inside a sandbox. The [`coordinator::JobCoordinator`] owns the job
//! state machine; the cluster itself is reached through the
//! [`runtime::ClusterRuntime`] trait so everything here tests against
//! [`runtime::MockRuntime`].

pub mod coordinator;
pub mod credentials;
pub mod runtime;

use thiserror::Error;

pub use coordinator::{JobCoordinator, JobRequest};
pub use credentials::extract_credentials;
pub use runtime::{ClusterRuntime, MockRuntime, PodOutcome, PodRequest, PodStatus, Sandbox};

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while coordinating bundle actions.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("dao error: {0}")]
    Dao(#[from] quartermaster_dao::DaoError),

    #[error("cluster runtime error: {0}")]
    Runtime(String),

    #[error("invalid request: {0}")]
    Request(String),

    #[error("an operation is already in progress for instance {0}")]
    Conflict(String),

    #[error("bind credentials could not be decoded: {0}")]
    Credentials(String),

    #[error("job failed: {0}")]
    JobFailure(String),
}
