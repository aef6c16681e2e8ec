//! The Open Service Broker itself.
//!
//! [`broker::Broker`] validates OSB requests against persisted state
//! and hands the lifecycle work to the job coordinator. The catalog is
//! aggregated from the configured registries at bootstrap; service and
//! plan ids are derived from fully-qualified spec names so a rebuilt
//! catalog keeps its ids.

pub mod broker;
pub mod error;
pub mod naming;
pub mod schema;
pub mod types;

pub use broker::{Broker, OperationStatus};
pub use error::{BrokerError, BrokerResult};
pub use schema::spec_to_service;
pub use types::{
    BindRequest, BindResponse, BootstrapResponse, CatalogResponse, DeprovisionResponse,
    ErrorResponse, LastOperationResponse, ProvisionRequest, ProvisionResponse, Service,
    ServicePlan, UnbindResponse, UpdateRequest, UpdateResponse,
};
