//! quartermaster-api — the broker's HTTP surface.
//!
//! axum route handlers for the Open Service Broker API, plus the
//! Prometheus exposition endpoint. OSB routes sit behind an
//! API-version check and optional basic auth.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/v2/catalog` | Services and plans |
//! | PUT | `/v2/service_instances/{iid}` | Provision |
//! | PATCH | `/v2/service_instances/{iid}` | Update |
//! | DELETE | `/v2/service_instances/{iid}` | Deprovision |
//! | GET | `/v2/service_instances/{iid}/last_operation` | Poll a job |
//! | PUT | `/v2/service_instances/{iid}/service_bindings/{bid}` | Bind |
//! | DELETE | `/v2/service_instances/{iid}/service_bindings/{bid}` | Unbind |
//! | POST | `/v2/bootstrap` | Reload the catalog (dev mode only) |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod middleware;

use std::sync::Arc;

use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post, put};

use quartermaster_broker::Broker;
use quartermaster_metrics::BrokerMetrics;

/// Credentials the basic-auth middleware checks against.
#[derive(Clone)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub broker: Arc<Broker>,
    pub metrics: BrokerMetrics,
    /// When set, OSB routes require matching basic auth.
    pub auth: Option<BasicCredentials>,
}

/// Build the complete broker router (OSB + metrics).
pub fn build_router(
    broker: Arc<Broker>,
    metrics: BrokerMetrics,
    auth: Option<BasicCredentials>,
    dev_broker: bool,
) -> Router {
    let state = ApiState {
        broker,
        metrics,
        auth,
    };

    let mut osb = Router::new()
        .route("/catalog", get(handlers::catalog))
        .route(
            "/service_instances/{instance_id}",
            put(handlers::provision)
                .patch(handlers::update)
                .delete(handlers::deprovision),
        )
        .route(
            "/service_instances/{instance_id}/last_operation",
            get(handlers::last_operation),
        )
        .route(
            "/service_instances/{instance_id}/service_bindings/{binding_id}",
            put(handlers::bind).delete(handlers::unbind),
        );
    if dev_broker {
        osb = osb.route("/bootstrap", post(handlers::bootstrap));
    }
    let osb = osb
        .layer(from_fn(middleware::require_api_version))
        .layer(from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state.clone());

    Router::new()
        .nest("/v2", osb)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
