//! OSB route handlers.
//!
//! Each handler delegates to the broker and maps its outcome onto the
//! response codes the OSB API prescribes: 201/200/202 per
//! `OperationStatus`, 410 with an empty JSON object for lifecycle
//! operations on absent resources, 409 for conflicting bodies, and 422
//! when async support is required but not offered.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use quartermaster_broker::{
    BindRequest, BrokerError, ErrorResponse, OperationStatus, ProvisionRequest, UpdateRequest,
};
use quartermaster_metrics::render_prometheus;

use crate::ApiState;

#[derive(Debug, Default, serde::Deserialize)]
pub struct AsyncQuery {
    #[serde(default)]
    pub accepts_incomplete: bool,
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct OperationQuery {
    #[serde(default)]
    pub operation: String,
}

fn success(status: OperationStatus, body: impl serde::Serialize) -> Response {
    let code = match status {
        OperationStatus::Created => StatusCode::CREATED,
        OperationStatus::Completed => StatusCode::OK,
        OperationStatus::Accepted => StatusCode::ACCEPTED,
    };
    (code, Json(body)).into_response()
}

fn describe(status: StatusCode, err: &BrokerError) -> Response {
    (
        status,
        Json(ErrorResponse {
            description: err.to_string(),
        }),
    )
        .into_response()
}

/// Gone answers carry an empty JSON object.
fn gone() -> Response {
    (StatusCode::GONE, Json(json!({}))).into_response()
}

fn internal(err: &BrokerError) -> Response {
    error!(error = %err, "broker request failed");
    describe(StatusCode::INTERNAL_SERVER_ERROR, err)
}

/// Instance and binding ids in the path are UUIDs; reject anything else
/// before it reaches the broker.
fn check_uuid(kind: &str, value: &str) -> Result<(), Response> {
    match Uuid::parse_str(value) {
        Ok(_) => Ok(()),
        Err(_) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                description: format!("{kind} '{value}' is not a valid UUID"),
            }),
        )
            .into_response()),
    }
}

/// GET /v2/catalog
pub async fn catalog(State(state): State<ApiState>) -> Response {
    match state.broker.catalog().await {
        Ok(catalog) => (StatusCode::OK, Json(catalog)).into_response(),
        Err(err) => internal(&err),
    }
}

/// PUT /v2/service_instances/{iid}
pub async fn provision(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    Query(query): Query<AsyncQuery>,
    Json(req): Json<ProvisionRequest>,
) -> Response {
    if let Err(response) = check_uuid("instance_id", &instance_id) {
        return response;
    }
    match state
        .broker
        .provision(&instance_id, &req, query.accepts_incomplete)
        .await
    {
        Ok((response, status)) => success(status, response),
        Err(
            err @ (BrokerError::SpecNotFound(_)
            | BrokerError::PlanNotFound(_)
            | BrokerError::InvalidRequest(_)),
        ) => describe(StatusCode::BAD_REQUEST, &err),
        Err(err @ BrokerError::Duplicate) => describe(StatusCode::CONFLICT, &err),
        Err(err @ (BrokerError::AsyncRequired | BrokerError::OperationInProgress)) => {
            describe(StatusCode::UNPROCESSABLE_ENTITY, &err)
        }
        Err(err) => internal(&err),
    }
}

/// PATCH /v2/service_instances/{iid}
pub async fn update(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    Query(query): Query<AsyncQuery>,
    Json(req): Json<UpdateRequest>,
) -> Response {
    if let Err(response) = check_uuid("instance_id", &instance_id) {
        return response;
    }
    match state
        .broker
        .update(&instance_id, &req, query.accepts_incomplete)
        .await
    {
        Ok((response, status)) => success(status, response),
        Err(
            err @ (BrokerError::InstanceNotFound
            | BrokerError::SpecNotFound(_)
            | BrokerError::PlanNotFound(_)
            | BrokerError::PlanTransitionNotPossible { .. }
            | BrokerError::InvalidRequest(_)),
        ) => describe(StatusCode::BAD_REQUEST, &err),
        Err(err @ (BrokerError::AsyncRequired | BrokerError::OperationInProgress)) => {
            describe(StatusCode::UNPROCESSABLE_ENTITY, &err)
        }
        Err(err) => internal(&err),
    }
}

/// DELETE /v2/service_instances/{iid}
pub async fn deprovision(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    Query(query): Query<AsyncQuery>,
) -> Response {
    if let Err(response) = check_uuid("instance_id", &instance_id) {
        return response;
    }
    match state
        .broker
        .deprovision(&instance_id, query.accepts_incomplete)
        .await
    {
        Ok((response, status)) => success(status, response),
        Err(BrokerError::InstanceNotFound) => gone(),
        Err(err @ (BrokerError::BindingExists | BrokerError::SpecNotFound(_))) => {
            describe(StatusCode::BAD_REQUEST, &err)
        }
        Err(err @ (BrokerError::AsyncRequired | BrokerError::OperationInProgress)) => {
            describe(StatusCode::UNPROCESSABLE_ENTITY, &err)
        }
        Err(err) => internal(&err),
    }
}

/// PUT /v2/service_instances/{iid}/service_bindings/{bid}
pub async fn bind(
    State(state): State<ApiState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Query(query): Query<AsyncQuery>,
    Json(req): Json<BindRequest>,
) -> Response {
    if let Err(response) =
        check_uuid("instance_id", &instance_id).and_then(|()| check_uuid("binding_id", &binding_id))
    {
        return response;
    }
    match state
        .broker
        .bind(&instance_id, &binding_id, &req, query.accepts_incomplete)
        .await
    {
        Ok((response, status)) => success(status, response),
        Err(
            err @ (BrokerError::InstanceNotFound
            | BrokerError::SpecNotFound(_)
            | BrokerError::PlanNotFound(_)
            | BrokerError::InvalidRequest(_)),
        ) => describe(StatusCode::BAD_REQUEST, &err),
        Err(err @ BrokerError::Duplicate) => describe(StatusCode::CONFLICT, &err),
        Err(err @ (BrokerError::AsyncRequired | BrokerError::OperationInProgress)) => {
            describe(StatusCode::UNPROCESSABLE_ENTITY, &err)
        }
        Err(err) => internal(&err),
    }
}

/// DELETE /v2/service_instances/{iid}/service_bindings/{bid}
pub async fn unbind(
    State(state): State<ApiState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Query(query): Query<AsyncQuery>,
) -> Response {
    if let Err(response) =
        check_uuid("instance_id", &instance_id).and_then(|()| check_uuid("binding_id", &binding_id))
    {
        return response;
    }
    match state
        .broker
        .unbind(&instance_id, &binding_id, query.accepts_incomplete)
        .await
    {
        Ok((response, status)) => success(status, response),
        Err(BrokerError::InstanceNotFound | BrokerError::BindingNotFound) => gone(),
        Err(err @ BrokerError::InvalidRequest(_)) => describe(StatusCode::BAD_REQUEST, &err),
        Err(err @ (BrokerError::AsyncRequired | BrokerError::OperationInProgress)) => {
            describe(StatusCode::UNPROCESSABLE_ENTITY, &err)
        }
        Err(err) => internal(&err),
    }
}

/// GET /v2/service_instances/{iid}/last_operation
pub async fn last_operation(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    Query(query): Query<OperationQuery>,
) -> Response {
    if let Err(response) = check_uuid("instance_id", &instance_id) {
        return response;
    }
    match state
        .broker
        .last_operation(&instance_id, &query.operation)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err @ BrokerError::InvalidRequest(_)) => describe(StatusCode::BAD_REQUEST, &err),
        Err(BrokerError::InstanceNotFound) => gone(),
        Err(err) => internal(&err),
    }
}

/// POST /v2/bootstrap (dev mode)
pub async fn bootstrap(State(state): State<ApiState>) -> Response {
    match state.broker.bootstrap().await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => internal(&err),
    }
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = render_prometheus(&state.metrics.snapshot().await);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
