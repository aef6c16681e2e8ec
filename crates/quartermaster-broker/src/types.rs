//! Open Service Broker wire types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use qm_core::{Context, Parameters};

/// Body of `GET /v2/catalog`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogResponse {
    pub services: Vec<Service>,
}

/// One service class offered in the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub bindable: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    pub plan_updateable: bool,
    pub plans: Vec<ServicePlan>,
}

/// One plan of a service class, schemas included.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicePlan {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    pub free: bool,
    pub bindable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates_to: Vec<String>,
    pub schemas: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default)]
    pub organization_guid: String,
    pub plan_id: String,
    pub service_id: String,
    #[serde(default)]
    pub space_guid: String,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub parameters: Option<Parameters>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

/// Plan and org the instance had before an update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreviousValues {
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub space_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub parameters: Option<Parameters>,
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub previous_values: PreviousValues,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindResource {
    #[serde(default)]
    pub app_guid: String,
    #[serde(default)]
    pub route: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindRequest {
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub app_guid: String,
    #[serde(default)]
    pub bind_resource: BindResource,
    #[serde(default)]
    pub parameters: Option<Parameters>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindResponse {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub credentials: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog_drain_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeprovisionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnbindResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

/// Body of a last-operation poll. `state` is one of "in progress",
/// "succeeded", or "failed".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastOperationResponse {
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Body of the development-mode bootstrap endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapResponse {
    pub spec_count: usize,
    pub image_count: usize,
}

/// Error body returned for every non-2xx response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_is_omitted_when_absent() {
        let sync = serde_json::to_value(ProvisionResponse::default()).unwrap();
        assert_eq!(sync, json!({}));

        let accepted = serde_json::to_value(ProvisionResponse {
            operation: Some("token-1".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(accepted, json!({"operation": "token-1"}));
    }

    #[test]
    fn provision_request_tolerates_missing_optional_fields() {
        let body = json!({
            "plan_id": "plan-1",
            "service_id": "svc-1",
            "context": {"platform": "kubernetes", "namespace": "apps"}
        });
        let req: ProvisionRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.context.namespace, "apps");
        assert!(req.parameters.is_none());
        assert!(req.organization_guid.is_empty());
    }

    #[test]
    fn bind_response_hides_empty_credentials() {
        let pending = serde_json::to_value(BindResponse {
            operation: Some("t".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(pending, json!({"operation": "t"}));
    }
}
