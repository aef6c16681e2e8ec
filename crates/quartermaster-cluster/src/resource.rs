//! Dynamic-object storage for the typed-resource DAO backend.
//!
//! Broker state is persisted as custom resources in a single API group.
//! Each document's JSON body lives under the object's `spec` field, and
//! the DAO's labels become resource labels so recovery queries run as
//! label selectors on the API server.

use std::collections::HashMap;

use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams,
};
use kube::Client;
use serde_json::{json, Value};
use tracing::debug;

use quartermaster_dao::{DaoError, DaoResult, ResourceClient, ResourceKind};

const GROUP: &str = "automationbroker.io";
const VERSION: &str = "v1alpha1";

fn kind_name(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Spec => "Bundle",
        ResourceKind::ServiceInstance => "BundleInstance",
        ResourceKind::BindInstance => "BundleBinding",
        ResourceKind::JobState => "JobState",
    }
}

/// Label values cannot contain spaces; job states like "in progress"
/// are stored dashed. Applied to both writes and selectors, so lookups
/// stay consistent.
fn label_value(value: &str) -> String {
    value.replace(' ', "-")
}

fn selector_string(selector: &HashMap<String, String>) -> String {
    let mut parts: Vec<String> = selector
        .iter()
        .map(|(k, v)| format!("{k}={}", label_value(v)))
        .collect();
    parts.sort();
    parts.join(",")
}

/// [`ResourceClient`] over namespaced custom resources.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
    namespace: String,
}

impl KubeResourceClient {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn api(&self, kind: ResourceKind) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(GROUP, VERSION, kind_name(kind));
        let resource = ApiResource::from_gvk_with_plural(&gvk, kind.as_str());
        Api::namespaced_with(self.client.clone(), &self.namespace, &resource)
    }

    fn object(
        &self,
        kind: ResourceKind,
        name: &str,
        labels: &HashMap<String, String>,
        body: &Value,
    ) -> DynamicObject {
        let gvk = GroupVersionKind::gvk(GROUP, VERSION, kind_name(kind));
        let resource = ApiResource::from_gvk_with_plural(&gvk, kind.as_str());
        let mut obj = DynamicObject::new(name, &resource);
        obj.metadata.namespace = Some(self.namespace.clone());
        obj.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.clone(), label_value(v)))
                .collect(),
        );
        obj.data = json!({ "spec": body });
        obj
    }
}

fn body_of(obj: &DynamicObject) -> Value {
    obj.data.get("spec").cloned().unwrap_or(Value::Null)
}

fn is_api_code(e: &kube::Error, code: u16) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == code)
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn get(&self, kind: ResourceKind, name: &str) -> DaoResult<Option<Value>> {
        let obj = self
            .api(kind)
            .get_opt(name)
            .await
            .map_err(|e| DaoError::Read(e.to_string()))?;
        Ok(obj.map(|obj| body_of(&obj)))
    }

    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        labels: &HashMap<String, String>,
        body: &Value,
    ) -> DaoResult<()> {
        let obj = self.object(kind, name, labels, body);
        match self.api(kind).create(&PostParams::default(), &obj).await {
            Ok(_) => {
                debug!(kind = kind.as_str(), name, "created resource");
                Ok(())
            }
            Err(e) if is_api_code(&e, 409) => {
                Err(DaoError::AlreadyExists(format!("{}/{name}", kind.as_str())))
            }
            Err(e) => Err(DaoError::Write(e.to_string())),
        }
    }

    async fn update(
        &self,
        kind: ResourceKind,
        name: &str,
        labels: &HashMap<String, String>,
        body: &Value,
    ) -> DaoResult<()> {
        let api = self.api(kind);
        // Replace, not merge: dropped fields must not linger.
        let mut existing = api
            .get_opt(name)
            .await
            .map_err(|e| DaoError::Read(e.to_string()))?
            .ok_or_else(|| DaoError::NotFound(format!("{}/{name}", kind.as_str())))?;
        existing.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.clone(), label_value(v)))
                .collect(),
        );
        existing.data = json!({ "spec": body });
        api.replace(name, &PostParams::default(), &existing)
            .await
            .map_err(|e| DaoError::Write(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> DaoResult<bool> {
        match self.api(kind).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_api_code(&e, 404) => Ok(false),
            Err(e) => Err(DaoError::Write(e.to_string())),
        }
    }

    async fn list(
        &self,
        kind: ResourceKind,
        selector: &HashMap<String, String>,
    ) -> DaoResult<Vec<(String, HashMap<String, String>, Value)>> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector_string(selector));
        }
        let objects = self
            .api(kind)
            .list(&params)
            .await
            .map_err(|e| DaoError::Read(e.to_string()))?;

        Ok(objects
            .items
            .into_iter()
            .map(|obj| {
                let name = obj.metadata.name.clone().unwrap_or_default();
                let labels = obj
                    .metadata
                    .labels
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                let body = body_of(&obj);
                (name, labels, body)
            })
            .collect())
    }
}
