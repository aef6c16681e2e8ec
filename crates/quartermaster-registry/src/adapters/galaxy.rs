//! Ansible Galaxy adapter.
//!
//! Galaxy publishes bundle specs as role metadata rather than image
//! labels. Roles are addressed as `<namespace>.<name>#<role id>` and run
//! through a shared runner image, with the role name and namespace
//! injected as mandatory plan parameters.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

use qm_core::{ParameterDescriptor, Spec};

use crate::error::{RegistryError, RegistryResult};

use super::{Adapter, AdapterConfig, collect_pages};

const GALAXY_NAME: &str = "galaxy";
const DEFAULT_URL: &str = "https://galaxy.ansible.com";
const DEFAULT_RUNNER: &str = "ansibleplaybookbundle/apb-base:latest";

#[derive(Debug, Default, Deserialize)]
struct RoleNamespace {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct RoleSummary {
    #[serde(default)]
    namespace: RoleNamespace,
}

#[derive(Debug, Default, Deserialize)]
struct RoleListing {
    #[serde(default)]
    name: String,
    #[serde(default)]
    id: u64,
    #[serde(default, rename = "summary_fields")]
    summary: RoleSummary,
}

#[derive(Debug, Default, Deserialize)]
struct RolePage {
    #[serde(default)]
    results: Vec<RoleListing>,
    #[serde(default)]
    next: String,
}

#[derive(Debug, Default, Deserialize)]
struct RoleMetadata {
    #[serde(default)]
    apb_metadata: Spec,
}

#[derive(Debug, Default, Deserialize)]
struct RoleResponse {
    #[serde(default)]
    name: String,
    #[serde(default)]
    metadata: RoleMetadata,
    #[serde(default, rename = "summary_fields")]
    summary: RoleSummary,
}

/// Adapter for Ansible Galaxy content.
pub struct GalaxyAdapter {
    config: AdapterConfig,
    base: Url,
    client: reqwest::Client,
}

impl GalaxyAdapter {
    pub fn new(config: AdapterConfig) -> RegistryResult<Self> {
        let base = match &config.url {
            Some(url) if url.host_str().is_some() => url.clone(),
            _ => {
                debug!(url = DEFAULT_URL, "using default galaxy url");
                Url::parse(DEFAULT_URL)?
            }
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { config, base, client })
    }

    fn search_url(&self) -> RegistryResult<Url> {
        let mut url = self.base.join("/api/v1/content/")?;
        url.query_pairs_mut().append_pair("content_type__name", "apb");
        if !self.config.org.is_empty() {
            debug!("using namespaced galaxy search");
            url.query_pairs_mut()
                .append_pair("namespace__name", &self.config.org);
        }
        Ok(url)
    }

    async fn load_spec(&self, image_name: &str) -> RegistryResult<Option<Spec>> {
        let Some((role_name, role_id)) = image_name.split_once('#') else {
            debug!(image = %image_name, "expected image of the form roleName#roleID, skipping");
            return Ok(None);
        };

        let url = self.base.join(&format!("/api/v1/content/{role_id}/"))?;
        let role: RoleResponse = self.client.get(url).send().await?.json().await?;

        let mut spec = role.metadata.apb_metadata;
        spec.runtime = 2;
        spec.image = if self.config.runner.is_empty() {
            DEFAULT_RUNNER.to_string()
        } else {
            self.config.runner.clone()
        };
        // Distinguish galaxy roles from identically named registry bundles.
        spec.metadata.insert(
            "displayName".to_string(),
            serde_json::Value::String(format!("{role_name} (galaxy)")),
        );

        let role_param = ParameterDescriptor {
            name: "role_name".to_string(),
            title: "Galaxy Role Name".to_string(),
            param_type: "string".to_string(),
            default: Some(serde_json::Value::String(role.name.clone())),
            pattern: format!("^{}$", role.name),
            required: true,
            updatable: false,
            ..ParameterDescriptor::default()
        };
        let namespace_param = ParameterDescriptor {
            name: "role_namespace".to_string(),
            title: "Galaxy Role Namespace".to_string(),
            param_type: "string".to_string(),
            default: Some(serde_json::Value::String(role.summary.namespace.name.clone())),
            pattern: format!("^{}$", role.summary.namespace.name),
            required: true,
            updatable: false,
            ..ParameterDescriptor::default()
        };
        for plan in &mut spec.plans {
            let mut parameters = vec![role_param.clone(), namespace_param.clone()];
            parameters.append(&mut plan.parameters);
            plan.parameters = parameters;
        }

        Ok(Some(spec))
    }
}

#[async_trait]
impl Adapter for GalaxyAdapter {
    fn registry_name(&self) -> String {
        GALAXY_NAME.to_string()
    }

    async fn get_image_names(&self) -> RegistryResult<Vec<String>> {
        let first = self.search_url()?;
        let base = self.base.clone();
        let client = self.client.clone();

        collect_pages(first.to_string(), move |page_url: String| {
            let client = client.clone();
            let base = base.clone();
            async move {
                let page: RolePage = client.get(&page_url).send().await?.json().await?;
                let names = page
                    .results
                    .iter()
                    .map(|role| format!("{}.{}#{}", role.summary.namespace.name, role.name, role.id))
                    .collect();
                let next = if page.next.is_empty() {
                    None
                } else {
                    Some(base.join(&format!("/api/v1{}", page.next))?.to_string())
                };
                Ok::<_, RegistryError>((names, next))
            }
        })
        .await
    }

    async fn fetch_specs(&self, image_names: &[String]) -> RegistryResult<Vec<Spec>> {
        let mut specs = Vec::new();
        for image_name in image_names {
            match self.load_spec(image_name).await {
                Ok(Some(spec)) => specs.push(spec),
                Ok(None) => {}
                Err(e) => {
                    error!(image = %image_name, error = %e, "failed to retrieve spec data for role");
                }
            }
        }
        Ok(specs)
    }
}
