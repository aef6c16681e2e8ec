//! Quay adapter.
//!
//! Quay exposes its own repository API. Labels are read straight off the
//! manifest's label endpoint instead of decoding the image config blob,
//! and authentication is a bearer token supplied through the registry
//! credentials.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use tracing::error;
use url::Url;

use qm_core::{APB_RUNTIME_LABEL, BUNDLE_SPEC_LABEL, Spec};

use crate::error::{RegistryError, RegistryResult};
use crate::manifest;

use super::{Adapter, AdapterConfig, dedup};

const QUAY_NAME: &str = "quay.io";

#[derive(Debug, Default, Deserialize)]
struct QuayRepository {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct QuayCatalogResponse {
    #[serde(default)]
    repositories: Vec<QuayRepository>,
}

#[derive(Debug, Default, Deserialize)]
struct QuayTag {
    #[serde(default)]
    manifest_digest: String,
}

#[derive(Debug, Default, Deserialize)]
struct QuayRepositoryDetail {
    #[serde(default)]
    tags: HashMap<String, QuayTag>,
}

#[derive(Debug, Default, Deserialize)]
struct QuayLabel {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct QuayLabelsResponse {
    #[serde(default)]
    labels: Vec<QuayLabel>,
}

/// Adapter for quay.io and on-prem Quay installs.
pub struct QuayAdapter {
    config: AdapterConfig,
    client: reqwest::Client,
}

impl QuayAdapter {
    pub fn new(config: AdapterConfig) -> RegistryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .danger_accept_invalid_certs(config.skip_verify_tls)
            .build()?;
        Ok(Self { config, client })
    }

    fn token(&self) -> &str {
        &self.config.credentials.password
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> RegistryResult<T> {
        let resp = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.token()))
            .send()
            .await?;
        let body = manifest::handle_response(resp).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get_digest(&self, image_name: &str) -> RegistryResult<String> {
        let url = self.config.url()?.join(&format!(
            "/api/v1/repository/{}/{}",
            self.config.org, image_name
        ))?;
        let detail: QuayRepositoryDetail = self.get_json(url).await?;

        detail
            .tags
            .get(self.config.tag())
            .map(|tag| tag.manifest_digest.clone())
            .filter(|digest| !digest.is_empty())
            .ok_or_else(|| RegistryError::Manifest {
                image: image_name.to_string(),
                reason: "unable to get manifest_digest".to_string(),
            })
    }

    async fn load_spec(&self, image_name: &str) -> RegistryResult<Option<Spec>> {
        let digest = self.get_digest(image_name).await?;
        let url = self.config.url()?.join(&format!(
            "/api/v1/repository/{}/{}/manifest/{}/labels",
            self.config.org, image_name, digest
        ))?;
        let labels: QuayLabelsResponse = self.get_json(url).await?;

        let mut encoded_spec = "";
        let mut runtime = "";
        for label in &labels.labels {
            if label.key == BUNDLE_SPEC_LABEL {
                encoded_spec = &label.value;
            } else if label.key == APB_RUNTIME_LABEL {
                runtime = &label.value;
            }
        }

        if encoded_spec.is_empty() {
            return Ok(None);
        }

        let image = format!(
            "{}/{}/{}:{}",
            self.config.host()?,
            self.config.org,
            image_name,
            self.config.tag()
        );
        let mut spec = manifest::spec_from_label(encoded_spec, &image)?;
        spec.runtime = manifest::runtime_version(runtime, &image)?;
        Ok(Some(spec))
    }
}

#[async_trait]
impl Adapter for QuayAdapter {
    fn registry_name(&self) -> String {
        QUAY_NAME.to_string()
    }

    async fn get_image_names(&self) -> RegistryResult<Vec<String>> {
        let mut images = self.config.images.clone();

        let mut url = self.config.url()?.join("/api/v1/repository")?;
        url.query_pairs_mut()
            .append_pair("public", "true")
            .append_pair("private", "true")
            .append_pair("namespace", &self.config.org);

        let catalog: QuayCatalogResponse = self.get_json(url).await?;
        images.extend(catalog.repositories.into_iter().map(|repo| repo.name));

        if images.is_empty() {
            tracing::warn!("image list is empty, no images were discovered");
        }
        Ok(dedup(images))
    }

    async fn fetch_specs(&self, image_names: &[String]) -> RegistryResult<Vec<Spec>> {
        let mut specs = Vec::new();
        for image_name in image_names {
            match self.load_spec(image_name).await {
                Ok(Some(spec)) => specs.push(spec),
                Ok(None) => {}
                Err(e) => {
                    error!(image = %image_name, error = %e, "failed to retrieve spec data for image");
                }
            }
        }
        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RegistryCredentials;
    use crate::manifest::test_support::encoded_spec;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter_for(server: &MockServer) -> QuayAdapter {
        QuayAdapter::new(AdapterConfig {
            url: Some(Url::parse(&server.uri()).unwrap()),
            org: "automationbroker".to_string(),
            credentials: RegistryCredentials {
                username: String::new(),
                password: "quay-token".to_string(),
            },
            ..AdapterConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn lists_org_repositories_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/repository"))
            .and(query_param("namespace", "automationbroker"))
            .and(query_param("public", "true"))
            .and(query_param("private", "true"))
            .and(header("Authorization", "Bearer quay-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "repositories": [ {"name": "mediawiki-apb"}, {"name": "postgresql-apb"} ]
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let names = adapter.get_image_names().await.unwrap();
        assert_eq!(names, vec!["mediawiki-apb", "postgresql-apb"]);
    }

    #[tokio::test]
    async fn resolves_digest_then_labels() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/repository/automationbroker/mediawiki-apb"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tags": { "latest": { "manifest_digest": "sha256:abc" } }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(
                "/api/v1/repository/automationbroker/mediawiki-apb/manifest/sha256:abc/labels",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "labels": [
                    { "key": "com.redhat.apb.spec", "value": encoded_spec() },
                    { "key": "com.redhat.apb.runtime", "value": "2" }
                ]
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let specs = adapter
            .fetch_specs(&["mediawiki-apb".to_string()])
            .await
            .unwrap();

        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].runtime, 2);
        assert!(specs[0].image.contains("/automationbroker/mediawiki-apb:latest"));
    }

    #[tokio::test]
    async fn missing_tag_digest_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/repository/automationbroker/no-tag-apb"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"tags": {}})),
            )
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let specs = adapter.fetch_specs(&["no-tag-apb".to_string()]).await.unwrap();
        assert!(specs.is_empty());
    }
}
