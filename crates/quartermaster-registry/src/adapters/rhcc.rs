//! Red Hat Container Catalog adapter.
//!
//! Discovery goes through the catalog's v1 keyword search rather than the
//! v2 catalog endpoint, manifests come from the regular v2 API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, error};

use qm_core::Spec;

use crate::error::{RegistryError, RegistryResult};
use crate::manifest;
use crate::oci::OciClient;

use super::{Adapter, AdapterConfig};

#[derive(Debug, Default, Deserialize)]
struct SearchImage {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchImage>,
}

/// Adapter for the Red Hat Container Catalog.
pub struct RhccAdapter {
    config: AdapterConfig,
    client: OciClient,
}

impl RhccAdapter {
    pub fn new(config: AdapterConfig) -> RegistryResult<Self> {
        let url = config.url()?.clone();
        let client = OciClient::new(
            &config.credentials.username,
            &config.credentials.password,
            config.skip_verify_tls,
            url,
        )?;
        Ok(Self { config, client })
    }

    async fn search(&self, query: &str) -> RegistryResult<SearchResponse> {
        let mut url = self.client.endpoint("/v1/search")?;
        url.query_pairs_mut().append_pair("q", query);
        debug!(url = %url, "searching catalog for bundle images");

        let resp = self.client.get(url).await?;
        if resp.status() != StatusCode::OK {
            return Err(RegistryError::Response {
                code: resp.status().as_u16(),
                body: "unexpected search response".to_string(),
            });
        }
        Ok(resp.json().await?)
    }

    async fn load_spec(&self, image_name: &str) -> RegistryResult<Option<Spec>> {
        let tag = self.config.tag();
        let url = self
            .client
            .endpoint(&format!("/v2/{image_name}/manifests/{tag}"))?;
        let resp = self.client.get(url).await?;
        let body = manifest::handle_response(resp).await?;

        let image = format!("{}/{}:{}", self.registry_name(), image_name, tag);
        manifest::spec_from_schema1(&body, &image)
    }
}

#[async_trait]
impl Adapter for RhccAdapter {
    fn registry_name(&self) -> String {
        self.config.host().unwrap_or_default()
    }

    async fn get_image_names(&self) -> RegistryResult<Vec<String>> {
        // Token dance first, the search endpoint sits behind the same auth.
        self.client.login().await?;
        let found = self.search("\"*-apb\"").await?;
        Ok(found.results.into_iter().map(|image| image.name).collect())
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
    use crate::manifest::test_support::schema1_manifest;
    use url::Url;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn adapter_for(server: &MockServer) -> RhccAdapter {
        Mock::given(method("GET"))
            .and(path("/v2/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;

        RhccAdapter::new(AdapterConfig {
            url: Some(Url::parse(&server.uri()).unwrap()),
            ..AdapterConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn search_uses_apb_suffix_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .and(query_param("q", "\"*-apb\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "num_results": 2,
                "results": [ {"name": "foo-apb"}, {"name": "bar-apb"} ]
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server).await;
        let names = adapter.get_image_names().await.unwrap();
        assert_eq!(names, vec!["foo-apb", "bar-apb"]);
    }

    #[tokio::test]
    async fn fetches_manifest_per_image() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/foo-apb/manifests/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(schema1_manifest("1")))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server).await;
        let specs = adapter.fetch_specs(&["foo-apb".to_string()]).await.unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].runtime, 1);
    }
}
