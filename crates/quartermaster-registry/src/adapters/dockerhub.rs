//! Docker Hub adapter.
//!
//! Listing an org goes through hub.docker.com with a JWT from the login
//! endpoint, paginated by a `next` cursor that is fanned out as pages are
//! discovered. Manifests come from registry.hub.docker.com with a
//! per-repository bearer token from auth.docker.io.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

use qm_core::Spec;

use crate::error::{RegistryError, RegistryResult};
use crate::manifest;

use super::{Adapter, AdapterConfig, collect_pages};

const DOCKERHUB_NAME: &str = "docker.io";
const HUB_URL: &str = "https://hub.docker.com";
const REGISTRY_URL: &str = "https://registry.hub.docker.com";
const TOKEN_URL: &str = "https://auth.docker.io/token";
const TOKEN_SERVICE: &str = "registry.docker.io";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Default, Deserialize)]
struct HubImage {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
struct HubImagePage {
    #[serde(default)]
    results: Vec<HubImage>,
    #[serde(default)]
    next: String,
}

#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
}

/// Adapter for Docker Hub orgs.
pub struct DockerHubAdapter {
    config: AdapterConfig,
    client: reqwest::Client,
    hub_url: Url,
    registry_url: Url,
    token_url: Url,
}

impl DockerHubAdapter {
    pub fn new(config: AdapterConfig) -> RegistryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            config,
            client,
            hub_url: Url::parse(HUB_URL)?,
            registry_url: Url::parse(REGISTRY_URL)?,
            token_url: Url::parse(TOKEN_URL)?,
        })
    }

    /// Log into the hub API and return the JWT used for org listing.
    async fn hub_login(&self) -> RegistryResult<String> {
        let resp = self
            .client
            .post(self.hub_url.join("/v2/users/login/")?)
            .json(&serde_json::json!({
                "username": self.config.credentials.username,
                "password": self.config.credentials.password,
            }))
            .send()
            .await?;
        let token: TokenResponse = resp.json().await?;
        Ok(token.token)
    }

    /// Per-repository pull token for the manifest endpoint.
    async fn bearer_token(&self, image_name: &str) -> RegistryResult<String> {
        let mut url = self.token_url.clone();
        url.query_pairs_mut()
            .append_pair("service", TOKEN_SERVICE)
            .append_pair("scope", &format!("repository:{image_name}:pull"));

        let mut req = self.client.get(url);
        if !self.config.credentials.username.is_empty() {
            req = req.basic_auth(
                &self.config.credentials.username,
                Some(&self.config.credentials.password),
            );
        }

        let token: TokenResponse = req.send().await?.json().await?;
        Ok(token.token)
    }

    async fn load_spec(&self, image_name: &str) -> RegistryResult<Option<Spec>> {
        let tag = self.config.tag();
        let token = self.bearer_token(image_name).await?;

        let url = self
            .registry_url
            .join(&format!("/v2/{image_name}/manifests/{tag}"))?;
        let resp = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let body = manifest::handle_response(resp).await?;

        manifest::spec_from_schema1(&body, &format!("{DOCKERHUB_NAME}/{image_name}:{tag}"))
    }
}

#[async_trait]
impl Adapter for DockerHubAdapter {
    fn registry_name(&self) -> String {
        DOCKERHUB_NAME.to_string()
    }

    async fn get_image_names(&self) -> RegistryResult<Vec<String>> {
        debug!(org = %self.config.org, "loading image list for org");
        let token = self.hub_login().await.map_err(|e| {
            error!(error = %e, "unable to obtain docker hub token");
            e
        })?;

        let mut first = self
            .hub_url
            .join(&format!("/v2/repositories/{}/", self.config.org))?;
        first.query_pairs_mut().append_pair("page_size", PAGE_SIZE);

        let client = self.client.clone();
        collect_pages(first.to_string(), move |page_url: String| {
            let client = client.clone();
            let token = token.clone();
            async move {
                let resp = client
                    .get(&page_url)
                    .header(AUTHORIZATION, format!("JWT {token}"))
                    .send()
                    .await?;
                let page: HubImagePage = resp.json().await?;
                let names = page
                    .results
                    .iter()
                    .map(|image| format!("{}/{}", image.namespace, image.name))
                    .collect();
                let next = (!page.next.is_empty()).then_some(page.next);
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
    use crate::manifest::test_support::schema1_manifest;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter_for(server: &MockServer) -> DockerHubAdapter {
        let uri = Url::parse(&server.uri()).unwrap();
        DockerHubAdapter {
            config: AdapterConfig {
                org: "ansibleplaybookbundle".to_string(),
                credentials: RegistryCredentials {
                    username: "user".to_string(),
                    password: "pass".to_string(),
                },
                ..AdapterConfig::default()
            },
            client: reqwest::Client::new(),
            hub_url: uri.clone(),
            registry_url: uri.clone(),
            token_url: uri.join("/token").unwrap(),
        }
    }

    #[tokio::test]
    async fn lists_org_repositories_across_pages() {
        let server = MockServer::start().await;
        let page2 = format!("{}/v2/repositories/ansibleplaybookbundle/?page=2", server.uri());

        Mock::given(method("POST"))
            .and(path("/v2/users/login/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "jwt-token"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/repositories/ansibleplaybookbundle/"))
            .and(query_param("page", "2"))
            .and(header("Authorization", "JWT jwt-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 3,
                "results": [ {"name": "baz-apb", "namespace": "ansibleplaybookbundle"} ],
                "next": ""
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/repositories/ansibleplaybookbundle/"))
            .and(header("Authorization", "JWT jwt-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 3,
                "results": [
                    {"name": "foo-apb", "namespace": "ansibleplaybookbundle"},
                    {"name": "bar-apb", "namespace": "ansibleplaybookbundle"}
                ],
                "next": page2
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let mut names = adapter.get_image_names().await.unwrap();
        names.sort();
        assert_eq!(
            names,
            vec![
                "ansibleplaybookbundle/bar-apb",
                "ansibleplaybookbundle/baz-apb",
                "ansibleplaybookbundle/foo-apb",
            ]
        );
    }

    #[tokio::test]
    async fn fetches_manifest_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("scope", "repository:ansibleplaybookbundle/foo-apb:pull"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"token": "pull-token"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/ansibleplaybookbundle/foo-apb/manifests/latest"))
            .and(header("Authorization", "Bearer pull-token"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(schema1_manifest("2")))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let specs = adapter
            .fetch_specs(&["ansibleplaybookbundle/foo-apb".to_string()])
            .await
            .unwrap();

        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].image, "docker.io/ansibleplaybookbundle/foo-apb:latest");
    }
}
