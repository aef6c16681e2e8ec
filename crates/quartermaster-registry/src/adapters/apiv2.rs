//! Adapter for registries speaking the plain v2 API.
//!
//! Covers any conformant registry, the integrated OpenShift registry, and
//! the partner container catalog, which differ only in how they are
//! reached and named.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, error, warn};
use url::Url;

use qm_core::Spec;

use crate::error::{RegistryError, RegistryResult};
use crate::manifest;
use crate::oci::OciClient;

use super::{Adapter, AdapterConfig, dedup};

#[derive(Debug, Default, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    repositories: Vec<String>,
}

/// Adapter over the v2 catalog and manifest endpoints.
pub struct ApiV2Adapter {
    config: AdapterConfig,
    client: OciClient,
}

impl ApiV2Adapter {
    /// Build the client and authenticate against `/v2/`.
    pub async fn new(config: AdapterConfig) -> RegistryResult<Self> {
        let url = config.url()?.clone();
        let client = OciClient::new(
            &config.credentials.username,
            &config.credentials.password,
            config.skip_verify_tls,
            url.clone(),
        )?;
        if let Err(e) = client.login().await {
            error!(url = %url, error = %e, "failed to GET /v2/");
            return Err(e);
        }
        Ok(Self { config, client })
    }

    /// Walk `/v2/_catalog`, following `Link` pagination headers.
    async fn discover_images(&self) -> RegistryResult<Vec<String>> {
        let mut url = self.client.endpoint("/v2/_catalog")?;
        let mut images = Vec::new();

        loop {
            let resp = self.client.get(url.clone()).await?;
            if resp.status() != StatusCode::OK {
                error!(url = %url, status = %resp.status(), "failed to fetch catalog page");
                return Err(RegistryError::Response {
                    code: resp.status().as_u16(),
                    body: "unexpected catalog response".to_string(),
                });
            }
            let link = resp
                .headers()
                .get(reqwest::header::LINK)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();

            let page: CatalogResponse = resp.json().await?;
            debug!(url = %url, images = page.repositories.len(), "discovered catalog page");
            images.extend(page.repositories);

            if link.is_empty() {
                break;
            }
            url = self.next_page_url(&link)?;
        }
        Ok(images)
    }

    /// The `Link` header looks like `</v2/_catalog?last=x&n=100>; rel="next"`.
    fn next_page_url(&self, link: &str) -> RegistryResult<Url> {
        let target = link
            .split(';')
            .next()
            .map(str::trim)
            .map(|s| s.trim_matches(|c| c == '<' || c == '>'))
            .unwrap_or_default();
        if target.is_empty() {
            return Err(RegistryError::Url {
                url: link.to_string(),
                reason: "invalid Link header".to_string(),
            });
        }
        self.client.endpoint(target)
    }

    async fn load_spec(&self, image_name: &str) -> RegistryResult<Option<Spec>> {
        let tag = self.config.tag();
        let manifest_url = self
            .client
            .endpoint(&format!("/v2/{image_name}/manifests/{tag}"))?;
        let resp = self.client.get(manifest_url).await?;
        let body = manifest::handle_response(resp).await?;

        let image = format!("{}/{}:{}", self.registry_name(), image_name, tag);

        match manifest::schema_version(&body)? {
            1 => {
                debug!(image = %image_name, "manifest schema 1");
                manifest::spec_from_schema1(&body, &image)
            }
            2 => {
                debug!(image = %image_name, "manifest schema 2");
                let digest = manifest::config_digest(&body, &image)?;
                let blob_url = self
                    .client
                    .endpoint(&format!("/v2/{image_name}/blobs/{digest}"))?;
                let resp = self.client.get(blob_url).await?;
                let config = manifest::handle_response(resp).await?;
                manifest::spec_from_config(&config, &image)
            }
            version => Err(RegistryError::Manifest {
                image,
                reason: format!("unsupported manifest schema version {version}"),
            }),
        }
    }
}

#[async_trait]
impl Adapter for ApiV2Adapter {
    fn registry_name(&self) -> String {
        self.config.host().unwrap_or_default()
    }

    async fn get_image_names(&self) -> RegistryResult<Vec<String>> {
        let mut images = self.config.images.clone();

        match self.discover_images().await {
            Ok(discovered) => images.extend(discovered),
            Err(e) if images.is_empty() => return Err(e),
            Err(e) => warn!(error = %e, "catalog discovery failed, using configured images"),
        }

        if images.is_empty() {
            warn!("image list is empty, no images were discovered");
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
                    error!(
                        image = %image_name,
                        tag = self.config.tag(),
                        error = %e,
                        "failed to retrieve spec data for image"
                    );
                }
            }
        }
        Ok(specs)
    }
}

macro_rules! apiv2_wrapper {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name(ApiV2Adapter);

        impl $name {
            pub async fn new(config: AdapterConfig) -> RegistryResult<Self> {
                Ok(Self(ApiV2Adapter::new(config).await?))
            }
        }

        #[async_trait]
        impl Adapter for $name {
            fn registry_name(&self) -> String {
                self.0.registry_name()
            }
            async fn get_image_names(&self) -> RegistryResult<Vec<String>> {
                self.0.get_image_names().await
            }
            async fn fetch_specs(&self, image_names: &[String]) -> RegistryResult<Vec<Spec>> {
                self.0.fetch_specs(image_names).await
            }
        }
    };
}

apiv2_wrapper!(
    /// The integrated OpenShift registry, reached over the v2 API.
    OpenShiftRegistryAdapter
);
apiv2_wrapper!(
    /// The partner container catalog, reached over the v2 API.
    PartnerRhccAdapter
);
apiv2_wrapper!(
    /// The in-cluster registry service, reached over the v2 API.
    LocalOpenShiftAdapter
);
