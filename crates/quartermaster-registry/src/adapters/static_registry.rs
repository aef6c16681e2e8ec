//! Static image list adapter.
//!
//! No discovery: the configured image list is taken verbatim and each
//! image's spec is fetched over the v2 manifest API.

use async_trait::async_trait;

use qm_core::Spec;

use crate::error::RegistryResult;

use super::apiv2::ApiV2Adapter;
use super::{Adapter, AdapterConfig};

/// Adapter serving only the images named in the broker config.
pub struct StaticAdapter {
    images: Vec<String>,
    inner: ApiV2Adapter,
}

impl StaticAdapter {
    pub async fn new(config: AdapterConfig) -> RegistryResult<Self> {
        let images = config.images.clone();
        let inner = ApiV2Adapter::new(config).await?;
        Ok(Self { images, inner })
    }
}

#[async_trait]
impl Adapter for StaticAdapter {
    fn registry_name(&self) -> String {
        self.inner.registry_name()
    }

    async fn get_image_names(&self) -> RegistryResult<Vec<String>> {
        Ok(self.images.clone())
    }

    async fn fetch_specs(&self, image_names: &[String]) -> RegistryResult<Vec<Spec>> {
        self.inner.fetch_specs(image_names).await
    }
}
