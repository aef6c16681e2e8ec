//! Registry adapters.
//!
//! One adapter per registry flavour. Every adapter exposes the same three
//! operations: name the registry, list candidate image names, and fetch
//! the bundle spec for each name.

pub mod apiv2;
pub mod dockerhub;
pub mod galaxy;
pub mod helm;
pub mod mock;
pub mod quay;
pub mod rhcc;
pub mod static_registry;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use qm_core::Spec;

use crate::auth::RegistryCredentials;
use crate::error::{RegistryError, RegistryResult};

pub use apiv2::{ApiV2Adapter, LocalOpenShiftAdapter, OpenShiftRegistryAdapter, PartnerRhccAdapter};
pub use dockerhub::DockerHubAdapter;
pub use galaxy::GalaxyAdapter;
pub use helm::HelmAdapter;
pub use mock::MockAdapter;
pub use quay::QuayAdapter;
pub use rhcc::RhccAdapter;
pub use static_registry::StaticAdapter;

/// Everything an adapter needs to reach its registry.
#[derive(Debug, Clone, Default)]
pub struct AdapterConfig {
    pub url: Option<Url>,
    pub credentials: RegistryCredentials,
    pub org: String,
    pub runner: String,
    pub images: Vec<String>,
    pub namespaces: Vec<String>,
    pub tag: String,
    pub skip_verify_tls: bool,
}

impl AdapterConfig {
    /// The configured registry URL. Adapters that require one call this.
    pub fn url(&self) -> RegistryResult<&Url> {
        self.url
            .as_ref()
            .ok_or_else(|| RegistryError::Config("registry url is required".to_string()))
    }

    /// The image tag to fetch, defaulting to `latest`.
    pub fn tag(&self) -> &str {
        if self.tag.is_empty() { "latest" } else { &self.tag }
    }

    /// `host[:port]` of the registry URL, or its path when there is no
    /// host (bare names like `docker.io` parse that way).
    pub fn host(&self) -> RegistryResult<String> {
        let url = self.url()?;
        match url.host_str() {
            Some(host) => match url.port() {
                Some(port) => Ok(format!("{host}:{port}")),
                None => Ok(host.to_string()),
            },
            None => Ok(url.path().to_string()),
        }
    }
}

/// A source of bundle images.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Registry prefix for images from this adapter, e.g. `docker.io`.
    fn registry_name(&self) -> String;

    /// All candidate image names this adapter can see.
    async fn get_image_names(&self) -> RegistryResult<Vec<String>>;

    /// Fetch and decode the spec for each image name. Per-image failures
    /// are logged and skipped.
    async fn fetch_specs(&self, image_names: &[String]) -> RegistryResult<Vec<Spec>>;
}

/// Deduplicate image names, keeping first-seen order.
pub(crate) fn dedup(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Walk a cursor-paginated listing. Each page fetch yields the page's
/// names and an optional next-page cursor; pages are fetched concurrently
/// as cursors are discovered, and one failed page cancels the rest.
pub(crate) async fn collect_pages<F, Fut>(first: String, fetch: F) -> RegistryResult<Vec<String>>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RegistryResult<(Vec<String>, Option<String>)>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    walk_page(first, tx, cancel.clone(), Arc::new(fetch));

    let mut names = Vec::new();
    while let Some(name) = rx.recv().await {
        names.push(name);
    }

    if cancel.is_cancelled() {
        warn!("image listing was cut short, the catalog may be incomplete");
        return Err(RegistryError::IncompleteListing);
    }
    Ok(names)
}

fn walk_page<F, Fut>(
    url: String,
    tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    fetch: Arc<F>,
) where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RegistryResult<(Vec<String>, Option<String>)>> + Send + 'static,
{
    tokio::spawn(async move {
        if cancel.is_cancelled() {
            return;
        }
        let page = url.clone();
        match fetch(url).await {
            Ok((names, next)) => {
                if let Some(next) = next {
                    walk_page(next, tx.clone(), cancel.clone(), fetch.clone());
                }
                for name in names {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let _ = tx.send(name);
                }
            }
            Err(error) => {
                warn!(%error, url = %page, "failed to fetch listing page");
                cancel.cancel();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_seen_order() {
        let names = vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
            "c".to_string(),
        ];
        assert_eq!(dedup(names), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn collect_pages_follows_cursors() {
        let fetch = |url: String| async move {
            match url.as_str() {
                "page-1" => Ok((
                    vec!["one".to_string(), "two".to_string()],
                    Some("page-2".to_string()),
                )),
                "page-2" => Ok((vec!["three".to_string()], None)),
                other => panic!("unexpected page {other}"),
            }
        };

        let mut names = collect_pages("page-1".to_string(), fetch).await.unwrap();
        names.sort();
        assert_eq!(names, vec!["one", "three", "two"]);
    }

    #[tokio::test]
    async fn collect_pages_surfaces_page_failures() {
        let fetch = |url: String| async move {
            match url.as_str() {
                "page-1" => Ok((vec!["one".to_string()], Some("page-2".to_string()))),
                _ => Err(RegistryError::Config("boom".to_string())),
            }
        };

        let err = collect_pages("page-1".to_string(), fetch).await;
        assert!(matches!(err, Err(RegistryError::IncompleteListing)));
    }
}
