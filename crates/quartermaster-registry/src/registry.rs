//! Registry aggregation: adapter + filter + validation.

use tracing::{debug, error, info, warn};
use url::Url;

use qm_core::config::RegistryConfig;
use qm_core::{MAX_RUNTIME_VERSION, MIN_RUNTIME_VERSION, SPEC_VERSION_MAJOR, Spec};

use crate::adapters::{
    Adapter, AdapterConfig, ApiV2Adapter, DockerHubAdapter, GalaxyAdapter, HelmAdapter,
    LocalOpenShiftAdapter, MockAdapter, OpenShiftRegistryAdapter, PartnerRhccAdapter, QuayAdapter,
    RhccAdapter, StaticAdapter,
};
use crate::auth::{self, SecretSource};
use crate::error::{RegistryError, RegistryResult};
use crate::filter::Filter;

/// One configured registry: an adapter with its name filter.
pub struct Registry {
    adapter: Box<dyn Adapter>,
    filter: Filter,
    config: RegistryConfig,
}

impl Registry {
    /// Build a registry from its config: validate it, resolve credentials,
    /// and construct the adapter for its type.
    pub async fn new(
        config: RegistryConfig,
        secrets: &dyn SecretSource,
        broker_namespace: &str,
    ) -> RegistryResult<Self> {
        config
            .validate()
            .map_err(|e| RegistryError::Config(e.to_string()))?;

        let credentials = auth::resolve(&config, secrets, broker_namespace).await?;

        info!(
            name = %config.name,
            kind = %config.kind,
            url = %config.url,
            "constructing registry"
        );

        let adapter_config = AdapterConfig {
            url: parse_url(&config.url),
            credentials,
            org: config.org.clone(),
            runner: config.runner.clone(),
            images: config.images.clone(),
            namespaces: config.namespaces.clone(),
            tag: config.tag.clone(),
            skip_verify_tls: config.skip_verify_tls,
        };

        let adapter = create_adapter(&config.kind, adapter_config).await?;
        let filter = create_filter(&config);

        Ok(Self {
            adapter,
            filter,
            config,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_adapter(
        adapter: Box<dyn Adapter>,
        filter: Filter,
        config: RegistryConfig,
    ) -> Self {
        Self {
            adapter,
            filter,
            config,
        }
    }

    /// Configured name of this registry, used to namespace spec names.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Whether a load failure of this registry should fail bootstrap.
    pub fn fail_on_error(&self) -> bool {
        self.config.fail_on_error
    }

    /// Load all valid specs from the registry. Returns the specs and the
    /// total number of image names seen before filtering.
    pub async fn load_specs(&self) -> RegistryResult<(Vec<Spec>, usize)> {
        let image_names = self.adapter.get_image_names().await.map_err(|e| {
            error!(registry = %self.config.name, error = %e, "unable to retrieve image names");
            e
        })?;
        let image_count = image_names.len();

        // Everything that does not end in -apb is thrown out up front.
        let bundle_names: Vec<String> = image_names
            .into_iter()
            .filter(|name| name.to_lowercase().ends_with("-apb"))
            .collect();

        let (valid_names, filtered_names) = self.filter.run(&bundle_names);
        debug!(registry = %self.config.name, "filter applied against registry");
        for name in &valid_names {
            debug!(%name, "image passed white/blacklist filter");
        }
        if !filtered_names.is_empty() {
            info!(
                registry = %self.config.name,
                filtered = filtered_names.len(),
                "images filtered by white/blacklist filter"
            );
        }

        let specs = self.adapter.fetch_specs(&valid_names).await.map_err(|e| {
            error!(registry = %self.config.name, error = %e, "unable to fetch specs");
            e
        })?;

        info!(registry = %self.config.name, "validating specs");
        let total = specs.len();
        let validated = validate_specs(specs);
        let failed = total - validated.len();
        if failed != 0 {
            warn!(
                registry = %self.adapter.registry_name(),
                failed, total, "some discovered specs failed validation"
            );
        }

        Ok((validated, image_count))
    }
}

/// Parse the configured URL, defaulting to the http scheme. A bad URL is
/// tolerated here so the registry can fail on first use instead.
fn parse_url(raw: &str) -> Option<Url> {
    if raw.is_empty() {
        return None;
    }
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    match Url::parse(&candidate) {
        Ok(url) => Some(url),
        Err(e) => {
            error!(url = raw, error = %e, "registry url is not valid");
            None
        }
    }
}

async fn create_adapter(kind: &str, config: AdapterConfig) -> RegistryResult<Box<dyn Adapter>> {
    let adapter: Box<dyn Adapter> = match kind.to_lowercase().as_str() {
        "rhcc" => Box::new(RhccAdapter::new(config)?),
        "dockerhub" => Box::new(DockerHubAdapter::new(config)?),
        "galaxy" => Box::new(GalaxyAdapter::new(config)?),
        "quay" => Box::new(QuayAdapter::new(config)?),
        "helm" => Box::new(HelmAdapter::new(config)?),
        "apiv2" => Box::new(ApiV2Adapter::new(config).await?),
        "openshift" => Box::new(OpenShiftRegistryAdapter::new(config).await?),
        "partner_rhcc" => Box::new(PartnerRhccAdapter::new(config).await?),
        "local_openshift" => Box::new(LocalOpenShiftAdapter::new(config).await?),
        "static" => Box::new(StaticAdapter::new(config).await?),
        "mock" => Box::new(MockAdapter::default()),
        unknown => {
            return Err(RegistryError::Config(format!(
                "unknown registry type: {unknown}"
            )));
        }
    };
    Ok(adapter)
}

fn create_filter(config: &RegistryConfig) -> Filter {
    debug!(registry = %config.name, "creating filter for registry");
    let filter = Filter::new(&config.white_list, &config.black_list);

    for failed in filter.failed_whitelist() {
        warn!(
            registry = %config.name,
            pattern = %failed.pattern,
            error = %failed.error,
            "whitelist regex failed to compile"
        );
    }
    for failed in filter.failed_blacklist() {
        warn!(
            registry = %config.name,
            pattern = %failed.pattern,
            error = %failed.error,
            "blacklist regex failed to compile"
        );
    }
    filter
}

/// Validate all specs concurrently, dropping the failures with a warning.
fn validate_specs(specs: Vec<Spec>) -> Vec<Spec> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = specs
            .into_iter()
            .map(|spec| {
                scope.spawn(move || {
                    let verdict = validate_spec_format(&spec);
                    (spec, verdict)
                })
            })
            .collect();

        let mut valid = Vec::with_capacity(handles.len());
        for handle in handles {
            let Ok((spec, verdict)) = handle.join() else {
                continue;
            };
            match verdict {
                Ok(()) => valid.push(spec),
                Err(reason) => warn!(
                    spec = %spec.fq_name,
                    %reason, "spec failed validation and will not be made available"
                ),
            }
        }
        valid
    })
}

/// Structural checks every published spec must pass.
fn validate_spec_format(spec: &Spec) -> Result<(), String> {
    if !is_compatible_version(&spec.version) {
        return Err(format!(
            "spec version [{}] out of bounds, major must be {}",
            spec.version, SPEC_VERSION_MAJOR
        ));
    }

    if spec.runtime < MIN_RUNTIME_VERSION || spec.runtime > MAX_RUNTIME_VERSION {
        return Err(format!(
            "runtime version [{}] out of bounds {} <= {}",
            spec.runtime, MIN_RUNTIME_VERSION, MAX_RUNTIME_VERSION
        ));
    }

    if spec.plans.is_empty() {
        return Err("specs must have at least one plan".to_string());
    }

    let mut seen = std::collections::HashSet::new();
    for plan in &spec.plans {
        if !seen.insert(&plan.name) {
            return Err(format!(
                "plans within a spec must not contain duplicate value: {}",
                plan.name
            ));
        }
    }

    Ok(())
}

/// The spec version must be `major.minor` with a supported major.
fn is_compatible_version(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 2 {
        return false;
    }
    parts[0]
        .parse::<u64>()
        .map(|major| major == SPEC_VERSION_MAJOR)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qm_core::Plan;

    struct FakeAdapter {
        names: Vec<String>,
        specs: Vec<Spec>,
    }

    #[async_trait]
    impl Adapter for FakeAdapter {
        fn registry_name(&self) -> String {
            "fake".to_string()
        }
        async fn get_image_names(&self) -> RegistryResult<Vec<String>> {
            Ok(self.names.clone())
        }
        async fn fetch_specs(&self, image_names: &[String]) -> RegistryResult<Vec<Spec>> {
            Ok(self
                .specs
                .iter()
                .filter(|s| image_names.contains(&s.image))
                .cloned()
                .collect())
        }
    }

    fn valid_spec(image: &str) -> Spec {
        Spec {
            version: "1.0".to_string(),
            runtime: 2,
            fq_name: image.to_string(),
            image: image.to_string(),
            plans: vec![Plan {
                name: "default".to_string(),
                ..Plan::default()
            }],
            ..Spec::default()
        }
    }

    #[test]
    fn spec_format_checks() {
        let spec = valid_spec("ok-apb");
        assert!(validate_spec_format(&spec).is_ok());

        let mut wrong_version = spec.clone();
        wrong_version.version = "2.0".to_string();
        assert!(validate_spec_format(&wrong_version).is_err());

        let mut malformed_version = spec.clone();
        malformed_version.version = "1".to_string();
        assert!(validate_spec_format(&malformed_version).is_err());

        let mut bad_runtime = spec.clone();
        bad_runtime.runtime = 3;
        assert!(validate_spec_format(&bad_runtime).is_err());

        let mut no_plans = spec.clone();
        no_plans.plans.clear();
        assert!(validate_spec_format(&no_plans).is_err());

        let mut dup_plans = spec.clone();
        dup_plans.plans.push(dup_plans.plans[0].clone());
        assert!(validate_spec_format(&dup_plans).is_err());
    }

    #[test]
    fn url_parse_defaults_scheme_to_http() {
        let url = parse_url("registry.example.com:5000").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host_str(), Some("registry.example.com"));

        let https = parse_url("https://registry.example.com").unwrap();
        assert_eq!(https.scheme(), "https");

        assert!(parse_url("").is_none());
    }

    #[tokio::test]
    async fn load_specs_applies_suffix_filter_and_validation() {
        let adapter = FakeAdapter {
            names: vec![
                "mediawiki-apb".to_string(),
                "not-a-bundle".to_string(),
                "blocked-apb".to_string(),
                "invalid-apb".to_string(),
            ],
            specs: vec![
                valid_spec("mediawiki-apb"),
                // Runtime out of bounds, dropped by validation.
                Spec {
                    runtime: 9,
                    ..valid_spec("invalid-apb")
                },
            ],
        };
        let filter = Filter::new(&[], &["^blocked-apb$".to_string()]);
        let registry = Registry::with_adapter(
            Box::new(adapter),
            filter,
            RegistryConfig {
                name: "test".to_string(),
                ..RegistryConfig::default()
            },
        );

        let (specs, image_count) = registry.load_specs().await.unwrap();

        // All four names count, only the valid bundle survives.
        assert_eq!(image_count, 4);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].fq_name, "mediawiki-apb");
    }

    #[tokio::test]
    async fn unknown_registry_type_is_rejected() {
        let err = create_adapter("warehouse", AdapterConfig::default()).await;
        assert!(matches!(err, Err(RegistryError::Config(_))));
    }
}
