//! Helm repository adapter.
//!
//! Charts are not bundle images, so this adapter synthesises specs: each
//! chart becomes a bundle running the configured runner image with a fixed
//! `default` plan whose parameters select the repo, chart, version, and a
//! values override.

use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use qm_core::{AsyncType, ParameterDescriptor, Plan, Spec};

use crate::error::{RegistryError, RegistryResult};

use super::{Adapter, AdapterConfig};

const HELM_NAME: &str = "helm";
const INDEX_PATH: &str = "index.yaml";

#[derive(Debug, Default, Clone, Deserialize)]
struct ChartVersion {
    #[serde(default)]
    name: String,
    #[serde(default)]
    home: String,
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default)]
    version: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    icon: String,
    #[serde(default)]
    urls: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct IndexFile {
    #[serde(default, rename = "apiVersion")]
    api_version: String,
    #[serde(default)]
    entries: HashMap<String, Vec<ChartVersion>>,
}

/// Adapter for Helm chart repositories.
pub struct HelmAdapter {
    config: AdapterConfig,
    client: reqwest::Client,
    // Chart versions discovered by get_image_names, keyed by chart name,
    // newest version first.
    charts: Mutex<HashMap<String, Vec<ChartVersion>>>,
}

impl HelmAdapter {
    pub fn new(config: AdapterConfig) -> RegistryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            config,
            client,
            charts: Mutex::new(HashMap::new()),
        })
    }

    async fn fetch_index(&self) -> RegistryResult<IndexFile> {
        let base = self.config.url()?.as_str().trim_end_matches('/').to_string();
        let url = Url::parse(&format!("{base}/{INDEX_PATH}"))?;
        let body = self.client.get(url).send().await?.bytes().await?;
        let mut index: IndexFile = serde_yaml::from_slice(&body)?;

        if index.api_version.is_empty() {
            return Err(RegistryError::Config(
                "no apiVersion on helm index file".to_string(),
            ));
        }
        for versions in index.entries.values_mut() {
            sort_newest_first(versions);
        }
        Ok(index)
    }

    /// Download the chart tarball and pull out its top-level values.yaml.
    /// Any failure simply yields an empty default.
    async fn chart_values(&self, chart: &ChartVersion) -> String {
        let Some(url) = chart.urls.first() else {
            return String::new();
        };
        let body = match self.client.get(url.clone()).send().await {
            Ok(resp) => match resp.bytes().await {
                Ok(body) => body,
                Err(_) => return String::new(),
            },
            Err(e) => {
                warn!(chart = %chart.name, error = %e, "failed to download chart archive");
                return String::new();
            }
        };
        extract_values(&body)
    }

    fn chart_to_spec(&self, chart: &ChartVersion, versions: Vec<String>, values: String) -> Spec {
        let repo_url = self
            .config
            .url
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_default();

        Spec {
            runtime: 2,
            version: "1.0".to_string(),
            fq_name: chart.name.clone(),
            image: self.config.runner.clone(),
            tags: chart.keywords.clone(),
            bindable: false,
            description: chart.description.clone(),
            async_policy: AsyncType::Optional,
            metadata: HashMap::from([
                (
                    "displayName".to_string(),
                    serde_json::Value::String(format!("{} (Helm)", chart.name)),
                ),
                (
                    "documentationUrl".to_string(),
                    serde_json::Value::String(chart.home.clone()),
                ),
                (
                    "dependencies".to_string(),
                    serde_json::json!(chart.sources),
                ),
                (
                    "imageUrl".to_string(),
                    serde_json::Value::String(chart.icon.clone()),
                ),
            ]),
            plans: vec![Plan {
                name: "default".to_string(),
                description: "Default plan for running helm charts".to_string(),
                parameters: vec![
                    ParameterDescriptor {
                        name: "repo".to_string(),
                        title: "Helm Chart Repository URL".to_string(),
                        param_type: "string".to_string(),
                        default: Some(serde_json::Value::String(repo_url.clone())),
                        pattern: format!("^{repo_url}$"),
                        ..ParameterDescriptor::default()
                    },
                    ParameterDescriptor {
                        name: "chart".to_string(),
                        title: "Helm Chart".to_string(),
                        param_type: "string".to_string(),
                        default: Some(serde_json::Value::String(chart.name.clone())),
                        pattern: format!("^{}$", chart.name),
                        ..ParameterDescriptor::default()
                    },
                    ParameterDescriptor {
                        name: "version".to_string(),
                        title: "Helm Chart Version".to_string(),
                        param_type: "enum".to_string(),
                        enum_values: versions,
                        default: Some(serde_json::Value::String(chart.version.clone())),
                        updatable: true,
                        ..ParameterDescriptor::default()
                    },
                    ParameterDescriptor {
                        name: "values".to_string(),
                        title: "Values".to_string(),
                        param_type: "string".to_string(),
                        display_type: "textarea".to_string(),
                        default: Some(serde_json::Value::String(values)),
                        updatable: true,
                        ..ParameterDescriptor::default()
                    },
                ],
                ..Plan::default()
            }],
            ..Spec::default()
        }
    }
}

/// Newest semver first, unparseable versions last.
fn sort_newest_first(versions: &mut [ChartVersion]) {
    versions.sort_by(|a, b| {
        match (
            semver::Version::parse(&a.version),
            semver::Version::parse(&b.version),
        ) {
            (Ok(a), Ok(b)) => b.cmp(&a),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => std::cmp::Ordering::Equal,
        }
    });
}

/// Pull `<chart>/values.yaml` out of a gzipped chart tarball.
fn extract_values(archive: &[u8]) -> String {
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let Ok(entries) = tar.entries() else {
        return String::new();
    };
    for entry in entries {
        let Ok(mut entry) = entry else {
            return String::new();
        };
        let is_values = entry
            .path()
            .map(|p| {
                let mut parts = p.components();
                parts.next().is_some()
                    && parts.next().is_some_and(|c| c.as_os_str() == "values.yaml")
                    && parts.next().is_none()
            })
            .unwrap_or(false);
        if is_values {
            let mut values = String::new();
            if entry.read_to_string(&mut values).is_err() {
                return String::new();
            }
            return values;
        }
    }
    String::new()
}

#[async_trait]
impl Adapter for HelmAdapter {
    fn registry_name(&self) -> String {
        HELM_NAME.to_string()
    }

    async fn get_image_names(&self) -> RegistryResult<Vec<String>> {
        let index = self.fetch_index().await?;

        let mut charts = self.charts.lock().await;
        charts.clear();
        let mut names = Vec::new();
        for (name, versions) in index.entries {
            // A chart without at least one version cannot be offered.
            if versions.is_empty() {
                continue;
            }
            names.push(name.clone());
            charts.insert(name, versions);
        }
        Ok(names)
    }

    async fn fetch_specs(&self, image_names: &[String]) -> RegistryResult<Vec<Spec>> {
        let charts = self.charts.lock().await;
        let mut specs = Vec::new();

        for name in image_names {
            let Some(versions) = charts.get(name) else {
                continue;
            };
            let Some(latest) = versions.first() else {
                continue;
            };
            debug!(chart = %name, version = %latest.version, "converting chart to spec");

            let version_names = versions.iter().map(|c| c.version.clone()).collect();
            let values = self.chart_values(latest).await;
            specs.push(self.chart_to_spec(latest, version_names, values));
        }
        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chart(version: &str) -> ChartVersion {
        ChartVersion {
            name: "mariadb".to_string(),
            version: version.to_string(),
            ..ChartVersion::default()
        }
    }

    fn chart_tarball(values: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(values.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, "mariadb/values.yaml", values.as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn versions_sort_newest_first_with_failures_last() {
        let mut versions = vec![chart("1.2.0"), chart("not-semver"), chart("2.0.1")];
        sort_newest_first(&mut versions);
        assert_eq!(versions[0].version, "2.0.1");
        assert_eq!(versions[1].version, "1.2.0");
        assert_eq!(versions[2].version, "not-semver");
    }

    #[test]
    fn values_extraction_matches_top_level_file_only() {
        let tarball = chart_tarball("replicas: 2\n");
        assert_eq!(extract_values(&tarball), "replicas: 2\n");
        assert_eq!(extract_values(b"not a tarball"), "");
    }

    #[tokio::test]
    async fn charts_become_specs_with_default_plan() {
        let server = MockServer::start().await;
        let index = format!(
            r#"
apiVersion: v1
entries:
  mariadb:
    - name: mariadb
      version: "5.0.0"
      description: Fast SQL
      keywords: [database]
      home: https://mariadb.org
      urls: ["{0}/charts/mariadb-5.0.0.tgz"]
    - name: mariadb
      version: "4.0.0"
      urls: []
  empty: []
"#,
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/index.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(index))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/charts/mariadb-5.0.0.tgz"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(chart_tarball("replicas: 1\n")),
            )
            .mount(&server)
            .await;

        let adapter = HelmAdapter::new(AdapterConfig {
            url: Some(Url::parse(&server.uri()).unwrap()),
            runner: "helm-runner:latest".to_string(),
            ..AdapterConfig::default()
        })
        .unwrap();

        let names = adapter.get_image_names().await.unwrap();
        assert_eq!(names, vec!["mariadb"]);

        let specs = adapter.fetch_specs(&names).await.unwrap();
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.fq_name, "mariadb");
        assert_eq!(spec.runtime, 2);
        assert_eq!(spec.image, "helm-runner:latest");
        assert_eq!(spec.async_policy, AsyncType::Optional);
        assert_eq!(
            spec.metadata.get("displayName"),
            Some(&serde_json::Value::String("mariadb (Helm)".to_string()))
        );

        let plan = &spec.plans[0];
        assert_eq!(plan.name, "default");
        let version = plan.parameter("version").unwrap();
        assert_eq!(version.enum_values, vec!["5.0.0", "4.0.0"]);
        assert_eq!(
            version.default,
            Some(serde_json::Value::String("5.0.0".to_string()))
        );
        let values = plan.parameter("values").unwrap();
        assert_eq!(values.display_type, "textarea");
        assert_eq!(
            values.default,
            Some(serde_json::Value::String("replicas: 1\n".to_string()))
        );
    }

    #[tokio::test]
    async fn index_without_api_version_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.yaml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("entries: {}\n"))
            .mount(&server)
            .await;

        let adapter = HelmAdapter::new(AdapterConfig {
            url: Some(Url::parse(&server.uri()).unwrap()),
            ..AdapterConfig::default()
        })
        .unwrap();
        assert!(adapter.get_image_names().await.is_err());
    }
}
