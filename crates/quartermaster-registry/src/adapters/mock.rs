//! Mock adapter backed by a YAML file of specs, for development brokers.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::info;

use qm_core::Spec;

use crate::error::RegistryResult;

use super::Adapter;

const MOCK_NAME: &str = "mock";

/// Default location the dev image mounts registry data at.
pub const DEFAULT_MOCK_FILE: &str = "/etc/quartermaster/mock-registry-data.yaml";

#[derive(Debug, Default, Deserialize)]
struct MockData {
    #[serde(default)]
    apps: Vec<Spec>,
}

/// Adapter that loads specs straight from a YAML file.
pub struct MockAdapter {
    path: PathBuf,
    specs: Mutex<HashMap<String, Spec>>,
}

impl MockAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            specs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_MOCK_FILE)
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn registry_name(&self) -> String {
        MOCK_NAME.to_string()
    }

    async fn get_image_names(&self) -> RegistryResult<Vec<String>> {
        let contents = tokio::fs::read(&self.path).await?;
        let data: MockData = serde_yaml::from_slice(&contents)?;
        info!(count = data.apps.len(), "loaded specs from mock registry");

        let mut specs = self.specs.lock().await;
        specs.clear();
        let mut names = Vec::new();
        for spec in data.apps {
            names.push(spec.image.clone());
            specs.insert(spec.image.clone(), spec);
        }
        Ok(names)
    }

    async fn fetch_specs(&self, image_names: &[String]) -> RegistryResult<Vec<Spec>> {
        let specs = self.specs.lock().await;
        Ok(image_names
            .iter()
            .filter_map(|name| specs.get(name).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn loads_specs_keyed_by_image() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
apps:
  - name: mediawiki-apb
    image: mock/mediawiki-apb:latest
    version: "1.0"
    runtime: 2
    async: optional
    plans:
      - name: default
  - name: postgresql-apb
    image: mock/postgresql-apb:latest
    version: "1.0"
    runtime: 2
    async: optional
    plans:
      - name: default
"#
        )
        .unwrap();

        let adapter = MockAdapter::new(file.path());
        let names = adapter.get_image_names().await.unwrap();
        assert_eq!(
            names,
            vec!["mock/mediawiki-apb:latest", "mock/postgresql-apb:latest"]
        );

        let specs = adapter
            .fetch_specs(&["mock/postgresql-apb:latest".to_string()])
            .await
            .unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].fq_name, "postgresql-apb");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let adapter = MockAdapter::new("/no/such/mock-data.yaml");
        assert!(adapter.get_image_names().await.is_err());
    }
}
