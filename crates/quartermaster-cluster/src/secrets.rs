//! Registry credentials from cluster secrets.

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1 as corev1;
use kube::api::Api;
use kube::Client;

use quartermaster_registry::{RegistryError, SecretSource};

/// Decode a secret's byte values into strings.
pub(crate) fn secret_string_data(secret: corev1::Secret) -> Result<HashMap<String, String>, String> {
    let mut out = HashMap::new();
    for (key, bytes) in secret.data.unwrap_or_default() {
        let value = String::from_utf8(bytes.0)
            .map_err(|_| format!("secret value for key '{key}' is not utf-8"))?;
        out.insert(key, value);
    }
    Ok(out)
}

/// [`SecretSource`] backed by the cluster's secret API.
#[derive(Clone)]
pub struct KubeSecretSource {
    client: Client,
}

impl KubeSecretSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretSource for KubeSecretSource {
    async fn secret_data(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<HashMap<String, String>, RegistryError> {
        let api = Api::<corev1::Secret>::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await
            .map_err(|e| RegistryError::Auth(format!("failed to read secret {name}: {e}")))?
            .ok_or_else(|| RegistryError::Auth(format!("secret {name} not found in {namespace}")))?;
        secret_string_data(secret).map_err(RegistryError::Auth)
    }
}
