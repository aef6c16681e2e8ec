//! Registry credential resolution.
//!
//! Credentials can live inline in the broker config, in a YAML file
//! mounted into the pod, or in a cluster secret. Resolution happens once,
//! when the registry is constructed.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use qm_core::config::{RegistryAuthType, RegistryConfig};

use crate::error::{RegistryError, RegistryResult};

/// Resolved username/password pair handed to an adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

/// Source of cluster secret data. The cluster crate provides the real
/// implementation, tests inject a map-backed one.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Fetch the string data of a named secret in a namespace.
    async fn secret_data(
        &self,
        name: &str,
        namespace: &str,
    ) -> RegistryResult<HashMap<String, String>>;
}

/// Resolve the credentials for a registry according to its auth type.
pub async fn resolve(
    config: &RegistryConfig,
    secrets: &dyn SecretSource,
    broker_namespace: &str,
) -> RegistryResult<RegistryCredentials> {
    match config.auth_type {
        RegistryAuthType::Secret => {
            read_secret(secrets, &config.auth_name, broker_namespace).await
        }
        RegistryAuthType::File => read_file(Path::new(&config.auth_name)),
        RegistryAuthType::Config => {
            if config.user.is_empty() || config.pass.is_empty() {
                return Err(RegistryError::Auth(
                    "failed to find registry credentials in config".to_string(),
                ));
            }
            Ok(RegistryCredentials {
                username: config.user.clone(),
                password: config.pass.clone(),
            })
        }
        // The user either has no credentials or put them in the config.
        RegistryAuthType::None => Ok(RegistryCredentials {
            username: config.user.clone(),
            password: config.pass.clone(),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct FileCredentials {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

fn read_file(path: &Path) -> RegistryResult<RegistryCredentials> {
    let contents = std::fs::read_to_string(path).map_err(|_| {
        RegistryError::Auth(format!(
            "failed to read registry credentials from file: {}",
            path.display()
        ))
    })?;
    let creds: FileCredentials = serde_yaml::from_str(&contents).map_err(|_| {
        RegistryError::Auth(format!(
            "failed to unmarshal registry credentials from file: {}",
            path.display()
        ))
    })?;
    Ok(RegistryCredentials {
        username: creds.username,
        password: creds.password,
    })
}

async fn read_secret(
    secrets: &dyn SecretSource,
    name: &str,
    namespace: &str,
) -> RegistryResult<RegistryCredentials> {
    let data = secrets.secret_data(name, namespace).await.map_err(|_| {
        RegistryError::Auth(format!("failed to find registry credentials in secret: {name}"))
    })?;

    let username = data.get("username").map(|s| s.trim()).unwrap_or_default();
    let password = data.get("password").map(|s| s.trim()).unwrap_or_default();

    if username.is_empty() || password.is_empty() {
        return Err(RegistryError::Auth(format!(
            "secret {name} did not contain username/password credentials"
        )));
    }

    Ok(RegistryCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct MapSecrets(HashMap<String, HashMap<String, String>>);

    #[async_trait]
    impl SecretSource for MapSecrets {
        async fn secret_data(
            &self,
            name: &str,
            _namespace: &str,
        ) -> RegistryResult<HashMap<String, String>> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| RegistryError::Auth(format!("no secret {name}")))
        }
    }

    fn test_config(auth_type: RegistryAuthType, auth_name: &str) -> RegistryConfig {
        RegistryConfig {
            name: "dh".to_string(),
            auth_type,
            auth_name: auth_name.to_string(),
            ..RegistryConfig::default()
        }
    }

    fn no_secrets() -> MapSecrets {
        MapSecrets(HashMap::new())
    }

    #[tokio::test]
    async fn config_auth_requires_user_and_pass() {
        let mut config = test_config(RegistryAuthType::Config, "");
        config.user = "shurley".to_string();

        let err = resolve(&config, &no_secrets(), "broker").await;
        assert!(err.is_err());

        config.pass = "testpass".to_string();
        let creds = resolve(&config, &no_secrets(), "broker").await.unwrap();
        assert_eq!(creds.username, "shurley");
        assert_eq!(creds.password, "testpass");
    }

    #[tokio::test]
    async fn none_auth_passes_config_values_through() {
        let mut config = test_config(RegistryAuthType::None, "");
        config.user = "u".to_string();

        let creds = resolve(&config, &no_secrets(), "broker").await.unwrap();
        assert_eq!(creds.username, "u");
        assert_eq!(creds.password, "");
    }

    #[tokio::test]
    async fn file_auth_reads_yaml_credentials() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "username: fileuser\npassword: filepass").unwrap();
        let config = test_config(RegistryAuthType::File, file.path().to_str().unwrap());

        let creds = resolve(&config, &no_secrets(), "broker").await.unwrap();
        assert_eq!(creds.username, "fileuser");
        assert_eq!(creds.password, "filepass");
    }

    #[tokio::test]
    async fn file_auth_fails_on_missing_file() {
        let config = test_config(RegistryAuthType::File, "/no/such/credentials.yaml");
        assert!(resolve(&config, &no_secrets(), "broker").await.is_err());
    }

    #[tokio::test]
    async fn secret_auth_trims_whitespace() {
        let secrets = MapSecrets(HashMap::from([(
            "reg-creds".to_string(),
            HashMap::from([
                ("username".to_string(), " secuser \n".to_string()),
                ("password".to_string(), "secpass\n".to_string()),
            ]),
        )]));
        let config = test_config(RegistryAuthType::Secret, "reg-creds");

        let creds = resolve(&config, &secrets, "broker").await.unwrap();
        assert_eq!(creds.username, "secuser");
        assert_eq!(creds.password, "secpass");
    }

    #[tokio::test]
    async fn secret_auth_rejects_empty_credentials() {
        let secrets = MapSecrets(HashMap::from([(
            "reg-creds".to_string(),
            HashMap::from([("username".to_string(), "secuser".to_string())]),
        )]));
        let config = test_config(RegistryAuthType::Secret, "reg-creds");

        assert!(resolve(&config, &secrets, "broker").await.is_err());
    }
}
