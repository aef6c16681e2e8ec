//! Broker configuration, loaded from a YAML file.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: Vec<RegistryConfig>,
    #[serde(default)]
    pub dao: DaoConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

impl Config {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        for registry in &self.registry {
            registry.validate()?;
        }
        self.dao.validate()?;
        Ok(())
    }
}

// ── Registry ──────────────────────────────────────────────────────

/// How a registry's credentials are sourced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryAuthType {
    /// No credential source configured.
    #[default]
    #[serde(rename = "")]
    None,
    /// Username and password inline in this config block.
    Config,
    /// Username and password read from a YAML file on disk.
    File,
    /// Username and password read from a cluster secret.
    Secret,
}

/// Configuration for one upstream registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub name: String,
    /// Adapter type: rhcc, dockerhub, galaxy, quay, openshift,
    /// local_openshift, partner_rhcc, apiv2, helm, mock.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub org: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub auth_type: RegistryAuthType,
    #[serde(default)]
    pub auth_name: String,
    /// Escalate this registry's load failure to a fatal bootstrap error.
    #[serde(default)]
    pub fail_on_error: bool,
    #[serde(default)]
    pub white_list: Vec<String>,
    #[serde(default)]
    pub black_list: Vec<String>,
    /// Explicitly configured image names, unioned with discovery.
    #[serde(default)]
    pub images: Vec<String>,
    /// Namespaces to scan (local cluster registries).
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Helm chart runner image.
    #[serde(default)]
    pub runner: String,
    #[serde(default)]
    pub skip_verify_tls: bool,
}

fn default_tag() -> String {
    "latest".to_string()
}

impl RegistryConfig {
    /// Validate the registry name and credential wiring.
    ///
    /// Names follow DNS-label-with-dots rules. The auth_type decides
    /// which other fields must (or must not) be present: `file` and
    /// `secret` need `auth_name`, `config` needs inline `user`/`pass`,
    /// and no auth_type forbids a dangling `auth_name`.
    pub fn validate(&self) -> ConfigResult<()> {
        let name_re =
            Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
        if self.name.is_empty() || !name_re.is_match(&self.name) {
            return Err(ConfigError::Validation(format!(
                "registry name '{}' is not valid",
                self.name
            )));
        }
        match self.auth_type {
            RegistryAuthType::File | RegistryAuthType::Secret => {
                if self.auth_name.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "registry '{}': auth_type '{:?}' requires auth_name",
                        self.name, self.auth_type
                    )));
                }
            }
            RegistryAuthType::Config => {
                if self.user.is_empty() || self.pass.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "registry '{}': auth_type 'config' requires user and pass",
                        self.name
                    )));
                }
            }
            RegistryAuthType::None => {
                if !self.auth_name.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "registry '{}': auth_name set without an auth_type",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

// ── DAO ───────────────────────────────────────────────────────────

/// Which persistence backend serves broker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaoBackend {
    /// Embedded hierarchical key-value store.
    #[default]
    Kv,
    /// Typed resources in the cluster API.
    Resource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaoConfig {
    #[serde(default)]
    pub backend: DaoBackend,
    /// Database file path (kv backend).
    #[serde(default)]
    pub path: String,
    /// Namespace holding broker resources (resource backend).
    #[serde(default)]
    pub namespace: String,
}

impl DaoConfig {
    fn validate(&self) -> ConfigResult<()> {
        match self.backend {
            DaoBackend::Kv if self.path.is_empty() => Err(ConfigError::Validation(
                "dao.path is required for the kv backend".to_string(),
            )),
            DaoBackend::Resource if self.namespace.is_empty() => Err(ConfigError::Validation(
                "dao.namespace is required for the resource backend".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

// ── Logging ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub stdout: bool,
    #[serde(default)]
    pub color: bool,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            stdout: true,
            color: false,
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

// ── Cluster ───────────────────────────────────────────────────────

/// Settings for running bundle actions in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Namespace the broker itself runs in.
    #[serde(default)]
    pub namespace: String,
    #[serde(default = "default_sandbox_role")]
    pub sandbox_role: String,
    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,
    /// Keep sandbox namespaces after jobs finish.
    #[serde(default)]
    pub keep_namespace: bool,
    /// Keep sandbox namespaces only when the job failed.
    #[serde(default)]
    pub keep_namespace_on_error: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            namespace: String::new(),
            sandbox_role: default_sandbox_role(),
            image_pull_policy: default_pull_policy(),
            keep_namespace: false,
            keep_namespace_on_error: false,
        }
    }
}

fn default_sandbox_role() -> String {
    "edit".to_string()
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

// ── Broker ────────────────────────────────────────────────────────

/// One enabled auth scheme on the broker's HTTP surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerAuthConfig {
    /// Scheme kind, currently only "basic".
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub bootstrap_on_startup: bool,
    /// Recover in-flight jobs on startup.
    #[serde(default)]
    pub recovery: bool,
    /// Expose development-only endpoints (manual bootstrap).
    #[serde(default)]
    pub dev_broker: bool,
    /// Launch a bundle action on bind instead of returning stored creds.
    #[serde(default)]
    pub launch_apb_on_bind: bool,
    /// Log full request bodies (development only).
    #[serde(default)]
    pub output_request: bool,
    #[serde(default)]
    pub ssl_cert: String,
    #[serde(default)]
    pub ssl_key: String,
    #[serde(default)]
    pub auth: Vec<BrokerAuthConfig>,
    /// Interval between catalog refreshes, e.g. "10m". None disables.
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_registry() -> RegistryConfig {
        RegistryConfig {
            name: "dh".to_string(),
            kind: "dockerhub".to_string(),
            url: "https://registry.hub.docker.com".to_string(),
            org: "ansibleplaybookbundle".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn registry_name_rules() {
        let mut reg = valid_registry();
        assert!(reg.validate().is_ok());

        reg.name = "docker.io".to_string();
        assert!(reg.validate().is_ok());

        for bad in ["", "UPPER", "-leading", "trailing-", "has_underscore"] {
            reg.name = bad.to_string();
            assert!(reg.validate().is_err(), "name {bad:?} should be rejected");
        }
    }

    #[test]
    fn auth_type_file_requires_auth_name() {
        let mut reg = valid_registry();
        reg.auth_type = RegistryAuthType::File;
        assert!(reg.validate().is_err());

        reg.auth_name = "/etc/creds.yaml".to_string();
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn auth_type_secret_requires_auth_name() {
        let mut reg = valid_registry();
        reg.auth_type = RegistryAuthType::Secret;
        assert!(reg.validate().is_err());

        reg.auth_name = "registry-creds".to_string();
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn auth_type_config_requires_user_and_pass() {
        let mut reg = valid_registry();
        reg.auth_type = RegistryAuthType::Config;
        assert!(reg.validate().is_err());

        reg.user = "admin".to_string();
        assert!(reg.validate().is_err());

        reg.pass = "secret".to_string();
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn no_auth_type_forbids_auth_name() {
        let mut reg = valid_registry();
        reg.auth_name = "dangling".to_string();
        assert!(reg.validate().is_err());
    }

    #[test]
    fn parse_full_config() {
        let yaml = r#"
registry:
  - name: dh
    type: dockerhub
    url: https://registry.hub.docker.com
    org: ansibleplaybookbundle
    white_list:
      - ".*-apb$"
dao:
  backend: kv
  path: /var/lib/quartermaster/broker.redb
log:
  level: debug
cluster:
  namespace: quartermaster
  sandbox_role: edit
broker:
  bootstrap_on_startup: true
  recovery: true
  auth:
    - type: basic
      enabled: false
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.registry.len(), 1);
        assert_eq!(config.registry[0].tag, "latest");
        assert_eq!(config.dao.backend, DaoBackend::Kv);
        assert!(config.broker.bootstrap_on_startup);
        assert_eq!(config.cluster.sandbox_role, "edit");
    }

    #[test]
    fn kv_backend_requires_path() {
        let config: Config = serde_yaml::from_str("dao:\n  backend: kv\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn resource_backend_requires_namespace() {
        let config: Config = serde_yaml::from_str("dao:\n  backend: resource\n").unwrap();
        assert!(config.validate().is_err());

        let config: Config =
            serde_yaml::from_str("dao:\n  backend: resource\n  namespace: qm\n").unwrap();
        assert!(config.validate().is_ok());
    }
}
