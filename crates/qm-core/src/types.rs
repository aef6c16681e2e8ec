//! Domain types for the Quartermaster broker.
//!
//! These types model service bundles (specs), provisioned instances,
//! bindings, and the async jobs that drive them. Persisted values are
//! JSON; bundle specs arrive from registries as YAML, so the serde
//! field names follow the bundle spec label format.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Unique identifier for a bundle spec.
pub type SpecId = String;

/// Unique identifier for a service instance.
pub type InstanceId = String;

/// Unique identifier for a binding.
pub type BindingId = String;

/// Image label carrying the base64-encoded bundle spec.
pub const BUNDLE_SPEC_LABEL: &str = "com.redhat.apb.spec";

/// Preferred image label carrying the bundle runtime version.
pub const BUNDLE_RUNTIME_LABEL: &str = "com.redhat.bundle.runtime";

/// Legacy image label carrying the bundle runtime version.
pub const APB_RUNTIME_LABEL: &str = "com.redhat.apb.runtime";

/// Supported spec version (major must match).
pub const SPEC_VERSION_MAJOR: u64 = 1;

/// Lowest supported bundle runtime version.
pub const MIN_RUNTIME_VERSION: u32 = 1;

/// Highest supported bundle runtime version.
pub const MAX_RUNTIME_VERSION: u32 = 2;

/// Arbitrary request parameters passed through to bundle actions.
pub type Parameters = HashMap<String, serde_json::Value>;

// ── Spec ──────────────────────────────────────────────────────────

/// A service bundle spec, decoded from a registry image label.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Spec {
    #[serde(default)]
    pub id: SpecId,
    /// Bundle runtime version (1 or 2).
    #[serde(default)]
    pub runtime: u32,
    #[serde(default)]
    pub version: String,
    /// Fully qualified name, `<registry>-<image name>`.
    #[serde(rename = "name", default)]
    pub fq_name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Pre-release metadata, passed through without interpretation.
    #[serde(default)]
    pub alpha: HashMap<String, serde_json::Value>,
    /// Whether actions on this bundle may/must run asynchronously.
    #[serde(rename = "async", default)]
    pub async_policy: AsyncType,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

impl Spec {
    /// Look up a plan by name.
    pub fn plan(&self, name: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.name == name)
    }

    /// Look up a plan by its derived ID.
    pub fn plan_by_id(&self, id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == id)
    }
}

/// Async execution policy declared by a bundle spec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncType {
    #[default]
    Optional,
    Required,
    Unsupported,
}

impl fmt::Display for AsyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncType::Optional => write!(f, "optional"),
            AsyncType::Required => write!(f, "required"),
            AsyncType::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// A plan offered by a bundle spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub free: bool,
    #[serde(default)]
    pub bindable: bool,
    /// Names of plans this plan may be updated to.
    #[serde(default)]
    pub updates_to: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterDescriptor>,
    #[serde(default)]
    pub bind_parameters: Vec<ParameterDescriptor>,
}

impl Plan {
    /// Look up a provision parameter by name.
    pub fn parameter(&self, name: &str) -> Option<&ParameterDescriptor> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// A single parameter declared by a plan.
///
/// Numeric bounds are nilable: `None` means "no bound declared", which
/// is distinct from a bound of zero and must survive every conversion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParameterDescriptor {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Deprecated spelling kept for old bundle specs.
    #[serde(rename = "maxlength", default, skip_serializing_if = "Option::is_none")]
    pub deprecated_maxlength: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiple_of: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusive_minimum: Option<f64>,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub updatable: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_group: String,
}

// ── Instances & bindings ──────────────────────────────────────────

/// Platform context a service instance was provisioned into.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Context {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub namespace: String,
}

/// A provisioned service instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstance {
    pub id: InstanceId,
    pub spec_id: SpecId,
    #[serde(default)]
    pub context: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(default)]
    pub binding_ids: BTreeSet<BindingId>,
}

impl ServiceInstance {
    /// Record a binding against this instance.
    pub fn add_binding(&mut self, binding_id: &str) {
        self.binding_ids.insert(binding_id.to_string());
    }

    /// Remove a binding from this instance.
    pub fn remove_binding(&mut self, binding_id: &str) {
        self.binding_ids.remove(binding_id);
    }

    pub fn has_binding(&self, binding_id: &str) -> bool {
        self.binding_ids.contains(binding_id)
    }
}

/// A binding created against a service instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BindInstance {
    pub id: BindingId,
    pub service_id: InstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
    /// Token of the job that created this binding.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub create_job_key: String,
}

impl BindInstance {
    /// Whether a bind request carries the same parameters as this binding.
    pub fn is_equal_request(&self, parameters: &Option<Parameters>) -> bool {
        self.parameters == *parameters
    }
}

/// Credentials extracted from a completed bundle action.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractedCredentials {
    #[serde(default)]
    pub credentials: HashMap<String, serde_json::Value>,
}

// ── Jobs ──────────────────────────────────────────────────────────

/// Lifecycle state of an async job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    #[default]
    #[serde(rename = "not yet started")]
    NotYetStarted,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

impl State {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Succeeded | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::NotYetStarted => write!(f, "not yet started"),
            State::InProgress => write!(f, "in progress"),
            State::Succeeded => write!(f, "succeeded"),
            State::Failed => write!(f, "failed"),
        }
    }
}

/// The bundle action a job was spawned for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMethod {
    #[default]
    Provision,
    Deprovision,
    Bind,
    Unbind,
    Update,
}

impl fmt::Display for JobMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobMethod::Provision => write!(f, "provision"),
            JobMethod::Deprovision => write!(f, "deprovision"),
            JobMethod::Bind => write!(f, "bind"),
            JobMethod::Unbind => write!(f, "unbind"),
            JobMethod::Update => write!(f, "update"),
        }
    }
}

/// Persisted state of one async job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobState {
    pub token: String,
    pub state: State,
    pub method: JobMethod,
    /// Name of the sandbox pod running the action, once launched.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub podname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Wall-clock time of the last write, seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
}

impl JobState {
    /// Stamp the last-modified time with the current wall clock.
    pub fn touch(&mut self) {
        self.last_modified = Some(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_yaml_decodes_bundle_label_format() {
        let yaml = r#"
version: 1.0
name: mediawiki-apb
description: Mediawiki bundle
bindable: false
async: optional
metadata:
  displayName: Mediawiki
plans:
  - name: default
    description: default plan
    free: true
    parameters:
      - name: mediawiki_db_schema
        title: DB Schema
        type: string
        default: mediawiki
        required: true
"#;
        let spec: Spec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.fq_name, "mediawiki-apb");
        assert_eq!(spec.async_policy, AsyncType::Optional);
        assert_eq!(spec.plans.len(), 1);
        let param = spec.plans[0].parameter("mediawiki_db_schema").unwrap();
        assert_eq!(param.default, Some(serde_json::json!("mediawiki")));
        assert!(param.required);
    }

    #[test]
    fn parameter_nilable_bounds_survive_json_round_trip() {
        let param = ParameterDescriptor {
            name: "count".to_string(),
            param_type: "int".to_string(),
            maximum: Some(10.0),
            minimum: None,
            ..Default::default()
        };
        let json = serde_json::to_string(&param).unwrap();
        let back: ParameterDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.maximum, Some(10.0));
        assert_eq!(back.minimum, None);
        // A missing bound must not come back as zero.
        assert_ne!(back.minimum, Some(0.0));
    }

    #[test]
    fn instance_binding_set_add_remove() {
        let mut instance = ServiceInstance {
            id: "inst-1".to_string(),
            spec_id: "spec-1".to_string(),
            ..Default::default()
        };
        instance.add_binding("b1");
        instance.add_binding("b2");
        instance.add_binding("b1");
        assert_eq!(instance.binding_ids.len(), 2);
        assert!(instance.has_binding("b1"));

        instance.remove_binding("b1");
        assert!(!instance.has_binding("b1"));
        assert!(instance.has_binding("b2"));
    }

    #[test]
    fn state_terminal_classification() {
        assert!(State::Succeeded.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(!State::InProgress.is_terminal());
        assert!(!State::NotYetStarted.is_terminal());
    }

    #[test]
    fn state_serializes_with_spaces() {
        assert_eq!(
            serde_json::to_string(&State::InProgress).unwrap(),
            "\"in progress\""
        );
        assert_eq!(
            serde_json::to_string(&State::NotYetStarted).unwrap(),
            "\"not yet started\""
        );
    }

    #[test]
    fn job_method_round_trip() {
        for method in [
            JobMethod::Provision,
            JobMethod::Deprovision,
            JobMethod::Bind,
            JobMethod::Unbind,
            JobMethod::Update,
        ] {
            let json = serde_json::to_string(&method).unwrap();
            let back: JobMethod = serde_json::from_str(&json).unwrap();
            assert_eq!(back, method);
        }
    }
}
