//! Wire-format mirror types for the typed-resource backend.
//!
//! The resource API stores flat documents: open maps become
//! JSON-encoded strings, enums become their string names, and a
//! parameter default is wrapped as `{"default": <value>}` so that a
//! default of `null` stays distinguishable from "no default".

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpecResource {
    pub runtime: u32,
    pub version: String,
    pub fq_name: String,
    pub image: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub bindable: bool,
    #[serde(default)]
    pub description: String,
    /// JSON-encoded metadata map.
    #[serde(default)]
    pub metadata: String,
    /// JSON-encoded alpha metadata map.
    #[serde(default)]
    pub alpha: String,
    pub async_type: String,
    #[serde(default)]
    pub plans: Vec<PlanResource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanResource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-encoded metadata map.
    #[serde(default)]
    pub metadata: String,
    pub free: bool,
    pub bindable: bool,
    #[serde(default)]
    pub updates_to: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterResource>,
    #[serde(default)]
    pub bind_parameters: Vec<ParameterResource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParameterResource {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    /// JSON-encoded `{"default": <value>}` wrapper, empty if unset.
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub deprecated_maxlength: Option<u64>,
    #[serde(default)]
    pub max_length: Option<u64>,
    #[serde(default)]
    pub min_length: Option<u64>,
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub multiple_of: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub exclusive_maximum: Option<f64>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub exclusive_minimum: Option<f64>,
    #[serde(rename = "enum", default)]
    pub enum_values: Vec<String>,
    pub required: bool,
    pub updatable: bool,
    #[serde(default)]
    pub display_type: String,
    #[serde(default)]
    pub display_group: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstanceResource {
    pub spec_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub namespace: String,
    /// JSON-encoded parameters map, empty if unset.
    #[serde(default)]
    pub parameters: String,
    #[serde(default)]
    pub dashboard_url: Option<String>,
    #[serde(default)]
    pub binding_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BindInstanceResource {
    pub service_id: String,
    /// JSON-encoded parameters map, empty if unset.
    #[serde(default)]
    pub parameters: String,
    #[serde(default)]
    pub create_job_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobStateResource {
    pub token: String,
    pub state: String,
    pub method: String,
    #[serde(default)]
    pub podname: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub last_modified: Option<u64>,
}
