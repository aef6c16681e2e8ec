//! Turning registry manifest responses into bundle specs.
//!
//! Bundle images carry their spec as a base64-encoded YAML document in the
//! `com.redhat.apb.spec` image label. Schema 1 manifests expose the labels
//! inline in the image history, schema 2 manifests require following the
//! config digest to the config blob.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use qm_core::Spec;

use crate::error::{RegistryError, RegistryResult};

#[derive(Debug, Default, Deserialize)]
struct ImageLabels {
    #[serde(rename = "com.redhat.apb.spec", default)]
    spec: String,
    #[serde(rename = "com.redhat.apb.runtime", default)]
    runtime: String,
    #[serde(rename = "com.redhat.bundle.runtime", default)]
    bundle_runtime: String,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigSection {
    #[serde(rename = "Labels", default)]
    labels: ImageLabels,
    #[serde(default)]
    digest: String,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestConfig {
    #[serde(default)]
    config: ConfigSection,
}

#[derive(Debug, Deserialize)]
struct SchemaProbe {
    #[serde(rename = "schemaVersion", default)]
    schema_version: u32,
}

#[derive(Debug, Deserialize)]
struct Schema1Manifest {
    #[serde(default)]
    history: Vec<HashMap<String, String>>,
}

/// Classify a registry response: 401 means bad credentials, anything else
/// but 200 is unexpected, 200 yields the body.
pub async fn handle_response(resp: Response) -> RegistryResult<Vec<u8>> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(RegistryError::Unauthorized);
    }
    let body = resp.bytes().await?;
    if status != StatusCode::OK {
        return Err(RegistryError::Response {
            code: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    Ok(body.to_vec())
}

/// Pull the `schemaVersion` out of a manifest body.
pub fn schema_version(body: &[u8]) -> RegistryResult<u32> {
    let probe: SchemaProbe = serde_json::from_slice(body)?;
    Ok(probe.schema_version)
}

/// Pull the config blob digest out of a schema 2 manifest.
pub fn config_digest(body: &[u8], image: &str) -> RegistryResult<String> {
    let manifest: ManifestConfig = serde_json::from_slice(body)?;
    if manifest.config.digest.is_empty() {
        return Err(RegistryError::Manifest {
            image: image.to_string(),
            reason: "schema 2 manifest has no config digest".to_string(),
        });
    }
    Ok(manifest.config.digest)
}

/// Decode a spec from a schema 1 manifest, where the image config is
/// embedded in the first history entry.
pub fn spec_from_schema1(body: &[u8], image: &str) -> RegistryResult<Option<Spec>> {
    let manifest: Schema1Manifest = serde_json::from_slice(body)?;
    let Some(compat) = manifest.history.first().and_then(|h| h.get("v1Compatibility")) else {
        return Err(RegistryError::Manifest {
            image: image.to_string(),
            reason: "schema 1 manifest has no v1Compatibility history".to_string(),
        });
    };
    spec_from_config(compat.as_bytes(), image)
}

/// Decode a spec from an image config object (schema 2 blob, or the inline
/// schema 1 history entry).
pub fn spec_from_config(config: &[u8], image: &str) -> RegistryResult<Option<Spec>> {
    let config: ManifestConfig = serde_json::from_slice(config)?;
    let labels = config.config.labels;

    if labels.spec.is_empty() {
        info!(image, "no spec label found, assuming image is not a bundle");
        return Ok(None);
    }

    // The bundle runtime label wins over the older apb runtime label.
    let runtime_label = if labels.bundle_runtime.is_empty() {
        &labels.runtime
    } else {
        debug!(image, "bundle runtime label present, using it over apb runtime");
        &labels.bundle_runtime
    };

    let mut spec = spec_from_label(&labels.spec, image)?;
    spec.runtime = runtime_version(runtime_label, image)?;
    Ok(Some(spec))
}

/// Decode the base64 + YAML spec label and stamp the image reference onto
/// the result. The runtime is left for the caller to resolve.
pub fn spec_from_label(encoded: &str, image: &str) -> RegistryResult<Spec> {
    let yaml = BASE64.decode(encoded).map_err(|e| RegistryError::Manifest {
        image: image.to_string(),
        reason: format!("failed to base64-decode spec label: {e}"),
    })?;
    let mut spec: Spec = serde_yaml::from_slice(&yaml)?;
    // Image reference used when provisioning.
    spec.image = image.to_string();
    Ok(spec)
}

/// Resolve the runtime version label. An absent label means the original
/// runtime contract, version 1.
pub fn runtime_version(label: &str, image: &str) -> RegistryResult<u32> {
    if label.is_empty() {
        info!(image, "no runtime label found, defaulting to runtime 1");
        return Ok(1);
    }
    label.parse::<u32>().map_err(|e| RegistryError::Manifest {
        image: image.to_string(),
        reason: format!("unable to parse runtime version '{label}': {e}"),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::BASE64;
    use base64::Engine;

    pub const SPEC_YAML: &str = r#"
version: "1.0"
name: mediawiki-apb
description: Mediawiki bundle
bindable: false
async: optional
metadata:
  displayName: Mediawiki (APB)
plans:
  - name: default
    description: default plan
    free: true
    parameters:
      - name: mediawiki_db_schema
        title: Schema
        type: string
        default: mediawiki
"#;

    pub fn encoded_spec() -> String {
        BASE64.encode(SPEC_YAML)
    }

    pub fn schema1_manifest(runtime: &str) -> Vec<u8> {
        let compat = serde_json::json!({
            "config": {
                "Labels": {
                    "com.redhat.apb.spec": encoded_spec(),
                    "com.redhat.apb.runtime": runtime,
                }
            }
        });
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 1,
            "history": [ { "v1Compatibility": compat.to_string() } ]
        }))
        .unwrap()
    }
}
