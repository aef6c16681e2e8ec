//! Bind-credential extraction from bundle pod output.
//!
//! A bind action prints one marker-delimited line to stdout:
//! `<BIND_CREDENTIALS>BASE64(JSON)</BIND_CREDENTIALS>`. A bundle can
//! also report a bind failure with `<BIND_ERROR>reason</BIND_ERROR>`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::collections::HashMap;

use qm_core::ExtractedCredentials;

use crate::{EngineError, EngineResult};

const CREDS_OPEN: &str = "<BIND_CREDENTIALS>";
const CREDS_CLOSE: &str = "</BIND_CREDENTIALS>";
const ERROR_OPEN: &str = "<BIND_ERROR>";
const ERROR_CLOSE: &str = "</BIND_ERROR>";

/// Scan pod output for the credential marker.
///
/// Returns `Ok(None)` when no marker is present at all; provision and
/// deprovision output never carries one. A bundle-reported bind error
/// or an undecodable payload is an error.
pub fn extract_credentials(output: &str) -> EngineResult<Option<ExtractedCredentials>> {
    if let Some(payload) = delimited(output, CREDS_OPEN, CREDS_CLOSE)? {
        return decode_payload(payload).map(Some);
    }
    if let Some(reason) = delimited(output, ERROR_OPEN, ERROR_CLOSE)? {
        return Err(EngineError::JobFailure(reason.to_string()));
    }
    Ok(None)
}

/// The text between a marker pair, if both ends appear in order.
fn delimited<'a>(output: &'a str, open: &str, close: &str) -> EngineResult<Option<&'a str>> {
    match (output.find(open), output.find(close)) {
        (Some(start), Some(end)) if start + open.len() <= end => {
            Ok(Some(&output[start + open.len()..end]))
        }
        (None, None) => Ok(None),
        // One half of the pair, or the pair out of order.
        _ => Err(EngineError::Credentials(format!(
            "unbalanced {open} marker in pod output"
        ))),
    }
}

fn decode_payload(payload: &str) -> EngineResult<ExtractedCredentials> {
    let decoded = BASE64
        .decode(payload.trim())
        .map_err(|e| EngineError::Credentials(format!("payload is not base64: {e}")))?;
    let credentials: HashMap<String, serde_json::Value> = serde_json::from_slice(&decoded)
        .map_err(|e| EngineError::Credentials(format!("payload is not a JSON object: {e}")))?;
    Ok(ExtractedCredentials { credentials })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYBOOK_OUTPUT: &str = r#"
TASK [Bind] ********************************************************************
changed: [localhost]

TASK [debug] *******************************************************************
ok: [localhost] => {
    "msg": "<BIND_CREDENTIALS>eyJkYiI6ICJmdXNvcl9ndWVzdGJvb2tfZGIiLCAidXNlciI6ICJkdWRlcl90d28iLCAicGFzcyI6ICJkb2c4dHdvIn0=</BIND_CREDENTIALS>"
}

PLAY RECAP *********************************************************************
localhost                  : ok=3    changed=1    unreachable=0    failed=0
"#;

    #[test]
    fn extracts_credentials_from_playbook_output() {
        let creds = extract_credentials(PLAYBOOK_OUTPUT).unwrap().unwrap();
        assert_eq!(
            creds.credentials.get("db"),
            Some(&serde_json::json!("fusor_guestbook_db"))
        );
        assert_eq!(
            creds.credentials.get("user"),
            Some(&serde_json::json!("duder_two"))
        );
        assert_eq!(
            creds.credentials.get("pass"),
            Some(&serde_json::json!("dog8two"))
        );
    }

    #[test]
    fn missing_marker_is_none() {
        let output = "PLAY RECAP: ok=3 changed=1 failed=0";
        assert_eq!(extract_credentials(output).unwrap(), None);
    }

    #[test]
    fn open_marker_without_close_is_an_error() {
        let output = "TASK [Bind] ******<BIND_CREDENTIALS>******";
        assert!(matches!(
            extract_credentials(output),
            Err(EngineError::Credentials(_))
        ));
    }

    #[test]
    fn close_marker_without_open_is_an_error() {
        let output = "TASK [Bind] ******</BIND_CREDENTIALS>******";
        assert!(matches!(
            extract_credentials(output),
            Err(EngineError::Credentials(_))
        ));
    }

    #[test]
    fn bundle_reported_error_fails_the_job() {
        let output = "<BIND_ERROR>database is unreachable</BIND_ERROR>";
        match extract_credentials(output) {
            Err(EngineError::JobFailure(reason)) => {
                assert_eq!(reason, "database is unreachable");
            }
            other => panic!("expected a job failure, got {other:?}"),
        }
    }

    #[test]
    fn garbage_payload_is_an_error() {
        let output = "<BIND_CREDENTIALS>!!! not base64 !!!</BIND_CREDENTIALS>";
        assert!(matches!(
            extract_credentials(output),
            Err(EngineError::Credentials(_))
        ));
    }
}
