//! Fully-qualified spec names and the ids derived from them.
//!
//! Spec names are namespaced by the registry that contributed them so
//! two registries can offer the same image. Service and plan ids are
//! digests of those names, which keeps ids stable across bootstraps.

use sha2::{Digest, Sha256};

/// Cluster resource names created from an fq-name cap its length.
const MAX_FQ_NAME_LEN: usize = 51;

/// Hex digest length used for derived ids.
const ID_LEN: usize = 32;

/// Namespace a spec name by its registry: `<registry>-<name>` with
/// separators replaced, truncated, and stripped of trailing dashes.
pub fn fully_qualify(registry: &str, name: &str) -> String {
    let qualified: String = format!("{registry}-{name}")
        .chars()
        .map(|c| if matches!(c, '/' | '.' | ':') { '-' } else { c })
        .take(MAX_FQ_NAME_LEN)
        .collect();
    qualified.trim_end_matches('-').to_string()
}

/// Stable id for a spec, derived from its fully-qualified name.
pub fn spec_id(fq_name: &str) -> String {
    digest(fq_name)
}

/// Stable id for a plan within a spec.
pub fn plan_id(fq_name: &str, plan_name: &str) -> String {
    digest(&format!("{fq_name}-{plan_name}"))
}

fn digest(input: &str) -> String {
    let mut hex = hex::encode(Sha256::digest(input.as_bytes()));
    hex.truncate(ID_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualification_replaces_separators() {
        assert_eq!(
            fully_qualify("dh", "ansibleplaybookbundle/hello-world-apb:latest"),
            "dh-ansibleplaybookbundle-hello-world-apb-latest"
        );
        assert_eq!(fully_qualify("docker.io", "mediawiki-apb"), "docker-io-mediawiki-apb");
    }

    #[test]
    fn qualification_truncates_and_strips_trailing_dash() {
        let name = "a".repeat(40) + "/extra-long-tail-apb";
        let fq = fully_qualify("registry", &name);
        assert!(fq.len() <= 51);
        assert!(!fq.ends_with('-'));
    }

    #[test]
    fn ids_are_deterministic_hex() {
        let id = spec_id("dh-mediawiki-apb");
        assert_eq!(id, spec_id("dh-mediawiki-apb"));
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn plan_ids_differ_per_plan_and_spec() {
        let dev = plan_id("dh-mediawiki-apb", "dev");
        let prod = plan_id("dh-mediawiki-apb", "prod");
        let other = plan_id("quay-mediawiki-apb", "dev");
        assert_ne!(dev, prod);
        assert_ne!(dev, other);
        assert_ne!(dev, spec_id("dh-mediawiki-apb"));
    }
}
