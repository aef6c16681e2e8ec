//! Kubernetes implementation of the sandbox/pod runtime.
//!
//! Bundle action pods run under a per-pod service account whose role
//! bindings are created just before launch and removed right after.
//! Pods carry an `apb-pod-name` label so they can be found again by
//! name alone, even after a broker restart.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::rbac::v1 as rbacv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use quartermaster_engine::{
    ClusterRuntime, EngineError, EngineResult, PodOutcome, PodRequest, PodStatus, Sandbox,
};

use crate::secrets::secret_string_data;

const POD_NAME_LABEL: &str = "apb-pod-name";
const ACTION_LABEL: &str = "apb-action";
const CONTAINER_NAME: &str = "apb";

const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Polls tolerated before a launched pod that never appears is given up on.
const MISSING_POD_LIMIT: u32 = 10;
/// Log lines fetched from a finished pod; the credential marker is
/// printed near the end of the run.
const LOG_TAIL_LINES: i64 = 64;

/// Cluster runtime backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeRuntime {
    client: Client,
    flavour: String,
}

impl KubeRuntime {
    /// Construct the runtime, probing the API surface to tell an
    /// OpenShift cluster from plain Kubernetes.
    pub async fn new(client: Client) -> Self {
        let flavour = match client.list_api_groups().await {
            Ok(groups)
                if groups
                    .groups
                    .iter()
                    .any(|g| g.name == "route.openshift.io") =>
            {
                "openshift"
            }
            _ => "kubernetes",
        };
        info!(flavour, "detected cluster flavour");
        Self {
            client,
            flavour: flavour.to_string(),
        }
    }

    /// Locate a pod by its `apb-pod-name` label, in any namespace.
    async fn find_pod(&self, pod_name: &str) -> EngineResult<Option<corev1::Pod>> {
        let api = Api::<corev1::Pod>::all(self.client.clone());
        let params = ListParams::default().labels(&format!("{POD_NAME_LABEL}={pod_name}"));
        let pods = api.list(&params).await.map_err(runtime_err)?;
        Ok(pods.items.into_iter().next())
    }

    /// Tail of the pod's log. Failures are tolerated; provision output
    /// without a credential marker is indistinguishable from no output.
    async fn pod_logs(&self, pod: &corev1::Pod) -> String {
        let (Some(name), Some(namespace)) =
            (pod.metadata.name.as_deref(), pod.metadata.namespace.as_deref())
        else {
            return String::new();
        };
        let api = Api::<corev1::Pod>::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            tail_lines: Some(LOG_TAIL_LINES),
            ..Default::default()
        };
        match api.logs(name, &params).await {
            Ok(output) => output,
            Err(e) => {
                warn!(pod = name, error = %e, "could not fetch pod logs");
                String::new()
            }
        }
    }
}

fn runtime_err(e: kube::Error) -> EngineError {
    EngineError::Runtime(e.to_string())
}

fn is_api_code(e: &kube::Error, code: u16) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == code)
}

fn role_binding_name(pod_name: &str, target: &str) -> String {
    format!("{pod_name}-{target}")
}

fn build_service_account(pod_name: &str, namespace: &str) -> corev1::ServiceAccount {
    corev1::ServiceAccount {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn build_role_binding(
    pod_name: &str,
    namespace: &str,
    target: &str,
    role: &str,
) -> rbacv1::RoleBinding {
    rbacv1::RoleBinding {
        metadata: ObjectMeta {
            name: Some(role_binding_name(pod_name, target)),
            namespace: Some(target.to_string()),
            ..Default::default()
        },
        role_ref: rbacv1::RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![rbacv1::Subject {
            kind: "ServiceAccount".to_string(),
            name: pod_name.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

fn build_pod(request: &PodRequest) -> corev1::Pod {
    let labels = BTreeMap::from([
        (POD_NAME_LABEL.to_string(), request.name.clone()),
        (ACTION_LABEL.to_string(), request.action.clone()),
    ]);
    corev1::Pod {
        metadata: ObjectMeta {
            name: Some(request.name.clone()),
            namespace: Some(request.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(corev1::PodSpec {
            containers: vec![corev1::Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(request.image.clone()),
                args: Some(vec![
                    request.action.clone(),
                    "--extra-vars".to_string(),
                    request.extra_vars.clone(),
                ]),
                image_pull_policy: Some(request.pull_policy.clone()),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            service_account_name: Some(request.service_account.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_secret(name: &str, namespace: &str, data: &HashMap<String, String>) -> corev1::Secret {
    corev1::Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterRuntime for KubeRuntime {
    fn cluster_name(&self) -> String {
        self.flavour.clone()
    }

    async fn create_sandbox(
        &self,
        pod_name: &str,
        namespace: &str,
        targets: &[String],
        role: &str,
    ) -> EngineResult<Sandbox> {
        let sa_api = Api::<corev1::ServiceAccount>::namespaced(self.client.clone(), namespace);
        sa_api
            .create(&PostParams::default(), &build_service_account(pod_name, namespace))
            .await
            .map_err(runtime_err)?;

        for target in targets {
            let rb_api = Api::<rbacv1::RoleBinding>::namespaced(self.client.clone(), target);
            rb_api
                .create(
                    &PostParams::default(),
                    &build_role_binding(pod_name, namespace, target, role),
                )
                .await
                .map_err(runtime_err)?;
            debug!(pod = pod_name, %target, role, "bound sandbox role");
        }

        Ok(Sandbox {
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
            service_account: pod_name.to_string(),
            targets: targets.to_vec(),
        })
    }

    async fn destroy_sandbox(&self, sandbox: &Sandbox) -> EngineResult<()> {
        for target in &sandbox.targets {
            let rb_api = Api::<rbacv1::RoleBinding>::namespaced(self.client.clone(), target);
            let name = role_binding_name(&sandbox.pod_name, target);
            match rb_api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(e) if is_api_code(&e, 404) => {}
                Err(e) => return Err(runtime_err(e)),
            }
        }

        let sa_api =
            Api::<corev1::ServiceAccount>::namespaced(self.client.clone(), &sandbox.namespace);
        match sa_api
            .delete(&sandbox.service_account, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_api_code(&e, 404) => Ok(()),
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn launch_pod(&self, request: &PodRequest) -> EngineResult<()> {
        let api = Api::<corev1::Pod>::namespaced(self.client.clone(), &request.namespace);
        api.create(&PostParams::default(), &build_pod(request))
            .await
            .map_err(runtime_err)?;
        info!(pod = %request.name, image = %request.image, action = %request.action, "launched bundle pod");
        Ok(())
    }

    async fn wait_for_pod(&self, pod_name: &str) -> EngineResult<PodOutcome> {
        let mut missing = 0;
        loop {
            let Some(pod) = self.find_pod(pod_name).await? else {
                missing += 1;
                if missing > MISSING_POD_LIMIT {
                    return Err(EngineError::Runtime(format!(
                        "pod {pod_name} was never observed by the cluster"
                    )));
                }
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            };
            missing = 0;

            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default();
            match phase.as_str() {
                "Succeeded" => {
                    let last_output = self.pod_logs(&pod).await;
                    return Ok(PodOutcome {
                        status: PodStatus::Succeeded,
                        last_output,
                    });
                }
                "Failed" => {
                    let last_output = self.pod_logs(&pod).await;
                    return Ok(PodOutcome {
                        status: PodStatus::Failed,
                        last_output,
                    });
                }
                _ => {
                    debug!(pod = pod_name, %phase, "waiting on bundle pod");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn pod_exists(&self, pod_name: &str) -> EngineResult<bool> {
        Ok(self.find_pod(pod_name).await?.is_some())
    }

    async fn create_or_update_secret(
        &self,
        name: &str,
        namespace: &str,
        data: &HashMap<String, String>,
    ) -> EngineResult<()> {
        let api = Api::<corev1::Secret>::namespaced(self.client.clone(), namespace);
        let secret = build_secret(name, namespace, data);
        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(e) if is_api_code(&e, 409) => {
                api.patch(name, &PatchParams::default(), &Patch::Merge(&secret))
                    .await
                    .map_err(runtime_err)?;
                Ok(())
            }
            Err(e) => Err(runtime_err(e)),
        }
    }

    async fn get_secret(
        &self,
        name: &str,
        namespace: &str,
    ) -> EngineResult<Option<HashMap<String, String>>> {
        let api = Api::<corev1::Secret>::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await.map_err(runtime_err)? else {
            return Ok(None);
        };
        secret_string_data(secret)
            .map(Some)
            .map_err(EngineError::Runtime)
    }

    async fn delete_secret(&self, name: &str, namespace: &str) -> EngineResult<()> {
        let api = Api::<corev1::Secret>::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_api_code(&e, 404) => Ok(()),
            Err(e) => Err(runtime_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PodRequest {
        PodRequest {
            name: "apb-1234".to_string(),
            namespace: "apps".to_string(),
            image: "registry.example.com/org/mediawiki-apb:latest".to_string(),
            action: "provision".to_string(),
            extra_vars: r#"{"namespace":"apps"}"#.to_string(),
            service_account: "apb-1234".to_string(),
            pull_policy: "IfNotPresent".to_string(),
        }
    }

    #[test]
    fn pod_carries_lookup_labels_and_action_args() {
        let pod = build_pod(&request());
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get(POD_NAME_LABEL), Some(&"apb-1234".to_string()));
        assert_eq!(labels.get(ACTION_LABEL), Some(&"provision".to_string()));

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.service_account_name.as_deref(), Some("apb-1234"));

        let container = &spec.containers[0];
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec![
                "provision".to_string(),
                "--extra-vars".to_string(),
                r#"{"namespace":"apps"}"#.to_string(),
            ]
        );
        assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
    }

    #[test]
    fn role_binding_targets_cluster_role_in_target_namespace() {
        let rb = build_role_binding("apb-1234", "apps", "apps-2", "edit");
        assert_eq!(rb.metadata.name.as_deref(), Some("apb-1234-apps-2"));
        assert_eq!(rb.metadata.namespace.as_deref(), Some("apps-2"));
        assert_eq!(rb.role_ref.kind, "ClusterRole");
        assert_eq!(rb.role_ref.name, "edit");

        let subject = &rb.subjects.unwrap()[0];
        assert_eq!(subject.kind, "ServiceAccount");
        assert_eq!(subject.name, "apb-1234");
        assert_eq!(subject.namespace.as_deref(), Some("apps"));
    }

    #[test]
    fn secret_uses_string_data() {
        let data = HashMap::from([("credentials".to_string(), "{}".to_string())]);
        let secret = build_secret("inst-1", "quartermaster", &data);
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        assert_eq!(
            secret.string_data.unwrap().get("credentials"),
            Some(&"{}".to_string())
        );
    }
}
