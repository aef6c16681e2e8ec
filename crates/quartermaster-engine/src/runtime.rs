//! Cluster capability traits.
//!
//! The coordinator never talks to a cluster API directly. Everything it
//! needs (sandboxes, pods, secrets) goes through [`ClusterRuntime`], so
//! the kube-backed implementation lives elsewhere and tests run against
//! [`MockRuntime`].

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{EngineError, EngineResult};

/// Phase of a bundle pod as reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodStatus {
    Running,
    Succeeded,
    Failed,
}

/// Result of waiting on a bundle pod: the terminal phase plus the last
/// chunk of its log, which is scanned for credential markers.
#[derive(Debug, Clone, PartialEq)]
pub struct PodOutcome {
    pub status: PodStatus,
    pub last_output: String,
}

/// The service account and role bindings created for one bundle pod.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sandbox {
    pub pod_name: String,
    /// Namespace the pod runs in. May differ from the instance's
    /// namespace when the runtime allocates a dedicated one.
    pub namespace: String,
    pub service_account: String,
    /// Namespaces the sandbox role was bound in.
    pub targets: Vec<String>,
}

/// Everything needed to launch one bundle action pod.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodRequest {
    pub name: String,
    pub namespace: String,
    pub image: String,
    /// Action verb handed to the bundle entry point.
    pub action: String,
    /// JSON-encoded parameters passed as `--extra-vars`.
    pub extra_vars: String,
    pub service_account: String,
    pub pull_policy: String,
}

/// Cluster operations the job coordinator depends on.
///
/// Pods are addressed by name only; implementations locate them via the
/// pod-name label stamped at launch, which keeps recovery independent of
/// the sandbox namespace that hosted them.
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    /// Short name of the cluster flavour, injected into extra-vars.
    fn cluster_name(&self) -> String;

    /// Create the service account and role bindings for one pod.
    async fn create_sandbox(
        &self,
        pod_name: &str,
        namespace: &str,
        targets: &[String],
        role: &str,
    ) -> EngineResult<Sandbox>;

    /// Remove the sandbox's role bindings and service account.
    async fn destroy_sandbox(&self, sandbox: &Sandbox) -> EngineResult<()>;

    async fn launch_pod(&self, request: &PodRequest) -> EngineResult<()>;

    /// Block until the pod reaches a terminal phase.
    async fn wait_for_pod(&self, pod_name: &str) -> EngineResult<PodOutcome>;

    async fn pod_exists(&self, pod_name: &str) -> EngineResult<bool>;

    async fn create_or_update_secret(
        &self,
        name: &str,
        namespace: &str,
        data: &HashMap<String, String>,
    ) -> EngineResult<()>;

    async fn get_secret(
        &self,
        name: &str,
        namespace: &str,
    ) -> EngineResult<Option<HashMap<String, String>>>;

    async fn delete_secret(&self, name: &str, namespace: &str) -> EngineResult<()>;
}

#[derive(Default)]
struct MockState {
    outcomes: VecDeque<Result<PodOutcome, String>>,
    sandboxes: Vec<Sandbox>,
    destroyed: Vec<String>,
    launched: Vec<PodRequest>,
    secrets: HashMap<(String, String), HashMap<String, String>>,
    existing_pods: HashSet<String>,
    fail_sandbox: bool,
}

/// Scriptable in-memory runtime for coordinator tests.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a pod outcome; each launched pod consumes one. An empty
    /// queue yields a clean success with no output.
    pub async fn push_outcome(&self, status: PodStatus, last_output: &str) {
        self.state.lock().await.outcomes.push_back(Ok(PodOutcome {
            status,
            last_output: last_output.to_string(),
        }));
    }

    /// Queue a wait failure (pod could not be observed at all).
    pub async fn push_wait_error(&self, reason: &str) {
        self.state
            .lock()
            .await
            .outcomes
            .push_back(Err(reason.to_string()));
    }

    /// Make the next sandbox creation fail.
    pub async fn fail_next_sandbox(&self) {
        self.state.lock().await.fail_sandbox = true;
    }

    /// Register a pod that survived a broker restart.
    pub async fn add_existing_pod(&self, pod_name: &str) {
        self.state
            .lock()
            .await
            .existing_pods
            .insert(pod_name.to_string());
    }

    pub async fn launched_pods(&self) -> Vec<PodRequest> {
        self.state.lock().await.launched.clone()
    }

    pub async fn created_sandboxes(&self) -> Vec<Sandbox> {
        self.state.lock().await.sandboxes.clone()
    }

    pub async fn destroyed_sandboxes(&self) -> Vec<String> {
        self.state.lock().await.destroyed.clone()
    }

    pub async fn secret(&self, name: &str, namespace: &str) -> Option<HashMap<String, String>> {
        self.state
            .lock()
            .await
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ClusterRuntime for MockRuntime {
    fn cluster_name(&self) -> String {
        "mock".to_string()
    }

    async fn create_sandbox(
        &self,
        pod_name: &str,
        namespace: &str,
        targets: &[String],
        _role: &str,
    ) -> EngineResult<Sandbox> {
        let mut state = self.state.lock().await;
        if state.fail_sandbox {
            state.fail_sandbox = false;
            return Err(EngineError::Runtime("sandbox creation refused".to_string()));
        }
        let sandbox = Sandbox {
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
            service_account: pod_name.to_string(),
            targets: targets.to_vec(),
        };
        state.sandboxes.push(sandbox.clone());
        Ok(sandbox)
    }

    async fn destroy_sandbox(&self, sandbox: &Sandbox) -> EngineResult<()> {
        self.state
            .lock()
            .await
            .destroyed
            .push(sandbox.pod_name.clone());
        Ok(())
    }

    async fn launch_pod(&self, request: &PodRequest) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.existing_pods.insert(request.name.clone());
        state.launched.push(request.clone());
        Ok(())
    }

    async fn wait_for_pod(&self, _pod_name: &str) -> EngineResult<PodOutcome> {
        match self.state.lock().await.outcomes.pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(reason)) => Err(EngineError::Runtime(reason)),
            None => Ok(PodOutcome {
                status: PodStatus::Succeeded,
                last_output: String::new(),
            }),
        }
    }

    async fn pod_exists(&self, pod_name: &str) -> EngineResult<bool> {
        Ok(self.state.lock().await.existing_pods.contains(pod_name))
    }

    async fn create_or_update_secret(
        &self,
        name: &str,
        namespace: &str,
        data: &HashMap<String, String>,
    ) -> EngineResult<()> {
        self.state
            .lock()
            .await
            .secrets
            .insert((namespace.to_string(), name.to_string()), data.clone());
        Ok(())
    }

    async fn get_secret(
        &self,
        name: &str,
        namespace: &str,
    ) -> EngineResult<Option<HashMap<String, String>>> {
        Ok(self
            .state
            .lock()
            .await
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn delete_secret(&self, name: &str, namespace: &str) -> EngineResult<()> {
        self.state
            .lock()
            .await
            .secrets
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}
