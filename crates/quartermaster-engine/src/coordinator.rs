//! Async job coordinator.
//!
//! One job per lifecycle action: the coordinator records an in-progress
//! state, spawns a task that drives sandbox, pod, and credential
//! handling, and writes the terminal state. Per-instance ordering is
//! enforced at start: one provision/update/deprovision at a time, and
//! bind/unbind never overlap a deprovision.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use qm_core::config::ClusterConfig;
use qm_core::{
    BindInstance, ExtractedCredentials, JobMethod, JobState, Parameters, ServiceInstance, Spec,
    State,
};
use quartermaster_dao::BrokerDao;
use quartermaster_metrics::BrokerMetrics;

use crate::credentials::extract_credentials;
use crate::runtime::{ClusterRuntime, PodRequest, PodStatus};
use crate::{EngineError, EngineResult};

/// Extra-vars key carrying the target namespace.
const NAMESPACE_KEY: &str = "namespace";
/// Extra-vars key carrying the cluster flavour.
const CLUSTER_KEY: &str = "cluster";
/// Secret data key holding the JSON credential payload.
const CREDENTIALS_KEY: &str = "credentials";

/// Bind credentials are kept under the binding id; everything else is
/// kept under the instance id.
fn credentials_name(request: &JobRequest) -> &str {
    match (&request.method, &request.binding) {
        (JobMethod::Bind, Some(binding)) => &binding.id,
        _ => &request.instance.id,
    }
}

/// One lifecycle action to run against a service instance.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub instance: ServiceInstance,
    pub spec: Spec,
    pub method: JobMethod,
    pub parameters: Option<Parameters>,
    /// The binding a bind/unbind job acts on.
    pub binding: Option<BindInstance>,
}

/// Drives async lifecycle jobs to a terminal state.
#[derive(Clone)]
pub struct JobCoordinator {
    dao: Arc<dyn BrokerDao>,
    runtime: Arc<dyn ClusterRuntime>,
    metrics: BrokerMetrics,
    cluster: ClusterConfig,
    /// Serialises the conflict check against the state write so two
    /// concurrent starts cannot both pass the ordering gate.
    start_gate: Arc<Mutex<()>>,
}

impl JobCoordinator {
    pub fn new(
        dao: Arc<dyn BrokerDao>,
        runtime: Arc<dyn ClusterRuntime>,
        metrics: BrokerMetrics,
        cluster: ClusterConfig,
    ) -> Self {
        Self {
            dao,
            runtime,
            metrics,
            cluster,
            start_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Start a job. Records an in-progress state, spawns the worker,
    /// and returns the job token for last-operation polling.
    pub async fn start(&self, request: JobRequest) -> EngineResult<String> {
        if matches!(request.method, JobMethod::Bind | JobMethod::Unbind)
            && request.binding.is_none()
        {
            return Err(EngineError::Request(format!(
                "{} job started without a binding",
                request.method
            )));
        }

        let token = {
            let _gate = self.start_gate.lock().await;
            self.ensure_no_conflict(&request).await?;

            let token = Uuid::new_v4().to_string();
            let mut state = JobState {
                token: token.clone(),
                state: State::InProgress,
                method: request.method,
                description: format!("{} job started", request.method),
                ..Default::default()
            };
            state.touch();
            self.dao.set_state(&request.instance.id, &state).await?;
            token
        };

        self.metrics.action_requested(&request.method.to_string()).await;
        info!(
            instance_id = %request.instance.id,
            method = %request.method,
            %token,
            "job accepted"
        );

        let coordinator = self.clone();
        let job_token = token.clone();
        tokio::spawn(async move {
            coordinator.run_job(request, job_token).await;
        });
        Ok(token)
    }

    /// Per-instance ordering: provision, update, and deprovision are
    /// mutually exclusive; bind and unbind may overlap each other but
    /// never a deprovision, in either direction.
    async fn ensure_no_conflict(&self, request: &JobRequest) -> EngineResult<()> {
        let in_progress = self
            .dao
            .get_svc_inst_jobs_by_state(&request.instance.id, State::InProgress)
            .await?;

        let exclusive = |method: JobMethod| {
            matches!(
                method,
                JobMethod::Provision | JobMethod::Update | JobMethod::Deprovision
            )
        };
        let conflicting = in_progress.iter().any(|job| match request.method {
            JobMethod::Provision | JobMethod::Update => exclusive(job.method),
            JobMethod::Deprovision => true,
            JobMethod::Bind | JobMethod::Unbind => job.method == JobMethod::Deprovision,
        });

        if conflicting {
            return Err(EngineError::Conflict(request.instance.id.clone()));
        }
        Ok(())
    }

    async fn run_job(&self, request: JobRequest, token: String) {
        let method = request.method;
        self.metrics.job_started(&method.to_string()).await;
        let outcome = self.execute(&request, &token).await;
        self.metrics.job_finished(&method.to_string()).await;

        let mut state = JobState {
            token: token.clone(),
            method,
            ..Default::default()
        };
        match outcome {
            Ok(podname) => match self.finish_success(&request).await {
                Ok(()) => {
                    state.state = State::Succeeded;
                    state.podname = podname;
                    state.description = format!("{method} job completed");
                }
                Err(e) => {
                    error!(instance_id = %request.instance.id, error = %e, "post-job cleanup failed");
                    state.state = State::Failed;
                    state.podname = podname;
                    state.error = e.to_string();
                    state.description = format!("error occurred during {method}");
                }
            },
            Err(e) => {
                error!(instance_id = %request.instance.id, method = %method, error = %e, "job failed");
                state.state = State::Failed;
                // The in-progress write recorded the pod name at launch;
                // keep it in the terminal state.
                state.podname = self
                    .dao
                    .get_state(&request.instance.id, &token)
                    .await
                    .map(|stored| stored.podname)
                    .unwrap_or_default();
                state.error = e.to_string();
                state.description = format!(
                    "error occurred during {method}, please contact an administrator if the issue persists"
                );
            }
        }

        state.touch();
        if let Err(e) = self.dao.set_state(&request.instance.id, &state).await {
            error!(instance_id = %request.instance.id, %token, error = %e, "failed to persist terminal job state");
        }
    }

    /// Sandbox, pod, credential handling. Returns the pod name.
    async fn execute(&self, request: &JobRequest, token: &str) -> EngineResult<String> {
        let namespace = &request.instance.context.namespace;
        if namespace.is_empty() {
            return Err(EngineError::Request(format!(
                "request context has no namespace, cannot {}",
                request.method
            )));
        }

        let pod_name = format!("apb-{}", Uuid::new_v4());
        let sandbox = self
            .runtime
            .create_sandbox(
                &pod_name,
                namespace,
                std::slice::from_ref(namespace),
                &self.cluster.sandbox_role,
            )
            .await?;
        self.metrics.sandbox_created();
        debug!(pod = %pod_name, namespace = %sandbox.namespace, "sandbox created");

        let result = self.run_pod(request, token, &pod_name, &sandbox).await;

        if self.should_keep_sandbox(result.is_err()) {
            info!(pod = %pod_name, namespace = %sandbox.namespace, "keeping sandbox per configuration");
        } else {
            match self.runtime.destroy_sandbox(&sandbox).await {
                Ok(()) => self.metrics.sandbox_destroyed(),
                Err(e) => warn!(pod = %pod_name, error = %e, "failed to tear down sandbox"),
            }
        }

        result.map(|()| pod_name)
    }

    fn should_keep_sandbox(&self, failed: bool) -> bool {
        self.cluster.keep_namespace || (failed && self.cluster.keep_namespace_on_error)
    }

    async fn run_pod(
        &self,
        request: &JobRequest,
        token: &str,
        pod_name: &str,
        sandbox: &crate::runtime::Sandbox,
    ) -> EngineResult<()> {
        let extra_vars = self.extra_vars(request)?;
        self.runtime
            .launch_pod(&PodRequest {
                name: pod_name.to_string(),
                namespace: sandbox.namespace.clone(),
                image: request.spec.image.clone(),
                action: request.method.to_string(),
                extra_vars,
                service_account: sandbox.service_account.clone(),
                pull_policy: self.cluster.image_pull_policy.clone(),
            })
            .await?;

        // Record the pod name while still in progress so a restarted
        // broker can find the pod again.
        let mut progress = JobState {
            token: token.to_string(),
            state: State::InProgress,
            method: request.method,
            podname: pod_name.to_string(),
            description: format!("{} pod running", request.method),
            ..Default::default()
        };
        progress.touch();
        self.dao.set_state(&request.instance.id, &progress).await?;

        let outcome = self.runtime.wait_for_pod(pod_name).await?;
        if outcome.status == PodStatus::Failed {
            return Err(EngineError::JobFailure(format!(
                "pod {pod_name} failed: {}",
                outcome.last_output
            )));
        }

        match (request.method, extract_credentials(&outcome.last_output)?) {
            (JobMethod::Bind, None) => Err(EngineError::JobFailure(
                "bind completed without producing credentials".to_string(),
            )),
            (_, Some(credentials)) => {
                self.store_credentials(credentials_name(request), &credentials)
                    .await
            }
            (_, None) => Ok(()),
        }
    }

    /// JSON `--extra-vars` payload: request parameters plus the target
    /// namespace and cluster flavour.
    fn extra_vars(&self, request: &JobRequest) -> EngineResult<String> {
        let mut vars = request.parameters.clone().unwrap_or_default();
        vars.insert(
            NAMESPACE_KEY.to_string(),
            serde_json::Value::String(request.instance.context.namespace.clone()),
        );
        vars.insert(
            CLUSTER_KEY.to_string(),
            serde_json::Value::String(self.runtime.cluster_name()),
        );
        serde_json::to_string(&vars).map_err(|e| EngineError::Request(e.to_string()))
    }

    async fn store_credentials(
        &self,
        name: &str,
        credentials: &ExtractedCredentials,
    ) -> EngineResult<()> {
        let payload = serde_json::to_string(&credentials.credentials)
            .map_err(|e| EngineError::Credentials(e.to_string()))?;
        let data = HashMap::from([(CREDENTIALS_KEY.to_string(), payload)]);
        self.runtime
            .create_or_update_secret(name, &self.cluster.namespace, &data)
            .await
    }

    /// Credentials persisted by an earlier job, if any. Named by the
    /// instance id for provision/update, the binding id for bind.
    pub async fn stored_credentials(
        &self,
        name: &str,
    ) -> EngineResult<Option<ExtractedCredentials>> {
        let Some(data) = self
            .runtime
            .get_secret(name, &self.cluster.namespace)
            .await?
        else {
            return Ok(None);
        };
        let Some(payload) = data.get(CREDENTIALS_KEY) else {
            return Ok(None);
        };
        let credentials = serde_json::from_str(payload)
            .map_err(|e| EngineError::Credentials(e.to_string()))?;
        Ok(Some(ExtractedCredentials { credentials }))
    }

    /// Remove a credential secret, tolerating absence.
    pub async fn delete_credentials(&self, name: &str) -> EngineResult<()> {
        self.runtime
            .delete_secret(name, &self.cluster.namespace)
            .await
    }

    /// Terminal-state resource cleanup on success.
    async fn finish_success(&self, request: &JobRequest) -> EngineResult<()> {
        match request.method {
            JobMethod::Deprovision => {
                self.delete_credentials(&request.instance.id).await?;
                self.dao
                    .delete_service_instance(&request.instance.id)
                    .await?;
                Ok(())
            }
            JobMethod::Unbind => {
                // Presence was checked at start.
                if let Some(binding) = &request.binding {
                    self.delete_credentials(&binding.id).await?;
                    self.dao.delete_binding(binding, &request.instance).await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Resume jobs that were in progress when the broker went down.
    /// Jobs whose pod still exists are re-attached; the rest are marked
    /// failed. Returns the number of jobs re-attached.
    pub async fn recover(&self) -> EngineResult<usize> {
        let in_progress = self.dao.find_job_state_by_state(State::InProgress).await?;
        let mut reattached = 0;

        for status in in_progress {
            let instance_id = status.instance_id;
            let state = status.state;

            if state.podname.is_empty() {
                self.fail_lost_job(&instance_id, state, "job never launched a pod")
                    .await;
                continue;
            }

            // A bind/unbind job state does not record which binding it
            // was for, so there is nothing to re-attach to.
            if matches!(state.method, JobMethod::Bind | JobMethod::Unbind) {
                self.fail_lost_job(&instance_id, state, "binding jobs cannot be re-attached")
                    .await;
                continue;
            }

            if self.runtime.pod_exists(&state.podname).await? {
                info!(%instance_id, podname = %state.podname, "re-attaching to running job");
                let coordinator = self.clone();
                tokio::spawn(async move {
                    coordinator.reattach(instance_id, state).await;
                });
                reattached += 1;
            } else {
                self.fail_lost_job(
                    &instance_id,
                    state,
                    "pod was lost while the broker was down",
                )
                .await;
            }
        }
        Ok(reattached)
    }

    async fn fail_lost_job(&self, instance_id: &str, mut state: JobState, reason: &str) {
        warn!(%instance_id, token = %state.token, reason, "failing unrecoverable job");
        state.state = State::Failed;
        state.error = reason.to_string();
        state.description = format!("{} interrupted by broker restart", state.method);
        state.touch();
        if let Err(e) = self.dao.set_state(instance_id, &state).await {
            error!(%instance_id, error = %e, "failed to persist recovery state");
        }
    }

    async fn reattach(&self, instance_id: String, mut state: JobState) {
        let method = state.method;
        self.metrics.job_started(&method.to_string()).await;

        let outcome = self.runtime.wait_for_pod(&state.podname).await;
        match outcome {
            Ok(outcome) if outcome.status == PodStatus::Succeeded => {
                let credentials = extract_credentials(&outcome.last_output);
                match credentials {
                    Ok(Some(credentials)) => {
                        if let Err(e) = self.store_credentials(&instance_id, &credentials).await {
                            error!(%instance_id, error = %e, "failed to persist re-attached credentials");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        state.state = State::Failed;
                        state.error = e.to_string();
                    }
                }
                if !state.state.is_terminal() {
                    state.state = State::Succeeded;
                    state.description = format!("{method} job completed after re-attach");
                }
            }
            Ok(outcome) => {
                state.state = State::Failed;
                state.error = format!("pod {} failed: {}", state.podname, outcome.last_output);
            }
            Err(e) => {
                state.state = State::Failed;
                state.error = e.to_string();
            }
        }

        self.metrics.job_finished(&method.to_string()).await;
        state.touch();
        if let Err(e) = self.dao.set_state(&instance_id, &state).await {
            error!(%instance_id, error = %e, "failed to persist re-attached job state");
        }
    }
}
