//! Broker operations.
//!
//! Every lifecycle request is validated against persisted state, then
//! handed to the job coordinator. With `accepts_incomplete` the caller
//! gets a job token back immediately; otherwise the broker polls the
//! job to its terminal state before answering. [`OperationStatus`]
//! tells the HTTP layer how the operation concluded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};

use qm_core::config::BrokerConfig;
use qm_core::{
    AsyncType, BindInstance, JobMethod, JobState, Parameters, ServiceInstance, Spec, State,
};
use quartermaster_dao::{BrokerDao, is_not_found};
use quartermaster_engine::{EngineError, JobCoordinator, JobRequest};
use quartermaster_metrics::BrokerMetrics;
use quartermaster_registry::{Registry, RegistryResult};

use crate::error::{BrokerError, BrokerResult};
use crate::naming;
use crate::schema::spec_to_service;
use crate::types::{
    BindRequest, BindResponse, BootstrapResponse, CatalogResponse, DeprovisionResponse,
    LastOperationResponse, ProvisionRequest, ProvisionResponse, UnbindResponse, UpdateRequest,
    UpdateResponse,
};

/// Parameter key carrying the plan name into bundle actions.
pub const PLAN_PARAMETER_KEY: &str = "_apb_plan_id";
/// Parameter key carrying the service class id.
pub const SERVICE_CLASS_ID_KEY: &str = "_apb_service_class_id";
/// Parameter key carrying the service instance id.
pub const SERVICE_INSTANCE_ID_KEY: &str = "_apb_service_instance_id";
/// Parameter key handing provision credentials to bind and unbind actions.
pub const PROVISION_CREDENTIALS_KEY: &str = "_apb_provision_creds";
/// Parameter key handing bind credentials to unbind actions.
pub const BIND_CREDENTIALS_KEY: &str = "_apb_bind_creds";

/// Terminal-state poll interval for synchronous requests.
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How an operation concluded; the HTTP layer maps this to a status
/// code (201, 200, 202).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// A resource was created by a synchronous job.
    Created,
    /// The request matched existing state, or a synchronous job
    /// finished without creating anything new.
    Completed,
    /// The job is running; poll last_operation with the token.
    Accepted,
}

/// The Open Service Broker.
pub struct Broker {
    dao: Arc<dyn BrokerDao>,
    registries: Vec<Registry>,
    coordinator: JobCoordinator,
    metrics: BrokerMetrics,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(
        dao: Arc<dyn BrokerDao>,
        registries: Vec<Registry>,
        coordinator: JobCoordinator,
        metrics: BrokerMetrics,
        config: BrokerConfig,
    ) -> Self {
        Self {
            dao,
            registries,
            coordinator,
            metrics,
            config,
        }
    }

    /// Rebuild the catalog: wipe the persisted specs, then load every
    /// configured registry.
    pub async fn bootstrap(&self) -> BrokerResult<BootstrapResponse> {
        info!("broker bootstrapping");
        let existing = self.dao.batch_get_specs().await?;
        self.dao.batch_delete_specs(&existing).await?;
        self.metrics.specs_reset().await;

        let mut loads = Vec::with_capacity(self.registries.len());
        for registry in &self.registries {
            loads.push(RegistryLoad {
                name: registry.name().to_string(),
                fail_on_error: registry.fail_on_error(),
                result: registry.load_specs().await,
            });
        }
        let (specs, image_count, per_registry) = merge_registry_loads(loads)?;

        for (name, count) in per_registry {
            self.metrics.specs_loaded(&name, count).await;
        }
        self.dao.batch_set_specs(&specs).await?;
        info!(
            specs = specs.len(),
            images = image_count,
            "bootstrap complete"
        );
        Ok(BootstrapResponse {
            spec_count: specs.len(),
            image_count,
        })
    }

    /// The catalog, as currently persisted.
    pub async fn catalog(&self) -> BrokerResult<CatalogResponse> {
        let specs = self.dao.batch_get_specs().await?;
        let mut services = Vec::with_capacity(specs.len());
        for spec in &specs {
            match spec_to_service(spec) {
                Ok(service) => services.push(service),
                Err(reason) => warn!(
                    spec = %spec.fq_name,
                    %reason,
                    "spec left out of the catalog"
                ),
            }
        }
        Ok(CatalogResponse { services })
    }

    pub async fn provision(
        &self,
        instance_id: &str,
        req: &ProvisionRequest,
        accepts_incomplete: bool,
    ) -> BrokerResult<(ProvisionResponse, OperationStatus)> {
        let spec = self.get_spec(&req.service_id).await?;
        let plan = spec
            .plan_by_id(&req.plan_id)
            .ok_or_else(|| BrokerError::PlanNotFound(req.plan_id.clone()))?;
        let run_async = async_mode(&spec, accepts_incomplete)?;

        let parameters = Some(action_parameters(
            req.parameters.as_ref(),
            &plan.name,
            &spec.id,
            instance_id,
        ));

        // Idempotency: a repeat of the same request is not an error,
        // the same id with a different body is.
        match self.dao.get_service_instance(instance_id).await {
            Ok(existing) => {
                if existing.spec_id != spec.id || existing.parameters != parameters {
                    return Err(BrokerError::Duplicate);
                }
                let jobs = self
                    .dao
                    .get_svc_inst_jobs_by_state(instance_id, State::InProgress)
                    .await?;
                if let Some(job) = jobs.into_iter().find(|j| j.method == JobMethod::Provision) {
                    let response = ProvisionResponse {
                        operation: Some(job.token),
                        ..Default::default()
                    };
                    return Ok((response, OperationStatus::Accepted));
                }
                return Ok((ProvisionResponse::default(), OperationStatus::Completed));
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        let instance = ServiceInstance {
            id: instance_id.to_string(),
            spec_id: spec.id.clone(),
            context: req.context.clone(),
            parameters: parameters.clone(),
            ..Default::default()
        };
        self.dao.set_service_instance(&instance).await?;

        let token = self
            .start_job(JobRequest {
                instance,
                spec,
                method: JobMethod::Provision,
                parameters,
                binding: None,
            })
            .await?;

        if run_async {
            let response = ProvisionResponse {
                operation: Some(token),
                ..Default::default()
            };
            return Ok((response, OperationStatus::Accepted));
        }
        self.wait_for_job(instance_id, &token, JobMethod::Provision)
            .await?;
        Ok((ProvisionResponse::default(), OperationStatus::Created))
    }

    pub async fn update(
        &self,
        instance_id: &str,
        req: &UpdateRequest,
        accepts_incomplete: bool,
    ) -> BrokerResult<(UpdateResponse, OperationStatus)> {
        let mut instance = self.get_instance(instance_id).await?;
        let spec = self.get_spec(&instance.spec_id).await?;
        let run_async = async_mode(&spec, accepts_incomplete)?;

        // An update already in flight wins; hand back its token.
        let jobs = self
            .dao
            .get_svc_inst_jobs_by_state(instance_id, State::InProgress)
            .await?;
        if let Some(job) = jobs.into_iter().find(|j| j.method == JobMethod::Update) {
            let response = UpdateResponse {
                operation: Some(job.token),
            };
            return Ok((response, OperationStatus::Accepted));
        }

        let mut params = instance.parameters.clone().unwrap_or_default();
        let from_plan_name = params
            .get(PLAN_PARAMETER_KEY)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BrokerError::InvalidRequest("instance has no plan recorded".to_string())
            })?
            .to_string();
        let from_plan = spec
            .plan(&from_plan_name)
            .ok_or_else(|| BrokerError::PlanNotFound(from_plan_name.clone()))?;

        let to_plan = if req.plan_id.is_empty() || req.plan_id == from_plan.id {
            from_plan
        } else {
            let target = spec
                .plan_by_id(&req.plan_id)
                .ok_or_else(|| BrokerError::PlanNotFound(req.plan_id.clone()))?;
            if !from_plan.updates_to.iter().any(|name| name == &target.name) {
                return Err(BrokerError::PlanTransitionNotPossible {
                    from: from_plan.name.clone(),
                    to: target.name.clone(),
                });
            }
            info!(
                instance_id,
                from = %from_plan.name,
                to = %target.name,
                "updating instance to a new plan"
            );
            target
        };
        if to_plan.name != from_plan_name {
            params.insert(PLAN_PARAMETER_KEY.to_string(), json!(to_plan.name));
        }

        // Only parameters the target plan declares updatable may change.
        if let Some(requested) = &req.parameters {
            for (key, value) in requested {
                match to_plan.parameter(key) {
                    Some(descriptor) if descriptor.updatable => {
                        params.insert(key.clone(), value.clone());
                    }
                    Some(_) => warn!(%key, "parameter is not updatable and was ignored"),
                    None => warn!(%key, "parameter is not declared by the plan and was ignored"),
                }
            }
        }

        instance.parameters = Some(params.clone());
        self.dao.set_service_instance(&instance).await?;

        let token = self
            .start_job(JobRequest {
                instance,
                spec,
                method: JobMethod::Update,
                parameters: Some(params),
                binding: None,
            })
            .await?;

        if run_async {
            let response = UpdateResponse {
                operation: Some(token),
            };
            return Ok((response, OperationStatus::Accepted));
        }
        self.wait_for_job(instance_id, &token, JobMethod::Update)
            .await?;
        Ok((UpdateResponse::default(), OperationStatus::Completed))
    }

    pub async fn deprovision(
        &self,
        instance_id: &str,
        accepts_incomplete: bool,
    ) -> BrokerResult<(DeprovisionResponse, OperationStatus)> {
        let instance = self.get_instance(instance_id).await?;
        if !instance.binding_ids.is_empty() {
            return Err(BrokerError::BindingExists);
        }
        let spec = self.get_spec(&instance.spec_id).await?;
        let run_async = async_mode(&spec, accepts_incomplete)?;

        let jobs = self
            .dao
            .get_svc_inst_jobs_by_state(instance_id, State::InProgress)
            .await?;
        if let Some(job) = jobs.into_iter().find(|j| j.method == JobMethod::Deprovision) {
            let response = DeprovisionResponse {
                operation: Some(job.token),
            };
            return Ok((response, OperationStatus::Accepted));
        }

        let parameters = instance.parameters.clone();
        let token = self
            .start_job(JobRequest {
                instance,
                spec,
                method: JobMethod::Deprovision,
                parameters,
                binding: None,
            })
            .await?;

        if run_async {
            let response = DeprovisionResponse {
                operation: Some(token),
            };
            return Ok((response, OperationStatus::Accepted));
        }
        self.wait_for_job(instance_id, &token, JobMethod::Deprovision)
            .await?;
        Ok((DeprovisionResponse::default(), OperationStatus::Completed))
    }

    pub async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        req: &BindRequest,
        accepts_incomplete: bool,
    ) -> BrokerResult<(BindResponse, OperationStatus)> {
        let mut instance = self.get_instance(instance_id).await?;
        let spec = self.get_spec(&instance.spec_id).await?;
        let plan = spec
            .plan_by_id(&req.plan_id)
            .ok_or_else(|| BrokerError::PlanNotFound(req.plan_id.clone()))?;

        let mut params = action_parameters(req.parameters.as_ref(), &plan.name, &spec.id, instance_id);
        if let Some(creds) = self.coordinator.stored_credentials(instance_id).await? {
            params.insert(PROVISION_CREDENTIALS_KEY.to_string(), json!(creds.credentials));
        }
        let parameters = Some(params);

        match self.dao.get_bind_instance(binding_id).await {
            Ok(existing) => {
                if !existing.is_equal_request(&parameters) {
                    return Err(BrokerError::Duplicate);
                }
                let credentials = self.binding_credentials(instance_id, binding_id).await?;
                let response = BindResponse {
                    credentials,
                    ..Default::default()
                };
                return Ok((response, OperationStatus::Completed));
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        let mut binding = BindInstance {
            id: binding_id.to_string(),
            service_id: instance_id.to_string(),
            parameters: parameters.clone(),
            create_job_key: String::new(),
        };

        if !self.config.launch_apb_on_bind {
            // No bundle action: the binding hands back the instance's
            // provision credentials.
            self.dao.set_bind_instance(&binding).await?;
            instance.add_binding(binding_id);
            self.dao.set_service_instance(&instance).await?;
            let credentials = self.binding_credentials(instance_id, binding_id).await?;
            let response = BindResponse {
                credentials,
                ..Default::default()
            };
            return Ok((response, OperationStatus::Created));
        }

        let run_async = async_mode(&spec, accepts_incomplete)?;

        let token = self
            .start_job(JobRequest {
                instance: instance.clone(),
                spec,
                method: JobMethod::Bind,
                parameters,
                binding: Some(binding.clone()),
            })
            .await?;
        binding.create_job_key = token.clone();
        self.dao.set_bind_instance(&binding).await?;
        instance.add_binding(binding_id);
        self.dao.set_service_instance(&instance).await?;

        if run_async {
            let response = BindResponse {
                operation: Some(token),
                ..Default::default()
            };
            return Ok((response, OperationStatus::Accepted));
        }
        self.wait_for_job(instance_id, &token, JobMethod::Bind)
            .await?;
        let credentials = self.binding_credentials(instance_id, binding_id).await?;
        let response = BindResponse {
            credentials,
            ..Default::default()
        };
        Ok((response, OperationStatus::Created))
    }

    pub async fn unbind(
        &self,
        instance_id: &str,
        binding_id: &str,
        accepts_incomplete: bool,
    ) -> BrokerResult<(UnbindResponse, OperationStatus)> {
        let instance = self.get_instance(instance_id).await?;
        let binding = self.get_binding(binding_id).await?;
        if binding.service_id != instance.id {
            return Err(BrokerError::InvalidRequest(
                "binding does not belong to this instance".to_string(),
            ));
        }

        if !self.config.launch_apb_on_bind {
            self.coordinator.delete_credentials(binding_id).await?;
            self.dao.delete_binding(&binding, &instance).await?;
            return Ok((UnbindResponse::default(), OperationStatus::Completed));
        }

        let spec = self.get_spec(&instance.spec_id).await?;
        let run_async = async_mode(&spec, accepts_incomplete)?;

        let mut params = binding.parameters.clone().unwrap_or_default();
        if let Some(creds) = self.coordinator.stored_credentials(instance_id).await? {
            params.insert(PROVISION_CREDENTIALS_KEY.to_string(), json!(creds.credentials));
        }
        if let Some(creds) = self.coordinator.stored_credentials(binding_id).await? {
            params.insert(BIND_CREDENTIALS_KEY.to_string(), json!(creds.credentials));
        }

        let token = self
            .start_job(JobRequest {
                instance,
                spec,
                method: JobMethod::Unbind,
                parameters: Some(params),
                binding: Some(binding),
            })
            .await?;

        if run_async {
            let response = UnbindResponse {
                operation: Some(token),
            };
            return Ok((response, OperationStatus::Accepted));
        }
        self.wait_for_job(instance_id, &token, JobMethod::Unbind)
            .await?;
        Ok((UnbindResponse::default(), OperationStatus::Completed))
    }

    /// State of one job, for last-operation polling.
    pub async fn last_operation(
        &self,
        instance_id: &str,
        operation: &str,
    ) -> BrokerResult<LastOperationResponse> {
        if operation.is_empty() {
            return Err(BrokerError::InvalidRequest(
                "operation token is required".to_string(),
            ));
        }
        let state = match self.dao.get_state(instance_id, operation).await {
            Ok(state) => state,
            Err(e) if is_not_found(&e) => return Err(BrokerError::InstanceNotFound),
            Err(e) => return Err(e.into()),
        };
        let phase = match state.state {
            State::Succeeded => "succeeded",
            State::Failed => "failed",
            _ => "in progress",
        };
        let description = if state.state == State::Failed && !state.error.is_empty() {
            state.error
        } else {
            state.description
        };
        Ok(LastOperationResponse {
            state: phase.to_string(),
            description,
        })
    }

    /// Re-attach to jobs interrupted by a restart. Returns how many
    /// jobs were picked back up.
    pub async fn recover(&self) -> BrokerResult<usize> {
        Ok(self.coordinator.recover().await?)
    }

    /// Hand a job to the coordinator; its ordering rejection becomes
    /// the broker's in-progress error.
    async fn start_job(&self, request: JobRequest) -> BrokerResult<String> {
        match self.coordinator.start(request).await {
            Ok(token) => Ok(token),
            Err(EngineError::Conflict(_)) => Err(BrokerError::OperationInProgress),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_spec(&self, spec_id: &str) -> BrokerResult<Spec> {
        match self.dao.get_spec(spec_id).await {
            Ok(spec) => Ok(spec),
            Err(e) if is_not_found(&e) => Err(BrokerError::SpecNotFound(spec_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_instance(&self, instance_id: &str) -> BrokerResult<ServiceInstance> {
        match self.dao.get_service_instance(instance_id).await {
            Ok(instance) => Ok(instance),
            Err(e) if is_not_found(&e) => Err(BrokerError::InstanceNotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_binding(&self, binding_id: &str) -> BrokerResult<BindInstance> {
        match self.dao.get_bind_instance(binding_id).await {
            Ok(binding) => Ok(binding),
            Err(e) if is_not_found(&e) => Err(BrokerError::BindingNotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Credentials for a binding: its own if a bind action produced
    /// some, otherwise the instance's provision credentials.
    async fn binding_credentials(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> BrokerResult<HashMap<String, serde_json::Value>> {
        if let Some(creds) = self.coordinator.stored_credentials(binding_id).await? {
            return Ok(creds.credentials);
        }
        if let Some(creds) = self.coordinator.stored_credentials(instance_id).await? {
            return Ok(creds.credentials);
        }
        Err(BrokerError::CredentialsNotFound(instance_id.to_string()))
    }

    /// Poll a synchronous job to its terminal state.
    async fn wait_for_job(
        &self,
        instance_id: &str,
        token: &str,
        method: JobMethod,
    ) -> BrokerResult<JobState> {
        loop {
            let state = self.dao.get_state(instance_id, token).await?;
            if state.state == State::Failed {
                let reason = if state.error.is_empty() {
                    state.description
                } else {
                    state.error
                };
                return Err(BrokerError::JobFailed { method, reason });
            }
            if state.state == State::Succeeded {
                return Ok(state);
            }
            tokio::time::sleep(SYNC_POLL_INTERVAL).await;
        }
    }
}

/// Whether the job may run asynchronously, from the spec's policy and
/// the client's accepts_incomplete flag.
fn async_mode(spec: &Spec, accepts_incomplete: bool) -> BrokerResult<bool> {
    match spec.async_policy {
        AsyncType::Required if !accepts_incomplete => Err(BrokerError::AsyncRequired),
        AsyncType::Unsupported => Ok(false),
        _ => Ok(accepts_incomplete),
    }
}

/// Base parameter set handed to every bundle action.
fn action_parameters(
    request: Option<&Parameters>,
    plan_name: &str,
    spec_id: &str,
    instance_id: &str,
) -> Parameters {
    let mut params = request.cloned().unwrap_or_default();
    params.insert(PLAN_PARAMETER_KEY.to_string(), json!(plan_name));
    params.insert(SERVICE_CLASS_ID_KEY.to_string(), json!(spec_id));
    params.insert(SERVICE_INSTANCE_ID_KEY.to_string(), json!(instance_id));
    params
}

/// One registry's bootstrap contribution, before merging.
struct RegistryLoad {
    name: String,
    fail_on_error: bool,
    result: RegistryResult<(Vec<Spec>, usize)>,
}

/// Merge per-registry loads into one catalog. A failed registry is
/// skipped unless it is marked fail_on_error; if every registry failed
/// the whole bootstrap fails. Names are qualified per registry and a
/// duplicate fq-name keeps the first copy seen.
fn merge_registry_loads(
    loads: Vec<RegistryLoad>,
) -> BrokerResult<(Vec<Spec>, usize, Vec<(String, u64)>)> {
    let total = loads.len();
    let mut failures = 0;
    let mut specs: Vec<Spec> = Vec::new();
    let mut image_count = 0;
    let mut per_registry = Vec::new();

    for load in loads {
        match load.result {
            Ok((loaded, images)) => {
                image_count += images;
                let mut kept: u64 = 0;
                for mut spec in loaded {
                    spec.fq_name = naming::fully_qualify(&load.name, &spec.fq_name);
                    if specs.iter().any(|s| s.fq_name == spec.fq_name) {
                        warn!(
                            spec = %spec.fq_name,
                            registry = %load.name,
                            "skipping duplicate spec"
                        );
                        continue;
                    }
                    spec.id = naming::spec_id(&spec.fq_name);
                    for plan in &mut spec.plans {
                        plan.id = naming::plan_id(&spec.fq_name, &plan.name);
                    }
                    specs.push(spec);
                    kept += 1;
                }
                per_registry.push((load.name, kept));
            }
            Err(e) => {
                failures += 1;
                if load.fail_on_error {
                    error!(
                        registry = %load.name,
                        error = %e,
                        "registry failure is fatal for bootstrap"
                    );
                    return Err(BrokerError::Registry(e));
                }
                warn!(
                    registry = %load.name,
                    error = %e,
                    "skipping registry that failed to load"
                );
            }
        }
    }

    if total > 0 && failures == total {
        return Err(BrokerError::AllRegistriesFailed);
    }
    Ok((specs, image_count, per_registry))
}
