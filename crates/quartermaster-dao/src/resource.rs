//! ResourceDao — typed-resource backend.
//!
//! Persists broker state as named, labelled JSON documents behind the
//! [`ResourceClient`] seam. Job states carry `instanceId` and `state`
//! labels so recovery queries are label-selector lookups instead of
//! full scans. Writes use create-then-update: create first, and on an
//! already-exists conflict re-apply as an update.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use qm_core::{BindInstance, JobState, ServiceInstance, Spec, State};

use crate::{convert, BrokerDao, DaoError, DaoResult, RecoverStatus};

/// The resource kinds the broker persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Spec,
    ServiceInstance,
    BindInstance,
    JobState,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Spec => "bundles",
            ResourceKind::ServiceInstance => "bundleinstances",
            ResourceKind::BindInstance => "bundlebindings",
            ResourceKind::JobState => "jobstates",
        }
    }
}

/// A named resource with its labels and body, as returned by list.
pub type ResourceEntry = (String, HashMap<String, String>, Value);

/// Storage client for named, labelled JSON documents.
///
/// `create` must fail with [`DaoError::AlreadyExists`] when the name
/// is taken; `get` returns `None` rather than an error when absent.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, kind: ResourceKind, name: &str) -> DaoResult<Option<Value>>;

    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        labels: &HashMap<String, String>,
        body: &Value,
    ) -> DaoResult<()>;

    async fn update(
        &self,
        kind: ResourceKind,
        name: &str,
        labels: &HashMap<String, String>,
        body: &Value,
    ) -> DaoResult<()>;

    /// Delete by name. Returns whether the resource existed.
    async fn delete(&self, kind: ResourceKind, name: &str) -> DaoResult<bool>;

    /// List resources whose labels match every selector entry.
    async fn list(
        &self,
        kind: ResourceKind,
        selector: &HashMap<String, String>,
    ) -> DaoResult<Vec<ResourceEntry>>;
}

const LABEL_INSTANCE_ID: &str = "instanceId";
const LABEL_STATE: &str = "state";
const LABEL_METHOD: &str = "method";

/// DAO over a typed-resource store.
#[derive(Clone)]
pub struct ResourceDao<C: ResourceClient> {
    client: Arc<C>,
}

impl<C: ResourceClient> ResourceDao<C> {
    pub fn new(client: C) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    /// Create, or update when the name is already taken.
    async fn apply(
        &self,
        kind: ResourceKind,
        name: &str,
        labels: &HashMap<String, String>,
        body: &Value,
    ) -> DaoResult<()> {
        match self.client.create(kind, name, labels, body).await {
            Err(DaoError::AlreadyExists(_)) => {
                debug!(kind = kind.as_str(), name, "create conflicted, updating");
                self.client.update(kind, name, labels, body).await
            }
            other => other,
        }
    }

    async fn get_decoded<T: serde::de::DeserializeOwned>(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> DaoResult<T> {
        match self.client.get(kind, name).await? {
            Some(body) => serde_json::from_value(body)
                .map_err(|e| DaoError::Deserialize(e.to_string())),
            None => Err(DaoError::NotFound(format!("{}/{name}", kind.as_str()))),
        }
    }

    fn job_labels(instance_id: &str, job: &JobState) -> HashMap<String, String> {
        HashMap::from([
            (LABEL_INSTANCE_ID.to_string(), instance_id.to_string()),
            (LABEL_STATE.to_string(), job.state.to_string()),
            (LABEL_METHOD.to_string(), job.method.to_string()),
        ])
    }
}

#[async_trait]
impl<C: ResourceClient> BrokerDao for ResourceDao<C> {
    async fn get_spec(&self, id: &str) -> DaoResult<Spec> {
        let resource = self.get_decoded(ResourceKind::Spec, id).await?;
        convert::spec_from_resource(id, &resource)
    }

    async fn set_spec(&self, spec: &Spec) -> DaoResult<()> {
        let resource = convert::spec_to_resource(spec)?;
        let body =
            serde_json::to_value(&resource).map_err(|e| DaoError::Serialize(e.to_string()))?;
        self.apply(ResourceKind::Spec, &spec.id, &HashMap::new(), &body)
            .await
    }

    async fn delete_spec(&self, id: &str) -> DaoResult<()> {
        self.client.delete(ResourceKind::Spec, id).await?;
        Ok(())
    }

    async fn batch_get_specs(&self) -> DaoResult<Vec<Spec>> {
        let entries = self
            .client
            .list(ResourceKind::Spec, &HashMap::new())
            .await?;
        let mut specs = Vec::with_capacity(entries.len());
        // One undecodable record must not hide the rest of the catalog.
        for (name, _, body) in entries {
            let resource = match serde_json::from_value(body) {
                Ok(r) => r,
                Err(e) => {
                    warn!(%name, error = %e, "skipping undecodable spec resource");
                    continue;
                }
            };
            match convert::spec_from_resource(&name, &resource) {
                Ok(spec) => specs.push(spec),
                Err(e) => warn!(%name, error = %e, "skipping unconvertible spec resource"),
            }
        }
        Ok(specs)
    }

    async fn batch_set_specs(&self, specs: &[Spec]) -> DaoResult<()> {
        for spec in specs {
            self.set_spec(spec).await?;
        }
        Ok(())
    }

    async fn batch_delete_specs(&self, specs: &[Spec]) -> DaoResult<()> {
        for spec in specs {
            self.delete_spec(&spec.id).await?;
        }
        Ok(())
    }

    async fn get_service_instance(&self, id: &str) -> DaoResult<ServiceInstance> {
        let resource = self.get_decoded(ResourceKind::ServiceInstance, id).await?;
        convert::service_instance_from_resource(id, &resource)
    }

    async fn set_service_instance(&self, instance: &ServiceInstance) -> DaoResult<()> {
        let resource = convert::service_instance_to_resource(instance)?;
        let body =
            serde_json::to_value(&resource).map_err(|e| DaoError::Serialize(e.to_string()))?;
        self.apply(
            ResourceKind::ServiceInstance,
            &instance.id,
            &HashMap::new(),
            &body,
        )
        .await
    }

    async fn delete_service_instance(&self, id: &str) -> DaoResult<()> {
        self.client
            .delete(ResourceKind::ServiceInstance, id)
            .await?;
        Ok(())
    }

    async fn get_bind_instance(&self, id: &str) -> DaoResult<BindInstance> {
        let resource = self.get_decoded(ResourceKind::BindInstance, id).await?;
        convert::bind_instance_from_resource(id, &resource)
    }

    async fn set_bind_instance(&self, binding: &BindInstance) -> DaoResult<()> {
        let resource = convert::bind_instance_to_resource(binding)?;
        let body =
            serde_json::to_value(&resource).map_err(|e| DaoError::Serialize(e.to_string()))?;
        self.apply(
            ResourceKind::BindInstance,
            &binding.id,
            &HashMap::new(),
            &body,
        )
        .await
    }

    async fn delete_bind_instance(&self, id: &str) -> DaoResult<()> {
        self.client.delete(ResourceKind::BindInstance, id).await?;
        Ok(())
    }

    async fn set_state(&self, instance_id: &str, state: &JobState) -> DaoResult<String> {
        let key = format!("{instance_id}/{}", state.token);
        // A terminal job never transitions again; drop stale writes.
        if let Some(body) = self.client.get(ResourceKind::JobState, &state.token).await? {
            let existing = convert::job_state_from_resource(
                &serde_json::from_value(body).map_err(|e| DaoError::Deserialize(e.to_string()))?,
            );
            if existing.state.is_terminal() && existing.state != state.state {
                warn!(
                    token = %state.token,
                    current = %existing.state,
                    requested = %state.state,
                    "refusing to overwrite terminal job state"
                );
                return Ok(key);
            }
        }
        let resource = convert::job_state_to_resource(state);
        let body =
            serde_json::to_value(&resource).map_err(|e| DaoError::Serialize(e.to_string()))?;
        let labels = Self::job_labels(instance_id, state);
        self.apply(ResourceKind::JobState, &state.token, &labels, &body)
            .await?;
        Ok(key)
    }

    async fn get_state(&self, instance_id: &str, token: &str) -> DaoResult<JobState> {
        let jobs = self
            .client
            .list(
                ResourceKind::JobState,
                &HashMap::from([(LABEL_INSTANCE_ID.to_string(), instance_id.to_string())]),
            )
            .await?;
        for (name, _, body) in jobs {
            if name == token {
                let resource = serde_json::from_value(body)
                    .map_err(|e| DaoError::Deserialize(e.to_string()))?;
                return Ok(convert::job_state_from_resource(&resource));
            }
        }
        Err(DaoError::NotFound(format!("job state {token}")))
    }

    async fn get_state_by_key(&self, key: &str) -> DaoResult<JobState> {
        // Key shape: <instance_id>/<token>
        let (instance_id, token) = key
            .split_once('/')
            .ok_or_else(|| DaoError::NotFound(format!("malformed state key {key}")))?;
        self.get_state(instance_id, token).await
    }

    async fn find_job_state_by_state(&self, state: State) -> DaoResult<Vec<RecoverStatus>> {
        let entries = self
            .client
            .list(
                ResourceKind::JobState,
                &HashMap::from([(LABEL_STATE.to_string(), state.to_string())]),
            )
            .await?;
        let mut results = Vec::with_capacity(entries.len());
        for (name, labels, body) in entries {
            let Some(instance_id) = labels.get(LABEL_INSTANCE_ID) else {
                warn!(%name, "job state resource missing instanceId label");
                continue;
            };
            let resource = serde_json::from_value(body)
                .map_err(|e| DaoError::Deserialize(e.to_string()))?;
            results.push(RecoverStatus {
                instance_id: instance_id.clone(),
                state: convert::job_state_from_resource(&resource),
            });
        }
        Ok(results)
    }

    async fn get_svc_inst_jobs_by_state(
        &self,
        instance_id: &str,
        state: State,
    ) -> DaoResult<Vec<JobState>> {
        let entries = self
            .client
            .list(
                ResourceKind::JobState,
                &HashMap::from([
                    (LABEL_INSTANCE_ID.to_string(), instance_id.to_string()),
                    (LABEL_STATE.to_string(), state.to_string()),
                ]),
            )
            .await?;
        let mut jobs = Vec::with_capacity(entries.len());
        for (_, _, body) in entries {
            let resource = serde_json::from_value(body)
                .map_err(|e| DaoError::Deserialize(e.to_string()))?;
            jobs.push(convert::job_state_from_resource(&resource));
        }
        Ok(jobs)
    }
}

// ── In-memory client ──────────────────────────────────────────────

type MemoryStore = HashMap<(ResourceKind, String), (HashMap<String, String>, Value)>;

/// In-memory [`ResourceClient`] for tests and local development.
#[derive(Default)]
pub struct MemoryResourceClient {
    store: tokio::sync::Mutex<MemoryStore>,
}

impl MemoryResourceClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceClient for MemoryResourceClient {
    async fn get(&self, kind: ResourceKind, name: &str) -> DaoResult<Option<Value>> {
        let store = self.store.lock().await;
        Ok(store
            .get(&(kind, name.to_string()))
            .map(|(_, body)| body.clone()))
    }

    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        labels: &HashMap<String, String>,
        body: &Value,
    ) -> DaoResult<()> {
        let mut store = self.store.lock().await;
        let key = (kind, name.to_string());
        if store.contains_key(&key) {
            return Err(DaoError::AlreadyExists(format!(
                "{}/{name}",
                kind.as_str()
            )));
        }
        store.insert(key, (labels.clone(), body.clone()));
        Ok(())
    }

    async fn update(
        &self,
        kind: ResourceKind,
        name: &str,
        labels: &HashMap<String, String>,
        body: &Value,
    ) -> DaoResult<()> {
        let mut store = self.store.lock().await;
        let key = (kind, name.to_string());
        if !store.contains_key(&key) {
            return Err(DaoError::NotFound(format!("{}/{name}", kind.as_str())));
        }
        store.insert(key, (labels.clone(), body.clone()));
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> DaoResult<bool> {
        let mut store = self.store.lock().await;
        Ok(store.remove(&(kind, name.to_string())).is_some())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        selector: &HashMap<String, String>,
    ) -> DaoResult<Vec<ResourceEntry>> {
        let store = self.store.lock().await;
        let mut entries: Vec<ResourceEntry> = store
            .iter()
            .filter(|((k, _), (labels, _))| {
                *k == kind && selector.iter().all(|(sk, sv)| labels.get(sk) == Some(sv))
            })
            .map(|((_, name), (labels, body))| (name.clone(), labels.clone(), body.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qm_core::JobMethod;

    fn dao() -> ResourceDao<MemoryResourceClient> {
        ResourceDao::new(MemoryResourceClient::new())
    }

    fn test_spec(id: &str) -> Spec {
        Spec {
            id: id.to_string(),
            runtime: 2,
            version: "1.0".to_string(),
            fq_name: format!("dh-{id}"),
            image: format!("docker.io/org/{id}:latest"),
            plans: vec![qm_core::Plan {
                name: "default".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn test_job(token: &str, state: State, method: JobMethod) -> JobState {
        JobState {
            token: token.to_string(),
            state,
            method,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn spec_round_trip_through_resources() {
        let dao = dao();
        let spec = test_spec("s1");
        dao.set_spec(&spec).await.unwrap();
        assert_eq!(dao.get_spec("s1").await.unwrap(), spec);
    }

    #[tokio::test]
    async fn set_spec_twice_updates_in_place() {
        let dao = dao();
        let mut spec = test_spec("s1");
        dao.set_spec(&spec).await.unwrap();

        spec.description = "updated".to_string();
        dao.set_spec(&spec).await.unwrap();

        assert_eq!(dao.get_spec("s1").await.unwrap().description, "updated");
        assert_eq!(dao.batch_get_specs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batch_get_skips_corrupt_records() {
        let client = MemoryResourceClient::new();
        client
            .create(
                ResourceKind::Spec,
                "bad",
                &HashMap::new(),
                &serde_json::json!({"garbage": true}),
            )
            .await
            .unwrap();
        let dao = ResourceDao::new(client);
        dao.set_spec(&test_spec("good")).await.unwrap();

        let specs = dao.batch_get_specs().await.unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].id, "good");
    }

    #[tokio::test]
    async fn set_state_labels_jobs_for_selector_queries() {
        let dao = dao();
        dao.set_state("i1", &test_job("t1", State::InProgress, JobMethod::Provision))
            .await
            .unwrap();
        dao.set_state("i2", &test_job("t2", State::InProgress, JobMethod::Bind))
            .await
            .unwrap();
        dao.set_state("i2", &test_job("t3", State::Succeeded, JobMethod::Bind))
            .await
            .unwrap();

        let in_progress = dao.find_job_state_by_state(State::InProgress).await.unwrap();
        assert_eq!(in_progress.len(), 2);

        let i2_jobs = dao
            .get_svc_inst_jobs_by_state("i2", State::InProgress)
            .await
            .unwrap();
        assert_eq!(i2_jobs.len(), 1);
        assert_eq!(i2_jobs[0].token, "t2");
    }

    #[tokio::test]
    async fn state_transition_refreshes_state_label() {
        let dao = dao();
        dao.set_state("i1", &test_job("t1", State::InProgress, JobMethod::Provision))
            .await
            .unwrap();
        dao.set_state("i1", &test_job("t1", State::Succeeded, JobMethod::Provision))
            .await
            .unwrap();

        assert!(dao
            .find_job_state_by_state(State::InProgress)
            .await
            .unwrap()
            .is_empty());
        let succeeded = dao.find_job_state_by_state(State::Succeeded).await.unwrap();
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].instance_id, "i1");
    }

    #[tokio::test]
    async fn terminal_state_is_monotonic() {
        let dao = dao();
        dao.set_state("i1", &test_job("t1", State::Failed, JobMethod::Provision))
            .await
            .unwrap();
        dao.set_state("i1", &test_job("t1", State::InProgress, JobMethod::Provision))
            .await
            .unwrap();

        let job = dao.get_state("i1", "t1").await.unwrap();
        assert_eq!(job.state, State::Failed);
    }

    #[tokio::test]
    async fn get_state_by_key_round_trips_set_state_key() {
        let dao = dao();
        let key = dao
            .set_state("i1", &test_job("t1", State::InProgress, JobMethod::Provision))
            .await
            .unwrap();
        assert_eq!(key, "i1/t1");

        let job = dao.get_state_by_key(&key).await.unwrap();
        assert_eq!(job.token, "t1");
    }

    #[tokio::test]
    async fn delete_binding_order_preserves_instance() {
        let dao = dao();
        let mut instance = ServiceInstance {
            id: "i1".to_string(),
            spec_id: "s1".to_string(),
            ..Default::default()
        };
        instance.add_binding("b1");
        dao.set_service_instance(&instance).await.unwrap();

        let binding = BindInstance {
            id: "b1".to_string(),
            service_id: "i1".to_string(),
            ..Default::default()
        };
        dao.set_bind_instance(&binding).await.unwrap();

        dao.delete_binding(&binding, &instance).await.unwrap();

        assert!(crate::is_not_found(
            &dao.get_bind_instance("b1").await.unwrap_err()
        ));
        assert!(dao
            .get_service_instance("i1")
            .await
            .unwrap()
            .binding_ids
            .is_empty());
    }
}
