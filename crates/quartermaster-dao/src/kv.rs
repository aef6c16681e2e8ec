//! KvDao — embedded hierarchical key-value backend.
//!
//! All broker state lives in one redb table keyed by hierarchical
//! paths (`/spec/<id>`, `/state/<instance>/job/<token>`, ...), with
//! JSON-serialized values. Prefix scans serve the batch and job-state
//! queries. Supports on-disk and in-memory databases (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use qm_core::{BindInstance, JobState, ServiceInstance, Spec, State};

use crate::{BrokerDao, DaoError, DaoResult, RecoverStatus};

const BROKER: TableDefinition<&str, &[u8]> = TableDefinition::new("broker");

/// Convert any `Display` error into a `DaoError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| DaoError::$variant(e.to_string())
    };
}

fn spec_key(id: &str) -> String {
    format!("/spec/{id}")
}

fn service_instance_key(id: &str) -> String {
    format!("/service_instance/{id}")
}

fn bind_instance_key(id: &str) -> String {
    format!("/bind_instance/{id}")
}

fn state_key(instance_id: &str, token: &str) -> String {
    format!("/state/{instance_id}/job/{token}")
}

/// Thread-safe key-value DAO backed by redb.
#[derive(Clone)]
pub struct KvDao {
    db: Arc<Database>,
}

impl KvDao {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> DaoResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let dao = Self { db: Arc::new(db) };
        dao.ensure_table()?;
        debug!(?path, "kv dao opened");
        Ok(dao)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> DaoResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let dao = Self { db: Arc::new(db) };
        dao.ensure_table()?;
        debug!("in-memory kv dao opened");
        Ok(dao)
    }

    fn ensure_table(&self) -> DaoResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(BROKER).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> DaoResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BROKER).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> DaoResult<T> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BROKER).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))
            }
            None => Err(DaoError::NotFound(key.to_string())),
        }
    }

    fn remove(&self, key: &str) -> DaoResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(BROKER).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// All (key, value) pairs under a key prefix.
    fn scan_prefix<T: DeserializeOwned>(&self, prefix: &str) -> DaoResult<Vec<(String, T)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BROKER).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            let decoded: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push((key.value().to_string(), decoded));
        }
        Ok(results)
    }
}

#[async_trait]
impl BrokerDao for KvDao {
    async fn get_spec(&self, id: &str) -> DaoResult<Spec> {
        self.get(&spec_key(id))
    }

    async fn set_spec(&self, spec: &Spec) -> DaoResult<()> {
        self.put(&spec_key(&spec.id), spec)
    }

    async fn delete_spec(&self, id: &str) -> DaoResult<()> {
        self.remove(&spec_key(id))?;
        Ok(())
    }

    async fn batch_get_specs(&self) -> DaoResult<Vec<Spec>> {
        Ok(self
            .scan_prefix::<Spec>("/spec/")?
            .into_iter()
            .map(|(_, spec)| spec)
            .collect())
    }

    async fn batch_set_specs(&self, specs: &[Spec]) -> DaoResult<()> {
        for spec in specs {
            self.put(&spec_key(&spec.id), spec)?;
        }
        Ok(())
    }

    async fn batch_delete_specs(&self, specs: &[Spec]) -> DaoResult<()> {
        for spec in specs {
            self.remove(&spec_key(&spec.id))?;
        }
        Ok(())
    }

    async fn get_service_instance(&self, id: &str) -> DaoResult<ServiceInstance> {
        self.get(&service_instance_key(id))
    }

    async fn set_service_instance(&self, instance: &ServiceInstance) -> DaoResult<()> {
        self.put(&service_instance_key(&instance.id), instance)
    }

    async fn delete_service_instance(&self, id: &str) -> DaoResult<()> {
        self.remove(&service_instance_key(id))?;
        Ok(())
    }

    async fn get_bind_instance(&self, id: &str) -> DaoResult<BindInstance> {
        self.get(&bind_instance_key(id))
    }

    async fn set_bind_instance(&self, binding: &BindInstance) -> DaoResult<()> {
        self.put(&bind_instance_key(&binding.id), binding)
    }

    async fn delete_bind_instance(&self, id: &str) -> DaoResult<()> {
        self.remove(&bind_instance_key(id))?;
        Ok(())
    }

    async fn set_state(&self, instance_id: &str, state: &JobState) -> DaoResult<String> {
        let key = state_key(instance_id, &state.token);
        // A terminal job never transitions again; drop stale writes.
        match self.get::<JobState>(&key) {
            Ok(existing) if existing.state.is_terminal() && existing.state != state.state => {
                warn!(
                    token = %state.token,
                    current = %existing.state,
                    requested = %state.state,
                    "refusing to overwrite terminal job state"
                );
                return Ok(key);
            }
            Ok(_) => {}
            Err(DaoError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.put(&key, state)?;
        debug!(%key, state = %state.state, "job state stored");
        Ok(key)
    }

    async fn get_state(&self, instance_id: &str, token: &str) -> DaoResult<JobState> {
        self.get(&state_key(instance_id, token))
    }

    async fn get_state_by_key(&self, key: &str) -> DaoResult<JobState> {
        self.get(key)
    }

    async fn find_job_state_by_state(&self, state: State) -> DaoResult<Vec<RecoverStatus>> {
        let mut results = Vec::new();
        for (key, job) in self.scan_prefix::<JobState>("/state/")? {
            if job.state != state {
                continue;
            }
            // Key shape: /state/<instance_id>/job/<token>
            let Some(instance_id) = key
                .strip_prefix("/state/")
                .and_then(|rest| rest.split("/job/").next())
            else {
                continue;
            };
            results.push(RecoverStatus {
                instance_id: instance_id.to_string(),
                state: job,
            });
        }
        Ok(results)
    }

    async fn get_svc_inst_jobs_by_state(
        &self,
        instance_id: &str,
        state: State,
    ) -> DaoResult<Vec<JobState>> {
        let prefix = format!("/state/{instance_id}/job/");
        Ok(self
            .scan_prefix::<JobState>(&prefix)?
            .into_iter()
            .map(|(_, job)| job)
            .filter(|job| job.state == state)
            .collect())
    }
}
