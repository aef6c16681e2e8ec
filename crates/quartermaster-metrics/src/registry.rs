//! Broker counters and gauges.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use tokio::sync::RwLock;

/// Snapshot of all broker metrics, as handed to the renderer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Live sandbox namespaces.
    pub sandboxes: i64,
    /// Loaded specs per registry name.
    pub specs_loaded: HashMap<String, u64>,
    /// Total action requests per method name.
    pub actions_requested: HashMap<String, u64>,
    /// Jobs currently running per method name.
    pub jobs_in_flight: HashMap<String, i64>,
    /// Times the persisted spec set was wiped for a reload.
    pub specs_reset: u64,
}

#[derive(Default)]
struct Inner {
    sandboxes: AtomicI64,
    specs_reset: AtomicU64,
    specs_loaded: RwLock<HashMap<String, u64>>,
    actions_requested: RwLock<HashMap<String, u64>>,
    jobs_in_flight: RwLock<HashMap<String, i64>>,
}

/// Shared handle to the broker's metric counters.
#[derive(Clone, Default)]
pub struct BrokerMetrics {
    inner: Arc<Inner>,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sandbox namespace was created.
    pub fn sandbox_created(&self) {
        self.inner.sandboxes.fetch_add(1, Ordering::Relaxed);
    }

    /// A sandbox namespace was destroyed.
    pub fn sandbox_destroyed(&self) {
        self.inner.sandboxes.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record how many specs a registry contributed at bootstrap.
    pub async fn specs_loaded(&self, registry_name: &str, count: u64) {
        let mut loaded = self.inner.specs_loaded.write().await;
        loaded.insert(registry_name.to_string(), count);
    }

    /// The persisted spec set was wiped ahead of a reload.
    pub async fn specs_reset(&self) {
        self.inner.specs_reset.fetch_add(1, Ordering::Relaxed);
        self.inner.specs_loaded.write().await.clear();
    }

    /// An action request was accepted.
    pub async fn action_requested(&self, method: &str) {
        let mut actions = self.inner.actions_requested.write().await;
        *actions.entry(method.to_string()).or_default() += 1;
    }

    /// A job started running.
    pub async fn job_started(&self, method: &str) {
        let mut jobs = self.inner.jobs_in_flight.write().await;
        *jobs.entry(method.to_string()).or_default() += 1;
    }

    /// A job reached a terminal state.
    pub async fn job_finished(&self, method: &str) {
        let mut jobs = self.inner.jobs_in_flight.write().await;
        *jobs.entry(method.to_string()).or_default() -= 1;
    }

    /// Copy out the current values.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sandboxes: self.inner.sandboxes.load(Ordering::Relaxed),
            specs_loaded: self.inner.specs_loaded.read().await.clone(),
            actions_requested: self.inner.actions_requested.read().await.clone(),
            jobs_in_flight: self.inner.jobs_in_flight.read().await.clone(),
            specs_reset: self.inner.specs_reset.load(Ordering::Relaxed),
        }
    }
}
