//! quartermaster-metrics — broker observability.
//!
//! Tracks sandbox lifecycle, per-registry spec counts, and per-action
//! request/job counters, and renders them in the Prometheus text
//! exposition format for the `/metrics` endpoint.

pub mod prometheus;
pub mod registry;

pub use prometheus::render_prometheus;
pub use registry::{BrokerMetrics, MetricsSnapshot};
