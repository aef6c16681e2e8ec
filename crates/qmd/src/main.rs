//! qmd — the Quartermaster service broker daemon.
//!
//! Single binary that assembles the broker subsystems:
//! - State store (embedded kv or typed cluster resources)
//! - Registry aggregator
//! - Job coordinator running bundle actions in cluster sandboxes
//! - OSB API + Prometheus exposition
//!
//! # Usage
//!
//! ```text
//! qmd run --config /etc/quartermaster/config.yaml --port 1338
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use qm_core::config::{Config, DaoBackend, LogConfig};
use quartermaster_api::{BasicCredentials, build_router};
use quartermaster_broker::Broker;
use quartermaster_cluster::{KubeResourceClient, KubeRuntime, KubeSecretSource, cluster_client};
use quartermaster_dao::{BrokerDao, KvDao, ResourceDao};
use quartermaster_engine::JobCoordinator;
use quartermaster_metrics::BrokerMetrics;
use quartermaster_registry::Registry;

#[derive(Parser)]
#[command(name = "qmd", about = "Quartermaster service broker daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker.
    Run {
        /// Broker configuration file.
        #[arg(long, default_value = "/etc/quartermaster/config.yaml")]
        config: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "1338")]
        port: u16,

        /// Directory holding `username` and `password` files for basic auth.
        #[arg(long, default_value = "/etc/quartermaster/auth")]
        auth_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            auth_dir,
        } => run(&config, port, &auth_dir).await,
    }
}

async fn run(config_path: &Path, port: u16, auth_dir: &Path) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    init_tracing(&config.log)?;

    info!("quartermaster broker starting");

    let client = cluster_client().await;

    // ── State store ────────────────────────────────────────────

    let dao: Arc<dyn BrokerDao> = match config.dao.backend {
        DaoBackend::Kv => {
            let dao = KvDao::open(Path::new(&config.dao.path))?;
            info!(path = %config.dao.path, "kv state store opened");
            Arc::new(dao)
        }
        DaoBackend::Resource => {
            let resources = KubeResourceClient::new(client.clone(), &config.dao.namespace);
            info!(namespace = %config.dao.namespace, "resource state store opened");
            Arc::new(ResourceDao::new(resources))
        }
    };

    // ── Registries ─────────────────────────────────────────────

    let secrets = KubeSecretSource::new(client.clone());
    let mut registries = Vec::with_capacity(config.registry.len());
    for registry_config in config.registry.clone() {
        let name = registry_config.name.clone();
        let registry =
            Registry::new(registry_config, &secrets, &config.cluster.namespace).await?;
        info!(registry = %name, "registry adapter initialized");
        registries.push(registry);
    }

    // ── Broker ─────────────────────────────────────────────────

    let metrics = BrokerMetrics::new();
    let runtime = Arc::new(KubeRuntime::new(client).await);
    let coordinator =
        JobCoordinator::new(dao.clone(), runtime, metrics.clone(), config.cluster.clone());
    let broker = Arc::new(Broker::new(
        dao,
        registries,
        coordinator,
        metrics.clone(),
        config.broker.clone(),
    ));

    if config.broker.recovery {
        let recovered = broker.recover().await?;
        info!(recovered, "job recovery finished");
    }

    if config.broker.bootstrap_on_startup {
        let report = broker.bootstrap().await?;
        info!(
            specs = report.spec_count,
            images = report.image_count,
            "catalog bootstrapped"
        );
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Catalog refresh loop ───────────────────────────────────

    let refresh_handle = match &config.broker.refresh_interval {
        Some(spec) => {
            let interval = parse_interval(spec)
                .with_context(|| format!("invalid refresh_interval '{spec}'"))?;
            info!(?interval, "catalog refresh enabled");
            let refresh_broker = broker.clone();
            let mut refresh_shutdown = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            if let Err(e) = refresh_broker.bootstrap().await {
                                error!(error = %e, "catalog refresh failed");
                            }
                        }
                        _ = refresh_shutdown.changed() => break,
                    }
                }
            }))
        }
        None => None,
    };

    // ── API server ─────────────────────────────────────────────

    if !config.broker.ssl_cert.is_empty() || !config.broker.ssl_key.is_empty() {
        warn!("ssl_cert/ssl_key are ignored; terminate TLS in front of the broker");
    }

    let auth = if basic_auth_enabled(&config) {
        Some(load_basic_credentials(auth_dir)?)
    } else {
        None
    };

    let router = build_router(broker, metrics, auth, config.broker.dev_broker);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Some(handle) = refresh_handle {
        let _ = handle.await;
    }

    info!("quartermaster broker stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log.level.clone()));

    match (&log.file, log.stdout) {
        (Some(path), false) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("opening log file {path}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(log.color)
                .init();
        }
    }
    Ok(())
}

fn basic_auth_enabled(config: &Config) -> bool {
    config
        .broker
        .auth
        .iter()
        .any(|scheme| scheme.kind == "basic" && scheme.enabled)
}

/// Read `username` and `password` files from the auth directory.
fn load_basic_credentials(dir: &Path) -> anyhow::Result<BasicCredentials> {
    let username = std::fs::read_to_string(dir.join("username"))
        .with_context(|| format!("reading {}/username", dir.display()))?
        .trim()
        .to_string();
    let password = std::fs::read_to_string(dir.join("password"))
        .with_context(|| format!("reading {}/password", dir.display()))?
        .trim()
        .to_string();
    if username.is_empty() || password.is_empty() {
        anyhow::bail!("basic auth username and password must not be empty");
    }
    Ok(BasicCredentials { username, password })
}

/// Parse an interval like `30s`, `10m`, or `1h`.
fn parse_interval(spec: &str) -> anyhow::Result<Duration> {
    let spec = spec.trim();
    let (value, unit) = spec.split_at(spec.len().saturating_sub(1));
    let value: u64 = value
        .parse()
        .with_context(|| format!("'{spec}' is not a duration"))?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        _ => anyhow::bail!("'{spec}' has an unknown unit, expected s, m, or h"),
    };
    Ok(Duration::from_secs(seconds))
}
