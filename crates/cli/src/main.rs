use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use corral_core::{keys, Cluster, ControllerConfig};
use corral_engine::{spawn, Controller, LoopOptions, Policy, PolicyHandle, ResourceSet};
use corral_kubehub::{start_watcher, KubeStore};
use corral_resources::{cluster_router, pod_router, POD_SELECTOR};
use corral_store::{BackingStore, MemStore};
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "corrald", version, about = "Corral cluster-lifecycle controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the cluster and endpoint controllers against the current kube context
    Run,
    /// Show which handlers serve a schema version, without touching a cluster
    Plan {
        /// Schema version, e.g. "2.1.0"
        version: String,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Debug)]
struct Settings {
    /// Only watch Cluster objects in this namespace (default: all)
    #[arg(long = "ns", env = "CORRAL_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Allow disruptive replica-group updates
    #[arg(long, env = "CORRAL_UPDATES_ALLOWED", global = true, action = ArgAction::Set, default_value_t = true)]
    updates_allowed: bool,

    #[arg(long, env = "CORRAL_DNS_SERVERS", global = true, value_delimiter = ',')]
    dns_servers: Vec<String>,

    #[arg(long, env = "CORRAL_NTP_SERVERS", global = true, value_delimiter = ',')]
    ntp_servers: Vec<String>,

    /// Image running each node's VM
    #[arg(long, env = "CORRAL_VM_IMAGE", global = true)]
    vm_image: Option<String>,

    #[arg(long, env = "CORRAL_RESYNC_SECS", global = true)]
    resync_secs: Option<u64>,

    #[arg(long, env = "CORRAL_RETRY_ATTEMPTS", global = true)]
    retry_attempts: Option<u32>,

    #[arg(long, env = "CORRAL_QUEUE_CAP", global = true)]
    queue_cap: Option<usize>,
}

impl Settings {
    fn config(&self) -> ControllerConfig {
        let mut cfg = ControllerConfig { namespace: self.namespace.clone(), updates_allowed: self.updates_allowed, ..Default::default() };
        if !self.dns_servers.is_empty() { cfg.dns_servers = self.dns_servers.clone(); }
        if !self.ntp_servers.is_empty() { cfg.ntp_servers = self.ntp_servers.clone(); }
        if let Some(image) = &self.vm_image { cfg.vm_image = image.clone(); }
        if let Some(secs) = self.resync_secs { cfg.resync_secs = secs; }
        if let Some(attempts) = self.retry_attempts { cfg.retry.max_attempts = attempts; }
        if let Some(cap) = self.queue_cap { cfg.queue_cap = cap; }
        cfg
    }
}

fn init_tracing() {
    let env = std::env::var("CORRAL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CORRAL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CORRAL_METRICS_ADDR; expected host:port");
        }
    }
}

#[derive(Debug, Serialize)]
struct SetPlan {
    name: String,
    versions: String,
    handlers: Vec<String>,
}

impl SetPlan {
    fn of<O: corral_engine::Declared>(set: &ResourceSet<O>) -> Self {
        Self {
            name: set.name().to_string(),
            versions: set.selector().to_string(),
            handlers: set.handler_names().into_iter().map(String::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Plan {
    version: String,
    cluster: SetPlan,
    unit: SetPlan,
}

fn plan(version: &str, cfg: &ControllerConfig) -> Result<Plan> {
    let store: Arc<dyn BackingStore> = Arc::new(MemStore::new());
    let clusters = cluster_router(store.clone(), cfg)?;
    let units = pod_router(store, cfg)?;
    Ok(Plan {
        version: version.to_string(),
        cluster: SetPlan::of(clusters.resolve_version(version)?),
        unit: SetPlan::of(units.resolve_version(version)?),
    })
}

async fn run(cfg: ControllerConfig) -> Result<()> {
    let client = corral_kubehub::get_kube_client().await?;
    let store: Arc<dyn BackingStore> = Arc::new(KubeStore::new(client.clone()));
    let policy = PolicyHandle::new(Policy { updates_allowed: cfg.updates_allowed });
    metrics::gauge!("corral_updates_allowed", if cfg.updates_allowed { 1.0 } else { 0.0 });

    let clusters = Arc::new(Controller::new(
        "cluster",
        store.clone(),
        cluster_router(store.clone(), &cfg).context("building cluster handler table")?,
        keys::CLUSTER_FINALIZER,
        policy.clone(),
    ));
    let units = Arc::new(Controller::new(
        "endpoint",
        store.clone(),
        pod_router(store.clone(), &cfg).context("building endpoint handler table")?,
        keys::ENDPOINT_FINALIZER,
        policy,
    ));

    let (cluster_tx, cluster_loop) = spawn(clusters, LoopOptions {
        queue_cap: cfg.queue_cap,
        resync: cfg.resync(),
        namespace: cfg.namespace.clone(),
        selector: None,
    });
    let (unit_tx, unit_loop) = spawn(units, LoopOptions {
        queue_cap: cfg.queue_cap,
        resync: cfg.resync(),
        namespace: None,
        selector: Some(POD_SELECTOR.to_string()),
    });

    let cluster_watch = tokio::spawn({
        let client = client.clone();
        let ns = cfg.namespace.clone();
        async move {
            if let Err(e) = start_watcher::<Cluster>(client, ns.as_deref(), None, cluster_tx).await {
                error!(error = ?e, "cluster watcher failed");
            }
        }
    });
    let unit_watch = tokio::spawn(async move {
        if let Err(e) = start_watcher::<Pod>(client, None, Some(POD_SELECTOR), unit_tx).await {
            error!(error = ?e, "compute unit watcher failed");
        }
    });
    info!(ns = ?cfg.namespace, updates_allowed = cfg.updates_allowed, "corrald running");

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown requested; stopping watchers");
    cluster_watch.abort();
    unit_watch.abort();
    let _ = cluster_loop.await;
    let _ = unit_loop.await;
    info!("corrald stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = cli.settings.config();

    match cli.command {
        Commands::Run => run(cfg).await?,
        Commands::Plan { version } => {
            let plan = plan(&version, &cfg)?;
            match cli.output {
                Output::Human => {
                    println!("schema version {}", plan.version);
                    for (what, set) in [("cluster", &plan.cluster), ("unit", &plan.unit)] {
                        println!("{} • set {} ({})", what, set.name, set.versions);
                        for (i, h) in set.handlers.iter().enumerate() {
                            println!("  {}. {}", i + 1, h);
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
            }
        }
        Commands::Config => match cli.output {
            Output::Human => println!("{:#?}", cfg),
            Output::Json => println!("{}", serde_json::to_string_pretty(&cfg)?),
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "corrald", "--dns-servers", "10.0.0.2,10.0.0.3", "--updates-allowed", "false", "--retry-attempts", "5", "run",
        ])
        .unwrap();
        let cfg = cli.settings.config();
        assert_eq!(cfg.dns_servers, vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()]);
        assert!(!cfg.updates_allowed);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.ntp_servers, ControllerConfig::default().ntp_servers);
    }

    #[test]
    fn plan_resolves_both_controllers() {
        let p = plan("2.3.1", &ControllerConfig::default()).unwrap();
        assert_eq!(p.cluster.name, "v2");
        assert!(p.cluster.handlers.contains(&"etcd_claim".to_string()));
        assert_eq!(p.unit.handlers, vec!["endpoint".to_string()]);
        assert!(plan("9.0.0", &ControllerConfig::default()).is_err());
    }
}
