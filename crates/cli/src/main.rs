use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use weft_controller::{Manager, ManagerConfig};
use weft_core::{Registry, Resource, Tenancy, Type};
use weft_store::{Backend, MemBackend};

mod fixture;

#[derive(Parser, Debug)]
#[command(name = "weftctl", version, about = "Run the weft mesh controllers against a resource fixture")]
struct Cli {
    /// Log filter directives, e.g. `info,weft_controller=debug`
    #[arg(long = "log", env = "WEFT_LOG", global = true, default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on this address
    #[arg(long = "metrics-addr", env = "WEFT_METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Yaml)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Yaml, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered resource types
    Types,
    /// Write a fixture into a fresh store and report rejected resources
    Check {
        fixture: PathBuf,
    },
    /// Load a fixture, run all controllers until writes settle, print computed resources
    Run {
        fixture: PathBuf,
        /// Identities with only default permissions admit every source
        #[arg(long = "default-allow", action = ArgAction::SetTrue)]
        default_allow: bool,
        /// Quiet period with no writes that counts as converged
        #[arg(long = "settle-ms", default_value_t = 200)]
        settle_ms: u64,
        /// Give up after this long even if writes keep happening
        #[arg(long = "timeout-secs", default_value_t = 30)]
        timeout_secs: u64,
        #[command(flatten)]
        tuning: Tuning,
    },
}

#[derive(clap::Args, Debug)]
struct Tuning {
    #[arg(long = "backoff-base-ms", env = "WEFT_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,
    #[arg(long = "backoff-max-ms", env = "WEFT_BACKOFF_MAX_MS", default_value_t = 1_000_000)]
    backoff_max_ms: u64,
    #[arg(long = "reconcile-timeout-ms", env = "WEFT_RECONCILE_TIMEOUT_MS", default_value_t = 30_000)]
    reconcile_timeout_ms: u64,
    /// Concurrent reconciles per controller
    #[arg(long = "workers", env = "WEFT_WORKERS", default_value_t = 4)]
    workers: usize,
}

impl Tuning {
    fn config(&self) -> ManagerConfig {
        ManagerConfig {
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            reconcile_timeout: Duration::from_millis(self.reconcile_timeout_ms),
            workers_per_controller: self.workers.max(1),
            ..ManagerConfig::default()
        }
    }
}

/// Logs go to stderr so `run` output stays pipeable.
fn init_tracing(directives: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(directives)
        .with_context(|| format!("invalid log filter {:?}", directives))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(anyhow::Error::msg)
        .context("install tracing subscriber")
}

fn init_metrics(addr: Option<SocketAddr>) -> Result<()> {
    let Some(addr) = addr else { return Ok(()) };
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("serve metrics on {}", addr))?;
    info!(%addr, "serving metrics");
    Ok(())
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    weft_catalog::register_types(&mut registry);
    weft_auth::register_types(&mut registry);
    weft_mesh::register_types(&mut registry);
    registry
}

fn print<T: serde::Serialize>(output: Output, value: &T) -> Result<()> {
    match output {
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

/// Writes every fixture resource, returning the rejected ones with their errors.
async fn seed(backend: &MemBackend, resources: Vec<Resource>) -> Vec<(String, String)> {
    let mut rejected = Vec::new();
    for res in resources {
        let id = res.id.to_string();
        if let Err(e) = backend.write(res).await {
            warn!(id = %id, error = %e, "fixture resource rejected");
            rejected.push((id, e.to_string()));
        }
    }
    rejected
}

/// Waits until the controllers have written past `baseline` and then gone a
/// full `settle` period without writing. False on timeout or interrupt.
async fn wait_settled(backend: &MemBackend, baseline: u64, settle: Duration, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut last = baseline;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(settle) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return false;
            }
        }
        let now = backend.write_count();
        if now > baseline && now == last {
            return true;
        }
        if Instant::now() >= deadline {
            warn!(writes = now, "writes did not settle before timeout");
            return false;
        }
        last = now;
    }
}

async fn computed(backend: &MemBackend) -> Result<BTreeMap<String, Vec<Resource>>> {
    let types: [Type; 3] = [
        weft_catalog::SERVICE_TYPE,
        weft_auth::COMPUTED_TRAFFIC_PERMISSIONS_TYPE,
        weft_mesh::COMPUTED_IMPLICIT_DESTINATIONS_TYPE,
    ];
    let mut out = BTreeMap::new();
    for ty in types {
        let list = backend.list(&ty, &Tenancy::wildcard(), "").await.with_context(|| format!("list {}", ty))?;
        out.insert(ty.to_string(), list);
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log)?;
    init_metrics(cli.metrics_addr)?;

    match cli.command {
        Commands::Types => {
            let registry = registry();
            let types: BTreeMap<String, String> = registry
                .types()
                .filter_map(|ty| registry.get(ty).map(|reg| (ty.to_string(), format!("{:?}", reg.scope))))
                .collect();
            print(cli.output, &types)?;
        }
        Commands::Check { fixture } => {
            let resources = fixture::load(&fixture)?;
            let total = resources.len();
            let backend = MemBackend::new(registry());
            let rejected = seed(&backend, resources).await;
            info!(total, rejected = rejected.len(), "fixture checked");
            if !rejected.is_empty() {
                print(cli.output, &rejected.into_iter().collect::<BTreeMap<_, _>>())?;
                anyhow::bail!("fixture has rejected resources");
            }
        }
        Commands::Run { fixture, default_allow, settle_ms, timeout_secs, tuning } => {
            let resources = fixture::load(&fixture)?;
            let total = resources.len();
            let registry = registry();
            let backend = Arc::new(MemBackend::new(registry.clone()));
            let rejected = seed(&backend, resources).await;
            if !rejected.is_empty() {
                warn!(rejected = rejected.len(), "continuing without rejected fixture resources");
            }
            let seeded = total - rejected.len();
            let baseline = backend.write_count();

            let mut mgr = Manager::new(backend.clone(), registry, tuning.config());
            mgr.register(weft_catalog::service_identities_controller());
            mgr.register(weft_auth::traffic_permissions_controller());
            mgr.register(weft_mesh::implicit_destinations_controller(default_allow));
            mgr.set_leader(true);

            let cancel = CancellationToken::new();
            let task = tokio::spawn(mgr.run(cancel.clone()));
            // an empty store gives the controllers nothing to write
            let settled = seeded == 0
                || wait_settled(&backend, baseline, Duration::from_millis(settle_ms), Duration::from_secs(timeout_secs)).await;
            cancel.cancel();
            match task.await.context("manager task")? {
                Ok(()) => info!(settled, writes = backend.write_count(), "manager stopped"),
                Err(e) => error!(error = %e, "manager failed"),
            }

            print(cli.output, &computed(&backend).await?)?;
        }
    }
    Ok(())
}
