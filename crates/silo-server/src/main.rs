mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use silo_membership::{
    ConsistentRingProvider, MembershipOracle, MembershipTableFactory, RingConfig, RingProvider,
    RingRange, RingRangeListener, SiloAddress, SiloIdentity, TableBackend, TableService,
    TransportEvent, UdpSiloTransport, VirtualBucketsRingProvider,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;

/// How often the timers' health is checked.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "silo-server", about = "cluster membership silo")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "SILO_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind to
    #[arg(long, env = "SILO_HOST")]
    host: Option<String>,

    /// UDP port for liveness pings and gossip
    #[arg(short, long, env = "SILO_PORT")]
    port: Option<u16>,

    /// silo generation. allocated from the clock when omitted
    #[arg(long, env = "SILO_GENERATION")]
    generation: Option<i32>,

    /// logical silo name
    #[arg(long, env = "SILO_NAME")]
    silo_name: Option<String>,

    /// deployment id shared by all silos of the cluster
    #[arg(long, env = "SILO_DEPLOYMENT_ID")]
    deployment_id: Option<String>,

    /// keep the membership table in this JSON file
    #[arg(long, env = "SILO_TABLE_FILE", conflicts_with = "table_remote")]
    table_file: Option<PathBuf>,

    /// use the membership table served by another silo at this address
    #[arg(long, env = "SILO_TABLE_REMOTE")]
    table_remote: Option<SocketAddr>,

    /// serve the local membership table to other silos on this TCP port
    #[arg(long, env = "SILO_TABLE_SERVICE_PORT")]
    table_service_port: Option<u16>,

    /// number of silos the cluster is expected to have
    #[arg(long, env = "SILO_EXPECTED_CLUSTER_SIZE")]
    expected_cluster_size: Option<usize>,
}

/// Applies CLI overrides to a `ServerConfig`. Only `Some` values from the
/// CLI args take effect, preserving the resolution order:
/// defaults → TOML file → env vars → CLI flags.
fn apply_args(cfg: &mut ServerConfig, args: &Args) {
    if let Some(ref host) = args.host {
        cfg.bind = host.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(generation) = args.generation {
        cfg.generation = Some(generation);
    }
    if let Some(ref name) = args.silo_name {
        cfg.silo_name = name.clone();
    }
    if let Some(ref id) = args.deployment_id {
        cfg.deployment_id = id.clone();
    }
    if let Some(ref path) = args.table_file {
        cfg.table = TableBackend::File { path: path.clone() };
    }
    if let Some(addr) = args.table_remote {
        cfg.table = TableBackend::Remote { addr };
    }
    if let Some(port) = args.table_service_port {
        cfg.table_service_port = port;
    }
    if let Some(n) = args.expected_cluster_size {
        cfg.membership.expected_cluster_size = n;
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

/// Parses a `host:port` pair into a `SocketAddr`. Exits with a message on failure.
fn parse_bind_addr(host: &str, port: u16, label: &str) -> SocketAddr {
    match format!("{host}:{port}").parse() {
        Ok(a) => a,
        Err(e) => exit_err(format!("invalid {label} bind address '{host}:{port}': {e}")),
    }
}

/// Logs every change of this silo's ring range.
struct RangeLogger;

impl RingRangeListener for RangeLogger {
    fn range_change_notification(&self, old: &RingRange, new: &RingRange, increased: bool) {
        info!("ring range changed from {old} to {new} (increased: {increased})");
    }
}

/// Builds the configured ring provider and subscribes it to the oracle.
fn build_ring(oracle: &MembershipOracle, cfg: &RingConfig) -> Arc<dyn RingProvider> {
    let me = oracle.my_address();
    if cfg.use_virtual_buckets {
        let ring = VirtualBucketsRingProvider::new(me, cfg.num_buckets_per_silo)
            .unwrap_or_else(|e| exit_err(format!("invalid ring configuration: {e}")));
        let ring = Arc::new(ring);
        oracle.subscribe_to_silo_status_events(ring.clone());
        ring
    } else {
        let ring = Arc::new(ConsistentRingProvider::new(me));
        oracle.subscribe_to_silo_status_events(ring.clone());
        ring
    }
}

/// Feeds gossip received by the transport into the oracle.
fn spawn_gossip_consumer(oracle: Arc<MembershipOracle>, mut events: mpsc::Receiver<TransportEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::StatusNotification { from, silo, status } => {
                    debug!(%from, "gossip: {silo} is now {status}");
                    if let Err(e) = oracle.silo_status_change_notification(&silo, status).await {
                        warn!("failed to process gossip from {from}: {e}");
                    }
                }
            }
        }
    });
}

fn spawn_health_check(oracle: Arc<MembershipOracle>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            if !oracle.check_health() {
                warn!("membership oracle reported unhealthy timers");
            }
        }
    });
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "silo=info".into()),
        )
        .init();

    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match ServerConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // defaults → TOML file → CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => ServerConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => ServerConfig::default(),
    };
    apply_args(&mut cfg, &args);
    cfg.validate()
        .unwrap_or_else(|e| exit_err(format!("invalid configuration: {e}")));

    let endpoint = parse_bind_addr(&cfg.bind, cfg.port, "liveness");
    let generation = cfg.generation.unwrap_or_else(SiloAddress::allocate_generation);

    let factory = MembershipTableFactory::new(
        cfg.deployment_id.clone(),
        cfg.table.clone(),
        cfg.table_call_timeout,
    );
    let table = factory
        .get_membership_table()
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to open membership table: {e}")));

    let _table_service = if cfg.table_service_port != 0 {
        let addr = parse_bind_addr(&cfg.bind, cfg.table_service_port, "table service");
        let (local, handle) = TableService::start(Arc::clone(&table), addr)
            .await
            .unwrap_or_else(|e| exit_err(format!("failed to start table service on {addr}: {e}")));
        info!("serving membership table on {local}");
        Some(handle)
    } else {
        None
    };

    let (transport, events) =
        UdpSiloTransport::bind(endpoint, generation, cfg.membership.probe_response_timeout)
            .await
            .unwrap_or_else(|e| exit_err(format!("failed to bind liveness transport on {endpoint}: {e}")));
    let me = transport.local_silo();

    let identity = SiloIdentity {
        address: me,
        silo_name: cfg.resolved_silo_name(),
        host_name: cfg.host_name.clone(),
        proxy_port: cfg.proxy_port,
        role_name: String::new(),
        instance_name: cfg.resolved_silo_name(),
        update_zone: 0,
        fault_zone: 0,
    };
    let oracle = MembershipOracle::new(identity, cfg.membership.clone(), table, transport)
        .unwrap_or_else(|e| exit_err(format!("invalid membership configuration: {e}")));

    let ring = build_ring(&oracle, &cfg.ring);
    ring.subscribe(Arc::new(RangeLogger));
    spawn_gossip_consumer(Arc::clone(&oracle), events);

    info!(
        silo = %me,
        deployment = %cfg.deployment_id,
        table = ?cfg.table,
        "silo starting"
    );
    if let Err(e) = oracle.start().await {
        exit_err(format!("failed to join the cluster: {e}"));
    }
    if let Err(e) = oracle.become_active().await {
        if let Err(kill) = oracle.kill_myself().await {
            error!("failed to mark myself dead: {kill}");
        }
        exit_err(format!("failed to become active: {e}"));
    }
    info!(
        silo = %me,
        ring_size = ring.ring_size(),
        "silo active, my range {}",
        ring.my_range()
    );
    spawn_health_check(Arc::clone(&oracle));

    let mut terminated = oracle.terminated();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, leaving the cluster");
            if let Err(e) = oracle.shut_down().await {
                warn!("failed to announce shutdown: {e}");
            }
            if let Err(e) = oracle.kill_myself().await {
                warn!("failed to mark myself dead: {e}");
            }
            info!("silo stopped");
        }
        _ = terminated.wait_for(|dead| *dead) => {
            error!("silo {me} was declared dead by the cluster, exiting");
            std::process::exit(2);
        }
    }
}
