//! Multi-Site Coordinator daemon
//!
//! Runs one site manager per node: connects a coordination session,
//! announces this node's service record, reconciles the node against the
//! cluster target configuration, and drives the repair coordinator. Health
//! and metrics endpoints are served over HTTP.

use clap::Parser;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use multisite_coordinator::coordination::session::CoordinationClient;
use multisite_coordinator::domain::ports::{
    LoopbackSiteControl, MemoryAuditLog, StandaloneMembership, StandaloneRepairExecutor,
    StandaloneRepository,
};
use multisite_coordinator::registry::{AddressFamily, ServiceRecord, ServiceRegistry};
use multisite_coordinator::sitemgr::DrTimeouts;
use multisite_coordinator::{
    ConfigStore, Error, MemoryCoordination, PrimarySitePointer, RepairCoordinator,
    RepairCoordinatorConfig, Result, Site, SiteState, TargetInfo, VdcManager, VdcManagerConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Multi-Site Coordinator - cluster coordination and DR orchestration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Identifier of the site this node belongs to
    #[arg(long, env = "SITE_ID", default_value = "site-1")]
    site_id: String,

    /// Identifier of this node
    #[arg(long, env = "NODE_ID", default_value = "node-1")]
    node_id: String,

    /// Site virtual IP published in the site record
    #[arg(long, env = "SITE_VIP", default_value = "127.0.0.1")]
    site_vip: String,

    /// Number of nodes in this site
    #[arg(long, env = "SITE_NODE_COUNT", default_value = "1")]
    site_node_count: u32,

    /// Coordination store driver (only "memory" is built in)
    #[arg(long, env = "COORDINATION_STORE", default_value = "memory")]
    coordination_store: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Control loop interval in seconds
    #[arg(long, env = "POLL_INTERVAL", default_value = "5")]
    poll_interval_secs: u64,

    /// Deadline for in-flight DR operations, in seconds
    #[arg(long, env = "DR_OPERATION_TIMEOUT", default_value = "1800")]
    dr_operation_timeout_secs: u64,

    /// Token ranges covered by one full repair run
    #[arg(long, env = "REPAIR_RANGES", default_value = "256")]
    repair_ranges: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Multi-Site Coordinator");
    info!("  Version: {}", multisite_coordinator::VERSION);
    info!("  Site: {} ({})", args.site_id, args.site_vip);
    info!("  Node: {}", args.node_id);
    info!("  Coordination store: {}", args.coordination_store);

    if args.coordination_store != "memory" {
        return Err(Error::Configuration(format!(
            "unknown coordination store driver: {}",
            args.coordination_store
        )));
    }

    let shutdown = CancellationToken::new();

    // Coordination session and presence tracking
    let cluster = MemoryCoordination::new();
    let session = cluster.connect();
    let client = CoordinationClient::new(session.clone(), &args.site_id, &args.node_id);
    client.spawn_presence_task(shutdown.clone());

    let config = Arc::new(ConfigStore::new(session.clone(), &args.site_id));
    bootstrap_site(&config, &args).await?;

    // Announce this manager in the service registry
    let registry = ServiceRegistry::new(session, AddressFamily::Ipv4);
    let record = ServiceRecord {
        name: "coordinatorsvc".into(),
        version: multisite_coordinator::VERSION.into(),
        node_id: args.node_id.clone(),
        tags: BTreeSet::from(["dr".to_string()]),
        endpoints: BTreeMap::from([(
            "health".to_string(),
            format!("http://{}", args.health_addr),
        )]),
    };
    registry.register(&client, &record).await?;

    // Collaborator ports; standalone adapters back them all in-process
    let repository = StandaloneRepository::new();
    let audit = MemoryAuditLog::new();
    let site_control = LoopbackSiteControl::new();
    let node_ref = format!("{}/{}", args.site_id, args.node_id);
    let membership = StandaloneMembership::with_nodes(&[node_ref.as_str()]);

    let manager = VdcManager::new(
        client.clone(),
        config.clone(),
        repository,
        audit,
        site_control,
        membership.clone(),
        VdcManagerConfig {
            software_version: multisite_coordinator::VERSION.to_string(),
            poll_interval: Duration::from_secs(args.poll_interval_secs),
            dr_operation_timeout: Duration::from_secs(args.dr_operation_timeout_secs),
            timeouts: DrTimeouts::default(),
        },
    );
    let manager_task = manager.spawn(shutdown.clone());

    let repair = RepairCoordinator::new(
        client.clone(),
        config,
        membership,
        StandaloneRepairExecutor::new(args.repair_ranges),
        RepairCoordinatorConfig::default(),
    );
    let repair_task = repair.spawn(shutdown.clone());

    // Health server
    let health_addr = args.health_addr.clone();
    let health_client = client.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_client).await {
            error!("Health server error: {}", e);
        }
    });

    // Metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();
    let _ = futures::future::join(manager_task, repair_task).await;
    info!("Coordinator shutdown complete");
    Ok(())
}

/// First node up seeds the site record, primary pointer and initial target
async fn bootstrap_site(config: &ConfigStore, args: &Args) -> Result<()> {
    if config.query::<Site>(&args.site_id).await?.is_none() {
        let mut site = Site::new(&args.site_id, &args.site_vip, args.site_node_count);
        site.transition(SiteState::Active);
        config.persist(&site).await?;
        info!("Site record created for {}", args.site_id);
    }
    if config
        .query::<PrimarySitePointer>(PrimarySitePointer::ID)
        .await?
        .is_none()
    {
        config
            .persist(&PrimarySitePointer::pointing_at(&args.site_id))
            .await?;
    }
    if config.query::<TargetInfo>(TargetInfo::ID).await?.is_none() {
        config
            .persist(&TargetInfo::initial(multisite_coordinator::VERSION))
            .await?;
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, client: Arc<CoordinationClient>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use multisite_coordinator::ConnectionState;

    let make_svc = make_service_fn(move |_conn| {
        let client = client.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let client = client.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => Response::builder()
                            .status(StatusCode::OK)
                            .body(Body::from("ok"))
                            .unwrap(),
                        // Ready only while the coordination session is up
                        "/readyz" => match client.connection_state() {
                            ConnectionState::Connected => Response::builder()
                                .status(StatusCode::OK)
                                .body(Body::from("ok"))
                                .unwrap(),
                            ConnectionState::Disconnected => Response::builder()
                                .status(StatusCode::SERVICE_UNAVAILABLE)
                                .body(Body::from("coordination session down"))
                                .unwrap(),
                        },
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::from("not found"))
                            .unwrap(),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    // Register coordinator metrics
    let _ = prometheus::register_counter_vec!(
        "multisite_dr_operations_total",
        "DR operations dispatched, by action",
        &["action"]
    );
    let _ = prometheus::register_counter!(
        "multisite_dr_operation_failures_total",
        "DR handler executions that errored a site"
    );
    let _ = prometheus::register_gauge!(
        "multisite_sites_total",
        "Number of sites with a site record"
    );
    let _ = prometheus::register_counter!(
        "multisite_coordination_reconnects_total",
        "Coordination session reconnects observed"
    );
    let _ = prometheus::register_counter!(
        "multisite_repair_ranges_total",
        "Token ranges repaired"
    );
    let _ = prometheus::register_histogram!(
        "multisite_dr_operation_duration_seconds",
        "Duration of DR handler executions"
    );

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    encoder.encode(&metric_families, &mut buffer).unwrap();

                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Body::from(buffer))
                        .unwrap()
                }
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
