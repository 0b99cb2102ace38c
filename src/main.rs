//! Pool Cluster Operator
//!
//! Runs the PoolClusterClaim controller and the validating admission
//! webhook in one process, next to a health and a metrics endpoint.
//!
//! ```text
//! ┌──────────────────────────── process ─────────────────────────────┐
//! │  :443  admission webhook (TLS)     :8080 /metrics                │
//! │        controller workers          :8081 /healthz /livez /readyz │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pool_cluster_operator::admission::{router, serve_tls, tls_acceptor};
use pool_cluster_operator::controller::{kube_events, memory_events, LeaderElector, LeaseConfig};
use pool_cluster_operator::{
    bootstrap, fabricator, AdmissionConfig, AdmissionState, BootstrapConfig, CertBundle,
    ClientSet, Controller, ControllerConfig, Error, MemoryCluster, Metrics, Result, Validator,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Pool Cluster Operator - controller and admission webhook for storage pool clusters
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Admission webhook listener port
    #[arg(long, env = "WEBHOOK_PORT", default_value = "443")]
    port: u16,

    /// PEM server certificate; generated when absent
    #[arg(long, env = "TLS_CERT_FILE")]
    tls_cert_file: Option<PathBuf>,

    /// PEM server private key
    #[arg(long, env = "TLS_KEY_FILE")]
    tls_key_file: Option<PathBuf>,

    /// Kubeconfig for running outside the cluster
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace of the webhook secret and service
    #[arg(long, env = "OPENEBS_NAMESPACE", default_value = "")]
    namespace: String,

    /// Deployment owning the webhook objects
    #[arg(long, env = "ADMISSION_WEBHOOK_NAME", default_value = "")]
    webhook_name: String,

    /// Concurrent reconcile workers
    #[arg(long, env = "RECONCILE_WORKERS", default_value = "2")]
    workers: usize,

    /// Deadline of one reconcile cycle in seconds
    #[arg(long, default_value = "30")]
    reconcile_timeout_secs: u64,

    /// Budget for one admission review in seconds
    #[arg(long, default_value = "10")]
    admission_timeout_secs: u64,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Do not serve the admission webhook
    #[arg(long)]
    disable_webhook: bool,

    /// Do not run the reconciler
    #[arg(long)]
    disable_controller: bool,

    /// Run against an in-memory store (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Only reconcile while holding the controller lease
    #[arg(long, env = "LEADER_ELECTION")]
    leader_election: bool,

    /// Identity of this replica in the lease
    #[arg(long, env = "POD_NAME", default_value = "")]
    pod_name: String,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Pool Cluster Operator");
    info!("  Version: {}", pool_cluster_operator::VERSION);
    info!("  Webhook port: {}", args.port);
    info!("  Workers: {}", args.workers);
    info!("  Standalone mode: {}", args.standalone);

    let metrics = Metrics::register(prometheus::default_registry())?;
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let health_addr = parse_addr(&args.health_addr, "health")?;
    let health_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_token).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = parse_addr(&args.metrics_addr, "metrics")?;
    let metrics_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics_token).await {
            error!("Metrics server error: {}", e);
        }
    });

    // The memory cluster must outlive the event stream built from it
    let standalone_cluster = args.standalone.then(MemoryCluster::new);
    let (clients, events, live_client) = match &standalone_cluster {
        Some(cluster) => (cluster.client_set(), memory_events(cluster), None),
        None => {
            let client = kube_client(args.kubeconfig.as_deref()).await?;
            (
                ClientSet::from_kube(client.clone(), &args.namespace),
                kube_events(client.clone()),
                Some(client),
            )
        }
    };
    let clients_fab = fabricator(clients.clone());

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    if !args.disable_webhook {
        let admission = AdmissionConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], args.port)),
            review_timeout: Duration::from_secs(args.admission_timeout_secs),
        };
        let bundle = if args.standalone {
            CertBundle::generate("admission-server-svc", "default", 365)?
        } else {
            let config = BootstrapConfig::new(&args.namespace, &args.webhook_name)
                .with_target_port(args.port);
            bootstrap(&clients, &config).await?
        };
        let (cert, key) = server_credentials(&args, bundle).await?;
        let acceptor = tls_acceptor(&cert, &key)?;

        let state = AdmissionState::new(
            Validator::new(clients_fab.clone()),
            metrics.clone(),
            admission.review_timeout,
        );
        tasks.spawn(serve_tls(
            admission.listen_addr,
            router(state),
            acceptor,
            shutdown.clone(),
        ));
    }

    if !args.disable_controller {
        let config = ControllerConfig {
            workers: args.workers,
            reconcile_timeout: Duration::from_secs(args.reconcile_timeout_secs),
            ..Default::default()
        };
        let controller = match (&live_client, args.leader_election) {
            (Some(client), true) => {
                let lease = LeaseConfig::new(&args.namespace, &args.pod_name);
                info!("  Leader election: lease {}/{}", lease.namespace, lease.name);
                let leadership = LeaderElector::new(client.clone(), lease)?.spawn(shutdown.clone());
                Controller::with_leadership(clients_fab.clone(), config, metrics.clone(), leadership)
            }
            _ => Controller::new(clients_fab.clone(), config, metrics.clone()),
        };
        tasks.spawn(controller.run(events, shutdown.clone()));
    }

    if tasks.is_empty() {
        warn!("Both webhook and controller are disabled, nothing to run");
        return Ok(());
    }

    let mut outcome = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| Error::Internal(format!("task failed: {}", e)));
        if let Err(e) = result.and_then(|r| r) {
            error!("Fatal error: {}", e);
            shutdown.cancel();
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }
    }

    info!("Operator shutdown complete");
    outcome
}

// =============================================================================
// Setup Helpers
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info"] {
        let directive = directive
            .parse()
            .map_err(|e| Error::Configuration(format!("bad log directive {}: {}", directive, e)))?;
        filter = filter.add_directive(directive);
    }

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
    Ok(())
}

fn parse_addr(addr: &str, what: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address: {}", what, e)))
}

async fn kube_client(kubeconfig: Option<&Path>) -> Result<kube::Client> {
    let config = match kubeconfig {
        Some(path) => {
            let raw = kube::config::Kubeconfig::read_from(path)
                .map_err(|e| Error::Configuration(format!("failed to read kubeconfig: {}", e)))?;
            kube::Config::from_custom_kubeconfig(raw, &kube::config::KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Configuration(format!("invalid kubeconfig: {}", e)))?
        }
        None => kube::Config::infer()
            .await
            .map_err(|e| Error::Configuration(format!("failed to infer kube config: {}", e)))?,
    };
    Ok(kube::Client::try_from(config)?)
}

/// Certificate and key the webhook serves with: the files when both are
/// given, the bootstrapped pair otherwise
async fn server_credentials(args: &Args, bundle: CertBundle) -> Result<(Vec<u8>, Vec<u8>)> {
    match (&args.tls_cert_file, &args.tls_key_file) {
        (Some(cert), Some(key)) => {
            info!("  TLS certificate: {}", cert.display());
            Ok((tokio::fs::read(cert).await?, tokio::fs::read(key).await?))
        }
        (None, None) => Ok((bundle.server_cert, bundle.server_key)),
        _ => Err(Error::Configuration(
            "--tls-cert-file and --tls-key-file must be given together".into(),
        )),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let ready = shutdown.clone();
    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let draining = ready.is_cancelled();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
                        "/readyz" if draining => text(StatusCode::SERVICE_UNAVAILABLE, "shutting down"),
                        "/readyz" => text(StatusCode::OK, "ok"),
                        _ => text(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = encoder.format_type().parse() {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => {
                            warn!("Failed to encode metrics: {}", e);
                            text(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                        }
                    }
                }
                _ => text(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
