//! Certfleet - Main entry point
//!
//! Keeps the TLS certificates of a proxy fleet issued and renewed.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use certfleet_common::observability::{init_tracing, LogFormat};
use certfleet_common::PeerId;
use certfleet_config::Config;
use certfleet_engine::acme::{
    log_changes, AcmeClient, CertificateStateMachine, CertificateStore, ChallengeManager,
    Dns01Provisioner, FileCertificateStore, ReconciliationLoop,
};
use certfleet_engine::acme::dns::{PropagationChecker, Route53Provider};
use certfleet_engine::cluster::{
    ClusterCoordinator, CoordinationServer, GroupCoordinator, RemoteEnsemble,
    SingleNodeCoordinator,
};

/// Route53 API request timeout
const DNS_PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Certfleet - distributed TLS certificate lifecycle engine
#[derive(Parser, Debug)]
#[command(name = "certfleet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "CERTFLEET_CONFIG",
        global = true,
        default_value = "certfleet.kdl"
    )]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format (text or json)
    #[arg(long = "log-format", global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the certificate engine (default)
    Run,
    /// Validate configuration file and exit
    Test,
    /// Print the stored state of every configured certificate
    Status,
    /// Serve the cluster coordination namespace for engine nodes
    Coordinator {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:2281")]
        listen: SocketAddr,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, LogFormat::from_str_loose(&cli.log_format));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Test => test_config(&cli.config),
        Commands::Status => print_status(&cli.config),
        Commands::Run => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(run_engine(cli.config))
        }
        Commands::Coordinator { listen } => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(run_coordinator(listen))
        }
    }
}

/// Test configuration file and exit
fn test_config(path: &Path) -> Result<()> {
    info!("Testing configuration file: {}", path.display());
    let config = Config::from_file(path).context("Configuration validation failed")?;

    let manual = config
        .certificates
        .certificates
        .iter()
        .filter(|c| c.is_manual())
        .count();
    let wildcard = config
        .certificates
        .certificates
        .iter()
        .filter(|c| c.is_wildcard())
        .count();

    info!("Configuration test successful:");
    info!("  - {} certificate(s)", config.certificates.certificates.len());
    info!("  - {} manual, {} wildcard", manual, wildcard);
    info!("  - route53 {}", if config.route53.is_some() { "configured" } else { "not configured" });
    info!("  - cluster {}", if config.cluster.is_some() { "enabled" } else { "disabled" });

    config.lint();

    println!(
        "certfleet: configuration file {} test is successful",
        path.display()
    );
    Ok(())
}

fn print_status(path: &Path) -> Result<()> {
    let config = Config::from_file(path).context("Failed to load configuration file")?;
    let store: Arc<dyn CertificateStore> = Arc::new(
        FileCertificateStore::new(&config.storage.path)
            .context("Failed to open certificate store")?,
    );
    let client = Arc::new(AcmeClient::new(&config.acme, store.clone()));
    let machine = CertificateStateMachine::new(client, store, None, ChallengeManager::new());
    machine
        .reload_configuration(&without_dns_check(&config))
        .context("Invalid certificate configuration")?;

    println!("{:<40} {:<20} {:<8} EXPIRES", "DOMAIN", "STATE", "MODE");
    for domain in machine.domains() {
        let data = machine
            .certificate_data(&domain)
            .with_context(|| format!("Failed to load certificate for '{}'", domain))?;
        let expires = match data.certificate_info() {
            Ok(Some(info)) => info.not_after.to_rfc3339(),
            Ok(None) => "-".to_string(),
            Err(e) => format!("unreadable ({})", e),
        };
        println!(
            "{:<40} {:<20} {:<8} {}",
            data.domain,
            data.state,
            if data.manual { "manual" } else { "acme" },
            expires
        );
    }
    Ok(())
}

/// Status does not touch DNS, so wildcard entries are shown without a provider
fn without_dns_check(config: &Config) -> certfleet_config::CertificatesConfig {
    let mut certificates = config.certificates.clone();
    if config.route53.is_none() {
        certificates.certificates.retain(|c| c.is_manual() || !c.is_wildcard());
    }
    certificates
}

async fn run_engine(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path).context("Failed to load configuration file")?;
    config.lint();

    let store: Arc<dyn CertificateStore> = Arc::new(
        FileCertificateStore::new(&config.storage.path)
            .context("Failed to open certificate store")?,
    );
    let client = Arc::new(AcmeClient::new(&config.acme, store.clone()));
    info!(directory = %client.directory(), "Using ACME directory");

    let dns = match &config.route53 {
        Some(route53) => {
            let provider = Route53Provider::new(route53, DNS_PROVIDER_TIMEOUT)
                .context("Failed to create Route53 client")?;
            let provisioner =
                Dns01Provisioner::new(Arc::new(provider), Arc::new(PropagationChecker::new()));
            info!(provider = provisioner.provider_name(), "DNS-01 challenges enabled");
            Some(provisioner)
        }
        None => None,
    };

    let machine = Arc::new(CertificateStateMachine::new(
        client,
        store,
        dns,
        ChallengeManager::new(),
    ));
    machine
        .reload_configuration(&config.certificates)
        .context("Invalid certificate configuration")?;

    let coordinator = start_coordinator(&config).await?;
    let reconciler = Arc::new(ReconciliationLoop::new(machine.clone(), coordinator.clone()));
    if let Err(e) = reconciler.watch_peers().await {
        warn!(error = %e, "Failed to watch peer certificate changes");
    }
    tokio::spawn(log_changes(reconciler.subscribe()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_task = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.run(shutdown_rx).await })
    };

    info!("Certfleet started successfully");
    wait_for_signals(&config_path, &machine).await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = loop_task.await {
        warn!(error = %e, "Reconciliation loop ended abnormally");
    }
    coordinator.close().await;
    info!("Certfleet stopped");
    Ok(())
}

/// Join the configured cluster, or run as a cluster of one
async fn start_coordinator(config: &Config) -> Result<Arc<dyn ClusterCoordinator>> {
    let Some(cluster) = &config.cluster else {
        return Ok(Arc::new(SingleNodeCoordinator::new(PeerId::random())));
    };

    let peer_id = cluster
        .peer_id
        .clone()
        .map(PeerId::new)
        .unwrap_or_else(PeerId::random);
    let ensemble = Arc::new(RemoteEnsemble::from_config(cluster));
    info!(servers = ?ensemble.servers(), peer_id = %peer_id, "Joining cluster");
    let coordinator = GroupCoordinator::start(ensemble, cluster.root.clone(), peer_id)
        .await
        .context("Failed to join cluster")?;

    if !cluster.metadata.is_empty() {
        coordinator
            .store_local_peer_info(Some(cluster.metadata.clone()))
            .await
            .context("Failed to publish peer metadata")?;
    }
    Ok(Arc::new(coordinator))
}

/// Serve the coordination namespace until SIGTERM/SIGINT
async fn run_coordinator(listen: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind coordination server to {}", listen))?;
    let server = CoordinationServer::default();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serve_task = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

    wait_for_shutdown().await;
    let _ = shutdown_tx.send(true);
    serve_task
        .await
        .context("Coordination server ended abnormally")?
        .context("Coordination server failed")?;
    info!("Coordination server stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => info!("Received SIGTERM, shutting down"),
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Wait for SIGTERM/SIGINT, reloading the certificate table on SIGHUP
#[cfg(unix)]
async fn wait_for_signals(config_path: &Path, machine: &CertificateStateMachine) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut hup) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(term), Ok(hup)) => (term, hup),
        _ => {
            warn!("Failed to register signal handlers, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = term.recv() => {
                info!("Received SIGTERM, shutting down");
                return;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                return;
            }
            _ = hup.recv() => {
                info!("Received SIGHUP, reloading certificate configuration");
                reload(config_path, machine);
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_config_path: &Path, _machine: &CertificateStateMachine) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl-C, shutting down");
}

#[cfg_attr(not(unix), allow(dead_code))]
fn reload(config_path: &Path, machine: &CertificateStateMachine) {
    let result = Config::from_file(config_path)
        .map_err(anyhow::Error::from)
        .and_then(|config| {
            machine
                .reload_configuration(&config.certificates)
                .map_err(anyhow::Error::from)
        });
    if let Err(e) = result {
        warn!(error = %format!("{:#}", e), "Configuration reload rejected, keeping current certificates");
    }
}
