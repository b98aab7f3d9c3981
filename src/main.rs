use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use etcd_operator::OperatorConfig;
use etcd_operator::health::{HealthState, run_health_server};
use etcd_operator::run_controller;
use etcd_operator::{WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, run_webhook_server};

const LEASE_NAME: &str = "etcd-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time left to in-flight passes after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const DEFAULT_LOG_DIRECTIVES: &str = "etcd_operator=info,kube=warn";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    install_crypto_provider()?;
    init_tracing();

    let config = OperatorConfig::from_env();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.watch_namespace.as_deref().unwrap_or("cluster-wide"),
        resync_secs = config.resync_interval.as_secs(),
        member_ready_timeout_secs = config.member_ready_timeout.as_secs(),
        leader_election = config.enable_leader_election,
        "Starting etcd-operator"
    );

    let client = Client::try_default().await?;
    let health_state = Arc::new(HealthState::new());

    // Probes and admission are served by every replica, leader or not
    let health = {
        let state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(state, port).await {
                error!(error = %e, "Health server stopped");
            }
        })
    };
    let webhook = spawn_webhook(config.webhook_port);

    let renewal = if config.enable_leader_election {
        let (holder, lease_namespace) = pod_identity();
        Some(lead(client.clone(), &lease_namespace, &holder).await)
    } else {
        warn!("Leader election disabled, assuming this is the only replica");
        None
    };

    let controller = {
        let state = health_state.clone();
        let config = config.clone();
        tokio::spawn(run_controller(client, config, Some(state)))
    };

    tokio::select! {
        result = controller => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        result = health => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        _ = finished(webhook) => warn!("Webhook server exited"),
        _ = finished(renewal) => warn!("Lease renewal exited"),
        _ = shutdown_signal() => {
            info!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Shutdown requested, draining");
            health_state.set_ready(false);
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// TLS needs a process-wide crypto provider before any client or server starts
fn install_crypto_provider() -> Result<(), Box<dyn std::error::Error>> {
    let installed = rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_ok();
    if !installed && rustls::crypto::CryptoProvider::get_default().is_none() {
        return Err("no rustls crypto provider could be installed".into());
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Lease holder name and the namespace the lease lives in
fn pod_identity() -> (String, String) {
    let holder = std::env::var("POD_NAME").unwrap_or_else(|_| {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "etcd-operator".to_string());
        warn!(holder = %host, "POD_NAME not set, using hostname as lease holder");
        host
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, placing the lease in 'default'");
        "default".to_string()
    });
    (holder, namespace)
}

fn spawn_webhook(port: u16) -> Option<JoinHandle<()>> {
    if !(Path::new(WEBHOOK_CERT_PATH).exists() && Path::new(WEBHOOK_KEY_PATH).exists()) {
        info!(
            cert = WEBHOOK_CERT_PATH,
            key = WEBHOOK_KEY_PATH,
            "Webhook certificates not found, admission webhook disabled"
        );
        return None;
    }
    Some(tokio::spawn(async move {
        if let Err(e) = run_webhook_server(port, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH).await {
            error!(error = %e, "Webhook server stopped");
        }
    }))
}

/// Resolves when the task ends, never when there is no task
async fn finished(handle: Option<JoinHandle<()>>) {
    match handle {
        Some(handle) => {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task panicked");
            }
        }
        None => std::future::pending().await,
    }
}

/// Wait for the lease, then renew it in the background
///
/// A replica that loses the lease exits so it rejoins the election from a
/// clean start instead of reconciling alongside the new leader.
async fn lead(client: Client, namespace: &str, holder: &str) -> JoinHandle<()> {
    let lock = LeaseLock::new(
        client,
        namespace,
        LeaseLockParams {
            holder_id: holder.to_string(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: LEASE_TTL,
        },
    );

    info!(%holder, %namespace, lease = LEASE_NAME, "Waiting for leadership");
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(lease) if lease.acquired_lease => break,
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Lease acquisition failed"),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
    info!(%holder, "Acquired leadership");

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
            match lock.try_acquire_or_renew().await {
                Ok(lease) if lease.acquired_lease => {}
                Ok(_) => {
                    error!("Leadership lost, exiting");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "Lease renewal failed, exiting");
                    std::process::exit(1);
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}
