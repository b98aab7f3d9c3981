//! Probe and metrics endpoints
//!
//! `/healthz` answers as long as the process runs, `/readyz` once the
//! controller is watching, and `/metrics` serves the registry below in the
//! Prometheus text format.

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;

use crate::crd::MaintenanceKind;

const METRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Identifies one Etcd resource
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

impl ClusterLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub namespace: String,
    pub name: String,
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MaintenanceLabels {
    pub kind: String,
}

/// Operator metrics, registered once at startup
pub struct Metrics {
    pub reconciliations: Family<ClusterLabels, Counter>,
    pub reconcile_errors: Family<ErrorLabels, Counter>,
    pub reconcile_duration: Family<ClusterLabels, Histogram>,
    pub desired_members: Family<ClusterLabels, Gauge>,
    pub ready_members: Family<ClusterLabels, Gauge>,
    pub maintenance_submitted: Family<MaintenanceLabels, Counter>,
    /// Unix time of the most recent pass over any cluster
    pub last_reconcile: Gauge,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("etcd_operator");

        let reconciliations = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "reconciliations",
            "Reconcile passes per cluster",
            reconciliations.clone(),
        );

        let reconcile_errors = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "reconcile_errors",
            "Failed reconcile passes per cluster and error kind",
            reconcile_errors.clone(),
        );

        let reconcile_duration = Family::<ClusterLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.005, 2.0, 12))
        });
        registry.register(
            "reconcile_duration_seconds",
            "Wall time of one reconcile pass",
            reconcile_duration.clone(),
        );

        let desired_members = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "desired_members",
            "Members requested by the Etcd resource",
            desired_members.clone(),
        );

        let ready_members = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "ready_members",
            "Members reporting a healthy endpoint",
            ready_members.clone(),
        );

        let maintenance_submitted = Family::<MaintenanceLabels, Counter>::default();
        registry.register(
            "maintenance_submitted",
            "Maintenance tasks handed to the platform",
            maintenance_submitted.clone(),
        );

        let last_reconcile = Gauge::default();
        registry.register(
            "last_reconcile_timestamp_seconds",
            "Unix time of the latest reconcile pass",
            last_reconcile.clone(),
        );

        Self {
            reconciliations,
            reconcile_errors,
            reconcile_duration,
            desired_members,
            ready_members,
            maintenance_submitted,
            last_reconcile,
            registry,
        }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64, unix_secs: i64) {
        let labels = ClusterLabels::new(namespace, name);
        self.reconciliations.get_or_create(&labels).inc();
        self.reconcile_duration
            .get_or_create(&labels)
            .observe(duration_secs);
        self.last_reconcile.set(unix_secs);
    }

    pub fn record_error(&self, namespace: &str, name: &str, kind: &str) {
        let labels = ErrorLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
        };
        self.reconcile_errors.get_or_create(&labels).inc();
    }

    pub fn set_members(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = ClusterLabels::new(namespace, name);
        self.desired_members.get_or_create(&labels).set(desired);
        self.ready_members.get_or_create(&labels).set(ready);
    }

    /// Forget a deleted cluster so its series stop being exported
    pub fn forget_cluster(&self, namespace: &str, name: &str) {
        let labels = ClusterLabels::new(namespace, name);
        self.desired_members.remove(&labels);
        self.ready_members.remove(&labels);
    }

    pub fn record_maintenance(&self, kind: MaintenanceKind) {
        let labels = MaintenanceLabels {
            kind: kind.slug().to_string(),
        };
        self.maintenance_submitted.get_or_create(&labels).inc();
    }

    fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

/// State shared between the controller and the probe server
#[derive(Default)]
pub struct HealthState {
    ready: AtomicBool,
    pub metrics: Metrics,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], body),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                String::new(),
            )
        }
    }
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve probes and metrics until the listener fails
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Health server listening");
    axum::serve(listener, create_router(state)).await
}
