pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod webhooks;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, ClusterPlatform, Context, Error, KubePlatform, Result, error_policy, reconcile,
};
pub use crd::Etcd;
pub use health::{HealthState, Metrics};
pub use resources::FINALIZER;
pub use webhooks::{WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WebhookError, run_webhook_server};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    namespace.map_or_else(
        || Api::all(client.clone()),
        |ns| Api::namespaced(client.clone(), ns),
    )
}

/// Run the Etcd controller until its watch stream ends
///
/// Besides the Etcd resources themselves, the member workload, maintenance
/// jobs and ancillary objects are watched through their owner references so
/// that a member becoming ready or a task finishing triggers a pass. Every
/// watch is limited to `config.watch_namespace` when set.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    let scope = config.watch_namespace.clone();
    let namespace = scope.as_deref();
    tracing::info!(
        scope = namespace.unwrap_or("cluster-wide"),
        "Starting Etcd controller"
    );

    if let Some(state) = &health_state {
        state.set_ready(true);
    }

    let platform = Arc::new(KubePlatform::new(client.clone()));
    let ctx = Arc::new(Context::new(platform, config).with_health_state(health_state));
    let watch = WatcherConfig::default().any_semantic();

    Controller::new(scoped_api::<Etcd>(client.clone(), namespace), watch.clone())
        .owns(scoped_api::<StatefulSet>(client.clone(), namespace), watch.clone())
        .owns(scoped_api::<Job>(client.clone(), namespace), watch.clone())
        .owns(scoped_api::<Service>(client.clone(), namespace), watch.clone())
        .owns(scoped_api::<ConfigMap>(client.clone(), namespace), watch.clone())
        .owns(scoped_api::<PodDisruptionBudget>(client, namespace), watch)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => tracing::debug!(name = %obj.name, "Pass finished"),
                // Owned objects can still emit events after their Etcd is gone
                Err(kube::runtime::controller::Error::ReconcilerFailed(err, obj))
                    if err.is_not_found() =>
                {
                    tracing::debug!(name = %obj.name, "Etcd no longer exists");
                }
                Err(e) => tracing::error!(error = ?e, "Controller error"),
            }
        })
        .await;

    tracing::error!("Controller stream ended");
}
