//! Etcd CRD installation for integration tests
//!
//! The definition is generated from the Rust types, so the tests always run
//! against the schema the operator was built with.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Api, Client, CustomResourceExt};
use std::time::Duration;
use thiserror::Error;

use etcd_operator::crd::Etcd;

#[derive(Error, Debug)]
pub enum CrdError {
    #[error("Failed to create client: {0}")]
    Client(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("CRD establishment timeout")]
    EstablishmentTimeout,

    #[error("Wait error: {0}")]
    WaitError(#[from] kube::runtime::wait::Error),
}

/// Server-side apply the Etcd CRD and wait for it to be established
pub async fn install_crd(client: Client) -> Result<(), CrdError> {
    let crd = Etcd::crd();
    let name = Etcd::crd_name();

    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let params = PatchParams::apply("integration-test").force();

    tracing::info!("Installing {} CRD...", name);
    crds.patch(name, &params, &Patch::Apply(&crd)).await?;

    let establish = await_condition(crds, name, conditions::is_crd_established());
    tokio::time::timeout(Duration::from_secs(30), establish)
        .await
        .map_err(|_| CrdError::EstablishmentTimeout)??;

    tracing::info!("CRD installed and established");
    Ok(())
}
