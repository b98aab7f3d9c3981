//! Connection to the Kubernetes cluster the integration tests run against
//!
//! Uses existing kubeconfig (~/.kube/config or KUBECONFIG environment variable).

use kube::{Client, Config};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::CrdError;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Failed to create kube client: {0}")]
    ClientCreation(#[from] kube::Error),

    #[error("Failed to infer config: {0}")]
    InferConfig(#[from] kube::config::InferConfigError),
}

static SHARED_CLUSTER: OnceCell<Arc<SharedTestCluster>> = OnceCell::const_new();

/// The Etcd CRD is applied once per test run
static CRD_INSTALLED: OnceCell<()> = OnceCell::const_new();

/// The cluster shared by every integration test
pub struct SharedTestCluster {
    /// Server version reported on first contact
    pub server_version: String,
}

impl SharedTestCluster {
    /// Connect on first use, then hand out the same instance
    pub async fn get() -> Result<Arc<SharedTestCluster>, ClusterError> {
        SHARED_CLUSTER
            .get_or_try_init(|| async { Self::connect().await.map(Arc::new) })
            .await
            .map(Arc::clone)
    }

    /// A fresh client bound to the current test's runtime
    ///
    /// Clients hold connections tied to the runtime that created them, and
    /// every `#[tokio::test]` brings its own runtime.
    pub async fn new_client(&self) -> Result<Client, ClusterError> {
        let config = Config::infer().await?;
        Ok(Client::try_from(config)?)
    }

    async fn connect() -> Result<Self, ClusterError> {
        let client = Client::try_from(Config::infer().await?)?;
        let version = client.apiserver_version().await?;
        tracing::info!(
            "Connected to Kubernetes cluster: {} {}",
            version.platform,
            version.git_version
        );

        Ok(Self {
            server_version: version.git_version,
        })
    }
}

/// Apply the Etcd CRD and wait until it is served
pub async fn ensure_crd_installed(cluster: &SharedTestCluster) -> Result<(), CrdError> {
    CRD_INSTALLED
        .get_or_try_init(|| async {
            let client = cluster
                .new_client()
                .await
                .map_err(|e| CrdError::Client(e.to_string()))?;
            crate::install_crd(client).await
        })
        .await
        .map(|_| ())
}
