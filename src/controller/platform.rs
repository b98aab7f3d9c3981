//! Platform seam
//!
//! Every read and write the reconciler performs against the cluster goes
//! through [`ClusterPlatform`]. `KubePlatform` talks to the API server; tests
//! substitute an in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::{Api, Client, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::controller::desired::DesiredState;
use crate::controller::error::{Error, Result};
use crate::controller::membership::{ClientTls, MemberClient, client_endpoint};
use crate::controller::observed::{ObservedState, collect};
use crate::crd::{Etcd, EtcdStatus, MaintenanceKind};
use crate::resources::common::{FIELD_MANAGER, FINALIZER, selector};
use crate::resources::configmap::InitialCluster;
use crate::resources::{configmap, job, pdb, service};

/// A single structural write to the member workload
#[derive(Clone, Debug)]
pub enum WorkloadWrite {
    /// Create the workload from scratch
    Create(Box<StatefulSet>),
    /// Change only the member count
    Scale {
        replicas: i32,
        resource_version: Option<String>,
    },
    /// Replace the member template; replicas are carried over unchanged
    Template {
        statefulset: Box<StatefulSet>,
        resource_version: Option<String>,
    },
    /// Move the rolling-update partition
    Partition {
        partition: i32,
        resource_version: Option<String>,
    },
}

/// Operations the reconciler needs from the platform
#[async_trait]
pub trait ClusterPlatform: Send + Sync {
    /// Read the current state of the cluster's managed objects
    async fn observe(&self, etcd: &Etcd) -> Result<ObservedState>;

    /// Write the workload; a stale resource version fails as `Transient`
    async fn apply_workload(&self, etcd: &Etcd, write: WorkloadWrite) -> Result<()>;

    /// Services and disruption budget
    async fn apply_ancillary(&self, etcd: &Etcd) -> Result<()>;

    /// Member configuration; `cluster` names the members a starting member
    /// must find and whether they already form a cluster
    async fn apply_member_config(&self, etcd: &Etcd, cluster: &InitialCluster) -> Result<()>;

    /// Register the member with this ordinal as a non-voting learner
    async fn add_learner(&self, etcd: &Etcd, ordinal: i32) -> Result<()>;

    /// Make a caught-up learner a voting member
    async fn promote_member(&self, etcd: &Etcd, ordinal: i32) -> Result<()>;

    /// Unregister the member; a member that is not registered is not an error
    async fn remove_member(&self, etcd: &Etcd, ordinal: i32) -> Result<()>;

    /// Delete claims by name; claims already gone are not an error
    async fn delete_claims(&self, namespace: &str, names: &[String]) -> Result<()>;

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()>;

    /// Submit a maintenance task and return its name without waiting for it
    async fn submit_task(
        &self,
        etcd: &Etcd,
        desired: &DesiredState,
        kind: MaintenanceKind,
        now: DateTime<Utc>,
    ) -> Result<String>;

    async fn write_status(&self, etcd: &Etcd, status: &EtcdStatus) -> Result<()>;

    async fn add_finalizer(&self, etcd: &Etcd) -> Result<()>;

    async fn remove_finalizer(&self, etcd: &Etcd) -> Result<()>;
}

/// Whether the resource carries the teardown finalizer
pub fn has_finalizer(etcd: &Etcd) -> bool {
    etcd.finalizers().iter().any(|f| f == FINALIZER)
}

/// Kubernetes-backed platform
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<T>(&self, namespace: &str) -> Api<T>
    where
        T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug,
        <T as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Apply a resource using server-side apply
    async fn apply<T>(&self, namespace: &str, resource: &T) -> Result<()>
    where
        T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + serde::Serialize
            + DeserializeOwned
            + Clone
            + std::fmt::Debug,
        <T as kube::Resource>::DynamicType: Default,
    {
        let api: Api<T> = self.api(namespace);
        let name = resource.name_any();
        let params = PatchParams::apply(FIELD_MANAGER).force();

        api.patch(&name, &params, &Patch::Apply(resource))
            .await
            .map_err(classify)?;
        debug!(resource = %name, "applied resource");
        Ok(())
    }

    async fn patch_workload(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<()> {
        let api: Api<StatefulSet> = self.api(namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Membership client for the cluster, with its TLS material when enabled
    async fn member_client(&self, etcd: &Etcd) -> Result<MemberClient> {
        let ns = namespace_of(etcd)?;
        let tls = match etcd.spec.etcd.tls.as_ref() {
            Some(tls) => {
                let secrets: Api<Secret> = self.api(&ns);
                let ca = secret_key(&secrets, &tls.server_secret_ref, "ca.crt").await?;
                let identity = match tls.client_secret_ref.as_deref() {
                    Some(name) => {
                        let mut pem = secret_key(&secrets, name, "tls.crt").await?;
                        pem.push(b'\n');
                        pem.extend(secret_key(&secrets, name, "tls.key").await?);
                        Some(pem)
                    }
                    None => None,
                };
                Some(ClientTls { ca, identity })
            }
            None => None,
        };

        MemberClient::new(&etcd.name_any(), client_endpoint(etcd), tls)
    }
}

async fn secret_key(api: &Api<Secret>, name: &str, key: &str) -> Result<Vec<u8>> {
    let secret = api.get(name).await.map_err(classify)?;
    secret
        .data
        .and_then(|mut data| data.remove(key))
        .map(|bytes| bytes.0)
        .ok_or_else(|| Error::Membership(format!("secret {} has no {}", name, key)))
}

fn namespace_of(etcd: &Etcd) -> Result<String> {
    etcd.namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))
}

/// Map optimistic-concurrency conflicts onto the transient class
fn classify(error: kube::Error) -> Error {
    match error {
        kube::Error::Api(ref response) if response.code == 409 => {
            Error::Transient(format!("write conflict: {}", response.message))
        }
        other => Error::KubeError(other),
    }
}

fn ignore_not_found(result: std::result::Result<(), kube::Error>) -> Result<()> {
    match result {
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        other => other.map_err(classify),
    }
}

#[async_trait]
impl ClusterPlatform for KubePlatform {
    async fn observe(&self, etcd: &Etcd) -> Result<ObservedState> {
        let ns = namespace_of(etcd)?;
        let name = etcd.name_any();
        let lp = ListParams::default().labels(&selector(&name));

        let statefulset = self.api::<StatefulSet>(&ns).get_opt(&name).await?;
        let pods = self.api::<Pod>(&ns).list(&lp).await?;
        let claims = self.api::<PersistentVolumeClaim>(&ns).list(&lp).await?;
        let jobs = self.api::<Job>(&ns).list(&lp).await?;

        let mut observed = collect(
            &name,
            statefulset.as_ref(),
            &pods.items,
            &claims.items,
            &jobs.items,
        );

        // Only a ready member can answer; planning copes with no answer
        if observed.healthy() > 0 {
            let listed = match self.member_client(etcd).await {
                Ok(client) => client.list().await,
                Err(e) => Err(e),
            };
            match listed {
                Ok(membership) => observed.membership = Some(membership),
                Err(e) => warn!(error = %e, "Cannot read the member list"),
            }
        }

        Ok(observed)
    }

    async fn apply_workload(&self, etcd: &Etcd, write: WorkloadWrite) -> Result<()> {
        let ns = namespace_of(etcd)?;
        let name = etcd.name_any();

        match write {
            WorkloadWrite::Create(statefulset) => {
                self.apply(&ns, &*statefulset).await?;
                info!(workload = %name, "created workload");
            }
            WorkloadWrite::Template {
                mut statefulset,
                resource_version,
            } => {
                statefulset.metadata.resource_version = resource_version;
                self.apply(&ns, &*statefulset).await?;
                info!(workload = %name, "updated member template");
            }
            WorkloadWrite::Scale {
                replicas,
                resource_version,
            } => {
                let patch = serde_json::json!({
                    "metadata": { "resourceVersion": resource_version },
                    "spec": { "replicas": replicas }
                });
                self.patch_workload(&ns, &name, patch).await?;
                info!(workload = %name, replicas, "scaled workload");
            }
            WorkloadWrite::Partition {
                partition,
                resource_version,
            } => {
                let patch = serde_json::json!({
                    "metadata": { "resourceVersion": resource_version },
                    "spec": {
                        "updateStrategy": {
                            "type": "RollingUpdate",
                            "rollingUpdate": { "partition": partition }
                        }
                    }
                });
                self.patch_workload(&ns, &name, patch).await?;
                info!(workload = %name, partition, "moved rolling-update partition");
            }
        }

        Ok(())
    }

    async fn apply_ancillary(&self, etcd: &Etcd) -> Result<()> {
        let ns = namespace_of(etcd)?;

        self.apply::<Service>(&ns, &service::generate_peer_service(etcd))
            .await?;
        self.apply::<Service>(&ns, &service::generate_client_service(etcd))
            .await?;
        self.apply::<PodDisruptionBudget>(&ns, &pdb::generate_pdb(etcd))
            .await?;

        Ok(())
    }

    async fn apply_member_config(&self, etcd: &Etcd, cluster: &InitialCluster) -> Result<()> {
        let ns = namespace_of(etcd)?;
        self.apply::<ConfigMap>(&ns, &configmap::generate_config_map(etcd, cluster))
            .await
    }

    async fn add_learner(&self, etcd: &Etcd, ordinal: i32) -> Result<()> {
        let client = self.member_client(etcd).await?;
        let peer_url = configmap::peer_url(etcd, ordinal);
        let id = client.add_learner(&peer_url).await?;
        info!(ordinal, member_id = %format!("{:x}", id), %peer_url, "registered learner");
        Ok(())
    }

    async fn promote_member(&self, etcd: &Etcd, ordinal: i32) -> Result<()> {
        let client = self.member_client(etcd).await?;
        let member = client
            .list()
            .await?
            .member(ordinal)
            .cloned()
            .ok_or_else(|| Error::Membership(format!("member {} is not registered", ordinal)))?;
        if !member.learner {
            return Ok(());
        }
        client.promote(member.id).await?;
        info!(ordinal, member_id = %format!("{:x}", member.id), "promoted learner");
        Ok(())
    }

    async fn remove_member(&self, etcd: &Etcd, ordinal: i32) -> Result<()> {
        let client = self.member_client(etcd).await?;
        let Some(member) = client.list().await?.member(ordinal).cloned() else {
            debug!(ordinal, "member not registered");
            return Ok(());
        };
        client.remove(member.id).await?;
        info!(ordinal, member_id = %format!("{:x}", member.id), "unregistered member");
        Ok(())
    }

    async fn delete_claims(&self, namespace: &str, names: &[String]) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);

        for name in names {
            ignore_not_found(
                api.delete(name, &DeleteParams::default())
                    .await
                    .map(|_| ()),
            )?;
            info!(claim = %name, "deleted volume claim");
        }

        Ok(())
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<StatefulSet> = self.api(namespace);
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };

        ignore_not_found(api.delete(name, &params).await.map(|_| ()))?;
        info!(workload = %name, "deleted workload");
        Ok(())
    }

    async fn submit_task(
        &self,
        etcd: &Etcd,
        desired: &DesiredState,
        kind: MaintenanceKind,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let ns = namespace_of(etcd)?;
        let task = job::generate_job(etcd, desired, kind, now);
        let name = task.name_any();

        let api: Api<Job> = self.api(&ns);
        match api.create(&PostParams::default(), &task).await {
            Ok(_) => {}
            // Same boundary submitted twice after a lost status write
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!(task = %name, "maintenance task already exists");
            }
            Err(e) => return Err(classify(e)),
        }

        info!(task = %name, %kind, "submitted maintenance task");
        Ok(name)
    }

    async fn write_status(&self, etcd: &Etcd, status: &EtcdStatus) -> Result<()> {
        let ns = namespace_of(etcd)?;
        let api: Api<Etcd> = self.api(&ns);
        let patch = serde_json::json!({ "status": status });

        api.patch_status(
            &etcd.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(classify)?;

        debug!("status updated");
        Ok(())
    }

    async fn add_finalizer(&self, etcd: &Etcd) -> Result<()> {
        let ns = namespace_of(etcd)?;
        let api: Api<Etcd> = self.api(&ns);

        let mut finalizers = etcd.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": etcd.resource_version(),
                "finalizers": finalizers
            }
        });

        api.patch(&etcd.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::FinalizerError(e.to_string()))?;

        info!("added finalizer");
        Ok(())
    }

    async fn remove_finalizer(&self, etcd: &Etcd) -> Result<()> {
        let ns = namespace_of(etcd)?;
        let api: Api<Etcd> = self.api(&ns);

        let finalizers: Vec<String> = etcd
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": etcd.resource_version(),
                "finalizers": finalizers
            }
        });

        let result = api
            .patch(&etcd.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ());
        ignore_not_found(result).map_err(|e| Error::FinalizerError(e.to_string()))?;

        info!("removed finalizer");
        Ok(())
    }
}
