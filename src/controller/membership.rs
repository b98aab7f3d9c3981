//! etcd cluster membership
//!
//! Members never join on their own. The reconciler registers a member as a
//! learner before its pod starts, promotes it to a voter once it has caught
//! up, and unregisters members before their pods go away. Membership is read
//! and changed through the JSON gateway every etcd member serves on its
//! client port (`/v3/cluster/member/*`).

use std::time::Duration;

use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::controller::observed::ObservedState;
use crate::crd::Etcd;
use crate::resources::common::{client_service_name, pod_ordinal};
use crate::resources::configmap::InitialCluster;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One registered member
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterMember {
    pub id: u64,
    /// Empty until the member has started once
    pub name: String,
    pub ordinal: Option<i32>,
    pub learner: bool,
}

/// The member list as etcd reports it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Membership {
    pub cluster_id: Option<String>,
    pub members: Vec<ClusterMember>,
}

impl Membership {
    pub fn member(&self, ordinal: i32) -> Option<&ClusterMember> {
        self.members.iter().find(|m| m.ordinal == Some(ordinal))
    }

    pub fn is_registered(&self, ordinal: i32) -> bool {
        self.member(ordinal).is_some()
    }

    /// Lowest learner among ordinals below `limit`
    pub fn pending_learner(&self, limit: i32) -> Option<i32> {
        self.members
            .iter()
            .filter(|m| m.learner)
            .filter_map(|m| m.ordinal)
            .filter(|o| *o < limit)
            .min()
    }

    /// Registered ordinals at or above `limit`, highest first, except `keep`
    pub fn beyond(&self, limit: i32, keep: Option<i32>) -> Vec<i32> {
        let mut ordinals: Vec<i32> = self
            .members
            .iter()
            .filter_map(|m| m.ordinal)
            .filter(|o| *o >= limit && Some(*o) != keep)
            .collect();
        ordinals.sort_unstable_by(|a, b| b.cmp(a));
        ordinals.dedup();
        ordinals
    }
}

/// Configuration a member starting without data must see
///
/// Until the cluster has bootstrapped, member 0 forms it alone. Afterwards
/// every member joins the existing cluster made of the workload's members.
pub fn initial_cluster(observed: &ObservedState, known_cluster: Option<&str>) -> InitialCluster {
    let bootstrapped = known_cluster.is_some()
        || observed
            .membership
            .as_ref()
            .is_some_and(|m| !m.members.is_empty())
        || observed.healthy() > 0;

    if bootstrapped {
        InitialCluster::existing(observed.workload_replicas())
    } else {
        InitialCluster::bootstrap()
    }
}

/// Client endpoint of the cluster, routed to ready members only
pub fn client_endpoint(etcd: &Etcd) -> String {
    let cfg = &etcd.spec.etcd;
    let scheme = if cfg.tls.is_some() { "https" } else { "http" };
    format!(
        "{}://{}.{}.svc:{}",
        scheme,
        client_service_name(etcd),
        etcd.namespace().unwrap_or_else(|| "default".to_string()),
        cfg.client_port
    )
}

/// PEM material for talking to a TLS client listener
#[derive(Clone, Debug, Default)]
pub struct ClientTls {
    pub ca: Vec<u8>,
    /// Certificate followed by its private key
    pub identity: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(u64),
}

impl WireId {
    fn value(&self) -> Option<u64> {
        match self {
            WireId::Text(text) => text.parse().ok(),
            WireId::Number(n) => Some(*n),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseHeader {
    #[serde(default)]
    cluster_id: Option<WireId>,
}

#[derive(Debug, Deserialize)]
struct WireMember {
    #[serde(rename = "ID")]
    id: WireId,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "peerURLs")]
    peer_urls: Vec<String>,
    #[serde(default, rename = "isLearner")]
    is_learner: bool,
}

#[derive(Debug, Deserialize)]
struct MemberListResponse {
    #[serde(default)]
    header: Option<ResponseHeader>,
    #[serde(default)]
    members: Vec<WireMember>,
}

#[derive(Debug, Deserialize)]
struct MemberAddResponse {
    member: Option<WireMember>,
}

#[derive(Debug, Deserialize)]
struct GatewayError {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
struct MemberAddRequest<'a> {
    #[serde(rename = "peerURLs")]
    peer_urls: [&'a str; 1],
    #[serde(rename = "isLearner")]
    is_learner: bool,
}

#[derive(Serialize)]
struct MemberIdRequest {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Serialize)]
struct Empty {}

fn member_ordinal(cluster: &str, member: &WireMember) -> Option<i32> {
    pod_ordinal(cluster, &member.name).or_else(|| {
        member.peer_urls.iter().find_map(|url| {
            let host = url.split("://").nth(1)?;
            let pod = host.split(['.', ':']).next()?;
            pod_ordinal(cluster, pod)
        })
    })
}

/// Decode a member list response of the cluster `cluster`
pub fn parse_member_list(cluster: &str, body: &[u8]) -> Result<Membership> {
    let response: MemberListResponse = serde_json::from_slice(body)
        .map_err(|e| Error::Membership(format!("unreadable member list: {}", e)))?;

    let members = response
        .members
        .iter()
        .map(|m| {
            let id = m
                .id
                .value()
                .ok_or_else(|| Error::Membership(format!("member id {:?} is not a number", m.id)))?;
            Ok(ClusterMember {
                id,
                name: m.name.clone(),
                ordinal: member_ordinal(cluster, m),
                learner: m.is_learner,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Membership {
        cluster_id: response
            .header
            .and_then(|h| h.cluster_id)
            .and_then(|id| id.value())
            .map(|id| format!("{:x}", id)),
        members,
    })
}

fn membership_error(e: reqwest::Error) -> Error {
    Error::Membership(e.to_string())
}

/// Membership API of one cluster
pub struct MemberClient {
    http: reqwest::Client,
    endpoint: String,
    cluster: String,
}

impl MemberClient {
    pub fn new(cluster: &str, endpoint: String, tls: Option<ClientTls>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .use_rustls_tls();

        if let Some(tls) = tls {
            let ca = reqwest::Certificate::from_pem(&tls.ca).map_err(membership_error)?;
            builder = builder.add_root_certificate(ca);
            if let Some(identity) = tls.identity {
                let identity = reqwest::Identity::from_pem(&identity).map_err(membership_error)?;
                builder = builder.identity(identity);
            }
        }

        Ok(Self {
            http: builder.build().map_err(membership_error)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            cluster: cluster.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn list(&self) -> Result<Membership> {
        let body = self.post("list", &Empty {}).await?;
        parse_member_list(&self.cluster, &body)
    }

    /// Register a non-voting member and return its id
    pub async fn add_learner(&self, peer_url: &str) -> Result<u64> {
        let request = MemberAddRequest {
            peer_urls: [peer_url],
            is_learner: true,
        };
        let response: MemberAddResponse = self.call("add", &request).await?;
        response
            .member
            .and_then(|m| m.id.value())
            .ok_or_else(|| Error::Membership("member add returned no member id".to_string()))
    }

    /// Turn a caught-up learner into a voter
    pub async fn promote(&self, id: u64) -> Result<()> {
        let _: serde_json::Value = self.call("promote", &MemberIdRequest { id: id.to_string() }).await?;
        Ok(())
    }

    pub async fn remove(&self, id: u64) -> Result<()> {
        let _: serde_json::Value = self.call("remove", &MemberIdRequest { id: id.to_string() }).await?;
        Ok(())
    }

    async fn call<B, T>(&self, operation: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let bytes = self.post(operation, body).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Membership(format!("unreadable member {} response: {}", operation, e)))
    }

    async fn post<B>(&self, operation: &str, body: &B) -> Result<Vec<u8>>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}/v3/cluster/member/{}", self.endpoint, operation);
        debug!(%url, "membership request");

        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(membership_error)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(membership_error)?;
        if !status.is_success() {
            let message = serde_json::from_slice::<GatewayError>(&bytes)
                .ok()
                .and_then(|e| e.message.or(e.error))
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).into_owned());
            return Err(Error::Membership(format!(
                "member {} failed with {}: {}",
                operation, status, message
            )));
        }

        Ok(bytes.to_vec())
    }
}
