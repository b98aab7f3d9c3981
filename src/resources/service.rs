//! Service generation for etcd clusters
//!
//! The peer service is headless and publishes members before they are ready,
//! since members must resolve each other to form quorum in the first place.
//! The client service only routes to ready members.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::Etcd;
use crate::resources::common::{
    client_service_name, owner_reference, peer_service_name, standard_labels,
};

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Generate the headless peer service that gives members stable DNS names
pub fn generate_peer_service(etcd: &Etcd) -> Service {
    let name = etcd.name_any();
    let cfg = &etcd.spec.etcd;

    Service {
        metadata: ObjectMeta {
            name: Some(peer_service_name(&name)),
            namespace: etcd.namespace(),
            labels: Some(standard_labels(&name)),
            owner_references: Some(vec![owner_reference(etcd)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(standard_labels(&name)),
            ports: Some(vec![
                port("client", cfg.client_port),
                port("peer", cfg.peer_port),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the client service
pub fn generate_client_service(etcd: &Etcd) -> Service {
    let name = etcd.name_any();

    Service {
        metadata: ObjectMeta {
            name: Some(client_service_name(etcd)),
            namespace: etcd.namespace(),
            labels: Some(standard_labels(&name)),
            owner_references: Some(vec![owner_reference(etcd)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(standard_labels(&name)),
            ports: Some(vec![port("client", etcd.spec.etcd.client_port)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
