use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, ObjectReference,
};
use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, Client,
};

use super::{is_not_found, ErrorKind, Result};
use crate::nodeutil::{self, node_ready, windows_nodes};
use wmco_definitions::{
    constants::{METRICS_ENDPOINTS, METRICS_PORT, METRICS_PORT_NAME},
    crds::{MonitorEndpoint, RelabelConfig, ServiceMonitor, ServiceMonitorSpec},
};

/// Kubelet port rewritten by the monitor's relabel rule
const KUBELET_PORT: u16 = 10250;

/// The desired Endpoints subset: one address per Ready Windows node.
fn desired_subsets(nodes: &[k8s_openapi::api::core::v1::Node]) -> Vec<EndpointSubset> {
    let addresses: Vec<EndpointAddress> = nodes
        .iter()
        .filter(|n| node_ready(n))
        .filter_map(|n| {
            let name = n.metadata.name.clone()?;
            let ip = nodeutil::internal_ip(n)?;
            Some(EndpointAddress {
                ip,
                target_ref: Some(ObjectReference {
                    kind: Some("Node".into()),
                    name: Some(name),
                    ..Default::default()
                }),
                ..Default::default()
            })
        })
        .collect();
    if addresses.is_empty() {
        return vec![];
    }
    vec![EndpointSubset {
        addresses: Some(addresses),
        not_ready_addresses: None,
        ports: Some(vec![EndpointPort {
            name: Some(METRICS_PORT_NAME.into()),
            port: METRICS_PORT,
            protocol: Some("TCP".into()),
            ..Default::default()
        }]),
    }]
}

/// Keep the exporter Endpoints equal to the set of Ready Windows nodes.
pub async fn sync_endpoints(client: &Client, namespace: &str) -> Result<()> {
    let nodes = windows_nodes(client).await?;
    let subsets = desired_subsets(&nodes);
    let api: Api<Endpoints> = Api::namespaced(client.clone(), namespace);

    let patch = serde_json::json!({ "subsets": subsets });
    match api
        .patch(
            METRICS_ENDPOINTS,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
    {
        Ok(_) => {}
        Err(ref e) if is_not_found(e) => {
            let mut eps = Endpoints::default();
            eps.metadata.name = Some(METRICS_ENDPOINTS.into());
            eps.metadata.namespace = Some(namespace.into());
            eps.subsets = Some(subsets.clone());
            api.create(&PostParams::default(), &eps)
                .await
                .map_err(ErrorKind::KubeError)?;
        }
        Err(e) => return Err(ErrorKind::KubeError(e).into()),
    }
    debug!(
        "metrics endpoints now track {} address(es)",
        subsets.first().and_then(|s| s.addresses.as_ref()).map(|a| a.len()).unwrap_or(0)
    );
    Ok(())
}

/// The service monitor artifact: scrape the exporter port on Node targets
/// only, rewriting the kubelet port.
pub fn desired_service_monitor(namespace: &str) -> ServiceMonitor {
    let mut monitor = ServiceMonitor::new(
        METRICS_ENDPOINTS,
        ServiceMonitorSpec {
            endpoints: vec![MonitorEndpoint {
                port: Some(METRICS_PORT_NAME.into()),
                scheme: Some("https".into()),
                bearer_token_file: Some(
                    "/var/run/secrets/kubernetes.io/serviceaccount/token".into(),
                ),
                relabelings: vec![
                    RelabelConfig {
                        action: Some("keep".into()),
                        source_labels: vec![
                            "__meta_kubernetes_endpoint_address_target_kind".into(),
                        ],
                        regex: Some("Node".into()),
                        ..Default::default()
                    },
                    RelabelConfig {
                        action: Some("replace".into()),
                        source_labels: vec!["__address__".into()],
                        regex: Some(format!("(.*):{}", KUBELET_PORT)),
                        replacement: Some(format!("$1:{}", METRICS_PORT)),
                        target_label: Some("__address__".into()),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            selector: k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
                match_labels: Some(
                    vec![("name".to_string(), METRICS_ENDPOINTS.to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
        },
    );
    monitor.metadata.namespace = Some(namespace.to_string());
    monitor
}

#[cfg(test)]
mod tests {
    use super::{desired_service_monitor, desired_subsets};
    use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeCondition, NodeStatus};

    fn node(name: &str, ip: &str, ready: bool) -> Node {
        let mut n = Node::default();
        n.metadata.name = Some(name.into());
        n.status = Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: "InternalIP".into(),
                address: ip.into(),
            }]),
            conditions: Some(vec![NodeCondition {
                type_: "Ready".into(),
                status: if ready { "True" } else { "False" }.into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        n
    }

    #[test]
    fn only_ready_nodes_are_listed() {
        let subsets = desired_subsets(&[
            node("winhost-5", "10.0.0.5", true),
            node("winhost-6", "10.0.0.6", false),
        ]);
        assert_eq!(subsets.len(), 1);
        let addrs = subsets[0].addresses.as_ref().unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].ip, "10.0.0.5");
        let target = addrs[0].target_ref.as_ref().unwrap();
        assert_eq!(target.kind.as_deref(), Some("Node"));
        assert_eq!(target.name.as_deref(), Some("winhost-5"));
        let ports = subsets[0].ports.as_ref().unwrap();
        assert_eq!(ports[0].port, 9182);
        assert_eq!(ports[0].name.as_deref(), Some("metrics"));
    }

    #[test]
    fn no_ready_nodes_means_no_subsets() {
        assert!(desired_subsets(&[node("winhost-6", "10.0.0.6", false)]).is_empty());
        assert!(desired_subsets(&[]).is_empty());
    }

    #[test]
    fn monitor_rewrites_kubelet_port() {
        let m = desired_service_monitor("openshift-windows-machine-config-operator");
        let ep = &m.spec.endpoints[0];
        let replace = ep
            .relabelings
            .iter()
            .find(|r| r.action.as_deref() == Some("replace"))
            .unwrap();
        assert_eq!(replace.regex.as_deref(), Some("(.*):10250"));
        assert_eq!(replace.replacement.as_deref(), Some("$1:9182"));
        let keep = ep
            .relabelings
            .iter()
            .find(|r| r.action.as_deref() == Some("keep"))
            .unwrap();
        assert_eq!(keep.regex.as_deref(), Some("Node"));
    }
}
