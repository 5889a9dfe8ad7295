//! Typed shims for the external objects the operator consumes.
//!
//! Only the fields the core reads are modeled; everything else passes through
//! the apiserver untouched. None of these are owned by the operator, so no
//! schema generation is wired up.

use k8s_openapi::{
    api::core::v1::{NodeAddress, ObjectReference},
    apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector},
};
use kube::CustomResource;

/// Machine phase signalling the instance exists but is not yet a node
pub const PHASE_PROVISIONED: &str = "Provisioned";

/// Machine phase signalling the instance joined the cluster
pub const PHASE_RUNNING: &str = "Running";

/// Condition type on the cloud-controller-manager cluster operator
pub const CCM_OWNER_CONDITION: &str = "CloudControllerOwner";

/// A compute host managed by the cluster machine lifecycle facility.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced,
    status = "MachineStatus",
    schema = "disabled"
)]
pub struct MachineSpec {
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct MachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, rename = "nodeRef", skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<NodeAddress>>,
}

impl Machine {
    pub fn phase(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.phase.as_deref())
    }

    pub fn node_ref_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.node_ref.as_ref())
            .and_then(|r| r.name.as_deref())
    }

    /// First InternalIP address reported for the machine
    pub fn internal_address(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.addresses.as_ref())
            .and_then(|addrs| {
                addrs
                    .iter()
                    .find(|a| a.type_ == "InternalIP")
                    .map(|a| a.address.as_str())
            })
    }

    /// Cloud instance id: the last `/` separated segment of the provider id
    pub fn instance_id(&self) -> Option<&str> {
        self.spec
            .provider_id
            .as_deref()
            .and_then(|p| p.rsplit('/').next())
            .filter(|id| !id.is_empty())
    }
}

/// Scaling group owning a set of Machines.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "MachineSet",
    namespaced,
    status = "MachineSetStatus",
    schema = "disabled"
)]
pub struct MachineSetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub selector: LabelSelector,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct MachineSetStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(
        default,
        rename = "readyReplicas",
        skip_serializing_if = "Option::is_none"
    )]
    pub ready_replicas: Option<i32>,
}

/// Cluster infrastructure singleton (`cluster`).
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "Infrastructure",
    status = "InfrastructureStatus",
    schema = "disabled"
)]
pub struct InfrastructureSpec {}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct InfrastructureStatus {
    #[serde(
        default,
        rename = "platformStatus",
        skip_serializing_if = "Option::is_none"
    )]
    pub platform_status: Option<PlatformStatus>,
    #[serde(
        default,
        rename = "apiServerInternalURI",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_server_internal_uri: Option<String>,
    #[serde(
        default,
        rename = "apiServerURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_server_url: Option<String>,
    #[serde(
        default,
        rename = "infrastructureName",
        skip_serializing_if = "Option::is_none"
    )]
    pub infrastructure_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PlatformStatus {
    #[serde(default, rename = "type")]
    pub type_: String,
}

/// Cluster network configuration (`config.openshift.io` flavour).
pub mod config_network {
    use kube::CustomResource;

    #[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
    #[kube(
        group = "config.openshift.io",
        version = "v1",
        kind = "Network",
        schema = "disabled"
    )]
    pub struct NetworkSpec {
        #[serde(default, rename = "networkType")]
        pub network_type: String,
        #[serde(default, rename = "serviceNetwork")]
        pub service_network: Vec<String>,
    }
}

/// Cluster network operator configuration (`operator.openshift.io` flavour),
/// which carries the hybrid overlay stanza.
pub mod operator_network {
    use kube::CustomResource;

    #[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
    #[kube(
        group = "operator.openshift.io",
        version = "v1",
        kind = "Network",
        schema = "disabled"
    )]
    pub struct NetworkSpec {
        #[serde(
            default,
            rename = "defaultNetwork",
            skip_serializing_if = "Option::is_none"
        )]
        pub default_network: Option<DefaultNetworkDefinition>,
    }

    #[derive(Serialize, Deserialize, Clone, Debug, Default)]
    pub struct DefaultNetworkDefinition {
        #[serde(default, rename = "type")]
        pub type_: String,
        #[serde(
            default,
            rename = "ovnKubernetesConfig",
            skip_serializing_if = "Option::is_none"
        )]
        pub ovn_kubernetes_config: Option<OvnKubernetesConfig>,
    }

    #[derive(Serialize, Deserialize, Clone, Debug, Default)]
    pub struct OvnKubernetesConfig {
        #[serde(
            default,
            rename = "hybridOverlayConfig",
            skip_serializing_if = "Option::is_none"
        )]
        pub hybrid_overlay_config: Option<HybridOverlayConfig>,
    }

    #[derive(Serialize, Deserialize, Clone, Debug, Default)]
    pub struct HybridOverlayConfig {
        #[serde(default, rename = "hybridClusterNetwork")]
        pub hybrid_cluster_network: Vec<ClusterNetworkEntry>,
        #[serde(
            default,
            rename = "hybridOverlayVXLANPort",
            skip_serializing_if = "Option::is_none"
        )]
        pub hybrid_overlay_vxlan_port: Option<u16>,
    }

    #[derive(Serialize, Deserialize, Clone, Debug, Default)]
    pub struct ClusterNetworkEntry {
        #[serde(default)]
        pub cidr: String,
        #[serde(default, rename = "hostPrefix", skip_serializing_if = "Option::is_none")]
        pub host_prefix: Option<u32>,
    }
}

/// Cluster operator status objects (read-only to us).
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "ClusterOperator",
    status = "ClusterOperatorStatus",
    schema = "disabled"
)]
pub struct ClusterOperatorSpec {}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ClusterOperatorStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<OperatorStatusCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct OperatorStatusCondition {
    #[serde(default, rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub status: String,
}

impl ClusterOperator {
    /// Whether a condition of the given type is present with status True
    pub fn condition_true(&self, condition_type: &str) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.type_ == condition_type && c.status == "True")
            })
            .unwrap_or(false)
    }
}

/// Machine config controller configuration; carries the kube-apiserver
/// serving CA bundle every kubelet must trust.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "machineconfiguration.openshift.io",
    version = "v1",
    kind = "ControllerConfig",
    schema = "disabled"
)]
pub struct ControllerConfigSpec {
    /// base64 of the serving CA bundle
    #[serde(
        default,
        rename = "kubeAPIServerServingCAData",
        skip_serializing_if = "Option::is_none"
    )]
    pub kube_api_server_serving_ca_data: Option<String>,
}

/// Digest source/mirror mapping.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "ImageDigestMirrorSet",
    schema = "disabled"
)]
pub struct ImageDigestMirrorSetSpec {
    #[serde(default, rename = "imageDigestMirrors")]
    pub image_digest_mirrors: Vec<ImageMirrors>,
}

/// Tag source/mirror mapping.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "ImageTagMirrorSet",
    schema = "disabled"
)]
pub struct ImageTagMirrorSetSpec {
    #[serde(default, rename = "imageTagMirrors")]
    pub image_tag_mirrors: Vec<ImageMirrors>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ImageMirrors {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
    #[serde(
        default,
        rename = "mirrorSourcePolicy",
        skip_serializing_if = "Option::is_none"
    )]
    pub mirror_source_policy: Option<String>,
}

/// Operator condition object the upgrade gate publishes to.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default)]
#[kube(
    group = "operators.coreos.com",
    version = "v2",
    kind = "OperatorCondition",
    namespaced,
    status = "OperatorConditionStatus",
    schema = "disabled"
)]
pub struct OperatorConditionSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct OperatorConditionStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Prometheus-operator service monitor (emitted artifact).
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "ServiceMonitor",
    namespaced,
    schema = "disabled"
)]
pub struct ServiceMonitorSpec {
    #[serde(default)]
    pub endpoints: Vec<MonitorEndpoint>,
    #[serde(default)]
    pub selector: LabelSelector,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct MonitorEndpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(
        default,
        rename = "bearerTokenFile",
        skip_serializing_if = "Option::is_none"
    )]
    pub bearer_token_file: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relabelings: Vec<RelabelConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RelabelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    #[serde(
        default,
        rename = "sourceLabels",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub source_labels: Vec<String>,
    #[serde(
        default,
        rename = "targetLabel",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_instance_id_is_last_provider_segment() {
        let mut m = Machine::new("win-abc", MachineSpec::default());
        assert_eq!(m.instance_id(), None);
        m.spec.provider_id = Some("aws:///us-east-1a/i-0123456789abcdef0".into());
        assert_eq!(m.instance_id(), Some("i-0123456789abcdef0"));
    }

    #[test]
    fn machine_internal_address() {
        use k8s_openapi::api::core::v1::NodeAddress;
        let mut m = Machine::new("win-abc", MachineSpec::default());
        m.status = Some(MachineStatus {
            phase: Some(PHASE_PROVISIONED.into()),
            node_ref: None,
            addresses: Some(vec![
                NodeAddress {
                    type_: "ExternalIP".into(),
                    address: "54.1.2.3".into(),
                },
                NodeAddress {
                    type_: "InternalIP".into(),
                    address: "10.0.0.7".into(),
                },
            ]),
        });
        assert_eq!(m.internal_address(), Some("10.0.0.7"));
        assert_eq!(m.phase(), Some("Provisioned"));
    }

    #[test]
    fn cluster_operator_condition_lookup() {
        let mut co = ClusterOperator::new(
            "cloud-controller-manager",
            ClusterOperatorSpec::default(),
        );
        assert!(!co.condition_true(CCM_OWNER_CONDITION));
        co.status = Some(ClusterOperatorStatus {
            conditions: vec![OperatorStatusCondition {
                type_: CCM_OWNER_CONDITION.into(),
                status: "True".into(),
            }],
        });
        assert!(co.condition_true(CCM_OWNER_CONDITION));
    }

    #[test]
    fn network_crds_deserialize() {
        let net: operator_network::Network = serde_json::from_value(serde_json::json!({
            "apiVersion": "operator.openshift.io/v1",
            "kind": "Network",
            "metadata": { "name": "cluster" },
            "spec": {
                "defaultNetwork": {
                    "type": "OVNKubernetes",
                    "ovnKubernetesConfig": {
                        "hybridOverlayConfig": {
                            "hybridClusterNetwork": [
                                { "cidr": "10.132.0.0/14", "hostPrefix": 23 }
                            ],
                            "hybridOverlayVXLANPort": 4800
                        }
                    }
                }
            }
        }))
        .unwrap();
        let overlay = net
            .spec
            .default_network
            .unwrap()
            .ovn_kubernetes_config
            .unwrap()
            .hybrid_overlay_config
            .unwrap();
        assert_eq!(overlay.hybrid_overlay_vxlan_port, Some(4800));
    }
}
