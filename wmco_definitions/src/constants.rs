//! Object names, labels, annotations and on-host paths owned by the operator.
//!
//! These are part of the compatibility surface; renaming any of them breaks
//! existing clusters that carry nodes configured by earlier releases.

/// ConfigMap describing bring-your-own-host instances, in the operator namespace
pub const INSTANCES_CONFIGMAP: &str = "windows-instances";

/// Name prefix of the versioned services ConfigMap; the full name is
/// `windows-services-<operator version>`
pub const SERVICES_CONFIGMAP_PREFIX: &str = "windows-services-";

/// Secret holding the generated cloud user-data, in the machine-api namespace
pub const USERDATA_SECRET: &str = "windows-user-data";

/// Namespace owned by the cluster machine lifecycle facility
pub const MACHINE_API_NAMESPACE: &str = "openshift-machine-api";

/// Administrator supplied private key secret, in the operator namespace
pub const PRIVATE_KEY_SECRET: &str = "cloud-private-key";

/// Key within [`PRIVATE_KEY_SECRET`] carrying the key material
pub const PRIVATE_KEY_SECRET_KEY: &str = "private-key.pem";

/// TLS secret for the on-host daemon, in the operator namespace
pub const TLS_SECRET: &str = "windows-instance-config-daemon-tls";

/// Legacy node tracker ConfigMap; may be absent on current clusters
pub const NODE_TRACKER_CONFIGMAP: &str = "wmco-node-tracker";

/// Service account, RoleBinding, ClusterRoleBinding and user prefix of the
/// on-host daemon
pub const DAEMON_NAME: &str = "windows-instance-config-daemon";

/// ConfigMap with the CA used by the kube-apiserver when talking to kubelets
pub const KUBELET_CLIENT_CA_CONFIGMAP: &str = "kube-apiserver-to-kubelet-client-ca";

/// Namespace of the cluster certificate controller publishing the kubelet client CA
pub const KUBE_APISERVER_OPERATOR_NAMESPACE: &str = "openshift-kube-apiserver-operator";

/// Namespace holding the cluster global pull secret
pub const CLUSTER_CONFIG_NAMESPACE: &str = "openshift-config";

/// Name of the cluster global pull secret
pub const PULL_SECRET: &str = "pull-secret";

// ----------------------------------------------------------------------------
// labels

/// Standard kubernetes OS label
pub const OS_LABEL: &str = "kubernetes.io/os";

/// Value of [`OS_LABEL`] on nodes we own
pub const OS_LABEL_VALUE: &str = "windows";

/// Worker role label applied to every configured node
pub const WORKER_LABEL: &str = "node-role.kubernetes.io/worker";

/// Marks a node as bring-your-own-host (no backing Machine object)
pub const BYOH_LABEL: &str = "windowsmachineconfig.openshift.io/byoh";

/// Allows Machine deletion even when in-tree volumes are still attached
pub const UPGRADE_OVERRIDE_LABEL: &str = "windowsmachineconfig.openshift.io/force-upgrade";

/// Label carried by Windows Machines (set by the machine lifecycle facility)
pub const MACHINE_OS_LABEL: &str = "machine.openshift.io/os-id";

/// Value of [`MACHINE_OS_LABEL`] for Windows Machines
pub const MACHINE_OS_LABEL_VALUE: &str = "Windows";

/// Label enabling cluster monitoring on the operator namespace
pub const MONITORING_LABEL: &str = "openshift.io/cluster-monitoring";

// ----------------------------------------------------------------------------
// annotations

/// Operator version that last configured the node
pub const VERSION_ANNOTATION: &str = "windowsmachineconfig.openshift.io/version";

/// Fingerprint of the public key the node was configured with
pub const PUB_KEY_HASH_ANNOTATION: &str = "windowsmachineconfig.openshift.io/pub-key-hash";

/// Encrypted username used to reach the instance
pub const USERNAME_ANNOTATION: &str = "windowsmachineconfig.openshift.io/username";

/// Desired machine config annotation copied from up to date Linux workers
pub const DESIRED_CONFIG_ANNOTATION: &str = "machineconfiguration.openshift.io/desiredConfig";

/// Set once a node's volumes have been migrated to the out-of-tree CSI driver
pub const CSI_MIGRATED_ANNOTATION: &str = "windowsmachineconfig.openshift.io/csi-migrated";

/// Machine annotation present on Machine backed nodes: `<namespace>/<name>`
pub const MACHINE_ANNOTATION: &str = "machine.openshift.io/machine";

/// Token substituted for newlines so encrypted payloads survive JSON patches
pub const WMCO_MARKER: &str = "<wmcoMarker>";

// ----------------------------------------------------------------------------
// CSR identities

/// Signer for kubelet client bootstrap CSRs
pub const KUBELET_BOOTSTRAP_SIGNER: &str = "kubernetes.io/kube-apiserver-client-kubelet";

/// Signer for kubelet serving CSRs
pub const KUBELET_SERVING_SIGNER: &str = "kubernetes.io/kubelet-serving";

/// Signer for api-server client certificates (the daemon identity)
pub const API_SERVER_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

/// Common name prefix of kubelet node users
pub const NODE_USER_PREFIX: &str = "system:node:";

/// Subject prefix the daemon uses when re-authenticating with a certificate
pub const DAEMON_SUBJECT_PREFIX: &str = "system:wicd:";

/// Subject organization required on kubelet CSRs
pub const NODES_GROUP: &str = "system:nodes";

/// Group present on any authenticated requestor
pub const AUTHENTICATED_GROUP: &str = "system:authenticated";

/// Name of the kubelet service on the hosts (restarted on trust changes)
pub const KUBELET_SERVICE: &str = "kubelet";

// ----------------------------------------------------------------------------
// metrics

/// Name of the Service/Endpoints pair scraped by prometheus
pub const METRICS_ENDPOINTS: &str = "windows-exporter";

/// Exporter port on every Windows node
pub const METRICS_PORT: i32 = 9182;

/// Port name within the Endpoints subset
pub const METRICS_PORT_NAME: &str = "metrics";

// ----------------------------------------------------------------------------
// on-host layout
//
// All paths use backslashes and are absolute on the host's system drive.

/// Root of everything the operator places on a host
pub const K_DIR: &str = "C:\\k\\";

/// Directory holding agent binaries
pub const BIN_DIR: &str = "C:\\k\\bin\\";

/// Bootstrap kubeconfig used for the kubelet client CSR
pub const BOOTSTRAP_KUBECONFIG: &str = "C:\\k\\bootstrap-kubeconfig";

/// Kubelet trust store for the kube-apiserver serving CA
pub const KUBELET_CA_FILE: &str = "C:\\k\\kubelet-ca.crt";

/// Directory the daemon's serving certificate pair is pushed to
pub const TLS_DIR: &str = "C:\\k\\tls\\";

/// Directory holding container-runtime mirror and auth configuration
pub const REGISTRY_CONF_DIR: &str = "C:\\k\\containerd\\registries\\";

/// Containerd configuration file
pub const CONTAINERD_CONF: &str = "C:\\k\\containerd\\containerd.conf";

/// Kubelet log directory
pub const LOG_DIR: &str = "C:\\var\\log\\";
