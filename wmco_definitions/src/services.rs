use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::ConfigMap;
use sha2::{Digest, Sha256};

use super::{ErrorKind, Result};
use crate::{
    constants::{
        BIN_DIR, BOOTSTRAP_KUBECONFIG, CONTAINERD_CONF, K_DIR, KUBELET_CA_FILE, LOG_DIR,
        METRICS_PORT, SERVICES_CONFIGMAP_PREFIX,
    },
    network::NetworkSettings,
    platform::Platform,
    proxy::ProxySettings,
};

/// Placeholder substituted with the instance's IPv4 address at install time
pub const NODE_IP_VAR: &str = "{{NODE_IP}}";

/// Placeholder substituted with the instance's hostname at install time
pub const HOSTNAME_VAR: &str = "{{HOSTNAME}}";

/// Key under which the manifest body is stored in the ConfigMap
const MANIFEST_KEY: &str = "manifest.yaml";

/// Key under which the manifest checksum is stored in the ConfigMap
const CHECKSUM_KEY: &str = "checksum";

/// A native service to run on every Windows host.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Service {
    /// Service name as registered with the host's service manager
    pub name: String,
    /// Absolute path of the binary on the host
    pub binary_path: String,
    /// Arguments; may contain [`NODE_IP_VAR`] and [`HOSTNAME_VAR`]
    #[serde(default)]
    pub args: Vec<String>,
    /// Names of services that must be running before this one starts
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Restart delays (seconds) applied on the first, second, ... failure
    #[serde(default)]
    pub recovery_actions: Vec<u32>,
    /// Seconds without failure after which the failure count resets
    #[serde(default)]
    pub recovery_reset_seconds: u32,
    /// Environment variables declared on the service
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl Service {
    /// Full command line, with per-host variables substituted
    pub fn command(&self, node_ip: &str, hostname: &str) -> String {
        let mut parts = vec![self.binary_path.clone()];
        parts.extend(self.args.iter().map(|a| render(a, node_ip, hostname)));
        parts.join(" ")
    }
}

fn render(arg: &str, node_ip: &str, hostname: &str) -> String {
    arg.replace(NODE_IP_VAR, node_ip).replace(HOSTNAME_VAR, hostname)
}

/// A file the operator places on every host.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ServiceFile {
    /// Destination path on the host
    pub path: String,
    /// Name of the payload the content comes from
    pub source: String,
}

/// The versioned manifest of agent services for one operator version.
///
/// Deterministic for a given [`ServicesContext`]; the checksum covers the
/// services, files and bootstrap command so any drift in the stored ConfigMap
/// is detectable without field-by-field comparison.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ServicesData {
    pub services: Vec<Service>,
    pub files: Vec<ServiceFile>,
    /// Command bootstrapping the on-host daemon before any service exists
    pub bootstrap_command: String,
    pub checksum: String,
}

/// Everything the manifest generation depends on.
#[derive(Clone, Debug)]
pub struct ServicesContext {
    pub version: String,
    pub platform: Platform,
    pub network: NetworkSettings,
    pub proxy: ProxySettings,
    /// kube-API server endpoint the kubelet and daemon talk to
    pub api_server_endpoint: String,
    /// Whether the cloud controller manager owns cloud routes
    pub ccm_owned: bool,
}

impl ServicesData {
    /// Name of the ConfigMap carrying the manifest for `version`
    pub fn configmap_name(version: &str) -> String {
        format!("{}{}", SERVICES_CONFIGMAP_PREFIX, version)
    }

    /// Generate the manifest for the given cluster context.
    pub fn generate(ctx: &ServicesContext) -> ServicesData {
        let proxy_env: BTreeMap<String, String> = ctx.proxy.service_env().into_iter().collect();

        let containerd = Service {
            name: "containerd".into(),
            binary_path: format!("{}containerd.exe", BIN_DIR),
            args: vec![
                "--config".into(),
                CONTAINERD_CONF.into(),
                "--log-file".into(),
                format!("{}containerd.log", LOG_DIR),
                "--log-level".into(),
                "info".into(),
                "--run-service".into(),
            ],
            dependencies: vec![],
            recovery_actions: vec![5, 15, 30],
            recovery_reset_seconds: 600,
            env: proxy_env.clone(),
        };

        let mut kubelet_args = vec![
            "--config".into(),
            format!("{}kubelet.conf", K_DIR),
            "--bootstrap-kubeconfig".into(),
            BOOTSTRAP_KUBECONFIG.into(),
            "--kubeconfig".into(),
            format!("{}kubeconfig", K_DIR),
            "--cert-dir".into(),
            format!("{}certs", K_DIR),
            "--client-ca-file".into(),
            KUBELET_CA_FILE.into(),
            "--container-runtime-endpoint".into(),
            "npipe://./pipe/containerd-containerd".into(),
            "--cluster-dns".into(),
            ctx.network.cluster_dns().to_string(),
            "--resolv-conf".into(),
            "".into(),
            "--windows-service".into(),
            "--rotate-server-certificates".into(),
            "--log-file".into(),
            format!("{}kubelet.log", LOG_DIR),
        ];
        if let Some(provider) = ctx.platform.cloud_provider_arg(ctx.ccm_owned) {
            kubelet_args.push("--cloud-provider".into());
            kubelet_args.push(provider.into());
        }
        if ctx.platform.needs_node_ip() {
            kubelet_args.push("--node-ip".into());
            kubelet_args.push(NODE_IP_VAR.into());
        }
        let kubelet = Service {
            name: "kubelet".into(),
            binary_path: format!("{}kubelet.exe", BIN_DIR),
            args: kubelet_args,
            dependencies: vec!["containerd".into()],
            recovery_actions: vec![5, 10, 60],
            recovery_reset_seconds: 600,
            env: proxy_env.clone(),
        };

        let hybrid_overlay = Service {
            name: "hybrid-overlay-node".into(),
            binary_path: format!("{}hybrid-overlay-node.exe", BIN_DIR),
            args: vec![
                "--node".into(),
                HOSTNAME_VAR.into(),
                "--k8s-kubeconfig".into(),
                format!("{}kubeconfig", K_DIR),
                "--windows-service".into(),
                "--hybrid-overlay-vxlan-port".into(),
                ctx.network.vxlan_port().to_string(),
                "--logfile".into(),
                format!("{}hybrid-overlay.log", LOG_DIR),
            ],
            dependencies: vec!["kubelet".into()],
            recovery_actions: vec![5, 15],
            recovery_reset_seconds: 600,
            env: BTreeMap::new(),
        };

        let kube_proxy = Service {
            name: "kube-proxy".into(),
            binary_path: format!("{}kube-proxy.exe", BIN_DIR),
            args: vec![
                "--proxy-mode".into(),
                "kernelspace".into(),
                "--hostname-override".into(),
                HOSTNAME_VAR.into(),
                "--kubeconfig".into(),
                format!("{}kubeconfig", K_DIR),
                "--cluster-cidr".into(),
                ctx.network.service_cidr.to_string(),
                "--feature-gates".into(),
                "WinOverlay=true".into(),
                "--windows-service".into(),
                "--log-file".into(),
                format!("{}kube-proxy.log", LOG_DIR),
            ],
            dependencies: vec!["hybrid-overlay-node".into()],
            recovery_actions: vec![5, 15],
            recovery_reset_seconds: 600,
            env: BTreeMap::new(),
        };

        let csi_proxy = Service {
            name: "csi-proxy".into(),
            binary_path: format!("{}csi-proxy.exe", BIN_DIR),
            args: vec![
                "--windows-service".into(),
                "--log_file".into(),
                format!("{}csi-proxy.log", LOG_DIR),
                "--logtostderr=false".into(),
            ],
            dependencies: vec![],
            recovery_actions: vec![5, 15],
            recovery_reset_seconds: 600,
            env: BTreeMap::new(),
        };

        let exporter = Service {
            name: "windows_exporter".into(),
            binary_path: format!("{}windows_exporter.exe", BIN_DIR),
            args: vec![
                "--web.listen-address".into(),
                format!(":{}", METRICS_PORT),
                "--collectors.enabled".into(),
                "cpu,cs,logical_disk,net,os,service,system,container,memory".into(),
            ],
            dependencies: vec![],
            recovery_actions: vec![10],
            recovery_reset_seconds: 600,
            env: BTreeMap::new(),
        };

        let daemon = Service {
            name: "windows-instance-config-daemon".into(),
            binary_path: format!("{}windows-instance-config-daemon.exe", BIN_DIR),
            args: vec![
                "controller".into(),
                "--windows-service".into(),
                "--log-dir".into(),
                LOG_DIR.into(),
            ],
            dependencies: vec!["kubelet".into()],
            recovery_actions: vec![5, 30],
            recovery_reset_seconds: 600,
            env: proxy_env,
        };

        let services = vec![
            containerd,
            kubelet,
            hybrid_overlay,
            kube_proxy,
            csi_proxy,
            exporter,
            daemon,
        ];

        let files = vec![
            ServiceFile {
                path: format!("{}kubelet.conf", K_DIR),
                source: "kubelet-config".into(),
            },
            ServiceFile {
                path: CONTAINERD_CONF.into(),
                source: "containerd-config".into(),
            },
            ServiceFile {
                path: BOOTSTRAP_KUBECONFIG.into(),
                source: "bootstrap-kubeconfig".into(),
            },
            ServiceFile {
                path: KUBELET_CA_FILE.into(),
                source: "kubelet-ca".into(),
            },
        ];

        let bootstrap_command = format!(
            "{}windows-instance-config-daemon.exe bootstrap --kubeconfig {} --api-server {}",
            BIN_DIR, BOOTSTRAP_KUBECONFIG, ctx.api_server_endpoint
        );

        let mut data = ServicesData {
            services,
            files,
            bootstrap_command,
            checksum: String::new(),
        };
        data.checksum = data.compute_checksum();
        data
    }

    /// Checksum over everything except the checksum field itself
    pub fn compute_checksum(&self) -> String {
        let mut hasher = Sha256::new();
        // json serialization of these fields is deterministic: struct order
        // is fixed and maps are BTreeMaps
        let body = serde_json::to_vec(&(&self.services, &self.files, &self.bootstrap_command))
            .expect("services manifest serializes");
        hasher.update(&body);
        hex::encode(hasher.finalize())
    }

    /// Render the manifest into its ConfigMap form
    pub fn to_configmap(&self, namespace: &str, version: &str) -> Result<ConfigMap> {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(Self::configmap_name(version));
        cm.metadata.namespace = Some(namespace.to_string());
        let mut data = BTreeMap::new();
        data.insert(MANIFEST_KEY.to_string(), serde_yaml::to_string(self)?);
        data.insert(CHECKSUM_KEY.to_string(), self.checksum.clone());
        cm.data = Some(data);
        Ok(cm)
    }

    /// Parse a ConfigMap back into a manifest, verifying its checksum.
    pub fn from_configmap(cm: &ConfigMap) -> Result<ServicesData> {
        let data = cm
            .data
            .as_ref()
            .ok_or_else(|| ErrorKind::InvalidServicesManifest("no data".into()))?;
        let body = data
            .get(MANIFEST_KEY)
            .ok_or_else(|| ErrorKind::InvalidServicesManifest(format!("missing {}", MANIFEST_KEY)))?;
        let declared = data
            .get(CHECKSUM_KEY)
            .ok_or_else(|| ErrorKind::InvalidServicesManifest(format!("missing {}", CHECKSUM_KEY)))?;
        let parsed: ServicesData = serde_yaml::from_str(body)?;
        let actual = parsed.compute_checksum();
        if *declared != actual || parsed.checksum != actual {
            bail!(ErrorKind::InvalidServicesManifest(
                "checksum does not match content".into()
            ));
        }
        Ok(parsed)
    }

    /// Validate a stored manifest against the currently expected one.
    pub fn validate_against(&self, expected: &ServicesData) -> Result<()> {
        if self != expected {
            bail!(ErrorKind::InvalidServicesManifest(
                "stored manifest differs from expected".into()
            ));
        }
        Ok(())
    }

    /// Services in dependency order: every service appears after all of its
    /// dependencies. Stopping uses the reverse of this.
    pub fn install_order(&self) -> Result<Vec<&Service>> {
        let by_name: BTreeMap<&str, &Service> =
            self.services.iter().map(|s| (s.name.as_str(), s)).collect();
        let mut order: Vec<&Service> = vec![];
        let mut done: BTreeSet<&str> = BTreeSet::new();
        let mut in_progress: BTreeSet<&str> = BTreeSet::new();

        fn visit<'a>(
            name: &'a str,
            by_name: &BTreeMap<&'a str, &'a Service>,
            done: &mut BTreeSet<&'a str>,
            in_progress: &mut BTreeSet<&'a str>,
            order: &mut Vec<&'a Service>,
        ) -> Result<()> {
            if done.contains(name) {
                return Ok(());
            }
            if !in_progress.insert(name) {
                bail!(ErrorKind::InvalidServicesManifest(format!(
                    "dependency cycle through '{}'",
                    name
                )));
            }
            let svc = by_name.get(name).ok_or_else(|| {
                ErrorKind::InvalidServicesManifest(format!("unknown dependency '{}'", name))
            })?;
            for dep in &svc.dependencies {
                visit(dep, by_name, done, in_progress, order)?;
            }
            in_progress.remove(name);
            done.insert(name);
            order.push(svc);
            Ok(())
        }

        for s in &self.services {
            visit(&s.name, &by_name, &mut done, &mut in_progress, &mut order)?;
        }
        Ok(order)
    }
}

/// Services ConfigMaps to garbage collect.
///
/// Keeps every ConfigMap whose version suffix is carried by some node's
/// version annotation or matches the operator's own version; everything else
/// with the services prefix goes.
pub fn stale_configmaps(
    existing: &[String],
    node_versions: &BTreeSet<String>,
    operator_version: &str,
) -> Vec<String> {
    let stale: Vec<String> = existing
        .iter()
        .filter(|name| {
            if let Some(suffix) = name.strip_prefix(SERVICES_CONFIGMAP_PREFIX) {
                suffix != operator_version && !node_versions.contains(suffix)
            } else {
                false
            }
        })
        .cloned()
        .collect();
    if !stale.is_empty() {
        debug!("services configmaps with no remaining nodes: {:?}", stale);
    }
    stale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{network::NetworkSettings, platform::Platform, proxy::ProxySettings};
    use std::collections::BTreeSet;

    fn ctx() -> ServicesContext {
        ServicesContext {
            version: "8.1.0".into(),
            platform: Platform::VSphere,
            network: NetworkSettings::new(&["172.30.0.0/16".to_string()], Some(4800)).unwrap(),
            proxy: ProxySettings::default(),
            api_server_endpoint: "https://api-int.cluster.example:6443".into(),
            ccm_owned: true,
        }
    }

    #[test]
    fn generation_is_deterministic() {
        let a = ServicesData::generate(&ctx());
        let b = ServicesData::generate(&ctx());
        assert_eq!(a, b);
        assert_eq!(a.checksum, a.compute_checksum());
    }

    #[test]
    fn node_ip_only_where_needed() {
        let vsphere = ServicesData::generate(&ctx());
        let kubelet = vsphere.services.iter().find(|s| s.name == "kubelet").unwrap();
        assert!(kubelet.args.contains(&NODE_IP_VAR.to_string()));

        let mut aws = ctx();
        aws.platform = Platform::Aws;
        let aws_data = ServicesData::generate(&aws);
        let kubelet = aws_data.services.iter().find(|s| s.name == "kubelet").unwrap();
        assert!(!kubelet.args.contains(&NODE_IP_VAR.to_string()));
    }

    #[test]
    fn proxy_env_reaches_proxied_services_only() {
        let mut c = ctx();
        c.proxy = ProxySettings {
            http_proxy: Some("http://proxy:3128".into()),
            https_proxy: None,
            no_proxy: Some("localhost,.cluster.local".into()),
        };
        let data = ServicesData::generate(&c);
        let by_name = |n: &str| data.services.iter().find(|s| s.name == n).unwrap();
        assert_eq!(
            by_name("kubelet").env.get("HTTP_PROXY").map(String::as_str),
            Some("http://proxy:3128")
        );
        assert_eq!(
            by_name("containerd").env.get("NO_PROXY").map(String::as_str),
            Some("localhost;.cluster.local")
        );
        // services that never talk outside the node carry no proxy env
        assert!(by_name("kube-proxy").env.is_empty());
        assert!(by_name("windows_exporter").env.is_empty());
    }

    #[test]
    fn configmap_roundtrip() {
        let data = ServicesData::generate(&ctx());
        let cm = data.to_configmap("openshift-windows-machine-config-operator", "8.1.0").unwrap();
        assert_eq!(
            cm.metadata.name.as_deref(),
            Some("windows-services-8.1.0")
        );
        let parsed = ServicesData::from_configmap(&cm).unwrap();
        assert_eq!(parsed, data);
        parsed.validate_against(&data).unwrap();
    }

    #[test]
    fn tampered_configmap_rejected() {
        let data = ServicesData::generate(&ctx());
        let mut cm = data.to_configmap("ns", "8.1.0").unwrap();
        let body = cm.data.as_mut().unwrap();
        let tampered = body["manifest.yaml"].replace("kernelspace", "userspace");
        body.insert("manifest.yaml".into(), tampered);
        assert!(ServicesData::from_configmap(&cm).is_err());
    }

    #[test]
    fn install_order_respects_dependencies() {
        let data = ServicesData::generate(&ctx());
        let order: Vec<&str> = data
            .install_order()
            .unwrap()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        let pos = |n: &str| order.iter().position(|s| *s == n).unwrap();
        assert!(pos("containerd") < pos("kubelet"));
        assert!(pos("kubelet") < pos("hybrid-overlay-node"));
        assert!(pos("hybrid-overlay-node") < pos("kube-proxy"));
        assert_eq!(order.len(), data.services.len());
    }

    #[test]
    fn cycle_detected() {
        let mut data = ServicesData::default();
        data.services = vec![
            Service {
                name: "a".into(),
                dependencies: vec!["b".into()],
                ..Default::default()
            },
            Service {
                name: "b".into(),
                dependencies: vec!["a".into()],
                ..Default::default()
            },
        ];
        assert!(data.install_order().is_err());
    }

    #[test]
    fn stale_configmap_selection() {
        // nodes carry v1 and v2, the operator is v2, v0 must go
        let existing = vec![
            "windows-services-v0".to_string(),
            "windows-services-v1".to_string(),
            "windows-services-v2".to_string(),
            "some-other-map".to_string(),
        ];
        let mut versions = BTreeSet::new();
        versions.insert("v1".to_string());
        versions.insert("v2".to_string());
        let stale = stale_configmaps(&existing, &versions, "v2");
        assert_eq!(stale, vec!["windows-services-v0".to_string()]);
    }

    #[test]
    fn command_renders_variables() {
        let data = ServicesData::generate(&ctx());
        let proxy = data.services.iter().find(|s| s.name == "kube-proxy").unwrap();
        let cmd = proxy.command("10.0.0.5", "winhost-5");
        assert!(cmd.contains("--hostname-override winhost-5"));
        assert!(!cmd.contains("{{"));
    }
}
