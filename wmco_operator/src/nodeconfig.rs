//! Per-host configure/deconfigure pipeline.
//!
//! Everything between "an address and a username" and "a labelled,
//! annotated worker node". The version and public key hash annotations are
//! applied in one patch at the very end; their presence is what makes the
//! next reconcile a no-op.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::{api::ListParams, Api, Client};

use super::{ErrorKind, Result, ResultExt};
use crate::cluster::ClusterInfo;
use crate::nodeutil::{self, patch_node_metadata};
use crate::signer::Signer;
use crate::windows::{commands, Connector, WindowsHost};
use wmco_definitions::{
    constants::{
        KUBELET_CA_FILE, K_DIR, LOG_DIR, METRICS_ENDPOINTS, METRICS_PORT, OS_LABEL,
        OS_LABEL_VALUE, PUB_KEY_HASH_ANNOTATION, REGISTRY_CONF_DIR, TLS_DIR, VERSION_ANNOTATION,
        WORKER_LABEL,
    },
    crds::ControllerConfig,
    instance::Instance,
    services::ServicesData,
};

/// How long we wait for the bootstrapped kubelet to register its node
const NODE_WAIT_INTERVAL: Duration = Duration::from_secs(5);
const NODE_WAIT_ATTEMPTS: u32 = 36;

/// Reconnect budget after a rename reboot
const REBOOT_WAIT_INTERVAL: Duration = Duration::from_secs(15);
const REBOOT_WAIT_ATTEMPTS: u32 = 20;

/// Name of the machine config controller's singleton config object
const MACHINE_CONFIG_CONTROLLER: &str = "machine-config-controller";

/// One configure/deconfigure capable view of the cluster.
///
/// Built per reconcile; the signer (and with it the connector identity) is
/// recreated from the private-key secret on every entry so rotations take
/// effect at the next tick.
pub struct NodeConfig<'a> {
    client: Client,
    connector: &'a dyn Connector,
    services: &'a ServicesData,
    info: &'a ClusterInfo,
    pub_key_hash: String,
    payloads: BTreeMap<String, Vec<u8>>,
}

impl<'a> NodeConfig<'a> {
    pub async fn new(
        client: &Client,
        connector: &'a dyn Connector,
        services: &'a ServicesData,
        info: &'a ClusterInfo,
        signer: &Signer,
    ) -> Result<NodeConfig<'a>> {
        let ca_bundle = kubelet_ca_bundle(client).await?;
        let payloads = host_payloads(info, ca_bundle.as_deref());
        Ok(NodeConfig {
            client: client.clone(),
            connector,
            services,
            info,
            pub_key_hash: signer.pub_key_hash(),
            payloads,
        })
    }

    /// Drive an instance to the configured state.
    ///
    /// Up-to-date instances return without any remote operation. Instances
    /// requiring an upgrade are deconfigured first, then configured from
    /// scratch.
    pub async fn configure(
        &self,
        instance: &Instance,
        labels: BTreeMap<String, String>,
        mut annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        if instance.up_to_date(&self.info.version) {
            debug!(
                "{} already at version {}; nothing to do",
                instance.address, self.info.version
            );
            return Ok(());
        }
        if instance.upgrade_required(&self.info.version) {
            info!(
                "{} is at version {:?}; deconfiguring for upgrade",
                instance.address,
                instance.node_version()
            );
            self.deconfigure(instance).await?;
        }

        let host = self.open_renamed(instance).await?;
        configure_host(
            host.as_ref(),
            self.services,
            &self.payloads,
            &instance.ipv4.to_string(),
            &self.effective_hostname(instance, host.as_ref()).await?,
        )
        .await
        .chain_err(|| format!("failed to configure host {}", instance.address))?;

        let node = self.wait_for_node(instance).await?;
        let node_name = node
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| "registered node has no name".to_string())?;

        // everything lands in one patch; a half-annotated node would look
        // configured to some controllers and unconfigured to others
        annotations.insert(VERSION_ANNOTATION.into(), self.info.version.clone());
        annotations.insert(PUB_KEY_HASH_ANNOTATION.into(), self.pub_key_hash.clone());
        patch_node_metadata(&self.client, node_name, &labels, &annotations).await?;
        info!(
            "configured {} as node {} at version {}",
            instance.address, node_name, self.info.version
        );
        Ok(())
    }

    /// Return the instance to an unmanaged state and drop its node object.
    pub async fn deconfigure(&self, instance: &Instance) -> Result<()> {
        let host = self
            .connector
            .open(&instance.address, &instance.username)
            .await?;
        deconfigure_host(host.as_ref(), self.services)
            .await
            .chain_err(|| format!("failed to deconfigure host {}", instance.address))?;
        if let Some(name) = instance.node_name() {
            nodeutil::delete_node(&self.client, name).await?;
        }
        info!("deconfigured {}", instance.address);
        Ok(())
    }

    /// Open a session, renaming the host first when requested.
    async fn open_renamed(&self, instance: &Instance) -> Result<Box<dyn WindowsHost>> {
        let host = self
            .connector
            .open(&instance.address, &instance.username)
            .await?;
        let desired = match &instance.new_hostname {
            Some(h) => h.clone(),
            None => return Ok(host),
        };
        let current = host.hostname().await?;
        if current.eq_ignore_ascii_case(&desired) {
            return Ok(host);
        }
        host.rename(&desired).await?;
        // the rename reboots the host; wait for it to come back
        for attempt in 1..=REBOOT_WAIT_ATTEMPTS {
            tokio::time::sleep(REBOOT_WAIT_INTERVAL).await;
            match self
                .connector
                .open(&instance.address, &instance.username)
                .await
            {
                Ok(h) => return Ok(h),
                Err(e) => debug!(
                    "waiting for {} to reboot ({}/{}): {}",
                    instance.address, attempt, REBOOT_WAIT_ATTEMPTS, e
                ),
            }
        }
        bail!(ErrorKind::Timeout(format!(
            "{} to return after rename",
            instance.address
        )))
    }

    async fn effective_hostname(
        &self,
        instance: &Instance,
        host: &dyn WindowsHost,
    ) -> Result<String> {
        if let Some(h) = &instance.new_hostname {
            return Ok(h.clone());
        }
        host.hostname().await
    }

    /// Wait for the kubelet to register a node for this instance.
    async fn wait_for_node(&self, instance: &Instance) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(&nodeutil::windows_selector());
        let wanted_ip = instance.ipv4.to_string();
        for _ in 0..NODE_WAIT_ATTEMPTS {
            let nodes = api.list(&lp).await.map_err(ErrorKind::KubeError)?;
            let found = nodes.items.into_iter().find(|n| {
                nodeutil::internal_ip(n).as_deref() == Some(wanted_ip.as_str())
                    || instance
                        .new_hostname
                        .as_deref()
                        .map(|h| n.metadata.name.as_deref() == Some(h))
                        .unwrap_or(false)
            });
            if let Some(node) = found {
                return Ok(node);
            }
            tokio::time::sleep(NODE_WAIT_INTERVAL).await;
        }
        bail!(ErrorKind::NodeMissing(instance.address.clone()))
    }
}

/// Remote side of configure: files, bootstrap, services.
///
/// Split out from [`NodeConfig`] so it can run against any transport.
pub async fn configure_host(
    host: &dyn WindowsHost,
    services: &ServicesData,
    payloads: &BTreeMap<String, Vec<u8>>,
    node_ip: &str,
    hostname: &str,
) -> Result<()> {
    host.run(&commands::ensure_dir(LOG_DIR)).await?;
    for file in &services.files {
        let content = match payloads.get(&file.source) {
            Some(c) => c,
            // payloads missing cluster-optional material (e.g. the CA before
            // the controller config exists) are skipped, not fatal
            None => {
                debug!("no payload for {}; skipping {}", file.source, file.path);
                continue;
            }
        };
        host.upload(&file.path, content).await?;
    }
    host.run(&services.bootstrap_command).await?;
    let order = services.install_order()?;
    for svc in &order {
        host.install_service(svc, node_ip, hostname).await?;
    }
    // prometheus scrapes the exporter directly; the host firewall blocks it
    // by default
    host.run(&commands::allow_inbound_port(METRICS_ENDPOINTS, METRICS_PORT))
        .await?;
    for svc in &order {
        host.start_service(&svc.name).await?;
    }
    Ok(())
}

/// Remote side of deconfigure: services in reverse order, then files.
pub async fn deconfigure_host(host: &dyn WindowsHost, services: &ServicesData) -> Result<()> {
    let mut order = services.install_order()?;
    order.reverse();
    for svc in &order {
        if host.service_exists(&svc.name).await? {
            host.stop_service(&svc.name).await?;
            host.remove_service(&svc.name).await?;
        }
    }
    host.run(&commands::remove_firewall_rule(METRICS_ENDPOINTS))
        .await?;
    host.remove_path(REGISTRY_CONF_DIR).await?;
    host.remove_path(TLS_DIR).await?;
    host.remove_path(K_DIR).await?;
    Ok(())
}

/// File payloads keyed by [`ServiceFile::source`].
pub fn host_payloads(info: &ClusterInfo, ca_bundle: Option<&[u8]>) -> BTreeMap<String, Vec<u8>> {
    let mut payloads = BTreeMap::new();
    payloads.insert("kubelet-config".to_string(), kubelet_config(info));
    payloads.insert("containerd-config".to_string(), containerd_config());
    payloads.insert(
        "bootstrap-kubeconfig".to_string(),
        bootstrap_kubeconfig(info, ca_bundle),
    );
    if let Some(ca) = ca_bundle {
        payloads.insert("kubelet-ca".to_string(), ca.to_vec());
    }
    payloads
}

/// KubeletConfiguration document for this cluster
fn kubelet_config(info: &ClusterInfo) -> Vec<u8> {
    let doc = serde_json::json!({
        "kind": "KubeletConfiguration",
        "apiVersion": "kubelet.config.k8s.io/v1beta1",
        "clusterDomain": "cluster.local",
        "clusterDNS": [info.network.cluster_dns().to_string()],
        "authentication": {
            "x509": { "clientCAFile": KUBELET_CA_FILE },
            "anonymous": { "enabled": false }
        },
        "serverTLSBootstrap": true,
        "rotateCertificates": true,
        "cgroupsPerQOS": false,
        "enforceNodeAllocatable": [],
        "featureGates": { "WindowsHostNetwork": true }
    });
    serde_json::to_vec_pretty(&doc).expect("kubelet config serializes")
}

fn containerd_config() -> Vec<u8> {
    let mut conf = String::new();
    conf.push_str("version = 2\n\n");
    conf.push_str("[plugins.\"io.containerd.grpc.v1.cri\"]\n");
    conf.push_str("  sandbox_image = \"registry.k8s.io/pause:3.9\"\n\n");
    conf.push_str("[plugins.\"io.containerd.grpc.v1.cri\".registry]\n");
    conf.push_str(&format!(
        "  config_path = \"{}\"\n",
        REGISTRY_CONF_DIR.replace('\\', "\\\\")
    ));
    conf.into_bytes()
}

/// Kubeconfig used solely for the kubelet's client bootstrap CSR
fn bootstrap_kubeconfig(info: &ClusterInfo, ca_bundle: Option<&[u8]>) -> Vec<u8> {
    let mut cluster = serde_json::json!({ "server": info.api_server_endpoint });
    if let Some(ca) = ca_bundle {
        cluster["certificate-authority-data"] = serde_json::json!(base64::encode(ca));
    } else {
        cluster["insecure-skip-tls-verify"] = serde_json::json!(true);
    }
    let doc = serde_json::json!({
        "kind": "Config",
        "apiVersion": "v1",
        "clusters": [ { "name": "local", "cluster": cluster } ],
        "users": [ {
            "name": "kubelet-bootstrap",
            "user": { "tokenFile": format!("{}bootstrap-token", K_DIR) }
        } ],
        "contexts": [ {
            "name": "bootstrap",
            "context": { "cluster": "local", "user": "kubelet-bootstrap" }
        } ],
        "current-context": "bootstrap"
    });
    serde_yaml::to_string(&doc)
        .expect("bootstrap kubeconfig serializes")
        .into_bytes()
}

/// Current kube-apiserver serving CA bundle, absent until the machine config
/// controller publishes one.
pub async fn kubelet_ca_bundle(client: &Client) -> Result<Option<Vec<u8>>> {
    let api: Api<ControllerConfig> = Api::all(client.clone());
    match api.get(MACHINE_CONFIG_CONTROLLER).await {
        Ok(cc) => match cc.spec.kube_api_server_serving_ca_data {
            Some(encoded) => {
                let decoded = base64::decode(&encoded)
                    .chain_err(|| "controller config CA bundle is not valid base64")?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        },
        Err(ref e) if super::is_not_found(e) => Ok(None),
        Err(e) => Err(ErrorKind::KubeError(e).into()),
    }
}

/// Base labels every configured Windows node carries
pub fn base_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(OS_LABEL.to_string(), OS_LABEL_VALUE.to_string());
    labels.insert(WORKER_LABEL.to_string(), String::new());
    labels
}

/// The worker pool's desired machine config, copied onto Windows nodes so
/// the machine config operator treats them as current.
pub async fn desired_machine_config(client: &Client) -> Result<Option<String>> {
    use wmco_definitions::constants::DESIRED_CONFIG_ANNOTATION;
    let api: Api<Node> = Api::all(client.clone());
    let lp = ListParams::default().labels(WORKER_LABEL);
    let nodes = api.list(&lp).await.map_err(ErrorKind::KubeError)?;
    Ok(nodes.items.iter().find_map(|n| {
        let is_linux = n
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(OS_LABEL))
            .map(|v| v == "linux")
            .unwrap_or(false);
        if !is_linux {
            return None;
        }
        n.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(DESIRED_CONFIG_ANNOTATION))
            .cloned()
    }))
}

#[cfg(test)]
mod tests {
    use super::{base_labels, bootstrap_kubeconfig, host_payloads, kubelet_config};
    use crate::cluster::ClusterInfo;
    use wmco_definitions::{
        network::NetworkSettings, platform::Platform, proxy::ProxySettings,
    };

    fn info() -> ClusterInfo {
        ClusterInfo {
            platform: Platform::Aws,
            network: NetworkSettings::new(&["172.30.0.0/16".to_string()], None).unwrap(),
            api_server_endpoint: "https://api-int.cluster.example:6443".into(),
            ccm_owned: true,
            proxy: ProxySettings::default(),
            version: "8.1.0".into(),
        }
    }

    #[test]
    fn kubelet_config_carries_cluster_dns() {
        let doc: serde_json::Value =
            serde_json::from_slice(&kubelet_config(&info())).unwrap();
        assert_eq!(doc["clusterDNS"][0], "172.30.0.10");
        assert_eq!(doc["serverTLSBootstrap"], true);
    }

    #[test]
    fn bootstrap_kubeconfig_embeds_ca_when_present() {
        let with_ca = String::from_utf8(bootstrap_kubeconfig(&info(), Some(b"pem"))).unwrap();
        assert!(with_ca.contains("certificate-authority-data"));
        assert!(with_ca.contains("https://api-int.cluster.example:6443"));
        let without = String::from_utf8(bootstrap_kubeconfig(&info(), None)).unwrap();
        assert!(without.contains("insecure-skip-tls-verify"));
    }

    #[test]
    fn payloads_cover_manifest_sources() {
        let payloads = host_payloads(&info(), Some(b"pem"));
        for source in &[
            "kubelet-config",
            "containerd-config",
            "bootstrap-kubeconfig",
            "kubelet-ca",
        ] {
            assert!(payloads.contains_key(*source), "missing {}", source);
        }
    }

    #[test]
    fn base_labels_mark_windows_workers() {
        let labels = base_labels();
        assert_eq!(labels["kubernetes.io/os"], "windows");
        assert!(labels.contains_key("node-role.kubernetes.io/worker"));
    }
}
