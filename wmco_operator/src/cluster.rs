use kube::{Api, Client};
use semver::Version;

use super::{ErrorKind, Result};
use wmco_definitions::{
    crds::{config_network, operator_network, ClusterOperator, Infrastructure, CCM_OWNER_CONDITION},
    network::NetworkSettings,
    platform::Platform,
    proxy::ProxySettings,
};

/// Singleton name of the cluster config objects
const CLUSTER: &str = "cluster";

/// ClusterOperator owning cloud controller managers
const CCM_CLUSTER_OPERATOR: &str = "cloud-controller-manager";

/// The one network plugin this operator can configure hosts for
const SUPPORTED_NETWORK: &str = "OVNKubernetes";

/// Lowest supported kubernetes minor; the window is `[base, base+1)`
const BASE_KUBE_MAJOR: u64 = 1;
const BASE_KUBE_MINOR: u64 = 27;

/// Everything about the cluster the configure pipeline depends on.
///
/// Discovered once at startup; anything here changing requires an operator
/// restart, which the cluster version operator performs on upgrades anyway.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    pub platform: Platform,
    pub network: NetworkSettings,
    pub api_server_endpoint: String,
    pub ccm_owned: bool,
    pub proxy: ProxySettings,
    /// The operator's own build version
    pub version: String,
}

impl ClusterInfo {
    /// Discover cluster state from the config objects.
    ///
    /// Fails hard on unsupported network plugins or kubernetes versions so
    /// the process refuses to run rather than half-configure hosts.
    pub async fn discover(client: &Client, proxy: ProxySettings) -> Result<ClusterInfo> {
        validate_server_version(client).await?;

        let infra: Api<Infrastructure> = Api::all(client.clone());
        let infra = infra.get(CLUSTER).await.map_err(ErrorKind::KubeError)?;
        let status = infra
            .status
            .as_ref()
            .ok_or_else(|| "infrastructure status not populated".to_string())?;
        let platform = Platform::from_infrastructure(
            &status
                .platform_status
                .as_ref()
                .map(|p| p.type_.clone())
                .unwrap_or_default(),
        )?;
        let api_server_endpoint = status
            .api_server_internal_uri
            .clone()
            .or_else(|| status.api_server_url.clone())
            .ok_or_else(|| "infrastructure status carries no api server endpoint".to_string())?;

        let network = network_settings(client).await?;
        let ccm_owned = ccm_owns_cloud(client).await?;

        let info = ClusterInfo {
            platform,
            network,
            api_server_endpoint,
            ccm_owned,
            proxy,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        info!(
            "cluster: platform={:?} serviceCIDR={} vxlan={} ccmOwned={}",
            info.platform,
            info.network.service_cidr,
            info.network.vxlan_port(),
            info.ccm_owned
        );
        Ok(info)
    }
}

/// Service network and hybrid overlay parameters from the two network objects
async fn network_settings(client: &Client) -> Result<NetworkSettings> {
    let cfg: Api<config_network::Network> = Api::all(client.clone());
    let cfg = cfg.get(CLUSTER).await.map_err(ErrorKind::KubeError)?;
    if cfg.spec.network_type != SUPPORTED_NETWORK {
        bail!(ErrorKind::UnsupportedNetwork(cfg.spec.network_type));
    }

    let op: Api<operator_network::Network> = Api::all(client.clone());
    let op = op.get(CLUSTER).await.map_err(ErrorKind::KubeError)?;
    let overlay = op
        .spec
        .default_network
        .as_ref()
        .and_then(|d| d.ovn_kubernetes_config.as_ref())
        .and_then(|o| o.hybrid_overlay_config.as_ref());
    let overlay = match overlay {
        Some(o) => o,
        None => bail!(ErrorKind::UnsupportedNetwork(
            "OVNKubernetes without hybridOverlayConfig".into()
        )),
    };
    NetworkSettings::new(&cfg.spec.service_network, overlay.hybrid_overlay_vxlan_port)
        .map_err(|e| e.into())
}

/// Whether the cloud controller manager owns the cloud integration
async fn ccm_owns_cloud(client: &Client) -> Result<bool> {
    let cos: Api<ClusterOperator> = Api::all(client.clone());
    match cos.get(CCM_CLUSTER_OPERATOR).await {
        Ok(co) => Ok(co.condition_true(CCM_OWNER_CONDITION)),
        Err(ref e) if super::is_not_found(e) => Ok(false),
        Err(e) => Err(ErrorKind::KubeError(e).into()),
    }
}

/// Require the server's major/minor to fall within the supported window.
async fn validate_server_version(client: &Client) -> Result<()> {
    let v = client
        .apiserver_version()
        .await
        .map_err(ErrorKind::KubeError)?;
    let semversion = Version::parse(v.git_version.trim_start_matches('v'))
        .unwrap_or_else(|_| Version::new(parse_component(&v.major), parse_component(&v.minor), 0));
    if !version_supported(semversion.major, semversion.minor) {
        bail!(ErrorKind::UnsupportedKubeVersion(v.git_version));
    }
    info!("kubernetes server version {} is supported", v.git_version);
    Ok(())
}

// some providers append a '+' to the minor component
fn parse_component(c: &str) -> u64 {
    c.trim_end_matches(|ch: char| !ch.is_ascii_digit())
        .parse()
        .unwrap_or(0)
}

fn version_supported(major: u64, minor: u64) -> bool {
    major == BASE_KUBE_MAJOR && minor == BASE_KUBE_MINOR
}

#[cfg(test)]
mod tests {
    use super::{parse_component, version_supported};

    #[test]
    fn version_window() {
        assert!(version_supported(1, 27));
        assert!(!version_supported(1, 26));
        assert!(!version_supported(1, 28));
        assert!(!version_supported(2, 27));
    }

    #[test]
    fn fuzzy_minor_components() {
        assert_eq!(parse_component("27"), 27);
        assert_eq!(parse_component("27+"), 27);
        assert_eq!(parse_component(""), 0);
    }
}
