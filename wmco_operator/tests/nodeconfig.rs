//! Pipeline tests against the in-memory transport.

mod common;

use common::{FakeHost, Op};

use wmco_definitions::{
    constants::{K_DIR, REGISTRY_CONF_DIR, TLS_DIR},
    network::NetworkSettings,
    platform::Platform,
    proxy::ProxySettings,
    services::{ServicesContext, ServicesData},
};
use wmco_operator::cluster::ClusterInfo;
use wmco_operator::nodeconfig::{configure_host, deconfigure_host, host_payloads};

fn cluster_info() -> ClusterInfo {
    ClusterInfo {
        platform: Platform::Aws,
        network: NetworkSettings::new(&["172.30.0.0/16".to_string()], Some(4800)).unwrap(),
        api_server_endpoint: "https://api-int.cluster.example:6443".into(),
        ccm_owned: true,
        proxy: ProxySettings::default(),
        version: "8.1.0".into(),
    }
}

fn services(info: &ClusterInfo) -> ServicesData {
    ServicesData::generate(&ServicesContext {
        version: info.version.clone(),
        platform: info.platform.clone(),
        network: info.network.clone(),
        proxy: info.proxy.clone(),
        api_server_endpoint: info.api_server_endpoint.clone(),
        ccm_owned: info.ccm_owned,
    })
}

#[tokio::test]
async fn configure_uploads_bootstraps_then_installs_in_order() {
    let info = cluster_info();
    let data = services(&info);
    let payloads = host_payloads(&info, Some(b"ca material"));
    let host = FakeHost::new("winhost-5");

    configure_host(&host, &data, &payloads, "10.0.0.5", "winhost-5")
        .await
        .unwrap();

    let ops = host.ops();
    let pos = |op: &Op| ops.iter().position(|o| o == op).unwrap();

    // all manifest files land, including the CA payload
    for file in &data.files {
        assert!(
            ops.contains(&Op::Upload(file.path.clone())),
            "missing upload of {}",
            file.path
        );
    }

    // bootstrap runs after files, before any service install
    let bootstrap = pos(&Op::Run(data.bootstrap_command.clone()));
    let last_upload = ops
        .iter()
        .enumerate()
        .filter(|(_, o)| matches!(o, Op::Upload(_)))
        .map(|(i, _)| i)
        .max()
        .unwrap();
    assert!(last_upload < bootstrap);

    let install = |name: &str| pos(&Op::Install(name.to_string()));
    assert!(bootstrap < install("containerd"));
    assert!(install("containerd") < install("kubelet"));
    assert!(install("kubelet") < install("hybrid-overlay-node"));
    assert!(install("hybrid-overlay-node") < install("kube-proxy"));

    // every service installed is also started, and starts follow installs
    let first_start = ops
        .iter()
        .position(|o| matches!(o, Op::Start(_)))
        .unwrap();
    let last_install = ops
        .iter()
        .enumerate()
        .filter(|(_, o)| matches!(o, Op::Install(_)))
        .map(|(i, _)| i)
        .max()
        .unwrap();
    assert!(last_install < first_start);
    for svc in &data.services {
        assert!(ops.contains(&Op::Start(svc.name.clone())));
    }

    // exporter port opened before anything starts serving
    let firewall = ops
        .iter()
        .position(|o| matches!(o, Op::Run(cmd) if cmd.contains("New-NetFirewallRule")))
        .unwrap();
    assert!(firewall < first_start);
}

#[tokio::test]
async fn deconfigure_stops_in_reverse_order_and_cleans_disk() {
    let info = cluster_info();
    let data = services(&info);
    let names: Vec<&str> = data.services.iter().map(|s| s.name.as_str()).collect();
    let host = FakeHost::with_services("winhost-5", &names);

    deconfigure_host(&host, &data).await.unwrap();

    let ops = host.ops();
    let stop = |name: &str| {
        ops.iter()
            .position(|o| *o == Op::Stop(name.to_string()))
            .unwrap()
    };
    // reverse dependency order: dependents stop before their dependencies
    assert!(stop("kube-proxy") < stop("hybrid-overlay-node"));
    assert!(stop("hybrid-overlay-node") < stop("kubelet"));
    assert!(stop("kubelet") < stop("containerd"));

    for svc in &data.services {
        assert!(ops.contains(&Op::DeleteService(svc.name.clone())));
    }
    for dir in &[REGISTRY_CONF_DIR, TLS_DIR, K_DIR] {
        assert!(ops.contains(&Op::Remove(dir.to_string())));
    }
    assert!(ops
        .iter()
        .any(|o| matches!(o, Op::Run(cmd) if cmd.contains("Remove-NetFirewallRule"))));
    assert!(host.services.lock().unwrap().is_empty());
}

#[tokio::test]
async fn deconfigure_skips_services_that_were_never_installed() {
    let info = cluster_info();
    let data = services(&info);
    // only two services present; the rest must not be stopped or deleted
    let host = FakeHost::with_services("winhost-5", &["containerd", "kubelet"]);

    deconfigure_host(&host, &data).await.unwrap();

    let ops = host.ops();
    assert!(ops.contains(&Op::Stop("kubelet".to_string())));
    assert!(ops.contains(&Op::Stop("containerd".to_string())));
    assert!(!ops.contains(&Op::Stop("kube-proxy".to_string())));
    assert!(!ops.contains(&Op::DeleteService("windows_exporter".to_string())));
}
