#[macro_use]
extern crate log;

use std::env;
use std::process;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, PostParams},
    runtime::events::Reporter,
    Client,
};

use wmco_definitions::{proxy::ProxySettings, services::ServicesData};
use wmco_operator::{
    cluster::ClusterInfo,
    condition::{ConditionPublisher, Gate, OperatorConditionPublisher},
    controllers::{self, Context},
    netutil::DnsResolver,
    rbac, Error, ErrorKind, Result,
};

fn print_error_chain(e: &Error) {
    error!("{}", e);
    for cause in e.iter().skip(1) {
        error!("caused by: {}", cause);
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run().await {
        print_error_chain(&e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // startup validation is deliberately fatal: a misconfigured operator
    // half-managing hosts is worse than no operator
    let watch_ns =
        env::var("WATCH_NAMESPACE").map_err(|_| ErrorKind::MissingEnv("WATCH_NAMESPACE".into()))?;
    let proxy = ProxySettings::from_env();
    if !proxy.is_empty() {
        info!("cluster-wide proxy configured");
    }

    let client = Client::try_default().await.map_err(ErrorKind::KubeError)?;
    let info = ClusterInfo::discover(&client, proxy).await?;
    info!(
        "starting windows machine config operator {} in {}",
        info.version, watch_ns
    );

    rbac::ensure_daemon_rbac(&client, &watch_ns).await?;
    ensure_services_configmap(&client, &watch_ns, &info).await?;

    // OPERATOR_CONDITION_NAME absent disables the upgrade gate entirely
    let publisher: Option<Box<dyn ConditionPublisher>> = match env::var("OPERATOR_CONDITION_NAME")
    {
        Ok(name) if !name.is_empty() => Some(Box::new(OperatorConditionPublisher::new(
            client.clone(),
            &watch_ns,
            &name,
        ))),
        _ => None,
    };
    let gate = Arc::new(Gate::new(publisher));

    let ctx = Arc::new(Context {
        client: client.clone(),
        watch_ns,
        info,
        gate,
        resolver: Arc::new(DnsResolver::from_system()?),
        reporter: Reporter {
            controller: "windows-machine-config-operator".into(),
            instance: env::var("POD_NAME").ok(),
        },
        backoff: Default::default(),
    });

    futures::join!(
        controllers::machine::run(ctx.clone()),
        controllers::configmap::run(ctx.clone()),
        controllers::secret::run(ctx.clone()),
        controllers::node::run(ctx.clone()),
        controllers::csr::run(ctx.clone()),
        controllers::controllerconfig::run(ctx.clone()),
        controllers::registry::run(ctx.clone()),
        controllers::servicemonitor::run(ctx),
    );
    Ok(())
}

/// The versioned services map must exist before any host configures against
/// it; later drift is the configmap reconciler's business.
async fn ensure_services_configmap(
    client: &Client,
    namespace: &str,
    info: &ClusterInfo,
) -> Result<()> {
    use wmco_definitions::services::ServicesContext;
    let expected = ServicesData::generate(&ServicesContext {
        version: info.version.clone(),
        platform: info.platform.clone(),
        network: info.network.clone(),
        proxy: info.proxy.clone(),
        api_server_endpoint: info.api_server_endpoint.clone(),
        ccm_owned: info.ccm_owned,
    });
    let name = ServicesData::configmap_name(&info.version);
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    if api
        .get_opt(&name)
        .await
        .map_err(ErrorKind::KubeError)?
        .is_none()
    {
        let cm = expected.to_configmap(namespace, &info.version)?;
        api.create(&PostParams::default(), &cm)
            .await
            .map_err(ErrorKind::KubeError)?;
        info!("created services configmap {}", name);
    }
    Ok(())
}
