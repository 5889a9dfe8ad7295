//! ConfigMap reconciler: BYOH instances, the versioned services manifest,
//! and the kubelet client CA published by the kube-apiserver operator.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    runtime::{controller::Action, reflector::ObjectRef, watcher::Config, Controller},
    ResourceExt,
};

use super::{error_policy, with_gate, Context, Outcome};
use crate::nodeconfig::{self, base_labels, NodeConfig};
use crate::nodeutil;
use crate::windows::SshConnector;
use crate::{metrics, ErrorKind, Result};
use wmco_definitions::{
    constants::{
        BYOH_LABEL, DESIRED_CONFIG_ANNOTATION, INSTANCES_CONFIGMAP, KUBELET_CLIENT_CA_CONFIGMAP,
        KUBE_APISERVER_OPERATOR_NAMESPACE, SERVICES_CONFIGMAP_PREFIX, USERNAME_ANNOTATION,
    },
    crypto,
    instance::Instance,
    services::{self, ServicesData},
};

pub const NAME: &str = "configmap";

/// Data key of the kubelet client CA ConfigMap
const CA_BUNDLE_KEY: &str = "ca-bundle.crt";

pub async fn run(ctx: Arc<Context>) {
    let own = run_operator_namespace(ctx.clone());
    let ca = run_kubelet_ca(ctx);
    futures::join!(own, ca);
}

/// Instances and services maps in the operator namespace, re-enqueued on
/// Windows node changes (drift correction and services GC).
async fn run_operator_namespace(ctx: Arc<Context>) {
    let cms: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ctx.watch_ns);
    let nodes: Api<Node> = Api::all(ctx.client.clone());
    let ns = ctx.watch_ns.clone();
    Controller::new(cms, Config::default())
        .watches(
            nodes,
            Config::default().labels(&nodeutil::windows_selector()),
            move |_node: Node| {
                vec![
                    ObjectRef::<ConfigMap>::new(INSTANCES_CONFIGMAP).within(&ns),
                    ObjectRef::<ConfigMap>::new(&ServicesData::configmap_name(env!(
                        "CARGO_PKG_VERSION"
                    )))
                    .within(&ns),
                ]
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|r| async move { r.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

/// The kubelet client CA lives in the kube-apiserver operator's namespace;
/// a small dedicated controller pushes updates to every host's trust store.
async fn run_kubelet_ca(ctx: Arc<Context>) {
    let cms: Api<ConfigMap> =
        Api::namespaced(ctx.client.clone(), KUBE_APISERVER_OPERATOR_NAMESPACE);
    Controller::new(
        cms,
        Config::default().fields(&format!("metadata.name={}", KUBELET_CLIENT_CA_CONFIGMAP)),
    )
    .shutdown_on_signal()
    .run(reconcile_ca, error_policy, ctx)
    .filter_map(|r| async move { r.ok() })
    .for_each(|_| futures::future::ready(()))
    .await;
}

async fn reconcile(cm: Arc<ConfigMap>, ctx: Arc<Context>) -> Result<Action> {
    with_gate(&ctx, NAME, reconcile_inner(cm, ctx.clone())).await
}

async fn reconcile_inner(cm: Arc<ConfigMap>, ctx: Arc<Context>) -> Result<Outcome> {
    let name = cm.name_any();
    if name == INSTANCES_CONFIGMAP {
        return sync_byoh(&ctx).await;
    }
    if name.starts_with(SERVICES_CONFIGMAP_PREFIX) {
        return sync_services(&ctx).await;
    }
    Ok(Outcome::Done)
}

async fn reconcile_ca(cm: Arc<ConfigMap>, ctx: Arc<Context>) -> Result<Action> {
    with_gate(&ctx, NAME, async {
        if cm.name_any() != KUBELET_CLIENT_CA_CONFIGMAP {
            return Ok(Outcome::Done);
        }
        let bundle = match cm.data.as_ref().and_then(|d| d.get(CA_BUNDLE_KEY)) {
            Some(b) => b.clone(),
            None => {
                warn!("{} has no {} key", KUBELET_CLIENT_CA_CONFIGMAP, CA_BUNDLE_KEY);
                return Ok(Outcome::Done);
            }
        };
        ctx.push_kubelet_ca(bundle.as_bytes()).await?;
        Ok(Outcome::Done)
    })
    .await
}

/// Drive the BYOH world to match the instances map.
///
/// Missing instances are configured, nodes with no backing entry are
/// deconfigured, then the exporter endpoints are refreshed.
async fn sync_byoh(ctx: &Context) -> Result<Outcome> {
    // a malformed map is the administrator's to fix; requeueing would just
    // spin, so warn and wait for the next edit
    let instances = match ctx.byoh_instances().await {
        Ok(i) => i,
        Err(e) => {
            if let crate::ErrorKind::InvalidInstanceEntry(..) = e.kind() {
                nodeutil::warn_event(
                    &ctx.client,
                    &ctx.reporter,
                    instances_configmap_reference(&ctx.watch_ns),
                    "InvalidInstancesConfigMap",
                    "Parsing",
                    e.to_string(),
                )
                .await;
                return Ok(Outcome::Done);
            }
            return Err(e);
        }
    };
    let byoh_nodes = nodeutil::byoh_windows_nodes(&ctx.client).await?;

    let signer = ctx.signer().await?;
    let connector = SshConnector::new(&signer)?;
    let services = ctx.expected_services();
    let nc = NodeConfig::new(&ctx.client, &connector, &services, &ctx.info, &signer).await?;

    let desired_config = nodeconfig::desired_machine_config(&ctx.client).await?;
    for instance in &instances {
        let mut labels = base_labels();
        labels.insert(BYOH_LABEL.to_string(), "true".to_string());
        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(
            USERNAME_ANNOTATION.to_string(),
            crypto::encrypt(&instance.username, signer.key_bytes())?,
        );
        if let Some(dc) = &desired_config {
            annotations.insert(DESIRED_CONFIG_ANNOTATION.to_string(), dc.clone());
        }
        nc.configure(instance, labels, annotations).await?;
    }

    for node in crate::instances::orphaned_nodes(&instances, &byoh_nodes) {
        let addr = match nodeutil::internal_ip(node) {
            Some(a) => a,
            None => continue,
        };
        let username = ctx.node_username(node, &signer)?;
        let mut orphan = Instance::new(addr.clone(), addr.parse()?, username);
        orphan.node = Some(node.clone());
        nc.deconfigure(&orphan).await?;
    }

    metrics::sync_endpoints(&ctx.client, &ctx.watch_ns).await?;
    Ok(Outcome::Done)
}

fn instances_configmap_reference(namespace: &str) -> k8s_openapi::api::core::v1::ObjectReference {
    k8s_openapi::api::core::v1::ObjectReference {
        api_version: Some("v1".into()),
        kind: Some("ConfigMap".into()),
        name: Some(INSTANCES_CONFIGMAP.into()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Keep the versioned services maps correct: the current one valid and
/// present, every unreferenced one gone.
async fn sync_services(ctx: &Context) -> Result<Outcome> {
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ctx.watch_ns);
    let expected = ctx.expected_services();
    let current_name = ServicesData::configmap_name(&ctx.info.version);

    match api.get_opt(&current_name).await.map_err(ErrorKind::KubeError)? {
        Some(cm) => {
            let valid = ServicesData::from_configmap(&cm)
                .and_then(|parsed| parsed.validate_against(&expected))
                .is_ok();
            if !valid {
                // delete and let the next pass recreate a clean copy
                warn!("services configmap {} failed validation; recreating", current_name);
                api.delete(&current_name, &DeleteParams::default())
                    .await
                    .map_err(ErrorKind::KubeError)?;
                return Ok(Outcome::Requeue(super::SHORT_REQUEUE));
            }
        }
        None => {
            let cm = expected.to_configmap(&ctx.watch_ns, &ctx.info.version)?;
            api.create(&PostParams::default(), &cm)
                .await
                .map_err(ErrorKind::KubeError)?;
            info!("created services configmap {}", current_name);
        }
    }

    // garbage collect maps for versions no node carries anymore
    let nodes = nodeutil::windows_nodes(&ctx.client).await?;
    let versions = nodeutil::node_version_set(&nodes);
    let existing: Vec<String> = api
        .list(&ListParams::default())
        .await
        .map_err(ErrorKind::KubeError)?
        .items
        .iter()
        .filter_map(|cm| cm.metadata.name.clone())
        .collect();
    for stale in services::stale_configmaps(&existing, &versions, &ctx.info.version) {
        info!("deleting stale services configmap {}", stale);
        match api.delete(&stale, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(ref e) if crate::is_not_found(e) => {}
            Err(e) => return Err(ErrorKind::KubeError(e).into()),
        }
    }
    Ok(Outcome::Done)
}
