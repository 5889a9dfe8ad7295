//! Machine reconciler: drives cloud provisioned Windows hosts.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, DeleteParams, ListParams},
    runtime::{controller::Action, reflector::ObjectRef, watcher::Config, Controller},
    Resource, ResourceExt,
};

use super::{error_policy, with_gate, Context, Outcome, POLICY_REQUEUE, SHORT_REQUEUE};
use crate::nodeconfig::{base_labels, NodeConfig};
use crate::nodeutil::{self, warn_event};
use crate::windows::SshConnector;
use crate::{metrics, ErrorKind, Error, Result};
use wmco_definitions::{
    constants::{
        CSI_MIGRATED_ANNOTATION, MACHINE_ANNOTATION, MACHINE_API_NAMESPACE, MACHINE_OS_LABEL,
        MACHINE_OS_LABEL_VALUE, UPGRADE_OVERRIDE_LABEL, USERDATA_SECRET,
    },
    crds::{Machine, MachineSet, PHASE_PROVISIONED, PHASE_RUNNING},
    instance::{node_annotation, Instance},
    platform::Platform,
    userdata,
};

pub const NAME: &str = "machine";

/// Maximum simultaneously unhealthy members tolerated in a MachineSet
/// before we refuse to delete another one
const MAX_UNHEALTHY: i32 = 1;

const SETUP_FAILURE_REASON: &str = "MachineSetupFailure";

fn machine_selector() -> String {
    format!("{}={}", MACHINE_OS_LABEL, MACHINE_OS_LABEL_VALUE)
}

pub async fn run(ctx: Arc<Context>) {
    let machines: Api<Machine> = Api::namespaced(ctx.client.clone(), MACHINE_API_NAMESPACE);
    let nodes: Api<Node> = Api::all(ctx.client.clone());
    Controller::new(machines, Config::default().labels(&machine_selector()))
        .watches(
            nodes,
            Config::default().labels(&nodeutil::windows_selector()),
            |node: Node| {
                // nodes point back at their machine via annotation
                node_annotation(&node, MACHINE_ANNOTATION)
                    .and_then(|v| {
                        let mut parts = v.splitn(2, '/');
                        let ns = parts.next()?.to_string();
                        let name = parts.next()?.to_string();
                        Some(ObjectRef::<Machine>::new(&name).within(&ns))
                    })
                    .into_iter()
                    .collect::<Vec<_>>()
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|r| async move { r.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn reconcile(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action> {
    with_gate(&ctx, NAME, reconcile_inner(machine, ctx.clone())).await
}

async fn reconcile_inner(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Outcome> {
    let name = machine.name_any();
    match machine.phase() {
        Some(PHASE_RUNNING) => running(&machine, &ctx).await,
        Some(PHASE_PROVISIONED) => provisioned(&machine, &ctx).await,
        phase => {
            debug!("machine {} in phase {:?}; waiting", name, phase);
            Ok(Outcome::Done)
        }
    }
}

/// Running machines are checked for drift against the operator version and
/// the current public key.
async fn running(machine: &Machine, ctx: &Context) -> Result<Outcome> {
    let node_name = match machine.node_ref_name() {
        Some(n) => n.to_string(),
        // the node takes a while to register after the machine reports Running
        None => return Ok(Outcome::Requeue(SHORT_REQUEUE)),
    };
    let nodes: Api<Node> = Api::all(ctx.client.clone());
    let node = match nodes.get_opt(&node_name).await.map_err(ErrorKind::KubeError)? {
        Some(n) => n,
        None => return Ok(Outcome::Requeue(SHORT_REQUEUE)),
    };

    let signer = ctx.signer().await?;
    let version = node_annotation(&node, wmco_definitions::constants::VERSION_ANNOTATION);
    let pubkey = node_annotation(&node, wmco_definitions::constants::PUB_KEY_HASH_ANNOTATION);
    let drifted = match version {
        Some(v) => v != ctx.info.version || pubkey != Some(signer.pub_key_hash().as_str()),
        // no version annotation yet: the configure pass owns this machine
        None => false,
    };
    if drifted {
        return delete_machine(machine, Some(&node), ctx).await;
    }
    metrics::sync_endpoints(&ctx.client, &ctx.watch_ns).await?;
    Ok(Outcome::Done)
}

/// Provisioned machines get the full configure pipeline.
async fn provisioned(machine: &Machine, ctx: &Context) -> Result<Outcome> {
    let signer = ctx.signer().await?;

    // a machine provisioned with stale user-data can never authenticate;
    // make sure the secret is current before investing in a session
    let secrets: kube::Api<k8s_openapi::api::core::v1::Secret> =
        Api::namespaced(ctx.client.clone(), MACHINE_API_NAMESPACE);
    let current = secrets
        .get_opt(USERDATA_SECRET)
        .await
        .map_err(ErrorKind::KubeError)?;
    let authorized = signer.authorized_key()?;
    let valid = current
        .map(|s| userdata::matches(&s, &ctx.info.platform, &authorized))
        .unwrap_or(false);
    if !valid {
        warn!(
            "user-data secret out of date; waiting for the secret reconciler before configuring {}",
            machine.name_any()
        );
        return Ok(Outcome::Requeue(SHORT_REQUEUE));
    }

    let address = match machine.internal_address() {
        Some(a) => a.to_string(),
        None => return Ok(Outcome::Requeue(SHORT_REQUEUE)),
    };
    let instance_id = machine.instance_id().unwrap_or_default().to_string();
    debug!(
        "configuring machine {} (instance {}) at {}",
        machine.name_any(),
        instance_id,
        address
    );

    let mut instance = Instance::new(
        address.clone(),
        address.parse()?,
        ctx.info.platform.default_username().to_string(),
    );
    instance.set_node_ip = ctx.info.platform.needs_node_ip();
    if ctx.info.platform == Platform::VSphere {
        // vSphere guests boot with a generated hostname that will not match
        // the machine name the node is expected to register under
        instance.new_hostname = Some(machine.name_any());
    }

    let connector = SshConnector::new(&signer)?;
    let services = ctx.expected_services();
    let nc = NodeConfig::new(&ctx.client, &connector, &services, &ctx.info, &signer).await?;
    match nc.configure(&instance, base_labels(), Default::default()).await {
        Ok(()) => {
            metrics::sync_endpoints(&ctx.client, &ctx.watch_ns).await?;
            Ok(Outcome::Done)
        }
        Err(Error(ErrorKind::AuthFailure(_), _)) => {
            warn_event(
                &ctx.client,
                &ctx.reporter,
                machine.object_ref(&()),
                SETUP_FAILURE_REASON,
                "Configuring",
                format!(
                    "authentication to {} failed; deleting machine for reprovisioning",
                    address
                ),
            )
            .await;
            delete_machine(machine, None, ctx).await
        }
        Err(e) => {
            warn_event(
                &ctx.client,
                &ctx.reporter,
                machine.object_ref(&()),
                SETUP_FAILURE_REASON,
                "Configuring",
                format!("failed to configure {}: {}", address, e),
            )
            .await;
            Err(e)
        }
    }
}

/// Delete a machine, subject to the storage migration guard and
/// max-unhealthy gating.
async fn delete_machine(
    machine: &Machine,
    node: Option<&Node>,
    ctx: &Context,
) -> Result<Outcome> {
    if let Some(node) = node {
        if nodeutil::volumes_in_use(node) && !upgrade_allowed(node) {
            warn_event(
                &ctx.client,
                &ctx.reporter,
                machine.object_ref(&()),
                "UpgradeBlocked",
                "Deleting",
                format!(
                    "node {} has volumes in use and is not migrated to the out-of-tree CSI driver",
                    node.metadata.name.as_deref().unwrap_or("<unknown>")
                ),
            )
            .await;
            return Ok(Outcome::Requeue(POLICY_REQUEUE));
        }
    }
    if !deletion_within_budget(machine, ctx).await? {
        warn_event(
            &ctx.client,
            &ctx.reporter,
            machine.object_ref(&()),
            "MaxUnhealthy",
            "Deleting",
            "too many unhealthy machines in the owning machineset".to_string(),
        )
        .await;
        return Ok(Outcome::Requeue(POLICY_REQUEUE));
    }

    let api: Api<Machine> = Api::namespaced(ctx.client.clone(), MACHINE_API_NAMESPACE);
    match api.delete(&machine.name_any(), &DeleteParams::default()).await {
        Ok(_) => {
            info!("deleted machine {} for reprovisioning", machine.name_any());
            Ok(Outcome::Done)
        }
        Err(ref e) if crate::is_not_found(e) => Ok(Outcome::Done),
        Err(e) => Err(ErrorKind::KubeError(e).into()),
    }
}

fn upgrade_allowed(node: &Node) -> bool {
    let override_label = node
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(UPGRADE_OVERRIDE_LABEL))
        .map(|v| v == "true")
        .unwrap_or(false);
    let migrated = node_annotation(node, CSI_MIGRATED_ANNOTATION).is_some();
    override_label || migrated
}

/// Max-unhealthy gate: deletion is allowed iff the owning set keeps fewer
/// than [`MAX_UNHEALTHY`] unhealthy members, or is itself that small.
async fn deletion_within_budget(machine: &Machine, ctx: &Context) -> Result<bool> {
    let owner = match machine
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.kind == "MachineSet"))
    {
        Some(o) => o.name.clone(),
        // machines outside a set are not replica gated
        None => return Ok(true),
    };
    let sets: Api<MachineSet> = Api::namespaced(ctx.client.clone(), MACHINE_API_NAMESPACE);
    let set = sets.get(&owner).await.map_err(ErrorKind::KubeError)?;
    let replicas = set.spec.replicas.unwrap_or(0);

    let selector = set
        .spec
        .selector
        .match_labels
        .as_ref()
        .map(|ml| {
            ml.iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default();
    let machines: Api<Machine> = Api::namespaced(ctx.client.clone(), MACHINE_API_NAMESPACE);
    let members = machines
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(ErrorKind::KubeError)?;

    let nodes: Api<Node> = Api::all(ctx.client.clone());
    let mut healthy = 0;
    for member in &members.items {
        if member.metadata.deletion_timestamp.is_some() {
            continue;
        }
        if member.phase() != Some(PHASE_RUNNING) {
            continue;
        }
        let node_name = match member.node_ref_name() {
            Some(n) => n,
            None => continue,
        };
        let node = nodes.get_opt(node_name).await.map_err(ErrorKind::KubeError)?;
        let versioned = node
            .as_ref()
            .and_then(|n| node_annotation(n, wmco_definitions::constants::VERSION_ANNOTATION))
            .is_some();
        if versioned {
            healthy += 1;
        }
    }
    let unhealthy = replicas - healthy;
    Ok(unhealthy < MAX_UNHEALTHY || replicas == MAX_UNHEALTHY)
}

#[cfg(test)]
mod tests {
    use super::upgrade_allowed;
    use k8s_openapi::api::core::v1::Node;
    use maplit::btreemap;
    use wmco_definitions::constants::{CSI_MIGRATED_ANNOTATION, UPGRADE_OVERRIDE_LABEL};

    #[test]
    fn upgrade_guard_tabling() {
        let mut node = Node::default();
        assert!(!upgrade_allowed(&node));

        node.metadata.labels = Some(btreemap! {
            UPGRADE_OVERRIDE_LABEL.to_string() => "true".to_string(),
        });
        assert!(upgrade_allowed(&node));

        node.metadata.labels = None;
        node.metadata.annotations = Some(btreemap! {
            CSI_MIGRATED_ANNOTATION.to_string() => "2026-01-01".to_string(),
        });
        assert!(upgrade_allowed(&node));
    }
}
