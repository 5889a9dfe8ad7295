//! Secret reconciler: private key rotation and the daemon's TLS pair.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    runtime::{controller::Action, reflector::ObjectRef, watcher::Config, Controller},
    ResourceExt,
};

use super::{error_policy, with_gate, Context, Outcome};
use crate::nodeutil::{self, patch_node_metadata, retry_on_conflict};
use crate::signer::Signer;
use crate::{ErrorKind, Result};
use wmco_definitions::{
    constants::{
        MACHINE_API_NAMESPACE, PRIVATE_KEY_SECRET, PUB_KEY_HASH_ANNOTATION, TLS_DIR, TLS_SECRET,
        USERDATA_SECRET, USERNAME_ANNOTATION,
    },
    crypto,
    instance::node_annotation,
    userdata,
};

pub const NAME: &str = "secret";

pub async fn run(ctx: Arc<Context>) {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ctx.watch_ns);
    let machine_secrets: Api<Secret> =
        Api::namespaced(ctx.client.clone(), MACHINE_API_NAMESPACE);
    let ns = ctx.watch_ns.clone();
    Controller::new(secrets, Config::default())
        .watches(
            machine_secrets,
            Config::default().fields(&format!("metadata.name={}", USERDATA_SECRET)),
            move |_secret: Secret| {
                // user-data drift is corrected by the private key path
                Some(ObjectRef::<Secret>::new(PRIVATE_KEY_SECRET).within(&ns))
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|r| async move { r.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn reconcile(secret: Arc<Secret>, ctx: Arc<Context>) -> Result<Action> {
    with_gate(&ctx, NAME, reconcile_inner(secret, ctx.clone())).await
}

async fn reconcile_inner(secret: Arc<Secret>, ctx: Arc<Context>) -> Result<Outcome> {
    match secret.name_any().as_str() {
        PRIVATE_KEY_SECRET => private_key_changed(&ctx).await,
        TLS_SECRET => tls_changed(&secret, &ctx).await,
        _ => Ok(Outcome::Done),
    }
}

/// Regenerate the user-data secret and propagate key rotation to nodes.
///
/// BYOH nodes get their hash and re-encrypted username updated in a single
/// patch; Machine backed nodes get their hash cleared, which the Machine
/// reconciler turns into delete-and-reprovision. This asymmetry is the whole
/// rotation mechanism.
async fn private_key_changed(ctx: &Context) -> Result<Outcome> {
    let signer = ctx.signer().await?;
    sync_userdata(ctx, &signer).await?;

    let new_hash = signer.pub_key_hash();
    let instances = ctx.byoh_instances().await?;
    for node in nodeutil::windows_nodes(&ctx.client).await? {
        let name = match node.metadata.name.as_deref() {
            Some(n) => n,
            None => continue,
        };
        let current = node_annotation(&node, PUB_KEY_HASH_ANNOTATION);
        if nodeutil::is_byoh(&node) {
            if current == Some(new_hash.as_str()) {
                continue;
            }
            let username = instances
                .iter()
                .find(|i| i.node_name() == Some(name))
                .map(|i| i.username.clone());
            let username = match username {
                Some(u) => u,
                None => {
                    // entry disappeared; the configmap reconciler owns cleanup
                    debug!("no instance entry for byoh node {}; skipping", name);
                    continue;
                }
            };
            let mut annotations = BTreeMap::new();
            annotations.insert(PUB_KEY_HASH_ANNOTATION.to_string(), new_hash.clone());
            annotations.insert(
                USERNAME_ANNOTATION.to_string(),
                crypto::encrypt(&username, signer.key_bytes())?,
            );
            patch_node_metadata(&ctx.client, name, &BTreeMap::new(), &annotations).await?;
            info!("rotated key material annotations on byoh node {}", name);
        } else {
            if current == Some("") || current.is_none() {
                continue;
            }
            let mut annotations = BTreeMap::new();
            // cleared, not removed: the empty string is the redeploy signal
            annotations.insert(PUB_KEY_HASH_ANNOTATION.to_string(), String::new());
            patch_node_metadata(&ctx.client, name, &BTreeMap::new(), &annotations).await?;
            info!("cleared pub key hash on machine node {}", name);
        }
    }
    Ok(Outcome::Done)
}

/// Reconcile the generated user-data secret in the machine namespace.
async fn sync_userdata(ctx: &Context, signer: &Signer) -> Result<()> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), MACHINE_API_NAMESPACE);
    let authorized = signer.authorized_key()?;
    let desired = userdata::secret(&ctx.info.platform, &authorized);

    match api.get_opt(USERDATA_SECRET).await.map_err(ErrorKind::KubeError)? {
        Some(existing) => {
            if userdata::matches(&existing, &ctx.info.platform, &authorized) {
                return Ok(());
            }
            retry_on_conflict(|| {
                let api = api.clone();
                let desired = desired.clone();
                async move {
                    api.patch(
                        USERDATA_SECRET,
                        &PatchParams::default(),
                        &Patch::Merge(&desired),
                    )
                    .await
                }
            })
            .await?;
            info!("updated {} for the current public key", USERDATA_SECRET);
        }
        None => {
            api.create(&PostParams::default(), &desired)
                .await
                .map_err(ErrorKind::KubeError)?;
            info!("created {}", USERDATA_SECRET);
        }
    }
    Ok(())
}

/// Push the daemon's serving certificate pair to every node.
async fn tls_changed(secret: &Secret, ctx: &Context) -> Result<Outcome> {
    let data = match secret.data.as_ref() {
        Some(d) => d,
        None => return Ok(Outcome::Done),
    };
    let (crt, key) = match (data.get("tls.crt"), data.get("tls.key")) {
        (Some(c), Some(k)) => (c, k),
        _ => {
            warn!("{} is missing tls.crt or tls.key", TLS_SECRET);
            return Ok(Outcome::Done);
        }
    };
    let mut files = BTreeMap::new();
    files.insert("tls.crt".to_string(), crt.0.clone());
    files.insert("tls.key".to_string(), key.0.clone());
    ctx.replace_dir_on_all_nodes(TLS_DIR, &files).await?;
    Ok(Outcome::Done)
}
