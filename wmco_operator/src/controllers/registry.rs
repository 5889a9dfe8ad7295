//! Registry reconciler: mirror sets and the global pull secret compiled
//! into container-runtime configuration on every host.
//!
//! The framework takes one primary type per controller, so three small
//! controllers funnel into the same sync routine; each is independently
//! restartable and the sync is idempotent.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::Api,
    runtime::{controller::Action, watcher::Config, Controller},
    ResourceExt,
};

use super::{error_policy, with_gate, Context, Outcome};
use crate::{ErrorKind, Result};
use wmco_definitions::{
    constants::{CLUSTER_CONFIG_NAMESPACE, PULL_SECRET, REGISTRY_CONF_DIR},
    crds::{ImageDigestMirrorSet, ImageTagMirrorSet},
    registry::{self, MirrorRule},
};

pub const NAME: &str = "registry";

pub async fn run(ctx: Arc<Context>) {
    let digests = run_digest_sets(ctx.clone());
    let tags = run_tag_sets(ctx.clone());
    let pull = run_pull_secret(ctx);
    futures::join!(digests, tags, pull);
}

async fn run_digest_sets(ctx: Arc<Context>) {
    let sets: Api<ImageDigestMirrorSet> = Api::all(ctx.client.clone());
    Controller::new(sets, Config::default())
        .shutdown_on_signal()
        .run(
            |_set: Arc<ImageDigestMirrorSet>, ctx: Arc<Context>| async move {
                with_gate(&ctx, NAME, sync(&ctx)).await
            },
            error_policy,
            ctx,
        )
        .filter_map(|r| async move { r.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn run_tag_sets(ctx: Arc<Context>) {
    let sets: Api<ImageTagMirrorSet> = Api::all(ctx.client.clone());
    Controller::new(sets, Config::default())
        .shutdown_on_signal()
        .run(
            |_set: Arc<ImageTagMirrorSet>, ctx: Arc<Context>| async move {
                with_gate(&ctx, NAME, sync(&ctx)).await
            },
            error_policy,
            ctx,
        )
        .filter_map(|r| async move { r.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn run_pull_secret(ctx: Arc<Context>) {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), CLUSTER_CONFIG_NAMESPACE);
    Controller::new(
        secrets,
        Config::default().fields(&format!("metadata.name={}", PULL_SECRET)),
    )
    .shutdown_on_signal()
    .run(
        |secret: Arc<Secret>, ctx: Arc<Context>| async move {
            if secret.name_any() != PULL_SECRET {
                return Ok(Action::await_change());
            }
            with_gate(&ctx, NAME, sync(&ctx)).await
        },
        error_policy,
        ctx,
    )
    .filter_map(|r| async move { r.ok() })
    .for_each(|_| futures::future::ready(()))
    .await;
}

/// Compile the full mirror + auth file set and replace the runtime config
/// directory on every node atomically.
async fn sync(ctx: &Context) -> Result<Outcome> {
    let digest_api: Api<ImageDigestMirrorSet> = Api::all(ctx.client.clone());
    let tag_api: Api<ImageTagMirrorSet> = Api::all(ctx.client.clone());

    let mut digest_rules: Vec<MirrorRule> = vec![];
    for set in digest_api
        .list(&Default::default())
        .await
        .map_err(ErrorKind::KubeError)?
    {
        for m in &set.spec.image_digest_mirrors {
            digest_rules.push(MirrorRule {
                source: m.source.clone(),
                mirrors: m.mirrors.clone(),
                resolve_tags: false,
            });
        }
    }
    let mut tag_rules: Vec<MirrorRule> = vec![];
    for set in tag_api
        .list(&Default::default())
        .await
        .map_err(ErrorKind::KubeError)?
    {
        for m in &set.spec.image_tag_mirrors {
            tag_rules.push(MirrorRule {
                source: m.source.clone(),
                mirrors: m.mirrors.clone(),
                resolve_tags: true,
            });
        }
    }

    let rules = registry::merge_rules(&digest_rules, &tag_rules);
    let mut files = registry::generate_hosts_files(&rules);

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), CLUSTER_CONFIG_NAMESPACE);
    if let Some(pull) = secrets
        .get_opt(PULL_SECRET)
        .await
        .map_err(ErrorKind::KubeError)?
    {
        if let Some(dockerconfig) = pull
            .data
            .as_ref()
            .and_then(|d| d.get(".dockerconfigjson"))
        {
            match registry::pull_secret_file(&dockerconfig.0) {
                Ok((path, content)) => {
                    files.insert(path, content);
                }
                Err(e) => warn!("global pull secret not usable: {}", e),
            }
        }
    }

    info!(
        "syncing {} registry config file(s) to all Windows nodes",
        files.len()
    );
    ctx.replace_dir_on_all_nodes(REGISTRY_CONF_DIR, &files).await?;
    Ok(Outcome::Done)
}
