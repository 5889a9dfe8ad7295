//! Metrics service-monitor reconciler.
//!
//! When the operator namespace opts into cluster monitoring, the owned
//! ServiceMonitor artifact is (re)applied with the fixed relabel rules.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    runtime::{controller::Action, watcher::Config, Controller},
    ResourceExt,
};

use super::{error_policy, with_gate, Context, Outcome};
use crate::{metrics, ErrorKind, Result};
use wmco_definitions::{
    constants::{METRICS_ENDPOINTS, MONITORING_LABEL},
    crds::ServiceMonitor,
};

pub const NAME: &str = "servicemonitor";

pub async fn run(ctx: Arc<Context>) {
    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
    let cfg = Config::default().fields(&format!("metadata.name={}", ctx.watch_ns));
    Controller::new(namespaces, cfg)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|r| async move { r.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn reconcile(ns: Arc<Namespace>, ctx: Arc<Context>) -> Result<Action> {
    with_gate(&ctx, NAME, async {
        if ns.name_any() != ctx.watch_ns {
            return Ok(Outcome::Done);
        }
        let enabled = ns
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(MONITORING_LABEL))
            .map(|v| v == "true")
            .unwrap_or(false);
        if !enabled {
            debug!("{} not labelled for monitoring; skipping", ctx.watch_ns);
            return Ok(Outcome::Done);
        }
        ensure_monitor(&ctx).await?;
        Ok(Outcome::Done)
    })
    .await
}

async fn ensure_monitor(ctx: &Context) -> Result<()> {
    let api: Api<ServiceMonitor> = Api::namespaced(ctx.client.clone(), &ctx.watch_ns);
    let desired = metrics::desired_service_monitor(&ctx.watch_ns);
    match api.get_opt(METRICS_ENDPOINTS).await.map_err(ErrorKind::KubeError)? {
        Some(existing) => {
            if existing.spec == desired.spec {
                return Ok(());
            }
            api.patch(
                METRICS_ENDPOINTS,
                &PatchParams::default(),
                &Patch::Merge(&desired),
            )
            .await
            .map_err(ErrorKind::KubeError)?;
            info!("updated service monitor {}", METRICS_ENDPOINTS);
        }
        None => {
            api.create(&PostParams::default(), &desired)
                .await
                .map_err(ErrorKind::KubeError)?;
            info!("created service monitor {}", METRICS_ENDPOINTS);
        }
    }
    Ok(())
}
