//! Node reconciler.
//!
//! Deliberately thin: it marks the operator busy while Windows node events
//! are in flight (blocking operator upgrades during node churn) and keeps
//! the exporter endpoints current as nodes come, go and change readiness.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::Api,
    runtime::{controller::Action, watcher::Config, Controller},
};

use super::{error_policy, with_gate, Context, Outcome};
use crate::{metrics, nodeutil, Result};

pub const NAME: &str = "node";

pub async fn run(ctx: Arc<Context>) {
    let nodes: Api<Node> = Api::all(ctx.client.clone());
    Controller::new(
        nodes,
        Config::default().labels(&nodeutil::windows_selector()),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .filter_map(|r| async move { r.ok() })
    .for_each(|_| futures::future::ready(()))
    .await;
}

async fn reconcile(_node: Arc<Node>, ctx: Arc<Context>) -> Result<Action> {
    with_gate(&ctx, NAME, async {
        metrics::sync_endpoints(&ctx.client, &ctx.watch_ns).await?;
        Ok(Outcome::Done)
    })
    .await
}
