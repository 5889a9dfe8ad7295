//! ControllerConfig reconciler: propagates the kube-apiserver serving CA
//! bundle into every Windows node's kubelet trust store.

use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{controller::Action, watcher::Config, Controller},
    ResourceExt,
};

use super::{error_policy, with_gate, Context, Outcome};
use crate::Result;
use wmco_definitions::crds::ControllerConfig;

pub const NAME: &str = "controllerconfig";

/// The singleton we react to
const MACHINE_CONFIG_CONTROLLER: &str = "machine-config-controller";

pub async fn run(ctx: Arc<Context>) {
    let configs: Api<ControllerConfig> = Api::all(ctx.client.clone());
    Controller::new(configs, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|r| async move { r.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn reconcile(cc: Arc<ControllerConfig>, ctx: Arc<Context>) -> Result<Action> {
    with_gate(&ctx, NAME, async {
        if cc.name_any() != MACHINE_CONFIG_CONTROLLER {
            return Ok(Outcome::Done);
        }
        let encoded = match &cc.spec.kube_api_server_serving_ca_data {
            Some(d) => d,
            None => return Ok(Outcome::Done),
        };
        let bundle = base64::decode(encoded)
            .map_err(|e| format!("controller config CA bundle is not valid base64: {}", e))?;
        ctx.push_kubelet_ca(&bundle).await?;
        info!("pushed updated kube-apiserver serving CA to all Windows nodes");
        Ok(Outcome::Done)
    })
    .await
}
