//! CSR reconcilers.
//!
//! The kubelet controller approves client-bootstrap and serving requests
//! from BYOH hosts; the daemon controller approves the on-host daemon's own
//! api-server client identity. Neither opens a session except the kubelet
//! path's hostname fallback.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::{
    api::Api,
    runtime::{controller::Action, watcher::Config, Controller},
    Resource, ResourceExt,
};

use super::{error_policy, with_gate, Context, Outcome};
use crate::csr::{approve, is_daemon_csr, is_pending, KubeletCsrValidator, Verdict};
use crate::nodeutil::{self, warn_event};
use crate::windows::SshConnector;
use crate::Result;
use wmco_definitions::constants::{
    API_SERVER_CLIENT_SIGNER, DAEMON_NAME, KUBELET_BOOTSTRAP_SIGNER, KUBELET_SERVING_SIGNER,
};

pub const KUBELET_NAME: &str = "csr-kubelet";
pub const DAEMON_NAME_CONTROLLER: &str = "csr-daemon";

const INVALID_REASON: &str = "CSRValidationFailed";

pub async fn run(ctx: Arc<Context>) {
    let kubelet = run_kubelet(ctx.clone());
    let daemon = run_daemon(ctx);
    futures::join!(kubelet, daemon);
}

async fn run_kubelet(ctx: Arc<Context>) {
    let csrs: Api<CertificateSigningRequest> = Api::all(ctx.client.clone());
    Controller::new(csrs, Config::default())
        .shutdown_on_signal()
        .run(reconcile_kubelet, error_policy, ctx)
        .filter_map(|r| async move { r.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn run_daemon(ctx: Arc<Context>) {
    let csrs: Api<CertificateSigningRequest> = Api::all(ctx.client.clone());
    Controller::new(csrs, Config::default())
        .shutdown_on_signal()
        .run(reconcile_daemon, error_policy, ctx)
        .filter_map(|r| async move { r.ok() })
        .for_each(|_| futures::future::ready(()))
        .await;
}

async fn reconcile_kubelet(
    csr: Arc<CertificateSigningRequest>,
    ctx: Arc<Context>,
) -> Result<Action> {
    // fast exits stay outside the gate: almost every CSR in a cluster is
    // none of our business
    if !is_pending(&csr) {
        return Ok(Action::await_change());
    }
    let signer_name = csr.spec.signer_name.as_str();
    if signer_name != KUBELET_BOOTSTRAP_SIGNER && signer_name != KUBELET_SERVING_SIGNER {
        return Ok(Action::await_change());
    }
    with_gate(&ctx, KUBELET_NAME, kubelet_inner(csr, ctx.clone())).await
}

async fn kubelet_inner(
    csr: Arc<CertificateSigningRequest>,
    ctx: Arc<Context>,
) -> Result<Outcome> {
    let instances = ctx.byoh_instances().await?;
    if instances.is_empty() {
        // nothing of ours could have produced this CSR
        return Ok(Outcome::Done);
    }
    let existing_nodes: BTreeSet<String> = nodeutil::windows_nodes(&ctx.client)
        .await?
        .iter()
        .filter_map(|n| n.metadata.name.clone())
        .collect();

    let signer = ctx.signer().await?;
    let connector = SshConnector::new(&signer)?;
    let validator = KubeletCsrValidator {
        instances: &instances,
        resolver: ctx.resolver.as_ref(),
        connector: Some(&connector),
        existing_nodes: &existing_nodes,
    };

    match validator.validate(&csr).await? {
        Verdict::Approve { warnings } => {
            for w in warnings {
                warn!("{}: {}", csr.name_any(), w);
                warn_event(
                    &ctx.client,
                    &ctx.reporter,
                    csr.object_ref(&()),
                    "NonCompliantNodeName",
                    "Approving",
                    w,
                )
                .await;
            }
            approve(&ctx.client, &csr).await?;
            Ok(Outcome::Done)
        }
        Verdict::NotOurs(reason) => {
            debug!("ignoring CSR {}: {}", csr.name_any(), reason);
            Ok(Outcome::Done)
        }
        Verdict::Invalid(reason) => {
            warn_event(
                &ctx.client,
                &ctx.reporter,
                csr.object_ref(&()),
                INVALID_REASON,
                "Validating",
                reason,
            )
            .await;
            Ok(Outcome::Done)
        }
    }
}

async fn reconcile_daemon(
    csr: Arc<CertificateSigningRequest>,
    ctx: Arc<Context>,
) -> Result<Action> {
    if !is_pending(&csr) {
        return Ok(Action::await_change());
    }
    if csr.spec.signer_name != API_SERVER_CLIENT_SIGNER {
        return Ok(Action::await_change());
    }
    let daemon_user = format!("system:serviceaccount:{}:{}", ctx.watch_ns, DAEMON_NAME);
    if !is_daemon_csr(&csr, &daemon_user) {
        return Ok(Action::await_change());
    }
    with_gate(&ctx, DAEMON_NAME_CONTROLLER, async {
        approve(&ctx.client, &csr).await?;
        Ok(Outcome::Done)
    })
    .await
}
