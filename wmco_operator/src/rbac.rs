//! Startup-owned RBAC for the on-host daemon identity.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use kube::{api::PostParams, Api, Client};

use super::{ErrorKind, Result};
use crate::nodeutil::owned_meta;
use wmco_definitions::constants::DAEMON_NAME;

/// Ensure the daemon's ServiceAccount and its bindings exist.
///
/// The Role/ClusterRole themselves ship with the packaging manifests; the
/// operator owns the account and the bindings so a deleted namespace object
/// heals without a reinstall.
pub async fn ensure_daemon_rbac(client: &Client, namespace: &str) -> Result<()> {
    let subject = Subject {
        kind: "ServiceAccount".into(),
        name: DAEMON_NAME.into(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    };

    let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    if accounts
        .get_opt(DAEMON_NAME)
        .await
        .map_err(ErrorKind::KubeError)?
        .is_none()
    {
        let sa = ServiceAccount {
            metadata: owned_meta(DAEMON_NAME, Some(namespace)),
            ..Default::default()
        };
        accounts
            .create(&PostParams::default(), &sa)
            .await
            .map_err(ErrorKind::KubeError)?;
        info!("created service account {}", DAEMON_NAME);
    }

    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    if bindings
        .get_opt(DAEMON_NAME)
        .await
        .map_err(ErrorKind::KubeError)?
        .is_none()
    {
        let rb = RoleBinding {
            metadata: owned_meta(DAEMON_NAME, Some(namespace)),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "Role".into(),
                name: DAEMON_NAME.into(),
            },
            subjects: Some(vec![subject.clone()]),
        };
        bindings
            .create(&PostParams::default(), &rb)
            .await
            .map_err(ErrorKind::KubeError)?;
        info!("created role binding {}", DAEMON_NAME);
    }

    let cluster_bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    if cluster_bindings
        .get_opt(DAEMON_NAME)
        .await
        .map_err(ErrorKind::KubeError)?
        .is_none()
    {
        let crb = ClusterRoleBinding {
            metadata: owned_meta(DAEMON_NAME, None),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name: DAEMON_NAME.into(),
            },
            subjects: Some(vec![subject]),
        };
        cluster_bindings
            .create(&PostParams::default(), &crb)
            .await
            .map_err(ErrorKind::KubeError)?;
        info!("created cluster role binding {}", DAEMON_NAME);
    }
    Ok(())
}
