//! The controllers binding cluster events to the pipelines.
//!
//! Controllers never call each other; they coordinate through cluster
//! objects and the shared upgrade gate, so each is independently
//! restartable.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::{ConfigMap, Node, Secret};
use kube::{
    api::Api,
    runtime::{controller::Action, events::Reporter},
    Client, ResourceExt,
};

use super::{ErrorKind, Result};
use crate::cluster::ClusterInfo;
use crate::condition::Gate;
use crate::instances;
use crate::netutil::AddressResolver;
use crate::nodeutil;
use crate::signer::Signer;
use crate::windows::{Connector, SshConnector};
use wmco_definitions::{
    constants::{
        INSTANCES_CONFIGMAP, KUBELET_CA_FILE, KUBELET_SERVICE, PRIVATE_KEY_SECRET,
        USERNAME_ANNOTATION,
    },
    crypto,
    instance::{node_annotation, Instance},
    services::{ServicesContext, ServicesData},
};

pub mod configmap;
pub mod controllerconfig;
pub mod csr;
pub mod machine;
pub mod node;
pub mod registry;
pub mod servicemonitor;
pub mod secret;

/// Requeue used for transient waits (cloud resources still materializing)
pub const SHORT_REQUEUE: Duration = Duration::from_secs(20);

/// Requeue used for policy denials that need external action
pub const POLICY_REQUEUE: Duration = Duration::from_secs(300);

/// First retry delay after a failed reconcile
const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Ceiling for the failure retry delay
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// A quiet period this long resets an object's failure streak
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(600);

/// Per-object failure streaks driving the retry delay.
///
/// The framework itself replays an errored request at whatever delay the
/// error policy picks, so growing that delay is this table's job. Streaks
/// age out rather than being cleared on success: the error policy is the
/// only code that runs on failure, and an object that has stayed quiet for
/// [`BACKOFF_RESET_AFTER`] has evidently recovered.
#[derive(Default)]
pub struct Backoff {
    streaks: Mutex<HashMap<String, (u32, Instant)>>,
}

impl Backoff {
    /// Delay before the next retry of `key`, doubling per consecutive failure
    fn next_delay(&self, key: String) -> Duration {
        let mut streaks = self.streaks.lock().unwrap();
        let now = Instant::now();
        let entry = streaks.entry(key).or_insert((0, now));
        if now.duration_since(entry.1) > BACKOFF_RESET_AFTER {
            entry.0 = 0;
        }
        entry.0 = entry.0.saturating_add(1);
        entry.1 = now;
        let factor = 1u32 << (entry.0 - 1).min(16);
        BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_MAX)
    }
}

/// What a reconcile pass decided.
///
/// Only `Done` marks the controller free on the upgrade gate; a requeue
/// keeps it busy until a later pass completes cleanly.
pub enum Outcome {
    Done,
    Requeue(Duration),
}

/// Shared state injected into every controller.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    /// The operator's namespace (`WATCH_NAMESPACE`)
    pub watch_ns: String,
    pub info: ClusterInfo,
    pub gate: Arc<Gate>,
    pub resolver: Arc<dyn AddressResolver>,
    pub reporter: Reporter,
    pub backoff: Arc<Backoff>,
}

impl Context {
    /// Rebuild the signer from the private-key secret.
    ///
    /// Called on every reconcile entry rather than cached, so a rotated key
    /// is picked up at the next tick.
    pub async fn signer(&self) -> Result<Signer> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.watch_ns);
        let secret = api
            .get(PRIVATE_KEY_SECRET)
            .await
            .map_err(ErrorKind::KubeError)?;
        Signer::from_secret(&secret)
    }

    /// The services manifest expected for this operator version
    pub fn expected_services(&self) -> ServicesData {
        ServicesData::generate(&ServicesContext {
            version: self.info.version.clone(),
            platform: self.info.platform.clone(),
            network: self.info.network.clone(),
            proxy: self.info.proxy.clone(),
            api_server_endpoint: self.info.api_server_endpoint.clone(),
            ccm_owned: self.info.ccm_owned,
        })
    }

    /// Parse the BYOH instances map, correlated against current nodes.
    ///
    /// An absent ConfigMap reads as an empty map: that is the signal to
    /// deconfigure every BYOH host.
    pub async fn byoh_instances(&self) -> Result<Vec<Instance>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.watch_ns);
        let data = match api.get_opt(INSTANCES_CONFIGMAP).await.map_err(ErrorKind::KubeError)? {
            Some(cm) => cm.data.unwrap_or_default(),
            None => BTreeMap::new(),
        };
        let nodes = nodeutil::windows_nodes(&self.client).await?;
        let mut parsed = instances::parse(&data, &nodes, self.resolver.as_ref()).await?;
        for i in &mut parsed {
            i.set_node_ip = self.info.platform.needs_node_ip();
        }
        Ok(parsed)
    }

    /// Username to open a session to a node with: the decrypted annotation
    /// for BYOH nodes, the platform default for Machine backed ones.
    pub fn node_username(&self, node: &Node, signer: &Signer) -> Result<String> {
        match node_annotation(node, USERNAME_ANNOTATION) {
            Some(enc) => Ok(crypto::decrypt(enc, signer.key_bytes())?),
            None => Ok(self.info.platform.default_username().to_string()),
        }
    }

    /// Upload one file to every Windows node.
    pub async fn upload_to_all_nodes(&self, path: &str, content: &[u8]) -> Result<()> {
        let signer = self.signer().await?;
        let connector = SshConnector::new(&signer)?;
        for node in nodeutil::windows_nodes(&self.client).await? {
            let addr = match nodeutil::internal_ip(&node) {
                Some(a) => a,
                None => continue,
            };
            let username = self.node_username(&node, &signer)?;
            let host = connector.open(&addr, &username).await?;
            host.upload(path, content).await?;
            debug!("pushed {} to {}", path, addr);
        }
        Ok(())
    }

    /// Replace the kubelet trust store on every node and bounce the kubelet
    /// so the new bundle takes effect.
    pub async fn push_kubelet_ca(&self, bundle: &[u8]) -> Result<()> {
        let signer = self.signer().await?;
        let connector = SshConnector::new(&signer)?;
        for node in nodeutil::windows_nodes(&self.client).await? {
            let addr = match nodeutil::internal_ip(&node) {
                Some(a) => a,
                None => continue,
            };
            let username = self.node_username(&node, &signer)?;
            let host = connector.open(&addr, &username).await?;
            host.upload(KUBELET_CA_FILE, bundle).await?;
            host.stop_service(KUBELET_SERVICE).await?;
            host.start_service(KUBELET_SERVICE).await?;
            debug!("refreshed kubelet trust store on {}", addr);
        }
        Ok(())
    }

    /// Atomically replace a directory on every Windows node.
    pub async fn replace_dir_on_all_nodes(
        &self,
        dir: &str,
        files: &BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        let signer = self.signer().await?;
        let connector = SshConnector::new(&signer)?;
        for node in nodeutil::windows_nodes(&self.client).await? {
            let addr = match nodeutil::internal_ip(&node) {
                Some(a) => a,
                None => continue,
            };
            let username = self.node_username(&node, &signer)?;
            let host = connector.open(&addr, &username).await?;
            host.replace_dir(dir, files).await?;
            debug!("replaced {} on {}", dir, addr);
        }
        Ok(())
    }
}

/// The upgrade-gate envelope around a reconcile pass.
///
/// Entry marks the controller busy; only a clean non-requeue pass marks it
/// free again. Errors propagate so the framework backs off while the busy
/// mark stays.
pub async fn with_gate<Fut>(ctx: &Context, controller: &str, pass: Fut) -> Result<Action>
where
    Fut: ::std::future::Future<Output = Result<Outcome>>,
{
    ctx.gate.enter(controller).await?;
    match pass.await {
        Ok(Outcome::Done) => {
            ctx.gate.exit(controller).await?;
            Ok(Action::await_change())
        }
        Ok(Outcome::Requeue(after)) => Ok(Action::requeue(after)),
        Err(e) => Err(e),
    }
}

/// Shared error policy: log, then back off exponentially per object.
///
/// Consecutive failures of one object double its retry delay up to
/// [`BACKOFF_MAX`]; distinct objects fail independently.
pub fn error_policy<K: ResourceExt>(obj: Arc<K>, error: &super::Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {}", error);
    for cause in error.iter().skip(1) {
        warn!("caused by: {}", cause);
    }
    let key = format!(
        "{}:{}/{}",
        ::std::any::type_name::<K>(),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    );
    let delay = ctx.backoff.next_delay(key);
    debug!("retrying {} in {:?}", obj.name_any(), delay);
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::{Backoff, BACKOFF_BASE, BACKOFF_MAX};

    #[test]
    fn failure_streaks_double_up_to_the_cap() {
        let backoff = Backoff::default();
        let key = || "machine:openshift-machine-api/win-abc".to_string();
        assert_eq!(backoff.next_delay(key()), BACKOFF_BASE);
        assert_eq!(backoff.next_delay(key()), BACKOFF_BASE * 2);
        assert_eq!(backoff.next_delay(key()), BACKOFF_BASE * 4);
        for _ in 0..20 {
            assert!(backoff.next_delay(key()) <= BACKOFF_MAX);
        }
        assert_eq!(backoff.next_delay(key()), BACKOFF_MAX);
    }

    #[test]
    fn objects_fail_independently() {
        let backoff = Backoff::default();
        for _ in 0..4 {
            backoff.next_delay("machine:ns/win-abc".to_string());
        }
        assert_eq!(
            backoff.next_delay("machine:ns/win-def".to_string()),
            BACKOFF_BASE
        );
    }
}
