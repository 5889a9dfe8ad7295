use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{ListParams, Patch, PatchParams},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Api, Client,
};

use super::{is_conflict, is_not_found, ErrorKind, Result};
use wmco_definitions::constants::{
    BYOH_LABEL, OS_LABEL, OS_LABEL_VALUE, VERSION_ANNOTATION,
};

/// Conflicts get a small in-reconcile retry budget; anything else returns to
/// the framework for its backoff
const CONFLICT_RETRIES: u32 = 5;

/// Selector matching every Windows node
pub fn windows_selector() -> String {
    format!("{}={}", OS_LABEL, OS_LABEL_VALUE)
}

/// Selector matching BYOH Windows nodes
pub fn byoh_selector() -> String {
    format!("{},{}=true", windows_selector(), BYOH_LABEL)
}

pub async fn windows_nodes(client: &Client) -> Result<Vec<Node>> {
    list_nodes(client, &windows_selector()).await
}

pub async fn byoh_windows_nodes(client: &Client) -> Result<Vec<Node>> {
    list_nodes(client, &byoh_selector()).await
}

async fn list_nodes(client: &Client, selector: &str) -> Result<Vec<Node>> {
    let api: Api<Node> = Api::all(client.clone());
    let lp = ListParams::default().labels(selector);
    let nodes = api.list(&lp).await.map_err(ErrorKind::KubeError)?;
    Ok(nodes.items)
}

pub fn is_byoh(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(BYOH_LABEL))
        .map(|v| v == "true")
        .unwrap_or(false)
}

pub fn node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

pub fn internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| {
            addrs
                .iter()
                .find(|a| a.type_ == "InternalIP")
                .map(|a| a.address.clone())
        })
}

/// Whether any volumes are reported in use on the node
pub fn volumes_in_use(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.volumes_in_use.as_ref())
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}

/// Distinct version annotations across a node set
pub fn node_version_set(nodes: &[Node]) -> BTreeSet<String> {
    nodes
        .iter()
        .filter_map(|n| {
            n.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(VERSION_ANNOTATION))
                .cloned()
        })
        .collect()
}

/// Apply labels and annotations to a node in one merge patch.
///
/// An empty-string annotation value is applied as the empty string (the
/// cleared `pub-key-hash` signal), not dropped.
pub async fn patch_node_metadata(
    client: &Client,
    name: &str,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> Result<()> {
    let api: Api<Node> = Api::all(client.clone());
    let patch = serde_json::json!({
        "metadata": {
            "labels": labels,
            "annotations": annotations,
        }
    });
    retry_on_conflict(|| {
        let api = api.clone();
        let patch = patch.clone();
        let name = name.to_string();
        async move {
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
        }
    })
    .await?;
    debug!("patched node {} metadata", name);
    Ok(())
}

/// Delete a node, treating absence as success
pub async fn delete_node(client: &Client, name: &str) -> Result<()> {
    let api: Api<Node> = Api::all(client.clone());
    match api.delete(name, &Default::default()).await {
        Ok(_) => {
            info!("deleted node {}", name);
            Ok(())
        }
        Err(ref e) if is_not_found(e) => Ok(()),
        Err(e) => Err(ErrorKind::KubeError(e).into()),
    }
}

/// Bounded retry for optimistic-lock conflicts.
///
/// Only 409s are retried; every other error surfaces immediately so the
/// framework applies its own backoff.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ::std::result::Result<T, kube::Error>>,
{
    let mut delay = Duration::from_millis(200);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_conflict(&e) && attempt + 1 < CONFLICT_RETRIES => {
                attempt += 1;
                debug!("conflict, retry {}/{}", attempt, CONFLICT_RETRIES);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(ErrorKind::KubeError(e).into()),
        }
    }
}

/// Emit a Warning event against an object
pub async fn warn_event(
    client: &Client,
    reporter: &Reporter,
    reference: ObjectReference,
    reason: &str,
    action: &str,
    message: String,
) {
    let recorder = Recorder::new(client.clone(), reporter.clone(), reference);
    let event = Event {
        type_: EventType::Warning,
        reason: reason.to_string(),
        note: Some(message),
        action: action.to_string(),
        secondary: None,
    };
    // events are best effort; never fail a reconcile over one
    if let Err(e) = recorder.publish(event).await {
        warn!("failed to publish event {}: {}", reason, e);
    }
}

/// ObjectReference for a bare node name (the node may already be gone)
pub fn node_reference(name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".into()),
        kind: Some("Node".into()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

/// Strip helper for building metadata-only objects in ensure calls
pub fn owned_meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use maplit::btreemap;

    fn node(labels: BTreeMap<String, String>, ready: bool) -> Node {
        let mut n = Node::default();
        n.metadata.labels = Some(labels);
        n.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".into(),
                status: if ready { "True" } else { "False" }.into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        n
    }

    #[test]
    fn readiness_and_byoh() {
        let n = node(btreemap! { BYOH_LABEL.to_string() => "true".to_string() }, true);
        assert!(node_ready(&n));
        assert!(is_byoh(&n));
        let n = node(btreemap! {}, false);
        assert!(!node_ready(&n));
        assert!(!is_byoh(&n));
    }

    #[test]
    fn version_sets_skip_unannotated() {
        let mut a = Node::default();
        a.metadata.annotations = Some(btreemap! {
            VERSION_ANNOTATION.to_string() => "v1".to_string(),
        });
        let b = Node::default();
        let versions = node_version_set(&[a, b]);
        assert_eq!(versions.len(), 1);
        assert!(versions.contains("v1"));
    }

    #[test]
    fn selectors() {
        assert_eq!(windows_selector(), "kubernetes.io/os=windows");
        assert!(byoh_selector().contains("byoh=true"));
    }
}
