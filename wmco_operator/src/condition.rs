//! The process-wide upgrade gate.
//!
//! Every reconcile marks its controller busy on entry and free again after a
//! clean pass. The transition between "some controller busy" and "all free"
//! is published as the `Upgradeable` condition on the operator condition
//! object, which blocks operator upgrades while configuration is mid-flight.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{api::PostParams, Api, Client};
use tokio::sync::Mutex;

use super::{is_conflict, ErrorKind, Result};
use wmco_definitions::crds::OperatorCondition;

const UPGRADEABLE: &str = "Upgradeable";

/// Confirmation poll cadence and budget
const CONFIRM_INTERVAL: Duration = Duration::from_secs(2);
const CONFIRM_ATTEMPTS: u32 = 15;

/// Conflict budget for the condition update
const UPDATE_ATTEMPTS: u32 = 5;

/// Writes the Upgradeable condition somewhere.
///
/// A trait so the gate logic is testable without an apiserver; the operator
/// wires in [`OperatorConditionPublisher`].
#[async_trait]
pub trait ConditionPublisher: Send + Sync {
    async fn publish(&self, upgradeable: bool) -> Result<()>;
}

/// Publishes against the OLM operator condition object.
pub struct OperatorConditionPublisher {
    client: Client,
    namespace: String,
    name: String,
}

impl OperatorConditionPublisher {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        OperatorConditionPublisher {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn condition(upgradeable: bool) -> Condition {
        let (status, reason, message) = if upgradeable {
            ("True", "ControllersIdle", "no reconciles in flight")
        } else {
            ("False", "ReconcilesInProgress", "host configuration in flight")
        };
        Condition {
            type_: UPGRADEABLE.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Time(Utc::now()),
            observed_generation: None,
        }
    }

    /// Wait until the status subresource reflects the written condition
    async fn confirm(&self, api: &Api<OperatorCondition>, status: &str) -> Result<()> {
        for _ in 0..CONFIRM_ATTEMPTS {
            let oc = api.get(&self.name).await.map_err(ErrorKind::KubeError)?;
            let reflected = oc
                .status
                .as_ref()
                .map(|s| {
                    s.conditions
                        .iter()
                        .any(|c| c.type_ == UPGRADEABLE && c.status == status)
                })
                .unwrap_or(false);
            if reflected {
                return Ok(());
            }
            tokio::time::sleep(CONFIRM_INTERVAL).await;
        }
        bail!(ErrorKind::Timeout(format!(
            "operator condition {} to reflect Upgradeable={}",
            self.name, status
        )))
    }
}

#[async_trait]
impl ConditionPublisher for OperatorConditionPublisher {
    async fn publish(&self, upgradeable: bool) -> Result<()> {
        let api: Api<OperatorCondition> =
            Api::namespaced(self.client.clone(), &self.namespace);
        let desired = Self::condition(upgradeable);

        let mut attempt = 0;
        loop {
            let mut oc = api.get(&self.name).await.map_err(ErrorKind::KubeError)?;
            oc.spec.conditions.retain(|c| c.type_ != UPGRADEABLE);
            // keep the previous transition time if the status did not change
            oc.spec.conditions.push(desired.clone());
            match api.replace(&self.name, &PostParams::default(), &oc).await {
                Ok(_) => break,
                Err(e) if is_conflict(&e) && attempt + 1 < UPDATE_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(e) => return Err(ErrorKind::KubeError(e).into()),
            }
        }
        info!("published Upgradeable={}", upgradeable);
        self.confirm(&api, &desired.status).await
    }
}

/// Mutex-guarded set of busy controller names.
///
/// Injected into every controller; the only process-wide mutable state. The
/// condition write happens while the lock is held so concurrent transitions
/// cannot publish out of order.
pub struct Gate {
    busy: Mutex<HashSet<String>>,
    publisher: Option<Box<dyn ConditionPublisher>>,
}

impl Gate {
    pub fn new(publisher: Option<Box<dyn ConditionPublisher>>) -> Gate {
        if publisher.is_none() {
            info!("operator condition not configured; upgrade gate disabled");
        }
        Gate {
            busy: Mutex::new(HashSet::new()),
            publisher,
        }
    }

    /// Mark a controller busy; publishes `Upgradeable=False` when this is the
    /// first busy controller.
    pub async fn enter(&self, controller: &str) -> Result<()> {
        let mut busy = self.busy.lock().await;
        let was_empty = busy.is_empty();
        busy.insert(controller.to_string());
        if was_empty {
            if let Some(p) = &self.publisher {
                p.publish(false).await?;
            }
        }
        Ok(())
    }

    /// Mark a controller free; publishes `Upgradeable=True` when no busy
    /// controllers remain. Callers only invoke this after a non-error,
    /// non-requeue reconcile result.
    pub async fn exit(&self, controller: &str) -> Result<()> {
        let mut busy = self.busy.lock().await;
        let removed = busy.remove(controller);
        if removed && busy.is_empty() {
            if let Some(p) = &self.publisher {
                p.publish(true).await?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn busy_len(&self) -> usize {
        self.busy.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{ConditionPublisher, Gate};
    use crate::Result;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingPublisher {
        log: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl ConditionPublisher for Arc<RecordingPublisher> {
        async fn publish(&self, upgradeable: bool) -> Result<()> {
            self.log.lock().unwrap().push(upgradeable);
            Ok(())
        }
    }

    fn gate_with_log() -> (Gate, Arc<RecordingPublisher>) {
        let rec = Arc::new(RecordingPublisher::default());
        let gate = Gate::new(Some(Box::new(rec.clone())));
        (gate, rec)
    }

    #[tokio::test]
    async fn transitions_publish_only_on_emptiness_changes() {
        let (gate, rec) = gate_with_log();
        gate.enter("machine").await.unwrap();
        gate.enter("configmap").await.unwrap();
        gate.exit("machine").await.unwrap();
        gate.exit("configmap").await.unwrap();
        assert_eq!(*rec.log.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test]
    async fn reentry_is_idempotent() {
        let (gate, rec) = gate_with_log();
        gate.enter("machine").await.unwrap();
        gate.enter("machine").await.unwrap();
        gate.exit("machine").await.unwrap();
        // exiting a controller that never entered publishes nothing
        gate.exit("machine").await.unwrap();
        assert_eq!(*rec.log.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test]
    async fn converges_true_across_interleavings() {
        let (gate, rec) = gate_with_log();
        let gate = Arc::new(gate);
        let mut handles = vec![];
        for i in 0..8 {
            let g = gate.clone();
            handles.push(tokio::spawn(async move {
                let name = format!("controller-{}", i % 4);
                for _ in 0..10 {
                    g.enter(&name).await.unwrap();
                    tokio::task::yield_now().await;
                    g.exit(&name).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(gate.busy_len().await, 0);
        let log = rec.log.lock().unwrap();
        assert_eq!(*log.last().unwrap(), true);
    }

    #[tokio::test]
    async fn disabled_gate_is_silent() {
        let gate = Gate::new(None);
        gate.enter("machine").await.unwrap();
        gate.exit("machine").await.unwrap();
    }
}
