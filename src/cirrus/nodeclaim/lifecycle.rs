/*
 * Copyright (C) 2025 The Cirrus Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use rand::Rng;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::cirrus::api::node::Node;
use crate::cirrus::api::nodeclaim::{ConditionType, NodeClaim};
use crate::cirrus::api::object::{Taint, TERMINATION_FINALIZER, UNREGISTERED_TAINT_KEY};
use crate::cirrus::cloud::{CloudError, CloudProvider};
use crate::cirrus::cluster::client::{ClientError, ClusterClient};
use crate::cirrus::cluster::state::ClusterState;
use crate::cirrus::controller::runtime::Outcome;
use crate::cirrus::events::EventRecorder;

const TERMINATION_POLL_BASE: Duration = Duration::from_secs(3);
const TERMINATION_POLL_JITTER_MS: u64 = 2_000;
const DRAIN_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum LifecycleError {
    Cloud(CloudError),
    Client(ClientError),
}

impl Display for LifecycleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::Cloud(err) => write!(f, "cloud provider: {}", err),
            LifecycleError::Client(err) => write!(f, "cluster client: {}", err),
        }
    }
}

impl Error for LifecycleError {}

impl From<ClientError> for LifecycleError {
    fn from(err: ClientError) -> Self {
        LifecycleError::Client(err)
    }
}

/// Drives one node claim through Launch, Register, Initialize, and
/// Terminate. The only writer of a claim's status conditions.
pub struct LifecycleController {
    client: Arc<ClusterClient>,
    state: Arc<ClusterState>,
    cloud: Arc<dyn CloudProvider>,
    recorder: Arc<EventRecorder>,
}

impl LifecycleController {
    pub fn new(
        client: Arc<ClusterClient>,
        state: Arc<ClusterState>,
        cloud: Arc<dyn CloudProvider>,
        recorder: Arc<EventRecorder>,
    ) -> Self {
        LifecycleController {
            client,
            state,
            cloud,
            recorder,
        }
    }

    pub async fn reconcile(&self, name: &str) -> Result<Outcome, LifecycleError> {
        let Some(claim) = self.client.nodeclaims.get(name) else {
            return Ok(Outcome::Done);
        };
        if claim.is_terminating() {
            return self.terminate(claim);
        }
        self.launch_and_register(claim)
    }

    fn launch_and_register(&self, mut claim: NodeClaim) -> Result<Outcome, LifecycleError> {
        if claim.status.provider_id.is_none() {
            match self.cloud.create(&claim) {
                Ok(instance) => {
                    claim.status.provider_id = Some(instance.id.clone());
                    claim.status.capacity = instance.capacity;
                    claim.status.allocatable = instance.allocatable;
                    claim.status.labels = instance.labels.clone();
                    claim.set_condition(ConditionType::Launched, true, "Launched", "");
                    self.persist(&claim)?;
                    self.recorder.publish(
                        format!("NodeClaim/{}", claim.metadata.name),
                        "Launched",
                        format!("instance {}", instance.id),
                    );
                }
                Err(err) if err.is_retryable() => {
                    return Err(LifecycleError::Cloud(err));
                }
                Err(err) => {
                    // Terminal launch failure: record it on the object and
                    // stop retrying; the finalizer stays until the claim is
                    // deleted or garbage collected.
                    claim.set_condition(
                        ConditionType::Launched,
                        false,
                        "LaunchFailed",
                        &err.to_string(),
                    );
                    self.persist(&claim)?;
                    self.recorder.publish(
                        format!("NodeClaim/{}", claim.metadata.name),
                        "LaunchFailed",
                        err.to_string(),
                    );
                    return Ok(Outcome::Done);
                }
            }
        }

        let Some(mut node) = self.matching_node(&claim) else {
            // Passive wait; the garbage collector owns the registration
            // grace window.
            return Ok(Outcome::Done);
        };

        if !claim.is_registered() {
            claim.set_condition(ConditionType::Registered, true, "Registered", "");
            let mut node_changed = false;
            for (key, value) in claim.metadata.labels.iter().chain(claim.status.labels.iter()) {
                if node.metadata.labels.get(key) != Some(value) {
                    node.metadata.labels.insert(key.clone(), value.clone());
                    node_changed = true;
                }
            }
            for taint in &claim.spec.taints {
                if !node.has_taint(&taint.key) {
                    node.add_taint(taint.clone());
                    node_changed = true;
                }
            }
            // The bootstrap taint has done its job once the claim is known.
            if node.has_taint(UNREGISTERED_TAINT_KEY) {
                node.remove_taint(UNREGISTERED_TAINT_KEY);
                node_changed = true;
            }
            if node_changed {
                self.client.nodes.update(node.clone())?;
                self.state.update_node(node.clone());
            }
            self.persist(&claim)?;
            self.recorder.publish(
                format!("NodeClaim/{}", claim.metadata.name),
                "Registered",
                format!("node {}", node.metadata.name),
            );
        }

        if !claim.is_initialized() {
            let startup_taints_gone = claim
                .spec
                .startup_taints
                .iter()
                .all(|taint| !node.has_taint(&taint.key));
            if node.ready && startup_taints_gone && !node.is_unregistered() {
                claim.set_condition(ConditionType::Initialized, true, "Initialized", "");
                self.persist(&claim)?;
                self.recorder.publish(
                    format!("NodeClaim/{}", claim.metadata.name),
                    "Initialized",
                    "",
                );
            }
        }

        Ok(Outcome::Done)
    }

    /// Cordon, drain, tear down the instance, and finally release the
    /// finalizer once the cloud reports the instance gone.
    fn terminate(&self, claim: NodeClaim) -> Result<Outcome, LifecycleError> {
        let name = claim.metadata.name.clone();
        if let Some(node_name) = self.state.node_name_for_claim(&name) {
            if let Some(mut node) = self.client.nodes.get(&node_name) {
                if !node.is_cordoned() {
                    node.add_taint(Taint::disrupting());
                    self.client.nodes.update(node.clone())?;
                    self.state.update_node(node);
                }
            }
            if !self.drain(&name) {
                return Ok(Outcome::RequeueAfter(DRAIN_RETRY));
            }
        }

        if let Some(provider_id) = claim.status.provider_id.as_deref() {
            match self.cloud.delete(provider_id) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) if err.is_retryable() => return Err(LifecycleError::Cloud(err)),
                Err(err) => {
                    log::error!("instance delete for claim {} failed: {}", name, err);
                    return Err(LifecycleError::Cloud(err));
                }
            }
            match self.cloud.get(provider_id) {
                Err(err) if err.is_not_found() => {}
                Ok(_) => return Ok(Outcome::RequeueAfter(jittered_poll())),
                Err(err) if err.is_retryable() => return Err(LifecycleError::Cloud(err)),
                Err(err) => return Err(LifecycleError::Cloud(err)),
            }
        }

        self.client
            .nodeclaims
            .remove_finalizer(&name, TERMINATION_FINALIZER)?;
        self.state.delete_nodeclaim(&name);
        self.recorder
            .publish(format!("NodeClaim/{}", name), "Terminated", "");
        Ok(Outcome::Done)
    }

    /// Evicts the reschedulable pods from the claim's node. Pods that opted
    /// out of disruption are waited for, not evicted. Returns true once
    /// nothing blocks termination.
    fn drain(&self, claim_name: &str) -> bool {
        let mut blocked = false;
        let mut names: Vec<String> = Vec::new();
        self.state.for_each_node(|state_node| {
            if state_node.claim.as_ref().map(|c| c.metadata.name.as_str()) == Some(claim_name) {
                names.extend(state_node.pod_names().cloned());
            }
        });
        for pod_name in names {
            let Some(pod) = self.client.pods.get(&pod_name) else {
                self.state.delete_pod(&pod_name);
                continue;
            };
            if pod.has_do_not_disrupt() {
                blocked = true;
                continue;
            }
            if let Err(err) = self.client.pods.delete(&pod_name) {
                log::debug!("evicting pod {} failed: {}", pod_name, err);
            }
            self.state.delete_pod(&pod_name);
        }
        !blocked
    }

    fn matching_node(&self, claim: &NodeClaim) -> Option<Node> {
        let provider_id = claim.status.provider_id.as_deref()?;
        self.client
            .nodes
            .list()
            .into_iter()
            .find(|node| node.provider_id.as_deref() == Some(provider_id))
    }

    fn persist(&self, claim: &NodeClaim) -> Result<(), LifecycleError> {
        self.client.nodeclaims.update(claim.clone())?;
        self.state.update_nodeclaim(claim.clone());
        Ok(())
    }
}

fn jittered_poll() -> Duration {
    let jitter = rand::thread_rng().gen_range(0..TERMINATION_POLL_JITTER_MS);
    TERMINATION_POLL_BASE + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cirrus::api::nodeclaim::NodeClaimSpec;
    use crate::cirrus::api::object::{ObjectMeta, INSTANCE_TYPE_LABEL};
    use crate::cirrus::api::pod::{Pod, PodSpec};
    use crate::cirrus::api::requirements::{Requirement, Requirements};
    use crate::cirrus::api::resources::Resources;
    use crate::cirrus::cloud::fake::FakeCloudProvider;

    fn fixture() -> (
        LifecycleController,
        Arc<ClusterClient>,
        Arc<ClusterState>,
        Arc<FakeCloudProvider>,
    ) {
        let client = Arc::new(ClusterClient::new());
        let state = Arc::new(ClusterState::new());
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        let recorder = Arc::new(EventRecorder::new());
        let controller = LifecycleController::new(
            client.clone(),
            state.clone(),
            cloud.clone(),
            recorder,
        );
        (controller, client, state, cloud)
    }

    fn pending_claim(name: &str) -> NodeClaim {
        let mut claim = NodeClaim {
            metadata: ObjectMeta::named(name),
            spec: NodeClaimSpec {
                nodepool: "default".to_string(),
                requirements: Requirements::from_iter([Requirement::in_values(
                    INSTANCE_TYPE_LABEL,
                    ["c-small".to_string()],
                )])
                .expect("requirements"),
                resources: Resources::new(500, 1 << 30, 2),
                ..Default::default()
            },
            ..Default::default()
        };
        claim.metadata.add_finalizer(TERMINATION_FINALIZER);
        claim
    }

    fn ready_node(name: &str, provider_id: &str) -> Node {
        Node {
            metadata: ObjectMeta::named(name),
            provider_id: Some(provider_id.to_string()),
            allocatable: Resources::new(1_900, 3 << 30, 56),
            ready: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn launch_sets_provider_id_and_condition() {
        let (controller, client, state, _cloud) = fixture();
        let claim = pending_claim("default-1");
        client.nodeclaims.create(claim.clone()).expect("create");
        state.update_nodeclaim(claim);

        let outcome = controller.reconcile("default-1").await.expect("reconcile");
        assert_eq!(outcome, Outcome::Done);

        let claim = client.nodeclaims.get("default-1").expect("claim");
        assert!(claim.is_launched());
        assert!(claim.status.provider_id.is_some());
        assert_eq!(claim.status.capacity.cpu, 2_000);
    }

    #[tokio::test]
    async fn insufficient_capacity_surfaces_for_retry() {
        let (controller, client, state, cloud) = fixture();
        cloud.set_catalog(vec![]);
        let claim = pending_claim("default-1");
        client.nodeclaims.create(claim.clone()).expect("create");
        state.update_nodeclaim(claim);

        assert!(controller.reconcile("default-1").await.is_err());
        let claim = client.nodeclaims.get("default-1").expect("claim");
        assert!(claim.condition(ConditionType::Launched).is_none());
    }

    #[tokio::test]
    async fn terminal_launch_failure_marks_condition_without_retry() {
        let (controller, client, state, cloud) = fixture();
        cloud.reject_creates("unsupported shape");
        let claim = pending_claim("default-1");
        client.nodeclaims.create(claim.clone()).expect("create");
        state.update_nodeclaim(claim);

        let outcome = controller.reconcile("default-1").await.expect("reconcile");
        assert_eq!(outcome, Outcome::Done);
        let claim = client.nodeclaims.get("default-1").expect("claim");
        let launched = claim.condition(ConditionType::Launched).expect("condition");
        assert!(!launched.status);
        assert_eq!(launched.reason, "LaunchFailed");
        assert!(claim.metadata.has_finalizer(TERMINATION_FINALIZER));
    }

    #[tokio::test]
    async fn registration_copies_labels_and_clears_bootstrap_taint() {
        let (controller, client, state, _cloud) = fixture();
        let claim = pending_claim("default-1");
        client.nodeclaims.create(claim.clone()).expect("create");
        state.update_nodeclaim(claim);
        controller.reconcile("default-1").await.expect("launch");

        let provider_id = client
            .nodeclaims
            .get("default-1")
            .expect("claim")
            .status
            .provider_id
            .expect("provider id");
        let mut node = ready_node("node-1", &provider_id);
        node.add_taint(Taint::unregistered());
        client.nodes.create(node).expect("node");
        state.update_node(client.nodes.get("node-1").expect("node"));

        controller.reconcile("default-1").await.expect("register");

        let claim = client.nodeclaims.get("default-1").expect("claim");
        assert!(claim.is_registered());
        assert!(claim.is_initialized());
        let node = client.nodes.get("node-1").expect("node");
        assert!(!node.is_unregistered());
        assert_eq!(
            node.metadata.labels.get(INSTANCE_TYPE_LABEL),
            Some(&"c-small".to_string())
        );
    }

    #[tokio::test]
    async fn termination_waits_for_instance_to_disappear() {
        let (controller, client, state, cloud) = fixture();
        let claim = pending_claim("default-1");
        client.nodeclaims.create(claim.clone()).expect("create");
        state.update_nodeclaim(claim);
        controller.reconcile("default-1").await.expect("launch");
        let provider_id = client
            .nodeclaims
            .get("default-1")
            .expect("claim")
            .status
            .provider_id
            .expect("provider id");

        client.nodeclaims.delete("default-1").expect("delete");
        let outcome = controller.reconcile("default-1").await.expect("terminate");
        assert_eq!(outcome, Outcome::Done);
        assert!(client.nodeclaims.get("default-1").is_none());
        assert!(cloud.get(&provider_id).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn termination_drains_pods_but_waits_for_do_not_disrupt() {
        let (controller, client, state, _cloud) = fixture();
        let claim = pending_claim("default-1");
        client.nodeclaims.create(claim.clone()).expect("create");
        state.update_nodeclaim(claim);
        controller.reconcile("default-1").await.expect("launch");
        let provider_id = client
            .nodeclaims
            .get("default-1")
            .expect("claim")
            .status
            .provider_id
            .expect("provider id");
        client
            .nodes
            .create(ready_node("node-1", &provider_id))
            .expect("node");
        state.update_node(client.nodes.get("node-1").expect("node"));

        let mut guarded = Pod::new(
            ObjectMeta::named("guarded"),
            PodSpec {
                requests: Resources::requests(100, 1 << 20),
                node_name: Some("node-1".to_string()),
                ..Default::default()
            },
        );
        guarded.metadata.annotations.insert(
            crate::cirrus::api::object::DO_NOT_DISRUPT_ANNOTATION.to_string(),
            "true".to_string(),
        );
        client.pods.create(guarded.clone()).expect("pod");
        state.update_pod(&guarded);

        client.nodeclaims.delete("default-1").expect("delete");
        let outcome = controller.reconcile("default-1").await.expect("terminate");
        assert!(matches!(outcome, Outcome::RequeueAfter(_)));
        assert!(client.nodeclaims.get("default-1").is_some());

        client.pods.delete("guarded").expect("pod gone");
        state.delete_pod("guarded");
        let outcome = controller.reconcile("default-1").await.expect("terminate");
        assert_eq!(outcome, Outcome::Done);
        assert!(client.nodeclaims.get("default-1").is_none());
    }
}
