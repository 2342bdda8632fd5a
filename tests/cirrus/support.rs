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

use std::sync::Arc;
use std::time::Duration;

use cirrus::cirrus::api::duration::NillableDuration;
use cirrus::cirrus::api::node::Node;
use cirrus::cirrus::api::nodeclaim::{ConditionType, NodeClaim};
use cirrus::cirrus::api::nodepool::{ConsolidationPolicy, Disruption, NodePool, NodePoolSpec};
use cirrus::cirrus::api::object::{ObjectMeta, INSTANCE_TYPE_LABEL};
use cirrus::cirrus::api::pod::{OwnerKind, Pod, PodSpec};
use cirrus::cirrus::api::requirements::{Requirement, Requirements};
use cirrus::cirrus::api::resources::Resources;
use cirrus::cirrus::cloud::fake::FakeCloudProvider;
use cirrus::cirrus::cloud::{CapacityType, InstanceType, Offering};
use cirrus::cirrus::cluster::client::ClusterClient;
use cirrus::cirrus::cluster::state::ClusterState;
use cirrus::cirrus::disruption::engine::{DisruptionEngine, EngineConfig};
use cirrus::cirrus::disruption::queue::DisruptionQueue;
use cirrus::cirrus::events::EventRecorder;
use cirrus::cirrus::nodeclaim::conditions::ConditionController;
use cirrus::cirrus::nodeclaim::garbagecollect::GarbageCollector;
use cirrus::cirrus::nodeclaim::lifecycle::LifecycleController;
use cirrus::cirrus::provisioning::provisioner::{claim_from_proposal, Provisioner};
use cirrus::cirrus::provisioning::scheduler::NodeClaimProposal;

/// Everything a scenario needs, wired to one in-memory cluster and a fake
/// cloud provider with aggressive timeouts.
pub struct Harness {
    pub client: Arc<ClusterClient>,
    pub state: Arc<ClusterState>,
    pub cloud: Arc<FakeCloudProvider>,
    pub recorder: Arc<EventRecorder>,
    pub lifecycle: Arc<LifecycleController>,
    pub conditions: ConditionController,
    pub queue: Arc<DisruptionQueue>,
    pub engine: DisruptionEngine,
    pub gc: GarbageCollector,
    pub provisioner: Provisioner,
}

impl Harness {
    pub fn new() -> Self {
        Harness::with_engine_config(EngineConfig::default())
    }

    pub fn with_engine_config(config: EngineConfig) -> Self {
        let client = Arc::new(ClusterClient::new());
        let state = Arc::new(ClusterState::new());
        state.mark_pods_synced();
        state.mark_nodes_synced();
        state.mark_claims_synced();
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        let recorder = Arc::new(EventRecorder::new());
        let lifecycle = Arc::new(LifecycleController::new(
            client.clone(),
            state.clone(),
            cloud.clone(),
            recorder.clone(),
        ));
        let queue = Arc::new(DisruptionQueue::with_timeouts(
            client.clone(),
            state.clone(),
            recorder.clone(),
            Duration::from_millis(500),
            Duration::from_millis(20),
        ));
        let engine = DisruptionEngine::new(
            client.clone(),
            state.clone(),
            cloud.clone(),
            queue.clone(),
            config,
        );
        let conditions = ConditionController::new(
            client.clone(),
            state.clone(),
            cloud.clone(),
            config.drift_enabled,
        );
        let gc = GarbageCollector::with_grace(
            client.clone(),
            state.clone(),
            cloud.clone(),
            recorder.clone(),
            Duration::from_secs(10),
            Duration::from_secs(900),
        );
        let provisioner = Provisioner::new(
            client.clone(),
            state.clone(),
            cloud.clone(),
            recorder.clone(),
        );
        Harness {
            client,
            state,
            cloud,
            recorder,
            lifecycle,
            conditions,
            queue,
            engine,
            gc,
            provisioner,
        }
    }

    pub fn create_pool(&self, name: &str, disruption: Disruption) -> NodePool {
        let pool = NodePool {
            metadata: ObjectMeta::named(name),
            spec: NodePoolSpec {
                disruption,
                ..Default::default()
            },
        };
        self.client.nodepools.create(pool.clone()).expect("create pool");
        pool
    }

    /// Creates a claim the way the provisioner would, launches it through
    /// the lifecycle controller, registers a ready node, and reconciles to
    /// Initialized. Returns the node name.
    pub async fn launch_initialized_claim(
        &self,
        pool: &NodePool,
        claim_name: &str,
        instance_types: &[&str],
    ) -> String {
        let proposal = NodeClaimProposal {
            pool: pool.metadata.name.clone(),
            requirements: Requirements::from_iter([Requirement::in_values(
                INSTANCE_TYPE_LABEL,
                instance_types.iter().map(|name| name.to_string()),
            )])
            .expect("requirements"),
            instance_types: vec![],
            pods: vec![],
            requests: Resources::ZERO,
            taints: vec![],
            startup_taints: vec![],
        };
        let claim = claim_from_proposal(&proposal, pool, claim_name);
        self.client.nodeclaims.create(claim.clone()).expect("create claim");
        self.state.update_nodeclaim(claim);
        self.make_claim_ready(claim_name).await
    }

    /// Launches a pending claim and registers a ready node for it. Returns
    /// the node name.
    pub async fn make_claim_ready(&self, claim_name: &str) -> String {
        self.lifecycle
            .reconcile(claim_name)
            .await
            .expect("launch reconcile");
        let claim = self.client.nodeclaims.get(claim_name).expect("claim");
        let provider_id = claim
            .status
            .provider_id
            .expect("claim launched with provider id");
        let node_name = format!("node-{}", claim_name);
        let node = Node {
            metadata: ObjectMeta::named(&node_name),
            provider_id: Some(provider_id),
            allocatable: claim.status.allocatable,
            ready: true,
            ..Default::default()
        };
        self.client.nodes.create(node.clone()).expect("create node");
        self.state.update_node(node);
        self.lifecycle
            .reconcile(claim_name)
            .await
            .expect("initialize reconcile");
        assert!(self
            .client
            .nodeclaims
            .get(claim_name)
            .expect("claim")
            .is_initialized());
        node_name
    }

    /// Binds a running pod to a node in both the store and cluster state.
    pub fn bind_pod(&self, name: &str, node_name: &str, cpu: i64) -> Pod {
        let mut pod = Pod::new(
            ObjectMeta::named(name),
            PodSpec {
                requests: Resources::requests(cpu, 1 << 30),
                node_name: Some(node_name.to_string()),
                owner: Some(OwnerKind::ReplicaSet),
                ..Default::default()
            },
        );
        pod.status.phase = cirrus::cirrus::api::pod::PodPhase::Running;
        self.client.pods.create(pod.clone()).expect("create pod");
        self.state.update_pod(&pod);
        pod
    }

    /// Flags a claim as drifted the way the condition controller would.
    pub fn mark_drifted(&self, claim_name: &str) {
        let mut claim = self.client.nodeclaims.get(claim_name).expect("claim");
        claim.set_condition(ConditionType::Drifted, true, "TemplateChanged", "");
        self.client.nodeclaims.update(claim.clone()).expect("update claim");
        self.state.update_nodeclaim(claim);
    }

    /// Rewrites a condition's transition time into the past so duration
    /// thresholds can be crossed without sleeping.
    pub fn backdate_condition(
        &self,
        claim_name: &str,
        condition: ConditionType,
        seconds: i64,
    ) {
        let mut claim = self.client.nodeclaims.get(claim_name).expect("claim");
        let transition = claim
            .status
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition)
            .expect("condition present");
        transition.last_transition =
            chrono::Utc::now() - chrono::Duration::seconds(seconds);
        self.client.nodeclaims.update(claim.clone()).expect("update claim");
        self.state.update_nodeclaim(claim);
    }

    pub fn claim(&self, name: &str) -> Option<NodeClaim> {
        self.client.nodeclaims.get(name)
    }
}

pub fn when_empty(consolidate_after: Duration) -> Disruption {
    Disruption {
        consolidation_policy: ConsolidationPolicy::WhenEmpty,
        consolidate_after: Some(NillableDuration::after(consolidate_after)),
        expire_after: NillableDuration::never(),
    }
}

pub fn when_underutilized() -> Disruption {
    Disruption {
        consolidation_policy: ConsolidationPolicy::WhenUnderutilized,
        consolidate_after: None,
        expire_after: NillableDuration::never(),
    }
}

/// A single-shape catalog with one on-demand offering per entry.
pub fn on_demand_catalog(shapes: &[(&str, i64, f64)]) -> Vec<InstanceType> {
    shapes
        .iter()
        .map(|(name, cpu, price)| InstanceType {
            name: name.to_string(),
            capacity: Resources::new(*cpu, 64 << 30, 250),
            overhead: Resources::ZERO,
            offerings: vec![Offering {
                zone: "zone-a".to_string(),
                capacity_type: CapacityType::OnDemand,
                price: *price,
                available: true,
            }],
        })
        .collect()
}
