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

use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::cirrus::api::nodeclaim::{NodeClaim, NodeClaimSpec};
use crate::cirrus::api::nodepool::{order_by_weight, NodePool};
use crate::cirrus::api::object::{
    ObjectMeta, NODEPOOL_HASH_ANNOTATION, NODEPOOL_LABEL, TERMINATION_FINALIZER,
};
use crate::cirrus::api::pod::Pod;
use crate::cirrus::api::resources::Resources;
use crate::cirrus::cloud::{CloudError, CloudProvider, InstanceType};
use crate::cirrus::cluster::client::{ClientError, ClusterClient};
use crate::cirrus::cluster::state::{ClusterState, NOMINATION_TTL};
use crate::cirrus::events::EventRecorder;
use crate::cirrus::observability::metrics;
use crate::cirrus::provisioning::scheduler::{NodeClaimProposal, Plan, Scheduler};

const LIMITS_EXCEEDED_REASON: &str = "limits exceeded";

/// Pending-pod batch window. New arrivals extend the window until the idle
/// gap passes or the cap is hit.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub idle: Duration,
    pub max: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            idle: Duration::from_secs(1),
            max: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct BatchTrigger {
    sender: mpsc::Sender<()>,
}

impl BatchTrigger {
    /// Signals that a provisionable pod was observed. Coalesces when the
    /// channel is full.
    pub fn poke(&self) {
        let _ = self.sender.try_send(());
    }
}

pub struct Batcher {
    receiver: mpsc::Receiver<()>,
}

pub fn batch_channel() -> (BatchTrigger, Batcher) {
    let (sender, receiver) = mpsc::channel(64);
    (BatchTrigger { sender }, Batcher { receiver })
}

impl Batcher {
    /// Blocks for the first signal, then soaks further signals until the
    /// idle gap elapses or the window reaches its cap. Returns false when
    /// every trigger is gone.
    pub async fn wait(&mut self, config: &BatchConfig) -> bool {
        if self.receiver.recv().await.is_none() {
            return false;
        }
        let window_start = Instant::now();
        loop {
            let remaining = match config.max.checked_sub(window_start.elapsed()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return true,
            };
            let gap = config.idle.min(remaining);
            tokio::select! {
                received = self.receiver.recv() => {
                    if received.is_none() {
                        return true;
                    }
                }
                _ = sleep(gap) => return true,
            }
        }
    }
}

#[derive(Debug)]
pub enum ProvisionError {
    Cloud(CloudError),
    Client(ClientError),
}

impl Display for ProvisionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionError::Cloud(err) => write!(f, "cloud provider: {}", err),
            ProvisionError::Client(err) => write!(f, "cluster client: {}", err),
        }
    }
}

impl Error for ProvisionError {}

impl From<CloudError> for ProvisionError {
    fn from(err: CloudError) -> Self {
        ProvisionError::Cloud(err)
    }
}

impl From<ClientError> for ProvisionError {
    fn from(err: ClientError) -> Self {
        ProvisionError::Client(err)
    }
}

/// What one provisioning pass did.
#[derive(Debug, Default)]
pub struct ProvisionResult {
    pub created_claims: Vec<String>,
    pub bound_pods: usize,
    pub unschedulable: usize,
}

/// Batches unschedulable pods, runs the scheduling simulator, and
/// materializes the plan as node claims.
pub struct Provisioner {
    client: Arc<ClusterClient>,
    state: Arc<ClusterState>,
    cloud: Arc<dyn CloudProvider>,
    recorder: Arc<EventRecorder>,
    sequence: AtomicU64,
}

impl Provisioner {
    pub fn new(
        client: Arc<ClusterClient>,
        state: Arc<ClusterState>,
        cloud: Arc<dyn CloudProvider>,
        recorder: Arc<EventRecorder>,
    ) -> Self {
        Provisioner {
            client,
            state,
            cloud,
            recorder,
            sequence: AtomicU64::new(1),
        }
    }

    /// One batch commit: plan against a consistent snapshot and create the
    /// claims the plan calls for. Running twice on an unchanged pod set is a
    /// no-op thanks to nominations.
    pub fn provision_once(&self) -> Result<ProvisionResult, ProvisionError> {
        if !self.state.synced() {
            log::debug!("provisioner waiting for cluster state sync");
            return Ok(ProvisionResult::default());
        }
        let pending = self.pending_pods();
        if pending.is_empty() {
            return Ok(ProvisionResult::default());
        }

        let started = Instant::now();
        let mut pools: Vec<NodePool> = self
            .client
            .nodepools
            .list()
            .into_iter()
            .filter(|pool| match pool.validate() {
                Ok(()) => true,
                Err(err) => {
                    log::warn!("skipping invalid nodepool {}: {}", pool.metadata.name, err);
                    false
                }
            })
            .collect();
        order_by_weight(&mut pools);

        let mut instance_types: HashMap<String, Vec<InstanceType>> = HashMap::new();
        for pool in &pools {
            let types = self.cloud.instance_types(pool).map_err(|err| {
                metrics::observe_provisioning(started.elapsed(), false);
                ProvisionError::Cloud(err)
            })?;
            instance_types.insert(pool.metadata.name.clone(), types);
        }

        let snapshot = self.state.snapshot();
        let bound: Vec<Pod> = self
            .client
            .pods
            .list()
            .into_iter()
            .filter(|pod| pod.spec.node_name.is_some() && !pod.is_terminal())
            .collect();

        let scheduler = Scheduler::new(&pools, &instance_types);
        let mut plan = scheduler.plan(pending, &snapshot, &bound);
        let constraint_failures = plan.unschedulable.len();
        self.enforce_limits(&pools, &mut plan);

        let mut result = ProvisionResult {
            unschedulable: plan.unschedulable.len(),
            ..Default::default()
        };
        let pool_index: HashMap<&str, &NodePool> = pools
            .iter()
            .map(|pool| (pool.metadata.name.as_str(), pool))
            .collect();

        for binding in &plan.bindings {
            let target = binding
                .node_name
                .clone()
                .unwrap_or_else(|| strip_state_key(&binding.node_key));
            for pod_name in &binding.pods {
                if let Some(pod) = self.client.pods.get(pod_name) {
                    self.state.nominate_pod(&target, &pod, NOMINATION_TTL);
                    result.bound_pods += 1;
                }
            }
        }

        for proposal in &plan.proposals {
            let Some(pool) = pool_index.get(proposal.pool.as_str()) else {
                continue;
            };
            let claim = self.materialize(proposal, pool)?;
            for pod_name in &proposal.pods {
                if let Some(pod) = self.client.pods.get(pod_name) {
                    self.state
                        .nominate_pod(&claim.metadata.name, &pod, NOMINATION_TTL);
                }
            }
            result.created_claims.push(claim.metadata.name.clone());
        }

        for unschedulable in &plan.unschedulable {
            self.recorder.publish(
                format!("Pod/{}", unschedulable.pod),
                "SchedulingFailed",
                unschedulable.reason.clone(),
            );
        }
        if constraint_failures > 0 {
            metrics::record_unschedulable("constraints", constraint_failures as u64);
        }
        metrics::observe_provisioning(started.elapsed(), true);
        log::info!(
            "provisioned {} claims, nominated {} pods onto existing nodes, {} unschedulable",
            result.created_claims.len(),
            result.bound_pods,
            result.unschedulable
        );
        Ok(result)
    }

    /// Pending pods not already covered by a live nomination.
    fn pending_pods(&self) -> Vec<Pod> {
        self.client
            .pods
            .list()
            .into_iter()
            .filter(|pod| pod.is_provisionable() && !self.state.is_nominated(&pod.metadata.name))
            .collect()
    }

    /// Drops proposals that would push a pool past its limits, counting the
    /// currently launched capacity. Later proposals are lower priority, so
    /// they are the ones trimmed.
    fn enforce_limits(&self, pools: &[NodePool], plan: &mut Plan) {
        let mut usage: HashMap<String, Resources> = HashMap::new();
        for claim in self.client.nodeclaims.list() {
            if claim.is_terminating() {
                continue;
            }
            let capacity = if claim.status.capacity.is_zero() {
                claim.spec.resources
            } else {
                claim.status.capacity
            };
            *usage.entry(claim.spec.nodepool.clone()).or_default() += capacity;
        }
        let limits: HashMap<&str, &Resources> = pools
            .iter()
            .filter_map(|pool| {
                pool.spec
                    .limits
                    .as_ref()
                    .map(|limits| (pool.metadata.name.as_str(), limits))
            })
            .collect();

        let mut kept: Vec<NodeClaimProposal> = Vec::with_capacity(plan.proposals.len());
        for proposal in plan.proposals.drain(..) {
            let Some(limit) = limits.get(proposal.pool.as_str()) else {
                kept.push(proposal);
                continue;
            };
            let planned_capacity = proposal
                .instance_types
                .first()
                .map(|instance_type| instance_type.capacity)
                .unwrap_or(proposal.requests);
            let pool_usage = usage.entry(proposal.pool.clone()).or_default();
            let projected = *pool_usage + planned_capacity;
            if let Some(excess) = limit.exceeded_by(&projected) {
                log::info!(
                    "trimming proposal for nodepool {}: {}",
                    proposal.pool,
                    excess
                );
                metrics::record_unschedulable("limits", proposal.pods.len() as u64);
                for pod in proposal.pods {
                    plan.unschedulable.push(
                        crate::cirrus::provisioning::scheduler::Unschedulable {
                            pod,
                            reason: format!("nodepool {}: {}", proposal.pool, LIMITS_EXCEEDED_REASON),
                        },
                    );
                }
                continue;
            }
            *pool_usage = projected;
            kept.push(proposal);
        }
        plan.proposals = kept;
    }

    /// Persists the node claim for a proposal.
    fn materialize(
        &self,
        proposal: &NodeClaimProposal,
        pool: &NodePool,
    ) -> Result<NodeClaim, ProvisionError> {
        let name = format!(
            "{}-{}",
            pool.metadata.name,
            self.sequence.fetch_add(1, Ordering::Relaxed)
        );
        let created = self
            .client
            .nodeclaims
            .create(claim_from_proposal(proposal, pool, &name))?;
        // Register the in-flight claim immediately so nominations land on it
        // before the watch echo arrives.
        self.state.update_nodeclaim(created.clone());
        Ok(created)
    }
}

/// Builds the node claim a proposal describes, recording the pool template
/// hash for later drift detection.
pub fn claim_from_proposal(
    proposal: &NodeClaimProposal,
    pool: &NodePool,
    name: &str,
) -> NodeClaim {
    let mut metadata = ObjectMeta::named(name);
    metadata.labels.extend(pool.spec.template.labels.clone());
    metadata
        .labels
        .insert(NODEPOOL_LABEL.to_string(), pool.metadata.name.clone());
    metadata
        .annotations
        .extend(pool.spec.template.annotations.clone());
    metadata
        .annotations
        .insert(NODEPOOL_HASH_ANNOTATION.to_string(), pool.hash());
    metadata.add_finalizer(TERMINATION_FINALIZER);

    NodeClaim {
        metadata,
        spec: NodeClaimSpec {
            nodepool: pool.metadata.name.clone(),
            requirements: proposal.requirements.clone(),
            resources: proposal.requests,
            taints: proposal.taints.clone(),
            startup_taints: proposal.startup_taints.clone(),
        },
        ..Default::default()
    }
}

fn strip_state_key(key: &str) -> String {
    key.trim_start_matches("claim:")
        .trim_start_matches("node:")
        .to_string()
}
