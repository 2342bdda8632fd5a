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

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::cirrus::api::node::Node;
use crate::cirrus::api::nodeclaim::{ConditionType, NodeClaim};
use crate::cirrus::api::nodepool::NodePool;
use crate::cirrus::api::object::{CAPACITY_TYPE_LABEL, INSTANCE_TYPE_LABEL, ZONE_LABEL};
use crate::cirrus::api::pod::Pod;
use crate::cirrus::cloud::InstanceType;
use crate::cirrus::cluster::client::ClusterClient;
use crate::cirrus::cluster::state::{ClusterState, NodeSnapshot};

/// A node the disruption engine may act on, with everything validation and
/// cost comparison need resolved up front.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub claim: NodeClaim,
    pub node: Option<Node>,
    pub pool: NodePool,
    /// Reschedulable pods bound to the candidate's node.
    pub pods: Vec<Pod>,
    /// Current hourly price of the backing offering, when resolvable.
    pub price: Option<f64>,
    /// When the condition that made this a candidate transitioned.
    pub transition_time: DateTime<Utc>,
}

impl Candidate {
    pub fn name(&self) -> &str {
        &self.claim.metadata.name
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}

/// Builds the eligible candidate set. With a condition, only claims whose
/// condition is true qualify (ordered later by its transition time); without
/// one, every eligible claim is considered, as consolidation wants. Shared
/// eligibility applies: initialized, not already going away, and nothing on
/// the node opted out of disruption.
pub fn collect(
    client: &ClusterClient,
    state: &ClusterState,
    pools: &HashMap<String, NodePool>,
    instance_types: &HashMap<String, Vec<InstanceType>>,
    condition: Option<ConditionType>,
) -> Vec<Candidate> {
    let snapshot = state.snapshot();
    let by_claim: HashMap<&str, &NodeSnapshot> = snapshot
        .iter()
        .filter_map(|node| node.claim_name.as_deref().map(|name| (name, node)))
        .collect();

    let mut candidates = Vec::new();
    for claim in client.nodeclaims.list() {
        let transition_time = match condition {
            Some(condition) => {
                let Some(condition_state) = claim.condition(condition) else {
                    continue;
                };
                if !condition_state.status {
                    continue;
                }
                condition_state.last_transition
            }
            None => claim
                .condition(ConditionType::Initialized)
                .map(|c| c.last_transition)
                .or(claim.metadata.creation_timestamp)
                .unwrap_or_else(Utc::now),
        };
        if !eligible(&claim, &by_claim) {
            continue;
        }
        let Some(pool) = pools.get(&claim.spec.nodepool) else {
            continue;
        };
        let node = state
            .node_name_for_claim(&claim.metadata.name)
            .and_then(|name| client.nodes.get(&name));
        if node.as_ref().is_some_and(|node| node.has_do_not_disrupt()) {
            continue;
        }
        let pods = bound_pods(client, state, &claim.metadata.name);
        if pods.iter().any(|pod| pod.has_do_not_disrupt()) {
            continue;
        }
        let price = resolve_price(&claim, instance_types.get(&claim.spec.nodepool));
        candidates.push(Candidate {
            pool: pool.clone(),
            node,
            pods,
            price,
            transition_time,
            claim,
        });
    }
    candidates
}

fn eligible(claim: &NodeClaim, by_claim: &HashMap<&str, &NodeSnapshot>) -> bool {
    if !claim.is_initialized() || claim.is_terminating() {
        return false;
    }
    if claim.metadata.annotations.get(
        crate::cirrus::api::object::DO_NOT_DISRUPT_ANNOTATION,
    ).is_some_and(|value| value == "true")
    {
        return false;
    }
    match by_claim.get(claim.metadata.name.as_str()) {
        Some(snapshot) => !snapshot.marked_for_deletion,
        // Claims the state has not caught up with yet are left alone.
        None => false,
    }
}

/// The reschedulable pods bound to a claim's node, resolved to full objects.
pub fn bound_pods(client: &ClusterClient, state: &ClusterState, claim_name: &str) -> Vec<Pod> {
    let mut names: Vec<String> = Vec::new();
    state.for_each_node(|node| {
        if node.claim.as_ref().map(|claim| claim.metadata.name.as_str()) == Some(claim_name) {
            names.extend(node.pod_names().cloned());
        }
    });
    names
        .iter()
        .filter_map(|name| client.pods.get(name))
        .filter(|pod| pod.is_reschedulable())
        .collect()
}

/// Sorted names of the non-daemon pods currently bound to a claim's node,
/// used to detect drift between validation and execution.
pub fn pod_names_for_claim(state: &ClusterState, claim_name: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    state.for_each_node(|node| {
        if node.claim.as_ref().map(|claim| claim.metadata.name.as_str()) == Some(claim_name) {
            names.extend(node.pod_names().cloned());
        }
    });
    names.sort();
    names
}

/// Resolves the hourly price of the offering backing a claim from its
/// resolved labels.
fn resolve_price(claim: &NodeClaim, catalog: Option<&Vec<InstanceType>>) -> Option<f64> {
    let catalog = catalog?;
    let type_name = claim.status.labels.get(INSTANCE_TYPE_LABEL)?;
    let zone = claim.status.labels.get(ZONE_LABEL)?;
    let capacity_type = claim.status.labels.get(CAPACITY_TYPE_LABEL)?;
    let instance_type = catalog.iter().find(|candidate| &candidate.name == type_name)?;
    instance_type
        .offerings
        .iter()
        .find(|offering| {
            &offering.zone == zone && offering.capacity_type.as_label() == capacity_type
        })
        .map(|offering| offering.price)
}

/// Non-empty candidates go earliest transition first, names breaking ties,
/// so repeated ticks act deterministically.
pub fn order_for_disruption(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.transition_time
            .cmp(&b.transition_time)
            .then_with(|| a.claim.metadata.name.cmp(&b.claim.metadata.name))
    });
}
