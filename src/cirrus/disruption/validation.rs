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

use std::collections::{HashMap, HashSet};

use crate::cirrus::api::nodepool::NodePool;
use crate::cirrus::api::pod::Pod;
use crate::cirrus::cloud::InstanceType;
use crate::cirrus::cluster::state::NodeSnapshot;
use crate::cirrus::disruption::candidates::Candidate;
use crate::cirrus::provisioning::scheduler::{NodeClaimProposal, Scheduler};

/// Outcome of re-running the scheduling simulator with a candidate set
/// removed from the cluster.
#[derive(Debug)]
pub struct SimulationResult {
    /// True when every evicted pod found a home.
    pub all_reschedulable: bool,
    /// Replacement claims the simulated plan wants launched.
    pub proposals: Vec<NodeClaimProposal>,
}

impl SimulationResult {
    /// Expected hourly cost of the proposed replacements.
    pub fn replacement_cost(&self) -> f64 {
        self.proposals.iter().map(NodeClaimProposal::price).sum()
    }

    /// True when the candidates' pods all fit on capacity that already
    /// exists, with nothing new launched.
    pub fn fits_existing(&self) -> bool {
        self.all_reschedulable && self.proposals.is_empty()
    }
}

/// Re-runs the scheduler as if `candidates` were gone: their nodes are
/// marked unavailable and their reschedulable pods become the pending set.
pub fn simulate_removal(
    candidates: &[&Candidate],
    snapshot: &[NodeSnapshot],
    pools: &[NodePool],
    instance_types: &HashMap<String, Vec<InstanceType>>,
    bound_pods: &[Pod],
) -> SimulationResult {
    let removed: HashSet<&str> = candidates
        .iter()
        .map(|candidate| candidate.name())
        .collect();

    let simulated: Vec<NodeSnapshot> = snapshot
        .iter()
        .map(|node| {
            let mut node = node.clone();
            if node
                .claim_name
                .as_deref()
                .is_some_and(|name| removed.contains(name))
            {
                node.marked_for_deletion = true;
            }
            node
        })
        .collect();

    let pending: Vec<Pod> = candidates
        .iter()
        .flat_map(|candidate| candidate.pods.iter())
        .map(|pod| {
            let mut pod = pod.clone();
            // Evicted pods are rescheduled from scratch.
            pod.spec.node_name = None;
            pod
        })
        .collect();

    let still_bound: Vec<Pod> = bound_pods
        .iter()
        .filter(|pod| {
            !candidates
                .iter()
                .any(|candidate| candidate.pods.iter().any(|p| p.metadata.name == pod.metadata.name))
        })
        .cloned()
        .collect();

    let scheduler = Scheduler::new(pools, instance_types);
    let plan = scheduler.plan(pending, &simulated, &still_bound);

    SimulationResult {
        all_reschedulable: plan.unschedulable.is_empty(),
        proposals: plan.proposals,
    }
}
