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

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

use crate::cirrus::api::nodepool::NodePool;
use crate::cirrus::api::object::{
    tolerates_all, Taint, HOSTNAME_LABEL, INSTANCE_TYPE_LABEL, UNREGISTERED_TAINT_KEY, ZONE_LABEL,
};
use crate::cirrus::api::pod::Pod;
use crate::cirrus::api::requirements::{Requirement, Requirements};
use crate::cirrus::api::resources::Resources;
use crate::cirrus::cloud::InstanceType;
use crate::cirrus::cluster::state::NodeSnapshot;
use crate::cirrus::provisioning::topology::Topology;

/// Offerings kept per proposed claim so the cloud provider can substitute
/// within budget.
pub const MAX_INSTANCE_TYPES_PER_CLAIM: usize = 20;

/// A pod placed onto capacity that already exists.
#[derive(Debug, Clone)]
pub struct Binding {
    pub node_key: String,
    pub node_name: Option<String>,
    pub pods: Vec<String>,
}

/// A virtual node the plan wants materialized as a node claim.
#[derive(Debug, Clone)]
pub struct NodeClaimProposal {
    pub pool: String,
    pub requirements: Requirements,
    /// Feasible types whose allocatable dominates the packed requests,
    /// cheapest first.
    pub instance_types: Vec<InstanceType>,
    pub pods: Vec<String>,
    pub requests: Resources,
    pub taints: Vec<Taint>,
    pub startup_taints: Vec<Taint>,
}

impl NodeClaimProposal {
    /// Expected hourly price, taken from the cheapest surviving offering.
    pub fn price(&self) -> f64 {
        self.instance_types
            .iter()
            .filter_map(InstanceType::cheapest_price)
            .min_by(|a, b| a.total_cmp(b))
            .unwrap_or(f64::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct Unschedulable {
    pub pod: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub bindings: Vec<Binding>,
    pub proposals: Vec<NodeClaimProposal>,
    pub unschedulable: Vec<Unschedulable>,
}

struct ExistingNode {
    key: String,
    node_name: Option<String>,
    labels: BTreeMap<String, String>,
    taints: Vec<Taint>,
    available: Resources,
    pods: Vec<String>,
}

struct VirtualNode {
    name: String,
    pool: String,
    requirements: Requirements,
    feasible: Vec<InstanceType>,
    allocated: Resources,
    pods: Vec<String>,
    taints: Vec<Taint>,
    startup_taints: Vec<Taint>,
}

/// The provisioning simulator: bin-packs pending pods onto existing capacity
/// first, then onto virtual nodes drawn from the pools' offering catalogs.
pub struct Scheduler<'a> {
    /// Pools ordered by descending weight, names breaking ties.
    pools: &'a [NodePool],
    /// Offering catalog per pool name.
    instance_types: &'a HashMap<String, Vec<InstanceType>>,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        pools: &'a [NodePool],
        instance_types: &'a HashMap<String, Vec<InstanceType>>,
    ) -> Self {
        Scheduler {
            pools,
            instance_types,
        }
    }

    /// Produces a plan for `pods` against the given cluster snapshot.
    /// `bound_pods` seeds anti-affinity occupancy from workloads already
    /// placed in the cluster.
    pub fn plan(&self, mut pods: Vec<Pod>, snapshot: &[NodeSnapshot], bound_pods: &[Pod]) -> Plan {
        let mut topology = Topology::new();
        self.register_catalog_domains(&mut topology);

        let mut existing = build_existing_nodes(snapshot);
        for node in &existing {
            if let Some(zone) = node.labels.get(ZONE_LABEL) {
                topology.register_domain(ZONE_LABEL, zone);
            }
            topology.register_domain(HOSTNAME_LABEL, &node.key);
        }
        seed_bound_pods(&mut topology, &pods, bound_pods, snapshot);

        // First-fit-decreasing: largest requests first, names break ties so
        // planning is deterministic.
        pods.sort_by(|a, b| {
            b.spec
                .requests
                .cpu
                .cmp(&a.spec.requests.cpu)
                .then_with(|| b.spec.requests.memory.cmp(&a.spec.requests.memory))
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });

        let mut virtual_nodes: Vec<VirtualNode> = Vec::new();
        let mut unschedulable: Vec<Unschedulable> = Vec::new();
        let mut failure_cache: HashMap<u64, String> = HashMap::new();

        for pod in &pods {
            let group = signature(pod);
            if let Some(reason) = failure_cache.get(&group) {
                unschedulable.push(Unschedulable {
                    pod: pod.metadata.name.clone(),
                    reason: reason.clone(),
                });
                continue;
            }
            let requirements = match pod_requirements(pod) {
                Ok(requirements) => requirements,
                Err(reason) => {
                    failure_cache.insert(group, reason.clone());
                    unschedulable.push(Unschedulable {
                        pod: pod.metadata.name.clone(),
                        reason,
                    });
                    continue;
                }
            };

            if try_existing(pod, group, &requirements, &mut existing, &mut topology) {
                continue;
            }
            if try_virtual(pod, group, &requirements, &mut virtual_nodes, &mut topology) {
                continue;
            }
            match self.open_virtual_node(pod, group, &requirements, &mut virtual_nodes, &mut topology)
            {
                Ok(()) => {}
                Err(reason) => {
                    failure_cache.insert(group, reason.clone());
                    unschedulable.push(Unschedulable {
                        pod: pod.metadata.name.clone(),
                        reason,
                    });
                }
            }
        }

        Plan {
            bindings: existing
                .into_iter()
                .filter(|node| !node.pods.is_empty())
                .map(|node| Binding {
                    node_key: node.key,
                    node_name: node.node_name,
                    pods: node.pods,
                })
                .collect(),
            proposals: virtual_nodes.into_iter().map(finalize_proposal).collect(),
            unschedulable,
        }
    }

    fn register_catalog_domains(&self, topology: &mut Topology) {
        for types in self.instance_types.values() {
            for instance_type in types {
                for offering in instance_type.available_offerings() {
                    topology.register_domain(ZONE_LABEL, &offering.zone);
                }
            }
        }
    }

    /// Walks pools in weight order and opens a fresh virtual node on the
    /// first pool compatible with the pod. The returned error carries the
    /// first constraint that failed.
    fn open_virtual_node(
        &self,
        pod: &Pod,
        group: u64,
        requirements: &Requirements,
        virtual_nodes: &mut Vec<VirtualNode>,
        topology: &mut Topology,
    ) -> Result<(), String> {
        let mut first_failure: Option<String> = None;
        let fail = |failure: &mut Option<String>, message: String| {
            if failure.is_none() {
                *failure = Some(message);
            }
        };

        for pool in self.pools {
            let pool_name = &pool.metadata.name;
            let template = &pool.spec.template;
            if !tolerates_all(&pod.spec.tolerations, &template.taints) {
                fail(
                    &mut first_failure,
                    format!("nodepool {}: pod does not tolerate template taints", pool_name),
                );
                continue;
            }
            let merged = match template.requirements.intersect(requirements) {
                Ok(merged) => merged,
                Err(conflict) => {
                    fail(&mut first_failure, format!("nodepool {}: {}", pool_name, conflict));
                    continue;
                }
            };
            let catalog = self
                .instance_types
                .get(pool_name)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let feasible = feasible_types(catalog, &merged, pod.spec.requests);
            if feasible.is_empty() {
                fail(
                    &mut first_failure,
                    format!(
                        "nodepool {}: no instance type satisfies requests {} within the pod's constraints",
                        pool_name, pod.spec.requests
                    ),
                );
                continue;
            }

            let name = format!("virtual-{}", virtual_nodes.len());
            let mut node = VirtualNode {
                name,
                pool: pool_name.clone(),
                requirements: merged,
                feasible,
                allocated: Resources::ZERO,
                pods: Vec::new(),
                taints: template.taints.clone(),
                startup_taints: template.startup_taints.clone(),
            };
            if !place_on_virtual(pod, group, requirements, &mut node, topology, true) {
                fail(
                    &mut first_failure,
                    format!(
                        "nodepool {}: topology constraints leave no feasible domain",
                        pool_name
                    ),
                );
                continue;
            }
            virtual_nodes.push(node);
            return Ok(());
        }

        Err(first_failure.unwrap_or_else(|| "no nodepools configured".to_string()))
    }
}

fn build_existing_nodes(snapshot: &[NodeSnapshot]) -> Vec<ExistingNode> {
    snapshot
        .iter()
        .filter(|node| !node.marked_for_deletion)
        .map(|node| {
            // In-flight capacity the controller launched itself is usable in
            // simulation even while the startup taint is still present.
            let taints: Vec<Taint> = node
                .taints
                .iter()
                .filter(|taint| {
                    !(node.claim_name.is_some() && taint.key == UNREGISTERED_TAINT_KEY)
                })
                .cloned()
                .collect();
            ExistingNode {
                key: node.key.clone(),
                node_name: node.node_name.clone(),
                labels: node.labels.clone(),
                taints,
                available: node.available,
                pods: Vec::new(),
            }
        })
        .collect()
}

fn seed_bound_pods(
    topology: &mut Topology,
    pending: &[Pod],
    bound_pods: &[Pod],
    snapshot: &[NodeSnapshot],
) {
    let all_terms: Vec<_> = pending
        .iter()
        .flat_map(|pod| pod.spec.anti_affinity.iter().cloned())
        .collect();
    if all_terms.is_empty() {
        return;
    }
    for pod in bound_pods {
        let Some(node_name) = pod.spec.node_name.as_deref() else {
            continue;
        };
        let Some(node) = snapshot
            .iter()
            .find(|node| node.node_name.as_deref() == Some(node_name))
        else {
            continue;
        };
        let mut domains = BTreeMap::from([(HOSTNAME_LABEL.to_string(), node.key.clone())]);
        if let Some(zone) = node.labels.get(ZONE_LABEL) {
            domains.insert(ZONE_LABEL.to_string(), zone.clone());
        }
        topology.seed_bound_pod(&pod.metadata.labels, &domains, &all_terms);
    }
}

/// The pod's own scheduling constraints as a requirement set.
fn pod_requirements(pod: &Pod) -> Result<Requirements, String> {
    let mut requirements = Requirements::from_selector(&pod.spec.node_selector);
    for requirement in &pod.spec.node_requirements {
        requirements
            .add(requirement.clone())
            .map_err(|conflict| format!("conflicting pod requirements: {}", conflict))?;
    }
    Ok(requirements)
}

fn try_existing(
    pod: &Pod,
    group: u64,
    requirements: &Requirements,
    existing: &mut [ExistingNode],
    topology: &mut Topology,
) -> bool {
    for node in existing.iter_mut() {
        if !tolerates_all(&pod.spec.tolerations, &node.taints) {
            continue;
        }
        if !requirements.matches_labels(&node.labels) {
            continue;
        }
        if !pod.spec.requests.fits(&node.available) {
            continue;
        }
        let Some(domains) = node_domains(pod, &node.labels, &node.key) else {
            continue;
        };
        if !topology_permits(pod, group, &domains, topology) {
            continue;
        }
        topology.commit(group, pod, &domains);
        node.available = node.available.saturating_sub(&pod.spec.requests);
        node.pods.push(pod.metadata.name.clone());
        return true;
    }
    false
}

fn try_virtual(
    pod: &Pod,
    group: u64,
    requirements: &Requirements,
    virtual_nodes: &mut [VirtualNode],
    topology: &mut Topology,
) -> bool {
    for node in virtual_nodes.iter_mut() {
        if place_on_virtual(pod, group, requirements, node, topology, false) {
            return true;
        }
    }
    false
}

/// Attempts to pack the pod onto a virtual node, tightening the node's
/// requirement set and feasible instance types on success. A rejected trial
/// leaves the node untouched so the caller can try the next candidate.
fn place_on_virtual(
    pod: &Pod,
    group: u64,
    requirements: &Requirements,
    node: &mut VirtualNode,
    topology: &mut Topology,
    fresh: bool,
) -> bool {
    if !fresh && !tolerates_all(&pod.spec.tolerations, &node.taints) {
        return false;
    }
    let mut merged = match node.requirements.intersect(requirements) {
        Ok(merged) => merged,
        Err(_) => return false,
    };
    let allocated = node.allocated + pod.spec.requests;
    let mut feasible = feasible_types(&node.feasible, &merged, allocated);
    if feasible.is_empty() {
        return false;
    }

    // Topology keys other than zone and hostname cannot be resolved for a
    // node that does not exist yet.
    let supported = pod
        .spec
        .topology_spread
        .iter()
        .map(|constraint| constraint.topology_key.as_str())
        .chain(pod.spec.anti_affinity.iter().map(|term| term.topology_key.as_str()))
        .all(|key| key == ZONE_LABEL || key == HOSTNAME_LABEL);
    if !supported {
        return false;
    }

    let mut domains = BTreeMap::from([(HOSTNAME_LABEL.to_string(), node.name.clone())]);
    let needs_zone = pod
        .spec
        .topology_spread
        .iter()
        .any(|constraint| constraint.topology_key == ZONE_LABEL)
        || pod
            .spec
            .anti_affinity
            .iter()
            .any(|term| term.topology_key == ZONE_LABEL);
    if needs_zone {
        let candidate_zones: BTreeSet<String> = feasible
            .iter()
            .flat_map(|instance_type| instance_type.available_offerings())
            .filter(|offering| merged.allows(ZONE_LABEL, &offering.zone))
            .map(|offering| offering.zone.clone())
            .collect();
        let Some(zone) = topology.best_domain(group, ZONE_LABEL, &candidate_zones, pod) else {
            return false;
        };
        if merged
            .add(Requirement::in_values(ZONE_LABEL, [zone.clone()]))
            .is_err()
        {
            return false;
        }
        feasible = feasible_types(&feasible, &merged, allocated);
        if feasible.is_empty() {
            return false;
        }
        domains.insert(ZONE_LABEL.to_string(), zone);
    }

    if !topology_permits(pod, group, &domains, topology) {
        return false;
    }

    topology.commit(group, pod, &domains);
    node.requirements = merged;
    node.feasible = feasible;
    node.allocated = allocated;
    node.pods.push(pod.metadata.name.clone());
    true
}

/// Instance types whose allocatable dominates `allocated` and which still
/// have an available offering permitted by the requirements.
fn feasible_types(
    catalog: &[InstanceType],
    requirements: &Requirements,
    allocated: Resources,
) -> Vec<InstanceType> {
    use crate::cirrus::api::object::CAPACITY_TYPE_LABEL;
    catalog
        .iter()
        .filter(|instance_type| {
            requirements.allows(INSTANCE_TYPE_LABEL, &instance_type.name)
                && allocated.fits(&instance_type.allocatable())
                && instance_type.available_offerings().any(|offering| {
                    requirements.allows(ZONE_LABEL, &offering.zone)
                        && requirements
                            .allows(CAPACITY_TYPE_LABEL, offering.capacity_type.as_label())
                })
        })
        .cloned()
        .collect()
}

/// Domains of a concrete node for every topology key the pod references;
/// `None` when a referenced key has no resolvable domain.
fn node_domains(
    pod: &Pod,
    labels: &BTreeMap<String, String>,
    node_key: &str,
) -> Option<BTreeMap<String, String>> {
    let mut domains = BTreeMap::new();
    let keys = pod
        .spec
        .topology_spread
        .iter()
        .map(|constraint| constraint.topology_key.as_str())
        .chain(pod.spec.anti_affinity.iter().map(|term| term.topology_key.as_str()));
    for key in keys {
        let domain = if key == HOSTNAME_LABEL {
            Some(node_key.to_string())
        } else {
            labels.get(key).cloned()
        };
        match domain {
            Some(domain) => {
                domains.insert(key.to_string(), domain);
            }
            None => return None,
        }
    }
    Some(domains)
}

fn topology_permits(
    pod: &Pod,
    group: u64,
    domains: &BTreeMap<String, String>,
    topology: &Topology,
) -> bool {
    for constraint in &pod.spec.topology_spread {
        let Some(domain) = domains.get(&constraint.topology_key) else {
            return false;
        };
        if !topology.spread_ok(group, constraint, domain) {
            return false;
        }
    }
    for term in &pod.spec.anti_affinity {
        if pod.metadata.labels.get(&term.label_key) != Some(&term.label_value) {
            continue;
        }
        let Some(domain) = domains.get(&term.topology_key) else {
            return false;
        };
        if !topology.anti_ok(term, domain) {
            return false;
        }
    }
    true
}

fn finalize_proposal(node: VirtualNode) -> NodeClaimProposal {
    let mut types = node.feasible;
    types.sort_by(|a, b| {
        let price_a = a.cheapest_price().unwrap_or(f64::MAX);
        let price_b = b.cheapest_price().unwrap_or(f64::MAX);
        price_a.total_cmp(&price_b).then_with(|| a.name.cmp(&b.name))
    });
    types.truncate(MAX_INSTANCE_TYPES_PER_CLAIM);

    let mut requirements = node.requirements;
    let names: Vec<String> = types.iter().map(|t| t.name.clone()).collect();
    if !names.is_empty() {
        // Narrowing to the kept offerings cannot conflict.
        let _ = requirements.add(Requirement::in_values(INSTANCE_TYPE_LABEL, names));
    }

    NodeClaimProposal {
        pool: node.pool,
        requirements,
        instance_types: types,
        pods: node.pods,
        requests: node.allocated,
        taints: node.taints,
        startup_taints: node.startup_taints,
    }
}

/// Pods with identical scheduling constraints share one signature and are
/// bin-packed together; a signature that fails to place caches its reason.
fn signature(pod: &Pod) -> u64 {
    let payload = serde_json::json!({
        "requests": pod.spec.requests,
        "nodeSelector": pod.spec.node_selector,
        "nodeRequirements": pod.spec.node_requirements,
        "tolerations": pod.spec.tolerations,
        "topologySpread": pod.spec.topology_spread,
        "antiAffinity": pod.spec.anti_affinity,
    });
    let mut hasher = DefaultHasher::new();
    payload.to_string().hash(&mut hasher);
    hasher.finish()
}
