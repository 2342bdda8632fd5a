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

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::cirrus::api::node::Node;
use crate::cirrus::api::nodeclaim::NodeClaim;
use crate::cirrus::api::object::Taint;
use crate::cirrus::api::pod::Pod;
use crate::cirrus::api::resources::Resources;

/// Default lifetime of a pod nomination.
pub const NOMINATION_TTL: Duration = Duration::from_secs(20);

/// One tracked node, merged from the node claim and the matching node
/// object. The two sides cross-reference only through the provider id.
#[derive(Debug, Default)]
pub struct StateNode {
    pub claim: Option<NodeClaim>,
    pub node: Option<Node>,
    pub marked_for_deletion: bool,
    pod_requests: Resources,
    daemon_overhead: Resources,
    pods: BTreeSet<String>,
}

impl StateNode {
    pub fn name(&self) -> &str {
        if let Some(claim) = &self.claim {
            return &claim.metadata.name;
        }
        self.node
            .as_ref()
            .map(|node| node.metadata.name.as_str())
            .unwrap_or("")
    }

    pub fn node_name(&self) -> Option<&str> {
        self.node.as_ref().map(|node| node.metadata.name.as_str())
    }

    pub fn provider_id(&self) -> Option<&str> {
        if let Some(node) = &self.node {
            if let Some(id) = &node.provider_id {
                return Some(id);
            }
        }
        self.claim
            .as_ref()
            .and_then(|claim| claim.status.provider_id.as_deref())
    }

    pub fn allocatable(&self) -> Resources {
        if let Some(node) = &self.node {
            if !node.allocatable.is_zero() {
                return node.allocatable;
            }
        }
        self.claim
            .as_ref()
            .map(|claim| claim.status.allocatable)
            .unwrap_or_default()
    }

    /// Merged labels; the node object wins where both carry a key.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        if let Some(claim) = &self.claim {
            labels.extend(claim.metadata.labels.clone());
            labels.extend(claim.status.labels.clone());
        }
        if let Some(node) = &self.node {
            labels.extend(node.metadata.labels.clone());
        }
        labels
    }

    pub fn taints(&self) -> Vec<Taint> {
        if let Some(node) = &self.node {
            return node.taints.clone();
        }
        self.claim
            .as_ref()
            .map(|claim| {
                claim
                    .spec
                    .taints
                    .iter()
                    .chain(claim.spec.startup_taints.iter())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn initialized(&self) -> bool {
        match &self.claim {
            Some(claim) => claim.is_initialized(),
            None => self.node.as_ref().is_some_and(|node| node.ready),
        }
    }

    pub fn non_daemon_pod_count(&self) -> usize {
        self.pods.len()
    }

    pub fn pod_names(&self) -> impl Iterator<Item = &String> {
        self.pods.iter()
    }

    pub fn daemon_overhead(&self) -> Resources {
        self.daemon_overhead
    }

    pub fn pod_requests(&self) -> Resources {
        self.pod_requests
    }
}

/// A cloned, lock-free view of one state node handed to simulation.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub key: String,
    pub claim_name: Option<String>,
    pub node_name: Option<String>,
    pub provider_id: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub allocatable: Resources,
    /// Allocatable minus daemon overhead, bound pod requests, and live
    /// nominations.
    pub available: Resources,
    pub marked_for_deletion: bool,
    pub initialized: bool,
    pub pods: Vec<String>,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, StateNode>,
    by_node_name: HashMap<String, String>,
    by_provider_id: HashMap<String, String>,
    // pod name -> (state key, requests, daemon)
    pod_bindings: HashMap<String, (String, Resources, bool)>,
    // state key -> pod name -> (expiry, reserved requests)
    nominations: HashMap<String, HashMap<String, (Instant, Resources)>>,
}

/// In-memory mirror of the cluster, updated from watch streams and consulted
/// read-mostly by the provisioner and the disruption engine.
#[derive(Default)]
pub struct ClusterState {
    inner: RwLock<Inner>,
    pods_synced: AtomicBool,
    nodes_synced: AtomicBool,
    claims_synced: AtomicBool,
}

fn claim_key(name: &str) -> String {
    format!("claim:{}", name)
}

fn node_key(name: &str) -> String {
    format!("node:{}", name)
}

impl ClusterState {
    pub fn new() -> Self {
        ClusterState::default()
    }

    /// True once the initial node, claim, and pod lists have been ingested.
    /// The provisioner and the disruption engine block on this before their
    /// first action.
    pub fn synced(&self) -> bool {
        self.pods_synced.load(Ordering::Acquire)
            && self.nodes_synced.load(Ordering::Acquire)
            && self.claims_synced.load(Ordering::Acquire)
    }

    pub fn mark_pods_synced(&self) {
        self.pods_synced.store(true, Ordering::Release);
    }

    pub fn mark_nodes_synced(&self) {
        self.nodes_synced.store(true, Ordering::Release);
    }

    pub fn mark_claims_synced(&self) {
        self.claims_synced.store(true, Ordering::Release);
    }

    pub fn update_nodeclaim(&self, claim: NodeClaim) {
        let mut guard = self.inner.write().expect("cluster state lock poisoned");
        let inner = &mut *guard;
        let key = claim_key(&claim.metadata.name);
        // A node observed before its claim lives under a node-only record;
        // adopt it once the provider id links the two.
        if !inner.nodes.contains_key(&key) {
            if let Some(provider_id) = claim.status.provider_id.as_deref() {
                if let Some(previous) = inner.by_provider_id.get(provider_id).cloned() {
                    if previous != key {
                        if let Some(mut orphan) = inner.nodes.remove(&previous) {
                            orphan.claim = None;
                            if let Some(node_name) = orphan.node_name().map(str::to_string) {
                                inner.by_node_name.insert(node_name, key.clone());
                            }
                            inner.nodes.insert(key.clone(), orphan);
                            rebind_pods(inner, &previous, &key);
                        }
                    }
                }
            }
        }
        let provider_id = claim.status.provider_id.clone();
        let entry = inner.nodes.entry(key.clone()).or_default();
        entry.claim = Some(claim);
        if let Some(provider_id) = provider_id {
            inner.by_provider_id.insert(provider_id, key);
        }
    }

    pub fn delete_nodeclaim(&self, name: &str) {
        let mut guard = self.inner.write().expect("cluster state lock poisoned");
        let inner = &mut *guard;
        let key = claim_key(name);
        let Some(state_node) = inner.nodes.remove(&key) else {
            return;
        };
        if let Some(provider_id) = state_node.provider_id() {
            inner.by_provider_id.remove(provider_id);
        }
        inner.nominations.remove(&key);
        // The node object may outlive its claim briefly; keep a node-only
        // record so bound pods stay accounted for.
        if let Some(node) = state_node.node {
            let new_key = node_key(&node.metadata.name);
            let node_name = node.metadata.name.clone();
            let provider_id = node.provider_id.clone();
            let replacement = StateNode {
                claim: None,
                node: Some(node),
                marked_for_deletion: state_node.marked_for_deletion,
                pod_requests: state_node.pod_requests,
                daemon_overhead: state_node.daemon_overhead,
                pods: state_node.pods,
            };
            inner.nodes.insert(new_key.clone(), replacement);
            inner.by_node_name.insert(node_name, new_key.clone());
            if let Some(id) = provider_id {
                inner.by_provider_id.insert(id, new_key.clone());
            }
            rebind_pods(inner, &key, &new_key);
        }
    }

    pub fn update_node(&self, node: Node) {
        let mut guard = self.inner.write().expect("cluster state lock poisoned");
        let inner = &mut *guard;
        let name = node.metadata.name.clone();
        let existing_key = inner.by_node_name.get(&name).cloned();
        let claim_owner = node
            .provider_id
            .as_ref()
            .and_then(|id| inner.by_provider_id.get(id).cloned())
            .filter(|key| key.starts_with("claim:"));

        let key = match (existing_key, claim_owner) {
            // Node previously tracked standalone now matches a claim: merge.
            (Some(old), Some(target)) if old != target => {
                if let Some(orphan) = inner.nodes.remove(&old) {
                    let merged = inner.nodes.entry(target.clone()).or_default();
                    merged.pod_requests += orphan.pod_requests;
                    merged.daemon_overhead += orphan.daemon_overhead;
                    merged.pods.extend(orphan.pods);
                    merged.marked_for_deletion |= orphan.marked_for_deletion;
                }
                rebind_pods(inner, &old, &target);
                target
            }
            (Some(old), _) => old,
            (None, Some(target)) => target,
            (None, None) => node_key(&name),
        };

        let provider_id = node.provider_id.clone();
        let entry = inner.nodes.entry(key.clone()).or_default();
        entry.node = Some(node);
        inner.by_node_name.insert(name, key.clone());
        if let Some(provider_id) = provider_id {
            inner.by_provider_id.insert(provider_id, key);
        }
    }

    pub fn delete_node(&self, name: &str) {
        let mut guard = self.inner.write().expect("cluster state lock poisoned");
        let inner = &mut *guard;
        let Some(key) = inner.by_node_name.remove(name) else {
            return;
        };
        let remove_record = match inner.nodes.get_mut(&key) {
            Some(state_node) => {
                state_node.node = None;
                state_node.claim.is_none()
            }
            None => false,
        };
        if remove_record {
            if let Some(state_node) = inner.nodes.remove(&key) {
                if let Some(provider_id) = state_node.provider_id() {
                    inner.by_provider_id.remove(provider_id);
                }
            }
            inner.nominations.remove(&key);
        }
    }

    pub fn update_pod(&self, pod: &Pod) {
        let mut guard = self.inner.write().expect("cluster state lock poisoned");
        let inner = &mut *guard;
        release_pod(inner, &pod.metadata.name);
        if pod.is_terminal() {
            return;
        }
        let Some(node_name) = pod.spec.node_name.as_deref() else {
            return;
        };
        let Some(key) = inner.by_node_name.get(node_name).cloned() else {
            return;
        };
        let requests = pod.spec.requests;
        let daemon = pod.is_daemon();
        if let Some(state_node) = inner.nodes.get_mut(&key) {
            if daemon {
                state_node.daemon_overhead += requests;
            } else {
                state_node.pod_requests += requests;
                state_node.pods.insert(pod.metadata.name.clone());
            }
            inner
                .pod_bindings
                .insert(pod.metadata.name.clone(), (key.clone(), requests, daemon));
            // An observed binding supersedes any nomination for the pod.
            if let Some(nominations) = inner.nominations.get_mut(&key) {
                nominations.remove(&pod.metadata.name);
            }
        }
    }

    pub fn delete_pod(&self, name: &str) {
        let mut guard = self.inner.write().expect("cluster state lock poisoned");
        release_pod(&mut guard, name);
    }

    /// Idempotently marks nodes as going away so the scheduler stops
    /// considering them. Accepts claim names and node names.
    pub fn mark_for_deletion(&self, names: &[&str]) {
        let mut guard = self.inner.write().expect("cluster state lock poisoned");
        let inner = &mut *guard;
        for name in names {
            if let Some(key) = resolve_key(inner, name) {
                if let Some(state_node) = inner.nodes.get_mut(&key) {
                    state_node.marked_for_deletion = true;
                }
            }
        }
    }

    /// Clears the deletion mark, used when a replacement fails and the node
    /// goes back into service.
    pub fn unmark_for_deletion(&self, names: &[&str]) {
        let mut guard = self.inner.write().expect("cluster state lock poisoned");
        let inner = &mut *guard;
        for name in names {
            if let Some(key) = resolve_key(inner, name) {
                if let Some(state_node) = inner.nodes.get_mut(&key) {
                    state_node.marked_for_deletion = false;
                }
            }
        }
    }

    /// Reserves capacity for a scheduled pod so the next provisioning pass
    /// does not double-plan it before the orchestrator observes the binding.
    pub fn nominate_pod(&self, node_or_claim: &str, pod: &Pod, ttl: Duration) {
        let mut guard = self.inner.write().expect("cluster state lock poisoned");
        let inner = &mut *guard;
        let Some(key) = resolve_key(inner, node_or_claim) else {
            return;
        };
        let expiry = Instant::now() + ttl;
        inner
            .nominations
            .entry(key)
            .or_default()
            .insert(pod.metadata.name.clone(), (expiry, pod.spec.requests));
    }

    /// Whether a live nomination exists for the pod anywhere.
    pub fn is_nominated(&self, pod_name: &str) -> bool {
        let now = Instant::now();
        let inner = self.inner.read().expect("cluster state lock poisoned");
        inner.nominations.values().any(|nominations| {
            nominations
                .get(pod_name)
                .is_some_and(|(expiry, _)| *expiry > now)
        })
    }

    /// Snapshot iteration under the read lock; callers must not retain
    /// references past the call.
    pub fn for_each_node<F: FnMut(&StateNode)>(&self, mut visit: F) {
        let inner = self.inner.read().expect("cluster state lock poisoned");
        let mut keys: Vec<&String> = inner.nodes.keys().collect();
        keys.sort();
        for key in keys {
            visit(&inner.nodes[key]);
        }
    }

    /// Cloned view of every tracked node for simulation, ordered by key for
    /// determinism.
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let now = Instant::now();
        let inner = self.inner.read().expect("cluster state lock poisoned");
        let mut snapshots: Vec<NodeSnapshot> = inner
            .nodes
            .iter()
            .map(|(key, state_node)| {
                let nominated: Resources = inner
                    .nominations
                    .get(key)
                    .map(|nominations| {
                        nominations
                            .values()
                            .filter(|(expiry, _)| *expiry > now)
                            .map(|(_, requests)| *requests)
                            .sum()
                    })
                    .unwrap_or_default();
                let allocatable = state_node.allocatable();
                let used = state_node.daemon_overhead + state_node.pod_requests + nominated;
                NodeSnapshot {
                    key: key.clone(),
                    claim_name: state_node.claim.as_ref().map(|c| c.metadata.name.clone()),
                    node_name: state_node.node_name().map(str::to_string),
                    provider_id: state_node.provider_id().map(str::to_string),
                    labels: state_node.labels(),
                    taints: state_node.taints(),
                    allocatable,
                    available: allocatable.saturating_sub(&used),
                    marked_for_deletion: state_node.marked_for_deletion,
                    initialized: state_node.initialized(),
                    pods: state_node.pods.iter().cloned().collect(),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Non-daemon pods currently bound to the claim's node.
    pub fn non_daemon_pod_count(&self, claim_name: &str) -> usize {
        let inner = self.inner.read().expect("cluster state lock poisoned");
        inner
            .nodes
            .get(&claim_key(claim_name))
            .map(|state_node| state_node.non_daemon_pod_count())
            .unwrap_or(0)
    }

    pub fn node_name_for_claim(&self, claim_name: &str) -> Option<String> {
        let inner = self.inner.read().expect("cluster state lock poisoned");
        inner
            .nodes
            .get(&claim_key(claim_name))
            .and_then(|state_node| state_node.node_name().map(str::to_string))
    }
}

fn resolve_key(inner: &Inner, name: &str) -> Option<String> {
    let as_claim = claim_key(name);
    if inner.nodes.contains_key(&as_claim) {
        return Some(as_claim);
    }
    inner.by_node_name.get(name).cloned()
}

fn release_pod(inner: &mut Inner, pod_name: &str) {
    if let Some((key, requests, daemon)) = inner.pod_bindings.remove(pod_name) {
        if let Some(state_node) = inner.nodes.get_mut(&key) {
            if daemon {
                state_node.daemon_overhead = state_node.daemon_overhead.saturating_sub(&requests);
            } else {
                state_node.pod_requests = state_node.pod_requests.saturating_sub(&requests);
                state_node.pods.remove(pod_name);
            }
        }
    }
}

fn rebind_pods(inner: &mut Inner, from: &str, to: &str) {
    for (key, _, _) in inner.pod_bindings.values_mut() {
        if key == from {
            *key = to.to_string();
        }
    }
    if let Some(nominations) = inner.nominations.remove(from) {
        inner
            .nominations
            .entry(to.to_string())
            .or_default()
            .extend(nominations);
    }
}
