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

use crate::cirrus::api::pod::{Pod, PodAntiAffinityTerm, TopologySpreadConstraint};

type SpreadKey = (u64, String);
type AntiKey = (String, String, String);

/// Incremental topology bookkeeping for one scheduling pass. Spread counters
/// are scoped to the signature group of the pods being placed; anti-affinity
/// occupancy is seeded from pods already bound in the cluster.
#[derive(Debug, Default)]
pub struct Topology {
    // topology key -> every domain a pod could land in
    domains: HashMap<String, BTreeSet<String>>,
    // (group signature, topology key) -> domain -> pods placed this pass
    spread: HashMap<SpreadKey, HashMap<String, i64>>,
    // (label key, label value, topology key) -> occupied domains
    anti: HashMap<AntiKey, BTreeSet<String>>,
}

impl Topology {
    pub fn new() -> Self {
        Topology::default()
    }

    /// Makes a domain participate in skew calculations for a topology key.
    pub fn register_domain(&mut self, topology_key: &str, domain: &str) {
        self.domains
            .entry(topology_key.to_string())
            .or_default()
            .insert(domain.to_string());
    }

    /// Records the anti-affinity occupancy contributed by a pod already
    /// bound somewhere, given the domains of its node.
    pub fn seed_bound_pod(
        &mut self,
        labels: &BTreeMap<String, String>,
        node_domains: &BTreeMap<String, String>,
        terms: &[PodAntiAffinityTerm],
    ) {
        for term in terms {
            if labels.get(&term.label_key) != Some(&term.label_value) {
                continue;
            }
            if let Some(domain) = node_domains.get(&term.topology_key) {
                self.anti
                    .entry((
                        term.label_key.clone(),
                        term.label_value.clone(),
                        term.topology_key.clone(),
                    ))
                    .or_default()
                    .insert(domain.clone());
            }
        }
    }

    /// Whether adding one matching pod to `domain` keeps skew within bounds.
    pub fn spread_ok(
        &self,
        group: u64,
        constraint: &TopologySpreadConstraint,
        domain: &str,
    ) -> bool {
        let count = self.spread_count(group, &constraint.topology_key, domain);
        let min = self.min_spread_count(group, &constraint.topology_key);
        count + 1 - min <= constraint.max_skew
    }

    pub fn anti_ok(&self, term: &PodAntiAffinityTerm, domain: &str) -> bool {
        self.anti
            .get(&(
                term.label_key.clone(),
                term.label_value.clone(),
                term.topology_key.clone(),
            ))
            .map(|occupied| !occupied.contains(domain))
            .unwrap_or(true)
    }

    /// Of `candidates`, the domain with the lowest pressure that satisfies
    /// every zone-scoped constraint of the pod, ties broken by name.
    pub fn best_domain(
        &self,
        group: u64,
        topology_key: &str,
        candidates: &BTreeSet<String>,
        pod: &Pod,
    ) -> Option<String> {
        let mut best: Option<(i64, &String)> = None;
        for domain in candidates {
            let satisfies = pod
                .spec
                .topology_spread
                .iter()
                .filter(|constraint| constraint.topology_key == topology_key)
                .all(|constraint| self.spread_ok(group, constraint, domain))
                && pod
                    .spec
                    .anti_affinity
                    .iter()
                    .filter(|term| {
                        term.topology_key == topology_key
                            && pod.metadata.labels.get(&term.label_key)
                                == Some(&term.label_value)
                    })
                    .all(|term| self.anti_ok(term, domain));
            if !satisfies {
                continue;
            }
            let count = self.spread_count(group, topology_key, domain);
            let better = best
                .map(|(best_count, best_domain)| {
                    count < best_count || (count == best_count && domain < best_domain)
                })
                .unwrap_or(true);
            if better {
                best = Some((count, domain));
            }
        }
        best.map(|(_, domain)| domain.clone())
    }

    /// Commits a placement: bumps spread counters for the pod's group and
    /// occupies anti-affinity domains the pod itself matches.
    pub fn commit(&mut self, group: u64, pod: &Pod, node_domains: &BTreeMap<String, String>) {
        for constraint in &pod.spec.topology_spread {
            if let Some(domain) = node_domains.get(&constraint.topology_key) {
                self.register_domain(&constraint.topology_key, domain);
                *self
                    .spread
                    .entry((group, constraint.topology_key.clone()))
                    .or_default()
                    .entry(domain.clone())
                    .or_insert(0) += 1;
            }
        }
        self.seed_bound_pod(&pod.metadata.labels, node_domains, &pod.spec.anti_affinity);
    }

    fn spread_count(&self, group: u64, topology_key: &str, domain: &str) -> i64 {
        self.spread
            .get(&(group, topology_key.to_string()))
            .and_then(|counts| counts.get(domain))
            .copied()
            .unwrap_or(0)
    }

    fn min_spread_count(&self, group: u64, topology_key: &str) -> i64 {
        let Some(domains) = self.domains.get(topology_key) else {
            return 0;
        };
        domains
            .iter()
            .map(|domain| self.spread_count(group, topology_key, domain))
            .min()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cirrus::api::object::{ObjectMeta, ZONE_LABEL};
    use crate::cirrus::api::pod::PodSpec;

    fn spread_pod(name: &str, max_skew: i64) -> Pod {
        Pod::new(
            ObjectMeta::named(name),
            PodSpec {
                topology_spread: vec![TopologySpreadConstraint {
                    topology_key: ZONE_LABEL.to_string(),
                    max_skew,
                }],
                ..Default::default()
            },
        )
    }

    fn domains_for(zone: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(ZONE_LABEL.to_string(), zone.to_string())])
    }

    #[test]
    fn spread_rejects_domains_over_skew() {
        let mut topology = Topology::new();
        topology.register_domain(ZONE_LABEL, "zone-a");
        topology.register_domain(ZONE_LABEL, "zone-b");

        let pod = spread_pod("web-0", 1);
        let constraint = &pod.spec.topology_spread[0];
        assert!(topology.spread_ok(7, constraint, "zone-a"));
        topology.commit(7, &pod, &domains_for("zone-a"));

        // zone-b is empty, so a second pod in zone-a would push skew to 2.
        assert!(!topology.spread_ok(7, constraint, "zone-a"));
        assert!(topology.spread_ok(7, constraint, "zone-b"));
    }

    #[test]
    fn best_domain_prefers_least_loaded_then_name() {
        let mut topology = Topology::new();
        topology.register_domain(ZONE_LABEL, "zone-a");
        topology.register_domain(ZONE_LABEL, "zone-b");
        let pod = spread_pod("web-0", 1);
        let candidates: BTreeSet<String> =
            ["zone-a".to_string(), "zone-b".to_string()].into_iter().collect();

        assert_eq!(
            topology.best_domain(7, ZONE_LABEL, &candidates, &pod),
            Some("zone-a".to_string())
        );
        topology.commit(7, &pod, &domains_for("zone-a"));
        assert_eq!(
            topology.best_domain(7, ZONE_LABEL, &candidates, &pod),
            Some("zone-b".to_string())
        );
    }

    #[test]
    fn anti_affinity_blocks_occupied_domains() {
        let mut topology = Topology::new();
        let term = PodAntiAffinityTerm {
            label_key: "app".to_string(),
            label_value: "db".to_string(),
            topology_key: ZONE_LABEL.to_string(),
        };
        let labels = BTreeMap::from([("app".to_string(), "db".to_string())]);
        topology.seed_bound_pod(&labels, &domains_for("zone-a"), std::slice::from_ref(&term));

        assert!(!topology.anti_ok(&term, "zone-a"));
        assert!(topology.anti_ok(&term, "zone-b"));
    }

    #[test]
    fn unrelated_labels_do_not_occupy() {
        let mut topology = Topology::new();
        let term = PodAntiAffinityTerm {
            label_key: "app".to_string(),
            label_value: "db".to_string(),
            topology_key: ZONE_LABEL.to_string(),
        };
        let labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
        topology.seed_bound_pod(&labels, &domains_for("zone-a"), std::slice::from_ref(&term));
        assert!(topology.anti_ok(&term, "zone-a"));
    }
}
