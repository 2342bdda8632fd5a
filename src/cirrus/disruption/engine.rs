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

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::cirrus::api::nodeclaim::ConditionType;
use crate::cirrus::api::nodepool::{order_by_weight, ConsolidationPolicy, NodePool};
use crate::cirrus::api::pod::Pod;
use crate::cirrus::cloud::{CloudProvider, InstanceType};
use crate::cirrus::cluster::client::ClusterClient;
use crate::cirrus::cluster::state::{ClusterState, NodeSnapshot};
use crate::cirrus::disruption::candidates::{
    collect, order_for_disruption, pod_names_for_claim, Candidate,
};
use crate::cirrus::disruption::queue::{Command, CommandAction, DisruptionQueue};
use crate::cirrus::disruption::validation::simulate_removal;
use crate::cirrus::disruption::DisruptionMethod;
use crate::cirrus::observability::metrics;

/// Most candidates considered for one multi-node consolidation.
const MAX_CONSOLIDATION_SET: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub drift_enabled: bool,
    /// Cap on empty-node deletions issued in one pass; protects the cloud
    /// provider's rate limits.
    pub max_parallel_empty: usize,
    /// Minimum hourly saving a consolidation must realize, damping
    /// oscillation around break-even offerings.
    pub min_savings: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            drift_enabled: true,
            max_parallel_empty: 100,
            min_savings: 0.001,
        }
    }
}

/// Evaluates disruption methods in strict priority order on every tick and
/// pushes approved actions onto the serialized command queue.
pub struct DisruptionEngine {
    client: Arc<ClusterClient>,
    state: Arc<ClusterState>,
    cloud: Arc<dyn CloudProvider>,
    queue: Arc<DisruptionQueue>,
    config: EngineConfig,
}

struct TickContext {
    pools_by_name: HashMap<String, NodePool>,
    ordered_pools: Vec<NodePool>,
    instance_types: HashMap<String, Vec<InstanceType>>,
    snapshot: Vec<NodeSnapshot>,
    bound_pods: Vec<Pod>,
}

impl DisruptionEngine {
    pub fn new(
        client: Arc<ClusterClient>,
        state: Arc<ClusterState>,
        cloud: Arc<dyn CloudProvider>,
        queue: Arc<DisruptionQueue>,
        config: EngineConfig,
    ) -> Self {
        DisruptionEngine {
            client,
            state,
            cloud,
            queue,
            config,
        }
    }

    /// One evaluation pass. Decisions are enqueued, never executed inline.
    pub fn tick(&self) {
        if !self.state.synced() {
            log::debug!("disruption engine waiting for cluster state sync");
            return;
        }
        let Some(ctx) = self.build_context() else {
            return;
        };
        // Claims already covered by a command from an earlier method this
        // tick; later validations treat them as gone.
        let mut committed: HashSet<String> = HashSet::new();
        for method in DisruptionMethod::ORDERED {
            if method == DisruptionMethod::Drift && !self.config.drift_enabled {
                continue;
            }
            let started = Instant::now();
            match method {
                DisruptionMethod::Expiration => {
                    self.disrupt_conditioned(ConditionType::Expired, method, &ctx, &mut committed)
                }
                DisruptionMethod::Drift => {
                    self.disrupt_conditioned(ConditionType::Drifted, method, &ctx, &mut committed)
                }
                DisruptionMethod::Emptiness => self.disrupt_empty(&ctx, &mut committed),
                DisruptionMethod::Consolidation => self.consolidate(&ctx, &mut committed),
            }
            metrics::observe_disruption_evaluation(method.as_label(), started.elapsed());
        }
    }

    /// The tick snapshot with every already-committed claim marked as going
    /// away, so validations never count on capacity another command will
    /// remove.
    fn effective_snapshot(ctx: &TickContext, committed: &HashSet<String>) -> Vec<NodeSnapshot> {
        ctx.snapshot
            .iter()
            .map(|node| {
                let mut node = node.clone();
                if node
                    .claim_name
                    .as_deref()
                    .is_some_and(|name| committed.contains(name))
                {
                    node.marked_for_deletion = true;
                }
                node
            })
            .collect()
    }

    fn build_context(&self) -> Option<TickContext> {
        let mut ordered_pools: Vec<NodePool> = self
            .client
            .nodepools
            .list()
            .into_iter()
            .filter(|pool| pool.validate().is_ok())
            .collect();
        order_by_weight(&mut ordered_pools);

        let mut instance_types = HashMap::new();
        for pool in &ordered_pools {
            match self.cloud.instance_types(pool) {
                Ok(types) => {
                    instance_types.insert(pool.metadata.name.clone(), types);
                }
                Err(err) => {
                    log::warn!(
                        "disruption tick skipped: offerings for pool {} unavailable: {}",
                        pool.metadata.name,
                        err
                    );
                    return None;
                }
            }
        }

        let pools_by_name = ordered_pools
            .iter()
            .map(|pool| (pool.metadata.name.clone(), pool.clone()))
            .collect();
        let bound_pods = self
            .client
            .pods
            .list()
            .into_iter()
            .filter(|pod| pod.spec.node_name.is_some() && !pod.is_terminal())
            .collect();

        Some(TickContext {
            pools_by_name,
            ordered_pools,
            instance_types,
            snapshot: self.state.snapshot(),
            bound_pods,
        })
    }

    /// Drift and expiration: empty candidates are deleted in parallel, the
    /// rest one per pool, earliest transition first, each validated by
    /// re-simulation.
    fn disrupt_conditioned(
        &self,
        condition: ConditionType,
        method: DisruptionMethod,
        ctx: &TickContext,
        committed: &mut HashSet<String>,
    ) {
        let candidates: Vec<Candidate> = collect(
            &self.client,
            &self.state,
            &ctx.pools_by_name,
            &ctx.instance_types,
            Some(condition),
        )
        .into_iter()
        .filter(|candidate| !committed.contains(candidate.name()))
        .collect();
        if candidates.is_empty() {
            return;
        }
        let (empty, mut waiting): (Vec<Candidate>, Vec<Candidate>) =
            candidates.into_iter().partition(Candidate::is_empty);

        self.delete_empty_batch(empty, method, committed);

        order_for_disruption(&mut waiting);
        for candidate in &waiting {
            let pool_name = &candidate.pool.metadata.name;
            if self.queue.pool_busy(pool_name) {
                continue;
            }
            let result = simulate_removal(
                &[candidate],
                &Self::effective_snapshot(ctx, committed),
                &ctx.ordered_pools,
                &ctx.instance_types,
                &ctx.bound_pods,
            );
            if !result.all_reschedulable {
                log::debug!(
                    "skipping {} candidate {}: displaced pods cannot reschedule",
                    method.as_label(),
                    candidate.name()
                );
                continue;
            }
            let action = if result.proposals.is_empty() {
                CommandAction::Delete
            } else {
                CommandAction::Replace {
                    proposals: result.proposals,
                }
            };
            self.enqueue_single(candidate, action, method, committed);
        }
    }

    /// Emptiness: WhenEmpty pools whose claims have been continuously empty
    /// for at least ConsolidateAfter.
    fn disrupt_empty(&self, ctx: &TickContext, committed: &mut HashSet<String>) {
        let now = Utc::now();
        let candidates: Vec<Candidate> = collect(
            &self.client,
            &self.state,
            &ctx.pools_by_name,
            &ctx.instance_types,
            Some(ConditionType::Empty),
        )
        .into_iter()
        .filter(|candidate| !committed.contains(candidate.name()))
        .filter(|candidate| {
            if candidate.pool.spec.disruption.consolidation_policy != ConsolidationPolicy::WhenEmpty
            {
                return false;
            }
            if !candidate.is_empty() {
                return false;
            }
            let Some(after) = candidate
                .pool
                .spec
                .disruption
                .consolidate_after
                .and_then(|after| after.duration())
            else {
                // ConsolidateAfter=Never opts the pool out of emptiness.
                return false;
            };
            (now - candidate.transition_time).num_milliseconds() >= after.as_millis() as i64
        })
        .collect();

        self.delete_empty_batch(candidates, DisruptionMethod::Emptiness, committed);
    }

    /// Consolidation: single-node removals whose pods fit remaining
    /// capacity, then cheaper replacements, then multi-node to one.
    fn consolidate(&self, ctx: &TickContext, committed: &mut HashSet<String>) {
        let mut candidates: Vec<Candidate> = collect(
            &self.client,
            &self.state,
            &ctx.pools_by_name,
            &ctx.instance_types,
            None,
        )
        .into_iter()
        .filter(|candidate| !committed.contains(candidate.name()))
        .filter(|candidate| {
            candidate.pool.spec.disruption.consolidation_policy
                == ConsolidationPolicy::WhenUnderutilized
        })
        .collect();
        if candidates.is_empty() {
            return;
        }

        let (empty, mut waiting): (Vec<Candidate>, Vec<Candidate>) =
            candidates.drain(..).partition(Candidate::is_empty);
        self.delete_empty_batch(empty, DisruptionMethod::Consolidation, committed);

        // Fewest displaced pods first keeps the cheapest actions early.
        waiting.sort_by(|a, b| {
            a.pods
                .len()
                .cmp(&b.pods.len())
                .then_with(|| a.claim.metadata.name.cmp(&b.claim.metadata.name))
        });

        let mut leftover: Vec<&Candidate> = Vec::new();
        for candidate in &waiting {
            let pool_name = &candidate.pool.metadata.name;
            if self.queue.pool_busy(pool_name) {
                continue;
            }
            let Some(price) = candidate.price else {
                continue;
            };
            let result = simulate_removal(
                &[candidate],
                &Self::effective_snapshot(ctx, committed),
                &ctx.ordered_pools,
                &ctx.instance_types,
                &ctx.bound_pods,
            );
            if !result.all_reschedulable {
                continue;
            }
            if result.proposals.is_empty() {
                self.enqueue_single(
                    candidate,
                    CommandAction::Delete,
                    DisruptionMethod::Consolidation,
                    committed,
                );
                continue;
            }
            if result.replacement_cost() < price - self.config.min_savings {
                self.enqueue_single(
                    candidate,
                    CommandAction::Replace {
                        proposals: result.proposals,
                    },
                    DisruptionMethod::Consolidation,
                    committed,
                );
                continue;
            }
            leftover.push(candidate);
        }

        self.consolidate_multi(&leftover, ctx, committed);
    }

    /// Multi-node consolidation: replace several underutilized nodes with at
    /// most one new node when that strictly lowers cost.
    fn consolidate_multi(
        &self,
        candidates: &[&Candidate],
        ctx: &TickContext,
        committed: &mut HashSet<String>,
    ) {
        let mut eligible: Vec<&Candidate> = candidates
            .iter()
            .copied()
            .filter(|candidate| {
                candidate.price.is_some()
                    && !self.queue.pool_busy(&candidate.pool.metadata.name)
            })
            .collect();
        if eligible.len() < 2 {
            return;
        }
        // Most expensive first, so the set that frees the most spend is
        // tried first.
        eligible.sort_by(|a, b| {
            b.price
                .unwrap_or(0.0)
                .total_cmp(&a.price.unwrap_or(0.0))
                .then_with(|| a.claim.metadata.name.cmp(&b.claim.metadata.name))
        });
        eligible.truncate(MAX_CONSOLIDATION_SET);

        for count in (2..=eligible.len()).rev() {
            let set = &eligible[..count];
            let result = simulate_removal(
                set,
                &Self::effective_snapshot(ctx, committed),
                &ctx.ordered_pools,
                &ctx.instance_types,
                &ctx.bound_pods,
            );
            if !result.all_reschedulable || result.proposals.len() > 1 {
                continue;
            }
            let current_cost: f64 = set.iter().filter_map(|c| c.price).sum();
            if result.replacement_cost() >= current_cost - self.config.min_savings {
                continue;
            }
            let claims: Vec<String> = set.iter().map(|c| c.name().to_string()).collect();
            let mut pools: Vec<String> = set
                .iter()
                .map(|c| c.pool.metadata.name.clone())
                .collect();
            pools.sort();
            pools.dedup();
            let expected_pods = set
                .iter()
                .map(|c| {
                    (
                        c.name().to_string(),
                        pod_names_for_claim(&self.state, c.name()),
                    )
                })
                .collect();
            committed.extend(claims.iter().cloned());
            self.queue.enqueue(Command {
                method: DisruptionMethod::Consolidation,
                claims,
                action: CommandAction::Replace {
                    proposals: result.proposals,
                },
                pools,
                expected_pods,
            });
            return;
        }
    }

    /// Deletes empty candidates in one parallel batch, bounded so a huge
    /// sweep cannot hammer the cloud provider.
    fn delete_empty_batch(
        &self,
        mut empty: Vec<Candidate>,
        method: DisruptionMethod,
        committed: &mut HashSet<String>,
    ) {
        if empty.is_empty() {
            return;
        }
        empty.sort_by(|a, b| a.claim.metadata.name.cmp(&b.claim.metadata.name));
        if empty.len() > self.config.max_parallel_empty {
            log::info!(
                "{} empty candidates exceed the per-tick cap of {}; deferring the rest",
                empty.len(),
                self.config.max_parallel_empty
            );
            empty.truncate(self.config.max_parallel_empty);
        }
        let claims: Vec<String> = empty
            .iter()
            .map(|candidate| candidate.name().to_string())
            .collect();
        let expected_pods = claims
            .iter()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        committed.extend(claims.iter().cloned());
        self.queue.enqueue(Command {
            method,
            claims,
            action: CommandAction::Delete,
            pools: Vec::new(),
            expected_pods,
        });
    }

    fn enqueue_single(
        &self,
        candidate: &Candidate,
        action: CommandAction,
        method: DisruptionMethod,
        committed: &mut HashSet<String>,
    ) {
        let name = candidate.name().to_string();
        committed.insert(name.clone());
        self.queue.enqueue(Command {
            method,
            claims: vec![name.clone()],
            action,
            pools: vec![candidate.pool.metadata.name.clone()],
            expected_pods: HashMap::from([(
                name.clone(),
                pod_names_for_claim(&self.state, &name),
            )]),
        });
    }
}
