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
use std::collections::HashMap;
use std::sync::Arc;

use crate::cirrus::api::nodeclaim::{ConditionType, NodeClaim};
use crate::cirrus::api::nodepool::NodePool;
use crate::cirrus::api::object::NODEPOOL_HASH_ANNOTATION;
use crate::cirrus::cloud::CloudProvider;
use crate::cirrus::cluster::client::ClusterClient;
use crate::cirrus::cluster::state::ClusterState;

/// Maintains the disruption-facing conditions on every claim: Empty,
/// Expired, and Drifted. The engine consumes conditions; it never computes
/// them itself.
pub struct ConditionController {
    client: Arc<ClusterClient>,
    state: Arc<ClusterState>,
    cloud: Arc<dyn CloudProvider>,
    drift_enabled: bool,
}

impl ConditionController {
    pub fn new(
        client: Arc<ClusterClient>,
        state: Arc<ClusterState>,
        cloud: Arc<dyn CloudProvider>,
        drift_enabled: bool,
    ) -> Self {
        ConditionController {
            client,
            state,
            cloud,
            drift_enabled,
        }
    }

    /// One sweep over all claims.
    pub fn reconcile_all(&self) {
        let pools: HashMap<String, NodePool> = self
            .client
            .nodepools
            .list()
            .into_iter()
            .map(|pool| (pool.metadata.name.clone(), pool))
            .collect();
        let hashes: HashMap<&str, String> = pools
            .iter()
            .map(|(name, pool)| (name.as_str(), pool.hash()))
            .collect();

        for claim in self.client.nodeclaims.list() {
            if claim.is_terminating() {
                continue;
            }
            let mut updated = claim.clone();
            let mut changed = false;
            changed |= self.reconcile_empty(&mut updated);
            changed |= self.reconcile_expired(&mut updated, &pools);
            changed |= self.reconcile_drifted(&mut updated, &pools, &hashes);
            if changed {
                if let Err(err) = self.client.nodeclaims.update(updated.clone()) {
                    log::warn!(
                        "failed to update conditions on claim {}: {}",
                        claim.metadata.name,
                        err
                    );
                    continue;
                }
                self.state.update_nodeclaim(updated);
            }
        }
    }

    fn reconcile_empty(&self, claim: &mut NodeClaim) -> bool {
        if !claim.is_initialized() {
            return false;
        }
        let empty = self.state.non_daemon_pod_count(&claim.metadata.name) == 0;
        let currently = claim.condition_is_true(ConditionType::Empty);
        if empty && !currently {
            claim.set_condition(ConditionType::Empty, true, "EmptyNode", "");
            return true;
        }
        if !empty && claim.condition(ConditionType::Empty).is_some() {
            claim.clear_condition(ConditionType::Empty);
            return true;
        }
        false
    }

    fn reconcile_expired(&self, claim: &mut NodeClaim, pools: &HashMap<String, NodePool>) -> bool {
        let Some(pool) = pools.get(&claim.spec.nodepool) else {
            return false;
        };
        let Some(expire_after) = pool.spec.disruption.expire_after.duration() else {
            return false;
        };
        if claim.condition_is_true(ConditionType::Expired) {
            return false;
        }
        let age = claim.metadata.age(Utc::now());
        if age.num_milliseconds() >= expire_after.as_millis() as i64 {
            claim.set_condition(
                ConditionType::Expired,
                true,
                "Expired",
                &format!("claim exceeded the pool lifetime of {:?}", expire_after),
            );
            return true;
        }
        false
    }

    /// Template-hash drift OR provider-reported drift.
    fn reconcile_drifted(
        &self,
        claim: &mut NodeClaim,
        pools: &HashMap<String, NodePool>,
        hashes: &HashMap<&str, String>,
    ) -> bool {
        if !self.drift_enabled {
            return false;
        }
        if pools.get(&claim.spec.nodepool).is_none() {
            return false;
        }
        let hash_drift = match (
            claim.metadata.annotations.get(NODEPOOL_HASH_ANNOTATION),
            hashes.get(claim.spec.nodepool.as_str()),
        ) {
            (Some(recorded), Some(current)) => recorded != current,
            _ => false,
        };
        let provider_drift = match self.cloud.is_drifted(claim) {
            Ok(drifted) => drifted,
            Err(err) => {
                log::debug!(
                    "drift probe for claim {} failed: {}",
                    claim.metadata.name,
                    err
                );
                false
            }
        };
        let drifted = hash_drift || provider_drift;
        let currently = claim.condition_is_true(ConditionType::Drifted);
        if drifted && !currently {
            let reason = if hash_drift { "TemplateChanged" } else { "ProviderDrifted" };
            claim.set_condition(ConditionType::Drifted, true, reason, "");
            return true;
        }
        if !drifted && claim.condition(ConditionType::Drifted).is_some() {
            claim.clear_condition(ConditionType::Drifted);
            return true;
        }
        false
    }
}
