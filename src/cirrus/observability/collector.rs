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

use crate::cirrus::api::nodeclaim::{ConditionType, NodeClaim};
use crate::cirrus::api::pod::PodPhase;
use crate::cirrus::cluster::client::ClusterClient;
use crate::cirrus::observability::metrics;

/// Publishes state gauges from the object stores. Not on any correctness
/// path; a missed tick only leaves the dashboards stale.
pub struct MetricsCollector {
    client: Arc<ClusterClient>,
}

impl MetricsCollector {
    pub fn new(client: Arc<ClusterClient>) -> Self {
        MetricsCollector { client }
    }

    pub fn collect_once(&self) {
        let claims = self.client.nodeclaims.list();
        let states: Vec<(&str, i64)> = vec![
            ("launched", count(&claims, |c| c.is_launched())),
            ("registered", count(&claims, |c| c.is_registered())),
            ("initialized", count(&claims, |c| c.is_initialized())),
            ("drifted", count(&claims, |c| c.condition_is_true(ConditionType::Drifted))),
            ("empty", count(&claims, |c| c.condition_is_true(ConditionType::Empty))),
            ("expired", count(&claims, |c| c.condition_is_true(ConditionType::Expired))),
            ("terminating", count(&claims, |c| c.is_terminating())),
        ];
        metrics::set_nodeclaim_gauges(&states);

        let pods = self.client.pods.list();
        let phases: Vec<(&str, i64)> = vec![
            ("pending", pods.iter().filter(|p| p.status.phase == PodPhase::Pending).count() as i64),
            ("running", pods.iter().filter(|p| p.status.phase == PodPhase::Running).count() as i64),
            ("succeeded", pods.iter().filter(|p| p.status.phase == PodPhase::Succeeded).count() as i64),
            ("failed", pods.iter().filter(|p| p.status.phase == PodPhase::Failed).count() as i64),
        ];
        metrics::set_pod_gauges(&phases);
        metrics::set_node_count(self.client.nodes.count() as i64);
    }
}

fn count<F: Fn(&NodeClaim) -> bool>(claims: &[NodeClaim], predicate: F) -> i64 {
    claims.iter().filter(|claim| predicate(claim)).count() as i64
}
