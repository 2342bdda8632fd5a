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
use std::sync::Arc;
use std::time::Duration;

use crate::cirrus::api::object::TERMINATION_FINALIZER;
use crate::cirrus::cloud::CloudProvider;
use crate::cirrus::cluster::client::ClusterClient;
use crate::cirrus::cluster::state::ClusterState;
use crate::cirrus::events::EventRecorder;

const DEFAULT_INSTANCE_GONE_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_REGISTRATION_GRACE: Duration = Duration::from_secs(15 * 60);

/// Reaps node claims whose backing instance disappeared, and claims that
/// never registered a node within the grace window. Claims with a Ready node
/// are never touched.
pub struct GarbageCollector {
    client: Arc<ClusterClient>,
    state: Arc<ClusterState>,
    cloud: Arc<dyn CloudProvider>,
    recorder: Arc<EventRecorder>,
    instance_gone_grace: Duration,
    registration_grace: Duration,
}

impl GarbageCollector {
    pub fn new(
        client: Arc<ClusterClient>,
        state: Arc<ClusterState>,
        cloud: Arc<dyn CloudProvider>,
        recorder: Arc<EventRecorder>,
    ) -> Self {
        GarbageCollector::with_grace(
            client,
            state,
            cloud,
            recorder,
            DEFAULT_INSTANCE_GONE_GRACE,
            DEFAULT_REGISTRATION_GRACE,
        )
    }

    pub fn with_grace(
        client: Arc<ClusterClient>,
        state: Arc<ClusterState>,
        cloud: Arc<dyn CloudProvider>,
        recorder: Arc<EventRecorder>,
        instance_gone_grace: Duration,
        registration_grace: Duration,
    ) -> Self {
        GarbageCollector {
            client,
            state,
            cloud,
            recorder,
            instance_gone_grace,
            registration_grace,
        }
    }

    /// One collection pass; returns the number of claims reaped.
    pub fn collect_once(&self) -> usize {
        let now = Utc::now();
        let mut reaped = 0;
        for claim in self.client.nodeclaims.list() {
            if claim.is_terminating() {
                continue;
            }
            let name = claim.metadata.name.clone();
            if let Some(node_name) = self.state.node_name_for_claim(&name) {
                if self
                    .client
                    .nodes
                    .get(&node_name)
                    .is_some_and(|node| node.ready)
                {
                    continue;
                }
            }
            let age = claim.metadata.age(now);

            // The backing instance vanished: the claim is a phantom; the
            // finalizer is dropped directly since there is nothing left to
            // tear down.
            if let Some(provider_id) = claim.status.provider_id.as_deref() {
                let gone = matches!(self.cloud.get(provider_id), Err(err) if err.is_not_found());
                if gone && age.num_milliseconds() >= self.instance_gone_grace.as_millis() as i64 {
                    self.reap(&name, true, "backing instance no longer exists");
                    reaped += 1;
                    continue;
                }
            }

            // Launched but no node ever registered within the grace window.
            if !claim.is_registered()
                && age.num_milliseconds() >= self.registration_grace.as_millis() as i64
            {
                self.reap(&name, false, "node never registered");
                reaped += 1;
            }
        }
        reaped
    }

    fn reap(&self, name: &str, force_finalizer: bool, why: &str) {
        log::info!("garbage collecting node claim {}: {}", name, why);
        if let Err(err) = self.client.nodeclaims.delete(name) {
            log::debug!("garbage collection delete of {} skipped: {}", name, err);
            return;
        }
        if force_finalizer {
            if let Err(err) = self
                .client
                .nodeclaims
                .remove_finalizer(name, TERMINATION_FINALIZER)
            {
                log::debug!("finalizer removal for {} skipped: {}", name, err);
            }
            self.state.delete_nodeclaim(name);
        }
        self.recorder
            .publish(format!("NodeClaim/{}", name), "GarbageCollected", why);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cirrus::api::node::Node;
    use crate::cirrus::api::nodeclaim::{ConditionType, NodeClaim, NodeClaimSpec};
    use crate::cirrus::api::object::ObjectMeta;
    use crate::cirrus::api::resources::Resources;
    use crate::cirrus::cloud::fake::FakeCloudProvider;
    use chrono::Duration as ChronoDuration;

    fn fixture() -> (
        GarbageCollector,
        Arc<ClusterClient>,
        Arc<ClusterState>,
        Arc<FakeCloudProvider>,
    ) {
        let client = Arc::new(ClusterClient::new());
        let state = Arc::new(ClusterState::new());
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        let recorder = Arc::new(EventRecorder::new());
        let collector = GarbageCollector::with_grace(
            client.clone(),
            state.clone(),
            cloud.clone(),
            recorder,
            Duration::from_secs(10),
            Duration::from_secs(900),
        );
        (collector, client, state, cloud)
    }

    fn claim_aged(name: &str, provider_id: Option<&str>, seconds: i64) -> NodeClaim {
        let mut claim = NodeClaim {
            metadata: ObjectMeta::named(name),
            spec: NodeClaimSpec {
                nodepool: "default".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        claim.metadata.add_finalizer(TERMINATION_FINALIZER);
        claim.metadata.creation_timestamp = Some(Utc::now() - ChronoDuration::seconds(seconds));
        claim.status.provider_id = provider_id.map(str::to_string);
        if provider_id.is_some() {
            claim.set_condition(ConditionType::Launched, true, "Launched", "");
        }
        claim
    }

    #[test]
    fn phantom_claim_is_reaped_with_its_finalizer() {
        let (collector, client, state, _cloud) = fixture();
        // Provider id set but the fake has no such instance.
        let claim = claim_aged("ghost", Some("fake://i-404"), 20);
        client.nodeclaims.create(claim.clone()).expect("create");
        state.update_nodeclaim(claim);

        assert_eq!(collector.collect_once(), 1);
        assert!(client.nodeclaims.get("ghost").is_none());
    }

    #[test]
    fn young_phantom_survives_the_grace_window() {
        let (collector, client, state, _cloud) = fixture();
        let claim = claim_aged("young", Some("fake://i-404"), 2);
        client.nodeclaims.create(claim.clone()).expect("create");
        state.update_nodeclaim(claim);

        assert_eq!(collector.collect_once(), 0);
        assert!(client.nodeclaims.get("young").is_some());
    }

    #[test]
    fn unregistered_claim_is_deleted_after_registration_grace() {
        let (collector, client, state, cloud) = fixture();
        let mut claim = claim_aged("slow", None, 1_000);
        // A live instance backs the claim, so only the registration rule
        // can fire.
        let created = cloud.create(&claim).expect("instance");
        claim.status.provider_id = Some(created.id.clone());
        client.nodeclaims.create(claim.clone()).expect("create");
        state.update_nodeclaim(claim);

        assert_eq!(collector.collect_once(), 1);
        // Normal delete path: termination tears the instance down later.
        let claim = client.nodeclaims.get("slow").expect("terminating claim");
        assert!(claim.metadata.deletion_timestamp.is_some());
    }

    #[test]
    fn claims_with_a_ready_node_are_never_touched() {
        let (collector, client, state, _cloud) = fixture();
        let claim = claim_aged("backed", Some("fake://i-404"), 5_000);
        client.nodeclaims.create(claim.clone()).expect("create");
        state.update_nodeclaim(claim);
        let node = Node {
            metadata: ObjectMeta::named("node-1"),
            provider_id: Some("fake://i-404".to_string()),
            allocatable: Resources::new(1_000, 1 << 30, 10),
            ready: true,
            ..Default::default()
        };
        client.nodes.create(node.clone()).expect("node");
        state.update_node(node);

        assert_eq!(collector.collect_once(), 0);
        assert!(client.nodeclaims.get("backed").is_some());
    }
}
