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

use cirrus::cirrus::api::nodeclaim::ConditionType;
use cirrus::cirrus::api::object::{ObjectMeta, NODEPOOL_LABEL};
use cirrus::cirrus::api::pod::{Pod, PodSpec};
use cirrus::cirrus::api::resources::Resources;

use super::support::{when_underutilized, Harness};

#[tokio::test]
async fn full_cycle_from_pending_pod_to_terminated_instance() {
    let harness = Harness::new();
    harness.create_pool("cycle-pool", when_underutilized());
    harness
        .client
        .pods
        .create(Pod::new(
            ObjectMeta::named("app-0"),
            PodSpec {
                requests: Resources::requests(500, 1 << 30),
                ..Default::default()
            },
        ))
        .expect("pod");

    // Provision, launch, register.
    let result = harness.provisioner.provision_once().expect("provision");
    assert_eq!(result.created_claims.len(), 1);
    let claim_name = result.created_claims[0].clone();
    let node_name = harness.make_claim_ready(&claim_name).await;
    assert_eq!(harness.cloud.instance_count(), 1);

    // The node carries the claim's labels.
    let node = harness.client.nodes.get(&node_name).expect("node");
    assert_eq!(
        node.metadata.labels.get(NODEPOOL_LABEL),
        Some(&"cycle-pool".to_string())
    );

    // Bind the pod and delete the claim: drain, instance teardown,
    // finalizer release.
    harness.bind_pod("running-0", &node_name, 500);
    harness.client.nodeclaims.delete(&claim_name).expect("delete");
    harness
        .lifecycle
        .reconcile(&claim_name)
        .await
        .expect("terminate");

    assert!(harness.claim(&claim_name).is_none());
    assert_eq!(harness.cloud.instance_count(), 0);
    assert!(harness.client.pods.get("running-0").is_none());
}

#[tokio::test]
async fn conditions_progress_in_order() {
    let harness = Harness::new();
    let pool = harness.create_pool("order-pool", when_underutilized());
    let claim_name = "order-pool-1";
    harness
        .launch_initialized_claim(&pool, claim_name, &["c-small"])
        .await;

    let claim = harness.claim(claim_name).expect("claim");
    let launched = claim
        .condition(ConditionType::Launched)
        .expect("launched")
        .last_transition;
    let registered = claim
        .condition(ConditionType::Registered)
        .expect("registered")
        .last_transition;
    let initialized = claim
        .condition(ConditionType::Initialized)
        .expect("initialized")
        .last_transition;
    assert!(launched <= registered);
    assert!(registered <= initialized);
}
