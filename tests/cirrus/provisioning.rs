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

use cirrus::cirrus::api::object::{ObjectMeta, NODEPOOL_LABEL};
use cirrus::cirrus::api::pod::{Pod, PodSpec};
use cirrus::cirrus::api::resources::Resources;

use super::support::{when_underutilized, Harness};

fn pending_pod(name: &str, cpu: i64) -> Pod {
    Pod::new(
        ObjectMeta::named(name),
        PodSpec {
            requests: Resources::requests(cpu, 1 << 30),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn pending_pods_end_up_on_initialized_nodes() {
    let harness = Harness::new();
    harness.create_pool("web-pool", when_underutilized());
    for index in 0..4 {
        harness
            .client
            .pods
            .create(pending_pod(&format!("web-{}", index), 800))
            .expect("pod");
    }

    let result = harness.provisioner.provision_once().expect("provision");
    assert!(!result.created_claims.is_empty());
    assert_eq!(result.unschedulable, 0);

    // Walk every claim through launch and registration.
    for claim_name in &result.created_claims {
        let claim = harness.claim(claim_name).expect("claim");
        assert_eq!(
            claim.metadata.labels.get(NODEPOOL_LABEL),
            Some(&"web-pool".to_string())
        );
        harness.make_claim_ready(claim_name).await;
    }

    // Every launched claim now reports Initialized.
    for claim_name in &result.created_claims {
        assert!(harness.claim(claim_name).expect("claim").is_initialized());
    }
}

#[tokio::test]
async fn provisioner_is_idempotent_across_passes() {
    let harness = Harness::new();
    harness.create_pool("web-pool", when_underutilized());
    harness
        .client
        .pods
        .create(pending_pod("web-0", 800))
        .expect("pod");

    let first = harness.provisioner.provision_once().expect("first");
    let second = harness.provisioner.provision_once().expect("second");
    assert_eq!(first.created_claims.len(), 1);
    assert!(second.created_claims.is_empty());
    assert_eq!(harness.client.nodeclaims.count(), 1);
}

#[tokio::test]
async fn impossible_pods_get_a_reason_and_an_event() {
    let harness = Harness::new();
    harness.create_pool("web-pool", when_underutilized());
    harness
        .client
        .pods
        .create(pending_pod("giant", 1_000_000))
        .expect("pod");

    let result = harness.provisioner.provision_once().expect("provision");
    assert_eq!(result.unschedulable, 1);
    assert!(result.created_claims.is_empty());

    let events = harness.recorder.for_object("Pod/giant");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason, "SchedulingFailed");
    assert!(events[0].message.contains("no instance type"));
}

#[tokio::test]
async fn no_pools_means_everything_is_unschedulable() {
    let harness = Harness::new();
    harness
        .client
        .pods
        .create(pending_pod("stranded", 100))
        .expect("pod");

    let result = harness.provisioner.provision_once().expect("provision");
    assert_eq!(result.unschedulable, 1);
    let events = harness.recorder.for_object("Pod/stranded");
    assert!(events[0].message.contains("no nodepools"));
}
