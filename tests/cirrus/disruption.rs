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

use std::time::Duration;

use cirrus::cirrus::api::nodeclaim::ConditionType;
use cirrus::cirrus::disruption::engine::EngineConfig;

use super::support::{on_demand_catalog, when_empty, when_underutilized, Harness};

#[tokio::test]
async fn empty_node_reaped_after_consolidate_after() {
    let harness = Harness::new();
    let pool = harness.create_pool("empty-pool", when_empty(Duration::from_secs(30)));
    harness
        .launch_initialized_claim(&pool, "empty-pool-1", &["c-small"])
        .await;

    // The condition controller observes the empty node.
    harness.conditions.reconcile_all();
    let claim = harness.claim("empty-pool-1").expect("claim");
    assert!(claim.condition_is_true(ConditionType::Empty));

    // Too fresh: the thirty-second hold has not elapsed.
    harness.engine.tick();
    harness.queue.drain().await;
    assert!(harness
        .claim("empty-pool-1")
        .expect("claim")
        .metadata
        .deletion_timestamp
        .is_none());

    // Once the condition is thirty seconds old the next tick removes it.
    harness.backdate_condition("empty-pool-1", ConditionType::Empty, 31);
    harness.engine.tick();
    harness.queue.drain().await;
    assert!(harness
        .claim("empty-pool-1")
        .expect("claim")
        .metadata
        .deletion_timestamp
        .is_some());
}

#[tokio::test]
async fn consolidate_after_never_opts_out_of_emptiness_but_not_drift() {
    let harness = Harness::new();
    let mut disruption = when_empty(Duration::from_secs(30));
    disruption.consolidate_after =
        Some(cirrus::cirrus::api::duration::NillableDuration::never());
    let pool = harness.create_pool("never-pool", disruption);
    harness
        .launch_initialized_claim(&pool, "never-pool-1", &["c-small"])
        .await;

    harness.conditions.reconcile_all();
    harness.backdate_condition("never-pool-1", ConditionType::Empty, 3_600);
    harness.engine.tick();
    harness.queue.drain().await;
    assert!(harness
        .claim("never-pool-1")
        .expect("claim")
        .metadata
        .deletion_timestamp
        .is_none());

    // Drift still applies to the same node.
    harness.mark_drifted("never-pool-1");
    harness.engine.tick();
    harness.queue.drain().await;
    assert!(harness
        .claim("never-pool-1")
        .expect("claim")
        .metadata
        .deletion_timestamp
        .is_some());
}

#[tokio::test]
async fn drift_skips_nodes_whose_pods_cannot_reschedule() {
    let harness = Harness::new();
    // Offerings max out well below the pinned pod's request.
    harness
        .cloud
        .set_catalog(on_demand_catalog(&[("big", 128_000, 1.0)]));
    let pool = harness.create_pool("drift-pool", when_underutilized());
    let node = harness
        .launch_initialized_claim(&pool, "drift-pool-big", &["big"])
        .await;
    harness
        .launch_initialized_claim(&pool, "drift-pool-empty", &["big"])
        .await;

    // 150 CPU cannot fit on any 128-CPU shape after eviction.
    harness.bind_pod("giant", &node, 150_000);
    harness.mark_drifted("drift-pool-big");
    harness.mark_drifted("drift-pool-empty");

    harness.engine.tick();
    harness.queue.drain().await;

    assert!(harness
        .claim("drift-pool-big")
        .expect("claim")
        .metadata
        .deletion_timestamp
        .is_none());
    assert!(harness
        .claim("drift-pool-empty")
        .expect("claim")
        .metadata
        .deletion_timestamp
        .is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_drift_replacement_untaints_the_old_node() {
    let harness = Harness::new();
    let pool = harness.create_pool("drift-pool", when_underutilized());
    let node_name = harness
        .launch_initialized_claim(&pool, "drift-pool-1", &["c-medium"])
        .await;
    harness.bind_pod("web-0", &node_name, 1_000);
    harness.mark_drifted("drift-pool-1");

    // Every launch attempt is rejected terminally from here on.
    harness.cloud.reject_creates("create disabled");

    harness.engine.tick();
    let drain = {
        let queue = harness.queue.clone();
        tokio::spawn(async move { queue.drain().await })
    };
    // Let the queue create the replacement, then drive its launch to the
    // terminal failure the queue is watching for.
    tokio::time::sleep(Duration::from_millis(50)).await;
    if harness.claim("drift-pool-1-r0").is_some() {
        harness
            .lifecycle
            .reconcile("drift-pool-1-r0")
            .await
            .expect("replacement reconcile");
    }
    drain.await.expect("drain");

    // The replacement is being removed and the old node is back in service.
    if let Some(replacement) = harness.claim("drift-pool-1-r0") {
        assert!(replacement.metadata.deletion_timestamp.is_some());
        harness
            .lifecycle
            .reconcile("drift-pool-1-r0")
            .await
            .expect("finalize replacement");
        assert!(harness.claim("drift-pool-1-r0").is_none());
    }
    let old = harness.claim("drift-pool-1").expect("old claim kept");
    assert!(old.metadata.deletion_timestamp.is_none());
    let node = harness.client.nodes.get(&node_name).expect("node");
    assert!(!node.is_cordoned());
    assert!(!harness
        .state
        .snapshot()
        .iter()
        .any(|snapshot| snapshot.marked_for_deletion));
}

#[tokio::test]
async fn a_hundred_empty_drifted_claims_disrupt_in_one_tick() {
    let harness = Harness::new();
    let pool = harness.create_pool("bulk-pool", when_underutilized());
    for index in 0..100 {
        harness
            .launch_initialized_claim(&pool, &format!("bulk-pool-{:03}", index), &["c-small"])
            .await;
        harness.mark_drifted(&format!("bulk-pool-{:03}", index));
    }
    assert_eq!(harness.client.nodeclaims.count(), 100);

    harness.engine.tick();
    harness.queue.drain().await;

    let claims = harness.client.nodeclaims.list();
    assert_eq!(claims.len(), 100, "no replacements were created");
    assert!(claims
        .iter()
        .all(|claim| claim.metadata.deletion_timestamp.is_some()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consolidation_replaces_with_a_cheaper_offering() {
    let harness = Harness::new();
    harness.cloud.set_catalog(on_demand_catalog(&[
        ("m-pricey", 8_000, 0.50),
        ("m-value", 8_000, 0.30),
    ]));
    let pool = harness.create_pool("spend-pool", when_underutilized());
    let node_name = harness
        .launch_initialized_claim(&pool, "spend-pool-1", &["m-pricey"])
        .await;
    for index in 0..3 {
        harness.bind_pod(&format!("worker-{}", index), &node_name, 2_000);
    }

    harness.engine.tick();
    let drain = {
        let queue = harness.queue.clone();
        tokio::spawn(async move { queue.drain().await })
    };
    // Bring the replacement claim to Initialized while the queue waits.
    let mut replaced = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if harness.claim("spend-pool-1-r0").is_some() && !replaced {
            harness.make_claim_ready("spend-pool-1-r0").await;
            replaced = true;
        }
        if replaced {
            break;
        }
    }
    drain.await.expect("drain");
    assert!(replaced, "replacement claim was created");

    let replacement = harness.claim("spend-pool-1-r0").expect("replacement");
    assert!(replacement.is_initialized());
    // The resolved offering undercuts the old node's price.
    let old = harness.claim("spend-pool-1").expect("old claim");
    assert!(old.metadata.deletion_timestamp.is_some());
}

#[tokio::test]
async fn consolidation_deletes_when_pods_fit_elsewhere() {
    let harness = Harness::new();
    let pool = harness.create_pool("fit-pool", when_underutilized());
    let first = harness
        .launch_initialized_claim(&pool, "fit-pool-1", &["c-large"])
        .await;
    let second = harness
        .launch_initialized_claim(&pool, "fit-pool-2", &["c-large"])
        .await;
    harness.bind_pod("small-0", &first, 500);
    harness.bind_pod("small-1", &second, 500);

    harness.engine.tick();
    harness.queue.drain().await;

    // The first node's pod fits the second, so one delete goes out; the
    // per-pool budget holds the other node.
    assert!(harness
        .claim("fit-pool-1")
        .expect("claim")
        .metadata
        .deletion_timestamp
        .is_some());
    assert!(harness
        .claim("fit-pool-2")
        .expect("claim")
        .metadata
        .deletion_timestamp
        .is_none());
}

#[tokio::test]
async fn drift_gate_off_ignores_drifted_claims() {
    let harness = Harness::with_engine_config(EngineConfig {
        drift_enabled: false,
        ..Default::default()
    });
    // A WhenEmpty pool with no Empty claims isolates the drift signal.
    let pool = harness.create_pool("gated-pool", when_empty(Duration::from_secs(30)));
    harness
        .launch_initialized_claim(&pool, "gated-pool-1", &["c-small"])
        .await;
    harness
        .launch_initialized_claim(&pool, "gated-pool-2", &["c-small"])
        .await;
    harness.mark_drifted("gated-pool-1");
    harness.mark_drifted("gated-pool-2");

    harness.engine.tick();
    harness.queue.drain().await;

    assert!(harness
        .claim("gated-pool-1")
        .expect("claim")
        .metadata
        .deletion_timestamp
        .is_none());
    assert!(harness
        .claim("gated-pool-2")
        .expect("claim")
        .metadata
        .deletion_timestamp
        .is_none());
}

#[tokio::test]
async fn do_not_disrupt_pods_shield_their_node() {
    let harness = Harness::new();
    let pool = harness.create_pool("guarded-pool", when_underutilized());
    let node = harness
        .launch_initialized_claim(&pool, "guarded-pool-1", &["c-small"])
        .await;
    let mut pod = harness.bind_pod("precious", &node, 100);
    pod.metadata.annotations.insert(
        cirrus::cirrus::api::object::DO_NOT_DISRUPT_ANNOTATION.to_string(),
        "true".to_string(),
    );
    harness.client.pods.update(pod.clone()).expect("update pod");
    harness.state.update_pod(&pod);
    harness.mark_drifted("guarded-pool-1");

    harness.engine.tick();
    harness.queue.drain().await;

    assert!(harness
        .claim("guarded-pool-1")
        .expect("claim")
        .metadata
        .deletion_timestamp
        .is_none());
}

#[tokio::test]
async fn replaying_a_delete_command_is_a_noop() {
    use cirrus::cirrus::disruption::queue::{Command, CommandAction};
    use cirrus::cirrus::disruption::DisruptionMethod;
    use std::collections::HashMap;

    let harness = Harness::new();
    let pool = harness.create_pool("replay-pool", when_empty(Duration::from_secs(0)));
    harness
        .launch_initialized_claim(&pool, "replay-pool-1", &["c-small"])
        .await;

    let command = Command {
        method: DisruptionMethod::Emptiness,
        claims: vec!["replay-pool-1".to_string()],
        action: CommandAction::Delete,
        pools: vec![],
        expected_pods: HashMap::from([("replay-pool-1".to_string(), vec![])]),
    };
    harness.queue.enqueue(command.clone());
    harness.queue.drain().await;
    let first = harness.claim("replay-pool-1").expect("claim");
    assert!(first.metadata.deletion_timestamp.is_some());

    harness.queue.enqueue(command);
    harness.queue.drain().await;
    let second = harness.claim("replay-pool-1").expect("claim");
    assert_eq!(
        first.metadata.deletion_timestamp,
        second.metadata.deletion_timestamp
    );
}
