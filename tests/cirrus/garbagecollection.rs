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

use chrono::{Duration as ChronoDuration, Utc};

use super::support::{when_underutilized, Harness};

#[tokio::test]
async fn phantom_claim_is_reaped_with_its_finalizer() {
    let harness = Harness::new();
    let pool = harness.create_pool("gc-pool", when_underutilized());
    harness
        .launch_initialized_claim(&pool, "gc-pool-1", &["c-small"])
        .await;

    // The instance disappears cloud-side without a delete call.
    let provider_id = harness
        .claim("gc-pool-1")
        .expect("claim")
        .status
        .provider_id
        .expect("provider id");
    harness.cloud.forget(&provider_id);
    // The node is no longer Ready either; mirror that.
    let mut node = harness.client.nodes.get("node-gc-pool-1").expect("node");
    node.ready = false;
    harness.client.nodes.update(node.clone()).expect("node update");
    harness.state.update_node(node);

    // Backdate creation past the instance-gone grace window.
    let mut claim = harness.claim("gc-pool-1").expect("claim");
    claim.metadata.creation_timestamp = Some(Utc::now() - ChronoDuration::seconds(20));
    harness.client.nodeclaims.update(claim.clone()).expect("update");
    harness.state.update_nodeclaim(claim);

    assert_eq!(harness.gc.collect_once(), 1);
    assert!(harness.claim("gc-pool-1").is_none());
}

#[tokio::test]
async fn gc_spares_claims_with_a_ready_node() {
    let harness = Harness::new();
    let pool = harness.create_pool("gc-pool", when_underutilized());
    harness
        .launch_initialized_claim(&pool, "gc-pool-1", &["c-small"])
        .await;
    let provider_id = harness
        .claim("gc-pool-1")
        .expect("claim")
        .status
        .provider_id
        .expect("provider id");
    harness.cloud.forget(&provider_id);

    let mut claim = harness.claim("gc-pool-1").expect("claim");
    claim.metadata.creation_timestamp = Some(Utc::now() - ChronoDuration::seconds(3_600));
    harness.client.nodeclaims.update(claim.clone()).expect("update");
    harness.state.update_nodeclaim(claim);

    // The node is still Ready, so nothing is reaped.
    assert_eq!(harness.gc.collect_once(), 0);
    assert!(harness.claim("gc-pool-1").is_some());
}

#[tokio::test]
async fn launched_but_never_registered_claim_is_reclaimed() {
    let harness = Harness::new();
    let pool = harness.create_pool("gc-pool", when_underutilized());
    // Launch only; no node ever appears.
    let proposal = cirrus::cirrus::provisioning::scheduler::NodeClaimProposal {
        pool: pool.metadata.name.clone(),
        requirements: Default::default(),
        instance_types: vec![],
        pods: vec![],
        requests: Default::default(),
        taints: vec![],
        startup_taints: vec![],
    };
    let claim = cirrus::cirrus::provisioning::provisioner::claim_from_proposal(
        &proposal,
        &pool,
        "gc-pool-slow",
    );
    harness.client.nodeclaims.create(claim.clone()).expect("create");
    harness.state.update_nodeclaim(claim);
    harness
        .lifecycle
        .reconcile("gc-pool-slow")
        .await
        .expect("launch");

    let mut claim = harness.claim("gc-pool-slow").expect("claim");
    claim.metadata.creation_timestamp = Some(Utc::now() - ChronoDuration::seconds(1_000));
    harness.client.nodeclaims.update(claim.clone()).expect("update");
    harness.state.update_nodeclaim(claim);

    assert_eq!(harness.gc.collect_once(), 1);
    // Deleted through the normal path: the termination flow still owns the
    // instance teardown.
    let claim = harness.claim("gc-pool-slow").expect("terminating claim");
    assert!(claim.metadata.deletion_timestamp.is_some());
    harness
        .lifecycle
        .reconcile("gc-pool-slow")
        .await
        .expect("terminate");
    assert!(harness.claim("gc-pool-slow").is_none());
    assert_eq!(harness.cloud.instance_count(), 0);
}
