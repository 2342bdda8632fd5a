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

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::cirrus::api::nodeclaim::ConditionType;
use crate::cirrus::api::object::{Taint, DISRUPTING_TAINT_KEY};
use crate::cirrus::cluster::client::ClusterClient;
use crate::cirrus::cluster::state::ClusterState;
use crate::cirrus::disruption::candidates::pod_names_for_claim;
use crate::cirrus::disruption::DisruptionMethod;
use crate::cirrus::events::EventRecorder;
use crate::cirrus::observability::metrics;
use crate::cirrus::provisioning::provisioner::claim_from_proposal;
use crate::cirrus::provisioning::scheduler::NodeClaimProposal;

const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum CommandAction {
    Delete,
    Replace { proposals: Vec<NodeClaimProposal> },
}

/// One serialized disruption decision. Commands are idempotent: replaying a
/// command whose replacements already exist is safe, and a command whose
/// world moved on aborts instead of executing.
#[derive(Debug, Clone)]
pub struct Command {
    pub method: DisruptionMethod,
    pub claims: Vec<String>,
    pub action: CommandAction,
    /// Pools whose non-empty budget this command occupies; empty for
    /// parallel empty-node deletions.
    pub pools: Vec<String>,
    /// Pods observed on each claim at validation time, sorted.
    pub expected_pods: HashMap<String, Vec<String>>,
}

/// FIFO executor for disruption commands. Replacements wait for the new
/// claims to initialize before the old nodes are deleted, and always untaint
/// on failure so nodes are never left cordoned indefinitely.
pub struct DisruptionQueue {
    client: Arc<ClusterClient>,
    state: Arc<ClusterState>,
    recorder: Arc<EventRecorder>,
    sender: mpsc::UnboundedSender<Command>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<Command>>,
    busy_pools: Mutex<HashSet<String>>,
    readiness_timeout: Duration,
    poll_interval: Duration,
}

impl DisruptionQueue {
    pub fn new(
        client: Arc<ClusterClient>,
        state: Arc<ClusterState>,
        recorder: Arc<EventRecorder>,
    ) -> Self {
        DisruptionQueue::with_timeouts(
            client,
            state,
            recorder,
            DEFAULT_READINESS_TIMEOUT,
            DEFAULT_POLL_INTERVAL,
        )
    }

    pub fn with_timeouts(
        client: Arc<ClusterClient>,
        state: Arc<ClusterState>,
        recorder: Arc<EventRecorder>,
        readiness_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        DisruptionQueue {
            client,
            state,
            recorder,
            sender,
            receiver: AsyncMutex::new(receiver),
            busy_pools: Mutex::new(HashSet::new()),
            readiness_timeout,
            poll_interval,
        }
    }

    /// Whether a non-empty command is already in flight for the pool.
    pub fn pool_busy(&self, pool: &str) -> bool {
        self.busy_pools
            .lock()
            .expect("busy pool lock poisoned")
            .contains(pool)
    }

    /// Accepts a command, reserving the budgets it names.
    pub fn enqueue(&self, command: Command) {
        {
            let mut busy = self.busy_pools.lock().expect("busy pool lock poisoned");
            for pool in &command.pools {
                busy.insert(pool.clone());
            }
        }
        let _ = self.sender.send(command);
    }

    /// Worker loop; commands execute strictly in arrival order.
    pub async fn run(&self, cancellation: CancellationToken) {
        loop {
            let command = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    command = receiver.recv() => match command {
                        Some(command) => command,
                        None => return,
                    },
                }
            };
            self.execute(command, &cancellation).await;
        }
    }

    /// Processes everything currently queued, then returns.
    pub async fn drain(&self) {
        loop {
            let command = {
                let mut receiver = self.receiver.lock().await;
                match receiver.try_recv() {
                    Ok(command) => command,
                    Err(_) => return,
                }
            };
            self.execute(command, &CancellationToken::new()).await;
        }
    }

    async fn execute(&self, command: Command, cancellation: &CancellationToken) {
        match &command.action {
            CommandAction::Delete => self.execute_delete(&command),
            CommandAction::Replace { proposals } => {
                self.execute_replace(&command, proposals.clone(), cancellation)
                    .await
            }
        }
        let mut busy = self.busy_pools.lock().expect("busy pool lock poisoned");
        for pool in &command.pools {
            busy.remove(pool);
        }
    }

    fn execute_delete(&self, command: &Command) {
        let names: Vec<&str> = command.claims.iter().map(String::as_str).collect();
        self.state.mark_for_deletion(&names);
        for claim in &command.claims {
            // Already-gone claims make the replay a no-op.
            if let Err(err) = self.client.nodeclaims.delete(claim) {
                log::debug!("delete of claim {} skipped: {}", claim, err);
                continue;
            }
            self.recorder.publish(
                format!("NodeClaim/{}", claim),
                "Disrupted",
                format!("deleted via {}", command.method.as_label()),
            );
            metrics::record_disruption_action(command.method.as_label(), "delete");
        }
    }

    async fn execute_replace(
        &self,
        command: &Command,
        proposals: Vec<NodeClaimProposal>,
        cancellation: &CancellationToken,
    ) {
        // Between validation and execution the world may have moved; a
        // changed pod set discards the command and the next tick re-plans.
        for claim in &command.claims {
            let current = pod_names_for_claim(&self.state, claim);
            let expected = command
                .expected_pods
                .get(claim)
                .cloned()
                .unwrap_or_default();
            if current != expected {
                log::info!(
                    "aborting replacement of {}: pod set changed since validation",
                    claim
                );
                metrics::record_disruption_action(command.method.as_label(), "abort");
                return;
            }
        }

        let names: Vec<&str> = command.claims.iter().map(String::as_str).collect();
        self.state.mark_for_deletion(&names);
        self.set_cordon(&command.claims, true);

        let mut replacements = Vec::with_capacity(proposals.len());
        let mut launch_failed = false;
        for (index, proposal) in proposals.iter().enumerate() {
            let name = format!("{}-r{}", command.claims[0], index);
            if self.client.nodeclaims.get(&name).is_none() {
                let Some(pool) = self.client.nodepools.get(&proposal.pool) else {
                    launch_failed = true;
                    break;
                };
                let claim = claim_from_proposal(proposal, &pool, &name);
                if self.client.nodeclaims.create(claim.clone()).is_ok() {
                    self.state.update_nodeclaim(claim);
                }
            }
            replacements.push(name);
        }

        let ready = !launch_failed
            && self
                .wait_for_initialized(&replacements, cancellation)
                .await;

        if ready {
            for claim in &command.claims {
                if let Err(err) = self.client.nodeclaims.delete(claim) {
                    log::debug!("delete of replaced claim {} skipped: {}", claim, err);
                }
                self.recorder.publish(
                    format!("NodeClaim/{}", claim),
                    "Disrupted",
                    format!("replaced via {}", command.method.as_label()),
                );
            }
            metrics::record_disruption_action(command.method.as_label(), "replace");
            return;
        }

        // Roll back: drop the replacements and put the old nodes back into
        // service.
        for name in &replacements {
            if let Err(err) = self.client.nodeclaims.delete(name) {
                log::debug!("rollback delete of {} skipped: {}", name, err);
            }
            self.state.delete_nodeclaim(name);
        }
        self.set_cordon(&command.claims, false);
        self.state.unmark_for_deletion(&names);
        metrics::record_disruption_action(command.method.as_label(), "abort");
        log::warn!(
            "replacement for {:?} failed or timed out; old nodes untainted",
            command.claims
        );
    }

    /// Polls the replacement claims until every one reports Initialized.
    /// Returns false on timeout, cancellation, or a terminal launch failure.
    async fn wait_for_initialized(
        &self,
        replacements: &[String],
        cancellation: &CancellationToken,
    ) -> bool {
        let deadline = Instant::now() + self.readiness_timeout;
        loop {
            let mut all_ready = true;
            for name in replacements {
                match self.client.nodeclaims.get(name) {
                    Some(claim) => {
                        if let Some(launched) = claim.condition(ConditionType::Launched) {
                            if !launched.status {
                                return false;
                            }
                        }
                        if !claim.is_initialized() {
                            all_ready = false;
                        }
                    }
                    None => return false,
                }
            }
            if all_ready {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::select! {
                _ = cancellation.cancelled() => return false,
                _ = sleep(self.poll_interval) => {}
            }
        }
    }

    /// Applies or clears the disruption taint on the nodes behind the claims.
    fn set_cordon(&self, claims: &[String], cordon: bool) {
        for claim in claims {
            let Some(node_name) = self.state.node_name_for_claim(claim) else {
                continue;
            };
            let Some(mut node) = self.client.nodes.get(&node_name) else {
                continue;
            };
            if cordon {
                node.add_taint(Taint::disrupting());
            } else {
                node.remove_taint(DISRUPTING_TAINT_KEY);
            }
            match self.client.nodes.update(node.clone()) {
                Ok(_) => self.state.update_node(node),
                Err(err) => log::warn!("failed to update taints on node {}: {}", node_name, err),
            }
        }
    }
}
