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
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cirrus::cloud::CloudProvider;
use crate::cirrus::cluster::client::{ClusterClient, WatchEventType};
use crate::cirrus::cluster::state::ClusterState;
use crate::cirrus::config::Options;
use crate::cirrus::controller::runtime::{spawn_reconciler, WorkQueue};
use crate::cirrus::controller::tasks::{self, JobResult, TaskHandle, TaskSpec};
use crate::cirrus::disruption::engine::{DisruptionEngine, EngineConfig};
use crate::cirrus::disruption::queue::DisruptionQueue;
use crate::cirrus::events::EventRecorder;
use crate::cirrus::nodeclaim::conditions::ConditionController;
use crate::cirrus::nodeclaim::garbagecollect::GarbageCollector;
use crate::cirrus::nodeclaim::lifecycle::LifecycleController;
use crate::cirrus::observability::collector::MetricsCollector;
use crate::cirrus::provisioning::provisioner::{batch_channel, BatchConfig, Provisioner};

const DISRUPTION_INTERVAL: Duration = Duration::from_secs(10);
const CONDITION_INTERVAL: Duration = Duration::from_secs(10);
const GC_INTERVAL: Duration = Duration::from_secs(10);
const METRICS_INTERVAL: Duration = Duration::from_secs(30);
const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Wires every controller to the shared stores and runs them until
/// shutdown. The caller supplies the cloud provider binding.
pub struct Operator {
    cancellation: CancellationToken,
    tasks: Vec<TaskHandle>,
    joins: Vec<JoinHandle<()>>,
    pub client: Arc<ClusterClient>,
    pub state: Arc<ClusterState>,
    pub cloud: Arc<dyn CloudProvider>,
    pub recorder: Arc<EventRecorder>,
}

impl Operator {
    pub fn start(
        options: &Options,
        client: Arc<ClusterClient>,
        cloud: Arc<dyn CloudProvider>,
    ) -> Operator {
        let cancellation = CancellationToken::new();
        let state = Arc::new(ClusterState::new());
        let recorder = Arc::new(EventRecorder::new());

        let lifecycle_queue: WorkQueue<String> = WorkQueue::default();
        let lifecycle = Arc::new(LifecycleController::new(
            client.clone(),
            state.clone(),
            cloud.clone(),
            recorder.clone(),
        ));
        let queue = Arc::new(DisruptionQueue::new(
            client.clone(),
            state.clone(),
            recorder.clone(),
        ));
        let engine = Arc::new(DisruptionEngine::new(
            client.clone(),
            state.clone(),
            cloud.clone(),
            queue.clone(),
            EngineConfig {
                drift_enabled: options.feature_gates.drift,
                ..Default::default()
            },
        ));
        let conditions = Arc::new(ConditionController::new(
            client.clone(),
            state.clone(),
            cloud.clone(),
            options.feature_gates.drift,
        ));
        let gc = Arc::new(GarbageCollector::new(
            client.clone(),
            state.clone(),
            cloud.clone(),
            recorder.clone(),
        ));
        let collector = Arc::new(MetricsCollector::new(client.clone()));
        let provisioner = Arc::new(Provisioner::new(
            client.clone(),
            state.clone(),
            cloud.clone(),
            recorder.clone(),
        ));
        let (trigger, mut batcher) = batch_channel();
        let batch_config = BatchConfig {
            idle: options.batch_idle_duration,
            max: options.batch_max_duration,
        };

        let mut joins = Vec::new();

        // Ingest: mirror watch streams into cluster state and feed the
        // work queues. Subscribing before the initial list means duplicate
        // upserts, never missed events.
        {
            let client = client.clone();
            let state = state.clone();
            let lifecycle_queue = lifecycle_queue.clone();
            let trigger = trigger.clone();
            let cancellation = cancellation.clone();
            joins.push(tokio::spawn(async move {
                let mut pods = client.pods.watch();
                let mut nodes = client.nodes.watch();
                let mut claims = client.nodeclaims.watch();

                for pod in client.pods.list() {
                    state.update_pod(&pod);
                }
                state.mark_pods_synced();
                for node in client.nodes.list() {
                    state.update_node(node);
                }
                state.mark_nodes_synced();
                for claim in client.nodeclaims.list() {
                    let name = claim.metadata.name.clone();
                    state.update_nodeclaim(claim);
                    let _ = lifecycle_queue.enqueue(name).await;
                }
                state.mark_claims_synced();
                trigger.poke();

                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => return,
                        event = pods.recv() => {
                            let Ok(event) = event else { continue };
                            match event.event_type {
                                WatchEventType::Deleted => {
                                    state.delete_pod(&event.object.metadata.name)
                                }
                                _ => {
                                    state.update_pod(&event.object);
                                    if event.object.is_provisionable() {
                                        trigger.poke();
                                    }
                                }
                            }
                        }
                        event = nodes.recv() => {
                            let Ok(event) = event else { continue };
                            let provider_id = event.object.provider_id.clone();
                            match event.event_type {
                                WatchEventType::Deleted => {
                                    state.delete_node(&event.object.metadata.name)
                                }
                                _ => state.update_node(event.object),
                            }
                            if let Some(provider_id) = provider_id {
                                let owner = client.nodeclaims.list().into_iter().find(|claim| {
                                    claim.status.provider_id.as_deref() == Some(&provider_id)
                                });
                                if let Some(claim) = owner {
                                    let _ = lifecycle_queue.enqueue(claim.metadata.name).await;
                                }
                            }
                        }
                        event = claims.recv() => {
                            let Ok(event) = event else { continue };
                            let name = event.object.metadata.name.clone();
                            match event.event_type {
                                WatchEventType::Deleted => state.delete_nodeclaim(&name),
                                _ => {
                                    state.update_nodeclaim(event.object);
                                    let _ = lifecycle_queue.enqueue(name).await;
                                }
                            }
                        }
                    }
                }
            }));
        }

        // Node claim lifecycle reconciler.
        {
            let lifecycle = lifecycle.clone();
            joins.push(spawn_reconciler(
                "nodeclaim-lifecycle",
                lifecycle_queue.clone(),
                move |name| {
                    let lifecycle = lifecycle.clone();
                    async move { lifecycle.reconcile(&name).await }
                },
                cancellation.clone(),
            ));
        }

        // Provisioner batch loop.
        {
            let provisioner = provisioner.clone();
            let cancellation = cancellation.clone();
            joins.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => return,
                        woke = batcher.wait(&batch_config) => {
                            if !woke {
                                return;
                            }
                            if let Err(err) = provisioner.provision_once() {
                                log::error!("provisioning pass failed: {}", err);
                            }
                        }
                    }
                }
            }));
        }

        // Disruption command executor.
        {
            let queue = queue.clone();
            let cancellation = cancellation.clone();
            joins.push(tokio::spawn(async move {
                queue.run(cancellation).await;
            }));
        }

        let mut task_handles = Vec::new();
        task_handles.push(interval_task("disruption-engine", DISRUPTION_INTERVAL, {
            let engine = engine.clone();
            move || engine.tick()
        }));
        task_handles.push(interval_task("nodeclaim-conditions", CONDITION_INTERVAL, {
            let conditions = conditions.clone();
            move || conditions.reconcile_all()
        }));
        task_handles.push(interval_task("nodeclaim-gc", GC_INTERVAL, {
            let gc = gc.clone();
            move || {
                gc.collect_once();
            }
        }));
        task_handles.push(interval_task("metrics-collector", METRICS_INTERVAL, {
            let collector = collector.clone();
            move || collector.collect_once()
        }));
        // Periodic resync guards against missed watch events.
        {
            let client = client.clone();
            let lifecycle_queue = lifecycle_queue.clone();
            task_handles.push(tasks::spawn(
                TaskSpec::Interval {
                    label: "nodeclaim-resync",
                    period: RESYNC_INTERVAL,
                },
                move |_ctx| {
                    let client = client.clone();
                    let lifecycle_queue = lifecycle_queue.clone();
                    Box::pin(async move {
                        for claim in client.nodeclaims.list() {
                            let _ = lifecycle_queue.enqueue(claim.metadata.name).await;
                        }
                        JobResult::Continue
                    })
                },
            ));
        }

        log::info!(
            "operator {} started (drift gate {})",
            options.service_name,
            if options.feature_gates.drift { "on" } else { "off" }
        );

        Operator {
            cancellation,
            tasks: task_handles,
            joins,
            client,
            state,
            cloud,
            recorder,
        }
    }

    /// Cancels every loop and waits for them to drain. In-flight work is
    /// dropped; partially created claims are recoverable from the stores on
    /// the next start.
    pub async fn shutdown(self) {
        self.cancellation.cancel();
        for task in &self.tasks {
            task.cancel();
        }
        for join in self.joins {
            let _ = join.await;
        }
        for task in &self.tasks {
            task.abort();
        }
        log::info!("operator stopped");
    }
}

fn interval_task<F>(label: &'static str, period: Duration, job: F) -> TaskHandle
where
    F: Fn() + Send + Sync + 'static,
{
    tasks::spawn(TaskSpec::Interval { label, period }, move |_ctx| {
        job();
        Box::pin(async move { JobResult::Continue })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cirrus::api::nodepool::NodePool;
    use crate::cirrus::api::object::ObjectMeta;
    use crate::cirrus::api::pod::{Pod, PodSpec};
    use crate::cirrus::api::resources::Resources;
    use crate::cirrus::cloud::fake::FakeCloudProvider;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn operator_syncs_and_shuts_down() {
        let client = Arc::new(ClusterClient::new());
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        client
            .nodepools
            .create(NodePool {
                metadata: ObjectMeta::named("default"),
                ..Default::default()
            })
            .expect("pool");

        let mut options = Options::default();
        options.batch_idle_duration = Duration::from_millis(20);
        options.batch_max_duration = Duration::from_millis(100);
        let operator = Operator::start(&options, client.clone(), cloud);

        // The ingest loop marks state synced shortly after start.
        for _ in 0..50 {
            if operator.state.synced() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(operator.state.synced());

        client
            .pods
            .create(Pod::new(
                ObjectMeta::named("web-0"),
                PodSpec {
                    requests: Resources::requests(500, 1 << 30),
                    ..Default::default()
                },
            ))
            .expect("pod");

        // The batch loop should commit and create a claim.
        for _ in 0..100 {
            if client.nodeclaims.count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.nodeclaims.count() > 0);

        operator.shutdown().await;
    }
}
