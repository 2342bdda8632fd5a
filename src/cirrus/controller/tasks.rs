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

use futures_util::future::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub type JobFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobResult {
    Stop,
    Continue,
}

#[derive(Clone)]
pub struct TaskContext {
    label: &'static str,
    cancellation: CancellationToken,
}

impl TaskContext {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

#[derive(Clone, Copy, Debug)]
pub enum TaskSpec {
    Immediate {
        label: &'static str,
    },
    After {
        label: &'static str,
        delay: Duration,
    },
    /// Runs once immediately, then repeats on the period until the job
    /// returns `Stop` or the task is cancelled.
    Interval {
        label: &'static str,
        period: Duration,
    },
}

type JobFn = dyn Fn(TaskContext) -> JobFuture + Send + Sync + 'static;

pub struct TaskHandle {
    cancellation: CancellationToken,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn abort(&self) {
        if let Some(handle) = self.join.lock().expect("task join lock poisoned").take() {
            handle.abort();
        }
    }

    pub fn cancel_and_abort(&self) {
        self.cancel();
        self.abort();
    }

    pub async fn join(&self) -> Result<(), tokio::task::JoinError> {
        let maybe_handle = self.join.lock().expect("task join lock poisoned").take();
        if let Some(handle) = maybe_handle {
            handle.await.map(|_| ())
        } else {
            Ok(())
        }
    }
}

/// Spawns background jobs with cancellation and panic isolation. A panicking
/// job stops its own task; it never takes the process down.
pub fn spawn<F>(spec: TaskSpec, job: F) -> TaskHandle
where
    F: Fn(TaskContext) -> JobFuture + Send + Sync + 'static,
{
    let job = Arc::new(job) as Arc<JobFn>;
    let cancellation = CancellationToken::new();
    let join_handle = spawn_for_spec(&cancellation, spec, job);
    TaskHandle {
        cancellation,
        join: Arc::new(Mutex::new(Some(join_handle))),
    }
}

fn spawn_for_spec(
    cancellation: &CancellationToken,
    spec: TaskSpec,
    job: Arc<JobFn>,
) -> JoinHandle<()> {
    let cancellation = cancellation.clone();
    match spec {
        TaskSpec::Immediate { label } => tokio::spawn(async move {
            let ctx = TaskContext {
                label,
                cancellation,
            };
            let _ = run_job(&job, ctx).await;
        }),
        TaskSpec::After { label, delay } => tokio::spawn(async move {
            tokio::select! {
                _ = cancellation.cancelled() => return,
                _ = sleep(delay) => {}
            }
            let ctx = TaskContext {
                label,
                cancellation,
            };
            let _ = run_job(&job, ctx).await;
        }),
        TaskSpec::Interval { label, period } => tokio::spawn(async move {
            loop {
                if cancellation.is_cancelled() {
                    return;
                }
                let ctx = TaskContext {
                    label,
                    cancellation: cancellation.clone(),
                };
                if run_job(&job, ctx).await == JobResult::Stop {
                    return;
                }
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    _ = sleep(period) => {}
                }
            }
        }),
    }
}

async fn run_job(job: &Arc<JobFn>, ctx: TaskContext) -> JobResult {
    if ctx.cancellation.is_cancelled() {
        return JobResult::Stop;
    }
    let label = ctx.label;
    AssertUnwindSafe((job.clone())(ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            log::error!("task {} panicked; stopping task", label);
            JobResult::Stop
        })
}
