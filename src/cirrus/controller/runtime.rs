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

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const DEFAULT_QUEUE_CAPACITY: usize = 256;
const BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// What a reconcile pass decided about follow-up work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; wait for the next watch event.
    Done,
    /// Converged for now but must be revisited after the delay.
    RequeueAfter(Duration),
}

#[derive(Clone)]
pub struct WorkQueue<T> {
    inner: Arc<WorkQueueInner<T>>,
}

struct WorkQueueInner<T> {
    sender: mpsc::Sender<T>,
    receiver: Mutex<mpsc::Receiver<T>>,
}

impl<T> WorkQueue<T>
where
    T: Send + 'static,
{
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(WorkQueueInner {
                sender,
                receiver: Mutex::new(receiver),
            }),
        }
    }

    pub async fn enqueue(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        self.inner.sender.send(item).await
    }

    /// Re-enqueues after a delay without blocking the caller.
    pub fn enqueue_after(&self, item: T, delay: Duration) {
        let sender = self.inner.sender.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = sender.send(item).await;
        });
    }

    pub async fn next(&self) -> Option<T> {
        let mut guard = self.inner.receiver.lock().await;
        guard.recv().await
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        WorkQueue::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Drains a key queue through a reconcile handler. Items are processed one
/// at a time, so reconciles for the same object are naturally serialized.
/// Errors requeue with per-key exponential backoff; `RequeueAfter` schedules
/// a planned revisit.
pub fn spawn_reconciler<F, Fut, E>(
    controller: &'static str,
    queue: WorkQueue<String>,
    handler: F,
    cancellation: CancellationToken,
) -> JoinHandle<()>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, E>> + Send,
    E: Display,
{
    tokio::spawn(async move {
        let mut attempts: HashMap<String, u32> = HashMap::new();
        loop {
            let item = tokio::select! {
                _ = cancellation.cancelled() => return,
                item = queue.next() => match item {
                    Some(item) => item,
                    None => return,
                },
            };
            match handler(item.clone()).await {
                Ok(Outcome::Done) => {
                    attempts.remove(&item);
                }
                Ok(Outcome::RequeueAfter(delay)) => {
                    attempts.remove(&item);
                    queue.enqueue_after(item, delay);
                }
                Err(err) => {
                    let attempt = attempts.entry(item.clone()).or_insert(0);
                    *attempt += 1;
                    let backoff = backoff_for(*attempt);
                    log::error!(
                        "{} reconcile of {} failed (attempt {}): {}; retrying in {:?}",
                        controller,
                        item,
                        attempt,
                        err,
                        backoff
                    );
                    queue.enqueue_after(item, backoff);
                }
            }
        }
    })
}

fn backoff_for(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let backoff = BACKOFF_INITIAL.saturating_mul(1u32 << exp);
    backoff.min(BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    #[tokio::test]
    async fn work_queue_orders_items() {
        let queue: WorkQueue<u32> = WorkQueue::new(4);
        queue.enqueue(1).await.expect("enqueue 1");
        queue.enqueue(2).await.expect("enqueue 2");
        queue.enqueue(3).await.expect("enqueue 3");

        assert_eq!(queue.next().await, Some(1));
        assert_eq!(queue.next().await, Some(2));
        assert_eq!(queue.next().await, Some(3));
    }

    #[tokio::test]
    async fn enqueue_after_delivers_later() {
        let queue: WorkQueue<&'static str> = WorkQueue::default();
        queue.enqueue_after("delayed", Duration::from_millis(20));
        let item = timeout(Duration::from_secs(1), queue.next())
            .await
            .expect("delivery timeout");
        assert_eq!(item, Some("delayed"));
    }

    #[tokio::test]
    async fn reconciler_retries_failures_with_backoff() {
        let queue: WorkQueue<String> = WorkQueue::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let cancellation = CancellationToken::new();

        let handle = spawn_reconciler(
            "test",
            queue.clone(),
            move |_item| {
                let calls = calls_clone.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err("transient".to_string())
                    } else {
                        Ok(Outcome::Done)
                    }
                }
            },
            cancellation.clone(),
        );

        queue.enqueue("claim-1".to_string()).await.expect("enqueue");
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancellation.cancel();
        let _ = handle.await;

        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn backoff_grows_and_saturates() {
        assert_eq!(backoff_for(1), BACKOFF_INITIAL);
        assert!(backoff_for(3) > backoff_for(2));
        assert_eq!(backoff_for(30), BACKOFF_MAX);
    }
}
