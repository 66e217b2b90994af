use futures::future::{BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::retry::Retrier;
use crate::config::QueueConfig;
use crate::engine_error::EngineError;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, EngineError>>>;

struct InFlight {
    generation: u64,
    request: Box<dyn Any + Send + Sync>,
}

type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

/// Access to the queue's concurrency slots for one request.
struct Slots {
    permits: Arc<Semaphore>,
    queue_timeout: Duration,
    key: Arc<str>,
}

impl Slots {
    /// Wait in FIFO order for a slot, up to the queue timeout.
    async fn acquire(&self) -> Result<OwnedSemaphorePermit, EngineError> {
        let queued_at = Instant::now();
        match tokio::time::timeout(self.queue_timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                debug!(
                    key = %self.key,
                    waited_ms = queued_at.elapsed().as_millis() as u64,
                    "Request dequeued"
                );
                Ok(permit)
            }
            Ok(Err(_)) => Err(EngineError::unknown("request queue closed")),
            Err(_) => {
                warn!(
                    key = %self.key,
                    timeout_ms = self.queue_timeout.as_millis() as u64,
                    "Queued request timed out"
                );
                Err(EngineError::queue_timeout(&self.key, self.queue_timeout))
            }
        }
    }
}

/// Deduplicating, concurrency-bounded request scheduler.
///
/// Callers asking for a key that is already being fetched attach to the same
/// result. New work waits in FIFO order for one of `max_concurrent` slots and
/// fails with `QueueTimeout` if it waits longer than the queue timeout.
/// Producers run on their own task, so a fetch keeps going even when every
/// caller has stopped waiting for it.
pub struct RequestQueue {
    in_flight: InFlightMap,
    permits: Arc<Semaphore>,
    queue_timeout: Duration,
    generation: AtomicU64,
}

impl RequestQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            queue_timeout: config.timeout(),
            generation: AtomicU64::new(0),
        }
    }

    /// Run `producer` for `key` while holding one slot, or join the request
    /// already in flight for it.
    pub async fn schedule<T, F, Fut>(&self, key: &str, producer: F) -> Result<T, EngineError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        self.dedup(key, move |slots| async move {
            let _permit = slots.acquire().await?;
            producer().await
        })
        .await
    }

    /// Run `op` for `key` under `retrier`, or join the request already in
    /// flight for it. Each attempt takes its own slot; backoff sleeps hold none.
    pub async fn schedule_retrying<T, E, F, Fut, C>(
        &self,
        key: &str,
        retrier: Retrier,
        label: &'static str,
        op: F,
        classify: C,
    ) -> Result<T, EngineError>
    where
        T: Clone + Send + Sync + 'static,
        E: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        C: Fn(E) -> EngineError + Send + Sync + 'static,
    {
        self.dedup(key, move |slots| async move {
            retrier
                .run(
                    label,
                    || {
                        let slots = &slots;
                        let op = &op;
                        let classify = &classify;
                        async move {
                            let _permit = slots.acquire().await?;
                            op().await.map_err(classify)
                        }
                    },
                    std::convert::identity,
                )
                .await
        })
        .await
    }

    async fn dedup<T, W, Fut>(&self, key: &str, work: W) -> Result<T, EngineError>
    where
        T: Clone + Send + Sync + 'static,
        W: FnOnce(Slots) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let request = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            let existing = in_flight
                .get(key)
                .and_then(|slot| slot.request.downcast_ref::<SharedResult<T>>())
                .cloned();

            match existing {
                Some(request) => {
                    debug!(key = key, "Joining in-flight request");
                    request
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let request = self.spawn_request(key, generation, work);
                    in_flight.insert(
                        key.to_string(),
                        InFlight {
                            generation,
                            request: Box::new(request.clone()),
                        },
                    );
                    request
                }
            }
        };

        request.await
    }

    fn spawn_request<T, W, Fut>(&self, key: &str, generation: u64, work: W) -> SharedResult<T>
    where
        T: Clone + Send + Sync + 'static,
        W: FnOnce(Slots) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let in_flight = self.in_flight.clone();
        let slots = Slots {
            permits: self.permits.clone(),
            queue_timeout: self.queue_timeout,
            key: Arc::from(key),
        };
        let key = key.to_string();

        let task = tokio::spawn(async move {
            let result = work(slots).await;
            release(&in_flight, &key, generation);
            result
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(EngineError::unknown(format!("request task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    /// Number of distinct keys currently queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

fn release(in_flight: &InFlightMap, key: &str, generation: u64) {
    let mut map = in_flight.lock().unwrap_or_else(|e| e.into_inner());
    if map.get(key).map(|slot| slot.generation) == Some(generation) {
        map.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_error::ErrorKind;
    use crate::service::retry::{Backoff, RetryPolicy};
    use std::sync::atomic::AtomicUsize;

    fn create_test_queue(max_concurrent: usize, timeout_ms: u64) -> Arc<RequestQueue> {
        Arc::new(RequestQueue::new(&QueueConfig {
            max_concurrent,
            timeout_ms,
        }))
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_invocation() {
        let queue = create_test_queue(4, 1_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let requests = (0..10).map(|_| {
            let calls = calls.clone();
            let queue = queue.clone();
            async move {
                queue
                    .schedule("match_info_1", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(7u64)
                    })
                    .await
            }
        });

        let results = futures::future::join_all(requests).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r == &Ok(7)));
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_completed_key_is_fetched_again() {
        let queue = create_test_queue(2, 1_000);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let value = queue
                .schedule("k", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("v".to_string())
                })
                .await;
            assert_eq!(value.unwrap(), "v");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let queue = create_test_queue(2, 5_000);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let requests = (0..6).map(|i| {
            let queue = queue.clone();
            let running = running.clone();
            let peak = peak.clone();
            async move {
                queue
                    .schedule(&format!("key_{}", i), move || async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(15)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(i)
                    })
                    .await
            }
        });

        let results = futures::future::join_all(requests).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_queue_timeout() {
        let queue = create_test_queue(1, 30);

        let slow = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .schedule("slow", || async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(1u8)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let queued = queue.schedule("queued", || async { Ok(2u8) }).await;
        let err = queued.unwrap_err();
        assert_eq!(err.kind, ErrorKind::QueueTimeout);

        assert_eq!(slow.await.unwrap(), Ok(1));
    }

    #[tokio::test]
    async fn test_failure_does_not_block_siblings() {
        let queue = create_test_queue(1, 1_000);

        let failing = queue.schedule("bad", || async {
            Err::<u8, _>(EngineError::new(ErrorKind::ServerError, "boom"))
        });
        let healthy = queue.schedule("good", || async { Ok(3u8) });

        let (failing, healthy) = tokio::join!(failing, healthy);
        assert_eq!(failing.unwrap_err().kind, ErrorKind::ServerError);
        assert_eq!(healthy.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_backoff_sleep_leaves_slot_free() {
        let queue = create_test_queue(1, 100);
        let retrier = Retrier::new(
            RetryPolicy::immediate(2).with_backoff(ErrorKind::RateLimited, Backoff::new(300, 300)),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        let throttled = {
            let queue = queue.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                queue
                    .schedule_retrying(
                        "throttled",
                        retrier,
                        "throttled",
                        move || {
                            let calls = calls.clone();
                            async move {
                                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                                    Err(EngineError::new(ErrorKind::RateLimited, "429"))
                                } else {
                                    Ok(1u8)
                                }
                            }
                        },
                        std::convert::identity,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let other = queue.schedule("other", || async { Ok(2u8) }).await;
        assert_eq!(other, Ok(2));

        assert_eq!(throttled.await.unwrap(), Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_retried_request_is_shared_by_callers() {
        let queue = create_test_queue(2, 1_000);
        let calls = Arc::new(AtomicUsize::new(0));

        let requests = (0..5).map(|_| {
            let queue = queue.clone();
            let calls = calls.clone();
            async move {
                queue
                    .schedule_retrying(
                        "match_info_9",
                        Retrier::new(RetryPolicy::immediate(3)),
                        "read_match",
                        move || {
                            let calls = calls.clone();
                            async move {
                                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                                    Err(EngineError::new(ErrorKind::Network, "reset"))
                                } else {
                                    Ok(9u64)
                                }
                            }
                        },
                        std::convert::identity,
                    )
                    .await
            }
        });

        let results = futures::future::join_all(requests).await;
        assert!(results.iter().all(|r| r == &Ok(9)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.in_flight(), 0);
    }
}
