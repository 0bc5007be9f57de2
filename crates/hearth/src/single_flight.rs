//! # Single-Flight Coordination
//!
//! Coalesces concurrent callers of the same logical operation within one
//! instance: the first caller for a key executes the operation, every
//! overlapping caller awaits the same eventual result, and the entry is
//! removed on completion so a later call re-executes. Failures propagate to
//! every waiter — a held entry never hangs past its operation.
//!
//! This is in-process coordination only; it provides no cross-instance or
//! cross-process mutual exclusion.

use crate::error::HearthError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

struct Entry<T> {
    tx: broadcast::Sender<Result<T, SharedFailure>>,
    waiters: usize,
}

/// Clone-able failure shared with coalesced waiters. The leader keeps the
/// original error; waiters get the key and message.
#[derive(Debug, Clone)]
struct SharedFailure {
    message: String,
}

/// In-flight operation map keyed by operation name.
pub struct SingleFlight<T> {
    inflight: Arc<Mutex<HashMap<String, Entry<T>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of callers currently waiting on an in-flight execution of
    /// `key`, excluding the leader. Zero when nothing is in flight.
    pub async fn waiter_count(&self, key: &str) -> usize {
        self.inflight
            .lock()
            .await
            .get(key)
            .map(|entry| entry.waiters)
            .unwrap_or(0)
    }
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    /// Runs `op` under the key, or joins an execution already in flight.
    ///
    /// Exactly one execution happens per key at a time; all overlapping
    /// callers observe its result. On completion (success or failure) the
    /// entry is removed, so a subsequent call executes again.
    pub async fn run<F, Fut>(&self, key: &str, op: F) -> Result<T, HearthError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, HearthError>>,
    {
        let mut follower = None;
        {
            let mut map = self.inflight.lock().await;
            if let Some(entry) = map.get_mut(key) {
                entry.waiters += 1;
                follower = Some(entry.tx.subscribe());
            } else {
                let (tx, _rx) = broadcast::channel(1);
                map.insert(key.to_string(), Entry { tx, waiters: 0 });
            }
        }

        if let Some(mut rx) = follower {
            return match rx.recv().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(failure)) => Err(HearthError::LockFailed {
                    key: key.to_string(),
                    message: failure.message,
                }),
                // Leader future was dropped before completing; the entry is
                // gone, so the caller may retry.
                Err(_) => Err(HearthError::LockFailed {
                    key: key.to_string(),
                    message: "in-flight operation was abandoned".to_string(),
                }),
            };
        }

        let result = op().await;

        let shared = match &result {
            Ok(value) => Ok(value.clone()),
            Err(err) => Err(SharedFailure {
                message: err.to_string(),
            }),
        };
        let mut map = self.inflight.lock().await;
        if let Some(entry) = map.remove(key) {
            // Send fails only when no waiter subscribed, which is fine.
            let _ = entry.tx.send(shared);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let executions = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        // Leader enters the operation and blocks on the gate, guaranteeing
        // every follower arrives while the entry is still in flight.
        let leader = {
            let flight = flight.clone();
            let executions = executions.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                flight
                    .run("init", || async move {
                        gate.notified().await;
                        Ok(executions.fetch_add(1, Ordering::SeqCst) + 1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut followers = Vec::new();
        for _ in 0..7 {
            let flight = flight.clone();
            let executions = executions.clone();
            followers.push(tokio::spawn(async move {
                flight
                    .run("init", || async move {
                        Ok(executions.fetch_add(1, Ordering::SeqCst) + 1)
                    })
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.notify_waiters();

        assert_eq!(leader.await.unwrap().unwrap(), 1);
        for task in followers {
            assert_eq!(task.await.unwrap().unwrap(), 1);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_propagates_to_all_waiters() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let gate = Arc::new(tokio::sync::Notify::new());

        let leader = {
            let flight = flight.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                flight
                    .run("broken", || async move {
                        gate.notified().await;
                        Err(HearthError::Handler("refresh failed".to_string()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut followers = Vec::new();
        for _ in 0..3 {
            let flight = flight.clone();
            followers.push(tokio::spawn(async move {
                flight.run("broken", || async { Ok(0) }).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.notify_waiters();

        assert!(leader.await.unwrap().is_err());
        for task in followers {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, HearthError::LockFailed { .. }));
        }

        // Entry removed on failure: a later call executes again.
        let value = flight.run("broken", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn sequential_calls_re_execute() {
        let flight = SingleFlight::<u32>::new();
        let first = flight.run("k", || async { Ok(1) }).await.unwrap();
        let second = flight.run("k", || async { Ok(2) }).await.unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(flight.waiter_count("k").await, 0);
    }
}
