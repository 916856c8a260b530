//! Request queue with bounded concurrency
//!
//! At most `max_concurrency` tasks run at once. Further requests wait in a list
//! ordered by priority (higher first, FIFO among equals); when the list already
//! holds `max_waiting` requests, new ones are rejected immediately.
//!
//! Every running task receives a [`CancellationToken`] it must check at its own
//! checkpoints. [`RequestQueue::cancel_all`] trips every running token and turns
//! away everyone still waiting.
//!
//! Slots are handed over under the queue lock: a finishing task picks the next
//! waiter and counts it as running before the lock is released, so no
//! newcomer can overtake a waiter that was already chosen.

use crate::config::{ConfigError, QueueSection};
use crate::error::{OrchestratorError, OrchestratorResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Higher runs first
    pub priority: i32,
    /// Free-form context carried into logs
    pub metadata: Option<serde_json::Value>,
    /// Caller-side cancellation; stops waiting for a slot when tripped
    pub cancel: Option<CancellationToken>,
}

impl EnqueueOptions {
    pub fn with_priority(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct QueueStats {
    pub running: usize,
    pub waiting: usize,
    pub max_concurrency: usize,
    pub max_waiting: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
}

struct Waiter {
    id: u64,
    priority: i32,
    notify: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    running: usize,
    /// Kept in arrival order; ids are monotonically increasing
    waiting: Vec<Waiter>,
    next_id: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    rejected: u64,
}

impl Inner {
    /// Free one slot and hand it to the best waiter still listening
    fn release_slot(&mut self) {
        self.running = self.running.saturating_sub(1);

        while let Some(index) = self.best_waiter() {
            let waiter = self.waiting.remove(index);
            if waiter.notify.send(()).is_ok() {
                self.running += 1;
                debug!(waiter = waiter.id, priority = waiter.priority, "Admitted queued request");
                break;
            }
        }
    }

    fn best_waiter(&self) -> Option<usize> {
        self.waiting
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.id.cmp(&a.id)))
            .map(|(index, _)| index)
    }
}

pub struct RequestQueue {
    inner: Arc<Mutex<Inner>>,
    max_concurrency: usize,
    max_waiting: usize,
    root: Mutex<CancellationToken>,
}

/// Releases a running slot when the task finishes or is dropped
struct SlotGuard {
    inner: Arc<Mutex<Inner>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.lock().release_slot();
    }
}

/// Cleans up after a caller that stops waiting before it is admitted
struct WaitGuard {
    inner: Arc<Mutex<Inner>>,
    id: u64,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };

        let mut inner = self.inner.lock();
        if let Some(pos) = inner.waiting.iter().position(|w| w.id == self.id) {
            inner.waiting.remove(pos);
        } else if rx.try_recv().is_ok() {
            // Admitted but never observed it: pass the slot on
            inner.release_slot();
        }
    }
}

impl RequestQueue {
    pub fn new(config: &QueueSection) -> Result<Self, ConfigError> {
        if config.max_concurrency == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue.max_concurrency must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            max_concurrency: config.max_concurrency,
            max_waiting: config.max_waiting,
            root: Mutex::new(CancellationToken::new()),
        })
    }

    /// Run `task` once a slot is free.
    ///
    /// Fails with [`OrchestratorError::QueueFull`] without waiting when the
    /// waiting list is full, and with [`OrchestratorError::Cancelled`] if
    /// [`cancel_all`](Self::cancel_all) runs while this request is waiting.
    pub async fn enqueue<T, F, Fut>(&self, task: F, options: EnqueueOptions) -> OrchestratorResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        let _slot = self.acquire(&options).await?;
        let token = self.root.lock().child_token();

        let result = task(token).await;

        {
            let mut inner = self.inner.lock();
            match &result {
                Ok(_) => inner.completed += 1,
                Err(e) if e.is_cancellation() => inner.cancelled += 1,
                Err(_) => inner.failed += 1,
            }
        }

        result
    }

    async fn acquire(&self, options: &EnqueueOptions) -> OrchestratorResult<SlotGuard> {
        let mut wait = {
            let mut inner = self.inner.lock();

            if inner.running < self.max_concurrency && inner.waiting.is_empty() {
                inner.running += 1;
                return Ok(SlotGuard {
                    inner: self.inner.clone(),
                });
            }

            if inner.waiting.len() >= self.max_waiting {
                inner.rejected += 1;
                warn!(
                    max_waiting = self.max_waiting,
                    priority = options.priority,
                    "Request queue full, rejecting"
                );
                return Err(OrchestratorError::QueueFull {
                    max_waiting: self.max_waiting,
                });
            }

            inner.next_id += 1;
            let id = inner.next_id;
            let (tx, rx) = oneshot::channel();
            inner.waiting.push(Waiter {
                id,
                priority: options.priority,
                notify: tx,
            });
            debug!(
                waiter = id,
                priority = options.priority,
                metadata = ?options.metadata,
                waiting = inner.waiting.len(),
                "Request queued"
            );

            WaitGuard {
                inner: self.inner.clone(),
                id,
                rx: Some(rx),
            }
        };

        let admitted = match (wait.rx.as_mut(), &options.cancel) {
            (Some(rx), Some(cancel)) => tokio::select! {
                biased;
                result = rx => Some(result.is_ok()),
                _ = cancel.cancelled() => None,
            },
            (Some(rx), None) => Some(rx.await.is_ok()),
            (None, _) => Some(false),
        };

        match admitted {
            Some(admitted) => {
                // The outcome is settled; nothing left for the guard to clean up
                wait.rx = None;
                if admitted {
                    Ok(SlotGuard {
                        inner: self.inner.clone(),
                    })
                } else {
                    Err(OrchestratorError::Cancelled)
                }
            }
            None => {
                // Caller gave up; the guard removes us or passes on a slot we just got
                self.inner.lock().cancelled += 1;
                debug!(waiter = wait.id, "Queued request cancelled by caller");
                Err(OrchestratorError::Cancelled)
            }
        }
    }

    /// Cancel every running task's token and reject all waiters.
    /// Requests enqueued afterwards get a fresh token.
    pub fn cancel_all(&self) {
        let dropped: Vec<Waiter> = {
            let mut inner = self.inner.lock();
            let waiters = std::mem::take(&mut inner.waiting);
            inner.cancelled += waiters.len() as u64;
            waiters
        };
        let rejected = dropped.len();
        drop(dropped);

        let previous = std::mem::replace(&mut *self.root.lock(), CancellationToken::new());
        previous.cancel();

        debug!(rejected_waiters = rejected, "Cancelled all queued and running requests");
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            running: inner.running,
            waiting: inner.waiting.len(),
            max_concurrency: self.max_concurrency,
            max_waiting: self.max_waiting,
            completed: inner.completed,
            failed: inner.failed,
            cancelled: inner.cancelled,
            rejected: inner.rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue(max_concurrency: usize, max_waiting: usize) -> Arc<RequestQueue> {
        Arc::new(
            RequestQueue::new(&QueueSection {
                max_concurrency,
                max_waiting,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_runs_immediately_when_idle() {
        let q = queue(1, 1);
        let value = q
            .enqueue(|_| async { Ok(7) }, EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(q.stats().completed, 1);
        assert_eq!(q.stats().running, 0);
    }

    #[tokio::test]
    async fn test_full_waiting_list_rejects() {
        let q = queue(1, 1);
        let gate = Arc::new(tokio::sync::Notify::new());

        let q1 = q.clone();
        let g1 = gate.clone();
        let running = tokio::spawn(async move {
            q1.enqueue(
                |_| async move {
                    g1.notified().await;
                    Ok(())
                },
                EnqueueOptions::default(),
            )
            .await
        });
        tokio::task::yield_now().await;

        let q2 = q.clone();
        let waiting = tokio::spawn(async move {
            q2.enqueue(|_| async { Ok(()) }, EnqueueOptions::default())
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(q.stats().waiting, 1);

        let rejected = q
            .enqueue(|_| async { Ok(()) }, EnqueueOptions::default())
            .await;
        assert!(matches!(
            rejected,
            Err(OrchestratorError::QueueFull { max_waiting: 1 })
        ));

        gate.notify_one();
        running.await.unwrap().unwrap();
        waiting.await.unwrap().unwrap();
        assert_eq!(q.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_cancel_all_trips_running_token_and_rejects_waiters() {
        let q = queue(1, 4);

        let q1 = q.clone();
        let running = tokio::spawn(async move {
            q1.enqueue(
                |token| async move {
                    token.cancelled().await;
                    Err::<(), _>(OrchestratorError::Cancelled)
                },
                EnqueueOptions::default(),
            )
            .await
        });
        tokio::task::yield_now().await;

        let q2 = q.clone();
        let waiting = tokio::spawn(async move {
            q2.enqueue(|_| async { Ok(()) }, EnqueueOptions::default())
                .await
        });
        tokio::task::yield_now().await;

        q.cancel_all();

        assert!(running.await.unwrap().unwrap_err().is_cancellation());
        assert!(waiting.await.unwrap().unwrap_err().is_cancellation());
        let stats = q.stats();
        assert_eq!(stats.cancelled, 2);
        assert_eq!(stats.running, 0);

        // Fresh token after cancel_all
        q.enqueue(
            |token| async move {
                assert!(!token.is_cancelled());
                Ok(())
            },
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_caller_cancel_while_waiting() {
        let q = queue(1, 4);
        let gate = Arc::new(tokio::sync::Notify::new());

        let q1 = q.clone();
        let g1 = gate.clone();
        let running = tokio::spawn(async move {
            q1.enqueue(
                |_| async move {
                    g1.notified().await;
                    Ok(())
                },
                EnqueueOptions::default(),
            )
            .await
        });
        tokio::task::yield_now().await;

        let cancel = CancellationToken::new();
        let options = EnqueueOptions {
            cancel: Some(cancel.clone()),
            ..EnqueueOptions::default()
        };
        let q2 = q.clone();
        let waiting = tokio::spawn(async move { q2.enqueue(|_| async { Ok(()) }, options).await });
        tokio::task::yield_now().await;
        assert_eq!(q.stats().waiting, 1);

        cancel.cancel();
        assert!(waiting.await.unwrap().unwrap_err().is_cancellation());
        assert_eq!(q.stats().waiting, 0);
        assert_eq!(q.stats().cancelled, 1);

        gate.notify_one();
        running.await.unwrap().unwrap();
        assert_eq!(q.stats().running, 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_leaves_the_list() {
        let q = queue(1, 4);
        let gate = Arc::new(tokio::sync::Notify::new());

        let q1 = q.clone();
        let g1 = gate.clone();
        let running = tokio::spawn(async move {
            q1.enqueue(
                |_| async move {
                    g1.notified().await;
                    Ok(())
                },
                EnqueueOptions::default(),
            )
            .await
        });
        tokio::task::yield_now().await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            q.enqueue(|_| async { Ok(()) }, EnqueueOptions::default()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(q.stats().waiting, 0);

        gate.notify_one();
        running.await.unwrap().unwrap();
        assert_eq!(q.stats().running, 0);
    }
}
