use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::Result;

/// Result of a finished job, delivered to the owner of the coordinator.
///
/// `generation` identifies the request that produced it, so a result
/// arriving after its request was superseded can be told apart from the
/// current one.
#[derive(Debug)]
pub struct TaskOutcome<K, V> {
    pub key: K,
    pub generation: u64,
    pub result: Result<V>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TaskStats {
    pub started: u64,
    pub cancelled: u64,
    pub completed: u64,
    pub failed: u64,
    /// Outcomes dropped because their request was no longer current
    pub discarded: u64,
}

struct TaskEntry {
    generation: u64,
    alive: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl TaskEntry {
    fn cancel(self) {
        // The flag goes down first: a job that already produced its
        // result must not publish it after this point.
        self.alive.store(false, Ordering::Release);
        self.handle.abort();
    }
}

/// Single-flight execution of cancellable jobs, at most one per key.
///
/// Requesting a job for a key that already has one in flight cancels the
/// previous job before the new one is spawned. Cancellation aborts the
/// spawned tokio task, so whatever transport future the job was awaiting
/// is dropped together with its I/O.
///
/// Jobs report through the outcome channel handed to [`Self::new`]; the
/// owner passes every received outcome back to [`Self::finish`], which
/// drops the stale ones.
pub struct TaskCoordinator<K, V> {
    /// Label for logging
    label: String,
    tasks: HashMap<K, TaskEntry>,
    next_generation: u64,
    limiter: Option<Arc<Semaphore>>,
    outcomes: mpsc::UnboundedSender<TaskOutcome<K, V>>,
    stats: TaskStats,
}

impl<K, V> TaskCoordinator<K, V>
where
    K: Hash + Eq + Clone + Display + Send + 'static,
    V: Send + 'static,
{
    /// Creates a coordinator delivering outcomes into `outcomes`.
    ///
    /// With `max_concurrent` set, at most that many jobs run their body at
    /// the same time; the rest wait for a permit and stay cancellable
    /// while waiting. Limits above `Semaphore::MAX_PERMITS` are capped.
    pub fn new(
        label: String,
        outcomes: mpsc::UnboundedSender<TaskOutcome<K, V>>,
        max_concurrent: Option<usize>,
    ) -> Self {
        Self {
            label,
            tasks: HashMap::new(),
            next_generation: 0,
            limiter: max_concurrent.map(|n| {
                Arc::new(Semaphore::new(n.min(Semaphore::MAX_PERMITS)))
            }),
            outcomes,
            stats: TaskStats::default(),
        }
    }

    /// Runs `job` for `key`, cancelling and evicting the job currently
    /// registered under the same key first.
    ///
    /// Must be called from within a tokio runtime. Returns the generation
    /// of the new request.
    pub fn request<F>(&mut self, key: K, job: F) -> u64
    where
        F: Future<Output = Result<V>> + Send + 'static,
    {
        if self.cancel(&key) {
            log::debug!(
                "tasks/{}: replaced in-flight job for key {}",
                self.label,
                key
            );
        }

        self.next_generation += 1;
        let generation = self.next_generation;

        let alive = Arc::new(AtomicBool::new(true));
        let task_alive = alive.clone();
        let task_key = key.clone();
        let limiter = self.limiter.clone();
        let outcomes = self.outcomes.clone();

        let handle = tokio::spawn(async move {
            let _permit = match limiter {
                Some(limiter) => match limiter.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    // The semaphore is never closed while the coordinator
                    // is alive
                    Err(_) => return,
                },
                None => None,
            };

            let result = job.await;

            if !task_alive.load(Ordering::Acquire) {
                return;
            }
            let outcome = TaskOutcome {
                key: task_key,
                generation,
                result,
            };
            // The receiver is gone only when the owner shut down
            let _ = outcomes.send(outcome);
        });

        log::debug!(
            "tasks/{}: started job for key {} (generation {})",
            self.label,
            key,
            generation
        );
        self.tasks.insert(
            key,
            TaskEntry {
                generation,
                alive,
                handle,
            },
        );
        self.stats.started += 1;

        generation
    }

    /// Applies a delivered outcome.
    ///
    /// Returns the job's result when it belongs to the request currently
    /// registered for its key, and unregisters that request. Outcomes of
    /// cancelled or superseded requests are discarded and yield `None`,
    /// as does a job that reported its own cancellation.
    pub fn finish(&mut self, outcome: TaskOutcome<K, V>) -> Option<Result<V>> {
        let current = match self.tasks.get(&outcome.key) {
            Some(entry) => {
                entry.generation == outcome.generation
                    && entry.alive.load(Ordering::Acquire)
            }
            None => false,
        };

        if !current {
            log::warn!(
                "tasks/{}: discarding stale result for key {} (generation {})",
                self.label,
                outcome.key,
                outcome.generation
            );
            self.stats.discarded += 1;
            return None;
        }

        self.tasks.remove(&outcome.key);

        match outcome.result {
            Ok(value) => {
                log::debug!(
                    "tasks/{}: job for key {} completed",
                    self.label,
                    outcome.key
                );
                self.stats.completed += 1;
                Some(Ok(value))
            }
            Err(e) if e.is_cancelled() => {
                self.stats.discarded += 1;
                None
            }
            Err(e) => {
                log::error!(
                    "tasks/{}: job for key {} failed: {}",
                    self.label,
                    outcome.key,
                    e
                );
                self.stats.failed += 1;
                Some(Err(e))
            }
        }
    }

    /// Cancels the job registered under `key`, if any.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.tasks.remove(key) {
            Some(entry) => {
                log::debug!(
                    "tasks/{}: cancelling job for key {} (generation {})",
                    self.label,
                    key,
                    entry.generation
                );
                entry.cancel();
                self.stats.cancelled += 1;
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        log::debug!(
            "tasks/{}: cancelling {} jobs",
            self.label,
            self.tasks.len()
        );
        for (_, entry) in self.tasks.drain() {
            entry.cancel();
            self.stats.cancelled += 1;
        }
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn stats(&self) -> TaskStats {
        self.stats
    }
}

impl<K, V> Drop for TaskCoordinator<K, V> {
    fn drop(&mut self) {
        for (_, entry) in self.tasks.drain() {
            entry.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;
    use crate::FeedError;

    /// Raises its flag when the owning future is dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    async fn wait_for(flag: &AtomicBool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !flag.load(Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("flag was never raised");
    }

    fn coordinator(
        max_concurrent: Option<usize>,
    ) -> (
        TaskCoordinator<u64, &'static str>,
        mpsc::UnboundedReceiver<TaskOutcome<u64, &'static str>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            TaskCoordinator::new("test".to_string(), tx, max_concurrent),
            rx,
        )
    }

    #[tokio::test]
    async fn test_completed_job_is_applied_once() {
        let (mut tasks, mut rx) = coordinator(None);

        tasks.request(1, async { Ok("avatar") });
        assert!(tasks.is_in_flight(&1));

        let outcome = rx.recv().await.unwrap();
        assert_eq!(tasks.finish(outcome).unwrap().unwrap(), "avatar");
        assert!(!tasks.is_in_flight(&1));
        assert_eq!(tasks.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_replacing_cancels_previous_job() {
        let (mut tasks, mut rx) = coordinator(None);
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(dropped.clone());

        let first = tasks.request(5, async move {
            let _guard = guard;
            std::future::pending::<()>().await;
            Ok("first")
        });
        let (release, gate) = oneshot::channel::<()>();
        let second = tasks.request(5, async move {
            let _ = gate.await;
            Ok("second")
        });
        assert_ne!(first, second);

        // Exactly one job stays registered and the old future is torn down
        assert_eq!(tasks.in_flight_count(), 1);
        assert_eq!(tasks.stats().cancelled, 1);
        wait_for(&dropped).await;

        release.send(()).unwrap();
        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.generation, second);
        assert_eq!(tasks.finish(outcome).unwrap().unwrap(), "second");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_late_result_of_cancelled_job_is_discarded() {
        let (mut tasks, mut rx) = coordinator(None);

        let first = tasks.request(5, std::future::pending());
        let second = tasks.request(5, async { Ok("second") });

        let outcome = rx.recv().await.unwrap();
        assert_eq!(tasks.finish(outcome).unwrap().unwrap(), "second");

        // Simulated late callback of the superseded job
        let late = TaskOutcome {
            key: 5,
            generation: first,
            result: Ok("first"),
        };
        assert!(tasks.finish(late).is_none());

        // Also stale while a newer job is still registered
        let third = tasks.request(5, std::future::pending());
        let late = TaskOutcome {
            key: 5,
            generation: second,
            result: Ok("second"),
        };
        assert!(tasks.finish(late).is_none());
        assert!(tasks.is_in_flight(&5));
        assert!(third > second);
        assert_eq!(tasks.stats().discarded, 2);
    }

    #[tokio::test]
    async fn test_failed_job_unregisters_without_retry() {
        let (mut tasks, mut rx) = coordinator(None);

        tasks.request(3, async {
            Err(FeedError::Transport("connection reset".to_string()))
        });

        let outcome = rx.recv().await.unwrap();
        let result = tasks.finish(outcome).unwrap();
        assert!(matches!(result, Err(FeedError::Transport(_))));
        assert!(!tasks.is_in_flight(&3));
        assert_eq!(tasks.stats().failed, 1);
        assert_eq!(tasks.stats().started, 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_side_by_side() {
        let (mut tasks, mut rx) = coordinator(None);

        for key in 1..=3 {
            tasks.request(key, std::future::pending());
        }
        assert_eq!(tasks.in_flight_count(), 3);
        assert_eq!(tasks.stats().cancelled, 0);

        tasks.request(2, async { Ok("two") });
        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.key, 2);
        assert!(tasks.finish(outcome).is_some());
        assert_eq!(tasks.in_flight_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let (mut tasks, _rx) = coordinator(None);
        let flags: Vec<_> =
            (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();

        for (key, flag) in flags.iter().enumerate() {
            let guard = DropFlag(flag.clone());
            tasks.request(key as u64, async move {
                let _guard = guard;
                std::future::pending::<()>().await;
                Ok("never")
            });
        }

        tasks.cancel_all();
        assert_eq!(tasks.in_flight_count(), 0);
        assert_eq!(tasks.stats().cancelled, 3);
        for flag in &flags {
            wait_for(flag).await;
        }
    }

    #[tokio::test]
    async fn test_job_waiting_for_permit_can_be_cancelled() {
        let (mut tasks, mut rx) = coordinator(Some(1));
        let (release, gate) = oneshot::channel::<()>();
        let started = Arc::new(AtomicBool::new(false));
        let task_started = started.clone();

        tasks.request(1, async move {
            let _ = gate.await;
            Ok("one")
        });
        tasks.request(2, async move {
            task_started.store(true, Ordering::SeqCst);
            Ok("two")
        });
        tokio::task::yield_now().await;
        assert!(!started.load(Ordering::SeqCst));

        assert!(tasks.cancel(&2));
        release.send(()).unwrap();

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.key, 1);
        assert!(tasks.finish(outcome).is_some());
        tokio::task::yield_now().await;
        assert!(!started.load(Ordering::SeqCst));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_oversized_limit_is_capped() {
        let (mut tasks, mut rx) = coordinator(Some(usize::MAX));

        tasks.request(1, async { Ok("avatar") });
        let outcome = rx.recv().await.unwrap();
        assert_eq!(tasks.finish(outcome).unwrap().unwrap(), "avatar");
    }
}
