//! Bounded-concurrency fan-out with per-entity failure isolation.

use crate::error::{OperationError, TaskError};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

#[derive(Debug)]
pub struct TaskFailure<E> {
    pub entity: E,
    pub error: TaskError,
}

/// Outcome of one fan-out. Successes are in completion order.
#[derive(Debug)]
pub struct FanOutReport<E, R> {
    pub successes: Vec<R>,
    pub failures: Vec<TaskFailure<E>>,
}

impl<E, R> FanOutReport<E, R> {
    pub fn total(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FanOut {
    concurrency: usize,
    task_timeout: Duration,
}

impl FanOut {
    pub fn new(concurrency: usize, task_timeout: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            task_timeout,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }

    /// Run `op` for every entity, at most `concurrency` at a time.
    ///
    /// Each operation runs on its own task: an error, panic or timeout is
    /// recorded against that entity and never touches its siblings. Returns
    /// once every entity has either succeeded or failed.
    pub async fn run<E, R, F, Fut>(&self, entities: Vec<E>, op: F) -> FanOutReport<E, R>
    where
        E: Clone + Debug + Send + 'static,
        R: Send + 'static,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, OperationError>> + Send + 'static,
    {
        let total = entities.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let op = Arc::new(op);
        let timeout = self.task_timeout;
        let mut tasks = JoinSet::new();

        for entity in entities {
            let semaphore = Arc::clone(&semaphore);
            let op = Arc::clone(&op);
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (entity, Err(TaskError::Aborted(e.to_string()))),
                };

                let input = entity.clone();
                let mut handle = tokio::spawn(async move { op(input).await });
                let outcome = match tokio::time::timeout(timeout, &mut handle).await {
                    Ok(Ok(Ok(result))) => Ok(result),
                    Ok(Ok(Err(e))) => Err(TaskError::Operation(e)),
                    Ok(Err(join_err)) => Err(TaskError::Aborted(join_err.to_string())),
                    Err(_) => {
                        handle.abort();
                        Err(TaskError::TimedOut(timeout))
                    }
                };
                (entity, outcome)
            });
        }

        let mut report = FanOutReport {
            successes: Vec::with_capacity(total),
            failures: Vec::new(),
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(result))) => report.successes.push(result),
                Ok((entity, Err(error))) => {
                    warn!(entity = ?entity, error = %error, "Fan-out task failed");
                    report.failures.push(TaskFailure { entity, error });
                }
                Err(e) => error!("Fan-out supervisor task lost: {}", e),
            }
        }

        debug!(
            "Fan-out finished: {} ok, {} failed of {}",
            report.successes.len(),
            report.failures.len(),
            total
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbot_backend::BackendError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn failures_are_isolated() {
        let fanout = FanOut::new(4, Duration::from_secs(5));
        let report = fanout
            .run((1..=10u64).collect(), |n| async move {
                if n % 3 == 0 {
                    Err(OperationError::Backend(BackendError::EntityNotFound(n.to_string())))
                } else {
                    Ok(n * 10)
                }
            })
            .await;

        let mut ok = report.successes.clone();
        ok.sort();
        assert_eq!(ok, vec![10, 20, 40, 50, 70, 80, 100]);
        let mut failed: Vec<u64> = report.failures.iter().map(|f| f.entity).collect();
        failed.sort();
        assert_eq!(failed, vec![3, 6, 9]);
        assert_eq!(report.total(), 10);
        assert!(report.is_partial());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_entity_times_out_alone() {
        let fanout = FanOut::new(3, Duration::from_millis(100));
        let report = fanout
            .run(vec!["one", "two", "three"], |name| async move {
                if name == "two" {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(name.to_uppercase())
            })
            .await;

        let mut ok = report.successes.clone();
        ok.sort();
        assert_eq!(ok, vec!["ONE".to_string(), "THREE".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].entity, "two");
        assert!(matches!(report.failures[0].error, TaskError::TimedOut(_)));
    }

    #[tokio::test]
    async fn panics_are_recorded_as_failures() {
        let fanout = FanOut::new(2, Duration::from_secs(5));
        let report = fanout
            .run(vec![1u32, 2, 3], |n| async move {
                if n == 2 {
                    panic!("boom");
                }
                Ok(n)
            })
            .await;
        assert_eq!(report.successes.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0].error, TaskError::Aborted(_)));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let fanout = FanOut::new(3, Duration::from_secs(5));

        let (in_flight_op, peak_op) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let report = fanout
            .run((0..20u32).collect(), move |n| {
                let in_flight = Arc::clone(&in_flight_op);
                let peak = Arc::clone(&peak_op);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            })
            .await;

        assert_eq!(report.successes.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn zero_concurrency_is_clamped() {
        let fanout = FanOut::new(0, Duration::from_secs(1));
        assert_eq!(fanout.concurrency(), 1);
        let report = fanout.run(vec![1u8], |n| async move { Ok(n) }).await;
        assert_eq!(report.successes, vec![1]);
    }

    #[tokio::test]
    async fn empty_input_completes() {
        let fanout = FanOut::new(2, Duration::from_secs(1));
        let report: FanOutReport<u8, u8> = fanout.run(Vec::new(), |n| async move { Ok(n) }).await;
        assert_eq!(report.total(), 0);
    }
}
