//! Fan-out/fan-in executor with two join policies
//!
//! Submit independent tasks with [`WaitableExecutor::execute`], then join
//! exactly once:
//! - [`wait_for_tasks_with_quick_fail`](WaitableExecutor::wait_for_tasks_with_quick_fail)
//!   returns on the first failure, optionally cancelling what is still queued
//!   or running;
//! - [`wait_for_all_tasks`](WaitableExecutor::wait_for_all_tasks) waits for
//!   everything and reports each outcome.
//!
//! Both joins consume the executor, so it cannot be drained twice. Results
//! arrive in completion order, not submission order.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::pool::{PoolClosed, WorkerPool};

/// Why a task did not produce a value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError<E> {
    /// The task returned an error; this is the task's own error value.
    #[error("{0}")]
    Failed(E),

    /// The task panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was cancelled before it started.
    #[error("task interrupted")]
    Interrupted,
}

impl<E> TaskError<E> {
    /// The task's own error, if it failed with one.
    pub fn into_failure(self) -> Option<E> {
        match self {
            TaskError::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// True for [`TaskError::Interrupted`].
    pub fn is_interrupted(&self) -> bool {
        matches!(self, TaskError::Interrupted)
    }
}

type Outcome<T, E> = Result<T, TaskError<E>>;

/// Runs submitted tasks on a [`WorkerPool`] and joins them once.
pub struct WaitableExecutor<T, E> {
    pool: Arc<WorkerPool>,
    owns_pool: bool,
    token: CancellationToken,
    sender: Sender<Outcome<T, E>>,
    receiver: Receiver<Outcome<T, E>>,
    submitted: usize,
}

impl<T, E> WaitableExecutor<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create an executor with its own pool of `width` threads.
    ///
    /// The pool is shut down when the executor is joined.
    pub fn new(width: usize) -> std::io::Result<Self> {
        let pool = Arc::new(WorkerPool::new(width)?);
        Ok(Self::build(pool, true, CancellationToken::new()))
    }

    /// Create an executor on a shared pool.
    ///
    /// Joining closes this executor only; the pool stays with its owner.
    pub fn with_pool(pool: Arc<WorkerPool>) -> Self {
        Self::build(pool, false, CancellationToken::new())
    }

    /// Create an executor on a shared pool whose token is a child of `parent`.
    ///
    /// Cancelling `parent` cancels this executor's tasks as well.
    pub fn with_pool_and_parent(pool: Arc<WorkerPool>, parent: &CancellationToken) -> Self {
        Self::build(pool, false, parent.child())
    }

    fn build(pool: Arc<WorkerPool>, owns_pool: bool, token: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            pool,
            owns_pool,
            token,
            sender,
            receiver,
            submitted: 0,
        }
    }

    /// Token observed by this executor's tasks.
    ///
    /// Tasks that run for a long time (subprocesses) should poll it; quick-fail
    /// cancels it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Number of tasks submitted so far.
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Schedule a task.
    pub fn execute<F>(&mut self, task: F) -> Result<(), PoolClosed>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let sender = self.sender.clone();
        let token = self.token.clone();

        self.pool.submit(move || {
            if token.is_cancelled() {
                let _ = sender.send(Err(TaskError::Interrupted));
                return;
            }
            let outcome = match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(Ok(value)) => Ok(value),
                // The task's error type carries its own cancellation variant
                Ok(Err(err)) => Err(TaskError::Failed(err)),
                Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
            };
            // The receiver is gone once a quick-fail join returned early
            let _ = sender.send(outcome);
        })?;

        self.submitted += 1;
        Ok(())
    }

    /// Wait for every task, stopping at the first failure.
    ///
    /// On failure the task's error is returned and the values of tasks that
    /// already completed are discarded. With `cancel_remaining`, queued tasks
    /// are skipped and running tasks see their token cancelled.
    pub fn wait_for_tasks_with_quick_fail(
        self,
        cancel_remaining: bool,
    ) -> Result<Vec<T>, TaskError<E>> {
        let Self {
            pool,
            owns_pool,
            token,
            sender,
            receiver,
            submitted,
        } = self;
        drop(sender);

        let mut values = Vec::with_capacity(submitted);
        let mut failure = None;
        for outcome in receiver.iter() {
            match outcome {
                Ok(value) => values.push(value),
                Err(err) => {
                    if cancel_remaining {
                        token.cancel();
                    }
                    failure = Some(err);
                    break;
                }
            }
        }

        drop(receiver);
        if owns_pool {
            pool.shutdown();
        }

        match failure {
            Some(err) => {
                tracing::debug!(
                    completed = values.len(),
                    submitted,
                    "quick-fail join stopped at first failure"
                );
                Err(err)
            }
            None => Ok(values),
        }
    }

    /// Wait for every task and report each outcome.
    ///
    /// Tasks skipped by cancellation before they started are left out of the
    /// result. A task that ran reports its own outcome, even when it finished
    /// after cancellation.
    pub fn wait_for_all_tasks(self) -> Vec<Result<T, TaskError<E>>> {
        let Self {
            pool,
            owns_pool,
            sender,
            receiver,
            submitted,
            ..
        } = self;
        drop(sender);

        let mut outcomes = Vec::with_capacity(submitted);
        for outcome in receiver.iter() {
            if matches!(outcome, Err(TaskError::Interrupted)) {
                continue;
            }
            outcomes.push(outcome);
        }

        if owns_pool {
            pool.shutdown();
        }
        outcomes
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_all_tasks_succeed() {
        let mut executor: WaitableExecutor<u32, String> = WaitableExecutor::new(4).unwrap();
        for i in 0..10 {
            executor.execute(move || Ok(i)).unwrap();
        }
        assert_eq!(executor.submitted(), 10);

        let mut values = executor.wait_for_tasks_with_quick_fail(true).unwrap();
        values.sort_unstable();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_quick_fail_returns_original_error_and_skips_queued() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let mut executor: WaitableExecutor<u32, String> =
            WaitableExecutor::with_pool(Arc::clone(&pool));
        let last_ran = Arc::new(AtomicBool::new(false));

        executor.execute(|| Ok(1)).unwrap();
        executor.execute(|| Ok(2)).unwrap();
        executor.execute(|| Err("dex failed".to_string())).unwrap();

        // Occupy the single worker until the join has seen the failure
        let token = executor.token();
        executor
            .execute(move || {
                let start = std::time::Instant::now();
                while !token.is_cancelled() && start.elapsed() < Duration::from_secs(5) {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(0)
            })
            .unwrap();

        let flag = Arc::clone(&last_ran);
        executor
            .execute(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(4)
            })
            .unwrap();

        let result = executor.wait_for_tasks_with_quick_fail(true);
        assert_eq!(result, Err(TaskError::Failed("dex failed".to_string())));

        pool.shutdown();
        assert!(!last_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_quick_fail_without_cancel_lets_others_run() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let mut executor: WaitableExecutor<u32, String> =
            WaitableExecutor::with_pool(Arc::clone(&pool));
        let ran = Arc::new(AtomicUsize::new(0));

        executor.execute(|| Err("first".to_string())).unwrap();
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            executor
                .execute(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(0)
                })
                .unwrap();
        }

        assert!(executor.wait_for_tasks_with_quick_fail(false).is_err());
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_wait_for_all_reports_each_outcome_in_completion_order() {
        let mut executor: WaitableExecutor<u32, String> = WaitableExecutor::new(1).unwrap();
        executor.execute(|| Ok(1)).unwrap();
        executor.execute(|| Ok(2)).unwrap();
        executor.execute(|| Err("bad jar".to_string())).unwrap();
        executor.execute(|| Ok(4)).unwrap();

        let outcomes = executor.wait_for_all_tasks();
        assert_eq!(
            outcomes,
            vec![
                Ok(1),
                Ok(2),
                Err(TaskError::Failed("bad jar".to_string())),
                Ok(4),
            ]
        );
    }

    #[test]
    fn test_wait_for_all_drops_interrupted_tasks() {
        let parent = CancellationToken::new();
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let mut executor: WaitableExecutor<u32, String> =
            WaitableExecutor::with_pool_and_parent(Arc::clone(&pool), &parent);

        let started = Arc::new(crate::latch::Latch::new());
        let gate = Arc::new(crate::latch::Latch::new());
        let (s, g) = (Arc::clone(&started), Arc::clone(&gate));
        executor
            .execute(move || {
                s.count_down();
                g.wait();
                Ok(1)
            })
            .unwrap();
        executor.execute(|| Ok(2)).unwrap();

        started.wait();
        parent.cancel();
        gate.count_down();

        // The first task was already running and finishes; the second is skipped
        let outcomes = executor.wait_for_all_tasks();
        assert_eq!(outcomes, vec![Ok(1)]);
    }

    #[test]
    fn test_failure_after_cancellation_is_kept() {
        let parent = CancellationToken::new();
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let mut executor: WaitableExecutor<u32, String> =
            WaitableExecutor::with_pool_and_parent(Arc::clone(&pool), &parent);

        let started = Arc::new(crate::latch::Latch::new());
        let gate = Arc::new(crate::latch::Latch::new());
        let (s, g) = (Arc::clone(&started), Arc::clone(&gate));
        executor
            .execute(move || {
                s.count_down();
                g.wait();
                Err("disk full".to_string())
            })
            .unwrap();
        executor.execute(|| Ok(2)).unwrap();

        started.wait();
        parent.cancel();
        gate.count_down();

        let outcomes = executor.wait_for_all_tasks();
        assert_eq!(outcomes, vec![Err(TaskError::Failed("disk full".to_string()))]);
        pool.shutdown();
    }

    #[test]
    fn test_panicking_task_is_reported() {
        let mut executor: WaitableExecutor<u32, String> = WaitableExecutor::new(2).unwrap();
        executor.execute(|| panic!("corrupt input")).unwrap();

        let outcomes = executor.wait_for_all_tasks();
        assert_eq!(
            outcomes,
            vec![Err(TaskError::Panicked("corrupt input".to_string()))]
        );
    }

    #[test]
    fn test_running_task_observes_cancellation() {
        let mut executor: WaitableExecutor<u32, String> = WaitableExecutor::new(2).unwrap();
        let token = executor.token();
        executor
            .execute(move || {
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                Err("interrupted".to_string())
            })
            .unwrap();
        executor
            .execute(|| {
                thread::sleep(Duration::from_millis(20));
                Err("compile error".to_string())
            })
            .unwrap();

        let result = executor.wait_for_tasks_with_quick_fail(true);
        assert_eq!(result, Err(TaskError::Failed("compile error".to_string())));
    }

    #[test]
    fn test_execute_on_closed_pool_fails() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        pool.shutdown();
        let mut executor: WaitableExecutor<u32, String> = WaitableExecutor::with_pool(pool);
        assert_eq!(executor.execute(|| Ok(1)), Err(PoolClosed));
        assert_eq!(executor.submitted(), 0);
    }
}
