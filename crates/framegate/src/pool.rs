//! Bounded task pool.
//!
//! A fixed budget of concurrently running jobs, enforced with a semaphore:
//! `spawn` waits for a free worker slot before handing the job to the
//! runtime, so a backlog in one pool backpressures its producers instead of
//! growing without bound. Message dispatch, error triage, and close triage
//! each get their own instance; one subsystem's backlog never starves
//! another's workers.
//!
//! Every job runs inside a recovery boundary: a panicking job is logged and
//! never unwinds into the runtime, the submitting task, or other jobs.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;

use crate::error::PoolError;

/// Default worker count per pool.
pub const DEFAULT_POOL_WORKERS: usize = 100;

/// Fixed-worker-count job scheduler.
pub struct TaskPool {
    label: &'static str,
    permits: Arc<Semaphore>,
}

impl TaskPool {
    /// Create a pool with the given worker budget.
    pub fn new(label: &'static str, workers: usize) -> Self {
        Self { label, permits: Arc::new(Semaphore::new(workers)) }
    }

    /// Submit a job.
    ///
    /// Waits until a worker slot is free, then runs the job on the runtime.
    /// The returned `Ok` means the job was scheduled, not that it finished.
    pub async fn spawn<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let label = self.label;
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(payload) = AssertUnwindSafe(job).catch_unwind().await {
                tracing::error!(pool = label, panic = %panic_message(payload.as_ref()), "pool job panicked");
            }
        });
        Ok(())
    }
}

/// Best-effort rendering of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Notify;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_budget_backpressures_spawn() {
        let pool = Arc::new(TaskPool::new("test", 2));
        let gate = Arc::new(Notify::new());

        for _ in 0..2 {
            let gate = Arc::clone(&gate);
            pool.spawn(async move { gate.notified().await }).await.unwrap();
        }

        // Both workers busy: the third submission must wait for a slot.
        let blocked = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.spawn(async {}).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        gate.notify_waiters();
        timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panicking_job_does_not_poison_the_pool() {
        let pool = TaskPool::new("test", 1);
        let ran = Arc::new(AtomicUsize::new(0));

        pool.spawn(async { panic!("job blew up") }).await.unwrap();

        let counter = Arc::clone(&ran);
        pool.spawn(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        timeout(Duration::from_secs(1), async {
            while ran.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn panic_payloads_render() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
