//! Bounded worker pools and the foreground-thread guard.
//!
//! Sync passes and incidental background loads (chart reads and similar) get
//! separate permit pools so a burst of one cannot starve the other. Storage
//! work asserts it is not running on a thread the host marked as foreground.

use std::cell::Cell;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{AcquireError, Semaphore};
use tokio::task::JoinError;

pub const DEFAULT_SYNC_WORKERS: usize = 8;
pub const DEFAULT_BACKGROUND_WORKERS: usize = 4;

thread_local! {
    static FOREGROUND: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed(#[from] AcquireError),

    #[error("worker task failed: {0}")]
    Join(#[from] JoinError),
}

/// Which pool a job runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Sync,
    Background,
}

#[derive(Debug, Clone)]
pub struct WorkerPools {
    sync: Arc<Semaphore>,
    background: Arc<Semaphore>,
}

impl Default for WorkerPools {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_WORKERS, DEFAULT_BACKGROUND_WORKERS)
    }
}

impl WorkerPools {
    pub fn new(sync_workers: usize, background_workers: usize) -> Self {
        Self {
            sync: Arc::new(Semaphore::new(sync_workers.max(1))),
            background: Arc::new(Semaphore::new(background_workers.max(1))),
        }
    }

    /// Run `job` on a spawned task once a permit of `kind` is free.
    ///
    /// Dropping the returned future before it completes does not abort a
    /// job that already started; its result is simply discarded.
    pub async fn run<F, T>(&self, kind: PoolKind, job: F) -> Result<T, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.semaphore(kind).clone().acquire_owned().await?;
        let handle = tokio::spawn(async move {
            let _permit = permit;
            job.await
        });
        Ok(handle.await?)
    }

    pub fn available(&self, kind: PoolKind) -> usize {
        self.semaphore(kind).available_permits()
    }

    fn semaphore(&self, kind: PoolKind) -> &Arc<Semaphore> {
        match kind {
            PoolKind::Sync => &self.sync,
            PoolKind::Background => &self.background,
        }
    }
}

/// Marks the current thread as foreground until dropped.
pub struct ForegroundGuard {
    previous: bool,
}

impl Drop for ForegroundGuard {
    fn drop(&mut self) {
        let previous = self.previous;
        FOREGROUND.with(|flag| flag.set(previous));
    }
}

/// Mark the calling thread as the host's foreground thread.
pub fn enter_foreground() -> ForegroundGuard {
    let previous = FOREGROUND.with(|flag| flag.replace(true));
    ForegroundGuard { previous }
}

pub fn is_foreground() -> bool {
    FOREGROUND.with(Cell::get)
}

/// Panics in debug builds when called from a foreground thread.
#[track_caller]
pub fn assert_background(operation: &str) {
    debug_assert!(
        !is_foreground(),
        "{} must not run on the foreground thread",
        operation
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn run_returns_job_output() {
        let pools = WorkerPools::new(2, 1);
        let out = pools.run(PoolKind::Sync, async { 21 * 2 }).await.unwrap();
        assert_eq!(out, 42);
        assert_eq!(pools.available(PoolKind::Sync), 2);
    }

    #[tokio::test]
    async fn pool_bounds_concurrency() {
        let pools = WorkerPools::new(1, 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut jobs = Vec::new();
        for _ in 0..4 {
            let pools = pools.clone();
            let running = running.clone();
            let peak = peak.clone();
            jobs.push(tokio::spawn(async move {
                pools
                    .run(PoolKind::Background, async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for job in jobs {
            job.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn background_pool_does_not_consume_sync_permits() {
        let pools = WorkerPools::new(1, 1);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let bg = pools.clone();
        let blocked = tokio::spawn(async move {
            bg.run(PoolKind::Background, async move {
                let _ = rx.await;
            })
            .await
        });
        tokio::task::yield_now().await;

        let out = pools.run(PoolKind::Sync, async { "sync" }).await.unwrap();
        assert_eq!(out, "sync");

        tx.send(()).unwrap();
        blocked.await.unwrap().unwrap();
    }

    #[test]
    fn foreground_flag_is_scoped() {
        assert!(!is_foreground());
        {
            let _guard = enter_foreground();
            assert!(is_foreground());
        }
        assert!(!is_foreground());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "must not run on the foreground thread")]
    fn storage_work_on_foreground_panics() {
        let _guard = enter_foreground();
        assert_background("sync pass");
    }

    #[test]
    fn background_thread_passes_assertion() {
        assert_background("sync pass");
    }
}
