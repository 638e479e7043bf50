//! TaskPool - ワーカーの並行実行プール
//!
//! `Semaphore` で同時実行数を `size` に抑え、起動したタスクは `JoinSet` で追跡します。
//!
//! # 設計原則
//! - `spawn` は空きスロットができるまで待つ（バックプレッシャー）
//! - `try_spawn` は待たない。スロットを持ったまま追加の仕事を出す側はこちらを使う
//! - 終了したタスクは `spawn` のたびにノンブロッキングで回収し、panic はログに残す
//! - `wait_idle` は全 permit を取得できた時点をアイドルとみなす。
//!   JoinSet のロックを持ったまま待たないので、待機中も `spawn` できる

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, TryAcquireError};
use tokio::task::JoinSet;
use tracing::{debug, error};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("task pool {0:?} is shut down")]
    Closed(String),
    #[error("task pool {0:?} has no free slot")]
    Full(String),
}

/// Bounded pool of tokio tasks. Clones share the same pool.
#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    size: usize,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl TaskPool {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let size = size.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize));
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                size,
                permits: Arc::new(Semaphore::new(size)),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Tasks currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.inner
            .size
            .saturating_sub(self.inner.permits.available_permits())
    }

    /// Run `task` on the pool, waiting for a free slot first.
    pub async fn spawn<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed(self.inner.name.clone()))?;

        let mut tasks = self.inner.tasks.lock().await;
        self.reap(&mut tasks);
        tasks.spawn(async move {
            let _permit = permit;
            task.await;
        });
        Ok(())
    }

    /// Run `task` only if a slot is free right now.
    pub async fn try_spawn<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = Arc::clone(&self.inner.permits)
            .try_acquire_owned()
            .map_err(|err| match err {
                TryAcquireError::Closed => PoolError::Closed(self.inner.name.clone()),
                TryAcquireError::NoPermits => PoolError::Full(self.inner.name.clone()),
            })?;

        let mut tasks = self.inner.tasks.lock().await;
        self.reap(&mut tasks);
        tasks.spawn(async move {
            let _permit = permit;
            task.await;
        });
        Ok(())
    }

    /// Wait until no task holds a slot.
    pub async fn wait_idle(&self) {
        let all = self.inner.size as u32;
        if let Ok(permits) = self.inner.permits.acquire_many(all).await {
            drop(permits);
        }
        let mut tasks = self.inner.tasks.lock().await;
        self.reap(&mut tasks);
    }

    /// Drain in-flight work and refuse new tasks.
    pub async fn shutdown(&self) {
        debug!(pool = %self.inner.name, in_flight = self.in_flight(), "shutting down task pool");
        self.wait_idle().await;
        self.inner.permits.close();
        let mut tasks = self.inner.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                error!(pool = %self.inner.name, error = %err, "pool task failed");
            }
        }
    }

    fn reap(&self, tasks: &mut JoinSet<()>) {
        while let Some(result) = tasks.try_join_next() {
            if let Err(err) = result {
                error!(pool = %self.inner.name, error = %err, "pool task failed");
            }
        }
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("name", &self.inner.name)
            .field("size", &self.inner.size)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrency_never_exceeds_size() {
        let pool = TaskPool::new("test", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }
        pool.wait_idle().await;

        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn a_panicking_task_does_not_poison_the_pool() {
        let pool = TaskPool::new("test", 1);
        pool.spawn(async { panic!("boom") }).await.unwrap();
        pool.wait_idle().await;

        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        pool.spawn(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
        pool.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawn_after_shutdown_is_refused() {
        let pool = TaskPool::new("test", 1);
        pool.shutdown().await;
        let err = pool.spawn(async {}).await.unwrap_err();
        assert_eq!(err, PoolError::Closed("test".to_string()));
    }

    #[tokio::test]
    async fn try_spawn_refuses_instead_of_waiting() {
        let pool = TaskPool::new("test", 1);
        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        pool.spawn(async move {
            let _ = wait.await;
        })
        .await
        .unwrap();

        let err = pool.try_spawn(async {}).await.unwrap_err();
        assert_eq!(err, PoolError::Full("test".to_string()));

        release.send(()).unwrap();
        pool.wait_idle().await;
        assert!(pool.try_spawn(async {}).await.is_ok());
        pool.shutdown().await;
        let err = pool.try_spawn(async {}).await.unwrap_err();
        assert_eq!(err, PoolError::Closed("test".to_string()));
    }
}
