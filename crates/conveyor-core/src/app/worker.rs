//! Worker - 通知駆動のスケジューラ
//!
//! # 状態遷移
//! Idle → Scanning → Dispatching →（タスクごとに）Leasing → Processing → Settling → Idle
//!
//! # 実装
//! - `run_once`: キューごとにタイムスタンプを固定して通知を読み、STUCK バケットを
//!   先に片付けてから優先度の高い順にプールへ投入する
//! - セッションの処理（プール上）: lease → 消費した通知の削除 → kill 期限の登録 →
//!   `process_completed_requests` → kill 期限の削除と必要なら再通知
//! - `run`: `run_once` を繰り返し、何も処理しなかったパスの後はアダプティブに待つ
//!
//! # エラーの扱い
//! - lease の競合は想定内なのでカウントするだけ（エラーログは出さない）
//! - flow の処理エラーは flow 自身に記録し、ここでは一度だけログに出す
//! - それ以外のエラーはログに出して通知を削除する（毒通知を無限に再処理しない）

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::WorkerConfig;
use super::negative_cache::NegativeCache;
use super::pool::{PoolError, TaskPool};
use super::stats::{WorkerCounts, WorkerStats};
use crate::domain::{Bucket, Notification, SessionId, StatusCode, TimeRange};
use crate::error::error_chain;
use crate::ports::{Election, FlowEngine, FlowError, FlowHandle, WellKnownFlow};
use crate::queue::{QueueError, QueueManager};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// How one session's processing ended.
enum SessionError {
    /// Another worker holds the lease.
    Locked,
    /// The flow failed; the failure is recorded in the flow itself.
    FlowProcessing(FlowError),
    Other(FlowError),
}

impl From<QueueError> for SessionError {
    fn from(err: QueueError) -> Self {
        SessionError::Other(FlowError::Queue(err))
    }
}

pub struct Worker {
    processor: Arc<SessionProcessor>,
    election: Arc<dyn Election>,
}

/// State shared by the scan loop and every pool task.
struct SessionProcessor {
    manager: QueueManager,
    engine: Arc<dyn FlowEngine>,
    well_known: HashMap<String, Arc<dyn WellKnownFlow>>,
    config: WorkerConfig,
    pool: TaskPool,
    negative_cache: NegativeCache,
    stats: WorkerStats,
}

impl Worker {
    pub(super) fn new(
        manager: QueueManager,
        engine: Arc<dyn FlowEngine>,
        election: Arc<dyn Election>,
        config: WorkerConfig,
        well_known: HashMap<String, Arc<dyn WellKnownFlow>>,
    ) -> Self {
        let pool = TaskPool::new("worker", config.pool_size);
        let negative_cache =
            NegativeCache::new(config.negative_cache_ttl(), config.negative_cache_capacity);
        Self {
            processor: Arc::new(SessionProcessor {
                manager,
                engine,
                well_known,
                config,
                pool,
                negative_cache,
                stats: WorkerStats::default(),
            }),
            election,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.processor.config
    }

    pub fn pool(&self) -> &TaskPool {
        &self.processor.pool
    }

    pub fn stats(&self) -> WorkerCounts {
        self.processor.stats.snapshot()
    }

    /// One scan-and-dispatch pass over every configured queue.
    ///
    /// Returns how many notifications were handled. Dispatched sessions may
    /// still be running on the pool when this returns.
    pub async fn run_once(&self) -> Result<usize, WorkerError> {
        if !self.election.is_active() {
            debug!("not the active instance; skipping pass");
            return Ok(0);
        }

        let started = Instant::now();
        let budget = self.processor.config.run_once_max();
        let mut processed = 0;

        for queue in &self.processor.config.queues {
            let mut manager = self.processor.manager.copy();
            let frozen = manager.frozen();
            let mut by_bucket = frozen.get_notifications_by_priority(queue).await?;

            if let Some(stuck) = by_bucket.remove(&Bucket::Stuck) {
                processed += stuck.len();
                self.processor.process_stuck_flows(stuck, &frozen).await;
            }

            let notifications: Vec<Notification> = by_bucket
                .into_values()
                .rev()
                .flatten()
                .filter(|n| !self.processor.negative_cache.contains(&n.session_id))
                .collect();
            processed += self.process_messages(notifications, started).await?;
            drop(frozen);

            if started.elapsed() > budget {
                debug!(queue = %queue, processed, "pass exceeded its time budget");
                return Ok(processed);
            }
        }
        Ok(processed)
    }

    async fn process_messages(
        &self,
        notifications: Vec<Notification>,
        started: Instant,
    ) -> Result<usize, WorkerError> {
        let budget = self.processor.config.run_once_max();
        let mut submitted = 0;
        for notification in notifications {
            if started.elapsed() > budget {
                // The rest stay in the store for the next pass.
                break;
            }
            self.processor
                .negative_cache
                .insert(notification.session_id.clone());

            let processor = Arc::clone(&self.processor);
            let manager = self.processor.manager.copy();
            self.processor
                .pool
                .spawn(async move { processor.process_session(notification, manager).await })
                .await?;
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Wait until every dispatched session has settled.
    pub async fn wait_for_tasks(&self) {
        self.processor.pool.wait_idle().await;
    }

    /// Run passes until `shutdown` fires, then drain the pool.
    pub async fn run(&self, shutdown: CancellationToken) {
        let config = &self.processor.config;
        let mut last_active: Option<Instant> = None;
        info!(queues = ?config.queues, pool_size = config.pool_size, "worker started");

        while !shutdown.is_cancelled() {
            let processed = match self.run_once().await {
                Ok(processed) => processed,
                Err(err) => {
                    error!(error = %error_chain(&err), "worker pass failed");
                    self.processor.stats.worker_exception();
                    0
                }
            };

            let now = Instant::now();
            if processed > 0 {
                last_active = Some(now);
                continue;
            }
            let interval = match last_active {
                Some(at) if now.duration_since(at) < config.short_poll_window() => {
                    config.short_polling_interval()
                }
                _ => config.polling_interval(),
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!(in_flight = self.processor.pool.in_flight(), "worker stopping");
        self.processor.pool.shutdown().await;
    }
}

impl SessionProcessor {
    /// Terminate flows whose kill deadline passed and clear their notifications.
    async fn process_stuck_flows(&self, stuck: Vec<Notification>, manager: &QueueManager) {
        for notification in stuck {
            let session_id = &notification.session_id;
            self.stats.flow_stuck();
            warn!(session_id = %session_id, deadline = %notification.timestamp, "flow is stuck; terminating");

            if let Err(err) = self
                .engine
                .terminate_flow(session_id, "Stuck in the worker", StatusCode::WorkerStuck, true)
                .await
            {
                self.stats.stuck_termination_failure();
                error!(session_id = %session_id, error = %error_chain(&err), "failed to terminate stuck flow");
            }
            if let Err(err) = manager
                .delete_notification(session_id, TimeRange::all())
                .await
            {
                error!(session_id = %session_id, error = %error_chain(&err), "failed to clear stuck notifications");
            }
        }
    }

    async fn process_session(&self, notification: Notification, mut manager: QueueManager) {
        let session_id = notification.session_id.clone();
        match self.try_process_session(&notification, &mut manager).await {
            Ok(()) => {
                self.negative_cache.remove(&session_id);
                self.stats.session_processed();
            }
            Err(SessionError::Locked) => {
                self.stats.lock_error();
                debug!(session_id = %session_id, "session leased elsewhere");
            }
            Err(SessionError::FlowProcessing(err)) => {
                self.stats.flow_processing_error();
                self.stats.session_error(err.kind());
            }
            Err(SessionError::Other(err)) => {
                self.stats.worker_exception();
                self.stats.session_error(err.kind());
                error!(session_id = %session_id, error = %error_chain(&err), "session processing failed");
                if let Err(err) = manager
                    .delete_notification(&session_id, TimeRange::all())
                    .await
                {
                    error!(session_id = %session_id, error = %error_chain(&err), "failed to drop notification");
                }
            }
        }
        let dropped = manager.discard_pending();
        if dropped > 0 {
            warn!(session_id = %session_id, dropped, "session left unflushed writes");
        }
    }

    async fn try_process_session(
        &self,
        notification: &Notification,
        manager: &mut QueueManager,
    ) -> Result<(), SessionError> {
        let session_id = &notification.session_id;
        if session_id.is_well_known() {
            return self.process_well_known(notification, manager).await;
        }

        let mut handle = match self
            .engine
            .lease(session_id, self.config.flow_lease_time())
            .await
        {
            Ok(handle) => handle,
            Err(FlowError::Locked(_)) => return Err(SessionError::Locked),
            Err(err) => return Err(SessionError::Other(err)),
        };

        let outcome = self.process_leased(handle.as_mut(), notification, manager).await;
        let closed = handle.close().await;
        match (outcome, closed) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(err)) => Err(SessionError::Other(err)),
            (Err(err), closed) => {
                if let Err(close_err) = closed {
                    error!(session_id = %session_id, error = %error_chain(&close_err), "failed to close flow");
                }
                Err(err)
            }
        }
    }

    async fn process_well_known(
        &self,
        notification: &Notification,
        manager: &mut QueueManager,
    ) -> Result<(), SessionError> {
        let session_id = &notification.session_id;
        let Some(flow) = self.well_known.get(session_id.flow_name()) else {
            return Err(SessionError::Other(FlowError::UnknownFlowType(
                session_id.flow_name().to_string(),
            )));
        };

        manager
            .delete_notification(session_id, TimeRange::up_to(notification.timestamp))
            .await?;
        let responses = manager
            .fetch_and_remove_requests_and_responses(session_id)
            .await?;
        self.stats.well_known_request(responses.len() as u64);
        debug!(session_id = %session_id, responses = responses.len(), "well-known flow woken");
        flow.process_responses(responses, &self.pool)
            .await
            .map_err(SessionError::Other)
    }

    async fn process_leased(
        &self,
        handle: &mut dyn FlowHandle,
        notification: &Notification,
        manager: &mut QueueManager,
    ) -> Result<(), SessionError> {
        let session_id = &notification.session_id;
        // Anything newer arrived after the scan and stays for the next pass.
        manager
            .delete_notification(session_id, TimeRange::up_to(notification.timestamp))
            .await?;

        if handle.context().schedule_kill_notifications {
            let deadline = manager.now() + self.config.stuck_flows_timeout();
            manager.queue_notification(
                Notification::new(session_id.clone(), deadline)
                    .with_priority(handle.context().priority)
                    .in_progress(),
            );
            manager.flush().await?;
            handle.context_mut().kill_timestamp = Some(deadline);
        }

        let result = match handle.process_completed_requests(notification, &self.pool).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let chain = error_chain(&err);
                error!(session_id = %session_id, error = %chain, "flow processing failed");
                handle.context_mut().mark_error(err.to_string(), Some(chain));
                Err(SessionError::FlowProcessing(err))
            }
        };

        let settled = self.settle(handle, notification, manager).await;
        match (result, settled) {
            (Ok(()), settled) => settled,
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(settle_err)) => {
                if let SessionError::Other(settle_err) = settle_err {
                    error!(session_id = %session_id, error = %error_chain(&settle_err), "failed to settle session");
                }
                Err(err)
            }
        }
    }

    /// Clear the kill deadline and, for a running flow, schedule a retry for
    /// out-of-order completions.
    async fn settle(
        &self,
        handle: &mut dyn FlowHandle,
        notification: &Notification,
        manager: &mut QueueManager,
    ) -> Result<(), SessionError> {
        let session_id = &notification.session_id;
        let context = handle.context();

        if context.schedule_kill_notifications
            && let Some(deadline) = context.kill_timestamp
        {
            manager
                .delete_notification(session_id, TimeRange::exact(deadline))
                .await?;
            handle.context_mut().kill_timestamp = None;
        }

        let context = handle.context();
        if context.is_running()
            && context.process_requests_in_order
            && let Some(last_status) = notification.last_status
            && context.next_processed_request <= last_status
        {
            let retry_at = manager.now() + self.config.notification_retry_interval();
            debug!(
                session_id = %session_id,
                next = context.next_processed_request,
                last_status,
                %retry_at,
                "completed request is not next in order; retrying later"
            );
            manager.queue_notification(notification.clone().at(retry_at));
            manager.flush().await?;
            self.stats.retry_notification();
        }
        Ok(())
    }
}
