//! Flow continuation contract - ワーカーが flow エンジンに要求するインターフェース
//!
//! ワーカーは flow の中身を知りません。セッションを lease し、完了したリクエストを
//! 処理させ、`RunnerContext` を通してスケジューリング用のメタデータを読み書きするだけです。
//!
//! # 契約
//! - `FlowEngine::lease` はノンブロッキング。他のワーカーが保持中なら即座に
//!   `FlowError::Locked` を返す（これはエラー率の指標ではない）
//! - `FlowHandle::process_completed_requests` は到着済みで連続したリクエストだけを処理し、
//!   欠けているものは後のパスに残す
//! - `FlowHandle::close` で状態を永続化して lease を解放する

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::TaskPool;
use crate::domain::{
    ClientId, DomainError, Message, Notification, Priority, SessionId, StatusCode, Timestamp,
};
use crate::ports::StoreError;
use crate::queue::QueueError;
use crate::state::StateError;
use crate::typed::CodecError;

#[derive(Debug, Error)]
pub enum FlowError {
    /// Another worker holds the lease.
    #[error("session {0} is leased by another worker")]
    Locked(SessionId),

    #[error("flow {0} does not exist")]
    NotFound(SessionId),

    #[error("no flow logic registered under {0:?}")]
    UnknownFlowType(String),

    #[error("flow has no state named {0:?}")]
    UnknownState(String),

    #[error("state {state:?} failed: {message}")]
    Processing { state: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl FlowError {
    /// Short label used for per-kind error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Locked(_) => "locked",
            FlowError::NotFound(_) => "not_found",
            FlowError::UnknownFlowType(_) => "unknown_flow_type",
            FlowError::UnknownState(_) => "unknown_state",
            FlowError::Processing { .. } => "processing",
            FlowError::Store(_) => "store",
            FlowError::Queue(_) => "queue",
            FlowError::Codec(_) => "codec",
            FlowError::State(_) => "state",
            FlowError::Domain(_) => "domain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    Running,
    Error,
    Terminated,
}

/// Scheduling metadata of a flow, persisted alongside its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerContext {
    pub flow_name: String,
    pub client_id: Option<ClientId>,
    pub priority: Priority,
    pub create_time: Timestamp,
    pub current_state: String,
    /// Id of the next request the flow will process.
    pub next_processed_request: u64,
    pub next_outbound_id: u64,
    pub outstanding_requests: u64,
    pub process_requests_in_order: bool,
    pub schedule_kill_notifications: bool,
    /// Deadline of the registered kill notification, refreshed by heartbeats.
    pub kill_timestamp: Option<Timestamp>,
    pub state: FlowStatus,
    pub status: Option<String>,
    pub status_code: Option<StatusCode>,
    pub backtrace: Option<String>,
}

impl RunnerContext {
    pub fn new(
        flow_name: impl Into<String>,
        client_id: Option<ClientId>,
        priority: Priority,
        create_time: Timestamp,
    ) -> Self {
        Self {
            flow_name: flow_name.into(),
            client_id,
            priority,
            create_time,
            current_state: "Start".to_string(),
            next_processed_request: 1,
            next_outbound_id: 1,
            outstanding_requests: 0,
            process_requests_in_order: true,
            schedule_kill_notifications: true,
            kill_timestamp: None,
            state: FlowStatus::Running,
            status: None,
            status_code: None,
            backtrace: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == FlowStatus::Running
    }

    pub fn mark_error(&mut self, message: impl Into<String>, backtrace: Option<String>) {
        self.state = FlowStatus::Error;
        self.status = Some(message.into());
        self.status_code = Some(StatusCode::GenericError);
        self.backtrace = backtrace;
    }
}

/// Entry point of a flow engine.
#[async_trait]
pub trait FlowEngine: Send + Sync {
    /// Non-blocking lease. `FlowError::Locked` if another worker holds it.
    async fn lease(
        &self,
        session_id: &SessionId,
        lease_time: Duration,
    ) -> Result<Box<dyn FlowHandle>, FlowError>;

    /// End a flow. With `force`, the flow's lease is ignored.
    async fn terminate_flow(
        &self,
        session_id: &SessionId,
        reason: &str,
        status: StatusCode,
        force: bool,
    ) -> Result<(), FlowError>;
}

/// A leased flow.
#[async_trait]
pub trait FlowHandle: Send {
    fn session_id(&self) -> &SessionId;

    fn context(&self) -> &RunnerContext;

    fn context_mut(&mut self) -> &mut RunnerContext;

    /// Advance the flow over the contiguous prefix of completed requests
    /// visible at the notification's timestamp.
    async fn process_completed_requests(
        &mut self,
        notification: &Notification,
        pool: &TaskPool,
    ) -> Result<(), FlowError>;

    /// Persist context and state, then release the lease.
    async fn close(self: Box<Self>) -> Result<(), FlowError>;
}

/// A singleton flow that is always instantiable and needs no lease.
#[async_trait]
pub trait WellKnownFlow: Send + Sync {
    /// Flow-name component of the session id this flow answers to.
    fn name(&self) -> &str;

    /// Handle everything queued for the session since the last wake-up.
    ///
    /// The call itself occupies one of `pool`'s slots, so awaiting
    /// [`TaskPool::spawn`] here can wait forever on a full pool. Hand off
    /// follow-up work with [`TaskPool::try_spawn`] instead.
    async fn process_responses(
        &self,
        responses: Vec<Message>,
        pool: &TaskPool,
    ) -> Result<(), FlowError>;
}
