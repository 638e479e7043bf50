//! StoreFlowEngine - ストア上に flow を保持するリファレンス実装
//!
//! flow のメタデータ（種類・`RunnerContext`・`FlowState`）は `<session>` サブジェクトに、
//! リクエストとレスポンスは `QueueManager` の `<session>/state` に置かれます。
//!
//! # 実装
//! - `lease` はストアのノンブロッキング lease を取り、取れなければ `FlowError::Locked`
//! - `process_completed_requests` は完了済みのリクエストを id 順に処理する
//!   1. 完了したリクエストのクライアントタスクをクライアントキューから外す
//!   2. `next_processed_request` より小さい id は処理済みなので、遅れて届いた
//!      重複分ごと削除する
//!   3. 順序保証のある flow は大きい id（欠番）で止まる。順序保証のない flow は
//!      欠番を飛ばして、届いているものから処理する
//!   4. ステータスはあるがレスポンスが欠けているリクエストは再送する
//!      （順序保証のある flow はそこで止まる）
//!   5. 状態を実行する前にハートビート（lease と kill 期限の延長）を行う
//!   6. 未完了のリクエストがなくなったら `end` を実行して終了状態にする
//! - `close` でメタデータを書き戻して lease を解放する

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::flow_logic::{FlowCall, FlowLogic, FlowRegistry};
use crate::app::TaskPool;
use crate::domain::{
    ClientId, Message, Notification, Priority, QueueName, SessionId, StatusCode, TimeRange,
};
use crate::ports::{
    Cell, DataStore, FlowEngine, FlowError, FlowHandle, FlowStatus, Lease, Mutation,
    RunnerContext, StoreError,
};
use crate::queue::{QueueManager, keys};
use crate::state::{self, FlowState, UnresolvedField};
use crate::typed::codec::{from_bytes, to_bytes};
use crate::typed::{TypeRegistry, Value};

/// Retransmissions of a request whose responses went missing.
const MAX_TRANSMISSIONS: u32 = 5;

pub struct StoreFlowEngine {
    store: Arc<dyn DataStore>,
    manager: QueueManager,
    flows: FlowRegistry,
    types: Arc<TypeRegistry>,
    owner: String,
    stuck_flows_timeout: Duration,
}

/// Operator view of a stored flow.
#[derive(Debug)]
pub struct FlowInspection {
    pub flow_type: String,
    pub context: RunnerContext,
    pub state: FlowState,
    pub unresolved: Vec<UnresolvedField>,
    pub decode_error: Option<String>,
}

struct StoredFlow {
    logic: Arc<dyn FlowLogic>,
    context: RunnerContext,
    state: FlowState,
    unresolved: Vec<UnresolvedField>,
    decode_error: Option<String>,
}

impl StoreFlowEngine {
    pub fn new(
        manager: &QueueManager,
        flows: FlowRegistry,
        types: Arc<TypeRegistry>,
        stuck_flows_timeout: Duration,
    ) -> Self {
        Self {
            store: Arc::clone(manager.store()),
            manager: manager.copy(),
            flows,
            types,
            owner: format!("engine-{}", Ulid::new()),
            stuck_flows_timeout,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Create a flow, run its `start` state and signal the scheduler.
    pub async fn start_flow(
        &self,
        flow_type: &str,
        client_id: Option<ClientId>,
        queue: QueueName,
        priority: Priority,
        args: Value,
    ) -> Result<SessionId, FlowError> {
        let logic = self
            .flows
            .get(flow_type)
            .ok_or_else(|| FlowError::UnknownFlowType(flow_type.to_string()))?;
        let session_id = SessionId::new_flow(queue);
        let mut manager = self.manager.copy();

        let mut context =
            RunnerContext::new(logic.name(), client_id, priority, manager.now());
        context.process_requests_in_order = logic.process_requests_in_order();
        context.schedule_kill_notifications = logic.schedule_kill_notifications();
        let mut state = FlowState::new(&logic.schema());

        {
            let mut call = FlowCall::new(&session_id, &mut context, &mut state, &mut manager, &args);
            if let Err(err) = logic.start(&mut call).await {
                manager.discard_pending();
                return Err(err);
            }
            if call.context().is_running() && call.context().outstanding_requests == 0 {
                logic.end(&mut call).await?;
            }
        }
        finish_if_idle(&mut context);
        if !context.is_running() {
            manager.destroy_flow_states(&session_id);
        }

        self.write_metadata(&session_id, Some(logic.name()), &context, Some(&state))
            .await?;
        manager.flush().await?;
        info!(session_id = %session_id, flow = logic.name(), "flow started");
        Ok(session_id)
    }

    /// Decode a stored flow without leasing it, tolerating unknown payload types.
    pub async fn inspect(&self, session_id: &SessionId) -> Result<FlowInspection, FlowError> {
        let (flow_type, stored) = self.load(session_id).await?;
        Ok(FlowInspection {
            flow_type,
            context: stored.context,
            state: stored.state,
            unresolved: stored.unresolved,
            decode_error: stored.decode_error,
        })
    }

    async fn load(&self, session_id: &SessionId) -> Result<(String, StoredFlow), FlowError> {
        let subject = keys::flow_subject(session_id);
        let cells = self.store.scan(&subject, "metadata:", TimeRange::all()).await?;

        let mut flow_type = None;
        let mut context = None;
        let mut state_bytes = None;
        for cell in cells {
            match cell.attribute.as_str() {
                keys::METADATA_TYPE => flow_type = Some(from_bytes::<String>(&cell.value)?),
                keys::METADATA_CONTEXT => context = Some(from_bytes::<RunnerContext>(&cell.value)?),
                keys::METADATA_STATE => state_bytes = Some(cell.value),
                _ => {}
            }
        }
        let (Some(flow_type), Some(context)) = (flow_type, context) else {
            return Err(FlowError::NotFound(session_id.clone()));
        };
        let logic = self
            .flows
            .get(&flow_type)
            .ok_or_else(|| FlowError::UnknownFlowType(flow_type.clone()))?;

        let (state, unresolved, decode_error) = match state_bytes {
            Some(bytes) => {
                let decoded = state::decode(&bytes, &self.types)?;
                let error = decoded
                    .error
                    .as_ref()
                    .map(|err| crate::error::error_chain(err));
                (decoded.state, decoded.unresolved, error)
            }
            None => (FlowState::new(&logic.schema()), Vec::new(), None),
        };
        Ok((
            flow_type,
            StoredFlow {
                logic,
                context,
                state,
                unresolved,
                decode_error,
            },
        ))
    }

    async fn write_metadata(
        &self,
        session_id: &SessionId,
        flow_type: Option<&str>,
        context: &RunnerContext,
        state: Option<&FlowState>,
    ) -> Result<(), FlowError> {
        write_metadata(
            self.store.as_ref(),
            &self.manager,
            session_id,
            flow_type,
            context,
            state,
        )
        .await
    }
}

async fn write_metadata(
    store: &dyn DataStore,
    manager: &QueueManager,
    session_id: &SessionId,
    flow_type: Option<&str>,
    context: &RunnerContext,
    state: Option<&FlowState>,
) -> Result<(), FlowError> {
    let now = manager.now();
    let mut mutations = Vec::new();
    if let Some(flow_type) = flow_type {
        mutations.push(Mutation::Replace(Cell::new(
            keys::METADATA_TYPE,
            now,
            to_bytes(&flow_type)?,
        )));
    }
    mutations.push(Mutation::Replace(Cell::new(
        keys::METADATA_CONTEXT,
        now,
        to_bytes(context)?,
    )));
    if let Some(state) = state {
        if state.has_placeholders() {
            warn!(session_id = %session_id, "flow state holds unresolved placeholders; stored state left untouched");
        } else {
            mutations.push(Mutation::Replace(Cell::new(
                keys::METADATA_STATE,
                now,
                state.encode()?,
            )));
        }
    }
    store.apply(&keys::flow_subject(session_id), mutations).await?;
    Ok(())
}

/// The status is last and every response before it arrived.
fn fully_received(responses: &[Message]) -> bool {
    responses
        .last()
        .is_some_and(|last| last.is_status() && last.response_id as usize == responses.len())
}

/// A flow with nothing outstanding has finished.
fn finish_if_idle(context: &mut RunnerContext) {
    if context.is_running() && context.outstanding_requests == 0 {
        context.state = FlowStatus::Terminated;
        context.status = Some("flow completed".to_string());
        context.status_code = Some(StatusCode::Ok);
    }
}

#[async_trait]
impl FlowEngine for StoreFlowEngine {
    async fn lease(
        &self,
        session_id: &SessionId,
        lease_time: Duration,
    ) -> Result<Box<dyn FlowHandle>, FlowError> {
        let lease = self
            .store
            .acquire_lease(&keys::flow_subject(session_id), &self.owner, lease_time)
            .await
            .map_err(|err| match err {
                StoreError::LeaseHeld { .. } => FlowError::Locked(session_id.clone()),
                other => FlowError::Store(other),
            })?;

        let stored = match self.load(session_id).await {
            Ok((_, stored)) => stored,
            Err(err) => {
                self.store.release_lease(lease).await?;
                return Err(err);
            }
        };
        if !stored.unresolved.is_empty() {
            warn!(
                session_id = %session_id,
                fields = ?stored.unresolved.iter().map(|u| u.path.as_str()).collect::<Vec<_>>(),
                "leased flow has unresolved state fields"
            );
        }

        Ok(Box::new(StoreFlowHandle {
            session_id: session_id.clone(),
            store: Arc::clone(&self.store),
            manager: self.manager.copy(),
            lease,
            lease_time,
            stuck_flows_timeout: self.stuck_flows_timeout,
            logic: stored.logic,
            context: stored.context,
            state: stored.state,
        }))
    }

    async fn terminate_flow(
        &self,
        session_id: &SessionId,
        reason: &str,
        status: StatusCode,
        force: bool,
    ) -> Result<(), FlowError> {
        let subject = keys::flow_subject(session_id);
        let lease = if force {
            None
        } else {
            let ttl = self.stuck_flows_timeout.min(Duration::from_secs(600));
            Some(
                self.store
                    .acquire_lease(&subject, &self.owner, ttl)
                    .await
                    .map_err(|err| match err {
                        StoreError::LeaseHeld { .. } => FlowError::Locked(session_id.clone()),
                        other => FlowError::Store(other),
                    })?,
            )
        };

        let result = self.terminate_loaded(session_id, reason, status).await;
        if let Some(lease) = lease {
            self.store.release_lease(lease).await?;
        }
        result
    }
}

impl StoreFlowEngine {
    async fn terminate_loaded(
        &self,
        session_id: &SessionId,
        reason: &str,
        status: StatusCode,
    ) -> Result<(), FlowError> {
        let (_, mut stored) = self.load(session_id).await?;
        let mut manager = self.manager.copy();

        // Pull the flow's tasks off the client queue so the client stops working on them.
        let outstanding = manager
            .fetch_requests_and_responses(session_id, TimeRange::all())
            .await?;
        for (request, _) in outstanding {
            if let (Some(client_id), Some(task_id)) = (
                request.client_id.as_ref(),
                request.request.as_ref().and_then(|m| m.task_id),
            ) {
                manager.dequeue_client_request(client_id, task_id);
            }
        }
        manager.destroy_flow_states(session_id);

        let context = &mut stored.context;
        context.state = FlowStatus::Error;
        context.status = Some(reason.to_string());
        context.status_code = Some(status);
        context.outstanding_requests = 0;

        self.write_metadata(session_id, None, &stored.context, None)
            .await?;
        manager.flush().await?;
        warn!(session_id = %session_id, reason, ?status, "flow terminated");
        Ok(())
    }
}

struct StoreFlowHandle {
    session_id: SessionId,
    store: Arc<dyn DataStore>,
    manager: QueueManager,
    lease: Lease,
    lease_time: Duration,
    stuck_flows_timeout: Duration,
    logic: Arc<dyn FlowLogic>,
    context: RunnerContext,
    state: FlowState,
}

impl StoreFlowHandle {
    /// Renew the lease once less than half of it remains, and push the kill
    /// deadline out along with it.
    async fn heartbeat(&mut self) -> Result<(), FlowError> {
        let now = self.manager.now();
        let remaining = self.lease.expires_at.as_micros() - now.as_micros();
        let half = i64::try_from(self.lease_time.as_micros() / 2).unwrap_or(i64::MAX);
        if remaining >= half {
            return Ok(());
        }

        self.lease = self.store.renew_lease(&self.lease, self.lease_time).await?;
        if let Some(old) = self.context.kill_timestamp {
            let deadline = now + self.stuck_flows_timeout;
            self.manager
                .delete_notification(&self.session_id, TimeRange::exact(old))
                .await?;
            self.manager.queue_notification(
                Notification::new(self.session_id.clone(), deadline)
                    .with_priority(self.context.priority)
                    .in_progress(),
            );
            self.context.kill_timestamp = Some(deadline);
            debug!(session_id = %self.session_id, %deadline, "kill deadline refreshed");
        }
        Ok(())
    }

    /// Re-send a request whose responses went missing in transit.
    fn retransmit(&mut self, mut request: crate::domain::RequestState) -> Result<(), FlowError> {
        if request.transmission_count >= MAX_TRANSMISSIONS {
            warn!(session_id = %self.session_id, request_id = request.id, "request exhausted its retransmissions");
            return Ok(());
        }
        request.transmission_count += 1;
        if let (Some(client_id), Some(message)) = (request.client_id.clone(), request.request.clone()) {
            self.manager.queue_client_message(&client_id, message)?;
        }
        self.manager.queue_request(&request)?;
        debug!(session_id = %self.session_id, request_id = request.id, count = request.transmission_count, "request retransmitted");
        Ok(())
    }

    async fn run_completed(&mut self, notification: &Notification) -> Result<(), FlowError> {
        let range = TimeRange::up_to(notification.timestamp.max(self.manager.now()));
        let completed = self
            .manager
            .fetch_completed_responses(&self.session_id, range)
            .await?;

        for (request, _) in completed.iter().filter(|(_, r)| fully_received(r)) {
            if let (Some(client_id), Some(task_id)) = (
                request.client_id.as_ref(),
                request.request.as_ref().and_then(|m| m.task_id),
            ) {
                self.manager.dequeue_client_request(client_id, task_id);
            }
        }

        let in_order = self.context.process_requests_in_order;
        for (request, responses) in completed {
            if !self.context.is_running() {
                break;
            }
            if request.id < self.context.next_processed_request {
                // Already processed; only a late duplicate is left behind.
                self.manager.delete_request(&self.session_id, request.id);
                continue;
            }
            if in_order && request.id > self.context.next_processed_request {
                debug!(
                    session_id = %self.session_id,
                    waiting_for = self.context.next_processed_request,
                    found = request.id,
                    "request gap; waiting"
                );
                break;
            }
            if !fully_received(&responses) {
                self.retransmit(request)?;
                if in_order {
                    break;
                }
                continue;
            }

            self.heartbeat().await?;
            self.run_state(&request, &responses).await?;
            self.manager.delete_request(&self.session_id, request.id);
            // Processed requests are deleted, so out-of-order ones never come back;
            // the cursor only tracks the contiguous prefix.
            if request.id == self.context.next_processed_request {
                self.context.next_processed_request += 1;
            }
            self.context.outstanding_requests = self.context.outstanding_requests.saturating_sub(1);
            self.manager.flush().await?;
        }

        if self.context.is_running() && self.context.outstanding_requests == 0 {
            self.run_end().await?;
            finish_if_idle(&mut self.context);
        }
        if !self.context.is_running() {
            self.manager.destroy_flow_states(&self.session_id);
        }
        self.manager.flush().await?;
        Ok(())
    }

    async fn run_state(
        &mut self,
        request: &crate::domain::RequestState,
        responses: &[Message],
    ) -> Result<(), FlowError> {
        self.context.current_state = request.next_state.clone();
        let logic = Arc::clone(&self.logic);
        let mut call = FlowCall::new(
            &self.session_id,
            &mut self.context,
            &mut self.state,
            &mut self.manager,
            &request.data,
        );
        logic.run_state(&request.next_state, &mut call, responses).await
    }

    async fn run_end(&mut self) -> Result<(), FlowError> {
        let logic = Arc::clone(&self.logic);
        let args = Value::Null;
        let mut call = FlowCall::new(
            &self.session_id,
            &mut self.context,
            &mut self.state,
            &mut self.manager,
            &args,
        );
        logic.end(&mut call).await
    }
}

#[async_trait]
impl FlowHandle for StoreFlowHandle {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn context(&self) -> &RunnerContext {
        &self.context
    }

    fn context_mut(&mut self) -> &mut RunnerContext {
        &mut self.context
    }

    async fn process_completed_requests(
        &mut self,
        notification: &Notification,
        _pool: &TaskPool,
    ) -> Result<(), FlowError> {
        if !self.context.is_running() {
            self.manager.destroy_flow_states(&self.session_id);
            self.manager.flush().await?;
            return Ok(());
        }
        let result = self.run_completed(notification).await;
        if result.is_err() {
            let dropped = self.manager.discard_pending();
            debug!(session_id = %self.session_id, dropped, "discarded writes of failed state");
        }
        result
    }

    async fn close(mut self: Box<Self>) -> Result<(), FlowError> {
        if !self.context.is_running() {
            self.manager.destroy_flow_states(&self.session_id);
        }
        self.manager.flush().await?;
        write_metadata(
            self.store.as_ref(),
            &self.manager,
            &self.session_id,
            None,
            &self.context,
            Some(&self.state),
        )
        .await?;
        let StoreFlowHandle { store, lease, .. } = *self;
        store.release_lease(lease).await?;
        Ok(())
    }
}
