//! FlowLogic - `StoreFlowEngine` が実行する flow の中身
//!
//! flow は名前付き状態の集まりです。`start` で最初のリクエストを発行し、
//! リクエストが完了するたびに `run_state` がそのリクエストの `next_state` で呼ばれ、
//! 未完了のリクエストがなくなると `end` が呼ばれます。
//!
//! # 使用例
//! ```ignore
//! struct Echo;
//!
//! #[async_trait]
//! impl FlowLogic for Echo {
//!     fn name(&self) -> &str { "Echo" }
//!     fn schema(&self) -> StateSchema { StateSchema::from_fields(&["reply"]) }
//!
//!     async fn start(&self, call: &mut FlowCall<'_>) -> Result<(), FlowError> {
//!         call.call_client("Echo", call.args().clone(), "Done")?;
//!         Ok(())
//!     }
//!
//!     async fn run_state(&self, state: &str, call: &mut FlowCall<'_>, responses: &[Message])
//!         -> Result<(), FlowError> {
//!         call.state_mut().set("reply", responses[0].payload.clone())?;
//!         Ok(())
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Message, Notification, RequestState, SessionId, Status, StatusCode};
use crate::ports::{FlowError, FlowStatus, RunnerContext};
use crate::queue::QueueManager;
use crate::state::{FlowState, StateSchema};
use crate::typed::{RegistryError, Value};

#[async_trait]
pub trait FlowLogic: Send + Sync {
    /// Name stored with every flow of this kind.
    fn name(&self) -> &str;

    fn schema(&self) -> StateSchema;

    fn process_requests_in_order(&self) -> bool {
        true
    }

    fn schedule_kill_notifications(&self) -> bool {
        true
    }

    async fn start(&self, call: &mut FlowCall<'_>) -> Result<(), FlowError>;

    /// Handle the responses of one completed request.
    async fn run_state(
        &self,
        state: &str,
        call: &mut FlowCall<'_>,
        responses: &[Message],
    ) -> Result<(), FlowError>;

    async fn end(&self, _call: &mut FlowCall<'_>) -> Result<(), FlowError> {
        Ok(())
    }
}

/// Flow logic by name.
#[derive(Default, Clone)]
pub struct FlowRegistry {
    flows: HashMap<String, Arc<dyn FlowLogic>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, logic: impl FlowLogic + 'static) -> Result<(), RegistryError> {
        let name = logic.name().to_string();
        if self.flows.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.flows.insert(name, Arc::new(logic));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FlowLogic>> {
        self.flows.get(name).cloned()
    }

    pub fn registered_flows(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flows.keys().cloned().collect();
        names.sort();
        names
    }
}

/// What a flow state sees while it runs.
///
/// 書き込みはすべて `QueueManager` のバッファに積まれ、状態の実行が成功したときだけ
/// まとめて flush されます。
pub struct FlowCall<'a> {
    session_id: &'a SessionId,
    context: &'a mut RunnerContext,
    state: &'a mut FlowState,
    manager: &'a mut QueueManager,
    args: &'a Value,
}

impl<'a> FlowCall<'a> {
    pub(crate) fn new(
        session_id: &'a SessionId,
        context: &'a mut RunnerContext,
        state: &'a mut FlowState,
        manager: &'a mut QueueManager,
        args: &'a Value,
    ) -> Self {
        Self {
            session_id,
            context,
            state,
            manager,
            args,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        self.session_id
    }

    pub fn context(&self) -> &RunnerContext {
        self.context
    }

    pub fn state(&self) -> &FlowState {
        self.state
    }

    pub fn state_mut(&mut self) -> &mut FlowState {
        self.state
    }

    /// Start arguments in `start`, the request's data in `run_state`.
    pub fn args(&self) -> &Value {
        self.args
    }

    /// Send `action` to the flow's client; its responses arrive in `next_state`.
    pub fn call_client(
        &mut self,
        action: &str,
        payload: Value,
        next_state: &str,
    ) -> Result<u64, FlowError> {
        let Some(client_id) = self.context.client_id.clone() else {
            return Err(FlowError::Processing {
                state: self.context.current_state.clone(),
                message: format!("{action} needs a client but flow has none"),
            });
        };
        let id = self.next_request_id();

        let mut message = Message::request(self.session_id.clone(), id, action, payload);
        message.priority = self.context.priority;
        message.task_id = Some(self.manager.ids().next_id(message.priority));

        let request = RequestState::new(id, self.session_id.clone(), next_state)
            .with_client_request(client_id.clone(), message.clone());
        self.manager.queue_request(&request)?;
        self.manager.queue_client_message(&client_id, message)?;
        self.context.outstanding_requests += 1;
        Ok(id)
    }

    /// Run `next_state` of this flow on a later pass, handing it `data`.
    pub fn call_state(&mut self, next_state: &str, data: Value) -> Result<u64, FlowError> {
        let id = self.next_request_id();
        let request = RequestState::new(id, self.session_id.clone(), next_state).with_data(data);
        self.manager.queue_request(&request)?;

        let mut trigger = Message::request(self.session_id.clone(), id, next_state, Value::Null);
        trigger.priority = self.context.priority;
        self.manager
            .receive_responses(&[trigger.status(1, &Status::ok())?])?;
        self.context.outstanding_requests += 1;
        Ok(id)
    }

    /// Stop the flow after the current state; outstanding requests are dropped.
    pub fn terminate(&mut self, reason: &str) {
        self.context.state = FlowStatus::Terminated;
        self.context.status = Some(reason.to_string());
        self.context.status_code = Some(StatusCode::Ok);
    }

    /// Wake the flow again at its own priority.
    pub fn notify(&mut self) {
        let now = self.manager.now();
        self.manager.queue_notification(
            Notification::new(self.session_id.clone(), now).with_priority(self.context.priority),
        );
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.context.next_outbound_id;
        self.context.next_outbound_id += 1;
        id
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Flow kinds shared by engine and worker tests.

    use super::*;

    /// Sends `count` echo requests, collects the payloads in `replies`.
    pub struct EchoFlow {
        pub count: u64,
        pub in_order: bool,
    }

    #[async_trait]
    impl FlowLogic for EchoFlow {
        fn name(&self) -> &str {
            "Echo"
        }

        fn schema(&self) -> StateSchema {
            StateSchema::from_fields(&["replies"])
        }

        fn process_requests_in_order(&self) -> bool {
            self.in_order
        }

        async fn start(&self, call: &mut FlowCall<'_>) -> Result<(), FlowError> {
            call.state_mut().set("replies", Value::List(Vec::new()))?;
            for i in 0..self.count {
                call.call_client("Echo", Value::UInt(i), "Collect")?;
            }
            Ok(())
        }

        async fn run_state(
            &self,
            state: &str,
            call: &mut FlowCall<'_>,
            responses: &[Message],
        ) -> Result<(), FlowError> {
            if state != "Collect" {
                return Err(FlowError::UnknownState(state.to_string()));
            }
            let mut replies = match call.state().get("replies") {
                Some(Value::List(items)) => items.clone(),
                _ => Vec::new(),
            };
            replies.extend(
                responses
                    .iter()
                    .filter(|m| !m.is_status())
                    .map(|m| m.payload.clone()),
            );
            call.state_mut().set("replies", Value::List(replies))?;
            Ok(())
        }
    }

    /// Fails in every state after `start`.
    pub struct FailingFlow;

    #[async_trait]
    impl FlowLogic for FailingFlow {
        fn name(&self) -> &str {
            "Failing"
        }

        fn schema(&self) -> StateSchema {
            StateSchema::new()
        }

        async fn start(&self, call: &mut FlowCall<'_>) -> Result<(), FlowError> {
            call.call_state("Explode", Value::Null)?;
            Ok(())
        }

        async fn run_state(
            &self,
            state: &str,
            _call: &mut FlowCall<'_>,
            _responses: &[Message],
        ) -> Result<(), FlowError> {
            Err(FlowError::Processing {
                state: state.to_string(),
                message: "exploded".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::EchoFlow;
    use super::*;

    #[test]
    fn duplicate_flow_names_are_rejected() {
        let mut registry = FlowRegistry::new();
        registry.register(EchoFlow { count: 1, in_order: true }).unwrap();
        let err = registry
            .register(EchoFlow { count: 2, in_order: true })
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(name) if name == "Echo"));
        assert_eq!(registry.registered_flows(), vec!["Echo".to_string()]);
    }
}
