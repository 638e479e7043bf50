//! Outstanding request state.

use serde::{Deserialize, Serialize};

use super::ids::{ClientId, SessionId};
use super::message::Message;
use crate::typed::Value;

/// One unit of outstanding work for a session.
///
/// flow がクライアントやサブ状態を呼び出したときに作られ、
/// ステータスを含むレスポンスが処理し終わったら削除されます。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestState {
    pub id: u64,
    pub session_id: SessionId,
    pub client_id: Option<ClientId>,
    /// Flow state that receives the responses.
    pub next_state: String,
    /// The client task that was sent, kept so it can be re-injected.
    pub request: Option<Message>,
    pub transmission_count: u32,
    /// Caller data handed back to `next_state`.
    pub data: Value,
}

impl RequestState {
    pub fn new(id: u64, session_id: SessionId, next_state: impl Into<String>) -> Self {
        Self {
            id,
            session_id,
            client_id: None,
            next_state: next_state.into(),
            request: None,
            transmission_count: 0,
            data: Value::Null,
        }
    }

    pub fn with_client_request(mut self, client_id: ClientId, request: Message) -> Self {
        self.client_id = Some(client_id);
        self.request = Some(request);
        self.transmission_count = 1;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}
