//! Task / message envelope exchanged between flows and clients.

use serde::{Deserialize, Serialize};

use super::ids::{ClientId, SessionId};
use super::priority::Priority;
use super::task_id::TaskId;
use crate::typed::{CodecError, ObjectType, Value};

/// Retransmissions a client task gets before the client queue drops it.
pub const DEFAULT_TASK_TTL: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Message,
    /// Terminates the responses of one request.
    Status,
    Iterator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    Authenticated,
    Desynchronized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    GenericError,
    WorkerStuck,
    Terminated,
}

/// Payload of a `MessageKind::Status` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub error_message: String,
    pub backtrace: Option<String>,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            error_message: String::new(),
            backtrace: None,
        }
    }

    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            error_message: message.into(),
            backtrace: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl ObjectType for Status {
    const TYPE: &'static str = "conveyor.status.v1";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub session_id: SessionId,
    pub request_id: u64,
    pub response_id: u64,
    pub kind: MessageKind,
    pub auth_state: AuthState,
    pub task_id: Option<TaskId>,
    pub priority: Priority,
    /// Client action to run, for messages sent to a client.
    pub name: String,
    pub payload: Value,
    pub source: Option<ClientId>,
    pub task_ttl: u32,
}

impl Message {
    /// A request addressed to a client on behalf of `session_id`.
    pub fn request(
        session_id: SessionId,
        request_id: u64,
        name: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            session_id,
            request_id,
            response_id: 0,
            kind: MessageKind::Message,
            auth_state: AuthState::Unauthenticated,
            task_id: None,
            priority: Priority::default(),
            name: name.into(),
            payload,
            source: None,
            task_ttl: DEFAULT_TASK_TTL,
        }
    }

    /// A response to this request.
    pub fn response(&self, response_id: u64, payload: Value) -> Self {
        Self {
            session_id: self.session_id.clone(),
            request_id: self.request_id,
            response_id,
            kind: MessageKind::Message,
            auth_state: AuthState::Authenticated,
            task_id: self.task_id,
            priority: self.priority,
            name: self.name.clone(),
            payload,
            source: None,
            task_ttl: 0,
        }
    }

    /// The status message closing the responses to this request.
    pub fn status(&self, response_id: u64, status: &Status) -> Result<Self, CodecError> {
        let mut message = self.response(response_id, Value::object(status)?);
        message.kind = MessageKind::Status;
        Ok(message)
    }

    pub fn with_source(mut self, client_id: ClientId) -> Self {
        self.source = Some(client_id);
        self
    }

    pub fn is_status(&self) -> bool {
        self.kind == MessageKind::Status
    }

    /// Decoded status payload, if this is a well-formed status message.
    pub fn status_payload(&self) -> Option<Status> {
        if !self.is_status() {
            return None;
        }
        self.payload.to_object::<Status>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QueueName;

    #[test]
    fn responses_inherit_routing_from_the_request() {
        let session = SessionId::new_flow(QueueName::worker());
        let request = Message::request(session.clone(), 3, "ListDirectory", Value::from("/etc"));

        let response = request.response(1, Value::from("passwd"));
        let status = request.status(2, &Status::ok()).unwrap();

        assert_eq!(response.session_id, session);
        assert_eq!(response.request_id, 3);
        assert!(!response.is_status());
        assert!(status.is_status());
        assert_eq!(status.response_id, 2);
        assert!(status.status_payload().unwrap().is_ok());
        assert!(response.status_payload().is_none());
    }
}
