//! Domain model (IDs, timestamps, messages, requests, notifications).

pub mod errors;
pub mod ids;
pub mod message;
pub mod notification;
pub mod priority;
pub mod request;
pub mod task_id;
pub mod time;

pub use self::errors::DomainError;
pub use self::ids::{ClientId, QueueName, SessionId};
pub use self::message::{AuthState, DEFAULT_TASK_TTL, Message, MessageKind, Status, StatusCode};
pub use self::notification::{Bucket, Notification};
pub use self::priority::Priority;
pub use self::request::RequestState;
pub use self::task_id::{TaskId, TaskIdGenerator};
pub use self::time::{TimeRange, Timestamp};
