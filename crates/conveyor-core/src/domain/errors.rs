//! Domain validation errors.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("priority {0} does not fit in 3 bits (expected 0..=7)")]
    InvalidPriority(u8),

    #[error("invalid queue name {0:?}")]
    InvalidQueueName(String),

    #[error("invalid client id {0:?} (expected C.<16 hex digits>)")]
    InvalidClientId(String),

    #[error("invalid session id {0:?} (expected <queue>/<flow name>)")]
    InvalidSessionId(String),
}
