//! Crate-level error.
//!
//! 各レイヤーはそれぞれの `thiserror` enum を返します。`ConveyorError` は
//! それらを束ねたもので、CLI などの外側の呼び出し元向けです。

use thiserror::Error;

use crate::app::{BuildError, WorkerError};
use crate::domain::DomainError;
use crate::ports::{FlowError, StoreError};
use crate::queue::QueueError;
use crate::state::StateError;
use crate::typed::{CodecError, RegistryError};

#[derive(Debug, Error)]
pub enum ConveyorError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Render an error and its sources as `outer: inner: root`.
///
/// flow に記録する backtrace の代わりにも使います。
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        // transparent variants repeat their source's message
        if !rendered.ends_with(&text) {
            rendered.push_str(": ");
            rendered.push_str(&text);
        }
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SessionId;

    #[test]
    fn chain_includes_every_source_once() {
        let err = QueueError::Store(StoreError::Unavailable("disk full".into()));
        let chain = error_chain(&err);
        assert!(chain.contains("disk full"));
        assert_eq!(chain.matches("disk full").count(), 1);
    }

    #[test]
    fn umbrella_wraps_flow_errors() {
        let session: SessionId = "W/F:01HZZZZZZZZZZZZZZZZZZZZZZZ".parse().unwrap();
        let err: ConveyorError = FlowError::Locked(session).into();
        assert!(matches!(err, ConveyorError::Flow(FlowError::Locked(_))));
    }
}
