//! Queue module: notification-driven mediator over the backing store.

pub mod keys;
mod manager;

pub use manager::{FrozenTimestamp, NotificationsByBucket, QueueManager};

use thiserror::Error;

use crate::ports::StoreError;
use crate::typed::CodecError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("record {attribute} under {subject} does not decode")]
    Corrupt {
        subject: String,
        attribute: String,
        #[source]
        source: CodecError,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),
}
