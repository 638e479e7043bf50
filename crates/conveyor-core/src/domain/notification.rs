//! Notifications and priority buckets.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::SessionId;
use super::priority::Priority;
use super::time::Timestamp;

/// A hint that a session has work ready at `timestamp`.
///
/// `in_progress` な通知は kill 期限として登録されたもので、
/// 期限までに消されなかった場合だけ `Bucket::Stuck` に現れます。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub session_id: SessionId,
    pub priority: Priority,
    /// When the notification becomes visible; the store version of the cell.
    pub timestamp: Timestamp,
    pub first_queued: Timestamp,
    pub in_progress: bool,
    /// Id of the request whose status triggered this notification.
    pub last_status: Option<u64>,
}

impl Notification {
    pub fn new(session_id: SessionId, timestamp: Timestamp) -> Self {
        Self {
            session_id,
            priority: Priority::default(),
            timestamp,
            first_queued: timestamp,
            in_progress: false,
            last_status: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_last_status(mut self, request_id: u64) -> Self {
        self.last_status = Some(request_id);
        self
    }

    /// Mark as a kill deadline rather than real work.
    pub fn in_progress(mut self) -> Self {
        self.in_progress = true;
        self
    }

    /// Reschedule, keeping `first_queued`.
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Key of the map returned by a notification scan.
///
/// `Stuck` は `Priority` より小さく並ぶので、昇順に走査すると最初に、
/// 降順に走査すると最後に来ます。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    Stuck,
    Priority(Priority),
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bucket::Stuck => f.write_str("stuck"),
            Bucket::Priority(p) => write!(f, "{p}"),
        }
    }
}
