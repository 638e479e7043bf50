//! Sessions recently found locked by another worker.
//!
//! lease に失敗したセッションを TTL 付きで覚えておき、次のスキャンで同じセッションを
//! 何度も lease しに行かないようにします。容量と TTL は moka に任せます。

use std::time::Duration;

use moka::sync::Cache;

use crate::domain::SessionId;

#[derive(Clone)]
pub struct NegativeCache {
    entries: Cache<SessionId, ()>,
}

impl NegativeCache {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn insert(&self, session_id: SessionId) {
        self.entries.insert(session_id, ());
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.entries.contains_key(session_id)
    }

    pub fn remove(&self, session_id: &SessionId) {
        self.entries.invalidate(session_id);
    }

    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
