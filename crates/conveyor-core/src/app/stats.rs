//! Worker counters.
//!
//! カウンタは `AtomicU64` で、セッション処理エラーの種類別カウントだけ `DashMap` を使います。
//! 外に見せるときは `WorkerCounts` のスナップショットに変換します。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct WorkerStats {
    lock_errors: AtomicU64,
    flows_stuck: AtomicU64,
    stuck_termination_failures: AtomicU64,
    flow_processing_errors: AtomicU64,
    session_errors_by_kind: DashMap<&'static str, u64>,
    well_known_requests: AtomicU64,
    sessions_processed: AtomicU64,
    retry_notifications: AtomicU64,
    worker_exceptions: AtomicU64,
}

/// Point-in-time copy of `WorkerStats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub lock_errors: u64,
    pub flows_stuck: u64,
    pub stuck_termination_failures: u64,
    pub flow_processing_errors: u64,
    pub session_errors_by_kind: BTreeMap<String, u64>,
    pub well_known_requests: u64,
    pub sessions_processed: u64,
    pub retry_notifications: u64,
    pub worker_exceptions: u64,
}

impl WorkerStats {
    pub fn lock_error(&self) {
        self.lock_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_stuck(&self) {
        self.flows_stuck.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stuck_termination_failure(&self) {
        self.stuck_termination_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flow_processing_error(&self) {
        self.flow_processing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_error(&self, kind: &'static str) {
        *self.session_errors_by_kind.entry(kind).or_insert(0) += 1;
    }

    pub fn well_known_request(&self, count: u64) {
        self.well_known_requests.fetch_add(count, Ordering::Relaxed);
    }

    pub fn session_processed(&self) {
        self.sessions_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry_notification(&self) {
        self.retry_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_exception(&self) {
        self.worker_exceptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerCounts {
        WorkerCounts {
            lock_errors: self.lock_errors.load(Ordering::Relaxed),
            flows_stuck: self.flows_stuck.load(Ordering::Relaxed),
            stuck_termination_failures: self.stuck_termination_failures.load(Ordering::Relaxed),
            flow_processing_errors: self.flow_processing_errors.load(Ordering::Relaxed),
            session_errors_by_kind: self
                .session_errors_by_kind
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
            well_known_requests: self.well_known_requests.load(Ordering::Relaxed),
            sessions_processed: self.sessions_processed.load(Ordering::Relaxed),
            retry_notifications: self.retry_notifications.load(Ordering::Relaxed),
            worker_exceptions: self.worker_exceptions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_groups_session_errors_by_kind() {
        let stats = WorkerStats::default();
        stats.session_error("store");
        stats.session_error("store");
        stats.session_error("codec");
        stats.lock_error();

        let counts = stats.snapshot();
        assert_eq!(counts.lock_errors, 1);
        assert_eq!(counts.session_errors_by_kind["store"], 2);
        assert_eq!(counts.session_errors_by_kind["codec"], 1);

        let json = serde_json::to_value(&counts).unwrap();
        assert_eq!(json["session_errors_by_kind"]["store"], 2);
    }
}
