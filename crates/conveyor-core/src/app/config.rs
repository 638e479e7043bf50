//! Worker configuration.
//!
//! すべての項目にデフォルト値があるので、設定ファイルには変更したい項目だけを書けば十分です。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::QueueName;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Queues scanned by `run_once`, in order.
    pub queues: Vec<QueueName>,
    pub pool_size: usize,
    /// Time budget of one `run_once` pass.
    pub run_once_max_secs: u64,
    pub flow_lease_time_secs: u64,
    /// A flow still leased this long after a worker picked it up counts as stuck.
    pub stuck_flows_timeout_secs: u64,
    pub notification_retry_interval_secs: u64,
    pub negative_cache_ttl_secs: u64,
    pub negative_cache_capacity: u64,
    pub polling_interval_ms: u64,
    pub short_polling_interval_ms: u64,
    /// How long after the last work item the worker keeps polling fast.
    pub short_poll_window_secs: u64,
    pub notification_shards: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec![QueueName::worker()],
            pool_size: 50,
            run_once_max_secs: 300,
            flow_lease_time_secs: 2 * 3600,
            stuck_flows_timeout_secs: 6 * 3600,
            notification_retry_interval_secs: 30,
            negative_cache_ttl_secs: 60,
            negative_cache_capacity: 1000,
            polling_interval_ms: 5000,
            short_polling_interval_ms: 300,
            short_poll_window_secs: 30,
            notification_shards: 1,
        }
    }
}

impl WorkerConfig {
    pub fn run_once_max(&self) -> Duration {
        Duration::from_secs(self.run_once_max_secs)
    }

    pub fn flow_lease_time(&self) -> Duration {
        Duration::from_secs(self.flow_lease_time_secs)
    }

    pub fn stuck_flows_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_flows_timeout_secs)
    }

    pub fn notification_retry_interval(&self) -> Duration {
        Duration::from_secs(self.notification_retry_interval_secs)
    }

    pub fn negative_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_cache_ttl_secs)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn short_polling_interval(&self) -> Duration {
        Duration::from_millis(self.short_polling_interval_ms)
    }

    pub fn short_poll_window(&self) -> Duration {
        Duration::from_secs(self.short_poll_window_secs)
    }
}
