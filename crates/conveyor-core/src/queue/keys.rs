//! Store layout.
//!
//! | subject                         | attribute                          |
//! |---------------------------------|------------------------------------|
//! | `notifications/<queue>[/<n>]`   | `notify:<session>`                 |
//! | `<session>/state`               | `flow:request:<id>`                |
//! | `<session>/state`               | `flow:response:<id>:<response id>` |
//! | `<client>/tasks`                | `task:<task id>`                   |
//! | `<session>`                     | `metadata:{type,context,state}`    |
//!
//! 数値は固定幅の 16 進数にして、属性名の辞書順が数値順と一致するようにしています。

use crate::domain::{ClientId, QueueName, SessionId, TaskId};

pub const NOTIFY_PREFIX: &str = "notify:";
pub const FLOW_PREFIX: &str = "flow:";
pub const REQUEST_PREFIX: &str = "flow:request:";
pub const RESPONSE_PREFIX: &str = "flow:response:";
pub const TASK_PREFIX: &str = "task:";

pub const METADATA_TYPE: &str = "metadata:type";
pub const METADATA_CONTEXT: &str = "metadata:context";
pub const METADATA_STATE: &str = "metadata:state";

pub fn notification_subject(queue: &QueueName, shard: usize) -> String {
    if shard == 0 {
        format!("notifications/{queue}")
    } else {
        format!("notifications/{queue}/{shard}")
    }
}

pub fn notification_attribute(session_id: &SessionId) -> String {
    format!("{NOTIFY_PREFIX}{session_id}")
}

pub fn state_subject(session_id: &SessionId) -> String {
    format!("{session_id}/state")
}

pub fn flow_subject(session_id: &SessionId) -> String {
    session_id.to_string()
}

pub fn request_attribute(request_id: u64) -> String {
    format!("{REQUEST_PREFIX}{request_id:016X}")
}

pub fn response_prefix(request_id: u64) -> String {
    format!("{RESPONSE_PREFIX}{request_id:016X}:")
}

pub fn response_attribute(request_id: u64, response_id: u64) -> String {
    format!("{RESPONSE_PREFIX}{request_id:016X}:{response_id:016X}")
}

pub fn client_subject(client_id: &ClientId) -> String {
    format!("{client_id}/tasks")
}

pub fn task_attribute(task_id: TaskId) -> String {
    format!("{TASK_PREFIX}{task_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_attributes_sort_numerically() {
        assert!(request_attribute(9) < request_attribute(10));
        assert!(response_attribute(2, 15) < response_attribute(2, 16));
        assert!(response_attribute(2, 1).starts_with(&response_prefix(2)));
        assert!(!response_attribute(20, 1).starts_with(&response_prefix(2)));
    }

    #[test]
    fn shard_zero_is_the_bare_queue_subject() {
        let q = QueueName::worker();
        assert_eq!(notification_subject(&q, 0), "notifications/W");
        assert_eq!(notification_subject(&q, 3), "notifications/W/3");
    }
}
