//! wake_stuck_flow - オペレータ向けの復旧ツール
//!
//! クライアント側のタスクが失われて進まなくなった flow を起こします。
//! 自動スケジューリングのループからは呼ばれません。
//!
//! # 実装
//! - ステータス未着のリクエストのうち、クライアントのキューに対応する
//!   タスクが残っていないものだけを再投入する
//! - 何か再投入したか、すでに完了しているリクエストがあれば通知を書く

use tracing::{info, warn};

use crate::domain::{DEFAULT_TASK_TTL, Message, Notification, Priority, SessionId, TimeRange};
use crate::queue::{QueueError, QueueManager};

/// Re-inject lost client tasks of `session_id` and wake the flow.
///
/// Returns the number of requests put back on client queues.
pub async fn wake_stuck_flow(
    manager: &mut QueueManager,
    session_id: &SessionId,
) -> Result<usize, QueueError> {
    let outstanding = manager
        .fetch_requests_and_responses(session_id, TimeRange::all())
        .await?;

    let mut woken = 0;
    let mut completed = 0;
    let mut priority: Option<Priority> = None;

    for (mut request, responses) in outstanding {
        if responses.last().is_some_and(Message::is_status) {
            completed += 1;
            continue;
        }
        let (Some(client_id), Some(message)) = (request.client_id.clone(), request.request.clone())
        else {
            continue;
        };
        priority.get_or_insert(message.priority);

        if let Some(task_id) = message.task_id
            && manager.query(&client_id, task_id).await?
        {
            continue;
        }

        let mut message = message;
        message.task_ttl = DEFAULT_TASK_TTL;
        let task_id = manager.queue_client_message(&client_id, message.clone())?;
        message.task_id = Some(task_id);

        request.request = Some(message);
        request.transmission_count += 1;
        manager.queue_request(&request)?;

        info!(session_id = %session_id, request_id = request.id, client_id = %client_id, %task_id, "re-injected client task");
        woken += 1;
    }

    if woken == 0 && completed == 0 {
        if manager.has_pending_writes() {
            warn!(session_id = %session_id, "discarding unexpected pending writes");
            manager.discard_pending();
        }
        return Ok(0);
    }

    let now = manager.now();
    manager.queue_notification(
        Notification::new(session_id.clone(), now).with_priority(priority.unwrap_or_default()),
    );
    manager.flush().await?;
    Ok(woken)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::domain::{ClientId, QueueName, RequestState, Status, TaskIdGenerator};
    use crate::impls::MemoryDataStore;
    use crate::ports::{Clock, ManualClock};
    use crate::typed::Value;

    fn manager() -> QueueManager {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let store = Arc::new(MemoryDataStore::new(Arc::clone(&clock)));
        let ids = Arc::new(TaskIdGenerator::new(Arc::clone(&clock)));
        QueueManager::new(store, clock, ids, 1)
    }

    fn client() -> ClientId {
        ClientId::new("C.1000000000000001").unwrap()
    }

    /// Writes a client request without putting it on the client's queue.
    async fn lost_request(manager: &mut QueueManager, session: &SessionId, id: u64) -> Message {
        let mut message = Message::request(session.clone(), id, "Echo", Value::UInt(id));
        message.priority = Priority::HIGH;
        message.task_id = Some(manager.ids().next_id(message.priority));
        let request =
            RequestState::new(id, session.clone(), "Collect").with_client_request(client(), message.clone());
        manager.queue_request(&request).unwrap();
        manager.flush().await.unwrap();
        message
    }

    async fn notified(manager: &QueueManager, session: &SessionId) -> Vec<Notification> {
        manager
            .get_notifications_by_priority(&QueueName::worker())
            .await
            .unwrap()
            .into_values()
            .flatten()
            .filter(|n| &n.session_id == session)
            .collect()
    }

    #[tokio::test]
    async fn lost_tasks_are_reinjected_and_the_flow_is_notified() {
        let mut manager = manager();
        let session = SessionId::new_flow(QueueName::worker());
        let message = lost_request(&mut manager, &session, 1).await;
        let task_id = message.task_id.unwrap();

        let woken = wake_stuck_flow(&mut manager, &session).await.unwrap();

        assert_eq!(woken, 1);
        assert!(manager.query(&client(), task_id).await.unwrap());
        let notifications = notified(&manager, &session).await;
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].priority, Priority::HIGH);

        let (request, _) = manager
            .fetch_requests_and_responses(&session, TimeRange::all())
            .await
            .unwrap()
            .remove(0);
        assert_eq!(request.transmission_count, 2);
    }

    #[tokio::test]
    async fn pending_tasks_are_left_alone() {
        let mut manager = manager();
        let session = SessionId::new_flow(QueueName::worker());
        let message = lost_request(&mut manager, &session, 1).await;
        manager.queue_client_message(&client(), message).unwrap();
        manager.flush().await.unwrap();

        let woken = wake_stuck_flow(&mut manager, &session).await.unwrap();

        assert_eq!(woken, 0);
        assert!(notified(&manager, &session).await.is_empty());
    }

    #[tokio::test]
    async fn completed_requests_only_need_a_notification() {
        let mut manager = manager();
        let session = SessionId::new_flow(QueueName::worker());
        let message = lost_request(&mut manager, &session, 1).await;
        manager
            .queue_response(&message.status(1, &Status::ok()).unwrap())
            .unwrap();
        manager.flush().await.unwrap();

        let woken = wake_stuck_flow(&mut manager, &session).await.unwrap();

        assert_eq!(woken, 0);
        assert!(!manager.query(&client(), message.task_id.unwrap()).await.unwrap());
        assert_eq!(notified(&manager, &session).await.len(), 1);
    }
}
