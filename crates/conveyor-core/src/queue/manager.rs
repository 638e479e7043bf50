//! QueueManager - スケジューラとバックエンドストアの仲介役
//!
//! リクエスト・レスポンス・通知・クライアントキューの読み書きをまとめて扱います。
//!
//! # 設計原則
//! - 書き込みはバッファして `flush()` でまとめて適用する。適用順は
//!   リクエスト → レスポンス → クライアントメッセージ → 削除 → 通知。
//!   通知を最後に書くので、通知を見たワーカーは必ずデータも読める
//! - 通知の削除だけは即時に行う（消費した範囲を確実に消すため）
//! - `freeze_timestamp()` で 1 回のスキャン中の「現在時刻」を固定し、
//!   スキャン開始後に届いた通知を誤って消さないようにする
//! - ワーカーのタスクごとに `copy()` した独立インスタンスを使う

use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use super::QueueError;
use super::keys;
use crate::domain::{
    Bucket, ClientId, Message, Notification, Priority, QueueName, RequestState, SessionId, TaskId,
    TaskIdGenerator, TimeRange, Timestamp,
};
use crate::ports::{Cell, Clock, DataStore, Mutation};
use crate::typed::codec::{from_bytes, to_bytes};

/// Pending notifications of one queue, keyed by bucket.
pub type NotificationsByBucket = BTreeMap<Bucket, Vec<Notification>>;

#[derive(Default)]
struct WriteBuffer {
    requests: Vec<(String, Mutation)>,
    responses: Vec<(String, Mutation)>,
    client_messages: Vec<(String, Mutation)>,
    deletions: Vec<(String, Mutation)>,
    notifications: Vec<Notification>,
}

impl WriteBuffer {
    fn is_empty(&self) -> bool {
        self.requests.is_empty()
            && self.responses.is_empty()
            && self.client_messages.is_empty()
            && self.deletions.is_empty()
            && self.notifications.is_empty()
    }

    fn len(&self) -> usize {
        self.requests.len()
            + self.responses.len()
            + self.client_messages.len()
            + self.deletions.len()
            + self.notifications.len()
    }
}

pub struct QueueManager {
    store: Arc<dyn DataStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<TaskIdGenerator>,
    shards: usize,
    shard_cursor: Arc<AtomicUsize>,
    frozen: Option<Timestamp>,
    buffer: WriteBuffer,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn DataStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<TaskIdGenerator>,
        shards: usize,
    ) -> Self {
        Self {
            store,
            clock,
            ids,
            shards: shards.max(1),
            shard_cursor: Arc::new(AtomicUsize::new(0)),
            frozen: None,
            buffer: WriteBuffer::default(),
        }
    }

    /// An independent manager over the same store: empty buffers, not frozen.
    pub fn copy(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            ids: Arc::clone(&self.ids),
            shards: self.shards,
            shard_cursor: Arc::clone(&self.shard_cursor),
            frozen: None,
            buffer: WriteBuffer::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ids(&self) -> &Arc<TaskIdGenerator> {
        &self.ids
    }

    /// The frozen timestamp if one is held, the clock otherwise.
    pub fn now(&self) -> Timestamp {
        self.frozen.unwrap_or_else(|| self.clock.timestamp())
    }

    pub fn freeze_timestamp(&mut self) -> Timestamp {
        let now = self.clock.timestamp();
        self.frozen = Some(now);
        now
    }

    pub fn unfreeze_timestamp(&mut self) {
        self.frozen = None;
    }

    pub fn frozen_timestamp(&self) -> Option<Timestamp> {
        self.frozen
    }

    /// Freeze for the lifetime of the returned guard.
    pub fn frozen(&mut self) -> FrozenTimestamp<'_> {
        self.freeze_timestamp();
        FrozenTimestamp { manager: self }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Drop buffered writes without applying them; returns how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer = WriteBuffer::default();
        dropped
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Notifications visible now on the next shard of `queue`.
    pub async fn get_notifications_by_priority(
        &self,
        queue: &QueueName,
    ) -> Result<NotificationsByBucket, QueueError> {
        let shard = self.shard_cursor.fetch_add(1, Ordering::Relaxed) % self.shards;
        let mut latest = HashMap::new();
        self.read_notifications(&keys::notification_subject(queue, shard), &mut latest)
            .await?;
        Ok(sort_by_bucket(latest.into_values()))
    }

    pub async fn get_notifications_by_priority_for_all_shards(
        &self,
        queue: &QueueName,
    ) -> Result<NotificationsByBucket, QueueError> {
        let mut latest = HashMap::new();
        for shard in 0..self.shards {
            self.read_notifications(&keys::notification_subject(queue, shard), &mut latest)
                .await?;
        }
        Ok(sort_by_bucket(latest.into_values()))
    }

    /// Keep one notification per session: the one queued last.
    async fn read_notifications(
        &self,
        subject: &str,
        latest: &mut HashMap<SessionId, Notification>,
    ) -> Result<(), QueueError> {
        let cells = self
            .store
            .scan(subject, keys::NOTIFY_PREFIX, TimeRange::up_to(self.now()))
            .await?;

        for cell in cells {
            let mut notification: Notification = match from_bytes(&cell.value) {
                Ok(n) => n,
                Err(err) => {
                    warn!(subject, attribute = %cell.attribute, error = %err, "dropping undecodable notification");
                    self.store
                        .apply(
                            subject,
                            vec![Mutation::Delete {
                                attribute: cell.attribute,
                                range: TimeRange::exact(cell.timestamp),
                            }],
                        )
                        .await?;
                    continue;
                }
            };
            notification.timestamp = cell.timestamp;

            let newer = match latest.get(&notification.session_id) {
                None => true,
                Some(existing) => {
                    (notification.first_queued, notification.last_status)
                        > (existing.first_queued, existing.last_status)
                }
            };
            if newer {
                latest.insert(notification.session_id.clone(), notification);
            }
        }
        Ok(())
    }

    /// Buffer a notification; it becomes visible at `notification.timestamp`.
    pub fn queue_notification(&mut self, notification: Notification) {
        self.buffer.notifications.push(notification);
    }

    /// Signal that `session_id` has work. Written immediately.
    pub async fn enqueue_flow_work(
        &mut self,
        session_id: &SessionId,
        priority: Priority,
    ) -> Result<(), QueueError> {
        let now = self.now();
        self.queue_notification(Notification::new(session_id.clone(), now).with_priority(priority));
        self.flush().await
    }

    /// Remove the session's notifications inside `range` on every shard.
    pub async fn delete_notification(
        &self,
        session_id: &SessionId,
        range: TimeRange,
    ) -> Result<(), QueueError> {
        let attribute = keys::notification_attribute(session_id);
        for shard in 0..self.shards {
            self.store
                .apply(
                    &keys::notification_subject(session_id.queue(), shard),
                    vec![Mutation::Delete {
                        attribute: attribute.clone(),
                        range,
                    }],
                )
                .await?;
        }
        Ok(())
    }

    pub async fn delete_notifications(&self, session_ids: &[SessionId]) -> Result<(), QueueError> {
        for session_id in session_ids {
            self.delete_notification(session_id, TimeRange::all()).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Requests and responses
    // ------------------------------------------------------------------

    pub fn queue_request(&mut self, request: &RequestState) -> Result<(), QueueError> {
        let cell = Cell::new(
            keys::request_attribute(request.id),
            self.now(),
            to_bytes(request)?,
        );
        self.buffer
            .requests
            .push((keys::state_subject(&request.session_id), Mutation::Replace(cell)));
        Ok(())
    }

    pub fn queue_response(&mut self, response: &Message) -> Result<(), QueueError> {
        let cell = Cell::new(
            keys::response_attribute(response.request_id, response.response_id),
            self.now(),
            to_bytes(response)?,
        );
        self.buffer
            .responses
            .push((keys::state_subject(&response.session_id), Mutation::Insert(cell)));
        Ok(())
    }

    /// Store responses arriving from clients and notify their sessions.
    ///
    /// A status closes a request, so it notifies with `last_status` set.
    /// Well-known sessions are notified for every message.
    pub fn receive_responses(&mut self, messages: &[Message]) -> Result<(), QueueError> {
        let now = self.now();
        for message in messages {
            self.queue_response(message)?;
            if message.is_status() {
                self.queue_notification(
                    Notification::new(message.session_id.clone(), now)
                        .with_priority(message.priority)
                        .with_last_status(message.request_id),
                );
            } else if message.session_id.is_well_known() {
                self.queue_notification(
                    Notification::new(message.session_id.clone(), now)
                        .with_priority(message.priority),
                );
            }
        }
        Ok(())
    }

    /// Remove a request and all of its responses.
    pub fn delete_request(&mut self, session_id: &SessionId, request_id: u64) {
        let subject = keys::state_subject(session_id);
        self.buffer.deletions.push((
            subject.clone(),
            Mutation::Delete {
                attribute: keys::request_attribute(request_id),
                range: TimeRange::all(),
            },
        ));
        self.buffer.deletions.push((
            subject,
            Mutation::DeletePrefix {
                prefix: keys::response_prefix(request_id),
                range: TimeRange::all(),
            },
        ));
    }

    /// Remove every outstanding request and response of a session.
    pub fn destroy_flow_states(&mut self, session_id: &SessionId) {
        self.buffer.deletions.push((
            keys::state_subject(session_id),
            Mutation::DeletePrefix {
                prefix: keys::FLOW_PREFIX.to_string(),
                range: TimeRange::all(),
            },
        ));
    }

    /// Outstanding requests with their responses, ordered by request id.
    pub async fn fetch_requests_and_responses(
        &self,
        session_id: &SessionId,
        range: TimeRange,
    ) -> Result<Vec<(RequestState, Vec<Message>)>, QueueError> {
        let subject = keys::state_subject(session_id);
        let cells = self.store.scan(&subject, keys::FLOW_PREFIX, range).await?;

        let mut requests: BTreeMap<u64, RequestState> = BTreeMap::new();
        let mut responses: HashMap<u64, Vec<Message>> = HashMap::new();
        for cell in cells {
            if cell.attribute.starts_with(keys::REQUEST_PREFIX) {
                let request: RequestState = decode_cell(&subject, &cell)?;
                requests.insert(request.id, request);
            } else if cell.attribute.starts_with(keys::RESPONSE_PREFIX) {
                let response: Message = decode_cell(&subject, &cell)?;
                responses.entry(response.request_id).or_default().push(response);
            }
        }

        Ok(requests
            .into_values()
            .map(|request| {
                let mut found = responses.remove(&request.id).unwrap_or_default();
                found.sort_by_key(|m| m.response_id);
                (request, found)
            })
            .collect())
    }

    /// Requests whose responses include a status, with those responses.
    pub async fn fetch_completed_responses(
        &self,
        session_id: &SessionId,
        range: TimeRange,
    ) -> Result<Vec<(RequestState, Vec<Message>)>, QueueError> {
        let all = self.fetch_requests_and_responses(session_id, range).await?;
        Ok(all
            .into_iter()
            .filter(|(_, responses)| responses.iter().any(Message::is_status))
            .collect())
    }

    pub async fn fetch_completed_requests(
        &self,
        session_id: &SessionId,
        range: TimeRange,
    ) -> Result<Vec<RequestState>, QueueError> {
        Ok(self
            .fetch_completed_responses(session_id, range)
            .await?
            .into_iter()
            .map(|(request, _)| request)
            .collect())
    }

    /// Atomically pop every pending message of a (well-known) session.
    pub async fn fetch_and_remove_requests_and_responses(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<Message>, QueueError> {
        let subject = keys::state_subject(session_id);
        let cells = self
            .store
            .pop(&subject, keys::FLOW_PREFIX, TimeRange::all())
            .await?;
        let mut messages = Vec::new();
        for cell in cells {
            if cell.attribute.starts_with(keys::RESPONSE_PREFIX) {
                messages.push(decode_cell::<Message>(&subject, &cell)?);
            }
        }
        messages.sort_by_key(|m| (m.request_id, m.response_id));
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Client queues
    // ------------------------------------------------------------------

    /// Put a task on a client's inbound queue, assigning a task id if needed.
    pub fn queue_client_message(
        &mut self,
        client_id: &ClientId,
        mut message: Message,
    ) -> Result<TaskId, QueueError> {
        let task_id = match message.task_id {
            Some(id) => id,
            None => {
                let id = self.ids.next_id(message.priority);
                message.task_id = Some(id);
                id
            }
        };
        let cell = Cell::new(keys::task_attribute(task_id), self.now(), to_bytes(&message)?);
        self.buffer
            .client_messages
            .push((keys::client_subject(client_id), Mutation::Replace(cell)));
        Ok(task_id)
    }

    pub fn dequeue_client_request(&mut self, client_id: &ClientId, task_id: TaskId) {
        self.buffer.deletions.push((
            keys::client_subject(client_id),
            Mutation::Delete {
                attribute: keys::task_attribute(task_id),
                range: TimeRange::all(),
            },
        ));
    }

    /// Is `task_id` still outstanding on the client's queue?
    pub async fn query(&self, client_id: &ClientId, task_id: TaskId) -> Result<bool, QueueError> {
        let cells = self
            .store
            .scan(
                &keys::client_subject(client_id),
                &keys::task_attribute(task_id),
                TimeRange::all(),
            )
            .await?;
        Ok(!cells.is_empty())
    }

    /// Lease up to `limit` visible tasks for a client, highest priority first.
    ///
    /// Leased tasks are hidden for `lease`. Each lease uses up one unit of
    /// `task_ttl`; tasks that run out are dropped.
    pub async fn query_and_own(
        &self,
        client_id: &ClientId,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Message>, QueueError> {
        let subject = keys::client_subject(client_id);
        let now = self.now();
        let cells = self
            .store
            .scan(&subject, keys::TASK_PREFIX, TimeRange::up_to(now))
            .await?;

        let mut owned = Vec::new();
        let mut mutations = Vec::new();
        for cell in cells.into_iter().take(limit) {
            let mut message: Message = decode_cell(&subject, &cell)?;
            if message.task_ttl == 0 {
                debug!(client_id = %client_id, attribute = %cell.attribute, "client task expired");
                mutations.push(Mutation::Delete {
                    attribute: cell.attribute,
                    range: TimeRange::all(),
                });
                continue;
            }
            message.task_ttl -= 1;
            mutations.push(Mutation::Replace(Cell::new(
                cell.attribute,
                now + lease,
                to_bytes(&message)?,
            )));
            owned.push(message);
        }
        if !mutations.is_empty() {
            self.store.apply(&subject, mutations).await?;
        }
        Ok(owned)
    }

    // ------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------

    /// Apply buffered writes. Notifications go last.
    pub async fn flush(&mut self) -> Result<(), QueueError> {
        let buffer = std::mem::take(&mut self.buffer);
        let groups = [
            buffer.requests,
            buffer.responses,
            buffer.client_messages,
            buffer.deletions,
        ];
        for group in groups {
            for (subject, mutations) in group_by_subject(group) {
                self.store.apply(&subject, mutations).await?;
            }
        }

        let mut notifications: BTreeMap<String, Vec<Mutation>> = BTreeMap::new();
        for notification in buffer.notifications {
            let shard = if self.shards > 1 {
                rand::thread_rng().gen_range(0..self.shards)
            } else {
                0
            };
            let cell = Cell::new(
                keys::notification_attribute(&notification.session_id),
                notification.timestamp,
                to_bytes(&notification)?,
            );
            notifications
                .entry(keys::notification_subject(notification.session_id.queue(), shard))
                .or_default()
                .push(Mutation::Insert(cell));
        }
        for (subject, mutations) in notifications {
            self.store.apply(&subject, mutations).await?;
        }
        Ok(())
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        if self.has_pending_writes() {
            warn!(
                pending = self.buffer.len(),
                "queue manager dropped with unflushed writes"
            );
        }
    }
}

/// Scoped frozen timestamp; unfreezes on drop.
pub struct FrozenTimestamp<'a> {
    manager: &'a mut QueueManager,
}

impl Deref for FrozenTimestamp<'_> {
    type Target = QueueManager;

    fn deref(&self) -> &Self::Target {
        self.manager
    }
}

impl DerefMut for FrozenTimestamp<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.manager
    }
}

impl Drop for FrozenTimestamp<'_> {
    fn drop(&mut self) {
        self.manager.unfreeze_timestamp();
    }
}

fn sort_by_bucket(notifications: impl IntoIterator<Item = Notification>) -> NotificationsByBucket {
    let mut buckets = NotificationsByBucket::new();
    for notification in notifications {
        let bucket = if notification.in_progress {
            Bucket::Stuck
        } else {
            Bucket::Priority(notification.priority)
        };
        buckets.entry(bucket).or_default().push(notification);
    }
    let mut rng = rand::thread_rng();
    for (bucket, notifications) in buckets.iter_mut() {
        notifications.shuffle(&mut rng);
        debug!(%bucket, count = notifications.len(), "notification bucket");
    }
    buckets
}

fn group_by_subject(writes: Vec<(String, Mutation)>) -> Vec<(String, Vec<Mutation>)> {
    let mut grouped: Vec<(String, Vec<Mutation>)> = Vec::new();
    for (subject, mutation) in writes {
        match grouped.last_mut() {
            Some((last, mutations)) if *last == subject => mutations.push(mutation),
            _ => grouped.push((subject, vec![mutation])),
        }
    }
    grouped
}

fn decode_cell<T: serde::de::DeserializeOwned>(subject: &str, cell: &Cell) -> Result<T, QueueError> {
    from_bytes(&cell.value).map_err(|source| QueueError::Corrupt {
        subject: subject.to_string(),
        attribute: cell.attribute.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{QueueName, Status};
    use crate::impls::MemoryDataStore;
    use crate::ports::ManualClock;
    use crate::typed::Value;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        clock: ManualClock,
        store: Arc<MemoryDataStore>,
        manager: QueueManager,
    }

    fn fixture_with_shards(shards: usize) -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let clock_port: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryDataStore::new(Arc::clone(&clock_port)));
        let ids = Arc::new(TaskIdGenerator::new(Arc::clone(&clock_port)));
        let manager = QueueManager::new(store.clone(), clock_port, ids, shards);
        Fixture {
            clock,
            store,
            manager,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_shards(1)
    }

    fn session() -> SessionId {
        SessionId::new_flow(QueueName::worker())
    }

    fn client() -> ClientId {
        ClientId::new("C.1000000000000001").unwrap()
    }

    fn all_notifications(by_bucket: &NotificationsByBucket) -> Vec<&Notification> {
        by_bucket.values().flatten().collect()
    }

    #[tokio::test]
    async fn notifications_are_grouped_by_priority_and_stuck() {
        let mut f = fixture();
        let (a, b, c) = (session(), session(), session());
        let now = f.manager.now();
        f.manager
            .queue_notification(Notification::new(a.clone(), now).with_priority(Priority::HIGH));
        f.manager
            .queue_notification(Notification::new(b.clone(), now).with_priority(Priority::LOW));
        f.manager
            .queue_notification(Notification::new(c.clone(), now).in_progress());
        f.manager.flush().await.unwrap();

        let by_bucket = f
            .manager
            .get_notifications_by_priority(&QueueName::worker())
            .await
            .unwrap();

        assert_eq!(by_bucket[&Bucket::Priority(Priority::HIGH)][0].session_id, a);
        assert_eq!(by_bucket[&Bucket::Priority(Priority::LOW)][0].session_id, b);
        assert_eq!(by_bucket[&Bucket::Stuck][0].session_id, c);
    }

    #[tokio::test]
    async fn future_notifications_stay_hidden_until_due() {
        let mut f = fixture();
        let s = session();
        let due = f.manager.now() + Duration::from_secs(60);
        f.manager.queue_notification(Notification::new(s.clone(), due).in_progress());
        f.manager.flush().await.unwrap();

        let queue = QueueName::worker();
        assert!(f.manager.get_notifications_by_priority(&queue).await.unwrap().is_empty());

        f.clock.advance(Duration::from_secs(61));
        let by_bucket = f.manager.get_notifications_by_priority(&queue).await.unwrap();
        assert_eq!(by_bucket[&Bucket::Stuck][0].timestamp, due);
    }

    #[tokio::test]
    async fn one_notification_per_session_survives_the_scan() {
        let mut f = fixture();
        let s = session();
        let t1 = f.manager.now();
        f.manager.queue_notification(Notification::new(s.clone(), t1).with_last_status(1));
        f.manager.flush().await.unwrap();
        f.clock.advance(Duration::from_millis(5));
        let t2 = f.manager.now();
        f.manager.queue_notification(Notification::new(s.clone(), t2).with_last_status(2));
        f.manager.flush().await.unwrap();

        let by_bucket = f
            .manager
            .get_notifications_by_priority(&QueueName::worker())
            .await
            .unwrap();
        let all = all_notifications(&by_bucket);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].timestamp, t2);
        assert_eq!(all[0].last_status, Some(2));
    }

    #[tokio::test]
    async fn frozen_scan_ignores_later_notifications() {
        let mut f = fixture();
        let (early, late) = (session(), session());
        f.manager.enqueue_flow_work(&early, Priority::MEDIUM).await.unwrap();

        let queue = QueueName::worker();
        let frozen = f.manager.frozen();
        let scan_at = frozen.now();

        f.clock.advance(Duration::from_secs(1));
        let mut producer = frozen.copy();
        producer.enqueue_flow_work(&late, Priority::MEDIUM).await.unwrap();

        let by_bucket = frozen.get_notifications_by_priority(&queue).await.unwrap();
        let seen: Vec<&SessionId> = all_notifications(&by_bucket)
            .into_iter()
            .map(|n| &n.session_id)
            .collect();
        assert_eq!(seen, vec![&early]);
        assert_eq!(frozen.now(), scan_at);
        drop(frozen);

        assert!(f.manager.frozen_timestamp().is_none());
        let by_bucket = f.manager.get_notifications_by_priority(&queue).await.unwrap();
        assert_eq!(all_notifications(&by_bucket).len(), 2);
    }

    #[tokio::test]
    async fn selective_delete_keeps_newer_notification() {
        let mut f = fixture();
        let s = session();
        let t1 = f.manager.now();
        f.manager.enqueue_flow_work(&s, Priority::MEDIUM).await.unwrap();
        f.clock.advance(Duration::from_secs(1));
        let t2 = f.manager.now();
        f.manager.enqueue_flow_work(&s, Priority::MEDIUM).await.unwrap();

        f.manager.delete_notification(&s, TimeRange::up_to(t1)).await.unwrap();

        let cells = f.store.cells("notifications/W").await;
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].timestamp, t2);

        f.manager.delete_notification(&s, TimeRange::all()).await.unwrap();
        assert!(f.store.cells("notifications/W").await.is_empty());
    }

    #[tokio::test]
    async fn exact_delete_clears_only_the_kill_deadline() {
        let mut f = fixture();
        let s = session();
        let now = f.manager.now();
        let deadline = now + Duration::from_secs(3600);
        f.manager.queue_notification(Notification::new(s.clone(), now));
        f.manager.queue_notification(Notification::new(s.clone(), deadline).in_progress());
        f.manager.flush().await.unwrap();

        f.manager.delete_notification(&s, TimeRange::exact(deadline)).await.unwrap();

        let cells = f.store.cells("notifications/W").await;
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].timestamp, now);
    }

    #[tokio::test]
    async fn sharded_reads_rotate_and_deletes_cover_every_shard() {
        let mut f = fixture_with_shards(3);
        let sessions: Vec<SessionId> = (0..12).map(|_| session()).collect();
        for s in &sessions {
            f.manager.enqueue_flow_work(s, Priority::MEDIUM).await.unwrap();
        }
        let queue = QueueName::worker();

        let all = f
            .manager
            .get_notifications_by_priority_for_all_shards(&queue)
            .await
            .unwrap();
        assert_eq!(all_notifications(&all).len(), 12);

        let mut seen = 0;
        for _ in 0..3 {
            seen += all_notifications(&f.manager.get_notifications_by_priority(&queue).await.unwrap()).len();
        }
        assert_eq!(seen, 12);

        f.manager.delete_notifications(&sessions).await.unwrap();
        let all = f
            .manager
            .get_notifications_by_priority_for_all_shards(&queue)
            .await
            .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn requests_and_responses_are_fetched_in_order() {
        let mut f = fixture();
        let s = session();
        for id in [2u64, 1, 3] {
            f.manager.queue_request(&RequestState::new(id, s.clone(), "Next")).unwrap();
        }
        let request = Message::request(s.clone(), 1, "Echo", Value::Null);
        f.manager
            .receive_responses(&[
                request.response(2, Value::from("b")),
                request.response(1, Value::from("a")),
                request.status(3, &Status::ok()).unwrap(),
            ])
            .unwrap();
        f.manager.flush().await.unwrap();

        let fetched = f
            .manager
            .fetch_requests_and_responses(&s, TimeRange::all())
            .await
            .unwrap();
        let ids: Vec<u64> = fetched.iter().map(|(r, _)| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let response_ids: Vec<u64> = fetched[0].1.iter().map(|m| m.response_id).collect();
        assert_eq!(response_ids, vec![1, 2, 3]);

        let completed = f
            .manager
            .fetch_completed_requests(&s, TimeRange::all())
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, 1);

        let by_bucket = f
            .manager
            .get_notifications_by_priority(&QueueName::worker())
            .await
            .unwrap();
        assert_eq!(all_notifications(&by_bucket)[0].last_status, Some(1));
    }

    #[tokio::test]
    async fn delete_request_removes_its_responses_only() {
        let mut f = fixture();
        let s = session();
        for id in [1u64, 2] {
            f.manager.queue_request(&RequestState::new(id, s.clone(), "Next")).unwrap();
            let request = Message::request(s.clone(), id, "Echo", Value::Null);
            f.manager.queue_response(&request.status(1, &Status::ok()).unwrap()).unwrap();
        }
        f.manager.flush().await.unwrap();

        f.manager.delete_request(&s, 1);
        f.manager.flush().await.unwrap();

        let left = f
            .manager
            .fetch_requests_and_responses(&s, TimeRange::all())
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].0.id, 2);
        assert_eq!(left[0].1.len(), 1);

        f.manager.destroy_flow_states(&s);
        f.manager.flush().await.unwrap();
        assert!(f.store.cells(&keys::state_subject(&s)).await.is_empty());
    }

    #[tokio::test]
    async fn well_known_responses_are_popped_without_a_lease() {
        let mut f = fixture();
        let s = SessionId::well_known(QueueName::worker(), "Stats").unwrap();
        let first = Message::request(s.clone(), 0, "", Value::Null);
        f.manager
            .receive_responses(&[first.response(2, Value::Int(2)), first.response(1, Value::Int(1))])
            .unwrap();
        f.manager.flush().await.unwrap();

        let by_bucket = f
            .manager
            .get_notifications_by_priority(&QueueName::worker())
            .await
            .unwrap();
        assert_eq!(all_notifications(&by_bucket).len(), 1);

        let popped = f.manager.fetch_and_remove_requests_and_responses(&s).await.unwrap();
        let payloads: Vec<&Value> = popped.iter().map(|m| &m.payload).collect();
        assert_eq!(payloads, vec![&Value::Int(1), &Value::Int(2)]);
        assert!(f.manager.fetch_and_remove_requests_and_responses(&s).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn client_queue_leases_highest_priority_first() {
        let mut f = fixture();
        let s = session();
        let c = client();
        let mut low = Message::request(s.clone(), 1, "Low", Value::Null);
        low.priority = Priority::LOW;
        let mut high = Message::request(s.clone(), 2, "High", Value::Null);
        high.priority = Priority::HIGH;
        let low_id = f.manager.queue_client_message(&c, low).unwrap();
        let high_id = f.manager.queue_client_message(&c, high).unwrap();
        f.manager.flush().await.unwrap();

        assert!(f.manager.query(&c, low_id).await.unwrap());
        let owned = f.manager.query_and_own(&c, Duration::from_secs(60), 10).await.unwrap();
        let names: Vec<&str> = owned.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["High", "Low"]);

        // Leased tasks are hidden until the lease runs out.
        assert!(f.manager.query_and_own(&c, Duration::from_secs(60), 10).await.unwrap().is_empty());
        f.clock.advance(Duration::from_secs(61));
        assert_eq!(f.manager.query_and_own(&c, Duration::from_secs(60), 1).await.unwrap().len(), 1);

        f.manager.dequeue_client_request(&c, high_id);
        f.manager.flush().await.unwrap();
        assert!(!f.manager.query(&c, high_id).await.unwrap());
        assert!(f.manager.query(&c, low_id).await.unwrap());
    }

    #[tokio::test]
    async fn client_tasks_expire_after_their_ttl() {
        let mut f = fixture();
        let c = client();
        let mut message = Message::request(session(), 1, "Once", Value::Null);
        message.task_ttl = 1;
        let task_id = f.manager.queue_client_message(&c, message).unwrap();
        f.manager.flush().await.unwrap();

        assert_eq!(f.manager.query_and_own(&c, Duration::ZERO, 10).await.unwrap().len(), 1);
        f.clock.advance(Duration::from_secs(1));
        assert!(f.manager.query_and_own(&c, Duration::ZERO, 10).await.unwrap().is_empty());
        assert!(!f.manager.query(&c, task_id).await.unwrap());
    }

    #[tokio::test]
    async fn copies_do_not_share_buffers_or_frozen_time() {
        let mut f = fixture();
        f.manager.freeze_timestamp();
        let mut copy = f.manager.copy();
        assert!(copy.frozen_timestamp().is_none());

        copy.queue_notification(Notification::new(session(), copy.now()));
        assert!(copy.has_pending_writes());
        assert!(!f.manager.has_pending_writes());
        copy.flush().await.unwrap();
        assert!(!copy.has_pending_writes());
    }
}
