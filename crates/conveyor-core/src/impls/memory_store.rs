//! In-memory DataStore implementation.
//!
//! テストとデモ用の実装です。すべての状態を 1 つの `tokio::sync::Mutex` に置き、
//! 各操作はロック内で完結します（ロックを跨いで await しない）。
//! lease の期限判定には注入された `Clock` を使います。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{TimeRange, Timestamp};
use crate::ports::{Cell, Clock, DataStore, Lease, Mutation, StoreError};

type Row = BTreeMap<(String, Timestamp), Vec<u8>>;

#[derive(Debug, Clone)]
struct LeaseRecord {
    owner: String,
    token: u64,
    expires_at: Timestamp,
}

#[derive(Default)]
struct MemoryState {
    rows: HashMap<String, Row>,
    leases: HashMap<String, LeaseRecord>,
    next_token: u64,
    lease_grants: HashMap<String, usize>,
}

impl MemoryState {
    fn apply(&mut self, subject: &str, mutation: Mutation) {
        let row = self.rows.entry(subject.to_string()).or_default();
        match mutation {
            Mutation::Insert(cell) => {
                row.insert((cell.attribute, cell.timestamp), cell.value);
            }
            Mutation::Replace(cell) => {
                remove_matching(row, &cell.attribute, TimeRange::all(), true);
                row.insert((cell.attribute, cell.timestamp), cell.value);
            }
            Mutation::Delete { attribute, range } => {
                remove_matching(row, &attribute, range, true);
            }
            Mutation::DeletePrefix { prefix, range } => {
                remove_matching(row, &prefix, range, false);
            }
        }
        if row.is_empty() {
            self.rows.remove(subject);
        }
    }

    fn scan(&self, subject: &str, prefix: &str, range: TimeRange) -> Vec<Cell> {
        let Some(row) = self.rows.get(subject) else {
            return Vec::new();
        };
        row.range((prefix.to_string(), Timestamp::MIN)..)
            .take_while(|((attribute, _), _)| attribute.starts_with(prefix))
            .filter(|((_, ts), _)| range.contains(*ts))
            .map(|((attribute, ts), value)| Cell::new(attribute.clone(), *ts, value.clone()))
            .collect()
    }
}

/// Remove cells of `key` (an exact attribute, or a prefix) inside `range`.
fn remove_matching(row: &mut Row, key: &str, range: TimeRange, exact: bool) {
    let doomed: Vec<(String, Timestamp)> = row
        .range((key.to_string(), Timestamp::MIN)..)
        .map(|(k, _)| k)
        .take_while(|(attribute, _)| attribute.starts_with(key))
        .filter(|(attribute, ts)| (!exact || attribute == key) && range.contains(*ts))
        .cloned()
        .collect();
    for k in doomed {
        row.remove(&k);
    }
}

pub struct MemoryDataStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl MemoryDataStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }

    /// How many times a lease on `subject` has been granted.
    pub async fn lease_grants(&self, subject: &str) -> usize {
        let state = self.state.lock().await;
        state.lease_grants.get(subject).copied().unwrap_or(0)
    }

    /// Every cell stored under `subject`.
    pub async fn cells(&self, subject: &str) -> Vec<Cell> {
        let state = self.state.lock().await;
        state.scan(subject, "", TimeRange::all())
    }

    pub async fn subjects(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut subjects: Vec<String> = state.rows.keys().cloned().collect();
        subjects.sort();
        subjects
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn apply(&self, subject: &str, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for mutation in mutations {
            state.apply(subject, mutation);
        }
        Ok(())
    }

    async fn scan(
        &self,
        subject: &str,
        prefix: &str,
        range: TimeRange,
    ) -> Result<Vec<Cell>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.scan(subject, prefix, range))
    }

    async fn pop(
        &self,
        subject: &str,
        prefix: &str,
        range: TimeRange,
    ) -> Result<Vec<Cell>, StoreError> {
        let mut state = self.state.lock().await;
        let cells = state.scan(subject, prefix, range);
        state.apply(
            subject,
            Mutation::DeletePrefix {
                prefix: prefix.to_string(),
                range,
            },
        );
        Ok(cells)
    }

    async fn acquire_lease(
        &self,
        subject: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        let now = self.clock.timestamp();
        let mut state = self.state.lock().await;
        if let Some(existing) = state.leases.get(subject)
            && existing.expires_at > now
        {
            return Err(StoreError::LeaseHeld {
                subject: subject.to_string(),
                owner: existing.owner.clone(),
                expires_at: existing.expires_at,
            });
        }

        state.next_token += 1;
        let record = LeaseRecord {
            owner: owner.to_string(),
            token: state.next_token,
            expires_at: now + ttl,
        };
        state.leases.insert(subject.to_string(), record.clone());
        *state.lease_grants.entry(subject.to_string()).or_default() += 1;
        Ok(Lease {
            subject: subject.to_string(),
            owner: record.owner,
            token: record.token,
            expires_at: record.expires_at,
        })
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StoreError> {
        let now = self.clock.timestamp();
        let mut state = self.state.lock().await;
        match state.leases.get_mut(&lease.subject) {
            Some(record) if record.token == lease.token => {
                record.expires_at = now + ttl;
                Ok(Lease {
                    expires_at: record.expires_at,
                    ..lease.clone()
                })
            }
            _ => Err(StoreError::LeaseLost {
                subject: lease.subject.clone(),
            }),
        }
    }

    async fn release_lease(&self, lease: Lease) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.leases.get(&lease.subject) {
            Some(record) if record.token == lease.token => {
                state.leases.remove(&lease.subject);
                Ok(())
            }
            _ => Err(StoreError::LeaseLost {
                subject: lease.subject,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use chrono::{TimeZone, Utc};

    fn store() -> (MemoryDataStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        (MemoryDataStore::new(Arc::new(clock.clone())), clock)
    }

    fn ts(micros: i64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    #[tokio::test]
    async fn scan_filters_by_prefix_and_range() {
        let (store, _) = store();
        store
            .apply(
                "s",
                vec![
                    Mutation::Insert(Cell::new("notify:a", ts(10), vec![1])),
                    Mutation::Insert(Cell::new("notify:a", ts(20), vec![2])),
                    Mutation::Insert(Cell::new("notify:b", ts(15), vec![3])),
                    Mutation::Insert(Cell::new("other", ts(5), vec![4])),
                ],
            )
            .await
            .unwrap();

        let cells = store.scan("s", "notify:", TimeRange::up_to(ts(15))).await.unwrap();
        let seen: Vec<(&str, i64)> = cells
            .iter()
            .map(|c| (c.attribute.as_str(), c.timestamp.as_micros()))
            .collect();
        assert_eq!(seen, vec![("notify:a", 10), ("notify:b", 15)]);
    }

    #[tokio::test]
    async fn ranged_delete_keeps_newer_versions() {
        let (store, _) = store();
        store
            .apply(
                "s",
                vec![
                    Mutation::Insert(Cell::new("notify:a", ts(10), vec![])),
                    Mutation::Insert(Cell::new("notify:a", ts(20), vec![])),
                    Mutation::Insert(Cell::new("notify:ab", ts(10), vec![])),
                ],
            )
            .await
            .unwrap();

        store
            .apply(
                "s",
                vec![Mutation::Delete {
                    attribute: "notify:a".into(),
                    range: TimeRange::up_to(ts(10)),
                }],
            )
            .await
            .unwrap();

        let left: Vec<(String, i64)> = store
            .cells("s")
            .await
            .into_iter()
            .map(|c| (c.attribute, c.timestamp.as_micros()))
            .collect();
        assert_eq!(
            left,
            vec![("notify:a".to_string(), 20), ("notify:ab".to_string(), 10)]
        );
    }

    #[tokio::test]
    async fn replace_drops_other_versions() {
        let (store, _) = store();
        store
            .apply(
                "s",
                vec![
                    Mutation::Insert(Cell::new("k", ts(1), vec![1])),
                    Mutation::Replace(Cell::new("k", ts(2), vec![2])),
                ],
            )
            .await
            .unwrap();
        assert_eq!(store.cells("s").await, vec![Cell::new("k", ts(2), vec![2])]);
    }

    #[tokio::test]
    async fn pop_returns_and_clears() {
        let (store, _) = store();
        store
            .apply(
                "s",
                vec![
                    Mutation::Insert(Cell::new("flow:response:1", ts(1), vec![1])),
                    Mutation::Insert(Cell::new("flow:response:2", ts(2), vec![2])),
                ],
            )
            .await
            .unwrap();

        let popped = store.pop("s", "flow:response:", TimeRange::all()).await.unwrap();
        assert_eq!(popped.len(), 2);
        assert!(store.cells("s").await.is_empty());
        assert!(store.subjects().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_leases_are_mutually_exclusive() {
        let (store, _) = store();
        let ttl = Duration::from_secs(60);

        let (a, b) = tokio::join!(
            store.acquire_lease("W/F:1", "worker-a", ttl),
            store.acquire_lease("W/F:1", "worker-b", ttl),
        );

        let granted = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(granted, 1);
        let failed = if a.is_ok() { b } else { a };
        assert!(matches!(failed, Err(StoreError::LeaseHeld { .. })));
        assert_eq!(store.lease_grants("W/F:1").await, 1);
    }

    #[tokio::test]
    async fn expired_leases_can_be_taken_over() {
        let (store, clock) = store();
        let first = store
            .acquire_lease("s", "a", Duration::from_secs(10))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(11));
        let second = store
            .acquire_lease("s", "b", Duration::from_secs(10))
            .await
            .unwrap();

        assert!(matches!(
            store.renew_lease(&first, Duration::from_secs(10)).await,
            Err(StoreError::LeaseLost { .. })
        ));
        assert!(store.release_lease(first).await.is_err());
        store.release_lease(second).await.unwrap();
        assert_eq!(store.lease_grants("s").await, 2);
    }

    #[tokio::test]
    async fn renew_extends_expiry() {
        let (store, clock) = store();
        let lease = store
            .acquire_lease("s", "a", Duration::from_secs(10))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(8));
        let renewed = store.renew_lease(&lease, Duration::from_secs(10)).await.unwrap();
        assert!(renewed.expires_at > lease.expires_at);

        clock.advance(Duration::from_secs(5));
        assert!(store.acquire_lease("s", "b", Duration::from_secs(10)).await.is_err());
    }
}
