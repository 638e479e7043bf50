//! DataStore port - バックエンドストアの抽象化
//!
//! スケジューラが前提とするストアの能力だけを定義します。
//! - タイムスタンプでバージョン管理されたセルの読み書き
//! - タイムスタンプ範囲での読み出し・削除
//! - 範囲の atomic な pop（読み出して消す）
//! - ノンブロッキングな排他 lease（TTL と更新つき）
//!
//! # 設計原則
//! - lease は compare-and-swap として表現する（プロセス内 mutex では足りない）
//! - lease の取得失敗は `StoreError::LeaseHeld` で、エラーではなく通常の結果として扱う
//! - subject 単位の mutation 群は atomic に適用される

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{TimeRange, Timestamp};

/// One versioned value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub attribute: String,
    pub timestamp: Timestamp,
    pub value: Vec<u8>,
}

impl Cell {
    pub fn new(attribute: impl Into<String>, timestamp: Timestamp, value: Vec<u8>) -> Self {
        Self {
            attribute: attribute.into(),
            timestamp,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Add a version; an existing cell at the same timestamp is overwritten.
    Insert(Cell),
    /// Drop every other version of the attribute, then insert.
    Replace(Cell),
    Delete { attribute: String, range: TimeRange },
    DeletePrefix { prefix: String, range: TimeRange },
}

/// A held lease. Only the holder of the token can renew or release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub subject: String,
    pub owner: String,
    pub token: u64,
    pub expires_at: Timestamp,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lease on {subject} is held by {owner} until {expires_at}")]
    LeaseHeld {
        subject: String,
        owner: String,
        expires_at: Timestamp,
    },

    #[error("lease on {subject} was lost")]
    LeaseLost { subject: String },

    #[error("backing store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Apply `mutations` to `subject` atomically, in order.
    async fn apply(&self, subject: &str, mutations: Vec<Mutation>) -> Result<(), StoreError>;

    /// Cells whose attribute starts with `prefix` and whose timestamp is in
    /// `range`, sorted by `(attribute, timestamp)`.
    async fn scan(&self, subject: &str, prefix: &str, range: TimeRange)
    -> Result<Vec<Cell>, StoreError>;

    /// Like `scan`, but the returned cells are deleted in the same step.
    async fn pop(&self, subject: &str, prefix: &str, range: TimeRange)
    -> Result<Vec<Cell>, StoreError>;

    /// Claim `subject` unless an unexpired lease exists. Never waits.
    async fn acquire_lease(
        &self,
        subject: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError>;

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StoreError>;

    async fn release_lease(&self, lease: Lease) -> Result<(), StoreError>;
}
