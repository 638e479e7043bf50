//! Ports - 抽象化レイヤー
//!
//! 外部の協調者（バックエンドストア、flow エンジン、リーダー選出）への
//! インターフェースを定義します。
//!
//! # 設計原則
//! - ストアが唯一の source of truth（正本）
//! - メモリ上のキャッシュは最適化に過ぎず、失っても正しさは変わらない

pub mod clock;
pub mod data_store;
pub mod election;
pub mod flow;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::data_store::{Cell, DataStore, Lease, Mutation, StoreError};
pub use self::election::{AlwaysActive, Election, StaticElection};
pub use self::flow::{
    FlowEngine, FlowError, FlowHandle, FlowStatus, RunnerContext, WellKnownFlow,
};
