//! conveyor-core
//!
//! 通知駆動の flow スケジューラと実行エンジンのコア部品です。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task_id, message, request, notification, time, errors）
//! - **typed**: ペイロードの型レジストリ（Value, ObjectType, TypeRegistry）
//! - **state**: flow state のコンテナとコーデック（寛容なデコードを含む）
//! - **ports**: 抽象化レイヤー（Clock, DataStore, Election, FlowEngine）
//! - **impls**: 実装（MemoryDataStore, StoreFlowEngine）
//! - **queue**: QueueManager（リクエスト・レスポンス・通知・クライアントキュー）
//! - **app**: アプリケーションロジック（Worker, WorkerBuilder, TaskPool, recovery）
//! - **error**: クレート全体のエラー型

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod state;
pub mod typed;

pub use self::app::{Worker, WorkerBuilder, WorkerConfig, wake_stuck_flow};
pub use self::domain::{ClientId, Message, Notification, Priority, QueueName, SessionId, TaskId};
pub use self::error::ConveyorError;
pub use self::impls::{FlowCall, FlowLogic, FlowRegistry, MemoryDataStore, StoreFlowEngine};
pub use self::queue::QueueManager;
