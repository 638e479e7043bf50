//! App - アプリケーション層
//!
//! ports と queue を組み合わせて、通知駆動のスケジューラを実装します。
//!
//! # 主要コンポーネント
//! - **WorkerBuilder**: ワーカーの構築とワイヤリング
//! - **Worker**: スキャン（`run_once`）とセッション処理のディスパッチ
//! - **TaskPool**: 同時実行数を制限したタスクプール
//! - **NegativeCache**: lease が取れなかったセッションを一時的に除外する
//! - **WorkerStats**: カウンタとスナップショット
//! - **wake_stuck_flow**: オペレータ向けの復旧ツール

pub mod builder;
pub mod config;
pub mod negative_cache;
pub mod pool;
pub mod recovery;
pub mod stats;
pub mod worker;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, WorkerBuilder};
pub use self::config::WorkerConfig;
pub use self::negative_cache::NegativeCache;
pub use self::pool::{PoolError, TaskPool};
pub use self::recovery::wake_stuck_flow;
pub use self::stats::{WorkerCounts, WorkerStats};
pub use self::worker::{Worker, WorkerError};
