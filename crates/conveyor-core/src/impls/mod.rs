//! Impls - ポートの実装
//!
//! - `MemoryDataStore`: 開発・テスト用のインメモリ `DataStore`
//! - `StoreFlowEngine`: `DataStore` 上に flow を保持するリファレンス flow エンジン

pub mod flow_engine;
pub mod flow_logic;
pub mod memory_store;

pub use self::flow_engine::{FlowInspection, StoreFlowEngine};
pub use self::flow_logic::{FlowCall, FlowLogic, FlowRegistry};
pub use self::memory_store::MemoryDataStore;
