//! WorkerBuilder - ワーカーの構築とワイヤリング
//!
//! # 設計原則
//! - 起動時検証（Fail-fast）: `expect_well_known()` で期待した well-known flow が
//!   登録されていなければ `build()` が失敗する
//! - 同じ名前の well-known flow は二重登録できない
//!
//! # 使用例
//! ```ignore
//! let worker = WorkerBuilder::new(manager, engine)
//!     .config(config)
//!     .register_well_known(StatsFlow::default())?
//!     .expect_well_known(&["Stats"])
//!     .build()?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use super::config::WorkerConfig;
use super::worker::Worker;
use crate::ports::{AlwaysActive, Election, FlowEngine, WellKnownFlow};
use crate::queue::QueueManager;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("Missing well-known flows: {0:?}. These flows were expected but not registered.")]
    MissingWellKnownFlows(Vec<String>),

    #[error("Well-known flow '{0}' is already registered")]
    DuplicateWellKnownFlow(String),

    #[error("Invalid worker configuration: {0}")]
    InvalidConfig(String),
}

pub struct WorkerBuilder {
    manager: QueueManager,
    engine: Arc<dyn FlowEngine>,
    election: Arc<dyn Election>,
    config: WorkerConfig,
    well_known: HashMap<String, Arc<dyn WellKnownFlow>>,
    expected: Option<Vec<String>>,
}

impl WorkerBuilder {
    pub fn new(manager: QueueManager, engine: Arc<dyn FlowEngine>) -> Self {
        Self {
            manager,
            engine,
            election: Arc::new(AlwaysActive),
            config: WorkerConfig::default(),
            well_known: HashMap::new(),
            expected: None,
        }
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn election(mut self, election: Arc<dyn Election>) -> Self {
        self.election = election;
        self
    }

    pub fn register_well_known(
        mut self,
        flow: impl WellKnownFlow + 'static,
    ) -> Result<Self, BuildError> {
        let name = flow.name().to_string();
        if self.well_known.contains_key(&name) {
            return Err(BuildError::DuplicateWellKnownFlow(name));
        }
        self.well_known.insert(name, Arc::new(flow));
        Ok(self)
    }

    pub fn expect_well_known(mut self, names: &[&str]) -> Self {
        self.expected = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Worker, BuildError> {
        if let Some(expected) = &self.expected {
            let mut missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.well_known.contains_key(*name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                missing.sort();
                return Err(BuildError::MissingWellKnownFlows(missing));
            }
        }
        if self.config.queues.is_empty() {
            return Err(BuildError::InvalidConfig("no queues to scan".to_string()));
        }
        Ok(Worker::new(
            self.manager,
            self.engine,
            self.election,
            self.config,
            self.well_known,
        ))
    }
}
