//! Election port - アクティブインスタンスの判定
//!
//! ホットスタンバイ構成では、選出されたインスタンスだけがスケジューリングを行います。

use std::sync::atomic::{AtomicBool, Ordering};

pub trait Election: Send + Sync {
    fn is_active(&self) -> bool;
}

/// Single-instance deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysActive;

impl Election for AlwaysActive {
    fn is_active(&self) -> bool {
        true
    }
}

/// A flag flipped by an external watcher.
#[derive(Debug, Default)]
pub struct StaticElection {
    active: AtomicBool,
}

impl StaticElection {
    pub fn new(active: bool) -> Self {
        Self {
            active: AtomicBool::new(active),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

impl Election for StaticElection {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
