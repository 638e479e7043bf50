//! Notification / task priority.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Priority class in `0..=7`; higher values are dispatched first.
///
/// 3 bit に収まることが不変条件です。`TaskId` の上位 3 bit に `7 - priority`
/// として詰め込まれるため、範囲外の値はコンストラクタで拒否します。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MAX_VALUE: u8 = 7;

    pub const LOW: Priority = Priority(0);
    pub const MEDIUM: Priority = Priority(1);
    pub const HIGH: Priority = Priority(2);

    pub fn new(value: u8) -> Result<Self, DomainError> {
        if value > Self::MAX_VALUE {
            return Err(DomainError::InvalidPriority(value));
        }
        Ok(Self(value))
    }

    pub const fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl TryFrom<u8> for Priority {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
