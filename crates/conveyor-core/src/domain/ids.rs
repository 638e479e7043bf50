//! Domain identifiers (strongly-typed IDs).
//!
//! キュー名・クライアント ID・セッション ID はすべて文字列ですが、
//! 混同を防ぐために newtype で区別します。
//!
//! ## SessionId の形式
//! `<queue>/<flow_name>` です。通常の flow は `F:<ULID>` という名前を持ち、
//! それ以外の名前は well-known flow（常に存在するシングルトン）を表します。
//! ULID を使うので、同じキューの flow 名は生成順にソートできます。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::errors::DomainError;

const REGULAR_FLOW_PREFIX: &str = "F:";

/// Name of a notification queue (e.g. `W`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// The default worker queue.
    pub fn worker() -> Self {
        Self("W".to_string())
    }

    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(DomainError::InvalidQueueName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for QueueName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an agent, `C.` followed by 16 hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        let valid = value
            .strip_prefix("C.")
            .is_some_and(|hex| hex.len() == 16 && hex.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(DomainError::InvalidClientId(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ClientId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ClientId> for String {
    fn from(value: ClientId) -> Self {
        value.0
    }
}

impl FromStr for ClientId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of a flow instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    queue: QueueName,
    flow_name: String,
}

impl SessionId {
    /// A fresh regular flow session on `queue`.
    pub fn new_flow(queue: QueueName) -> Self {
        Self {
            queue,
            flow_name: format!("{REGULAR_FLOW_PREFIX}{}", Ulid::new()),
        }
    }

    /// The fixed session of a well-known flow.
    pub fn well_known(queue: QueueName, name: &str) -> Result<Self, DomainError> {
        if name.is_empty() || name.contains('/') || name.starts_with(REGULAR_FLOW_PREFIX) {
            return Err(DomainError::InvalidSessionId(format!("{queue}/{name}")));
        }
        Ok(Self {
            queue,
            flow_name: name.to_string(),
        })
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn is_well_known(&self) -> bool {
        !self.flow_name.starts_with(REGULAR_FLOW_PREFIX)
    }
}

impl FromStr for SessionId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((queue, flow_name)) = s.split_once('/') else {
            return Err(DomainError::InvalidSessionId(s.to_string()));
        };
        if flow_name.is_empty() || flow_name.contains('/') {
            return Err(DomainError::InvalidSessionId(s.to_string()));
        }
        let queue = QueueName::new(queue).map_err(|_| DomainError::InvalidSessionId(s.to_string()))?;
        Ok(Self {
            queue,
            flow_name: flow_name.to_string(),
        })
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.queue, self.flow_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn regular_sessions_are_not_well_known() {
        let id = SessionId::new_flow(QueueName::worker());
        assert!(!id.is_well_known());
        assert!(id.flow_name().starts_with("F:"));
        assert!(id.to_string().starts_with("W/F:"));
    }

    #[test]
    fn well_known_sessions_keep_their_name() {
        let id = SessionId::well_known(QueueName::worker(), "Stats").unwrap();
        assert!(id.is_well_known());
        assert_eq!(id.to_string(), "W/Stats");
    }

    #[test]
    fn well_known_name_cannot_look_like_a_flow() {
        assert!(SessionId::well_known(QueueName::worker(), "F:123").is_err());
    }

    #[test]
    fn session_id_parses_its_display_form() {
        let id = SessionId::new_flow(QueueName::new("C.1000000000000000").unwrap());
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[rstest]
    #[case::no_separator("W")]
    #[case::empty_flow("W/")]
    #[case::empty_queue("/F:1")]
    #[case::nested("W/F:1/x")]
    fn malformed_session_ids_are_rejected(#[case] raw: &str) {
        assert!(raw.parse::<SessionId>().is_err());
    }

    #[rstest]
    #[case::valid("C.1000000000000000", true)]
    #[case::short("C.1000", false)]
    #[case::not_hex("C.100000000000000z", false)]
    #[case::no_prefix("1000000000000000", false)]
    fn client_id_shape(#[case] raw: &str, #[case] ok: bool) {
        assert_eq!(ClientId::new(raw).is_ok(), ok);
    }

    #[test]
    fn regular_flow_names_sort_by_creation() {
        let a = SessionId::new_flow(QueueName::worker());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = SessionId::new_flow(QueueName::worker());
        assert!(a < b);
    }
}
