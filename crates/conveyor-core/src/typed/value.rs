//! Payload values.
//!
//! `Value` は閉じた直和型です。任意の型を埋め込む必要がある箇所だけ
//! `Object`（型名タグ + bincode バイト列）で開いた拡張点を提供します。
//! `Unknown` は寛容デコーダが解決できなかったオブジェクトの置き換え先です。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::codec::{CodecError, from_bytes, to_bytes};
use super::object::ObjectType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(ObjectValue),
    Unknown(UnknownObject),
}

/// An embedded object, tagged with the name it was registered under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectValue {
    pub type_name: String,
    pub data: Vec<u8>,
}

impl ObjectValue {
    pub fn new<T: ObjectType>(value: &T) -> Result<Self, CodecError> {
        Ok(Self {
            type_name: T::TYPE.to_string(),
            data: to_bytes(value)?,
        })
    }

    pub fn decode<T: ObjectType>(&self) -> Result<T, CodecError> {
        if self.type_name != T::TYPE {
            return Err(CodecError::TypeMismatch {
                expected: T::TYPE.to_string(),
                found: self.type_name.clone(),
            });
        }
        from_bytes(&self.data)
    }
}

/// Placeholder for an object whose type could not be resolved.
///
/// 元の型名とバイト列、解決に失敗した理由をそのまま保持します。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownObject {
    pub type_name: String,
    pub data: Vec<u8>,
    pub reason: String,
}

impl Value {
    pub fn object<T: ObjectType>(value: &T) -> Result<Self, CodecError> {
        ObjectValue::new(value).map(Value::Object)
    }

    /// Decode an embedded object as `T`.
    pub fn to_object<T: ObjectType>(&self) -> Result<T, CodecError> {
        match self {
            Value::Object(object) => object.decode(),
            Value::Unknown(unknown) => Err(CodecError::TypeMismatch {
                expected: T::TYPE.to_string(),
                found: format!("unresolved {}", unknown.type_name),
            }),
            other => Err(CodecError::TypeMismatch {
                expected: T::TYPE.to_string(),
                found: other.kind().to_string(),
            }),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Unknown(_) => "unknown",
        }
    }

    /// True if this value or anything nested in it is a placeholder.
    pub fn contains_unknown(&self) -> bool {
        match self {
            Value::Unknown(_) => true,
            Value::List(items) => items.iter().any(Value::contains_unknown),
            Value::Map(entries) => entries.values().any(Value::contains_unknown),
            _ => false,
        }
    }

    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Human-readable rendering. Objects show their type and size only.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::UInt(u) => json!(u),
            Value::Float(f) => json!(f),
            Value::Text(s) => json!(s),
            Value::Bytes(b) => json!({ "bytes": b.len() }),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Object(o) => json!({ "type": o.type_name, "bytes": o.data.len() }),
            Value::Unknown(u) => {
                json!({ "unresolved": u.type_name, "bytes": u.data.len(), "reason": u.reason })
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}
