//! Flow state container.
//!
//! フィールドは事前に登録（スキーマ宣言）しておく必要があり、
//! 未登録フィールドへの代入は `StateError::UnregisteredField` で失敗します。
//! 永続化されるスキーマを意図したものに保つためです。

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use super::codec;
use crate::typed::{CodecError, ObjectType, Value};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("field {0:?} is not registered in the flow state schema")]
    UnregisteredField(String),

    #[error("field {field:?} could not be converted")]
    Codec {
        field: String,
        #[source]
        source: CodecError,
    },
}

/// Declared field names of a flow kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSchema {
    fields: BTreeSet<String>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn with(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into());
        self
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlowState {
    pub(super) fields: BTreeMap<String, Option<Value>>,
}

impl FlowState {
    /// A state with every field of `schema` registered and unset.
    pub fn new(schema: &StateSchema) -> Self {
        let mut state = Self::default();
        state.register_schema(schema);
        state
    }

    /// Register a field; an existing value is kept.
    pub fn register(&mut self, field: impl Into<String>) {
        self.fields.entry(field.into()).or_insert(None);
    }

    pub fn register_schema(&mut self, schema: &StateSchema) {
        for field in schema.iter() {
            self.register(field);
        }
    }

    pub fn is_registered(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<(), StateError> {
        let Some(slot) = self.fields.get_mut(field) else {
            return Err(StateError::UnregisteredField(field.to_string()));
        };
        *slot = Some(value.into());
        Ok(())
    }

    pub fn unset(&mut self, field: &str) -> Result<(), StateError> {
        let Some(slot) = self.fields.get_mut(field) else {
            return Err(StateError::UnregisteredField(field.to_string()));
        };
        *slot = None;
        Ok(())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).and_then(Option::as_ref)
    }

    pub fn set_object<T: ObjectType>(&mut self, field: &str, value: &T) -> Result<(), StateError> {
        let value = Value::object(value).map_err(|source| StateError::Codec {
            field: field.to_string(),
            source,
        })?;
        self.set(field, value)
    }

    pub fn get_object<T: ObjectType>(&self, field: &str) -> Result<Option<T>, StateError> {
        if !self.is_registered(field) {
            return Err(StateError::UnregisteredField(field.to_string()));
        }
        self.get(field)
            .map(|value| value.to_object::<T>())
            .transpose()
            .map_err(|source| StateError::Codec {
                field: field.to_string(),
                source,
            })
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn has_placeholders(&self) -> bool {
        self.fields.values().flatten().any(Value::contains_unknown)
    }

    /// Unset every field holding an unresolved placeholder and return their names.
    pub fn salvage(&mut self) -> Vec<String> {
        let mut cleared = Vec::new();
        for (name, slot) in self.fields.iter_mut() {
            if slot.as_ref().is_some_and(Value::contains_unknown) {
                *slot = None;
                cleared.push(name.clone());
            }
        }
        cleared
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }
}

/// Byte-exact: two states are equal iff they encode identically.
impl PartialEq for FlowState {
    fn eq(&self, other: &Self) -> bool {
        match (self.encode(), other.encode()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}
