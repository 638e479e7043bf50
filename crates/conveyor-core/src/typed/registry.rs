//! TypeRegistry - 埋め込みオブジェクト型の登録と解決
//!
//! 起動時に `register::<T>()` で型を登録し、デコード時には型名から
//! `DynObjectType` を引いてバイト列を検証します。
//!
//! # 型消去
//! - 表層: `ObjectType`（ジェネリック、型安全）
//! - 内部: `DynObjectType`（object-safe、`HashMap` に格納可能）

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use super::codec::{CodecError, from_bytes};
use super::object::ObjectType;
use super::value::ObjectValue;
use crate::domain::Status;

/// Object-safe view of a registered `ObjectType`.
pub trait DynObjectType: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Check that `data` decodes as this type.
    fn validate(&self, data: &[u8]) -> Result<(), CodecError>;
}

struct TypedObject<T: ObjectType> {
    _marker: PhantomData<T>,
}

impl<T: ObjectType> DynObjectType for TypedObject<T> {
    fn type_name(&self) -> &'static str {
        T::TYPE
    }

    fn validate(&self, data: &[u8]) -> Result<(), CodecError> {
        from_bytes::<T>(data).map(|_| ())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("object type '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Startup-built map from type name to decoder.
#[derive(Default, Clone)]
pub struct TypeRegistry {
    types: HashMap<String, Arc<dyn DynObjectType>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that already knows the scheduler's own payload types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.types.insert(
            Status::TYPE.to_string(),
            Arc::new(TypedObject::<Status> {
                _marker: PhantomData,
            }),
        );
        registry
    }

    pub fn register<T: ObjectType>(&mut self) -> Result<(), RegistryError> {
        if self.types.contains_key(T::TYPE) {
            return Err(RegistryError::AlreadyRegistered(T::TYPE.to_string()));
        }
        self.types.insert(
            T::TYPE.to_string(),
            Arc::new(TypedObject::<T> {
                _marker: PhantomData,
            }),
        );
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn DynObjectType>> {
        self.types.get(type_name).cloned()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.types.keys().cloned().collect();
        types.sort();
        types
    }

    /// Resolve an embedded object against the registered types.
    pub fn resolve(&self, object: &ObjectValue) -> Result<(), CodecError> {
        let Some(ty) = self.types.get(&object.type_name) else {
            return Err(CodecError::UnknownType {
                type_name: object.type_name.clone(),
            });
        };
        ty.validate(&object.data)
            .map_err(|source| CodecError::InvalidObject {
                type_name: object.type_name.clone(),
                source: Box::new(source),
            })
    }
}
