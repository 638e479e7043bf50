//! Typed - 型付きペイロード API
//!
//! メッセージのペイロードと flow の状態フィールドを表す `Value` と、
//! 埋め込みオブジェクトの型名を解決する `TypeRegistry` を提供します。
//!
//! # 二層構造
//! - **表層（Typed）**: `ObjectType` trait - 型安全
//! - **内部（Dyn）**: `DynObjectType` trait - object-safe, type erasure

pub mod codec;
pub mod object;
pub mod registry;
pub mod value;

pub use self::codec::CodecError;
pub use self::object::ObjectType;
pub use self::registry::{DynObjectType, RegistryError, TypeRegistry};
pub use self::value::{ObjectValue, UnknownObject, Value};
