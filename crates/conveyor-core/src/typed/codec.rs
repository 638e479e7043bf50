//! Binary codec shared by every persisted record.
//!
//! ストアに書く全レコード（メッセージ・リクエスト・通知・flow の状態）は
//! bincode（serde モード、standard 設定）でエンコードします。

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode record")]
    Encode(#[source] bincode::error::EncodeError),

    #[error("failed to decode record")]
    Decode(#[source] bincode::error::DecodeError),

    #[error("{trailing} trailing bytes after record")]
    TrailingBytes { trailing: usize },

    #[error("unknown object type {type_name:?}")]
    UnknownType { type_name: String },

    #[error("object of type {type_name:?} does not decode")]
    InvalidObject {
        type_name: String,
        #[source]
        source: Box<CodecError>,
    },

    #[error("expected object of type {expected:?}, found {found:?}")]
    TypeMismatch { expected: String, found: String },

    #[error("unsupported state format version {0}")]
    UnsupportedVersion(u32),

    #[error("field {field:?} holds an unresolved placeholder and cannot be written back")]
    UnresolvedPlaceholder { field: String },
}

pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(CodecError::Encode)
}

pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(CodecError::Decode)?;
    if read != bytes.len() {
        return Err(CodecError::TrailingBytes {
            trailing: bytes.len() - read,
        });
    }
    Ok(value)
}
