//! Flow state codec.
//!
//! # デコードの二段構え
//! 1. `decode_strict`: 埋め込みオブジェクトをすべて `TypeRegistry` で解決する
//! 2. 失敗したら寛容デコーダに切り替え、解決できないオブジェクトを
//!    `Value::Unknown` に置き換えて `UnresolvedField` として報告する
//!
//! 外側のレコード自体が壊れている場合は救出できるものがないのでエラーを返します。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::flow_state::FlowState;
use crate::error::error_chain;
use crate::typed::codec::{from_bytes, to_bytes};
use crate::typed::{CodecError, TypeRegistry, UnknownObject, Value};

const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StateRecord {
    version: u32,
    fields: BTreeMap<String, Option<Value>>,
}

/// A field the tolerant decoder replaced with a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedField {
    pub field: String,
    /// Location inside the field, e.g. `hits[2].owner`.
    pub path: String,
    pub type_name: String,
    pub reason: String,
}

/// Result of `decode`.
#[derive(Debug)]
pub struct Decoded {
    pub state: FlowState,
    pub unresolved: Vec<UnresolvedField>,
    /// The strict decoder's error, when the tolerant pass was needed.
    pub error: Option<CodecError>,
}

impl Decoded {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

pub fn encode(state: &FlowState) -> Result<Vec<u8>, CodecError> {
    for (name, value) in &state.fields {
        if value.as_ref().is_some_and(Value::contains_unknown) {
            return Err(CodecError::UnresolvedPlaceholder {
                field: name.clone(),
            });
        }
    }
    to_bytes(&StateRecordRef {
        version: STATE_FORMAT_VERSION,
        fields: &state.fields,
    })
}

// Borrowing twin of `StateRecord`; serializes identically.
#[derive(Serialize)]
struct StateRecordRef<'a> {
    version: u32,
    fields: &'a BTreeMap<String, Option<Value>>,
}

pub fn decode_strict(bytes: &[u8], registry: &TypeRegistry) -> Result<FlowState, CodecError> {
    let mut fields = read_record(bytes)?;
    for (name, slot) in fields.iter_mut() {
        if let Some(value) = slot {
            resolve(value, registry, name, name.clone(), None)?;
        }
    }
    Ok(FlowState { fields })
}

/// Strict decode with a tolerant fallback.
pub fn decode(bytes: &[u8], registry: &TypeRegistry) -> Result<Decoded, CodecError> {
    let error = match decode_strict(bytes, registry) {
        Ok(state) => {
            return Ok(Decoded {
                state,
                unresolved: Vec::new(),
                error: None,
            });
        }
        Err(err) => err,
    };

    let mut fields = read_record(bytes)?;
    let mut unresolved = Vec::new();
    for (name, slot) in fields.iter_mut() {
        if let Some(value) = slot {
            resolve(value, registry, name, name.clone(), Some(&mut unresolved))?;
        }
    }
    tracing::warn!(
        unresolved = unresolved.len(),
        error = %error_chain(&error),
        "flow state decoded with placeholders"
    );
    Ok(Decoded {
        state: FlowState { fields },
        unresolved,
        error: Some(error),
    })
}

fn read_record(bytes: &[u8]) -> Result<BTreeMap<String, Option<Value>>, CodecError> {
    let record: StateRecord = from_bytes(bytes)?;
    if record.version != STATE_FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(record.version));
    }
    Ok(record.fields)
}

/// Walk `value`, resolving every embedded object. With `tolerant` set,
/// failures become placeholders instead of errors.
fn resolve(
    value: &mut Value,
    registry: &TypeRegistry,
    field: &str,
    path: String,
    mut tolerant: Option<&mut Vec<UnresolvedField>>,
) -> Result<(), CodecError> {
    match value {
        Value::Object(object) => {
            let Err(err) = registry.resolve(object) else {
                return Ok(());
            };
            let Some(unresolved) = tolerant else {
                return Err(err);
            };
            let reason = error_chain(&err);
            unresolved.push(UnresolvedField {
                field: field.to_string(),
                path,
                type_name: object.type_name.clone(),
                reason: reason.clone(),
            });
            *value = Value::Unknown(UnknownObject {
                type_name: std::mem::take(&mut object.type_name),
                data: std::mem::take(&mut object.data),
                reason,
            });
            Ok(())
        }
        Value::Unknown(unknown) => match tolerant {
            Some(unresolved) => {
                unresolved.push(UnresolvedField {
                    field: field.to_string(),
                    path,
                    type_name: unknown.type_name.clone(),
                    reason: unknown.reason.clone(),
                });
                Ok(())
            }
            None => Err(CodecError::UnresolvedPlaceholder {
                field: field.to_string(),
            }),
        },
        Value::List(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                resolve(item, registry, field, format!("{path}[{i}]"), tolerant.as_deref_mut())?;
            }
            Ok(())
        }
        Value::Map(entries) => {
            for (key, item) in entries.iter_mut() {
                resolve(item, registry, field, format!("{path}.{key}"), tolerant.as_deref_mut())?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateSchema;
    use crate::typed::ObjectType;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        path: String,
        size: u64,
    }

    impl ObjectType for Payload {
        const TYPE: &'static str = "test.payload.v1";
    }

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::with_builtins();
        registry.register::<Payload>().unwrap();
        registry
    }

    fn sample_state() -> FlowState {
        let schema = StateSchema::from_fields(&["count", "payload", "history", "unset"]);
        let mut state = FlowState::new(&schema);
        state.set("count", 7i64).unwrap();
        state
            .set_object(
                "payload",
                &Payload {
                    path: "/etc/passwd".into(),
                    size: 1024,
                },
            )
            .unwrap();
        state
            .set(
                "history",
                Value::List(vec![
                    Value::from("start"),
                    Value::object(&Payload {
                        path: "/tmp".into(),
                        size: 0,
                    })
                    .unwrap(),
                ]),
            )
            .unwrap();
        state
    }

    fn replace_all(haystack: &mut [u8], needle: &[u8], with: &[u8]) -> usize {
        assert_eq!(needle.len(), with.len());
        let mut hits = 0;
        let mut i = 0;
        while i + needle.len() <= haystack.len() {
            if &haystack[i..i + needle.len()] == needle {
                haystack[i..i + needle.len()].copy_from_slice(with);
                hits += 1;
                i += needle.len();
            } else {
                i += 1;
            }
        }
        hits
    }

    #[test]
    fn round_trip_preserves_registered_fields() {
        let state = sample_state();
        let bytes = state.encode().unwrap();

        let decoded = decode(&bytes, &registry()).unwrap();

        assert!(decoded.is_complete());
        assert!(decoded.error.is_none());
        assert_eq!(decoded.state, state);
        assert!(decoded.state.is_registered("unset"));
        assert_eq!(
            decoded.state.get_object::<Payload>("payload").unwrap().unwrap().size,
            1024
        );
    }

    #[test]
    fn corrupted_type_tag_becomes_a_placeholder() {
        let mut bytes = sample_state().encode().unwrap();
        let hits = replace_all(&mut bytes, b"test.payload.v1", b"test.payload.vX");
        assert_eq!(hits, 2);

        assert!(matches!(
            decode_strict(&bytes, &registry()),
            Err(CodecError::UnknownType { .. })
        ));

        let decoded = decode(&bytes, &registry()).unwrap();
        assert!(matches!(decoded.error, Some(CodecError::UnknownType { .. })));
        let paths: Vec<&str> = decoded.unresolved.iter().map(|u| u.path.as_str()).collect();
        assert_eq!(paths, vec!["history[1]", "payload"]);
        assert!(decoded.unresolved.iter().all(|u| u.type_name == "test.payload.vX"));

        assert!(matches!(decoded.state.get("payload"), Some(Value::Unknown(_))));
        assert_eq!(decoded.state.get("count"), Some(&Value::Int(7)));
    }

    #[test]
    fn placeholder_state_refuses_to_encode_until_salvaged() {
        let mut bytes = sample_state().encode().unwrap();
        replace_all(&mut bytes, b"test.payload.v1", b"test.payload.vX");
        let mut state = decode(&bytes, &registry()).unwrap().state;

        assert!(matches!(
            state.encode(),
            Err(CodecError::UnresolvedPlaceholder { .. })
        ));
        let cleared = state.salvage();
        assert_eq!(cleared, vec!["history".to_string(), "payload".to_string()]);
        let bytes = state.encode().unwrap();
        assert!(decode(&bytes, &registry()).unwrap().is_complete());
    }

    #[test]
    fn garbage_is_an_error_even_for_the_tolerant_decoder() {
        assert!(decode(&[0xFF, 0x00, 0x13], &registry()).is_err());
    }

    #[test]
    fn future_format_versions_are_rejected() {
        let bytes = to_bytes(&StateRecord {
            version: 99,
            fields: BTreeMap::new(),
        })
        .unwrap();
        assert!(matches!(
            decode(&bytes, &registry()),
            Err(CodecError::UnsupportedVersion(99))
        ));
    }
}
