//! Flow state and its persisted form.

pub mod codec;
pub mod flow_state;

pub use self::codec::{Decoded, UnresolvedField, decode, decode_strict};
pub use self::flow_state::{FlowState, StateError, StateSchema};
