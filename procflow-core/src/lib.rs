//! Token-passing workflow engine core with BPMN-style semantics.
//!
//! A `ProcessDefinition` is an immutable graph of flow nodes and sequence
//! flows, produced once by the [`loader`] from a serialized parsed graph
//! (the core does not parse BPMN XML). The [`engine`] advances process
//! instances through that graph one token step at a time: gateway fork and
//! join coordination lives in [`gateway`], trigger matching and boundary
//! interruption in [`dispatch`], and per-instance state in [`instance`].
//!
//! Two capabilities are pluggable at the boundary: an [`eval::Evaluator`]
//! resolves guard and timer expressions, and a [`persist::Persistor`]
//! durably checkpoints instance snapshots and the runtime event log. The
//! crate ships an in-memory persistor; everything else is the host's.

pub mod definition;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod eval;
pub mod events;
pub mod gateway;
pub mod instance;
pub mod loader;
pub mod persist;
mod persist_memory;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use definition::{ProcessDefinition, ProcessType};
pub use engine::{Engine, InstanceStatus};
pub use error::{
    DefinitionError, DefinitionErrorKind, DispatchError, EngineError, EvalError, GatewayError,
    LoadError,
};
pub use eval::{Evaluator, ExprHandle};
pub use events::RuntimeEvent;
pub use instance::{InstanceState, ProcessInstance, Token, TokenState};
pub use loader::{load_slice, load_yaml_str};
pub use persist::Persistor;
pub use persist_memory::MemoryPersistor;
pub use types::{Trigger, TriggerKind, VariableMap};
