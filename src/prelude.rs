//! Everything an application needs to declare entities and run the engine.
//!
//! `use livestate::prelude::*;` covers entity declaration, the engine builder and
//! the command types. Lower-level pieces (cache, bus, connection manager) stay on
//! their own modules.

pub use crate::config::EngineConfig;
pub use crate::connection::ConnectionConfig;
pub use crate::core::{CommandError, FieldMap, FieldSpec, FieldType, ScopeKind, StateError, StateKey};
pub use crate::dispatch::{Actor, CommandContext, CommandOutcome, CommandRequest, Fragment, MergeMode};
pub use crate::engine::LiveState;
pub use crate::entity::{EntityConfig, EntityType, StoreKind};
pub use crate::persist::{JsonFilePersistence, MemoryPersistence, PersistencePort};
pub use crate::scope::ScopeContext;
