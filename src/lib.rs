// ============================================================================
// LiveState Library
// ============================================================================

pub mod core;
pub mod scope;
pub mod entity;
pub mod cache;
pub mod persist;
pub mod dispatch;
pub mod bus;
pub mod connection;
pub mod worker;
pub mod config;
pub mod engine;
pub mod web;
pub mod prelude;

// Re-export main types for convenience
pub use crate::core::{CommandError, FieldMap, FieldSpec, FieldType, Result, ScopeKind, StateError, StateKey};
pub use crate::scope::{ScopeContext, resolve};
pub use crate::entity::{EntityConfig, EntityInstance, EntityRegistry, EntityType, StoreKind};
pub use crate::cache::StateCache;
pub use crate::persist::{JsonFilePersistence, MemoryPersistence, PersistenceBackends, PersistencePort};
pub use crate::dispatch::{
    Actor, CommandContext, CommandOutcome, CommandRequest, DiffEvent, DispatchOutcome, Dispatcher,
    Fragment, MergeMode,
};
pub use crate::bus::{BusMessage, BusSubscription, EventBus};
pub use crate::connection::{
    CloseReason, Connection, ConnectionConfig, ConnectionId, ConnectionManager, ConnectionState,
    OutboundFrame,
};
pub use crate::config::EngineConfig;
pub use crate::engine::{EngineStats, LiveState, LiveStateBuilder};
