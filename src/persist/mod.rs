//! Persistence port and backend routing.
//!
//! Backends are plugged in per store kind; the core ships an in-memory adapter and a
//! JSON-file adapter. Relational or key-value drivers implement [`PersistencePort`]
//! outside this crate.

use crate::core::{Result, StateError, StateKey};
use crate::entity::{EntityConfig, EntityInstance, StoreKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub mod file;
pub mod memory;

pub use file::JsonFilePersistence;
pub use memory::MemoryPersistence;

/// Durable storage for entity instances.
///
/// Implementations must be safe for concurrent use. `delete` is idempotent: deleting an
/// absent key returns `Ok(false)`.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    /// Stores the instance, returning the backend record id.
    async fn save(
        &self,
        key: &StateKey,
        instance: &EntityInstance,
        ttl: Option<Duration>,
    ) -> Result<String>;

    async fn load(&self, key: &StateKey) -> Result<Option<EntityInstance>>;

    async fn delete(&self, key: &StateKey) -> Result<bool>;

    async fn exists(&self, key: &StateKey) -> Result<bool>;
}

/// Stable record id for a key, identical across backends and restarts.
pub fn record_id(key: &StateKey) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.to_string().as_bytes()).to_string()
}

/// Routing table from backend id (`memory`, `sql`, `redis`, `custom:<name>`) to a port.
#[derive(Clone, Default)]
pub struct PersistenceBackends {
    ports: HashMap<String, Arc<dyn PersistencePort>>,
}

impl PersistenceBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, store: StoreKind, port: Arc<dyn PersistencePort>) -> Result<()> {
        if !store.is_durable() {
            return Err(StateError::InvalidConfig(format!(
                "store '{}' is client-held and takes no backend",
                store.as_str()
            )));
        }
        if store == StoreKind::Custom {
            return Err(StateError::InvalidConfig(
                "custom backends are registered by name".to_string(),
            ));
        }
        self.ports.insert(store.as_str().to_string(), port);
        Ok(())
    }

    pub fn register_custom(&mut self, name: &str, port: Arc<dyn PersistencePort>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(StateError::InvalidConfig(
                "backend name cannot be empty".to_string(),
            ));
        }
        self.ports.insert(format!("custom:{name}"), port);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ports.contains_key(id)
    }

    /// The port an entity routes to; `Ok(None)` for client-held stores.
    pub fn for_entity(&self, config: &EntityConfig) -> Result<Option<Arc<dyn PersistencePort>>> {
        let Some(id) = config.backend_id() else {
            return Ok(None);
        };
        self.ports
            .get(&id)
            .cloned()
            .map(Some)
            .ok_or_else(|| StateError::InvalidConfig(format!("no persistence backend registered for '{id}'")))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ports.keys().cloned().collect();
        ids.sort();
        ids
    }
}
