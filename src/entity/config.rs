use crate::core::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where an entity's state lives between cache residencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    #[default]
    Memory,
    Sql,
    Redis,
    /// Held by the client for the browser session; the server only caches it.
    ClientSession,
    /// Held in client-local storage; the server only caches it.
    ClientLocal,
    Custom,
}

impl StoreKind {
    /// Whether a server-side persistence backend is involved.
    pub const fn is_durable(&self) -> bool {
        !matches!(self, StoreKind::ClientSession | StoreKind::ClientLocal)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Sql => "sql",
            StoreKind::Redis => "redis",
            StoreKind::ClientSession => "client-session",
            StoreKind::ClientLocal => "client-local",
            StoreKind::Custom => "custom",
        }
    }
}

/// Per-entity-type options. The recognized set is closed; unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EntityConfig {
    #[serde(default)]
    pub store: StoreKind,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub auto_persist: bool,
    #[serde(default)]
    pub namespaced: bool,
    /// Name of the backend when `store` is `custom`.
    #[serde(default)]
    pub backend: Option<String>,
    /// Fall back to default field values when the backend fails during load.
    #[serde(default)]
    pub load_miss_tolerant: bool,
}

impl EntityConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a loosely-typed option map, failing on unknown keys or invalid combinations.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let config: EntityConfig = serde_json::from_value(value)
            .map_err(|err| StateError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn store(mut self, store: StoreKind) -> Self {
        self.store = store;
        self
    }

    pub fn ttl_seconds(mut self, ttl: u64) -> Self {
        self.ttl_seconds = Some(ttl);
        self
    }

    pub fn auto_persist(mut self, enabled: bool) -> Self {
        self.auto_persist = enabled;
        self
    }

    pub fn namespaced(mut self, enabled: bool) -> Self {
        self.namespaced = enabled;
        self
    }

    pub fn custom_backend(mut self, name: impl Into<String>) -> Self {
        self.store = StoreKind::Custom;
        self.backend = Some(name.into());
        self
    }

    pub fn load_miss_tolerant(mut self, enabled: bool) -> Self {
        self.load_miss_tolerant = enabled;
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_seconds.map(Duration::from_secs)
    }

    /// Identifier of the persistence backend this entity routes to, if any.
    pub fn backend_id(&self) -> Option<String> {
        match (self.store, &self.backend) {
            (StoreKind::Custom, Some(name)) => Some(format!("custom:{name}")),
            (store, _) if store.is_durable() => Some(store.as_str().to_string()),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl_seconds == Some(0) {
            return Err(StateError::InvalidConfig(
                "ttlSeconds must be > 0 (omit it for no expiry)".to_string(),
            ));
        }

        if self.auto_persist && !self.store.is_durable() {
            return Err(StateError::InvalidConfig(format!(
                "autoPersist is not supported for client-held store '{}'",
                self.store.as_str()
            )));
        }

        match (self.store, self.backend.as_deref()) {
            (StoreKind::Custom, None) => Err(StateError::InvalidConfig(
                "store 'custom' requires a backend name".to_string(),
            )),
            (StoreKind::Custom, Some(name)) if name.trim().is_empty() => Err(
                StateError::InvalidConfig("backend name cannot be empty".to_string()),
            ),
            (StoreKind::Custom, Some(_)) | (_, None) => Ok(()),
            (store, Some(_)) => Err(StateError::InvalidConfig(format!(
                "backend can only be set for store 'custom', not '{}'",
                store.as_str()
            ))),
        }
    }
}
