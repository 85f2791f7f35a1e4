//! The engine object: owns the registry, cache, bus and connection manager for one
//! process and the background workers that serve them.

use crate::bus::EventBus;
use crate::cache::StateCache;
use crate::config::EngineConfig;
use crate::connection::{
    CloseReason, Connection, ConnectionId, ConnectionManager, HeartbeatWorker,
    spawn_heartbeat_worker,
};
use crate::core::{FieldMap, Result, StateError, StateKey};
use crate::dispatch::{Actor, CommandRequest, DispatchOutcome, Dispatcher};
use crate::entity::{EntityInstance, EntityRegistry, EntityType, StoreKind};
use crate::persist::{MemoryPersistence, PersistenceBackends, PersistencePort};
use crate::scope::ScopeContext;
use crate::worker::{ExpirySweep, SweepWorker, spawn_sweep_worker};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Point-in-time counters across the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub entity_types: usize,
    pub cached_entries: usize,
    pub cache_capacity: Option<usize>,
    pub connections: usize,
    pub subscriptions: usize,
    pub bus_subscribers: usize,
    pub published_events: u64,
    pub running: bool,
}

struct Workers {
    sweep: SweepWorker,
    heartbeat: HeartbeatWorker,
}

pub struct LiveStateBuilder {
    config: EngineConfig,
    registry: EntityRegistry,
    backends: PersistenceBackends,
    sweep_targets: Vec<Arc<dyn ExpirySweep>>,
    error: Option<StateError>,
}

impl LiveStateBuilder {
    fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            registry: EntityRegistry::new(),
            backends: PersistenceBackends::new(),
            sweep_targets: Vec::new(),
            error: None,
        }
    }

    fn record(&mut self, result: Result<()>) {
        if let Err(err) = result {
            self.error.get_or_insert(err);
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register(mut self, entity: EntityType) -> Self {
        let result = self.registry.register(entity);
        self.record(result);
        self
    }

    /// Registers an entity type from a builder; declaration errors surface from [`build`](Self::build).
    pub fn entity(self, entity: Result<EntityType>) -> Self {
        match entity {
            Ok(entity) => self.register(entity),
            Err(err) => {
                let mut builder = self;
                builder.record(Err(err));
                builder
            }
        }
    }

    pub fn backend(mut self, store: StoreKind, port: Arc<dyn PersistencePort>) -> Self {
        let result = self.backends.register(store, port);
        self.record(result);
        self
    }

    /// A backend whose expired records are also purged by the background sweep.
    pub fn expiring_backend<P>(mut self, store: StoreKind, port: Arc<P>) -> Self
    where
        P: PersistencePort + ExpirySweep + 'static,
    {
        self.sweep_targets.push(port.clone());
        self.backend(store, port)
    }

    /// Adds something the background sweep should purge of expired entries.
    pub fn sweep_target(mut self, target: Arc<dyn ExpirySweep>) -> Self {
        self.sweep_targets.push(target);
        self
    }

    pub fn custom_backend(mut self, name: &str, port: Arc<dyn PersistencePort>) -> Self {
        let result = self.backends.register_custom(name, port);
        self.record(result);
        self
    }

    pub fn build(mut self) -> Result<LiveState> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        self.config.validate()?;

        if !self.backends.contains(StoreKind::Memory.as_str()) {
            let memory = Arc::new(MemoryPersistence::new());
            self.sweep_targets.push(memory.clone());
            self.backends.register(StoreKind::Memory, memory)?;
        }

        let bus = EventBus::new(self.config.bus_capacity);
        let cache = Arc::new(StateCache::new(self.config.cache_capacity));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(self.registry),
            cache,
            self.backends,
            bus.clone(),
            self.config.dispatch_settings(),
        )?);
        let connections = ConnectionManager::new(self.config.connection.clone(), bus)?;

        Ok(LiveState {
            config: self.config,
            dispatcher,
            connections,
            sweep_targets: self.sweep_targets,
            workers: Mutex::new(None),
        })
    }
}

/// One live-state engine. Create it at startup, share it by `Arc`, and call
/// [`shutdown`](Self::shutdown) before exit.
pub struct LiveState {
    config: EngineConfig,
    dispatcher: Arc<Dispatcher>,
    connections: ConnectionManager,
    sweep_targets: Vec<Arc<dyn ExpirySweep>>,
    workers: Mutex<Option<Workers>>,
}

impl LiveState {
    pub fn builder() -> LiveStateBuilder {
        LiveStateBuilder::new()
    }

    /// Spawns the expiry sweep and heartbeat workers. Calling it twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if workers.is_some() {
            return Ok(());
        }

        let mut targets: Vec<Arc<dyn ExpirySweep>> = Vec::with_capacity(self.sweep_targets.len() + 1);
        targets.push(self.dispatcher.clone());
        targets.extend(self.sweep_targets.iter().cloned());

        let sweep = spawn_sweep_worker(targets, self.config.sweep_interval)?;
        let heartbeat = spawn_heartbeat_worker(self.connections.clone())?;
        *workers = Some(Workers { sweep, heartbeat });

        info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            heartbeat_ms = self.config.connection.heartbeat_interval.as_millis() as u64,
            "live state engine started"
        );
        Ok(())
    }

    /// Stops the workers and closes every connection.
    pub async fn shutdown(&self) -> Result<()> {
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(Workers { sweep, heartbeat }) = workers {
            if let Err(err) = sweep.stop().await {
                warn!(error = %err, "sweep worker did not stop cleanly");
            }
            if let Err(err) = heartbeat.stop().await {
                warn!(error = %err, "heartbeat worker did not stop cleanly");
            }
        }

        let closed = self.connections.close_all(CloseReason::Shutdown);
        info!(closed, "live state engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn registry(&self) -> &EntityRegistry {
        self.dispatcher.registry()
    }

    pub fn resolve_key(&self, entity_type: &str, context: &ScopeContext) -> Result<StateKey> {
        self.dispatcher.resolve_key(entity_type, context)
    }

    pub async fn dispatch(&self, request: CommandRequest) -> Result<DispatchOutcome> {
        self.dispatcher.dispatch(request).await
    }

    /// Resolves the key from `context` and dispatches `method` with `arguments`.
    pub async fn command(
        &self,
        entity_type: &str,
        method: &str,
        context: &ScopeContext,
        arguments: FieldMap,
        actor: Option<Actor>,
    ) -> Result<DispatchOutcome> {
        let key = self.resolve_key(entity_type, context)?;
        let mut request = CommandRequest::new(key, method).arguments(arguments);
        request.actor = actor;
        self.dispatch(request).await
    }

    pub async fn state(&self, key: &StateKey) -> Result<EntityInstance> {
        self.dispatcher.state(key).await
    }

    pub async fn delete(&self, key: &StateKey) -> Result<bool> {
        self.dispatcher.delete(key).await
    }

    /// Opens a client connection. Every key must address a registered entity.
    pub fn open_connection(&self, keys: Vec<StateKey>) -> Result<Connection> {
        for key in &keys {
            self.dispatcher.validate_key(key)?;
        }
        self.connections.open_connection(keys)
    }

    pub fn subscribe(&self, connection: ConnectionId, key: StateKey) -> Result<bool> {
        self.dispatcher.validate_key(&key)?;
        self.connections.add_subscription(connection, key)
    }

    pub fn unsubscribe(&self, connection: ConnectionId, key: &StateKey) -> Result<bool> {
        self.connections.remove_subscription(connection, key)
    }

    pub fn acknowledge(&self, connection: ConnectionId) -> Result<()> {
        self.connections.acknowledge(connection)
    }

    /// Runs one sweep pass immediately instead of waiting for the worker.
    pub async fn sweep_now(&self) -> usize {
        let mut removed = self.dispatcher.sweep().await;
        for target in &self.sweep_targets {
            match target.sweep_expired().await {
                Ok(count) => removed += count,
                Err(err) => warn!(sweep = target.name(), error = %err, "expiry sweep failed"),
            }
        }
        removed
    }

    pub fn stats(&self) -> EngineStats {
        let cache = self.dispatcher.cache().stats();
        let connections = self.connections.stats();
        EngineStats {
            entity_types: self.registry().len(),
            cached_entries: cache.entries,
            cache_capacity: cache.capacity,
            connections: connections.connections,
            subscriptions: connections.subscriptions,
            bus_subscribers: self.dispatcher.bus().subscriber_count(),
            published_events: self.dispatcher.bus().published_total(),
            running: self.is_running(),
        }
    }
}
