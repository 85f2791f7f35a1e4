//! Command dispatch: resolve the instance, bind arguments, run the method under the
//! per-key lock, diff, persist and publish.

pub mod binding;
pub mod context;
pub mod diff;

pub use binding::{BoundArgs, bind_arguments};
pub use context::CommandContext;
pub use diff::{DiffEvent, Fragment, MergeMode, changed_fields};

use crate::bus::EventBus;
use crate::cache::{SharedInstance, StateCache};
use crate::core::{CommandError, FieldMap, Result, ScopeKind, StateError, StateKey};
use crate::entity::{EntityDescriptor, EntityInstance, EntityRegistry};
use crate::persist::{PersistenceBackends, PersistencePort};
use crate::scope::{ScopeContext, resolve};
use crate::worker::ExpirySweep;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span, warn};

/// Who issued a command. Opaque to the core beyond being handed to the method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: Vec::new(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub key: StateKey,
    pub method: String,
    pub arguments: FieldMap,
    pub actor: Option<Actor>,
}

impl CommandRequest {
    pub fn new(key: StateKey, method: impl Into<String>) -> Self {
        Self {
            key,
            method: method.into(),
            arguments: FieldMap::new(),
            actor: None,
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    pub fn arguments(mut self, arguments: FieldMap) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Committed {
        version: u64,
        result: Option<Value>,
    },
    /// The method refused the command; the instance is unchanged.
    Rejected(CommandError),
}

/// Result of one dispatch. `diff` is present exactly when the command committed.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub diff: Option<DiffEvent>,
    pub outcome: CommandOutcome,
}

impl DispatchOutcome {
    fn rejected(err: CommandError) -> Self {
        Self {
            diff: None,
            outcome: CommandOutcome::Rejected(err),
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.outcome, CommandOutcome::Committed { .. })
    }

    /// Folds a rejection into `StateError::CommandExecution`.
    pub fn into_result(self) -> Result<(DiffEvent, Option<Value>)> {
        match (self.diff, self.outcome) {
            (Some(diff), CommandOutcome::Committed { result, .. }) => Ok((diff, result)),
            (_, CommandOutcome::Rejected(err)) => Err(StateError::CommandExecution(err)),
            (None, CommandOutcome::Committed { version, .. }) => Err(StateError::KeyMismatch(
                format!("committed version {version} without a diff"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    pub timeout: Duration,
    pub max_fragments: usize,
    /// Applies to entity types that declare no TTL of their own.
    pub default_ttl: Option<Duration>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            max_fragments: 64,
            default_ttl: None,
        }
    }
}

pub struct Dispatcher {
    registry: Arc<EntityRegistry>,
    cache: Arc<StateCache>,
    backends: PersistenceBackends,
    bus: EventBus,
    settings: DispatchSettings,
}

impl Dispatcher {
    /// Fails when a registered entity routes to a backend that was never provided.
    pub fn new(
        registry: Arc<EntityRegistry>,
        cache: Arc<StateCache>,
        backends: PersistenceBackends,
        bus: EventBus,
        settings: DispatchSettings,
    ) -> Result<Self> {
        if settings.timeout.is_zero() {
            return Err(StateError::InvalidConfig(
                "dispatch timeout must be > 0".to_string(),
            ));
        }
        for entity in registry.iter() {
            backends.for_entity(&entity.descriptor().config)?;
        }

        Ok(Self {
            registry,
            cache,
            backends,
            bus,
            settings,
        })
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Checks that `key` addresses a registered entity under its declared scope.
    pub fn validate_key(&self, key: &StateKey) -> Result<()> {
        let entity = self.registry.get(&key.entity_type)?;
        check_key(entity.descriptor(), key)
    }

    /// Key of the instance `entity_type` resolves to under `context`.
    pub fn resolve_key(&self, entity_type: &str, context: &ScopeContext) -> Result<StateKey> {
        let entity = self.registry.get(entity_type)?;
        resolve(entity.name(), entity.descriptor().scope, context)
    }

    /// Runs one command to completion or failure within the configured timeout.
    ///
    /// A method rejection is an `Ok` outcome carrying the error; everything else that stops
    /// the command is an `Err`. Neither publishes anything.
    pub async fn dispatch(&self, request: CommandRequest) -> Result<DispatchOutcome> {
        let span = info_span!(
            "dispatch",
            entity = %request.key.entity_type,
            method = %request.method,
            key = %request.key,
        );
        let timeout = self.settings.timeout;

        match tokio::time::timeout(timeout, self.execute(request))
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "command timed out");
                Err(StateError::Timeout(timeout))
            }
        }
    }

    async fn execute(&self, request: CommandRequest) -> Result<DispatchOutcome> {
        let entity = self.registry.get(&request.key.entity_type)?;
        let descriptor = entity.descriptor();
        check_key(descriptor, &request.key)?;
        let method = entity.method(&request.method)?;
        let args = bind_arguments(method, &request.arguments)?;
        let port = self.backends.for_entity(&descriptor.config)?;

        let shared = self.load_shared(descriptor, &request.key, port.as_ref()).await?;
        let mut live = shared.lock().await;

        let before = live.fields.clone();
        let mut working = before.clone();
        let mut fragments = Vec::new();
        let handled = {
            let mut ctx = CommandContext::new(
                &request.key,
                request.actor.as_ref(),
                &args,
                &mut working,
                &descriptor.fields,
                &mut fragments,
                self.settings.max_fragments,
            );
            (method.handler)(&mut ctx)
        };

        let result = match handled {
            Ok(result) => result,
            Err(err) => {
                event!(Level::DEBUG, code = %err.code, "command rejected by method");
                return Ok(DispatchOutcome::rejected(err));
            }
        };

        let changed = changed_fields(&before, &working);
        let mut next = live.clone();
        next.fields = working;
        next.version += 1;
        next.updated_at = Utc::now();

        if descriptor.config.auto_persist {
            if let Some(port) = port.as_ref() {
                port.save(&request.key, &next, self.ttl_for(descriptor))
                    .await
                    .map_err(into_persistence)?;
            }
        }

        let version = next.version;
        *live = next;

        let diff = DiffEvent {
            key: request.key.clone(),
            version,
            changed_fields: changed,
            fragments,
            namespaced: descriptor.config.namespaced,
        };
        // Published while the key lock is held so per-key bus order matches version order.
        let mut delivered = 0;
        for part in diff.split_for_publish() {
            delivered += self.bus.publish(part);
        }
        drop(live);

        event!(
            Level::DEBUG,
            version,
            changed = diff.changed_fields.len(),
            fragments = diff.fragments.len(),
            delivered,
            "command committed"
        );

        Ok(DispatchOutcome {
            diff: Some(diff),
            outcome: CommandOutcome::Committed { version, result },
        })
    }

    fn ttl_for(&self, descriptor: &EntityDescriptor) -> Option<Duration> {
        descriptor.ttl().or(self.settings.default_ttl)
    }

    async fn load_shared(
        &self,
        descriptor: &EntityDescriptor,
        key: &StateKey,
        port: Option<&Arc<dyn PersistencePort>>,
    ) -> Result<SharedInstance> {
        self.cache
            .get_or_create(key, self.ttl_for(descriptor), || async move {
                let loaded = match port {
                    Some(port) => match port.load(key).await {
                        Ok(found) => found,
                        Err(err) if descriptor.config.load_miss_tolerant => {
                            warn!(key = %key, error = %err, "load failed, starting from defaults");
                            None
                        }
                        Err(err) => return Err(into_persistence(err)),
                    },
                    None => None,
                };

                Ok(match loaded {
                    Some(mut instance) => {
                        for (name, default) in descriptor.default_fields() {
                            instance.fields.entry(name).or_insert(default);
                        }
                        instance.key = key.clone();
                        instance
                    }
                    None => EntityInstance::new(key.clone(), descriptor.default_fields()),
                })
            })
            .await
    }

    /// Snapshot of the instance at `key`, creating it when absent.
    pub async fn state(&self, key: &StateKey) -> Result<EntityInstance> {
        let entity = self.registry.get(&key.entity_type)?;
        let descriptor = entity.descriptor();
        check_key(descriptor, key)?;
        let port = self.backends.for_entity(&descriptor.config)?;

        let shared = self.load_shared(descriptor, key, port.as_ref()).await?;
        let snapshot = shared.lock().await.clone();
        Ok(snapshot)
    }

    /// Drops the instance from the cache and its backend. Returns whether anything existed.
    ///
    /// The key's lock is held until the backend delete returns, so a concurrent command or
    /// read waits and then sees a fresh default instance.
    pub async fn delete(&self, key: &StateKey) -> Result<bool> {
        let entity = self.registry.get(&key.entity_type)?;
        let descriptor = entity.descriptor();
        check_key(descriptor, key)?;
        let port = self.backends.for_entity(&descriptor.config)?;

        let cached = self.cache.contains(key);
        let shared = self.load_shared(descriptor, key, port.as_ref()).await?;
        let mut live = shared.lock().await;

        let stored = match port.as_ref() {
            Some(port) => port.delete(key).await.map_err(into_persistence)?,
            None => false,
        };
        *live = EntityInstance::new(key.clone(), descriptor.default_fields());
        drop(live);
        drop(shared);

        // A waiter already holds the reset instance; leave it cached for them.
        let evicted = self.cache.evict_idle(key);
        event!(Level::DEBUG, key = %key, cached, stored, evicted, "instance deleted");
        Ok(cached || stored)
    }

    /// One cache sweep pass. Evicted instances are dropped; only auto-persisted entities
    /// have their state in a backend.
    pub async fn sweep(&self) -> usize {
        self.cache.sweep_expired().len()
    }
}

#[async_trait]
impl ExpirySweep for Dispatcher {
    fn name(&self) -> &'static str {
        "state-cache"
    }

    async fn sweep_expired(&self) -> Result<usize> {
        Ok(self.sweep().await)
    }
}

fn check_key(descriptor: &EntityDescriptor, key: &StateKey) -> Result<()> {
    if key.scope != descriptor.scope {
        return Err(StateError::KeyMismatch(format!(
            "'{}' is declared with {} scope, got key '{}'",
            descriptor.name, descriptor.scope, key
        )));
    }
    if key.context_id.is_some() == (key.scope == ScopeKind::Global) {
        return Err(StateError::KeyMismatch(format!(
            "key '{key}' has an invalid context id for {} scope",
            key.scope
        )));
    }
    Ok(())
}

fn into_persistence(err: StateError) -> StateError {
    match err {
        StateError::Persistence(_) => err,
        other => StateError::Persistence(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FieldSpec, FieldType};
    use crate::entity::EntityType;
    use crate::persist::MemoryPersistence;
    use crate::entity::StoreKind;
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        let mut registry = EntityRegistry::new();
        registry
            .register(
                EntityType::builder("Cart")
                    .scope(ScopeKind::Session)
                    .field("items", FieldType::List(Box::new(FieldType::Text)), json!([]))
                    .method(
                        "add",
                        vec![FieldSpec::new("item", FieldType::Text)],
                        |ctx| {
                            let item = ctx.arg_str("item")?.to_string();
                            if item.is_empty() {
                                return Err(CommandError::validation("item name is empty"));
                            }
                            let mut items = ctx.get("items").cloned().unwrap_or(json!([]));
                            if let Some(list) = items.as_array_mut() {
                                list.push(json!(item));
                            }
                            ctx.set("items", items)?;
                            Ok(None)
                        },
                    )
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let mut backends = PersistenceBackends::new();
        backends
            .register(StoreKind::Memory, Arc::new(MemoryPersistence::new()))
            .unwrap();

        Dispatcher::new(
            Arc::new(registry),
            Arc::new(StateCache::default()),
            backends,
            EventBus::new(16),
            DispatchSettings::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn rejected_command_leaves_instance_untouched() {
        let dispatcher = dispatcher();
        let key = StateKey::scoped(ScopeKind::Session, "Cart", "s-1");

        let ok = dispatcher
            .dispatch(CommandRequest::new(key.clone(), "add").arg("item", "apple"))
            .await
            .unwrap();
        assert!(ok.is_committed());

        let rejected = dispatcher
            .dispatch(CommandRequest::new(key.clone(), "add").arg("item", ""))
            .await
            .unwrap();
        assert!(rejected.diff.is_none());
        assert!(matches!(
            rejected.into_result(),
            Err(StateError::CommandExecution(ref err)) if err.is_validation()
        ));

        let state = dispatcher.state(&key).await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.fields.get("items"), Some(&json!(["apple"])));
    }

    #[tokio::test]
    async fn key_scope_must_match_declaration() {
        let dispatcher = dispatcher();
        let err = dispatcher
            .dispatch(CommandRequest::new(StateKey::global("Cart"), "add").arg("item", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::KeyMismatch(_)));
        assert!(dispatcher.cache().is_empty());

        let err = dispatcher
            .dispatch(CommandRequest::new(StateKey::global("Ghost"), "add"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::UnknownEntity(_)));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let dispatcher = dispatcher();
        let key = StateKey::scoped(ScopeKind::Session, "Cart", "s-9");
        assert!(!dispatcher.delete(&key).await.unwrap());

        dispatcher.state(&key).await.unwrap();
        assert!(dispatcher.delete(&key).await.unwrap());
        assert!(!dispatcher.cache().contains(&key));
    }

    #[test]
    fn unregistered_backend_fails_construction() {
        let mut registry = EntityRegistry::new();
        registry
            .register(
                EntityType::builder("Report")
                    .config(crate::entity::EntityConfig::new().store(StoreKind::Sql))
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let result = Dispatcher::new(
            Arc::new(registry),
            Arc::new(StateCache::default()),
            PersistenceBackends::new(),
            EventBus::new(4),
            DispatchSettings::default(),
        );
        assert!(matches!(result, Err(StateError::InvalidConfig(_))));
    }
}
