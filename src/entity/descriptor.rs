use super::config::EntityConfig;
use crate::core::{CommandError, FieldMap, FieldSpec, ScopeKind};
use crate::dispatch::CommandContext;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A method parameter. Parameters without a default are required.
pub type ParamSpec = FieldSpec;

/// Callable behind a method name.
///
/// Runs against a working copy of the instance's fields; returning an error discards the copy.
pub type MethodHandler =
    Arc<dyn Fn(&mut CommandContext<'_>) -> std::result::Result<Option<Value>, CommandError> + Send + Sync>;

/// Immutable metadata of an entity type, built once at registration.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor {
    pub name: String,
    pub scope: ScopeKind,
    pub fields: Vec<FieldSpec>,
    pub config: EntityConfig,
}

impl EntityDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Fresh field values for a new instance.
    pub fn default_fields(&self) -> FieldMap {
        self.fields
            .iter()
            .map(|field| {
                (
                    field.name.clone(),
                    field.default.clone().unwrap_or(Value::Null),
                )
            })
            .collect()
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.config.ttl()
    }

    pub fn is_durable(&self) -> bool {
        self.config.store.is_durable()
    }
}

/// A named method with its declared parameters.
#[derive(Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub handler: MethodHandler,
}

impl MethodDescriptor {
    pub fn new<F>(name: impl Into<String>, params: Vec<ParamSpec>, handler: F) -> Self
    where
        F: Fn(&mut CommandContext<'_>) -> std::result::Result<Option<Value>, CommandError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            params,
            handler: Arc::new(handler),
        }
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|param| param.name == name)
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}
