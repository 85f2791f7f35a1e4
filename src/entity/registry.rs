use super::config::EntityConfig;
use super::descriptor::{EntityDescriptor, MethodDescriptor};
use crate::core::{CommandError, FieldSpec, FieldType, Result, ScopeKind, StateError};
use crate::dispatch::CommandContext;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A registered entity type: its descriptor plus the method table the dispatcher consults.
#[derive(Debug, Clone)]
pub struct EntityType {
    descriptor: EntityDescriptor,
    methods: HashMap<String, MethodDescriptor>,
}

impl EntityType {
    pub fn builder(name: impl Into<String>) -> EntityTypeBuilder {
        EntityTypeBuilder::new(name)
    }

    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn method(&self, name: &str) -> Result<&MethodDescriptor> {
        self.methods
            .get(name)
            .ok_or_else(|| StateError::UnknownMethod {
                entity_type: self.descriptor.name.clone(),
                method: name.to_string(),
            })
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

/// Declares an entity type once: fields with defaults, scope, options and methods.
pub struct EntityTypeBuilder {
    name: String,
    scope: ScopeKind,
    fields: Vec<FieldSpec>,
    config: Result<EntityConfig>,
    methods: Vec<MethodDescriptor>,
}

impl EntityTypeBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: ScopeKind::Global,
            fields: Vec::new(),
            config: Ok(EntityConfig::default()),
            methods: Vec::new(),
        }
    }

    pub fn scope(mut self, scope: ScopeKind) -> Self {
        self.scope = scope;
        self
    }

    pub fn field(mut self, name: impl Into<String>, ty: FieldType, default: Value) -> Self {
        self.fields.push(FieldSpec::new(name, ty).with_default(default));
        self
    }

    pub fn config(mut self, config: EntityConfig) -> Self {
        self.config = Ok(config);
        self
    }

    /// Options given as a loosely-typed map; errors surface from [`build`](Self::build).
    pub fn config_json(mut self, options: Value) -> Self {
        self.config = EntityConfig::from_json(options);
        self
    }

    pub fn method<F>(mut self, name: impl Into<String>, params: Vec<FieldSpec>, handler: F) -> Self
    where
        F: Fn(&mut CommandContext<'_>) -> std::result::Result<Option<Value>, CommandError>
            + Send
            + Sync
            + 'static,
    {
        self.methods.push(MethodDescriptor::new(name, params, handler));
        self
    }

    pub fn build(self) -> Result<EntityType> {
        let config = self.config?;
        config.validate()?;
        validate_name("entity type", &self.name)?;
        if self.name.contains(':') {
            return Err(StateError::InvalidConfig(format!(
                "entity type '{}' must not contain ':'",
                self.name
            )));
        }

        let mut field_names = HashSet::new();
        for field in &self.fields {
            validate_name("field", &field.name)?;
            if !field_names.insert(field.name.as_str()) {
                return Err(StateError::InvalidConfig(format!(
                    "duplicate field '{}' on '{}'",
                    field.name, self.name
                )));
            }
            let default = field.default.as_ref().unwrap_or(&Value::Null);
            if !field.ty.accepts(default) {
                return Err(StateError::InvalidConfig(format!(
                    "default for field '{}.{}' is not a valid {}",
                    self.name, field.name, field.ty
                )));
            }
        }

        let mut methods = HashMap::with_capacity(self.methods.len());
        for method in self.methods {
            validate_name("method", &method.name)?;
            let mut param_names = HashSet::new();
            for param in &method.params {
                validate_name("parameter", &param.name)?;
                if !param_names.insert(param.name.as_str()) {
                    return Err(StateError::InvalidConfig(format!(
                        "duplicate parameter '{}' on '{}.{}'",
                        param.name, self.name, method.name
                    )));
                }
                let bad_default = param
                    .default
                    .as_ref()
                    .is_some_and(|default| !default.is_null() && !param.ty.accepts(default));
                if bad_default {
                    return Err(StateError::InvalidConfig(format!(
                        "default for parameter '{}' of '{}.{}' is not a valid {}",
                        param.name, self.name, method.name, param.ty
                    )));
                }
            }
            if methods.contains_key(&method.name) {
                return Err(StateError::InvalidConfig(format!(
                    "duplicate method '{}' on '{}'",
                    method.name, self.name
                )));
            }
            methods.insert(method.name.clone(), method);
        }

        Ok(EntityType {
            descriptor: EntityDescriptor {
                name: self.name,
                scope: self.scope,
                fields: self.fields,
                config,
            },
            methods,
        })
    }
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() || name.trim() != name {
        return Err(StateError::InvalidConfig(format!(
            "{kind} name '{name}' must be non-empty without surrounding whitespace"
        )));
    }
    Ok(())
}

/// All entity types known to one engine.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    types: HashMap<String, Arc<EntityType>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity: EntityType) -> Result<()> {
        if self.types.contains_key(entity.name()) {
            return Err(StateError::InvalidConfig(format!(
                "entity type '{}' is already registered",
                entity.name()
            )));
        }
        self.types.insert(entity.name().to_string(), Arc::new(entity));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<EntityType>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| StateError::UnknownEntity(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
