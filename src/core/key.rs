use super::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sharing boundary of an entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Global,
    Session,
    User,
    Component,
    Record,
}

impl ScopeKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Global => "global",
            ScopeKind::Session => "session",
            ScopeKind::User => "user",
            ScopeKind::Component => "component",
            ScopeKind::Record => "record",
        }
    }

    /// Name of the context identifier this scope is keyed by.
    pub const fn context_name(&self) -> Option<&'static str> {
        match self {
            ScopeKind::Global => None,
            ScopeKind::Session => Some("session id"),
            ScopeKind::User => Some("user id"),
            ScopeKind::Component => Some("component id"),
            ScopeKind::Record => Some("record id"),
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeKind {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "global" => Ok(ScopeKind::Global),
            "session" => Ok(ScopeKind::Session),
            "user" => Ok(ScopeKind::User),
            "component" => Ok(ScopeKind::Component),
            "record" => Ok(ScopeKind::Record),
            other => Err(StateError::KeyMismatch(format!("unknown scope '{other}'"))),
        }
    }
}

/// Address of exactly one entity instance.
///
/// Equality and hashing define cache identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub scope: ScopeKind,
    pub entity_type: String,
    pub context_id: Option<String>,
}

impl StateKey {
    pub fn global(entity_type: impl Into<String>) -> Self {
        Self {
            scope: ScopeKind::Global,
            entity_type: entity_type.into(),
            context_id: None,
        }
    }

    pub fn scoped(
        scope: ScopeKind,
        entity_type: impl Into<String>,
        context_id: impl Into<String>,
    ) -> Self {
        Self {
            scope,
            entity_type: entity_type.into(),
            context_id: Some(context_id.into()),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context_id {
            Some(context) => write!(f, "{}:{}:{}", self.scope, self.entity_type, context),
            None => write!(f, "{}:{}", self.scope, self.entity_type),
        }
    }
}

impl FromStr for StateKey {
    type Err = StateError;

    /// Parses `scope:Entity` or `scope:Entity:context`. The context part may itself contain `:`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().splitn(3, ':');
        let scope: ScopeKind = parts.next().unwrap_or_default().parse()?;
        let entity_type = parts
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| StateError::KeyMismatch(format!("missing entity type in '{s}'")))?;
        let context_id = parts.next().map(str::to_string);

        match (scope, context_id) {
            (ScopeKind::Global, None) => Ok(StateKey::global(entity_type)),
            (ScopeKind::Global, Some(_)) => Err(StateError::KeyMismatch(format!(
                "global key '{s}' must not carry a context id"
            ))),
            (_, None) => Err(StateError::KeyMismatch(format!(
                "{scope} key '{s}' requires a context id"
            ))),
            (_, Some(context)) if context.is_empty() => Err(StateError::KeyMismatch(format!(
                "{scope} key '{s}' has an empty context id"
            ))),
            (_, Some(context)) => Ok(StateKey::scoped(scope, entity_type, context)),
        }
    }
}
