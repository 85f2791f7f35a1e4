//! Scope resolution: turns an entity type, its declared scope and the request
//! context into the [`StateKey`] that addresses one cached instance.

use crate::core::{Result, ScopeKind, StateError, StateKey};
use serde::{Deserialize, Serialize};

/// Contextual identifiers extracted from an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeContext {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub component_id: Option<String>,
    pub record_id: Option<String>,
}

impl ScopeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn user(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn component(mut self, id: impl Into<String>) -> Self {
        self.component_id = Some(id.into());
        self
    }

    pub fn record(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    fn identifier_for(&self, scope: ScopeKind) -> Option<&str> {
        let raw = match scope {
            ScopeKind::Global => return None,
            ScopeKind::Session => self.session_id.as_deref(),
            ScopeKind::User => self.user_id.as_deref(),
            ScopeKind::Component => self.component_id.as_deref(),
            ScopeKind::Record => self.record_id.as_deref(),
        };
        raw.map(str::trim).filter(|id| !id.is_empty())
    }
}

/// Derives the cache key for an entity instance.
///
/// Pure: no normalization beyond trimming is applied, callers supply canonical ids.
pub fn resolve(entity_type: &str, scope: ScopeKind, context: &ScopeContext) -> Result<StateKey> {
    if scope == ScopeKind::Global {
        return Ok(StateKey::global(entity_type));
    }

    match context.identifier_for(scope) {
        Some(id) => Ok(StateKey::scoped(scope, entity_type, id)),
        None => Err(StateError::MissingContext {
            entity_type: entity_type.to_string(),
            scope,
            missing: scope.context_name().unwrap_or("context id"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_scope_ignores_context() {
        let ctx = ScopeContext::new().session("s-1").user("u-1");
        assert_eq!(
            resolve("Counter", ScopeKind::Global, &ctx).unwrap(),
            StateKey::global("Counter")
        );
        assert_eq!(
            resolve("Counter", ScopeKind::Global, &ScopeContext::new()).unwrap(),
            StateKey::global("Counter")
        );
    }

    #[test]
    fn scoped_keys_use_matching_identifier() {
        let ctx = ScopeContext::new()
            .session("s-1")
            .user("u-1")
            .component("c-1")
            .record(" 42 ");

        assert_eq!(
            resolve("Cart", ScopeKind::Session, &ctx).unwrap(),
            StateKey::scoped(ScopeKind::Session, "Cart", "s-1")
        );
        assert_eq!(
            resolve("Prefs", ScopeKind::User, &ctx).unwrap().context_id.as_deref(),
            Some("u-1")
        );
        assert_eq!(
            resolve("Widget", ScopeKind::Component, &ctx).unwrap().context_id.as_deref(),
            Some("c-1")
        );
        assert_eq!(
            resolve("Invoice", ScopeKind::Record, &ctx).unwrap().context_id.as_deref(),
            Some("42")
        );
    }

    #[test]
    fn missing_or_blank_identifier_is_an_error() {
        let err = resolve("Invoice", ScopeKind::Record, &ScopeContext::new().session("s")).unwrap_err();
        assert!(matches!(
            err,
            StateError::MissingContext {
                scope: ScopeKind::Record,
                missing: "record id",
                ..
            }
        ));

        let blank = ScopeContext::new().session("   ");
        assert!(resolve("Cart", ScopeKind::Session, &blank).is_err());
    }
}
