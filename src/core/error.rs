use crate::core::key::ScopeKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Domain-level failure raised by an entity method.
///
/// Carried back to the caller of the command that produced it; never broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    pub code: String,
    pub message: String,
}

impl CommandError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Business-rule validation failure (`code = "validation"`).
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation", message)
    }

    pub fn is_validation(&self) -> bool {
        self.code == "validation"
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CommandError {}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("{scope} scope for '{entity_type}' requires a {missing}")]
    MissingContext {
        entity_type: String,
        scope: ScopeKind,
        missing: &'static str,
    },

    #[error("Cannot bind arguments for '{method}': {message}")]
    ArgumentBinding { method: String, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Command rejected: {0}")]
    CommandExecution(CommandError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection {0} is closed")]
    ConnectionClosed(Uuid),

    #[error("Entity type '{0}' is not registered")]
    UnknownEntity(String),

    #[error("Method '{method}' is not registered for entity type '{entity_type}'")]
    UnknownMethod { entity_type: String, method: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Subscription limit reached: {0}")]
    SubscriptionLimit(String),

    #[error("State key mismatch: {0}")]
    KeyMismatch(String),
}

impl StateError {
    pub fn binding(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ArgumentBinding {
            method: method.into(),
            message: message.into(),
        }
    }
}

impl From<CommandError> for StateError {
    fn from(err: CommandError) -> Self {
        Self::CommandExecution(err)
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(format!("serialization: {err}"))
    }
}

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StateError>;
