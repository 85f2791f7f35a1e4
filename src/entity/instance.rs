use crate::core::{FieldMap, StateKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mutable snapshot of one entity's field values.
///
/// `version` increases by one with every committed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInstance {
    pub key: StateKey,
    pub fields: FieldMap,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityInstance {
    pub fn new(key: StateKey, fields: FieldMap) -> Self {
        let now = Utc::now();
        Self {
            key,
            fields,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}
