use crate::core::{FieldMap, StateError, StateKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// How a rendered fragment is merged into the client's document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    #[default]
    Morph,
    Inner,
    Outer,
    Append,
    Prepend,
    Delete,
}

impl MergeMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MergeMode::Morph => "morph",
            MergeMode::Inner => "inner",
            MergeMode::Outer => "outer",
            MergeMode::Append => "append",
            MergeMode::Prepend => "prepend",
            MergeMode::Delete => "delete",
        }
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeMode {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "morph" => Ok(MergeMode::Morph),
            "inner" => Ok(MergeMode::Inner),
            "outer" => Ok(MergeMode::Outer),
            "append" => Ok(MergeMode::Append),
            "prepend" => Ok(MergeMode::Prepend),
            "delete" => Ok(MergeMode::Delete),
            other => Err(StateError::InvalidConfig(format!("unknown merge mode '{other}'"))),
        }
    }
}

/// Pre-rendered output attached to a diff. The content is opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub content: String,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub mode: MergeMode,
}

impl Fragment {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            selector: None,
            mode: MergeMode::default(),
        }
    }

    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn mode(mut self, mode: MergeMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Observable delta of one committed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEvent {
    pub key: StateKey,
    pub version: u64,
    pub changed_fields: FieldMap,
    #[serde(default)]
    pub fragments: Vec<Fragment>,
    /// Signals are nested under the entity type name on the wire.
    #[serde(default)]
    pub namespaced: bool,
}

impl DiffEvent {
    pub fn is_empty(&self) -> bool {
        self.changed_fields.is_empty() && self.fragments.is_empty()
    }

    /// Splits into the sequence published on the bus: one event per fragment, all sharing
    /// the version, the first also carrying the changed fields.
    pub fn split_for_publish(&self) -> Vec<DiffEvent> {
        if self.fragments.len() <= 1 {
            return vec![self.clone()];
        }

        self.fragments
            .iter()
            .enumerate()
            .map(|(idx, fragment)| DiffEvent {
                key: self.key.clone(),
                version: self.version,
                changed_fields: if idx == 0 {
                    self.changed_fields.clone()
                } else {
                    FieldMap::new()
                },
                fragments: vec![fragment.clone()],
                namespaced: self.namespaced,
            })
            .collect()
    }

    /// The signals payload as sent to clients.
    pub fn signals(&self) -> Value {
        let fields = Value::Object(self.changed_fields.clone());
        if self.namespaced {
            let mut wrapped = FieldMap::new();
            wrapped.insert(self.key.entity_type.clone(), fields);
            Value::Object(wrapped)
        } else {
            fields
        }
    }
}

/// Fields whose value differs between `before` and `after` (deep value equality).
///
/// A field present before but gone after is reported as `null`.
pub fn changed_fields(before: &FieldMap, after: &FieldMap) -> FieldMap {
    let mut changed: FieldMap = after
        .iter()
        .filter(|(name, value)| before.get(name.as_str()) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    for name in before.keys() {
        if !after.contains_key(name) {
            changed.insert(name.clone(), Value::Null);
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn only_changed_fields_are_reported() {
        let before = map(json!({"count": 1, "label": "a", "tags": ["x"], "meta": {"n": 1}}));
        let after = map(json!({"count": 1, "label": "b", "tags": ["x"], "meta": {"n": 2}}));

        let changed = changed_fields(&before, &after);
        assert_eq!(changed, map(json!({"label": "b", "meta": {"n": 2}})));
    }

    #[test]
    fn identical_snapshots_yield_empty_diff() {
        let fields = map(json!({"items": [1, 2, {"deep": true}]}));
        assert!(changed_fields(&fields, &fields.clone()).is_empty());
    }

    #[test]
    fn removed_field_is_reported_as_null() {
        let before = map(json!({"a": 1, "b": 2}));
        let after = map(json!({"a": 1}));
        assert_eq!(changed_fields(&before, &after), map(json!({"b": null})));
    }

    #[test]
    fn split_shares_version_and_keeps_fields_on_first() {
        let diff = DiffEvent {
            key: StateKey::global("Feed"),
            version: 4,
            changed_fields: map(json!({"count": 2})),
            fragments: vec![
                Fragment::new("<li>a</li>").selector("#feed").mode(MergeMode::Append),
                Fragment::new("<li>b</li>").selector("#feed").mode(MergeMode::Append),
            ],
            namespaced: false,
        };

        let parts = diff.split_for_publish();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|part| part.version == 4 && part.fragments.len() == 1));
        assert_eq!(parts[0].changed_fields, map(json!({"count": 2})));
        assert!(parts[1].changed_fields.is_empty());
    }

    #[test]
    fn namespaced_signals_nest_under_entity_name() {
        let diff = DiffEvent {
            key: StateKey::global("Counter"),
            version: 1,
            changed_fields: map(json!({"count": 5})),
            fragments: Vec::new(),
            namespaced: true,
        };
        assert_eq!(diff.signals(), json!({"Counter": {"count": 5}}));
        assert_eq!("inner".parse::<MergeMode>().unwrap(), MergeMode::Inner);
    }
}
