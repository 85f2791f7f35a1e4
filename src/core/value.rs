use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Field values of one entity instance, keyed by field name.
pub type FieldMap = serde_json::Map<String, Value>;

/// Declared type of an entity field or method parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int,
    Float,
    Bool,
    Text,
    List(Box<FieldType>),
    Record(Vec<FieldSpec>),
    Any,
}

/// A named, typed slot with an optional default value.
///
/// Used for entity fields, record members and method parameters alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Int => f.write_str("int"),
            FieldType::Float => f.write_str("float"),
            FieldType::Bool => f.write_str("bool"),
            FieldType::Text => f.write_str("text"),
            FieldType::List(inner) => write!(f, "list<{inner}>"),
            FieldType::Record(_) => f.write_str("record"),
            FieldType::Any => f.write_str("any"),
        }
    }
}

impl FieldType {
    /// Strict check: does `value` already have this type?
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::Any, _) => true,
            (FieldType::Int, Value::Number(n)) => n.is_i64(),
            (FieldType::Float, Value::Number(_)) => true,
            (FieldType::Bool, Value::Bool(_)) => true,
            (FieldType::Text, Value::String(_)) => true,
            (FieldType::List(inner), Value::Array(items)) => items.iter().all(|v| inner.accepts(v)),
            (FieldType::Record(members), Value::Object(object)) => members.iter().all(|member| {
                match object.get(&member.name) {
                    Some(v) => member.ty.accepts(v),
                    None => member.default.is_some(),
                }
            }),
            _ => false,
        }
    }

    /// Converts a loosely-typed inbound value (query strings, form posts) into this type.
    pub fn coerce(&self, value: Value) -> std::result::Result<Value, String> {
        match (self, value) {
            (FieldType::Any, v) => Ok(v),

            (FieldType::Int, Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    return Ok(Value::from(i));
                }
                // u64 past i64::MAX lands here too and fails the range check.
                match n.as_f64() {
                    Some(f)
                        if f.is_finite()
                            && f.fract() == 0.0
                            && f >= i64::MIN as f64
                            && f < i64::MAX as f64
                            && !n.is_u64() =>
                    {
                        Ok(Value::from(f as i64))
                    }
                    _ => Err(format!("{n} is not an integer within range")),
                }
            }
            (FieldType::Int, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("'{s}' is not an integer")),

            (FieldType::Float, Value::Number(n)) => n
                .as_f64()
                .map(Value::from)
                .ok_or_else(|| format!("{n} is not a float")),
            (FieldType::Float, Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(Value::from(f)),
                _ => Err(format!("'{s}' is not a float")),
            },

            (FieldType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (FieldType::Bool, Value::String(s)) => parse_bool(&s)
                .map(Value::Bool)
                .ok_or_else(|| format!("'{s}' is not a boolean")),
            (FieldType::Bool, Value::Number(n)) => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(format!("{n} is not a boolean")),
            },

            (FieldType::Text, Value::String(s)) => Ok(Value::String(s)),
            (FieldType::Text, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (FieldType::Text, Value::Bool(b)) => Ok(Value::String(b.to_string())),

            (FieldType::List(_) | FieldType::Record(_), Value::String(s)) => {
                let parsed: Value = serde_json::from_str(&s)
                    .map_err(|err| format!("expected {self} encoded as JSON: {err}"))?;
                self.coerce(parsed)
            }
            (FieldType::List(inner), Value::Array(items)) => items
                .into_iter()
                .enumerate()
                .map(|(idx, item)| inner.coerce(item).map_err(|err| format!("[{idx}]: {err}")))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            (FieldType::Record(members), Value::Object(mut object)) => {
                let mut coerced = serde_json::Map::new();
                for member in members {
                    match object.remove(&member.name) {
                        Some(Value::Null) | None => match &member.default {
                            Some(default) => {
                                coerced.insert(member.name.clone(), default.clone());
                            }
                            None => return Err(format!("missing member '{}'", member.name)),
                        },
                        Some(v) => {
                            let v = member
                                .ty
                                .coerce(v)
                                .map_err(|err| format!("{}: {err}", member.name))?;
                            coerced.insert(member.name.clone(), v);
                        }
                    }
                }
                Ok(Value::Object(coerced))
            }

            (ty, other) => Err(format!("expected {ty}, got {}", json_type_name(&other))),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
