//! Binds loosely-typed request arguments to a method's declared parameters.

use crate::core::{FieldMap, Result, StateError};
use crate::entity::MethodDescriptor;
use serde_json::Value;

/// Arguments after binding: exactly the declared parameters, coerced to their types.
pub type BoundArgs = FieldMap;

/// Matches `raw` against the method's parameters by name.
///
/// Missing or `null` arguments take the parameter default; without one the parameter is
/// required and binding fails. Arguments the method does not declare are ignored.
pub fn bind_arguments(method: &MethodDescriptor, raw: &FieldMap) -> Result<BoundArgs> {
    let mut bound = BoundArgs::new();

    for param in &method.params {
        let value = match raw.get(&param.name) {
            None | Some(Value::Null) => match &param.default {
                Some(default) => default.clone(),
                None => {
                    return Err(StateError::binding(
                        &method.name,
                        format!("missing required parameter '{}'", param.name),
                    ));
                }
            },
            Some(value) => param.ty.coerce(value.clone()).map_err(|err| {
                StateError::binding(&method.name, format!("parameter '{}': {err}", param.name))
            })?,
        };
        bound.insert(param.name.clone(), value);
    }

    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FieldSpec, FieldType};
    use serde_json::json;

    fn method() -> MethodDescriptor {
        MethodDescriptor::new(
            "add_item",
            vec![
                FieldSpec::new("name", FieldType::Text),
                FieldSpec::new("quantity", FieldType::Int).with_default(json!(1)),
                FieldSpec::new("gift", FieldType::Bool).with_default(json!(false)),
                FieldSpec::new("note", FieldType::Text).with_default(Value::Null),
            ],
            |_ctx| Ok(None),
        )
    }

    fn args(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn coerces_and_fills_defaults() {
        let bound = bind_arguments(
            &method(),
            &args(json!({"name": "apple", "quantity": "3", "utm_source": "mail"})),
        )
        .unwrap();

        assert_eq!(
            Value::Object(bound),
            json!({"name": "apple", "quantity": 3, "gift": false, "note": null})
        );
    }

    #[test]
    fn null_takes_default_when_optional() {
        let bound = bind_arguments(&method(), &args(json!({"name": "pear", "quantity": null}))).unwrap();
        assert_eq!(bound.get("quantity"), Some(&json!(1)));
    }

    #[test]
    fn missing_required_or_bad_type_fails() {
        let err = bind_arguments(&method(), &args(json!({"quantity": 2}))).unwrap_err();
        assert!(matches!(err, StateError::ArgumentBinding { ref method, .. } if method == "add_item"));

        let err = bind_arguments(&method(), &args(json!({"name": null}))).unwrap_err();
        assert!(matches!(err, StateError::ArgumentBinding { .. }));

        let err = bind_arguments(&method(), &args(json!({"name": "x", "quantity": "many"}))).unwrap_err();
        assert!(err.to_string().contains("quantity"));
    }
}
