use super::Actor;
use super::binding::BoundArgs;
use super::diff::Fragment;
use crate::core::{CommandError, FieldMap, FieldSpec, StateKey};
use serde_json::Value;

/// What a method handler sees while it runs.
///
/// Field writes land on a working copy owned by the dispatcher. Nothing becomes visible to
/// other commands or subscribers until the handler returns `Ok` and the commit succeeds.
pub struct CommandContext<'a> {
    key: &'a StateKey,
    actor: Option<&'a Actor>,
    args: &'a BoundArgs,
    fields: &'a mut FieldMap,
    schema: &'a [FieldSpec],
    fragments: &'a mut Vec<Fragment>,
    max_fragments: usize,
}

impl<'a> CommandContext<'a> {
    pub(crate) fn new(
        key: &'a StateKey,
        actor: Option<&'a Actor>,
        args: &'a BoundArgs,
        fields: &'a mut FieldMap,
        schema: &'a [FieldSpec],
        fragments: &'a mut Vec<Fragment>,
        max_fragments: usize,
    ) -> Self {
        Self {
            key,
            actor,
            args,
            fields,
            schema,
            fragments,
            max_fragments,
        }
    }

    pub fn key(&self) -> &StateKey {
        self.key
    }

    pub fn actor(&self) -> Option<&Actor> {
        self.actor
    }

    pub fn args(&self) -> &BoundArgs {
        self.args
    }

    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name).filter(|value| !value.is_null())
    }

    pub fn arg_i64(&self, name: &str) -> Result<i64, CommandError> {
        self.arg(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| missing_arg(name, "integer"))
    }

    pub fn arg_f64(&self, name: &str) -> Result<f64, CommandError> {
        self.arg(name)
            .and_then(Value::as_f64)
            .ok_or_else(|| missing_arg(name, "number"))
    }

    pub fn arg_bool(&self, name: &str) -> Result<bool, CommandError> {
        self.arg(name)
            .and_then(Value::as_bool)
            .ok_or_else(|| missing_arg(name, "boolean"))
    }

    pub fn arg_str(&self, name: &str) -> Result<&str, CommandError> {
        self.arg(name)
            .and_then(Value::as_str)
            .ok_or_else(|| missing_arg(name, "string"))
    }

    pub fn fields(&self) -> &FieldMap {
        self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_i64(&self, field: &str) -> Result<i64, CommandError> {
        self.get(field).and_then(Value::as_i64).ok_or_else(|| {
            CommandError::new("invalid_field", format!("field '{field}' is not an integer"))
        })
    }

    /// Writes a declared field. The value must already match the declared type.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<(), CommandError> {
        let value = value.into();
        let spec = self
            .schema
            .iter()
            .find(|spec| spec.name == field)
            .ok_or_else(|| CommandError::new("invalid_field", format!("unknown field '{field}'")))?;

        if !value.is_null() && !spec.ty.accepts(&value) {
            return Err(CommandError::new(
                "invalid_field",
                format!("field '{field}' expects {}", spec.ty),
            ));
        }
        self.fields.insert(field.to_string(), value);
        Ok(())
    }

    /// Attaches a rendered fragment to this command's diff, in emission order.
    pub fn emit(&mut self, fragment: Fragment) -> Result<(), CommandError> {
        if self.fragments.len() >= self.max_fragments {
            return Err(CommandError::new(
                "too_many_fragments",
                format!("a command may emit at most {} fragments", self.max_fragments),
            ));
        }
        self.fragments.push(fragment);
        Ok(())
    }

    pub fn emitted(&self) -> usize {
        self.fragments.len()
    }
}

fn missing_arg(name: &str, expected: &str) -> CommandError {
    CommandError::new("invalid_argument", format!("argument '{name}' is not a bound {expected}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FieldType;
    use serde_json::json;

    #[test]
    fn set_checks_declared_schema() {
        let key = StateKey::global("Counter");
        let schema = vec![
            FieldSpec::new("count", FieldType::Int).with_default(json!(0)),
            FieldSpec::new("ratio", FieldType::Float).with_default(json!(0.0)),
        ];
        let args = BoundArgs::new();
        let mut fields = FieldMap::new();
        let mut fragments = Vec::new();
        let mut ctx = CommandContext::new(&key, None, &args, &mut fields, &schema, &mut fragments, 1);

        ctx.set("count", 4).unwrap();
        ctx.set("ratio", 2).unwrap();
        assert_eq!(ctx.get_i64("count").unwrap(), 4);
        assert_eq!(ctx.set("count", "four").unwrap_err().code, "invalid_field");
        assert!(ctx.set("missing", 1).is_err());

        ctx.emit(Fragment::new("<p>1</p>")).unwrap();
        assert_eq!(
            ctx.emit(Fragment::new("<p>2</p>")).unwrap_err().code,
            "too_many_fragments"
        );
        assert_eq!(ctx.emitted(), 1);
    }
}
