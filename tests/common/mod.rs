#![allow(dead_code)]

use async_trait::async_trait;
use livestate::entity::EntityInstance;
use livestate::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn counter(config: EntityConfig) -> Result<EntityType, StateError> {
    EntityType::builder("Counter")
        .field("count", FieldType::Int, json!(0))
        .field("label", FieldType::Text, json!("clicks"))
        .config(config)
        .method(
            "increment",
            vec![FieldSpec::new("amount", FieldType::Int).with_default(json!(1))],
            |ctx| {
                let next = ctx.get_i64("count")? + ctx.arg_i64("amount")?;
                ctx.set("count", next)?;
                Ok(Some(json!(next)))
            },
        )
        .method(
            "rename",
            vec![FieldSpec::new("label", FieldType::Text)],
            |ctx| {
                let label = ctx.arg_str("label")?.to_string();
                ctx.set("label", label)?;
                Ok(None)
            },
        )
        .method("noop", vec![], |_ctx| Ok(None))
        .build()
}

pub fn cart() -> Result<EntityType, StateError> {
    EntityType::builder("Cart")
        .scope(ScopeKind::Session)
        .field("items", FieldType::List(Box::new(FieldType::Text)), json!([]))
        .method(
            "add",
            vec![FieldSpec::new("item", FieldType::Text)],
            |ctx| {
                let item = ctx.arg_str("item")?.trim().to_string();
                if item.is_empty() {
                    return Err(CommandError::validation("item must not be empty"));
                }
                let mut items = ctx.get("items").cloned().unwrap_or_else(|| json!([]));
                if let Some(list) = items.as_array_mut() {
                    list.push(json!(item));
                }
                ctx.set("items", items)?;
                ctx.emit(
                    Fragment::new(format!("<li>{item}</li>"))
                        .selector("#cart")
                        .mode(MergeMode::Append),
                )?;
                Ok(None)
            },
        )
        .build()
}

pub fn invoice() -> Result<EntityType, StateError> {
    EntityType::builder("Invoice")
        .scope(ScopeKind::Record)
        .field("approved", FieldType::Bool, json!(false))
        .method("approve", vec![], |ctx| {
            if ctx.get("approved") == Some(&json!(true)) {
                return Err(CommandError::new("already_approved", "invoice is already approved"));
            }
            ctx.set("approved", true)?;
            Ok(None)
        })
        .build()
}

/// Emits two fragments per post.
pub fn feed() -> Result<EntityType, StateError> {
    EntityType::builder("Feed")
        .field("posts", FieldType::Int, json!(0))
        .method(
            "post",
            vec![FieldSpec::new("text", FieldType::Text)],
            |ctx| {
                let posts = ctx.get_i64("posts")? + 1;
                let text = ctx.arg_str("text")?.to_string();
                ctx.set("posts", posts)?;
                ctx.emit(
                    Fragment::new(format!("<p>{text}</p>"))
                        .selector("#feed")
                        .mode(MergeMode::Prepend),
                )?;
                ctx.emit(Fragment::new(format!("<span id=\"posts\">{posts}</span>")))?;
                Ok(None)
            },
        )
        .build()
}

pub fn args(value: serde_json::Value) -> FieldMap {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// Backend whose writes always fail. Loads find nothing unless `fail_loads` is set.
#[derive(Default)]
pub struct FailingPersistence {
    pub fail_loads: bool,
    pub saves: AtomicUsize,
}

impl FailingPersistence {
    pub fn failing_loads() -> Self {
        Self {
            fail_loads: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl PersistencePort for FailingPersistence {
    async fn save(
        &self,
        _key: &StateKey,
        _instance: &EntityInstance,
        _ttl: Option<Duration>,
    ) -> Result<String, StateError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Err(StateError::Persistence("disk full".to_string()))
    }

    async fn load(&self, _key: &StateKey) -> Result<Option<EntityInstance>, StateError> {
        if self.fail_loads {
            return Err(StateError::Persistence("connection refused".to_string()));
        }
        Ok(None)
    }

    async fn delete(&self, _key: &StateKey) -> Result<bool, StateError> {
        Ok(false)
    }

    async fn exists(&self, _key: &StateKey) -> Result<bool, StateError> {
        Ok(false)
    }
}

/// Memory-backed store that counts loads and stalls every save and delete.
#[derive(Default)]
pub struct SlowPersistence {
    pub save_delay: Duration,
    pub delete_delay: Duration,
    pub loads: AtomicUsize,
    records: MemoryPersistence,
}

impl SlowPersistence {
    pub fn new(save_delay: Duration) -> Self {
        Self {
            save_delay,
            ..Self::default()
        }
    }

    pub fn with_delete_delay(mut self, delay: Duration) -> Self {
        self.delete_delay = delay;
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistencePort for SlowPersistence {
    async fn save(
        &self,
        key: &StateKey,
        instance: &EntityInstance,
        _ttl: Option<Duration>,
    ) -> Result<String, StateError> {
        tokio::time::sleep(self.save_delay).await;
        self.records.save(key, instance, None).await
    }

    async fn load(&self, key: &StateKey) -> Result<Option<EntityInstance>, StateError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.records.load(key).await
    }

    async fn delete(&self, key: &StateKey) -> Result<bool, StateError> {
        tokio::time::sleep(self.delete_delay).await;
        self.records.delete(key).await
    }

    async fn exists(&self, key: &StateKey) -> Result<bool, StateError> {
        self.records.exists(key).await
    }
}
